//! Executable memory for finished machine code.
//!
//! Code is copied into a private anonymous mapping while it is writable, then the
//! mapping is flipped to read+execute. The mapping lives until the buffer is dropped.

use crate::core::error::{CompileError, CompileResult};
use std::ptr::NonNull;

/// Page-aligned read+execute mapping holding one module's code.
pub struct ExecBuffer {
    base: NonNull<u8>,
    len: usize,
    mapped: usize,
}

impl std::fmt::Debug for ExecBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecBuffer")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("mapped", &self.mapped)
            .finish()
    }
}

// SAFETY: the mapping is owned exclusively by the buffer and never written after
// construction, so moving it between threads is sound.
unsafe impl Send for ExecBuffer {}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn last_os_error(what: &str) -> CompileError {
    CompileError::ExecMemory {
        reason: format!("{what}: {}", std::io::Error::last_os_error()),
    }
}

impl ExecBuffer {
    /// Map `code` as executable memory.
    pub fn new(code: &[u8]) -> CompileResult<Self> {
        let page = page_size();
        let mapped = code.len().max(1).div_ceil(page) * page;

        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(last_os_error("mmap"));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| CompileError::ExecMemory {
            reason: "mmap returned null".into(),
        })?;
        let buffer = Self {
            base,
            len: code.len(),
            mapped,
        };

        // SAFETY: the mapping is writable and at least `code.len()` bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), base.as_ptr(), code.len());
        }
        // SAFETY: `base`/`mapped` describe exactly the mapping created above.
        let rc = unsafe { libc::mprotect(ptr, mapped, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(last_os_error("mprotect"));
        }
        log::debug!("mapped {} bytes of code at {:#x}", code.len(), buffer.addr());
        Ok(buffer)
    }

    /// Address of the first code byte.
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.addr() + self.len
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in `new`; nothing refers to it afterwards
        // because entry points borrow the owning context.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped);
        }
    }
}
