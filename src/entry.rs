// Entry-point resolution. After a successful compile the context knows the address of
// every function it generated; get_entry turns the one called `name` into a callable
// with the process-entry signature `int (int argc, char **argv)`. The returned
// EntryPoint borrows the context, so it cannot outlive the code mapping it points
// into. Names that are not compiled functions (data, imports, unknown names, or
// anything from a failed compile) resolve to None.

//! Lookup of compiled functions as callables.

use crate::core::context::Context;
use std::ffi::{c_char, c_int, CString};
use std::marker::PhantomData;

/// Signature of a compiled `main`.
pub type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char) -> c_int;

/// A compiled function callable with the `(argc, argv) -> int` convention.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoint<'ctx> {
    addr: u64,
    _ctx: PhantomData<&'ctx Context>,
}

impl EntryPoint<'_> {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Call the function with a raw argument vector.
    ///
    /// # Safety
    /// The compiled function must really take `(int, char **)`, `argv` must be valid
    /// for what it reads, and the generated code must be memory safe.
    pub unsafe fn call(&self, argc: c_int, argv: *mut *mut c_char) -> c_int {
        let f: MainFn = std::mem::transmute(self.addr as usize);
        f(argc, argv)
    }

    /// Call the function with `args` converted to a NUL-terminated `argv`.
    ///
    /// # Safety
    /// Same contract as [`EntryPoint::call`].
    pub unsafe fn call_with_args(&self, args: &[&str]) -> c_int {
        let owned: Vec<CString> = args
            .iter()
            .map(|a| CString::new(a.replace('\0', "")).unwrap_or_default())
            .collect();
        let mut argv: Vec<*mut c_char> = owned.iter().map(|a| a.as_ptr() as *mut c_char).collect();
        argv.push(std::ptr::null_mut());
        self.call(owned.len() as c_int, argv.as_mut_ptr())
    }
}

/// Find the compiled function `name` in `ctx`.
pub fn get_entry<'ctx>(ctx: &'ctx Context, name: &str) -> Option<EntryPoint<'ctx>> {
    let addr = ctx.function_address(name);
    log::debug!("entry {name}: {addr:#x?}");
    addr.map(|addr| EntryPoint {
        addr,
        _ctx: PhantomData,
    })
}
