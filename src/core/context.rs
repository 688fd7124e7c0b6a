// The compilation context owns everything one host session compiles: the allocation
// handle (with its non-returning error hook), every module compiled into it together
// with its native code and data, the symbols the host registers for imports, the
// interned alias names used in memory operands, an opaque user-data slot and the
// accumulated compilation statistics. Modules are appended only after code generation
// succeeded, so a failed compile never makes new entry points resolvable and earlier
// modules stay valid. Imports resolve against host symbols first, then the symbols of
// earlier modules (latest first), and finally the dynamic linker. Dropping the context
// releases all of it; `destroy` is the explicit spelling. A context may be moved to
// another thread but is never shared between threads.

//! Per-session compilation state.

use super::alloc::{AllocStr, ContextAlloc, ErrorHandler, ResourceAllocator};
use super::error::CompileResult;
use super::options::{OptFlags, TargetCaps};
use super::session::SessionStats;
use crate::codegen::{self, GeneratedModule};
use crate::ir::{AliasId, IrVec, Module};
use hashbrown::DefaultHashBuilder;
use std::any::Any;
use std::cell::Cell;
use std::ffi::CString;
use std::marker::PhantomData;
use std::sync::Arc;

type NameMap<V> = hashbrown::HashMap<AllocStr, V, DefaultHashBuilder, ContextAlloc>;

/// Handle of a module inside its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// A module and the code generated for it.
#[derive(Debug)]
pub struct CompiledModule {
    pub ir: Module,
    pub code: GeneratedModule,
}

/// Owner of all modules, code and symbols of one compilation session.
pub struct Context {
    alloc: ContextAlloc,
    modules: IrVec<CompiledModule>,
    host_symbols: NameMap<u64>,
    aliases: NameMap<AliasId>,
    user_data: Option<Box<dyn Any + Send>>,
    stats: SessionStats,
    caps: TargetCaps,
    _not_sync: PhantomData<Cell<()>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("modules", &self.modules.len())
            .field("host_symbols", &self.host_symbols.len())
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::with_alloc(ContextAlloc::system())
    }
}

impl Context {
    /// Create a context drawing all memory from `allocator`.
    pub fn new(allocator: Arc<dyn ResourceAllocator>) -> Self {
        Self::with_alloc(ContextAlloc::new(allocator))
    }

    fn with_alloc(alloc: ContextAlloc) -> Self {
        Self {
            host_symbols: NameMap::with_hasher_in(DefaultHashBuilder::default(), alloc.clone()),
            aliases: NameMap::with_hasher_in(DefaultHashBuilder::default(), alloc.clone()),
            modules: IrVec::new_in(alloc.clone()),
            alloc,
            user_data: None,
            stats: SessionStats::default(),
            caps: TargetCaps::detect(),
            _not_sync: PhantomData,
        }
    }

    /// Release every module, code buffer and table. Equivalent to dropping.
    pub fn destroy(self) {
        log::debug!("destroying context with {} modules", self.modules.len());
    }

    pub fn alloc(&self) -> &ContextAlloc {
        &self.alloc
    }

    /// Install the handler for unrecoverable allocation failures.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.alloc.set_error_handler(handler);
    }

    /// Override the detected target capabilities.
    pub fn set_target_caps(&mut self, caps: TargetCaps) {
        self.caps = caps;
    }

    pub fn target_caps(&self) -> TargetCaps {
        self.caps
    }

    /// Make `addr` the resolution of imports named `name`.
    pub fn register_symbol(&mut self, name: &str, addr: *const ()) {
        self.host_symbols.insert(AllocStr::new(&self.alloc, name), addr as u64);
    }

    /// Intern an alias-set name. The empty name maps to 0, "no alias".
    pub fn alias(&mut self, name: &str) -> AliasId {
        if name.is_empty() {
            return 0;
        }
        if let Some(&id) = self.aliases.get(name) {
            return id;
        }
        let next = self.aliases.len() as AliasId + 1;
        self.aliases.insert(AllocStr::new(&self.alloc, name), next);
        next
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any + Send>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&(dyn Any + Send)> {
        self.user_data.as_deref()
    }

    pub fn take_user_data(&mut self) -> Option<Box<dyn Any + Send>> {
        self.user_data.take()
    }

    /// Statistics accumulated over every module compiled so far.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn modules(&self) -> impl Iterator<Item = &CompiledModule> {
        self.modules.iter()
    }

    pub fn module(&self, id: ModuleId) -> Option<&CompiledModule> {
        self.modules.get(id.0 as usize)
    }

    /// Empty module allocated in this context.
    pub fn new_module(&self, name: &str) -> Module {
        Module::new(name, &self.alloc)
    }

    /// Address an import called `name` links to.
    pub fn resolve_import(&self, name: &str) -> Option<u64> {
        if let Some(addr) = self.host_symbols.get(name) {
            return Some(*addr);
        }
        if let Some(addr) = self.modules.iter().rev().find_map(|m| m.code.symbol(name)) {
            return Some(addr);
        }
        dynamic_symbol(name)
    }

    /// Generate code for a caller-built module and add it to the context.
    pub fn generate(&mut self, module: Module, flags: &OptFlags) -> CompileResult<ModuleId> {
        let opts = flags.resolve(self.caps);
        let resolve = |name: &str| self.resolve_import(name);
        let (code, stats) = codegen::generate(&module, &opts, &self.alloc, &resolve)?;
        log::debug!(
            "module {} placed: {} code bytes, {} data bytes",
            module.name,
            code.code_size(),
            code.data_size()
        );
        self.stats.merge(&stats);
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(CompiledModule { ir: module, code });
        Ok(id)
    }

    /// Address of the most recently compiled function called `name`.
    pub fn function_address(&self, name: &str) -> Option<u64> {
        self.modules.iter().rev().find_map(|m| m.code.function(name))
    }
}

/// Look `name` up among the symbols already loaded into the process.
fn dynamic_symbol(name: &str) -> Option<u64> {
    let cname = CString::new(name).ok()?;
    // SAFETY: `cname` is NUL-terminated and RTLD_DEFAULT searches the global scope.
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
    (!ptr.is_null()).then_some(ptr as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::StatEvent;
    use crate::ir::{FuncBuilder, ItemKind, Opcode, Operand, Type};

    extern "C" fn host_triple(x: i64) -> i64 {
        x * 3
    }

    #[test]
    fn test_alias_interning() {
        let mut ctx = Context::default();
        assert_eq!(ctx.alias(""), 0);
        let a = ctx.alias("int");
        let b = ctx.alias("double");
        assert_ne!(a, b);
        assert_eq!(ctx.alias("int"), a);
        assert!(a > 0 && b > 0);
    }

    #[test]
    fn test_import_resolution_order() {
        let mut ctx = Context::default();
        assert!(ctx.resolve_import("strlen").is_some());
        ctx.register_symbol("strlen", host_triple as *const ());
        assert_eq!(ctx.resolve_import("strlen"), Some(host_triple as usize as u64));
        assert!(ctx.resolve_import("c2jit_no_such_symbol").is_none());
    }

    #[test]
    fn test_user_data_slot() {
        let mut ctx = Context::default();
        assert!(ctx.user_data().is_none());
        ctx.set_user_data(Box::new(7u32));
        assert_eq!(ctx.user_data().and_then(|d| d.downcast_ref::<u32>()), Some(&7));
        assert!(ctx.take_user_data().is_some());
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn test_target_caps_gate_fmadd() {
        let mut ctx = Context::default();
        ctx.set_target_caps(TargetCaps { x86_64: true, fma: false });
        assert!(!ctx.target_caps().fma);

        let mut m = ctx.new_module("fma");
        let mut b = FuncBuilder::new(&mut m, "madd", vec![Type::D], &[("a", Type::D), ("b", Type::D), ("c", Type::D)], false);
        let (x, y, z) = (b.arg(0), b.arg(1), b.arg(2));
        let t = b.var("t", Type::D);
        let r = b.var("r", Type::D);
        b.emit(Opcode::DMul, [t.into(), x.into(), y.into()]);
        b.emit(Opcode::DAdd, [r.into(), z.into(), t.into()]);
        b.emit(Opcode::Ret, [r.into()]);
        b.finish();
        ctx.generate(m, &OptFlags::all()).unwrap();

        assert_eq!(ctx.stats().count(StatEvent::FusedMultiplyAdd), 0);
        let addr = ctx.function_address("madd").unwrap();
        let f: extern "C" fn(f64, f64, f64) -> f64 = unsafe { std::mem::transmute(addr as usize) };
        assert_eq!(f(3.0, 4.0, 0.5), 12.5);
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn test_later_modules_import_earlier_functions() {
        let mut ctx = Context::default();
        let mut m = ctx.new_module("first");
        let mut b = FuncBuilder::new(&mut m, "seven", vec![Type::I64], &[], false);
        b.emit(Opcode::Ret, [Operand::Int(7)]);
        b.finish();
        ctx.generate(m, &OptFlags::standard()).unwrap();

        let mut m = ctx.new_module("second");
        let proto = m.add_proto("p", vec![Type::I64], vec![], false);
        let seven = m.add_item("seven", ItemKind::Import);
        let mut b = FuncBuilder::new(&mut m, "eight", vec![Type::I64], &[], false);
        let r = b.var("r", Type::I64);
        b.emit(Opcode::Call, [proto.into(), seven.into(), r.into()]);
        b.emit(Opcode::Add, [r.into(), r.into(), Operand::Int(1)]);
        b.emit(Opcode::Ret, [r.into()]);
        b.finish();
        ctx.generate(m, &OptFlags::none()).unwrap();

        let addr = ctx.function_address("eight").unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr as usize) };
        assert_eq!(f(), 8);
        assert_eq!(ctx.stats().functions, 2);
        assert!(ctx.function_address("nine").is_none());
    }
}
