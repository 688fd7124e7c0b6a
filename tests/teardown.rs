// Context lifetime accounting. A counting ResourceAllocator tracks the bytes every
// context holds through its allocation handle; once the context is dropped (or
// destroyed explicitly) the count must be back to zero, whatever happened in between:
// a rejected unit, a unit compiled but never run, or units whose entry points were
// called. Independent contexts on separate threads must not interfere. Code
// generation scratch is drawn from the same strategy, and a strategy that runs dry
// reaches the host through the installed error handler, which here unwinds instead of
// aborting so the context can still be dropped cleanly.

//! Resource release on context teardown.

use c2jit::ir::{FuncBuilder, Opcode, Operand, Type};
use c2jit::{
    compile_str, get_entry, CompileOptions, Context, MessageSink, OptFlags, ResourceAllocator, ResourceError,
    SystemAllocator,
};
use std::alloc::Layout;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counting {
    live: AtomicUsize,
    calls: AtomicUsize,
}

impl ResourceAllocator for Counting {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.live.fetch_add(layout.size(), Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        SystemAllocator.allocate(layout)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, old: Layout, new_size: usize) -> Option<NonNull<u8>> {
        let moved = SystemAllocator.reallocate(ptr, old, new_size)?;
        self.live.fetch_add(new_size, Ordering::SeqCst);
        self.live.fetch_sub(old.size(), Ordering::SeqCst);
        Some(moved)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.fetch_sub(layout.size(), Ordering::SeqCst);
        SystemAllocator.free(ptr, layout)
    }
}

const PROGRAM: &str = "struct pair { long a, b; };
static struct pair swap(struct pair p) { struct pair q = { p.b, p.a }; return q; }
int table[64];
int main(void) {
    struct pair p = { 3, 9 };
    for (int i = 0; i < 64; i++) table[i] = i;
    p = swap(p);
    return (int) (p.a - p.b) + table[63];
}
";

fn counting_context() -> (Arc<Counting>, Context) {
    let counting = Arc::new(Counting::default());
    let ctx = Context::new(counting.clone());
    (counting, ctx)
}

fn opts(opt: OptFlags) -> CompileOptions {
    CompileOptions {
        message_sink: MessageSink::capture(),
        opt,
        ..Default::default()
    }
}

#[test]
fn test_failed_compile_releases_everything() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (counting, mut ctx) = counting_context();
    assert!(!compile_str(&mut ctx, &opts(OptFlags::all()), "int main(void) { return x; }", "bad.c"));
    drop(ctx);
    assert_eq!(counting.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unused_module_releases_everything() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (counting, mut ctx) = counting_context();
    assert!(compile_str(&mut ctx, &opts(OptFlags::standard()), PROGRAM, "prog.c"));
    assert!(counting.calls.load(Ordering::SeqCst) > 0);
    assert!(counting.live.load(Ordering::SeqCst) > 0);
    ctx.destroy();
    assert_eq!(counting.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_executed_modules_release_everything() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (counting, mut ctx) = counting_context();
    for opt in [OptFlags::none(), OptFlags::all()] {
        assert!(compile_str(&mut ctx, &opts(opt), PROGRAM, "prog.c"));
        let main = get_entry(&ctx, "main").unwrap();
        assert_eq!(unsafe { main.call(0, std::ptr::null_mut()) }, 6 + 63);
    }
    assert_eq!(ctx.modules().count(), 2);
    drop(ctx);
    assert_eq!(counting.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_contexts_on_separate_threads() {
    let _ = env_logger::builder().is_test(true).try_init();
    let counting = Arc::new(Counting::default());
    let handles: Vec<_> = (0..4)
        .map(|k| {
            let counting = counting.clone();
            std::thread::spawn(move || {
                let mut ctx = Context::new(counting);
                let src = format!("int main(void) {{ int s = 0; for (int i = 0; i < 100; i++) s += {k}; return s; }}");
                let opt = OptFlags::from_bits(k * 0x1111);
                assert!(compile_str(&mut ctx, &opts(opt), &src, "thread.c"));
                let main = get_entry(&ctx, "main").unwrap();
                unsafe { main.call(0, std::ptr::null_mut()) }
            })
        })
        .collect();
    let results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, vec![0, 100, 200, 300]);
    assert_eq!(counting.live.load(Ordering::SeqCst), 0);
}

/// Grants a fixed number of fresh allocations, then refuses. Growing existing blocks
/// always succeeds, so every failure is an out-of-memory on a new block.
struct Budget {
    live: AtomicUsize,
    grants: AtomicUsize,
}

impl Budget {
    fn new(grants: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            grants: AtomicUsize::new(grants),
        }
    }
}

impl ResourceAllocator for Budget {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.grants
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        self.live.fetch_add(layout.size(), Ordering::SeqCst);
        SystemAllocator.allocate(layout)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, old: Layout, new_size: usize) -> Option<NonNull<u8>> {
        let moved = SystemAllocator.reallocate(ptr, old, new_size)?;
        self.live.fetch_add(new_size, Ordering::SeqCst);
        self.live.fetch_sub(old.size(), Ordering::SeqCst);
        Some(moved)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.fetch_sub(layout.size(), Ordering::SeqCst);
        SystemAllocator.free(ptr, layout)
    }
}

fn unwind_on_resource_error(err: &ResourceError) -> ! {
    panic::panic_any(err.clone())
}

/// Compile PROGRAM on a context limited to `grants` allocations. Returns whether it
/// compiled, or the resource error the handler was called with.
fn compile_with_budget(grants: usize) -> Result<bool, ResourceError> {
    let budget = Arc::new(Budget::new(grants));
    let mut ctx = Context::new(budget.clone());
    ctx.set_error_handler(unwind_on_resource_error);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        compile_str(&mut ctx, &opts(OptFlags::all()), PROGRAM, "prog.c")
    }));
    drop(ctx);
    assert_eq!(budget.live.load(Ordering::SeqCst), 0, "leak with {grants} allocations granted");
    outcome.map_err(|payload| match payload.downcast::<ResourceError>() {
        Ok(err) => *err,
        Err(other) => panic::resume_unwind(other),
    })
}

#[test]
fn test_error_handler_sees_out_of_memory() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (counting, mut ctx) = counting_context();
    assert!(compile_str(&mut ctx, &opts(OptFlags::all()), PROGRAM, "prog.c"));
    drop(ctx);
    let needed = counting.calls.load(Ordering::SeqCst);
    assert_eq!(compile_with_budget(needed), Ok(true));

    // Run out at the very start, half way through and on the last allocation.
    for grants in [0, needed / 2, needed - 1] {
        match compile_with_budget(grants) {
            Err(ResourceError::OutOfMemory { size, align }) => {
                assert!(size > 0 && align.is_power_of_two(), "{size} bytes, align {align}");
            }
            other => panic!("{grants} of {needed} allocations granted: {other:?}"),
        }
    }
}

#[test]
fn test_code_generation_allocates_through_the_context() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (counting, mut ctx) = counting_context();
    let mut m = ctx.new_module("scratch");
    let mut b = FuncBuilder::new(&mut m, "poly", vec![Type::I64], &[("x", Type::I64)], false);
    let x = b.arg(0);
    let terms: Vec<_> = (0..16).map(|i| b.var(&format!("t{i}"), Type::I64)).collect();
    b.emit(Opcode::Mov, [terms[0].into(), x.into()]);
    for pair in terms.windows(2) {
        b.emit(Opcode::Mul, [pair[1].into(), pair[0].into(), Operand::Int(3)]);
    }
    b.emit(Opcode::Ret, [terms[15].into()]);
    b.finish();

    let before = counting.calls.load(Ordering::SeqCst);
    ctx.generate(m, &OptFlags::all()).unwrap();
    let during = counting.calls.load(Ordering::SeqCst) - before;
    // Analysis tables, frame layout, cache counts, link tables and the symbol table.
    assert!(during >= 10, "only {during} allocations went through the context");

    let poly = get_entry(&ctx, "poly").unwrap();
    // SAFETY: poly takes and returns one 64-bit integer.
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(poly.addr() as usize) };
    assert_eq!(f(1), 3i64.pow(15));
    drop(ctx);
    assert_eq!(counting.live.load(Ordering::SeqCst), 0);
}
