// Code generation from IR built by hand, the way an embedding front-end would drive the
// context: loops carried by phis (including a swap cycle that needs parallel copies),
// stores through pointers that may point at the same memory, calls into host functions
// registered on the context, functions returning two values in any mix of integer and
// float registers, overflow-checked arithmetic feeding the overflow branches at the
// 64-bit edges, and division by constants, where the multiply-high sequences must
// agree with hardware division for every dividend.

//! Hand-built IR through the whole backend.

use c2jit::ir::{FuncBuilder, MemOp, Opcode, Operand, Type};
use c2jit::{get_entry, Context, OptFlags};
use proptest::prelude::*;

fn toggle_sets() -> Vec<OptFlags> {
    let mut sets = vec![OptFlags::none(), OptFlags::standard(), OptFlags::all()];
    sets.extend((0..OptFlags::COUNT).map(|bit| OptFlags::from_bits(1 << bit)));
    sets
}

fn address(ctx: &Context, name: &str) -> usize {
    get_entry(ctx, name).expect("function compiled").addr() as usize
}

/// `sum(n)` = 1 + 2 + ... + n as a phi loop, and `fibs(n)` swapping two phis.
fn build_phi_module(ctx: &Context) -> c2jit::ir::Module {
    let mut m = ctx.new_module("phis");

    let mut b = FuncBuilder::new(&mut m, "sum", vec![Type::I64], &[("n", Type::I64)], false);
    let n = b.arg(0);
    let (s, i, s2, i2) = (b.var("s", Type::I64), b.var("i", Type::I64), b.var("s2", Type::I64), b.var("i2", Type::I64));
    let (entry, head, body, done) = (b.new_label(), b.new_label(), b.new_label(), b.new_label());
    b.label(entry);
    b.emit(Opcode::Jmp, [head.into()]);
    b.label(head);
    b.emit(Opcode::Phi, [s.into(), entry.into(), Operand::Int(0), body.into(), s2.into()]);
    b.emit(Opcode::Phi, [i.into(), entry.into(), Operand::Int(1), body.into(), i2.into()]);
    b.emit(Opcode::BGt, [done.into(), i.into(), n.into()]);
    b.label(body);
    b.emit(Opcode::Add, [s2.into(), s.into(), i.into()]);
    b.emit(Opcode::Add, [i2.into(), i.into(), Operand::Int(1)]);
    b.emit(Opcode::Jmp, [head.into()]);
    b.label(done);
    b.emit(Opcode::Ret, [s.into()]);
    b.finish();

    // a, b = b, a + b without a temporary: the two phis read each other.
    let mut b = FuncBuilder::new(&mut m, "fibs", vec![Type::I64], &[("n", Type::I64)], false);
    let n = b.arg(0);
    let (x, y, k, sum, k2) = (
        b.var("x", Type::I64),
        b.var("y", Type::I64),
        b.var("k", Type::I64),
        b.var("sum", Type::I64),
        b.var("k2", Type::I64),
    );
    let (entry, head, body, done) = (b.new_label(), b.new_label(), b.new_label(), b.new_label());
    b.label(entry);
    b.emit(Opcode::Jmp, [head.into()]);
    b.label(head);
    b.emit(Opcode::Phi, [x.into(), entry.into(), Operand::Int(0), body.into(), y.into()]);
    b.emit(Opcode::Phi, [y.into(), entry.into(), Operand::Int(1), body.into(), sum.into()]);
    b.emit(Opcode::Phi, [k.into(), entry.into(), Operand::Int(0), body.into(), k2.into()]);
    b.emit(Opcode::BGe, [done.into(), k.into(), n.into()]);
    b.label(body);
    b.emit(Opcode::Add, [sum.into(), x.into(), y.into()]);
    b.emit(Opcode::Add, [k2.into(), k.into(), Operand::Int(1)]);
    b.emit(Opcode::Jmp, [head.into()]);
    b.label(done);
    b.emit(Opcode::Ret, [x.into()]);
    b.finish();
    m
}

#[test]
fn test_phi_loops() {
    let _ = env_logger::builder().is_test(true).try_init();
    for opt in toggle_sets() {
        let mut ctx = Context::default();
        let m = build_phi_module(&ctx);
        ctx.generate(m, &opt).unwrap();
        // SAFETY: both functions take and return one 64-bit integer.
        let sum: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(address(&ctx, "sum")) };
        let fibs: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(address(&ctx, "fibs")) };
        assert_eq!(sum(0), 0, "{:?}", opt.enabled_names());
        assert_eq!(sum(100), 5050, "{:?}", opt.enabled_names());
        assert_eq!(fibs(10), 55, "{:?}", opt.enabled_names());
        assert_eq!(fibs(50), 12_586_269_025, "{:?}", opt.enabled_names());
    }
}

#[test]
fn test_phi_from_unlabeled_entry_is_rejected() {
    let mut ctx = Context::default();
    let mut m = ctx.new_module("bad");
    let mut b = FuncBuilder::new(&mut m, "f", vec![Type::I64], &[("x", Type::I64)], false);
    let x = b.arg(0);
    let p = b.var("p", Type::I64);
    let join = b.new_label();
    b.emit(Opcode::Jmp, [join.into()]);
    b.label(join);
    b.emit(Opcode::Phi, [p.into(), join.into(), x.into()]);
    b.emit(Opcode::Ret, [p.into()]);
    b.finish();
    let err = ctx.generate(m, &OptFlags::none()).unwrap_err();
    assert!(err.is_internal());
    assert!(get_entry(&ctx, "f").is_none());
}

#[test]
fn test_stores_through_aliasing_pointers() {
    let _ = env_logger::builder().is_test(true).try_init();
    for opt in toggle_sets() {
        let mut ctx = Context::default();
        let mut m = ctx.new_module("alias");
        let mut b = FuncBuilder::new(&mut m, "clobber", vec![Type::I64], &[("p", Type::P), ("q", Type::P)], false);
        let (p, q) = (b.arg(0), b.arg(1));
        let (r, t) = (b.var("r", Type::I64), b.var("t", Type::I64));
        let at_p = Operand::Mem(MemOp::based(Type::I64, p, 8));
        let at_q = Operand::Mem(MemOp::based(Type::I64, q, 8));
        let byte_q = Operand::Mem(MemOp::based(Type::U8, q, 8));
        b.emit(Opcode::Mov, [at_p, Operand::Int(1000)]);
        b.emit(Opcode::Mov, [at_q, Operand::Int(2)]);
        b.emit(Opcode::Mov, [r.into(), at_p]);
        b.emit(Opcode::Mov, [byte_q, Operand::Int(7)]);
        b.emit(Opcode::Mov, [t.into(), at_p]);
        b.emit(Opcode::Mul, [r.into(), r.into(), Operand::Int(100)]);
        b.emit(Opcode::Add, [r.into(), r.into(), t.into()]);
        b.emit(Opcode::Ret, [r.into()]);
        b.finish();
        ctx.generate(m, &opt).unwrap();

        // SAFETY: clobber(int64_t *p, int64_t *q) only touches p[1] and q[1].
        let f: extern "C" fn(*mut i64, *mut i64) -> i64 = unsafe { std::mem::transmute(address(&ctx, "clobber")) };
        let mut same = [0i64; 2];
        let ptr = same.as_mut_ptr();
        assert_eq!(f(ptr, ptr), 207, "{:?}", opt.enabled_names());
        assert_eq!(same[1], 7);

        let (mut a, mut c) = ([0i64; 2], [0i64; 2]);
        assert_eq!(f(a.as_mut_ptr(), c.as_mut_ptr()), 101_000, "{:?}", opt.enabled_names());
        assert_eq!((a[1], c[1]), (1000, 7));
    }
}

extern "C" fn host_weight(x: i64, y: f64) -> f64 {
    x as f64 * y
}

#[test]
fn test_call_registered_host_symbol() {
    let _ = env_logger::builder().is_test(true).try_init();
    for opt in [OptFlags::none(), OptFlags::all()] {
        let mut ctx = Context::default();
        ctx.register_symbol("host_weight", host_weight as *const ());
        let mut m = ctx.new_module("host");
        let proto = m.add_proto("weight_proto", vec![Type::D], vec![Type::I64, Type::D], false);
        let callee = m.add_import("host_weight");
        let mut b = FuncBuilder::new(&mut m, "scaled", vec![Type::D], &[("x", Type::I64)], false);
        let x = b.arg(0);
        let r = b.var("r", Type::D);
        b.emit(
            Opcode::Call,
            [Operand::Ref(proto), Operand::Ref(callee), r.into(), x.into(), Operand::Double(0.25)],
        );
        b.emit(Opcode::DAdd, [r.into(), r.into(), Operand::Double(1.0)]);
        b.emit(Opcode::Ret, [r.into()]);
        b.finish();
        ctx.generate(m, &opt).unwrap();

        // SAFETY: scaled(int64_t) returns a double.
        let f: extern "C" fn(i64) -> f64 = unsafe { std::mem::transmute(address(&ctx, "scaled")) };
        assert_eq!(f(12), 4.0);
        assert_eq!(ctx.resolve_import("host_weight"), Some(host_weight as usize as u64));
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Ints(i64, i64);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Floats(f64, f64);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct IntFloat(i64, f64);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct FloatInt(f64, i64);

/// Two-result functions plus callers that consume both results through an IR call.
fn build_pair_module(ctx: &Context) -> c2jit::ir::Module {
    let mut m = ctx.new_module("pairs");

    let mut b = FuncBuilder::new(&mut m, "divmod", vec![Type::I64, Type::I64], &[("a", Type::I64), ("b", Type::I64)], false);
    let (a, d) = (b.arg(0), b.arg(1));
    let (q, r) = (b.var("q", Type::I64), b.var("r", Type::I64));
    b.emit(Opcode::Div, [q.into(), a.into(), d.into()]);
    b.emit(Opcode::Mod, [r.into(), a.into(), d.into()]);
    b.emit(Opcode::Ret, [q.into(), r.into()]);
    let divmod = b.finish();

    let mut b = FuncBuilder::new(&mut m, "sumdiff", vec![Type::D, Type::D], &[("x", Type::D), ("y", Type::D)], false);
    let (x, y) = (b.arg(0), b.arg(1));
    let (s, t) = (b.var("s", Type::D), b.var("t", Type::D));
    b.emit(Opcode::DAdd, [s.into(), x.into(), y.into()]);
    b.emit(Opcode::DSub, [t.into(), x.into(), y.into()]);
    b.emit(Opcode::Ret, [s.into(), t.into()]);
    let sumdiff = b.finish();

    let mut b = FuncBuilder::new(&mut m, "scale", vec![Type::I64, Type::D], &[("n", Type::I64), ("x", Type::D)], false);
    let (n, x) = (b.arg(0), b.arg(1));
    let (k, h) = (b.var("k", Type::I64), b.var("h", Type::D));
    b.emit(Opcode::Mul, [k.into(), n.into(), Operand::Int(3)]);
    b.emit(Opcode::DMul, [h.into(), x.into(), Operand::Double(0.5)]);
    b.emit(Opcode::Ret, [k.into(), h.into()]);
    let scale = b.finish();

    let mut b = FuncBuilder::new(&mut m, "flip", vec![Type::D, Type::I64], &[("n", Type::I64), ("x", Type::D)], false);
    let (n, x) = (b.arg(0), b.arg(1));
    let k = b.var("k", Type::I64);
    b.emit(Opcode::Neg, [k.into(), n.into()]);
    b.emit(Opcode::Ret, [x.into(), k.into()]);
    b.finish();

    let divmod_proto = m.add_proto("divmod_proto", vec![Type::I64, Type::I64], vec![Type::I64, Type::I64], false);
    let mut b = FuncBuilder::new(&mut m, "use_divmod", vec![Type::I64], &[("a", Type::I64), ("b", Type::I64)], false);
    let (a, d) = (b.arg(0), b.arg(1));
    let (q, r, out) = (b.var("q", Type::I64), b.var("r", Type::I64), b.var("out", Type::I64));
    b.emit(Opcode::Call, [Operand::Ref(divmod_proto), Operand::Ref(divmod), q.into(), r.into(), a.into(), d.into()]);
    b.emit(Opcode::Mul, [out.into(), q.into(), Operand::Int(1000)]);
    b.emit(Opcode::Add, [out.into(), out.into(), r.into()]);
    b.emit(Opcode::Ret, [out.into()]);
    b.finish();

    let sumdiff_proto = m.add_proto("sumdiff_proto", vec![Type::D, Type::D], vec![Type::D, Type::D], false);
    let mut b = FuncBuilder::new(&mut m, "use_sumdiff", vec![Type::D], &[("x", Type::D), ("y", Type::D)], false);
    let (x, y) = (b.arg(0), b.arg(1));
    let (s, t, out) = (b.var("s", Type::D), b.var("t", Type::D), b.var("out", Type::D));
    b.emit(Opcode::Call, [Operand::Ref(sumdiff_proto), Operand::Ref(sumdiff), s.into(), t.into(), x.into(), y.into()]);
    b.emit(Opcode::DMul, [out.into(), s.into(), t.into()]);
    b.emit(Opcode::Ret, [out.into()]);
    b.finish();

    let scale_proto = m.add_proto("scale_proto", vec![Type::I64, Type::D], vec![Type::I64, Type::D], false);
    let mut b = FuncBuilder::new(&mut m, "use_scale", vec![Type::D], &[("n", Type::I64), ("x", Type::D)], false);
    let (n, x) = (b.arg(0), b.arg(1));
    let (k, h, kd, out) = (b.var("k", Type::I64), b.var("h", Type::D), b.var("kd", Type::D), b.var("out", Type::D));
    b.emit(Opcode::Call, [Operand::Ref(scale_proto), Operand::Ref(scale), k.into(), h.into(), n.into(), x.into()]);
    b.emit(Opcode::I2D, [kd.into(), k.into()]);
    b.emit(Opcode::DAdd, [out.into(), kd.into(), h.into()]);
    b.emit(Opcode::Ret, [out.into()]);
    b.finish();
    m
}

#[test]
fn test_two_result_returns() {
    let _ = env_logger::builder().is_test(true).try_init();
    for opt in toggle_sets() {
        let mut ctx = Context::default();
        let m = build_pair_module(&ctx);
        ctx.generate(m, &opt).unwrap();
        let names = opt.enabled_names();

        // SAFETY: each signature matches the IR prototype; two-member repr(C) structs
        // come back in the same registers as the two IR results.
        let divmod: extern "C" fn(i64, i64) -> Ints = unsafe { std::mem::transmute(address(&ctx, "divmod")) };
        let sumdiff: extern "C" fn(f64, f64) -> Floats = unsafe { std::mem::transmute(address(&ctx, "sumdiff")) };
        let scale: extern "C" fn(i64, f64) -> IntFloat = unsafe { std::mem::transmute(address(&ctx, "scale")) };
        let flip: extern "C" fn(i64, f64) -> FloatInt = unsafe { std::mem::transmute(address(&ctx, "flip")) };
        assert_eq!(divmod(47, 5), Ints(9, 2), "{names:?}");
        assert_eq!(divmod(-47, 5), Ints(-9, -2), "{names:?}");
        assert_eq!(divmod(i64::MAX, 1 << 32), Ints(i64::MAX >> 32, (1 << 32) - 1), "{names:?}");
        assert_eq!(sumdiff(7.5, 2.25), Floats(9.75, 5.25), "{names:?}");
        assert_eq!(scale(-14, 3.0), IntFloat(-42, 1.5), "{names:?}");
        assert_eq!(flip(9, -0.125), FloatInt(-0.125, -9), "{names:?}");

        let use_divmod: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(address(&ctx, "use_divmod")) };
        let use_sumdiff: extern "C" fn(f64, f64) -> f64 = unsafe { std::mem::transmute(address(&ctx, "use_sumdiff")) };
        let use_scale: extern "C" fn(i64, f64) -> f64 = unsafe { std::mem::transmute(address(&ctx, "use_scale")) };
        assert_eq!(use_divmod(47, 5), 9002, "{names:?}");
        assert_eq!(use_divmod(12_345, 1000), 12_345, "{names:?}");
        assert_eq!(use_sumdiff(5.0, 3.0), 16.0, "{names:?}");
        assert_eq!(use_scale(4, 5.0), 14.5, "{names:?}");
    }
}

/// Which way the overflow branch after an operation should go for `(a, b)`.
#[derive(Debug, Clone, Copy)]
struct OverflowCase {
    code: Opcode,
    branch: Opcode,
    name: &'static str,
    taken: fn(i64, i64) -> bool,
}

const OVERFLOW_CASES: &[OverflowCase] = &[
    OverflowCase { code: Opcode::AddO, branch: Opcode::Bo, name: "add_bo", taken: |a, b| a.overflowing_add(b).1 },
    OverflowCase { code: Opcode::AddO, branch: Opcode::Bno, name: "add_bno", taken: |a, b| !a.overflowing_add(b).1 },
    OverflowCase {
        code: Opcode::AddO,
        branch: Opcode::UBo,
        name: "add_ubo",
        taken: |a, b| (a as u64).overflowing_add(b as u64).1,
    },
    OverflowCase {
        code: Opcode::AddO,
        branch: Opcode::UBno,
        name: "add_ubno",
        taken: |a, b| !(a as u64).overflowing_add(b as u64).1,
    },
    OverflowCase { code: Opcode::SubO, branch: Opcode::Bo, name: "sub_bo", taken: |a, b| a.overflowing_sub(b).1 },
    OverflowCase { code: Opcode::SubO, branch: Opcode::Bno, name: "sub_bno", taken: |a, b| !a.overflowing_sub(b).1 },
    OverflowCase {
        code: Opcode::SubO,
        branch: Opcode::UBo,
        name: "sub_ubo",
        taken: |a, b| (a as u64).overflowing_sub(b as u64).1,
    },
    OverflowCase {
        code: Opcode::SubO,
        branch: Opcode::UBno,
        name: "sub_ubno",
        taken: |a, b| !(a as u64).overflowing_sub(b as u64).1,
    },
    OverflowCase { code: Opcode::MulO, branch: Opcode::Bo, name: "mul_bo", taken: |a, b| a.overflowing_mul(b).1 },
    OverflowCase { code: Opcode::MulO, branch: Opcode::Bno, name: "mul_bno", taken: |a, b| !a.overflowing_mul(b).1 },
    OverflowCase {
        code: Opcode::UMulO,
        branch: Opcode::UBo,
        name: "umul_ubo",
        taken: |a, b| (a as u64).overflowing_mul(b as u64).1,
    },
    OverflowCase {
        code: Opcode::UMulO,
        branch: Opcode::UBno,
        name: "umul_ubno",
        taken: |a, b| !(a as u64).overflowing_mul(b as u64).1,
    },
];

fn wrapped(code: Opcode, a: i64, b: i64) -> i64 {
    match code {
        Opcode::AddO => a.wrapping_add(b),
        Opcode::SubO => a.wrapping_sub(b),
        _ => a.wrapping_mul(b),
    }
}

/// `name(a, b)` returns (1 if the branch was taken else 0, the wrapped result).
fn overflow_context(opt: OptFlags) -> Context {
    let mut ctx = Context::default();
    let mut m = ctx.new_module("overflow");
    for case in OVERFLOW_CASES {
        let mut b = FuncBuilder::new(&mut m, case.name, vec![Type::I64, Type::I64], &[("a", Type::I64), ("b", Type::I64)], false);
        let (x, y) = (b.arg(0), b.arg(1));
        let r = b.var("r", Type::I64);
        let taken = b.new_label();
        b.emit(case.code, [r.into(), x.into(), y.into()]);
        b.emit(case.branch, [taken.into()]);
        b.emit(Opcode::Ret, [Operand::Int(0), r.into()]);
        b.label(taken);
        b.emit(Opcode::Ret, [Operand::Int(1), r.into()]);
        b.finish();
    }
    ctx.generate(m, &opt).unwrap();
    ctx
}

#[test]
fn test_overflow_branches_at_edges() {
    let _ = env_logger::builder().is_test(true).try_init();
    let edges = [
        0,
        1,
        -1,
        2,
        -2,
        i64::MAX,
        i64::MIN,
        i64::MAX - 1,
        i64::MIN + 1,
        u64::MAX as i64,
        1 << 32,
        -(1 << 32),
        3_037_000_499,
        3_037_000_500,
    ];
    for opt in [OptFlags::none(), OptFlags::standard(), OptFlags::all()] {
        let ctx = overflow_context(opt);
        for case in OVERFLOW_CASES {
            // SAFETY: every overflow function takes two integers and returns two.
            let f: extern "C" fn(i64, i64) -> Ints = unsafe { std::mem::transmute(address(&ctx, case.name)) };
            for a in edges {
                for b in edges {
                    let expected = Ints((case.taken)(a, b) as i64, wrapped(case.code, a, b));
                    assert_eq!(f(a, b), expected, "{}({a}, {b}) under {:?}", case.name, opt.enabled_names());
                }
            }
        }
    }
}

const SIGNED_DIVISORS: &[i64] = &[1, -1, 2, 3, 5, 7, 10, 16, 100, 641, 1 << 20, 1_000_000_007, -3, -8, -1000];
const UNSIGNED_DIVISORS: &[u64] = &[1, 3, 7, 10, 32, 1000, 641, 1 << 33, 0x8000_0000_0000_0001];

/// One function per divisor and operation: `sdiv_k`, `smod_k`, `udiv_k`, `umod_k`.
fn division_context(opt: OptFlags) -> Context {
    let mut ctx = Context::default();
    let mut m = ctx.new_module("div");
    let mut add = |name: String, code: Opcode, d: Operand| {
        let mut b = FuncBuilder::new(&mut m, &name, vec![Type::I64], &[("x", Type::I64)], false);
        let x = b.arg(0);
        let r = b.var("r", Type::I64);
        b.emit(code, [r.into(), x.into(), d]);
        b.emit(Opcode::Ret, [r.into()]);
        b.finish();
    };
    for (k, &d) in SIGNED_DIVISORS.iter().enumerate() {
        add(format!("sdiv_{k}"), Opcode::Div, Operand::Int(d));
        add(format!("smod_{k}"), Opcode::Mod, Operand::Int(d));
    }
    for (k, &d) in UNSIGNED_DIVISORS.iter().enumerate() {
        add(format!("udiv_{k}"), Opcode::UDiv, Operand::Uint(d));
        add(format!("umod_{k}"), Opcode::UMod, Operand::Uint(d));
    }
    ctx.generate(m, &opt).unwrap();
    ctx
}

fn int_fn(ctx: &Context, name: &str) -> extern "C" fn(i64) -> i64 {
    // SAFETY: every division function takes and returns one 64-bit integer.
    unsafe { std::mem::transmute(address(ctx, name)) }
}

fn check_dividend(ctx: &Context, x: i64) {
    for (k, &d) in SIGNED_DIVISORS.iter().enumerate() {
        assert_eq!(int_fn(ctx, &format!("sdiv_{k}"))(x), x.wrapping_div(d), "{x} / {d}");
        assert_eq!(int_fn(ctx, &format!("smod_{k}"))(x), x.wrapping_rem(d), "{x} % {d}");
    }
    for (k, &d) in UNSIGNED_DIVISORS.iter().enumerate() {
        let u = x as u64;
        assert_eq!(int_fn(ctx, &format!("udiv_{k}"))(x) as u64, u / d, "{u} / {d}");
        assert_eq!(int_fn(ctx, &format!("umod_{k}"))(x) as u64, u % d, "{u} % {d}");
    }
}

#[test]
fn test_division_by_constants_at_edges() {
    let _ = env_logger::builder().is_test(true).try_init();
    let edges = [0, 1, -1, 2, -2, 7, -7, 641, i64::MAX, i64::MIN, i64::MAX - 1, i64::MIN + 1, 1 << 40, -(1 << 40)];
    for opt in [OptFlags::none(), OptFlags::standard(), OptFlags::all()] {
        let ctx = division_context(opt);
        for x in edges {
            check_dividend(&ctx, x);
        }
    }
}

proptest! {
    #[test]
    fn prop_magic_division_matches_hardware(x in any::<i64>()) {
        thread_local! {
            static CTX: Context = division_context(OptFlags { strength_reduce: true, magic_div: true, ..OptFlags::none() });
        }
        CTX.with(|ctx| check_dividend(ctx, x));
    }
}
