// Driver-level scenarios: what a caller sees through compile_str, the message sink and
// get_entry when a unit is rejected, when it has no main, when pedantic mode turns an
// extension into an error, and when a declared function exists nowhere. Also covers
// several units compiled into one context, where later units link against earlier
// ones and a redefinition shadows the older function.

//! Compile outcomes, diagnostics and cross-unit linking.

use c2jit::{compile_str, get_entry, CompileOptions, Context, MessageSink};

fn opts() -> CompileOptions {
    CompileOptions {
        message_sink: MessageSink::capture(),
        ..Default::default()
    }
}

#[test]
fn test_type_error_leaves_nothing_callable() {
    let _ = env_logger::builder().is_test(true).try_init();
    let opts = opts();
    let mut ctx = Context::default();
    let src = "struct s { int a; };\nint main(void) {\n  struct s v;\n  return v + 1;\n}\n";
    assert!(!compile_str(&mut ctx, &opts, src, "types.c"));
    let msgs = opts.message_sink.contents();
    assert!(msgs.starts_with("types.c:4:"), "{msgs}");
    assert!(msgs.contains(": error: "));
    assert!(get_entry(&ctx, "main").is_none());
    assert_eq!(ctx.modules().count(), 0);
}

#[test]
fn test_pointer_to_int_assignment_is_rejected() {
    let opts = opts();
    let mut ctx = Context::default();
    let src = "int g;\nint main(void) {\n  int x;\n  x = &g;\n  return x;\n}\n";
    assert!(!compile_str(&mut ctx, &opts, src, "ptr.c"));
    assert!(opts.message_sink.contents().contains("ptr.c:4:"));
    assert!(get_entry(&ctx, "main").is_none());
}

#[test]
fn test_helpers_without_main() {
    let _ = env_logger::builder().is_test(true).try_init();
    let opts = opts();
    let mut ctx = Context::default();
    let src = "int twice(int x) { return x + x; }\nint thrice(int x) { return 3 * x; }\n";
    assert!(compile_str(&mut ctx, &opts, src, "lib.c"));
    assert!(get_entry(&ctx, "main").is_none());
    let twice = get_entry(&ctx, "twice").expect("twice compiled");
    // SAFETY: twice takes and returns an int.
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(twice.addr() as usize) };
    assert_eq!(f(21), 42);
    assert!(get_entry(&ctx, "thrice").is_some());
}

#[test]
fn test_pedantic_rejects_implicit_declaration() {
    let _ = env_logger::builder().is_test(true).try_init();
    let src = "int main(void) { return helper(2); }\nint helper(int x) { return x * 5; }\n";

    let lenient = opts();
    let mut ctx = Context::default();
    assert!(compile_str(&mut ctx, &lenient, src, "implicit.c"));
    assert!(lenient.message_sink.contents().contains("warning: implicit declaration of function 'helper'"));
    let main = get_entry(&ctx, "main").unwrap();
    assert_eq!(unsafe { main.call(0, std::ptr::null_mut()) }, 10);

    let strict = CompileOptions {
        pedantic: true,
        ..opts()
    };
    let mut ctx = Context::default();
    assert!(!compile_str(&mut ctx, &strict, src, "implicit.c"));
    assert!(strict.message_sink.contents().contains("error: implicit declaration"));
    assert!(get_entry(&ctx, "main").is_none());
}

#[test]
fn test_ignore_warnings_silences_sink() {
    let quiet = CompileOptions {
        ignore_warnings: true,
        ..opts()
    };
    let mut ctx = Context::default();
    let src = "int main(void) { return helper(); }\nint helper(void) { return 1; }\n";
    assert!(compile_str(&mut ctx, &quiet, src, "quiet.c"));
    assert_eq!(quiet.message_sink.contents(), "");
}

#[test]
fn test_undefined_symbol_is_a_user_error() {
    let _ = env_logger::builder().is_test(true).try_init();
    let opts = opts();
    let mut ctx = Context::default();
    let src = "int c2jit_no_such_function(int);\nint main(void) { return c2jit_no_such_function(1); }\n";
    assert!(!compile_str(&mut ctx, &opts, src, "undef.c"));
    let msgs = opts.message_sink.contents();
    assert!(msgs.contains("error: undefined symbol 'c2jit_no_such_function'"), "{msgs}");
    assert!(!msgs.contains("internal compiler error"));
    assert!(get_entry(&ctx, "main").is_none());
}

#[test]
fn test_later_units_link_against_earlier_ones() {
    let _ = env_logger::builder().is_test(true).try_init();
    let opts = opts();
    let mut ctx = Context::default();
    assert!(compile_str(&mut ctx, &opts, "int base(void) { return 7; }\n", "a.c"));
    assert!(compile_str(
        &mut ctx,
        &opts,
        "int base(void);\nint main(void) { return base() * 6; }\n",
        "b.c"
    ));
    let main = get_entry(&ctx, "main").unwrap();
    assert_eq!(unsafe { main.call(0, std::ptr::null_mut()) }, 42);

    assert!(compile_str(&mut ctx, &opts, "int base(void) { return 1; }\n", "c.c"));
    let base = get_entry(&ctx, "base").unwrap();
    assert_eq!(unsafe { base.call(0, std::ptr::null_mut()) }, 1);
    assert_eq!(ctx.modules().count(), 3);
}

#[test]
fn test_preprocessor_error_stops_compile() {
    let opts = opts();
    let mut ctx = Context::default();
    assert!(!compile_str(&mut ctx, &opts, "#include \"c2jit-missing.h\"\nint main(void) { return 0; }\n", "pp.c"));
    assert!(opts.message_sink.contents().contains("pp.c:1:"));
    assert_eq!(ctx.modules().count(), 0);
}

#[test]
fn test_main_receives_arguments() {
    let opts = opts();
    let mut ctx = Context::default();
    let src = "int main(int argc, char **argv) { return argc * 10 + (argv[2][0] - '0'); }\n";
    assert!(compile_str(&mut ctx, &opts, src, "args.c"));
    let main = get_entry(&ctx, "main").unwrap();
    assert_eq!(unsafe { main.call_with_args(&["prog", "x", "7"]) }, 37);
}
