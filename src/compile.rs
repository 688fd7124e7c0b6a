// The compile entry point. One call pulls the whole source from the caller's reader and
// runs the stages in order: preprocessing, lexing and parsing, semantic checking, IR
// generation and code generation into the context. Every stage reports user errors to
// the Diagnostics built from the options, and the first stage that reports an error
// ends the call with failure. Code generation errors are classified by
// CompileError::is_internal so broken IR and backend bugs read differently from an
// undefined symbol in the user's program. Nothing is added to the context unless the
// whole unit succeeded.

//! Source-to-native compilation driver.

use crate::core::context::Context;
use crate::core::diagnostics::{Diagnostics, SourcePos};
use crate::core::options::CompileOptions;
use crate::frontend::irgen::generate_ir;
use crate::frontend::lexer::tokenize;
use crate::frontend::parser::parse;
use crate::frontend::preprocess::Preprocessor;
use crate::frontend::sema::check;
use crate::ir::FuncDisplay;

/// Compile C source pulled character by character from `reader` (end of input is
/// `None`) into `ctx`. Returns whether the unit compiled; problems are reported to
/// `opts.message_sink`.
pub fn compile(
    ctx: &mut Context,
    opts: &CompileOptions,
    reader: impl FnMut() -> Option<char>,
    source_name: &str,
) -> bool {
    let source: String = std::iter::from_fn(reader).collect();
    compile_str(ctx, opts, &source, source_name)
}

/// [`compile`] over an in-memory source.
pub fn compile_str(ctx: &mut Context, opts: &CompileOptions, source: &str, source_name: &str) -> bool {
    let mut diag = Diagnostics::new(
        opts.message_sink.clone(),
        source_name,
        opts.ignore_warnings,
        opts.pedantic,
    );
    let ok = run_stages(ctx, opts, source, source_name, &mut diag);
    log::debug!(
        "compile of {source_name} {}: {} errors, {} warnings",
        if ok { "succeeded" } else { "failed" },
        diag.error_count(),
        diag.warning_count()
    );
    opts.message_sink.flush();
    ok
}

fn run_stages(ctx: &mut Context, opts: &CompileOptions, source: &str, source_name: &str, diag: &mut Diagnostics) -> bool {
    let text = if opts.no_prepro {
        source.to_string()
    } else {
        let pp = Preprocessor::new(diag, &opts.include_dirs, &opts.macro_commands);
        let text = pp.run(source, source_name);
        if diag.has_errors() {
            return false;
        }
        text
    };
    if opts.preprocess_only {
        opts.prepro_output.write_str(&text);
        opts.prepro_output.flush();
        return true;
    }
    log::debug!("{source_name}: preprocessed to {} bytes", text.len());

    let unit = match tokenize(&text, source_name).and_then(parse) {
        Ok(unit) => unit,
        Err(e) => {
            diag.error(&e.pos, &e.msg);
            return false;
        }
    };
    let Some(checked) = check(unit, diag) else {
        return false;
    };
    if opts.syntax_only {
        return true;
    }

    let module = match generate_ir(&checked, ctx, source_name) {
        Ok(module) => module,
        Err(e) => {
            diag.internal(&e);
            return false;
        }
    };
    if opts.debug {
        for (_, item, func) in module.funcs() {
            diag.note(FuncDisplay {
                module: &module,
                name: &item.name,
                func,
            });
        }
    }
    match ctx.generate(module, &opts.opt) {
        Ok(id) => {
            if opts.verbose {
                let functions = ctx.module(id).map_or(0, |m| m.ir.funcs().count());
                log::info!("{source_name}: {functions} functions compiled");
                diag.note(ctx.stats());
            }
            true
        }
        Err(e) if e.is_internal() => {
            diag.internal(&e);
            false
        }
        Err(e) => {
            let pos = SourcePos::new(diag.source_name().clone(), 0, 0);
            diag.error(&pos, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::MessageSink;
    use crate::core::options::MacroCommand;

    fn capture_opts() -> CompileOptions {
        CompileOptions {
            message_sink: MessageSink::capture(),
            prepro_output: MessageSink::capture(),
            ..Default::default()
        }
    }

    #[test]
    fn test_preprocess_only_writes_expanded_text() {
        let mut opts = capture_opts();
        opts.preprocess_only = true;
        opts.syntax_only = true;
        opts.macro_commands.push(MacroCommand::define("N=42"));
        let mut ctx = Context::default();
        assert!(compile_str(&mut ctx, &opts, "int x = N;\n", "t.c"));
        assert!(opts.prepro_output.contents().contains("int x = 42;"));
        assert_eq!(ctx.modules().count(), 0);
    }

    #[test]
    fn test_syntax_only_stops_before_codegen() {
        let mut opts = capture_opts();
        opts.syntax_only = true;
        let mut ctx = Context::default();
        assert!(compile_str(&mut ctx, &opts, "int main(void) { return 0; }", "t.c"));
        assert_eq!(ctx.modules().count(), 0);
        assert!(ctx.function_address("main").is_none());
    }

    #[test]
    fn test_syntax_error_is_reported_with_position() {
        let opts = capture_opts();
        let mut ctx = Context::default();
        assert!(!compile_str(&mut ctx, &opts, "int main(void) { return 0 }", "bad.c"));
        let msgs = opts.message_sink.contents();
        assert!(msgs.starts_with("bad.c:1:"), "{msgs}");
        assert!(msgs.contains(": error: "));
    }

    #[test]
    fn test_reader_is_drained_to_end() {
        let opts = capture_opts();
        let mut ctx = Context::default();
        let mut chars = "int answer(void) { return 42; }".chars();
        assert!(compile(&mut ctx, &opts, move || chars.next(), "<stdin>"));
        assert!(ctx.function_address("answer").is_some());
    }

    #[test]
    fn test_debug_dumps_ir() {
        let mut opts = capture_opts();
        opts.debug = true;
        let mut ctx = Context::default();
        assert!(compile_str(&mut ctx, &opts, "int one(void) { return 1; }", "t.c"));
        assert!(opts.message_sink.contents().contains("one"));
    }
}
