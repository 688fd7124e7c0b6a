//! c2jit command line driver.
//!
//! Compiles one C source (a file, `-e` code or standard input) into memory and runs
//! its `main(0, NULL)`, exiting with main's return value.

use c2jit::{compile_str, get_entry, CompileOptions, Context, MacroCommand, OptFlags};
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "c2jit")]
#[command(about = "Compile C to native code in memory and run its main()")]
#[command(disable_version_flag = true)]
struct Args {
    /// Source file; standard input when neither a file nor -e is given
    file: Option<PathBuf>,

    /// Only preprocess, writing the result to standard output
    #[arg(short = 'E')]
    preprocess_only: bool,

    /// -fsyntax-only, or -fopt-<name> to enable one optimization
    #[arg(short = 'f', value_name = "FEATURE")]
    features: Vec<String>,

    /// Print compile statistics
    #[arg(short = 'v')]
    verbose: bool,

    /// Dump the generated IR
    #[arg(short = 'd')]
    debug: bool,

    /// Suppress warnings
    #[arg(short = 'w')]
    no_warnings: bool,

    /// Treat extensions as errors (spelled -pedantic)
    #[arg(long = "pedantic")]
    pedantic: bool,

    /// Define a macro (value defaults to 1)
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    define: Vec<String>,

    /// Undefine a macro
    #[arg(short = 'U', value_name = "NAME")]
    undef: Vec<String>,

    /// Add an include search directory
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Compile CODE instead of a file
    #[arg(short = 'e', value_name = "CODE")]
    eval: Option<String>,

    /// Optimization level; 1 enables the standard toggle set
    #[arg(short = 'O', value_name = "LEVEL")]
    opt_level: Option<u8>,
}

/// `-D` and `-U` in command-line order.
fn macro_commands(matches: &ArgMatches) -> Vec<MacroCommand> {
    let mut cmds: Vec<(usize, MacroCommand)> = Vec::new();
    if let (Some(idx), Some(vals)) = (matches.indices_of("define"), matches.get_many::<String>("define")) {
        cmds.extend(idx.zip(vals).map(|(i, v)| (i, MacroCommand::define(v))));
    }
    if let (Some(idx), Some(vals)) = (matches.indices_of("undef"), matches.get_many::<String>("undef")) {
        cmds.extend(idx.zip(vals).map(|(i, v)| (i, MacroCommand::undefine(v))));
    }
    cmds.sort_by_key(|(i, _)| *i);
    cmds.into_iter().map(|(_, c)| c).collect()
}

fn options(args: &Args, matches: &ArgMatches) -> Result<CompileOptions, String> {
    let mut opts = CompileOptions {
        verbose: args.verbose,
        debug: args.debug,
        pedantic: args.pedantic,
        ignore_warnings: args.no_warnings,
        preprocess_only: args.preprocess_only,
        include_dirs: args.include.clone(),
        macro_commands: macro_commands(matches),
        ..Default::default()
    };
    if args.opt_level.unwrap_or(0) >= 1 {
        opts.opt = OptFlags::standard();
    }
    for feature in &args.features {
        if feature == "syntax-only" {
            opts.syntax_only = true;
            continue;
        }
        match feature.strip_prefix("opt-") {
            Some(name) if opts.opt.set_by_name(name, true) => {}
            _ => return Err(format!("unknown option -f{feature}")),
        }
    }
    Ok(opts)
}

fn read_source(args: &Args) -> Result<(String, String), String> {
    if let Some(code) = &args.eval {
        return Ok((code.clone(), "<command-line>".to_string()));
    }
    match &args.file {
        Some(path) => fs::read_to_string(path)
            .map(|s| (s, path.display().to_string()))
            .map_err(|e| format!("cannot read '{}': {e}", path.display())),
        None => {
            let mut s = String::new();
            io::stdin()
                .read_to_string(&mut s)
                .map_err(|e| format!("cannot read standard input: {e}"))?;
            Ok((s, "<stdin>".to_string()))
        }
    }
}

fn run(args: &Args, matches: &ArgMatches) -> i32 {
    let prepared = options(args, matches).and_then(|opts| read_source(args).map(|src| (opts, src)));
    let (opts, (source, name)) = match prepared {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("c2jit: {msg}");
            return 1;
        }
    };
    log::debug!("enabled optimizations: {:?}", opts.opt.enabled_names());

    let mut ctx = Context::default();
    let start = Instant::now();
    if !compile_str(&mut ctx, &opts, &source, &name) {
        return 1;
    }
    if opts.verbose {
        eprintln!("c2jit: compiled {name} in {:.3?}", start.elapsed());
    }
    if opts.preprocess_only || opts.syntax_only {
        return 0;
    }

    let Some(main) = get_entry(&ctx, "main") else {
        eprintln!("main() not found");
        return 1;
    };
    // SAFETY: main was compiled from C with the process-entry signature; argv is NULL
    // and argc 0, which well-formed programs handle.
    let ret = unsafe { main.call(0, std::ptr::null_mut()) };
    if opts.verbose {
        eprintln!("c2jit: main returned {ret} after {:.3?}", start.elapsed());
    }
    ret
}

fn main() {
    env_logger::init();

    // gcc spells this one with a single dash.
    let argv = std::env::args_os().map(|a| if a == "-pedantic" { "--pedantic".into() } else { a });
    let matches = Args::command().get_matches_from(argv);
    let args = Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    let code = run(&args, &matches);
    std::process::exit(code);
}
