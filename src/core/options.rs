// This module holds the configuration surface of a compile call. CompileOptions carries
// the diagnostic sink, the debug/verbose/pedantic switches, the stage limits
// (preprocess-only and syntax-only), ordered macro commands and include directories, and
// the optimization toggles. OptFlags names each of the sixteen lowering-time passes
// (numbered Opt 2 to Opt 17, with magic division as 6b) and offers the usual presets.
// Toggles are validated once per compile by OptFlags::resolve, which folds in target
// capabilities and documented interactions, so lowering code only ever consults the
// resulting ActiveOpts.

//! Compile options and optimization toggles.

use super::diagnostics::MessageSink;
use std::path::PathBuf;

/// One `-D` or `-U` command, applied in order before the source is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroCommand {
    Define { name: String, value: String },
    Undefine { name: String },
}

impl MacroCommand {
    /// Parse the argument of a `-D` flag: `NAME` or `NAME=VALUE`.
    pub fn define(arg: &str) -> Self {
        match arg.split_once('=') {
            Some((name, value)) => MacroCommand::Define {
                name: name.to_string(),
                value: value.to_string(),
            },
            None => MacroCommand::Define {
                name: arg.to_string(),
                value: "1".to_string(),
            },
        }
    }

    pub fn undefine(name: &str) -> Self {
        MacroCommand::Undefine {
            name: name.to_string(),
        }
    }
}

macro_rules! opt_flags {
    ($( $(#[$doc:meta])* $field:ident = $flag:literal, $number:literal; )*) => {
        /// Independently selectable lowering-time optimizations.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct OptFlags {
            $( $(#[$doc])* pub $field: bool, )*
        }

        impl OptFlags {
            /// Driver flag names (`-fopt-<name>`) paired with their pass numbers.
            pub const NAMES: &'static [(&'static str, &'static str)] = &[
                $( ($flag, $number), )*
            ];

            /// Number of toggles.
            pub const COUNT: usize = Self::NAMES.len();

            /// Build a toggle set from the low bits of `bits`, in `NAMES` order.
            pub fn from_bits(bits: u32) -> Self {
                let mut flags = Self::default();
                let mut _i = 0;
                $(
                    flags.$field = bits & (1 << _i) != 0;
                    _i += 1;
                )*
                flags
            }

            pub fn to_bits(&self) -> u32 {
                let mut bits = 0;
                let mut _i = 0;
                $(
                    if self.$field { bits |= 1 << _i; }
                    _i += 1;
                )*
                bits
            }

            /// Enable a toggle by its driver name. Returns false for unknown names.
            pub fn set_by_name(&mut self, name: &str, value: bool) -> bool {
                match name {
                    $( $flag => { self.$field = value; true } )*
                    _ => false,
                }
            }

            /// Names of the enabled toggles.
            pub fn enabled_names(&self) -> Vec<&'static str> {
                let mut out = Vec::new();
                $( if self.$field { out.push($flag); } )*
                out
            }
        }
    };
}

opt_flags! {
    /// Opt 2: immediates and memory operands used directly as ALU sources.
    mem_operands = "mem-operands", "2";
    /// Opt 4: integer variables cached in registers within a basic block.
    reg_cache = "reg-cache", "4";
    /// Opt 5: compare followed by a branch on its result becomes `cmp; jcc`.
    cmp_branch = "cmp-branch", "5";
    /// Opt 6: shifts, lea and masks for multiply/divide/modulo by constants.
    strength_reduce = "strength-reduce", "6";
    /// Opt 6b: multiply-high sequences for division by arbitrary constants.
    magic_div = "magic-div", "6b";
    /// Opt 7: commutative operand swap.
    commute = "commute", "7";
    /// Opt 8: hottest integer variables homed in callee-saved registers.
    smart_regs = "smart-regs", "8";
    /// Opt 9: cached writes are stored back at block exit instead of immediately.
    defer_store = "defer-store", "9";
    /// Opt 10: hottest float variables homed in xmm8-xmm14.
    float_promote = "float-promote", "10";
    /// Opt 11: float variables cached in registers within a basic block.
    float_cache = "float-cache", "11";
    /// Opt 12: `base + index * scale` computed once per block.
    ind_cache = "ind-cache", "12";
    /// Opt 13: small function inlining.
    inline = "inline", "13";
    /// Opt 14: single-use float temporaries kept in a register.
    float_chain = "float-chain", "14";
    /// Opt 15: memory base pointers cached in registers.
    addr_cache = "addr-cache", "15";
    /// Opt 16: fused multiply-add.
    ///
    /// The only toggle that can change results: `a * b + c` is rounded once instead of
    /// twice, the contraction C permits under `FP_CONTRACT`. Every other toggle leaves
    /// results bit-identical to an unoptimized build.
    fmadd = "fmadd", "16";
    /// Opt 17: float loads from memory reused while no aliasing store intervenes.
    float_field_cache = "float-field-cache", "17";
}

impl OptFlags {
    /// Every pass disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// The standard safe subset enabled by `-O1`.
    pub fn standard() -> Self {
        Self {
            mem_operands: true,
            reg_cache: true,
            cmp_branch: true,
            strength_reduce: true,
            commute: true,
            smart_regs: true,
            defer_store: true,
            ..Self::default()
        }
    }

    /// Every pass enabled.
    pub fn all() -> Self {
        Self::from_bits(u32::MAX)
    }

    /// Validate toggles against the target and their mutual requirements.
    pub fn resolve(&self, caps: TargetCaps) -> ActiveOpts {
        let mut flags = *self;
        if flags.magic_div && !caps.x86_64 {
            log::warn!("magic-div needs x86-64 multiply-high; disabled");
            flags.magic_div = false;
        }
        if flags.fmadd && !caps.fma {
            log::debug!("fmadd needs FMA3; disabled");
            flags.fmadd = false;
        }
        if flags.defer_store && !(flags.reg_cache || flags.float_cache) {
            log::debug!("defer-store has no block cache to defer; disabled");
            flags.defer_store = false;
        }
        ActiveOpts { flags }
    }
}

/// Hardware features relevant to optimization legality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetCaps {
    pub x86_64: bool,
    pub fma: bool,
}

impl TargetCaps {
    /// Capabilities of the machine the compiler runs on.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                x86_64: true,
                fma: std::is_x86_feature_detected!("fma"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self {
                x86_64: false,
                fma: false,
            }
        }
    }
}

/// Toggles after validation; the only form lowering code looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveOpts {
    pub flags: OptFlags,
}

impl std::ops::Deref for ActiveOpts {
    type Target = OptFlags;

    fn deref(&self) -> &OptFlags {
        &self.flags
    }
}

/// Options for one compile call.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub message_sink: MessageSink,
    pub debug: bool,
    pub verbose: bool,
    pub pedantic: bool,
    pub ignore_warnings: bool,
    /// Skip the preprocessor and feed the source straight to the parser.
    pub no_prepro: bool,
    pub preprocess_only: bool,
    pub syntax_only: bool,
    /// Receives the preprocessed text when `preprocess_only` is set.
    pub prepro_output: MessageSink,
    pub macro_commands: Vec<MacroCommand>,
    pub include_dirs: Vec<PathBuf>,
    pub opt: OptFlags,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            message_sink: MessageSink::stderr(),
            debug: false,
            verbose: false,
            pedantic: false,
            ignore_warnings: false,
            no_prepro: false,
            preprocess_only: false,
            syntax_only: false,
            prepro_output: MessageSink::stdout(),
            macro_commands: Vec::new(),
            include_dirs: Vec::new(),
            opt: OptFlags::none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixteen_named_toggles() {
        assert_eq!(OptFlags::COUNT, 16);
        assert_eq!(OptFlags::all().enabled_names().len(), 16);
        assert!(OptFlags::none().enabled_names().is_empty());
    }

    #[test]
    fn test_bits_round_trip_through_names() {
        let flags = OptFlags::from_bits(0b1010_0000_0101_0011);
        let mut rebuilt = OptFlags::none();
        for name in flags.enabled_names() {
            assert!(rebuilt.set_by_name(name, true));
        }
        assert_eq!(rebuilt, flags);
        assert_eq!(flags.to_bits(), 0b1010_0000_0101_0011);
    }

    #[test]
    fn test_standard_matches_o1() {
        let std = OptFlags::standard();
        assert!(std.mem_operands && std.reg_cache && std.cmp_branch);
        assert!(std.strength_reduce && std.commute && std.smart_regs && std.defer_store);
        assert!(!std.magic_div && !std.inline && !std.fmadd);
    }

    #[test]
    fn test_resolve_drops_unsupported() {
        let caps = TargetCaps {
            x86_64: false,
            fma: false,
        };
        let active = OptFlags::all().resolve(caps);
        assert!(!active.magic_div);
        assert!(!active.fmadd);
        assert!(active.defer_store);

        let mut only_defer = OptFlags::none();
        only_defer.defer_store = true;
        let active = only_defer.resolve(TargetCaps::detect());
        assert!(!active.defer_store);
    }

    #[test]
    fn test_define_defaults_to_one() {
        assert_eq!(
            MacroCommand::define("DEBUG"),
            MacroCommand::Define {
                name: "DEBUG".into(),
                value: "1".into()
            }
        );
        assert_eq!(
            MacroCommand::define("N=10"),
            MacroCommand::Define {
                name: "N".into(),
                value: "10".into()
            }
        );
        assert!(!OptFlags::none().set_by_name("vectorize", true));
    }
}
