//! Static screening of submitted source before anything touches the host.
//!
//! This is defense in depth. The isolation of the selected backend is the
//! real security boundary; the denylist only turns away the obvious attempts
//! early and cheaply.

use std::fmt;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::config::types::ExecutionLimits;

/// The family a denylisted pattern belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationClass {
    ProcessExecution,
    Filesystem,
    Network,
    OsInternals,
    UnsafeCode,
    CompilerDirective,
    ForeignCode,
    FileInclusion,
    BuildEnvironment,
}

impl fmt::Display for ViolationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ProcessExecution => "process execution",
            Self::Filesystem => "filesystem access",
            Self::Network => "network access",
            Self::OsInternals => "OS internals",
            Self::UnsafeCode => "unsafe code",
            Self::CompilerDirective => "compiler directive",
            Self::ForeignCode => "foreign code",
            Self::FileInclusion => "file inclusion",
            Self::BuildEnvironment => "build environment access",
        };
        f.write_str(label)
    }
}

/// Why a submission was turned away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("Code exceeds maximum size of {limit} {unit}")]
    TooLarge { limit: usize, unit: &'static str },

    #[error("Code contains a NUL byte")]
    NulByte,

    #[error("Security violation: Prohibited pattern detected ({class})")]
    ProhibitedPattern { class: ViolationClass },

    #[error("Code must contain a main function")]
    MissingEntryPoint,
}

impl Rejection {
    /// Policy refusals, as opposed to code that simply cannot build.
    pub fn is_security_violation(&self) -> bool {
        !matches!(self, Self::MissingEntryPoint)
    }
}

const DENYLIST: &[(&str, ViolationClass)] = &[
    (r"std\s*::\s*process\s*::\s*Command", ViolationClass::ProcessExecution),
    (r"use\s+std\s*::\s*process", ViolationClass::ProcessExecution),
    (r"Command\s*::\s*new", ViolationClass::ProcessExecution),
    (r"std\s*::\s*fs\s*::", ViolationClass::Filesystem),
    (r"use\s+std\s*::\s*fs", ViolationClass::Filesystem),
    (r"File\s*::\s*(open|create|remove)", ViolationClass::Filesystem),
    (r"fs\s*::\s*remove_(file|dir)", ViolationClass::Filesystem),
    (r"std\s*::\s*net\s*::", ViolationClass::Network),
    (r"use\s+std\s*::\s*net", ViolationClass::Network),
    (r"std\s*::\s*os\s*::", ViolationClass::OsInternals),
    (r"unsafe\s*\{", ViolationClass::UnsafeCode),
    (r"\b(global_)?asm\s*!", ViolationClass::UnsafeCode),
    (r"#\s*!\s*\[\s*feature", ViolationClass::CompilerDirective),
    (r"#\s*!\s*\[\s*no_std", ViolationClass::CompilerDirective),
    (r"#\s*!\s*\[\s*no_main", ViolationClass::CompilerDirective),
    (r"^\s*(pub\s+)?mod\s+\w+\s*;", ViolationClass::CompilerDirective),
    (r"extern\s+crate", ViolationClass::ForeignCode),
    (r#"extern\s+"[^"]*""#, ViolationClass::ForeignCode),
    (r"#\s*\[\s*link", ViolationClass::ForeignCode),
    (r"libc\s*::", ViolationClass::ForeignCode),
    (r"winapi\s*::", ViolationClass::ForeignCode),
    (r"include(_str|_bytes)?\s*!", ViolationClass::FileInclusion),
    (r"(option_)?env\s*!", ViolationClass::BuildEnvironment),
];

static PATTERNS: LazyLock<Vec<(Regex, ViolationClass)>> = LazyLock::new(|| {
    DENYLIST
        .iter()
        .map(|(pattern, class)| {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .multi_line(true)
                .build()
                .expect("denylist pattern");
            (regex, *class)
        })
        .collect()
});

/// Stateless source screener.
#[derive(Debug, Clone)]
pub struct CodeValidator {
    max_code_bytes: usize,
    max_code_chars: usize,
}

impl CodeValidator {
    pub fn new(limits: &ExecutionLimits) -> Self {
        Self {
            max_code_bytes: limits.max_code_bytes,
            max_code_chars: limits.max_code_chars,
        }
    }

    /// Check a submission. Identical input always yields the same verdict.
    pub fn validate(&self, code: &str) -> Result<(), Rejection> {
        if code.len() > self.max_code_bytes {
            return Err(Rejection::TooLarge {
                limit: self.max_code_bytes,
                unit: "bytes",
            });
        }

        if code.chars().count() > self.max_code_chars {
            return Err(Rejection::TooLarge {
                limit: self.max_code_chars,
                unit: "characters",
            });
        }

        if code.contains('\0') {
            return Err(Rejection::NulByte);
        }

        if let Some((_, class)) = PATTERNS.iter().find(|(regex, _)| regex.is_match(code)) {
            return Err(Rejection::ProhibitedPattern { class: *class });
        }

        if !code.contains("fn main()") && !code.contains("fn main ()") {
            return Err(Rejection::MissingEntryPoint);
        }

        Ok(())
    }
}

impl Default for CodeValidator {
    fn default() -> Self {
        Self::new(&ExecutionLimits::default())
    }
}
