use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "learnbox")]
#[clap(version, about = "Disposable sandboxed execution of untrusted Rust programs")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "LEARNBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile and run a Rust program in a disposable sandbox
    Run(RunArgs),

    /// Run a program and compare its output with the expected output
    Verify(VerifyArgs),

    /// Validate a program without running it
    Check(CheckArgs),

    /// List sandbox backends and their availability
    Backends,

    /// Initialize a new learnbox configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Execution Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Rust source file ("-" reads stdin)
    pub file: PathBuf,

    /// Exercise identifier attached to logs and container labels
    #[clap(long, short = 'e')]
    pub exercise: Option<String>,
}

#[derive(Args, Debug)]
#[clap(group(
    clap::ArgGroup::new("expectation")
        .required(true)
        .args(&["expected", "expected_file"]),
))]
pub struct VerifyArgs {
    /// Rust source file ("-" reads stdin)
    pub file: PathBuf,

    /// Expected program output (compared after trimming)
    #[clap(long)]
    pub expected: Option<String>,

    /// Read the expected output from a file
    #[clap(long)]
    pub expected_file: Option<PathBuf>,

    /// Exercise identifier attached to logs and container labels
    #[clap(long, short = 'e')]
    pub exercise: Option<String>,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Rust source file ("-" reads stdin)
    pub file: PathBuf,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["learnbox", "-vv", "run", "main.rs", "--exercise", "42"]).unwrap();
        assert_eq!(cli.global_opts.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.file, PathBuf::from("main.rs"));
                assert_eq!(args.exercise.as_deref(), Some("42"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_verify_requires_expectation() {
        assert!(Cli::try_parse_from(["learnbox", "verify", "main.rs"]).is_err());
        assert!(Cli::try_parse_from([
            "learnbox",
            "verify",
            "main.rs",
            "--expected",
            "a",
            "--expected-file",
            "b"
        ])
        .is_err());

        let cli = Cli::try_parse_from(["learnbox", "--format", "json", "verify", "-", "--expected", "hi"])
            .unwrap();
        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
        assert!(matches!(cli.command, Commands::Verify(_)));
    }
}
