use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::info;

use crate::cli::args::{
    CheckArgs, ConfigAction, ConfigArgs, InitArgs, OutputFormat, RunArgs, VerifyArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::LearnboxConfig;
use crate::error::{LearnboxError, Result};
use crate::sandbox::{
    available_backends, CodeValidator, DisposableExecutor, ExecutionResult, Verification,
    FAILURE_EXIT_CODE,
};

// ============================================================================
// Execution Commands
// ============================================================================

/// Compile and run a program once
pub async fn run(args: RunArgs, config: LearnboxConfig, format: OutputFormat) -> Result<()> {
    let code = read_source(&args.file).await?;
    info!(file = %args.file.display(), exercise = ?args.exercise, "Running program");

    let executor = DisposableExecutor::new(config.sandbox);
    let result = executor.execute(&code, args.exercise.as_deref()).await;

    output_execution_result(&result, format)
}

/// Run a program and grade its output
pub async fn verify(args: VerifyArgs, config: LearnboxConfig, format: OutputFormat) -> Result<()> {
    let code = read_source(&args.file).await?;
    let expected = match (args.expected, &args.expected_file) {
        (Some(text), _) => text,
        (None, Some(path)) => tokio::fs::read_to_string(path).await?,
        (None, None) => {
            return Err(LearnboxError::Config(
                "either --expected or --expected-file is required".to_string(),
            ))
        }
    };
    info!(file = %args.file.display(), exercise = ?args.exercise, "Verifying solution");

    let executor = DisposableExecutor::new(config.sandbox);
    let verification = executor
        .verify_solution(&code, &expected, args.exercise.as_deref())
        .await;

    output_verification(&verification, format)
}

/// Validate a program without compiling it
pub async fn check(args: CheckArgs, config: LearnboxConfig, format: OutputFormat) -> Result<()> {
    let code = read_source(&args.file).await?;
    let validator = CodeValidator::new(&config.sandbox.limits);
    let verdict = validator.validate(&code);

    match format {
        OutputFormat::Text => match &verdict {
            Ok(()) => println!("OK"),
            Err(rejection) => eprintln!("{}", rejection),
        },
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "valid": verdict.is_ok(),
                    "reason": verdict.as_ref().err().map(|r| r.to_string()),
                    "securityViolation": verdict.as_ref().err().map(|r| r.is_security_violation()).unwrap_or(false),
                })
            );
        }
    }

    if verdict.is_err() {
        std::process::exit(FAILURE_EXIT_CODE);
    }
    Ok(())
}

/// List backends and whether this host can use them
pub async fn backends(config: LearnboxConfig, format: OutputFormat) -> Result<()> {
    let backends = available_backends(&config.sandbox).await;

    match format {
        OutputFormat::Text => {
            println!("Configured backend: {:?}", config.sandbox.backend);
            println!();
            println!("{:<12} {:<10} DESCRIPTION", "BACKEND", "STATUS");
            println!("{}", "-".repeat(72));
            for backend in &backends {
                let status = if backend.available {
                    "available"
                } else {
                    "missing"
                };
                println!(
                    "{:<12} {:<10} {}",
                    backend.name, status, backend.description
                );
                if let Some(reason) = &backend.unavailable_reason {
                    println!("{:<12} {:<10} ({})", "", "", reason);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&backends)?);
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

/// Initialize configuration
pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    // Create parent directories if needed
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write default configuration
    let default_config = LearnboxConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).map_err(|e| LearnboxError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # See which sandboxes this host supports");
    println!("  learnbox backends");
    println!();
    println!("  # Run a program");
    println!("  learnbox run main.rs");
    println!();
    println!("  # Grade a solution");
    println!("  learnbox verify main.rs --expected \"Hello, world!\"");
    println!();
    println!("  # Allow the unsandboxed fallback on a dev machine");
    println!("  ENVIRONMENT=development learnbox run main.rs");

    Ok(())
}

/// Config management
pub async fn config(args: ConfigArgs, config: LearnboxConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| LearnboxError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut code = String::new();
        tokio::io::stdin().read_to_string(&mut code).await?;
        return Ok(code);
    }
    Ok(tokio::fs::read_to_string(path).await?)
}

fn output_execution_result(result: &ExecutionResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if !result.stdout.is_empty() {
                print!("{}", result.stdout);
            }
            if let Some(error) = &result.error {
                eprintln!("{}", error);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
    }

    // Exit with the program's exit code
    if result.exit_code != 0 {
        std::process::exit(result.exit_code);
    }
    Ok(())
}

fn output_verification(verification: &Verification, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if verification.success {
                println!("PASS ({} ms)", verification.execution_time_ms);
            } else {
                println!("FAIL");
                println!("expected: {}", verification.expected.trim());
                println!("actual:   {}", verification.output);
                if let Some(error) = &verification.error {
                    eprintln!("{}", error);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(verification)?);
        }
    }

    if !verification.success {
        std::process::exit(FAILURE_EXIT_CODE);
    }
    Ok(())
}
