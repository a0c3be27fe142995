//! remap-users CLI - cross-environment user-identity remapping for SQL Server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use remap_users::{
    Config, MssqlDb, RemapContext, RemapError, RemapPipeline, RunManifest,
};
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "remap-users")]
#[command(about = "Remap user identities in a SQL Server snapshot load")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "remap.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preview the remap without touching the target tables
    DryRun,

    /// Apply the remap; requires a matching recent dry run
    Commit {
        /// Maximum age of the authorizing dry run, in hours
        #[arg(long, default_value = "4")]
        max_age_hours: i64,

        /// Apply without a prior dry run (not recommended)
        #[arg(long)]
        force: bool,
    },

    /// Test the target database connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), RemapError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(RemapError::Config)?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel = setup_signal_handler();

    match cli.command {
        Commands::DryRun => {
            let ctx = RemapContext::new(&config, true)?;
            let db = MssqlDb::connect(&config.target, ctx.command_timeout).await?;
            let result = RemapPipeline::new(ctx, Arc::new(db)).run(Some(cancel)).await?;
            print_result(&result, cli.output_json, "Dry run completed!")?;
        }

        Commands::Commit {
            max_age_hours,
            force,
        } => {
            let ctx = RemapContext::new(&config, false)?;

            if !force {
                let manifest_path = ctx.artifact_root.join("run_manifest.json");
                let manifest = RunManifest::load(&manifest_path).map_err(|e| {
                    RemapError::ManifestMismatch(format!(
                        "no dry-run manifest at {:?} ({}); run `remap-users dry-run` first",
                        manifest_path, e
                    ))
                })?;
                if !manifest.matches_for_commit(
                    ctx.parameters(),
                    false,
                    Utc::now(),
                    Duration::hours(max_age_hours),
                ) {
                    return Err(RemapError::ManifestMismatch(format!(
                        "the recorded dry run does not authorize this commit \
                         (parameters changed, snapshot changed, or older than {}h); \
                         re-run `remap-users dry-run`",
                        max_age_hours
                    )));
                }
                info!(
                    parameter_hash = %manifest.parameter_hash,
                    "dry-run manifest authorizes this commit"
                );
            }

            let db = MssqlDb::connect(&config.target, ctx.command_timeout).await?;
            let result = RemapPipeline::new(ctx, Arc::new(db)).run(Some(cancel)).await?;
            print_result(&result, cli.output_json, "Remap committed!")?;
        }

        Commands::HealthCheck => {
            use remap_users::RemapDb;

            // No snapshot needed just to probe connectivity.
            let timeout =
                std::time::Duration::from_secs(config.remap.get_command_timeout_secs());
            let started = std::time::Instant::now();
            let outcome = MssqlDb::connect(&config.target, timeout).await;
            let latency_ms = started.elapsed().as_millis();

            match outcome {
                Ok(db) => {
                    db.ping().await?;
                    db.close().await;
                    if cli.output_json {
                        println!(
                            "{}",
                            serde_json::json!({
                                "healthy": true,
                                "latency_ms": latency_ms,
                            })
                        );
                    } else {
                        println!("Target: OK ({}ms)", latency_ms);
                    }
                }
                Err(e) => {
                    if cli.output_json {
                        println!(
                            "{}",
                            serde_json::json!({
                                "healthy": false,
                                "error": e.to_string(),
                            })
                        );
                    } else {
                        println!("Target: FAILED");
                        println!("  Error: {}", e);
                    }
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}

fn print_result(
    result: &remap_users::RemapRunResult,
    output_json: bool,
    headline: &str,
) -> Result<(), RemapError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("\n{}", headline);
    println!("  Run ID: {}", result.run_id);
    println!("  Parameter hash: {}", result.parameter_hash);
    println!(
        "  Staged: {} rows across {} tables",
        result.total_staged_rows, result.tables_staged
    );
    println!("  Columns rewritten: {}", result.columns_rewritten);
    println!(
        "  User map: {} resolved, {} unresolved",
        result.map_resolved, result.map_unresolved
    );
    if !result.dry_run {
        println!("  Loaded: {} rows", result.total_loaded_rows);
    }
    if let Some(clean) = result.validation_clean {
        println!(
            "  Validation: {}",
            if clean { "clean" } else { "VIOLATIONS FOUND" }
        );
    }
    if let Some(dir) = &result.artifact_dir {
        println!("  Artifacts: {}", dir);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Flip the cancel flag on SIGINT or SIGTERM so the pipeline stops at the
/// next step boundary.
#[cfg(unix)]
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);

    let tx_int = Arc::clone(&tx);
    tokio::spawn(async move {
        if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
            sigint.recv().await;
            eprintln!("\nReceived SIGINT. Stopping at the next step boundary...");
            tx_int.send(true).ok();
        }
    });

    tokio::spawn(async move {
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
            eprintln!("\nReceived SIGTERM. Stopping at the next step boundary...");
            tx.send(true).ok();
        }
    });

    rx
}

#[cfg(not(unix))]
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping at the next step boundary...");
            tx.send(true).ok();
        }
    });

    rx
}
