// hexatiles/crates/hexatiles/src/main.rs
mod config;
mod telemetry;

use crate::config::{BuildArgs, Cli, Command, InspectArgs, SampleArgs, SchemaArgs, ValidateArgs};
use crate::telemetry::BuildMetrics;
use anyhow::{bail, Context};
use clap::Parser;
use hexpipe::report::REPORT_FILE_NAME;
use hexpipe::tiler::TileEngine;
use hexpipe::{run_build, CancelSignal, CliTileEngine};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output.
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let cancel = CancelSignal::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::warn!("Shutdown signal received. Cancelling...");
            cancel.cancel();
        });
    }

    match cli.command {
        Command::Build(args) => build(args, &cancel).await,
        Command::Validate(args) => validate(args).await,
        Command::Schema(args) => schema(args).await,
        Command::Inspect(args) => inspect(args, &cancel).await,
        Command::Sample(args) => sample(args).await,
    }
}

async fn build(args: BuildArgs, cancel: &CancelSignal) -> anyhow::Result<()> {
    let opts = args.to_options();
    tracing::info!(options = ?opts, "Loaded build configuration");

    let engine = CliTileEngine::new(args.tippecanoe_bin.clone(), args.pmtiles_bin.clone());
    let report = run_build(&opts, &engine, cancel)
        .await
        .with_context(|| format!("Build of {} failed", opts.input.display()))?;

    if let Some(path) = &args.metrics_out {
        let metrics = BuildMetrics::new().context("Failed to create metrics registry")?;
        metrics.observe(&report);
        metrics.write_to(path)?;
    }

    let output = &report.config.output_path;
    let report_path = output
        .parent()
        .map(|dir| dir.join(REPORT_FILE_NAME))
        .unwrap_or_else(|| REPORT_FILE_NAME.into());

    println!("✔ build complete in {:.2}s", report.duration_seconds);
    println!(
        "  tiles: {} ({})",
        output.display(),
        format_bytes(report.artifacts.pmtiles_bytes)
    );
    println!(
        "  features: {} emitted, {} dropped",
        report.metrics.emitted_features,
        report.dropped_rows()
    );
    if let Some(ndjson) = &report.artifacts.ndjson_path {
        println!(
            "  ndjson: {} ({})",
            ndjson.display(),
            format_bytes(report.artifacts.ndjson_bytes)
        );
    }
    println!("  report: {}", report_path.display());
    for warning in &report.metrics.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

async fn validate(args: ValidateArgs) -> anyhow::Result<()> {
    let opts = args.to_options();
    let mut clean = true;
    for input in args.inputs {
        let path = input.clone();
        let report = tokio::task::spawn_blocking(move || hexpipe::validate::validate_file(&input, &opts))
            .await
            .context("Validation task failed")?
            .with_context(|| format!("Failed to validate {}", path.display()))?;
        print!("{report}");
        clean &= report.is_clean();
    }
    if !clean {
        bail!("validation failed: invalid H3 cells detected");
    }
    Ok(())
}

async fn schema(args: SchemaArgs) -> anyhow::Result<()> {
    let SchemaArgs { input, sample } = args;
    let path = input.clone();
    let report = tokio::task::spawn_blocking(move || hexpipe::schema::survey_file(&input, sample))
        .await
        .context("Schema task failed")?
        .with_context(|| format!("Failed to read schema of {}", path.display()))?;
    print!("{report}");
    Ok(())
}

async fn inspect(args: InspectArgs, cancel: &CancelSignal) -> anyhow::Result<()> {
    let engine = CliTileEngine::new(None, args.pmtiles_bin);
    let info = engine
        .describe_archive(&args.input, cancel)
        .await
        .with_context(|| format!("Failed to inspect {}", args.input.display()))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn sample(args: SampleArgs) -> anyhow::Result<()> {
    let SampleArgs {
        output,
        count,
        resolution,
    } = args;
    let path = output.clone();
    let rows = tokio::task::spawn_blocking(move || hexpipe::sample::write_sample(&output, count, resolution))
        .await
        .context("Sample task failed")?
        .context("Failed to write sample dataset")?;
    println!("wrote {rows} cells (r{resolution}) to {}", path.display());
    Ok(())
}

/// Human-readable byte size using binary units.
fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    const SUFFIXES: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / UNIT as f64;
    let mut idx = 0;
    while value >= UNIT as f64 && idx < SUFFIXES.len() - 1 {
        value /= UNIT as f64;
        idx += 1;
    }
    format!("{value:.1} {}", SUFFIXES[idx])
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_byte_sizes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024u64.pow(4)), "3.0 TB");
        assert_eq!(format_bytes(2048 * 1024u64.pow(4)), "2048.0 TB");
    }
}
