//! NIMBUS Sync Service - Main Daemon
//!
//! Keeps the analytics replica in step with the NIMBUS operational database:
//! every cycle reads the replica's watermark, extracts the deduplicated
//! source readings newer than it and upserts them in atomic chunks.
//!
//! Usage:
//!   cargo run --release                                  # continuous, every 300 s
//!   cargo run --release -- --once                        # one cycle, then exit
//!   cargo run --release -- --interval-seconds 60
//!   cargo run --release -- --once --since "2024-03-01 00:00:00-03:00"
//!
//! Environment:
//!   SOURCE_DATABASE_URL, DESTINATION_DATABASE_URL (or SOURCE_DB_* / DESTINATION_DB_*)
//!   RUST_LOG, LOG_JSON
//!
//! Exit codes: 0 success, 1 sync failure, 2 configuration error.

use chrono::{DateTime, Utc};
use clap::Parser;
use nimbus_sync::config::{ConfigError, SyncConfig};
use nimbus_sync::daemon::{DriverConfig, SyncDriver};
use nimbus_sync::model::{parse_timestamp, Variant};
use nimbus_sync::{logging, PostgresDestination, PostgresSource};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nimbus_sync", version, about = "Incremental NIMBUS readings sync")]
struct Cli {
    /// Sync readings after this instant instead of the destination watermark
    #[arg(long, value_parser = parse_timestamp)]
    since: Option<DateTime<Utc>>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Seconds between cycle starts in continuous mode [default: 300]
    #[arg(long)]
    interval_seconds: Option<u64>,

    /// Rows per destination transaction [default: 5000]
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Reading family to sync: rainfall or meteorological
    #[arg(long)]
    variant: Option<Variant>,

    /// Destination table [default: per variant]
    #[arg(long)]
    table: Option<String>,

    /// Settings file [default: nimbus_sync.toml if present]
    #[arg(long)]
    config: Option<PathBuf>,
}

const EXIT_CONFIG: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_from_env();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            eprintln!("\n❌ Configuration error: {}\n", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let settings = &config.settings;
    let table = settings.table_name();
    info!(
        variant = %settings.variant,
        source = config.source.label(),
        destination = config.destination.label(),
        table = %table,
        "NIMBUS sync starting"
    );

    let mut source = PostgresSource::new(config.source.clone(), settings.variant);
    let mut destination = PostgresDestination::new(config.destination.clone(), table, settings.variant);

    // Fail fast on a one-shot run; a long-running process waits for the databases instead
    if let Err(e) = source.ping().and_then(|_| destination.ping()) {
        if cli.once {
            error!(error = %e, "connection check failed");
            return ExitCode::FAILURE;
        }
        warn!(error = %e, "connection check failed; will keep retrying every cycle");
    }

    let mut driver = SyncDriver::new(source, destination, DriverConfig::from(settings)).with_since(cli.since);

    if cli.once {
        return match driver.run_cycle() {
            Ok(report) => {
                println!(
                    "✓ {} rows synced in {} chunks ({} ms)",
                    report.rows_synced,
                    report.chunks,
                    report.elapsed.as_millis()
                );
                if report.bootstrap_required {
                    println!("⚠ Destination is empty: run bootstrap_load first");
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("\n❌ Sync failed: {}\n", e);
                ExitCode::FAILURE
            }
        };
    }

    driver.run_continuous(None);
    ExitCode::SUCCESS
}

/// Environment and settings file first, then command-line flags.
fn load_config(cli: &Cli) -> Result<SyncConfig, ConfigError> {
    let mut config = SyncConfig::from_env(cli.config.as_deref())?;
    let settings = &mut config.settings;

    if let Some(variant) = cli.variant {
        settings.variant = variant;
    }
    if let Some(table) = &cli.table {
        settings.destination_table = Some(table.clone());
    }
    if let Some(seconds) = cli.interval_seconds {
        settings.interval_seconds = seconds;
    }
    if let Some(size) = cli.chunk_size {
        settings.chunk_size = size;
    }

    settings.validate()?;
    Ok(config)
}
