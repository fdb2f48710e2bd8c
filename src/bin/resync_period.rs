#!/usr/bin/env rust
//! Period repair.
//!
//! Incremental sync only looks past the watermark, so a correction made in
//! the source to an older reading never reaches the replica on its own. This
//! binary re-extracts a closed window [--from, --to], optionally for a
//! single station, and upserts it over what the destination holds.
//!
//! Usage:
//!   cargo run --bin resync_period -- --from "2024-03-01" --to "2024-03-02 23:59:59"
//!   cargo run --bin resync_period -- --from 2009-02-16 --to 2009-02-17 --station 14

use nimbus_sync::config::SyncConfig;
use nimbus_sync::extract::{ExtractFilter, PostgresSource, Source};
use nimbus_sync::model::{parse_timestamp, Result, SyncError, Variant};
use nimbus_sync::upsert::{self, PostgresDestination};
use nimbus_sync::logging;

use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "resync_period", about = "Re-sync a closed time window from the NIMBUS source")]
struct Args {
    /// Window start (inclusive)
    #[arg(long, value_parser = parse_timestamp)]
    from: DateTime<Utc>,

    /// Window end (inclusive)
    #[arg(long, value_parser = parse_timestamp)]
    to: DateTime<Utc>,

    /// Only this station
    #[arg(long)]
    station: Option<i32>,

    /// Rows per destination transaction [default: from settings]
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Reading family: rainfall or meteorological
    #[arg(long)]
    variant: Option<Variant>,

    /// Destination table [default: per variant]
    #[arg(long)]
    table: Option<String>,

    /// Settings file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_from_env();

    println!("🔁 NIMBUS Period Resync");
    println!("================================\n");

    if args.from > args.to {
        eprintln!("❌ --from ({}) is after --to ({})", args.from, args.to);
        return ExitCode::from(2);
    }

    let mut config = match SyncConfig::from_env(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n❌ Configuration error: {}\n", e);
            return ExitCode::from(2);
        }
    };
    if let Some(variant) = args.variant {
        config.settings.variant = variant;
    }
    if let Some(table) = &args.table {
        config.settings.destination_table = Some(table.clone());
    }
    if let Some(size) = args.chunk_size {
        config.settings.chunk_size = size;
    }
    if let Err(e) = config.settings.validate() {
        eprintln!("\n❌ Configuration error: {}\n", e);
        return ExitCode::from(2);
    }

    match run(&args, &config) {
        Ok(rows) => {
            println!("\n✓ {} rows re-synced", rows);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "period resync failed");
            eprintln!("\n❌ Resync failed: {}\n", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, config: &SyncConfig) -> Result<usize> {
    let variant = config.settings.variant;
    let table = config.settings.table_name();

    let mut source = PostgresSource::new(config.source.clone(), variant);
    source.ping()?;
    let mut destination = PostgresDestination::new(config.destination.clone(), table.as_str(), variant);
    destination.ping()?;

    if !destination.table_exists()? {
        return Err(SyncError::query(
            "checking destination table",
            format!("{} does not exist; run bootstrap_load first", table),
        ));
    }

    let mut filter = ExtractFilter::window(args.from, args.to);
    if let Some(station) = args.station {
        filter = filter.station(station);
    }

    println!("📥 Window: {} → {}", args.from, args.to);
    match args.station {
        Some(station) => println!("   Station: {}", station),
        None => println!("   Stations: all"),
    }
    println!("   Table: {}\n", table);
    info!(from = %args.from, to = %args.to, station = ?args.station, %table, "period resync starting");

    let chunks = source.extract(&filter, config.settings.chunk_size)?;
    let rows = upsert::upsert_chunks(&mut destination, chunks, |commit| {
        println!("   ✓ Chunk {}: {} rows ({} total)", commit.index, commit.rows, commit.total);
    })?;

    info!(rows, "period resync complete");
    Ok(rows)
}
