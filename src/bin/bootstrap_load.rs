#!/usr/bin/env rust
//! Full load of the analytics replica.
//!
//! Incremental sync resumes from the newest reading in the destination, so
//! an empty destination has to be populated once with the whole canonical
//! source history. This binary:
//! 1. Verifies both connections
//! 2. Creates the destination table if missing
//! 3. Streams every deduplicated source reading (optionally from --from on)
//! 4. Upserts it in chunks, one transaction each, reporting progress
//!
//! It refuses to run against a destination that already holds data unless
//! --force is given. Re-running after an interruption is safe: every write
//! is an upsert, so already-loaded chunks are simply rewritten.
//!
//! Usage:
//!   cargo run --release --bin bootstrap_load
//!   cargo run --release --bin bootstrap_load -- --from 1997-01-01 --chunk-size 20000
//!   cargo run --release --bin bootstrap_load -- --variant meteorological --force

use nimbus_sync::config::SyncConfig;
use nimbus_sync::extract::{ExtractFilter, PostgresSource, Source};
use nimbus_sync::model::{parse_timestamp, Result, Variant};
use nimbus_sync::upsert::{self, Destination, PostgresDestination};
use nimbus_sync::logging;

use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info};

/// Chunks are larger than the incremental default: a full load runs once
/// and row count dominates.
const DEFAULT_CHUNK_SIZE: usize = 10_000;

#[derive(Parser, Debug)]
#[command(name = "bootstrap_load", about = "Full load of the NIMBUS analytics replica")]
struct Args {
    /// Only load readings at or after this instant
    #[arg(long, value_parser = parse_timestamp)]
    from: Option<DateTime<Utc>>,

    /// Load even if the destination already holds data
    #[arg(long)]
    force: bool,

    /// Rows per destination transaction
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

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

    println!("🌧  NIMBUS Full Load");
    println!("================================\n");

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
    if let Err(e) = config.settings.validate() {
        eprintln!("\n❌ Configuration error: {}\n", e);
        return ExitCode::from(2);
    }

    match run(&args, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "full load failed");
            eprintln!("\n❌ Full load failed: {}\n", e);
            eprintln!("   Chunks committed before the failure are kept; re-run to continue.\n");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the load was refused.
fn run(args: &Args, config: &SyncConfig) -> Result<bool> {
    let variant = config.settings.variant;
    let table = config.settings.table_name();

    println!("📊 Checking connections...");
    let mut source = PostgresSource::new(config.source.clone(), variant);
    source.ping()?;
    println!("   ✓ Source: {}", config.source.label());
    let mut destination = PostgresDestination::new(config.destination.clone(), table.as_str(), variant);
    destination.ping()?;
    println!("   ✓ Destination: {}\n", config.destination.label());

    destination.ensure_table()?;

    if let Some(watermark) = destination.read_watermark()? {
        if !args.force {
            println!("⚠ {} already holds data up to {}.", table, watermark);
            println!("   Incremental sync will continue from there. Use --force to reload anyway.");
            return Ok(false);
        }
        println!("⚠ {} already holds data up to {}; reloading (--force)\n", table, watermark);
    }

    let filter = match args.from {
        Some(from) => ExtractFilter::all().from(from),
        None => ExtractFilter::all(),
    };

    println!("📥 Loading {} readings into {}", variant, table);
    match args.from {
        Some(from) => println!("   From: {}", from),
        None => println!("   From: beginning of source history"),
    }
    println!("   Chunk size: {}\n", args.chunk_size);
    info!(%variant, %table, chunk_size = args.chunk_size, from = ?args.from, "full load starting");

    let started = Instant::now();
    let chunks = source.extract(&filter, args.chunk_size)?;
    let total = upsert::upsert_chunks(&mut destination, chunks, |commit| {
        let period = match (commit.first, commit.last) {
            (Some(first), Some(last)) => format!("{} → {}", first, last),
            _ => String::from("-"),
        };
        println!(
            "   ✓ Chunk {}: {} rows ({} total) {}",
            commit.index, commit.rows, commit.total, period
        );
        info!(chunk = commit.index, rows = commit.rows, total = commit.total, "chunk committed");
    })?;
    let elapsed = started.elapsed();

    println!("\n🎉 FULL LOAD COMPLETE");
    println!("================================");
    println!("Rows upserted:    {}", total);
    println!("Elapsed:          {:.1} s", elapsed.as_secs_f64());
    if elapsed.as_secs_f64() > 0.0 {
        println!("Throughput:       {:.0} rows/s", total as f64 / elapsed.as_secs_f64());
    }
    println!("Rows in table:    {}", destination.row_count()?);
    if let Some((first, last)) = destination.time_range()? {
        println!("Stored period:    {} → {}", first, last);
    }
    info!(rows = total, elapsed_ms = elapsed.as_millis() as u64, "full load complete");

    Ok(true)
}
