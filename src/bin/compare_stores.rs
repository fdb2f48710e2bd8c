#!/usr/bin/env rust
//! Source vs replica consistency check.
//!
//! For a time window, compares the canonical (deduplicated) source readings
//! with the destination rows key by key and lists readings missing from the
//! replica, rows the source no longer has, and value mismatches.
//!
//! Exit code 1 when any discrepancy is found, so it can gate a scheduled job.
//! Discrepancies inside the window can be repaired with resync_period.
//!
//! Usage:
//!   cargo run --bin compare_stores -- --from 2024-03-01 --to 2024-03-31
//!   cargo run --bin compare_stores -- --from 2009-02-16 --to 2009-02-17 --station 14 --json

use nimbus_sync::config::SyncConfig;
use nimbus_sync::extract::{ExtractFilter, PostgresSource, Source};
use nimbus_sync::model::{parse_timestamp, Reading, Result, Variant};
use nimbus_sync::upsert::PostgresDestination;
use nimbus_sync::verify::{self, Comparison};
use nimbus_sync::logging;

use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};

const READ_CHUNK: usize = 10_000;

#[derive(Parser, Debug)]
#[command(name = "compare_stores", about = "Compare NIMBUS source readings with the replica")]
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

    /// Discrepancies to list per kind
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Print the full comparison as JSON on stdout
    #[arg(long)]
    json: bool,

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
    if let Err(e) = config.settings.validate() {
        eprintln!("\n❌ Configuration error: {}\n", e);
        return ExitCode::from(2);
    }

    let comparison = match run(&args, &config) {
        Ok(comparison) => comparison,
        Err(e) => {
            error!(error = %e, "comparison failed");
            eprintln!("\n❌ Comparison failed: {}\n", e);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&comparison) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("❌ Could not serialize comparison: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_comparison(&comparison, args.limit);
    }

    if comparison.is_consistent() {
        ExitCode::SUCCESS
    } else {
        warn!(discrepancies = comparison.discrepancies(), "stores differ");
        ExitCode::FAILURE
    }
}

fn run(args: &Args, config: &SyncConfig) -> Result<Comparison> {
    let variant = config.settings.variant;

    let mut filter = ExtractFilter::window(args.from, args.to);
    if let Some(station) = args.station {
        filter = filter.station(station);
    }

    let mut source = PostgresSource::new(config.source.clone(), variant);
    source.ping()?;
    let mut destination = PostgresDestination::new(config.destination.clone(), config.settings.table_name(), variant);
    destination.ping()?;

    let mut source_rows: Vec<Reading> = Vec::new();
    for chunk in source.extract(&filter, READ_CHUNK)? {
        source_rows.extend(chunk?);
    }
    let destination_rows = destination.fetch(&filter)?;

    Ok(verify::compare(&source_rows, &destination_rows))
}

fn print_comparison(comparison: &Comparison, limit: usize) {
    println!("⚖  NIMBUS Store Comparison");
    println!("================================\n");
    println!("Source readings:       {}", comparison.source_rows);
    println!("Destination readings:  {}", comparison.destination_rows);
    println!("Matching:              {}", comparison.matched);

    if comparison.is_consistent() {
        println!("\n✓ Stores are consistent");
        return;
    }

    println!("\n⚠ {} discrepancies", comparison.discrepancies());

    if !comparison.missing.is_empty() {
        println!("\n   Missing in destination: {}", comparison.missing.len());
        for key in comparison.missing.iter().take(limit) {
            println!("      - {} | station {}", key.timestamp, key.station_id);
        }
    }
    if !comparison.extra.is_empty() {
        println!("\n   Only in destination: {}", comparison.extra.len());
        for key in comparison.extra.iter().take(limit) {
            println!("      - {} | station {}", key.timestamp, key.station_id);
        }
    }
    if !comparison.mismatched.is_empty() {
        println!("\n   Different values: {}", comparison.mismatched.len());
        for m in comparison.mismatched.iter().take(limit) {
            println!("      - {} | station {}", m.key.timestamp, m.key.station_id);
            println!("          source:      {:?}", m.source.measurements);
            println!("          destination: {:?}", m.destination.measurements);
        }
    }
    println!("\n💡 Repair a window with: resync_period --from <start> --to <end>");
}
