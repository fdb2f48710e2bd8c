#!/usr/bin/env rust
//! Source diagnostics.
//!
//! Summarizes what the extractor will see in the NIMBUS source: row volumes
//! before and after joining, the covered period, how many (timestamp,
//! station) keys have more than one physical row, and rows per year.
//! Only the source connection is needed.
//!
//! Usage:
//!   cargo run --bin diagnose_source
//!   cargo run --bin diagnose_source -- --variant meteorological --json

use nimbus_sync::config::{DbParams, Role, SyncSettings};
use nimbus_sync::diagnostics::{self, SourceDiagnostics};
use nimbus_sync::extract::PostgresSource;
use nimbus_sync::model::{Result, Variant};
use nimbus_sync::logging;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "diagnose_source", about = "Duplicate and volume diagnostics for the NIMBUS source")]
struct Args {
    /// Reading family: rainfall or meteorological
    #[arg(long)]
    variant: Option<Variant>,

    /// Duplicate keys to list
    #[arg(long, default_value_t = 10)]
    examples: usize,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Settings file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_from_env();

    let lookup = |name: &str| std::env::var(name).ok();
    let loaded = SyncSettings::load(args.config.as_deref(), &lookup)
        .and_then(|mut settings| settings.apply_env(&lookup).map(|_| settings))
        .and_then(|settings| DbParams::from_lookup(Role::Source, &lookup).map(|params| (settings, params)));
    let (settings, params) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ Configuration error: {}\n", e);
            return ExitCode::from(2);
        }
    };
    let variant = args.variant.unwrap_or(settings.variant);

    let report = match run(params, variant, args.examples) {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "diagnostics failed");
            eprintln!("\n❌ Diagnostics failed: {}\n", e);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("❌ Could not serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_report(&report);
    }
    ExitCode::SUCCESS
}

fn run(params: DbParams, variant: Variant, examples: usize) -> Result<SourceDiagnostics> {
    let mut source = PostgresSource::new(params, variant);
    source.ping()?;
    diagnostics::diagnose(source.connection(), variant, examples)
}

fn print_report(report: &SourceDiagnostics) {
    println!("🔎 NIMBUS Source Diagnostics ({})", report.variant);
    println!("================================\n");

    println!("📊 Volumes");
    println!("   • Reading rows:        {}", report.physical_rows);
    println!("   • Rows with join:      {}", report.joined_rows);
    println!("   • Canonical readings:  {}", report.canonical_rows);
    println!("   • Superseded rows:     {}", report.superseded_rows());

    println!("\n📅 Period");
    match (report.first, report.last) {
        (Some(first), Some(last)) => println!("   {} → {}", first, last),
        _ => println!("   (no readings)"),
    }

    println!("\n🔍 Duplicate keys (same timestamp + station)");
    if report.duplicate_keys == 0 {
        println!("   ✓ None");
    } else {
        println!("   ⚠ {} keys have more than one row; the latest source id is kept", report.duplicate_keys);
        for dup in &report.duplicate_examples {
            println!(
                "      - {} | station {}: {} rows",
                dup.key.timestamp, dup.key.station_id, dup.rows
            );
        }
    }

    println!("\n📈 Rows per year");
    for year in &report.yearly {
        println!("   • {}: {}", year.year, year.rows);
    }
}
