/// Reading, ReadingKey, Measurements, SyncError
/// core data structures and error handling
///
/// Core data types for the NIMBUS sync service.
///
/// This module defines the shared domain model imported by all other modules.
/// It contains no I/O: only types, the key ordering every other module relies
/// on, and the crate-wide error taxonomy.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::ConfigError;

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Which family of sensor readings a source query and destination table carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Rolling rainfall accumulations from the rain gauges.
    #[default]
    Rainfall,
    /// Instantaneous weather-station sensor values.
    Meteorological,
}

/// Destination column names for the rainfall accumulations, in select order.
pub const RAINFALL_COLUMNS: &[&str] = &["m05", "m10", "m15", "h01", "h04", "h24", "h96"];

/// Destination column names for the weather-station sensors, in select order.
pub const METEOROLOGICAL_COLUMNS: &[&str] = &[
    "rain",
    "wind_direction",
    "wind_speed",
    "temperature",
    "pressure",
    "humidity",
];

impl Variant {
    /// Measurement column names, in the order values travel through queries.
    pub fn measurement_columns(&self) -> &'static [&'static str] {
        match self {
            Variant::Rainfall => RAINFALL_COLUMNS,
            Variant::Meteorological => METEOROLOGICAL_COLUMNS,
        }
    }

    /// Destination table used when the settings don't name one.
    pub fn default_table(&self) -> &'static str {
        match self {
            Variant::Rainfall => "rainfall_readings",
            Variant::Meteorological => "meteorological_readings",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Rainfall => write!(f, "rainfall"),
            Variant::Meteorological => write!(f, "meteorological"),
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rainfall" | "rain" => Ok(Variant::Rainfall),
            "meteorological" | "weather" => Ok(Variant::Meteorological),
            other => Err(format!(
                "unknown variant '{}' (expected 'rainfall' or 'meteorological')",
                other
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

/// The logical identity of a reading: one measurement instant at one station.
///
/// Field order matters: the derived `Ord` sorts by timestamp first, then by
/// station, which is the order readings are extracted and upserted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ReadingKey {
    pub timestamp: DateTime<Utc>,
    pub station_id: i32,
}

/// Rolling rainfall accumulations, in millimetres.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RainfallMeasurements {
    pub m05: Option<Decimal>,
    pub m10: Option<Decimal>,
    pub m15: Option<Decimal>,
    pub h01: Option<Decimal>,
    pub h04: Option<Decimal>,
    pub h24: Option<Decimal>,
    pub h96: Option<Decimal>,
}

/// Instantaneous weather-station sensor values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeteorologicalMeasurements {
    pub rain: Option<Decimal>,
    pub wind_direction: Option<Decimal>,
    pub wind_speed: Option<Decimal>,
    pub temperature: Option<Decimal>,
    pub pressure: Option<Decimal>,
    pub humidity: Option<Decimal>,
}

/// The measurement payload of a reading. Every field is nullable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Measurements {
    Rainfall(RainfallMeasurements),
    Meteorological(MeteorologicalMeasurements),
}

impl Measurements {
    pub fn variant(&self) -> Variant {
        match self {
            Measurements::Rainfall(_) => Variant::Rainfall,
            Measurements::Meteorological(_) => Variant::Meteorological,
        }
    }

    /// Borrowed field values in `Variant::measurement_columns` order.
    pub fn values(&self) -> Vec<&Option<Decimal>> {
        match self {
            Measurements::Rainfall(m) => vec![&m.m05, &m.m10, &m.m15, &m.h01, &m.h04, &m.h24, &m.h96],
            Measurements::Meteorological(m) => vec![
                &m.rain,
                &m.wind_direction,
                &m.wind_speed,
                &m.temperature,
                &m.pressure,
                &m.humidity,
            ],
        }
    }

    /// Rebuilds a payload from values in `Variant::measurement_columns` order.
    ///
    /// # Errors
    /// `SyncError::Query` when the number of values doesn't match the variant,
    /// which means a query and the model disagree about the column list.
    pub fn from_values(variant: Variant, values: Vec<Option<Decimal>>) -> Result<Self> {
        let expected = variant.measurement_columns().len();
        if values.len() != expected {
            return Err(SyncError::query(
                "decoding measurements",
                format!("{} variant expects {} values, got {}", variant, expected, values.len()),
            ));
        }

        let mut v = values.into_iter();
        let mut next = || v.next().flatten();

        Ok(match variant {
            Variant::Rainfall => Measurements::Rainfall(RainfallMeasurements {
                m05: next(),
                m10: next(),
                m15: next(),
                h01: next(),
                h04: next(),
                h24: next(),
                h96: next(),
            }),
            Variant::Meteorological => Measurements::Meteorological(MeteorologicalMeasurements {
                rain: next(),
                wind_direction: next(),
                wind_speed: next(),
                temperature: next(),
                pressure: next(),
                humidity: next(),
            }),
        })
    }
}

/// One canonical sensor reading, as stored in the destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub station_id: i32,
    /// Display name joined in at read time; not authoritative.
    pub station_name: String,
    pub measurements: Measurements,
}

impl Reading {
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            timestamp: self.timestamp,
            station_id: self.station_id,
        }
    }
}

/// A physical row from the origin store. Several rows may share one key;
/// `source_row_id` decides which of them is canonical and is never written
/// downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub source_row_id: i64,
    pub reading: Reading,
}

// ---------------------------------------------------------------------------
// Timestamp parsing
// ---------------------------------------------------------------------------

/// Parses a command-line timestamp.
///
/// Accepts RFC 3339 (`2009-02-16T02:12:20-02:00`), a space-separated form
/// with an offset (`2009-02-16 02:12:20-02:00`), and the offset-less forms
/// `2009-02-16 02:12:20` and `2009-02-16`, which are taken as UTC.
pub fn parse_timestamp(input: &str) -> std::result::Result<DateTime<Utc>, String> {
    let s = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }

    Err(format!(
        "invalid timestamp '{}' (expected e.g. 2009-02-16T02:12:20-02:00, 2009-02-16 02:12:20 or 2009-02-16)",
        input
    ))
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Result type alias using `SyncError`.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Every failure the sync core can report.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A required setting is missing or malformed. Fatal at startup.
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// Source or destination unreachable. Recoverable.
    #[error("connection error while {context}: {message}")]
    Connection { context: String, message: String },

    /// A query could not execute. Indicates a defect; never retried.
    #[error("query error while {context}: {message}")]
    Query { context: String, message: String },

    /// A chunk failed mid-upsert and its transaction was rolled back.
    /// `committed_rows` rows from earlier chunks remain in the destination.
    #[error("chunk {chunk} ({rows} rows) rolled back after {committed_rows} committed rows: {source}")]
    PartialWrite {
        chunk: usize,
        rows: usize,
        committed_rows: usize,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    pub fn connection(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Connection {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn query(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Query {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn partial_write(chunk: usize, rows: usize, committed_rows: usize, cause: SyncError) -> Self {
        Self::PartialWrite {
            chunk,
            rows,
            committed_rows,
            source: Box::new(cause),
        }
    }

    /// Only connection-level failures are retried. A rolled-back chunk is
    /// retryable when the failure behind it was.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Connection { .. } => true,
            SyncError::PartialWrite { source, .. } => source.is_retryable(),
            SyncError::Configuration(_) | SyncError::Query { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
