/// Source diagnostics: volumes, date range, duplicate keys, yearly counts.
///
/// Run before a full load to see what the extractor will collapse.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::ManagedClient;
use crate::extract::source_relation;
use crate::model::{ReadingKey, Result, SourceRow, Variant};

/// A key with more than one physical source row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateKey {
    pub key: ReadingKey,
    pub rows: i64,
    /// Source id the extractor keeps. Not known for database summaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kept_source_row_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearCount {
    pub year: i32,
    pub rows: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceDiagnostics {
    pub variant: Variant,
    /// Reading rows before joining measurements and stations.
    pub physical_rows: i64,
    /// Rows with measurements and a known station.
    pub joined_rows: i64,
    /// Distinct keys, i.e. rows after deduplication.
    pub canonical_rows: i64,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    pub duplicate_keys: i64,
    pub duplicate_examples: Vec<DuplicateKey>,
    pub yearly: Vec<YearCount>,
}

impl SourceDiagnostics {
    /// Physical rows the extractor drops.
    pub fn superseded_rows(&self) -> i64 {
        self.joined_rows - self.canonical_rows
    }
}

/// Diagnoses physical rows already in memory. Examples are the keys with
/// the most rows, at most `examples` of them.
pub fn diagnose_rows(variant: Variant, rows: &[SourceRow], examples: usize) -> SourceDiagnostics {
    let mut groups: BTreeMap<ReadingKey, (i64, i64)> = BTreeMap::new();
    let mut yearly: BTreeMap<i32, i64> = BTreeMap::new();

    for row in rows {
        let entry = groups.entry(row.reading.key()).or_insert((0, row.source_row_id));
        entry.0 += 1;
        entry.1 = entry.1.max(row.source_row_id);
        *yearly.entry(row.reading.timestamp.year()).or_default() += 1;
    }

    let mut duplicates: Vec<DuplicateKey> = groups
        .iter()
        .filter(|(_, (count, _))| *count > 1)
        .map(|(key, (count, kept))| DuplicateKey {
            key: *key,
            rows: *count,
            kept_source_row_id: Some(*kept),
        })
        .collect();
    let duplicate_keys = duplicates.len() as i64;
    // stable sort keeps key order among equal counts
    duplicates.sort_by(|a, b| b.rows.cmp(&a.rows));
    duplicates.truncate(examples);

    SourceDiagnostics {
        variant,
        physical_rows: rows.len() as i64,
        joined_rows: rows.len() as i64,
        canonical_rows: groups.len() as i64,
        first: groups.keys().next().map(|k| k.timestamp),
        last: groups.keys().next_back().map(|k| k.timestamp),
        duplicate_keys,
        duplicate_examples: duplicates,
        yearly: yearly.into_iter().map(|(year, rows)| YearCount { year, rows }).collect(),
    }
}

/// Runs the diagnostic queries against the source database.
pub fn diagnose(conn: &mut ManagedClient, variant: Variant, examples: usize) -> Result<SourceDiagnostics> {
    let relation = source_relation(variant);
    let limit = examples as i64;

    let physical_rows: i64 = conn
        .run("counting source readings", |c| {
            c.query_one("SELECT COUNT(*) FROM public.estacoes_leitura", &[])
        })?
        .get(0);

    let summary_sql = format!(
        "SELECT COUNT(*), COUNT(DISTINCT (el.\"horaLeitura\", el.estacao_id)), \
            MIN(el.\"horaLeitura\")::timestamptz, MAX(el.\"horaLeitura\")::timestamptz \
         FROM {}",
        relation
    );
    let summary = conn.run("summarizing joined source rows", |c| c.query_one(summary_sql.as_str(), &[]))?;

    let duplicates_sql = format!(
        "SELECT el.\"horaLeitura\"::timestamptz, el.estacao_id::integer, COUNT(*) \
         FROM {} \
         GROUP BY el.\"horaLeitura\", el.estacao_id \
         HAVING COUNT(*) > 1 \
         ORDER BY COUNT(*) DESC, el.\"horaLeitura\", el.estacao_id",
        relation
    );
    let duplicate_keys: i64 = conn
        .run("counting duplicate keys", |c| {
            c.query_one(format!("SELECT COUNT(*) FROM ({}) AS dups", duplicates_sql).as_str(), &[])
        })?
        .get(0);
    let duplicate_examples = conn
        .run("listing duplicate keys", |c| {
            c.query(format!("{} LIMIT $1", duplicates_sql).as_str(), &[&limit])
        })?
        .iter()
        .map(|row| DuplicateKey {
            key: ReadingKey {
                timestamp: row.get(0),
                station_id: row.get(1),
            },
            rows: row.get(2),
            kept_source_row_id: None,
        })
        .collect();

    let yearly_sql = format!(
        "SELECT EXTRACT(YEAR FROM el.\"horaLeitura\")::integer AS year, COUNT(*) \
         FROM {} \
         GROUP BY year \
         ORDER BY year",
        relation
    );
    let yearly = conn
        .run("counting source rows per year", |c| c.query(yearly_sql.as_str(), &[]))?
        .iter()
        .map(|row| YearCount {
            year: row.get(0),
            rows: row.get(1),
        })
        .collect();

    Ok(SourceDiagnostics {
        variant,
        physical_rows,
        joined_rows: summary.get(0),
        canonical_rows: summary.get(1),
        first: summary.get(2),
        last: summary.get(3),
        duplicate_keys,
        duplicate_examples,
        yearly,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Measurements, RainfallMeasurements, Reading};
    use chrono::TimeZone;

    fn row(id: i64, year: i32, station: i32) -> SourceRow {
        SourceRow {
            source_row_id: id,
            reading: Reading {
                timestamp: Utc.with_ymd_and_hms(year, 6, 1, 0, 0, 0).unwrap(),
                station_id: station,
                station_name: "Tijuca".to_string(),
                measurements: Measurements::Rainfall(RainfallMeasurements::default()),
            },
        }
    }

    #[test]
    fn test_diagnose_rows_counts_duplicates() {
        let rows = vec![row(1, 2009, 14), row(7, 2009, 14), row(3, 2009, 14), row(2, 2009, 3), row(4, 2010, 3), row(5, 2010, 3)];
        let report = diagnose_rows(Variant::Rainfall, &rows, 10);

        assert_eq!(report.joined_rows, 6);
        assert_eq!(report.canonical_rows, 3);
        assert_eq!(report.superseded_rows(), 3);
        assert_eq!(report.duplicate_keys, 2);
        assert_eq!(report.duplicate_examples[0].rows, 3);
        assert_eq!(report.duplicate_examples[0].kept_source_row_id, Some(7));
        assert_eq!(report.yearly, vec![YearCount { year: 2009, rows: 4 }, YearCount { year: 2010, rows: 2 }]);
    }

    #[test]
    fn test_examples_are_capped() {
        let rows = vec![row(1, 2009, 1), row(2, 2009, 1), row(3, 2009, 2), row(4, 2009, 2)];
        let report = diagnose_rows(Variant::Rainfall, &rows, 1);
        assert_eq!(report.duplicate_keys, 2);
        assert_eq!(report.duplicate_examples.len(), 1);
    }

    #[test]
    fn test_report_serializes() {
        let report = diagnose_rows(Variant::Meteorological, &[row(1, 2020, 1)], 5);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["variant"], "meteorological");
        assert_eq!(json["canonical_rows"], 1);
    }
}
