/// Idempotent upserter.
///
/// Writes canonical readings into the destination keyed by
/// `(timestamp, station_id)`. A key that already exists is overwritten with
/// the incoming values, so replaying any set of readings converges to the
/// same destination state. Each chunk is one transaction: after a failure the
/// destination holds every earlier chunk and nothing of the failed one.

use chrono::{DateTime, Utc};
use postgres::Client;
use postgres::types::ToSql;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::DbParams;
use crate::db::{self, ManagedClient};
use crate::extract::{self, ExtractFilter, QueryParam};
use crate::model::{Reading, ReadingKey, Result, SyncError, Variant};

/// Rows per INSERT statement inside a chunk transaction. Keeps the bind
/// parameter count well below PostgreSQL's 65535 limit.
const ROWS_PER_STATEMENT: usize = 1_000;

/// Anything canonical readings can be upserted into.
pub trait Destination {
    /// The latest reading timestamp present, `None` when there is no data
    /// (including when the table doesn't exist yet).
    ///
    /// # Errors
    /// `Connection` when the store is unreachable. Never reported as `None`.
    fn read_watermark(&mut self) -> Result<Option<DateTime<Utc>>>;

    /// Writes one chunk atomically and returns the number of readings written.
    /// Duplicate keys within the chunk resolve to the last occurrence.
    fn upsert_chunk(&mut self, rows: &[Reading]) -> Result<usize>;
}

/// Progress reported after each committed chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCommit {
    /// 1-based chunk number.
    pub index: usize,
    pub rows: usize,
    /// Rows committed so far, this chunk included.
    pub total: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// Re-cuts a chunk sequence so that no timestamp spans two chunks.
///
/// The watermark resumes strictly after the newest committed timestamp, so a
/// chunk that commits only some stations of an instant would lose the rest
/// on resume. Leading rows of a chunk that share the previous chunk's last
/// timestamp are moved into the previous chunk. Input must be in key order.
pub struct TimestampAligned<I> {
    inner: I,
    pending: Option<Vec<Reading>>,
}

impl<I> TimestampAligned<I>
where
    I: Iterator<Item = Result<Vec<Reading>>>,
{
    pub fn new(inner: I) -> Self {
        Self { inner, pending: None }
    }
}

impl<I> Iterator for TimestampAligned<I>
where
    I: Iterator<Item = Result<Vec<Reading>>>,
{
    type Item = Result<Vec<Reading>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut current = match self.pending.take() {
            Some(chunk) => chunk,
            None => match self.inner.next()? {
                Ok(chunk) => chunk,
                Err(e) => return Some(Err(e)),
            },
        };

        loop {
            let Some(last) = current.last().map(|r| r.timestamp) else {
                return Some(Ok(current));
            };

            match self.inner.next() {
                None => return Some(Ok(current)),
                // current may be incomplete; drop it and let the error end the run
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(mut next)) => {
                    let same_instant = next.iter().take_while(|r| r.timestamp == last).count();
                    current.extend(next.drain(..same_instant));
                    if !next.is_empty() {
                        self.pending = Some(next);
                        return Some(Ok(current));
                    }
                }
            }
        }
    }
}

/// Upserts chunks in order, one transaction each, reporting every commit.
///
/// Chunks are first re-cut with `TimestampAligned`, so a chunk may run a
/// few rows over its nominal size. Returns the total rows written. A chunk
/// that fails to write is reported as `PartialWrite`, with the rows
/// committed before it; an error yielded by the chunk sequence itself is
/// returned unchanged.
pub fn upsert_chunks<D, I>(dest: &mut D, chunks: I, mut on_commit: impl FnMut(&ChunkCommit)) -> Result<usize>
where
    D: Destination + ?Sized,
    I: IntoIterator<Item = Result<Vec<Reading>>>,
{
    let mut total = 0;

    for (idx, chunk) in TimestampAligned::new(chunks.into_iter()).enumerate() {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }

        let written = dest
            .upsert_chunk(&chunk)
            .map_err(|e| SyncError::partial_write(idx + 1, chunk.len(), total, e))?;
        total += written;

        on_commit(&ChunkCommit {
            index: idx + 1,
            rows: written,
            total,
            first: chunk.first().map(|r| r.timestamp),
            last: chunk.last().map(|r| r.timestamp),
        });
    }

    Ok(total)
}

/// Upserts a slice in chunks of `chunk_size`.
pub fn upsert_all<D: Destination + ?Sized>(dest: &mut D, rows: &[Reading], chunk_size: usize) -> Result<usize> {
    let chunks = rows.chunks(chunk_size.max(1)).map(|c| Ok(c.to_vec()));
    upsert_chunks(dest, chunks, |_| {})
}

/// Collapses duplicate keys, last occurrence wins. `ON CONFLICT DO UPDATE`
/// refuses to touch the same row twice in one statement.
pub fn last_per_key(rows: &[Reading]) -> Vec<&Reading> {
    let mut by_key: BTreeMap<ReadingKey, &Reading> = BTreeMap::new();
    for row in rows {
        by_key.insert(row.key(), row);
    }
    by_key.into_values().collect()
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

pub fn create_table_sql(table: &str, variant: Variant) -> String {
    let measurements: Vec<String> = variant
        .measurement_columns()
        .iter()
        .map(|c| format!("{} NUMERIC", c))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} ( \
            ts TIMESTAMPTZ NOT NULL, \
            station_id INTEGER NOT NULL, \
            station_name VARCHAR(255), \
            {}, \
            PRIMARY KEY (ts, station_id) \
         )",
        table,
        measurements.join(", ")
    )
}

/// Multi-row upsert for `rows` readings.
pub fn upsert_sql(table: &str, variant: Variant, rows: usize) -> String {
    let cols = variant.measurement_columns();
    let width = 3 + cols.len();

    let tuples: Vec<String> = (0..rows)
        .map(|r| {
            let placeholders: Vec<String> = (1..=width).map(|c| format!("${}", r * width + c)).collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let updates: Vec<String> = std::iter::once("station_name")
        .chain(cols.iter().copied())
        .map(|c| format!("{} = EXCLUDED.{}", c, c))
        .collect();

    format!(
        "INSERT INTO {} (ts, station_id, station_name, {}) VALUES {} \
         ON CONFLICT (ts, station_id) DO UPDATE SET {}",
        table,
        cols.join(", "),
        tuples.join(", "),
        updates.join(", ")
    )
}

fn select_sql(table: &str, variant: Variant) -> String {
    let casts: Vec<String> = variant
        .measurement_columns()
        .iter()
        .map(|c| format!("{}::numeric", c))
        .collect();
    format!("SELECT ts, station_id, station_name, {} FROM {}", casts.join(", "), table)
}

// ---------------------------------------------------------------------------
// PostgreSQL destination
// ---------------------------------------------------------------------------

/// The analytics replica table.
pub struct PostgresDestination {
    conn: ManagedClient,
    table: String,
    variant: Variant,
}

impl PostgresDestination {
    pub fn new(params: DbParams, table: impl Into<String>, variant: Variant) -> Self {
        Self {
            conn: ManagedClient::new(params),
            table: table.into(),
            variant,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn ping(&mut self) -> Result<()> {
        self.conn.ping()
    }

    /// Creates the destination table if it is missing.
    pub fn ensure_table(&mut self) -> Result<()> {
        let sql = create_table_sql(&self.table, self.variant);
        self.conn.run("creating destination table", |c| c.batch_execute(&sql))?;
        info!(table = %self.table, "destination table ready");
        Ok(())
    }

    pub fn table_exists(&mut self) -> Result<bool> {
        let table = self.table.clone();
        db::table_exists(self.conn.client()?, &table)
    }

    pub fn row_count(&mut self) -> Result<i64> {
        if !self.table_exists()? {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        self.conn
            .run("counting destination rows", |c| c.query_one(sql.as_str(), &[]))
            .map(|row| row.get(0))
    }

    /// True when the table is absent or holds no rows.
    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.read_watermark()?.is_none())
    }

    /// Earliest and latest timestamps present.
    pub fn time_range(&mut self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        if !self.table_exists()? {
            return Ok(None);
        }
        let sql = format!("SELECT MIN(ts), MAX(ts) FROM {}", self.table);
        let row = self.conn.run("reading destination time range", |c| c.query_one(sql.as_str(), &[]))?;
        let first: Option<DateTime<Utc>> = row.get(0);
        let last: Option<DateTime<Utc>> = row.get(1);
        Ok(first.zip(last))
    }

    /// Stored readings matching `filter`, in key order.
    pub fn fetch(&mut self, filter: &ExtractFilter) -> Result<Vec<Reading>> {
        if !self.table_exists()? {
            return Ok(Vec::new());
        }

        let mut params = Vec::new();
        let filter_sql = extract::where_clause(filter, "ts", "station_id", &mut params);
        let sql = format!(
            "{} {} ORDER BY ts, station_id",
            select_sql(&self.table, self.variant),
            filter_sql
        );
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(QueryParam::as_sql).collect();

        let rows = self.conn.run("reading destination rows", |c| c.query(sql.as_str(), &refs))?;
        rows.iter()
            .map(|row| extract::reading_from_row(row, self.variant))
            .collect()
    }
}

impl Destination for PostgresDestination {
    fn read_watermark(&mut self) -> Result<Option<DateTime<Utc>>> {
        let table = self.table.clone();
        let client = self.conn.client()?;
        crate::watermark::max_timestamp(client, &table)
    }

    fn upsert_chunk(&mut self, rows: &[Reading]) -> Result<usize> {
        let rows = last_per_key(rows);
        if rows.is_empty() {
            return Ok(0);
        }
        if let Some(wrong) = rows.iter().find(|r| r.measurements.variant() != self.variant) {
            return Err(SyncError::query(
                "upserting chunk",
                format!("{} reading for a {} table", wrong.measurements.variant(), self.variant),
            ));
        }

        let table = self.table.clone();
        let variant = self.variant;
        let written = self
            .conn
            .run("upserting chunk", |client| write_chunk(client, &table, variant, &rows))?;

        debug!(table = %self.table, rows = written, "chunk committed");
        Ok(written)
    }
}

/// One transaction for the whole chunk; dropping it uncommitted rolls back.
fn write_chunk(
    client: &mut Client,
    table: &str,
    variant: Variant,
    rows: &[&Reading],
) -> std::result::Result<usize, postgres::Error> {
    let mut txn = client.transaction()?;

    for batch in rows.chunks(ROWS_PER_STATEMENT) {
        let sql = upsert_sql(table, variant, batch.len());

        let values: Vec<Vec<&Option<Decimal>>> = batch.iter().map(|r| r.measurements.values()).collect();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(batch.len() * (3 + variant.measurement_columns().len()));
        for (reading, measurements) in batch.iter().zip(&values) {
            params.push(&reading.timestamp);
            params.push(&reading.station_id);
            params.push(&reading.station_name);
            for value in measurements {
                params.push(*value);
            }
        }

        txn.execute(sql.as_str(), &params)?;
    }

    txn.commit()?;
    Ok(rows.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDestination;
    use crate::model::{Measurements, RainfallMeasurements};
    use chrono::{Duration, TimeZone};

    fn reading(offset_minutes: i64, station: i32, h24: i64) -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(offset_minutes),
            station_id: station,
            station_name: format!("Station {}", station),
            measurements: Measurements::Rainfall(RainfallMeasurements {
                h24: Some(Decimal::from(h24)),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_upsert_sql_shape() {
        let sql = upsert_sql("rainfall_readings", Variant::Rainfall, 2);
        assert!(sql.starts_with("INSERT INTO rainfall_readings (ts, station_id, station_name, m05, m10, m15, h01, h04, h24, h96)"));
        assert!(sql.contains("($1, $2, $3, $4, $5, $6, $7, $8, $9, $10), ($11,"));
        assert!(sql.contains("$20)"));
        assert!(sql.contains("ON CONFLICT (ts, station_id) DO UPDATE SET station_name = EXCLUDED.station_name"));
        assert!(sql.ends_with("h96 = EXCLUDED.h96"));
    }

    #[test]
    fn test_create_table_sql_has_composite_key() {
        let sql = create_table_sql("meteorological_readings", Variant::Meteorological);
        assert!(sql.contains("ts TIMESTAMPTZ NOT NULL"));
        assert!(sql.contains("humidity NUMERIC"));
        assert!(sql.contains("PRIMARY KEY (ts, station_id)"));
    }

    #[test]
    fn test_last_per_key_keeps_last_occurrence() {
        let rows = vec![reading(0, 1, 5), reading(5, 1, 7), reading(0, 1, 9)];
        let collapsed = last_per_key(&rows);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0], &rows[2]);
    }

    #[test]
    fn test_chunks_never_split_a_timestamp() {
        // three stations per instant, chunks of 4 cut through instants
        let rows: Vec<Reading> = (0..9).map(|i| reading((i / 3) * 5, (i % 3) as i32, i)).collect();
        let chunks = rows.chunks(4).map(|c| Ok(c.to_vec()));

        let sizes: Vec<usize> = TimestampAligned::new(chunks).map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![6, 3]);
    }

    #[test]
    fn test_alignment_keeps_chunks_of_distinct_instants() {
        let rows: Vec<Reading> = (0..7).map(|i| reading(i * 5, 1, i)).collect();
        let chunks = rows.chunks(3).map(|c| Ok(c.to_vec()));

        let sizes: Vec<usize> = TimestampAligned::new(chunks).map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_alignment_passes_errors_through() {
        let rows: Vec<Reading> = (0..3).map(|i| reading(i * 5, 1, i)).collect();
        let chunks = vec![Ok(rows.clone()), Err(SyncError::connection("fetching source chunk", "reset"))];

        let mut aligned = TimestampAligned::new(chunks.into_iter());
        assert!(aligned.next().unwrap().is_err());
    }

    #[test]
    fn test_upsert_chunks_reports_commits() {
        let rows: Vec<Reading> = (0..7).map(|i| reading(i * 5, 1, i)).collect();
        let mut dest = MemoryDestination::new();
        let mut commits = Vec::new();

        let chunks = rows.chunks(3).map(|c| Ok(c.to_vec()));
        let total = upsert_chunks(&mut dest, chunks, |c| commits.push(c.clone())).unwrap();

        assert_eq!(total, 7);
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[2].index, 3);
        assert_eq!(commits[2].rows, 1);
        assert_eq!(commits[2].total, 7);
        assert_eq!(commits[0].first, Some(rows[0].timestamp));
    }

    #[test]
    fn test_failed_chunk_becomes_partial_write() {
        let rows: Vec<Reading> = (0..10).map(|i| reading(i * 5, 1, i)).collect();
        let mut dest = MemoryDestination::new();
        dest.fail_after_rows(6, SyncError::connection("upserting chunk", "server closed the connection"));

        let err = upsert_all(&mut dest, &rows, 4).unwrap_err();
        match err {
            SyncError::PartialWrite { chunk, rows, committed_rows, .. } => {
                assert_eq!(chunk, 2);
                assert_eq!(rows, 4);
                assert_eq!(committed_rows, 4);
            }
            other => panic!("expected PartialWrite, got {:?}", other),
        }
        assert_eq!(dest.len(), 4, "failed chunk must leave nothing behind");
    }
}
