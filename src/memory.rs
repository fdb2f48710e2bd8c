/// In-memory source and destination.
///
/// Used by the test suites. Both honour the same contracts as the PostgreSQL implementations: the source
/// deduplicates by greatest source id, the destination upserts by key and
/// applies a chunk all-or-nothing. Failures can be injected to exercise
/// retry and rollback paths.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::extract::{self, ChunkIter, ExtractFilter, Source};
use crate::model::{Reading, ReadingKey, Result, SourceRow, SyncError};
use crate::upsert::Destination;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySource {
    rows: Vec<SourceRow>,
    unreachable: bool,
    connection_failures: usize,
    query_failure: Option<String>,
    extract_calls: usize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = SourceRow>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, row: SourceRow) {
        self.rows.push(row);
    }

    /// Rewrites a physical row in place, the way an operator correction does.
    /// Returns false when no row has that id.
    pub fn correct(&mut self, source_row_id: i64, update: impl FnOnce(&mut Reading)) -> bool {
        match self.rows.iter_mut().find(|r| r.source_row_id == source_row_id) {
            Some(row) => {
                update(&mut row.reading);
                true
            }
            None => false,
        }
    }

    pub fn set_unreachable(&mut self, unreachable: bool) {
        self.unreachable = unreachable;
    }

    /// The next `n` extractions fail with a connection error.
    pub fn fail_next_extracts(&mut self, n: usize) {
        self.connection_failures = n;
    }

    /// The next extraction fails with a query error.
    pub fn fail_next_query(&mut self, message: impl Into<String>) {
        self.query_failure = Some(message.into());
    }

    /// Extractions attempted so far, failed ones included.
    pub fn extract_calls(&self) -> usize {
        self.extract_calls
    }

    pub fn physical_rows(&self) -> &[SourceRow] {
        &self.rows
    }

    /// All canonical readings.
    pub fn canonical(&self) -> Vec<Reading> {
        extract::canonicalize(self.rows.iter().cloned())
    }
}

impl Source for MemorySource {
    fn extract(&mut self, filter: &ExtractFilter, chunk_size: usize) -> Result<ChunkIter<'_>> {
        self.extract_calls += 1;

        if self.unreachable {
            return Err(SyncError::connection("opening source transaction", "source unreachable"));
        }
        if self.connection_failures > 0 {
            self.connection_failures -= 1;
            return Err(SyncError::connection("opening source transaction", "connection reset by peer"));
        }
        if let Some(message) = self.query_failure.take() {
            return Err(SyncError::query("running extraction query", message));
        }

        let matching: Vec<Reading> = self
            .canonical()
            .into_iter()
            .filter(|r| filter.matches(&r.key()))
            .collect();
        let chunks: Vec<Result<Vec<Reading>>> = matching.chunks(chunk_size.max(1)).map(|c| Ok(c.to_vec())).collect();

        Ok(Box::new(chunks.into_iter()))
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MemoryDestination {
    rows: BTreeMap<ReadingKey, Reading>,
    table_present: bool,
    unreachable: bool,
    /// Rows that may still be written before the injected failure fires.
    fail_after: Option<(usize, SyncError)>,
    chunks_committed: usize,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            table_present: true,
            unreachable: false,
            fail_after: None,
            chunks_committed: 0,
        }
    }
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaves like a destination whose table was never created.
    pub fn without_table(mut self) -> Self {
        self.table_present = false;
        self
    }

    pub fn set_unreachable(&mut self, unreachable: bool) {
        self.unreachable = unreachable;
    }

    /// After `rows` more rows are written, the next row write fails with
    /// `error` and its chunk is rolled back. Fires once.
    pub fn fail_after_rows(&mut self, rows: usize, error: SyncError) {
        self.fail_after = Some((rows, error));
    }

    pub fn get(&self, key: &ReadingKey) -> Option<&Reading> {
        self.rows.get(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn chunks_committed(&self) -> usize {
        self.chunks_committed
    }

    /// Stored readings in key order.
    pub fn readings(&self) -> Vec<Reading> {
        self.rows.values().cloned().collect()
    }
}

impl Destination for MemoryDestination {
    fn read_watermark(&mut self) -> Result<Option<DateTime<Utc>>> {
        if self.unreachable {
            return Err(SyncError::connection("reading watermark", "destination unreachable"));
        }
        if !self.table_present {
            return Ok(None);
        }
        Ok(self.rows.keys().next_back().map(|k| k.timestamp))
    }

    fn upsert_chunk(&mut self, rows: &[Reading]) -> Result<usize> {
        if self.unreachable {
            return Err(SyncError::connection("upserting chunk", "destination unreachable"));
        }

        // staged separately so a failure leaves the committed rows untouched
        let mut staged: BTreeMap<ReadingKey, Reading> = BTreeMap::new();
        for row in rows {
            if matches!(self.fail_after, Some((0, _))) {
                if let Some((_, error)) = self.fail_after.take() {
                    return Err(error);
                }
            }
            if let Some((remaining, _)) = &mut self.fail_after {
                *remaining -= 1;
            }
            staged.insert(row.key(), row.clone());
        }

        let written = staged.len();
        self.table_present = true;
        self.rows.extend(staged);
        self.chunks_committed += 1;
        Ok(written)
    }
}
