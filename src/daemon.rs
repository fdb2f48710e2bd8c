/// Sync driver: the incremental sync loop
///
/// One cycle:
/// 1. Reads the watermark from the destination
/// 2. Extracts canonical source readings strictly newer than it
/// 3. Upserts them chunk by chunk, one transaction per chunk
///
/// Connection failures are retried with exponential backoff before the cycle
/// is declared failed. Query failures are never retried. In continuous mode a
/// failed cycle is logged and the next tick starts fresh from the watermark,
/// which already reflects every chunk that committed.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::extract::{ExtractFilter, Source};
use crate::model::{Result, SyncError};
use crate::upsert::{self, Destination};
use crate::watermark;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Driver configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Pause between cycle starts in continuous mode (default: 5 minutes)
    pub interval: Duration,

    /// Rows per destination transaction (default: 5000)
    pub chunk_size: usize,

    /// Connection-failure retries within one cycle (default: 3)
    pub max_retries: u32,

    /// First retry delay, doubled on each further attempt (default: 2 seconds)
    pub retry_backoff: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            chunk_size: 5_000,
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

impl From<&SyncSettings> for DriverConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_seconds),
            chunk_size: settings.chunk_size,
            max_retries: settings.max_retries,
            retry_backoff: Duration::from_secs(settings.retry_backoff_seconds),
        }
    }
}

impl DriverConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    ReadingWatermark,
    Extracting,
    Upserting,
    /// Retries exhausted or a non-retryable error. Left on the next cycle.
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "IDLE",
            SyncState::ReadingWatermark => "READING_WATERMARK",
            SyncState::Extracting => "EXTRACTING",
            SyncState::Upserting => "UPSERTING",
            SyncState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub rows_synced: usize,
    pub chunks: usize,
    pub watermark_before: Option<DateTime<Utc>>,
    /// Latest timestamp written this cycle, or the previous watermark.
    pub watermark_after: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    /// The destination had no data and no `--since` was given.
    pub bootstrap_required: bool,
    /// Attempts used, 1 when nothing was retried.
    pub attempts: u32,
}

/// Totals for a bounded continuous run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub cycles: usize,
    pub failed_cycles: usize,
    pub rows_synced: usize,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Incremental sync from a `Source` into a `Destination`.
pub struct SyncDriver<S, D> {
    source: S,
    destination: D,
    config: DriverConfig,
    state: SyncState,
    since: Option<DateTime<Utc>>,
}

impl<S: Source, D: Destination> SyncDriver<S, D> {
    pub fn new(source: S, destination: D, config: DriverConfig) -> Self {
        Self {
            source,
            destination,
            config,
            state: SyncState::Idle,
            since: None,
        }
    }

    /// Starts the first successful cycle after `since` instead of the
    /// stored watermark. Later cycles use the watermark again.
    pub fn with_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    pub fn destination_mut(&mut self) -> &mut D {
        &mut self.destination
    }

    pub fn into_parts(self) -> (S, D) {
        (self.source, self.destination)
    }

    /// Runs one cycle and returns the number of rows synced.
    pub fn run_once(&mut self) -> Result<usize> {
        self.run_cycle().map(|report| report.rows_synced)
    }

    /// Runs one cycle with connection retries and returns its report.
    pub fn run_cycle(&mut self) -> Result<SyncReport> {
        let mut attempt = 1;

        loop {
            match self.cycle(attempt) {
                Ok(report) => {
                    self.since = None;
                    self.enter(SyncState::Idle);
                    log_report(&report);
                    return Ok(report);
                }
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "connection failure, retrying cycle"
                    );
                    self.enter(SyncState::Idle);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    self.enter(SyncState::Failed);
                    log_failure(&e, attempt);
                    return Err(e);
                }
            }
        }
    }

    fn cycle(&mut self, attempt: u32) -> Result<SyncReport> {
        let started = Instant::now();

        self.enter(SyncState::ReadingWatermark);
        let before = watermark::read_watermark(&mut self.destination)?;

        let Some(resume) = watermark::resume_point(before, self.since) else {
            return Ok(SyncReport {
                rows_synced: 0,
                chunks: 0,
                watermark_before: None,
                watermark_after: None,
                elapsed: started.elapsed(),
                bootstrap_required: true,
                attempts: attempt,
            });
        };

        self.enter(SyncState::Extracting);
        debug!(resume = %resume, "extracting readings newer than resume point");
        let chunks = self.source.extract(&ExtractFilter::after(resume), self.config.chunk_size)?;

        // chunks are pulled lazily, so extraction and upserting interleave from here
        self.state = SyncState::Upserting;
        let mut chunk_count = 0;
        let mut latest = before;
        let rows_synced = upsert::upsert_chunks(&mut self.destination, chunks, |commit| {
            chunk_count = commit.index;
            latest = latest.max(commit.last);
            info!(
                chunk = commit.index,
                rows = commit.rows,
                total = commit.total,
                last = ?commit.last,
                "chunk committed"
            );
        })?;

        Ok(SyncReport {
            rows_synced,
            chunks: chunk_count,
            watermark_before: before,
            watermark_after: latest,
            elapsed: started.elapsed(),
            bootstrap_required: false,
            attempts: attempt,
        })
    }

    /// Runs cycles forever, or `max_cycles` times when given. A failed cycle
    /// is logged and the loop continues on the next tick.
    pub fn run_continuous(&mut self, max_cycles: Option<usize>) -> RunSummary {
        info!(
            interval_s = self.config.interval.as_secs(),
            chunk_size = self.config.chunk_size,
            "starting continuous sync"
        );

        let mut summary = RunSummary::default();

        loop {
            let start = Instant::now();

            match self.run_cycle() {
                Ok(report) => summary.rows_synced += report.rows_synced,
                Err(_) => summary.failed_cycles += 1,
            }
            summary.cycles += 1;

            if max_cycles.is_some_and(|max| summary.cycles >= max) {
                return summary;
            }

            // Sleep until next tick
            let remaining = self.config.interval.saturating_sub(start.elapsed());
            if !remaining.is_zero() {
                debug!(sleep_ms = remaining.as_millis() as u64, "waiting for next cycle");
                std::thread::sleep(remaining);
            }
        }
    }

    fn enter(&mut self, next: SyncState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "state transition");
        }
        self.state = next;
    }
}

fn log_report(report: &SyncReport) {
    let elapsed_ms = report.elapsed.as_millis() as u64;

    if report.bootstrap_required {
        warn!("destination has no data; run bootstrap_load before incremental sync");
    } else if report.rows_synced == 0 {
        debug!(elapsed_ms, watermark = ?report.watermark_before, "no new readings");
    } else {
        info!(
            rows = report.rows_synced,
            chunks = report.chunks,
            elapsed_ms,
            watermark = ?report.watermark_after,
            "sync cycle complete"
        );
    }
}

fn log_failure(err: &SyncError, attempts: u32) {
    match err {
        SyncError::Connection { .. } => {
            error!(error = %err, attempts, "sync cycle failed: connection retries exhausted")
        }
        SyncError::PartialWrite { chunk, committed_rows, .. } => error!(
            error = %err,
            chunk,
            committed_rows,
            attempts,
            "sync cycle failed mid-upsert; committed chunks kept"
        ),
        SyncError::Query { .. } | SyncError::Configuration(_) => {
            error!(error = %err, "sync cycle failed: not retryable")
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDestination, MemorySource};

    fn fast_config() -> DriverConfig {
        DriverConfig {
            interval: Duration::ZERO,
            chunk_size: 100,
            max_retries: 2,
            retry_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_driver_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.chunk_size, 5_000);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = SyncSettings {
            interval_seconds: 60,
            chunk_size: 250,
            ..SyncSettings::default()
        };
        let config = DriverConfig::from(&settings);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.chunk_size, 250);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = DriverConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_empty_destination_requires_bootstrap() {
        let mut driver = SyncDriver::new(MemorySource::new(), MemoryDestination::new(), fast_config());
        let report = driver.run_cycle().unwrap();
        assert!(report.bootstrap_required);
        assert_eq!(report.rows_synced, 0);
        assert_eq!(driver.state(), SyncState::Idle);
        assert_eq!(driver.source().extract_calls(), 0, "no extraction without a resume point");
    }

    #[test]
    fn test_unreachable_destination_fails_after_retries() {
        let mut dest = MemoryDestination::new();
        dest.set_unreachable(true);
        let mut driver = SyncDriver::new(MemorySource::new(), dest, fast_config());

        let err = driver.run_once().unwrap_err();
        assert!(matches!(err, SyncError::Connection { .. }));
        assert_eq!(driver.state(), SyncState::Failed);
    }

    #[test]
    fn test_continuous_mode_survives_failed_cycles() {
        let mut dest = MemoryDestination::new();
        dest.set_unreachable(true);
        let mut driver = SyncDriver::new(MemorySource::new(), dest, fast_config());

        let summary = driver.run_continuous(Some(3));
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.failed_cycles, 3);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SyncState::ReadingWatermark.to_string(), "READING_WATERMARK");
        assert_eq!(SyncState::Failed.to_string(), "FAILED");
    }
}
