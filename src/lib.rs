/// nimbus_sync: incremental replication of NIMBUS rain-gauge and weather
/// readings into an analytics PostgreSQL store.
///
/// # Module structure
///
/// ```text
/// nimbus_sync
/// ├── model       — shared data types (Reading, ReadingKey, Variant, SyncError, …)
/// ├── config      — connection parameters and tunables (env, .env, nimbus_sync.toml)
/// ├── db          — connections, reconnection, PostgreSQL error classification
/// ├── extract     — deduplicating extractor (DISTINCT ON key, latest source id)
/// ├── watermark   — max(timestamp) of the destination, resume point
/// ├── upsert      — idempotent chunked upserter (ON CONFLICT DO UPDATE)
/// ├── memory      — in-memory source/destination with failure injection
/// ├── daemon      — sync driver state machine, retries, continuous loop
/// ├── verify      — source vs destination comparison
/// ├── diagnostics — duplicate keys, ranges and yearly volumes in the source
/// └── logging     — tracing subscriber setup
/// ```

/// Public modules
pub mod config;
pub mod daemon;
pub mod db;
pub mod diagnostics;
pub mod extract;
pub mod logging;
pub mod memory;
pub mod model;
pub mod upsert;
pub mod verify;
pub mod watermark;

pub use config::SyncConfig;
pub use daemon::{DriverConfig, SyncDriver, SyncReport, SyncState};
pub use extract::{ExtractFilter, PostgresSource, Source};
pub use model::{Reading, ReadingKey, SyncError, Variant};
pub use upsert::{Destination, PostgresDestination};
