/// Watermark tracking.
///
/// The watermark is the greatest reading timestamp already present in the
/// destination. It is recomputed from the destination at the start of every
/// cycle and never stored anywhere else, so it can't drift from the data.

use chrono::{DateTime, Utc};
use postgres::Client;

use crate::db;
use crate::model::Result;
use crate::upsert::Destination;

/// Reads the current watermark of a destination.
///
/// `Ok(None)` means the destination holds no data (empty or missing table)
/// and a bootstrap load is required. An unreachable destination is an
/// error, never `None`.
pub fn read_watermark<D: Destination + ?Sized>(dest: &mut D) -> Result<Option<DateTime<Utc>>> {
    dest.read_watermark()
}

/// `MAX(ts)` of a destination table, `None` when the table is missing or empty.
pub fn max_timestamp(client: &mut Client, table: &str) -> Result<Option<DateTime<Utc>>> {
    if !db::table_exists(client, table)? {
        return Ok(None);
    }

    let sql = format!("SELECT MAX(ts) FROM {}", table);
    let row = client
        .query_one(sql.as_str(), &[])
        .map_err(|e| db::classify(e, "reading watermark"))?;
    Ok(row.get(0))
}

/// Where the next extraction starts (exclusive).
///
/// An operator override takes precedence over the stored watermark. `None`
/// means neither exists: the destination needs a bootstrap load.
pub fn resume_point(
    watermark: Option<DateTime<Utc>>,
    since_override: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    since_override.or(watermark)
}
