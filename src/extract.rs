/// Deduplicating extractor.
///
/// The origin store can hold several physical rows for one logical reading
/// (late corrections re-inserted with a new id). Extraction collapses them to
/// one canonical row per `(timestamp, station_id)`: the one with the greatest
/// source row id. In PostgreSQL this is a `DISTINCT ON` query ordered by
/// `id DESC`; `canonicalize` is the same rule over rows already in memory.
///
/// Output is a lazy sequence of chunks ordered by timestamp, then station.

use chrono::{DateTime, Utc};
use postgres::types::ToSql;
use postgres::{Portal, Row, Transaction};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::DbParams;
use crate::db::{self, ManagedClient};
use crate::model::{Measurements, Reading, ReadingKey, Result, SourceRow, Variant};

/// A lazy, finite sequence of canonical reading chunks.
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<Vec<Reading>>> + 'a>;

/// Anything canonical readings can be extracted from.
pub trait Source {
    /// Opens an extraction. Re-running with the same filter yields the same
    /// set, plus whatever arrived in the origin meanwhile.
    ///
    /// # Errors
    /// `Connection` if the origin is unreachable, `Query` if the query can't
    /// run. Errors while reading later chunks arrive through the iterator.
    fn extract(&mut self, filter: &ExtractFilter, chunk_size: usize) -> Result<ChunkIter<'_>>;
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Lower bound on the reading timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerBound {
    /// Strictly after: used with a watermark, which is already stored.
    After(DateTime<Utc>),
    /// At or after: used for full loads and period repairs.
    From(DateTime<Utc>),
}

/// Which source readings to extract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractFilter {
    pub lower: Option<LowerBound>,
    /// Inclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    /// Inclusive station id range.
    pub stations: Option<(i32, i32)>,
}

impl ExtractFilter {
    /// Everything in the source.
    pub fn all() -> Self {
        Self::default()
    }

    /// Readings strictly newer than `watermark`.
    pub fn after(watermark: DateTime<Utc>) -> Self {
        Self {
            lower: Some(LowerBound::After(watermark)),
            ..Self::default()
        }
    }

    /// Readings in the closed window `[from, until]`.
    pub fn window(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            lower: Some(LowerBound::From(from)),
            until: Some(until),
            stations: None,
        }
    }

    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.lower = Some(LowerBound::From(from));
        self
    }

    pub fn station(self, station_id: i32) -> Self {
        self.stations(station_id, station_id)
    }

    pub fn stations(mut self, first: i32, last: i32) -> Self {
        self.stations = Some((first.min(last), first.max(last)));
        self
    }

    /// Whether a key passes the filter.
    pub fn matches(&self, key: &ReadingKey) -> bool {
        let lower_ok = match self.lower {
            Some(LowerBound::After(t)) => key.timestamp > t,
            Some(LowerBound::From(t)) => key.timestamp >= t,
            None => true,
        };
        let upper_ok = self.until.is_none_or(|t| key.timestamp <= t);
        let station_ok = self
            .stations
            .is_none_or(|(first, last)| (first..=last).contains(&key.station_id));

        lower_ok && upper_ok && station_ok
    }
}

// ---------------------------------------------------------------------------
// In-memory canonicalization
// ---------------------------------------------------------------------------

/// Collapses physical rows to one canonical reading per key, keeping the row
/// with the greatest `source_row_id`, and returns them ordered by timestamp
/// then station.
pub fn canonicalize(rows: impl IntoIterator<Item = SourceRow>) -> Vec<Reading> {
    let mut latest: BTreeMap<ReadingKey, SourceRow> = BTreeMap::new();

    for row in rows {
        let key = row.reading.key();
        match latest.get(&key) {
            Some(kept) if kept.source_row_id >= row.source_row_id => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }

    latest.into_values().map(|row| row.reading).collect()
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Timestamp(DateTime<Utc>),
    Station(i32),
}

impl QueryParam {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            QueryParam::Timestamp(t) => t,
            QueryParam::Station(s) => s,
        }
    }
}

/// Source tables joined for the readings of a variant. `el` is the reading
/// row and `ee` the station.
pub fn source_relation(variant: Variant) -> &'static str {
    match variant {
        Variant::Rainfall => {
            "public.estacoes_leitura AS el \
             JOIN public.estacoes_leiturachuva AS elc ON elc.leitura_id = el.id \
             JOIN public.estacoes_estacao AS ee ON ee.id = el.estacao_id"
        }
        Variant::Meteorological => {
            "public.estacoes_leitura AS el \
             JOIN (SELECT DISTINCT leitura_id FROM public.estacoes_leiturasensor) AS ls ON ls.leitura_id = el.id \
             JOIN public.estacoes_estacao AS ee ON ee.id = el.estacao_id"
        }
    }
}

/// Renders the filter as a `WHERE` clause over the given columns, appending
/// its parameters.
pub fn where_clause(
    filter: &ExtractFilter,
    timestamp_col: &str,
    station_col: &str,
    params: &mut Vec<QueryParam>,
) -> String {
    let mut conditions = Vec::new();
    let mut push = |condition: String, param: QueryParam, params: &mut Vec<QueryParam>| {
        params.push(param);
        conditions.push(condition.replace('?', &format!("${}", params.len())));
    };

    match filter.lower {
        Some(LowerBound::After(t)) => push(format!("{} > ?", timestamp_col), QueryParam::Timestamp(t), params),
        Some(LowerBound::From(t)) => push(format!("{} >= ?", timestamp_col), QueryParam::Timestamp(t), params),
        None => {}
    }
    if let Some(t) = filter.until {
        push(format!("{} <= ?", timestamp_col), QueryParam::Timestamp(t), params);
    }
    if let Some((first, last)) = filter.stations {
        push(format!("{} >= ?", station_col), QueryParam::Station(first), params);
        push(format!("{} <= ?", station_col), QueryParam::Station(last), params);
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

/// Builds the canonical-readings query for a variant.
///
/// Result columns: timestamp, station id, station name, then the variant's
/// measurements in `Variant::measurement_columns` order. Ordering is
/// timestamp, station, then source id descending, so `DISTINCT ON` keeps the
/// latest physical row of every key.
pub fn canonical_query(variant: Variant, filter: &ExtractFilter) -> (String, Vec<QueryParam>) {
    let mut params = Vec::new();

    let sql = match variant {
        Variant::Rainfall => {
            let filter_sql = where_clause(filter, "el.\"horaLeitura\"", "el.estacao_id", &mut params);
            format!(
                "SELECT DISTINCT ON (el.\"horaLeitura\", el.estacao_id) \
                    el.\"horaLeitura\"::timestamptz, el.estacao_id::integer, ee.nome::text, \
                    elc.m05::numeric, elc.m10::numeric, elc.m15::numeric, elc.h01::numeric, \
                    elc.h04::numeric, elc.h24::numeric, elc.h96::numeric \
                 FROM {} \
                 {} \
                 ORDER BY el.\"horaLeitura\" ASC, el.estacao_id ASC, el.id DESC",
                source_relation(variant),
                filter_sql
            )
        }
        Variant::Meteorological => {
            // sensor values are stored one row per sensor; pivot per reading id first
            let filter_sql = where_clause(filter, "l.\"horaLeitura\"", "l.estacao_id", &mut params);
            format!(
                "WITH pivoted AS ( \
                    SELECT l.\"horaLeitura\"::timestamptz AS reading_time, l.estacao_id::integer AS estacao_id, e.nome::text AS station_name, l.id AS reading_id, \
                        MAX(CASE WHEN s.nome = 'Chuva' THEN ls.valor END)::numeric AS rain, \
                        MAX(CASE WHEN s.nome = 'Direção Vento' THEN ls.valor END)::numeric AS wind_direction, \
                        MAX(CASE WHEN s.nome = 'Velocidade Vento' THEN ls.valor END)::numeric AS wind_speed, \
                        MAX(CASE WHEN s.nome = 'Temperatura do Ar' THEN ls.valor END)::numeric AS temperature, \
                        MAX(CASE WHEN s.nome = 'Pressão Atmosférica' THEN ls.valor END)::numeric AS pressure, \
                        MAX(CASE WHEN s.nome = 'Umidade do Ar' THEN ls.valor END)::numeric AS humidity \
                    FROM public.estacoes_leiturasensor ls \
                    JOIN public.estacoes_leitura l ON ls.leitura_id = l.id \
                    JOIN public.estacoes_sensor s ON ls.sensor_id = s.id \
                    JOIN public.estacoes_estacao e ON e.id = l.estacao_id \
                    {} \
                    GROUP BY l.\"horaLeitura\", l.estacao_id, e.nome, l.id \
                 ) \
                 SELECT DISTINCT ON (reading_time, estacao_id) \
                    reading_time, estacao_id, station_name, \
                    rain, wind_direction, wind_speed, temperature, pressure, humidity \
                 FROM pivoted \
                 ORDER BY reading_time ASC, estacao_id ASC, reading_id DESC",
                filter_sql
            )
        }
    };

    (sql, params)
}

/// Decodes one row of `canonical_query` output.
pub fn reading_from_row(row: &Row, variant: Variant) -> Result<Reading> {
    let decode = |e: postgres::Error| db::classify(e, "decoding source row");

    let timestamp: DateTime<Utc> = row.try_get(0).map_err(decode)?;
    let station_id: i32 = row.try_get(1).map_err(decode)?;
    let station_name: Option<String> = row.try_get(2).map_err(decode)?;

    let mut values = Vec::with_capacity(variant.measurement_columns().len());
    for idx in 0..variant.measurement_columns().len() {
        let value: Option<Decimal> = row.try_get(3 + idx).map_err(decode)?;
        values.push(value);
    }

    Ok(Reading {
        timestamp,
        station_id,
        station_name: station_name.unwrap_or_default(),
        measurements: Measurements::from_values(variant, values)?,
    })
}

// ---------------------------------------------------------------------------
// PostgreSQL source
// ---------------------------------------------------------------------------

/// The NIMBUS operational database.
pub struct PostgresSource {
    conn: ManagedClient,
    variant: Variant,
}

impl PostgresSource {
    pub fn new(params: DbParams, variant: Variant) -> Self {
        Self {
            conn: ManagedClient::new(params),
            variant,
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn ping(&mut self) -> Result<()> {
        self.conn.ping()
    }

    /// Direct access for diagnostics queries.
    pub fn connection(&mut self) -> &mut ManagedClient {
        &mut self.conn
    }
}

impl Source for PostgresSource {
    fn extract(&mut self, filter: &ExtractFilter, chunk_size: usize) -> Result<ChunkIter<'_>> {
        let variant = self.variant;
        let (sql, params) = canonical_query(variant, filter);
        let max_rows = i32::try_from(chunk_size.max(1)).unwrap_or(i32::MAX);
        debug!(%variant, ?filter, chunk_size, "opening source cursor");

        let client = self.conn.client()?;
        let mut txn = client
            .build_transaction()
            .read_only(true)
            .start()
            .map_err(|e| db::classify(e, "opening source transaction"))?;

        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(QueryParam::as_sql).collect();
        let portal = txn
            .bind(sql.as_str(), &refs)
            .map_err(|e| db::classify(e, "running extraction query"))?;

        Ok(Box::new(PortalChunks {
            txn,
            portal,
            max_rows,
            variant,
            done: false,
        }))
    }
}

/// Pulls a cursor forward one chunk at a time. The read-only transaction
/// rolls back when the iterator is dropped.
struct PortalChunks<'a> {
    txn: Transaction<'a>,
    portal: Portal,
    max_rows: i32,
    variant: Variant,
    done: bool,
}

impl Iterator for PortalChunks<'_> {
    type Item = Result<Vec<Reading>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let rows = match self.txn.query_portal(&self.portal, self.max_rows) {
            Ok(rows) => rows,
            Err(e) => {
                self.done = true;
                return Some(Err(db::classify(e, "fetching source chunk")));
            }
        };

        if rows.len() < self.max_rows as usize {
            self.done = true;
        }
        if rows.is_empty() {
            return None;
        }

        let variant = self.variant;
        let chunk: Result<Vec<Reading>> = rows.iter().map(|row| reading_from_row(row, variant)).collect();
        if chunk.is_err() {
            self.done = true;
        }
        Some(chunk)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
