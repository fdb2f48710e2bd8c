/// Database connection and error classification utilities
///
/// Every PostgreSQL failure is sorted into the sync error taxonomy here:
/// transport problems become `SyncError::Connection` (retryable), anything
/// the server rejected becomes `SyncError::Query` (a defect, surfaced loudly).

use postgres::error::SqlState;
use postgres::{Client, NoTls};
use tracing::{debug, info};

use crate::config::DbParams;
use crate::model::{Result, SyncError};

/// Sorts a driver error into `Connection` or `Query`.
///
/// Errors carrying a server response are query errors, except SQLSTATE
/// class 08 and the shutdown codes, which mean the server went away.
/// Without a server response, a closed socket or an I/O failure is a
/// connection error; anything else (row decoding, parameter mismatch) is a
/// query error.
pub fn classify(err: postgres::Error, context: &str) -> SyncError {
    if let Some(db) = err.as_db_error() {
        let code = db.code();
        let server_went_away = code.code().starts_with("08")
            || *code == SqlState::ADMIN_SHUTDOWN
            || *code == SqlState::CRASH_SHUTDOWN
            || *code == SqlState::CANNOT_CONNECT_NOW;

        return if server_went_away {
            SyncError::connection(context, db.message())
        } else {
            SyncError::query(context, format!("{} (SQLSTATE {})", db.message(), code.code()))
        };
    }

    let io_failure = std::error::Error::source(&err).is_some_and(|s| s.is::<std::io::Error>());
    if err.is_closed() || io_failure {
        SyncError::connection(context, &err)
    } else {
        SyncError::query(context, &err)
    }
}

/// Opens a connection, mapping failures to `SyncError::Connection`.
pub fn connect(params: &DbParams) -> Result<Client> {
    debug!(role = params.role.name(), database = params.label(), "connecting");
    params
        .postgres_config()
        .connect(NoTls)
        .map_err(|e| SyncError::connection(format!("connecting to {} ({})", params.role.name(), params.label()), e))
}

/// Check that a relation exists, for tools that need the tables up front.
pub fn table_exists(client: &mut Client, table: &str) -> Result<bool> {
    let row = client
        .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&table])
        .map_err(|e| classify(e, "checking table existence"))?;
    Ok(row.get(0))
}

// ---------------------------------------------------------------------------
// Reconnecting client
// ---------------------------------------------------------------------------

/// A lazily opened connection that reopens itself after the server drops it.
///
/// A long-running sync must resume on its own after a network blip, and a
/// `postgres::Client` is unusable once its socket closes, so every access
/// goes through `client()`, which reconnects when needed.
pub struct ManagedClient {
    params: DbParams,
    client: Option<Client>,
}

impl ManagedClient {
    pub fn new(params: DbParams) -> Self {
        Self { params, client: None }
    }

    pub fn params(&self) -> &DbParams {
        &self.params
    }

    /// Returns an open client, connecting first if there is none or the
    /// previous one was closed.
    pub fn client(&mut self) -> Result<&mut Client> {
        let stale = self.client.as_ref().is_none_or(Client::is_closed);
        if stale {
            if self.client.take().is_some() {
                info!(role = self.params.role.name(), "reconnecting after closed connection");
            }
            self.client = Some(connect(&self.params)?);
        }

        // just populated above
        self.client
            .as_mut()
            .ok_or_else(|| SyncError::connection("opening connection", "no client available"))
    }

    /// Runs `f` on the client, classifying errors and dropping the client on
    /// connection failures so the next call starts fresh.
    pub fn run<T>(
        &mut self,
        context: &str,
        f: impl FnOnce(&mut Client) -> std::result::Result<T, postgres::Error>,
    ) -> Result<T> {
        let client = self.client()?;
        match f(client) {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = classify(e, context);
                if err.is_retryable() {
                    self.client = None;
                }
                Err(err)
            }
        }
    }

    /// Round-trips a trivial query to prove the connection works.
    pub fn ping(&mut self) -> Result<()> {
        let role = self.params.role.name();
        self.run(&format!("checking {} connection", role), |c| c.simple_query("SELECT 1").map(|_| ()))
    }
}
