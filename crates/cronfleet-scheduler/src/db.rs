use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::DalError;

/// How long a writer waits for another controller's transaction before
/// giving up. A timeout surfaces as a DAL error, which the event loop
/// answers with its back-off instead of stalling.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// Open `path` with WAL journaling, foreign keys and the busy timeout set.
pub fn open(path: &str) -> Result<Connection, DalError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Initialise the cron schema in `conn`.
///
/// Creates the `deployments`, `cron_jobs` and `leases` tables (idempotent).
/// Timestamps are fixed-width RFC 3339 text in UTC with microseconds, so
/// `<` / `<=` on the text columns compare chronologically.
pub fn init_db(conn: &Connection) -> Result<(), DalError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS deployments (
            key           TEXT    NOT NULL PRIMARY KEY,
            module        TEXT    NOT NULL,
            min_replicas  INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_deployments_module ON deployments (module);

        CREATE TABLE IF NOT EXISTS cron_jobs (
            key             TEXT NOT NULL PRIMARY KEY,
            deployment_key  TEXT NOT NULL REFERENCES deployments (key) ON DELETE CASCADE,
            module          TEXT NOT NULL,
            verb            TEXT NOT NULL,
            schedule        TEXT NOT NULL,
            start_time      TEXT NOT NULL,
            next_execution  TEXT NOT NULL,
            state           TEXT NOT NULL DEFAULT 'idle'   -- 'idle' | 'executing'
        ) STRICT;

        -- Claim query: UPDATE … WHERE state = 'idle' AND next_execution <= ?
        CREATE INDEX IF NOT EXISTS idx_cron_jobs_next_execution ON cron_jobs (next_execution);
        CREATE INDEX IF NOT EXISTS idx_cron_jobs_deployment ON cron_jobs (deployment_key);

        CREATE TABLE IF NOT EXISTS leases (
            name        TEXT NOT NULL PRIMARY KEY,
            holder      TEXT NOT NULL,
            expires_at  TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Storage form of a timestamp.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|t| t.with_timezone(&Utc))
}
