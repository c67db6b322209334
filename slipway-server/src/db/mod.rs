//! Database layer.
//!
//! The persistence contracts live in `slipway_core::store`; this module holds
//! the SQL implementation the server runs with. To move to another database,
//! implement those traits for a new type and change the concrete store type
//! in [`crate::state::AppState`].

pub mod sqlite;

use chrono::{DateTime, SecondsFormat, Utc};
use slipway_core::store::{StoreError, StoreResult};

/// Fixed-width RFC 3339 so text comparison in SQL orders by time.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(id: &str, column: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::malformed(id, column, e))
}

pub(crate) fn parse_opt_ts(
    id: &str,
    column: &'static str,
    raw: Option<&str>,
) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(id, column, r)).transpose()
}
