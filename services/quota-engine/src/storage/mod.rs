pub mod database;
pub mod error;
pub mod ledger;
pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};

pub use database::{DeleteOutcome, QuotaDatabase, StoredAuditFact};
pub use error::StorageError;

pub const QUOTA_DB_FILENAME: &str = "quota.db";
pub const QUOTA_PLANS_TABLE: &str = "quota_plans";
pub const PLAN_BINDINGS_TABLE: &str = "plan_bindings";
pub const USAGE_EVENTS_TABLE: &str = "usage_events";
pub const AUDIT_LOG_TABLE: &str = "audit_log";

/// Fixed-width RFC 3339 so stored timestamps order lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::InvalidRecord(format!("bad timestamp {value}: {err}")))
}
