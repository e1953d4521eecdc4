use rusqlite::Connection;

use super::StorageError;

pub const QUOTA_PLANS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quota_plans (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    limits TEXT NOT NULL,
    overage_rates TEXT NOT NULL,
    reset_cadence TEXT NOT NULL,
    carry_over INTEGER NOT NULL DEFAULT 0,
    max_carry_over TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub const PLAN_BINDINGS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS plan_bindings (
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    plan_id TEXT NOT NULL REFERENCES quota_plans(id),
    bound_at TEXT NOT NULL,
    PRIMARY KEY (tenant_id, customer_id)
);
"#;

pub const USAGE_EVENTS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_events (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    plan_id TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    period_start TEXT,
    period_end TEXT,
    carried_over_from TEXT,
    metadata TEXT
);

CREATE TRIGGER IF NOT EXISTS usage_events_no_update
BEFORE UPDATE ON usage_events
BEGIN
    SELECT RAISE(ABORT, 'usage events are immutable');
END;

CREATE TRIGGER IF NOT EXISTS usage_events_no_delete
BEFORE DELETE ON usage_events
BEGIN
    SELECT RAISE(ABORT, 'usage events are immutable');
END;
"#;

pub const USAGE_EVENTS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_usage_period
    ON usage_events(customer_id, plan_id, metric_name, period_start, period_end);
CREATE INDEX IF NOT EXISTS idx_usage_timestamp
    ON usage_events(customer_id, plan_id, metric_name, timestamp);
CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_carry_over_provenance
    ON usage_events(tenant_id, customer_id, plan_id, metric_name, carried_over_from, period_start, period_end)
    WHERE carried_over_from IS NOT NULL;
"#;

pub const AUDIT_LOG_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at TEXT NOT NULL,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
"#;

pub fn init_database(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(QUOTA_PLANS_TABLE_SCHEMA)?;
    conn.execute_batch(PLAN_BINDINGS_TABLE_SCHEMA)?;
    conn.execute_batch(USAGE_EVENTS_TABLE_SCHEMA)?;
    conn.execute_batch(USAGE_EVENTS_INDEXES)?;
    conn.execute_batch(AUDIT_LOG_TABLE_SCHEMA)?;
    Ok(())
}
