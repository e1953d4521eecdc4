use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditFact;
use crate::plan::{PlanBinding, QuotaPlan};

use super::error::StorageError;
use super::schema::init_database;
use super::{format_timestamp, parse_timestamp, QUOTA_DB_FILENAME};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    InUse { bindings: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAuditFact {
    pub id: i64,
    pub recorded_at: String,
    pub actor: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub payload: serde_json::Value,
}

/// SQLite-backed store for plans, plan bindings, the usage ledger and the
/// audit trail. One connection, serialized behind a mutex.
pub struct QuotaDatabase {
    data_dir: PathBuf,
    conn: Mutex<Connection>,
}

impl QuotaDatabase {
    pub fn new(data_dir: PathBuf) -> Result<Self, StorageError> {
        Self::open(data_dir, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open(data_dir: PathBuf, busy_timeout: Duration) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&data_dir)?;
        let db_path = data_dir.join(QUOTA_DB_FILENAME);
        let is_new = !db_path.exists();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(busy_timeout)?;

        init_database(&conn)?;
        if is_new {
            info!(path = %db_path.display(), "initialized quota database");
        }

        Ok(Self {
            data_dir,
            conn: Mutex::new(conn),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::ConnectionPoisoned)
    }

    pub fn insert_plan(&self, plan: &QuotaPlan) -> Result<(), StorageError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO quota_plans (
                id, tenant_id, name, description, limits, overage_rates,
                reset_cadence, carry_over, max_carry_over, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                plan.id,
                plan.tenant_id,
                plan.name,
                plan.description,
                serde_json::to_string(&plan.limits)?,
                serde_json::to_string(&plan.overage_rates)?,
                plan.reset_cadence.as_str(),
                plan.carry_over,
                serde_json::to_string(&plan.max_carry_over)?,
                format_timestamp(&plan.created_at),
                format_timestamp(&plan.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Returns `false` when no plan with that id exists.
    pub fn update_plan(&self, plan: &QuotaPlan) -> Result<bool, StorageError> {
        let conn = self.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE quota_plans SET
                name = ?2,
                description = ?3,
                limits = ?4,
                overage_rates = ?5,
                reset_cadence = ?6,
                carry_over = ?7,
                max_carry_over = ?8,
                updated_at = ?9
            WHERE id = ?1
            "#,
            params![
                plan.id,
                plan.name,
                plan.description,
                serde_json::to_string(&plan.limits)?,
                serde_json::to_string(&plan.overage_rates)?,
                plan.reset_cadence.as_str(),
                plan.carry_over,
                serde_json::to_string(&plan.max_carry_over)?,
                format_timestamp(&plan.updated_at),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<Option<QuotaPlan>, StorageError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tenant_id, name, description, limits, overage_rates,
                   reset_cadence, carry_over, max_carry_over, created_at, updated_at
            FROM quota_plans
            WHERE id = ?1
            "#,
        )?;

        let raw = stmt
            .query_row(params![plan_id], RawPlan::from_row)
            .optional()?;
        raw.map(RawPlan::into_plan).transpose()
    }

    pub fn list_plans(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<QuotaPlan>, StorageError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tenant_id, name, description, limits, overage_rates,
                   reset_cadence, carry_over, max_carry_over, created_at, updated_at
            FROM quota_plans
            WHERE tenant_id = ?1
            ORDER BY created_at DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )?;

        let rows = stmt.query_map(
            params![tenant_id, limit as i64, offset as i64],
            RawPlan::from_row,
        )?;

        let mut plans = Vec::new();
        for row in rows {
            plans.push(row?.into_plan()?);
        }
        Ok(plans)
    }

    /// Deletes a plan unless a customer binding still references it. The
    /// binding count and the delete share one transaction.
    pub fn delete_plan(&self, plan_id: &str) -> Result<DeleteOutcome, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let bindings: i64 = tx.query_row(
            "SELECT COUNT(*) FROM plan_bindings WHERE plan_id = ?1",
            params![plan_id],
            |row| row.get(0),
        )?;
        if bindings > 0 {
            return Ok(DeleteOutcome::InUse {
                bindings: bindings as u64,
            });
        }

        let deleted = tx.execute("DELETE FROM quota_plans WHERE id = ?1", params![plan_id])?;
        tx.commit()?;

        Ok(if deleted > 0 {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    pub fn upsert_binding(&self, binding: &PlanBinding) -> Result<(), StorageError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO plan_bindings (tenant_id, customer_id, plan_id, bound_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(tenant_id, customer_id) DO UPDATE SET
                plan_id = excluded.plan_id,
                bound_at = excluded.bound_at
            "#,
            params![
                binding.tenant_id,
                binding.customer_id,
                binding.plan_id,
                format_timestamp(&binding.bound_at),
            ],
        )?;
        Ok(())
    }

    pub fn remove_binding(&self, tenant_id: &str, customer_id: &str) -> Result<bool, StorageError> {
        let conn = self.connection()?;
        let removed = conn.execute(
            "DELETE FROM plan_bindings WHERE tenant_id = ?1 AND customer_id = ?2",
            params![tenant_id, customer_id],
        )?;
        Ok(removed > 0)
    }

    pub fn get_binding(
        &self,
        tenant_id: &str,
        customer_id: &str,
    ) -> Result<Option<PlanBinding>, StorageError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tenant_id, customer_id, plan_id, bound_at
            FROM plan_bindings
            WHERE tenant_id = ?1 AND customer_id = ?2
            "#,
        )?;

        let raw = stmt
            .query_row(params![tenant_id, customer_id], RawBinding::from_row)
            .optional()?;
        raw.map(RawBinding::into_binding).transpose()
    }

    pub fn list_bindings(&self) -> Result<Vec<PlanBinding>, StorageError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tenant_id, customer_id, plan_id, bound_at
            FROM plan_bindings
            ORDER BY tenant_id, customer_id
            "#,
        )?;

        let rows = stmt.query_map([], RawBinding::from_row)?;
        let mut bindings = Vec::new();
        for row in rows {
            bindings.push(row?.into_binding()?);
        }
        Ok(bindings)
    }

    pub fn write_audit_fact(&self, fact: &AuditFact) -> Result<(), StorageError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO audit_log (recorded_at, actor, action, target_type, target_id, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                format_timestamp(&Utc::now()),
                fact.actor,
                fact.action,
                fact.target_type,
                fact.target_id,
                serde_json::to_string(&fact.payload)?,
            ],
        )?;
        Ok(())
    }

    pub fn list_audit_facts(&self, action: Option<&str>) -> Result<Vec<StoredAuditFact>, StorageError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, recorded_at, actor, action, target_type, target_id, payload
            FROM audit_log
            WHERE ?1 IS NULL OR action = ?1
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![action], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut facts = Vec::new();
        for row in rows {
            let (id, recorded_at, actor, action, target_type, target_id, payload) = row?;
            facts.push(StoredAuditFact {
                id,
                recorded_at,
                actor,
                action,
                target_type,
                target_id,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(facts)
    }
}

struct RawPlan {
    id: String,
    tenant_id: String,
    name: String,
    description: Option<String>,
    limits: String,
    overage_rates: String,
    reset_cadence: String,
    carry_over: bool,
    max_carry_over: String,
    created_at: String,
    updated_at: String,
}

impl RawPlan {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            limits: row.get(4)?,
            overage_rates: row.get(5)?,
            reset_cadence: row.get(6)?,
            carry_over: row.get(7)?,
            max_carry_over: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_plan(self) -> Result<QuotaPlan, StorageError> {
        Ok(QuotaPlan {
            reset_cadence: self
                .reset_cadence
                .parse()
                .map_err(StorageError::InvalidRecord)?,
            limits: serde_json::from_str(&self.limits)?,
            overage_rates: serde_json::from_str(&self.overage_rates)?,
            max_carry_over: serde_json::from_str(&self.max_carry_over)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            carry_over: self.carry_over,
        })
    }
}

struct RawBinding {
    tenant_id: String,
    customer_id: String,
    plan_id: String,
    bound_at: String,
}

impl RawBinding {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tenant_id: row.get(0)?,
            customer_id: row.get(1)?,
            plan_id: row.get(2)?,
            bound_at: row.get(3)?,
        })
    }

    fn into_binding(self) -> Result<PlanBinding, StorageError> {
        Ok(PlanBinding {
            bound_at: parse_timestamp(&self.bound_at)?,
            tenant_id: self.tenant_id,
            customer_id: self.customer_id,
            plan_id: self.plan_id,
        })
    }
}
