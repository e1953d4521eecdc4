use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use tracing::debug;

use crate::ledger::{
    CarryOverScope, GuardedAppend, NewUsageEvent, UsageAggregate, UsageEvent, UsageFilter,
    UsageGuard, UsageLedger, UsageQuery,
};
use crate::period::PeriodBoundary;

use super::database::QuotaDatabase;
use super::error::StorageError;
use super::{format_timestamp, parse_timestamp};

const EVENT_COLUMNS: &str = "id, tenant_id, customer_id, plan_id, metric_name, quantity, \
     timestamp, period_start, period_end, carried_over_from, metadata";

impl UsageLedger for QuotaDatabase {
    fn aggregate(&self, query: &UsageQuery) -> Result<UsageAggregate, StorageError> {
        let conn = self.connection()?;
        aggregate_with(&conn, query)
    }

    fn append(&self, events: Vec<NewUsageEvent>) -> Result<Vec<UsageEvent>, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let events: Vec<UsageEvent> = events.into_iter().map(NewUsageEvent::into_event).collect();
        for event in &events {
            insert_event(&tx, event)?;
        }
        tx.commit()?;

        Ok(events)
    }

    fn append_guarded(
        &self,
        guards: &[UsageGuard],
        events: Vec<NewUsageEvent>,
    ) -> Result<GuardedAppend, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut aggregates = Vec::with_capacity(guards.len());
        for guard in guards {
            aggregates.push(aggregate_with(&tx, &guard.query)?);
        }

        let violated = guards
            .iter()
            .zip(&aggregates)
            .any(|(guard, aggregate)| !guard.admits(aggregate));
        if violated {
            debug!(guards = guards.len(), "usage guard failed on fresh read");
            tx.rollback()?;
            return Ok(GuardedAppend::Rejected { aggregates });
        }

        let events: Vec<UsageEvent> = events.into_iter().map(NewUsageEvent::into_event).collect();
        for event in &events {
            insert_event(&tx, event)?;
        }
        tx.commit()?;

        Ok(GuardedAppend::Committed { events, aggregates })
    }

    fn append_carry_over(
        &self,
        scope: &CarryOverScope,
        events: Vec<NewUsageEvent>,
    ) -> Result<Option<Vec<UsageEvent>>, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: i64 = tx.query_row(
            r#"
            SELECT COUNT(*) FROM usage_events
            WHERE tenant_id = ?1 AND customer_id = ?2 AND plan_id = ?3
              AND carried_over_from = ?4 AND period_start = ?5 AND period_end = ?6
            "#,
            params![
                scope.tenant_id,
                scope.customer_id,
                scope.plan_id,
                scope.carried_over_from,
                format_timestamp(&scope.period.start),
                format_timestamp(&scope.period.end),
            ],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(None);
        }

        let events: Vec<UsageEvent> = events.into_iter().map(NewUsageEvent::into_event).collect();
        for event in &events {
            insert_event(&tx, event)?;
        }
        tx.commit()?;

        Ok(Some(events))
    }

    fn list_events(&self, filter: &UsageFilter) -> Result<Vec<UsageEvent>, StorageError> {
        let conn = self.connection()?;

        let mut conditions: Vec<String> = Vec::new();
        let mut bindings: Vec<Value> = Vec::new();
        let mut push = |clause: &str, value: Value| {
            bindings.push(value);
            conditions.push(format!("{clause} ?{}", bindings.len()));
        };

        if let Some(tenant_id) = &filter.tenant_id {
            push("tenant_id =", tenant_id.clone().into());
        }
        if let Some(customer_id) = &filter.customer_id {
            push("customer_id =", customer_id.clone().into());
        }
        if let Some(plan_id) = &filter.plan_id {
            push("plan_id =", plan_id.clone().into());
        }
        if let Some(metric_name) = &filter.metric_name {
            push("metric_name =", metric_name.clone().into());
        }
        if let Some(start) = &filter.start_time {
            push("timestamp >=", format_timestamp(start).into());
        }
        if let Some(end) = &filter.end_time {
            push("timestamp <=", format_timestamp(end).into());
        }

        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM usage_events");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id ASC");
        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                sql.push_str(&format!(" LIMIT {limit} OFFSET {}", offset.unwrap_or(0)));
            }
            (None, Some(offset)) => {
                sql.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
            }
            (None, None) => {}
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bindings.iter()), RawEvent::from_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    }
}

fn aggregate_with(conn: &Connection, query: &UsageQuery) -> Result<UsageAggregate, StorageError> {
    let start = format_timestamp(&query.period.start);
    let end = format_timestamp(&query.period.end);

    let (consumed, credited, count): (i64, i64, i64) = conn.query_row(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN quantity > 0 THEN quantity ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN quantity < 0 THEN -quantity ELSE 0 END), 0),
            COUNT(*)
        FROM usage_events
        WHERE tenant_id = ?1 AND customer_id = ?2 AND plan_id = ?3 AND metric_name = ?4
          AND (
            (period_start = ?5 AND period_end = ?6)
            OR (period_start IS NULL AND timestamp >= ?5 AND timestamp < ?6)
          )
        "#,
        params![
            query.tenant_id,
            query.customer_id,
            query.plan_id,
            query.metric_name,
            start,
            end,
        ],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    Ok(UsageAggregate {
        consumed,
        credited,
        event_count: count as u64,
    })
}

fn insert_event(conn: &Connection, event: &UsageEvent) -> Result<(), StorageError> {
    let metadata = match &event.metadata {
        Some(value) => Some(serde_json::to_string(value)?),
        None => None,
    };

    conn.execute(
        r#"
        INSERT INTO usage_events (
            id, tenant_id, customer_id, plan_id, metric_name, quantity,
            timestamp, period_start, period_end, carried_over_from, metadata
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            event.id,
            event.tenant_id,
            event.customer_id,
            event.plan_id,
            event.metric_name,
            event.quantity,
            format_timestamp(&event.timestamp),
            event.period.map(|p| format_timestamp(&p.start)),
            event.period.map(|p| format_timestamp(&p.end)),
            event.carried_over_from,
            metadata,
        ],
    )?;
    Ok(())
}

struct RawEvent {
    id: String,
    tenant_id: String,
    customer_id: String,
    plan_id: String,
    metric_name: String,
    quantity: i64,
    timestamp: String,
    period_start: Option<String>,
    period_end: Option<String>,
    carried_over_from: Option<String>,
    metadata: Option<String>,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            customer_id: row.get(2)?,
            plan_id: row.get(3)?,
            metric_name: row.get(4)?,
            quantity: row.get(5)?,
            timestamp: row.get(6)?,
            period_start: row.get(7)?,
            period_end: row.get(8)?,
            carried_over_from: row.get(9)?,
            metadata: row.get(10)?,
        })
    }

    fn into_event(self) -> Result<UsageEvent, StorageError> {
        let period = match (self.period_start, self.period_end) {
            (Some(start), Some(end)) => Some(PeriodBoundary::new(
                parse_timestamp(&start)?,
                parse_timestamp(&end)?,
            )),
            (None, None) => None,
            _ => {
                return Err(StorageError::InvalidRecord(format!(
                    "usage event {} has a half-open period",
                    self.id
                )))
            }
        };
        let metadata = match self.metadata {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        Ok(UsageEvent {
            timestamp: parse_timestamp(&self.timestamp)?,
            period,
            metadata,
            id: self.id,
            tenant_id: self.tenant_id,
            customer_id: self.customer_id,
            plan_id: self.plan_id,
            metric_name: self.metric_name,
            quantity: self.quantity,
            carried_over_from: self.carried_over_from,
        })
    }
}
