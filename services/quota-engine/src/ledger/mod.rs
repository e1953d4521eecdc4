//! Append-only usage ledger.
//!
//! Consumption is a positive quantity and carry-over credit is a negative
//! one, so the usage that counts against a limit is a plain signed sum over
//! the events of a period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::period::PeriodBoundary;
use crate::storage::StorageError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub metric_name: String,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
    pub period: Option<PeriodBoundary>,
    pub carried_over_from: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl UsageEvent {
    pub fn is_credit(&self) -> bool {
        self.quantity < 0
    }
}

#[derive(Debug, Clone)]
pub struct NewUsageEvent {
    pub tenant_id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub metric_name: String,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
    pub period: Option<PeriodBoundary>,
    pub carried_over_from: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewUsageEvent {
    pub fn into_event(self) -> UsageEvent {
        UsageEvent {
            id: Uuid::new_v4().to_string(),
            tenant_id: self.tenant_id,
            customer_id: self.customer_id,
            plan_id: self.plan_id,
            metric_name: self.metric_name,
            quantity: self.quantity,
            timestamp: self.timestamp,
            period: self.period,
            carried_over_from: self.carried_over_from,
            metadata: self.metadata,
        }
    }
}

/// Selects the events of one (customer, plan, metric) inside one period.
///
/// An event matches when its stored period equals `period`. Events stored
/// without a period match when their timestamp falls inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageQuery {
    pub tenant_id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub metric_name: String,
    pub period: PeriodBoundary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAggregate {
    /// Sum of positive quantities.
    pub consumed: i64,
    /// Sum of credits, as a positive number.
    pub credited: i64,
    pub event_count: u64,
}

impl UsageAggregate {
    pub fn net(&self) -> i64 {
        self.consumed.saturating_sub(self.credited)
    }
}

/// Condition for a guarded append: after the write, net usage for `query`
/// must not exceed `limit`.
#[derive(Debug, Clone)]
pub struct UsageGuard {
    pub query: UsageQuery,
    pub requested: i64,
    pub limit: i64,
}

impl UsageGuard {
    /// A total that overflows `i64` never fits.
    pub fn admits(&self, aggregate: &UsageAggregate) -> bool {
        aggregate
            .net()
            .checked_add(self.requested)
            .map_or(false, |total| total <= self.limit)
    }
}

#[derive(Debug, Clone)]
pub enum GuardedAppend {
    /// Every guard held; all events are durable. `aggregates` are the
    /// pre-write sums, in guard order.
    Committed {
        events: Vec<UsageEvent>,
        aggregates: Vec<UsageAggregate>,
    },
    /// At least one guard failed on the fresh read; nothing was written.
    Rejected { aggregates: Vec<UsageAggregate> },
}

/// Provenance key for carry-over credits written into `period`.
#[derive(Debug, Clone)]
pub struct CarryOverScope {
    pub tenant_id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub carried_over_from: String,
    pub period: PeriodBoundary,
}

#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub tenant_id: Option<String>,
    pub customer_id: Option<String>,
    pub plan_id: Option<String>,
    pub metric_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Storage collaborator for the quota engine.
///
/// Implementations must make `append_guarded` and `append_carry_over` atomic:
/// the aggregate re-read and every insert happen in one transaction.
pub trait UsageLedger: Send + Sync {
    fn aggregate(&self, query: &UsageQuery) -> Result<UsageAggregate, StorageError>;

    fn append(&self, events: Vec<NewUsageEvent>) -> Result<Vec<UsageEvent>, StorageError>;

    fn append_guarded(
        &self,
        guards: &[UsageGuard],
        events: Vec<NewUsageEvent>,
    ) -> Result<GuardedAppend, StorageError>;

    /// Writes `events` unless a credit with the same provenance already
    /// exists, in which case `Ok(None)` is returned and nothing is written.
    fn append_carry_over(
        &self,
        scope: &CarryOverScope,
        events: Vec<NewUsageEvent>,
    ) -> Result<Option<Vec<UsageEvent>>, StorageError>;

    /// Newest first.
    fn list_events(&self, filter: &UsageFilter) -> Result<Vec<UsageEvent>, StorageError>;
}
