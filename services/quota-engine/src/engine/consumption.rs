use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::audit::{self, AuditFact};
use crate::ledger::{GuardedAppend, NewUsageEvent, UsageEvent, UsageGuard};
use crate::period::PeriodBoundary;
use crate::plan::QuotaPlan;

use super::checker::{ensure_positive, usage_query, QuotaCheckResult};
use super::locks::LockKey;
use super::{QuotaEngine, QuotaError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeOutcome {
    pub check: QuotaCheckResult,
    pub event: Option<UsageEvent>,
    pub consumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub metric_name: String,
    pub requested_quantity: i64,
    pub metadata: Option<serde_json::Value>,
}

impl BatchItem {
    pub fn new(metric_name: &str, requested_quantity: i64) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            requested_quantity,
            metadata: None,
        }
    }
}

/// Per-item view of a batch. `check` is absent when the item could not be
/// evaluated at all (unknown metric); `error` then says why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub metric_name: String,
    pub check: Option<QuotaCheckResult>,
    pub event: Option<UsageEvent>,
    pub consumed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub all_allowed: bool,
    pub results: Vec<BatchItemResult>,
}

impl BatchOutcome {
    pub fn consumed_events(&self) -> impl Iterator<Item = &UsageEvent> {
        self.results.iter().filter_map(|result| result.event.as_ref())
    }
}

impl QuotaEngine {
    pub async fn check_and_consume(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        metric_name: &str,
        requested_quantity: i64,
        metadata: Option<serde_json::Value>,
    ) -> Result<ConsumeOutcome, QuotaError> {
        self.check_and_consume_at(
            plan,
            customer_id,
            metric_name,
            requested_quantity,
            metadata,
            Utc::now(),
        )
        .await
    }

    /// Checks the quota and, if the request fits, appends the usage event.
    ///
    /// The key lock for (plan, customer, metric) is held from the read
    /// through the write, and the write re-verifies the aggregate inside its
    /// own storage transaction. Nothing is written unless `consumed` is true.
    pub async fn check_and_consume_at(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        metric_name: &str,
        requested_quantity: i64,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, QuotaError> {
        ensure_positive(requested_quantity)?;
        let limit = plan.limit_for(metric_name)?;
        let period = self.periods.resolve_period(plan.reset_cadence, now);
        let query = usage_query(plan, customer_id, metric_name, period);

        let _lock = self
            .locks
            .acquire(
                [LockKey::new(&plan.id, customer_id, metric_name)],
                self.lock_timeout,
            )
            .await?;

        let current_usage = self.ledger.aggregate(&query)?.net();
        let check = QuotaCheckResult::evaluate(limit, current_usage, requested_quantity, period);

        if !check.allowed {
            debug!(
                plan_id = %plan.id,
                customer_id,
                metric = metric_name,
                current_usage,
                limit,
                requested_quantity,
                "quota request rejected"
            );
            self.audit_rejection(plan, customer_id, metric_name, requested_quantity, &check);
            return Ok(ConsumeOutcome {
                check,
                event: None,
                consumed: false,
            });
        }

        let guard = UsageGuard {
            query,
            requested: requested_quantity,
            limit,
        };
        let event = NewUsageEvent {
            tenant_id: plan.tenant_id.clone(),
            customer_id: customer_id.to_string(),
            plan_id: plan.id.clone(),
            metric_name: metric_name.to_string(),
            quantity: requested_quantity,
            timestamp: now,
            period: Some(period),
            carried_over_from: None,
            metadata,
        };

        match self.ledger.append_guarded(&[guard], vec![event])? {
            GuardedAppend::Committed { mut events, .. } => {
                let event = events.pop();
                audit::emit(
                    self.audit.as_ref(),
                    AuditFact::new(
                        customer_id,
                        audit::CONSUME_QUOTA,
                        "usage",
                        event.as_ref().map(|e| e.id.as_str()).unwrap_or_default(),
                    )
                    .with_payload(json!({
                        "plan_id": plan.id,
                        "metric_name": metric_name,
                        "requested_quantity": requested_quantity,
                        "quota_check": check,
                    })),
                );
                Ok(ConsumeOutcome {
                    check,
                    event,
                    consumed: true,
                })
            }
            GuardedAppend::Rejected { aggregates } => {
                // Another writer sharing the database got there first.
                let fresh = aggregates.first().map(|a| a.net()).unwrap_or(current_usage);
                let check = QuotaCheckResult::evaluate(limit, fresh, requested_quantity, period);
                warn!(
                    plan_id = %plan.id,
                    customer_id,
                    metric = metric_name,
                    "quota guard failed at write time"
                );
                self.audit_rejection(plan, customer_id, metric_name, requested_quantity, &check);
                Ok(ConsumeOutcome {
                    check,
                    event: None,
                    consumed: false,
                })
            }
        }
    }

    pub async fn batch_check_and_consume(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        items: Vec<BatchItem>,
    ) -> Result<BatchOutcome, QuotaError> {
        self.batch_check_and_consume_at(plan, customer_id, items, Utc::now())
            .await
    }

    /// All-or-nothing consumption of several metrics for one customer.
    ///
    /// Every item is evaluated before anything is written. Items naming the
    /// same metric are judged against their running total. An item whose
    /// metric is not in the plan fails on its own and makes the batch fail,
    /// but the remaining items are still evaluated and reported.
    pub async fn batch_check_and_consume_at(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        items: Vec<BatchItem>,
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, QuotaError> {
        if items.is_empty() {
            return Err(QuotaError::InvalidQuantity(
                "batch must contain at least one item".into(),
            ));
        }
        for item in &items {
            ensure_positive(item.requested_quantity)?;
        }

        let period = self.periods.resolve_period(plan.reset_cadence, now);
        let known: Vec<&str> = items
            .iter()
            .map(|item| item.metric_name.as_str())
            .filter(|metric| plan.limits.contains_key(*metric))
            .collect();

        let _lock = self
            .locks
            .acquire(
                known
                    .iter()
                    .map(|metric| LockKey::new(&plan.id, customer_id, metric)),
                self.lock_timeout,
            )
            .await?;

        let mut committed: BTreeMap<&str, i64> = BTreeMap::new();
        for metric in &known {
            if !committed.contains_key(metric) {
                let query = usage_query(plan, customer_id, metric, period);
                committed.insert(*metric, self.ledger.aggregate(&query)?.net());
            }
        }

        let (mut results, pending, all_allowed) =
            evaluate_batch(plan, &items, &committed, period);

        if !all_allowed {
            debug!(
                plan_id = %plan.id,
                customer_id,
                items = items.len(),
                "quota batch rejected"
            );
            self.audit_batch(audit::BATCH_REJECT_QUOTA, plan, customer_id, &results);
            return Ok(BatchOutcome {
                all_allowed,
                results,
            });
        }

        let guards: Vec<UsageGuard> = pending
            .iter()
            .map(|(metric, requested)| UsageGuard {
                query: usage_query(plan, customer_id, metric, period),
                requested: *requested,
                limit: plan.limits[*metric],
            })
            .collect();
        let events: Vec<NewUsageEvent> = items
            .iter()
            .map(|item| NewUsageEvent {
                tenant_id: plan.tenant_id.clone(),
                customer_id: customer_id.to_string(),
                plan_id: plan.id.clone(),
                metric_name: item.metric_name.clone(),
                quantity: item.requested_quantity,
                timestamp: now,
                period: Some(period),
                carried_over_from: None,
                metadata: item.metadata.clone(),
            })
            .collect();

        match self.ledger.append_guarded(&guards, events)? {
            GuardedAppend::Committed { events, .. } => {
                for (result, event) in results.iter_mut().zip(events) {
                    result.event = Some(event);
                    result.consumed = true;
                }
                self.audit_batch(audit::BATCH_CONSUME_QUOTA, plan, customer_id, &results);
                Ok(BatchOutcome {
                    all_allowed: true,
                    results,
                })
            }
            GuardedAppend::Rejected { aggregates } => {
                let fresh: BTreeMap<&str, i64> = pending
                    .keys()
                    .copied()
                    .zip(aggregates.iter().map(|a| a.net()))
                    .collect();
                let (results, _, _) = evaluate_batch(plan, &items, &fresh, period);
                warn!(
                    plan_id = %plan.id,
                    customer_id,
                    "quota batch guard failed at write time"
                );
                self.audit_batch(audit::BATCH_REJECT_QUOTA, plan, customer_id, &results);
                Ok(BatchOutcome {
                    all_allowed: false,
                    results,
                })
            }
        }
    }

    fn audit_rejection(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        metric_name: &str,
        requested_quantity: i64,
        check: &QuotaCheckResult,
    ) {
        audit::emit(
            self.audit.as_ref(),
            AuditFact::new(customer_id, audit::REJECT_QUOTA, "quota_plan", &plan.id).with_payload(
                json!({
                    "metric_name": metric_name,
                    "requested_quantity": requested_quantity,
                    "quota_check": check,
                }),
            ),
        );
    }

    fn audit_batch(
        &self,
        action: &str,
        plan: &QuotaPlan,
        customer_id: &str,
        results: &[BatchItemResult],
    ) {
        let items: Vec<serde_json::Value> = results
            .iter()
            .map(|result| {
                json!({
                    "metric_name": result.metric_name,
                    "consumed": result.consumed,
                    "usage_id": result.event.as_ref().map(|e| e.id.clone()),
                    "error": result.error,
                })
            })
            .collect();
        audit::emit(
            self.audit.as_ref(),
            AuditFact::new(customer_id, action, "usage", "batch")
                .with_payload(json!({ "plan_id": plan.id, "results": items })),
        );
    }
}

/// Judges every item against `committed` usage plus the quantities of the
/// items before it. Returns the per-item results, the total requested per
/// known metric, and whether every item passed.
fn evaluate_batch<'a>(
    plan: &QuotaPlan,
    items: &'a [BatchItem],
    committed: &BTreeMap<&str, i64>,
    period: PeriodBoundary,
) -> (Vec<BatchItemResult>, BTreeMap<&'a str, i64>, bool) {
    let mut pending: BTreeMap<&'a str, i64> = BTreeMap::new();
    let mut all_allowed = true;
    let mut results = Vec::with_capacity(items.len());

    for item in items {
        let metric = item.metric_name.as_str();
        let result = match plan.limit_for(metric) {
            Ok(limit) => {
                let already = pending.entry(metric).or_insert(0);
                let current = committed
                    .get(metric)
                    .copied()
                    .unwrap_or(0)
                    .saturating_add(*already);
                let check =
                    QuotaCheckResult::evaluate(limit, current, item.requested_quantity, period);
                *already = already.saturating_add(item.requested_quantity);
                all_allowed &= check.allowed;
                BatchItemResult {
                    metric_name: item.metric_name.clone(),
                    check: Some(check),
                    event: None,
                    consumed: false,
                    error: None,
                }
            }
            Err(err) => {
                all_allowed = false;
                BatchItemResult {
                    metric_name: item.metric_name.clone(),
                    check: None,
                    event: None,
                    consumed: false,
                    error: Some(err.to_string()),
                }
            }
        };
        results.push(result);
    }

    (results, pending, all_allowed)
}
