use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::audit::{self, AuditFact};
use crate::ledger::{NewUsageEvent, UsageEvent, UsageFilter};
use crate::period::PeriodBoundary;
use crate::plan::QuotaPlan;

use super::checker::{ensure_positive, usage_query};
use super::{QuotaEngine, QuotaError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricUsage {
    /// Net of carry-over credits.
    pub usage: i64,
    pub limit: i64,
    pub remaining: i64,
    pub overage: i64,
    pub credited: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsageReport {
    pub customer_id: String,
    pub plan_id: String,
    pub period: PeriodBoundary,
    pub metrics: BTreeMap<String, MetricUsage>,
    pub is_over_quota: bool,
    pub days_until_reset: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricUsageSummary {
    pub metric_name: String,
    pub total_quantity: i64,
    pub carry_over_quantity: i64,
    pub record_count: u64,
    pub first_usage: DateTime<Utc>,
    pub last_usage: DateTime<Utc>,
}

impl QuotaEngine {
    /// Status of every metric in the plan for the period enclosing `now`.
    pub fn usage_report(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaUsageReport, QuotaError> {
        let period = self.periods.resolve_period(plan.reset_cadence, now);
        let mut metrics = BTreeMap::new();
        let mut is_over_quota = false;

        for (metric, limit) in &plan.limits {
            let aggregate = self
                .ledger
                .aggregate(&usage_query(plan, customer_id, metric, period))?;
            let usage = aggregate.net();
            let overage = usage.saturating_sub(*limit).max(0);
            is_over_quota |= overage > 0;

            metrics.insert(
                metric.clone(),
                MetricUsage {
                    usage,
                    limit: *limit,
                    remaining: limit.saturating_sub(usage).max(0),
                    overage,
                    credited: aggregate.credited,
                },
            );
        }

        Ok(QuotaUsageReport {
            customer_id: customer_id.to_string(),
            plan_id: plan.id.clone(),
            period,
            metrics,
            is_over_quota,
            days_until_reset: period.days_until_end(now),
        })
    }

    /// Limit plus carry-over credit active in the period enclosing `now`.
    pub fn effective_limit(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        metric_name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, QuotaError> {
        let limit = plan.limit_for(metric_name)?;
        let period = self.periods.resolve_period(plan.reset_cadence, now);
        let aggregate = self
            .ledger
            .aggregate(&usage_query(plan, customer_id, metric_name, period))?;
        Ok(limit.saturating_add(aggregate.credited))
    }

    /// Appends consumption without enforcing the limit. The metric must
    /// still belong to the plan.
    pub fn record_usage(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        metric_name: &str,
        quantity: i64,
        metadata: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<UsageEvent, QuotaError> {
        ensure_positive(quantity)?;
        plan.limit_for(metric_name)?;
        let period = self.periods.resolve_period(plan.reset_cadence, at);

        let mut written = self.ledger.append(vec![NewUsageEvent {
            tenant_id: plan.tenant_id.clone(),
            customer_id: customer_id.to_string(),
            plan_id: plan.id.clone(),
            metric_name: metric_name.to_string(),
            quantity,
            timestamp: at,
            period: Some(period),
            carried_over_from: None,
            metadata,
        }])?;
        let event = written.pop().ok_or_else(|| {
            QuotaError::StorageError(crate::storage::StorageError::InvalidRecord(
                "ledger returned no event for append".into(),
            ))
        })?;

        debug!(customer_id, metric = metric_name, quantity, "recorded usage");
        audit::emit(
            self.audit.as_ref(),
            AuditFact::new(customer_id, audit::RECORD_USAGE, "usage", &event.id).with_payload(
                json!({ "plan_id": plan.id, "metric_name": metric_name, "quantity": quantity }),
            ),
        );
        Ok(event)
    }

    pub fn list_usage(&self, filter: &UsageFilter) -> Result<Vec<UsageEvent>, QuotaError> {
        Ok(self.ledger.list_events(filter)?)
    }

    /// Per-metric totals over the events matching `filter`. Credits are
    /// reported separately instead of being netted out.
    pub fn summarize_usage(
        &self,
        filter: &UsageFilter,
    ) -> Result<Vec<MetricUsageSummary>, QuotaError> {
        let events = self.ledger.list_events(filter)?;
        Ok(summarize(&events))
    }
}

fn summarize(events: &[UsageEvent]) -> Vec<MetricUsageSummary> {
    let mut by_metric: BTreeMap<&str, MetricUsageSummary> = BTreeMap::new();

    for event in events {
        let summary = by_metric
            .entry(event.metric_name.as_str())
            .or_insert_with(|| MetricUsageSummary {
                metric_name: event.metric_name.clone(),
                total_quantity: 0,
                carry_over_quantity: 0,
                record_count: 0,
                first_usage: event.timestamp,
                last_usage: event.timestamp,
            });

        if event.is_credit() {
            summary.carry_over_quantity = summary.carry_over_quantity.saturating_sub(event.quantity);
        } else {
            summary.total_quantity = summary.total_quantity.saturating_add(event.quantity);
        }
        summary.record_count += 1;
        summary.first_usage = summary.first_usage.min(event.timestamp);
        summary.last_usage = summary.last_usage.max(event.timestamp);
    }

    by_metric.into_values().collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn event(metric: &str, quantity: i64, day: u32) -> UsageEvent {
        UsageEvent {
            id: format!("{metric}-{day}"),
            tenant_id: "tenant".into(),
            customer_id: "cust".into(),
            plan_id: "plan".into(),
            metric_name: metric.into(),
            quantity,
            timestamp: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
            period: None,
            carried_over_from: None,
            metadata: None,
        }
    }

    #[test]
    fn test_summary_separates_credits() {
        let events = vec![
            event("api_calls", 10, 5),
            event("api_calls", -4, 1),
            event("api_calls", 7, 9),
            event("storage_gb", 2, 3),
        ];

        let summaries = summarize(&events);
        assert_eq!(summaries.len(), 2);

        let api = &summaries[0];
        assert_eq!(api.metric_name, "api_calls");
        assert_eq!(api.total_quantity, 17);
        assert_eq!(api.carry_over_quantity, 4);
        assert_eq!(api.record_count, 3);
        assert_eq!(api.first_usage, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(api.last_usage, Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap());
    }
}
