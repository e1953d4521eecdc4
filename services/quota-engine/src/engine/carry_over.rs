use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::audit::{self, AuditFact};
use crate::ledger::{CarryOverScope, NewUsageEvent, UsageEvent};
use crate::period::PeriodBoundary;
use crate::plan::QuotaPlan;

use super::checker::usage_query;
use super::locks::LockKey;
use super::{QuotaEngine, QuotaError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarryOverReport {
    pub customer_id: String,
    pub old_period: PeriodBoundary,
    pub new_period: PeriodBoundary,
    pub credits: Vec<UsageEvent>,
    /// Credits for this rollover were already written by an earlier run.
    pub already_processed: bool,
}

impl CarryOverReport {
    fn empty(customer_id: &str, old_period: PeriodBoundary, new_period: PeriodBoundary) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            old_period,
            new_period,
            credits: Vec::new(),
            already_processed: false,
        }
    }

    pub fn credited_total(&self) -> i64 {
        self.credits.iter().map(|event| -event.quantity).sum()
    }
}

impl QuotaEngine {
    pub async fn process_carry_over(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        old_period: PeriodBoundary,
        new_period: PeriodBoundary,
    ) -> Result<CarryOverReport, QuotaError> {
        self.process_carry_over_at(plan, customer_id, old_period, new_period, Utc::now())
            .await
    }

    /// Credits unused quota from `old_period` into `new_period` as negative
    /// usage events, capped per metric by the plan.
    ///
    /// Safe to repeat: a second run for the same periods finds the earlier
    /// credits by their provenance marker and writes nothing.
    pub async fn process_carry_over_at(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        old_period: PeriodBoundary,
        new_period: PeriodBoundary,
        now: DateTime<Utc>,
    ) -> Result<CarryOverReport, QuotaError> {
        if !plan.carry_over {
            debug!(plan_id = %plan.id, "carry-over disabled for plan");
            return Ok(CarryOverReport::empty(customer_id, old_period, new_period));
        }
        if old_period.start >= old_period.end || new_period.start >= new_period.end {
            return Err(QuotaError::InvalidPeriod(
                "period start must precede its end".into(),
            ));
        }
        if old_period.end > new_period.start {
            return Err(QuotaError::InvalidPeriod(format!(
                "old period {old_period} overlaps new period {new_period}"
            )));
        }

        let _lock = self
            .locks
            .acquire(
                plan.metrics()
                    .map(|metric| LockKey::new(&plan.id, customer_id, metric)),
                self.lock_timeout,
            )
            .await?;

        let marker = old_period.marker();
        let mut credits = Vec::new();

        for (metric, limit) in &plan.limits {
            let query = usage_query(plan, customer_id, metric, old_period);
            let used = self.ledger.aggregate(&query)?.net();
            let unused = limit.saturating_sub(used).max(0);
            let carried = match plan.carry_over_cap(metric) {
                Some(cap) => unused.min(cap),
                None => unused,
            };
            if carried <= 0 {
                continue;
            }

            credits.push(NewUsageEvent {
                tenant_id: plan.tenant_id.clone(),
                customer_id: customer_id.to_string(),
                plan_id: plan.id.clone(),
                metric_name: metric.clone(),
                quantity: -carried,
                timestamp: now,
                period: Some(new_period),
                carried_over_from: Some(marker.clone()),
                metadata: Some(json!({
                    "type": "carry_over",
                    "original_unused": unused,
                    "carried_amount": carried,
                    "original_period": old_period,
                })),
            });
        }

        let mut report = CarryOverReport::empty(customer_id, old_period, new_period);
        if credits.is_empty() {
            debug!(plan_id = %plan.id, customer_id, "no unused quota to carry over");
            return Ok(report);
        }

        let scope = CarryOverScope {
            tenant_id: plan.tenant_id.clone(),
            customer_id: customer_id.to_string(),
            plan_id: plan.id.clone(),
            carried_over_from: marker,
            period: new_period,
        };

        match self.ledger.append_carry_over(&scope, credits)? {
            Some(written) => {
                report.credits = written;
                info!(
                    plan_id = %plan.id,
                    customer_id,
                    credits = report.credits.len(),
                    credited = report.credited_total(),
                    "processed quota carry-over"
                );
                audit::emit(
                    self.audit.as_ref(),
                    AuditFact::new("system", audit::PROCESS_QUOTA_CARRY_OVER, "quota_plan", &plan.id)
                        .with_payload(json!({
                            "customer_id": customer_id,
                            "old_period": old_period,
                            "new_period": new_period,
                            "credits": report
                                .credits
                                .iter()
                                .map(|event| json!({
                                    "metric_name": event.metric_name,
                                    "quantity": event.quantity,
                                    "usage_id": event.id,
                                }))
                                .collect::<Vec<_>>(),
                        })),
                );
            }
            None => {
                debug!(plan_id = %plan.id, customer_id, "carry-over already processed");
                report.already_processed = true;
            }
        }

        Ok(report)
    }
}
