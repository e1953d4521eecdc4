use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::period::PeriodBoundary;
use crate::plan::QuotaPlan;

use super::checker::usage_query;
use super::{QuotaEngine, QuotaError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricOverage {
    pub usage: i64,
    pub limit: i64,
    pub overage_quantity: i64,
    pub rate: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverageReport {
    pub customer_id: String,
    pub plan_id: String,
    pub period: PeriodBoundary,
    pub per_metric: BTreeMap<String, MetricOverage>,
    pub total_amount: f64,
}

impl QuotaEngine {
    /// Billable usage beyond each metric's limit in `period`, priced at the
    /// plan's overage rates. Read-only.
    pub fn calculate_overage(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        period: &PeriodBoundary,
    ) -> Result<OverageReport, QuotaError> {
        let mut per_metric = BTreeMap::new();
        let mut total_amount = 0.0;

        for (metric, limit) in &plan.limits {
            let query = usage_query(plan, customer_id, metric, *period);
            let usage = self.ledger.aggregate(&query)?.net();
            let overage_quantity = usage.saturating_sub(*limit).max(0);
            let rate = plan.overage_rate(metric);
            let amount = overage_quantity as f64 * rate;

            total_amount += amount;
            per_metric.insert(
                metric.clone(),
                MetricOverage {
                    usage,
                    limit: *limit,
                    overage_quantity,
                    rate,
                    amount,
                },
            );
        }

        Ok(OverageReport {
            customer_id: customer_id.to_string(),
            plan_id: plan.id.clone(),
            period: *period,
            per_metric,
            total_amount,
        })
    }
}
