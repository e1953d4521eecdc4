use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::QuotaError;
use crate::period::ResetCadence;

/// Billing template: per-metric limits, overage rates and carry-over policy.
///
/// The limit map is closed-world. A metric missing from `limits` is rejected
/// with [`QuotaError::MetricNotInPlan`] rather than treated as unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPlan {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub limits: BTreeMap<String, i64>,
    pub overage_rates: BTreeMap<String, f64>,
    pub reset_cadence: ResetCadence,
    pub carry_over: bool,
    pub max_carry_over: BTreeMap<String, i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaPlan {
    pub fn limit_for(&self, metric_name: &str) -> Result<i64, QuotaError> {
        self.limits
            .get(metric_name)
            .copied()
            .ok_or_else(|| QuotaError::MetricNotInPlan {
                plan_id: self.id.clone(),
                metric: metric_name.to_string(),
            })
    }

    /// Currency per unit over the limit. Metrics without a rate bill nothing.
    pub fn overage_rate(&self, metric_name: &str) -> f64 {
        self.overage_rates.get(metric_name).copied().unwrap_or(0.0)
    }

    /// `None` means unused quota carries over uncapped.
    pub fn carry_over_cap(&self, metric_name: &str) -> Option<i64> {
        self.max_carry_over.get(metric_name).copied()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.limits.keys().map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.tenant_id.trim().is_empty() {
            return Err(QuotaError::InvalidPlan("tenant_id cannot be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(QuotaError::InvalidPlan("name cannot be empty".into()));
        }
        if self.limits.is_empty() {
            return Err(QuotaError::InvalidPlan(
                "plan must define at least one metric limit".into(),
            ));
        }
        for (metric, limit) in &self.limits {
            if metric.trim().is_empty() {
                return Err(QuotaError::InvalidPlan("metric names cannot be empty".into()));
            }
            if *limit < 0 {
                return Err(QuotaError::InvalidPlan(format!(
                    "limit for {metric} must not be negative"
                )));
            }
        }
        for (metric, rate) in &self.overage_rates {
            if !self.limits.contains_key(metric) {
                return Err(QuotaError::InvalidPlan(format!(
                    "overage rate references unknown metric {metric}"
                )));
            }
            if !rate.is_finite() || *rate < 0.0 {
                return Err(QuotaError::InvalidPlan(format!(
                    "overage rate for {metric} must be a non-negative number"
                )));
            }
        }
        for (metric, cap) in &self.max_carry_over {
            if !self.limits.contains_key(metric) {
                return Err(QuotaError::InvalidPlan(format!(
                    "carry-over cap references unknown metric {metric}"
                )));
            }
            if *cap < 0 {
                return Err(QuotaError::InvalidPlan(format!(
                    "carry-over cap for {metric} must not be negative"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuotaPlan {
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub limits: BTreeMap<String, i64>,
    pub overage_rates: BTreeMap<String, f64>,
    pub reset_cadence: ResetCadence,
    pub carry_over: bool,
    pub max_carry_over: BTreeMap<String, i64>,
}

impl NewQuotaPlan {
    pub fn new(tenant_id: &str, name: &str, reset_cadence: ResetCadence) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            description: None,
            limits: BTreeMap::new(),
            overage_rates: BTreeMap::new(),
            reset_cadence,
            carry_over: false,
            max_carry_over: BTreeMap::new(),
        }
    }

    pub fn with_limit(mut self, metric_name: &str, limit: i64) -> Self {
        self.limits.insert(metric_name.to_string(), limit);
        self
    }

    pub fn with_overage_rate(mut self, metric_name: &str, rate: f64) -> Self {
        self.overage_rates.insert(metric_name.to_string(), rate);
        self
    }

    pub fn with_carry_over(mut self) -> Self {
        self.carry_over = true;
        self
    }

    pub fn with_carry_over_cap(mut self, metric_name: &str, cap: i64) -> Self {
        self.carry_over = true;
        self.max_carry_over.insert(metric_name.to_string(), cap);
        self
    }

    /// Materializes the plan with a fresh id. Does not persist it.
    pub fn into_plan(self) -> QuotaPlan {
        let now = Utc::now();
        QuotaPlan {
            id: Uuid::new_v4().to_string(),
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            limits: self.limits,
            overage_rates: self.overage_rates,
            reset_cadence: self.reset_cadence,
            carry_over: self.carry_over,
            max_carry_over: self.max_carry_over,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaPlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub limits: Option<BTreeMap<String, i64>>,
    pub overage_rates: Option<BTreeMap<String, f64>>,
    pub reset_cadence: Option<ResetCadence>,
    pub carry_over: Option<bool>,
    pub max_carry_over: Option<BTreeMap<String, i64>>,
}

impl QuotaPlanUpdate {
    pub fn apply_to(self, plan: &mut QuotaPlan) {
        if let Some(name) = self.name {
            plan.name = name;
        }
        if let Some(description) = self.description {
            plan.description = Some(description);
        }
        if let Some(limits) = self.limits {
            plan.limits = limits;
        }
        if let Some(rates) = self.overage_rates {
            plan.overage_rates = rates;
        }
        if let Some(cadence) = self.reset_cadence {
            plan.reset_cadence = cadence;
        }
        if let Some(carry_over) = self.carry_over {
            plan.carry_over = carry_over;
        }
        if let Some(caps) = self.max_carry_over {
            plan.max_carry_over = caps;
        }
        plan.updated_at = Utc::now();
    }
}

/// Active plan assignment for one customer of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBinding {
    pub tenant_id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub bound_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> QuotaPlan {
        NewQuotaPlan::new("tenant-a", "starter", ResetCadence::Monthly)
            .with_limit("api_calls", 100)
            .with_overage_rate("api_calls", 0.01)
            .into_plan()
    }

    #[test]
    fn test_limit_lookup_is_closed_world() {
        let plan = plan();
        assert_eq!(plan.limit_for("api_calls").unwrap(), 100);
        assert!(matches!(
            plan.limit_for("api_call"),
            Err(QuotaError::MetricNotInPlan { .. })
        ));
    }

    #[test]
    fn test_missing_rate_defaults_to_zero() {
        let plan = plan();
        assert_eq!(plan.overage_rate("api_calls"), 0.01);
        assert_eq!(plan.overage_rate("storage_gb"), 0.0);
    }

    #[test]
    fn test_validation_rejects_dangling_references() {
        let mut plan = plan();
        assert!(plan.validate().is_ok());

        plan.overage_rates.insert("storage_gb".into(), 0.5);
        assert!(matches!(plan.validate(), Err(QuotaError::InvalidPlan(_))));
        plan.overage_rates.remove("storage_gb");

        plan.max_carry_over.insert("storage_gb".into(), 5);
        assert!(plan.validate().is_err());
        plan.max_carry_over.clear();

        plan.limits.insert("storage_gb".into(), -1);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_update_keeps_unset_fields() {
        let mut plan = plan();
        let update = QuotaPlanUpdate {
            carry_over: Some(true),
            ..Default::default()
        };
        update.apply_to(&mut plan);
        assert!(plan.carry_over);
        assert_eq!(plan.name, "starter");
        assert_eq!(plan.limits.get("api_calls"), Some(&100));
    }
}
