use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::UsageQuery;
use crate::period::PeriodBoundary;
use crate::plan::QuotaPlan;

use super::{QuotaEngine, QuotaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    pub current_usage: i64,
    pub limit: i64,
    pub remaining: i64,
    pub would_exceed: bool,
    pub overage_amount: i64,
    pub period: PeriodBoundary,
}

impl QuotaCheckResult {
    /// `current_usage` is already net of carry-over credits, so the limit
    /// itself never moves. A projection that does not fit in `i64` is over
    /// any limit; its overage saturates.
    pub fn evaluate(
        limit: i64,
        current_usage: i64,
        requested_quantity: i64,
        period: PeriodBoundary,
    ) -> Self {
        let projected = current_usage.checked_add(requested_quantity);
        let would_exceed = projected.map_or(true, |total| total > limit);
        let overage_amount = match projected {
            Some(total) if would_exceed => total.saturating_sub(limit),
            Some(_) => 0,
            None => i64::MAX,
        };

        Self {
            allowed: !would_exceed,
            current_usage,
            limit,
            remaining: limit.saturating_sub(current_usage).max(0),
            would_exceed,
            overage_amount,
            period,
        }
    }
}

pub(crate) fn usage_query(
    plan: &QuotaPlan,
    customer_id: &str,
    metric_name: &str,
    period: PeriodBoundary,
) -> UsageQuery {
    UsageQuery {
        tenant_id: plan.tenant_id.clone(),
        customer_id: customer_id.to_string(),
        plan_id: plan.id.clone(),
        metric_name: metric_name.to_string(),
        period,
    }
}

pub(crate) fn ensure_positive(quantity: i64) -> Result<(), QuotaError> {
    if quantity <= 0 {
        return Err(QuotaError::InvalidQuantity(format!(
            "requested quantity must be positive, got {quantity}"
        )));
    }
    Ok(())
}

impl QuotaEngine {
    /// Read-only quota decision for `requested_quantity` more units of
    /// `metric_name` in the period enclosing `reference_time`.
    pub fn check(
        &self,
        plan: &QuotaPlan,
        customer_id: &str,
        metric_name: &str,
        requested_quantity: i64,
        reference_time: DateTime<Utc>,
    ) -> Result<QuotaCheckResult, QuotaError> {
        ensure_positive(requested_quantity)?;
        let limit = plan.limit_for(metric_name)?;
        let period = self.periods.resolve_period(plan.reset_cadence, reference_time);

        let query = usage_query(plan, customer_id, metric_name, period);
        let current_usage = self.ledger.aggregate(&query)?.net();

        Ok(QuotaCheckResult::evaluate(
            limit,
            current_usage,
            requested_quantity,
            period,
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn period() -> PeriodBoundary {
        PeriodBoundary::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_request_over_limit_reports_overage() {
        let result = QuotaCheckResult::evaluate(100, 95, 10, period());
        assert!(!result.allowed);
        assert!(result.would_exceed);
        assert_eq!(result.remaining, 5);
        assert_eq!(result.overage_amount, 5);
    }

    #[test]
    fn test_request_reaching_limit_exactly_is_allowed() {
        let result = QuotaCheckResult::evaluate(100, 95, 5, period());
        assert!(result.allowed);
        assert_eq!(result.overage_amount, 0);
        assert_eq!(result.remaining, 5);
    }

    #[test]
    fn test_credits_raise_headroom_without_moving_limit() {
        let result = QuotaCheckResult::evaluate(100, -40, 130, period());
        assert!(result.allowed);
        assert_eq!(result.limit, 100);
        assert_eq!(result.remaining, 140);
    }

    #[test]
    fn test_usage_beyond_limit_floors_remaining() {
        let result = QuotaCheckResult::evaluate(10, 12, 1, period());
        assert_eq!(result.remaining, 0);
        assert_eq!(result.overage_amount, 3);
    }

    #[test]
    fn test_projection_overflow_is_rejected() {
        let result = QuotaCheckResult::evaluate(100, 1, i64::MAX, period());
        assert!(!result.allowed);
        assert!(result.would_exceed);
        assert_eq!(result.overage_amount, i64::MAX);
        assert_eq!(result.remaining, 99);

        let credited = QuotaCheckResult::evaluate(100, -40, i64::MAX, period());
        assert!(!credited.allowed);
        assert_eq!(credited.overage_amount, i64::MAX - 140);
    }

    #[test]
    fn test_non_positive_quantity_is_rejected() {
        assert!(ensure_positive(1).is_ok());
        assert!(matches!(ensure_positive(0), Err(QuotaError::InvalidQuantity(_))));
        assert!(ensure_positive(-3).is_err());
    }
}
