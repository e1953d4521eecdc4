use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("no quota plan found: {0}")]
    PlanNotFound(String),
    #[error("metric {metric} not found in quota plan {plan_id}")]
    MetricNotInPlan { plan_id: String, metric: String },
    /// `waited_ms` is the in-process lock wait. It is `None` when the
    /// contention was reported by the database after its own busy timeout.
    #[error(
        "quota lock contention on {key}{}",
        .waited_ms.map(|ms| format!(" (waited {ms}ms)")).unwrap_or_default()
    )]
    ContentionTimeout {
        key: String,
        waited_ms: Option<u64>,
    },
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
    #[error("invalid quota plan: {0}")]
    InvalidPlan(String),
    #[error("quota plan {plan_id} is bound to {bindings} customer(s)")]
    PlanInUse { plan_id: String, bindings: u64 },
    #[error("storage error: {0}")]
    StorageError(StorageError),
}

impl QuotaError {
    /// Transient failures the caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QuotaError::ContentionTimeout { .. })
    }
}

impl From<StorageError> for QuotaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Busy => QuotaError::ContentionTimeout {
                key: "ledger".to_string(),
                waited_ms: None,
            },
            other => QuotaError::StorageError(other),
        }
    }
}
