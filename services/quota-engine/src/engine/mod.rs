pub mod carry_over;
pub mod checker;
pub mod consumption;
pub mod error;
pub mod locks;
pub mod overage;
pub mod rollover;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use chrono::Weekday;

use crate::audit::AuditSink;
use crate::config::QuotaEngineConfig;
use crate::ledger::UsageLedger;
use crate::period::PeriodCalculator;

pub use carry_over::CarryOverReport;
pub use checker::QuotaCheckResult;
pub use consumption::{BatchItem, BatchItemResult, BatchOutcome, ConsumeOutcome};
pub use error::QuotaError;
pub use locks::{KeyLocks, LockKey};
pub use overage::{MetricOverage, OverageReport};
pub use rollover::RolloverJob;
pub use usage::{MetricUsage, MetricUsageSummary, QuotaUsageReport};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Quota metering core. Cheap to clone; clones share the ledger, the lock
/// table and the audit sink.
#[derive(Clone)]
pub struct QuotaEngine {
    ledger: Arc<dyn UsageLedger>,
    periods: PeriodCalculator,
    locks: Arc<KeyLocks>,
    audit: Arc<dyn AuditSink>,
    lock_timeout: Duration,
}

impl QuotaEngine {
    pub fn new(ledger: Arc<dyn UsageLedger>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            ledger,
            periods: PeriodCalculator::default(),
            locks: Arc::new(KeyLocks::new()),
            audit,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn from_config(
        ledger: Arc<dyn UsageLedger>,
        audit: Arc<dyn AuditSink>,
        config: &QuotaEngineConfig,
    ) -> Self {
        Self::new(ledger, audit)
            .with_week_start(config.week_start)
            .with_lock_timeout(config.lock_timeout())
    }

    pub fn with_week_start(mut self, week_start: Weekday) -> Self {
        self.periods = PeriodCalculator::new(week_start);
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn periods(&self) -> &PeriodCalculator {
        &self.periods
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn locks(&self) -> &Arc<KeyLocks> {
        &self.locks
    }
}
