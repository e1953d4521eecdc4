//! Quota metering: plans with per-metric limits, an append-only usage
//! ledger, and an engine that admits consumption without ever letting
//! concurrent callers push a customer past a limit.

pub mod audit;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod period;
pub mod plan;
pub mod storage;

pub use config::QuotaEngineConfig;
pub use engine::{QuotaEngine, QuotaError};
pub use ledger::{UsageEvent, UsageFilter, UsageLedger};
pub use period::{PeriodBoundary, PeriodCalculator, ResetCadence};
pub use plan::{NewQuotaPlan, PlanRegistry, PlanResolver, QuotaPlan};
pub use storage::{QuotaDatabase, StorageError};
