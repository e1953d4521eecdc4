use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use quota_engine::audit::TracingAuditSink;
use quota_engine::ledger::UsageLedger;
use quota_engine::{NewQuotaPlan, QuotaDatabase, QuotaEngine, QuotaPlan, ResetCadence};
use serde_json::json;
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

// Re-export external crates needed by benches and workspace tests
pub use quota_engine;
pub use serde_json;
pub use tracing_subscriber;
pub use uuid;

pub const BENCH_TENANT: &str = "tenant-bench";

/// Engine over a throwaway database, with one monthly plan.
pub struct QuotaBenchFixture {
    pub engine: QuotaEngine,
    pub database: Arc<QuotaDatabase>,
    pub plan: QuotaPlan,
    pub temp_dir: TempDir,
}

impl QuotaBenchFixture {
    pub fn new(limits: &[(&str, i64)]) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let database = Arc::new(QuotaDatabase::new(temp_dir.path().to_path_buf())?);
        let engine = QuotaEngine::new(
            database.clone() as Arc<dyn UsageLedger>,
            Arc::new(TracingAuditSink),
        );

        let plan = limits
            .iter()
            .fold(
                NewQuotaPlan::new(BENCH_TENANT, "bench", ResetCadence::Monthly),
                |plan, (metric, limit)| plan.with_limit(metric, *limit),
            )
            .into_plan();

        Ok(Self {
            engine,
            database,
            plan,
            temp_dir,
        })
    }

    /// Writes `events` unit-sized usage records for `customer_id` without
    /// enforcing the limit, so benches can start from a loaded ledger.
    pub fn seed_usage(&self, customer_id: &str, metric: &str, events: usize) -> Result<()> {
        for i in 0..events {
            self.engine.record_usage(
                &self.plan,
                customer_id,
                metric,
                1,
                Some(json!({ "seed": i })),
                reference_time(),
            )?;
        }
        debug!(customer_id, metric, events, "seeded bench usage");
        Ok(())
    }
}

/// Fixed instant inside a monthly period so benches do not straddle a reset.
pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn random_customer_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}
