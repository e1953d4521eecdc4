use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::plan::PlanRegistry;

use super::{QuotaEngine, QuotaError};

/// Periodically credits unused quota of the previous period for every bound
/// customer whose plan allows carry-over. Repeated runs inside one period
/// are no-ops thanks to the ledger's provenance check.
#[derive(Clone)]
pub struct RolloverJob {
    engine: QuotaEngine,
    registry: Arc<PlanRegistry>,
    interval: Duration,
}

impl RolloverJob {
    pub fn new(engine: QuotaEngine, registry: Arc<PlanRegistry>, interval: Duration) -> Self {
        Self {
            engine,
            registry,
            interval,
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let job = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(job.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                match job.run_once(Utc::now()).await {
                    Ok(count) if count > 0 => {
                        debug!(customers = count, "processed quota carry-over");
                    }
                    Ok(_) => {
                        debug!("no quota carry-over pending");
                    }
                    Err(err) => {
                        error!(error = %err, "quota carry-over sweep failed");
                    }
                }
            }
        })
    }

    /// Runs one sweep and returns how many customers received new credits.
    /// A failure for one customer is logged and does not stop the sweep.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, QuotaError> {
        let bindings = self.registry.list_bindings()?;
        let mut credited = 0;

        for binding in bindings {
            let plan = match self.registry.get_plan(&binding.plan_id) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(
                        plan_id = %binding.plan_id,
                        customer_id = %binding.customer_id,
                        error = %err,
                        "skipping carry-over for unresolvable plan"
                    );
                    continue;
                }
            };
            if !plan.carry_over || !plan.reset_cadence.is_periodic() {
                continue;
            }

            let periods = self.engine.periods();
            let new_period = periods.resolve_period(plan.reset_cadence, now);
            let Some(old_period) = periods.previous_period(plan.reset_cadence, &new_period) else {
                continue;
            };

            match self
                .engine
                .process_carry_over_at(&plan, &binding.customer_id, old_period, new_period, now)
                .await
            {
                Ok(report) if !report.credits.is_empty() => credited += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        plan_id = %plan.id,
                        customer_id = %binding.customer_id,
                        error = %err,
                        "quota carry-over failed for customer"
                    );
                }
            }
        }

        Ok(credited)
    }
}
