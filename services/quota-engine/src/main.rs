use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use quota_engine::engine::RolloverJob;
use quota_engine::ledger::UsageLedger;
use quota_engine::{PlanRegistry, QuotaDatabase, QuotaEngine, QuotaEngineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = QuotaEngineConfig::from_env()?;
    init_tracing(&config.log_level)?;

    info!(
        data_dir = %config.data_dir.display(),
        lock_timeout_ms = config.lock_timeout_ms,
        week_start = %config.week_start,
        "starting quota-engine service"
    );

    let database = Arc::new(QuotaDatabase::open(
        config.data_dir.clone(),
        config.busy_timeout(),
    )?);
    let audit = config.audit_sink.build(&database);
    let registry = Arc::new(PlanRegistry::new(
        Arc::clone(&database),
        config.plan_cache_ttl(),
        Arc::clone(&audit),
    ));
    let engine = QuotaEngine::from_config(database as Arc<dyn UsageLedger>, audit, &config);

    let rollover_task = if config.enable_carry_over_job {
        info!(
            interval_secs = config.rollover_interval_secs,
            "starting quota carry-over job"
        );
        Some(RolloverJob::new(engine, registry, config.rollover_interval()).start())
    } else {
        None
    };

    shutdown_signal().await;

    if let Some(task) = rollover_task {
        task.abort();
    }
    info!("quota-engine service shutting down");
    Ok(())
}

fn init_tracing(default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_tracing_init_reports_error() {
        let _ = init_tracing("debug");
        let err = init_tracing("info").unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
