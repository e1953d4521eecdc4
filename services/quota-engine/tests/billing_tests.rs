use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use quota_engine::audit::{self, DatabaseAuditSink};
use quota_engine::engine::RolloverJob;
use quota_engine::ledger::{UsageFilter, UsageLedger};
use quota_engine::{
    NewQuotaPlan, PeriodBoundary, PlanRegistry, PlanResolver, QuotaDatabase, QuotaEngine,
    QuotaError, QuotaPlan, ResetCadence,
};
use tempfile::{tempdir, TempDir};

struct Fixture {
    _temp: TempDir,
    database: Arc<QuotaDatabase>,
    registry: Arc<PlanRegistry>,
    engine: QuotaEngine,
}

fn fixture() -> Fixture {
    let temp = tempdir().expect("failed to create temp dir");
    let database =
        Arc::new(QuotaDatabase::new(temp.path().to_path_buf()).expect("database should open"));
    let sink = Arc::new(DatabaseAuditSink::new(Arc::clone(&database)));
    let registry = Arc::new(PlanRegistry::new(
        Arc::clone(&database),
        Duration::from_secs(30),
        sink.clone(),
    ));
    let engine = QuotaEngine::new(database.clone() as Arc<dyn UsageLedger>, sink);
    Fixture {
        _temp: temp,
        database,
        registry,
        engine,
    }
}

fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
}

fn january() -> PeriodBoundary {
    PeriodBoundary::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    )
}

fn february() -> PeriodBoundary {
    PeriodBoundary::new(
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
    )
}

fn carry_plan(cap: i64) -> QuotaPlan {
    NewQuotaPlan::new("tenant-a", "growth", ResetCadence::Monthly)
        .with_limit("api_calls", 100)
        .with_carry_over_cap("api_calls", cap)
        .into_plan()
}

#[tokio::test]
async fn test_carry_over_credits_unused_quota_under_cap() {
    let fx = fixture();
    let plan = carry_plan(50);
    fx.engine
        .record_usage(&plan, "cust-1", "api_calls", 60, None, at(2024, 1, 10))
        .unwrap();

    let report = fx
        .engine
        .process_carry_over_at(&plan, "cust-1", january(), february(), at(2024, 2, 1))
        .await
        .unwrap();

    assert!(!report.already_processed);
    assert_eq!(report.credits.len(), 1);
    let credit = &report.credits[0];
    assert_eq!(credit.quantity, -40);
    assert!(credit.is_credit());
    assert_eq!(credit.period, Some(february()));
    assert_eq!(credit.carried_over_from.as_deref(), Some(january().marker().as_str()));

    let check = fx
        .engine
        .check(&plan, "cust-1", "api_calls", 140, at(2024, 2, 2))
        .unwrap();
    assert!(check.allowed);
    assert_eq!(check.limit, 100);
    assert_eq!(check.current_usage, -40);
    assert_eq!(
        fx.engine
            .effective_limit(&plan, "cust-1", "api_calls", at(2024, 2, 2))
            .unwrap(),
        140
    );
}

#[tokio::test]
async fn test_carry_over_is_capped() {
    let fx = fixture();
    let plan = carry_plan(20);
    fx.engine
        .record_usage(&plan, "cust-1", "api_calls", 60, None, at(2024, 1, 10))
        .unwrap();

    let report = fx
        .engine
        .process_carry_over_at(&plan, "cust-1", january(), february(), at(2024, 2, 1))
        .await
        .unwrap();
    assert_eq!(report.credited_total(), 20);
    assert_eq!(report.credits[0].quantity, -20);
}

#[tokio::test]
async fn test_carry_over_runs_once_per_period() {
    let fx = fixture();
    let plan = carry_plan(50);

    let first = fx
        .engine
        .process_carry_over_at(&plan, "cust-1", january(), february(), at(2024, 2, 1))
        .await
        .unwrap();
    let second = fx
        .engine
        .process_carry_over_at(&plan, "cust-1", january(), february(), at(2024, 2, 3))
        .await
        .unwrap();

    assert_eq!(first.credits.len(), 1);
    assert!(second.already_processed);
    assert!(second.credits.is_empty());

    let events = fx
        .database
        .list_events(&UsageFilter {
            customer_id: Some("cust-1".into()),
            ..UsageFilter::default()
        })
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].quantity, -50);
    assert_eq!(
        fx.database
            .list_audit_facts(Some(audit::PROCESS_QUOTA_CARRY_OVER))
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_carry_over_skipped_when_disabled_or_exhausted() {
    let fx = fixture();
    let flat = NewQuotaPlan::new("tenant-a", "flat", ResetCadence::Monthly)
        .with_limit("api_calls", 100)
        .into_plan();
    let report = fx
        .engine
        .process_carry_over_at(&flat, "cust-1", january(), february(), at(2024, 2, 1))
        .await
        .unwrap();
    assert!(report.credits.is_empty());
    assert!(!report.already_processed);

    let plan = carry_plan(50);
    fx.engine
        .record_usage(&plan, "cust-2", "api_calls", 120, None, at(2024, 1, 10))
        .unwrap();
    let report = fx
        .engine
        .process_carry_over_at(&plan, "cust-2", january(), february(), at(2024, 2, 1))
        .await
        .unwrap();
    assert!(report.credits.is_empty());
}

#[tokio::test]
async fn test_carry_over_rejects_overlapping_periods() {
    let fx = fixture();
    let err = fx
        .engine
        .process_carry_over_at(&carry_plan(10), "cust-1", february(), january(), at(2024, 2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::InvalidPeriod(_)));
}

#[test]
fn test_overage_is_priced_per_metric() {
    let fx = fixture();
    let plan = NewQuotaPlan::new("tenant-a", "metered", ResetCadence::Monthly)
        .with_limit("api_calls", 100)
        .with_limit("storage_gb", 10)
        .with_overage_rate("api_calls", 0.5)
        .into_plan();

    fx.engine
        .record_usage(&plan, "cust-1", "api_calls", 130, None, at(2024, 1, 5))
        .unwrap();
    fx.engine
        .record_usage(&plan, "cust-1", "storage_gb", 12, None, at(2024, 1, 6))
        .unwrap();

    let report = fx
        .engine
        .calculate_overage(&plan, "cust-1", &january())
        .unwrap();

    let api = &report.per_metric["api_calls"];
    assert_eq!(api.usage, 130);
    assert_eq!(api.overage_quantity, 30);
    assert!((api.amount - 15.0).abs() < f64::EPSILON);

    let storage = &report.per_metric["storage_gb"];
    assert_eq!(storage.overage_quantity, 2);
    assert_eq!(storage.amount, 0.0);
    assert!((report.total_amount - 15.0).abs() < f64::EPSILON);
}

#[test]
fn test_usage_report_flags_over_quota() {
    let fx = fixture();
    let plan = NewQuotaPlan::new("tenant-a", "pro", ResetCadence::Monthly)
        .with_limit("api_calls", 100)
        .with_limit("storage_gb", 10)
        .into_plan();
    fx.engine
        .record_usage(&plan, "cust-1", "api_calls", 101, None, at(2024, 1, 5))
        .unwrap();

    let report = fx
        .engine
        .usage_report(&plan, "cust-1", at(2024, 1, 29))
        .unwrap();
    assert!(report.is_over_quota);
    assert_eq!(report.period, january());
    assert_eq!(report.metrics["api_calls"].overage, 1);
    assert_eq!(report.metrics["api_calls"].remaining, 0);
    assert_eq!(report.metrics["storage_gb"].remaining, 10);
    assert_eq!(report.days_until_reset, 3);
}

#[test]
fn test_record_usage_requires_known_metric() {
    let fx = fixture();
    let plan = carry_plan(10);
    let err = fx
        .engine
        .record_usage(&plan, "cust-1", "bandwidth", 5, None, at(2024, 1, 5))
        .unwrap_err();
    assert!(matches!(err, QuotaError::MetricNotInPlan { .. }));
}

#[test]
fn test_summarize_usage_groups_by_metric() {
    let fx = fixture();
    let plan = NewQuotaPlan::new("tenant-a", "pro", ResetCadence::Monthly)
        .with_limit("api_calls", 100)
        .with_limit("storage_gb", 10)
        .into_plan();
    for day in 1..=3 {
        fx.engine
            .record_usage(&plan, "cust-1", "api_calls", 10, None, at(2024, 1, day))
            .unwrap();
    }
    fx.engine
        .record_usage(&plan, "cust-1", "storage_gb", 4, None, at(2024, 1, 2))
        .unwrap();

    let summaries = fx
        .engine
        .summarize_usage(&UsageFilter {
            customer_id: Some("cust-1".into()),
            ..UsageFilter::default()
        })
        .unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].metric_name, "api_calls");
    assert_eq!(summaries[0].total_quantity, 30);
    assert_eq!(summaries[0].record_count, 3);
    assert_eq!(summaries[0].first_usage, at(2024, 1, 1));
    assert_eq!(summaries[1].total_quantity, 4);

    let page = fx
        .engine
        .list_usage(&UsageFilter {
            customer_id: Some("cust-1".into()),
            metric_name: Some("api_calls".into()),
            limit: Some(2),
            ..UsageFilter::default()
        })
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].timestamp, at(2024, 1, 3));
}

#[tokio::test]
async fn test_rollover_sweep_uses_bound_plans() {
    let fx = fixture();
    let plan = fx
        .registry
        .create_plan(
            NewQuotaPlan::new("tenant-a", "growth", ResetCadence::Monthly)
                .with_limit("api_calls", 100)
                .with_carry_over_cap("api_calls", 50),
        )
        .unwrap();
    fx.registry
        .bind_customer("tenant-a", "cust-1", &plan.id)
        .unwrap();

    let resolved = fx.registry.resolve_plan("tenant-a", "cust-1").unwrap();
    fx.engine
        .record_usage(&resolved, "cust-1", "api_calls", 70, None, at(2024, 1, 20))
        .unwrap();

    let job = RolloverJob::new(
        fx.engine.clone(),
        Arc::clone(&fx.registry),
        Duration::from_secs(60),
    );
    assert_eq!(job.run_once(at(2024, 2, 1)).await.unwrap(), 1);
    assert_eq!(job.run_once(at(2024, 2, 2)).await.unwrap(), 0);

    let check = fx
        .engine
        .check(&resolved, "cust-1", "api_calls", 1, at(2024, 2, 2))
        .unwrap();
    assert_eq!(check.current_usage, -30);
}
