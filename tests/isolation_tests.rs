use anyhow::Result;
use futures_util::future::try_join_all;
use quota_metering::bench_support::{random_customer_id, reference_time, QuotaBenchFixture};
use quota_metering::bench_support::quota_engine::ledger::{UsageFilter, UsageLedger};
use quota_metering::bench_support::quota_engine::{NewQuotaPlan, ResetCadence};

#[tokio::test]
async fn test_customers_on_one_plan_have_separate_counters() -> Result<()> {
    let fixture = QuotaBenchFixture::new(&[("api_calls", 5)])?;
    let customer_a = random_customer_id("cust-a");
    let customer_b = random_customer_id("cust-b");

    let exhausted = fixture
        .engine
        .check_and_consume_at(&fixture.plan, &customer_a, "api_calls", 5, None, reference_time())
        .await?;
    assert!(exhausted.consumed);

    let other = fixture
        .engine
        .check_and_consume_at(&fixture.plan, &customer_b, "api_calls", 5, None, reference_time())
        .await?;
    assert!(other.consumed, "customer B must not see customer A's usage");
    assert_eq!(other.check.current_usage, 0);

    let blocked = fixture
        .engine
        .check_and_consume_at(&fixture.plan, &customer_a, "api_calls", 1, None, reference_time())
        .await?;
    assert!(!blocked.consumed);
    Ok(())
}

#[tokio::test]
async fn test_plans_of_different_tenants_do_not_share_usage() -> Result<()> {
    let fixture = QuotaBenchFixture::new(&[("api_calls", 3)])?;
    let other_tenant_plan = NewQuotaPlan::new("tenant-other", "bench", ResetCadence::Monthly)
        .with_limit("api_calls", 3)
        .into_plan();
    let customer = random_customer_id("shared-customer");

    fixture.seed_usage(&customer, "api_calls", 3)?;

    let check = fixture.engine.check(
        &other_tenant_plan,
        &customer,
        "api_calls",
        3,
        reference_time(),
    )?;
    assert!(check.allowed);
    assert_eq!(check.current_usage, 0);

    let tenant_events = fixture.database.list_events(&UsageFilter {
        tenant_id: Some("tenant-other".into()),
        ..UsageFilter::default()
    })?;
    assert!(tenant_events.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contention_on_one_customer_does_not_starve_another() -> Result<()> {
    let fixture = QuotaBenchFixture::new(&[("api_calls", 10)])?;
    let busy = random_customer_id("busy");
    let quiet = random_customer_id("quiet");

    let hammer = (0..40).map(|_| {
        let engine = fixture.engine.clone();
        let plan = fixture.plan.clone();
        let busy = busy.clone();
        async move {
            engine
                .check_and_consume_at(&plan, &busy, "api_calls", 1, None, reference_time())
                .await
        }
    });
    let quiet_outcome = fixture.engine.check_and_consume_at(
        &fixture.plan,
        &quiet,
        "api_calls",
        10,
        None,
        reference_time(),
    );

    let (busy_outcomes, quiet_outcome) = tokio::join!(try_join_all(hammer), quiet_outcome);
    let busy_consumed = busy_outcomes?.iter().filter(|o| o.consumed).count();
    assert_eq!(busy_consumed, 10);
    assert!(quiet_outcome?.consumed);
    Ok(())
}
