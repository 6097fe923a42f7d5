use chrono::Duration;
use std::sync::Arc;

use stars_meter::config::MeterConfig;
use stars_meter::entitlement::{Plan, ResourceKind};
use stars_meter::error::MeterError;
use stars_meter::payment_ledger::{PaymentKind, PaymentOutcome};
use stars_meter::referral_manager::{PayoutOutcome, PayoutStatus, ReviewOutcome};
use stars_meter::storage::PgStore;

use super::test_utils::{TestAssertions, TestHarness, TestScenario, TestUserBuilder};
use super::TestDatabase;

fn pg_harness(db: &TestDatabase) -> TestHarness<PgStore> {
    let store = PgStore::new(db.pool.clone(), std::time::Duration::from_secs(5));
    TestHarness::over(Arc::new(store), MeterConfig::default())
}

#[tokio::test]
async fn test_pg_quota_and_rollover() {
    let Some(db) = TestDatabase::from_env().await else {
        return;
    };
    let harness = pg_harness(&db);
    let user_id = 600;

    assert_eq!(harness.exhaust(user_id, ResourceKind::Text).await, 5);
    harness
        .meter
        .entitlements
        .grant_bonus(user_id, ResourceKind::Text, 2)
        .await
        .expect("grant_bonus failed");
    assert_eq!(harness.exhaust(user_id, ResourceKind::Text).await, 2);

    harness.next_day();
    TestAssertions::assert_remaining(&harness, user_id, ResourceKind::Text, 5).await;
    TestAssertions::assert_remaining(&harness, user_id, ResourceKind::Image, 3).await;

    db.cleanup().await.expect("Failed to cleanup test database");
}

#[tokio::test]
async fn test_pg_parallel_consume_of_last_unit() {
    let Some(db) = TestDatabase::from_env().await else {
        return;
    };
    let harness = Arc::new(pg_harness(&db));
    let user_id = 601;
    harness.consume(user_id, ResourceKind::Image, 2).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let harness = Arc::clone(&harness);
        handles.push(tokio::spawn(async move {
            harness
                .meter
                .entitlements
                .try_consume(user_id, ResourceKind::Image)
                .await
                .expect("try_consume failed")
                .allowed
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.expect("task panicked") {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 1);

    db.cleanup().await.expect("Failed to cleanup test database");
}

#[tokio::test]
async fn test_pg_payment_idempotence_and_extension() {
    let Some(db) = TestDatabase::from_env().await else {
        return;
    };
    let harness = pg_harness(&db);
    let inviter_id = 610;
    let user_id = TestUserBuilder::new(611)
        .plan(Plan::Basic, Duration::days(2))
        .invited_by(inviter_id)
        .create(&harness)
        .await;

    let outcome = harness
        .meter
        .payments
        .apply_payment("pg-charge-1", user_id, 199, PaymentKind::Subscription, "basic")
        .await
        .expect("apply_payment failed");
    assert!(outcome.applied());
    TestAssertions::assert_expiry(&harness, user_id, harness.now() + Duration::days(32)).await;
    TestAssertions::assert_balance(&harness, inviter_id, 19).await;

    let retry = harness
        .meter
        .payments
        .apply_payment("pg-charge-1", user_id, 5, PaymentKind::Subscription, "basic")
        .await
        .expect("apply_payment failed");
    assert_eq!(retry, PaymentOutcome::AlreadyApplied);
    TestAssertions::assert_expiry(&harness, user_id, harness.now() + Duration::days(32)).await;
    TestAssertions::assert_balance(&harness, inviter_id, 19).await;

    let record = harness
        .meter
        .payments
        .payment("pg-charge-1")
        .await
        .expect("payment lookup failed")
        .expect("payment not stored");
    assert_eq!(record.amount, 199);

    db.cleanup().await.expect("Failed to cleanup test database");
}

#[tokio::test]
async fn test_pg_payout_lifecycle() {
    let Some(db) = TestDatabase::from_env().await else {
        return;
    };
    let harness = pg_harness(&db);
    let inviter_id = 620;
    TestScenario::inviter_with_balance(&harness, inviter_id, 800).await;
    let referrals = &harness.meter.referrals;

    let payout_id = match referrals
        .request_payout(inviter_id, 500)
        .await
        .expect("request_payout failed")
    {
        PayoutOutcome::Created(request) => request.id,
        other => panic!("expected a created payout, got {:?}", other),
    };
    assert!(matches!(
        referrals
            .request_payout(inviter_id, 100)
            .await
            .expect("request_payout failed"),
        PayoutOutcome::Rejected(_)
    ));

    assert!(matches!(
        referrals.approve_payout(payout_id).await.expect("approve failed"),
        ReviewOutcome::Paid(_)
    ));
    assert_eq!(
        referrals.approve_payout(payout_id).await.expect("approve failed"),
        ReviewOutcome::NotPending(PayoutStatus::Paid)
    );
    TestAssertions::assert_balance(&harness, inviter_id, 300).await;

    let paid = referrals
        .list_payouts(Some(PayoutStatus::Paid))
        .await
        .expect("list_payouts failed");
    assert_eq!(paid.len(), 1);
    assert_eq!(paid[0].amount, 500);

    db.cleanup().await.expect("Failed to cleanup test database");
}

#[tokio::test]
async fn test_pg_windows_and_winners() {
    let Some(db) = TestDatabase::from_env().await else {
        return;
    };
    let harness = pg_harness(&db);
    let abuse = &harness.meter.abuse;

    let mut allowed = 0;
    for _ in 0..7 {
        if abuse
            .check_rate_limit(630, ResourceKind::Image)
            .await
            .expect("check_rate_limit failed")
        {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);

    for _ in 0..3 {
        assert!(!abuse.is_duplicate_burst(630, "same").await.expect("burst check failed"));
    }
    assert!(abuse.is_duplicate_burst(630, "same").await.expect("burst check failed"));

    let experiments = &harness.meter.experiments;
    experiments
        .pin_winner("paywall_trigger", "t5")
        .await
        .expect("pin failed");
    experiments
        .pin_winner("paywall_trigger", "t2")
        .await
        .expect("re-pin failed");
    assert_eq!(
        experiments
            .assign(630, "paywall_trigger", &["t2", "t5"])
            .await,
        "t2"
    );
    assert!(experiments
        .clear_winner("paywall_trigger")
        .await
        .expect("clear failed"));

    db.cleanup().await.expect("Failed to cleanup test database");
}

#[tokio::test]
async fn test_pg_bonus_after_exhausted_free_quota() {
    let Some(db) = TestDatabase::from_env().await else {
        return;
    };
    let harness = pg_harness(&db);
    let user_id = 640;

    assert_eq!(harness.exhaust(user_id, ResourceKind::Text).await, 5);
    harness
        .meter
        .entitlements
        .grant_bonus(user_id, ResourceKind::Text, 3)
        .await
        .expect("grant_bonus failed");
    assert_eq!(harness.exhaust(user_id, ResourceKind::Text).await, 3);

    db.cleanup().await.expect("Failed to cleanup test database");
}

#[tokio::test]
async fn test_pg_held_row_lock_surfaces_as_timeout() {
    let Some(db) = TestDatabase::from_env().await else {
        return;
    };
    let store = PgStore::new(db.pool.clone(), std::time::Duration::from_millis(100));
    let harness = TestHarness::over(Arc::new(store), MeterConfig::default());
    let user_id = 650;
    harness.consume(user_id, ResourceKind::Text, 1).await;

    let mut holder = db.pool.get().await.expect("Failed to get database client");
    let transaction = holder.transaction().await.expect("Failed to begin");
    transaction
        .query_one(
            "SELECT user_id FROM entitlements WHERE user_id = $1 FOR UPDATE",
            &[&user_id],
        )
        .await
        .expect("Failed to lock entitlement row");
    // an uncommitted link makes a second insert of the same invitee wait
    transaction
        .execute(
            "INSERT INTO referral_links (invitee_id, inviter_id, created_at) VALUES ($1, $2, NOW())",
            &[&651i64, &652i64],
        )
        .await
        .expect("Failed to insert referral link");

    let err = harness
        .meter
        .entitlements
        .try_consume(user_id, ResourceKind::Text)
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::StoreTimeout(_)), "unexpected error: {:?}", err);
    assert!(err.is_transient());

    let err = harness
        .meter
        .referrals
        .link_invitee(651, 653)
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::StoreTimeout(_)), "unexpected error: {:?}", err);

    transaction.rollback().await.expect("Failed to roll back");
    drop(holder);

    TestAssertions::assert_remaining(&harness, user_id, ResourceKind::Text, 4).await;
    assert!(harness
        .meter
        .referrals
        .link_invitee(651, 653)
        .await
        .expect("link_invitee failed"));

    db.cleanup().await.expect("Failed to cleanup test database");
}

#[tokio::test]
async fn test_pg_charge_credit_recorded_once() {
    let Some(db) = TestDatabase::from_env().await else {
        return;
    };
    let harness = pg_harness(&db);
    let inviter_id = 660;
    let invitee_id = TestUserBuilder::new(661)
        .invited_by(inviter_id)
        .create(&harness)
        .await;
    let referrals = &harness.meter.referrals;

    for _ in 0..3 {
        assert_eq!(
            referrals
                .credit_for_charge("pg-credit-1", invitee_id, 199)
                .await
                .expect("credit_for_charge failed"),
            19
        );
    }
    TestAssertions::assert_balance(&harness, inviter_id, 19).await;

    let client = db.pool.get().await.expect("Failed to get database client");
    let rows: i64 = client
        .query_one(
            "SELECT COUNT(*) FROM referral_credits WHERE charge_id = $1",
            &[&"pg-credit-1"],
        )
        .await
        .expect("Failed to count credits")
        .get(0);
    assert_eq!(rows, 1);
    drop(client);

    db.cleanup().await.expect("Failed to cleanup test database");
}
