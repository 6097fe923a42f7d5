use chrono::Duration;

use stars_meter::config::{MeterConfig, ReferralConfig};
use stars_meter::error::MeterError;
use stars_meter::referral_manager::{
    PayoutOutcome, PayoutRejection, PayoutStatus, ReviewOutcome,
};

use super::test_utils::{TestAssertions, TestHarness, TestScenario, TestUserBuilder};

fn created(outcome: PayoutOutcome) -> i64 {
    match outcome {
        PayoutOutcome::Created(request) => {
            assert_eq!(request.status, PayoutStatus::New);
            request.id
        }
        other => panic!("expected a created payout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_first_inviter_wins() {
    let harness = TestHarness::new();
    let referrals = &harness.meter.referrals;

    assert!(!referrals.link_invitee(300, 300).await.unwrap());
    assert!(referrals.link_invitee(301, 300).await.unwrap());
    assert!(!referrals.link_invitee(301, 302).await.unwrap());

    assert_eq!(referrals.inviter_of(301).await.unwrap(), Some(300));
    assert_eq!(referrals.inviter_of(300).await.unwrap(), None);
}

#[tokio::test]
async fn test_only_first_payment_is_credited() {
    let harness = TestHarness::new();
    let inviter_id = 310;
    let invitee_id = TestUserBuilder::new(311)
        .invited_by(inviter_id)
        .create(&harness)
        .await;

    let referrals = &harness.meter.referrals;
    assert_eq!(referrals.credit_on_purchase(invitee_id, 199).await.unwrap(), 19);
    assert_eq!(referrals.credit_on_purchase(invitee_id, 499).await.unwrap(), 0);

    let account = referrals.account(inviter_id).await.unwrap();
    assert_eq!(account.balance, 19);
    assert_eq!(account.total_credited, 19);
}

#[tokio::test]
async fn test_every_payment_credited_when_gate_is_off() {
    let config = MeterConfig {
        referral: ReferralConfig {
            percent: 20,
            require_first_payment: false,
            ..ReferralConfig::default()
        },
        ..MeterConfig::default()
    };
    let harness = TestHarness::with_config(config);
    let inviter_id = 320;
    let invitee_id = TestUserBuilder::new(321)
        .invited_by(inviter_id)
        .create(&harness)
        .await;

    let referrals = &harness.meter.referrals;
    assert_eq!(referrals.credit_on_purchase(invitee_id, 100).await.unwrap(), 20);
    assert_eq!(referrals.credit_on_purchase(invitee_id, 500).await.unwrap(), 100);
    TestAssertions::assert_balance(&harness, inviter_id, 120).await;
}

#[tokio::test]
async fn test_purchase_without_inviter_credits_nothing() {
    let harness = TestHarness::new();
    let referrals = &harness.meter.referrals;

    assert_eq!(referrals.credit_on_purchase(330, 999).await.unwrap(), 0);

    let err = referrals.credit_on_purchase(330, -10).await.unwrap_err();
    assert!(matches!(err, MeterError::InvalidAmount(-10)));
}

#[tokio::test]
async fn test_payout_lifecycle() {
    let harness = TestHarness::new();
    let inviter_id = 340;
    TestScenario::inviter_with_balance(&harness, inviter_id, 1_000).await;
    let referrals = &harness.meter.referrals;

    let payout_id = created(referrals.request_payout(inviter_id, 300).await.unwrap());
    // requesting does not move money yet
    TestAssertions::assert_balance(&harness, inviter_id, 1_000).await;

    match referrals.approve_payout(payout_id).await.unwrap() {
        ReviewOutcome::Paid(request) => {
            assert_eq!(request.status, PayoutStatus::Paid);
            assert_eq!(request.reviewed_at, Some(harness.now()));
        }
        other => panic!("expected paid payout, got {:?}", other),
    }

    let account = referrals.account(inviter_id).await.unwrap();
    assert_eq!(account.balance, 700);
    assert_eq!(account.total_paid_out, 300);
    assert_eq!(account.total_credited, 1_000);

    // terminal states stay terminal
    assert_eq!(
        referrals.approve_payout(payout_id).await.unwrap(),
        ReviewOutcome::NotPending(PayoutStatus::Paid)
    );
    assert_eq!(
        referrals.reject_payout(payout_id, "late").await.unwrap(),
        ReviewOutcome::NotPending(PayoutStatus::Paid)
    );
    TestAssertions::assert_balance(&harness, inviter_id, 700).await;
}

#[tokio::test]
async fn test_rejected_payout_keeps_balance() {
    let harness = TestHarness::new();
    let inviter_id = 350;
    TestScenario::inviter_with_balance(&harness, inviter_id, 500).await;
    let referrals = &harness.meter.referrals;

    let payout_id = created(referrals.request_payout(inviter_id, 500).await.unwrap());
    match referrals.reject_payout(payout_id, "  duplicate account ").await.unwrap() {
        ReviewOutcome::Rejected(request) => {
            assert_eq!(request.status, PayoutStatus::Rejected);
            assert_eq!(request.admin_note.as_deref(), Some("duplicate account"));
        }
        other => panic!("expected rejected payout, got {:?}", other),
    }
    TestAssertions::assert_balance(&harness, inviter_id, 500).await;

    assert_eq!(
        referrals.approve_payout(payout_id).await.unwrap(),
        ReviewOutcome::NotPending(PayoutStatus::Rejected)
    );
}

#[tokio::test]
async fn test_payout_cooldown() {
    let harness = TestHarness::new();
    let inviter_id = 360;
    TestScenario::inviter_with_balance(&harness, inviter_id, 1_000).await;
    let referrals = &harness.meter.referrals;

    let first_at = harness.now();
    created(referrals.request_payout(inviter_id, 100).await.unwrap());

    harness.advance(Duration::hours(23));
    assert_eq!(
        referrals.request_payout(inviter_id, 100).await.unwrap(),
        PayoutOutcome::Rejected(PayoutRejection::Cooldown {
            retry_after: first_at + Duration::hours(24),
        })
    );

    harness.advance(Duration::hours(1));
    created(referrals.request_payout(inviter_id, 100).await.unwrap());
}

#[tokio::test]
async fn test_payout_below_minimum() {
    let harness = TestHarness::new();
    let inviter_id = 370;
    TestScenario::inviter_with_balance(&harness, inviter_id, 1_000).await;

    assert_eq!(
        harness
            .meter
            .referrals
            .request_payout(inviter_id, 99)
            .await
            .unwrap(),
        PayoutOutcome::Rejected(PayoutRejection::TooSmall { min_payout: 100 })
    );

    // a refused request does not start the cooldown
    created(
        harness
            .meter
            .referrals
            .request_payout(inviter_id, 100)
            .await
            .unwrap(),
    );
}

#[tokio::test]
async fn test_payout_above_balance() {
    let harness = TestHarness::new();
    let inviter_id = 380;
    TestScenario::inviter_with_balance(&harness, inviter_id, 150).await;

    assert_eq!(
        harness
            .meter
            .referrals
            .request_payout(inviter_id, 200)
            .await
            .unwrap(),
        PayoutOutcome::Rejected(PayoutRejection::InsufficientBalance { balance: 150 })
    );
    assert!(harness
        .meter
        .referrals
        .list_payouts(None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_approval_rechecks_balance() {
    let harness = TestHarness::new();
    let inviter_id = 390;
    TestScenario::inviter_with_balance(&harness, inviter_id, 1_000).await;
    let referrals = &harness.meter.referrals;

    let first = created(referrals.request_payout(inviter_id, 600).await.unwrap());
    harness.advance(Duration::hours(25));
    let second = created(referrals.request_payout(inviter_id, 600).await.unwrap());

    assert!(matches!(
        referrals.approve_payout(first).await.unwrap(),
        ReviewOutcome::Paid(_)
    ));
    assert_eq!(
        referrals.approve_payout(second).await.unwrap(),
        ReviewOutcome::InsufficientBalance {
            balance: 400,
            requested: 600,
        }
    );

    let pending = referrals
        .list_payouts(Some(PayoutStatus::New))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second);
    TestAssertions::assert_balance(&harness, inviter_id, 400).await;
}

#[tokio::test]
async fn test_review_of_unknown_payout() {
    let harness = TestHarness::new();
    assert_eq!(
        harness.meter.referrals.approve_payout(9_999).await.unwrap(),
        ReviewOutcome::NotFound
    );
    assert_eq!(
        harness
            .meter
            .referrals
            .reject_payout(9_999, "")
            .await
            .unwrap(),
        ReviewOutcome::NotFound
    );
}

#[tokio::test]
async fn test_list_payouts_by_status() {
    let harness = TestHarness::new();
    let referrals = &harness.meter.referrals;

    TestScenario::inviter_with_balance(&harness, 400, 500).await;
    TestScenario::inviter_with_balance(&harness, 401, 500).await;
    TestScenario::inviter_with_balance(&harness, 402, 500).await;

    let paid = created(referrals.request_payout(400, 100).await.unwrap());
    let rejected = created(referrals.request_payout(401, 200).await.unwrap());
    let pending = created(referrals.request_payout(402, 300).await.unwrap());
    referrals.approve_payout(paid).await.unwrap();
    referrals.reject_payout(rejected, "").await.unwrap();

    let all = referrals.list_payouts(None).await.unwrap();
    assert_eq!(
        all.iter().map(|request| request.id).collect::<Vec<_>>(),
        vec![paid, rejected, pending]
    );

    let only_new = referrals.list_payouts(Some(PayoutStatus::New)).await.unwrap();
    assert_eq!(only_new.len(), 1);
    assert_eq!(only_new[0].user_id, 402);

    let only_rejected = referrals
        .list_payouts(Some(PayoutStatus::Rejected))
        .await
        .unwrap();
    assert_eq!(only_rejected.len(), 1);
    assert_eq!(only_rejected[0].admin_note, None);
}

#[tokio::test]
async fn test_charge_credit_is_keyed_by_charge_id() {
    let harness = TestHarness::new();
    let inviter_id = 390;
    let invitee_id = TestUserBuilder::new(391)
        .invited_by(inviter_id)
        .create(&harness)
        .await;
    let referrals = &harness.meter.referrals;

    assert_eq!(referrals.credit_for_charge("c-1", invitee_id, 199).await.unwrap(), 19);
    // the same charge reports its earlier credit and adds nothing
    assert_eq!(referrals.credit_for_charge("c-1", invitee_id, 199).await.unwrap(), 19);
    // a later charge is gated by the first-payment rule
    assert_eq!(referrals.credit_for_charge("c-2", invitee_id, 499).await.unwrap(), 0);

    let account = referrals.account(inviter_id).await.unwrap();
    assert_eq!(account.balance, 19);
    assert_eq!(account.total_credited, 19);

    // no inviter, nothing to credit
    assert_eq!(referrals.credit_for_charge("c-3", 392, 199).await.unwrap(), 0);
}
