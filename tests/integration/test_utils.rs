use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use stars_meter::clock::{Clock, ManualClock};
use stars_meter::config::MeterConfig;
use stars_meter::entitlement::{Plan, ResourceKind};
use stars_meter::storage::{MemoryStore, Storage};
use stars_meter::Meter;

/// fixed starting instant so day boundaries are predictable
pub fn start_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
}

/// meter over an in-memory store and a manual clock
pub struct TestHarness<S = MemoryStore> {
    pub store: Arc<S>,
    pub clock: Arc<ManualClock>,
    pub meter: Meter<S>,
}

impl TestHarness<MemoryStore> {
    pub fn new() -> Self {
        Self::with_config(MeterConfig::default())
    }

    pub fn with_config(config: MeterConfig) -> Self {
        Self::over(Arc::new(MemoryStore::new()), config)
    }
}

impl<S: Storage> TestHarness<S> {
    pub fn over(store: Arc<S>, config: MeterConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_instant()));
        let meter = Meter::new(
            Arc::clone(&store),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(config),
        );
        Self {
            store,
            clock,
            meter,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// moves the clock to the same time of day on the next UTC date
    pub fn next_day(&self) {
        self.clock.advance(Duration::days(1));
    }

    /// consumes `count` units and asserts every one was allowed
    pub async fn consume(&self, user_id: i64, kind: ResourceKind, count: u32) {
        for i in 0..count {
            let decision = self
                .meter
                .entitlements
                .try_consume(user_id, kind)
                .await
                .expect("try_consume failed");
            assert!(
                decision.allowed,
                "unit {} of {} for user {} was denied: {:?}",
                i + 1,
                kind,
                user_id,
                decision
            );
        }
    }

    /// consumes until the first denial and returns how many units were allowed
    pub async fn exhaust(&self, user_id: i64, kind: ResourceKind) -> u32 {
        let mut allowed = 0;
        loop {
            let decision = self
                .meter
                .entitlements
                .try_consume(user_id, kind)
                .await
                .expect("try_consume failed");
            if !decision.allowed {
                return allowed;
            }
            allowed += 1;
        }
    }
}

/// helper for putting a user into a known starting state
pub struct TestUserBuilder {
    user_id: i64,
    plan: Option<(Plan, Duration)>,
    inviter_id: Option<i64>,
}

impl TestUserBuilder {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            plan: None,
            inviter_id: None,
        }
    }

    /// paid plan expiring `remaining` from now (negative for an already lapsed plan)
    pub fn plan(mut self, plan: Plan, remaining: Duration) -> Self {
        self.plan = Some((plan, remaining));
        self
    }

    pub fn invited_by(mut self, inviter_id: i64) -> Self {
        self.inviter_id = Some(inviter_id);
        self
    }

    pub async fn create<S: Storage>(&self, harness: &TestHarness<S>) -> i64 {
        if let Some((plan, remaining)) = self.plan {
            harness
                .meter
                .entitlements
                .set_plan(self.user_id, plan, Some(harness.now() + remaining))
                .await
                .expect("set_plan failed");
        }
        if let Some(inviter_id) = self.inviter_id {
            let linked = harness
                .meter
                .referrals
                .link_invitee(self.user_id, inviter_id)
                .await
                .expect("link_invitee failed");
            assert!(linked, "user {} was already linked", self.user_id);
        }
        self.user_id
    }
}

/// utility functions for test assertions
pub struct TestAssertions;

impl TestAssertions {
    pub async fn assert_remaining<S: Storage>(
        harness: &TestHarness<S>,
        user_id: i64,
        kind: ResourceKind,
        expected: u32,
    ) {
        let snapshot = harness
            .meter
            .entitlements
            .status(user_id)
            .await
            .expect("status failed");
        assert_eq!(
            snapshot.remaining(kind),
            expected,
            "Expected user {} to have {} {} units left, snapshot: {:?}",
            user_id,
            expected,
            kind,
            snapshot
        );
    }

    pub async fn assert_balance<S: Storage>(harness: &TestHarness<S>, user_id: i64, expected: i64) {
        let account = harness
            .meter
            .referrals
            .account(user_id)
            .await
            .expect("account failed");
        assert_eq!(
            account.balance, expected,
            "Expected user {} to have balance {}, account: {:?}",
            user_id, expected, account
        );
    }

    pub async fn assert_expiry<S: Storage>(
        harness: &TestHarness<S>,
        user_id: i64,
        expected: DateTime<Utc>,
    ) {
        let snapshot = harness
            .meter
            .entitlements
            .status(user_id)
            .await
            .expect("status failed");
        assert_eq!(
            snapshot.plan_expires_at,
            Some(expected),
            "Unexpected plan expiry for user {}",
            user_id
        );
    }
}

/// helper for creating test scenarios
pub struct TestScenario;

impl TestScenario {
    /// inviter whose referral balance holds `balance` stars, earned through one invitee purchase
    pub async fn inviter_with_balance<S: Storage>(
        harness: &TestHarness<S>,
        inviter_id: i64,
        balance: i64,
    ) -> i64 {
        let invitee_id = inviter_id + 1_000;
        TestUserBuilder::new(invitee_id)
            .invited_by(inviter_id)
            .create(harness)
            .await;

        let percent = i64::from(harness.meter.config().referral.percent);
        let credited = harness
            .meter
            .referrals
            .credit_on_purchase(invitee_id, balance * 100 / percent)
            .await
            .expect("credit_on_purchase failed");
        assert_eq!(credited, balance);
        invitee_id
    }
}
