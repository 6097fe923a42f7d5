use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::config::MeterConfig;
use crate::entitlement::{
    Decision, Entitlement, LoadSignals, OfferOutcome, PerKind, Plan, PromoOffer, ResourceKind,
    Snapshot, TrialOutcome,
};
use crate::error::{MeterError, MeterResult};
use crate::storage::{bounded, Storage};

/// quota of `kind` available to `entitlement` right now: plan base quota plus today's bonus.
/// `free_text` replaces the catalog FREE text quota while the load policy is in force.
pub fn limit_for(
    config: &MeterConfig,
    entitlement: &Entitlement,
    kind: ResourceKind,
    now: DateTime<Utc>,
    free_text: Option<u32>,
) -> u32 {
    let plan = entitlement.effective_plan(now);
    let base = match (plan, kind, free_text) {
        (Plan::Free, ResourceKind::Text, Some(quota)) => quota,
        _ => config.base_quota(plan, kind),
    };
    base.saturating_add(entitlement.bonus.get(kind))
}

/// rolls the day over and consumes one unit if the limit allows it
pub fn consume_one(
    config: &MeterConfig,
    entitlement: &mut Entitlement,
    kind: ResourceKind,
    now: DateTime<Utc>,
    today: NaiveDate,
    free_text: Option<u32>,
) -> Decision {
    entitlement.roll_over(today);

    let limit = limit_for(config, entitlement, kind, now, free_text);
    let used = entitlement.usage.get(kind);

    if used < limit {
        let counter = entitlement.usage.get_mut(kind);
        *counter += 1;
        Decision {
            kind,
            allowed: true,
            remaining: limit - *counter,
            limit,
            used: *counter,
        }
    } else {
        Decision {
            kind,
            allowed: false,
            remaining: 0,
            limit,
            used,
        }
    }
}

/// renewal policy: a running plan is extended from its expiry, a lapsed one restarts from now
pub fn extended_expiry(entitlement: &Entitlement, now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let start = entitlement.active_expiry(now).unwrap_or(now);
    start + Duration::days(i64::from(days))
}

/// adds `grant` to today's bonus counters after rolling the day over
pub fn add_bonus(entitlement: &mut Entitlement, grant: PerKind, today: NaiveDate) {
    entitlement.roll_over(today);
    for kind in ResourceKind::ALL {
        let counter = entitlement.bonus.get_mut(kind);
        *counter = counter.saturating_add(grant.get(kind));
    }
}

/// plan worth offering given today's text usage; expects a rolled-over entitlement
pub fn offer_target(config: &MeterConfig, entitlement: &Entitlement, now: DateTime<Utc>) -> Option<Plan> {
    let promo = &config.promo;
    let used = entitlement.usage.text;
    let plan = entitlement.effective_plan(now);

    let next = match plan {
        Plan::Free if used >= promo.free_heavy_text => return Some(Plan::Pro),
        Plan::Free if used >= promo.free_engaged_text => return Some(Plan::Basic),
        Plan::Free | Plan::Ultra => return None,
        Plan::Basic => Plan::Pro,
        Plan::Pro => Plan::Ultra,
    };

    let daily = config.base_quota(plan, ResourceKind::Text);
    let threshold = u64::from(daily) * u64::from(promo.upgrade_usage_percent) / 100;
    (daily > 0 && u64::from(used) >= threshold).then_some(next)
}

/// live promo bonus unlocked by buying `plan`
pub fn unlocked_promo(
    config: &MeterConfig,
    entitlement: &Entitlement,
    plan: Plan,
    now: DateTime<Utc>,
) -> Option<PerKind> {
    let offer = entitlement.promo.as_ref().filter(|offer| offer.is_live(now))?;
    config
        .promo
        .offers
        .get(&offer.kind)
        .filter(|spec| spec.plan == plan)
        .map(|spec| spec.grant)
}

pub struct EntitlementManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: Arc<MeterConfig>,
    load: RwLock<Option<LoadSignals>>,
}

impl<S: Storage> EntitlementManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: Arc<MeterConfig>) -> Self {
        Self {
            store,
            clock,
            config,
            load: RwLock::new(None),
        }
    }

    /// latest demand and spend figures; they only matter when a load policy is configured
    pub async fn report_load(&self, signals: LoadSignals) {
        if let Some(policy) = &self.config.free_load {
            let free_text = policy.free_text(&signals);
            if policy.over_budget(&signals) {
                warn!(
                    "Provider cost {} against revenue {} is over budget, FREE text quota now {}",
                    signals.api_cost_today, signals.revenue_today, free_text
                );
            } else {
                info!(
                    "{} active users today, FREE text quota now {}",
                    signals.active_users_today, free_text
                );
            }
        }
        *self.load.write().await = Some(signals);
    }

    /// FREE text quota in force; None keeps the catalog value
    async fn free_text(&self) -> Option<u32> {
        let policy = self.config.free_load.as_ref()?;
        let signals = (*self.load.read().await)?;
        Some(policy.free_text(&signals))
    }

    /// decides whether `user_id` may consume one unit of `kind` now and records it on allow
    pub async fn try_consume(&self, user_id: i64, kind: ResourceKind) -> MeterResult<Decision> {
        let now = self.clock.now();
        let today = now.date_naive();
        let config = Arc::clone(&self.config);
        let free_text = self.free_text().await;

        let decision = bounded(
            self.config.store_timeout(),
            self.store.update_entitlement(user_id, today, move |entitlement| {
                consume_one(&config, entitlement, kind, now, today, free_text)
            }),
        )
        .await?;

        if decision.allowed {
            info!(
                "User {} consumed 1 {} unit, remaining: {}/{}",
                user_id, kind, decision.remaining, decision.limit
            );
        } else {
            info!(
                "User {} denied {}: used {} of {}",
                user_id, kind, decision.used, decision.limit
            );
        }
        Ok(decision)
    }

    /// same as `try_consume` for callers holding a raw kind name
    pub async fn try_consume_named(&self, user_id: i64, kind: &str) -> MeterResult<Decision> {
        let kind: ResourceKind = kind.parse()?;
        self.try_consume(user_id, kind).await
    }

    /// adds a same-day bonus; returns today's bonus total for `kind`
    pub async fn grant_bonus(
        &self,
        user_id: i64,
        kind: ResourceKind,
        amount: i64,
    ) -> MeterResult<u32> {
        let units = u32::try_from(amount)
            .ok()
            .filter(|units| *units > 0)
            .ok_or(MeterError::InvalidAmount(amount))?;

        let today = self.clock.today();
        let mut grant = PerKind::default();
        *grant.get_mut(kind) = units;

        let total = bounded(
            self.config.store_timeout(),
            self.store.update_entitlement(user_id, today, move |entitlement| {
                add_bonus(entitlement, grant, today);
                entitlement.bonus.get(kind)
            }),
        )
        .await?;

        info!(
            "Granted {} bonus {} units to user {}, today's bonus: {}",
            units, kind, user_id, total
        );
        Ok(total)
    }

    /// overwrites plan and expiry; extension policy is the caller's business.
    /// A paid plan needs an expiry, FREE drops any given one.
    pub async fn set_plan(
        &self,
        user_id: i64,
        plan: Plan,
        expires_at: Option<DateTime<Utc>>,
    ) -> MeterResult<()> {
        let today = self.clock.today();
        let expires_at = match (plan.is_paid(), expires_at) {
            (true, None) => return Err(MeterError::MissingExpiry(plan)),
            (true, expires_at) => expires_at,
            (false, _) => None,
        };

        bounded(
            self.config.store_timeout(),
            self.store.update_entitlement(user_id, today, move |entitlement| {
                entitlement.plan = plan;
                entitlement.plan_expires_at = expires_at;
            }),
        )
        .await?;

        info!(
            "Set plan {} for user {} (expires: {:?})",
            plan, user_id, expires_at
        );
        Ok(())
    }

    /// read-only projection for menus; a stale day reads as zero usage without being written
    pub async fn status(&self, user_id: i64) -> MeterResult<Snapshot> {
        let now = self.clock.now();
        let today = now.date_naive();

        let mut entitlement = bounded(
            self.config.store_timeout(),
            self.store.load_entitlement(user_id),
        )
        .await?
        .unwrap_or_else(|| Entitlement::new(user_id, today));
        entitlement.roll_over(today);

        let free_text = self.free_text().await;
        let mut limit = PerKind::default();
        for kind in ResourceKind::ALL {
            *limit.get_mut(kind) = limit_for(&self.config, &entitlement, kind, now, free_text);
        }

        Ok(Snapshot {
            user_id,
            plan: entitlement.plan,
            effective_plan: entitlement.effective_plan(now),
            plan_expires_at: entitlement.plan_expires_at,
            day_key: entitlement.day_key,
            used: entitlement.usage,
            limit,
        })
    }

    /// one-shot trial of the configured plan; refused while a paid plan is running
    pub async fn activate_trial(&self, user_id: i64) -> MeterResult<TrialOutcome> {
        let now = self.clock.now();
        let today = now.date_naive();
        let trial_plan = self.config.trial_plan;
        let trial_days = self.config.trial_days;

        let outcome = bounded(
            self.config.store_timeout(),
            self.store.update_entitlement(user_id, today, move |entitlement| {
                if entitlement.trial_used {
                    return TrialOutcome::AlreadyUsed;
                }
                if let Some(expires_at) = entitlement.active_expiry(now) {
                    return TrialOutcome::PlanActive { expires_at };
                }
                let expires_at = now + Duration::days(i64::from(trial_days));
                entitlement.plan = trial_plan;
                entitlement.plan_expires_at = Some(expires_at);
                entitlement.trial_used = true;
                TrialOutcome::Activated {
                    plan: trial_plan,
                    expires_at,
                }
            }),
        )
        .await?;

        info!("Trial request for user {}: {:?}", user_id, outcome);
        Ok(outcome)
    }

    /// time-boxed offer of the next plan for an engaged user, at most one per cooldown
    pub async fn offer_promo(&self, user_id: i64) -> MeterResult<OfferOutcome> {
        let now = self.clock.now();
        let today = now.date_naive();
        let config = Arc::clone(&self.config);

        let outcome = bounded(
            self.config.store_timeout(),
            self.store.update_entitlement(user_id, today, move |entitlement| {
                entitlement.roll_over(today);
                if let Some(offer) = entitlement.promo.as_ref().filter(|offer| offer.is_live(now)) {
                    return OfferOutcome::Active(offer.clone());
                }
                if let Some(last) = entitlement.last_offer_at {
                    let retry_after = last + config.offer_cooldown();
                    if now < retry_after {
                        return OfferOutcome::Cooldown { retry_after };
                    }
                }

                let target = offer_target(&config, entitlement, now)
                    .and_then(|plan| config.promo.offer_for(plan));
                let Some((kind, spec)) = target else {
                    return OfferOutcome::NotEligible;
                };

                let expires_at = now + config.promo_ttl();
                entitlement.promo = Some(PromoOffer {
                    kind: kind.to_string(),
                    expires_at,
                });
                entitlement.last_offer_at = Some(now);
                OfferOutcome::Offered {
                    kind: kind.to_string(),
                    plan: spec.plan,
                    grant: spec.grant,
                    expires_at,
                }
            }),
        )
        .await?;

        match &outcome {
            OfferOutcome::Offered { kind, expires_at, .. } => info!(
                "Offered {} to user {} until {}",
                kind, user_id, expires_at
            ),
            other => info!("No new offer for user {}: {:?}", user_id, other),
        }
        Ok(outcome)
    }
}
