use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::MeterConfig;
use crate::entitlement::{PerKind, Plan};
use crate::entitlement_manager::{add_bonus, extended_expiry, unlocked_promo};
use crate::error::{MeterError, MeterResult};
use crate::referral_manager::ReferralManager;
use crate::storage::{bounded, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    Subscription,
    Topup,
}

impl PaymentKind {
    pub fn key(&self) -> &'static str {
        match self {
            PaymentKind::Subscription => "subscription",
            PaymentKind::Topup => "topup",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "subscription" | "sub" => Some(PaymentKind::Subscription),
            "topup" => Some(PaymentKind::Topup),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// one external charge, immutable once stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub charge_id: String,
    pub user_id: i64,
    pub amount: i64,
    pub kind: PaymentKind,
    pub payload: String,
    pub recognized: bool,
    pub created_at: DateTime<Utc>,
}

/// what a payment buys once its payload is resolved against the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purchase {
    Subscription(Plan),
    Topup { pack: String, grant: PerKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PaymentEffect {
    PlanExtended {
        plan: Plan,
        expires_at: DateTime<Utc>,
    },
    BonusGranted {
        pack: String,
        grant: PerKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedPayment {
    pub charge_id: String,
    pub effect: PaymentEffect,
    pub first_purchase_bonus: Option<PerKind>,
    pub promo_bonus: Option<PerKind>,
    pub referral_credit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PaymentOutcome {
    Applied(AppliedPayment),
    AlreadyApplied,
    /// money recorded but the payload matched no plan or pack; needs manual reconciliation
    Unrecognized { charge_id: String, payload: String },
}

impl PaymentOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, PaymentOutcome::Applied(_))
    }
}

/// answer to the pre-checkout query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PurchaseCheck {
    Accepted,
    UnknownItem,
    RequiresActivePlan,
}

/// splits an invoice payload such as `subscription:pro` or `topup:week_combo`
pub fn parse_invoice_payload(raw: &str) -> Option<(PaymentKind, String)> {
    let (kind, key) = raw.split_once(':')?;
    let kind = PaymentKind::from_key(kind)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((kind, key.to_string()))
}

/// builds the invoice payload the glue attaches to an invoice
pub fn invoice_payload(kind: PaymentKind, key: &str) -> String {
    format!("{}:{}", kind.key(), key)
}

pub struct PaymentLedger<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: Arc<MeterConfig>,
    referrals: Arc<ReferralManager<S>>,
}

impl<S: Storage> PaymentLedger<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: Arc<MeterConfig>,
        referrals: Arc<ReferralManager<S>>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            referrals,
        }
    }

    /// maps `(kind, payload)` to a catalog item; the payload may carry a redundant `kind:` prefix
    pub fn resolve(&self, kind: PaymentKind, payload: &str) -> Option<Purchase> {
        let key = match parse_invoice_payload(payload) {
            Some((prefixed, key)) if prefixed == kind => key,
            Some(_) => return None,
            None => payload.trim().to_string(),
        };

        match kind {
            PaymentKind::Subscription => Plan::from_key(&key)
                .filter(|plan| plan.is_paid() && self.config.plan_spec(*plan).is_some())
                .map(Purchase::Subscription),
            PaymentKind::Topup => self.config.pack(&key).map(|pack| Purchase::Topup {
                pack: key.clone(),
                grant: pack.grant,
            }),
        }
    }

    /// pre-checkout validation; `apply_payment` itself never refuses money already taken
    pub async fn validate_purchase(
        &self,
        user_id: i64,
        kind: PaymentKind,
        payload: &str,
    ) -> MeterResult<PurchaseCheck> {
        let purchase = match self.resolve(kind, payload) {
            Some(purchase) => purchase,
            None => {
                warn!(
                    "Pre-checkout for unknown item {}:{} by user {}",
                    kind, payload, user_id
                );
                return Ok(PurchaseCheck::UnknownItem);
            }
        };

        if matches!(purchase, Purchase::Topup { .. }) && self.config.topup_requires_active_plan {
            let now = self.clock.now();
            let entitlement = bounded(
                self.config.store_timeout(),
                self.store.load_entitlement(user_id),
            )
            .await?;
            let has_plan = entitlement
                .map(|entitlement| entitlement.active_expiry(now).is_some())
                .unwrap_or(false);
            if !has_plan {
                info!("Top-up by user {} refused: no active plan", user_id);
                return Ok(PurchaseCheck::RequiresActivePlan);
            }
        }

        Ok(PurchaseCheck::Accepted)
    }

    /// applies a confirmed charge exactly once, keyed by `charge_id`
    pub async fn apply_payment(
        &self,
        charge_id: &str,
        user_id: i64,
        amount: i64,
        kind: PaymentKind,
        payload: &str,
    ) -> MeterResult<PaymentOutcome> {
        let charge_id = charge_id.trim();
        if charge_id.is_empty() {
            return Err(MeterError::InvalidCharge(charge_id.to_string()));
        }
        if amount < 0 {
            return Err(MeterError::InvalidAmount(amount));
        }

        let now = self.clock.now();
        let today = now.date_naive();
        let purchase = self.resolve(kind, payload);

        if let Some(Purchase::Subscription(plan)) = &purchase {
            if let Some(spec) = self.config.plan_spec(*plan) {
                if i64::from(spec.price) != amount {
                    warn!(
                        "Charge {} paid {} for plan {} priced {}",
                        charge_id, amount, plan, spec.price
                    );
                }
            }
        }

        let record = PaymentRecord {
            charge_id: charge_id.to_string(),
            user_id,
            amount,
            kind,
            payload: payload.to_string(),
            recognized: purchase.is_some(),
            created_at: now,
        };

        let days = self.config.subscription_days;
        let first_bonus = self.config.first_purchase_bonus.filter(|grant| !grant.is_zero());
        let config = Arc::clone(&self.config);

        let applied = bounded(
            self.config.store_timeout(),
            self.store.record_payment(&record, today, move |entitlement, first| {
                let mut promo = None;
                let effect = match purchase {
                    Some(Purchase::Subscription(plan)) => {
                        promo = unlocked_promo(&config, entitlement, plan, now);
                        let expires_at = extended_expiry(entitlement, now, days);
                        entitlement.plan = plan;
                        entitlement.plan_expires_at = Some(expires_at);
                        if let Some(grant) = promo {
                            add_bonus(entitlement, grant, today);
                            entitlement.promo = None;
                        }
                        Some(PaymentEffect::PlanExtended { plan, expires_at })
                    }
                    Some(Purchase::Topup { pack, grant }) => {
                        add_bonus(entitlement, grant, today);
                        Some(PaymentEffect::BonusGranted { pack, grant })
                    }
                    None => None,
                };

                let bonus = match (&effect, first, first_bonus) {
                    (Some(PaymentEffect::PlanExtended { .. }), true, Some(grant)) => {
                        add_bonus(entitlement, grant, today);
                        Some(grant)
                    }
                    _ => None,
                };
                (effect, bonus, promo)
            }),
        )
        .await?;

        let (effect, first_purchase_bonus, promo_bonus) = match applied {
            None => {
                info!(
                    "Duplicate notification for charge {} (user {}), already applied",
                    charge_id, user_id
                );
                self.finish_referral_credit(charge_id).await?;
                return Ok(PaymentOutcome::AlreadyApplied);
            }
            Some((None, _, _)) => {
                warn!(
                    "Recorded charge {} from user {} with unrecognized payload '{}' ({}), needs reconciliation",
                    charge_id, user_id, payload, kind
                );
                return Ok(PaymentOutcome::Unrecognized {
                    charge_id: charge_id.to_string(),
                    payload: payload.to_string(),
                });
            }
            Some((Some(effect), bonus, promo)) => (effect, bonus, promo),
        };

        info!(
            "Applied charge {} for user {}: {:?}",
            charge_id, user_id, effect
        );

        // a failure here leaves the charge uncredited; retrying the same charge id completes it
        let referral_credit = self
            .referrals
            .credit_for_charge(charge_id, user_id, amount)
            .await?;

        Ok(PaymentOutcome::Applied(AppliedPayment {
            charge_id: charge_id.to_string(),
            effect,
            first_purchase_bonus,
            promo_bonus,
            referral_credit,
        }))
    }

    /// re-runs the referral credit of a stored charge; a no-op once it went through
    async fn finish_referral_credit(&self, charge_id: &str) -> MeterResult<()> {
        let stored = bounded(
            self.config.store_timeout(),
            self.store.load_payment(charge_id),
        )
        .await?;

        if let Some(stored) = stored.filter(|stored| stored.recognized) {
            self.referrals
                .credit_for_charge(&stored.charge_id, stored.user_id, stored.amount)
                .await?;
        }
        Ok(())
    }

    pub async fn payment(&self, charge_id: &str) -> MeterResult<Option<PaymentRecord>> {
        bounded(
            self.config.store_timeout(),
            self.store.load_payment(charge_id.trim()),
        )
        .await
    }
}
