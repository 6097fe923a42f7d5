use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::MeterConfig;
use crate::error::{MeterError, MeterResult};
use crate::storage::{bounded, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    New,
    Paid,
    Rejected,
}

impl PayoutStatus {
    pub fn key(&self) -> &'static str {
        match self {
            PayoutStatus::New => "new",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Rejected => "rejected",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "new" => Some(PayoutStatus::New),
            "paid" => Some(PayoutStatus::Paid),
            "rejected" => Some(PayoutStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// invitee -> inviter, fixed at first contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralLink {
    pub invitee_id: i64,
    pub inviter_id: i64,
    pub first_payment_made: bool,
    pub created_at: DateTime<Utc>,
}

/// withdrawable referral earnings of one inviter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralAccount {
    pub user_id: i64,
    pub balance: i64,
    pub total_credited: i64,
    pub total_paid_out: i64,
    pub last_payout_request_at: Option<DateTime<Utc>>,
}

impl ReferralAccount {
    pub fn empty(user_id: i64) -> Self {
        Self {
            user_id,
            balance: 0,
            total_credited: 0,
            total_paid_out: 0,
            last_payout_request_at: None,
        }
    }
}

/// credit accrued for one invitee charge, stored under the charge id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralCredit {
    pub charge_id: String,
    pub invitee_id: i64,
    pub inviter_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub admin_note: Option<String>,
}

/// reasons a payout request is refused; each maps to its own user-facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PayoutRejection {
    TooSmall { min_payout: i64 },
    Cooldown { retry_after: DateTime<Utc> },
    InsufficientBalance { balance: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PayoutOutcome {
    Created(PayoutRequest),
    Rejected(PayoutRejection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReviewOutcome {
    Paid(PayoutRequest),
    Rejected(PayoutRequest),
    NotPending(PayoutStatus),
    InsufficientBalance { balance: i64, requested: i64 },
    NotFound,
}

/// percent share of `amount_paid`; zero once the first purchase was credited under the gate
fn accrue(
    link: &mut ReferralLink,
    account: &mut ReferralAccount,
    amount_paid: i64,
    percent: i64,
    require_first: bool,
) -> i64 {
    if require_first && link.first_payment_made {
        return 0;
    }
    link.first_payment_made = true;

    let credited = amount_paid.saturating_mul(percent) / 100;
    account.balance += credited;
    account.total_credited += credited;
    credited
}

pub struct ReferralManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: Arc<MeterConfig>,
}

impl<S: Storage> ReferralManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: Arc<MeterConfig>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// records who invited `invitee_id`; self-invites and second inviters are ignored
    pub async fn link_invitee(&self, invitee_id: i64, inviter_id: i64) -> MeterResult<bool> {
        if invitee_id == inviter_id {
            info!("Ignoring self-referral from user {}", invitee_id);
            return Ok(false);
        }

        let linked = bounded(
            self.config.store_timeout(),
            self.store
                .link_referral(invitee_id, inviter_id, self.clock.now()),
        )
        .await?;

        if linked {
            info!("User {} joined via referral of user {}", invitee_id, inviter_id);
        } else {
            info!(
                "User {} already has an inviter, keeping it (ignored {})",
                invitee_id, inviter_id
            );
        }
        Ok(linked)
    }

    pub async fn inviter_of(&self, invitee_id: i64) -> MeterResult<Option<i64>> {
        let link = bounded(
            self.config.store_timeout(),
            self.store.load_referral_link(invitee_id),
        )
        .await?;
        Ok(link.map(|link| link.inviter_id))
    }

    /// accrues `ref_percent` of `amount_paid` to the invitee's inviter; returns the credited amount
    pub async fn credit_on_purchase(&self, invitee_id: i64, amount_paid: i64) -> MeterResult<i64> {
        if amount_paid < 0 {
            return Err(MeterError::InvalidAmount(amount_paid));
        }

        let percent = i64::from(self.config.referral.percent);
        let require_first = self.config.referral.require_first_payment;

        let credited = bounded(
            self.config.store_timeout(),
            self.store.update_referral(invitee_id, move |link, account| {
                let credited = accrue(link, account, amount_paid, percent, require_first);
                (link.inviter_id, credited)
            }),
        )
        .await?;

        match credited {
            Some((inviter_id, credited)) => {
                Self::log_credit(invitee_id, inviter_id, amount_paid, credited);
                Ok(credited)
            }
            None => Ok(0),
        }
    }

    /// `credit_on_purchase` keyed by the charge that paid; a repeated charge id returns the
    /// amount credited the first time and changes nothing
    pub async fn credit_for_charge(
        &self,
        charge_id: &str,
        invitee_id: i64,
        amount_paid: i64,
    ) -> MeterResult<i64> {
        if amount_paid < 0 {
            return Err(MeterError::InvalidAmount(amount_paid));
        }

        let percent = i64::from(self.config.referral.percent);
        let require_first = self.config.referral.require_first_payment;

        let credit = bounded(
            self.config.store_timeout(),
            self.store
                .credit_referral(charge_id, invitee_id, self.clock.now(), move |link, account| {
                    accrue(link, account, amount_paid, percent, require_first)
                }),
        )
        .await?;

        match credit {
            Some((credit, true)) => {
                Self::log_credit(invitee_id, credit.inviter_id, amount_paid, credit.amount);
                Ok(credit.amount)
            }
            Some((credit, false)) => {
                debug!(
                    "Charge {} already credited {} to inviter {}",
                    charge_id, credit.amount, credit.inviter_id
                );
                Ok(credit.amount)
            }
            None => Ok(0),
        }
    }

    fn log_credit(invitee_id: i64, inviter_id: i64, amount_paid: i64, credited: i64) {
        if credited > 0 {
            info!(
                "Credited {} to inviter {} for purchase of {} by user {}",
                credited, inviter_id, amount_paid, invitee_id
            );
        } else {
            info!(
                "No referral credit for inviter {} on purchase by user {}",
                inviter_id, invitee_id
            );
        }
    }

    pub async fn account(&self, user_id: i64) -> MeterResult<ReferralAccount> {
        bounded(self.config.store_timeout(), self.store.load_account(user_id)).await
    }

    /// opens a withdrawal request; cooldown check and stamp happen in one transaction
    pub async fn request_payout(&self, user_id: i64, amount: i64) -> MeterResult<PayoutOutcome> {
        let min_payout = self.config.referral.min_payout;
        if amount < min_payout {
            info!(
                "Payout request of {} by user {} below minimum {}",
                amount, user_id, min_payout
            );
            return Ok(PayoutOutcome::Rejected(PayoutRejection::TooSmall { min_payout }));
        }

        let now = self.clock.now();
        let cooldown = Duration::hours(i64::from(self.config.referral.payout_cooldown_hours));

        let result = bounded(
            self.config.store_timeout(),
            self.store.create_payout(user_id, amount, now, move |account| {
                if let Some(last) = account.last_payout_request_at {
                    let retry_after = last + cooldown;
                    if now < retry_after {
                        return Err(PayoutRejection::Cooldown { retry_after });
                    }
                }
                if amount > account.balance {
                    return Err(PayoutRejection::InsufficientBalance {
                        balance: account.balance,
                    });
                }
                Ok(())
            }),
        )
        .await?;

        match result {
            Ok(request) => {
                info!(
                    "Created payout request {} for user {} ({} stars)",
                    request.id, user_id, amount
                );
                Ok(PayoutOutcome::Created(request))
            }
            Err(rejection) => {
                info!("Payout request by user {} rejected: {:?}", user_id, rejection);
                Ok(PayoutOutcome::Rejected(rejection))
            }
        }
    }

    /// NEW -> PAID, debiting the balance exactly once
    pub async fn approve_payout(&self, payout_id: i64) -> MeterResult<ReviewOutcome> {
        let now = self.clock.now();

        let outcome = bounded(
            self.config.store_timeout(),
            self.store.review_payout(payout_id, move |request, account| {
                if request.status != PayoutStatus::New {
                    return ReviewOutcome::NotPending(request.status);
                }
                if account.balance < request.amount {
                    return ReviewOutcome::InsufficientBalance {
                        balance: account.balance,
                        requested: request.amount,
                    };
                }
                account.balance -= request.amount;
                account.total_paid_out += request.amount;
                request.status = PayoutStatus::Paid;
                request.reviewed_at = Some(now);
                ReviewOutcome::Paid(request.clone())
            }),
        )
        .await?
        .unwrap_or(ReviewOutcome::NotFound);

        Self::log_review(payout_id, &outcome);
        Ok(outcome)
    }

    /// NEW -> REJECTED, balance untouched
    pub async fn reject_payout(&self, payout_id: i64, note: &str) -> MeterResult<ReviewOutcome> {
        let now = self.clock.now();
        let note = note.trim().to_string();

        let outcome = bounded(
            self.config.store_timeout(),
            self.store.review_payout(payout_id, move |request, _account| {
                if request.status != PayoutStatus::New {
                    return ReviewOutcome::NotPending(request.status);
                }
                request.status = PayoutStatus::Rejected;
                request.reviewed_at = Some(now);
                request.admin_note = (!note.is_empty()).then_some(note);
                ReviewOutcome::Rejected(request.clone())
            }),
        )
        .await?
        .unwrap_or(ReviewOutcome::NotFound);

        Self::log_review(payout_id, &outcome);
        Ok(outcome)
    }

    pub async fn list_payouts(&self, status: Option<PayoutStatus>) -> MeterResult<Vec<PayoutRequest>> {
        bounded(self.config.store_timeout(), self.store.list_payouts(status)).await
    }

    fn log_review(payout_id: i64, outcome: &ReviewOutcome) {
        match outcome {
            ReviewOutcome::Paid(request) => info!(
                "Payout {} paid: {} stars to user {}",
                payout_id, request.amount, request.user_id
            ),
            ReviewOutcome::Rejected(request) => info!(
                "Payout {} of user {} rejected",
                payout_id, request.user_id
            ),
            other => warn!("Payout {} not reviewed: {:?}", payout_id, other),
        }
    }
}
