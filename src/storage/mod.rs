//! Persistence seam of the metering core.
//!
//! Every read-modify-write is expressed as a closure handed to the store, which
//! runs it while holding the row lock (`SELECT ... FOR UPDATE` in PostgreSQL, the
//! state mutex in memory). Domain decisions stay in the managers; the store only
//! guarantees that the closure sees and writes a consistent row.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration as WindowSpan, NaiveDate, Utc};
use log::warn;
use std::future::Future;
use std::time::Duration;

use crate::entitlement::Entitlement;
use crate::error::{MeterError, MeterResult};
use crate::payment_ledger::PaymentRecord;
use crate::referral_manager::{
    PayoutRejection, PayoutRequest, PayoutStatus, ReferralAccount, ReferralCredit, ReferralLink,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Storage: Send + Sync {
    /// plain read, no lock and no lazy creation
    async fn load_entitlement(&self, user_id: i64) -> MeterResult<Option<Entitlement>>;

    /// creates the row for `today` if missing, then runs `mutate` under the row lock
    async fn update_entitlement<F, R>(
        &self,
        user_id: i64,
        today: NaiveDate,
        mutate: F,
    ) -> MeterResult<R>
    where
        F: FnOnce(&mut Entitlement) -> R + Send,
        R: Send;

    /// inserts `record` keyed by its charge id; only when the insert wins does `effect` run on
    /// the payer's entitlement, in the same transaction. The flag passed to `effect` is true
    /// when the payer had no earlier recognized payment. Returns None on a duplicate charge.
    async fn record_payment<F, R>(
        &self,
        record: &PaymentRecord,
        today: NaiveDate,
        effect: F,
    ) -> MeterResult<Option<R>>
    where
        F: FnOnce(&mut Entitlement, bool) -> R + Send,
        R: Send;

    async fn load_payment(&self, charge_id: &str) -> MeterResult<Option<PaymentRecord>>;

    /// first link wins; returns false when the invitee already has an inviter
    async fn link_referral(
        &self,
        invitee_id: i64,
        inviter_id: i64,
        now: DateTime<Utc>,
    ) -> MeterResult<bool>;

    async fn load_referral_link(&self, invitee_id: i64) -> MeterResult<Option<ReferralLink>>;

    /// runs `mutate` on the invitee's link and the inviter's account under both row locks;
    /// None when the invitee has no inviter
    async fn update_referral<F, R>(&self, invitee_id: i64, mutate: F) -> MeterResult<Option<R>>
    where
        F: FnOnce(&mut ReferralLink, &mut ReferralAccount) -> R + Send,
        R: Send;

    /// credits the invitee's inviter at most once per `charge_id`: runs `credit` on the link and
    /// the inviter's account under both row locks and stores its result under the charge id in
    /// the same transaction. A repeated charge id returns the stored credit with `false` and
    /// leaves `credit` unused. None when the invitee has no inviter
    async fn credit_referral<F>(
        &self,
        charge_id: &str,
        invitee_id: i64,
        now: DateTime<Utc>,
        credit: F,
    ) -> MeterResult<Option<(ReferralCredit, bool)>>
    where
        F: FnOnce(&mut ReferralLink, &mut ReferralAccount) -> i64 + Send;

    /// zeroed account when the user never earned anything
    async fn load_account(&self, user_id: i64) -> MeterResult<ReferralAccount>;

    /// validates with `check` under the account lock, then inserts a NEW request and stamps
    /// the account's last request time in the same transaction
    async fn create_payout<F>(
        &self,
        user_id: i64,
        amount: i64,
        now: DateTime<Utc>,
        check: F,
    ) -> MeterResult<Result<PayoutRequest, PayoutRejection>>
    where
        F: FnOnce(&ReferralAccount) -> Result<(), PayoutRejection> + Send;

    /// runs `mutate` on the request and its owner's account under both locks; None for unknown ids
    async fn review_payout<F, R>(&self, payout_id: i64, mutate: F) -> MeterResult<Option<R>>
    where
        F: FnOnce(&mut PayoutRequest, &mut ReferralAccount) -> R + Send,
        R: Send;

    async fn list_payouts(&self, status: Option<PayoutStatus>) -> MeterResult<Vec<PayoutRequest>>;

    async fn pinned_winner(&self, experiment: &str) -> MeterResult<Option<String>>;

    async fn pin_winner(
        &self,
        experiment: &str,
        variant: &str,
        now: DateTime<Utc>,
    ) -> MeterResult<()>;

    async fn clear_winner(&self, experiment: &str) -> MeterResult<bool>;

    /// sliding window counter: records a hit and returns true while fewer than `limit` hits
    /// fall inside `window`; a denied hit is not recorded
    async fn hit_window(
        &self,
        user_id: i64,
        action: &str,
        now: DateTime<Utc>,
        window: WindowSpan,
        limit: u32,
    ) -> MeterResult<bool>;

    /// records `fingerprint` and returns how many identical fingerprints were already inside `window`
    async fn record_fingerprint(
        &self,
        user_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
        window: WindowSpan,
    ) -> MeterResult<u32>;
}

/// bounds a store round-trip; a stuck transaction surfaces as `StoreTimeout`, whether the
/// deadline fires here or the database itself gives up on a lock
pub async fn bounded<T, Fut>(limit: Duration, fut: Fut) -> MeterResult<T>
where
    Fut: Future<Output = MeterResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Err(e)) if e.is_lock_timeout() => {
            warn!("Store gave up waiting for a lock: {}", e);
            Err(MeterError::StoreTimeout(limit))
        }
        Ok(result) => result,
        Err(_) => Err(MeterError::StoreTimeout(limit)),
    }
}
