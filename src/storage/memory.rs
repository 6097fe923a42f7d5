use async_trait::async_trait;
use chrono::{DateTime, Duration as WindowSpan, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::Storage;
use crate::entitlement::Entitlement;
use crate::error::{MeterError, MeterResult};
use crate::payment_ledger::PaymentRecord;
use crate::referral_manager::{
    PayoutRejection, PayoutRequest, PayoutStatus, ReferralAccount, ReferralCredit, ReferralLink,
};

#[derive(Default)]
struct MemoryState {
    entitlements: HashMap<i64, Entitlement>,
    payments: HashMap<String, PaymentRecord>,
    links: HashMap<i64, ReferralLink>,
    accounts: HashMap<i64, ReferralAccount>,
    credits: HashMap<String, ReferralCredit>,
    payouts: BTreeMap<i64, PayoutRequest>,
    next_payout_id: i64,
    winners: HashMap<String, String>,
    hits: HashMap<(i64, String), VecDeque<DateTime<Utc>>>,
    fingerprints: HashMap<i64, VecDeque<(DateTime<Utc>, String)>>,
}

impl MemoryState {
    fn account_mut(&mut self, user_id: i64) -> &mut ReferralAccount {
        self.accounts
            .entry(user_id)
            .or_insert_with(|| ReferralAccount::empty(user_id))
    }
}

/// single-process store; one mutex serializes every operation, which trivially gives
/// per-user linearizability. Outages, one-off failures and latency can be injected for tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    fail_once: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// while offline every call fails with `StoreUnavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// delay added before every call
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// the next call of the named `Storage` method fails with `StoreUnavailable`
    pub async fn fail_next(&self, operation: &'static str) {
        self.fail_once.lock().await.insert(operation);
    }

    async fn guard(
        &self,
        operation: &'static str,
    ) -> MeterResult<tokio::sync::MutexGuard<'_, MemoryState>> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(MeterError::StoreUnavailable("memory store is offline".into()));
        }
        if self.fail_once.lock().await.remove(operation) {
            return Err(MeterError::StoreUnavailable(
                format!("injected failure of {}", operation).into(),
            ));
        }
        Ok(self.state.lock().await)
    }
}

fn prune<T>(events: &mut VecDeque<T>, cutoff: DateTime<Utc>, at: impl Fn(&T) -> DateTime<Utc>) {
    while events.front().map(|event| at(event) < cutoff).unwrap_or(false) {
        events.pop_front();
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn load_entitlement(&self, user_id: i64) -> MeterResult<Option<Entitlement>> {
        let state = self.guard("load_entitlement").await?;
        Ok(state.entitlements.get(&user_id).cloned())
    }

    async fn update_entitlement<F, R>(
        &self,
        user_id: i64,
        today: NaiveDate,
        mutate: F,
    ) -> MeterResult<R>
    where
        F: FnOnce(&mut Entitlement) -> R + Send,
        R: Send,
    {
        let mut state = self.guard("update_entitlement").await?;
        let entitlement = state
            .entitlements
            .entry(user_id)
            .or_insert_with(|| Entitlement::new(user_id, today));
        Ok(mutate(entitlement))
    }

    async fn record_payment<F, R>(
        &self,
        record: &PaymentRecord,
        today: NaiveDate,
        effect: F,
    ) -> MeterResult<Option<R>>
    where
        F: FnOnce(&mut Entitlement, bool) -> R + Send,
        R: Send,
    {
        let mut state = self.guard("record_payment").await?;
        if state.payments.contains_key(&record.charge_id) {
            return Ok(None);
        }

        let first = !state
            .payments
            .values()
            .any(|payment| payment.user_id == record.user_id && payment.recognized);
        state
            .payments
            .insert(record.charge_id.clone(), record.clone());

        let entitlement = state
            .entitlements
            .entry(record.user_id)
            .or_insert_with(|| Entitlement::new(record.user_id, today));
        Ok(Some(effect(entitlement, first)))
    }

    async fn load_payment(&self, charge_id: &str) -> MeterResult<Option<PaymentRecord>> {
        let state = self.guard("load_payment").await?;
        Ok(state.payments.get(charge_id).cloned())
    }

    async fn link_referral(
        &self,
        invitee_id: i64,
        inviter_id: i64,
        now: DateTime<Utc>,
    ) -> MeterResult<bool> {
        let mut state = self.guard("link_referral").await?;
        if state.links.contains_key(&invitee_id) {
            return Ok(false);
        }
        state.links.insert(
            invitee_id,
            ReferralLink {
                invitee_id,
                inviter_id,
                first_payment_made: false,
                created_at: now,
            },
        );
        state.account_mut(inviter_id);
        Ok(true)
    }

    async fn load_referral_link(&self, invitee_id: i64) -> MeterResult<Option<ReferralLink>> {
        let state = self.guard("load_referral_link").await?;
        Ok(state.links.get(&invitee_id).cloned())
    }

    async fn update_referral<F, R>(&self, invitee_id: i64, mutate: F) -> MeterResult<Option<R>>
    where
        F: FnOnce(&mut ReferralLink, &mut ReferralAccount) -> R + Send,
        R: Send,
    {
        let mut state = self.guard("update_referral").await?;
        let mut link = match state.links.get(&invitee_id) {
            Some(link) => link.clone(),
            None => return Ok(None),
        };
        let mut account = state.account_mut(link.inviter_id).clone();

        let out = mutate(&mut link, &mut account);

        state.accounts.insert(account.user_id, account);
        state.links.insert(invitee_id, link);
        Ok(Some(out))
    }

    async fn credit_referral<F>(
        &self,
        charge_id: &str,
        invitee_id: i64,
        now: DateTime<Utc>,
        credit: F,
    ) -> MeterResult<Option<(ReferralCredit, bool)>>
    where
        F: FnOnce(&mut ReferralLink, &mut ReferralAccount) -> i64 + Send,
    {
        let mut state = self.guard("credit_referral").await?;
        let mut link = match state.links.get(&invitee_id) {
            Some(link) => link.clone(),
            None => return Ok(None),
        };
        if let Some(existing) = state.credits.get(charge_id) {
            return Ok(Some((existing.clone(), false)));
        }
        let mut account = state.account_mut(link.inviter_id).clone();

        let amount = credit(&mut link, &mut account);
        let record = ReferralCredit {
            charge_id: charge_id.to_string(),
            invitee_id,
            inviter_id: link.inviter_id,
            amount,
            created_at: now,
        };

        state.accounts.insert(account.user_id, account);
        state.links.insert(invitee_id, link);
        state.credits.insert(record.charge_id.clone(), record.clone());
        Ok(Some((record, true)))
    }

    async fn load_account(&self, user_id: i64) -> MeterResult<ReferralAccount> {
        let state = self.guard("load_account").await?;
        Ok(state
            .accounts
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| ReferralAccount::empty(user_id)))
    }

    async fn create_payout<F>(
        &self,
        user_id: i64,
        amount: i64,
        now: DateTime<Utc>,
        check: F,
    ) -> MeterResult<Result<PayoutRequest, PayoutRejection>>
    where
        F: FnOnce(&ReferralAccount) -> Result<(), PayoutRejection> + Send,
    {
        let mut state = self.guard("create_payout").await?;
        if let Err(rejection) = check(state.account_mut(user_id)) {
            return Ok(Err(rejection));
        }

        state.next_payout_id += 1;
        let request = PayoutRequest {
            id: state.next_payout_id,
            user_id,
            amount,
            status: PayoutStatus::New,
            created_at: now,
            reviewed_at: None,
            admin_note: None,
        };
        state.payouts.insert(request.id, request.clone());
        state.account_mut(user_id).last_payout_request_at = Some(now);
        Ok(Ok(request))
    }

    async fn review_payout<F, R>(&self, payout_id: i64, mutate: F) -> MeterResult<Option<R>>
    where
        F: FnOnce(&mut PayoutRequest, &mut ReferralAccount) -> R + Send,
        R: Send,
    {
        let mut state = self.guard("review_payout").await?;
        let mut request = match state.payouts.get(&payout_id) {
            Some(request) => request.clone(),
            None => return Ok(None),
        };
        let mut account = state.account_mut(request.user_id).clone();

        let out = mutate(&mut request, &mut account);

        state.accounts.insert(account.user_id, account);
        state.payouts.insert(payout_id, request);
        Ok(Some(out))
    }

    async fn list_payouts(&self, status: Option<PayoutStatus>) -> MeterResult<Vec<PayoutRequest>> {
        let state = self.guard("list_payouts").await?;
        Ok(state
            .payouts
            .values()
            .filter(|request| status.map_or(true, |status| request.status == status))
            .cloned()
            .collect())
    }

    async fn pinned_winner(&self, experiment: &str) -> MeterResult<Option<String>> {
        let state = self.guard("pinned_winner").await?;
        Ok(state.winners.get(experiment).cloned())
    }

    async fn pin_winner(
        &self,
        experiment: &str,
        variant: &str,
        _now: DateTime<Utc>,
    ) -> MeterResult<()> {
        let mut state = self.guard("pin_winner").await?;
        state
            .winners
            .insert(experiment.to_string(), variant.to_string());
        Ok(())
    }

    async fn clear_winner(&self, experiment: &str) -> MeterResult<bool> {
        let mut state = self.guard("clear_winner").await?;
        Ok(state.winners.remove(experiment).is_some())
    }

    async fn hit_window(
        &self,
        user_id: i64,
        action: &str,
        now: DateTime<Utc>,
        window: WindowSpan,
        limit: u32,
    ) -> MeterResult<bool> {
        let mut state = self.guard("hit_window").await?;
        let events = state
            .hits
            .entry((user_id, action.to_string()))
            .or_default();
        prune(events, now - window, |at| *at);

        if events.len() >= limit as usize {
            return Ok(false);
        }
        events.push_back(now);
        Ok(true)
    }

    async fn record_fingerprint(
        &self,
        user_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
        window: WindowSpan,
    ) -> MeterResult<u32> {
        let mut state = self.guard("record_fingerprint").await?;
        let events = state.fingerprints.entry(user_id).or_default();
        prune(events, now - window, |(at, _)| *at);

        let seen = events
            .iter()
            .filter(|(_, existing)| existing == fingerprint)
            .count() as u32;
        events.push_back((now, fingerprint.to_string()));
        Ok(seen)
    }
}
