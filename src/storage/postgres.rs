use async_trait::async_trait;
use chrono::{DateTime, Duration as WindowSpan, NaiveDate, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use log::info;
use std::time::Duration;
use tokio_postgres::{Row, Transaction};
use tokio_postgres_rustls::MakeRustlsConnect;

use super::Storage;
use crate::entitlement::{Entitlement, PerKind, Plan, PromoOffer};
use crate::error::{MeterError, MeterResult};
use crate::payment_ledger::{PaymentKind, PaymentRecord};
use crate::referral_manager::{
    PayoutRejection, PayoutRequest, PayoutStatus, ReferralAccount, ReferralCredit, ReferralLink,
};

const ENTITLEMENT_COLUMNS: &str = "user_id, plan, plan_expires_at, day_key, text_used, image_used, text_bonus, image_bonus, trial_used, promo_kind, promo_expires_at, last_offer_at";
const PAYMENT_COLUMNS: &str = "charge_id, user_id, amount, kind, payload, recognized, created_at";
const LINK_COLUMNS: &str = "invitee_id, inviter_id, first_payment_made, created_at";
const CREDIT_COLUMNS: &str = "charge_id, invitee_id, inviter_id, amount, created_at";
const ACCOUNT_COLUMNS: &str =
    "user_id, balance, total_credited, total_paid_out, last_payout_request_at";
const PAYOUT_COLUMNS: &str = "id, user_id, amount, status, created_at, reviewed_at, admin_note";

const PROMPT_ACTION: &str = "prompt";

fn corrupt(what: String) -> MeterError {
    MeterError::StoreUnavailable(what.into())
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn entitlement_from_row(row: &Row) -> MeterResult<Entitlement> {
    let user_id: i64 = row.get(0);
    let plan: String = row.get(1);
    let plan = Plan::from_key(&plan)
        .ok_or_else(|| corrupt(format!("unknown plan '{}' stored for user {}", plan, user_id)))?;

    Ok(Entitlement {
        user_id,
        plan,
        plan_expires_at: row.get(2),
        day_key: row.get(3),
        usage: PerKind::new(to_u32(row.get(4)), to_u32(row.get(5))),
        bonus: PerKind::new(to_u32(row.get(6)), to_u32(row.get(7))),
        trial_used: row.get(8),
        promo: row
            .get::<_, Option<String>>(9)
            .zip(row.get::<_, Option<DateTime<Utc>>>(10))
            .map(|(kind, expires_at)| PromoOffer { kind, expires_at }),
        last_offer_at: row.get(11),
    })
}

fn payment_from_row(row: &Row) -> MeterResult<PaymentRecord> {
    let charge_id: String = row.get(0);
    let kind: String = row.get(3);
    let kind = PaymentKind::from_key(&kind)
        .ok_or_else(|| corrupt(format!("unknown payment kind '{}' on {}", kind, charge_id)))?;

    Ok(PaymentRecord {
        charge_id,
        user_id: row.get(1),
        amount: row.get(2),
        kind,
        payload: row.get(4),
        recognized: row.get(5),
        created_at: row.get(6),
    })
}

fn link_from_row(row: &Row) -> ReferralLink {
    ReferralLink {
        invitee_id: row.get(0),
        inviter_id: row.get(1),
        first_payment_made: row.get(2),
        created_at: row.get(3),
    }
}

fn credit_from_row(row: &Row) -> ReferralCredit {
    ReferralCredit {
        charge_id: row.get(0),
        invitee_id: row.get(1),
        inviter_id: row.get(2),
        amount: row.get(3),
        created_at: row.get(4),
    }
}

fn account_from_row(row: &Row) -> ReferralAccount {
    ReferralAccount {
        user_id: row.get(0),
        balance: row.get(1),
        total_credited: row.get(2),
        total_paid_out: row.get(3),
        last_payout_request_at: row.get(4),
    }
}

fn payout_from_row(row: &Row) -> MeterResult<PayoutRequest> {
    let id: i64 = row.get(0);
    let status: String = row.get(3);
    let status = PayoutStatus::from_key(&status)
        .ok_or_else(|| corrupt(format!("unknown payout status '{}' on {}", status, id)))?;

    Ok(PayoutRequest {
        id,
        user_id: row.get(1),
        amount: row.get(2),
        status,
        created_at: row.get(4),
        reviewed_at: row.get(5),
        admin_note: row.get(6),
    })
}

/// PostgreSQL-backed store; every mutation is one transaction holding row locks
pub struct PgStore {
    pool: Pool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: Pool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// builds a TLS pool for `database_url`
    pub fn connect(database_url: &str, lock_timeout: Duration) -> MeterResult<Self> {
        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = MakeRustlsConnect::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let pool = config.create_pool(Some(Runtime::Tokio1), tls)?;

        info!("Created database pool");
        Ok(Self::new(pool, lock_timeout))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn set_lock_timeout(&self, transaction: &Transaction<'_>) -> MeterResult<()> {
        transaction
            .batch_execute(&format!(
                "SET LOCAL lock_timeout = '{}ms'",
                self.lock_timeout.as_millis()
            ))
            .await?;
        Ok(())
    }

    async fn lock_entitlement(
        transaction: &Transaction<'_>,
        user_id: i64,
        today: NaiveDate,
    ) -> MeterResult<Entitlement> {
        transaction
            .execute(
                "INSERT INTO entitlements (user_id, day_key) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING",
                &[&user_id, &today],
            )
            .await?;

        let row = transaction
            .query_one(
                &format!(
                    "SELECT {} FROM entitlements WHERE user_id = $1 FOR UPDATE",
                    ENTITLEMENT_COLUMNS
                ),
                &[&user_id],
            )
            .await?;
        entitlement_from_row(&row)
    }

    async fn write_entitlement(
        transaction: &Transaction<'_>,
        entitlement: &Entitlement,
    ) -> MeterResult<()> {
        transaction
            .execute(
                "UPDATE entitlements SET plan = $2, plan_expires_at = $3, day_key = $4,
                    text_used = $5, image_used = $6, text_bonus = $7, image_bonus = $8,
                    trial_used = $9, promo_kind = $10, promo_expires_at = $11,
                    last_offer_at = $12, updated_at = NOW()
                 WHERE user_id = $1",
                &[
                    &entitlement.user_id,
                    &entitlement.plan.key(),
                    &entitlement.plan_expires_at,
                    &entitlement.day_key,
                    &to_i32(entitlement.usage.text),
                    &to_i32(entitlement.usage.image),
                    &to_i32(entitlement.bonus.text),
                    &to_i32(entitlement.bonus.image),
                    &entitlement.trial_used,
                    &entitlement.promo.as_ref().map(|promo| promo.kind.as_str()),
                    &entitlement.promo.as_ref().map(|promo| promo.expires_at),
                    &entitlement.last_offer_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn lock_link(
        transaction: &Transaction<'_>,
        invitee_id: i64,
    ) -> MeterResult<Option<ReferralLink>> {
        let row = transaction
            .query_opt(
                &format!(
                    "SELECT {} FROM referral_links WHERE invitee_id = $1 FOR UPDATE",
                    LINK_COLUMNS
                ),
                &[&invitee_id],
            )
            .await?;
        Ok(row.as_ref().map(link_from_row))
    }

    async fn write_link(transaction: &Transaction<'_>, link: &ReferralLink) -> MeterResult<()> {
        transaction
            .execute(
                "UPDATE referral_links SET first_payment_made = $2 WHERE invitee_id = $1",
                &[&link.invitee_id, &link.first_payment_made],
            )
            .await?;
        Ok(())
    }

    async fn lock_account(
        transaction: &Transaction<'_>,
        user_id: i64,
    ) -> MeterResult<ReferralAccount> {
        transaction
            .execute(
                "INSERT INTO referral_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
                &[&user_id],
            )
            .await?;

        let row = transaction
            .query_one(
                &format!(
                    "SELECT {} FROM referral_accounts WHERE user_id = $1 FOR UPDATE",
                    ACCOUNT_COLUMNS
                ),
                &[&user_id],
            )
            .await?;
        Ok(account_from_row(&row))
    }

    async fn write_account(
        transaction: &Transaction<'_>,
        account: &ReferralAccount,
    ) -> MeterResult<()> {
        transaction
            .execute(
                "UPDATE referral_accounts SET balance = $2, total_credited = $3,
                    total_paid_out = $4, last_payout_request_at = $5
                 WHERE user_id = $1",
                &[
                    &account.user_id,
                    &account.balance,
                    &account.total_credited,
                    &account.total_paid_out,
                    &account.last_payout_request_at,
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStore {
    async fn load_entitlement(&self, user_id: i64) -> MeterResult<Option<Entitlement>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM entitlements WHERE user_id = $1",
                    ENTITLEMENT_COLUMNS
                ),
                &[&user_id],
            )
            .await?;
        row.as_ref().map(entitlement_from_row).transpose()
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
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        let mut entitlement = Self::lock_entitlement(&transaction, user_id, today).await?;
        let before = entitlement.clone();
        let out = mutate(&mut entitlement);

        if entitlement != before {
            Self::write_entitlement(&transaction, &entitlement).await?;
        }
        transaction.commit().await?;
        Ok(out)
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
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        // payer row first so concurrent charges of one user serialize on it
        let mut entitlement = Self::lock_entitlement(&transaction, record.user_id, today).await?;

        let inserted = transaction
            .query_opt(
                "INSERT INTO payments (charge_id, user_id, amount, kind, payload, recognized, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (charge_id) DO NOTHING
                 RETURNING charge_id",
                &[
                    &record.charge_id,
                    &record.user_id,
                    &record.amount,
                    &record.kind.key(),
                    &record.payload,
                    &record.recognized,
                    &record.created_at,
                ],
            )
            .await?;

        if inserted.is_none() {
            transaction.rollback().await?;
            return Ok(None);
        }

        let paid_before: bool = transaction
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM payments WHERE user_id = $1 AND recognized AND charge_id <> $2)",
                &[&record.user_id, &record.charge_id],
            )
            .await?
            .get(0);

        let before = entitlement.clone();
        let out = effect(&mut entitlement, !paid_before);
        if entitlement != before {
            Self::write_entitlement(&transaction, &entitlement).await?;
        }

        transaction.commit().await?;
        Ok(Some(out))
    }

    async fn load_payment(&self, charge_id: &str) -> MeterResult<Option<PaymentRecord>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM payments WHERE charge_id = $1", PAYMENT_COLUMNS),
                &[&charge_id],
            )
            .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn link_referral(
        &self,
        invitee_id: i64,
        inviter_id: i64,
        now: DateTime<Utc>,
    ) -> MeterResult<bool> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        let linked = transaction
            .query_opt(
                "INSERT INTO referral_links (invitee_id, inviter_id, created_at) VALUES ($1, $2, $3)
                 ON CONFLICT (invitee_id) DO NOTHING
                 RETURNING invitee_id",
                &[&invitee_id, &inviter_id, &now],
            )
            .await?
            .is_some();

        if linked {
            transaction
                .execute(
                    "INSERT INTO referral_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
                    &[&inviter_id],
                )
                .await?;
        }

        transaction.commit().await?;
        Ok(linked)
    }

    async fn load_referral_link(&self, invitee_id: i64) -> MeterResult<Option<ReferralLink>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM referral_links WHERE invitee_id = $1",
                    LINK_COLUMNS
                ),
                &[&invitee_id],
            )
            .await?;
        Ok(row.as_ref().map(link_from_row))
    }

    async fn update_referral<F, R>(&self, invitee_id: i64, mutate: F) -> MeterResult<Option<R>>
    where
        F: FnOnce(&mut ReferralLink, &mut ReferralAccount) -> R + Send,
        R: Send,
    {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        let mut link = match Self::lock_link(&transaction, invitee_id).await? {
            Some(link) => link,
            None => {
                transaction.rollback().await?;
                return Ok(None);
            }
        };
        let mut account = Self::lock_account(&transaction, link.inviter_id).await?;

        let link_before = link.clone();
        let account_before = account.clone();
        let out = mutate(&mut link, &mut account);

        if link != link_before {
            Self::write_link(&transaction, &link).await?;
        }
        if account != account_before {
            Self::write_account(&transaction, &account).await?;
        }

        transaction.commit().await?;
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
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        // the link lock serializes concurrent credits of one invitee, so the lookup below is stable
        let mut link = match Self::lock_link(&transaction, invitee_id).await? {
            Some(link) => link,
            None => {
                transaction.rollback().await?;
                return Ok(None);
            }
        };

        let existing = transaction
            .query_opt(
                &format!(
                    "SELECT {} FROM referral_credits WHERE charge_id = $1",
                    CREDIT_COLUMNS
                ),
                &[&charge_id],
            )
            .await?;
        if let Some(row) = existing {
            transaction.rollback().await?;
            return Ok(Some((credit_from_row(&row), false)));
        }

        let mut account = Self::lock_account(&transaction, link.inviter_id).await?;
        let link_before = link.clone();
        let account_before = account.clone();
        let amount = credit(&mut link, &mut account);

        if link != link_before {
            Self::write_link(&transaction, &link).await?;
        }
        if account != account_before {
            Self::write_account(&transaction, &account).await?;
        }

        let record = ReferralCredit {
            charge_id: charge_id.to_string(),
            invitee_id,
            inviter_id: link.inviter_id,
            amount,
            created_at: now,
        };
        transaction
            .execute(
                "INSERT INTO referral_credits (charge_id, invitee_id, inviter_id, amount, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &record.charge_id,
                    &record.invitee_id,
                    &record.inviter_id,
                    &record.amount,
                    &record.created_at,
                ],
            )
            .await?;

        transaction.commit().await?;
        Ok(Some((record, true)))
    }

    async fn load_account(&self, user_id: i64) -> MeterResult<ReferralAccount> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM referral_accounts WHERE user_id = $1",
                    ACCOUNT_COLUMNS
                ),
                &[&user_id],
            )
            .await?;
        Ok(row
            .as_ref()
            .map(account_from_row)
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
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        let account = Self::lock_account(&transaction, user_id).await?;
        if let Err(rejection) = check(&account) {
            transaction.rollback().await?;
            return Ok(Err(rejection));
        }

        let row = transaction
            .query_one(
                &format!(
                    "INSERT INTO payout_requests (user_id, amount, status, created_at)
                     VALUES ($1, $2, 'new', $3)
                     RETURNING {}",
                    PAYOUT_COLUMNS
                ),
                &[&user_id, &amount, &now],
            )
            .await?;

        transaction
            .execute(
                "UPDATE referral_accounts SET last_payout_request_at = $2 WHERE user_id = $1",
                &[&user_id, &now],
            )
            .await?;

        let request = payout_from_row(&row)?;
        transaction.commit().await?;
        Ok(Ok(request))
    }

    async fn review_payout<F, R>(&self, payout_id: i64, mutate: F) -> MeterResult<Option<R>>
    where
        F: FnOnce(&mut PayoutRequest, &mut ReferralAccount) -> R + Send,
        R: Send,
    {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        let row = transaction
            .query_opt(
                &format!(
                    "SELECT {} FROM payout_requests WHERE id = $1 FOR UPDATE",
                    PAYOUT_COLUMNS
                ),
                &[&payout_id],
            )
            .await?;

        let mut request = match row {
            Some(row) => payout_from_row(&row)?,
            None => {
                transaction.rollback().await?;
                return Ok(None);
            }
        };
        let mut account = Self::lock_account(&transaction, request.user_id).await?;

        let request_before = request.clone();
        let account_before = account.clone();
        let out = mutate(&mut request, &mut account);

        if request != request_before {
            transaction
                .execute(
                    "UPDATE payout_requests SET status = $2, reviewed_at = $3, admin_note = $4 WHERE id = $1",
                    &[
                        &request.id,
                        &request.status.key(),
                        &request.reviewed_at,
                        &request.admin_note,
                    ],
                )
                .await?;
        }
        if account != account_before {
            Self::write_account(&transaction, &account).await?;
        }

        transaction.commit().await?;
        Ok(Some(out))
    }

    async fn list_payouts(&self, status: Option<PayoutStatus>) -> MeterResult<Vec<PayoutRequest>> {
        let client = self.pool.get().await?;
        let rows = match status {
            Some(status) => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM payout_requests WHERE status = $1 ORDER BY created_at, id",
                            PAYOUT_COLUMNS
                        ),
                        &[&status.key()],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM payout_requests ORDER BY created_at, id",
                            PAYOUT_COLUMNS
                        ),
                        &[],
                    )
                    .await?
            }
        };
        rows.iter().map(payout_from_row).collect()
    }

    async fn pinned_winner(&self, experiment: &str) -> MeterResult<Option<String>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT variant FROM experiment_winners WHERE experiment = $1",
                &[&experiment],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn pin_winner(
        &self,
        experiment: &str,
        variant: &str,
        now: DateTime<Utc>,
    ) -> MeterResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO experiment_winners (experiment, variant, pinned_at) VALUES ($1, $2, $3)
                 ON CONFLICT (experiment) DO UPDATE SET variant = EXCLUDED.variant, pinned_at = EXCLUDED.pinned_at",
                &[&experiment, &variant, &now],
            )
            .await?;
        Ok(())
    }

    async fn clear_winner(&self, experiment: &str) -> MeterResult<bool> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM experiment_winners WHERE experiment = $1",
                &[&experiment],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn hit_window(
        &self,
        user_id: i64,
        action: &str,
        now: DateTime<Utc>,
        window: WindowSpan,
        limit: u32,
    ) -> MeterResult<bool> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        // serializes window checks of one user without needing an existing row
        transaction
            .execute("SELECT pg_advisory_xact_lock($1)", &[&user_id])
            .await?;

        let cutoff = now - window;
        transaction
            .execute(
                "DELETE FROM window_events WHERE user_id = $1 AND action = $2 AND at < $3",
                &[&user_id, &action, &cutoff],
            )
            .await?;

        let count: i64 = transaction
            .query_one(
                "SELECT COUNT(*) FROM window_events WHERE user_id = $1 AND action = $2",
                &[&user_id, &action],
            )
            .await?
            .get(0);

        let allowed = count < i64::from(limit);
        if allowed {
            transaction
                .execute(
                    "INSERT INTO window_events (user_id, action, at) VALUES ($1, $2, $3)",
                    &[&user_id, &action, &now],
                )
                .await?;
        }

        transaction.commit().await?;
        Ok(allowed)
    }

    async fn record_fingerprint(
        &self,
        user_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
        window: WindowSpan,
    ) -> MeterResult<u32> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        self.set_lock_timeout(&transaction).await?;

        transaction
            .execute("SELECT pg_advisory_xact_lock($1)", &[&user_id])
            .await?;

        let cutoff = now - window;
        transaction
            .execute(
                "DELETE FROM window_events WHERE user_id = $1 AND action = $2 AND at < $3",
                &[&user_id, &PROMPT_ACTION, &cutoff],
            )
            .await?;

        let seen: i64 = transaction
            .query_one(
                "SELECT COUNT(*) FROM window_events WHERE user_id = $1 AND action = $2 AND fingerprint = $3",
                &[&user_id, &PROMPT_ACTION, &fingerprint],
            )
            .await?
            .get(0);

        transaction
            .execute(
                "INSERT INTO window_events (user_id, action, fingerprint, at) VALUES ($1, $2, $3, $4)",
                &[&user_id, &PROMPT_ACTION, &fingerprint, &now],
            )
            .await?;

        transaction.commit().await?;
        Ok(u32::try_from(seen).unwrap_or(u32::MAX))
    }
}
