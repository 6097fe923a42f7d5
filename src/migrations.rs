use deadpool_postgres::Pool;
use log::info;
use tokio_postgres::Transaction;

use crate::error::MeterResult;

pub struct MigrationManager;

impl MigrationManager {
    pub async fn run_migrations(pool: &Pool) -> MeterResult<()> {
        info!("Running database migrations...");
        let mut client = pool.get().await?;

        let needs_init = client
            .query_opt(
                "SELECT 1 FROM pg_tables WHERE schemaname = 'public' AND tablename = 'schema_migrations'",
                &[],
            )
            .await?
            .is_none();

        if needs_init {
            let transaction = client.transaction().await?;
            Self::initial_setup(&transaction).await?;
            transaction.commit().await?;
            info!("Initial database setup completed");
        }

        let current_version = Self::current_version(&client).await?;
        if current_version < Self::latest_version() {
            let transaction = client.transaction().await?;
            Self::run_pending_migrations(&transaction, current_version).await?;
            transaction.commit().await?;
            info!(
                "Database migrated from version {} to {}",
                current_version,
                Self::latest_version()
            );
        } else {
            info!("Database schema is up to date");
        }

        Ok(())
    }

    async fn initial_setup(transaction: &Transaction<'_>) -> MeterResult<()> {
        let migration_sql = r#"
            CREATE TABLE schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            );

            -- one row per user, day counters reset lazily on first touch of a new day
            CREATE TABLE entitlements (
                user_id BIGINT PRIMARY KEY,
                plan VARCHAR(16) NOT NULL DEFAULT 'free' CHECK (plan IN ('free', 'basic', 'pro', 'ultra')),
                plan_expires_at TIMESTAMP WITH TIME ZONE,
                day_key DATE NOT NULL,
                text_used INTEGER NOT NULL DEFAULT 0 CHECK (text_used >= 0),
                image_used INTEGER NOT NULL DEFAULT 0 CHECK (image_used >= 0),
                text_bonus INTEGER NOT NULL DEFAULT 0 CHECK (text_bonus >= 0),
                image_bonus INTEGER NOT NULL DEFAULT 0 CHECK (image_bonus >= 0),
                trial_used BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            );

            CREATE TABLE payments (
                charge_id VARCHAR(255) PRIMARY KEY,
                user_id BIGINT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount >= 0),
                kind VARCHAR(20) NOT NULL CHECK (kind IN ('subscription', 'topup')),
                payload TEXT NOT NULL,
                recognized BOOLEAN NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            );

            CREATE INDEX idx_payments_user ON payments(user_id, created_at);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#;

        transaction.batch_execute(migration_sql).await?;
        Ok(())
    }

    async fn current_version(client: &deadpool_postgres::Object) -> MeterResult<i32> {
        let row = client
            .query_one("SELECT MAX(version) FROM schema_migrations", &[])
            .await?;
        Ok(row.get::<_, Option<i32>>(0).unwrap_or(0))
    }

    pub fn latest_version() -> i32 {
        4 // increment this when adding new migrations
    }

    async fn run_pending_migrations(
        transaction: &Transaction<'_>,
        current_version: i32,
    ) -> MeterResult<()> {
        for version in (current_version + 1)..=Self::latest_version() {
            match version {
                2 => {
                    // referral links, inviter balances and payout requests
                    let migration_sql = r#"
                        CREATE TABLE referral_links (
                            invitee_id BIGINT PRIMARY KEY,
                            inviter_id BIGINT NOT NULL,
                            first_payment_made BOOLEAN NOT NULL DEFAULT FALSE,
                            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                            CHECK (invitee_id <> inviter_id)
                        );

                        CREATE TABLE referral_accounts (
                            user_id BIGINT PRIMARY KEY,
                            balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
                            total_credited BIGINT NOT NULL DEFAULT 0,
                            total_paid_out BIGINT NOT NULL DEFAULT 0,
                            last_payout_request_at TIMESTAMP WITH TIME ZONE,
                            CHECK (total_paid_out <= total_credited)
                        );

                        CREATE TABLE payout_requests (
                            id BIGSERIAL PRIMARY KEY,
                            user_id BIGINT NOT NULL,
                            amount BIGINT NOT NULL CHECK (amount > 0),
                            status VARCHAR(16) NOT NULL DEFAULT 'new' CHECK (status IN ('new', 'paid', 'rejected')),
                            created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                            reviewed_at TIMESTAMP WITH TIME ZONE,
                            admin_note TEXT
                        );

                        CREATE INDEX idx_referral_links_inviter ON referral_links(inviter_id);
                        CREATE INDEX idx_payout_requests_status ON payout_requests(status, created_at);
                        CREATE INDEX idx_payout_requests_user ON payout_requests(user_id);
                    "#;
                    transaction.batch_execute(migration_sql).await?;
                }
                3 => {
                    // pinned experiment winners and sliding-window events for abuse checks
                    let migration_sql = r#"
                        CREATE TABLE experiment_winners (
                            experiment VARCHAR(64) PRIMARY KEY,
                            variant VARCHAR(64) NOT NULL,
                            pinned_at TIMESTAMP WITH TIME ZONE NOT NULL
                        );

                        CREATE TABLE window_events (
                            id BIGSERIAL PRIMARY KEY,
                            user_id BIGINT NOT NULL,
                            action VARCHAR(64) NOT NULL,
                            fingerprint VARCHAR(64),
                            at TIMESTAMP WITH TIME ZONE NOT NULL
                        );

                        CREATE INDEX idx_window_events_lookup ON window_events(user_id, action, at);
                    "#;
                    transaction.batch_execute(migration_sql).await?;
                }
                4 => {
                    // referral credits keyed by charge and time-boxed promo offers
                    let migration_sql = r#"
                        CREATE TABLE referral_credits (
                            charge_id VARCHAR(255) PRIMARY KEY,
                            invitee_id BIGINT NOT NULL,
                            inviter_id BIGINT NOT NULL,
                            amount BIGINT NOT NULL CHECK (amount >= 0),
                            created_at TIMESTAMP WITH TIME ZONE NOT NULL
                        );

                        CREATE INDEX idx_referral_credits_inviter ON referral_credits(inviter_id);

                        ALTER TABLE entitlements
                            ADD COLUMN promo_kind VARCHAR(32),
                            ADD COLUMN promo_expires_at TIMESTAMP WITH TIME ZONE,
                            ADD COLUMN last_offer_at TIMESTAMP WITH TIME ZONE;
                    "#;
                    transaction.batch_execute(migration_sql).await?;
                }
                _ => {}
            }
            transaction
                .execute(
                    "INSERT INTO schema_migrations (version) VALUES ($1)",
                    &[&version],
                )
                .await?;
        }
        Ok(())
    }
}
