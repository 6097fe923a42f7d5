use clap::{Parser, Subcommand};
use log::info;
use std::env;
use std::sync::Arc;

use stars_meter::clock::SystemClock;
use stars_meter::config::MeterConfig;
use stars_meter::entitlement::ResourceKind;
use stars_meter::experiments::catalog_labels;
use stars_meter::migrations::MigrationManager;
use stars_meter::referral_manager::{PayoutStatus, ReviewOutcome};
use stars_meter::storage::PgStore;
use stars_meter::Meter;

#[derive(Parser)]
#[command(name = "stars-meter")]
#[command(about = "Operator tool for the Stars entitlement and usage meter")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// apply pending database migrations
    Migrate,
    /// show plan and today's usage of a user
    Usage { user_id: i64 },
    /// grant same-day bonus units (kind: text or image)
    Grant {
        user_id: i64,
        kind: ResourceKind,
        amount: i64,
    },
    /// list payout requests, oldest first
    Payouts {
        /// new, paid or rejected
        #[arg(long)]
        status: Option<String>,
    },
    /// mark a payout as paid and debit the inviter balance
    Approve { payout_id: i64 },
    /// reject a payout, balance stays untouched
    Reject {
        payout_id: i64,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// force every user of an experiment onto one variant
    Pin { experiment: String, variant: String },
    /// drop a pinned winner
    Unpin { experiment: String },
    /// show the variant a user gets in an experiment
    Bucket { user_id: i64, experiment: String },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn known_labels(
    experiment: &str,
) -> Result<Vec<&'static str>, Box<dyn std::error::Error + Send + Sync>> {
    catalog_labels(experiment).ok_or_else(|| format!("unknown experiment '{}'", experiment).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // initialize rustls crypto provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let config = Arc::new(MeterConfig::load()?);

    let database_url =
        env::var("DATABASE_URL").map_err(|_| "DATABASE_URL environment variable is required")?;
    let store = Arc::new(PgStore::connect(&database_url, config.store_timeout())?);

    if let Command::Migrate = args.command {
        MigrationManager::run_migrations(store.pool()).await?;
        return Ok(());
    }

    let meter = Meter::new(store, Arc::new(SystemClock), config);

    match args.command {
        Command::Migrate => {}
        Command::Usage { user_id } => {
            print_json(&meter.entitlements.status(user_id).await?)?;
            print_json(&meter.referrals.account(user_id).await?)?;
        }
        Command::Grant {
            user_id,
            kind,
            amount,
        } => {
            let total = meter.entitlements.grant_bonus(user_id, kind, amount).await?;
            println!("user {} now has {} bonus {} units today", user_id, total, kind);
        }
        Command::Payouts { status } => {
            let status = match status {
                Some(raw) => Some(
                    PayoutStatus::from_key(&raw)
                        .ok_or_else(|| format!("unknown payout status '{}'", raw))?,
                ),
                None => None,
            };
            print_json(&meter.referrals.list_payouts(status).await?)?;
        }
        Command::Approve { payout_id } => {
            let outcome = meter.referrals.approve_payout(payout_id).await?;
            print_json(&outcome)?;
            if !matches!(outcome, ReviewOutcome::Paid(_)) {
                return Err(format!("payout {} was not approved", payout_id).into());
            }
        }
        Command::Reject { payout_id, note } => {
            let outcome = meter.referrals.reject_payout(payout_id, &note).await?;
            print_json(&outcome)?;
            if !matches!(outcome, ReviewOutcome::Rejected(_)) {
                return Err(format!("payout {} was not rejected", payout_id).into());
            }
        }
        Command::Pin {
            experiment,
            variant,
        } => {
            let labels = known_labels(&experiment)?;
            if !labels.iter().any(|label| *label == variant) {
                return Err(format!(
                    "'{}' is not a variant of {} (expected one of {:?})",
                    variant, experiment, labels
                )
                .into());
            }
            meter.experiments.pin_winner(&experiment, &variant).await?;
        }
        Command::Unpin { experiment } => {
            if !meter.experiments.clear_winner(&experiment).await? {
                info!("Experiment {} had no pinned winner", experiment);
            }
        }
        Command::Bucket {
            user_id,
            experiment,
        } => {
            let labels = known_labels(&experiment)?;
            let variant = meter.experiments.assign(user_id, &experiment, &labels).await;
            println!("{}", variant);
        }
    }

    Ok(())
}
