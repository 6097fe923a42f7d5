pub mod clock;
pub mod config;
pub mod entitlement;
pub mod entitlement_manager;
pub mod error;
pub mod experiments;
pub mod migrations;
pub mod payment_ledger;
pub mod rate_limiters;
pub mod referral_manager;
pub mod storage;

use std::sync::Arc;

use clock::Clock;
use config::MeterConfig;
use entitlement_manager::EntitlementManager;
use experiments::Experiments;
use payment_ledger::PaymentLedger;
use rate_limiters::AbuseGuard;
use referral_manager::ReferralManager;
use storage::Storage;

/// every manager of the metering core wired over one store, clock and config
pub struct Meter<S> {
    pub entitlements: EntitlementManager<S>,
    pub payments: PaymentLedger<S>,
    pub referrals: Arc<ReferralManager<S>>,
    pub experiments: Experiments<S>,
    pub abuse: AbuseGuard<S>,
    config: Arc<MeterConfig>,
}

impl<S: Storage> Meter<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: Arc<MeterConfig>) -> Self {
        let referrals = Arc::new(ReferralManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));

        Self {
            entitlements: EntitlementManager::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                Arc::clone(&config),
            ),
            payments: PaymentLedger::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                Arc::clone(&config),
                Arc::clone(&referrals),
            ),
            referrals,
            experiments: Experiments::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                Arc::clone(&config),
            ),
            abuse: AbuseGuard::new(store, clock, Arc::clone(&config)),
            config,
        }
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }
}
