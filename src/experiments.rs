use log::{info, warn};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::MeterConfig;
use crate::entitlement::Plan;
use crate::error::MeterResult;
use crate::storage::{bounded, Storage};

/// label returned when an experiment has no variants
pub const FALLBACK_VARIANT: &str = "control";

/// stable bucket in `0..buckets` for the pair; first 4 digest bytes, big-endian, modulo `buckets`
pub fn bucket_index(user_id: i64, experiment: &str, buckets: usize) -> usize {
    debug_assert!(buckets > 0);
    let digest = Sha256::digest(format!("{}:{}", experiment, user_id).as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix as usize % buckets
}

/// deterministic variant for `user_id` in `experiment`
pub fn assign_bucket<'a, V: AsRef<str>>(
    user_id: i64,
    experiment: &str,
    variants: &'a [V],
) -> &'a str {
    if variants.is_empty() {
        return FALLBACK_VARIANT;
    }
    let variant: &'a V = &variants[bucket_index(user_id, experiment, variants.len())];
    AsRef::<str>::as_ref(variant)
}

/// like `assign_bucket`, but a pinned winner that is one of the variants takes precedence
pub fn pick_variant<'a, V: AsRef<str>>(
    user_id: i64,
    experiment: &str,
    variants: &'a [V],
    winner: Option<&str>,
) -> &'a str {
    if let Some(winner) = winner {
        let pinned = variants
            .iter()
            .find(|v| AsRef::<str>::as_ref(*v) == winner);
        if let Some(pinned) = pinned {
            return AsRef::<str>::as_ref(pinned);
        }
    }
    assign_bucket(user_id, experiment, variants)
}

/// experiment with a typed value behind every variant label
#[derive(Debug)]
pub struct Experiment<T: 'static> {
    pub name: &'static str,
    pub variants: &'static [(&'static str, T)],
}

impl<T: Copy + 'static> Experiment<T> {
    pub fn labels(&self) -> Vec<&'static str> {
        self.variants.iter().map(|(label, _)| *label).collect()
    }

    pub fn value_of(&self, label: &str) -> Option<T> {
        self.variants
            .iter()
            .find(|(candidate, _)| *candidate == label)
            .map(|(_, value)| *value)
    }

    /// `None` only for an experiment declared without variants
    pub fn resolve(&self, user_id: i64, winner: Option<&str>) -> Option<(&'static str, T)> {
        let labels = self.labels();
        let picked = pick_variant(user_id, self.name, &labels, winner);
        self.variants
            .iter()
            .find(|(label, _)| *label == picked)
            .map(|(label, value)| (*label, *value))
    }
}

pub const START_PRICE: Experiment<u32> = Experiment {
    name: "start_price",
    variants: &[("p299", 299), ("p349", 349), ("p399", 399)],
};

pub const PAYWALL_TEXT: Experiment<&'static str> = Experiment {
    name: "paywall_text",
    variants: &[
        ("a", "You are using the bot for free. Subscribe to get more answers and photo homework checks."),
        ("b", "With a subscription you learn faster: more answers, walkthroughs, photo checks and images."),
        ("c", "Many students already learn with the bot. Subscribe to lift the limits and get full access."),
    ],
};

/// week deal variants resolve to top-up pack keys of the catalog
pub const WEEK_DEAL: Experiment<&'static str> = Experiment {
    name: "week_deal",
    variants: &[
        ("combo", "week_combo"),
        ("text", "week_text"),
        ("img", "week_img"),
        ("ultra", "week_ultra"),
    ],
};

pub const RECOMMEND_PLAN: Experiment<Plan> = Experiment {
    name: "recommend_plan",
    variants: &[("rec_start", Plan::Basic), ("rec_pro", Plan::Pro)],
};

/// free answers after which the soft paywall is shown
pub const PAYWALL_TRIGGER: Experiment<u32> = Experiment {
    name: "paywall_trigger",
    variants: &[("t2", 2), ("t5", 5)],
};

/// variant labels of a catalog experiment, looked up by name
pub fn catalog_labels(experiment: &str) -> Option<Vec<&'static str>> {
    match experiment {
        name if name == START_PRICE.name => Some(START_PRICE.labels()),
        name if name == PAYWALL_TEXT.name => Some(PAYWALL_TEXT.labels()),
        name if name == WEEK_DEAL.name => Some(WEEK_DEAL.labels()),
        name if name == RECOMMEND_PLAN.name => Some(RECOMMEND_PLAN.labels()),
        name if name == PAYWALL_TRIGGER.name => Some(PAYWALL_TRIGGER.labels()),
        _ => None,
    }
}

/// bucket assignment backed by operator-pinned winners in storage
pub struct Experiments<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: Arc<MeterConfig>,
}

impl<S: Storage> Experiments<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: Arc<MeterConfig>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// pinned winner lookup is best effort: a store failure falls back to the computed bucket
    async fn winner(&self, experiment: &str) -> Option<String> {
        match bounded(
            self.config.store_timeout(),
            self.store.pinned_winner(experiment),
        )
        .await
        {
            Ok(winner) => winner,
            Err(e) => {
                warn!("Failed to read pinned winner of {}: {}", experiment, e);
                None
            }
        }
    }

    pub async fn assign<V: AsRef<str>>(
        &self,
        user_id: i64,
        experiment: &str,
        variants: &[V],
    ) -> String {
        let winner = self.winner(experiment).await;
        pick_variant(user_id, experiment, variants, winner.as_deref()).to_string()
    }

    pub async fn resolve<T: Copy + 'static>(
        &self,
        user_id: i64,
        experiment: &Experiment<T>,
    ) -> Option<(&'static str, T)> {
        let winner = self.winner(experiment.name).await;
        experiment.resolve(user_id, winner.as_deref())
    }

    pub async fn pin_winner(&self, experiment: &str, variant: &str) -> MeterResult<()> {
        bounded(
            self.config.store_timeout(),
            self.store
                .pin_winner(experiment, variant, self.clock.now()),
        )
        .await?;
        info!("Pinned winner {} for experiment {}", variant, experiment);
        Ok(())
    }

    pub async fn clear_winner(&self, experiment: &str) -> MeterResult<bool> {
        let cleared = bounded(
            self.config.store_timeout(),
            self.store.clear_winner(experiment),
        )
        .await?;
        if cleared {
            info!("Cleared pinned winner for experiment {}", experiment);
        }
        Ok(cleared)
    }
}
