use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::entitlement::{LoadSignals, PerKind, Plan, ResourceKind};
use crate::error::MeterError;

/// paid tier definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    pub price: u32, // stars per subscription period
    pub daily: PerKind,
}

/// one-time same-day grant sold on top of the plan quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopupPack {
    pub title: String,
    pub price: u32,
    pub grant: PerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    pub percent: u32,
    pub require_first_payment: bool,
    pub min_payout: i64,
    pub payout_cooldown_hours: u32,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            percent: 10,
            require_first_payment: true,
            min_payout: 100,
            payout_cooldown_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseConfig {
    pub text_per_minute: u32,
    pub image_per_minute: u32,
    pub duplicate_window_secs: u64,
    pub duplicate_max: u32,
    pub max_prompt_chars: usize,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            text_per_minute: 20,
            image_per_minute: 5,
            duplicate_window_secs: 30,
            duplicate_max: 3,
            max_prompt_chars: 4000,
        }
    }
}

impl AbuseConfig {
    pub fn per_minute(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::Text => self.text_per_minute,
            ResourceKind::Image => self.image_per_minute,
        }
    }
}

/// bonus a personal offer adds when its plan is bought in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoSpec {
    pub plan: Plan,
    pub grant: PerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoConfig {
    pub ttl_minutes: u32,
    pub cooldown_hours: u32,
    /// FREE text answers used today before BASIC is offered
    pub free_engaged_text: u32,
    /// FREE text answers used today before PRO is offered
    pub free_heavy_text: u32,
    /// share of a paid plan's daily text quota used before the next tier is offered
    pub upgrade_usage_percent: u32,
    pub offers: HashMap<String, PromoSpec>,
}

fn promo(plan: Plan, text: u32) -> PromoSpec {
    PromoSpec {
        plan,
        grant: PerKind::new(text, 0),
    }
}

impl Default for PromoConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 60,
            cooldown_hours: 6,
            free_engaged_text: 3,
            free_heavy_text: 5,
            upgrade_usage_percent: 70,
            offers: HashMap::from([
                ("start_boost".to_string(), promo(Plan::Basic, 30)),
                ("pro_boost".to_string(), promo(Plan::Pro, 80)),
                ("ultra_boost".to_string(), promo(Plan::Ultra, 200)),
            ]),
        }
    }
}

impl PromoConfig {
    /// offer that targets `plan`, with its key
    pub fn offer_for(&self, plan: Plan) -> Option<(&str, &PromoSpec)> {
        self.offers
            .iter()
            .find(|(_, spec)| spec.plan == plan)
            .map(|(kind, spec)| (kind.as_str(), spec))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadTier {
    pub below_active_users: u32,
    pub text: u32,
}

/// FREE text quota that follows load and spend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeLoadPolicy {
    /// ascending by `below_active_users`; the first tier above today's active users wins
    pub tiers: Vec<LoadTier>,
    /// quota past the last tier and whenever spend is over budget
    pub busiest_text: u32,
    /// provider cost as a percent of revenue above which the quota drops to `busiest_text`
    pub max_cost_percent: u32,
}

impl Default for FreeLoadPolicy {
    fn default() -> Self {
        let tier = |below_active_users, text| LoadTier {
            below_active_users,
            text,
        };
        Self {
            tiers: vec![tier(100, 25), tier(500, 20), tier(2000, 15)],
            busiest_text: 10,
            max_cost_percent: 60,
        }
    }
}

impl FreeLoadPolicy {
    /// no revenue yet counts as over budget
    pub fn over_budget(&self, load: &LoadSignals) -> bool {
        if load.revenue_today <= 0 {
            return true;
        }
        load.api_cost_today.saturating_mul(100)
            > load
                .revenue_today
                .saturating_mul(i64::from(self.max_cost_percent))
    }

    pub fn free_text(&self, load: &LoadSignals) -> u32 {
        if self.over_budget(load) {
            return self.busiest_text;
        }
        self.tiers
            .iter()
            .find(|tier| load.active_users_today < tier.below_active_users)
            .map(|tier| tier.text)
            .unwrap_or(self.busiest_text)
    }
}

/// resource catalog and policy switches for the metering core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub free_daily: PerKind,
    pub plans: HashMap<Plan, PlanSpec>,
    pub packs: HashMap<String, TopupPack>,
    pub subscription_days: u32,
    pub topup_requires_active_plan: bool,
    pub trial_plan: Plan,
    pub trial_days: u32,
    pub first_purchase_bonus: Option<PerKind>,
    pub promo: PromoConfig,
    /// when set, replaces `free_daily.text` once load has been reported
    pub free_load: Option<FreeLoadPolicy>,
    pub referral: ReferralConfig,
    pub abuse: AbuseConfig,
    pub store_timeout_ms: u64,
}

fn plan(name: &str, price: u32, text: u32, image: u32) -> PlanSpec {
    PlanSpec {
        name: name.to_string(),
        price,
        daily: PerKind::new(text, image),
    }
}

fn pack(title: &str, price: u32, text: u32, image: u32) -> TopupPack {
    TopupPack {
        title: title.to_string(),
        price,
        grant: PerKind::new(text, image),
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        let plans = HashMap::from([
            (Plan::Basic, plan("Basic", 199, 50, 15)),
            (Plan::Pro, plan("Pro", 499, 200, 60)),
            (Plan::Ultra, plan("Ultra", 999, 500, 150)),
        ]);

        let packs = HashMap::from([
            ("basic".to_string(), pack("Basic top-up", 40, 50, 15)),
            ("pro".to_string(), pack("Pro top-up", 100, 200, 60)),
            ("ultra".to_string(), pack("Ultra top-up", 180, 500, 150)),
            (
                "week_combo".to_string(),
                pack("Weekly pack: +250 answers and +8 images", 499, 250, 8),
            ),
            (
                "week_text".to_string(),
                pack("Weekly pack: +350 answers", 399, 350, 0),
            ),
            (
                "week_img".to_string(),
                pack("Weekly pack: +12 images", 599, 0, 12),
            ),
            (
                "week_ultra".to_string(),
                pack("Weekly ULTRA pack: +500 answers and +15 images", 799, 500, 15),
            ),
        ]);

        Self {
            free_daily: PerKind::new(5, 3),
            plans,
            packs,
            subscription_days: 30,
            topup_requires_active_plan: false,
            trial_plan: Plan::Basic,
            trial_days: 7,
            first_purchase_bonus: Some(PerKind::new(150, 0)),
            promo: PromoConfig::default(),
            free_load: None,
            referral: ReferralConfig::default(),
            abuse: AbuseConfig::default(),
            store_timeout_ms: 5_000,
        }
    }
}

impl MeterConfig {
    /// loads `.env`, an optional JSON file named by METER_CONFIG, then single-value env overrides
    pub fn load() -> Result<Self, MeterError> {
        if let Err(e) = dotenvy::dotenv() {
            match e {
                dotenvy::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {}
                _ => log::warn!("failed to load .env file: {}", e),
            }
        }

        let mut config = match env::var("METER_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    MeterError::Config(format!("cannot read config file {}: {}", path, e))
                })?;
                info!("Loaded metering config from {}", path);
                Self::from_json_str(&raw)?
            }
            Err(_) => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, MeterError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| MeterError::Config(format!("malformed config json: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), MeterError> {
        env_override("FREE_TEXT_PER_DAY", &mut self.free_daily.text)?;
        env_override("FREE_IMG_PER_DAY", &mut self.free_daily.image)?;
        env_override("SUB_DAYS", &mut self.subscription_days)?;
        env_override("TOPUP_REQUIRES_PLAN", &mut self.topup_requires_active_plan)?;
        env_override("TRIAL_DAYS", &mut self.trial_days)?;
        env_override("PROMO_TTL_MINUTES", &mut self.promo.ttl_minutes)?;
        env_override("OFFER_COOLDOWN_HOURS", &mut self.promo.cooldown_hours)?;
        env_override("REF_PERCENT", &mut self.referral.percent)?;
        env_override("REF_REQUIRE_FIRST_PAYMENT", &mut self.referral.require_first_payment)?;
        env_override("MIN_PAYOUT", &mut self.referral.min_payout)?;
        env_override("PAYOUT_COOLDOWN_HOURS", &mut self.referral.payout_cooldown_hours)?;
        env_override("RATE_LIMIT_TEXT_PER_MIN", &mut self.abuse.text_per_minute)?;
        env_override("RATE_LIMIT_IMAGE_PER_MIN", &mut self.abuse.image_per_minute)?;
        env_override("DUPLICATE_WINDOW_SEC", &mut self.abuse.duplicate_window_secs)?;
        env_override("DUPLICATE_MAX", &mut self.abuse.duplicate_max)?;
        env_override("MAX_TEXT_LEN", &mut self.abuse.max_prompt_chars)?;
        env_override("STORE_TIMEOUT_MS", &mut self.store_timeout_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), MeterError> {
        if self.subscription_days == 0 {
            return Err(MeterError::Config("subscription_days must be positive".into()));
        }
        if self.referral.percent > 100 {
            return Err(MeterError::Config(format!(
                "referral percent {} exceeds 100",
                self.referral.percent
            )));
        }
        if self.referral.min_payout <= 0 {
            return Err(MeterError::Config("min_payout must be positive".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(MeterError::Config("store_timeout_ms must be positive".into()));
        }
        if self.trial_days > 0 && !self.trial_plan.is_paid() {
            return Err(MeterError::Config("trial plan must be a paid plan".into()));
        }
        for paid in Plan::PAID {
            if !self.plans.contains_key(&paid) {
                return Err(MeterError::Config(format!("missing plan definition for {}", paid)));
            }
        }
        self.validate_promo()?;
        if let Some(policy) = &self.free_load {
            let ascending = policy
                .tiers
                .windows(2)
                .all(|pair| pair[0].below_active_users < pair[1].below_active_users);
            if !ascending {
                return Err(MeterError::Config(
                    "free_load tiers must be ascending by active users".into(),
                ));
            }
            if policy.max_cost_percent == 0 {
                return Err(MeterError::Config("free_load max_cost_percent must be positive".into()));
            }
        }
        Ok(())
    }

    fn validate_promo(&self) -> Result<(), MeterError> {
        let promo = &self.promo;
        if promo.ttl_minutes == 0 {
            return Err(MeterError::Config("promo ttl_minutes must be positive".into()));
        }
        if promo.upgrade_usage_percent > 100 {
            return Err(MeterError::Config(format!(
                "promo upgrade_usage_percent {} exceeds 100",
                promo.upgrade_usage_percent
            )));
        }
        if promo.free_engaged_text > promo.free_heavy_text {
            return Err(MeterError::Config(
                "promo free_engaged_text must not exceed free_heavy_text".into(),
            ));
        }
        for (kind, spec) in &promo.offers {
            if !spec.plan.is_paid() {
                return Err(MeterError::Config(format!("promo {} targets a free plan", kind)));
            }
            let targets = promo.offers.values().filter(|other| other.plan == spec.plan).count();
            if targets > 1 {
                return Err(MeterError::Config(format!(
                    "more than one promo targets plan {}",
                    spec.plan
                )));
            }
        }
        Ok(())
    }

    /// daily quota of `kind` that `plan` grants before any bonus
    pub fn base_quota(&self, plan: Plan, kind: ResourceKind) -> u32 {
        match plan {
            Plan::Free => self.free_daily.get(kind),
            paid => self
                .plans
                .get(&paid)
                .map(|spec| spec.daily.get(kind))
                .unwrap_or_else(|| self.free_daily.get(kind)),
        }
    }

    pub fn promo_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.promo.ttl_minutes))
    }

    pub fn offer_cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.promo.cooldown_hours))
    }

    pub fn plan_spec(&self, plan: Plan) -> Option<&PlanSpec> {
        self.plans.get(&plan)
    }

    pub fn pack(&self, key: &str) -> Option<&TopupPack> {
        self.packs.get(key)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn env_override<T: FromStr>(name: &str, target: &mut T) -> Result<(), MeterError> {
    if let Ok(raw) = env::var(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| MeterError::Config(format!("{} has invalid value '{}'", name, raw)))?;
    }
    Ok(())
}
