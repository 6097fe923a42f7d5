use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MeterError;

/// subscription tiers; quotas for each tier come from the catalog in `MeterConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Basic,
    Pro,
    Ultra,
}

impl Plan {
    pub const PAID: [Plan; 3] = [Plan::Basic, Plan::Pro, Plan::Ultra];

    pub fn key(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Pro => "pro",
            Plan::Ultra => "ultra",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Plan::Free),
            "basic" => Some(Plan::Basic),
            "pro" => Some(Plan::Pro),
            "ultra" => Some(Plan::Ultra),
            _ => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Plan::Free)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// metered resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Text,
    Image,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Text, ResourceKind::Image];

    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Text => "text",
            ResourceKind::Image => "image",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceKind {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ResourceKind::Text),
            "image" | "img" => Ok(ResourceKind::Image),
            other => Err(MeterError::InvalidResource(other.to_string())),
        }
    }
}

/// one counter per resource kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerKind {
    pub text: u32,
    pub image: u32,
}

impl PerKind {
    pub fn new(text: u32, image: u32) -> Self {
        Self { text, image }
    }

    pub fn get(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::Text => self.text,
            ResourceKind::Image => self.image,
        }
    }

    pub fn get_mut(&mut self, kind: ResourceKind) -> &mut u32 {
        match kind {
            ResourceKind::Text => &mut self.text,
            ResourceKind::Image => &mut self.image,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.text == 0 && self.image == 0
    }
}

/// personal offer shown to a user; buying its target plan before `expires_at` adds its bonus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoOffer {
    pub kind: String,
    pub expires_at: DateTime<Utc>,
}

impl PromoOffer {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// persisted per-user record; `usage` and `bonus` only mean something for `day_key`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: i64,
    pub plan: Plan,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub day_key: NaiveDate,
    pub usage: PerKind,
    pub bonus: PerKind,
    pub trial_used: bool,
    pub promo: Option<PromoOffer>,
    pub last_offer_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    pub fn new(user_id: i64, today: NaiveDate) -> Self {
        Self {
            user_id,
            plan: Plan::Free,
            plan_expires_at: None,
            day_key: today,
            usage: PerKind::default(),
            bonus: PerKind::default(),
            trial_used: false,
            promo: None,
            last_offer_at: None,
        }
    }

    /// resets the daily counters when the stored day is not `today`; returns true if it did
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.day_key == today {
            return false;
        }
        self.day_key = today;
        self.usage = PerKind::default();
        self.bonus = PerKind::default();
        true
    }

    /// expiry of the paid plan if it is still running at `now`
    pub fn active_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.plan.is_paid() {
            return None;
        }
        self.plan_expires_at.filter(|expires_at| *expires_at > now)
    }

    /// plan used for quota purposes; a lapsed paid plan counts as free without being rewritten
    pub fn effective_plan(&self, now: DateTime<Utc>) -> Plan {
        if self.active_expiry(now).is_some() {
            self.plan
        } else {
            Plan::Free
        }
    }
}

/// demand and spend figures reported by the bot for the current day; costs and revenue in stars
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSignals {
    pub active_users_today: u32,
    pub api_cost_today: i64,
    pub revenue_today: i64,
}

/// answer to a `try_consume` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub kind: ResourceKind,
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub used: u32,
}

/// read-only view of a user's entitlement for today
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub user_id: i64,
    pub plan: Plan,
    pub effective_plan: Plan,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub day_key: NaiveDate,
    pub used: PerKind,
    pub limit: PerKind,
}

impl Snapshot {
    pub fn remaining(&self, kind: ResourceKind) -> u32 {
        self.limit.get(kind).saturating_sub(self.used.get(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrialOutcome {
    Activated { plan: Plan, expires_at: DateTime<Utc> },
    AlreadyUsed,
    PlanActive { expires_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OfferOutcome {
    Offered {
        kind: String,
        plan: Plan,
        grant: PerKind,
        expires_at: DateTime<Utc>,
    },
    /// an earlier offer is still running
    Active(PromoOffer),
    Cooldown { retry_after: DateTime<Utc> },
    NotEligible,
}
