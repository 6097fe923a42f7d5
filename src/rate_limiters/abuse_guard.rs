use chrono::Duration;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::MeterConfig;
use crate::entitlement::ResourceKind;
use crate::error::MeterResult;
use crate::storage::{bounded, Storage};

/// per-user abuse checks; window state lives in storage so it survives restarts and scales out
pub struct AbuseGuard<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: Arc<MeterConfig>,
}

impl<S: Storage> AbuseGuard<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: Arc<MeterConfig>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// per-minute request limit for (user, kind); a refused hit is not counted
    pub async fn check_rate_limit(&self, user_id: i64, kind: ResourceKind) -> MeterResult<bool> {
        let limit = self.config.abuse.per_minute(kind);
        let action = format!("rate:{}", kind);

        let allowed = bounded(
            self.config.store_timeout(),
            self.store.hit_window(
                user_id,
                &action,
                self.clock.now(),
                Duration::seconds(60),
                limit,
            ),
        )
        .await?;

        if !allowed {
            warn!(
                "Rate limiting user {} for {}: {} per minute reached",
                user_id, kind, limit
            );
        }
        Ok(allowed)
    }

    /// true when the same prompt was already sent `duplicate_max` times inside the window
    pub async fn is_duplicate_burst(&self, user_id: i64, prompt: &str) -> MeterResult<bool> {
        let fingerprint = Self::fingerprint(prompt);
        let window = Duration::seconds(self.config.abuse.duplicate_window_secs as i64);

        let seen = bounded(
            self.config.store_timeout(),
            self.store
                .record_fingerprint(user_id, &fingerprint, self.clock.now(), window),
        )
        .await?;

        let burst = seen >= self.config.abuse.duplicate_max;
        if burst {
            info!(
                "Duplicate prompt burst from user {} ({} repeats in {}s)",
                user_id, seen, self.config.abuse.duplicate_window_secs
            );
        }
        Ok(burst)
    }

    /// cuts the prompt to the configured number of characters
    pub fn clamp_prompt<'a>(&self, prompt: &'a str) -> &'a str {
        let max = self.config.abuse.max_prompt_chars;
        match prompt.char_indices().nth(max) {
            Some((cut, _)) => &prompt[..cut],
            None => prompt,
        }
    }

    fn fingerprint(prompt: &str) -> String {
        format!("{:x}", Sha256::digest(prompt.trim().as_bytes()))
    }
}
