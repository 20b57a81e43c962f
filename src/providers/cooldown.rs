//! Auth-profile cooldown bookkeeping.
//!
//! After a rate-limit or auth failure a profile is assumed unusable for a
//! window that doubles per consecutive strike, capped at `cooldown_max_ms`.
//! The fallback engine consults this before dialing a provider so known-dead
//! candidates cost nothing.

use crate::config::AuthConfig;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct CooldownState {
    until_ms: i64,
    strikes: u32,
}

pub struct CooldownTracker {
    base_ms: u64,
    max_ms: u64,
    states: Mutex<HashMap<String, CooldownState>>,
}

fn profile_key(provider: &str, profile: &str) -> String {
    format!("{provider}/{profile}")
}

impl CooldownTracker {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            base_ms: config.cooldown_base_ms.max(1),
            max_ms: config.cooldown_max_ms.max(config.cooldown_base_ms),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a rate-limit/auth failure for a profile. Returns the cooldown
    /// window applied, for logging.
    pub fn note_failure(&self, provider: &str, profile: &str, now_ms: i64) -> u64 {
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = states
            .entry(profile_key(provider, profile))
            .or_insert(CooldownState {
                until_ms: 0,
                strikes: 0,
            });
        let window = self
            .base_ms
            .saturating_mul(1u64 << state.strikes.min(16))
            .min(self.max_ms);
        state.strikes = state.strikes.saturating_add(1);
        state.until_ms = now_ms.saturating_add(window as i64);
        tracing::debug!(provider, profile, window_ms = window, "auth profile cooling down");
        window
    }

    /// A successful call clears the profile's strikes.
    pub fn note_success(&self, provider: &str, profile: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(&profile_key(provider, profile));
        }
    }

    pub fn is_cooling(&self, provider: &str, profile: &str, now_ms: i64) -> bool {
        let states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        states
            .get(&profile_key(provider, profile))
            .is_some_and(|s| s.until_ms > now_ms)
    }

    /// True when every usable profile for a provider is mid-cooldown.
    /// An empty profile list counts as usable (nothing to be cooling).
    pub fn all_cooling(&self, provider: &str, profiles: &[String], now_ms: i64) -> bool {
        !profiles.is_empty()
            && profiles
                .iter()
                .all(|p| self.is_cooling(provider, p, now_ms))
    }
}
