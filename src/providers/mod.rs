//! Provider selection and failover.
//!
//! Nothing here talks to a model API directly. The engine coordinates
//! caller-supplied `run` operations over an ordered candidate list.

pub mod classify;
pub mod cooldown;
pub mod fallback;

pub use classify::{classify, Classified, FailoverReason};
pub use cooldown::CooldownTracker;
pub use fallback::{
    is_model_allowed, resolve_candidates, resolve_model_ref, run_image_with_fallback,
    run_with_fallback, CooldownProbe, FallbackAttempt, FallbackObserver, FallbackOptions,
    FallbackOutcome,
};

/// One (provider, model) pair considered during fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub provider: String,
    pub model: String,
}

impl ModelCandidate {
    /// Key used for deduplication across alias spellings.
    pub fn normalized_key(&self) -> String {
        format!(
            "{}/{}",
            self.provider.trim().to_lowercase(),
            self.model.trim().to_lowercase()
        )
    }
}

impl std::fmt::Display for ModelCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}
