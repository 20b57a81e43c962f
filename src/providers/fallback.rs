//! Model/provider fallback engine.
//!
//! Candidates are tried strictly in order, one at a time. A candidate whose
//! auth profiles are all cooling is skipped without a network round-trip. A
//! failure only advances the loop when classification says failover could
//! help; validation errors and explicit cancellation surface immediately.

use super::classify::{classify, FailoverReason};
use super::ModelCandidate;
use crate::config::ModelsConfig;
use crate::error::Cancelled;
use crate::util::truncate_with_ellipsis;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use tokio_util::sync::CancellationToken;

const ATTEMPT_ERROR_MAX_CHARS: usize = 300;

/// One failed (or skipped) candidate, for telemetry and the aggregate error.
#[derive(Debug, Clone)]
pub struct FallbackAttempt {
    pub provider: String,
    pub model: String,
    pub error: String,
    pub reason: Option<FailoverReason>,
    pub status: Option<u16>,
    pub code: Option<String>,
}

impl FallbackAttempt {
    fn summary(&self) -> String {
        let reason = self
            .reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unclassified".into());
        format!("{}/{}: {} ({reason})", self.provider, self.model, self.error)
    }
}

/// Notified after each recorded attempt, sequentially and in candidate order.
#[async_trait]
pub trait FallbackObserver: Send + Sync {
    async fn on_attempt(&self, attempt: &FallbackAttempt);
}

/// Answers "is every usable auth profile for this provider cooling down?".
pub trait CooldownProbe: Send + Sync {
    fn all_profiles_cooling(&self, provider: &str) -> bool;
}

#[derive(Default)]
pub struct FallbackOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub cooldown: Option<&'a dyn CooldownProbe>,
    pub observer: Option<&'a dyn FallbackObserver>,
}

#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub result: T,
    pub provider: String,
    pub model: String,
    pub attempts: Vec<FallbackAttempt>,
}

/// Try each candidate until one succeeds.
pub async fn run_with_fallback<T, R, Fut>(
    candidates: &[ModelCandidate],
    mut run: R,
    opts: FallbackOptions<'_>,
) -> Result<FallbackOutcome<T>>
where
    R: FnMut(&ModelCandidate) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if candidates.is_empty() {
        return Err(anyhow!("no model candidates to try"));
    }

    let mut attempts: Vec<FallbackAttempt> = Vec::new();
    let mut run_errors: Vec<anyhow::Error> = Vec::new();

    for candidate in candidates {
        if let Some(token) = opts.cancel {
            if token.is_cancelled() {
                return Err(Cancelled.into());
            }
        }

        if let Some(probe) = opts.cooldown {
            if probe.all_profiles_cooling(&candidate.provider) {
                tracing::info!(
                    provider = %candidate.provider,
                    model = %candidate.model,
                    "skipping candidate, all auth profiles cooling down"
                );
                let attempt = FallbackAttempt {
                    provider: candidate.provider.clone(),
                    model: candidate.model.clone(),
                    error: "all auth profiles in cooldown".into(),
                    reason: Some(FailoverReason::Cooldown),
                    status: None,
                    code: None,
                };
                notify(opts.observer, &attempt).await;
                attempts.push(attempt);
                continue;
            }
        }

        match run(candidate).await {
            Ok(result) => {
                if !attempts.is_empty() {
                    tracing::info!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        failed_attempts = attempts.len(),
                        "candidate recovered after failover"
                    );
                }
                return Ok(FallbackOutcome {
                    result,
                    provider: candidate.provider.clone(),
                    model: candidate.model.clone(),
                    attempts,
                });
            }
            Err(err) => {
                if err.downcast_ref::<Cancelled>().is_some() {
                    return Err(err);
                }
                let Some(classified) = classify(&err) else {
                    // Not failover-eligible: surface as-is, no further candidates.
                    return Err(err);
                };
                tracing::warn!(
                    provider = %candidate.provider,
                    model = %candidate.model,
                    reason = %classified.reason,
                    error = %err,
                    "candidate failed, advancing to next"
                );
                let attempt = FallbackAttempt {
                    provider: candidate.provider.clone(),
                    model: candidate.model.clone(),
                    error: truncate_with_ellipsis(&err.to_string(), ATTEMPT_ERROR_MAX_CHARS),
                    reason: Some(classified.reason),
                    status: classified.status,
                    code: classified.code,
                };
                notify(opts.observer, &attempt).await;
                attempts.push(attempt);
                run_errors.push(err);
            }
        }
    }

    exhausted(attempts, run_errors)
}

/// Image-generation variant: same ordered loop, but there is no structured
/// classification for that path, so every failure is fallback-eligible and
/// no cooldown pre-check applies.
pub async fn run_image_with_fallback<T, R, Fut>(
    candidates: &[ModelCandidate],
    mut run: R,
    opts: FallbackOptions<'_>,
) -> Result<FallbackOutcome<T>>
where
    R: FnMut(&ModelCandidate) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if candidates.is_empty() {
        return Err(anyhow!("no image model candidates to try"));
    }

    let mut attempts: Vec<FallbackAttempt> = Vec::new();
    let mut run_errors: Vec<anyhow::Error> = Vec::new();

    for candidate in candidates {
        if let Some(token) = opts.cancel {
            if token.is_cancelled() {
                return Err(Cancelled.into());
            }
        }

        match run(candidate).await {
            Ok(result) => {
                return Ok(FallbackOutcome {
                    result,
                    provider: candidate.provider.clone(),
                    model: candidate.model.clone(),
                    attempts,
                });
            }
            Err(err) => {
                let attempt = FallbackAttempt {
                    provider: candidate.provider.clone(),
                    model: candidate.model.clone(),
                    error: truncate_with_ellipsis(&err.to_string(), ATTEMPT_ERROR_MAX_CHARS),
                    reason: classify(&err).map(|c| c.reason),
                    status: None,
                    code: None,
                };
                notify(opts.observer, &attempt).await;
                attempts.push(attempt);
                run_errors.push(err);
            }
        }
    }

    exhausted(attempts, run_errors)
}

async fn notify(observer: Option<&dyn FallbackObserver>, attempt: &FallbackAttempt) {
    if let Some(observer) = observer {
        observer.on_attempt(attempt).await;
    }
}

/// Every candidate failed. A lone real failure is rethrown unwrapped so
/// single-candidate configurations keep their original error; otherwise one
/// aggregate summarizes every attempt, chaining the last underlying error.
fn exhausted<T>(
    attempts: Vec<FallbackAttempt>,
    mut run_errors: Vec<anyhow::Error>,
) -> Result<FallbackOutcome<T>> {
    if attempts.len() == 1 && run_errors.len() == 1 {
        return Err(run_errors.remove(0));
    }
    let summary = attempts
        .iter()
        .map(FallbackAttempt::summary)
        .collect::<Vec<_>>()
        .join("; ");
    match run_errors.pop() {
        Some(last) => Err(last).context(format!("all model candidates failed: {summary}")),
        None => Err(anyhow!("all model candidates failed: {summary}")),
    }
}

// ── Candidate resolution ──────────────────────────────────────────

/// Build the ordered candidate list: primary (override or configured
/// default) first, then configured fallbacks resolved through the alias
/// table, deduplicated. The allowlist filters fallbacks only; the primary
/// is always attempted.
pub fn resolve_candidates(
    models: &ModelsConfig,
    provider_override: Option<&str>,
    model_override: Option<&str>,
) -> Vec<ModelCandidate> {
    let primary = ModelCandidate {
        provider: provider_override
            .unwrap_or(&models.default_provider)
            .to_string(),
        model: model_override.unwrap_or(&models.default_model).to_string(),
    };

    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(primary.normalized_key());
    let mut candidates = vec![primary];

    for entry in &models.fallbacks {
        let candidate = resolve_model_ref(models, entry);
        if !is_model_allowed(models, &candidate.provider, &candidate.model) {
            tracing::debug!(
                provider = %candidate.provider,
                model = %candidate.model,
                "fallback candidate not in allowlist, dropped"
            );
            continue;
        }
        if seen.insert(candidate.normalized_key()) {
            candidates.push(candidate);
        }
    }

    candidates
}

/// Resolve a model reference: alias lookup first, then `provider/model`
/// qualified form, then a bare model on the default provider.
pub fn resolve_model_ref(models: &ModelsConfig, reference: &str) -> ModelCandidate {
    let resolved = models
        .aliases
        .get(reference)
        .map(String::as_str)
        .unwrap_or(reference);
    match resolved.split_once('/') {
        Some((provider, model)) => ModelCandidate {
            provider: provider.to_string(),
            model: model.to_string(),
        },
        None => ModelCandidate {
            provider: models.default_provider.clone(),
            model: resolved.to_string(),
        },
    }
}

/// Allowlist check used for fallback candidates and session-persisted
/// overrides. Entries match either `provider/model` or a bare model name.
pub fn is_model_allowed(models: &ModelsConfig, provider: &str, model: &str) -> bool {
    let Some(allowlist) = &models.allowlist else {
        return true;
    };
    let qualified = format!("{provider}/{model}").to_lowercase();
    allowlist.iter().any(|entry| {
        let entry = entry.to_lowercase();
        entry == qualified || entry == model.to_lowercase()
    })
}
