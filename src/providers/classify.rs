//! Failure classification for the fallback engine.
//!
//! A classified error is failover-eligible: trying another provider/model is
//! expected to help. Anything unclassifiable (validation, malformed request,
//! programmer error) must surface immediately instead of being retried into
//! silence.

use crate::error::GatewayError;
use std::fmt;

/// Why a candidate failed, when failover is expected to help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    Auth,
    RateLimit,
    ContextOverflow,
    Timeout,
    Network,
    Server,
    /// Synthetic: candidate skipped because every auth profile was cooling.
    Cooldown,
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::ContextOverflow => "context_overflow",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Server => "server",
            Self::Cooldown => "cooldown",
        };
        f.write_str(s)
    }
}

/// Classification result carried into a recorded attempt.
#[derive(Debug, Clone)]
pub struct Classified {
    pub reason: FailoverReason,
    pub status: Option<u16>,
    pub code: Option<String>,
}

/// Classify an error as failover-eligible, or `None` when it must be
/// rethrown as-is.
pub fn classify(err: &anyhow::Error) -> Option<Classified> {
    if let Some(gateway) = err.downcast_ref::<GatewayError>() {
        let reason = match gateway {
            GatewayError::Timeout { .. } => FailoverReason::Timeout,
            _ => FailoverReason::Network,
        };
        return Some(Classified {
            reason,
            status: None,
            code: None,
        });
    }

    if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>() {
        if reqwest_err.is_timeout() {
            return Some(Classified {
                reason: FailoverReason::Timeout,
                status: None,
                code: None,
            });
        }
        if reqwest_err.is_connect() || reqwest_err.is_request() {
            return Some(Classified {
                reason: FailoverReason::Network,
                status: None,
                code: None,
            });
        }
        if let Some(status) = reqwest_err.status() {
            return classify_status(status.as_u16(), None);
        }
    }

    let msg = err.to_string();
    let lower = msg.to_lowercase();
    let code = known_provider_code(&lower);

    if let Some(status) = find_status_code(&msg) {
        if let Some(classified) = classify_status(status, code.clone()) {
            return Some(classified);
        }
        // A recognized non-retryable 4xx status wins over keyword scanning.
        if (400..500).contains(&status) {
            return None;
        }
    }

    let reason = if lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("too many requests")
        || lower.contains("quota exceeded")
    {
        FailoverReason::RateLimit
    } else if lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
        || lower.contains("credential")
        || lower.contains("token expired")
    {
        FailoverReason::Auth
    } else if lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("prompt is too long")
        || lower.contains("token limit")
    {
        FailoverReason::ContextOverflow
    } else if lower.contains("timed out") || lower.contains("timeout") {
        FailoverReason::Timeout
    } else if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("dns error")
        || lower.contains("network")
        || lower.contains("overloaded")
    {
        FailoverReason::Network
    } else {
        return None;
    };

    Some(Classified {
        reason,
        status: None,
        code,
    })
}

fn classify_status(status: u16, code: Option<String>) -> Option<Classified> {
    let reason = match status {
        401 | 403 => FailoverReason::Auth,
        429 => FailoverReason::RateLimit,
        408 => FailoverReason::Timeout,
        413 => FailoverReason::ContextOverflow,
        500..=599 => FailoverReason::Server,
        _ => return None,
    };
    Some(Classified {
        reason,
        status: Some(status),
        code,
    })
}

/// Scan a message for an embedded HTTP status code, the way provider SDKs
/// tend to flatten responses into strings.
fn find_status_code(msg: &str) -> Option<u16> {
    for word in msg.split(|c: char| !c.is_ascii_digit()) {
        if word.len() == 3 {
            if let Ok(code) = word.parse::<u16>() {
                if (400..600).contains(&code) {
                    return Some(code);
                }
            }
        }
    }
    None
}

fn known_provider_code(lower: &str) -> Option<String> {
    for code in [
        "rate_limit_error",
        "overloaded_error",
        "authentication_error",
        "permission_error",
        "insufficient_quota",
    ] {
        if lower.contains(code) {
            return Some(code.to_string());
        }
    }
    None
}
