//! Classified error types shared across the reliability core.
//!
//! Most call sites use `anyhow` for propagation; these types exist so the
//! fallback engine and orchestrator can downcast and decide retry-vs-propagate
//! instead of string-matching everything.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problem. Surfaced immediately, never retried.
#[derive(Debug, Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);

/// Waiting for the session store lock exceeded the configured timeout.
#[derive(Debug, Error)]
#[error(
    "timed out after {waited_ms}ms waiting for session store lock {lock_path} \
     (held by pid {holder_pid:?})"
)]
pub struct LockTimeoutError {
    pub lock_path: PathBuf,
    pub waited_ms: u64,
    /// Pid recorded in the lock file, when it was readable.
    pub holder_pid: Option<u32>,
}

/// The caller cancelled the operation. Distinguished from timeouts: explicit
/// cancellation never advances the fallback loop, a timeout may.
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Gateway transport failures. The RPC client never retries these itself;
/// the orchestrator recovers by falling back to local execution.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway call timed out after {timeout_ms}ms ({target})")]
    Timeout { timeout_ms: u64, target: String },

    #[error("gateway closed before reply (code {code:?}, reason {reason:?}) ({target})")]
    ClosedBeforeReply {
        code: Option<u16>,
        reason: Option<String>,
        target: String,
    },

    #[error("gateway handshake rejected: {message} ({target})")]
    Handshake { message: String, target: String },

    #[error("gateway call failed: {method}: {message} ({target})")]
    Call {
        method: String,
        message: String,
        target: String,
    },

    #[error("gateway transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

impl GatewayError {
    /// Human-readable resolved target, for log lines at the fallback site.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Timeout { target, .. }
            | Self::ClosedBeforeReply { target, .. }
            | Self::Handshake { target, .. }
            | Self::Call { target, .. } => Some(target),
            Self::Transport(_) => None,
        }
    }
}

/// Input validation failure. Non-failover: trying another model will not help.
#[derive(Debug, Error)]
#[error("invalid request: {0}")]
pub struct ValidationError(pub String);
