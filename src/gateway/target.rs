//! Gateway target resolution.
//!
//! Precedence: explicit caller URL > configured remote URL > local dial.
//! Local dials prefer the private overlay (tailnet) host when bind mode asks
//! for it and one is configured, otherwise loopback. Errors carry the resolved
//! target plus how it was chosen, so a failed dial is debuggable from the log
//! line alone.

use crate::config::{GatewayBind, GatewayConfig, GatewayMode};
use crate::error::ConfigError;
use anyhow::Result;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSource {
    ExplicitUrl,
    RemoteConfig,
    LocalTailnet,
    LocalLoopback,
}

impl fmt::Display for TargetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ExplicitUrl => "explicit url",
            Self::RemoteConfig => "gateway.url from config (remote mode)",
            Self::LocalTailnet => "local tailnet host",
            Self::LocalLoopback => "local loopback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub url: String,
    pub source: TargetSource,
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.source)
    }
}

/// Resolve where a gateway call should dial.
pub fn resolve_target(config: &GatewayConfig, explicit_url: Option<&str>) -> Result<ResolvedTarget> {
    if let Some(url) = explicit_url {
        return Ok(ResolvedTarget {
            url: ensure_ws_scheme(url),
            source: TargetSource::ExplicitUrl,
        });
    }

    if config.mode == GatewayMode::Remote {
        let url = config.url.as_deref().ok_or_else(|| {
            ConfigError("gateway.mode = \"remote\" requires gateway.url".into())
        })?;
        return Ok(ResolvedTarget {
            url: ensure_ws_scheme(url),
            source: TargetSource::RemoteConfig,
        });
    }

    let scheme = if config.tls { "wss" } else { "ws" };
    let (host, source) = match (&config.bind, &config.tailnet_host) {
        (GatewayBind::Tailnet, Some(host)) if !host.trim().is_empty() => {
            (host.trim().to_string(), TargetSource::LocalTailnet)
        }
        _ => ("127.0.0.1".to_string(), TargetSource::LocalLoopback),
    };
    Ok(ResolvedTarget {
        url: format!("{scheme}://{host}:{}", config.port),
        source,
    })
}

fn ensure_ws_scheme(url: &str) -> String {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{url}")
    }
}
