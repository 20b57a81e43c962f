//! Configuration schema and loading.
//!
//! Config lives at `~/.steward/config.toml`. Every section is
//! `#[serde(default)]` so a missing or partial file always yields a usable
//! config. Validation beyond what serde enforces happens at the point of use
//! (e.g. remote gateway mode without a URL fails when the gateway is dialed).

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Default agent scope for session keys.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_agent_id() -> String {
    "main".into()
}

// ── Sessions ──────────────────────────────────────────────────────

/// How session keys are derived for inbound messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    /// One session per sender identity (channel + peer).
    #[default]
    PerSender,
    /// Every sender shares the agent's main session.
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub scope: SessionScope,

    /// Store path template. `{agent}` is substituted with the agent id.
    /// Defaults to `<workspace>/sessions/{agent}.json`.
    #[serde(default)]
    pub store_path: Option<String>,

    #[serde(default)]
    pub reset: ResetConfig,

    /// Read-cache TTL for the store file. The cache also invalidates on any
    /// mtime change, so this only bounds staleness between stat calls.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scope: SessionScope::default(),
            store_path: None,
            reset: ResetConfig::default(),
            cache_ttl_ms: default_cache_ttl_ms(),
            lock: LockConfig::default(),
        }
    }
}

fn default_cache_ttl_ms() -> u64 {
    500
}

/// Session reset (freshness) policy. An entry older than its reset window is
/// treated as expired and a new session id is minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Global default window, in minutes.
    #[serde(default = "default_reset_minutes")]
    pub default_minutes: u64,

    /// Window for group/thread chats, when set.
    #[serde(default)]
    pub group_minutes: Option<u64>,

    /// Per-channel overrides, highest precedence. Keyed by channel name.
    #[serde(default)]
    pub per_channel_minutes: HashMap<String, u64>,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_reset_minutes(),
            group_minutes: None,
            per_channel_minutes: HashMap::new(),
        }
    }
}

fn default_reset_minutes() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    /// A lock file older than this is assumed abandoned by a crashed holder
    /// and is reclaimed.
    #[serde(default = "default_lock_stale_ms")]
    pub stale_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            stale_ms: default_lock_stale_ms(),
            poll_ms: default_lock_poll_ms(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}
fn default_lock_stale_ms() -> u64 {
    30_000
}
fn default_lock_poll_ms() -> u64 {
    25
}

// ── Models ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    /// Ordered fallback list. Entries are alias names or `provider/model`
    /// qualified references.
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Alias table: bare name → `provider/model`.
    #[serde(default)]
    pub aliases: HashMap<String, String>,

    /// When set, fallback candidates (never the primary) must appear here.
    /// Also constrains session-persisted model overrides.
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            fallbacks: Vec::new(),
            aliases: HashMap::new(),
            allowlist: None,
        }
    }
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-5".into()
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayMode {
    /// Execute agent runs in-process.
    #[default]
    Local,
    /// Delegate runs to a remote gateway, falling back to local on failure.
    Remote,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayBind {
    /// Dial the gateway on loopback.
    #[default]
    Loopback,
    /// Prefer the private overlay-network host when one is configured.
    Tailnet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub mode: GatewayMode,

    /// Remote gateway URL. Required in remote mode.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub bind: GatewayBind,

    /// Overlay-network hostname used when `bind = "tailnet"`.
    #[serde(default)]
    pub tailnet_host: Option<String>,

    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Transport encryption; selects ws:// vs wss://.
    #[serde(default)]
    pub tls: bool,

    /// Whole-operation budget for one gateway call: connect + handshake +
    /// request.
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::default(),
            url: None,
            token: None,
            bind: GatewayBind::default(),
            tailnet_host: None,
            port: default_gateway_port(),
            tls: false,
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

fn default_gateway_port() -> u16 {
    9630
}
fn default_gateway_timeout_ms() -> u64 {
    15_000
}

// ── Auth profiles ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Usable auth profile names per provider. A provider with no entry is
    /// treated as having one implicit default profile.
    #[serde(default)]
    pub profiles: HashMap<String, Vec<String>>,

    #[serde(default = "default_cooldown_base_ms")]
    pub cooldown_base_ms: u64,

    #[serde(default = "default_cooldown_max_ms")]
    pub cooldown_max_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            profiles: HashMap::new(),
            cooldown_base_ms: default_cooldown_base_ms(),
            cooldown_max_ms: default_cooldown_max_ms(),
        }
    }
}

fn default_cooldown_base_ms() -> u64 {
    60_000
}
fn default_cooldown_max_ms() -> u64 {
    3_600_000
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load config from `~/.steward/config.toml`, or defaults when absent.
    pub fn load() -> Result<Self> {
        let home = UserDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .context("could not determine home directory")?;
        let workspace = home.join(".steward");
        Self::load_from(&workspace)
    }

    /// Load config rooted at an explicit workspace directory.
    pub fn load_from(workspace_dir: &Path) -> Result<Self> {
        let config_path = workspace_dir.join("config.toml");

        let mut config: Config = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.workspace_dir = workspace_dir.to_path_buf();
        config.config_path = config_path;
        if config.agent_id.trim().is_empty() {
            config.agent_id = default_agent_id();
        }
        Ok(config)
    }

    /// Resolved session store path for an agent, applying the `{agent}`
    /// template when one is configured.
    pub fn session_store_path(&self, agent_id: &str) -> PathBuf {
        match &self.session.store_path {
            Some(template) => PathBuf::from(template.replace("{agent}", agent_id)),
            None => self
                .workspace_dir
                .join("sessions")
                .join(format!("{agent_id}.json")),
        }
    }

    /// Usable auth profiles for a provider (implicit `default` when none are
    /// configured).
    pub fn auth_profiles(&self, provider: &str) -> Vec<String> {
        match self.auth.profiles.get(provider) {
            Some(profiles) if !profiles.is_empty() => profiles.clone(),
            _ => vec!["default".into()],
        }
    }
}
