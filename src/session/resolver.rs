//! Session key derivation and freshness resolution.
//!
//! Resolution never mutates the store: expiry is a property computed per
//! request, and stale entries are simply ignored (their persisted levels are
//! discarded, a new session id is minted) rather than deleted.

use super::store::SessionStore;
use super::types::SessionEntry;
use crate::config::{Config, SessionScope};
use crate::util::{new_session_id, now_ms};
use std::path::PathBuf;

/// Kind of conversation a request belongs to, for reset-policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatType {
    #[default]
    Direct,
    Group,
    Thread,
}

/// Everything the resolver may consider for one inbound request.
#[derive(Debug, Clone, Default)]
pub struct SessionCriteria {
    /// Agent scope. Empty falls back to the configured agent id.
    pub agent_id: Option<String>,
    pub channel: Option<String>,
    pub account_id: Option<String>,
    /// Sender identity (phone number, user id, …).
    pub peer: Option<String>,
    pub thread_id: Option<String>,
    pub chat_type: ChatType,
    /// Explicit session key, highest precedence.
    pub session_key: Option<String>,
    /// Explicit requested session id. Suppresses the new-session decision.
    pub session_id: Option<String>,
    /// Clock override for tests; `None` means wall clock.
    pub now_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct KeyResolution {
    pub session_key: String,
    pub store_path: PathBuf,
    pub store: super::types::SessionStoreFile,
}

#[derive(Debug, Clone)]
pub struct SessionResolution {
    pub session_key: String,
    pub store_path: PathBuf,
    pub session_id: String,
    pub is_new_session: bool,
    /// The stored entry, when one existed (fresh or not).
    pub entry: Option<SessionEntry>,
    /// Persisted levels, present only when the entry was fresh.
    pub thinking_level: Option<String>,
    pub verbose_level: Option<String>,
    pub reset_window_ms: i64,
}

pub struct SessionResolver {
    store: SessionStore,
    config: Config,
}

impl SessionResolver {
    pub fn new(store: SessionStore, config: Config) -> Self {
        Self { store, config }
    }

    /// Resolve which session key applies, loading the relevant store.
    ///
    /// Precedence: explicit key > scope-derived key from sender identity >
    /// an existing entry whose stored id matches the supplied session id >
    /// the agent's main key.
    pub async fn resolve_key(&self, criteria: &SessionCriteria) -> KeyResolution {
        let agent_id = self.agent_id(criteria);
        let store_path = self.config.session_store_path(&agent_id);
        let store = self.store.load(&store_path).await;

        let session_key = if let Some(key) = &criteria.session_key {
            key.clone()
        } else if let Some(key) = self.derive_scoped_key(&agent_id, criteria) {
            key
        } else if let Some(key) = criteria.session_id.as_ref().and_then(|id| {
            store
                .iter()
                .find(|(_, entry)| &entry.session_id == id)
                .map(|(key, _)| key.clone())
        }) {
            key
        } else {
            main_key(&agent_id)
        };

        KeyResolution {
            session_key,
            store_path,
            store,
        }
    }

    /// Full resolution: key, freshness decision, and session id selection.
    pub async fn resolve(&self, criteria: &SessionCriteria) -> SessionResolution {
        let key = self.resolve_key(criteria).await;
        let now = criteria.now_ms.unwrap_or_else(now_ms);
        let entry = key.store.get(&key.session_key).cloned();

        let channel = criteria
            .channel
            .as_deref()
            .or_else(|| entry.as_ref().and_then(|e| e.channel.as_deref()));
        let reset_window_ms = self.reset_window_ms(channel, criteria.chat_type);

        let fresh = entry
            .as_ref()
            .is_some_and(|e| is_fresh(e.updated_at, now, reset_window_ms));

        let session_id = if let Some(id) = &criteria.session_id {
            id.clone()
        } else if fresh {
            entry
                .as_ref()
                .map(|e| e.session_id.clone())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(new_session_id)
        } else {
            new_session_id()
        };

        let is_new_session = !fresh && criteria.session_id.is_none();

        let (thinking_level, verbose_level) = if fresh {
            let e = entry.as_ref();
            (
                e.and_then(|e| e.thinking_level.clone()),
                e.and_then(|e| e.verbose_level.clone()),
            )
        } else {
            // Stale entry: persisted overrides are part of what resets.
            (None, None)
        };

        SessionResolution {
            session_key: key.session_key,
            store_path: key.store_path,
            session_id,
            is_new_session,
            entry,
            thinking_level,
            verbose_level,
            reset_window_ms,
        }
    }

    fn agent_id(&self, criteria: &SessionCriteria) -> String {
        criteria
            .agent_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.config.agent_id.clone())
    }

    /// Scope-derived key, when sender identity is available.
    fn derive_scoped_key(&self, agent_id: &str, criteria: &SessionCriteria) -> Option<String> {
        match self.config.session.scope {
            SessionScope::Shared => Some(main_key(agent_id)),
            SessionScope::PerSender => {
                let peer = criteria.peer.as_deref()?;
                let channel = criteria.channel.as_deref().unwrap_or("unknown");
                Some(format!("{agent_id}:{channel}:{peer}"))
            }
        }
    }

    /// Reset window policy chain: per-channel override > chat-type default >
    /// global default.
    fn reset_window_ms(&self, channel: Option<&str>, chat_type: ChatType) -> i64 {
        let reset = &self.config.session.reset;
        let minutes = channel
            .and_then(|c| reset.per_channel_minutes.get(c).copied())
            .or(match chat_type {
                ChatType::Group | ChatType::Thread => reset.group_minutes,
                ChatType::Direct => None,
            })
            .unwrap_or(reset.default_minutes);
        (minutes as i64).saturating_mul(60_000)
    }
}

fn main_key(agent_id: &str) -> String {
    format!("{agent_id}:main")
}

/// Boundary: an entry exactly `window` old is NOT fresh.
fn is_fresh(updated_at: i64, now: i64, window_ms: i64) -> bool {
    now.saturating_sub(updated_at) < window_ms
}
