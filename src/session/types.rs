//! Session store data model: entries, legacy-field upgrades, and delivery
//! normalization.
//!
//! Entries are persisted camelCase to stay readable alongside older store
//! files. Unknown fields are preserved verbatim through a flattened map so a
//! newer writer never destroys what an older one wrote.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// On-disk store shape: session key → entry.
pub type SessionStoreFile = BTreeMap<String, SessionEntry>;

/// One persisted session: routing metadata plus per-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    #[serde(default)]
    pub session_id: String,
    /// Epoch milliseconds of the last write touching this entry.
    #[serde(default)]
    pub updated_at: i64,

    // Delivery routing. Canonical fields first, legacy mirrors kept in sync
    // by `normalize_delivery` so older readers keep working.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_thread_id: Option<String>,

    // Per-session configuration. Honored only while the entry is fresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile_override_source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills_snapshot: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,

    /// Fields this version does not model. Round-tripped untouched.
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl SessionEntry {
    pub fn new(session_id: impl Into<String>, updated_at: i64) -> Self {
        Self {
            session_id: session_id.into(),
            updated_at,
            ..Self::default()
        }
    }
}

/// Upgrade one raw entry object in place, renaming legacy fields to their
/// current names. Never leaves a value under both names. Returns whether
/// anything changed so callers can log upgrades.
///
/// Current upgrades:
/// - `provider` → `channel`
/// - `room` → `groupChannel`
pub fn upgrade_entry(raw: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    changed |= rename_field(raw, "provider", "channel");
    changed |= rename_field(raw, "room", "groupChannel");
    changed
}

fn rename_field(raw: &mut Map<String, Value>, legacy: &str, current: &str) -> bool {
    if !raw.contains_key(legacy) {
        return false;
    }
    let value = raw.remove(legacy).unwrap_or(Value::Null);
    // A populated current name wins; the legacy value is dropped either way.
    if !raw.contains_key(current) && !value.is_null() {
        raw.insert(current.to_string(), value);
    }
    true
}

/// Keep canonical delivery fields and their legacy mirrors in sync. Canonical
/// wins when both are present; a mirror backfills a missing canonical field.
pub fn normalize_delivery(entry: &mut SessionEntry) {
    sync_pair(&mut entry.channel, &mut entry.last_channel);
    sync_pair(&mut entry.to, &mut entry.last_to);
    sync_pair(&mut entry.account_id, &mut entry.last_account_id);
    sync_pair(&mut entry.thread_id, &mut entry.last_thread_id);
}

fn sync_pair(canonical: &mut Option<String>, mirror: &mut Option<String>) {
    match (canonical.as_ref(), mirror.as_ref()) {
        (Some(c), _) => *mirror = Some(c.clone()),
        (None, Some(m)) => *canonical = Some(m.clone()),
        (None, None) => {}
    }
}
