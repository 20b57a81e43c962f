//! End-to-end integration tests for the reliability core.
//!
//! These run the full invocation path (session resolution, model failover,
//! locked persistence) through the public API with a mock runtime,
//! complementing the unit tests inside each module.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use steward::agent::{AgentInvocation, ExecutionRequest, LocalExecutor, Orchestrator};
use steward::config::Config;
use steward::providers::CooldownTracker;
use steward::session::{ChatType, SessionCriteria, SessionStore, StoreCache};
use tempfile::TempDir;

// ─────────────────────────────────────────────────────────────────
// Mock infrastructure
// ─────────────────────────────────────────────────────────────────

/// Mock runtime that fails scripted models and records every request.
struct ScriptedExecutor {
    calls: AtomicUsize,
    seen_models: Mutex<Vec<String>>,
    fail_models: Vec<String>,
    error: String,
}

impl ScriptedExecutor {
    fn new(fail_models: &[&str], error: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen_models: Mutex::new(Vec::new()),
            fail_models: fail_models.iter().map(|s| s.to_string()).collect(),
            error: error.to_string(),
        }
    }
}

#[async_trait]
impl LocalExecutor for ScriptedExecutor {
    async fn run(&self, request: ExecutionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models.lock().unwrap().push(request.model.clone());
        if self.fail_models.contains(&request.model) {
            return Err(anyhow!("{}", self.error));
        }
        Ok(format!("done via {}", request.model))
    }
}

struct Harness {
    _dir: TempDir,
    orchestrator: Orchestrator,
    executor: Arc<ScriptedExecutor>,
    store: SessionStore,
    config: Config,
}

fn harness(executor: ScriptedExecutor, mutate: impl FnOnce(&mut Config)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = Config::load_from(dir.path()).unwrap();
    mutate(&mut config);
    let store = SessionStore::new(Arc::new(StoreCache::new()), &config.session);
    let executor = Arc::new(executor);
    let orchestrator = Orchestrator::new(
        config.clone(),
        store.clone(),
        Arc::new(CooldownTracker::new(&config.auth)),
        executor.clone(),
    );
    Harness {
        _dir: dir,
        orchestrator,
        executor,
        store,
        config,
    }
}

fn whatsapp_message(text: &str, peer: &str) -> AgentInvocation {
    AgentInvocation {
        message: text.into(),
        criteria: SessionCriteria {
            channel: Some("whatsapp".into()),
            peer: Some(peer.into()),
            chat_type: ChatType::Direct,
            ..SessionCriteria::default()
        },
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_sender_gets_new_session_then_reuses_it() {
    let h = harness(ScriptedExecutor::new(&[], ""), |_| {});

    let first = h
        .orchestrator
        .run_invocation(whatsapp_message("hi", "+15551234567"), None)
        .await
        .unwrap();
    assert!(first.session.is_new_session);

    let second = h
        .orchestrator
        .run_invocation(whatsapp_message("more", "+15551234567"), None)
        .await
        .unwrap();
    assert!(!second.session.is_new_session);
    assert_eq!(second.session.session_id, first.session.session_id);

    // a different sender lands in a different session
    let other = h
        .orchestrator
        .run_invocation(whatsapp_message("hello", "+15559999999"), None)
        .await
        .unwrap();
    assert_ne!(other.session.session_key, first.session.session_key);
    assert_ne!(other.session.session_id, first.session.session_id);
}

#[tokio::test]
async fn failover_chain_lands_on_working_model_and_reports_attempts() {
    let h = harness(
        ScriptedExecutor::new(
            &["claude-sonnet-4-5", "claude-haiku-4"],
            "503 Service Unavailable",
        ),
        |config| {
            config.models.fallbacks =
                vec!["anthropic/claude-haiku-4".into(), "openrouter/meta/llama-3".into()];
        },
    );

    let outcome = h
        .orchestrator
        .run_invocation(whatsapp_message("hi", "+1"), None)
        .await
        .unwrap();

    assert_eq!(outcome.provider, "openrouter");
    assert_eq!(outcome.model, "meta/llama-3");
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(
        *h.executor.seen_models.lock().unwrap(),
        vec!["claude-sonnet-4-5", "claude-haiku-4", "meta/llama-3"]
    );
}

#[tokio::test]
async fn rate_limited_provider_is_skipped_on_the_next_invocation() {
    let h = harness(
        ScriptedExecutor::new(&["claude-sonnet-4-5"], "429 Too Many Requests"),
        |config| {
            config.models.fallbacks = vec!["openrouter/meta/llama-3".into()];
        },
    );

    // First run: primary fails with a rate limit, cooldown recorded.
    let first = h
        .orchestrator
        .run_invocation(whatsapp_message("hi", "+1"), None)
        .await
        .unwrap();
    assert_eq!(first.provider, "openrouter");
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 2);

    // Second run: anthropic is cooling, so its run is never invoked.
    let second = h
        .orchestrator
        .run_invocation(whatsapp_message("again", "+1"), None)
        .await
        .unwrap();
    assert_eq!(second.provider, "openrouter");
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(second.attempts.len(), 1);
    assert_eq!(second.attempts[0].provider, "anthropic");
    assert_eq!(second.attempts[0].error, "all auth profiles in cooldown");
}

#[tokio::test]
async fn aggregate_error_lists_every_candidate() {
    let h = harness(
        ScriptedExecutor::new(
            &["claude-sonnet-4-5", "meta/llama-3"],
            "502 Bad Gateway",
        ),
        |config| {
            config.models.fallbacks = vec!["openrouter/meta/llama-3".into()];
        },
    );

    let err = h
        .orchestrator
        .run_invocation(whatsapp_message("hi", "+1"), None)
        .await
        .expect_err("everything fails");
    let msg = format!("{err:#}");
    assert!(msg.contains("all model candidates failed"));
    assert!(msg.contains("anthropic/claude-sonnet-4-5"));
    assert!(msg.contains("openrouter/meta/llama-3"));
}

#[tokio::test]
async fn session_survives_process_style_restart() {
    // Two orchestrators over the same workspace simulate two processes.
    let dir = TempDir::new().unwrap();
    let config = Config::load_from(dir.path()).unwrap();

    let build = || {
        let store = SessionStore::new(Arc::new(StoreCache::new()), &config.session);
        Orchestrator::new(
            config.clone(),
            store,
            Arc::new(CooldownTracker::new(&config.auth)),
            Arc::new(ScriptedExecutor::new(&[], "")),
        )
    };

    let first = build()
        .run_invocation(whatsapp_message("hi", "+1"), None)
        .await
        .unwrap();
    let second = build()
        .run_invocation(whatsapp_message("back", "+1"), None)
        .await
        .unwrap();
    assert_eq!(second.session.session_id, first.session.session_id);
    assert!(!second.session.is_new_session);
}

#[tokio::test]
async fn store_written_by_orchestrator_is_readable_as_plain_json() {
    let h = harness(ScriptedExecutor::new(&[], ""), |_| {});
    let outcome = h
        .orchestrator
        .run_invocation(whatsapp_message("hi", "+15551234567"), None)
        .await
        .unwrap();

    let path = h.config.session_store_path(&h.config.agent_id);
    let raw = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let entry = &value[outcome.session.session_key.as_str()];
    assert_eq!(entry["sessionId"], json!(outcome.session.session_id));
    assert_eq!(entry["channel"], json!("whatsapp"));
    assert_eq!(entry["lastChannel"], json!("whatsapp"));

    // and a hand-edited variant still loads
    std::fs::write(
        &path,
        format!("// edited\n{raw}"),
    )
    .unwrap();
    let reloaded = h
        .store
        .load_with(
            &path,
            steward::session::LoadOptions { skip_cache: true },
        )
        .await;
    assert!(reloaded.contains_key(&outcome.session.session_key));
}
