//! Per-invocation orchestration: resolve session → resolve model → run with
//! failover → persist.
//!
//! All session mutation goes through the store's locked transaction API.
//! Gateway delegation is best-effort: any gateway transport failure falls
//! back to local execution here, never inside the RPC client.

use crate::config::{Config, GatewayMode};
use crate::error::{GatewayError, ValidationError};
use crate::gateway::{self, CallOptions};
use crate::providers::{
    is_model_allowed, resolve_candidates, resolve_model_ref, run_with_fallback, CooldownProbe,
    CooldownTracker, FailoverReason, FallbackAttempt, FallbackObserver, FallbackOptions,
    ModelCandidate,
};
use crate::session::{SessionCriteria, SessionResolution, SessionResolver, SessionStore};
use crate::util::now_ms;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs one agent turn in-process. The real implementation owns prompt
/// construction and tool execution; tests substitute mocks.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn run(&self, request: ExecutionRequest) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub session_id: String,
    pub session_key: String,
    pub thinking_level: Option<String>,
    pub verbose_level: Option<String>,
}

/// One inbound request for the agent.
#[derive(Debug, Clone, Default)]
pub struct AgentInvocation {
    pub message: String,
    pub criteria: SessionCriteria,
}

#[derive(Debug)]
pub struct InvocationOutcome {
    pub reply: String,
    pub session: SessionResolution,
    pub provider: String,
    pub model: String,
    pub attempts: Vec<FallbackAttempt>,
    pub via_gateway: bool,
}

pub struct Orchestrator {
    config: Config,
    store: SessionStore,
    resolver: SessionResolver,
    cooldowns: Arc<CooldownTracker>,
    executor: Arc<dyn LocalExecutor>,
}

struct ExecReply {
    text: String,
    via_gateway: bool,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: SessionStore,
        cooldowns: Arc<CooldownTracker>,
        executor: Arc<dyn LocalExecutor>,
    ) -> Self {
        let resolver = SessionResolver::new(store.clone(), config.clone());
        Self {
            config,
            store,
            resolver,
            cooldowns,
            executor,
        }
    }

    pub async fn run_invocation(
        &self,
        invocation: AgentInvocation,
        cancel: Option<&CancellationToken>,
    ) -> Result<InvocationOutcome> {
        validate(&invocation)?;

        let resolution = self.resolver.resolve(&invocation.criteria).await;
        tracing::debug!(
            session_key = %resolution.session_key,
            session_id = %resolution.session_id,
            new = resolution.is_new_session,
            "session resolved"
        );

        let override_candidate = self.effective_override(&resolution).await?;
        let candidates = resolve_candidates(
            &self.config.models,
            override_candidate.as_ref().map(|c| c.provider.as_str()),
            override_candidate.as_ref().map(|c| c.model.as_str()),
        );

        let probe = TrackerProbe {
            tracker: &self.cooldowns,
            config: &self.config,
        };
        let observer = CooldownObserver {
            tracker: &self.cooldowns,
            config: &self.config,
        };

        let outcome = run_with_fallback(
            &candidates,
            |candidate| self.make_run(candidate, &invocation, &resolution),
            FallbackOptions {
                cancel,
                cooldown: Some(&probe),
                observer: Some(&observer),
            },
        )
        .await?;

        for profile in self.config.auth_profiles(&outcome.provider) {
            self.cooldowns.note_success(&outcome.provider, &profile);
        }

        self.persist_result(&invocation, &resolution).await?;

        Ok(InvocationOutcome {
            reply: outcome.result.text,
            provider: outcome.provider,
            model: outcome.model,
            attempts: outcome.attempts,
            via_gateway: outcome.result.via_gateway,
            session: resolution,
        })
    }

    /// Session-stored model override, validated against the allowlist. A
    /// disallowed override is silently reset to the defaults and the
    /// correction persisted so it never comes back.
    async fn effective_override(
        &self,
        resolution: &SessionResolution,
    ) -> Result<Option<ModelCandidate>> {
        let entry = match &resolution.entry {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let model_ref = match &entry.model_override {
            Some(model_ref) => model_ref.clone(),
            None => {
                // Provider-only override rides on the default model.
                return Ok(entry.provider_override.as_ref().map(|p| ModelCandidate {
                    provider: p.clone(),
                    model: self.config.models.default_model.clone(),
                }));
            }
        };

        let mut candidate = resolve_model_ref(&self.config.models, &model_ref);
        if let Some(provider) = &entry.provider_override {
            candidate.provider = provider.clone();
        }

        if is_model_allowed(&self.config.models, &candidate.provider, &candidate.model) {
            return Ok(Some(candidate));
        }

        tracing::info!(
            session_key = %resolution.session_key,
            model = %candidate,
            "session model override no longer allowed, resetting to default"
        );
        self.store
            .update_entry(&resolution.store_path, &resolution.session_key, |entry| {
                entry.model_override = None;
                entry.provider_override = None;
            })
            .await?;
        Ok(None)
    }

    /// Build the per-candidate run future: gateway delegation in remote mode
    /// with graceful local fallback, plain local execution otherwise.
    fn make_run(
        &self,
        candidate: &ModelCandidate,
        invocation: &AgentInvocation,
        resolution: &SessionResolution,
    ) -> impl std::future::Future<Output = Result<ExecReply>> + Send + 'static {
        let executor = Arc::clone(&self.executor);
        let gateway_config = self.config.gateway.clone();
        let remote = self.config.gateway.mode == GatewayMode::Remote;
        let agent_id = self.config.agent_id.clone();
        let request = ExecutionRequest {
            provider: candidate.provider.clone(),
            model: candidate.model.clone(),
            message: invocation.message.clone(),
            session_id: resolution.session_id.clone(),
            session_key: resolution.session_key.clone(),
            thinking_level: resolution.thinking_level.clone(),
            verbose_level: resolution.verbose_level.clone(),
        };

        async move {
            if remote {
                let params = json!({
                    "agentId": agent_id,
                    "sessionId": request.session_id,
                    "sessionKey": request.session_key,
                    "provider": request.provider,
                    "model": request.model,
                    "message": request.message,
                });
                match gateway::call(&gateway_config, CallOptions::new("agent.run", params)).await {
                    Ok(payload) => {
                        let text = payload
                            .get("text")
                            .and_then(|t| t.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| payload.to_string());
                        return Ok(ExecReply {
                            text,
                            via_gateway: true,
                        });
                    }
                    Err(err) if err.downcast_ref::<GatewayError>().is_some() => {
                        tracing::warn!(
                            error = %err,
                            "gateway delegation failed, falling back to local execution"
                        );
                    }
                    // ConfigError and application errors are not transport
                    // trouble; surface them.
                    Err(err) => return Err(err),
                }
            }

            let text = executor.run(request).await?;
            Ok(ExecReply {
                text,
                via_gateway: false,
            })
        }
    }

    /// Write the turn's results back under the store lock.
    async fn persist_result(
        &self,
        invocation: &AgentInvocation,
        resolution: &SessionResolution,
    ) -> Result<()> {
        let criteria = invocation.criteria.clone();
        let session_id = resolution.session_id.clone();
        self.store
            .transaction(&resolution.store_path, move |entries| {
                let entry = entries.entry(resolution.session_key.clone()).or_default();
                entry.session_id = session_id;
                entry.updated_at = criteria.now_ms.unwrap_or_else(now_ms);
                if resolution.is_new_session {
                    // The old entry expired; its per-session levels reset with
                    // it, otherwise the refreshed updatedAt would revive them
                    // on the next turn.
                    entry.thinking_level = None;
                    entry.verbose_level = None;
                }
                if criteria.channel.is_some() {
                    entry.channel = criteria.channel.clone();
                }
                if criteria.peer.is_some() {
                    entry.to = criteria.peer.clone();
                }
                if criteria.account_id.is_some() {
                    entry.account_id = criteria.account_id.clone();
                }
                if criteria.thread_id.is_some() {
                    entry.thread_id = criteria.thread_id.clone();
                }
            })
            .await
    }
}

fn validate(invocation: &AgentInvocation) -> Result<()> {
    if invocation.message.trim().is_empty() {
        return Err(ValidationError("message must not be empty".into()).into());
    }
    if invocation
        .criteria
        .agent_id
        .as_ref()
        .is_some_and(|id| id.trim().is_empty())
    {
        return Err(ValidationError("agent id must not be blank".into()).into());
    }
    Ok(())
}

/// Consults the cooldown tracker for the fallback engine's pre-check.
struct TrackerProbe<'a> {
    tracker: &'a CooldownTracker,
    config: &'a Config,
}

impl CooldownProbe for TrackerProbe<'_> {
    fn all_profiles_cooling(&self, provider: &str) -> bool {
        self.tracker
            .all_cooling(provider, &self.config.auth_profiles(provider), now_ms())
    }
}

/// Feeds rate-limit/auth failures into the cooldown tracker, sequentially per
/// attempt so the bookkeeping follows candidate order.
struct CooldownObserver<'a> {
    tracker: &'a CooldownTracker,
    config: &'a Config,
}

#[async_trait]
impl FallbackObserver for CooldownObserver<'_> {
    async fn on_attempt(&self, attempt: &FallbackAttempt) {
        if matches!(
            attempt.reason,
            Some(FailoverReason::RateLimit) | Some(FailoverReason::Auth)
        ) {
            for profile in self.config.auth_profiles(&attempt.provider) {
                self.tracker.note_failure(&attempt.provider, &profile, now_ms());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StoreCache;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MockExecutor {
        calls: AtomicUsize,
        requests: Mutex<Vec<ExecutionRequest>>,
        fail_models: Vec<&'static str>,
        error: &'static str,
    }

    impl MockExecutor {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                fail_models: Vec::new(),
                error: "",
            }
        }

        fn failing(models: Vec<&'static str>, error: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                fail_models: models,
                error,
            }
        }
    }

    #[async_trait]
    impl LocalExecutor for MockExecutor {
        async fn run(&self, request: ExecutionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let model = request.model.clone();
            self.requests.lock().unwrap().push(request);
            if self.fail_models.contains(&model.as_str()) {
                return Err(anyhow!("{}", self.error));
            }
            Ok(format!("reply from {model}"))
        }
    }

    struct Fixture {
        _dir: TempDir,
        orchestrator: Orchestrator,
        executor: Arc<MockExecutor>,
    }

    fn fixture(executor: MockExecutor, mutate: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::load_from(dir.path()).unwrap();
        mutate(&mut config);
        let store = SessionStore::new(Arc::new(StoreCache::new()), &config.session);
        let executor = Arc::new(executor);
        let orchestrator = Orchestrator::new(
            config.clone(),
            store,
            Arc::new(CooldownTracker::new(&config.auth)),
            executor.clone(),
        );
        Fixture {
            _dir: dir,
            orchestrator,
            executor,
        }
    }

    fn invocation(message: &str, peer: &str) -> AgentInvocation {
        AgentInvocation {
            message: message.into(),
            criteria: SessionCriteria {
                channel: Some("whatsapp".into()),
                peer: Some(peer.into()),
                ..SessionCriteria::default()
            },
        }
    }

    #[tokio::test]
    async fn empty_message_is_a_validation_error() {
        let fx = fixture(MockExecutor::ok(), |_| {});
        let err = fx
            .orchestrator
            .run_invocation(invocation("   ", "+1"), None)
            .await
            .expect_err("blank message");
        assert!(err.downcast_ref::<ValidationError>().is_some());
        assert_eq!(fx.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn end_to_end_new_then_reused_session() {
        let fx = fixture(MockExecutor::ok(), |_| {});

        let first = fx
            .orchestrator
            .run_invocation(invocation("hello", "+15551234567"), None)
            .await
            .unwrap();
        assert!(first.session.is_new_session);
        assert!(first.reply.starts_with("reply from"));

        let second = fx
            .orchestrator
            .run_invocation(invocation("again", "+15551234567"), None)
            .await
            .unwrap();
        assert!(!second.session.is_new_session);
        assert_eq!(second.session.session_id, first.session.session_id);
    }

    #[tokio::test]
    async fn failover_reaches_configured_fallback() {
        let fx = fixture(
            MockExecutor::failing(vec!["claude-sonnet-4-5"], "503 overloaded"),
            |config| {
                config.models.fallbacks = vec!["anthropic/claude-haiku-4".into()];
            },
        );

        let outcome = fx
            .orchestrator
            .run_invocation(invocation("hello", "+1"), None)
            .await
            .unwrap();
        assert_eq!(outcome.model, "claude-haiku-4");
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].model, "claude-sonnet-4-5");
    }

    #[tokio::test]
    async fn disallowed_session_override_is_reset_and_persisted() {
        let fx = fixture(MockExecutor::ok(), |config| {
            config.models.allowlist = Some(vec!["anthropic/claude-sonnet-4-5".into()]);
        });

        // Seed a session whose override is no longer allowed.
        let resolution = fx
            .orchestrator
            .resolver
            .resolve(&invocation("x", "+1").criteria)
            .await;
        fx.orchestrator
            .store
            .transaction(&resolution.store_path, |entries| {
                let mut entry = crate::session::SessionEntry::new("sid-1", now_ms());
                entry.model_override = Some("forbidden-model".into());
                entries.insert(resolution.session_key.clone(), entry);
            })
            .await
            .unwrap();

        let outcome = fx
            .orchestrator
            .run_invocation(invocation("hello", "+1"), None)
            .await
            .unwrap();
        // ran on the default, not the stale override
        assert_eq!(outcome.model, "claude-sonnet-4-5");

        let store = fx
            .orchestrator
            .store
            .load_with(
                &resolution.store_path,
                crate::session::LoadOptions { skip_cache: true },
            )
            .await;
        assert!(store[&resolution.session_key].model_override.is_none());
    }

    #[tokio::test]
    async fn expired_session_levels_do_not_return_on_the_next_turn() {
        let fx = fixture(MockExecutor::ok(), |_| {});

        // Entry two hours old against a one-hour window, with levels set.
        let resolution = fx
            .orchestrator
            .resolver
            .resolve(&invocation("x", "+1").criteria)
            .await;
        fx.orchestrator
            .store
            .transaction(&resolution.store_path, |entries| {
                let mut entry =
                    crate::session::SessionEntry::new("sid-old", now_ms() - 2 * 60 * 60_000);
                entry.thinking_level = Some("high".into());
                entry.verbose_level = Some("on".into());
                entries.insert(resolution.session_key.clone(), entry);
            })
            .await
            .unwrap();

        let first = fx
            .orchestrator
            .run_invocation(invocation("hello", "+1"), None)
            .await
            .unwrap();
        assert!(first.session.is_new_session);

        // The refreshed entry must not bring the pre-reset levels back.
        let second = fx
            .orchestrator
            .run_invocation(invocation("again", "+1"), None)
            .await
            .unwrap();
        assert!(!second.session.is_new_session);
        assert_eq!(second.session.session_id, first.session.session_id);

        let requests = fx.executor.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|r| r.thinking_level.is_none() && r.verbose_level.is_none()));
    }

    #[tokio::test]
    async fn remote_mode_falls_back_to_local_when_gateway_unreachable() {
        let fx = fixture(MockExecutor::ok(), |config| {
            config.gateway.mode = GatewayMode::Remote;
            config.gateway.url = Some("ws://127.0.0.1:1".into());
            config.gateway.timeout_ms = 300;
        });

        let outcome = fx
            .orchestrator
            .run_invocation(invocation("hello", "+1"), None)
            .await
            .unwrap();
        assert!(!outcome.via_gateway);
        assert!(outcome.reply.starts_with("reply from"));
        assert_eq!(fx.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persisted_entry_records_delivery_fields() {
        let fx = fixture(MockExecutor::ok(), |_| {});
        let outcome = fx
            .orchestrator
            .run_invocation(invocation("hello", "+15551234567"), None)
            .await
            .unwrap();

        let store = fx
            .orchestrator
            .store
            .load(&outcome.session.store_path)
            .await;
        let entry = &store[&outcome.session.session_key];
        assert_eq!(entry.session_id, outcome.session.session_id);
        assert_eq!(entry.channel.as_deref(), Some("whatsapp"));
        assert_eq!(entry.to.as_deref(), Some("+15551234567"));
        assert_eq!(entry.last_channel.as_deref(), Some("whatsapp"));
        assert!(entry.updated_at > 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_execution() {
        let fx = fixture(MockExecutor::ok(), |_| {});
        let token = CancellationToken::new();
        token.cancel();
        let err = fx
            .orchestrator
            .run_invocation(invocation("hello", "+1"), Some(&token))
            .await
            .expect_err("cancelled");
        assert!(err.downcast_ref::<crate::error::Cancelled>().is_some());
        assert_eq!(fx.executor.calls.load(Ordering::SeqCst), 0);
    }
}
