#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::uninlined_format_args, clippy::module_name_repetitions)]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use steward::agent::{AgentInvocation, ExecutionRequest, LocalExecutor, Orchestrator};
use steward::config::Config;
use steward::gateway::{self, CallOptions};
use steward::providers::CooldownTracker;
use steward::session::{SessionCriteria, SessionStore, StoreCache};
use steward::util::format_ms;
use tracing_subscriber::EnvFilter;

/// Steward: personal assistant control plane.
#[derive(Parser, Debug)]
#[command(name = "steward", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one message through the orchestrator.
    Message {
        text: String,
        #[arg(long)]
        channel: Option<String>,
        /// Sender identity (phone number, user id, …).
        #[arg(long)]
        peer: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Inspect or clear persisted sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Call a gateway method directly, for debugging.
    Call {
        method: String,
        /// JSON params object.
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Show effective configuration and the resolved gateway target.
    Status,
}

#[derive(Subcommand, Debug)]
enum SessionCommands {
    List {
        #[arg(long)]
        agent: Option<String>,
    },
    Clear {
        /// Session key to remove. Clears everything when omitted.
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
}

/// Placeholder for the external agent runtime. The control plane only runs
/// turns locally once a runtime is wired in; until then local execution is a
/// configuration error rather than a silent no-op.
struct UnwiredExecutor;

#[async_trait::async_trait]
impl LocalExecutor for UnwiredExecutor {
    async fn run(&self, request: ExecutionRequest) -> Result<String> {
        bail!(
            "no local runtime is wired into this binary (wanted {}/{}); \
             set gateway.mode = \"remote\" to delegate runs",
            request.provider,
            request.model
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Message {
            text,
            channel,
            peer,
            session_id,
            agent,
        } => {
            let store = SessionStore::new(Arc::new(StoreCache::new()), &config.session);
            let orchestrator = Orchestrator::new(
                config.clone(),
                store,
                Arc::new(CooldownTracker::new(&config.auth)),
                Arc::new(UnwiredExecutor),
            );
            let outcome = orchestrator
                .run_invocation(
                    AgentInvocation {
                        message: text,
                        criteria: SessionCriteria {
                            agent_id: agent,
                            channel,
                            peer,
                            session_id,
                            ..SessionCriteria::default()
                        },
                    },
                    None,
                )
                .await?;
            println!("{}", outcome.reply);
            tracing::info!(
                session = %outcome.session.session_key,
                provider = %outcome.provider,
                model = %outcome.model,
                attempts = outcome.attempts.len(),
                via_gateway = outcome.via_gateway,
                "invocation complete"
            );
        }
        Commands::Sessions { command } => run_sessions(&config, command).await?,
        Commands::Call {
            method,
            params,
            url,
            timeout_ms,
        } => {
            let params: serde_json::Value = serde_json::from_str(&params)?;
            let payload = gateway::call(
                &config.gateway,
                CallOptions {
                    url,
                    timeout_ms,
                    ..CallOptions::new(method, params)
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Status => {
            println!("workspace:  {}", config.workspace_dir.display());
            println!("agent:      {}", config.agent_id);
            println!(
                "model:      {}/{}",
                config.models.default_provider, config.models.default_model
            );
            println!("fallbacks:  {}", config.models.fallbacks.join(", "));
            match gateway::resolve_target(&config.gateway, None) {
                Ok(target) => println!("gateway:    {target}"),
                Err(err) => println!("gateway:    unresolvable ({err})"),
            }
        }
    }

    Ok(())
}

async fn run_sessions(config: &Config, command: SessionCommands) -> Result<()> {
    let store = SessionStore::new(Arc::new(StoreCache::new()), &config.session);
    match command {
        SessionCommands::List { agent } => {
            let agent = agent.unwrap_or_else(|| config.agent_id.clone());
            let path = config.session_store_path(&agent);
            let entries = store.load(&path).await;
            if entries.is_empty() {
                println!("no sessions in {}", path.display());
                return Ok(());
            }
            for (key, entry) in &entries {
                println!(
                    "{key}  id={}  updated={}  channel={}",
                    entry.session_id,
                    format_ms(entry.updated_at),
                    entry.channel.as_deref().unwrap_or("-"),
                );
            }
        }
        SessionCommands::Clear { key, agent } => {
            let agent = agent.unwrap_or_else(|| config.agent_id.clone());
            let path = config.session_store_path(&agent);
            let removed = store
                .transaction(&path, |entries| match key {
                    Some(key) => usize::from(entries.remove(&key).is_some()),
                    None => {
                        let n = entries.len();
                        entries.clear();
                        n
                    }
                })
                .await?;
            println!("removed {removed} session(s)");
        }
    }
    Ok(())
}
