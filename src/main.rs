//! switchyard - Dispatch Demo Entry Point
//!
//! Routes one prompt through the agent catalog and streams the answer to
//! stdout. With `SWITCHYARD_API_KEY` set, chain links resolve against the
//! configured OpenAI-compatible backend; without it, a local scripted
//! provider answers so the full dispatch path stays runnable offline.

use std::io::Write;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::agent::catalog::{AgentCatalog, ChainEntryDef};
use switchyard::agent::AgentRegistry;
use switchyard::config::Config;
use switchyard::event::{Event, EventSink};
use switchyard::provider::{OpenAiCompatClient, ProviderClient, ScriptedProvider};
use switchyard::request::Request;
use switchyard::supervisor::TaskSupervisor;

/// Forwards token text to stdout as it streams in.
struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: Event) {
        match event {
            Event::Token { text } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            Event::ProviderSwitch { from, to, reason } => {
                eprintln!("[switching provider: {from} -> {to} ({reason})]");
            }
            Event::Error { kind, message, .. } => {
                eprintln!("[error: {kind}: {message}]");
            }
            Event::Done { .. } => {
                println!();
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchyard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let budget = config.budget()?;
    info!(
        model = %config.model,
        backend = %config.base_url,
        offline = config.api_key.is_none(),
        "Loaded configuration"
    );

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.is_empty() {
        "Summarize what a fallback chain does.".to_string()
    } else {
        prompt
    };

    // Load the agent catalog (seeds a default agent on first run), then
    // resolve each chain entry to a concrete provider client.
    let catalog = AgentCatalog::open(config.agents_path.clone()).await;
    let resolver = |entry: &ChainEntryDef| -> Option<Arc<dyn ProviderClient>> {
        match entry.provider.as_str() {
            "openai" => {
                let key = config.api_key.clone()?;
                Some(Arc::new(OpenAiCompatClient::new(
                    config.base_url.clone(),
                    key,
                    entry.model.clone(),
                )))
            }
            "local" => Some(Arc::new(
                ScriptedProvider::responder(
                    "A fallback chain tries providers in order until one succeeds.",
                ),
            )),
            other => {
                warn!(provider = %other, "Unknown provider kind in catalog");
                None
            }
        }
    };
    let snapshot = catalog.build_registry(&resolver).await?;
    let registry = Arc::new(AgentRegistry::new(snapshot));

    let supervisor = TaskSupervisor::new(registry);
    let request = Request::new(prompt).with_budget(budget);
    let result = supervisor.run(request, &StdoutSink).await;

    info!(
        status = ?result.status,
        providers = ?result.provider_chain_used,
        attempts = result.attempts,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "Dispatch result"
    );
    if !result.status.is_success() {
        anyhow::bail!("dispatch failed: {:?}", result.status);
    }
    Ok(())
}
