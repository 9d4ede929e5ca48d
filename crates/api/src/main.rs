//! Carelink orchestrator server binary.
//!
//! Usage:
//!   carelink-api --config config/default.yaml
//!   carelink-api --port 8000 --bind 0.0.0.0
//!
//! # Environment Variables
//!
//! - `GEMINI_API_KEY` / `ANTHROPIC_API_KEY` - provider credentials when
//!   not set in the configuration file
//! - `CARELINK_BIND_ADDR` - server bind address (default: 127.0.0.1)
//!
//! Sending SIGHUP reloads the prompt templates without a restart.

use std::net::SocketAddr;
use std::sync::Arc;

use carelink_api::{AppState, RateLimitConfig};
use carelink_bus::{BusClient, MemoryBus};
use carelink_engine::{ConversationEngine, IntentClassifier, OrchestratorConfig};
use carelink_llm::{
    AnthropicProvider, GeminiProvider, LlmProvider, PromptRegistry, ProviderRegistry,
};
use carelink_session::{MemoryStore, SessionStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn build_providers(config: &OrchestratorConfig) -> Vec<Arc<dyn LlmProvider>> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
    for entry in &config.providers {
        let Some(api_key) = entry.resolve_api_key() else {
            tracing::warn!(
                provider = %entry.provider,
                "no API key configured or in environment, skipping provider"
            );
            continue;
        };
        match entry.provider.as_str() {
            "gemini" => {
                let mut provider = GeminiProvider::new(entry.model.clone(), api_key);
                if let Some(ref url) = entry.api_url {
                    provider = provider.with_api_base(url.clone());
                }
                providers.push(Arc::new(provider));
            }
            "anthropic" => {
                let mut provider = AnthropicProvider::new(entry.model.clone(), api_key);
                if let Some(ref url) = entry.api_url {
                    provider = provider.with_api_url(url.clone());
                }
                providers.push(Arc::new(provider));
            }
            other => {
                tracing::warn!(provider = %other, "unknown provider type, skipping");
            }
        }
    }
    providers
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,carelink_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Minimal flag parsing: --config, --port, --bind.
    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<String> = None;
    let mut port_override: Option<u16> = None;
    let mut bind_override: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    bind_override = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Carelink orchestrator server");
                println!();
                println!("Usage: carelink-api [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>  Path to the YAML configuration file");
                println!("  -p, --port <PORT>    Port to listen on (default: 8000)");
                println!("  -b, --bind <ADDR>    Bind address (default: 127.0.0.1)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let config = match config_path {
        Some(path) => {
            tracing::info!(path = %path, "loading configuration");
            OrchestratorConfig::from_file(&path)?
        }
        None => {
            tracing::info!("using default configuration");
            OrchestratorConfig::default()
        }
    };

    let providers = build_providers(&config);
    if providers.is_empty() {
        tracing::warn!(
            "no LLM providers available; intent classification will fall back to patterns and defaults"
        );
    }
    let registry = Arc::new(
        ProviderRegistry::new(providers)
            .with_cool_off(std::time::Duration::from_secs(
                config.limits.provider_cool_off_secs,
            ))
            .with_requests_per_minute(config.limits.llm_requests_per_minute),
    );

    let prompts = Arc::new(PromptRegistry::load(&config.prompts_dir)?);

    let classifier = match &config.intent_rules {
        Some(path) => IntentClassifier::from_rules_file(path)?,
        None => IntentClassifier::with_default_rules(),
    };

    let store = Arc::new(MemoryStore::new(
        config.session.ttl(),
        config.session.max_history,
    ));
    let bus = Arc::new(MemoryBus::with_settings(
        config.bus.queue_depth,
        config.bus.dispatch_timeout(),
    ));

    let engine = Arc::new(
        ConversationEngine::new(
            store as Arc<dyn SessionStore>,
            registry,
            prompts.clone(),
            classifier,
            config.build_router(),
            bus as Arc<dyn BusClient>,
        )
        .with_max_message_chars(config.limits.max_message_chars),
    );
    engine.start().await?;

    // SIGHUP reloads prompt templates; a failed reload keeps the old set.
    #[cfg(unix)]
    {
        let prompts = prompts.clone();
        tokio::spawn(async move {
            let mut hangups =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot install SIGHUP handler");
                        return;
                    }
                };
            while hangups.recv().await.is_some() {
                match prompts.reload() {
                    Ok(count) => tracing::info!(count, "prompt templates reloaded"),
                    Err(e) => tracing::warn!(error = %e, "prompt reload failed"),
                }
            }
        });
    }

    let state = Arc::new(
        AppState::new(engine, config.service.name.clone()).with_rate_limit(RateLimitConfig {
            max_requests: config.limits.requests_per_minute,
            ..Default::default()
        }),
    );

    let host = bind_override
        .or_else(|| std::env::var("CARELINK_BIND_ADDR").ok())
        .unwrap_or_else(|| config.service.bind_addr.clone());
    let port = port_override.unwrap_or(config.service.port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    carelink_api::serve(state, addr).await
}
