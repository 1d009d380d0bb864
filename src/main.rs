use std::sync::Arc;

use agent_autopilot::agent::{AgentFleet, BroadcastNotifier, EngineDeps, NoopMemory, NoopObserver};
use agent_autopilot::config::AutopilotConfig;
use agent_autopilot::llm::ProviderDispatcher;
use agent_autopilot::store::{LibSqlBackend, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing. With AUTOPILOT_LOG_DIR set, logs also go to a daily file.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _log_guard = match std::env::var("AUTOPILOT_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "autopilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    };

    let config = AutopilotConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export AUTOPILOT_AGENTS=agent-1,agent-2");
        eprintln!("  export OPENAI_API_KEYS=sk-...,sk-...");
        std::process::exit(1);
    });

    eprintln!("🤖 Agent Autopilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agents: {}", config.agents.join(", "));

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(&config.store.db_path, config.store.stale_running_threshold)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.store.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.store.db_path.display());

    // ── Providers ────────────────────────────────────────────────────────
    let dispatcher = Arc::new(ProviderDispatcher::from_config(&config)?);
    let keys = dispatcher.health_snapshot().await.len();
    let order: Vec<String> = config
        .dispatch
        .provider_priority
        .iter()
        .map(|p| p.to_string())
        .collect();
    eprintln!("   Providers: {} ({} keys)", order.join(" > "), keys);
    for kind in &config.dispatch.provider_priority {
        if !dispatcher.registry().has_provider(*kind).await {
            tracing::warn!(provider = %kind, "No API keys configured for provider, it will be skipped");
        }
    }
    if keys == 0 {
        eprintln!("   Warning: no API keys configured, every LLM call will fail");
    }

    match dispatcher.ping().await {
        Ok(_) => tracing::info!("Provider status ping succeeded"),
        Err(e) => tracing::warn!(error = %e, "Provider status ping failed"),
    }

    // ── Agents ───────────────────────────────────────────────────────────
    let notifier = BroadcastNotifier::new(256);
    let mut activity = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = activity.recv().await {
            tracing::info!(agent_id = %event.agent_id, "{}", event.message);
        }
    });

    let deps = EngineDeps {
        store,
        dispatcher,
        observer: Arc::new(NoopObserver),
        memory: Arc::new(NoopMemory),
        notifier: Arc::new(notifier),
    };
    let fleet = AgentFleet::spawn(&config.agents, &config.engine, deps);
    eprintln!(
        "   Polling every {}s. Ctrl-C to stop.\n",
        config.engine.poll_interval.as_secs()
    );

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down, waiting for in-flight runs...");
    fleet.stop().await;

    Ok(())
}
