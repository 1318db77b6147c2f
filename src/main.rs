//! Vigil Runtime
//!
//! Entry point: configuration, bootstrap, and teardown in reverse
//! startup order. The process exits non-zero on any startup failure and
//! zero on a clean shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vigil::agent::{CognitiveLoop, CognitiveLoopOptions};
use vigil::config;
use vigil::energy::EnergyRegulator;
use vigil::events::{spawn_energy_ticker, EventPublisher};
use vigil::gateway::{HttpChatProvider, ModelGateway};
use vigil::ingress::{self, AppState, RateLimitState};
use vigil::state::{ConversationStore, StoreHandle};
use vigil::subagent::{InMemoryToolSource, SubAgent};
use vigil::types::VigilConfig;

/// Vigil -- an agent that pays for every thought
#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    version,
    about = "Energy-regulated autonomous agent",
    long_about = "A single long-running agent that paces its own inference against a replenishing energy budget."
)]
struct Cli {
    /// HTTP port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Database file path (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Energy units regained per second (overrides REPLENISH_RATE)
    #[arg(long)]
    replenish_rate: Option<f64>,

    /// Stop after this many seconds (overrides DURATION)
    #[arg(long)]
    duration: Option<u64>,

    /// Provider tag: openai, openrouter, ollama (overrides AI_PROVIDER)
    #[arg(long)]
    provider: Option<String>,

    /// Force one model id for every tier (overrides AI_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Verbose logging (overrides DEBUG)
    #[arg(long)]
    debug: bool,
}

/// Env config with CLI flags layered on top.
fn effective_config(cli: &Cli) -> Result<VigilConfig> {
    let mut config = config::load_from_env().context("configuration failed")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = &cli.db_path {
        config.db_path = path.clone();
    }
    if let Some(rate) = cli.replenish_rate {
        if rate <= 0.0 {
            anyhow::bail!("--replenish-rate must be positive: {rate}");
        }
        config.replenish_rate = rate;
    }
    if let Some(secs) = cli.duration {
        config.duration_secs = Some(secs);
    }
    if let Some(provider) = &cli.provider {
        config.provider = provider.clone();
    }
    if let Some(model) = &cli.model {
        config.model_override = Some(model.clone());
    }
    if cli.debug {
        config.debug = true;
    }
    Ok(config)
}

/// Resolve when the process should stop: signal or the optional duration.
async fn wait_for_shutdown(duration_secs: Option<u64>) {
    let timer = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = timer => info!("run duration elapsed"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = signal::ctrl_c() => info!("received interrupt"),
            _ = timer => info!("run duration elapsed"),
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = effective_config(&cli)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if config.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("vigil v{} starting", env!("CARGO_PKG_VERSION"));

    // Startup order: store, regulator, events, gateway, sub-agent,
    // ingress, loop. Teardown is the reverse.
    let db_path = config::resolve_path(&config.db_path);
    let store = StoreHandle::new(
        ConversationStore::open(&db_path).context("failed to open conversation store")?,
    );
    info!("conversation store at {db_path}");

    let regulator = Arc::new(EnergyRegulator::new(config.replenish_rate));
    let events = EventPublisher::new();
    let ticker = spawn_energy_ticker(events.clone(), Arc::clone(&regulator));

    let provider = Arc::new(HttpChatProvider::new(
        config.provider_base_url.clone(),
        config.provider_api_key.clone(),
    ));
    let gateway = Arc::new(ModelGateway::new(
        provider,
        Arc::clone(&regulator),
        events.clone(),
        config.provider.clone(),
        config.model_override.clone(),
    ));

    let mut subagent = SubAgent::new(Arc::new(InMemoryToolSource::new()));
    subagent.start();

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (ingress_stop_tx, ingress_stop_rx) = oneshot::channel::<()>();

    let app_state = AppState {
        store: store.clone(),
        regulator: Arc::clone(&regulator),
        events: events.clone(),
        signals: signal_tx,
        max_message_length: config.max_message_length,
        started_at: std::time::Instant::now(),
        rate: Arc::new(RateLimitState::new(config.rate_limit_per_minute)),
    };
    let ingress_handle = tokio::spawn(ingress::serve(app_state, config.port, async move {
        let _ = ingress_stop_rx.await;
    }));

    let running = Arc::new(AtomicBool::new(true));
    let cognitive = CognitiveLoop::new(CognitiveLoopOptions {
        store,
        regulator: Arc::clone(&regulator),
        gateway,
        events,
        signals: signal_rx,
        subagent: Some(subagent.handle()),
        running: Arc::clone(&running),
    });
    let mut loop_handle = tokio::spawn(cognitive.run());

    wait_for_shutdown(config.duration_secs).await;

    info!("shutting down");
    let _ = ingress_stop_tx.send(());
    match tokio::time::timeout(Duration::from_secs(5), ingress_handle).await {
        Ok(Ok(Err(e))) => warn!("ingress exited with error: {e:#}"),
        Err(_) => warn!("ingress did not stop in time"),
        _ => {}
    }

    subagent.stop();

    running.store(false, Ordering::SeqCst);
    if tokio::time::timeout(Duration::from_secs(10), &mut loop_handle)
        .await
        .is_err()
    {
        warn!("cognitive loop still sleeping; aborting it");
        loop_handle.abort();
    }

    ticker.abort();
    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}
