// =============================================================================
// Borealis Paper Engine — Main Entry Point
// =============================================================================
//
// Exit codes: 0 normal, 1 config validation failure, 2 history store
// unreachable at startup, 130 on interrupt.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use borealis_engine::api;
use borealis_engine::config::EngineConfig;
use borealis_engine::engine::Engine;
use borealis_engine::events::EventBus;
use borealis_engine::history::open_store;
use borealis_engine::market::adapter::default_adapters;
use borealis_engine::market::kucoin::KucoinClient;
use borealis_engine::market::rest::PublicRestClient;
use borealis_engine::market::MarketStream;
use borealis_engine::scheduler::Scheduler;
use borealis_engine::strategy::StrategyStore;
use borealis_engine::types::EngineMode;

/// Closed bars retained per symbol.
const MAX_BUFFER_BARS: usize = 500;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Paper Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(1);
        }
    };

    // ── 2. History store ─────────────────────────────────────────────────
    let history = match open_store(config.database_url.as_deref(), &config.data_dir).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "history store unavailable at startup");
            std::process::exit(2);
        }
    };

    // ── 3. LIVE-mode credential check ────────────────────────────────────
    if config.mode == EngineMode::Live {
        let credentials = config
            .credentials
            .clone()
            .expect("LIVE config always carries credentials");
        let client = KucoinClient::new(credentials);
        match client.validate_credentials().await {
            Ok(()) => info!("venue credentials validated"),
            Err(e) => warn!(error = %e, "venue unreachable, continuing on cached data"),
        }
    }

    // ── 4. Shared subsystems ─────────────────────────────────────────────
    let events = EventBus::new();
    let stream = Arc::new(MarketStream::new(
        &config.timeframe,
        MAX_BUFFER_BARS,
        events.clone(),
        PublicRestClient::new(),
    ));
    let adapters = default_adapters();
    let strategy = StrategyStore::open(
        std::path::Path::new(&config.data_dir).join("strategy_state.json"),
    );

    let backend_port = config.backend_port;
    let engine = Arc::new(Engine::new(
        config,
        strategy,
        history,
        stream,
        events,
        adapters,
    ));

    // ── 5. Scheduler: streams, symbol actors, refinement cadence ────────
    let scheduler = Scheduler::new(engine.clone());
    scheduler.start().await;

    // ── 6. HTTP façade ───────────────────────────────────────────────────
    let api_engine = engine.clone();
    let bind_addr = format!("0.0.0.0:{backend_port}");
    tokio::spawn(async move {
        let app = api::rest::router(api_engine);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    warn!("interrupt received, shutting down");
    scheduler.shutdown().await;
    info!("Borealis Paper Engine shut down complete.");
    std::process::exit(130);
}
