//! Orchestrator binary — wires config, persistence, chain clients,
//! the event monitor, the session manager, and the HTTP server, then
//! runs until interrupted.

use fusion_orchestrator::api::{build_router, AppState};
use fusion_orchestrator::chain::evm::EvmChainClient;
use fusion_orchestrator::chain::near::NearChainClient;
use fusion_orchestrator::chain::{ChainClient, RpcTransport};
use fusion_orchestrator::config::Config;
use fusion_orchestrator::bus::EventBus;
use fusion_orchestrator::manager::SessionManager;
use fusion_orchestrator::monitor::EventMonitor;
use fusion_orchestrator::oracle;
use fusion_orchestrator::persist::StateDir;
use fusion_orchestrator::quote::PriceSnapshot;
use fusion_orchestrator::secret::SecretManager;
use fusion_orchestrator::store::SessionStore;
use fusion_orchestrator::types::ChainSide;

use anyhow::Context;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for session workers to quiesce.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    if config.api_keys.is_empty() {
        warn!("API_KEYS is empty; running without authentication");
    }

    let state_dir = StateDir::open(&config.state_dir).context("opening state directory")?;
    let store = Arc::new(SessionStore::new());
    let secrets = Arc::new(SecretManager::new());
    let bus = Arc::new(EventBus::new(config.max_subscribers_per_session));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = SessionManager::new(
        store.clone(),
        secrets.clone(),
        bus.clone(),
        state_dir.clone(),
        config.clone(),
        shutdown_rx.clone(),
    );
    manager
        .reconcile_from_disk()
        .context("reconciling sessions from disk")?;

    let src_client = Arc::new(
        EvmChainClient::new(
            RpcTransport::new(config.src_chain_rpc.clone()).context("source transport")?,
            config.src_confirmations,
            config.src_escrow_factory.clone(),
            config.src_event_topics.clone(),
            state_dir.cursor(ChainSide::Src),
        )
        .context("source client")?,
    );
    let dst_client = Arc::new(
        NearChainClient::new(
            RpcTransport::new(config.dst_chain_rpc.clone()).context("destination transport")?,
            config.dst_confirmations,
            config.dst_htlc_contract.clone(),
            state_dir.cursor(ChainSide::Dst),
        )
        .context("destination client")?,
    );

    let dedup_log = Arc::new(state_dir.dedup_log().context("dedup log")?);
    let seed_keys = dedup_log.load_and_compact().context("dedup compaction")?;

    let (event_tx, event_rx) = mpsc::channel(1024);
    let monitor = Arc::new(EventMonitor::new(
        vec![
            src_client.clone() as Arc<dyn ChainClient>,
            dst_client.clone() as Arc<dyn ChainClient>,
        ],
        store.clone(),
        bus.clone(),
        event_tx,
        dedup_log,
        Duration::from_millis(config.poll_interval_ms),
    ));
    monitor.seed_dedup(seed_keys);

    let _router_task = manager.spawn_router(event_rx);
    let _snapshot_task = manager.spawn_snapshot_ticker();
    let _sweeper_task = manager.spawn_retention_sweeper();
    let _monitor_tasks = monitor.spawn(shutdown_rx.clone());

    let prices = Arc::new(RwLock::new(PriceSnapshot::with_defaults()));
    let _oracle_task = if config.src_price_feeds.is_empty() {
        info!("no price feeds configured; quoting from the default snapshot");
        None
    } else {
        Some(oracle::spawn_refresher(
            src_client.clone() as Arc<dyn ChainClient>,
            config.src_price_feeds.clone(),
            prices.clone(),
            shutdown_rx,
        ))
    };

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        secrets,
        manager: manager.clone(),
        bus,
        src_client,
        dst_client,
        prices,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // Stop accepting, signal workers, wait for quiescence, persist.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while manager.worker_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    manager.persist_all();
    info!("state persisted; goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
