use anyhow::Context;
use musd_vault_backend::{
    api, Config, LedgerClient, SimulatedLedger, TransactionOrchestrator, VaultMonitor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting MUSD Vault Backend Service");

    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    // Sandbox ledger standing in for the testnet contracts
    let ledger: Arc<dyn LedgerClient> = Arc::new(SimulatedLedger::new(config.sandbox.clone()));
    info!(
        "Sandbox ledger ready for account {} on vault {}",
        ledger.account(),
        ledger.vault_address()
    );

    // Initialize core services
    let orchestrator = Arc::new(TransactionOrchestrator::new(ledger, config.orchestrator.clone()));
    let monitor = Arc::new(VaultMonitor::new(orchestrator.reader(), config.monitor.clone()));

    // Start monitoring in background
    let monitor_handle = monitor.start_monitoring();

    info!("All services initialized successfully");

    // Start API server
    let app = api::create_router(api::AppState {
        orchestrator,
        monitor,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("API server error")?;

    monitor_handle.abort();
    Ok(())
}
