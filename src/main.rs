use std::sync::Arc;

use kyc_flow::config::{FlowConfig, ServerConfig};
use kyc_flow::events::EventBus;
use kyc_flow::routes::flow_routes;
use kyc_flow::store::{Database, LibSqlBackend, MemoryBackend};
use kyc_flow::workflow::{ExpiryMonitor, WorkflowEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server = ServerConfig::from_env()?;
    let config = FlowConfig::from_env()?;

    eprintln!("🪪 KYC Flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Steps: {}",
        config
            .sequence
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    );
    eprintln!("   Flow: http://0.0.0.0:{}/flow/{}", server.port, config.sequence.first());
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws", server.port);
    eprintln!("   API: http://0.0.0.0:{}/api/flow/status", server.port);

    // ── Database ─────────────────────────────────────────────────────────
    let durable: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    server.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    // Session ids live only as long as the process.
    let session: Arc<dyn Database> = Arc::new(MemoryBackend::new());

    eprintln!("   Database: {}\n", server.db_path.display());

    // ── Workflow ─────────────────────────────────────────────────────────
    let engine = WorkflowEngine::open(config, durable, session, EventBus::new()).await;
    if engine.store().has_state().await {
        let outcome = engine.redirect_to_correct_step().await;
        tracing::debug!(?outcome, "Checked stored position");
    }
    let expiry = ExpiryMonitor::new(Arc::clone(&engine));

    let app = flow_routes(engine, expiry);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port)).await?;
    tracing::info!(port = server.port, "KYC flow server started");
    axum::serve(listener, app).await?;

    Ok(())
}
