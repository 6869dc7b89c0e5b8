use std::sync::Arc;

use fusion_relayer::config::CoordinatorConfig;
use fusion_relayer::coordinator::Coordinator;
use fusion_relayer::interfaces::InMemoryOrderRepository;
use fusion_relayer::routes::build_router;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CoordinatorConfig::from_env();
    let coordinator = Coordinator::new(config, InMemoryOrderRepository::new());
    coordinator.wire_hooks().await;

    let mut shutdown = coordinator.shutdown_signal();
    let app = build_router(Arc::clone(&coordinator));

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000")
        .await
        .expect("failed to bind coordinator listener");
    tracing::info!("coordinator listening on 0.0.0.0:3000");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .expect("coordinator server failed");
}
