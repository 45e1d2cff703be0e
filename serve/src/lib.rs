//! HTTP gateway for trellis (axum).
//!
//! Routes: `/health`, `/api/v1/chat` (bearer auth; SSE or JSON),
//! `/process` (extraction passthrough), `/api/v1/file-recall/*`, and static
//! volume serving. No request timeout is layered on: image generation and
//! deep research legitimately run for minutes.
//!
//! On SIGINT the listener stops, the store flushes synchronously, and every
//! managed sandbox container is removed before the process exits 0.

pub mod app;
pub mod auth;
pub mod chat;
pub mod process;
pub mod recall_api;
pub mod static_files;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use trellis::{ChatPipeline, ContainerManager, GatewayConfig, Store};

use app::AppState;

/// Builds the shared pipeline from process configuration.
///
/// A missing container runtime is downgraded to a warning: the gateway runs
/// with sandbox tools unregistered.
pub fn build_pipeline(config: GatewayConfig) -> Result<Arc<ChatPipeline>, trellis::GatewayError> {
    let store = Store::open(&config.db_path)?;
    let sandbox = match ContainerManager::connect(
        &config.data_root,
        &config.sandbox_image,
        &config.sandbox_network,
    ) {
        Ok(manager) => Some(manager),
        Err(e) => {
            warn!(error = %e, "container runtime unavailable; sandbox tools disabled");
            None
        }
    };
    Ok(Arc::new(ChatPipeline::new(config, store, sandbox)))
}

/// Serves until SIGINT, then flushes and reaps.
pub async fn run(pipeline: Arc<ChatPipeline>) -> Result<(), trellis::GatewayError> {
    let addr = format!(
        "{}:{}",
        pipeline.config.bind_host, pipeline.config.bind_port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "trellis gateway listening");

    let state = AppState::new(pipeline.clone());
    let router = app::router(state);

    // Daily retention purge, when configured.
    if pipeline.config.retention_days > 0 {
        let purge_pipeline = pipeline.clone();
        tokio::spawn(async move {
            loop {
                match purge_pipeline
                    .store
                    .purge_older_than(purge_pipeline.config.retention_days)
                    .await
                {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "purged expired request records")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "retention purge failed"),
                }
                tokio::time::sleep(std::time::Duration::from_secs(86_400)).await;
            }
        });
    }

    let shutdown_pipeline = pipeline.clone();
    let serve_result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "signal handler failed");
        }
        info!("shutdown signal received");
    })
    .await;

    // Persist state and reap sandboxes before exiting.
    if let Err(e) = shutdown_pipeline.store.flush_now().await {
        error!(error = %e, "final store flush failed");
    }
    if let Some(sandbox) = &shutdown_pipeline.sandbox {
        sandbox.shutdown_all().await;
    }
    info!("shutdown complete");

    serve_result.map_err(trellis::GatewayError::Io)
}
