use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use loopflow_core::config::{GatewayConfig, WorkflowConfig};
use loopflow_engine::WorkflowEngine;

use crate::routes;
use crate::state::AppState;

/// Build the HTTP and WebSocket routes over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Workflow API
        .route("/graph/create", post(routes::create_graph))
        .route("/graph/run", post(routes::run_graph))
        .route("/graph/state/{run_id}", get(routes::graph_state))
        // Live log stream
        .route("/ws/{run_id}", get(routes::ws_handler))
        .route("/api/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP + WebSocket gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    workflow: WorkflowConfig,
    engine: Arc<WorkflowEngine>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, workflow: WorkflowConfig, engine: Arc<WorkflowEngine>) -> Self {
        Self {
            config,
            workflow,
            engine,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            engine: self.engine.clone(),
            workflow: self.workflow.clone(),
        });

        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
