use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use loopflow_core::error::LoopflowError;
use loopflow_core::types::{GraphId, RunId};
use loopflow_steps::code_review::CODE_FIELD;
use loopflow_steps::code_review_workflow;

use crate::connection::{self, StreamStart};
use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

fn detail(status: StatusCode, detail: &str) -> ApiError {
    (status, Json(json!({ "detail": detail })))
}

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct CreateGraphQuery {
    #[serde(default)]
    pub threshold: Option<i64>,
}

// POST /graph/create?threshold=7
pub async fn create_graph(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CreateGraphQuery>,
) -> Result<Json<Value>, ApiError> {
    let threshold = q.threshold.unwrap_or(state.workflow.default_threshold);
    match state.engine.register_graph(code_review_workflow(threshold)) {
        Ok(graph_id) => {
            info!(graph_id = %graph_id, threshold, "Code-review graph created");
            Ok(Json(json!({ "graph_id": graph_id })))
        }
        Err(e) => {
            warn!(error = %e, "Graph registration failed");
            Err(detail(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
        }
    }
}

#[derive(Deserialize)]
pub struct RunGraphBody {
    pub graph_id: String,
    pub code: String,
}

// POST /graph/run
pub async fn run_graph(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RunGraphBody>,
) -> Result<Json<Value>, ApiError> {
    let graph_id = GraphId::from_string(&body.graph_id);
    let mut fields = Map::new();
    fields.insert(CODE_FIELD.to_string(), Value::String(body.code));

    match state.engine.start_run(&graph_id, fields) {
        Ok(run_id) => Ok(Json(json!({ "run_id": run_id, "status": "started" }))),
        Err(LoopflowError::GraphNotFound(_)) => {
            Err(detail(StatusCode::NOT_FOUND, "graph_id not found"))
        }
        Err(e) => Err(detail(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())),
    }
}

// GET /graph/state/{run_id}
pub async fn graph_state(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snap = state
        .engine
        .get_run(&RunId::from_string(&run_id))
        .map_err(|_| detail(StatusCode::NOT_FOUND, "run_id not found"))?;

    Ok(Json(json!({
        "run_id": snap.run_id,
        "finished": snap.finished,
        "state": snap.state,
        "logs": snap.logs,
    })))
}

// GET /ws/{run_id}
//
// The subscription is taken before the handshake completes, so a client that
// has connected sees every line emitted afterwards.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let id = RunId::from_string(&run_id);
    let start = state.engine.subscribe(&id).and_then(|sub| {
        let snap = state.engine.get_run(&id)?;
        Ok(if snap.finished {
            StreamStart::AlreadyFinished
        } else {
            StreamStart::Live(sub)
        })
    });

    ws.on_upgrade(move |socket| handle_ws(socket, run_id, start))
}

async fn handle_ws(
    socket: WebSocket,
    run_id: String,
    start: loopflow_core::error::Result<StreamStart>,
) {
    info!(run_id = %run_id, "WebSocket observer connected");
    connection::stream_run(socket, run_id, start).await;
    debug!("WebSocket observer disconnected");
}
