//! WebSocket event stream + REST endpoints for the KYC flow.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::{Error, FlowError};
use crate::workflow::{
    EntryQuery, ExpiryMonitor, FlowMode, FlowStatus, StepId, TokenValidity, WorkflowEngine,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub expiry: Arc<ExpiryMonitor>,
}

/// Build the Axum router with the flow WebSocket and REST routes.
pub fn flow_routes(engine: Arc<WorkflowEngine>, expiry: Arc<ExpiryMonitor>) -> Router {
    let state = AppState { engine, expiry };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/flow/{step}", get(enter_step))
        .route("/api/flow/status", get(flow_status))
        .route("/api/flow/steps/{step}/access", get(step_access))
        .route("/api/flow/steps/{step}/start", post(start_step))
        .route("/api/flow/steps/{step}/complete", post(complete_step))
        .route("/api/flow/navigate", post(navigate))
        .route("/api/flow/navigate/confirm", post(confirm_navigation))
        .route("/api/flow/navigate/cancel", post(cancel_navigation))
        .route("/api/flow/back", post(navigate_back))
        .route("/api/flow/redirect", post(redirect_to_correct_step))
        .route("/api/flow/mode", put(set_mode))
        .route("/api/flow/provider", put(set_provider_ids))
        .route("/api/flow/token", post(report_token))
        .route("/api/flow/expiry/redirect", post(expiry_redirect))
        .route("/api/flow/restart", post(restart))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::Flow(FlowError::UnknownStep(_)) => StatusCode::NOT_FOUND,
        Error::Flow(FlowError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
        Error::Database(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

fn resolve_step(engine: &WorkflowEngine, raw: &str) -> Result<StepId, Response> {
    engine
        .sequence()
        .require(raw)
        .map_err(|e| error_response(&e.into()))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "kyc-flow"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

/// Initial and re-sync frame sent to WebSocket clients.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SyncMessage {
    StateSync { status: FlowStatus },
}

/// Navigation actions a client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FlowAction {
    Navigate { step: StepId },
    Confirm,
    Cancel,
    Back,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.engine))
}

async fn send_sync(socket: &mut WebSocket, engine: &WorkflowEngine) -> bool {
    let sync = SyncMessage::StateSync {
        status: engine.status().await,
    };
    match serde_json::to_string(&sync) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize state sync: {}", e);
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, engine: Arc<WorkflowEngine>) {
    info!("WebSocket client connected");

    // Subscribe before the sync so nothing slips between the two.
    let mut rx = engine.events().subscribe();

    if !send_sync(&mut socket, &engine).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind flow events");
                        if !send_sync(&mut socket, &engine).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Event channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &engine).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn handle_client_message(text: &str, engine: &WorkflowEngine) {
    let action = match serde_json::from_str::<FlowAction>(text) {
        Ok(action) => action,
        Err(e) => {
            warn!(error = %e, "Invalid flow action from client");
            return;
        }
    };
    debug!(?action, "Flow action from client");

    // Results reach the client as events on the bus.
    match action {
        FlowAction::Navigate { step } => {
            if let Err(e) = engine.navigate_to_step(&step).await {
                warn!(step = %step, "Navigation rejected: {}", e);
            }
        }
        FlowAction::Confirm => {
            engine.confirm_navigation().await;
        }
        FlowAction::Cancel => {
            engine.cancel_navigation();
        }
        FlowAction::Back => {
            engine.navigate_to_previous_step().await;
        }
    }
}

// ── Page entry ──────────────────────────────────────────────────────────

async fn enter_step(
    State(state): State<AppState>,
    Path(step): Path<String>,
    Query(query): Query<EntryQuery>,
) -> impl IntoResponse {
    Json(state.engine.enter_step(&step, &query).await)
}

// ── REST Endpoints ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    flow: FlowStatus,
    expired: bool,
    countdown_progress: f32,
}

async fn flow_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        flow: state.engine.status().await,
        expired: state.expiry.is_expired(),
        countdown_progress: state.expiry.progress(),
    })
}

async fn step_access(State(state): State<AppState>, Path(step): Path<String>) -> Response {
    let step = match resolve_step(&state.engine, &step) {
        Ok(step) => step,
        Err(resp) => return resp,
    };
    let accessible = state.engine.can_access_step(&step).await;
    Json(serde_json::json!({"step": step, "accessible": accessible})).into_response()
}

async fn start_step(State(state): State<AppState>, Path(step): Path<String>) -> Response {
    let step = match resolve_step(&state.engine, &step) {
        Ok(step) => step,
        Err(resp) => return resp,
    };
    match state.engine.start_step(&step).await {
        Ok(()) => {
            let status = state.engine.snapshot().await.status(&step);
            Json(serde_json::json!({"step": step, "status": status})).into_response()
        }
        Err(e) => error_response(&e.into()),
    }
}

#[derive(Deserialize)]
struct CompleteRequest {
    data: serde_json::Value,
    #[serde(default)]
    next: Option<String>,
}

async fn complete_step(
    State(state): State<AppState>,
    Path(step): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Response {
    let step = match resolve_step(&state.engine, &step) {
        Ok(step) => step,
        Err(resp) => return resp,
    };
    if body.data.is_null() {
        return error_response(
            &FlowError::InvalidRequest("Step data must not be null".into()).into(),
        );
    }
    let next = match body.next.as_deref().map(|n| resolve_step(&state.engine, n)) {
        Some(Ok(next)) => Some(next),
        Some(Err(resp)) => return resp,
        None => None,
    };

    match state
        .engine
        .complete_step(&step, body.data, next.as_ref())
        .await
    {
        Ok(next) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "completed",
                "step": step,
                "next": next,
                "redirect_delay_ms": state.engine.config().redirect_delay.as_millis() as u64,
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct NavigateRequest {
    step: String,
}

async fn navigate(State(state): State<AppState>, Json(body): Json<NavigateRequest>) -> Response {
    let step = match resolve_step(&state.engine, &body.step) {
        Ok(step) => step,
        Err(resp) => return resp,
    };
    match state.engine.navigate_to_step(&step).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(&e.into()),
    }
}

async fn confirm_navigation(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.confirm_navigation().await)
}

async fn cancel_navigation(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({"cancelled": state.engine.cancel_navigation()}))
}

async fn navigate_back(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.navigate_to_previous_step().await)
}

async fn redirect_to_correct_step(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.redirect_to_correct_step().await)
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: FlowMode,
}

async fn set_mode(State(state): State<AppState>, Json(body): Json<ModeRequest>) -> impl IntoResponse {
    state.engine.set_mode(body.mode).await;
    Json(serde_json::json!({"mode": body.mode}))
}

#[derive(Deserialize)]
struct ProviderIdsRequest {
    #[serde(default, alias = "providerSessionId")]
    provider_session_id: Option<String>,
    #[serde(default, alias = "workflowId")]
    workflow_id: Option<String>,
}

async fn set_provider_ids(
    State(state): State<AppState>,
    Json(body): Json<ProviderIdsRequest>,
) -> Response {
    if body.provider_session_id.is_none() && body.workflow_id.is_none() {
        return error_response(
            &FlowError::InvalidRequest("Provide provider_session_id or workflow_id".into()).into(),
        );
    }
    state
        .engine
        .set_provider_ids(body.provider_session_id, body.workflow_id)
        .await;
    let flow = state.engine.snapshot().await;
    Json(serde_json::json!({
        "provider_session_id": flow.provider_session_id,
        "workflow_id": flow.workflow_id,
    }))
    .into_response()
}

async fn report_token(
    State(state): State<AppState>,
    Json(validity): Json<TokenValidity>,
) -> impl IntoResponse {
    let started = state.expiry.handle_token(&validity).await;
    Json(serde_json::json!({
        "expired": state.expiry.is_expired(),
        "countdown_started": started,
    }))
}

async fn expiry_redirect(State(state): State<AppState>) -> Response {
    match state.expiry.redirect_now().await {
        Some(url) => Json(serde_json::json!({"url": url})).into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "Token is not expired"})),
        )
            .into_response(),
    }
}

async fn restart(State(state): State<AppState>) -> impl IntoResponse {
    let url = state.engine.restart().await;
    Json(serde_json::json!({"url": url}))
}
