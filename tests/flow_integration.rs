//! Integration tests for the flow WebSocket + REST surface.
//!
//! Each test spins up an Axum server on a random port and drives the real
//! HTTP / WS contract with reqwest and tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use kyc_flow::config::FlowConfig;
use kyc_flow::events::EventBus;
use kyc_flow::routes::flow_routes;
use kyc_flow::store::{Database, LibSqlBackend, MemoryBackend};
use kyc_flow::workflow::{ExpiryMonitor, StepId, WorkflowEngine};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> FlowConfig {
    FlowConfig {
        redirect_delay: Duration::from_millis(50),
        retry_delay: Duration::from_millis(1),
        expiry_countdown: Duration::from_millis(300),
        countdown_tick: Duration::from_millis(20),
        ..FlowConfig::default()
    }
}

/// Start an Axum server on a random port over the given durable store.
async fn start_server_with(durable: Arc<dyn Database>) -> (u16, Arc<WorkflowEngine>) {
    let engine = WorkflowEngine::open(
        test_config(),
        durable,
        Arc::new(MemoryBackend::new()),
        EventBus::new(),
    )
    .await;
    let expiry = ExpiryMonitor::new(Arc::clone(&engine));
    let app = flow_routes(Arc::clone(&engine), expiry);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, engine)
}

async fn start_server() -> (u16, Arc<WorkflowEngine>) {
    start_server_with(Arc::new(MemoryBackend::new())).await
}

async fn get_json(url: String) -> (u16, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn post_json(url: String, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn put_json(url: String, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .put(url)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

/// Submit a step and wait for the delayed navigation to land.
async fn complete(port: u16, step: &str) -> Value {
    let (status, body) = post_json(
        format!("http://127.0.0.1:{port}/api/flow/steps/{step}/complete"),
        json!({"data": {"submitted": step}}),
    )
    .await;
    assert_eq!(status, 200, "complete {step} failed: {body}");
    tokio::time::sleep(Duration::from_millis(150)).await;
    body
}

fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

// ── REST Tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        let (status, body) = get_json(format!("http://127.0.0.1:{port}/health")).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "kyc-flow");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn first_entry_starts_the_flow() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;

        let (status, body) = get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
        assert_eq!(status, 200);
        assert_eq!(body["outcome"], "entered");
        assert_eq!(body["step"], "signin");

        let (_, status) = get_json(format!("http://127.0.0.1:{port}/api/flow/status")).await;
        assert_eq!(status["state"]["current_step"], "signin");
        assert_eq!(status["state"]["steps"]["signin"], "in_progress");
        assert_eq!(status["mode"], "online");
        assert!(status["session_id"].is_string());
        assert_eq!(status["expired"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn access_follows_completed_steps() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;

        let access = format!("http://127.0.0.1:{port}/api/flow/steps/personal-details/access");
        let (_, body) = get_json(access.clone()).await;
        assert_eq!(body["accessible"], false);

        let body = complete(port, "signin").await;
        assert_eq!(body["next"], "personal-details");

        let (_, body) = get_json(access).await;
        assert_eq!(body["accessible"], true);

        let (_, status) = get_json(format!("http://127.0.0.1:{port}/api/flow/status")).await;
        assert_eq!(status["state"]["current_step"], "personal-details");
        assert_eq!(status["state"]["previously_completed_steps"]["signin"], true);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_step_is_not_found() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        let (status, body) =
            get_json(format!("http://127.0.0.1:{port}/api/flow/steps/video-kyc/access")).await;
        assert_eq!(status, 404);
        assert!(body["error"].as_str().unwrap().contains("video-kyc"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn locked_step_entry_redirects() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;

        let (_, body) = get_json(format!("http://127.0.0.1:{port}/flow/bank")).await;
        assert_eq!(body["outcome"], "redirected");
        assert_eq!(body["reason"], "access_denied");
        assert_eq!(body["navigation"]["step"], "signin");
        assert_eq!(body["navigation"]["url"], "/flow/signin");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn later_step_without_state_is_session_loss() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        let (_, body) = get_json(format!("http://127.0.0.1:{port}/flow/bank")).await;
        assert_eq!(body["outcome"], "session_lost");
        assert_eq!(body["url"], "/flow/signin");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn provider_cancel_returns_to_verified_step() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
        complete(port, "signin").await;
        complete(port, "personal-details").await;
        complete(port, "nominee-poa").await;

        // Provider verified `bank` and bounced the user on to `exchange`.
        let (_, body) = get_json(format!(
            "http://127.0.0.1:{port}/flow/exchange?status=cancel&documentId=DOC-7&message=Closed"
        ))
        .await;
        assert_eq!(body["outcome"], "redirected");
        assert_eq!(body["reason"], "provider_outcome");
        assert_eq!(body["navigation"]["step"], "bank");

        let (_, status) = get_json(format!("http://127.0.0.1:{port}/api/flow/status")).await;
        assert_eq!(status["state"]["steps"]["bank"], "cancelled");
        assert_eq!(status["state"]["provider_document_id"], "DOC-7");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn guarded_exit_needs_confirmation() {
    timeout(TEST_TIMEOUT, async {
        let (port, engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
        for step in ["signin", "personal-details", "nominee-poa"] {
            complete(port, step).await;
        }
        assert_eq!(engine.current_step().await, StepId::from("bank"));

        let (_, body) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/back"),
            json!({}),
        )
        .await;
        assert_eq!(body["outcome"], "awaiting_confirmation");
        assert_eq!(body["from"], "bank");

        let (_, body) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/navigate/confirm"),
            json!({}),
        )
        .await;
        assert_eq!(body["outcome"], "navigated");
        assert_eq!(body["step"], "nominee-poa");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mode_is_persisted() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        let (status, _) = put_json(
            format!("http://127.0.0.1:{port}/api/flow/mode"),
            json!({"mode": "offline"}),
        )
        .await;
        assert_eq!(status, 200);

        let (_, status) = get_json(format!("http://127.0.0.1:{port}/api/flow/status")).await;
        assert_eq!(status["mode"], "offline");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn start_marks_step_in_progress() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
        complete(port, "signin").await;

        let (_, status) = get_json(format!("http://127.0.0.1:{port}/api/flow/status")).await;
        assert_eq!(status["state"]["steps"]["personal-details"], "not_started");

        let (code, body) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/steps/personal-details/start"),
            json!({}),
        )
        .await;
        assert_eq!(code, 200);
        assert_eq!(body["status"], "in_progress");

        // Starting again leaves a finished step alone.
        let (_, body) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/steps/signin/start"),
            json!({}),
        )
        .await;
        assert_eq!(body["status"], "completed");

        let (code, _) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/steps/video/start"),
            json!({}),
        )
        .await;
        assert_eq!(code, 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn provider_ids_are_recorded() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;

        let (code, body) = put_json(
            format!("http://127.0.0.1:{port}/api/flow/provider"),
            json!({"providerSessionId": "ps-1", "workflowId": "wf-9"}),
        )
        .await;
        assert_eq!(code, 200);
        assert_eq!(body["provider_session_id"], "ps-1");

        let (_, body) = put_json(
            format!("http://127.0.0.1:{port}/api/flow/provider"),
            json!({"workflow_id": "wf-10"}),
        )
        .await;
        assert_eq!(body["provider_session_id"], "ps-1");
        assert_eq!(body["workflow_id"], "wf-10");

        let (_, status) = get_json(format!("http://127.0.0.1:{port}/api/flow/status")).await;
        assert_eq!(status["state"]["provider_session_id"], "ps-1");
        assert_eq!(status["state"]["workflow_id"], "wf-10");

        let (code, _) = put_json(
            format!("http://127.0.0.1:{port}/api/flow/provider"),
            json!({}),
        )
        .await;
        assert_eq!(code, 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn redirect_returns_user_to_correct_step() {
    timeout(TEST_TIMEOUT, async {
        let (port, engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
        complete(port, "signin").await;
        assert_eq!(engine.current_step().await, StepId::from("personal-details"));

        engine.remove_step_data(&StepId::from("signin")).await;

        let (code, body) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/redirect"),
            json!({}),
        )
        .await;
        assert_eq!(code, 200);
        assert_eq!(body["outcome"], "navigated");
        assert_eq!(body["step"], "signin");
        assert_eq!(body["url"], "/flow/signin");

        let (_, body) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/redirect"),
            json!({}),
        )
        .await;
        assert_eq!(body["outcome"], "stayed");
        assert_eq!(body["step"], "signin");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_token_purges_and_restarts() {
    timeout(TEST_TIMEOUT, async {
        let (port, engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
        complete(port, "signin").await;

        let (status, _) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/expiry/redirect"),
            json!({}),
        )
        .await;
        assert_eq!(status, 409);

        let (_, body) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/token"),
            json!({"isValid": false, "message": "Link expired"}),
        )
        .await;
        assert_eq!(body["countdown_started"], true);
        assert!(!engine.store().has_state().await);
        assert!(engine.data_presence().await.is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;

        let (_, status) = get_json(format!("http://127.0.0.1:{port}/api/flow/status")).await;
        assert_eq!(status["expired"], false);
        assert_eq!(status["state"]["current_step"], "signin");
        assert_eq!(status["state"]["steps"]["signin"], "not_started");
        assert!(!engine.store().has_state().await);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn restart_clears_progress() {
    timeout(TEST_TIMEOUT, async {
        let (port, engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
        complete(port, "signin").await;

        let (_, body) = post_json(
            format!("http://127.0.0.1:{port}/api/flow/restart"),
            json!({}),
        )
        .await;
        assert_eq!(body["url"], "/flow/signin");
        assert!(!engine.store().has_state().await);
        assert!(engine.store().session().session_id().await.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn progress_survives_server_restart() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.db");

        {
            let durable: Arc<dyn Database> =
                Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
            let (port, _engine) = start_server_with(durable).await;
            get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
            complete(port, "signin").await;
        }

        let durable: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let (port, _engine) = start_server_with(durable).await;
        let (_, body) = get_json(format!(
            "http://127.0.0.1:{port}/api/flow/steps/personal-details/access"
        ))
        .await;
        assert_eq!(body["accessible"], true);
    })
    .await
    .expect("test timed out");
}

// ── WebSocket Tests ─────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_state_sync() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("WS connect failed");

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);
        assert_eq!(json["type"], "state_sync");
        assert_eq!(json["status"]["state"]["current_step"], "signin");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_receives_navigation_events() {
    timeout(TEST_TIMEOUT, async {
        let (port, _engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        let _ = ws.next().await.unwrap().unwrap();

        complete(port, "signin").await;

        let mut types = Vec::new();
        while types.last().map(String::as_str) != Some("navigate") {
            let msg = ws.next().await.unwrap().unwrap();
            let json = parse_ws_json(&msg);
            if json["type"] == "navigate" {
                assert_eq!(json["step"], "personal-details");
                assert!(
                    json["url"]
                        .as_str()
                        .unwrap()
                        .starts_with("/flow/personal-details?session_id=")
                );
            }
            types.push(json["type"].as_str().unwrap().to_string());
        }
        assert!(types.contains(&"notice".to_string()));
        assert!(types.contains(&"redirecting".to_string()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_back_action_moves_user() {
    timeout(TEST_TIMEOUT, async {
        let (port, engine) = start_server().await;
        get_json(format!("http://127.0.0.1:{port}/flow/signin")).await;
        complete(port, "signin").await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        let _ = ws.next().await.unwrap().unwrap();

        ws.send(Message::Text(json!({"action": "back"}).to_string().into()))
            .await
            .unwrap();

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);
        assert_eq!(json["type"], "navigate");
        assert_eq!(json["step"], "signin");
        assert_eq!(engine.current_step().await, StepId::from("signin"));
    })
    .await
    .expect("test timed out");
}
