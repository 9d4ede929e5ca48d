//! Integration tests for the API layer.
//!
//! These spin up a real HTTP server on a random port so that
//! `ConnectInfo<SocketAddr>` is populated correctly by axum, with the
//! in-memory store/bus and a scripted LLM provider behind the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carelink_api::{AppState, RateLimitConfig};
use carelink_bus::{BusClient, MemoryBus};
use carelink_common::{TaskResponse, TaskResult};
use carelink_engine::{AgentRouter, ConversationEngine, IntentClassifier};
use carelink_llm::{
    GenerateRequest, GenerateResponse, LlmProvider, PromptRegistry, ProviderError,
    ProviderRegistry,
};
use carelink_session::{MemoryStore, SessionStore};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

struct ScriptedProvider;

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, _request: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        Ok(GenerateResponse {
            content: "general_info".to_string(),
            provider: "scripted".to_string(),
            model: "scripted".to_string(),
            latency_ms: 1,
            usage: None,
            finish_reason: Some("stop".to_string()),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn supported_models(&self) -> Vec<String> {
        vec!["scripted".to_string()]
    }
}

struct TestServer {
    base: String,
    ws_base: String,
    bus: Arc<MemoryBus>,
    engine: Arc<ConversationEngine>,
    _prompt_dir: tempfile::TempDir,
}

/// Wait until the hub sees a live push connection for the session. The
/// attach happens in the spawned upgrade task, after the WS handshake
/// returns to the client.
async fn wait_attached(engine: &Arc<ConversationEngine>, session_id: Uuid) {
    for _ in 0..100 {
        if engine.hub().is_attached(session_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("push connection never attached for {session_id}");
}

async fn start_test_server(session_ttl: Duration, rate_limit: Option<RateLimitConfig>) -> TestServer {
    let prompt_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        prompt_dir.path().join("intent_recognition.txt"),
        "Message: {message}\nHistory: {conversation_history}\nContext: {current_context}",
    )
    .unwrap();
    std::fs::write(
        prompt_dir.path().join("general_info_response.txt"),
        "Question: {message}\nHistory: {conversation_history}\nContext: {user_context}",
    )
    .unwrap();
    let prompts = Arc::new(PromptRegistry::load(prompt_dir.path()).unwrap());

    let store = Arc::new(MemoryStore::new(session_ttl, 50));
    let bus = Arc::new(MemoryBus::new());
    let engine = Arc::new(ConversationEngine::new(
        store as Arc<dyn SessionStore>,
        Arc::new(ProviderRegistry::new(vec![
            Arc::new(ScriptedProvider) as Arc<dyn LlmProvider>
        ])),
        prompts,
        IntentClassifier::with_default_rules(),
        AgentRouter::with_defaults(),
        bus.clone() as Arc<dyn BusClient>,
    ));
    engine.start().await.unwrap();

    let mut state = AppState::new(engine.clone(), "carelink-orchestrator");
    if let Some(config) = rate_limit {
        state = state.with_rate_limit(config);
    }
    let router = carelink_api::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
        bus,
        engine,
        _prompt_dir: prompt_dir,
    }
}

async fn server() -> TestServer {
    start_test_server(Duration::from_secs(3600), None).await
}

async fn get(base: &str, path: &str) -> (u16, serde_json::Value) {
    let resp = reqwest::Client::new()
        .get(format!("{base}{path}"))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body = resp.json().await.unwrap_or(serde_json::Value::Null);
    (status, body)
}

async fn post_json(base: &str, path: &str, json: serde_json::Value) -> (u16, serde_json::Value) {
    let resp = reqwest::Client::new()
        .post(format!("{base}{path}"))
        .json(&json)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body = resp.json().await.unwrap_or(serde_json::Value::Null);
    (status, body)
}

// ============================================================================
// Health and metrics
// ============================================================================

#[tokio::test]
async fn health_reports_healthy() {
    let server = server().await;
    let (status, body) = get(&server.base, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "carelink-orchestrator");
    assert_eq!(body["checks"]["session_store"], "healthy");
}

#[tokio::test]
async fn metrics_exposes_counters_and_providers() {
    let server = server().await;
    post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": "book an appointment"}),
    )
    .await;

    let (status, body) = get(&server.base, "/metrics").await;
    assert_eq!(status, 200);
    assert_eq!(body["total_messages"], 1);
    assert_eq!(body["active_sessions"], 1);
    assert_eq!(body["intent_distribution"]["appointment_booking"], 1);
    assert_eq!(body["llm_provider"], "scripted");
}

// ============================================================================
// Chat endpoint
// ============================================================================

#[tokio::test]
async fn chat_returns_provisional_booking_response() {
    let server = server().await;
    let (status, body) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({
            "user_id": "u1",
            "message": "I want to book an appointment with cardiology"
        }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["intent"], "appointment_booking");
    assert_eq!(body["suggested_actions"][0], "wait_for_agent_response");
    assert_eq!(body["requires_human_handoff"], false);
    assert!(body["correlation_id"].as_str().is_some());
    assert!(body["processing_time_ms"].as_u64().is_some());
    Uuid::parse_str(body["session_id"].as_str().unwrap()).unwrap();
}

#[tokio::test]
async fn chat_validates_inputs() {
    let server = server().await;

    // 2000 characters pass, 2001 fail.
    let ok = "x".repeat(2000);
    let (status, _) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": ok}),
    )
    .await;
    assert_eq!(status, 200);

    let too_long = "x".repeat(2001);
    let (status, body) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": too_long}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "VALIDATION");

    let (status, _) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "", "message": "hello"}),
    )
    .await;
    assert_eq!(status, 400);

    let (status, body) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": "hello", "session_id": "not-a-uuid"}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "VALIDATION");
}

#[tokio::test]
async fn chat_emergency_short_circuits() {
    let server = server().await;
    let (status, body) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": "I am having severe chest pain"}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["intent"], "medical_emergency");
    assert_eq!(body["requires_human_handoff"], true);
    assert!(body["suggested_actions"]
        .as_array()
        .unwrap()
        .iter()
        .any(|a| a == "call_emergency_services"));
    assert!(body.get("correlation_id").is_none());
}

#[tokio::test]
async fn chat_rate_limit_returns_429() {
    let server = start_test_server(
        Duration::from_secs(3600),
        Some(RateLimitConfig {
            max_requests: 2,
            ..Default::default()
        }),
    )
    .await;

    for _ in 0..2 {
        let (status, _) = post_json(
            &server.base,
            "/chat",
            serde_json::json!({"user_id": "u1", "message": "hello there"}),
        )
        .await;
        assert_eq!(status, 200);
    }
    let (status, body) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": "hello again"}),
    )
    .await;
    assert_eq!(status, 429);
    assert_eq!(body["code"], "RATE_LIMITED");
}

// ============================================================================
// Session endpoints
// ============================================================================

#[tokio::test]
async fn session_roundtrip_and_delete() {
    let server = server().await;

    let (_, chat) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": "book an appointment"}),
    )
    .await;
    let session_id = chat["session_id"].as_str().unwrap().to_string();

    let (status, session) = get(&server.base, &format!("/session/{session_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(session["user_id"], "u1");
    // Greeting + user turn + provisional assistant reply.
    assert_eq!(session["conversation_history"].as_array().unwrap().len(), 3);

    // Second message appends rather than replacing.
    post_json(
        &server.base,
        "/chat",
        serde_json::json!({
            "user_id": "u1",
            "message": "see a doctor on friday",
            "session_id": session_id
        }),
    )
    .await;
    let (_, session) = get(&server.base, &format!("/session/{session_id}")).await;
    assert_eq!(session["conversation_history"].as_array().unwrap().len(), 5);

    let resp = reqwest::Client::new()
        .delete(format!("{}/session/{session_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["cleared"], true);

    let (status, _) = get(&server.base, &format!("/session/{session_id}")).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn unknown_session_is_404() {
    let server = server().await;
    let (status, body) = get(&server.base, &format!("/session/{}", Uuid::new_v4())).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "SESSION_MISSING");

    let resp = reqwest::Client::new()
        .delete(format!("{}/session/{}", server.base, Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn expired_session_is_404() {
    let server = start_test_server(Duration::from_millis(200), None).await;
    let (_, chat) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": "book an appointment"}),
    )
    .await;
    let session_id = chat["session_id"].as_str().unwrap().to_string();

    let (status, _) = get(&server.base, &format!("/session/{session_id}")).await;
    assert_eq!(status, 200);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let (status, _) = get(&server.base, &format!("/session/{session_id}")).await;
    assert_eq!(status, 404);
}

// ============================================================================
// Push channel
// ============================================================================

#[tokio::test]
async fn final_response_arrives_over_websocket() {
    let server = server().await;

    let (_, chat) = post_json(
        &server.base,
        "/chat",
        serde_json::json!({"user_id": "u1", "message": "book an appointment with cardiology"}),
    )
    .await;
    let session_id = chat["session_id"].as_str().unwrap().to_string();
    let correlation_id = Uuid::parse_str(chat["correlation_id"].as_str().unwrap()).unwrap();

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("{}/ws/{session_id}", server.ws_base))
            .await
            .unwrap();
    wait_attached(&server.engine, Uuid::parse_str(&session_id).unwrap()).await;

    // The worker responds on the bus.
    let response = TaskResponse::success(
        correlation_id,
        TaskResult {
            response: "Slot reserved for 10:00 AM".into(),
            sources: vec![],
            requires_human_handoff: false,
            suggested_actions: vec![],
            session_id: Some(Uuid::parse_str(&session_id).unwrap()),
            error_code: None,
        },
    );
    server
        .bus
        .dispatch(
            "appointment-agent-responses",
            &session_id,
            serde_json::to_vec(&response).unwrap(),
        )
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = frame.into_text().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(envelope["type"], "final_response");
    assert_eq!(envelope["data"]["response"], "Slot reserved for 10:00 AM");
    assert_eq!(envelope["data"]["session_id"], session_id);
}

#[tokio::test]
async fn reconnecting_supersedes_previous_connection() {
    let server = server().await;
    let session_id = Uuid::new_v4();

    let (mut ws_a, _) =
        tokio_tungstenite::connect_async(format!("{}/ws/{session_id}", server.ws_base))
            .await
            .unwrap();
    wait_attached(&server.engine, session_id).await;
    let (mut ws_b, _) =
        tokio_tungstenite::connect_async(format!("{}/ws/{session_id}", server.ws_base))
            .await
            .unwrap();

    // A receives a close carrying the supersede reason.
    let frame = tokio::time::timeout(Duration::from_secs(2), ws_a.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        WsMessage::Close(Some(close)) => {
            assert_eq!(close.reason.as_str(), "superseded");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    // B stays connected; client frames are accepted and ignored.
    ws_b.send(WsMessage::Text("typing...".into())).await.unwrap();
    ws_b.close(None).await.unwrap();
}

#[tokio::test]
async fn websocket_rejects_malformed_session_id() {
    let server = server().await;
    let result =
        tokio_tungstenite::connect_async(format!("{}/ws/not-a-uuid", server.ws_base)).await;
    assert!(result.is_err());
}
