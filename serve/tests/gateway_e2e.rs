//! End-to-end gateway tests over an ephemeral listener.
//!
//! The mock provider keeps everything offline: no credentials, no network
//! beyond the loopback listener.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;

use serve::app::{router, AppState};
use trellis::{ChatPipeline, GatewayConfig, InstanceAllowList, Store};

struct TestGateway {
    base: String,
    pipeline: Arc<ChatPipeline>,
    _dir: tempfile::TempDir,
}

async fn spawn_gateway(allow: &str) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        bearer_token: "test-secret".to_string(),
        data_root: dir.path().join("data"),
        db_path: dir.path().join("t.db"),
        bind_host: "127.0.0.1".to_string(),
        bind_port: 0,
        allowed_instances: InstanceAllowList::parse(allow),
        max_tool_iterations: 5,
        max_input_tokens: 100_000,
        max_user_message_tokens: 8192,
        compaction_threshold_tokens: 65_536,
        compaction_max_summary_tokens: 1024,
        enable_cors: false,
        public_domain: None,
        debug: false,
        sandbox_image: "python:3.12-slim".to_string(),
        sandbox_network: "trellis-sandbox".to_string(),
        research_pdf_command: None,
        extract_api_url: None,
        memory_max_chars: 2000,
        retention_days: 0,
    };
    let store = Store::open(&config.db_path).unwrap();
    let pipeline = Arc::new(ChatPipeline::new(config, store, None));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(pipeline.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestGateway {
        base: format!("http://{addr}"),
        pipeline,
        _dir: dir,
    }
}

fn chat_body(stream: bool) -> serde_json::Value {
    json!({
        "conversation_id": "conv-e2e",
        "messages": [{"role": "user", "content": "hello"}],
        "config": {"llm_provider": "mock", "llm_model": "mock-model"},
        "user_email": "alice@example.com",
        "stream": stream
    })
}

#[tokio::test]
async fn health_is_open() {
    let gw = spawn_gateway("*").await;
    let resp = reqwest::get(format!("{}/health", gw.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn chat_requires_bearer() {
    let gw = spawn_gateway("*").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/v1/chat", gw.base))
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("{}/api/v1/chat", gw.base))
        .bearer_auth("wrong")
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn disallowed_instance_rejected_with_identity() {
    let gw = spawn_gateway("10.0.0.0/8").await;
    let mut body = chat_body(false);
    body["owui_instance"] = json!("192.168.1.5");

    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/chat", gw.base))
        .bearer_auth("test-secret")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let text = resp.text().await.unwrap();
    assert!(text.contains("192.168.1.5"), "identity in body: {text}");

    // No request row was persisted for the rejected call.
    let totals = gw.pipeline.store.totals_by_user().await.unwrap();
    assert!(totals.is_empty());
}

#[tokio::test]
async fn streamed_chat_produces_openai_sse() {
    let gw = spawn_gateway("*").await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/chat", gw.base))
        .bearer_auth("test-secret")
        .json(&chat_body(true))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    assert!(body.contains("chat.completion.chunk"));
    assert!(body.contains("mock reply"));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // The persisted request row carries the mock usage.
    let totals = gw.pipeline.store.totals_by_user().await.unwrap();
    let alice = totals
        .iter()
        .find(|t| t.key == "alice@example.com")
        .expect("request row");
    assert_eq!(alice.requests, 1);
    assert_eq!(alice.input_tokens, 16);
}

#[tokio::test]
async fn non_streaming_chat_returns_completion_json() {
    let gw = spawn_gateway("*").await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/chat", gw.base))
        .bearer_auth("test-secret")
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "mock reply");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 16);
}

#[tokio::test]
async fn recall_instance_lifecycle() {
    let gw = spawn_gateway("*").await;
    let client = reqwest::Client::new();
    let base = format!("{}/api/v1/file-recall", gw.base);

    // Admin auth is required for instance CRUD.
    let resp = client
        .post(format!("{base}/instances"))
        .json(&json!({"id": "acme", "name": "Acme", "openai_api_key": "sk-x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Create, capturing the access token.
    let resp = client
        .post(format!("{base}/instances"))
        .bearer_auth("test-secret")
        .json(&json!({"id": "acme", "name": "Acme", "openai_api_key": "sk-x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    let token = created["access_token"].as_str().unwrap().to_string();
    assert_eq!(token.len(), 64);

    // Duplicate id conflicts.
    let resp = client
        .post(format!("{base}/instances"))
        .bearer_auth("test-secret")
        .json(&json!({"id": "acme", "name": "Again", "openai_api_key": "sk-x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Bad slug is a validation error.
    let resp = client
        .post(format!("{base}/instances"))
        .bearer_auth("test-secret")
        .json(&json!({"id": "Bad Slug", "name": "x", "openai_api_key": "sk-x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Instance endpoints need the instance token, not the admin secret.
    let resp = client
        .get(format!("{base}/acme/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .get(format!("{base}/acme/stats"))
        .header("x-access-token", &token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["file_count"], 0);
    assert!(stats["supported_types"]
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t == "pdf"));

    // Unknown instances are 404 regardless of token.
    let resp = client
        .get(format!("{base}/ghost/stats"))
        .header("x-access-token", &token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn volume_static_serving_guards_traversal() {
    let gw = spawn_gateway("*").await;
    // Lay a file down where the volume route expects it.
    let volume = gw
        .pipeline
        .config
        .data_root
        .join("alice")
        .join("conv-1")
        .join("volume")
        .join("research");
    std::fs::create_dir_all(&volume).unwrap();
    std::fs::write(volume.join("report.md"), "# findings").unwrap();

    let resp = reqwest::get(format!(
        "{}/alice/conv-1/volume/research/report.md",
        gw.base
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "# findings");

    // Escapes are rejected or unresolvable, never served.
    let resp = reqwest::get(format!(
        "{}/alice/conv-1/volume/..%2F..%2F..%2Ft.db",
        gw.base
    ))
    .await
    .unwrap();
    assert_ne!(resp.status(), 200);
}

#[tokio::test]
async fn process_without_backend_is_unavailable() {
    let gw = spawn_gateway("*").await;
    let resp = reqwest::Client::new()
        .post(format!("{}/process", gw.base))
        .bearer_auth("test-secret")
        .body("raw document bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}
