//! REST facade tests over a live listener and mock services.

use std::sync::Arc;

use edgequake_router::config::RouterConfig;
use edgequake_router::registry::DetectionSource;
use edgequake_router::{
    router, AppState, ConfigManager, LlmError, MockService, ModelRegistry, ModelService,
    ProviderId, ServiceFactory,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct Harness {
    base: String,
    mock: Arc<MockService>,
    client: reqwest::Client,
}

impl Harness {
    async fn start() -> Self {
        let mock = Arc::new(MockService::new().named("ollama"));
        let registry = ModelRegistry::new(
            vec![DetectionSource {
                provider: ProviderId::Ollama,
                service: mock.clone(),
            }],
            None,
            vec![],
        );

        let shared = mock.clone();
        let factory = ServiceFactory::with_registry(
            ConfigManager::in_memory(RouterConfig::default()),
            registry,
        )
        .with_constructor(move |_, _| Ok(shared.clone() as Arc<dyn ModelService>));
        factory.initialize().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(AppState::new(Arc::new(factory)));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            mock,
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        (response.status().as_u16(), response.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        (response.status().as_u16(), response.json().await.unwrap())
    }

    async fn stream(&self, body: Value) -> String {
        self.client
            .post(format!("{}/stream", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_models_lists_detected() {
    let harness = Harness::start().await;
    let (status, body) = harness.get("/models").await;

    assert_eq!(status, 200);
    assert_eq!(body["models"].as_array().unwrap().len(), 2);
    assert_eq!(body["default"], "mock-chat");
    assert_eq!(body["models"][0]["provider"], "ollama");
}

#[tokio::test]
async fn test_complete_uses_default_model() {
    let harness = Harness::start().await;
    harness.mock.push_text("Hi there");

    let (status, body) = harness.post("/complete", json!({ "prompt": "Hello" })).await;
    assert_eq!(status, 200);
    assert_eq!(body["text"], "Hi there");
    assert_eq!(body["provider"], "ollama");

    let (_, usage) = harness.get("/usage").await;
    assert_eq!(usage["summary"]["requests"], 1);
    assert_eq!(usage["providers"]["ollama"]["requests"], 1);
}

#[tokio::test]
async fn test_unknown_model_is_404() {
    let harness = Harness::start().await;
    let (status, body) = harness
        .post("/complete", json!({ "prompt": "Hello", "model": "gpt-9" }))
        .await;

    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "MODEL_NOT_FOUND");
    assert_eq!(body["error"]["details"]["model"], "gpt-9");
    assert_eq!(harness.mock.completions(), 0);
}

#[tokio::test]
async fn test_provider_error_maps_status() {
    let harness = Harness::start().await;
    harness.mock.push_error(LlmError::RateLimited("slow down".into()));

    let (status, body) = harness
        .post(
            "/chat",
            json!({ "messages": [{ "role": "user", "content": "Hi" }], "model": "mock-chat" }),
        )
        .await;
    assert_eq!(status, 429);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_chat_rejects_empty_messages() {
    let harness = Harness::start().await;
    let (status, body) = harness.post("/chat", json!({ "messages": [] })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_stream_emits_fragments_then_done() {
    let harness = Harness::start().await;
    harness.mock.push_text("Hello streaming world");

    let body = harness.stream(json!({ "prompt": "Hi" })).await;
    let data: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();

    assert_eq!(data.len(), 4);
    let text: String = data[..3]
        .iter()
        .map(|d| serde_json::from_str::<Value>(d).unwrap()["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(text, "Hello streaming world");
    assert_eq!(data[3], "[DONE]");
}

#[tokio::test]
async fn test_stream_failure_becomes_error_event() {
    let harness = Harness::start().await;
    harness
        .mock
        .push_partial_stream(vec!["Hel".into(), "lo".into()], LlmError::Timeout);

    let body = harness
        .stream(json!({ "messages": [{ "role": "user", "content": "Hi" }] }))
        .await;

    assert!(body.contains("event: error"));
    assert!(body.contains("TIMEOUT"));
    assert!(body.trim_end().ends_with("data: [DONE]"));
    assert_eq!(body.matches("\"text\"").count(), 2);
}

#[tokio::test]
async fn test_stream_requires_input() {
    let harness = Harness::start().await;
    let response = harness
        .client
        .post(format!("{}/stream", harness.base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn test_embed_single_and_batch() {
    let harness = Harness::start().await;

    let (status, single) = harness
        .post("/embed", json!({ "text": "hello", "model": "mock-embed" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(single["embedding"].as_array().unwrap().len(), 8);

    let (status, batch) = harness
        .post("/embed", json!({ "texts": ["a", "b"], "model": "mock-embed" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(batch["embeddings"].as_array().unwrap().len(), 2);

    let (status, _) = harness.post("/embed", json!({})).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_load_status_unload() {
    let harness = Harness::start().await;

    let (status, body) = harness.post("/models/mock-chat/load", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "loaded");

    let (status, body) = harness.get("/models/mock-chat/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["loaded"], true);

    harness.post("/models/mock-chat/unload", json!({})).await;
    let (_, body) = harness.get("/models/mock-chat/status").await;
    assert_eq!(body["loaded"], false);

    let (status, _) = harness.get("/models/ghost/status").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_health_reports_providers() {
    let harness = Harness::start().await;

    let (status, body) = harness.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["providers"]["ollama"], true);
    assert_eq!(body["models"], 2);

    harness.mock.set_healthy(false);
    let (_, body) = harness.get("/health").await;
    assert_eq!(body["status"], "degraded");
}
