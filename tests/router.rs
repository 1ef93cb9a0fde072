//! End-to-end routing: configuration, detection across providers, the
//! decorator pipeline and wire calls against mock servers.
//!
//! Tests touch provider environment variables and run serially.

use edgequake_router::config::CONFIG_ENV;
use edgequake_router::{
    CompletionOptions, ConfigManager, EmbeddingOptions, ProviderId, RouterConfig, ServiceFactory,
    ServiceIdentity,
};
use httpmock::prelude::*;
use serde_json::json;
use serial_test::serial;

fn clear_env() {
    for var in [
        CONFIG_ENV,
        "OLLAMA_HOST",
        "OPENAI_API_KEY",
        "OPENAI_BASE_URL",
        "ANTHROPIC_API_KEY",
        "ANTHROPIC_BASE_URL",
    ] {
        std::env::remove_var(var);
    }
}

fn tags() -> serde_json::Value {
    json!({
        "models": [
            { "name": "llama3.1:8b", "model": "llama3.1:8b", "size": 4_900_000_000u64, "digest": "a" },
            { "name": "nomic-embed-text:latest", "model": "nomic-embed-text:latest", "size": 274_000_000u64, "digest": "b" }
        ]
    })
}

fn local_config(server: &MockServer) -> RouterConfig {
    let mut config = RouterConfig::default();
    config.providers.ollama.base_url = Some(server.base_url());
    config
}

#[tokio::test]
#[serial]
async fn test_keyless_hosted_providers_degrade_to_local() {
    clear_env();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(tags());
        })
        .await;
    let generate = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"model":"llama3.1:8b","stream":false}"#);
            then.status(200).json_body(json!({
                "response": "Paris",
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 6,
                "eval_count": 1
            }));
        })
        .await;

    let factory = ServiceFactory::new(ConfigManager::in_memory(local_config(&server)));
    factory.initialize().await;

    assert_eq!(
        factory.model_ids(),
        vec!["llama3.1:8b", "nomic-embed-text:latest"]
    );
    assert_eq!(factory.default_model().as_deref(), Some("llama3.1:8b"));

    let errors = factory.registry().detection_errors();
    assert!(errors.contains_key(&ProviderId::OpenAI));
    assert!(errors.contains_key(&ProviderId::Anthropic));
    assert!(!errors.contains_key(&ProviderId::Ollama));

    let service = factory.resolve(None).unwrap();
    assert_eq!(service.identity(), ServiceIdentity::Metrics);

    let prompt = "Capital of France?";
    let first = service.complete(prompt, &CompletionOptions::default()).await.unwrap();
    let second = service.complete(prompt, &CompletionOptions::default()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.provider, "ollama");
    generate.assert_hits_async(1).await;

    let counter = factory.usage().get("llama3.1:8b").unwrap();
    assert_eq!(counter.requests, 2);
    assert_eq!(counter.total_tokens, 14);
    assert_eq!(counter.provider, "ollama");
}

#[tokio::test]
#[serial]
async fn test_embeddings_route_to_embedding_model() {
    clear_env();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(tags());
        })
        .await;
    let embeddings = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/embeddings")
                .json_body_partial(r#"{"model":"nomic-embed-text:latest"}"#);
            then.status(200).json_body(json!({ "embedding": [0.25, 0.5, 0.75] }));
        })
        .await;

    let factory = ServiceFactory::new(ConfigManager::in_memory(local_config(&server)));
    factory.initialize().await;

    let service = factory.resolve(Some("nomic-embed-text:latest")).unwrap();
    let vector = service
        .embed("hello", &EmbeddingOptions::for_model("nomic-embed-text:latest"))
        .await
        .unwrap();
    assert_eq!(vector, vec![0.25, 0.5, 0.75]);

    service
        .embed("hello", &EmbeddingOptions::for_model("nomic-embed-text:latest"))
        .await
        .unwrap();
    embeddings.assert_hits_async(1).await;
}

#[tokio::test]
#[serial]
async fn test_hosted_default_with_unreachable_local() {
    clear_env();
    std::env::set_var("OPENAI_API_KEY", "sk-test");

    let server = MockServer::start_async().await;
    let chat = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer sk-test")
                .json_body_partial(r#"{"model":"gpt-4o"}"#);
            then.status(200).json_body(json!({
                "model": "gpt-4o-2024-08-06",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "Hi!" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6 }
            }));
        })
        .await;

    let mut config = RouterConfig::default();
    config.default_model = Some("gpt-4o".into());
    config.providers.ollama.base_url = Some("http://127.0.0.1:9".into());
    config.providers.ollama.max_retries = 0;
    config.providers.openai.base_url = Some(server.base_url());
    config.providers.anthropic.enabled = false;

    let factory = ServiceFactory::new(ConfigManager::in_memory(config));
    factory.initialize().await;

    assert!(factory.registry().detection_errors().contains_key(&ProviderId::Ollama));
    assert_eq!(factory.default_model().as_deref(), Some("gpt-4o"));
    assert!(factory.model_ids().iter().all(|id| !id.starts_with("claude")));

    let response = factory
        .resolve(None)
        .unwrap()
        .complete("Hello", &CompletionOptions::default())
        .await
        .unwrap();
    chat.assert_async().await;
    assert_eq!(response.text, "Hi!");
    assert_eq!(response.provider, "openai");

    std::env::remove_var("OPENAI_API_KEY");
}

#[tokio::test]
#[serial]
async fn test_config_file_drives_factory() {
    clear_env();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(tags());
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("router.json");
    std::fs::write(
        &path,
        json!({
            "default_model": "nomic-embed-text:latest",
            "providers": {
                "ollama": { "base_url": server.base_url() },
                "openai": { "enabled": false },
                "anthropic": { "enabled": false }
            },
            "metrics": { "enabled": false }
        })
        .to_string(),
    )
    .unwrap();
    std::env::set_var(CONFIG_ENV, &path);

    let manager = ConfigManager::load().unwrap();
    assert_eq!(manager.path(), Some(path.as_path()));

    let factory = ServiceFactory::new(manager);
    factory.initialize().await;

    assert!(factory.registry().detection_errors().is_empty());
    assert_eq!(
        factory.default_model().as_deref(),
        Some("nomic-embed-text:latest")
    );
    let service = factory.resolve(None).unwrap();
    assert_eq!(service.identity(), ServiceIdentity::Cache);

    std::env::remove_var(CONFIG_ENV);
}
