//! REST facade over a [`ServiceFactory`].
//!
//! | Method | Path                   | Body                                   |
//! |--------|------------------------|----------------------------------------|
//! | GET    | `/models`              |                                        |
//! | POST   | `/models/refresh`      |                                        |
//! | GET    | `/models/{id}/status`  |                                        |
//! | POST   | `/models/{id}/load`    |                                        |
//! | POST   | `/models/{id}/unload`  |                                        |
//! | POST   | `/complete`            | `{ prompt, model?, options? }`         |
//! | POST   | `/chat`                | `{ messages, model?, options? }`       |
//! | POST   | `/stream`              | `{ prompt \| messages, model?, options? }` |
//! | POST   | `/embed`               | `{ text \| texts, model? }`            |
//! | GET    | `/health`              |                                        |
//! | GET    | `/usage`               |                                        |
//!
//! Errors are returned as `{ "error": { "code", "message", "details" } }`
//! with the status from [`LlmError::http_status`]. Once `/stream` has sent
//! its headers, a failure arrives as an `event: error` frame instead,
//! followed by the usual `data: [DONE]`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::join_all;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::factory::ServiceFactory;
use crate::stream::FragmentStream;
use crate::traits::{ChatMessage, CompletionOptions, EmbeddingOptions, ModelService};

/// Sentinel closing every `/stream` response.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub factory: Arc<ServiceFactory>,
}

impl AppState {
    pub fn new(factory: Arc<ServiceFactory>) -> Self {
        Self { factory }
    }
}

/// [`LlmError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub LlmError);

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "Request failed");
        } else {
            debug!(code = self.0.code(), error = %self.0, "Request rejected");
        }
        (status, Json(error_body(&self.0))).into_response()
    }
}

fn error_body(err: &LlmError) -> Value {
    json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "details": err.details(),
        }
    })
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub options: CompletionOptions,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub options: CompletionOptions,
}

/// `/stream` accepts either a bare prompt or a conversation.
#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub options: CompletionOptions,
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub texts: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Pick the service for a request and pin the model id into its options.
///
/// The body's `model` wins over `options.model`; with neither, the factory
/// default handles the call under its own default model.
fn route(
    factory: &ServiceFactory,
    model: Option<String>,
    mut options: CompletionOptions,
) -> ApiResult<(Arc<dyn ModelService>, CompletionOptions)> {
    let model = model.or_else(|| options.model.take());
    let service = factory.resolve(model.as_deref())?;
    options.model = model;
    Ok((service, options))
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/refresh", post(refresh_models))
        .route("/models/{id}/status", get(model_status))
        .route("/models/{id}/load", post(load_model))
        .route("/models/{id}/unload", post(unload_model))
        .route("/complete", post(complete))
        .route("/chat", post(chat))
        .route("/stream", post(stream_completion))
        .route("/embed", post(embed))
        .route("/health", get(health))
        .route("/usage", get(usage))
        .with_state(state)
}

/// Bind `addr` and serve until ctrl-c.
pub async fn serve(addr: SocketAddr, factory: Arc<ServiceFactory>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Router listening");
    axum::serve(listener, router(AppState::new(factory)))
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutting down"),
                Err(e) => {
                    warn!(error = %e, "No ctrl-c handler; serving until killed");
                    std::future::pending::<()>().await
                }
            }
        })
        .await
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let detection = state.factory.registry().snapshot();
    Json(json!({
        "models": detection.models,
        "default": state.factory.default_model(),
        "errors": detection.errors,
    }))
}

async fn refresh_models(State(state): State<AppState>) -> Json<Value> {
    let services = state.factory.refresh().await;
    Json(json!({
        "services": services,
        "default": state.factory.default_model(),
    }))
}

async fn model_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let service = state.factory.service(&id)?;
    let status = service.model_status(&id).await?;
    Ok(Json(json!(status)))
}

async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.factory.service(&id)?.load_model(&id).await?;
    info!(model = %id, "Model loaded");
    Ok(Json(json!({ "model": id, "status": "loaded" })))
}

async fn unload_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.factory.service(&id)?.unload_model(&id).await?;
    info!(model = %id, "Model unloaded");
    Ok(Json(json!({ "model": id, "status": "unloaded" })))
}

async fn complete(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<Value>> {
    let (service, options) = route(&state.factory, request.model, request.options)?;
    let response = service.complete(&request.prompt, &options).await?;
    Ok(Json(json!(response)))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<Value>> {
    if request.messages.is_empty() {
        return Err(LlmError::InvalidRequest("messages must not be empty".into()).into());
    }
    let (service, options) = route(&state.factory, request.model, request.options)?;
    let response = service.complete_chat(&request.messages, &options).await?;
    Ok(Json(json!(response)))
}

async fn stream_completion(
    State(state): State<AppState>,
    Json(request): Json<StreamRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (service, options) = route(&state.factory, request.model, request.options)?;

    let fragments = match (request.messages, request.prompt) {
        (Some(messages), _) if !messages.is_empty() => {
            service.stream_chat(&messages, &options).await
        }
        (_, Some(prompt)) => service.stream(&prompt, &options).await,
        _ => {
            return Err(
                LlmError::InvalidRequest("either prompt or messages is required".into()).into(),
            )
        }
    };

    Ok(Sse::new(sse_events(fragments)).keep_alive(KeepAlive::default()))
}

/// Mirror a fragment stream as SSE: one `data:` frame per fragment, at most
/// one `event: error` frame, then the `[DONE]` sentinel.
fn sse_events(
    fragments: crate::error::Result<FragmentStream>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let body = match fragments {
        Ok(stream) => stream,
        Err(e) => stream::once(async move { Err::<String, LlmError>(e) }).boxed(),
    };

    body.scan(false, |failed, item| {
        if *failed {
            return futures::future::ready(None);
        }
        let event = match item {
            Ok(text) => Event::default().data(json!({ "text": text }).to_string()),
            Err(e) => {
                *failed = true;
                warn!(code = e.code(), error = %e, "Stream failed");
                Event::default().event("error").data(error_body(&e).to_string())
            }
        };
        futures::future::ready(Some(event))
    })
    .chain(stream::once(async { Event::default().data(DONE_SENTINEL) }))
    .map(Ok)
}

async fn embed(
    State(state): State<AppState>,
    Json(request): Json<EmbedRequest>,
) -> ApiResult<Json<Value>> {
    let service = state.factory.resolve(request.model.as_deref())?;
    let options = EmbeddingOptions {
        model: request.model,
    };

    match (request.text, request.texts) {
        (Some(text), None) => {
            let embedding = service.embed(&text, &options).await?;
            Ok(Json(json!({ "embedding": embedding })))
        }
        (None, Some(texts)) => {
            let embeddings = service.embed_batch(&texts, &options).await?;
            Ok(Json(json!({ "embeddings": embeddings })))
        }
        _ => Err(LlmError::InvalidRequest("exactly one of text or texts is required".into()).into()),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let sources = state.factory.registry().sources();
    let probes = join_all(sources.iter().map(|source| async move {
        (source.provider.to_string(), source.service.is_healthy().await)
    }))
    .await;

    let healthy = probes.iter().filter(|(_, up)| *up).count();
    let providers: serde_json::Map<String, Value> = probes
        .into_iter()
        .map(|(name, up)| (name, Value::Bool(up)))
        .collect();
    let status = match (healthy, state.factory.default_model()) {
        (0, _) | (_, None) => "degraded",
        _ => "ok",
    };

    Json(json!({
        "status": status,
        "providers": providers,
        "models": state.factory.model_ids().len(),
        "default": state.factory.default_model(),
    }))
}

async fn usage(State(state): State<AppState>) -> Json<Value> {
    let store = state.factory.usage();
    Json(json!({
        "summary": store.summary(),
        "providers": store.by_provider(),
        "models": store.snapshot(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(fragments: crate::error::Result<FragmentStream>) -> usize {
        futures::executor::block_on(sse_events(fragments).count())
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body(&LlmError::ModelNotFound {
            model: "gpt-9".into(),
            provider: "openai".into(),
        });
        assert_eq!(body["error"]["code"], "MODEL_NOT_FOUND");
        assert_eq!(body["error"]["details"]["model"], "gpt-9");
    }

    #[test]
    fn test_api_error_status() {
        let response = ApiError(LlmError::RateLimited("slow down".into())).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_sse_frames_end_with_done() {
        let ok: FragmentStream =
            stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]).boxed();
        assert_eq!(frames(Ok(ok)), 3);

        let failing: FragmentStream = stream::iter(vec![
            Ok("a".to_string()),
            Err(LlmError::Timeout),
            Ok("never".to_string()),
        ])
        .boxed();
        assert_eq!(frames(Ok(failing)), 3);

        assert_eq!(frames(Err(LlmError::Timeout)), 2);
    }
}
