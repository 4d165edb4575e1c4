//! HTTP surface: routes, shared state, and the generic generation handler.

use crate::error::GatewayError;
use crate::sse::{event_stream_response, frame_stream};
use crate::translate::anthropic::{self, Messages};
use crate::translate::chat::{self, ChatCompletions};
use crate::translate::responses::Responses;
use crate::translate::ProtocolAdapter;
use crate::upstream::{GenerationClient, ModelCatalog, RequestContext};
use crate::usage::{UsageRecord, UsageSink};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Collaborators wired into the gateway. Any of them may be absent; routes
/// that need a missing one answer 500.
#[derive(Clone, Default)]
pub struct GatewayOptions {
    pub upstream: Option<Arc<dyn GenerationClient>>,
    pub catalog: Option<Arc<dyn ModelCatalog>>,
    pub usage_sink: Option<Arc<dyn UsageSink>>,
}

impl GatewayOptions {
    pub fn with_upstream(mut self, upstream: Arc<dyn GenerationClient>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }
}

#[derive(Clone, Default)]
pub struct AppState {
    options: GatewayOptions,
}

impl AppState {
    pub fn new(options: GatewayOptions) -> Self {
        Self { options }
    }

    fn upstream(&self) -> Result<&Arc<dyn GenerationClient>, GatewayError> {
        self.options
            .upstream
            .as_ref()
            .ok_or(GatewayError::NotConfigured {
                component: "upstream client",
            })
    }

    fn catalog(&self) -> Result<&Arc<dyn ModelCatalog>, GatewayError> {
        self.options
            .catalog
            .as_ref()
            .ok_or(GatewayError::NotConfigured {
                component: "model catalog",
            })
    }

    fn record_usage(&self, record: UsageRecord) {
        if let Some(sink) = &self.options.usage_sink {
            sink.record(record);
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/openai/v1/chat/completions", post(handle_chat_completions))
        .route("/openai/v1/responses", post(handle_responses))
        .route("/openai/v1/models", get(handle_openai_models))
        .route("/anthropic/v1/messages", post(handle_messages))
        .route("/anthropic/v1/models", get(handle_anthropic_models))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_generation(ChatCompletions, state, headers, body).await
}

async fn handle_responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_generation(Responses, state, headers, body).await
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_generation(Messages, state, headers, body).await
}

fn error_response<A: ProtocolAdapter>(adapter: &A, err: &GatewayError) -> Response {
    (err.status_code(), Json(adapter.error_body(err))).into_response()
}

/// Header gate, decode, then one upstream call in streaming or single-shot form.
async fn handle_generation<A: ProtocolAdapter>(
    adapter: A,
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = adapter.check_headers(&headers) {
        warn!(protocol = adapter.name(), error = %e, "Rejected request headers");
        return error_response(&adapter, &e);
    }

    let upstream = match state.upstream() {
        Ok(u) => Arc::clone(u),
        Err(e) => {
            error!(protocol = adapter.name(), "No upstream client configured");
            return error_response(&adapter, &e);
        }
    };

    let request = match adapter.decode(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(protocol = adapter.name(), error = %e, "Failed to decode request");
            return error_response(&adapter, &e);
        }
    };

    let ctx = RequestContext::new();
    // Cancels the context if this handler or the streaming body is dropped.
    let guard = ctx.cancel_on_drop();

    info!(
        protocol = adapter.name(),
        request_id = %ctx.request_id,
        model = %request.model_id,
        stream = request.stream,
        messages = request.messages().len(),
        "Request"
    );

    let model_id = request.model_id.clone();
    let started = Instant::now();

    if request.stream {
        let encoder = adapter.stream_encoder(&request);
        return match upstream.generate_stream(&ctx, request).await {
            Ok(chunks) => event_stream_response(frame_stream(chunks, encoder, Some(guard))),
            Err(e) => {
                error!(request_id = %ctx.request_id, error = %e, "Streaming setup failed");
                state.record_usage(UsageRecord::new(model_id, None, "failed", started.elapsed()));
                error_response(&adapter, &e.into_upstream())
            }
        };
    }

    let result = upstream.generate(&ctx, request).await;
    let latency = started.elapsed();

    match result {
        Ok(response) => {
            state.record_usage(UsageRecord::new(
                model_id,
                response.usage,
                response.status.as_str(),
                latency,
            ));
            Json(adapter.encode(response)).into_response()
        }
        Err(e) => {
            error!(request_id = %ctx.request_id, error = %e, "Upstream generation failed");
            state.record_usage(UsageRecord::new(model_id, None, "failed", latency));
            error_response(&adapter, &e.into_upstream())
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_openai_models(State(state): State<Arc<AppState>>) -> Response {
    let catalog = match state.catalog() {
        Ok(c) => c,
        Err(e) => return error_response(&ChatCompletions, &e),
    };
    match catalog.list_models(&RequestContext::new()).await {
        Ok(models) => Json(chat::encode_models(&models)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list models");
            error_response(&ChatCompletions, &e.into_upstream())
        }
    }
}

async fn handle_anthropic_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = Messages.check_headers(&headers) {
        return error_response(&Messages, &e);
    }
    let catalog = match state.catalog() {
        Ok(c) => c,
        Err(e) => return error_response(&Messages, &e),
    };
    match catalog.list_models(&RequestContext::new()).await {
        Ok(models) => Json(anthropic::encode_models(&models)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list models");
            error_response(&Messages, &e.into_upstream())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{EchoClient, StaticModelCatalog};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn call(router: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn echo_router() -> Router {
        build_router(Arc::new(AppState::new(
            GatewayOptions::default()
                .with_upstream(Arc::new(EchoClient))
                .with_catalog(Arc::new(StaticModelCatalog::default())),
        )))
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(
            echo_router(),
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_chat_round_trip_through_echo() {
        let (status, body) = call(
            echo_router(),
            post_json(
                "/openai/v1/chat/completions",
                serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "ping pong"}]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "ping pong");
    }

    #[tokio::test]
    async fn test_missing_upstream_is_500() {
        let router = build_router(Arc::new(AppState::default()));
        let (status, body) = call(
            router,
            post_json(
                "/openai/v1/responses",
                serde_json::json!({"model": "m", "input": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["type"], "api_error");
    }

    #[tokio::test]
    async fn test_missing_catalog_is_500() {
        let router = build_router(Arc::new(AppState::default()));
        let (status, body) = call(
            router,
            Request::get("/anthropic/v1/models").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["type"], "error");
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let (status, body) = call(
            echo_router(),
            Request::post("/anthropic/v1/messages")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }
}
