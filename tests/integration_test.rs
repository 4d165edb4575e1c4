use async_trait::async_trait;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use modelgate::canonical::{Chunk, OutputItem, Request, Response, Status, Usage};
use modelgate::upstream::{EchoClient, Model, StaticModelCatalog};
use modelgate::{
    build_router, AppState, ChunkStream, GatewayError, GatewayOptions, GenerationClient,
    RequestContext, UsageRecord, UsageSink,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Step {
    Chunk(Chunk),
    Fail,
}

/// Upstream that replays a fixed script, or fails both calls up front.
struct ScriptedClient {
    steps: Vec<Step>,
    failure: Option<fn() -> GatewayError>,
}

impl ScriptedClient {
    fn streaming(steps: Vec<Step>) -> Self {
        Self {
            steps,
            failure: None,
        }
    }

    fn failing() -> Self {
        Self {
            steps: Vec::new(),
            failure: Some(|| GatewayError::upstream("vendor exploded: secret-token-123")),
        }
    }

    /// Fails with a client-side error kind, as a vendor rejecting the call would.
    fn rejecting() -> Self {
        Self {
            steps: Vec::new(),
            failure: Some(|| GatewayError::malformed("vendor rejected key sk-secret-999")),
        }
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn generate(&self, ctx: &RequestContext, request: Request) -> modelgate::Result<Response> {
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        Ok(Response {
            id: ctx.request_id.clone(),
            model_id: request.model_id,
            status: Status::Completed,
            output: vec![OutputItem::Text {
                text: "Hello".to_string(),
            }],
            usage: Some(Usage::new(2, 1)),
            created_at: Utc::now(),
        })
    }

    async fn generate_stream(&self, _ctx: &RequestContext, _request: Request) -> modelgate::Result<ChunkStream> {
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        let items: Vec<modelgate::Result<Chunk>> = self
            .steps
            .iter()
            .cloned()
            .map(|step| match step {
                Step::Chunk(c) => Ok(c),
                Step::Fail => Err(GatewayError::upstream("connection reset")),
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Upstream that streams forever until dropped.
struct EndlessClient {
    released: Arc<AtomicBool>,
}

struct ReleaseFlag(Arc<AtomicBool>);

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationClient for EndlessClient {
    async fn generate(&self, _ctx: &RequestContext, _request: Request) -> modelgate::Result<Response> {
        Err(GatewayError::upstream("streaming only"))
    }

    async fn generate_stream(&self, ctx: &RequestContext, _request: Request) -> modelgate::Result<ChunkStream> {
        let flag = ReleaseFlag(self.released.clone());
        let ctx = ctx.clone();
        let stream = async_stream::stream! {
            let _flag = flag;
            let mut n = 0u64;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
                n += 1;
                yield Ok::<Chunk, GatewayError>(Chunk::text("endless", format!("tick{n} ")));
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageSink for RecordingSink {
    fn record(&self, record: UsageRecord) {
        self.records.lock().unwrap().push(record);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn spawn(options: GatewayOptions) -> SocketAddr {
    let app = build_router(Arc::new(AppState::new(options)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

fn with_upstream(client: impl GenerationClient + 'static) -> GatewayOptions {
    GatewayOptions::default().with_upstream(Arc::new(client))
}

fn hello_script() -> Vec<Step> {
    vec![
        Step::Chunk(Chunk::text("c1", "Hel")),
        Step::Chunk(Chunk::finish("c1", Some(Usage::new(1, 1))).with_text("lo")),
    ]
}

/// POST `body` and collect every SSE event as `(event, data)`.
async fn sse_events(
    addr: SocketAddr,
    path: &str,
    body: serde_json::Value,
) -> (reqwest::header::HeaderMap, Vec<(String, String)>) {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let headers = resp.headers().clone();

    let events = resp
        .bytes_stream()
        .eventsource()
        .map(|e| {
            let e = e.unwrap();
            (e.event, e.data)
        })
        .collect()
        .await;
    (headers, events)
}

fn chat_stream_body() -> serde_json::Value {
    serde_json::json!({
        "model": "m",
        "stream": true,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

// ---------------------------------------------------------------------------
// Chat completions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chat_stream_example_produces_three_frames() {
    let addr = spawn(with_upstream(ScriptedClient::streaming(hello_script()))).await;

    let (headers, events) = sse_events(addr, "/openai/v1/chat/completions", chat_stream_body()).await;

    assert_eq!(headers["content-type"], "text/event-stream");
    assert_eq!(headers["cache-control"], "no-cache");
    assert_eq!(events.len(), 3);

    let first: serde_json::Value = serde_json::from_str(&events[0].1).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
    assert!(first["choices"][0]["finish_reason"].is_null());

    let second: serde_json::Value = serde_json::from_str(&events[1].1).unwrap();
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
    assert_eq!(
        second["usage"],
        serde_json::json!({"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2})
    );

    assert_eq!(events[2].1, "[DONE]");
}

#[tokio::test]
async fn test_chat_zero_chunk_stream_sends_only_done() {
    let addr = spawn(with_upstream(ScriptedClient::streaming(Vec::new()))).await;

    let (_, events) = sse_events(addr, "/openai/v1/chat/completions", chat_stream_body()).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "[DONE]");
}

#[tokio::test]
async fn test_chat_mid_stream_error_still_sends_done_once() {
    let addr = spawn(with_upstream(ScriptedClient::streaming(vec![
        Step::Chunk(Chunk::text("c1", "partial")),
        Step::Fail,
        Step::Chunk(Chunk::text("c1", "never")),
    ])))
    .await;

    let (_, events) = sse_events(addr, "/openai/v1/chat/completions", chat_stream_body()).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events.iter().filter(|(_, d)| d == "[DONE]").count(), 1);
    assert!(!events.iter().any(|(_, d)| d.contains("never")));
}

#[tokio::test]
async fn test_upstream_failure_is_opaque_and_recorded() {
    let sink = Arc::new(RecordingSink::default());
    let addr = spawn(with_upstream(ScriptedClient::failing()).with_usage_sink(sink.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/openai/v1/chat/completions"))
        .json(&serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "internal error");
    assert!(!body.to_string().contains("secret-token-123"));

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/openai/v1/chat/completions"))
        .json(&chat_stream_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "internal error");

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 2);
    for record in records.iter() {
        assert_eq!(record.status, "failed");
        assert_eq!(record.usage, None);
        assert_eq!(record.model_id, "m");
    }
}

#[tokio::test]
async fn test_upstream_client_error_kind_is_still_500() {
    let addr = spawn(with_upstream(ScriptedClient::rejecting())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/openai/v1/chat/completions"))
        .json(&serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "api_error");
    assert_eq!(body["error"]["message"], "internal error");
    assert!(!body.to_string().contains("sk-secret-999"));

    let resp = client
        .post(format!("http://{addr}/anthropic/v1/messages"))
        .json(&messages_body(true))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "api_error");
    assert!(!body.to_string().contains("sk-secret-999"));
}

#[tokio::test]
async fn test_non_streaming_success_is_recorded() {
    let sink = Arc::new(RecordingSink::default());
    let addr = spawn(
        with_upstream(ScriptedClient::streaming(Vec::new())).with_usage_sink(sink.clone()),
    )
    .await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/openai/v1/chat/completions"))
        .json(&serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "completed");
    assert_eq!(records[0].usage, Some(Usage::new(2, 1)));
}

#[tokio::test]
async fn test_no_upstream_is_500() {
    let addr = spawn(GatewayOptions::default()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/openai/v1/chat/completions"))
        .json(&serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
}

#[tokio::test]
async fn test_malformed_chat_body_is_400() {
    let addr = spawn(with_upstream(EchoClient)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/openai/v1/chat/completions"))
        .json(&serde_json::json!({"model": "m", "messages": [{"role": "narrator", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_responses_stream_ends_with_done() {
    let addr = spawn(with_upstream(ScriptedClient::streaming(hello_script()))).await;

    let (_, events) = sse_events(
        addr,
        "/openai/v1/responses",
        serde_json::json!({"model": "m", "input": "hi", "stream": true}),
    )
    .await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].0, "response.text.delta");
    let completed: serde_json::Value = serde_json::from_str(&events[1].1).unwrap();
    assert_eq!(completed["type"], "response.completed");
    assert_eq!(completed["response"]["usage"]["total_tokens"], 2);
    assert_eq!(events[2].1, "[DONE]");
}

#[tokio::test]
async fn test_responses_zero_chunk_stream_sends_only_done() {
    let addr = spawn(with_upstream(ScriptedClient::streaming(Vec::new()))).await;

    let (_, events) = sse_events(
        addr,
        "/openai/v1/responses",
        serde_json::json!({"model": "m", "input": "hi", "stream": true}),
    )
    .await;

    assert_eq!(events.iter().filter(|(_, d)| d == "[DONE]").count(), 1);
    assert_eq!(events.last().unwrap().1, "[DONE]");
    assert!(!events.iter().any(|(e, _)| e == "response.text.delta"));
}

#[tokio::test]
async fn test_responses_non_streaming_through_echo() {
    let addr = spawn(with_upstream(EchoClient)).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/openai/v1/responses"))
        .json(&serde_json::json!({
            "model": "echo-1",
            "input": [{"role": "user", "content": [{"type": "input_text", "text": "echo me"}]}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "response");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output_text"], "echo me");
}

// ---------------------------------------------------------------------------
// Anthropic messages
// ---------------------------------------------------------------------------

fn messages_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "m",
        "max_tokens": 32,
        "stream": stream,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[tokio::test]
async fn test_anthropic_stream_single_message_stop_no_done() {
    let addr = spawn(with_upstream(ScriptedClient::streaming(hello_script()))).await;

    let (_, events) = sse_events(addr, "/anthropic/v1/messages", messages_body(true)).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "content_block_delta");
    assert_eq!(events.iter().filter(|(e, _)| e == "message_stop").count(), 1);
    assert!(events.iter().all(|(_, d)| d != "[DONE]"));

    let stop: serde_json::Value = serde_json::from_str(&events[1].1).unwrap();
    assert_eq!(stop["usage"]["total_tokens"], 2);
}

#[tokio::test]
async fn test_anthropic_stream_without_terminal_chunk_still_stops() {
    let addr = spawn(with_upstream(ScriptedClient::streaming(vec![
        Step::Chunk(Chunk::text("c1", "partial")),
        Step::Fail,
    ])))
    .await;

    let (_, events) = sse_events(addr, "/anthropic/v1/messages", messages_body(true)).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[1].0, "message_stop");
}

#[tokio::test]
async fn test_anthropic_zero_chunk_stream_single_message_stop() {
    let addr = spawn(with_upstream(ScriptedClient::streaming(Vec::new()))).await;

    let (_, events) = sse_events(addr, "/anthropic/v1/messages", messages_body(true)).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "message_stop");
    assert!(events.iter().all(|(_, d)| d != "[DONE]"));
}

#[tokio::test]
async fn test_anthropic_no_upstream_is_500() {
    let addr = spawn(GatewayOptions::default()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/anthropic/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "api_error");
}

#[tokio::test]
async fn test_anthropic_version_gate() {
    let addr = spawn(with_upstream(EchoClient)).await;
    let client = reqwest::Client::new();

    for version in ["2023-01-01", "2023-06-01"] {
        let resp = client
            .post(format!("http://{addr}/anthropic/v1/messages"))
            .header("anthropic-version", version)
            .json(&messages_body(false))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "version {version}");
    }

    for version in ["2022-01-01", "latest", "v1"] {
        let resp = client
            .post(format!("http://{addr}/anthropic/v1/messages"))
            .header("anthropic-version", version)
            .json(&messages_body(false))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "version {version}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }
}

#[tokio::test]
async fn test_anthropic_bad_version_rejected_before_decode() {
    let addr = spawn(with_upstream(EchoClient)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/anthropic/v1/messages"))
        .header("anthropic-version", "1999-12-31")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("1999-12-31"));
}

#[tokio::test]
async fn test_anthropic_non_streaming() {
    let addr = spawn(with_upstream(EchoClient)).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/anthropic/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "hi");
    assert_eq!(body["stop_reason"], "end_turn");
}

// ---------------------------------------------------------------------------
// Models, health, cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_model_lists() {
    let catalog = StaticModelCatalog::new(vec![Model {
        id: "echo-1".to_string(),
        owned_by: "modelgate".to_string(),
        display_name: "Echo One".to_string(),
        created: Utc::now(),
    }]);
    let addr = spawn(GatewayOptions::default().with_catalog(Arc::new(catalog))).await;
    let client = reqwest::Client::new();

    let openai: serde_json::Value = client
        .get(format!("http://{addr}/openai/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(openai["object"], "list");
    assert_eq!(openai["data"][0]["id"], "echo-1");

    let anthropic: serde_json::Value = client
        .get(format!("http://{addr}/anthropic/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(anthropic["has_more"], false);
    assert_eq!(anthropic["data"][0]["display_name"], "Echo One");
}

#[tokio::test]
async fn test_models_without_catalog_is_500() {
    let addr = spawn(GatewayOptions::default()).await;

    let resp = reqwest::get(format!("http://{addr}/openai/v1/models")).await.unwrap();
    assert_eq!(resp.status(), 500);
}

#[tokio::test]
async fn test_health() {
    let addr = spawn(GatewayOptions::default()).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_client_disconnect_releases_upstream() {
    let released = Arc::new(AtomicBool::new(false));
    let addr = spawn(with_upstream(EndlessClient {
        released: released.clone(),
    }))
    .await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/openai/v1/chat/completions"))
        .json(&chat_stream_body())
        .send()
        .await
        .unwrap();
    let mut events = resp.bytes_stream().eventsource();
    let first = events.next().await.unwrap().unwrap();
    assert!(first.data.contains("tick1"));
    drop(events);

    let mut waited = 0;
    while !released.load(Ordering::SeqCst) && waited < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    assert!(released.load(Ordering::SeqCst), "upstream stream was not released");
}
