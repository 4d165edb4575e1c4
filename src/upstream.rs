//! Collaborators the adapters depend on: the generation backend and the model catalog.
//!
//! The gateway never talks to a model vendor itself. Whatever performs the
//! generation implements [`GenerationClient`]; the catalog behind the
//! list-models routes implements [`ModelCatalog`].

use crate::canonical::{Chunk, Content, Input, OutputItem, Request, Response, Role, Status, Usage};
use crate::error::{GatewayError, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

/// A finite, non-restartable sequence of chunks. Dropping it releases the upstream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk>> + Send>>;

/// Per-request context handed to collaborators.
///
/// The cancellation token fires when the inbound request goes away (the
/// handler future or the streaming body is dropped).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Cancels this context when the returned guard is dropped.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancellation.clone().drop_guard()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, ctx: &RequestContext, request: Request) -> Result<Response>;

    async fn generate_stream(&self, ctx: &RequestContext, request: Request) -> Result<ChunkStream>;
}

/// An entry of the model catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub owned_by: String,
    pub display_name: String,
    pub created: DateTime<Utc>,
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn list_models(&self, ctx: &RequestContext) -> Result<Vec<Model>>;
}

/// Catalog backed by a fixed list, usually loaded from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticModelCatalog {
    models: Vec<Model>,
}

impl StaticModelCatalog {
    pub fn new(models: Vec<Model>) -> Self {
        Self { models }
    }
}

#[async_trait]
impl ModelCatalog for StaticModelCatalog {
    async fn list_models(&self, _ctx: &RequestContext) -> Result<Vec<Model>> {
        Ok(self.models.clone())
    }
}

/// Loopback backend that answers with the caller's own last user text.
///
/// Streams the reply one word per chunk. Token counts are whitespace-separated
/// words, which is enough for smoke-testing clients against the gateway.
#[derive(Debug, Clone, Default)]
pub struct EchoClient;

impl EchoClient {
    fn reply(request: &Request) -> String {
        match &request.input {
            Input::Text(text) => text.clone(),
            Input::Conversation(messages) => messages
                .iter()
                .rev()
                .find_map(|m| match (&m.role, &m.content) {
                    (Role::User, Content::Text { text }) => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_default(),
        }
    }

    fn usage(request: &Request, reply: &str) -> Usage {
        let prompt = match &request.input {
            Input::Text(text) => word_count(text),
            Input::Conversation(messages) => messages
                .iter()
                .map(|m| match &m.content {
                    Content::Text { text } => word_count(text),
                    _ => 0,
                })
                .sum(),
        };
        Usage::new(prompt, word_count(reply))
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

fn truncate_words(text: &str, max: Option<u64>) -> String {
    match max {
        Some(max) => text
            .split_whitespace()
            .take(usize::try_from(max).unwrap_or(usize::MAX))
            .collect::<Vec<_>>()
            .join(" "),
        None => text.to_string(),
    }
}

#[async_trait]
impl GenerationClient for EchoClient {
    async fn generate(&self, ctx: &RequestContext, request: Request) -> Result<Response> {
        if ctx.is_cancelled() {
            return Err(GatewayError::upstream("request cancelled"));
        }

        let reply = truncate_words(&Self::reply(&request), request.max_output_tokens);
        let usage = Self::usage(&request, &reply);

        Ok(Response {
            id: ctx.request_id.clone(),
            model_id: request.model_id,
            status: Status::Completed,
            output: vec![OutputItem::Text { text: reply }],
            usage: Some(usage),
            created_at: Utc::now(),
        })
    }

    async fn generate_stream(&self, ctx: &RequestContext, request: Request) -> Result<ChunkStream> {
        let reply = truncate_words(&Self::reply(&request), request.max_output_tokens);
        let usage = Self::usage(&request, &reply);
        let id = ctx.request_id.clone();
        let ctx = ctx.clone();

        let stream = async_stream::stream! {
            let mut cancelled = false;
            for (i, word) in reply.split_whitespace().enumerate() {
                if ctx.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let text = if i == 0 { word.to_string() } else { format!(" {word}") };
                yield Ok::<Chunk, GatewayError>(Chunk::text(id.clone(), text));
            }
            if cancelled {
                tracing::debug!(request_id = %id, "Echo stream cancelled");
            } else {
                yield Ok::<Chunk, GatewayError>(Chunk::finish(id.clone(), Some(usage)));
            }
        };

        Ok(Box::pin(stream))
    }
}
