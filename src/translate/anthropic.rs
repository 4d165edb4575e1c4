//! Messages adapter: `/anthropic/v1/messages`.
//!
//! A single Anthropic message can expand into several canonical messages:
//! every content block becomes its own message, in block order, and
//! `tool_result` blocks become `tool`-role messages.

use super::anthropic_types::{self as wire, *};
use super::{empty_object_schema, join_instructions, parse_body, require_model, ProtocolAdapter};
use crate::canonical::{self, Chunk, Input, Request, Response, ToolChoice};
use crate::error::{GatewayError, Result};
use crate::sse::{Frame, FrameEncoder};
use crate::upstream::Model;

use axum::http::HeaderMap;

pub const VERSION_HEADER: &str = "anthropic-version";

/// Accepted `anthropic-version` values, oldest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["2023-01-01", "2023-06-01"];

/// Version assumed when the header is absent.
pub const LATEST_VERSION: &str = "2023-06-01";

/// Resolve the requested protocol version against the whitelist.
pub fn resolve_version(requested: Option<&str>) -> Result<&'static str> {
    match requested {
        None => Ok(LATEST_VERSION),
        Some(v) => SUPPORTED_VERSIONS
            .iter()
            .copied()
            .find(|known| *known == v.trim())
            .ok_or_else(|| GatewayError::invalid_version(v)),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Messages;

impl ProtocolAdapter for Messages {
    type Response = MessagesResponse;
    type Encoder = MessagesStreamEncoder;

    fn name(&self) -> &'static str {
        "messages"
    }

    fn check_headers(&self, headers: &HeaderMap) -> Result<()> {
        let requested = match headers.get(VERSION_HEADER) {
            None => None,
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| GatewayError::invalid_version(String::from_utf8_lossy(value.as_bytes())))?,
            ),
        };
        let version = resolve_version(requested)?;
        tracing::debug!(version, "Anthropic version accepted");
        Ok(())
    }

    fn decode(&self, body: &[u8]) -> Result<Request> {
        decode_request(body)
    }

    fn encode(&self, response: Response) -> MessagesResponse {
        encode_response(response)
    }

    fn stream_encoder(&self, _request: &Request) -> MessagesStreamEncoder {
        MessagesStreamEncoder::default()
    }

    fn error_body(&self, error: &GatewayError) -> serde_json::Value {
        error_body(error)
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

pub fn decode_request(body: &[u8]) -> Result<Request> {
    let req: MessagesRequest = parse_body(body, "messages request")?;
    require_model(&req.model)?;
    if req.messages.is_empty() {
        return Err(GatewayError::malformed("messages must not be empty"));
    }

    let mut messages = Vec::new();
    for msg in req.messages {
        translate_message(msg, &mut messages);
    }

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| canonical::Tool {
            name: t.name,
            description: t.description,
            parameter_schema: t.input_schema.unwrap_or_else(empty_object_schema),
        })
        .collect();

    let tool_choice = req.tool_choice.map(translate_tool_choice).transpose()?;

    Ok(Request {
        model_id: req.model,
        instructions: join_instructions(req.system.iter().map(SystemContent::as_text).collect()),
        input: Input::Conversation(messages),
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: Some(req.max_tokens),
        stream: req.stream.unwrap_or(false),
        tools,
        tool_choice,
    })
}

fn translate_message(msg: wire::Message, out: &mut Vec<canonical::Message>) {
    let role = match msg.role {
        wire::Role::User => canonical::Role::User,
        wire::Role::Assistant => canonical::Role::Assistant,
    };

    for block in msg.content.into_blocks() {
        match block {
            ContentBlock::Text { text } => out.push(canonical::Message::text(role, text)),
            ContentBlock::Image { source } => {
                let url = match source {
                    ImageSource::Base64 { media_type, data } => {
                        format!("data:{media_type};base64,{data}")
                    }
                    ImageSource::Url { url } => url,
                };
                out.push(canonical::Message::image(role, url, None));
            }
            ContentBlock::ToolUse { id, name, input } => {
                out.push(canonical::Message::tool_call(id, name, input.to_string()));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let text = content.as_ref().map(ToolResultContent::as_text).unwrap_or_default();
                if is_error == Some(true) {
                    tracing::debug!(tool_use_id = %tool_use_id, "Tool result flagged as error");
                }
                out.push(canonical::Message::tool_result(tool_use_id, text));
            }
            ContentBlock::Thinking { .. } => {}
        }
    }
}

fn translate_tool_choice(choice: wire::ToolChoice) -> Result<ToolChoice> {
    let (kind, name) = match choice {
        wire::ToolChoice::Mode(mode) => (mode, None),
        wire::ToolChoice::Specific(s) => (s.choice_type, s.name),
    };
    match (kind.as_str(), name) {
        ("auto", _) => Ok(ToolChoice::Auto),
        ("any", _) => Ok(ToolChoice::Required),
        ("none", _) => Ok(ToolChoice::None),
        ("tool", Some(name)) => Ok(ToolChoice::Function { name }),
        ("tool", None) => Err(GatewayError::malformed("tool_choice of type tool needs a name")),
        (other, _) => Err(GatewayError::malformed(format!("Unknown tool_choice: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

pub fn encode_response(response: Response) -> MessagesResponse {
    let content = response
        .output
        .into_iter()
        .map(|item| match item {
            canonical::OutputItem::Text { text } => ResponseContentBlock::Text { text },
            canonical::OutputItem::ToolCall {
                id,
                name,
                arguments,
            } => {
                // Arguments that are not valid JSON are passed through as a string.
                let input = serde_json::from_str(&arguments)
                    .unwrap_or(serde_json::Value::String(arguments));
                ResponseContentBlock::ToolUse { id, name, input }
            }
        })
        .collect();

    let usage = response.usage.unwrap_or_default();

    MessagesResponse {
        id: format!("msg_{}", response.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: response.model_id,
        stop_reason: Some("end_turn".to_string()),
        stop_sequence: None,
        usage: wire::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    }
}

pub fn error_body(error: &GatewayError) -> serde_json::Value {
    serde_json::to_value(ErrorResponse::new(error.error_type(), error.client_message()))
        .unwrap_or_default()
}

pub fn encode_models(models: &[Model]) -> ModelList {
    let data: Vec<ModelInfo> = models
        .iter()
        .map(|m| ModelInfo {
            id: m.id.clone(),
            model_type: "model".to_string(),
            display_name: m.display_name.clone(),
            created_at: m.created.to_rfc3339(),
        })
        .collect();

    ModelList {
        first_id: data.first().map(|m| m.id.clone()),
        last_id: data.last().map(|m| m.id.clone()),
        data,
        has_more: false,
    }
}

/// Emits `content_block_delta` events and exactly one `message_stop`.
#[derive(Debug, Default)]
pub struct MessagesStreamEncoder {
    stopped: bool,
}

impl MessagesStreamEncoder {
    fn frame(event: &StreamEvent) -> Result<Frame> {
        Ok(Frame::json(event)?.with_event(event.event_name()))
    }
}

impl FrameEncoder for MessagesStreamEncoder {
    fn encode_chunk(&mut self, chunk: &Chunk) -> Result<Vec<Frame>> {
        if self.stopped {
            return Ok(Vec::new());
        }

        if chunk.finished {
            self.stopped = true;
            let usage = chunk.usage.map(|u| StopUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });
            return Ok(vec![Self::frame(&StreamEvent::MessageStop { usage })?]);
        }

        let delta = if let Some(text) = chunk.delta.text() {
            Delta::TextDelta {
                text: text.to_string(),
            }
        } else if let Some(call) = &chunk.delta.tool_call {
            Delta::InputJsonDelta {
                id: call.id.clone(),
                name: call.name.clone(),
                partial_json: call.arguments_fragment.clone(),
            }
        } else {
            return Ok(Vec::new());
        };

        Ok(vec![Self::frame(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta,
        })?])
    }

    fn finish(&mut self) -> Vec<Frame> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        match Self::frame(&StreamEvent::MessageStop { usage: None }) {
            Ok(frame) => vec![frame],
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode message_stop");
                Vec::new()
            }
        }
    }
}
