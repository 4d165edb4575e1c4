//! Chat-completions adapter: `/openai/v1/chat/completions`.

use super::chat_types::*;
use super::{empty_object_schema, join_instructions, parse_body, require_model, ProtocolAdapter};
use crate::canonical::{
    Chunk, Input, Message, Request, Response, Role, Tool, ToolChoice, Usage,
};
use crate::error::{GatewayError, Result};
use crate::sse::{Frame, FrameEncoder};
use crate::upstream::Model;

use chrono::Utc;

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCompletions;

impl ProtocolAdapter for ChatCompletions {
    type Response = ChatCompletionResponse;
    type Encoder = ChatStreamEncoder;

    fn name(&self) -> &'static str {
        "chat_completions"
    }

    fn decode(&self, body: &[u8]) -> Result<Request> {
        decode_request(body)
    }

    fn encode(&self, response: Response) -> ChatCompletionResponse {
        encode_response(response)
    }

    fn stream_encoder(&self, request: &Request) -> ChatStreamEncoder {
        ChatStreamEncoder::new(&request.model_id)
    }

    fn error_body(&self, error: &GatewayError) -> serde_json::Value {
        error_body(error)
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Parse a chat-completions body into a canonical request.
pub fn decode_request(body: &[u8]) -> Result<Request> {
    let raw: serde_json::Value = parse_body(body, "chat completion request")?;
    // Anything other than a literal boolean means non-streaming.
    let stream = raw
        .get("stream")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let req: ChatCompletionRequest = serde_json::from_value(raw)
        .map_err(|e| GatewayError::malformed(format!("Invalid chat completion request: {e}")))?;
    require_model(&req.model)?;
    if req.messages.is_empty() {
        return Err(GatewayError::malformed("messages must not be empty"));
    }

    let mut instructions = Vec::new();
    let mut messages = Vec::with_capacity(req.messages.len());

    for msg in req.messages {
        match msg {
            ChatMessage::System { content, .. } | ChatMessage::Developer { content, .. } => {
                instructions.push(content.as_text());
            }
            ChatMessage::User { content, .. } => match content {
                UserContent::Text(text) => messages.push(Message::text(Role::User, text)),
                UserContent::Parts(parts) => {
                    for part in parts {
                        messages.push(match part {
                            ContentPart::Text { text } => Message::text(Role::User, text),
                            ContentPart::ImageUrl { image_url } => match image_url {
                                ImageUrl::Url(url) => Message::image(Role::User, url, None),
                                ImageUrl::Detail(d) => Message::image(Role::User, d.url, d.detail),
                            },
                        });
                    }
                }
            },
            ChatMessage::Assistant {
                content, tool_calls, ..
            } => {
                if let Some(content) = content {
                    let text = content.as_text();
                    if !text.is_empty() {
                        messages.push(Message::text(Role::Assistant, text));
                    }
                }
                for call in tool_calls.unwrap_or_default() {
                    messages.push(Message::tool_call(
                        call.id,
                        call.function.name,
                        call.function.arguments,
                    ));
                }
            }
            ChatMessage::Tool {
                content,
                tool_call_id,
            } => messages.push(Message::tool_result(tool_call_id, content.as_text())),
        }
    }

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| Tool {
            name: t.function.name,
            description: t.function.description,
            parameter_schema: t.function.parameters.unwrap_or_else(empty_object_schema),
        })
        .collect();

    let tool_choice = req.tool_choice.map(decode_tool_choice).transpose()?;

    Ok(Request {
        model_id: req.model,
        instructions: join_instructions(instructions),
        input: Input::Conversation(messages),
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
        stream,
        tools,
        tool_choice,
    })
}

fn decode_tool_choice(choice: ChatToolChoice) -> Result<ToolChoice> {
    match choice {
        ChatToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Ok(ToolChoice::Auto),
            "none" => Ok(ToolChoice::None),
            "required" => Ok(ToolChoice::Required),
            other => Err(GatewayError::malformed(format!("Unknown tool_choice: {other}"))),
        },
        ChatToolChoice::Specific(s) => Ok(ToolChoice::Function {
            name: s.function.name,
        }),
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn usage_to_chat(usage: Usage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

pub fn encode_response(response: Response) -> ChatCompletionResponse {
    let tool_calls: Vec<ChatToolCall> = response
        .tool_calls()
        .map(|(id, name, arguments)| ChatToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: ChatToolCallFunction {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        })
        .collect();

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", response.id),
        object: "chat.completion".to_string(),
        created: response.created_at.timestamp(),
        model: response.model_id.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: response.first_text().map(str::to_string),
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: response.usage.map(usage_to_chat),
    }
}

pub fn error_body(error: &GatewayError) -> serde_json::Value {
    serde_json::to_value(ChatErrorResponse {
        error: ChatError {
            message: error.client_message(),
            error_type: error.error_type().to_string(),
            code: None,
        },
    })
    .unwrap_or_default()
}

/// Model list shared by both OpenAI routes.
pub fn encode_models(models: &[Model]) -> ModelList {
    ModelList {
        object: "list".to_string(),
        data: models
            .iter()
            .map(|m| ModelObject {
                id: m.id.clone(),
                object: "model".to_string(),
                created: m.created.timestamp(),
                owned_by: m.owned_by.clone(),
            })
            .collect(),
    }
}

/// Turns canonical chunks into `chat.completion.chunk` frames, closing with `[DONE]`.
#[derive(Debug)]
pub struct ChatStreamEncoder {
    model: String,
    created: i64,
    sent_role: bool,
    tool_index: Option<u32>,
    last_tool_id: Option<String>,
}

impl ChatStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            created: Utc::now().timestamp(),
            sent_role: false,
            tool_index: None,
            last_tool_id: None,
        }
    }

    fn tool_delta(&mut self, chunk: &Chunk) -> Option<Vec<ChunkToolCall>> {
        let call = chunk.delta.tool_call.as_ref()?;
        // A new id opens the next tool call slot.
        if call.id.is_some() && call.id != self.last_tool_id {
            self.tool_index = Some(self.tool_index.map_or(0, |i| i + 1));
            self.last_tool_id = call.id.clone();
        }
        let index = self.tool_index.unwrap_or(0);
        Some(vec![ChunkToolCall {
            index,
            id: call.id.clone(),
            call_type: call.id.as_ref().map(|_| "function".to_string()),
            function: Some(ChunkToolCallFunction {
                name: call.name.clone(),
                arguments: Some(call.arguments_fragment.clone()),
            }),
        }])
    }
}

impl FrameEncoder for ChatStreamEncoder {
    fn encode_chunk(&mut self, chunk: &Chunk) -> Result<Vec<Frame>> {
        let (delta, finish_reason, usage) = if chunk.finished {
            (
                ChunkDelta::default(),
                Some("stop".to_string()),
                chunk.usage.map(usage_to_chat),
            )
        } else {
            let role = if self.sent_role {
                None
            } else {
                self.sent_role = true;
                Some("assistant".to_string())
            };
            let delta = ChunkDelta {
                role,
                content: chunk.delta.text.clone(),
                tool_calls: self.tool_delta(chunk),
            };
            (delta, None, None)
        };

        let envelope = ChatCompletionChunk {
            id: format!("chatcmpl-{}", chunk.id),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        };
        Ok(vec![Frame::json(&envelope)?])
    }

    fn finish(&mut self) -> Vec<Frame> {
        vec![Frame::done()]
    }
}
