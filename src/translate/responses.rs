//! Responses adapter: `/openai/v1/responses`.

use super::chat::error_body as openai_error_body;
use super::responses_types::{self as wire, *};
use super::{empty_object_schema, join_instructions, parse_body, require_model, ProtocolAdapter};
use crate::canonical::{
    self, Chunk, Input, Message, Request, Response, Role, Status, Tool, ToolChoice, Usage,
};
use crate::error::{GatewayError, Result};
use crate::sse::{Frame, FrameEncoder};

use chrono::Utc;

#[derive(Debug, Clone, Copy, Default)]
pub struct Responses;

impl ProtocolAdapter for Responses {
    type Response = ResponseObject;
    type Encoder = ResponsesStreamEncoder;

    fn name(&self) -> &'static str {
        "responses"
    }

    fn decode(&self, body: &[u8]) -> Result<Request> {
        decode_request(body)
    }

    fn encode(&self, response: Response) -> ResponseObject {
        encode_response(response)
    }

    fn stream_encoder(&self, request: &Request) -> ResponsesStreamEncoder {
        ResponsesStreamEncoder::new(&request.model_id)
    }

    fn error_body(&self, error: &GatewayError) -> serde_json::Value {
        openai_error_body(error)
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

pub fn decode_request(body: &[u8]) -> Result<Request> {
    let raw: serde_json::Value = parse_body(body, "responses request")?;
    let stream = raw
        .get("stream")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let req: ResponsesRequest = serde_json::from_value(raw)
        .map_err(|e| GatewayError::malformed(format!("Invalid responses request: {e}")))?;
    require_model(&req.model)?;

    let mut instructions: Vec<String> = req.instructions.into_iter().collect();

    let input = match (req.input, req.input_items) {
        (Some(ResponsesInput::Text(text)), _) => Some(Input::Text(text)),
        (Some(ResponsesInput::Items(items)), _) | (None, Some(items)) => {
            let mut messages = Vec::with_capacity(items.len());
            for item in items {
                decode_item(item.normalize(), &mut instructions, &mut messages);
            }
            Some(Input::Conversation(messages))
        }
        (None, None) => None,
    };
    let input = input.ok_or_else(|| GatewayError::malformed("input or input_items is required"))?;

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t.tool_type == "function")
        .map(|t| Tool {
            name: t.name,
            description: t.description,
            parameter_schema: t.parameters.unwrap_or_else(empty_object_schema),
        })
        .collect();

    let tool_choice = match req.tool_choice {
        None => None,
        Some(ResponsesToolChoice::Mode(mode)) => Some(match mode.as_str() {
            "auto" => ToolChoice::Auto,
            "none" => ToolChoice::None,
            "required" => ToolChoice::Required,
            other => {
                return Err(GatewayError::malformed(format!("Unknown tool_choice: {other}")));
            }
        }),
        Some(ResponsesToolChoice::Function { name, .. }) => Some(ToolChoice::Function { name }),
    };

    Ok(Request {
        model_id: req.model,
        instructions: join_instructions(instructions),
        input,
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: req.max_output_tokens,
        stream,
        tools,
        tool_choice,
    })
}

fn decode_item(item: TypedItem, instructions: &mut Vec<String>, messages: &mut Vec<Message>) {
    match item {
        TypedItem::Message { role, content } => {
            let role = match role {
                ItemRole::System | ItemRole::Developer => {
                    instructions.push(content_text(&content));
                    return;
                }
                ItemRole::User => Role::User,
                ItemRole::Assistant => Role::Assistant,
            };
            match content {
                MessageContent::Text(text) => messages.push(Message::text(role, text)),
                MessageContent::Parts(parts) => {
                    for part in parts {
                        messages.push(match part {
                            InputPart::InputText { text } | InputPart::OutputText { text } => {
                                Message::text(role, text)
                            }
                            InputPart::InputImage { image_url, detail } => {
                                Message::image(role, image_url, detail)
                            }
                        });
                    }
                }
            }
        }
        TypedItem::FunctionCall {
            call_id,
            name,
            arguments,
        } => messages.push(Message::tool_call(call_id, name, arguments)),
        TypedItem::FunctionCallOutput { call_id, output } => {
            messages.push(Message::tool_result(call_id, output));
        }
    }
}

/// Text of a system/developer item. Images carry no instruction text.
fn content_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                InputPart::InputText { text } | InputPart::OutputText { text } => Some(text.as_str()),
                InputPart::InputImage { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn usage_to_wire(usage: Usage) -> ResponsesUsage {
    ResponsesUsage {
        input_tokens: usage.prompt_tokens,
        input_tokens_details: InputTokensDetails::default(),
        output_tokens: usage.completion_tokens,
        output_tokens_details: OutputTokensDetails::default(),
        total_tokens: usage.total_tokens,
    }
}

/// Status reported to the client: the generation is taken as in progress and
/// moved to `failed` or `completed` depending on the upstream outcome.
fn settle_status(upstream: Status) -> Status {
    let current = Status::InProgress;
    let target = if upstream == Status::Failed {
        Status::Failed
    } else {
        Status::Completed
    };
    if current.can_transition_to(target) {
        target
    } else {
        current
    }
}

fn output_items(id: &str, output: &[canonical::OutputItem]) -> Vec<wire::OutputItem> {
    output
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            canonical::OutputItem::Text { text } => wire::OutputItem::Message {
                id: format!("msg_{id}_{i}"),
                role: "assistant".to_string(),
                status: "completed".to_string(),
                content: vec![OutputContent::OutputText {
                    text: text.clone(),
                    annotations: Vec::new(),
                }],
            },
            canonical::OutputItem::ToolCall {
                id: call_id,
                name,
                arguments,
            } => wire::OutputItem::FunctionCall {
                id: format!("fc_{id}_{i}"),
                call_id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
                status: "completed".to_string(),
            },
        })
        .collect()
}

pub fn encode_response(response: Response) -> ResponseObject {
    ResponseObject {
        id: format!("resp_{}", response.id),
        object: "response".to_string(),
        created_at: response.created_at.timestamp(),
        status: settle_status(response.status).as_str().to_string(),
        model: response.model_id.clone(),
        output: output_items(&response.id, &response.output),
        output_text: response.first_text().map(str::to_string),
        usage: response.usage.map(usage_to_wire),
    }
}

/// Emits one `response.*` event per chunk and closes with `[DONE]`.
///
/// Text and tool-call fragments are accumulated so `response.completed`
/// carries the full output.
#[derive(Debug)]
pub struct ResponsesStreamEncoder {
    model: String,
    created: i64,
    text: String,
    tool_calls: Vec<(String, String, String)>,
}

impl ResponsesStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            created: Utc::now().timestamp(),
            text: String::new(),
            tool_calls: Vec::new(),
        }
    }

    fn accumulate(&mut self, chunk: &Chunk) {
        if let Some(text) = chunk.delta.text() {
            self.text.push_str(text);
        }
        if let Some(call) = &chunk.delta.tool_call {
            // A fragment without an id continues the current call.
            let continues = match (&call.id, self.tool_calls.last()) {
                (None, Some(_)) => true,
                (Some(id), Some(last)) => *id == last.0,
                _ => false,
            };
            match self.tool_calls.last_mut() {
                Some(last) if continues => last.2.push_str(&call.arguments_fragment),
                _ => self.tool_calls.push((
                    call.id.clone().unwrap_or_default(),
                    call.name.clone().unwrap_or_default(),
                    call.arguments_fragment.clone(),
                )),
            }
        }
    }

    /// Position of the current call in the `response.completed` output list,
    /// which puts the accumulated message first.
    fn tool_output_index(&self) -> u32 {
        let offset = usize::from(!self.text.is_empty());
        u32::try_from(self.tool_calls.len().saturating_sub(1) + offset).unwrap_or(u32::MAX)
    }

    fn completed(&self, chunk: &Chunk) -> ResponseObject {
        let mut output = Vec::new();
        if !self.text.is_empty() {
            output.push(canonical::OutputItem::Text {
                text: self.text.clone(),
            });
        }
        output.extend(
            self.tool_calls
                .iter()
                .map(|(id, name, arguments)| canonical::OutputItem::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
        );

        encode_response(Response {
            id: chunk.id.clone(),
            model_id: self.model.clone(),
            status: chunk.status,
            output,
            usage: chunk.usage,
            created_at: chrono::DateTime::from_timestamp(self.created, 0).unwrap_or_else(Utc::now),
        })
    }
}

impl FrameEncoder for ResponsesStreamEncoder {
    fn encode_chunk(&mut self, chunk: &Chunk) -> Result<Vec<Frame>> {
        self.accumulate(chunk);

        let event = if chunk.finished {
            ResponsesStreamEvent::Completed {
                response: self.completed(chunk),
            }
        } else if let Some(text) = chunk.delta.text() {
            ResponsesStreamEvent::TextDelta {
                output_index: 0,
                content_index: 0,
                delta: text.to_string(),
            }
        } else if let Some(call) = &chunk.delta.tool_call {
            ResponsesStreamEvent::FunctionCallArgumentsDelta {
                output_index: self.tool_output_index(),
                call_id: call.id.clone(),
                name: call.name.clone(),
                delta: call.arguments_fragment.clone(),
            }
        } else {
            ResponsesStreamEvent::Created {}
        };

        let event_type = event.event_type();
        let envelope = StreamEnvelope {
            id: format!("resp_{}", chunk.id),
            object: "response".to_string(),
            created: self.created,
            event,
        };
        Ok(vec![Frame::json(&envelope)?.with_event(event_type)])
    }

    fn finish(&mut self) -> Vec<Frame> {
        vec![Frame::done()]
    }
}
