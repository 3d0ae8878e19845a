//! Host-message → OpenAI-compatible wire translation and request validation.

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::endpoint::ModelInfo;
use crate::error::{ChatError, Result};
use crate::message::{ChatMessage, ChatOptions, ChatPart, ChatRole, ToolMode};

const TEMPERATURE: f64 = 0.7;
const MAX_TOOLS: usize = 128;

/// Fail fast on requests the gateway would reject anyway. Runs before any
/// token is fetched or any byte leaves the process.
pub fn validate_request(messages: &[ChatMessage], options: &ChatOptions) -> Result<()> {
    if messages.is_empty() {
        return Err(ChatError::InvalidRequest("no messages".to_string()));
    }

    for tool in &options.tools {
        let valid = !tool.name.is_empty()
            && tool
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ChatError::InvalidToolName(tool.name.clone()));
        }
    }

    if options.tools.len() > MAX_TOOLS {
        return Err(ChatError::TooManyTools(options.tools.len()));
    }

    if options.tool_mode == ToolMode::Required && options.tools.len() > 1 {
        return Err(ChatError::ToolModeRequiredWithMultipleTools(
            options.tools.len(),
        ));
    }

    validate_tool_pairing(messages)
}

/// Every assistant tool call must be answered by the immediately following
/// user message, whose parts are exclusively tool results (or data parts),
/// with exactly one result per call id and none left over.
fn validate_tool_pairing(messages: &[ChatMessage]) -> Result<()> {
    for (i, msg) in messages.iter().enumerate() {
        if msg.role != ChatRole::Assistant {
            continue;
        }
        let call_ids: HashSet<&str> = msg.tool_calls().map(|c| c.call_id.as_str()).collect();
        if call_ids.is_empty() {
            continue;
        }

        let Some(next) = messages.get(i + 1) else {
            return Err(ChatError::UnmatchedToolCall(
                "assistant tool calls have no following result message".to_string(),
            ));
        };
        if next.role != ChatRole::User {
            return Err(ChatError::UnmatchedToolCall(
                "tool calls must be answered by a user message".to_string(),
            ));
        }

        let mut answered: Vec<&str> = Vec::new();
        for part in &next.parts {
            match part {
                ChatPart::ToolResult(r) => answered.push(r.call_id.as_str()),
                ChatPart::Data(_) => {}
                _ => {
                    return Err(ChatError::UnmatchedToolCall(
                        "result message may only carry tool results and data parts"
                            .to_string(),
                    ))
                }
            }
        }

        for id in &call_ids {
            match answered.iter().filter(|a| *a == id).count() {
                1 => {}
                0 => {
                    return Err(ChatError::UnmatchedToolCall(format!(
                        "tool call {id} has no result"
                    )))
                }
                n => {
                    return Err(ChatError::UnmatchedToolCall(format!(
                        "tool call {id} has {n} results"
                    )))
                }
            }
        }
        for id in &answered {
            if !call_ids.contains(id) {
                return Err(ChatError::UnmatchedToolCall(format!(
                    "result {id} answers no tool call"
                )));
            }
        }
    }
    Ok(())
}

/// Shape the streaming request body.
///
/// Tool results fan out to one `role=tool` message each; assistant turns
/// that called tools carry a `tool_calls` array with their text (or null)
/// as content; everything else is a plain role + concatenated text.
pub fn build_request_body(
    model: &ModelInfo,
    messages: &[ChatMessage],
    options: &ChatOptions,
) -> Value {
    let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        if msg.has_tool_results() {
            for result in msg.tool_results() {
                wire_messages.push(json!({
                    "role": "tool",
                    "tool_call_id": result.call_id,
                    "content": result.text(),
                }));
            }
        } else if msg.role == ChatRole::Assistant && msg.tool_calls().next().is_some() {
            let text = msg.text_content();
            let content = if text.is_empty() { Value::Null } else { json!(text) };
            let tool_calls: Vec<Value> = msg
                .tool_calls()
                .map(|c| {
                    json!({
                        "id": c.call_id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.input.to_string(),
                        }
                    })
                })
                .collect();
            wire_messages.push(json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls,
            }));
        } else {
            let role = match msg.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::System => "system",
            };
            wire_messages.push(json!({
                "role": role,
                "content": msg.text_content(),
            }));
        }
    }

    let mut body = json!({
        "model": model.id,
        "messages": wire_messages,
        "stream": true,
        "temperature": TEMPERATURE,
        "max_tokens": model.max_output_tokens,
    });

    if !options.tools.is_empty() && model.supports_tool_calls {
        let tools: Vec<Value> = options
            .tools
            .iter()
            .map(|t| {
                let mut function = json!({
                    "name": t.name,
                    "description": t.description,
                });
                let has_schema = t
                    .input_schema
                    .as_object()
                    .map(|o| !o.is_empty())
                    .unwrap_or(false);
                if has_schema {
                    function["parameters"] = t.input_schema.clone();
                }
                json!({ "type": "function", "function": function })
            })
            .collect();
        body["tools"] = json!(tools);

        // Pin the choice only for a single required tool; the wire default
        // of `auto` covers everything else.
        if options.tool_mode == ToolMode::Required && options.tools.len() == 1 {
            body["tool_choice"] = json!({
                "type": "function",
                "function": { "name": options.tools[0].name },
            });
        }
    }

    body
}
