//! Bridges endpoint stream deltas to host-visible progress parts.
//!
//! The wrapper owns the per-request emitted-id set: whatever the endpoint
//! sends, a given tool-call id reaches the host at most once, with its
//! arguments parsed and checked. Dropping the delta receiver is the abort
//! signal — the endpoint stops reading as soon as its send fails.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::endpoint::{ChatEndpoint, ChatOutcome};
use crate::error::{ChatError, Result};
use crate::message::{ChatMessage, ChatOptions};
use crate::sse::ChatDelta;

const DELTA_CHANNEL_CAPACITY: usize = 32;

/// A progress part as the host's language-model runtime consumes it.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// The host's progress reporter for one chat invocation.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, part: ResponsePart);
}

/// Run one chat request end to end, emitting progress into `sink`.
///
/// Structured failure outcomes come back as errors carrying the gateway's
/// reason verbatim; partial text already emitted is not retracted.
pub async fn stream_chat_response(
    endpoint: &ChatEndpoint,
    messages: &[ChatMessage],
    options: &ChatOptions,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);

    let request = endpoint.make_chat_request(messages, options, tx, cancel);
    let forward = forward_deltas(rx, sink);
    let (outcome, forwarded) = tokio::join!(request, forward);

    forwarded?;
    match outcome? {
        ChatOutcome::Success { .. } => Ok(()),
        ChatOutcome::Blocked => Err(ChatError::Blocked(
            "requests from this extension are currently rejected".to_string(),
        )),
        ChatOutcome::RateLimited => Err(ChatError::RateLimited(
            "try again in a moment".to_string(),
        )),
        ChatOutcome::QuotaExceeded => Err(ChatError::QuotaExceeded(
            "the account's usage quota is exhausted".to_string(),
        )),
        ChatOutcome::Error { reason } => Err(ChatError::Gateway(reason)),
    }
}

/// Consume deltas until the channel closes. Returning early drops the
/// receiver, which stops the endpoint's stream read.
async fn forward_deltas(
    mut rx: mpsc::Receiver<ChatDelta>,
    sink: &dyn ProgressSink,
) -> Result<()> {
    let mut emitted_ids: HashSet<String> = HashSet::new();

    while let Some(delta) = rx.recv().await {
        if let Some(text) = delta.text {
            if !text.is_empty() {
                sink.emit(ResponsePart::Text(text)).await;
            }
        }

        for call in delta.tool_calls {
            if call.id.is_empty() || call.name.is_empty() {
                warn!("skipping tool call with missing id or name");
                continue;
            }
            if emitted_ids.contains(&call.id) {
                warn!(id = %call.id, "skipping DUPLICATE tool call");
                continue;
            }

            let arguments = call.arguments.trim();
            if !arguments.starts_with('{') && !arguments.starts_with('[') {
                return Err(ChatError::InvalidToolCallArguments(format!(
                    "tool call {} arguments are not JSON: {arguments:.32}",
                    call.id
                )));
            }
            let input: serde_json::Value =
                serde_json::from_str(arguments).map_err(|e| {
                    ChatError::InvalidToolCallArguments(format!(
                        "tool call {} arguments failed to parse: {e}",
                        call.id
                    ))
                })?;
            if !input.is_object() && !input.is_array() {
                return Err(ChatError::InvalidToolCallArguments(format!(
                    "tool call {} arguments are not an object",
                    call.id
                )));
            }

            sink.emit(ResponsePart::ToolCall {
                id: call.id.clone(),
                name: call.name,
                input,
            })
            .await;
            emitted_ids.insert(call.id);
        }
    }

    Ok(())
}
