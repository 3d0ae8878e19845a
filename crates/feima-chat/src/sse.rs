//! Server-Sent Events parsing for the chat-completions stream.
//!
//! The body arrives as arbitrary byte chunks; a rolling buffer retains the
//! last incomplete line across reads. Text deltas are forwarded the moment
//! they arrive; tool-call fragments are accumulated by index and released
//! only once complete, so a call is never emitted twice within a request.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};

/// One unit of streamed progress handed to the wrapper.
#[derive(Debug, Clone, Default)]
pub struct ChatDelta {
    pub text: Option<String>,
    pub tool_calls: Vec<CompletedToolCall>,
}

/// A fully assembled tool invocation; `arguments` is the raw JSON string
/// accumulated from fragments, validated by the wrapper before emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StreamUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// Wire shapes of a streaming chunk.

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    index: u64,
    id: Option<String>,
    function: Option<FunctionChunk>,
}

#[derive(Deserialize)]
struct FunctionChunk {
    name: Option<String>,
    arguments: Option<String>,
}

/// Splits a byte stream into lines, keeping the trailing incomplete line.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buf: String,
}

impl SseLineBuffer {
    pub(crate) fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut lines: Vec<String> = self.buf.split('\n').map(String::from).collect();
        self.buf = lines.pop().unwrap_or_default();
        lines
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns SSE lines into [`ChatDelta`]s, assembling tool calls on the way.
#[derive(Default)]
pub(crate) struct DeltaAssembler {
    calls: BTreeMap<u64, PartialToolCall>,
    pub(crate) usage: Option<StreamUsage>,
    pub(crate) finished: bool,
}

impl DeltaAssembler {
    /// Process one line of the stream and return the deltas it produced.
    pub(crate) fn handle_line(&mut self, line: &str) -> Vec<ChatDelta> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return Vec::new();
        }
        let Some(payload) = line.strip_prefix("data:") else {
            return Vec::new();
        };
        let payload = payload.trim();

        if payload == "[DONE]" {
            self.finished = true;
            return self.flush().into_iter().collect();
        }

        let chunk: StreamChunk = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "skipping unparseable stream event");
                return Vec::new();
            }
        };

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Vec::new();
        };

        let mut deltas = Vec::new();

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                deltas.push(ChatDelta {
                    text: Some(content),
                    tool_calls: Vec::new(),
                });
            }
        }

        if let Some(fragments) = choice.delta.tool_calls {
            for fragment in fragments {
                let entry = self.calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    if entry.id.is_empty() {
                        entry.id = id;
                    }
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        if entry.name.is_empty() {
                            entry.name = name;
                        }
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
        }

        if choice.finish_reason.is_some() && !self.calls.is_empty() {
            deltas.extend(self.flush());
        }

        deltas
    }

    /// Release accumulated complete calls and clear the map so nothing can
    /// be emitted a second time. Entries still missing an id or name are
    /// dropped as incomplete.
    pub(crate) fn flush(&mut self) -> Option<ChatDelta> {
        let drained = std::mem::take(&mut self.calls);
        let complete: Vec<CompletedToolCall> = drained
            .into_values()
            .filter_map(|call| {
                if call.id.is_empty() || call.name.is_empty() {
                    debug!("dropping incomplete tool call fragment");
                    return None;
                }
                Some(CompletedToolCall {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                })
            })
            .collect();

        if complete.is_empty() {
            None
        } else {
            Some(ChatDelta {
                text: None,
                tool_calls: complete,
            })
        }
    }
}

/// Consume a chat-completions SSE body, forwarding deltas to `tx`.
///
/// Returns usage when the gateway reported it on the final chunk. A closed
/// receiver or a tripped cancellation token stops the read; the response
/// body (and its connection) is released by dropping the stream.
pub(crate) async fn process_chat_stream(
    response: reqwest::Response,
    tx: &mpsc::Sender<ChatDelta>,
    cancel: &CancellationToken,
) -> Result<Option<StreamUsage>> {
    let mut lines = SseLineBuffer::default();
    let mut assembler = DeltaAssembler::default();
    let mut byte_stream = response.bytes_stream();

    'read: loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("chat stream cancelled");
                return Ok(assembler.usage);
            }
            chunk = byte_stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk.map_err(|e| ChatError::Stream(e.to_string()))?;
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        for line in lines.push(text) {
            for delta in assembler.handle_line(&line) {
                if tx.send(delta).await.is_err() {
                    // Receiver dropped: the wrapper aborted the request.
                    debug!("delta receiver dropped; stopping stream read");
                    return Ok(assembler.usage);
                }
            }
            if assembler.finished {
                break 'read;
            }
        }
    }

    // A stream that ended without [DONE] still owes its accumulated calls.
    if let Some(delta) = assembler.flush() {
        let _ = tx.send(delta).await;
    }

    Ok(assembler.usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(assembler: &mut DeltaAssembler, lines: &[&str]) -> Vec<ChatDelta> {
        lines
            .iter()
            .flat_map(|l| assembler.handle_line(l))
            .collect()
    }

    #[test]
    fn line_buffer_retains_incomplete_tail() {
        let mut buf = SseLineBuffer::default();
        assert!(buf.push("data: {\"a\"").is_empty());
        let lines = buf.push(":1}\ndata: x\nda");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: x"]);
        let lines = buf.push("ta: y\n");
        assert_eq!(lines, vec!["data: y"]);
    }

    #[test]
    fn text_deltas_are_emitted_immediately() {
        let mut assembler = DeltaAssembler::default();
        let deltas = collect(
            &mut assembler,
            &[
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
                "data: [DONE]",
            ],
        );
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].text.as_deref(), Some("Hel"));
        assert_eq!(deltas[1].text.as_deref(), Some("lo"));
        assert!(assembler.finished);
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        let mut assembler = DeltaAssembler::default();
        assert!(assembler.handle_line("").is_empty());
        assert!(assembler.handle_line(": keep-alive").is_empty());
        assert!(assembler.handle_line("event: ping").is_empty());
    }

    #[test]
    fn unparseable_json_is_skipped_and_stream_continues() {
        let mut assembler = DeltaAssembler::default();
        let deltas = collect(
            &mut assembler,
            &[
                "data: {garbage",
                r#"data: {"choices":[{"delta":{"content":"ok"}}]}"#,
            ],
        );
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].text.as_deref(), Some("ok"));
    }

    #[test]
    fn chunk_without_choices_is_ignored() {
        let mut assembler = DeltaAssembler::default();
        assert!(assembler
            .handle_line(r#"data: {"choices":[]}"#)
            .is_empty());
    }

    #[test]
    fn single_tool_call_is_assembled_from_fragments() {
        // Scenario: one declared tool, arguments split across two events.
        let mut assembler = DeltaAssembler::default();
        let deltas = collect(
            &mut assembler,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tc_1","function":{"name":"search","arguments":"{\"q\":"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"hi\"}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );
        assert_eq!(deltas.len(), 1);
        assert!(deltas[0].text.is_none());
        assert_eq!(
            deltas[0].tool_calls,
            vec![CompletedToolCall {
                id: "tc_1".into(),
                name: "search".into(),
                arguments: r#"{"q":"hi"}"#.into(),
            }]
        );
    }

    #[test]
    fn parallel_tool_calls_keep_their_indices() {
        let mut assembler = DeltaAssembler::default();
        let deltas = collect(
            &mut assembler,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"one","arguments":"{}"}},{"index":1,"id":"b","function":{"name":"two","arguments":"{}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ],
        );
        assert_eq!(deltas.len(), 1);
        let ids: Vec<&str> = deltas[0].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn finish_reason_flush_clears_map_so_done_does_not_reemit() {
        let mut assembler = DeltaAssembler::default();
        let deltas = collect(
            &mut assembler,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tc_1","function":{"name":"f","arguments":"{}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );
        let emissions: usize = deltas.iter().map(|d| d.tool_calls.len()).sum();
        assert_eq!(emissions, 1);
    }

    #[test]
    fn stream_end_without_done_still_flushes_once() {
        let mut assembler = DeltaAssembler::default();
        collect(
            &mut assembler,
            &[r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tc_1","function":{"name":"f","arguments":"{}"}}]}}]}"#],
        );
        // No finish_reason, no [DONE]: caller flushes at end of stream.
        let flushed = assembler.flush().unwrap();
        assert_eq!(flushed.tool_calls.len(), 1);
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn incomplete_calls_are_never_released() {
        let mut assembler = DeltaAssembler::default();
        collect(
            &mut assembler,
            // Arguments but never an id or name.
            &[r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"x\":1}"}}]}}]}"#],
        );
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn usage_is_captured_from_final_chunk() {
        let mut assembler = DeltaAssembler::default();
        collect(
            &mut assembler,
            &[r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":3}}"#],
        );
        let usage = assembler.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 3);
    }
}
