//! Chat-request pipeline: translates host chat messages to the gateway's
//! OpenAI-compatible wire form, streams the response, reassembles tool-call
//! fragments, and emits host-typed progress parts.

pub mod endpoint;
pub mod error;
pub mod message;
pub mod provider;
pub mod sse;
pub mod tokenizer;
pub mod wire;
pub mod wrapper;

pub use endpoint::{ChatEndpoint, ChatOutcome, ModelInfo};
pub use error::ChatError;
pub use message::{
    ChatMessage, ChatOptions, ChatPart, ChatRole, DataPart, ToolCallPart,
    ToolDefinition, ToolMode, ToolResultPart,
};
pub use provider::{ChatModelInformation, ChatModelProvider, TokenContent};
pub use sse::{ChatDelta, CompletedToolCall, StreamUsage};
pub use wrapper::{ProgressSink, ResponsePart};
