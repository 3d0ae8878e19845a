use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid tool name: {0:?}")]
    InvalidToolName(String),

    #[error("too many tools: {0} (maximum 128)")]
    TooManyTools(usize),

    #[error("required tool mode needs exactly one tool, got {0}")]
    ToolModeRequiredWithMultipleTools(usize),

    #[error("unmatched tool call: {0}")]
    UnmatchedToolCall(String),

    #[error("invalid tool call arguments: {0}")]
    InvalidToolCallArguments(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("the extension is blocked by the model gateway: {0}")]
    Blocked(String),

    #[error("rate limited by the model gateway: {0}")]
    RateLimited(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    Gateway(String),

    #[error("stream error: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
