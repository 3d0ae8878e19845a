use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization callback timed out")]
    CallbackTimedOut,

    #[error("authorization server returned an error: {0}")]
    ServerReturnedError(String),

    #[error("malformed callback: {0}")]
    MalformedCallback(String),

    #[error("cannot open browser: {0}")]
    CannotOpenBrowser(String),

    #[error("authorization flow state was lost before the token exchange")]
    FlowStateLost,

    #[error("token exchange failed ({status}): {body}")]
    TokenExchangeFailed { status: u16, body: String },

    #[error("token refresh failed ({status}): {body}")]
    TokenRefreshFailed { status: u16, body: String },

    #[error("stored token record is corrupted: {0}")]
    StoredTokenCorrupted(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("secret store error: {0}")]
    SecretStore(#[from] feima_core::HostError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
