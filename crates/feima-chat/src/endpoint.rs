//! Per-model chat endpoint: request shaping, dispatch, and error
//! classification for `POST /chat/completions`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use feima_auth::AuthService;
use feima_catalog::ModelDescriptor;

use crate::error::Result;
use crate::message::{ChatMessage, ChatOptions};
use crate::sse::{self, ChatDelta, StreamUsage};
use crate::tokenizer;
use crate::wire;

/// Gateway requests are abandoned after thirty seconds.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The slice of a model descriptor a chat request needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub family: String,
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
    pub supports_tool_calls: bool,
    pub supports_vision: bool,
}

impl From<&ModelDescriptor> for ModelInfo {
    fn from(descriptor: &ModelDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            family: descriptor.capabilities.family.clone(),
            max_input_tokens: descriptor.capabilities.limits.max_prompt_tokens,
            max_output_tokens: descriptor.capabilities.limits.max_output_tokens,
            supports_tool_calls: descriptor.capabilities.supports.tool_calls,
            supports_vision: descriptor.capabilities.supports.vision,
        }
    }
}

/// Structured result of a chat request. Validation failures are `Err`; the
/// gateway's verdict on an otherwise well-formed request lands here.
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    Success { usage: Option<StreamUsage> },
    Blocked,
    RateLimited,
    QuotaExceeded,
    Error { reason: String },
}

pub struct ChatEndpoint {
    info: ModelInfo,
    auth: Arc<AuthService>,
    client: reqwest::Client,
}

impl ChatEndpoint {
    /// Build the endpoint and warm the auth cache in the background so the
    /// first request does not pay the secret-store read.
    pub fn new(info: ModelInfo, auth: Arc<AuthService>) -> Arc<Self> {
        let endpoint = Arc::new(Self {
            info,
            auth: Arc::clone(&auth),
            client: reqwest::Client::new(),
        });

        tokio::spawn(async move {
            if let Err(e) = auth.get_sessions().await {
                debug!(error = %e, "token prefetch failed");
            }
        });

        endpoint
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Validate, send, and stream one chat request. Deltas flow through
    /// `tx`; the returned outcome describes how the request ended.
    pub async fn make_chat_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: mpsc::Sender<ChatDelta>,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome> {
        wire::validate_request(messages, options)?;

        let token = match self.auth.get_token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                return Ok(ChatOutcome::Error {
                    reason: "Not authenticated".to_string(),
                })
            }
            Err(e) => {
                warn!(error = %e, "could not obtain token for chat request");
                return Ok(ChatOutcome::Error {
                    reason: "Not authenticated".to_string(),
                });
            }
        };

        let body = wire::build_request_body(&self.info, messages, options);
        let url = self.auth.config().chat_completions_url();
        debug!(model = %self.info.id, "sending chat request");

        let response = match self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header("Content-Type", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "chat request transport failure");
                return Ok(ChatOutcome::Error {
                    reason: e.to_string(),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Ok(self.classify_failure(response).await);
        }

        if response.content_length() == Some(0) {
            return Ok(ChatOutcome::Error {
                reason: "No response body".to_string(),
            });
        }

        match sse::process_chat_stream(response, &tx, cancel).await {
            Ok(usage) => Ok(ChatOutcome::Success { usage }),
            Err(e) => Ok(ChatOutcome::Error {
                reason: e.to_string(),
            }),
        }
    }

    async fn classify_failure(&self, response: reqwest::Response) -> ChatOutcome {
        let status = response.status().as_u16();
        match status {
            403 => {
                if let Some(retry_after) = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                {
                    warn!(retry_after, "chat request blocked by gateway");
                } else {
                    warn!("chat request blocked by gateway");
                }
                ChatOutcome::Blocked
            }
            429 => {
                let quota_header = response
                    .headers()
                    .get("x-error-type")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == "quota_exceeded")
                    .unwrap_or(false);
                let body = response.text().await.unwrap_or_default();
                if quota_header || body.to_lowercase().contains("quota") {
                    warn!(body = %body, "chat quota exceeded");
                    ChatOutcome::QuotaExceeded
                } else {
                    warn!(body = %body, "chat request rate limited");
                    ChatOutcome::RateLimited
                }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                warn!(status, body = %body, "chat request failed");
                ChatOutcome::Error {
                    reason: format!("HTTP {status}: {body}"),
                }
            }
        }
    }

    /// Token count for budget math, keyed by this model's family.
    pub fn count_tokens(&self, text: &str) -> usize {
        tokenizer::count_tokens(&self.info.family, text)
    }
}
