//! Host-facing language-model chat provider.
//!
//! Answers the host's model enumeration from the catalog, lazily binds one
//! [`ChatEndpoint`] per model id, and delegates streaming to the wrapper.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use feima_auth::AuthService;
use feima_catalog::{ModelCatalog, ModelDescriptor};

use crate::endpoint::{ChatEndpoint, ModelInfo};
use crate::error::{ChatError, Result};
use crate::message::{ChatMessage, ChatOptions};
use crate::wrapper::{self, ProgressSink};

const EVENT_CAPACITY: usize = 16;

/// Capability flags shown in the host's model picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatModelCapabilities {
    pub image_input: bool,
    pub tool_calling: bool,
}

/// Host-visible projection of a chat model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatModelInformation {
    pub id: String,
    pub name: String,
    pub family: String,
    pub version: String,
    pub tooltip: String,
    /// Billing multiplier as shown next to the model name.
    pub detail: String,
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
    pub is_user_selectable: bool,
    pub capabilities: ChatModelCapabilities,
}

/// Input to token counting: raw text or a whole message.
pub enum TokenContent<'a> {
    Text(&'a str),
    Message(&'a ChatMessage),
}

pub struct ChatModelProvider {
    catalog: Arc<ModelCatalog>,
    auth: Arc<AuthService>,
    /// One endpoint per model id, kept for the provider's lifetime.
    endpoints: DashMap<String, Arc<ChatEndpoint>>,
    events: broadcast::Sender<()>,
}

impl ChatModelProvider {
    /// Build the provider and forward the catalog's change events as our
    /// own so the host re-queries the model list.
    pub fn new(catalog: Arc<ModelCatalog>, auth: Arc<AuthService>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let provider = Arc::new(Self {
            catalog: Arc::clone(&catalog),
            auth,
            endpoints: DashMap::new(),
            events,
        });

        let weak = Arc::downgrade(&provider);
        let mut changes = catalog.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(()) => {
                        let Some(provider) = Weak::upgrade(&weak) else {
                            break;
                        };
                        let _ = provider.events.send(());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "provider lagged behind model events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        provider
    }

    /// Model-change notifications for the host.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.events.subscribe()
    }

    /// Chat models the user may pick, projected for the host.
    pub async fn provide_models(&self) -> Vec<ChatModelInformation> {
        self.catalog
            .get_chat_models()
            .await
            .into_iter()
            .filter(|m| m.model_picker_enabled)
            .map(|m| project_model(&m))
            .collect()
    }

    /// Stream one chat invocation for `model_id` into `sink`.
    pub async fn provide_response(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let endpoint = self.endpoint_for(model_id).await?;
        wrapper::stream_chat_response(&endpoint, messages, options, sink, cancel).await
    }

    /// Token count using the model's tokenizer.
    pub async fn count_tokens(
        &self,
        model_id: &str,
        content: TokenContent<'_>,
    ) -> Result<usize> {
        let endpoint = self.endpoint_for(model_id).await?;
        let count = match content {
            TokenContent::Text(text) => endpoint.count_tokens(text),
            TokenContent::Message(message) => {
                endpoint.count_tokens(&message.text_content())
            }
        };
        Ok(count)
    }

    async fn endpoint_for(&self, model_id: &str) -> Result<Arc<ChatEndpoint>> {
        if let Some(endpoint) = self.endpoints.get(model_id) {
            return Ok(Arc::clone(&endpoint));
        }

        let descriptor = self
            .catalog
            .find_chat_model(model_id)
            .await
            .ok_or_else(|| ChatError::ModelNotFound(model_id.to_string()))?;
        let endpoint = ChatEndpoint::new(ModelInfo::from(&descriptor), Arc::clone(&self.auth));
        self.endpoints
            .insert(model_id.to_string(), Arc::clone(&endpoint));
        Ok(endpoint)
    }
}

fn project_model(model: &ModelDescriptor) -> ChatModelInformation {
    let detail = match model.billing.map(|b| b.multiplier) {
        None => "Free".to_string(),
        Some(m) if m == 0.0 => "Free".to_string(),
        Some(m) => format!("{m}x"),
    };

    ChatModelInformation {
        id: model.id.clone(),
        name: model.name.clone(),
        family: model.capabilities.family.clone(),
        version: model.version.clone(),
        tooltip: format!("{} ({})", model.name, model.capabilities.family),
        detail,
        max_input_tokens: model.capabilities.limits.max_prompt_tokens,
        max_output_tokens: model.capabilities.limits.max_output_tokens,
        is_user_selectable: true,
        capabilities: ChatModelCapabilities {
            image_input: model.capabilities.supports.vision,
            tool_calling: model.capabilities.supports.tool_calls,
        },
    }
}
