//! The model catalog service.
//!
//! Lists are cached for five minutes and cleared whenever authentication
//! state changes; after a sign-in the catalog refetches proactively. A
//! failed fetch keeps whatever was cached before — stale-but-useful beats
//! empty — and a successful fetch replaces all three lists in one state
//! write so readers never observe a partial view.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use feima_auth::AuthService;

use crate::error::CatalogError;
use crate::model::{CatalogResponse, ModelDescriptor, ModelKind};

/// How long a fetched catalog stays fresh.
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Per-request timeout for the catalog endpoint.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 16;

#[derive(Default)]
struct CatalogState {
    chat: Vec<ModelDescriptor>,
    completion: Vec<ModelDescriptor>,
    embeddings: Vec<ModelDescriptor>,
    last_fetch: Option<Instant>,
}

impl CatalogState {
    fn is_empty(&self) -> bool {
        self.chat.is_empty() && self.completion.is_empty() && self.embeddings.is_empty()
    }

    fn is_fresh(&self) -> bool {
        !self.is_empty()
            && self
                .last_fetch
                .map(|at| at.elapsed() < CACHE_TTL)
                .unwrap_or(false)
    }
}

pub struct ModelCatalog {
    auth: Arc<AuthService>,
    client: reqwest::Client,
    state: RwLock<CatalogState>,
    events: broadcast::Sender<()>,
}

impl ModelCatalog {
    /// Build the catalog and start listening to session-change events.
    pub fn new(auth: Arc<AuthService>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let catalog = Arc::new(Self {
            auth: Arc::clone(&auth),
            client: reqwest::Client::new(),
            state: RwLock::new(CatalogState::default()),
            events,
        });

        let weak = Arc::downgrade(&catalog);
        let mut changes = auth.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let Some(catalog) = Weak::upgrade(&weak) else {
                            break;
                        };
                        catalog.on_sessions_changed(&change).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "catalog lagged behind session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        catalog
    }

    /// Model-change notifications, fired whenever the lists may differ.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.events.subscribe()
    }

    async fn on_sessions_changed(&self, change: &feima_core::SessionsChanged) {
        *self.state.write().await = CatalogState::default();
        if !change.added.is_empty() {
            // Best-effort warm-up after sign-in; failures only log.
            self.fetch_if_needed(true).await;
        }
        let _ = self.events.send(());
    }

    /// Fetch the catalog unless a fresh cache exists. Never fails the
    /// caller: fetch errors keep the previous lists.
    pub async fn fetch_if_needed(&self, force: bool) {
        if !force && self.state.read().await.is_fresh() {
            return;
        }

        let token = match self.auth.get_token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("not authenticated; leaving model catalog empty");
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not obtain token for model catalog");
                return;
            }
        };

        // Recover locally from any fetch failure: a stale catalog is more
        // useful than an empty one.
        if let Err(e) = self.fetch(&token).await {
            warn!(error = %e, "model catalog fetch failed; keeping previous lists");
        }
    }

    async fn fetch(&self, token: &str) -> Result<(), CatalogError> {
        let url = self.auth.config().models_url();
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::FetchFailed {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CatalogResponse = response.json().await?;

        let mut fresh = CatalogState {
            last_fetch: Some(Instant::now()),
            ..CatalogState::default()
        };
        for model in parsed.data {
            match model.capabilities.kind {
                ModelKind::Chat => fresh.chat.push(model),
                ModelKind::Completion => fresh.completion.push(model),
                ModelKind::Embeddings => fresh.embeddings.push(model),
                ModelKind::Other => {
                    debug!(id = %model.id, "dropping model with unknown capability type")
                }
            }
        }
        info!(
            chat = fresh.chat.len(),
            completion = fresh.completion.len(),
            embeddings = fresh.embeddings.len(),
            "model catalog updated"
        );

        *self.state.write().await = fresh;
        Ok(())
    }

    pub async fn get_chat_models(&self) -> Vec<ModelDescriptor> {
        self.fetch_if_needed(false).await;
        self.state.read().await.chat.clone()
    }

    pub async fn get_completion_models(&self) -> Vec<ModelDescriptor> {
        self.fetch_if_needed(false).await;
        self.state.read().await.completion.clone()
    }

    pub async fn get_embedding_models(&self) -> Vec<ModelDescriptor> {
        self.fetch_if_needed(false).await;
        self.state.read().await.embeddings.clone()
    }

    /// First completion model the gateway advertises, if any.
    pub async fn default_completion_model(&self) -> Option<ModelDescriptor> {
        self.fetch_if_needed(false).await;
        self.state.read().await.completion.first().cloned()
    }

    /// Chat model lookup by id, used when resolving an endpoint.
    pub async fn find_chat_model(&self, id: &str) -> Option<ModelDescriptor> {
        self.fetch_if_needed(false).await;
        self.state
            .read()
            .await
            .chat
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Drop the cache, fetch now, and notify observers.
    pub async fn refresh_models(&self) {
        self.fetch_if_needed(true).await;
        let _ = self.events.send(());
    }
}
