//! The authentication service: owns the persisted session, orchestrates
//! interactive sign-in flows, and emits session-change events.
//!
//! The secret store is the source of truth — the in-memory slot is only a
//! cache rebuilt from it, so sibling processes and host restarts are always
//! observed. Every read path goes through [`AuthService::get_sessions`],
//! which lazily refreshes an expiring token under a single-flight guard.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use feima_core::{
    BridgeConfig, SecretStore, Session, SessionsChanged, StoredSession, UrlOpener,
};

use crate::callback::CallbackRouter;
use crate::error::{AuthError, Result};
use crate::pkce;

/// The single secret-store key used by the bridge.
pub const STORAGE_KEY: &str = "feimaAuth.tokens";

const EVENT_CAPACITY: usize = 16;

/// Per-flow secrets kept server-side until the redirect returns.
#[derive(Debug, Clone)]
struct FlowState {
    code_verifier: String,
    redirect_uri: String,
}

pub struct AuthService {
    config: BridgeConfig,
    client: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
    opener: Arc<dyn UrlOpener>,
    router: CallbackRouter,
    /// Derived view of the stored record; never authoritative.
    cached: RwLock<Option<Session>>,
    /// Active interactive flows keyed by nonce. Multiple flows may coexist
    /// (a retry after a closed browser starts a fresh one).
    flows: DashMap<String, FlowState>,
    events: broadcast::Sender<SessionsChanged>,
    /// Serializes the lazy-refresh path so concurrent callers cannot both
    /// spend the same refresh token.
    refresh_gate: Mutex<()>,
}

impl AuthService {
    /// Build the service and warm the cache slot from the secret store in
    /// the background. No event is fired for the initial load; the host
    /// polls `get_sessions` on startup.
    pub fn new(
        config: BridgeConfig,
        secrets: Arc<dyn SecretStore>,
        opener: Arc<dyn UrlOpener>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let service = Arc::new(Self {
            config,
            client: reqwest::Client::new(),
            secrets,
            opener,
            router: CallbackRouter::new(),
            cached: RwLock::new(None),
            flows: DashMap::new(),
            events,
            refresh_gate: Mutex::new(()),
        });

        let warm = Arc::clone(&service);
        tokio::spawn(async move {
            warm.prime_cache().await;
        });

        service
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Subscribe to session-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionsChanged> {
        self.events.subscribe()
    }

    async fn prime_cache(&self) {
        match self.read_stored().await {
            Ok(Some(stored)) => {
                let session = Session::from_stored(&stored);
                *self.cached.write().await = Some(session);
                debug!("cached session restored from secret store");
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "could not restore session at startup"),
        }
    }

    async fn read_stored(&self) -> Result<Option<StoredSession>> {
        match self.secrets.get(STORAGE_KEY).await? {
            None => Ok(None),
            Some(blob) => serde_json::from_str(&blob)
                .map(Some)
                .map_err(|e| AuthError::StoredTokenCorrupted(e.to_string())),
        }
    }

    async fn write_stored(&self, stored: &StoredSession) -> Result<()> {
        let blob = serde_json::to_string(stored)?;
        self.secrets.store(STORAGE_KEY, &blob).await?;
        Ok(())
    }

    async fn clear_stored(&self) -> Result<()> {
        self.secrets.delete(STORAGE_KEY).await?;
        *self.cached.write().await = None;
        Ok(())
    }

    /// Current sessions (zero or one), consulting the secret store every
    /// time and refreshing the access token when less than five minutes of
    /// life remain.
    ///
    /// A failed refresh or a corrupted record signs the user out locally:
    /// the record is discarded and the empty list returned, with no event —
    /// observers learn about it on their next query.
    pub async fn get_sessions(&self) -> Result<Vec<Session>> {
        let _flight = self.refresh_gate.lock().await;

        let stored = match self.read_stored().await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                *self.cached.write().await = None;
                return Ok(Vec::new());
            }
            Err(AuthError::StoredTokenCorrupted(e)) => {
                warn!(error = %e, "discarding corrupted token record");
                self.clear_stored().await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now().timestamp_millis();
        let refresh_due = pkce::should_refresh(&stored.token_response, stored.issued_at, now);

        if refresh_due {
            if let Some(refresh_token) = stored.token_response.refresh_token.clone() {
                return self.refresh_stored(stored, &refresh_token).await;
            }
            debug!("token expiring with no refresh token; serving as-is");
        }

        let session = Session::from_stored(&stored);
        *self.cached.write().await = Some(session.clone());
        Ok(vec![session])
    }

    async fn refresh_stored(
        &self,
        stored: StoredSession,
        refresh_token: &str,
    ) -> Result<Vec<Session>> {
        match pkce::refresh_access_token(&self.client, &self.config, refresh_token).await {
            Ok(response) => {
                let merged = response.merged_with(&stored.token_response);
                let renewed = StoredSession {
                    token_response: merged,
                    issued_at: Utc::now().timestamp_millis(),
                    ..stored
                };
                self.write_stored(&renewed).await?;
                let session = Session::from_stored(&renewed);
                *self.cached.write().await = Some(session.clone());
                info!(account = %renewed.account_label, "access token refreshed");
                Ok(vec![session])
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed; signing out locally");
                self.clear_stored().await?;
                Ok(Vec::new())
            }
        }
    }

    /// Bearer token for API calls, refreshing first when due.
    pub async fn get_token(&self) -> Result<Option<String>> {
        Ok(self
            .get_sessions()
            .await?
            .into_iter()
            .next()
            .map(|s| s.access_token))
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(self.get_token().await, Ok(Some(_)))
    }

    /// Force the lazy-refresh path to run now.
    pub async fn refresh_token(&self) -> Result<Vec<Session>> {
        self.get_sessions().await
    }

    /// Run one interactive browser sign-in to completion.
    pub async fn create_session(&self) -> Result<Session> {
        let redirect_uri = self.config.redirect_uri();
        let auth_request = pkce::build_authorization_url(&self.config, &redirect_uri);
        let nonce = auth_request.nonce.clone();

        self.flows.insert(
            nonce.clone(),
            FlowState {
                code_verifier: auth_request.code_verifier.clone(),
                redirect_uri,
            },
        );
        let callback = self.router.register(&nonce);

        let result = self.run_flow(&nonce, &auth_request.url, callback).await;

        // The flow entry must not outlive the attempt, whatever happened.
        self.flows.remove(&nonce);
        result
    }

    async fn run_flow(
        &self,
        nonce: &str,
        authorize_url: &str,
        callback: tokio::sync::oneshot::Receiver<
            std::result::Result<crate::callback::AuthorizationCode, AuthError>,
        >,
    ) -> Result<Session> {
        info!("starting interactive sign-in");
        if let Err(e) = self.opener.open_external(authorize_url).await {
            self.router.cancel(nonce);
            return Err(AuthError::CannotOpenBrowser(e.to_string()));
        }

        let authorization = callback
            .await
            .map_err(|_| AuthError::CallbackTimedOut)??;

        let flow = self
            .flows
            .get(nonce)
            .map(|entry| entry.value().clone())
            .ok_or(AuthError::FlowStateLost)?;

        let token = pkce::exchange_code(
            &self.client,
            &self.config,
            &authorization.code,
            &flow.code_verifier,
            &flow.redirect_uri,
        )
        .await?;

        let now = Utc::now().timestamp_millis();
        let claims = pkce::decode_claims(&token).unwrap_or_default();
        let account_id = claims.sub.unwrap_or_else(|| format!("user-{now}"));
        let account_label = claims
            .email
            .or(claims.name)
            .unwrap_or_else(|| "Unknown User".to_string());

        let stored = StoredSession {
            token_response: token,
            issued_at: now,
            session_id: Uuid::new_v4().to_string(),
            account_id,
            account_label,
        };
        self.write_stored(&stored).await?;

        let session = Session::from_stored(&stored);
        *self.cached.write().await = Some(session.clone());
        let _ = self.events.send(SessionsChanged::added(session.clone()));
        info!(account = %session.account.label, "signed in");

        Ok(session)
    }

    /// Sign out the session with the given id. Unknown ids are a no-op.
    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        let stored = match self.read_stored().await {
            Ok(stored) => stored,
            Err(AuthError::StoredTokenCorrupted(e)) => {
                warn!(error = %e, "discarding corrupted token record on sign-out");
                self.clear_stored().await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(stored) = stored else {
            return Ok(());
        };
        if stored.session_id != session_id {
            debug!("remove_session id does not match stored session; ignoring");
            return Ok(());
        }

        let snapshot = Session::from_stored(&stored);
        self.clear_stored().await?;
        let _ = self.events.send(SessionsChanged::removed(snapshot));
        info!("signed out");
        Ok(())
    }

    /// Forward an inbound redirect URI to whichever flow is waiting on it.
    pub fn handle_uri(&self, uri: &str) {
        self.router.handle_uri(uri);
    }

    /// Non-blocking read of the cache slot, for UI queries that must not
    /// touch the secret store.
    pub fn cached_sessions(&self) -> Vec<Session> {
        match self.cached.try_read() {
            Ok(slot) => slot.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of sign-in flows currently awaiting their redirect.
    pub fn active_flow_count(&self) -> usize {
        self.flows.len()
    }
}
