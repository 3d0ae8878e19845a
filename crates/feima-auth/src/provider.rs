//! Host-facing authentication provider.
//!
//! The host's provider registry talks to this adapter only; it adds no
//! behavior of its own, so host-API churn never reaches the service.

use std::sync::Arc;

use tokio::sync::broadcast;

use feima_core::{Session, SessionsChanged};

use crate::error::Result;
use crate::service::AuthService;

#[derive(Clone)]
pub struct AuthProviderAdapter {
    service: Arc<AuthService>,
}

impl AuthProviderAdapter {
    pub fn new(service: Arc<AuthService>) -> Self {
        Self { service }
    }

    /// Session-change notifications for the host's account UI.
    pub fn on_sessions_changed(&self) -> broadcast::Receiver<SessionsChanged> {
        self.service.subscribe()
    }

    pub async fn get_sessions(&self) -> Result<Vec<Session>> {
        self.service.get_sessions().await
    }

    pub async fn create_session(&self) -> Result<Session> {
        self.service.create_session().await
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        self.service.remove_session(session_id).await
    }

    pub fn handle_uri(&self, uri: &str) {
        self.service.handle_uri(uri);
    }

    pub fn cached_sessions(&self) -> Vec<Session> {
        self.service.cached_sessions()
    }
}
