//! Session data model: the IdP token response, the persisted record, and the
//! host-facing projection.

use serde::{Deserialize, Serialize};

/// Token endpoint response (authorization_code or refresh_token grant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl TokenResponse {
    /// Fold a refresh response into the previous token set. A refresh grant
    /// may omit `refresh_token`; the stored one must survive.
    pub fn merged_with(self, previous: &TokenResponse) -> TokenResponse {
        TokenResponse {
            refresh_token: self
                .refresh_token
                .or_else(|| previous.refresh_token.clone()),
            ..self
        }
    }
}

/// The single record persisted under the `feimaAuth.tokens` secret key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub token_response: TokenResponse,
    /// Millisecond timestamp observed locally when the tokens were issued.
    pub issued_at: i64,
    pub session_id: String,
    pub account_id: String,
    pub account_label: String,
}

impl StoredSession {
    /// Expiry in millis, when the IdP reported a lifetime.
    pub fn expires_at(&self) -> Option<i64> {
        self.token_response
            .expires_in
            .map(|secs| self.issued_at + secs as i64 * 1000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    pub label: String,
}

/// Host-facing view of the authenticated session.
///
/// `scopes` is always empty by contract: the bridge does not segment tokens
/// by scope, and the host treats the list as informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub access_token: String,
    pub account: AccountInfo,
    pub scopes: Vec<String>,
}

impl Session {
    pub fn from_stored(stored: &StoredSession) -> Self {
        Self {
            id: stored.session_id.clone(),
            access_token: stored.token_response.access_token.clone(),
            account: AccountInfo {
                id: stored.account_id.clone(),
                label: stored.account_label.clone(),
            },
            scopes: Vec::new(),
        }
    }
}

/// Payload of the session-change event.
#[derive(Debug, Clone, Default)]
pub struct SessionsChanged {
    pub added: Vec<Session>,
    pub removed: Vec<Session>,
}

impl SessionsChanged {
    pub fn added(session: Session) -> Self {
        Self {
            added: vec![session],
            removed: Vec::new(),
        }
    }

    pub fn removed(session: Session) -> Self {
        Self {
            added: Vec::new(),
            removed: vec![session],
        }
    }
}
