//! OAuth2/PKCE authentication engine for the Feima editor bridge.
//!
//! Layering, bottom up:
//!   1. [`pkce`] — stateless protocol helpers (authorize URL, code exchange,
//!      refresh, unverified claims decoding).
//!   2. [`callback`] — routes inbound redirect URIs to the flow that is
//!      waiting on them, correlated by the OAuth `state` nonce.
//!   3. [`service`] — owns the persisted session, orchestrates interactive
//!      flows, and emits session-change events.
//!   4. [`provider`] — the thin adapter the host's authentication-provider
//!      registry sees.

pub mod callback;
pub mod error;
pub mod pkce;
pub mod provider;
pub mod service;

pub use callback::{AuthorizationCode, CallbackRouter};
pub use error::AuthError;
pub use provider::AuthProviderAdapter;
pub use service::AuthService;
