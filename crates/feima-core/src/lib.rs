//! Shared foundation for the Feima editor bridge: effective configuration,
//! host-runtime contracts, and the session data model.

pub mod config;
pub mod error;
pub mod host;
pub mod session;

pub use config::BridgeConfig;
pub use error::CoreError;
pub use host::{HostError, InMemorySecretStore, SecretStore, UrlOpener};
pub use session::{
    AccountInfo, Session, SessionsChanged, StoredSession, TokenResponse,
};
