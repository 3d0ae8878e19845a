use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Effective bridge configuration (feima.toml + FEIMA_* env overrides).
///
/// The bridge treats this as a read-only value source: it is loaded once at
/// activation and never re-read. Endpoint URLs are derived from the two base
/// URLs so that callers never concatenate paths by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Base URL of the identity provider (no trailing slash).
    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,
    /// Base URL of the model gateway (no trailing slash).
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// OAuth public client identifier. No client secret exists (PKCE only).
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// OAuth scopes requested at sign-in, space-joined on the wire.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Custom URI scheme registered with the editor host.
    #[serde(default = "default_redirect_scheme")]
    pub redirect_scheme: String,
    /// Extension publisher, first half of the URI authority.
    #[serde(default = "default_publisher")]
    pub publisher: String,
    /// Extension identifier, second half of the URI authority.
    #[serde(default = "default_extension_id")]
    pub extension_id: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            auth_base_url: default_auth_base_url(),
            api_base_url: default_api_base_url(),
            client_id: default_client_id(),
            scopes: default_scopes(),
            redirect_scheme: default_redirect_scheme(),
            publisher: default_publisher(),
            extension_id: default_extension_id(),
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file with FEIMA_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: BridgeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FEIMA_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// The exact redirect URI passed to the IdP and matched by the host's
    /// URI dispatcher: `<scheme>://<publisher>.<extension_id>/oauth/callback`.
    pub fn redirect_uri(&self) -> String {
        format!(
            "{}://{}.{}/oauth/callback",
            self.redirect_scheme, self.publisher, self.extension_id
        )
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/oauth/authorize", self.auth_base_url)
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.auth_base_url)
    }

    pub fn models_url(&self) -> String {
        format!("{}/models", self.api_base_url)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base_url)
    }

    /// Scope list in the space-joined form the authorize endpoint expects.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }
}

fn default_auth_base_url() -> String {
    "https://auth.feima.ai".to_string()
}
fn default_api_base_url() -> String {
    "https://api.feima.ai/v1".to_string()
}
fn default_client_id() -> String {
    "feima-editor".to_string()
}
fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_redirect_scheme() -> String {
    "vscode".to_string()
}
fn default_publisher() -> String {
    "feima".to_string()
}
fn default_extension_id() -> String {
    "feima-bridge".to_string()
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.feima/feima.toml", home)
}
