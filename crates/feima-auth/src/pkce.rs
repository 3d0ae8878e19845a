//! Stateless OAuth2/PKCE protocol helpers (RFC 7636).
//!
//! Everything here is a pure function over the bridge configuration and a
//! shared HTTP client; flow state lives in the authentication service.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use feima_core::{BridgeConfig, TokenResponse};

use crate::error::{AuthError, Result};

/// Remaining token life below which a refresh is due.
pub const REFRESH_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Everything the interactive flow needs to open the browser and later
/// complete the exchange.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Fully assembled authorize URL for the user's browser.
    pub url: String,
    /// Random correlation key, doubling as the OAuth `state` parameter.
    pub nonce: String,
    /// PKCE verifier to present at the token endpoint.
    pub code_verifier: String,
}

/// Unverified claims lifted from a JWT payload. Advisory only — no signature
/// check is performed, so these never gate access decisions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdClaims {
    pub sub: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Random 32 octets, base64url without padding (43 characters).
///
/// Reference: <https://datatracker.ietf.org/doc/html/rfc7636#section-4.1>
fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url(SHA-256(verifier)), the S256 challenge transform.
///
/// Reference: <https://datatracker.ietf.org/doc/html/rfc7636#section-4.2>
fn generate_code_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the authorize URL together with the fresh verifier and nonce the
/// caller must retain for the rest of the flow.
pub fn build_authorization_url(
    config: &BridgeConfig,
    redirect_uri: &str,
) -> AuthorizationRequest {
    let code_verifier = generate_code_verifier();
    let code_challenge = generate_code_challenge(&code_verifier);
    let nonce = generate_nonce();

    let query = [
        format!("client_id={}", urlencoding::encode(&config.client_id)),
        "response_type=code".to_string(),
        format!("redirect_uri={}", urlencoding::encode(redirect_uri)),
        format!("state={}", urlencoding::encode(&nonce)),
        format!("code_challenge={}", urlencoding::encode(&code_challenge)),
        "code_challenge_method=S256".to_string(),
        format!("scope={}", urlencoding::encode(&config.scope_param())),
    ]
    .join("&");

    AuthorizationRequest {
        url: format!("{}?{}", config.authorize_url(), query),
        nonce,
        code_verifier,
    }
}

/// Trade an authorization code (plus its PKCE verifier) for tokens.
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &BridgeConfig,
    code: &str,
    code_verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let body = format!(
        "grant_type=authorization_code&client_id={}&code={}&redirect_uri={}&code_verifier={}",
        urlencoding::encode(&config.client_id),
        urlencoding::encode(code),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(code_verifier),
    );

    let resp = client
        .post(config.token_url())
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Accept", "application/json")
        .body(body)
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AuthError::TokenExchangeFailed {
            status: status.as_u16(),
            body,
        });
    }

    Ok(resp.json().await?)
}

/// Obtain a fresh access token from a refresh token grant.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    config: &BridgeConfig,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let body = format!(
        "grant_type=refresh_token&client_id={}&refresh_token={}",
        urlencoding::encode(&config.client_id),
        urlencoding::encode(refresh_token),
    );

    let resp = client
        .post(config.token_url())
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Accept", "application/json")
        .body(body)
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AuthError::TokenRefreshFailed {
            status: status.as_u16(),
            body,
        });
    }

    Ok(resp.json().await?)
}

/// Best-effort decode of the payload segment of the ID token (falling back
/// to the access token when no ID token was issued). Returns `None` on any
/// shape mismatch rather than failing the flow.
pub fn decode_claims(token: &TokenResponse) -> Option<IdClaims> {
    let jwt = token
        .id_token
        .as_deref()
        .unwrap_or(token.access_token.as_str());

    let mut segments = jwt.split('.');
    let (_header, payload, _signature) =
        (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    match serde_json::from_slice::<IdClaims>(&decoded) {
        Ok(claims) => Some(claims),
        Err(e) => {
            debug!(error = %e, "token payload is not a claims object");
            None
        }
    }
}

/// True when the token carries a lifetime and less than five minutes of it
/// remain at `now_ms`.
pub fn should_refresh(token: &TokenResponse, issued_at_ms: i64, now_ms: i64) -> bool {
    match token.expires_in {
        Some(expires_in) => {
            let expires_at = issued_at_ms + expires_in as i64 * 1000;
            expires_at - now_ms < REFRESH_WINDOW_MS
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(auth_base: &str) -> BridgeConfig {
        BridgeConfig {
            auth_base_url: auth_base.trim_end_matches('/').to_string(),
            client_id: "vc".into(),
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
            ..BridgeConfig::default()
        }
    }

    fn query_map(url: &str) -> HashMap<String, String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn verifier_is_43_urlsafe_chars() {
        let v = generate_code_verifier();
        assert_eq!(v.len(), 43);
        assert!(v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(v, generate_code_verifier());
    }

    #[test]
    fn challenge_matches_rfc7636_test_vector() {
        // Appendix B of RFC 7636.
        let challenge =
            generate_code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn authorize_url_carries_all_parameters() {
        let config = test_config("https://idp.example/auth");
        let req = build_authorization_url(&config, "x-host://pub.ext/oauth/callback");

        assert!(req.url.starts_with("https://idp.example/auth/oauth/authorize?"));
        let params = query_map(&req.url);
        assert_eq!(params["client_id"], "vc");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "x-host://pub.ext/oauth/callback");
        assert_eq!(params["state"], req.nonce);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(
            params["code_challenge"],
            generate_code_challenge(&req.code_verifier)
        );
        assert_eq!(params["scope"], "openid profile email");
        assert!(!req.nonce.is_empty());
    }

    #[tokio::test]
    async fn exchange_posts_form_and_parses_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(header("Content-Type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .and(body_string_contains("client_id=vc"))
            .and(body_string_contains("code_verifier=ver"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT1",
                "refresh_token": "RT1",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let client = reqwest::Client::new();
        let token = exchange_code(&client, &config, "abc", "ver", "x-host://cb")
            .await
            .unwrap();
        assert_eq!(token.access_token, "AT1");
        assert_eq!(token.refresh_token.as_deref(), Some("RT1"));
        assert_eq!(token.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn exchange_failure_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad code"))
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let client = reqwest::Client::new();
        let err = exchange_code(&client, &config, "abc", "ver", "x-host://cb")
            .await
            .unwrap_err();
        match err {
            AuthError::TokenExchangeFailed { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad code");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn refresh_posts_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=RT1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT2",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let client = reqwest::Client::new();
        let token = refresh_access_token(&client, &config, "RT1").await.unwrap();
        assert_eq!(token.access_token, "AT2");
        assert!(token.refresh_token.is_none());
    }

    #[tokio::test]
    async fn refresh_failure_is_its_own_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let client = reqwest::Client::new();
        let err = refresh_access_token(&client, &config, "RT1").await.unwrap_err();
        assert!(matches!(err, AuthError::TokenRefreshFailed { status: 401, .. }));
    }

    fn fake_jwt(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{body}.sig")
    }

    #[test]
    fn claims_decode_reads_payload_segment() {
        let token = TokenResponse {
            access_token: "opaque".into(),
            refresh_token: None,
            expires_in: None,
            token_type: None,
            id_token: Some(fake_jwt(
                serde_json::json!({"sub": "u1", "email": "u@e", "extra": 7}),
            )),
        };
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("u1"));
        assert_eq!(claims.email.as_deref(), Some("u@e"));
        assert!(claims.name.is_none());
    }

    #[test]
    fn claims_decode_rejects_wrong_shapes() {
        let token = |id: &str| TokenResponse {
            access_token: "opaque".into(),
            refresh_token: None,
            expires_in: None,
            token_type: None,
            id_token: Some(id.to_string()),
        };
        assert!(decode_claims(&token("not-a-jwt")).is_none());
        assert!(decode_claims(&token("a.b")).is_none());
        assert!(decode_claims(&token("a.%%%.c")).is_none());
        assert!(decode_claims(&token("a.b.c.d")).is_none());
    }

    #[test]
    fn refresh_window_boundaries() {
        let token = TokenResponse {
            access_token: "AT".into(),
            refresh_token: None,
            expires_in: Some(3600),
            token_type: None,
            id_token: None,
        };
        // Fresh token, a full hour left.
        assert!(!should_refresh(&token, 0, 0));
        // 4 minutes 59 seconds left.
        assert!(should_refresh(&token, 0, 3600 * 1000 - 299 * 1000));
        // Exactly 5 minutes left: not yet due.
        assert!(!should_refresh(&token, 0, 3600 * 1000 - 300 * 1000));
        // No lifetime reported: never due.
        let opaque = TokenResponse {
            expires_in: None,
            ..token
        };
        assert!(!should_refresh(&opaque, 0, i64::MAX));
    }
}
