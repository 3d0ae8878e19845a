//! Routes inbound redirect URIs to the sign-in flow waiting on them.
//!
//! The host delivers every URI addressed to the extension through a single
//! handler; correlation happens on the OAuth `state` parameter, which the
//! bridge generated as the flow nonce. Unmatched or stateless callbacks are
//! dropped so a stray redirect can never leak into a foreign flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::AuthError;

/// Interactive flows are abandoned after five minutes without a redirect.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Successful callback payload: the authorization code to exchange.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub code: String,
}

struct PendingCallback {
    tx: oneshot::Sender<Result<AuthorizationCode, AuthError>>,
    timer: JoinHandle<()>,
}

/// One pending resolver per nonce. Resolving, cancelling, or timing out
/// removes the entry and detaches its timer.
#[derive(Default)]
pub struct CallbackRouter {
    pending: Arc<DashMap<String, PendingCallback>>,
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for `nonce` with the default five-minute TTL.
    pub fn register(
        &self,
        nonce: &str,
    ) -> oneshot::Receiver<Result<AuthorizationCode, AuthError>> {
        self.register_with_timeout(nonce, CALLBACK_TIMEOUT)
    }

    /// Register a resolver with an explicit TTL. On expiry the entry is
    /// removed and the receiver resolves to [`AuthError::CallbackTimedOut`].
    pub fn register_with_timeout(
        &self,
        nonce: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<AuthorizationCode, AuthError>> {
        let (tx, rx) = oneshot::channel();

        let pending = Arc::clone(&self.pending);
        let timer_nonce = nonce.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, cb)) = pending.remove(&timer_nonce) {
                debug!(nonce = %timer_nonce, "authorization callback timed out");
                let _ = cb.tx.send(Err(AuthError::CallbackTimedOut));
            }
        });

        if let Some(stale) = self
            .pending
            .insert(nonce.to_string(), PendingCallback { tx, timer })
        {
            // A nonce collision means the caller re-registered; the old
            // resolver can never fire again.
            stale.timer.abort();
        }

        rx
    }

    /// Remove a pending entry without resolving it. The awaiting side
    /// observes a closed channel and treats it as a flow failure.
    pub fn cancel(&self, nonce: &str) {
        if let Some((_, cb)) = self.pending.remove(nonce) {
            cb.timer.abort();
        }
    }

    /// Number of flows still waiting on a redirect.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Dispatch an inbound redirect URI.
    ///
    /// Drops the event (with a log line) when `state` is missing or unknown;
    /// otherwise resolves the matching flow with the authorization code, the
    /// server-reported error, or a malformed-callback failure.
    pub fn handle_uri(&self, uri: &str) {
        let parsed = match url::Url::parse(uri) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "dropping unparseable callback URI");
                return;
            }
        };

        let params: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let Some(state) = params.get("state") else {
            warn!("dropping callback without a state parameter");
            return;
        };

        let Some((_, cb)) = self.pending.remove(state) else {
            debug!("dropping callback for unknown or already-resolved state");
            return;
        };
        cb.timer.abort();

        let outcome = if let Some(error) = params.get("error") {
            let description = params
                .get("error_description")
                .unwrap_or(error)
                .to_string();
            Err(AuthError::ServerReturnedError(description))
        } else if let Some(code) = params.get("code") {
            Ok(AuthorizationCode { code: code.clone() })
        } else {
            Err(AuthError::MalformedCallback(
                "neither code nor error present".to_string(),
            ))
        };

        let _ = cb.tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CB: &str = "x-host://pub.ext/oauth/callback";

    #[tokio::test]
    async fn resolves_matching_state_with_code() {
        let router = CallbackRouter::new();
        let rx = router.register("n1");

        router.handle_uri(&format!("{CB}?state=n1&code=abc"));

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.code, "abc");
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn server_error_parameter_rejects_flow() {
        let router = CallbackRouter::new();
        let rx = router.register("n1");

        router.handle_uri(&format!(
            "{CB}?state=n1&error=access_denied&error_description=user%20said%20no"
        ));

        match rx.await.unwrap() {
            Err(AuthError::ServerReturnedError(desc)) => {
                assert_eq!(desc, "user said no")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_without_description_falls_back_to_code() {
        let router = CallbackRouter::new();
        let rx = router.register("n1");

        router.handle_uri(&format!("{CB}?state=n1&error=server_error"));

        match rx.await.unwrap() {
            Err(AuthError::ServerReturnedError(desc)) => {
                assert_eq!(desc, "server_error")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_code_is_malformed() {
        let router = CallbackRouter::new();
        let rx = router.register("n1");

        router.handle_uri(&format!("{CB}?state=n1"));

        assert!(matches!(
            rx.await.unwrap(),
            Err(AuthError::MalformedCallback(_))
        ));
    }

    #[tokio::test]
    async fn missing_state_is_dropped() {
        let router = CallbackRouter::new();
        let _rx = router.register("n1");

        router.handle_uri(&format!("{CB}?code=abc"));

        assert_eq!(router.pending_count(), 1);
    }

    #[tokio::test]
    async fn unknown_state_is_dropped() {
        let router = CallbackRouter::new();
        let rx = router.register("n1");

        router.handle_uri(&format!("{CB}?state=other&code=abc"));

        // n1 still pending; a second callback for n1 resolves it normally.
        router.handle_uri(&format!("{CB}?state=n1&code=real"));
        assert_eq!(rx.await.unwrap().unwrap().code, "real");
    }

    #[tokio::test]
    async fn callbacks_for_distinct_nonces_are_independent() {
        let router = CallbackRouter::new();
        let rx1 = router.register("n1");
        let rx2 = router.register("n2");

        router.handle_uri(&format!("{CB}?state=n2&code=two"));
        router.handle_uri(&format!("{CB}?state=n1&code=one"));

        assert_eq!(rx1.await.unwrap().unwrap().code, "one");
        assert_eq!(rx2.await.unwrap().unwrap().code, "two");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_rejects() {
        let router = CallbackRouter::new();
        let rx = router.register("n1");

        tokio::time::advance(CALLBACK_TIMEOUT + Duration::from_secs(1)).await;

        assert!(matches!(rx.await.unwrap(), Err(AuthError::CallbackTimedOut)));
        assert_eq!(router.pending_count(), 0);

        // A redirect arriving after the timeout is dropped silently.
        router.handle_uri(&format!("{CB}?state=n1&code=late"));
    }

    #[tokio::test]
    async fn cancel_closes_channel_without_resolving() {
        let router = CallbackRouter::new();
        let rx = router.register("n1");

        router.cancel("n1");

        assert!(rx.await.is_err());
        assert_eq!(router.pending_count(), 0);
    }
}
