//! OAuth token exchange and refresh.
//!
//! The service uses an authorization-code grant: an interactive login
//! yields a one-time code, [`Authenticator::exchange_code`] trades it for
//! an access/refresh token pair, and [`Authenticator::access_token`] keeps
//! the pair fresh from then on. Refreshing is single-flight: concurrent
//! callers that find the token expired await one refresh instead of racing
//! their own.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    config::Config,
    http,
    tokens::{Token, TokenStore},
};

/// Errors from the token lifecycle.
#[derive(Error, Debug)]
pub enum AuthError {
    /// No token pair is stored; an interactive login is required first.
    #[error("not logged in")]
    NotLoggedIn,

    /// The token endpoint rejected the grant.
    #[error("token request rejected: {0}")]
    RefreshFailed(String),

    /// The token endpoint could not be reached or the store failed.
    #[error("token request failed: {0}")]
    TransportFailure(#[from] crate::error::Error),
}

impl From<AuthError> for crate::error::Error {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::NotLoggedIn | AuthError::RefreshFailed(_) => Self::unauthenticated(e),
            AuthError::TransportFailure(inner) => inner,
        }
    }
}

/// Token endpoint response body.
#[derive(Deserialize)]
struct GrantResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

impl GrantResponse {
    fn into_token(self) -> Token {
        Token {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: SystemTime::now() + Duration::from_secs(self.expires_in),
        }
    }
}

/// Manages the OAuth token pair for all API calls.
pub struct Authenticator {
    http: Arc<http::Client>,
    store: Arc<TokenStore>,

    token_endpoint: String,
    client_id: String,
    redirect_uri: String,

    /// Serializes refreshes so concurrent expired callers share one
    /// round trip to the token endpoint.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl Authenticator {
    #[must_use]
    pub fn new(config: &Config, http: Arc<http::Client>, store: Arc<TokenStore>) -> Self {
        Self {
            http,
            store,
            token_endpoint: config.token_endpoint.clone(),
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether a token pair is stored, expired or not.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.store.get().is_ok_and(|token| token.is_some())
    }

    /// Trades a one-time authorization code for a token pair and stores
    /// it.
    ///
    /// `verifier` is the PKCE code verifier when the login flow used one.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the endpoint rejects the code or cannot be
    /// reached.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: Option<&str>,
    ) -> Result<Token, AuthError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.client_id),
            ("redirect_uri", &self.redirect_uri),
        ];
        if let Some(verifier) = verifier {
            params.push(("code_verifier", verifier));
        }

        let token = self.grant(&params).await?;
        self.store.put(token.clone()).map_err(AuthError::from)?;
        info!("logged in; token expires in {}s", token.time_to_live().as_secs());
        Ok(token)
    }

    /// Returns a non-expired access token, refreshing if necessary.
    ///
    /// # Errors
    ///
    /// Will return `Err` if no token pair is stored or the refresh fails.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let token = self.store.get()?.ok_or(AuthError::NotLoggedIn)?;
        if !token.is_expired() {
            return Ok(token.access_token);
        }

        Ok(self.refresh().await?.access_token)
    }

    /// Refreshes the stored token pair, single-flight.
    ///
    /// Callers that lose the race to an in-flight refresh receive the
    /// token that refresh produced instead of issuing their own grant.
    ///
    /// # Errors
    ///
    /// Will return `Err` if no token pair is stored or the endpoint
    /// rejects the refresh grant.
    pub async fn refresh(&self) -> Result<Token, AuthError> {
        let _flight = self.refresh_gate.lock().await;

        // Another flight may have refreshed while this one waited.
        let stored = self.store.get()?.ok_or(AuthError::NotLoggedIn)?;
        if !stored.is_expired() {
            return Ok(stored);
        }

        debug!("refreshing access token");
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", &stored.refresh_token),
            ("client_id", &self.client_id),
        ];

        let token = match self.grant(&params).await {
            Ok(token) => token,
            Err(AuthError::RefreshFailed(reason)) => {
                // The refresh token is dead. Drop the pair so the next
                // caller sees `NotLoggedIn` and can log in again instead
                // of retrying a doomed grant forever.
                warn!("refresh rejected, discarding stored token: {reason}");
                self.store.clear().map_err(AuthError::from)?;
                return Err(AuthError::RefreshFailed(reason));
            }
            Err(e) => return Err(e),
        };
        self.store.put(token.clone()).map_err(AuthError::from)?;
        Ok(token)
    }

    async fn grant(&self, params: &[(&str, &str)]) -> Result<Token, AuthError> {
        let request = self
            .http
            .unlimited
            .post(&self.token_endpoint)
            .form(params)
            .build()
            .map_err(crate::error::Error::from)?;

        let response = self.http.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshFailed(format!("{status}: {body}")));
        }

        let grant: GrantResponse = response.json().await.map_err(crate::error::Error::from)?;
        Ok(grant.into_token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// An endpoint no test may ever reach. Any grant attempted against it
    /// surfaces as `TransportFailure`, so a passing assertion doubles as
    /// proof that no network call was made.
    const UNREACHABLE: &str = "http://127.0.0.1:9/token";

    struct Fixture {
        auth: Authenticator,
        store: Arc<TokenStore>,
        dir: PathBuf,
    }

    impl Fixture {
        fn new(token_endpoint: &str) -> Self {
            let mut config = Config::new(
                "client-id".to_owned(),
                "https://localhost/callback".to_owned(),
            );
            config.token_endpoint = token_endpoint.to_owned();

            let dir = std::env::temp_dir().join(format!("vesper-auth-{}", fastrand::u64(..)));
            std::fs::create_dir_all(&dir).unwrap();
            let store = Arc::new(TokenStore::empty(dir.join("tokens.toml")));

            let http = Arc::new(http::Client::new(&config).unwrap());
            let auth = Authenticator::new(&config, http, Arc::clone(&store));
            Self { auth, store, dir }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn token(ttl: Duration) -> Token {
        Token {
            access_token: "access".to_owned(),
            refresh_token: "refresh".to_owned(),
            expires_at: SystemTime::now() + ttl,
        }
    }

    fn expired_token() -> Token {
        Token {
            access_token: "stale".to_owned(),
            refresh_token: "refresh".to_owned(),
            expires_at: SystemTime::now() - Duration::from_secs(1),
        }
    }

    /// Serves one raw HTTP response and returns the endpoint to hit.
    async fn one_shot_endpoint(response: &'static [u8]) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/token", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let _ = socket.write_all(response).await;
        });
        endpoint
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_a_network_call() {
        let fixture = Fixture::new(UNREACHABLE);
        fixture.store.put(token(Duration::from_secs(3600))).unwrap();

        assert_eq!(fixture.auth.access_token().await.unwrap(), "access");
        assert_eq!(fixture.auth.access_token().await.unwrap(), "access");
    }

    #[tokio::test]
    async fn empty_store_means_not_logged_in() {
        let fixture = Fixture::new(UNREACHABLE);

        assert!(!fixture.auth.is_logged_in());
        let error = fixture.auth.access_token().await.unwrap_err();
        assert!(matches!(error, AuthError::NotLoggedIn));
    }

    #[tokio::test]
    async fn refresh_skips_the_grant_when_the_token_is_already_fresh() {
        // A caller that loses the single-flight race finds the token
        // refreshed when it takes the gate and must not grant again.
        let fixture = Fixture::new(UNREACHABLE);
        fixture.store.put(token(Duration::from_secs(3600))).unwrap();

        let refreshed = fixture.auth.refresh().await.unwrap();
        assert_eq!(refreshed.access_token, "access");
    }

    #[tokio::test]
    async fn unreachable_endpoint_keeps_the_stored_token() {
        let fixture = Fixture::new(UNREACHABLE);
        fixture.store.put(expired_token()).unwrap();

        let error = fixture.auth.access_token().await.unwrap_err();
        assert!(matches!(error, AuthError::TransportFailure(_)));
        assert!(fixture.store.get().unwrap().is_some());
    }

    #[tokio::test]
    async fn rejected_refresh_discards_the_stored_token() {
        let endpoint = one_shot_endpoint(
            b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let fixture = Fixture::new(&endpoint);
        fixture.store.put(expired_token()).unwrap();

        let error = fixture.auth.access_token().await.unwrap_err();
        assert!(matches!(error, AuthError::RefreshFailed(_)));

        // The dead pair is gone, so the next caller can log in again.
        assert!(fixture.store.get().unwrap().is_none());
        let error = fixture.auth.access_token().await.unwrap_err();
        assert!(matches!(error, AuthError::NotLoggedIn));
    }
}
