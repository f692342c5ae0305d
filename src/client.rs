//! Authenticated calls to the voice service.
//!
//! [`VoiceClient`] owns the outbound half of the protocol: it POSTs event
//! envelopes (with optional captured audio) to the events endpoint, decodes
//! whatever directives come back, and keeps every call behind the token
//! gate. A call that finds no stored token drives the injected interactive
//! login once and then reissues itself exactly once; persistent failure
//! surfaces instead of looping into repeated login prompts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    multipart::{Form, Part},
    StatusCode,
};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{AuthError, Authenticator},
    command::Batch,
    config::Config,
    error::{Error, Result},
    http,
    protocol::{event::EventWrapper, multipart},
};

/// Safety net around one event send. The protocol tolerates long-held
/// connections, but a single metadata POST should never take this long.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Recognize uploads stream microphone audio and legitimately run longer.
const RECOGNIZE_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of an interactive login flow.
#[derive(Clone, Debug)]
pub struct LoginCode {
    /// One-time authorization code from the identity provider.
    pub code: String,

    /// PKCE code verifier, when the flow used one.
    pub verifier: Option<String>,
}

/// External collaborator that drives the identity provider's own
/// authorization UI and yields an opaque code.
#[async_trait]
pub trait InteractiveLogin: Send + Sync {
    /// Runs the interactive flow to completion.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the user aborts or the flow fails.
    async fn obtain_code(&self) -> Result<LoginCode>;
}

/// The outbound protocol client.
pub struct VoiceClient {
    http: Arc<http::Client>,
    auth: Arc<Authenticator>,
    login: Arc<dyn InteractiveLogin>,

    /// Endpoints move at runtime when the server issues `SetEndpoint`.
    config: Mutex<Config>,
}

impl VoiceClient {
    #[must_use]
    pub fn new(
        config: Config,
        http: Arc<http::Client>,
        auth: Arc<Authenticator>,
        login: Arc<dyn InteractiveLogin>,
    ) -> Self {
        Self {
            http,
            auth,
            login,
            config: Mutex::new(config),
        }
    }

    /// Redirects all subsequent calls to a different regional endpoint.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configuration lock is poisoned.
    pub fn set_endpoint(&self, endpoint: &str) -> Result<()> {
        let mut config = self.config.lock()?;
        config.api_endpoint = endpoint.trim_end_matches('/').to_owned();
        info!("switching to endpoint {}", config.api_endpoint);
        Ok(())
    }

    /// Sends one event envelope and decodes the directives that come back.
    ///
    /// # Errors
    ///
    /// Will return `Err` if authentication, the network call or response
    /// decoding fails.
    pub async fn send_event(&self, event: &EventWrapper) -> Result<Batch> {
        self.send(event, None, SEND_TIMEOUT).await
    }

    /// Sends a recognize request with captured audio.
    ///
    /// The caller may cancel at any point, for example when the user stops
    /// recording; a cancelled call reports [`Cancelled`] so its failure
    /// never reaches the user.
    ///
    /// [`Cancelled`]: crate::error::ErrorKind::Cancelled
    ///
    /// # Errors
    ///
    /// Will return `Err` if the call is cancelled or fails.
    pub async fn recognize(
        &self,
        dialog_request_id: &str,
        audio: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Batch> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("recognize request cancelled"));
        }

        let event = EventWrapper::recognize(dialog_request_id);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::cancelled("recognize request cancelled")),
            result = self.send(&event, Some(audio), RECOGNIZE_TIMEOUT) => result,
        }
    }

    /// Synchronizes client state, flushing directives queued server-side.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the send fails.
    pub async fn synchronize_state(&self) -> Result<Batch> {
        self.send_event(&EventWrapper::synchronize_state()).await
    }

    /// Lightweight liveness probe of the API endpoint.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the endpoint is unreachable or rejects the
    /// token.
    pub async fn ping(&self) -> Result<()> {
        let url = self.config.lock()?.ping_url()?;
        let access_token = self.auth.access_token().await?;
        let request = self.http.get_with_bearer(url, &access_token)?;
        let response = tokio::time::timeout(SEND_TIMEOUT, self.http.execute(request)).await??;
        response.error_for_status()?;
        Ok(())
    }

    /// Opens the long-held directives stream for the down-channel.
    ///
    /// The response stays open indefinitely; the caller reads
    /// newline-delimited JSON from its body.
    ///
    /// # Errors
    ///
    /// Will return `Err` if authentication fails or the endpoint refuses
    /// the connection.
    pub async fn open_directives_stream(&self) -> Result<reqwest::Response> {
        let url = self.config.lock()?.directives_url()?;
        let access_token = self.ensure_access_token().await?;
        let mut request = reqwest::Request::new(reqwest::Method::GET, url);
        request
            .headers_mut()
            .insert(AUTHORIZATION, http::Client::bearer(&access_token)?);

        let response = self.http.execute_streaming(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::unavailable(format!(
                "directives endpoint returned {status}"
            )));
        }
        Ok(response)
    }

    async fn send(
        &self,
        event: &EventWrapper,
        audio: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Batch> {
        let access_token = self.ensure_access_token().await?;
        let fut = self.post(event, audio, &access_token);
        tokio::time::timeout(timeout, fut).await?
    }

    /// Returns a valid access token, driving the interactive login once if
    /// no token pair is stored. One bounded retry, never a loop.
    async fn ensure_access_token(&self) -> Result<String> {
        match self.auth.access_token().await {
            Ok(token) => Ok(token),
            Err(AuthError::NotLoggedIn) => {
                info!("not logged in; starting interactive login");
                let login = self.login.obtain_code().await?;
                self.auth
                    .exchange_code(&login.code, login.verifier.as_deref())
                    .await?;
                Ok(self.auth.access_token().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn post(
        &self,
        event: &EventWrapper,
        audio: Option<Vec<u8>>,
        access_token: &str,
    ) -> Result<Batch> {
        let url = self.config.lock()?.events_url()?;
        let metadata = event.to_json()?;
        trace!("sending {}", metadata.trim_end());

        let mut form = Form::new().part(
            "metadata",
            Part::text(metadata).mime_str("application/json")?,
        );
        if let Some(bytes) = audio {
            form = form.part(
                "audio",
                Part::bytes(bytes).mime_str("application/octet-stream")?,
            );
        }

        let request = self
            .http
            .unlimited
            .post(url)
            .header(AUTHORIZATION, http::Client::bearer(access_token)?)
            .multipart(form)
            .build()?;

        let response = self.http.execute(request).await?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Batch> {
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Batch::default());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::unauthenticated(format!(
                "events endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(Error::unavailable(format!(
                "events endpoint returned {status}"
            )));
        }

        let boundary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(multipart::boundary_from_content_type)
            .unwrap_or_default();

        let bytes = response.bytes().await?;
        let directives = multipart::parse(&bytes, &boundary, true)?;
        Ok(Batch::from_directives(directives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn response(status: u16, content_type: Option<&str>, body: &[u8]) -> reqwest::Response {
        let mut builder = ::http::Response::builder().status(status);
        if let Some(content_type) = content_type {
            builder = builder.header("Content-Type", content_type);
        }
        builder.body(body.to_vec()).unwrap().into()
    }

    #[tokio::test]
    async fn no_content_decodes_to_empty_batch() {
        let batch = VoiceClient::decode(response(204, None, b"")).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn forbidden_maps_to_unauthenticated() {
        let error = VoiceClient::decode(response(403, None, b""))
            .await
            .unwrap_err();
        assert_eq!(error.kind, crate::error::ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn multipart_response_decodes_to_commands() {
        let body = concat!(
            "--split\r\n",
            "Content-Type: application/json\r\n",
            "\r\n",
            r#"{"header":{"namespace":"Speaker","name":"SetVolume"},"payload":{"volume":42}}"#,
            "\r\n",
            "--split--\r\n",
        );
        let batch = VoiceClient::decode(response(
            200,
            Some("multipart/related; boundary=split; type=application/json"),
            body.as_bytes(),
        ))
        .await
        .unwrap();

        assert_eq!(batch.commands, vec![Command::SetVolume { volume: 42 }]);
    }

    #[tokio::test]
    async fn bare_json_response_decodes_without_boundary_header() {
        let body = r#"{"directive":{"header":{"namespace":"Speaker","name":"SetMute"},"payload":{"mute":true}}}"#;
        let batch = VoiceClient::decode(response(
            200,
            Some("application/json"),
            body.as_bytes(),
        ))
        .await
        .unwrap();

        assert_eq!(batch.commands, vec![Command::SetMute { mute: true }]);
    }
}
