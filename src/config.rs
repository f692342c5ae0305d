//! Client configuration.
//!
//! Collects the device identity, OAuth client settings and service endpoints
//! that the rest of the crate reads. Everything here is plain data; the
//! network side lives in [`crate::http`] and [`crate::auth`].

use url::Url;
use uuid::Uuid;

/// Default base URL of the voice service.
const DEFAULT_API_ENDPOINT: &str = "https://avs-alexa-na.amazon.com";

/// Voice service API version path segment.
const API_VERSION: &str = "v20160207";

/// OAuth token endpoint for code and refresh-token exchanges.
const DEFAULT_TOKEN_ENDPOINT: &str = "https://api.amazon.com/auth/O2/token";

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub app_lang: String,

    pub device_name: String,
    pub device_id: Uuid,

    /// OAuth client id registered with the identity provider.
    pub client_id: String,

    /// Redirect URI registered for the authorization-code flow.
    pub redirect_uri: String,

    /// Base URL of the voice service. Replaced at runtime when the server
    /// issues a `SetEndpoint` directive.
    pub api_endpoint: String,

    /// OAuth token endpoint.
    pub token_endpoint: String,

    /// Path of the file where tokens are persisted across restarts.
    pub tokens_file: String,

    pub user_agent: String,
}

impl Config {
    #[must_use]
    pub fn new(client_id: String, redirect_uri: String) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let app_lang = "en".to_owned();

        let device_id = Uuid::new_v4();
        trace!("device uuid: {device_id}");

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
            || app_lang.chars().count() != 2
            || app_lang.contains(illegal_chars)
        {
            panic!(
                "application name, version and/or language invalid (\"{app_name}\"; \"{app_version}\"; \"{app_lang}\")"
            );
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));

        let user_agent =
            format!("{app_name}/{app_version} (Rust; {os_name}/{os_version}; {app_lang})");
        trace!("user agent: {user_agent}");

        Self {
            app_name: app_name.clone(),
            app_version,
            app_lang,

            device_name: app_name,
            device_id,

            client_id,
            redirect_uri,

            api_endpoint: DEFAULT_API_ENDPOINT.to_owned(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_owned(),
            tokens_file: String::from("tokens.toml"),

            user_agent,
        }
    }

    /// The events endpoint, where client [`Event`](crate::protocol::event)s
    /// are POSTed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configured endpoint is not a valid URL.
    pub fn events_url(&self) -> Result<Url, url::ParseError> {
        format!("{}/{}/events", self.api_endpoint, API_VERSION).parse()
    }

    /// The directives endpoint, held open as the down-channel.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configured endpoint is not a valid URL.
    pub fn directives_url(&self) -> Result<Url, url::ParseError> {
        format!("{}/{}/directives", self.api_endpoint, API_VERSION).parse()
    }

    /// The ping endpoint used by the down-channel heartbeat.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configured endpoint is not a valid URL.
    pub fn ping_url(&self) -> Result<Url, url::ParseError> {
        format!("{}/ping", self.api_endpoint).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new("client-123".to_owned(), "https://localhost/cb".to_owned())
    }

    #[test]
    fn endpoint_urls_carry_api_version() {
        let config = config();
        assert_eq!(
            config.events_url().unwrap().as_str(),
            "https://avs-alexa-na.amazon.com/v20160207/events"
        );
        assert_eq!(
            config.directives_url().unwrap().as_str(),
            "https://avs-alexa-na.amazon.com/v20160207/directives"
        );
        assert_eq!(
            config.ping_url().unwrap().as_str(),
            "https://avs-alexa-na.amazon.com/ping"
        );
    }

    #[test]
    fn set_endpoint_changes_urls() {
        let mut config = config();
        config.api_endpoint = "https://avs-alexa-eu.amazon.com".to_owned();
        assert_eq!(
            config.events_url().unwrap().as_str(),
            "https://avs-alexa-eu.amazon.com/v20160207/events"
        );
    }
}
