//! Provider and session configuration
//!
//! [`OAuthConfig`] describes the provider (endpoints, client identity,
//! scopes); [`SessionConfig`] holds lifecycle timings. Both have working
//! defaults, and [`OAuthConfig::from_env`] overlays `ANTHROPIC_OAUTH_*`
//! environment variables.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::auth::pkce::DEFAULT_VERIFIER_LEN;
use crate::retry::RetryPolicy;
use crate::storage::DEFAULT_NAMESPACE;

// Claude OAuth configuration (public client, PKCE)
const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const DEFAULT_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
const DEFAULT_SCOPES: &str = "user:profile user:inference";
const DEFAULT_API_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MESSAGES_ENDPOINT: &str = "/v1/messages";

const ENV_PREFIX: &str = "ANTHROPIC_OAUTH_";

/// OAuth provider configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    /// OAuth client ID
    pub client_id: String,
    /// Authorization endpoint URL
    pub authorize_url: String,
    /// Token endpoint URL
    pub token_url: String,
    /// Redirect URI for OAuth callback
    pub redirect_uri: String,
    /// Space-separated scopes to request
    pub scopes: String,
    /// Base URL that relative resource endpoints are joined to
    pub api_base_url: String,
    /// Endpoint used by `send_message`
    pub messages_endpoint: String,
    /// Optional profile endpoint fetched after login
    pub userinfo_endpoint: Option<String>,
    /// Headers added to every authenticated request
    pub default_headers: Vec<(String, String)>,
    /// Extra static parameters appended to the authorization URL
    pub extra_authorize_params: Vec<(String, String)>,
    /// Prefix for every storage key
    pub storage_namespace: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: DEFAULT_SCOPES.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            messages_endpoint: DEFAULT_MESSAGES_ENDPOINT.to_string(),
            userinfo_endpoint: None,
            default_headers: vec![
                ("anthropic-version".to_string(), "2023-06-01".to_string()),
                ("anthropic-beta".to_string(), "oauth-2025-04-20".to_string()),
            ],
            // The hosted callback page shows the code for manual copy.
            extra_authorize_params: vec![("code".to_string(), "true".to_string())],
            storage_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl OAuthConfig {
    /// Defaults overlaid with `ANTHROPIC_OAUTH_*` environment variables
    ///
    /// Recognized variables: `CLIENT_ID`, `AUTHORIZE_URL`, `TOKEN_URL`,
    /// `REDIRECT_URI`, `SCOPES`, `API_BASE_URL`, `USERINFO_ENDPOINT`,
    /// `NAMESPACE`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fields: [(&str, &mut String); 7] = [
            ("CLIENT_ID", &mut self.client_id),
            ("AUTHORIZE_URL", &mut self.authorize_url),
            ("TOKEN_URL", &mut self.token_url),
            ("REDIRECT_URI", &mut self.redirect_uri),
            ("SCOPES", &mut self.scopes),
            ("API_BASE_URL", &mut self.api_base_url),
            ("NAMESPACE", &mut self.storage_namespace),
        ];
        for (name, field) in fields {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *field = value;
            }
        }
        if let Some(value) = lookup("USERINFO_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            self.userinfo_endpoint = Some(value);
        }
        self
    }

    /// Resolve an endpoint against `api_base_url` unless it is absolute
    #[must_use]
    pub fn resolve_endpoint(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

/// Session lifecycle timings
#[derive(Debug, Clone, TypedBuilder)]
pub struct SessionConfig {
    /// Refresh this long before the access token expires
    #[builder(default = Duration::from_secs(5 * 60))]
    pub refresh_buffer: Duration,
    /// Wait before retrying a refresh that failed recoverably
    #[builder(default = Duration::from_secs(60))]
    pub refresh_retry_delay: Duration,
    /// End the session after this much inactivity
    #[builder(default = Duration::from_secs(30 * 60))]
    pub session_timeout: Duration,
    /// How often the inactivity watchdog runs
    #[builder(default = Duration::from_secs(60))]
    pub inactivity_check_interval: Duration,
    /// Minimum spacing between recorded activity events
    #[builder(default = Duration::from_secs(5))]
    pub activity_throttle: Duration,
    /// Pending authorization attempts older than this are discarded
    #[builder(default = Duration::from_secs(10 * 60))]
    pub attempt_ttl: Duration,
    /// PKCE verifier length (43..=128)
    #[builder(default = DEFAULT_VERIFIER_LEN)]
    pub verifier_length: usize,
    /// Retry policy for token and resource calls
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
