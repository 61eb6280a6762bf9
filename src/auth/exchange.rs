//! Token endpoint client
//!
//! Both grants POST a form-encoded body to the token endpoint and run under
//! the shared [`RetryPolicy`]. The response is validated once, after the
//! retry loop: a 2xx body without `access_token` or `token_type` is a
//! `server_error` and is not retried, since an authorization code cannot be
//! redeemed twice.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::classify;
use super::token::OAuthTokens;
use crate::config::OAuthConfig;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::runtime::{Clock, Scheduler};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};

/// Lifetime assumed when the provider omits `expires_in`
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Success body from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Client for the provider's token endpoint
pub struct TokenClient {
    config: Arc<OAuthConfig>,
    transport: Arc<dyn HttpTransport>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for TokenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenClient")
            .field("token_url", &self.config.token_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TokenClient {
    /// Create a token client
    pub fn new(
        config: Arc<OAuthConfig>,
        transport: Arc<dyn HttpTransport>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            transport,
            scheduler,
            clock,
            retry,
        }
    }

    /// Exchange an authorization code for tokens
    ///
    /// # Errors
    /// Returns the classified error of the last attempt, or `server_error`
    /// if the provider answered 2xx with an unusable body.
    pub async fn exchange(
        &self,
        code: &str,
        code_verifier: &str,
        cancel: &CancellationToken,
    ) -> Result<OAuthTokens> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        let response = self.post_token(&params, "token_exchange", cancel).await?;
        let tokens = self.parse_tokens(&response, None)?;
        tracing::debug!(expires_in = tokens.expires_in, "Authorization code exchanged");
        Ok(tokens)
    }

    /// Obtain fresh tokens with a refresh token
    ///
    /// If the provider does not rotate the refresh token, the one passed in
    /// is kept.
    ///
    /// # Errors
    /// Returns the classified error of the last attempt, or `server_error`
    /// if the provider answered 2xx with an unusable body.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        cancel: &CancellationToken,
    ) -> Result<OAuthTokens> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        let response = self.post_token(&params, "token_refresh", cancel).await?;
        let tokens = self.parse_tokens(&response, Some(refresh_token))?;
        tracing::debug!(expires_in = tokens.expires_in, "Access token refreshed");
        Ok(tokens)
    }

    async fn post_token(
        &self,
        params: &[(&str, &str)],
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        let request = HttpRequest::new(HttpMethod::Post, &self.config.token_url)
            .header("Accept", "application/json")
            .form(params);

        self.retry
            .run(self.scheduler.as_ref(), cancel, operation, |attempt| {
                let request = request.clone();
                async move { self.send_once(request, operation, attempt).await }
            })
            .await
    }

    async fn send_once(
        &self,
        request: HttpRequest,
        operation: &str,
        attempt: u32,
    ) -> Result<HttpResponse> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| classify::from_transport(&e))?;

        if response.is_success() {
            return Ok(response);
        }

        let error =
            classify::from_token_status(response.status, response.header("retry-after"), &response.body);
        tracing::debug!(
            operation,
            attempt,
            status = response.status,
            kind = %error.kind(),
            detail = error.detail().unwrap_or_default(),
            "Token endpoint returned an error"
        );
        Err(error)
    }

    fn parse_tokens(
        &self,
        response: &HttpResponse,
        previous_refresh_token: Option<&str>,
    ) -> Result<OAuthTokens> {
        let body: TokenResponse = response.json().map_err(|e| {
            classify::malformed_token_response(format!("unparseable token response: {e}"))
        })?;

        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| classify::malformed_token_response("token response lacks access_token"))?;
        let token_type = body
            .token_type
            .filter(|t| !t.is_empty())
            .ok_or_else(|| classify::malformed_token_response("token response lacks token_type"))?;

        Ok(OAuthTokens {
            access_token,
            refresh_token: body
                .refresh_token
                .or_else(|| previous_refresh_token.map(str::to_string)),
            token_type,
            scope: body.scope.unwrap_or_else(|| self.config.scopes.clone()),
            expires_in: body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
            issued_at: self.clock.now_millis(),
        })
    }
}
