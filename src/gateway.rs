//! Authenticated request gateway
//!
//! Every call obtains a valid token from the [`SessionManager`] first, so a
//! token close to expiry is refreshed before it is sent. Failures are
//! retried under the shared [`RetryPolicy`], except 401: a resource server
//! rejecting the token ends the session and surfaces `token_expired`.
//! Retries run under the session's cancellation token, so ending the
//! session stops them and the call fails with `invalid_token`.

use std::sync::Arc;

use crate::auth::classify;
use crate::auth::token::OAuthTokens;
use crate::config::OAuthConfig;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::runtime::Scheduler;
use crate::session::{EndReason, SessionManager};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::types::{MessageRequest, MessageResponse};

const UNAUTHORIZED: u16 = 401;

/// Per-call options for [`AuthenticatedGateway::request`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Method, `GET` by default
    pub method: HttpMethod,
    /// Extra headers, sent after the defaults
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub json: Option<serde_json::Value>,
}

impl RequestOptions {
    /// A `GET` without body
    #[must_use]
    pub fn get() -> Self {
        Self::default()
    }

    /// A `POST` with a JSON body
    #[must_use]
    pub fn post_json(body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            json: Some(body),
            ..Self::default()
        }
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Sends requests to protected resources on behalf of the session
pub struct AuthenticatedGateway {
    config: Arc<OAuthConfig>,
    session: SessionManager,
    transport: Arc<dyn HttpTransport>,
    scheduler: Arc<dyn Scheduler>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for AuthenticatedGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedGateway")
            .field("api_base_url", &self.config.api_base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl AuthenticatedGateway {
    /// Create a gateway bound to a session
    pub fn new(
        config: Arc<OAuthConfig>,
        session: SessionManager,
        transport: Arc<dyn HttpTransport>,
        scheduler: Arc<dyn Scheduler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            session,
            transport,
            scheduler,
            retry,
        }
    }

    fn build_request(&self, endpoint: &str, options: &RequestOptions, tokens: &OAuthTokens) -> HttpRequest {
        let mut request = HttpRequest::new(options.method, self.config.resolve_endpoint(endpoint))
            .header("Authorization", tokens.authorization_header())
            .header("Accept", "application/json");
        for (name, value) in self.config.default_headers.iter().chain(&options.headers) {
            request = request.header(name, value);
        }
        match &options.json {
            Some(body) => request.json(body),
            None => request,
        }
    }

    /// Send an authenticated request
    ///
    /// Relative endpoints are joined to `api_base_url`. Non-2xx responses
    /// become classified errors.
    ///
    /// # Errors
    /// Fails with `invalid_token` when there is no session or it ends while
    /// the call is retrying, `token_expired` when the server rejected the
    /// token (the session is ended), or the classified error of the last
    /// attempt.
    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<HttpResponse> {
        let tokens = self.session.valid_token().await?;
        let cancel = self.session.cancellation();
        if cancel.is_cancelled() {
            return Err(classify::invalid_token("session ended before request"));
        }
        let request = self.build_request(endpoint, &options, &tokens);

        let result = self
            .retry
            .run(self.scheduler.as_ref(), &cancel, "resource_request", |attempt| {
                let request = request.clone();
                async move { self.send_once(request, attempt).await }
            })
            .await;
        if cancel.is_cancelled() {
            tracing::debug!(endpoint, "Session ended during resource request");
            return Err(classify::invalid_token("session ended during request"));
        }
        let response = result?;

        if response.status == UNAUTHORIZED {
            tracing::warn!(endpoint, "Access token rejected by resource server");
            self.session.end_session(EndReason::TokenRejected);
            return Err(classify::from_resource_status(
                response.status,
                None,
                &response.body,
            ));
        }
        Ok(response)
    }

    /// One attempt; 401 is passed through as `Ok` so it is never retried
    async fn send_once(&self, request: HttpRequest, attempt: u32) -> Result<HttpResponse> {
        let url = request.url.clone();
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| classify::from_transport(&e))?;

        if response.is_success() || response.status == UNAUTHORIZED {
            return Ok(response);
        }

        let error =
            classify::from_resource_status(response.status, response.header("retry-after"), &response.body);
        tracing::debug!(
            url,
            attempt,
            status = response.status,
            kind = %error.kind(),
            detail = error.detail().unwrap_or_default(),
            "Resource request failed"
        );
        Err(error)
    }

    /// Send a chat request to the messages endpoint
    ///
    /// # Errors
    /// As [`request`](Self::request), plus `server_error` if the reply is
    /// not a message.
    pub async fn send_message(&self, message: &MessageRequest) -> Result<MessageResponse> {
        let body = serde_json::to_value(message)
            .map_err(|e| classify::invalid_request(format!("unserializable message request: {e}")))?;
        let response = self
            .request(&self.config.messages_endpoint, RequestOptions::post_json(body))
            .await?;
        response
            .json()
            .map_err(|e| classify::malformed_token_response(format!("unparseable message response: {e}")))
    }

    /// Fetch the user profile with freshly exchanged tokens
    ///
    /// Runs before a session exists, so the token is passed in. Any failure
    /// is logged and yields `None`; login proceeds without a profile.
    pub async fn fetch_user_info(&self, tokens: &OAuthTokens) -> Option<serde_json::Value> {
        let endpoint = self.config.userinfo_endpoint.as_deref()?;
        let request = self.build_request(endpoint, &RequestOptions::get(), tokens);

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Could not fetch user info");
                return None;
            }
        };
        if !response.is_success() {
            tracing::warn!(status = response.status, "User info request failed");
            return None;
        }
        match response.json() {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(error = %e, "User info response was not JSON");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::pkce::OsRandom;
    use crate::config::SessionConfig;
    use crate::error::OAuthErrorKind;
    use crate::runtime::{ManualClock, ManualScheduler};
    use crate::session::{SessionPhase, SessionPorts};
    use crate::storage::MemoryStore;
    use crate::transport::{ScriptedTransport, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    const NOW: u64 = 1_000_000;

    struct Fixture {
        gateway: AuthenticatedGateway,
        session: SessionManager,
        scheduler: ManualScheduler,
        transport: ScriptedTransport,
    }

    fn fixture(config: OAuthConfig) -> Fixture {
        let config = Arc::new(config);
        let scheduler = ManualScheduler::new(ManualClock::new(NOW));
        let transport = ScriptedTransport::new();
        let ports = SessionPorts {
            store: Arc::new(MemoryStore::new().context()),
            clock: Arc::new(scheduler.clock().clone()),
            scheduler: Arc::new(scheduler.clone()),
            random: Arc::new(OsRandom),
            transport: Arc::new(transport.clone()),
        };
        let session = SessionManager::new(Arc::clone(&config), SessionConfig::default(), ports);
        let gateway = AuthenticatedGateway::new(
            config,
            session.clone(),
            Arc::new(transport.clone()),
            Arc::new(scheduler.clone()),
            RetryPolicy::default(),
        );
        Fixture {
            gateway,
            session,
            scheduler,
            transport,
        }
    }

    /// Ends the session while the first request is on the wire
    struct LogoutDuringFirstRequest {
        replies: ScriptedTransport,
        session: Mutex<Option<SessionManager>>,
    }

    #[async_trait]
    impl HttpTransport for LogoutDuringFirstRequest {
        async fn send(
            &self,
            request: HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            let session = self.session.lock().unwrap().take();
            if let Some(session) = session {
                session.end_session(EndReason::UserLogout);
            }
            self.replies.send(request).await
        }
    }

    fn tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "tok".to_string(),
            refresh_token: Some("ref".to_string()),
            token_type: "Bearer".to_string(),
            scope: String::new(),
            expires_in: 3600,
            issued_at: NOW,
        }
    }

    #[tokio::test]
    async fn test_request_attaches_bearer_and_default_headers() {
        let f = fixture(OAuthConfig::default());
        f.session.start_session(tokens(), None).unwrap();
        f.transport.push_json(200, &json!({"ok": true}));

        let response = f
            .gateway
            .request("/v1/models", RequestOptions::get().header("x-trace", "1"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        let sent = &f.transport.requests()[0];
        assert_eq!(sent.url, "https://api.anthropic.com/v1/models");
        assert_eq!(sent.header_value("authorization"), Some("Bearer tok"));
        assert_eq!(sent.header_value("anthropic-version"), Some("2023-06-01"));
        assert_eq!(sent.header_value("x-trace"), Some("1"));
    }

    #[tokio::test]
    async fn test_unauthorized_ends_session_without_retry() {
        let f = fixture(OAuthConfig::default());
        f.session.start_session(tokens(), None).unwrap();
        f.transport.push(HttpResponse::new(401, "unauthorized"));

        let err = f
            .gateway
            .request("/v1/messages", RequestOptions::get())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), OAuthErrorKind::TokenExpired);
        assert_eq!(f.transport.request_count(), 1);
        assert_eq!(f.session.phase(), SessionPhase::Unauthenticated);
        assert!(!f.session.is_authenticated());
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let f = fixture(OAuthConfig::default());
        f.session.start_session(tokens(), None).unwrap();
        f.transport
            .push(HttpResponse::new(503, ""))
            .push(HttpResponse::new(500, ""))
            .push_json(200, &json!({}));

        let response = f
            .gateway
            .request("/v1/messages", RequestOptions::get())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(
            f.scheduler.slept(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_logout_stops_resource_retries() {
        let f = fixture(OAuthConfig::default());
        f.session.start_session(tokens(), None).unwrap();
        let replies = ScriptedTransport::new();
        replies
            .push(HttpResponse::new(503, ""))
            .push_json(200, &json!({"ok": true}));
        let gateway = AuthenticatedGateway::new(
            Arc::new(OAuthConfig::default()),
            f.session.clone(),
            Arc::new(LogoutDuringFirstRequest {
                replies: replies.clone(),
                session: Mutex::new(Some(f.session.clone())),
            }),
            Arc::new(f.scheduler.clone()),
            RetryPolicy::default(),
        );

        let err = gateway
            .request("/v1/messages", RequestOptions::get())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), OAuthErrorKind::InvalidToken);
        assert_eq!(replies.request_count(), 1);
        assert_eq!(replies.remaining(), 1);
        assert!(f.scheduler.slept().is_empty());
        assert_eq!(f.session.phase(), SessionPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_request_without_session_fails_with_invalid_token() {
        let f = fixture(OAuthConfig::default());

        let err = f
            .gateway
            .request("/v1/messages", RequestOptions::get())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), OAuthErrorKind::InvalidToken);
        assert_eq!(f.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_send_message_posts_json() {
        let f = fixture(OAuthConfig::default());
        f.session.start_session(tokens(), None).unwrap();
        f.transport.push_json(
            200,
            &json!({
                "id": "msg_1",
                "model": "claude-sonnet-4-5",
                "role": "assistant",
                "content": [{"type": "text", "text": "Hello"}]
            }),
        );

        let request = MessageRequest::builder()
            .model("claude-sonnet-4-5")
            .messages(vec![crate::types::ChatMessage::user("Hi")])
            .build();
        let reply = f.gateway.send_message(&request).await.unwrap();

        assert_eq!(reply.text(), "Hello");
        let sent = &f.transport.requests()[0];
        assert_eq!(sent.method, HttpMethod::Post);
        assert_eq!(sent.header_value("content-type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_str(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["messages"][0]["content"], "Hi");
    }

    #[tokio::test]
    async fn test_user_info_failure_is_not_fatal() {
        let f = fixture(OAuthConfig {
            userinfo_endpoint: Some("/v1/me".to_string()),
            ..OAuthConfig::default()
        });
        f.transport.push(HttpResponse::new(500, "boom"));
        assert!(f.gateway.fetch_user_info(&tokens()).await.is_none());

        f.transport.push_json(200, &json!({"email": "learner@example.com"}));
        let profile = f.gateway.fetch_user_info(&tokens()).await.unwrap();
        assert_eq!(profile["email"], "learner@example.com");
    }

    #[tokio::test]
    async fn test_user_info_skipped_without_endpoint() {
        let f = fixture(OAuthConfig::default());
        assert!(f.gateway.fetch_user_info(&tokens()).await.is_none());
        assert_eq!(f.transport.request_count(), 0);
    }
}
