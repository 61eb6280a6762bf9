//! OAuth client for Claude subscription sign-in

use std::sync::Arc;

use super::authorize::AuthorizationRequestBuilder;
use super::callback::{CallbackValidator, RedirectParams};
use super::classify;
use super::pkce::{OsRandom, RandomSource};
use crate::callbacks::SharedSessionListener;
use crate::config::{OAuthConfig, SessionConfig};
use crate::error::Result;
use crate::gateway::{AuthenticatedGateway, RequestOptions};
use crate::runtime::{Clock, Scheduler, SystemClock, TokioScheduler};
use crate::session::{
    ActivitySignal, EndReason, SessionManager, SessionPhase, SessionPorts, SessionState,
};
use crate::storage::{FileStore, KeyValueStore, StorageKeys};
use crate::transport::{HttpResponse, HttpTransport, ReqwestTransport};
use crate::types::{ListenerId, MessageRequest, MessageResponse};

/// Builder for [`OAuthClient`]
///
/// Every port has a production default: [`FileStore`], [`SystemClock`],
/// [`TokioScheduler`], [`OsRandom`] and [`ReqwestTransport`].
#[derive(Default)]
pub struct OAuthClientBuilder {
    config: Option<OAuthConfig>,
    session_config: Option<SessionConfig>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    random: Option<Arc<dyn RandomSource>>,
    transport: Option<Arc<dyn HttpTransport>>,
    listeners: Vec<SharedSessionListener>,
    auto_sync: bool,
}

impl std::fmt::Debug for OAuthClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientBuilder")
            .field("config", &self.config)
            .field("session_config", &self.session_config)
            .field("listeners", &self.listeners.len())
            .field("auto_sync", &self.auto_sync)
            .finish_non_exhaustive()
    }
}

impl OAuthClientBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            auto_sync: true,
            ..Self::default()
        }
    }

    /// Set provider configuration
    #[must_use]
    pub fn config(mut self, config: OAuthConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set session timings
    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = Some(config);
        self
    }

    /// Set durable storage for this context
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the time source
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the timer source
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the secure random source
    #[must_use]
    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    /// Set the HTTP transport
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a listener before the persisted session is restored
    #[must_use]
    pub fn listener(mut self, listener: SharedSessionListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Apply other contexts' changes on a background task (default: true)
    ///
    /// With auto sync off, changes are applied at the start of each call.
    #[must_use]
    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
        self
    }

    /// Build the client and restore any persisted session
    #[must_use]
    pub fn build(self) -> OAuthClient {
        let config = Arc::new(self.config.unwrap_or_default());
        let session_config = self.session_config.unwrap_or_default();
        let ports = SessionPorts {
            store: self.store.unwrap_or_else(|| Arc::new(FileStore::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Arc::new(TokioScheduler::new())),
            random: self.random.unwrap_or_else(|| Arc::new(OsRandom)),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(ReqwestTransport::new())),
        };

        let authorizer = AuthorizationRequestBuilder::new(
            Arc::clone(&config),
            Arc::clone(&ports.store),
            Arc::clone(&ports.random),
            Arc::clone(&ports.clock),
            session_config.verifier_length,
        );
        let validator = CallbackValidator::new(
            Arc::clone(&ports.store),
            StorageKeys::new(config.storage_namespace.clone()),
            Arc::clone(&ports.clock),
            session_config.attempt_ttl,
        );
        let gateway_parts = (
            Arc::clone(&ports.transport),
            Arc::clone(&ports.scheduler),
            session_config.retry,
        );
        let session = SessionManager::new(Arc::clone(&config), session_config, ports);
        let gateway = AuthenticatedGateway::new(
            Arc::clone(&config),
            session.clone(),
            gateway_parts.0,
            gateway_parts.1,
            gateway_parts.2,
        );

        for listener in self.listeners {
            session.subscribe(listener);
        }
        session.restore();
        if self.auto_sync && !session.spawn_sync() {
            tracing::debug!("Cross-context sync not started; reconciling lazily");
        }

        OAuthClient {
            config,
            authorizer,
            validator,
            session,
            gateway,
        }
    }
}

/// OAuth client for one browsing context
///
/// Drives the authorization code flow with PKCE and owns the resulting
/// session. Clients built over a shared store stay in sync: a login or
/// logout in one is observed by the others.
///
/// # Example
///
/// ```no_run
/// use anthropic_oauth_session::auth::OAuthClient;
///
/// # async fn run() -> anthropic_oauth_session::Result<()> {
/// let client = OAuthClient::builder().build();
/// let url = client.start_flow()?;
/// println!("Open {url} and sign in");
///
/// // Later, with the parameters of the redirect back:
/// client.handle_redirect("?code=abc123valid&state=...").await?;
/// assert!(client.is_authenticated());
/// # Ok(())
/// # }
/// ```
pub struct OAuthClient {
    config: Arc<OAuthConfig>,
    authorizer: AuthorizationRequestBuilder,
    validator: CallbackValidator,
    session: SessionManager,
    gateway: AuthenticatedGateway,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.config.client_id)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl OAuthClient {
    /// Create a builder for custom configuration
    #[must_use]
    pub fn builder() -> OAuthClientBuilder {
        OAuthClientBuilder::new()
    }

    /// Get the OAuth configuration
    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Session manager behind this client
    #[must_use]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Start an authorization attempt and return the URL to open
    ///
    /// # Errors
    /// Fails if secure randomness is unavailable or the attempt cannot be
    /// persisted.
    pub fn start_flow(&self) -> Result<String> {
        self.authorizer.start_flow()
    }

    /// Complete sign-in with the `code` and `state` from the redirect
    ///
    /// Validates the callback, exchanges the code, fetches the profile if a
    /// userinfo endpoint is configured, and starts the session.
    ///
    /// # Errors
    /// `invalid_request` for a missing attempt, state mismatch or bad code;
    /// otherwise the classified exchange or storage error.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<SessionState> {
        let callback = self.validator.validate(code, state)?;
        let tokens = self.session.exchange_code(&callback).await?;
        let user_info = self.gateway.fetch_user_info(&tokens).await;
        self.session.start_session(tokens, user_info)
    }

    /// Complete sign-in from the raw redirect query
    ///
    /// An `error` parameter from the provider is surfaced as its classified
    /// kind and abandons the pending attempt.
    ///
    /// # Errors
    /// As [`handle_callback`](Self::handle_callback), or the provider's error.
    pub async fn handle_redirect(&self, query: &str) -> Result<SessionState> {
        let params = RedirectParams::parse(query);
        if let Some(error) = params.error.as_deref() {
            self.validator.discard();
            let error = classify::from_provider_redirect(error, params.error_description.as_deref());
            tracing::warn!(
                kind = %error.kind(),
                detail = error.detail().unwrap_or_default(),
                "Provider returned an error"
            );
            return Err(error);
        }
        self.handle_callback(
            params.code.as_deref().unwrap_or_default(),
            params.state.as_deref().unwrap_or_default(),
        )
        .await
    }

    /// Whether a session is active with a valid token
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Current session phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    /// Profile fetched at login
    #[must_use]
    pub fn user_info(&self) -> Option<serde_json::Value> {
        self.session.user_info()
    }

    /// Snapshot of the active session
    #[must_use]
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.session_state()
    }

    /// Send an authenticated request to a protected resource
    ///
    /// # Errors
    /// See [`AuthenticatedGateway::request`].
    pub async fn send_authenticated_request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse> {
        self.gateway.request(endpoint, options).await
    }

    /// Send a chat request on behalf of the signed-in user
    ///
    /// # Errors
    /// See [`AuthenticatedGateway::send_message`].
    pub async fn send_message(&self, request: &MessageRequest) -> Result<MessageResponse> {
        self.gateway.send_message(request).await
    }

    /// Record a user interaction; returns whether it was recorded
    pub fn record_activity(&self, signal: ActivitySignal) -> bool {
        self.session.record_activity(signal)
    }

    /// Sign out in this and every context sharing the store
    pub fn logout(&self) {
        self.validator.discard();
        self.session.end_session(EndReason::UserLogout);
    }

    /// Register a session event listener
    pub fn subscribe(&self, listener: SharedSessionListener) -> ListenerId {
        self.session.subscribe(listener)
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.session.unsubscribe(id)
    }
}
