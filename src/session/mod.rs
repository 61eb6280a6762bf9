//! Session lifecycle management
//!
//! [`SessionManager`] owns the local session state machine:
//!
//! ```text
//! Unauthenticated -> Authenticating -> Authenticated -> (Refreshing -> Authenticated | Expired) -> Unauthenticated
//! ```
//!
//! While a session is active it keeps at most one refresh timer (or, for
//! tokens without a refresh token, one expiry timer) and one inactivity
//! watchdog. Every transition cancels and recreates them, so there are
//! never duplicates.
//!
//! Several managers (one per browsing context) may share a store. Each
//! writes only the changes it originates and reconciles from the store's
//! change feed: either in a background task ([`SessionManager::spawn_sync`])
//! or lazily, at the start of every public operation.

mod events;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use tokio_util::sync::CancellationToken;

use crate::auth::callback::ValidatedCallback;
use crate::auth::classify;
use crate::auth::exchange::TokenClient;
use crate::auth::pkce::RandomSource;
use crate::auth::token::{OAuthTokens, TokenStore};
use crate::callbacks::SharedSessionListener;
use crate::config::{OAuthConfig, SessionConfig};
use crate::error::Result;
use crate::runtime::{Clock, Scheduler, TimerHandle, timer_task};
use crate::storage::{ExternalChanges, KeyValueStore, StorageEvent, StorageKeys};
use crate::transport::HttpTransport;
use crate::types::{ListenerId, SessionId};

pub use events::{EndReason, LoginReason, SessionEvent};
pub use state::{ActivitySignal, SessionPhase, SessionState};

use events::ListenerRegistry;

const SESSION_ID_BYTES: usize = 16;

/// Injected dependencies shared by every component of one context
#[derive(Clone)]
pub struct SessionPorts {
    /// Durable storage for this context
    pub store: Arc<dyn KeyValueStore>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Timer source
    pub scheduler: Arc<dyn Scheduler>,
    /// Secure randomness
    pub random: Arc<dyn RandomSource>,
    /// HTTP client
    pub transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for SessionPorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPorts").finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Refresh,
    Expiry,
    Watchdog,
}

#[derive(Debug, Default)]
struct Timers {
    refresh: Option<TimerHandle>,
    expiry: Option<TimerHandle>,
    watchdog: Option<TimerHandle>,
}

impl Timers {
    fn cancel_all(&mut self, scheduler: &dyn Scheduler) {
        for handle in [self.refresh.take(), self.expiry.take(), self.watchdog.take()]
            .into_iter()
            .flatten()
        {
            scheduler.cancel(handle);
        }
    }
}

#[derive(Debug, Default)]
struct Local {
    phase: SessionPhase,
    state: Option<SessionState>,
    timers: Timers,
    cancel: CancellationToken,
}

/// Clears the in-flight flag when dropped
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then(|| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    config: SessionConfig,
    keys: StorageKeys,
    store: Arc<dyn KeyValueStore>,
    tokens: TokenStore,
    token_client: TokenClient,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    listeners: ListenerRegistry,
    in_flight: AtomicBool,
    local: Mutex<Local>,
    changes: Mutex<Option<ExternalChanges>>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let local = self.local.get_mut().unwrap_or_else(PoisonError::into_inner);
        local.timers.cancel_all(self.scheduler.as_ref());
    }
}

impl Inner {
    fn local(&self) -> MutexGuard<'_, Local> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn persist(&self, state: &SessionState) -> Result<()> {
        let record =
            serde_json::to_string(state).map_err(|e| classify::storage_failure(&e.into()))?;
        self.store
            .set(&self.keys.session(), &record)
            .map_err(|e| classify::storage_failure(&e))
    }

    fn load_record(&self) -> Option<SessionState> {
        let key = self.keys.session();
        let record = match self.store.get(&key) {
            Ok(record) => record?,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read session record");
                return None;
            }
        };
        match serde_json::from_str(&record) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupt session record");
                if let Err(e) = self.store.remove(&key) {
                    tracing::warn!(error = %e, "Could not clear session record");
                }
                None
            }
        }
    }

    fn clear_durable(&self) {
        self.tokens.clear();
        if let Err(e) = self.store.remove(&self.keys.session()) {
            tracing::warn!(error = %e, "Could not clear session record");
        }
    }

    fn new_session_id(&self) -> Result<SessionId> {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        self.random
            .fill(&mut bytes)
            .map_err(classify::randomness_unavailable)?;
        Ok(SessionId::new(URL_SAFE_NO_PAD.encode(bytes)))
    }

    fn emit(&self, event: &SessionEvent) {
        self.listeners.emit(event);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn schedule(self: &Arc<Self>, delay: Duration, kind: TimerKind) -> TimerHandle {
        let weak = Arc::downgrade(self);
        self.scheduler.after(
            delay,
            timer_task(move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(kind).await;
                }
            }),
        )
    }

    /// Replace every timer for a session holding `tokens`
    fn schedule_timers(self: &Arc<Self>, local: &mut Local, tokens: &OAuthTokens) {
        local.timers.cancel_all(self.scheduler.as_ref());

        let now = self.now();
        let expires_at = tokens.expires_at_ms();
        if tokens.refresh_token.is_some() {
            let refresh_at = expires_at.saturating_sub(millis(self.config.refresh_buffer));
            let delay = Duration::from_millis(refresh_at.saturating_sub(now));
            tracing::debug!(delay_ms = millis(delay), "Scheduled token refresh");
            local.timers.refresh = Some(self.schedule(delay, TimerKind::Refresh));
        } else {
            let delay = Duration::from_millis(expires_at.saturating_sub(now));
            tracing::debug!(delay_ms = millis(delay), "Scheduled token expiry");
            local.timers.expiry = Some(self.schedule(delay, TimerKind::Expiry));
        }
        local.timers.watchdog = Some(
            self.schedule(self.config.inactivity_check_interval, TimerKind::Watchdog),
        );
    }

    async fn fire(self: Arc<Self>, kind: TimerKind) {
        match kind {
            TimerKind::Refresh => self.on_refresh_timer().await,
            TimerKind::Expiry => self.on_expiry_timer(),
            TimerKind::Watchdog => self.on_watchdog(),
        }
    }

    async fn on_refresh_timer(self: &Arc<Self>) {
        self.reconcile_pending();
        if !self.local().phase.is_active() {
            return;
        }

        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!("Refresh deferred: token operation in flight");
            let mut local = self.local();
            local.timers.refresh =
                Some(self.schedule(self.config.refresh_retry_delay, TimerKind::Refresh));
            return;
        };

        match self.refresh_tokens().await {
            Ok(_) => {}
            Err(e) if e.is_recoverable() => {
                tracing::warn!(
                    kind = %e.kind(),
                    detail = e.detail().unwrap_or_default(),
                    retry_in_ms = millis(self.config.refresh_retry_delay),
                    "Token refresh failed; will retry"
                );
                let mut local = self.local();
                if local.phase.is_active() {
                    if local.phase == SessionPhase::Refreshing {
                        local.phase = SessionPhase::Authenticated;
                    }
                    local.timers.refresh =
                        Some(self.schedule(self.config.refresh_retry_delay, TimerKind::Refresh));
                }
            }
            Err(e) => {
                tracing::error!(
                    kind = %e.kind(),
                    detail = e.detail().unwrap_or_default(),
                    "Token refresh failed"
                );
                self.end_session(EndReason::RefreshFailed);
            }
        }
    }

    fn on_expiry_timer(self: &Arc<Self>) {
        self.reconcile_pending();
        if self.local().phase.is_active() {
            tracing::info!("Access token expired without a refresh token");
            self.end_session(EndReason::TokenExpired);
        }
    }

    fn on_watchdog(self: &Arc<Self>) {
        self.reconcile_pending();
        let idle = {
            let local = self.local();
            if !local.phase.is_active() {
                return;
            }
            match local.state.as_ref() {
                Some(state) => self.now().saturating_sub(state.last_activity),
                None => return,
            }
        };

        if idle >= millis(self.config.session_timeout) {
            tracing::info!(idle_ms = idle, "Session inactive; ending");
            self.end_session(EndReason::Inactivity);
            return;
        }

        let mut local = self.local();
        if local.phase.is_active() {
            local.timers.watchdog = Some(
                self.schedule(self.config.inactivity_check_interval, TimerKind::Watchdog),
            );
        }
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Refresh the access token; the caller holds the in-flight flag
    async fn refresh_tokens(self: &Arc<Self>) -> Result<OAuthTokens> {
        let Some(current) = self.tokens.load() else {
            self.end_session(EndReason::TokenExpired);
            return Err(classify::token_expired("token record missing or expired"));
        };

        // Another context already refreshed: adopt its token.
        if !self
            .tokens
            .is_expired(&current, self.config.refresh_buffer.as_secs())
        {
            self.adopt_tokens(&current);
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(classify::invalid_token("no refresh token available"));
        };

        let cancel = {
            let mut local = self.local();
            if !local.phase.is_active() {
                return Err(classify::token_expired("session ended before refresh"));
            }
            local.phase = SessionPhase::Refreshing;
            local.cancel.clone()
        };

        let result = self.token_client.refresh(&refresh_token, &cancel).await;
        if cancel.is_cancelled() {
            return Err(classify::token_expired("session ended during refresh"));
        }
        let fresh = match result {
            Ok(fresh) => fresh,
            Err(e) => {
                let mut local = self.local();
                if local.phase == SessionPhase::Refreshing {
                    local.phase = SessionPhase::Authenticated;
                }
                return Err(e);
            }
        };

        self.tokens.save(&fresh)?;

        let snapshot = {
            let mut local = self.local();
            let snapshot = local.state.as_mut().map(|state| {
                state.token_expiry = Some(fresh.expires_at_ms());
                state.clone()
            });
            local.phase = SessionPhase::Authenticated;
            self.schedule_timers(&mut local, &fresh);
            snapshot
        };

        if let Some(snapshot) = snapshot {
            if let Err(e) = self.persist(&snapshot) {
                tracing::warn!(detail = e.detail().unwrap_or_default(), "Could not persist session");
            }
            tracing::debug!(session_id = %snapshot.session_id, "Token refreshed");
            self.emit(&SessionEvent::TokenRefresh {
                session_id: snapshot.session_id,
                expires_at: fresh.expires_at_ms(),
            });
        }
        Ok(fresh)
    }

    /// Take over a token written by another context
    fn adopt_tokens(self: &Arc<Self>, tokens: &OAuthTokens) {
        let expires_at = tokens.expires_at_ms();
        let changed = {
            let mut local = self.local();
            let Some(state) = local.state.as_mut() else {
                return;
            };
            let changed = state.token_expiry != Some(expires_at);
            state.token_expiry = Some(expires_at);
            let session_id = state.session_id.clone();
            if local.phase == SessionPhase::Refreshing {
                local.phase = SessionPhase::Authenticated;
            }
            self.schedule_timers(&mut local, tokens);
            changed.then_some(session_id)
        };

        if let Some(session_id) = changed {
            tracing::debug!(session_id = %session_id, "Adopted token refreshed elsewhere");
            self.emit(&SessionEvent::TokenRefresh {
                session_id,
                expires_at,
            });
        }
    }

    // ------------------------------------------------------------------
    // Ending
    // ------------------------------------------------------------------

    fn end_session(self: &Arc<Self>, reason: EndReason) {
        self.finish(reason, true);
    }

    fn finish(&self, reason: EndReason, clear_durable: bool) {
        let ended = {
            let mut local = self.local();
            local.timers.cancel_all(self.scheduler.as_ref());
            local.cancel.cancel();
            let was_active = local.phase.is_active();
            let state = local.state.take();
            local.phase = if was_active && !reason.is_logout() {
                SessionPhase::Expired
            } else {
                SessionPhase::Unauthenticated
            };
            was_active.then(|| state.map(|s| s.session_id))
        };

        if clear_durable {
            self.clear_durable();
        }

        if let Some(session_id) = ended {
            tracing::info!(
                reason = %reason,
                session_id = session_id.as_deref().unwrap_or_default(),
                "Session ended"
            );
            self.emit(&SessionEvent::ended(session_id, reason));
        }

        let mut local = self.local();
        if local.phase == SessionPhase::Expired {
            local.phase = SessionPhase::Unauthenticated;
        }
    }

    // ------------------------------------------------------------------
    // Cross-context sync
    // ------------------------------------------------------------------

    fn reconcile_pending(self: &Arc<Self>) {
        loop {
            let event = {
                let mut changes = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
                match changes.as_mut() {
                    Some(feed) => feed.try_recv(),
                    None => None,
                }
            };
            let Some(event) = event else {
                break;
            };
            self.handle_external(event);
        }
    }

    fn handle_external(self: &Arc<Self>, event: StorageEvent) {
        if event.key != self.keys.session() {
            return;
        }

        let Some(record) = event.new_value else {
            if self.local().phase.is_active() {
                tracing::debug!(origin = %event.origin, "Session ended in another context");
                // The originating context already cleared storage.
                self.finish(EndReason::CrossTabLogout, false);
            }
            return;
        };

        let theirs = match serde_json::from_str::<SessionState>(&record) {
            Ok(state) if state.is_authenticated => state,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable session record from another context");
                return;
            }
        };

        if self.local().phase.is_active() {
            self.merge_external(&theirs);
        } else {
            self.adopt_external(theirs);
        }
    }

    fn merge_external(self: &Arc<Self>, theirs: &SessionState) {
        let needs_reschedule = {
            let mut local = self.local();
            match local.state.as_mut() {
                Some(mine) if mine.session_id == theirs.session_id => mine.merge_external(theirs),
                Some(mine) => {
                    tracing::debug!(session_id = %theirs.session_id, "Session replaced in another context");
                    *mine = theirs.clone();
                    true
                }
                None => false,
            }
        };
        if !needs_reschedule {
            return;
        }

        let Some(tokens) = self.tokens.load() else {
            self.end_session(EndReason::TokenExpired);
            return;
        };
        let mut local = self.local();
        if local.phase.is_active() {
            self.schedule_timers(&mut local, &tokens);
        }
    }

    fn adopt_external(self: &Arc<Self>, theirs: SessionState) {
        let Some(tokens) = self.tokens.load() else {
            tracing::debug!("Session record from another context has no valid token");
            return;
        };

        let session_id = theirs.session_id.clone();
        {
            let mut local = self.local();
            if local.phase.is_active() || local.phase == SessionPhase::Authenticating {
                return;
            }
            local.phase = SessionPhase::Authenticated;
            local.state = Some(SessionState {
                token_expiry: Some(tokens.expires_at_ms()),
                ..theirs
            });
            if local.cancel.is_cancelled() {
                local.cancel = CancellationToken::new();
            }
            self.schedule_timers(&mut local, &tokens);
        }

        tracing::info!(session_id = %session_id, "Adopted session from another context");
        self.emit(&SessionEvent::Login {
            session_id,
            reason: LoginReason::CrossTabLogin,
        });
    }
}

/// Session state machine for one browsing context
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("phase", &self.phase())
            .field("listeners", &self.inner.listeners)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager; no session is active until [`restore`](Self::restore),
    /// [`start_session`](Self::start_session) or a cross-context login
    pub fn new(oauth: Arc<OAuthConfig>, config: SessionConfig, ports: SessionPorts) -> Self {
        let keys = StorageKeys::new(oauth.storage_namespace.clone());
        let tokens = TokenStore::new(Arc::clone(&ports.store), &keys, Arc::clone(&ports.clock));
        let token_client = TokenClient::new(
            oauth,
            ports.transport,
            Arc::clone(&ports.scheduler),
            Arc::clone(&ports.clock),
            config.retry,
        );
        let changes = ports.store.subscribe();

        Self {
            inner: Arc::new(Inner {
                config,
                keys,
                store: ports.store,
                tokens,
                token_client,
                scheduler: ports.scheduler,
                clock: ports.clock,
                random: ports.random,
                listeners: ListenerRegistry::default(),
                in_flight: AtomicBool::new(false),
                local: Mutex::new(Local::default()),
                changes: Mutex::new(changes),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a listener for session events
    pub fn subscribe(&self, listener: SharedSessionListener) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.local().phase
    }

    /// Snapshot of the active session
    #[must_use]
    pub fn session_state(&self) -> Option<SessionState> {
        self.inner.reconcile_pending();
        self.inner.local().state.clone()
    }

    /// Profile fetched at login, if any
    #[must_use]
    pub fn user_info(&self) -> Option<serde_json::Value> {
        self.session_state().and_then(|state| state.user_info)
    }

    /// Whether a session is active and its token is still valid
    ///
    /// A token that expired since the last check is evicted here, which
    /// ends the session with [`EndReason::TokenExpired`].
    pub fn is_authenticated(&self) -> bool {
        let inner = &self.inner;
        inner.reconcile_pending();
        if !inner.local().phase.is_active() {
            return false;
        }
        if inner.tokens.load().is_none() {
            inner.end_session(EndReason::TokenExpired);
            return false;
        }
        true
    }

    /// Exchange a validated authorization code for tokens
    ///
    /// # Errors
    /// Fails with `temporarily_unavailable` if another exchange or a
    /// refresh is running, or with the classified exchange error.
    pub async fn exchange_code(&self, callback: &ValidatedCallback) -> Result<OAuthTokens> {
        let inner = &self.inner;
        let Some(_guard) = InFlight::acquire(&inner.in_flight) else {
            return Err(classify::operation_in_flight("token_exchange"));
        };

        let (previous, cancel) = {
            let mut local = inner.local();
            let previous = local.phase;
            if !previous.is_active() {
                local.phase = SessionPhase::Authenticating;
            }
            if local.cancel.is_cancelled() {
                local.cancel = CancellationToken::new();
            }
            (previous, local.cancel.clone())
        };

        let result = inner
            .token_client
            .exchange(&callback.code, &callback.code_verifier, &cancel)
            .await;
        let result = match result {
            Ok(_) if cancel.is_cancelled() => {
                Err(classify::invalid_request("sign-in cancelled during token exchange"))
            }
            other => other,
        };

        if let Err(e) = &result {
            tracing::warn!(
                kind = %e.kind(),
                detail = e.detail().unwrap_or_default(),
                "Token exchange failed"
            );
            let mut local = inner.local();
            if local.phase == SessionPhase::Authenticating {
                local.phase = if previous == SessionPhase::Authenticating {
                    SessionPhase::Unauthenticated
                } else {
                    previous
                };
            }
        }
        result
    }

    /// Start a session with freshly exchanged tokens
    ///
    /// # Errors
    /// Fails if the tokens or the session record cannot be persisted, or
    /// if no secure randomness is available for the session id.
    pub fn start_session(
        &self,
        tokens: OAuthTokens,
        user_info: Option<serde_json::Value>,
    ) -> Result<SessionState> {
        let inner = &self.inner;
        let reset_phase = || {
            let mut local = inner.local();
            if local.phase == SessionPhase::Authenticating {
                local.phase = SessionPhase::Unauthenticated;
            }
        };

        let session_id = match inner.new_session_id() {
            Ok(id) => id,
            Err(e) => {
                reset_phase();
                return Err(e);
            }
        };
        if let Err(e) = inner.tokens.save(&tokens) {
            reset_phase();
            return Err(e);
        }

        let state = SessionState {
            session_id,
            is_authenticated: true,
            user_info,
            token_expiry: Some(tokens.expires_at_ms()),
            last_activity: inner.now(),
        };
        if let Err(e) = inner.persist(&state) {
            inner.tokens.clear();
            reset_phase();
            return Err(e);
        }

        {
            let mut local = inner.local();
            local.phase = SessionPhase::Authenticated;
            local.state = Some(state.clone());
            if local.cancel.is_cancelled() {
                local.cancel = CancellationToken::new();
            }
            inner.schedule_timers(&mut local, &tokens);
        }

        tracing::info!(session_id = %state.session_id, "Session started");
        inner.emit(&SessionEvent::Login {
            session_id: state.session_id.clone(),
            reason: LoginReason::Callback,
        });
        Ok(state)
    }

    /// Adopt a persisted session, if one is still valid
    ///
    /// Returns whether a session is active afterwards.
    pub fn restore(&self) -> bool {
        let inner = &self.inner;
        if inner.local().phase.is_active() {
            return true;
        }
        let Some(state) = inner.load_record() else {
            return false;
        };
        if !state.is_authenticated {
            return false;
        }
        let Some(tokens) = inner.tokens.load() else {
            tracing::debug!("Persisted session has no valid token; clearing");
            inner.clear_durable();
            return false;
        };
        if inner.now().saturating_sub(state.last_activity) >= millis(inner.config.session_timeout) {
            tracing::debug!("Persisted session timed out; clearing");
            inner.clear_durable();
            return false;
        }

        let session_id = state.session_id.clone();
        {
            let mut local = inner.local();
            local.phase = SessionPhase::Authenticated;
            local.state = Some(SessionState {
                token_expiry: Some(tokens.expires_at_ms()),
                ..state
            });
            if local.cancel.is_cancelled() {
                local.cancel = CancellationToken::new();
            }
            inner.schedule_timers(&mut local, &tokens);
        }

        tracing::info!(session_id = %session_id, "Restored persisted session");
        inner.emit(&SessionEvent::Login {
            session_id,
            reason: LoginReason::Restored,
        });
        true
    }

    /// A token that is valid now, refreshed first if it is close to expiry
    ///
    /// # Errors
    /// Fails with `invalid_token` when no session is active, `token_expired`
    /// when the token lapsed, or the refresh error if a non-recoverable
    /// refresh failure ended the session.
    pub async fn valid_token(&self) -> Result<OAuthTokens> {
        let inner = &self.inner;
        inner.reconcile_pending();
        if !inner.local().phase.is_active() {
            return Err(classify::invalid_token("no active session"));
        }
        let Some(current) = inner.tokens.load() else {
            inner.end_session(EndReason::TokenExpired);
            return Err(classify::token_expired("stored token expired"));
        };
        if current.refresh_token.is_none()
            || !inner
                .tokens
                .is_expired(&current, inner.config.refresh_buffer.as_secs())
        {
            return Ok(current);
        }

        // Someone else is already refreshing and the token still works.
        let Some(_guard) = InFlight::acquire(&inner.in_flight) else {
            return Ok(current);
        };
        match inner.refresh_tokens().await {
            Ok(fresh) => Ok(fresh),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(kind = %e.kind(), "Early refresh failed; using current token");
                Ok(current)
            }
            Err(e) => {
                inner.end_session(EndReason::RefreshFailed);
                Err(e)
            }
        }
    }

    /// Cancellation token of the current session
    ///
    /// It fires when the session ends, so retry loops running on behalf of
    /// the session stop between attempts.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.local().cancel.clone()
    }

    /// Record user activity; returns whether it was recorded or throttled
    pub fn record_activity(&self, signal: ActivitySignal) -> bool {
        let inner = &self.inner;
        inner.reconcile_pending();
        let now = inner.now();
        let snapshot = {
            let mut local = inner.local();
            if !local.phase.is_active() {
                return false;
            }
            let Some(state) = local.state.as_mut() else {
                return false;
            };
            if now.saturating_sub(state.last_activity) < millis(inner.config.activity_throttle) {
                return false;
            }
            state.last_activity = now;
            state.clone()
        };

        if let Err(e) = inner.persist(&snapshot) {
            tracing::warn!(detail = e.detail().unwrap_or_default(), "Could not persist activity");
        }
        inner.emit(&SessionEvent::Activity {
            session_id: snapshot.session_id,
            signal,
            at: now,
        });
        true
    }

    /// End the session, clearing tokens and the durable record
    ///
    /// Ending an already-ended session does nothing beyond clearing storage.
    pub fn end_session(&self, reason: EndReason) {
        self.inner.end_session(reason);
    }

    /// Apply changes other contexts made since the last call
    pub fn reconcile_pending(&self) {
        self.inner.reconcile_pending();
    }

    /// Apply external changes as they arrive, on a background task
    ///
    /// Returns `false` if there is no tokio runtime, the store has no
    /// change feed, or sync is already running.
    pub fn spawn_sync(&self) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let Some(mut changes) = self
            .inner
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return false;
        };

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        runtime.spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = changes.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_external(event);
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::pkce::OsRandom;
    use crate::error::OAuthErrorKind;
    use crate::runtime::{ManualClock, ManualScheduler};
    use crate::storage::MemoryStore;
    use crate::transport::{HttpRequest, HttpResponse, ScriptedTransport, TransportError};
    use async_trait::async_trait;
    use serde_json::json;

    struct Harness {
        manager: SessionManager,
        scheduler: ManualScheduler,
        transport: ScriptedTransport,
        events: Arc<Mutex<Vec<SessionEvent>>>,
    }

    fn harness() -> Harness {
        let scheduler = ManualScheduler::new(ManualClock::new(1_000_000));
        let transport = ScriptedTransport::new();
        let ports = SessionPorts {
            store: Arc::new(MemoryStore::new().context()),
            clock: Arc::new(scheduler.clock().clone()),
            scheduler: Arc::new(scheduler.clone()),
            random: Arc::new(OsRandom),
            transport: Arc::new(transport.clone()),
        };
        let manager = SessionManager::new(
            Arc::new(OAuthConfig::default()),
            SessionConfig::default(),
            ports,
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.subscribe(Arc::new(move |event: &SessionEvent| {
            sink.lock().unwrap().push(event.clone());
        }));
        Harness {
            manager,
            scheduler,
            transport,
            events,
        }
    }

    fn tokens(now: u64, refresh: bool) -> OAuthTokens {
        OAuthTokens {
            access_token: "tok".to_string(),
            refresh_token: refresh.then(|| "ref".to_string()),
            token_type: "Bearer".to_string(),
            scope: String::new(),
            expires_in: 3600,
            issued_at: now,
        }
    }

    /// Advance 1100 s per step, recording activity so the watchdog stays quiet
    async fn stay_active(h: &Harness, steps: u32) {
        for _ in 0..steps {
            h.scheduler.advance(Duration::from_secs(1100)).await;
            h.manager.record_activity(ActivitySignal::KeyPress);
        }
    }

    /// Ends the session while the first token request is on the wire
    struct LogoutDuringFirstRequest {
        replies: ScriptedTransport,
        manager: Mutex<Option<SessionManager>>,
    }

    #[async_trait]
    impl HttpTransport for LogoutDuringFirstRequest {
        async fn send(
            &self,
            request: HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            let manager = self.manager.lock().unwrap().take();
            if let Some(manager) = manager {
                manager.end_session(EndReason::UserLogout);
            }
            self.replies.send(request).await
        }
    }

    fn names(events: &Arc<Mutex<Vec<SessionEvent>>>) -> Vec<&'static str> {
        events.lock().unwrap().iter().map(SessionEvent::name).collect()
    }

    #[tokio::test]
    async fn test_start_session_schedules_refresh_and_watchdog() {
        let h = harness();
        h.manager
            .start_session(tokens(1_000_000, true), None)
            .unwrap();

        assert_eq!(h.manager.phase(), SessionPhase::Authenticated);
        assert_eq!(h.scheduler.pending(), 2);
        assert_eq!(names(&h.events), vec!["login"]);
    }

    #[tokio::test]
    async fn test_refresh_fires_before_expiry() {
        let h = harness();
        h.manager
            .start_session(tokens(1_000_000, true), None)
            .unwrap();
        h.transport.push_json(
            200,
            &json!({"access_token": "tok2", "token_type": "Bearer", "expires_in": 3600}),
        );
        stay_active(&h, 3).await;

        assert_eq!(h.transport.request_count(), 1);
        let refreshed = h.manager.valid_token().await.unwrap();
        assert_eq!(refreshed.access_token, "tok2");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("ref"));
        assert!(names(&h.events).contains(&"token_refresh"));
        assert_eq!(h.scheduler.pending(), 2);
    }

    #[tokio::test]
    async fn test_recoverable_refresh_failure_retries_later() {
        let h = harness();
        h.manager
            .start_session(tokens(1_000_000, true), None)
            .unwrap();
        for _ in 0..3 {
            h.transport.push(HttpResponse::new(503, ""));
        }

        stay_active(&h, 3).await;

        assert_eq!(h.transport.request_count(), 3);
        assert!(h.manager.is_authenticated());
        assert!(!names(&h.events).contains(&"session_expired"));
    }

    #[tokio::test]
    async fn test_non_recoverable_refresh_failure_ends_session() {
        let h = harness();
        h.manager
            .start_session(tokens(1_000_000, true), None)
            .unwrap();
        h.transport
            .push_json(400, &json!({"error": "invalid_grant"}));

        stay_active(&h, 3).await;

        assert_eq!(h.manager.phase(), SessionPhase::Unauthenticated);
        assert!(matches!(
            h.events.lock().unwrap().last(),
            Some(SessionEvent::SessionExpired {
                reason: EndReason::RefreshFailed,
                ..
            })
        ));
        assert!(!h.manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_activity_is_throttled() {
        let h = harness();
        h.manager
            .start_session(tokens(1_000_000, true), None)
            .unwrap();

        assert!(!h.manager.record_activity(ActivitySignal::Click));
        h.scheduler.clock().advance(Duration::from_secs(5));
        assert!(h.manager.record_activity(ActivitySignal::Click));
        h.scheduler.clock().advance(Duration::from_secs(2));
        assert!(!h.manager.record_activity(ActivitySignal::Scroll));

        assert_eq!(names(&h.events), vec!["login", "activity"]);
    }

    #[tokio::test]
    async fn test_exchange_conflicts_with_running_operation() {
        let h = harness();
        let _held = InFlight::acquire(&h.manager.inner.in_flight).unwrap();

        let err = h
            .manager
            .exchange_code(&ValidatedCallback {
                code: "abc123valid".to_string(),
                code_verifier: "v".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OAuthErrorKind::TemporarilyUnavailable);
        assert!(err.is_recoverable());
        assert_eq!(h.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_timer_defers_while_exchange_in_flight() {
        let h = harness();
        h.manager
            .start_session(tokens(1_000_000, true), None)
            .unwrap();
        h.transport.push_json(
            200,
            &json!({"access_token": "tok2", "token_type": "Bearer", "expires_in": 3600}),
        );

        let held = InFlight::acquire(&h.manager.inner.in_flight).unwrap();
        // Reaches the refresh point (expiry minus 5 min) with the flag held.
        stay_active(&h, 3).await;
        assert_eq!(h.transport.request_count(), 0);
        assert_eq!(h.scheduler.pending(), 2);
        drop(held);

        // The deferred refresh runs one retry delay (60 s) later.
        h.scheduler.advance(Duration::from_secs(59)).await;
        assert_eq!(h.transport.request_count(), 0);
        h.scheduler.advance(Duration::from_secs(1)).await;
        assert_eq!(h.transport.request_count(), 1);
        assert!(names(&h.events).contains(&"token_refresh"));
        assert_eq!(h.manager.valid_token().await.unwrap().access_token, "tok2");
    }

    #[tokio::test]
    async fn test_logout_stops_refresh_retries() {
        let scheduler = ManualScheduler::new(ManualClock::new(1_000_000));
        let replies = ScriptedTransport::new();
        replies
            .push(HttpResponse::new(503, ""))
            .push(HttpResponse::new(503, ""))
            .push_json(
                200,
                &json!({"access_token": "tok2", "token_type": "Bearer", "expires_in": 3600}),
            );
        let transport = Arc::new(LogoutDuringFirstRequest {
            replies: replies.clone(),
            manager: Mutex::new(None),
        });
        let ports = SessionPorts {
            store: Arc::new(MemoryStore::new().context()),
            clock: Arc::new(scheduler.clock().clone()),
            scheduler: Arc::new(scheduler.clone()),
            random: Arc::new(OsRandom),
            transport: Arc::clone(&transport) as Arc<dyn HttpTransport>,
        };
        let manager = SessionManager::new(
            Arc::new(OAuthConfig::default()),
            SessionConfig::default(),
            ports,
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.subscribe(Arc::new(move |event: &SessionEvent| {
            sink.lock().unwrap().push(event.clone());
        }));
        manager
            .start_session(tokens(1_000_000, true), None)
            .unwrap();
        *transport.manager.lock().unwrap() = Some(manager.clone());

        // Inside the refresh window without running any timer.
        scheduler.clock().advance(Duration::from_secs(3400));
        let err = manager.valid_token().await.unwrap_err();

        assert_eq!(err.kind(), OAuthErrorKind::TokenExpired);
        assert_eq!(replies.request_count(), 1);
        assert_eq!(replies.remaining(), 2);
        assert!(scheduler.slept().is_empty());
        assert_eq!(manager.phase(), SessionPhase::Unauthenticated);
        assert_eq!(names(&events), vec!["login", "logout"]);
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let h = harness();
        h.manager
            .start_session(tokens(1_000_000, false), None)
            .unwrap();

        h.manager.end_session(EndReason::UserLogout);
        h.manager.end_session(EndReason::UserLogout);

        assert_eq!(names(&h.events), vec!["login", "logout"]);
        assert_eq!(h.scheduler.pending(), 0);
    }
}
