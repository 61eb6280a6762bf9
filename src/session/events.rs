//! Session lifecycle events and listener registry

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use super::state::ActivitySignal;
use crate::callbacks::SharedSessionListener;
use crate::types::{ListenerId, SessionId};

/// Why a session started in this context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginReason {
    /// Authorization callback and token exchange completed here
    Callback,
    /// Another context signed in and this one adopted the session
    CrossTabLogin,
    /// A persisted session was picked up on start-up
    Restored,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Explicit logout
    UserLogout,
    /// Another context logged out
    CrossTabLogout,
    /// No activity within the session timeout
    Inactivity,
    /// Refresh failed with a non-recoverable error
    RefreshFailed,
    /// The access token expired and could not be refreshed
    TokenExpired,
    /// A resource server rejected the access token
    TokenRejected,
}

impl EndReason {
    /// Wire name of the reason
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserLogout => "user_logout",
            Self::CrossTabLogout => "cross_tab_logout",
            Self::Inactivity => "inactivity",
            Self::RefreshFailed => "refresh_failed",
            Self::TokenExpired => "token_expired",
            Self::TokenRejected => "token_rejected",
        }
    }

    /// Whether the end is reported as a logout rather than an expiry
    #[must_use]
    pub fn is_logout(self) -> bool {
        matches!(self, Self::UserLogout | Self::CrossTabLogout)
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed session lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session became active in this context
    Login {
        /// New session
        session_id: SessionId,
        /// How it started
        reason: LoginReason,
    },
    /// The session ended by user or cross-context logout
    Logout {
        /// Session that ended, if one was active
        session_id: Option<SessionId>,
        /// Why it ended
        reason: EndReason,
    },
    /// The access token was replaced
    TokenRefresh {
        /// Session the token belongs to
        session_id: SessionId,
        /// Unix milliseconds when the new token expires
        expires_at: u64,
    },
    /// The session ended for any reason other than logout
    SessionExpired {
        /// Session that ended, if one was active
        session_id: Option<SessionId>,
        /// Why it ended
        reason: EndReason,
    },
    /// User activity was recorded
    Activity {
        /// Session the activity belongs to
        session_id: SessionId,
        /// Kind of interaction
        signal: ActivitySignal,
        /// Unix milliseconds of the interaction
        at: u64,
    },
}

impl SessionEvent {
    /// Event name (`login`, `logout`, `token_refresh`, `session_expired`, `activity`)
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Logout { .. } => "logout",
            Self::TokenRefresh { .. } => "token_refresh",
            Self::SessionExpired { .. } => "session_expired",
            Self::Activity { .. } => "activity",
        }
    }

    pub(crate) fn ended(session_id: Option<SessionId>, reason: EndReason) -> Self {
        if reason.is_logout() {
            Self::Logout { session_id, reason }
        } else {
            Self::SessionExpired { session_id, reason }
        }
    }
}

/// Registered listeners, called in registration order
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, SharedSessionListener)>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, SharedSessionListener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, listener: SharedSessionListener) -> ListenerId {
        let id = ListenerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners().len()
    }

    /// Deliver `event` to every listener, isolating panics
    pub(crate) fn emit(&self, event: &SessionEvent) {
        // Snapshot so listeners may subscribe or unsubscribe re-entrantly.
        let snapshot: Vec<_> = self.listeners().clone();
        tracing::debug!(event = event.name(), listeners = snapshot.len(), "Emitting session event");

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                tracing::warn!(
                    listener = ?id,
                    event = event.name(),
                    "Session listener panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn logout() -> SessionEvent {
        SessionEvent::Logout {
            session_id: None,
            reason: EndReason::UserLogout,
        }
    }

    #[test]
    fn test_ended_picks_event_by_reason() {
        let id = Some(SessionId::new("s"));
        assert_eq!(
            SessionEvent::ended(id.clone(), EndReason::CrossTabLogout).name(),
            "logout"
        );
        assert_eq!(
            SessionEvent::ended(id, EndReason::Inactivity).name(),
            "session_expired"
        );
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SessionEvent::SessionExpired {
            session_id: Some(SessionId::new("s1")),
            reason: EndReason::Inactivity,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_expired");
        assert_eq!(json["reason"], "inactivity");
        assert_eq!(json["session_id"], "s1");
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let registry = ListenerRegistry::default();
        let calls = Arc::new(AtomicU64::new(0));

        registry.add(Arc::new(|_: &SessionEvent| panic!("listener bug")));
        let counter = Arc::clone(&calls);
        registry.add(Arc::new(move |_: &SessionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&logout());
        registry.emit(&logout());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_listener() {
        let registry = ListenerRegistry::default();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let id = registry.add(Arc::new(move |_: &SessionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.emit(&logout());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 0);
    }
}
