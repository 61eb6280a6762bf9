//! Session snapshot and phases

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Lifecycle phase of the local session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session
    #[default]
    Unauthenticated,
    /// Exchanging an authorization code
    Authenticating,
    /// Session active
    Authenticated,
    /// Session active, access token being refreshed
    Refreshing,
    /// Session ended; transitions straight back to `Unauthenticated`
    Expired,
}

impl SessionPhase {
    /// Whether a session is active in this phase
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Authenticated | Self::Refreshing)
    }
}

/// User interaction kinds that count as activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    /// Pointer click
    Click,
    /// Key press
    KeyPress,
    /// Scroll
    Scroll,
    /// Pointer movement
    MouseMove,
    /// Touch start
    Touch,
    /// Window or tab focus
    Focus,
}

/// Durable session snapshot, shared across contexts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Random session identifier
    pub session_id: SessionId,
    /// Whether the session is authenticated
    pub is_authenticated: bool,
    /// Profile returned by the provider, if fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<serde_json::Value>,
    /// Unix milliseconds when the current access token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<u64>,
    /// Unix milliseconds of the last recorded activity
    pub last_activity: u64,
}

impl SessionState {
    /// Merge a snapshot written by another context
    ///
    /// Activity only moves forward and a later token expiry wins. Returns
    /// whether the token expiry changed, which means timers need
    /// rescheduling.
    pub fn merge_external(&mut self, other: &Self) -> bool {
        self.last_activity = self.last_activity.max(other.last_activity);
        if other.user_info.is_some() && self.user_info.is_none() {
            self.user_info.clone_from(&other.user_info);
        }
        match (self.token_expiry, other.token_expiry) {
            (Some(mine), Some(theirs)) if theirs > mine => {
                self.token_expiry = Some(theirs);
                true
            }
            (None, Some(theirs)) => {
                self.token_expiry = Some(theirs);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(last_activity: u64, token_expiry: Option<u64>) -> SessionState {
        SessionState {
            session_id: SessionId::new("s"),
            is_authenticated: true,
            user_info: None,
            token_expiry,
            last_activity,
        }
    }

    #[test]
    fn test_merge_takes_latest_activity_and_expiry() {
        let mut mine = state(5_000, Some(100_000));
        let theirs = state(9_000, Some(200_000));

        assert!(mine.merge_external(&theirs));
        assert_eq!(mine.last_activity, 9_000);
        assert_eq!(mine.token_expiry, Some(200_000));
    }

    #[test]
    fn test_merge_ignores_older_values() {
        let mut mine = state(9_000, Some(200_000));
        let theirs = state(5_000, Some(100_000));

        assert!(!mine.merge_external(&theirs));
        assert_eq!(mine.last_activity, 9_000);
        assert_eq!(mine.token_expiry, Some(200_000));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json = serde_json::to_value(state(1, None)).unwrap();
        assert_eq!(json["session_id"], "s");
        assert_eq!(json["is_authenticated"], true);
        assert!(json.get("token_expiry").is_none());
    }

    #[test]
    fn test_active_phases() {
        assert!(SessionPhase::Authenticated.is_active());
        assert!(SessionPhase::Refreshing.is_active());
        assert!(!SessionPhase::Authenticating.is_active());
        assert!(!SessionPhase::Expired.is_active());
    }
}
