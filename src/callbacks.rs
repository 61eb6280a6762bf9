//! Trait-based session listeners.
//!
//! Implement [`SessionListener`] on your own type, or pass a closure: every
//! `Fn(&SessionEvent) + Send + Sync` is a listener through the blanket
//! implementation.
//!
//! # Example: Implementing `SessionListener`
//!
//! ```
//! use anthropic_oauth_session::callbacks::SessionListener;
//! use anthropic_oauth_session::session::SessionEvent;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct LogoutCounter {
//!     logouts: AtomicUsize,
//! }
//!
//! impl SessionListener for LogoutCounter {
//!     fn on_event(&self, event: &SessionEvent) {
//!         if matches!(event, SessionEvent::Logout { .. }) {
//!             self.logouts.fetch_add(1, Ordering::Relaxed);
//!         }
//!     }
//! }
//! ```
//!
//! # Example: Using a closure
//!
//! ```
//! use anthropic_oauth_session::callbacks::SharedSessionListener;
//! use anthropic_oauth_session::session::SessionEvent;
//! use std::sync::Arc;
//!
//! let listener: SharedSessionListener = Arc::new(|event: &SessionEvent| {
//!     println!("session event: {}", event.name());
//! });
//! ```

use std::sync::Arc;

use crate::session::SessionEvent;

/// Receives session lifecycle events.
///
/// Listeners run synchronously on the task that caused the transition and
/// must not block. A panicking listener is logged and skipped; the
/// remaining listeners still run.
pub trait SessionListener: Send + Sync {
    /// Called once per emitted event.
    fn on_event(&self, event: &SessionEvent);
}

impl<F> SessionListener for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent) {
        self(event);
    }
}

/// Type alias for a shared session listener.
pub type SharedSessionListener = Arc<dyn SessionListener>;
