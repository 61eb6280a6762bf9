//! # OAuth session client for Claude subscriptions
//!
//! Lets an application act on behalf of a user's Claude subscription:
//! OAuth 2.0 Authorization Code flow with PKCE, token storage and refresh,
//! authenticated requests, and a session lifecycle that stays coherent
//! across several concurrently open contexts (tabs, windows, processes).
//!
//! ## Quick Start
//!
//! ```no_run
//! use anthropic_oauth_session::OAuthClient;
//! use anthropic_oauth_session::types::{ChatMessage, MessageRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OAuthClient::builder().build();
//!
//!     if !client.is_authenticated() {
//!         let url = client.start_flow()?;
//!         println!("Sign in at: {url}");
//!         // ... the provider redirects back with ?code=...&state=...
//!         # let redirect = String::new();
//!         client.handle_redirect(&redirect).await?;
//!     }
//!
//!     let request = MessageRequest::builder()
//!         .model("claude-sonnet-4-5")
//!         .messages(vec![ChatMessage::user("Explain photosynthesis simply")])
//!         .build();
//!     let reply = client.send_message(&request).await?;
//!     println!("{}", reply.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Session Events
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use anthropic_oauth_session::{OAuthClient, SessionEvent};
//! let client = OAuthClient::builder()
//!     .listener(Arc::new(|event: &SessionEvent| {
//!         println!("session event: {}", event.name());
//!     }))
//!     .build();
//! ```
//!
//! ## Architecture
//!
//! - [`auth`]: PKCE, authorization URL, callback validation, token exchange,
//!   token store, error classifier and the [`OAuthClient`] facade
//! - [`session`]: session state machine, refresh and inactivity timers,
//!   cross-context sync
//! - [`gateway`]: bearer-authenticated requests to protected resources
//! - [`storage`]: durable key-value port with memory and file backends
//! - [`transport`]: HTTP port with a `reqwest` backend
//! - [`runtime`]: clock and scheduler ports, real and virtual
//! - [`retry`]: the retry policy shared by every network call
//! - [`error`]: error taxonomy
//!
//! Every side effect goes through an injectable port, so the whole flow
//! can run deterministically in tests with [`storage::MemoryStore`],
//! [`transport::ScriptedTransport`] and [`runtime::ManualScheduler`].
//!
//! ## Logging
//!
//! This crate uses [`tracing`](https://crates.io/crates/tracing) for structured logging.
//! Tracing events are always emitted but are zero-cost when no subscriber is attached.
//! To see logs, attach a tracing subscriber in your application:
//!
//! ```rust,ignore
//! tracing_subscriber::fmt::init();
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T, OAuthError>`](Result). Every
//! error carries a kind, a user-facing message and a recoverability flag:
//!
//! ```no_run
//! # use anthropic_oauth_session::{OAuthClient, OAuthErrorKind};
//! # async fn example(client: &OAuthClient) {
//! match client.handle_redirect("?code=...&state=...").await {
//!     Ok(_) => {}
//!     Err(e) if e.kind() == OAuthErrorKind::InvalidRequest => {
//!         eprintln!("{e}");
//!     }
//!     Err(e) if e.is_recoverable() => eprintln!("Try again: {e}"),
//!     Err(e) => eprintln!("Sign-in failed: {e}"),
//! }
//! # }
//! ```
//!
//! ## Security
//!
//! - **CSPRNG only** - verifiers, `state` and session ids come from the OS random source
//! - **CSRF** - `state` is checked in constant time before any network call
//! - **One-shot attempts** - a pending attempt is consumed by its callback and expires
//! - **No secrets in logs** - tokens, codes and verifiers are never logged
//! - **File permissions** - the file store is written with user-only permissions (600)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod gateway;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use auth::{OAuthClient, OAuthClientBuilder, OAuthTokens};
pub use callbacks::{SessionListener, SharedSessionListener};
pub use config::{OAuthConfig, SessionConfig};
pub use error::{OAuthError, OAuthErrorKind, Result, StorageError};
pub use gateway::{AuthenticatedGateway, RequestOptions};
pub use retry::RetryPolicy;
pub use session::{
    ActivitySignal, EndReason, LoginReason, SessionEvent, SessionManager, SessionPhase,
    SessionPorts, SessionState,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use types::{ListenerId, SessionId};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
