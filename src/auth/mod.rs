//! OAuth authentication for Claude subscriptions
//!
//! Implements the Authorization Code flow with PKCE (Proof Key for Code Exchange).
//!
//! # Overview
//!
//! 1. [`OAuthClient::start_flow`] generates a verifier, challenge and `state`,
//!    persists them as the pending attempt and returns the authorization URL
//! 2. The user signs in with the provider, which redirects back with
//!    `code` and `state`
//! 3. [`OAuthClient::handle_redirect`] (or `handle_callback`) checks `state`
//!    against the pending attempt, exchanges code + verifier for tokens and
//!    starts the session
//! 4. The session refreshes the access token before it expires
//!
//! # Example
//!
//! ```no_run
//! use anthropic_oauth_session::auth::OAuthClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OAuthClient::builder().build();
//!     if !client.is_authenticated() {
//!         let url = client.start_flow()?;
//!         println!("Sign in at {url}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Security
//!
//! - Verifier and `state` come from the operating system's CSPRNG
//! - `state` is compared in constant time; a mismatch never reaches the
//!   token endpoint
//! - Pending attempts are one-shot and expire
//! - Tokens, verifiers and codes are never logged

pub mod authorize;
pub mod callback;
pub mod classify;
pub mod exchange;
mod oauth;
pub mod pkce;
pub mod token;

pub use authorize::{AuthorizationAttempt, AuthorizationRequestBuilder};
pub use callback::{CallbackValidator, RedirectParams, ValidatedCallback};
pub use exchange::TokenClient;
pub use oauth::{OAuthClient, OAuthClientBuilder};
pub use pkce::{OsRandom, PkceChallenge, RandomSource};
pub use token::{OAuthTokens, TokenStore};
