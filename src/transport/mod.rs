//! HTTP transport abstraction
//!
//! Token exchange and authenticated requests talk to the provider through
//! the [`HttpTransport`] trait so the network can be swapped for a scripted
//! fake in tests. [`ReqwestTransport`] is the production implementation.

pub mod http;
mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::form_urlencoded;

pub use http::ReqwestTransport;
pub use scripted::ScriptedTransport;

/// Default bound on a single HTTP call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Network-level failure: no HTTP response was received
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established or was dropped
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The call did not complete within the request timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Any other failure before a status line was read
    #[error("Transport error: {0}")]
    Other(String),
}

/// HTTP method subset used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    /// GET
    #[default]
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Method name as sent on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Outbound HTTP request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method
    pub method: HttpMethod,
    /// Absolute URL
    pub url: String,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// Raw body; the matching `Content-Type` is set in `headers`
    pub body: Option<String>,
}

impl HttpRequest {
    /// Create a request for the given method and URL
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a form-encoded body from key/value pairs
    #[must_use]
    pub fn form(mut self, params: &[(&str, &str)]) -> Self {
        self.headers.push((
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        ));
        self.body = Some(
            form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params)
                .finish(),
        );
        self
    }

    /// Set a JSON body
    #[must_use]
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self.body = Some(value.to_string());
        self
    }

    /// Look up a header value (case-insensitive)
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// HTTP response as seen by the auth layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// Response body as text
    pub body: String,
}

impl HttpResponse {
    /// Create a response with a status and body
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Look up a header value (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Parse the body as JSON
    ///
    /// # Errors
    /// Returns the JSON error if the body is not valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Transport trait for sending HTTP requests
///
/// Implementations must return `Ok` for every response that carries a
/// status line, including 4xx and 5xx; `Err` is reserved for failures
/// where no response arrived.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and wait for the full response
    ///
    /// # Errors
    /// Returns [`TransportError`] when no response was received.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_body_is_urlencoded() {
        let request = HttpRequest::new(HttpMethod::Post, "https://example.com/token")
            .form(&[("grant_type", "authorization_code"), ("redirect_uri", "https://a.b/c d")]);

        assert_eq!(
            request.header_value("content-type"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(
            request.body.as_deref(),
            Some("grant_type=authorization_code&redirect_uri=https%3A%2F%2Fa.b%2Fc+d")
        );
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(429, "").with_header("Retry-After", "7");
        assert_eq!(response.header("retry-after"), Some("7"));
        assert!(!response.is_success());
    }
}
