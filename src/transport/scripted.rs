//! Scripted transport for tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{HttpRequest, HttpResponse, HttpTransport, TransportError};

type Reply = Result<HttpResponse, TransportError>;

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    requests: Vec<HttpRequest>,
}

/// [`HttpTransport`] that replays queued replies and records every request
///
/// Once the queue is empty every further request fails with
/// [`TransportError::Connect`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    /// Create a transport with no queued replies
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a response
    pub fn push(&self, response: HttpResponse) -> &Self {
        self.script().replies.push_back(Ok(response));
        self
    }

    /// Queue a JSON response with the given status
    pub fn push_json(&self, status: u16, body: &serde_json::Value) -> &Self {
        self.push(
            HttpResponse::new(status, body.to_string())
                .with_header("Content-Type", "application/json"),
        )
    }

    /// Queue a transport failure
    pub fn push_error(&self, error: TransportError) -> &Self {
        self.script().replies.push_back(Err(error));
        self
    }

    /// Requests sent so far, oldest first
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.script().requests.clone()
    }

    /// Number of requests sent so far
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.script().requests.len()
    }

    /// Number of replies not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script().replies.len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut script = self.script();
        tracing::trace!(method = request.method.as_str(), url = %request.url, "Scripted request");
        script.requests.push(request);
        script
            .replies
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("no scripted reply".to_string())))
    }
}
