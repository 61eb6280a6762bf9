//! Shared fixtures: browsing contexts over one in-memory store and one
//! virtual clock

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anthropic_oauth_session::runtime::{ManualClock, ManualScheduler};
use anthropic_oauth_session::transport::ScriptedTransport;
use anthropic_oauth_session::{MemoryStore, OAuthClient, SessionConfig, SessionEvent};
use serde_json::{Value, json};
use url::Url;

pub const START_MS: u64 = 1_700_000_000_000;

/// Events seen by one context, in order
pub type EventLog = Arc<Mutex<Vec<SessionEvent>>>;

/// One browsing context
pub struct Context {
    pub client: OAuthClient,
    pub transport: ScriptedTransport,
    pub events: EventLog,
}

impl Context {
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(SessionEvent::name)
            .collect()
    }

    pub fn last_event(&self) -> Option<SessionEvent> {
        self.events.lock().unwrap().last().cloned()
    }
}

/// Route library logs to the test output; set `RUST_LOG` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn scheduler() -> ManualScheduler {
    ManualScheduler::new(ManualClock::new(START_MS))
}

/// Open a context with lazy reconciliation
pub fn open_context(
    backend: &MemoryStore,
    scheduler: &ManualScheduler,
    config: SessionConfig,
) -> Context {
    build_context(backend, scheduler, config, false)
}

/// Open a context that applies external changes on a background task
pub fn open_synced_context(backend: &MemoryStore, scheduler: &ManualScheduler) -> Context {
    build_context(backend, scheduler, SessionConfig::default(), true)
}

fn build_context(
    backend: &MemoryStore,
    scheduler: &ManualScheduler,
    config: SessionConfig,
    auto_sync: bool,
) -> Context {
    init_tracing();
    let transport = ScriptedTransport::new();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let client = OAuthClient::builder()
        .session_config(config)
        .store(Arc::new(backend.context()))
        .clock(Arc::new(scheduler.clock().clone()))
        .scheduler(Arc::new(scheduler.clone()))
        .transport(Arc::new(transport.clone()))
        .listener(Arc::new(move |event: &SessionEvent| {
            sink.lock().unwrap().push(event.clone());
        }))
        .auto_sync(auto_sync)
        .build();
    Context {
        client,
        transport,
        events,
    }
}

/// Value of one query parameter of the authorization URL
pub fn url_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

pub fn token_body(access_token: &str, refresh_token: Option<&str>) -> Value {
    let mut body = json!({
        "access_token": access_token,
        "expires_in": 3600,
        "token_type": "Bearer",
    });
    if let Some(refresh_token) = refresh_token {
        body["refresh_token"] = json!(refresh_token);
    }
    body
}

/// Run the full sign-in flow in `ctx`
pub async fn sign_in(ctx: &Context, refresh_token: Option<&str>) {
    ctx.transport.push_json(200, &token_body("tok", refresh_token));
    let url = ctx.client.start_flow().unwrap();
    let state = url_param(&url, "state").unwrap();
    ctx.client
        .handle_callback("abc123valid", &state)
        .await
        .unwrap();
}
