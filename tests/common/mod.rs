#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::sync::Notify;
use uuid::Uuid;

use homesync::bindings::{ApplyError, HandlerRegistry, MutationHandler};
use homesync::clock::ManualClock;
use homesync::config::{Config, SyncSettings};
use homesync::events::SyncEvent;
use homesync::models::Mutation;
use homesync::service::SyncService;
use homesync::state::AppState;
use homesync::store::MemoryStore;

/// Every external call made by scripted handlers, in dispatch order.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub mutation_type: String,
    pub payload: Value,
    pub idempotency_key: Uuid,
}

impl CallLog {
    pub fn all(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<Uuid> {
        self.all().into_iter().map(|c| c.idempotency_key).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Handler that replays programmed outcomes, then succeeds.
pub struct ScriptedHandler {
    mutation_type: String,
    script: Mutex<VecDeque<Result<(), ApplyError>>>,
    log: CallLog,
    merge_with: Option<Value>,
    gate: Option<Gate>,
    on_apply: Option<Box<dyn Fn() + Send + Sync>>,
}

#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl ScriptedHandler {
    pub fn new(mutation_type: &str, log: &CallLog) -> Self {
        Self {
            mutation_type: mutation_type.to_string(),
            script: Mutex::new(VecDeque::new()),
            log: log.clone(),
            merge_with: None,
            gate: None,
            on_apply: None,
        }
    }

    pub fn then(self, outcome: Result<(), ApplyError>) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn failing(self, times: usize, error: ApplyError) -> Self {
        (0..times).fold(self, |h, _| h.then(Err(error.clone())))
    }

    pub fn merging_into(mut self, payload: Value) -> Self {
        self.merge_with = Some(payload);
        self
    }

    /// Run `hook` inside every call, before the scripted outcome is returned.
    pub fn on_apply<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_apply = Some(Box::new(hook));
        self
    }

    /// Block every call until `gate.release` is notified.
    pub fn gated(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }
}

#[async_trait]
impl MutationHandler for ScriptedHandler {
    fn mutation_type(&self) -> &str {
        &self.mutation_type
    }

    async fn apply(&self, payload: &Value, idempotency_key: Uuid) -> Result<(), ApplyError> {
        self.log.push(Call {
            mutation_type: self.mutation_type.clone(),
            payload: payload.clone(),
            idempotency_key,
        });

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if let Some(hook) = &self.on_apply {
            hook();
        }

        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    fn merge(&self, _mutation: &Mutation, _server_state: Option<&Value>) -> Option<Value> {
        self.merge_with.clone()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

/// Deterministic settings: no jitter, 1s base, 3 attempts.
pub fn settings() -> SyncSettings {
    SyncSettings {
        backoff_base: Duration::from_secs(1),
        backoff_max: Duration::from_secs(60),
        backoff_jitter: 0.0,
        max_attempts: 3,
        debounce: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
    }
}

pub struct TestSync {
    pub service: Arc<SyncService>,
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl TestSync {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().iter().map(SyncEvent::name).collect()
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

/// A service over a fresh in-memory store with the given handlers. Not
/// started, so it only drains when asked to.
pub async fn spawn_sync(handlers: Vec<ScriptedHandler>) -> TestSync {
    spawn_sync_with(MemoryStore::new(), handlers, settings()).await
}

pub async fn spawn_sync_with(
    store: MemoryStore,
    handlers: Vec<ScriptedHandler>,
    settings: SyncSettings,
) -> TestSync {
    let mut registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register(Arc::new(handler));
    }

    let clock = Arc::new(ManualClock::new(start_time()));
    let service = SyncService::init(Arc::new(store.clone()), registry, &settings, clock.clone())
        .await
        .expect("service init failed");

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _ = service.add_listener(move |event| sink.lock().unwrap().push(event.clone()));

    TestSync {
        service,
        store,
        clock,
        events,
    }
}

/// A running local API over an unstarted service.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: Client,
    pub sync: TestSync,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Enqueue through the API, return (body, status).
    pub async fn enqueue(&self, body: &Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .post(self.url("/api/v1/mutations"))
            .json(body)
            .send()
            .await
            .expect("enqueue request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    /// Enqueue a mood entry and return its id.
    pub async fn log_mood(&self, score: i64) -> String {
        let (body, status) = self
            .enqueue(&json!({
                "type": "LOG_MOOD",
                "entityKey": "mood:2024-05-01",
                "payload": { "date": "2024-05-01", "score": score }
            }))
            .await;
        assert_eq!(status, StatusCode::OK, "enqueue failed: {body}");
        body["id"].as_str().unwrap().to_string()
    }

    pub async fn get_json(&self, path: &str) -> (Value, StatusCode) {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("get request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("post request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    pub async fn delete(&self, path: &str) -> (Value, StatusCode) {
        let resp = self
            .client
            .delete(self.url(path))
            .send()
            .await
            .expect("delete request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }
}

fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        api_base_url: "http://127.0.0.1:9".to_string(),
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        log_level: "warn".to_string(),
        probe_interval: Duration::from_secs(30),
        sync: settings(),
    }
}

/// Serve the API on a random port over a service with the given handlers.
pub async fn spawn_app(handlers: Vec<ScriptedHandler>) -> TestApp {
    let sync = spawn_sync(handlers).await;
    let state = Arc::new(AppState {
        service: sync.service.clone(),
        config: test_config(),
    });
    let app = homesync::build_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        addr,
        client: Client::new(),
        sync,
    }
}
