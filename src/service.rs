use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bindings::HandlerRegistry;
use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::engine::{DrainReport, SyncEngine};
use crate::error::QueueError;
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::lock;
use crate::models::{Mutation, QueueStats};
use crate::network::NetworkMonitor;
use crate::queue::MutationQueue;
use crate::retry::RetryScheduler;
use crate::store::DurableStore;
use crate::worker;

/// The offline write path: queue, engine, events and timers wired together.
///
/// Each instance owns its own state, so tests can run several side by side.
pub struct SyncService {
    queue: Arc<MutationQueue>,
    engine: Arc<SyncEngine>,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
    scheduler: Arc<RetryScheduler>,
    clock: Arc<dyn Clock>,
    monitor: Mutex<Option<NetworkMonitor>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    /// Load the queue from `store` and re-arm any backoff timers that were
    /// pending when the previous process stopped.
    pub async fn init(
        store: Arc<dyn DurableStore>,
        handlers: HandlerRegistry,
        settings: &SyncSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, QueueError> {
        let queue = Arc::new(MutationQueue::init(store, clock.clone()).await?);
        let events = EventBus::new();
        let scheduler = Arc::new(RetryScheduler::new());

        for (id, at) in queue.scheduled_retries().await {
            scheduler.schedule(id, at);
        }

        let handlers = Arc::new(handlers);
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            handlers.clone(),
            events.clone(),
            scheduler.clone(),
            clock.clone(),
            settings,
        ));

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            queue,
            engine,
            handlers,
            events,
            scheduler,
            clock,
            monitor: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start the background tasks: drain on every offline→online transition
    /// and requeue mutations as their backoff expires.
    pub fn start(self: &Arc<Self>, monitor: NetworkMonitor) {
        let online = monitor.subscribe();
        let initially_online = monitor.is_online();
        *lock(&self.monitor) = Some(monitor);

        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(worker::run_online_watcher(
            self.clone(),
            online,
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(worker::run_retry_timer(
            self.clone(),
            self.shutdown.subscribe(),
        )));

        tracing::info!("Sync service started (online={initially_online})");

        if initially_online {
            self.wake();
        }
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn dispose(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Sync service stopped");
    }

    pub fn is_draining(&self) -> bool {
        self.engine.is_draining()
    }

    /// Connectivity as seen by the network monitor. Without a monitor the
    /// service assumes it is online.
    pub fn is_online(&self) -> bool {
        lock(&self.monitor)
            .as_ref()
            .is_none_or(NetworkMonitor::is_online)
    }

    /// Durably queue a mutation. Once started and online, a drain is kicked
    /// off in the background.
    pub async fn enqueue(
        self: &Arc<Self>,
        mutation_type: &str,
        entity_key: Option<&str>,
        payload: serde_json::Value,
        temp_id: Option<String>,
    ) -> Result<Uuid, QueueError> {
        let id = self
            .queue
            .enqueue(mutation_type, entity_key, payload, temp_id)
            .await
            .inspect_err(|e| self.report_fault(e))?;

        if self.is_started() && self.is_online() {
            self.wake();
        }
        Ok(id)
    }

    /// Manual "sync now". Returns `None` when offline or when the request was
    /// folded into a drain that is already running.
    pub async fn trigger_drain(&self) -> Option<DrainReport> {
        if !self.is_online() {
            tracing::debug!("Offline, drain request ignored");
            return None;
        }
        self.engine.trigger_drain().await
    }

    /// Requeue mutations whose backoff has expired and drain if any were.
    pub async fn fire_due_retries(&self) -> usize {
        match self.engine.fire_due_retries().await {
            Ok(0) => 0,
            Ok(n) => {
                tracing::debug!("{n} mutations due for retry");
                self.trigger_drain().await;
                n
            }
            Err(e) => {
                self.report_fault(&e);
                0
            }
        }
    }

    pub async fn stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub async fn list(&self) -> Vec<Mutation> {
        self.queue.list().await
    }

    pub async fn failed(&self) -> Vec<Mutation> {
        self.queue.failed().await
    }

    pub async fn get(&self, id: Uuid) -> Option<Mutation> {
        self.queue.get(id).await
    }

    /// Put a failed mutation back in line, cancelling any pending backoff.
    pub async fn retry(&self, id: Uuid) -> Result<Mutation, QueueError> {
        let record = self.queue.requeue(id).await?;
        self.scheduler.cancel(id);
        Ok(record)
    }

    pub async fn retry_all_failed(&self) -> Result<usize, QueueError> {
        for record in self.queue.failed().await {
            self.scheduler.cancel(record.id);
        }
        self.queue.requeue_all_failed().await
    }

    pub async fn discard(&self, id: Uuid) -> Result<Mutation, QueueError> {
        let record = self.queue.discard(id).await?;
        self.scheduler.cancel(id);
        Ok(record)
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        self.queue.clear().await?;
        for (id, _) in self.scheduler.pending() {
            self.scheduler.cancel(id);
        }
        Ok(())
    }

    pub async fn export(&self) -> Vec<Mutation> {
        self.queue.export().await
    }

    pub async fn import(&self, records: Vec<Mutation>) -> Result<usize, QueueError> {
        let count = self.queue.import(records).await?;
        for (id, at) in self.queue.scheduled_retries().await {
            self.scheduler.schedule(id, at);
        }
        Ok(count)
    }

    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn is_started(&self) -> bool {
        lock(&self.monitor).is_some()
    }

    fn wake(self: &Arc<Self>) {
        let service = self.clone();
        tokio::spawn(async move {
            service.trigger_drain().await;
        });
    }

    fn report_fault(&self, err: &QueueError) {
        if let QueueError::Store(e) = err {
            tracing::warn!("Sync unavailable: {e}");
            self.events.emit(SyncEvent::SyncUnavailable {
                reason: e.to_string(),
            });
        }
    }
}
