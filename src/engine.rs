use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use crate::bindings::{ApplyError, HandlerRegistry};
use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::error::{QueueError, StoreError};
use crate::events::{EventBus, SyncEvent};
use crate::lock;
use crate::models::{Mutation, MutationStatus};
use crate::queue::MutationQueue;
use crate::retry::{BackoffPolicy, RetryScheduler};

/// Totals for one `trigger_drain` call, across every pass it ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub success_count: usize,
    pub failure_count: usize,
    pub passes: usize,
}

#[derive(Default)]
struct DrainState {
    running: bool,
    again: bool,
}

enum Outcome {
    Synced,
    Retrying,
    Failed,
    Merged(Uuid),
}

/// Moves mutations from `pending` to acknowledged by calling their handlers.
pub struct SyncEngine {
    queue: Arc<MutationQueue>,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
    scheduler: Arc<RetryScheduler>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    max_attempts: u32,
    request_timeout: Duration,
    state: Mutex<DrainState>,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<MutationQueue>,
        handlers: Arc<HandlerRegistry>,
        events: EventBus,
        scheduler: Arc<RetryScheduler>,
        clock: Arc<dyn Clock>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            queue,
            handlers,
            events,
            scheduler,
            clock,
            backoff: BackoffPolicy::new(
                settings.backoff_base,
                settings.backoff_max,
                settings.backoff_jitter,
            ),
            max_attempts: settings.max_attempts.max(1),
            request_timeout: settings.request_timeout,
            state: Mutex::new(DrainState::default()),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.lock_state().running
    }

    /// Drain the queue. If a drain is already running this returns `None`
    /// immediately and the running drain makes one more pass when it finishes.
    pub async fn trigger_drain(&self) -> Option<DrainReport> {
        {
            let mut state = self.lock_state();
            if state.running {
                state.again = true;
                tracing::debug!("Drain already running, coalescing request");
                return None;
            }
            state.running = true;
        }

        let _running = RunningGuard(&self.state);
        let mut report = DrainReport::default();

        loop {
            let fault = self.drain_pass(&mut report).await;

            let again = {
                let mut state = self.lock_state();
                let again = fault.is_none() && state.again;
                state.again = false;
                again
            };
            if !again {
                break;
            }
        }

        Some(report)
    }

    /// One pass: keep taking eligible batches until none are left. Returns the
    /// storage fault that cut the pass short, if any.
    async fn drain_pass(&self, report: &mut DrainReport) -> Option<StoreError> {
        self.events.emit(SyncEvent::SyncStart);
        report.passes += 1;

        let mut success_count = 0;
        let mut failure_count = 0;
        let mut merged: HashSet<Uuid> = HashSet::new();
        let mut fault = None;

        loop {
            let batch = self.queue.peek_next_batch().await;
            if batch.is_empty() {
                break;
            }

            tracing::debug!("Dispatching batch of {} mutations", batch.len());

            let results = join_all(batch.into_iter().map(|m| {
                let allow_merge = !merged.contains(&m.id);
                self.process(m, allow_merge)
            }))
            .await;

            for result in results {
                match result {
                    Ok(Outcome::Synced) => success_count += 1,
                    Ok(Outcome::Failed) => failure_count += 1,
                    Ok(Outcome::Retrying) => {}
                    Ok(Outcome::Merged(id)) => {
                        merged.insert(id);
                    }
                    Err(QueueError::Store(e)) => fault = Some(e),
                    Err(e) => tracing::warn!("Skipping mutation: {e}"),
                }
            }

            if let Some(e) = &fault {
                tracing::warn!("Sync unavailable: {e}");
                self.events.emit(SyncEvent::SyncUnavailable {
                    reason: e.to_string(),
                });
                break;
            }
        }

        report.success_count += success_count;
        report.failure_count += failure_count;

        tracing::info!("Sync complete: {success_count} succeeded, {failure_count} failed");
        self.events.emit(SyncEvent::SyncComplete {
            success_count,
            failure_count,
        });

        fault
    }

    async fn process(&self, mutation: Mutation, allow_merge: bool) -> Result<Outcome, QueueError> {
        let record = match self.queue.mark_syncing(mutation.id).await {
            Ok(record) => record,
            Err(e @ QueueError::Store(_)) => {
                self.retry_after_fault(mutation.id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.scheduler.cancel(record.id);

        let outcome = self.dispatch(&record, allow_merge).await;
        if let Err(QueueError::Store(e)) = &outcome {
            // The lease never reached a terminal state, so hand the record back.
            if let Err(release) = self.queue.release(record.id).await {
                tracing::warn!("Could not release mutation {}: {release}", record.id);
            }
            tracing::warn!("Mutation {} left pending after storage fault: {e}", record.id);
            self.retry_after_fault(record.id);
        }
        outcome
    }

    async fn dispatch(&self, record: &Mutation, allow_merge: bool) -> Result<Outcome, QueueError> {
        tracing::debug!(
            "Processing mutation {} ({}, attempt={})",
            record.id,
            record.mutation_type,
            record.attempts + 1
        );

        let handler = self.handlers.get(&record.mutation_type);
        let result = match handler {
            Some(handler) => {
                match tokio::time::timeout(
                    self.request_timeout,
                    handler.apply(&record.payload, record.id),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ApplyError::Timeout),
                }
            }
            None => Err(ApplyError::UnknownType(record.mutation_type.clone())),
        };

        match result {
            Ok(()) => {
                let done = self.queue.mark_done(record.id).await?;
                tracing::debug!("Mutation {} synced", done.id);
                self.events.emit(SyncEvent::MutationSynced { mutation: done });
                Ok(Outcome::Synced)
            }
            Err(ApplyError::Conflict {
                server_updated_at: Some(at),
                ..
            }) if at <= record.created_at => {
                // Our write is the newer one; the server should accept it once
                // whatever it raced with settles.
                let error = format!("Conflict with older server state ({})", at.to_rfc3339());
                self.fail_retryable(record, &error).await
            }
            Err(ApplyError::Conflict {
                server_state,
                message,
                ..
            }) => {
                if allow_merge {
                    let resolved = handler.and_then(|h| h.merge(record, server_state.as_ref()));
                    if let Some(payload) = resolved {
                        let fresh = self.queue.reconstruct(record.id, payload).await?;
                        tracing::info!(
                            "Mutation {} merged with server state, resubmitted as {}",
                            record.id,
                            fresh.id
                        );
                        return Ok(Outcome::Merged(fresh.id));
                    }
                }
                self.fail_permanently(record, &format!("Conflict: {message}"))
                    .await
            }
            Err(e) if e.is_retryable() => self.fail_retryable(record, &e.to_string()).await,
            Err(e) => self.fail_permanently(record, &e.to_string()).await,
        }
    }

    /// Schedule a backoff requeue, or dead-letter once the attempt budget is spent.
    async fn fail_retryable(&self, record: &Mutation, error: &str) -> Result<Outcome, QueueError> {
        let attempts = record.attempts.saturating_add(1);
        if attempts >= self.max_attempts {
            let failed = self.queue.mark_failed(record.id, error, None).await?;
            tracing::warn!(
                "Mutation {} dead-lettered after {attempts} attempts: {error}",
                record.id
            );
            self.events.emit(SyncEvent::MutationFailed { mutation: failed });
            return Ok(Outcome::Failed);
        }

        let delay = self.backoff.delay(record.attempts);
        let retry_at = after(self.clock.now(), delay);
        self.queue.mark_failed(record.id, error, Some(retry_at)).await?;
        self.scheduler.schedule(record.id, retry_at);

        tracing::warn!(
            "Mutation {} failed (attempt {attempts}/{}), retrying in {:?}: {error}",
            record.id,
            self.max_attempts,
            delay
        );
        Ok(Outcome::Retrying)
    }

    async fn fail_permanently(&self, record: &Mutation, error: &str) -> Result<Outcome, QueueError> {
        let failed = self.queue.mark_failed(record.id, error, None).await?;
        tracing::warn!("Mutation {} rejected: {error}", record.id);
        self.events.emit(SyncEvent::MutationFailed { mutation: failed });
        Ok(Outcome::Failed)
    }

    /// Requeue every mutation whose backoff deadline has passed. Returns how
    /// many went back to `pending`.
    ///
    /// Records released after a storage fault are already `pending` and count
    /// as requeued so the caller drains them. If the store fails here, the
    /// untried ids are pushed back by one base backoff interval.
    pub async fn fire_due_retries(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let due = self.scheduler.take_due(now);
        let mut requeued = 0;
        for (index, &id) in due.iter().enumerate() {
            match self.queue.requeue(id).await {
                Ok(_) => requeued += 1,
                Err(QueueError::InvalidTransition {
                    from: MutationStatus::Pending,
                    ..
                }) => requeued += 1,
                Err(QueueError::Store(e)) => {
                    let retry_at = after(now, self.backoff.base);
                    for &id in &due[index..] {
                        self.scheduler.rearm(id, retry_at);
                    }
                    return Err(QueueError::Store(e));
                }
                Err(e) => tracing::debug!("Scheduled requeue of {id} skipped: {e}"),
            }
        }
        Ok(requeued)
    }

    /// Arm a requeue one base interval out so a record stranded by a storage
    /// fault is picked up again once the store recovers.
    fn retry_after_fault(&self, id: Uuid) {
        let retry_at = after(self.clock.now(), self.backoff.base);
        if self.scheduler.deadline(id).is_none_or(|at| at < retry_at) {
            self.scheduler.schedule(id, retry_at);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DrainState> {
        lock(&self.state)
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Clears the running flag even if the drain future is dropped mid-way.
struct RunningGuard<'a>(&'a Mutex<DrainState>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.0);
        state.running = false;
    }
}
