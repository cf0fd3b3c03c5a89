use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Notify;
use uuid::Uuid;

/// Exponential backoff with jitter: `base * 2^attempts`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay that is randomized away, in `0.0..=1.0`.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the retry that follows `attempts` earlier failures.
    pub fn delay(&self, attempts: u32) -> Duration {
        self.delay_with(attempts, rand::rng().random::<f64>())
    }

    /// Same as [`delay`](Self::delay) with the random draw supplied, `roll` in `0.0..1.0`.
    pub fn delay_with(&self, attempts: u32, roll: f64) -> Duration {
        let capped = 2u32
            .checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max));

        let keep = 1.0 - self.jitter * roll.clamp(0.0, 1.0);
        capped.mul_f64(keep)
    }
}

/// Pending requeue deadlines, keyed by mutation id.
///
/// Nothing here sleeps: callers ask for what is due at a given instant, so
/// backoff can be stepped through with a manual clock.
#[derive(Default)]
pub struct RetryScheduler {
    deadlines: DashMap<Uuid, DateTime<Utc>>,
    changed: Notify,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, id: Uuid, at: DateTime<Utc>) {
        self.deadlines.insert(id, at);
        self.changed.notify_one();
    }

    /// Like [`schedule`](Self::schedule), but the retry timer is not woken.
    /// For the timer's own re-arms, which it picks up when it next computes
    /// its sleep.
    pub fn rearm(&self, id: Uuid, at: DateTime<Utc>) {
        self.deadlines.insert(id, at);
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        self.deadlines.remove(&id).is_some()
    }

    pub fn deadline(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.deadlines.get(&id).map(|entry| *entry.value())
    }

    /// Every scheduled requeue, earliest first.
    pub fn pending(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        let mut entries: Vec<(Uuid, DateTime<Utc>)> = self
            .deadlines
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_by_key(|(_, at)| *at);
        entries
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.deadlines.iter().map(|entry| *entry.value()).min()
    }

    /// Remove and return the ids whose deadline is at or before `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due: Vec<(Uuid, DateTime<Utc>)> = self
            .deadlines
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        due.sort_by_key(|(_, at)| *at);

        due.into_iter()
            .filter(|(id, _)| self.deadlines.remove_if(id, |_, at| *at <= now).is_some())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Resolves after the next `schedule` call.
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}
