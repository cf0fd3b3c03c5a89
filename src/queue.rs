use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::QueueError;
use crate::models::{Mutation, MutationStatus, QueueStats};
use crate::store::DurableStore;

/// Ordered view of the mutation log over a [`DurableStore`].
///
/// This is the only place where record `status` and `attempts` change. Every
/// change is written to the store before the in-memory mirror is updated, and
/// the mirror lock is held across that write so two transitions on the same
/// record cannot interleave.
pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    records: Mutex<Vec<Mutation>>,
}

impl MutationQueue {
    /// Rebuild the queue from whatever the store holds.
    ///
    /// Records left in `syncing` by a process that died mid-call go back to
    /// `pending`; their attempt count is kept.
    pub async fn init(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let mut records = store.get_all().await?;

        let mut recovered = 0;
        for record in records.iter_mut().filter(|r| r.status == MutationStatus::Syncing) {
            record.status = MutationStatus::Pending;
            store.put(record).await?;
            recovered += 1;
        }
        records.retain(|r| r.status != MutationStatus::Done);

        tracing::info!(
            "Mutation queue loaded ({} records, {recovered} recovered from syncing)",
            records.len()
        );

        Ok(Self {
            store,
            clock,
            records: Mutex::new(records),
        })
    }

    /// Persist a new `pending` record and return its id. The record is durable
    /// before this returns.
    pub async fn enqueue(
        &self,
        mutation_type: &str,
        entity_key: Option<&str>,
        payload: serde_json::Value,
        temp_id: Option<String>,
    ) -> Result<Uuid, QueueError> {
        let record = Mutation::new(
            mutation_type,
            entity_key.map(str::to_string),
            payload,
            temp_id,
            self.clock.now(),
        );

        let mut records = self.records.lock().await;
        self.store.put(&record).await?;
        let id = record.id;
        tracing::debug!(
            "Enqueued mutation {id} ({mutation_type}, key={})",
            record.entity_key.as_deref().unwrap_or("-")
        );
        records.push(record);
        Ok(id)
    }

    /// Next mutations that may be dispatched right now.
    ///
    /// Per entity key, only the oldest record that still holds the key is
    /// considered, and it is returned only if it is eligible. Records without
    /// a key are returned whenever they are eligible.
    pub async fn peek_next_batch(&self) -> Vec<Mutation> {
        let now = self.clock.now();
        let records = self.records.lock().await;

        let mut claimed: HashSet<&str> = HashSet::new();
        let mut batch = Vec::new();

        for record in fifo(&records) {
            match record.entity_key.as_deref() {
                None => {
                    if record.is_eligible(now) {
                        batch.push(record.clone());
                    }
                }
                Some(key) => {
                    if claimed.contains(key) || !record.blocks_successors() {
                        continue;
                    }
                    claimed.insert(key);
                    if record.is_eligible(now) {
                        batch.push(record.clone());
                    }
                }
            }
        }

        batch
    }

    pub async fn mark_syncing(&self, id: Uuid) -> Result<Mutation, QueueError> {
        self.transition(id, MutationStatus::Syncing, |record| {
            if !matches!(record.status, MutationStatus::Pending | MutationStatus::Failed) {
                return false;
            }
            record.status = MutationStatus::Syncing;
            record.next_retry_at = None;
            true
        })
        .await
    }

    /// Acknowledge a synced record. It is removed from the store and never
    /// replayed.
    pub async fn mark_done(&self, id: Uuid) -> Result<Mutation, QueueError> {
        let mut records = self.records.lock().await;
        let index = position(&records, id)?;
        if records[index].status != MutationStatus::Syncing {
            return Err(QueueError::InvalidTransition {
                id,
                from: records[index].status,
                to: MutationStatus::Done,
            });
        }

        self.store.delete(id).await?;
        let mut record = records.remove(index);
        record.status = MutationStatus::Done;
        record.last_error = None;
        Ok(record)
    }

    /// Record a failed attempt. `next_retry_at` of `None` parks the record
    /// until the user retries or discards it.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<Mutation, QueueError> {
        self.transition(id, MutationStatus::Failed, |record| {
            if record.status != MutationStatus::Syncing {
                return false;
            }
            record.status = MutationStatus::Failed;
            record.attempts = record.attempts.saturating_add(1);
            record.last_error = Some(error.to_string());
            record.next_retry_at = next_retry_at;
            true
        })
        .await
    }

    /// Move a failed record back to `pending`, keeping its attempt count.
    pub async fn requeue(&self, id: Uuid) -> Result<Mutation, QueueError> {
        self.transition(id, MutationStatus::Pending, |record| {
            if record.status != MutationStatus::Failed {
                return false;
            }
            record.status = MutationStatus::Pending;
            record.next_retry_at = None;
            true
        })
        .await
    }

    /// Hand a `syncing` record back to the line without writing to the store.
    ///
    /// For when the store failed after the lease was taken. The stored row is
    /// still `syncing` or older, and `init` reads either one as `pending`.
    pub async fn release(&self, id: Uuid) -> Result<Mutation, QueueError> {
        let mut records = self.records.lock().await;
        let index = position(&records, id)?;
        let record = &mut records[index];
        if record.status != MutationStatus::Syncing {
            return Err(QueueError::InvalidTransition {
                id,
                from: record.status,
                to: MutationStatus::Pending,
            });
        }

        record.status = MutationStatus::Pending;
        tracing::debug!("Released mutation {id} back to pending");
        Ok(record.clone())
    }

    pub async fn requeue_all_failed(&self) -> Result<usize, QueueError> {
        let failed: Vec<Uuid> = self.failed().await.into_iter().map(|r| r.id).collect();
        for id in &failed {
            self.requeue(*id).await?;
        }
        tracing::info!("Requeued {} failed mutations", failed.len());
        Ok(failed.len())
    }

    /// Drop a failed record at the user's request.
    pub async fn discard(&self, id: Uuid) -> Result<Mutation, QueueError> {
        let mut records = self.records.lock().await;
        let index = position(&records, id)?;
        if records[index].status != MutationStatus::Failed {
            return Err(QueueError::InvalidTransition {
                id,
                from: records[index].status,
                to: MutationStatus::Done,
            });
        }

        self.store.delete(id).await?;
        tracing::info!("Discarded mutation {id}");
        Ok(records.remove(index))
    }

    /// Replace a record with a fresh one (new id, zero attempts) carrying
    /// `payload`. The old record is removed in the same store operation.
    pub async fn reconstruct(
        &self,
        id: Uuid,
        payload: serde_json::Value,
    ) -> Result<Mutation, QueueError> {
        let mut records = self.records.lock().await;
        let index = position(&records, id)?;
        let old = &records[index];
        if !matches!(old.status, MutationStatus::Syncing | MutationStatus::Failed) {
            return Err(QueueError::InvalidTransition {
                id,
                from: old.status,
                to: MutationStatus::Pending,
            });
        }

        let fresh = Mutation::new(
            &old.mutation_type,
            old.entity_key.clone(),
            payload,
            old.temp_id.clone(),
            self.clock.now(),
        );
        self.store.replace(id, &fresh).await?;
        records.remove(index);
        records.push(fresh.clone());
        tracing::debug!("Mutation {id} reconstructed as {}", fresh.id);
        Ok(fresh)
    }

    pub async fn get(&self, id: Uuid) -> Option<Mutation> {
        let records = self.records.lock().await;
        records.iter().find(|r| r.id == id).cloned()
    }

    /// All live records, oldest first.
    pub async fn list(&self) -> Vec<Mutation> {
        let records = self.records.lock().await;
        fifo(&records).cloned().collect()
    }

    pub async fn failed(&self) -> Vec<Mutation> {
        let records = self.records.lock().await;
        fifo(&records)
            .filter(|r| r.status == MutationStatus::Failed)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let records = self.records.lock().await;
        QueueStats::from_records(records.iter())
    }

    /// Failed records that are waiting on a backoff deadline.
    pub async fn scheduled_retries(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        let records = self.records.lock().await;
        records
            .iter()
            .filter(|r| r.status == MutationStatus::Failed)
            .filter_map(|r| r.next_retry_at.map(|at| (r.id, at)))
            .collect()
    }

    pub async fn export(&self) -> Vec<Mutation> {
        self.list().await
    }

    /// Load records into the log, overwriting any with the same id. Records
    /// exported mid-drain arrive as `syncing` and are loaded as `pending`.
    pub async fn import(&self, incoming: Vec<Mutation>) -> Result<usize, QueueError> {
        let incoming: Vec<Mutation> = incoming
            .into_iter()
            .filter(|r| r.status != MutationStatus::Done)
            .map(|mut r| {
                if r.status == MutationStatus::Syncing {
                    r.status = MutationStatus::Pending;
                }
                r
            })
            .collect();

        let mut records = self.records.lock().await;
        self.store.put_many(&incoming).await?;
        let count = incoming.len();
        for record in incoming {
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
        }
        tracing::info!("Imported {count} mutations");
        Ok(count)
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut records = self.records.lock().await;
        self.store.clear().await?;
        records.clear();
        Ok(())
    }

    async fn transition<F>(
        &self,
        id: Uuid,
        to: MutationStatus,
        apply: F,
    ) -> Result<Mutation, QueueError>
    where
        F: FnOnce(&mut Mutation) -> bool,
    {
        let mut records = self.records.lock().await;
        let index = position(&records, id)?;

        let mut updated = records[index].clone();
        if !apply(&mut updated) {
            return Err(QueueError::InvalidTransition {
                id,
                from: records[index].status,
                to,
            });
        }

        self.store.put(&updated).await?;
        records[index] = updated.clone();
        Ok(updated)
    }
}

fn position(records: &[Mutation], id: Uuid) -> Result<usize, QueueError> {
    records
        .iter()
        .position(|r| r.id == id)
        .ok_or(QueueError::NotFound(id))
}

/// Records ordered by `created_at`; ties keep insertion order.
fn fifo(records: &[Mutation]) -> impl Iterator<Item = &Mutation> {
    let mut ordered: Vec<&Mutation> = records.iter().collect();
    ordered.sort_by_key(|r| r.created_at);
    ordered.into_iter()
}
