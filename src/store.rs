use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db;
use crate::error::StoreError;
use crate::models::Mutation;

/// Persistent key/value storage for the mutation log, keyed by mutation id.
///
/// Implementations must make each `put` atomic: a concurrent `get_all` sees
/// either the old record or the new one, never a mix.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put(&self, record: &Mutation) -> Result<(), StoreError>;

    /// Every record, in insertion order.
    async fn get_all(&self) -> Result<Vec<Mutation>, StoreError>;

    /// Deleting an absent id is a no-op.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn put_many(&self, records: &[Mutation]) -> Result<(), StoreError> {
        for record in records {
            self.put(record).await?;
        }
        Ok(())
    }

    /// Write `new` and drop `old_id`.
    async fn replace(&self, old_id: Uuid, new: &Mutation) -> Result<(), StoreError> {
        self.put(new).await?;
        self.delete(old_id).await
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn put(&self, record: &Mutation) -> Result<(), StoreError> {
        db::mutations::upsert(&self.pool, record).await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Mutation>, StoreError> {
        db::mutations::list_all(&self.pool)
            .await?
            .into_iter()
            .map(Mutation::try_from)
            .collect()
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        db::mutations::delete(&self.pool, id).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let removed = db::mutations::delete_all(&self.pool).await?;
        tracing::info!("Cleared mutation log ({removed} records)");
        Ok(())
    }

    async fn put_many(&self, records: &[Mutation]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            db::mutations::upsert(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace(&self, old_id: Uuid, new: &Mutation) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        db::mutations::upsert(&mut *tx, new).await?;
        db::mutations::delete(&mut *tx, old_id).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Volatile store for tests. Clones share the same records, so dropping a
/// queue and building a new one over a clone behaves like a process restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<Mutation>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with `StoreError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<Mutation> {
        self.lock().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated storage fault".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Mutation>> {
        crate::lock(&self.records)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, record: &Mutation) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.lock();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Mutation>, StoreError> {
        self.check()?;
        Ok(self.lock().clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.check()?;
        self.lock().retain(|r| r.id != id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check()?;
        self.lock().clear();
        Ok(())
    }
}
