use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Mutation, MutationStatus};

const COLUMNS: &str = "id, mutation_type, entity_key, payload, temp_id, status, attempts, \
                       last_error, next_retry_at, created_at";

#[derive(Debug, sqlx::FromRow)]
pub struct MutationRow {
    pub id: Uuid,
    pub mutation_type: String,
    pub entity_key: Option<String>,
    pub payload: Json<serde_json::Value>,
    pub temp_id: Option<String>,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<MutationRow> for Mutation {
    type Error = StoreError;

    fn try_from(row: MutationRow) -> Result<Self, Self::Error> {
        let status = MutationStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Serialization(format!("mutation {} has unknown status '{}'", row.id, row.status))
        })?;
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            StoreError::Serialization(format!("mutation {} has invalid attempts {}", row.id, row.attempts))
        })?;

        Ok(Mutation {
            id: row.id,
            mutation_type: row.mutation_type,
            entity_key: row.entity_key,
            payload: row.payload.0,
            temp_id: row.temp_id,
            status,
            attempts,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
        })
    }
}

/// Insert or overwrite a record. Insertion order (`seq`) is kept on overwrite.
pub async fn upsert<'e, E>(executor: E, record: &Mutation) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO mutations (id, mutation_type, entity_key, payload, temp_id, status,
                                attempts, last_error, next_retry_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
             mutation_type = excluded.mutation_type,
             entity_key = excluded.entity_key,
             payload = excluded.payload,
             temp_id = excluded.temp_id,
             status = excluded.status,
             attempts = excluded.attempts,
             last_error = excluded.last_error,
             next_retry_at = excluded.next_retry_at,
             created_at = excluded.created_at",
    )
    .bind(record.id)
    .bind(&record.mutation_type)
    .bind(&record.entity_key)
    .bind(Json(&record.payload))
    .bind(&record.temp_id)
    .bind(record.status.as_str())
    .bind(i64::from(record.attempts))
    .bind(&record.last_error)
    .bind(record.next_retry_at)
    .bind(record.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<MutationRow>, sqlx::Error> {
    sqlx::query_as::<_, MutationRow>(&format!(
        "SELECT {COLUMNS} FROM mutations ORDER BY seq ASC"
    ))
    .fetch_all(pool)
    .await
}

pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("DELETE FROM mutations WHERE id = ?1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn delete_all(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM mutations").execute(pool).await?;
    Ok(result.rows_affected())
}
