use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single queued write waiting to be applied on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub mutation_type: String,
    pub entity_key: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub status: MutationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// When a failed record becomes eligible again. `None` on a failed record
    /// means it is dead-lettered and waits for the user.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Failed,
    Done,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Syncing => "syncing",
            MutationStatus::Failed => "failed",
            MutationStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MutationStatus::Pending),
            "syncing" => Some(MutationStatus::Syncing),
            "failed" => Some(MutationStatus::Failed),
            "done" => Some(MutationStatus::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Mutation {
    pub fn new(
        mutation_type: &str,
        entity_key: Option<String>,
        payload: serde_json::Value,
        temp_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            mutation_type: mutation_type.to_string(),
            entity_key,
            payload,
            temp_id,
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            created_at,
        }
    }

    /// Failed with no retry scheduled.
    pub fn is_dead_lettered(&self) -> bool {
        self.status == MutationStatus::Failed && self.next_retry_at.is_none()
    }

    /// Whether this record may be dispatched at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            MutationStatus::Pending => true,
            MutationStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            MutationStatus::Syncing | MutationStatus::Done => false,
        }
    }

    /// Whether this record holds back later records with the same entity key.
    /// Only terminal records (done or dead-lettered) release the key.
    pub fn blocks_successors(&self) -> bool {
        match self.status {
            MutationStatus::Pending | MutationStatus::Syncing => true,
            MutationStatus::Failed => self.next_retry_at.is_some(),
            MutationStatus::Done => false,
        }
    }
}

/// Badge counters. `total` always equals the sum of the other three.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Mutation>) -> Self {
        let mut stats = QueueStats::default();
        for record in records {
            match record.status {
                MutationStatus::Pending => stats.pending += 1,
                MutationStatus::Syncing => stats.syncing += 1,
                MutationStatus::Failed => stats.failed += 1,
                MutationStatus::Done => continue,
            }
            stats.total += 1;
        }
        stats
    }
}

const TEMP_ID_PREFIX: &str = "temp";

/// Placeholder id for a record created offline, replaced by the server id
/// once the create mutation syncs. Shaped `<prefix>_<millis>_<random>`.
pub fn generate_temp_id(prefix: Option<&str>) -> String {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!(
        "{}_{}_{suffix}",
        prefix.unwrap_or(TEMP_ID_PREFIX),
        Utc::now().timestamp_millis()
    )
}

/// Whether `id` has the shape produced by [`generate_temp_id`].
pub fn is_temp_id(id: &str) -> bool {
    let mut parts = id.rsplitn(3, '_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(suffix), Some(millis), Some(prefix)) => {
            !prefix.is_empty()
                && !millis.is_empty()
                && millis.bytes().all(|b| b.is_ascii_digit())
                && suffix.len() == 7
                && suffix.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        }
        _ => false,
    }
}
