pub mod http;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::Mutation;

/// Why an external call did not apply a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// The server could not be reached.
    Network(String),
    Timeout,
    /// 5xx, 408 or 429.
    Server { status: u16, message: String },
    /// Permanent rejection, e.g. validation failure or a deleted resource.
    Rejected { status: u16, message: String },
    /// The server holds a version of the resource this mutation did not see.
    Conflict {
        server_updated_at: Option<DateTime<Utc>>,
        server_state: Option<serde_json::Value>,
        message: String,
    },
    /// The payload cannot be turned into a request at all.
    InvalidPayload(String),
    UnknownType(String),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApplyError::Network(_) | ApplyError::Timeout | ApplyError::Server { .. }
        )
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::Network(msg) => write!(f, "Network error: {msg}"),
            ApplyError::Timeout => write!(f, "Request timed out"),
            ApplyError::Server { status, message } => write!(f, "Server error {status}: {message}"),
            ApplyError::Rejected { status, message } => write!(f, "Rejected {status}: {message}"),
            ApplyError::Conflict {
                server_updated_at: Some(at),
                message,
                ..
            } => write!(f, "Conflict (server updated {}): {message}", at.to_rfc3339()),
            ApplyError::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            ApplyError::InvalidPayload(msg) => write!(f, "Invalid payload: {msg}"),
            ApplyError::UnknownType(t) => write!(f, "Unknown mutation type: {t}"),
        }
    }
}

impl std::error::Error for ApplyError {}

/// The external operation behind one mutation type.
#[async_trait]
pub trait MutationHandler: Send + Sync {
    fn mutation_type(&self) -> &str;

    /// Apply `payload` on the server. `idempotency_key` is the mutation id and
    /// is identical across every attempt of the same mutation.
    async fn apply(
        &self,
        payload: &serde_json::Value,
        idempotency_key: Uuid,
    ) -> Result<(), ApplyError>;

    /// Resolve a conflict against newer server state. Returning a payload
    /// resubmits it as a new mutation; `None` surfaces the conflict to the user.
    fn merge(
        &self,
        _mutation: &Mutation,
        _server_state: Option<&serde_json::Value>,
    ) -> Option<serde_json::Value> {
        None
    }
}

pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MutationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn MutationHandler>) {
        self.handlers
            .insert(handler.mutation_type().to_string(), handler);
    }

    pub fn get(&self, mutation_type: &str) -> Option<&Arc<dyn MutationHandler>> {
        self.handlers.get(mutation_type)
    }

    pub fn contains(&self, mutation_type: &str) -> bool {
        self.handlers.contains_key(mutation_type)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
