use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use uuid::Uuid;

use super::template;
use super::{ApplyError, HandlerRegistry, MutationHandler};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Applies one mutation type as a JSON request against the dashboard API.
pub struct HttpBinding {
    client: reqwest::Client,
    base_url: String,
    mutation_type: String,
    method: Method,
    path: String,
}

impl HttpBinding {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        mutation_type: &str,
        method: Method,
        path: &str,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            mutation_type: mutation_type.to_string(),
            method,
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl MutationHandler for HttpBinding {
    fn mutation_type(&self) -> &str {
        &self.mutation_type
    }

    async fn apply(
        &self,
        payload: &serde_json::Value,
        idempotency_key: Uuid,
    ) -> Result<(), ApplyError> {
        let path = template::render(&self.path, payload).map_err(ApplyError::InvalidPayload)?;
        let url = format!("{}{}", self.base_url, path);

        let mut req = self
            .client
            .request(self.method.clone(), &url)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string());

        if self.method != Method::DELETE {
            req = req.json(payload);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ApplyError::Timeout
            } else {
                ApplyError::Network(format!("{} {url} failed: {e}", self.method))
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!("{} {url} -> {status}", self.method);
            return Ok(());
        }

        let body = resp
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(1024)
            .collect::<String>();

        Err(classify(status, body))
    }
}

/// Map a non-2xx response onto the retry taxonomy.
pub fn classify(status: StatusCode, body: String) -> ApplyError {
    let code = status.as_u16();

    if status == StatusCode::CONFLICT {
        let server_state = serde_json::from_str::<serde_json::Value>(&body).ok();
        let server_updated_at = server_state.as_ref().and_then(updated_at);
        return ApplyError::Conflict {
            server_updated_at,
            server_state,
            message: body,
        };
    }

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return ApplyError::Server {
            status: code,
            message: body,
        };
    }

    ApplyError::Rejected {
        status: code,
        message: body,
    }
}

fn updated_at(state: &serde_json::Value) -> Option<DateTime<Utc>> {
    ["updatedAt", "updated_at"]
        .iter()
        .filter_map(|field| state.get(*field)?.as_str())
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|at| at.with_timezone(&Utc))
}

/// Mutation types the dashboard queues, with the route each one maps to.
pub const DEFAULT_ROUTES: &[(&str, &str, &str)] = &[
    ("CREATE_TASK", "POST", "/api/tasks"),
    ("UPDATE_TASK", "PATCH", "/api/tasks/{id}"),
    ("DELETE_TASK", "DELETE", "/api/tasks/{id}"),
    ("CREATE_HABIT", "POST", "/api/habits"),
    ("UPDATE_HABIT", "POST", "/api/habits"),
    ("LOG_MOOD", "POST", "/api/mood"),
    ("CREATE_JOURNAL", "POST", "/api/journals"),
    ("UPDATE_JOURNAL", "PATCH", "/api/journals/{slug}"),
    ("CREATE_EVENT", "POST", "/api/events"),
    ("UPDATE_EVENT", "PATCH", "/api/events/{id}"),
    ("DELETE_EVENT", "DELETE", "/api/events/{id}"),
    ("LOG_ACTIVITY", "POST", "/api/activities"),
    ("CREATE_GOAL", "POST", "/api/goals"),
    ("UPDATE_GOAL", "PATCH", "/api/goals/{id}"),
];

/// Registry with an [`HttpBinding`] for every entry of [`DEFAULT_ROUTES`].
pub fn default_bindings(base_url: &str, timeout: Duration) -> Result<HandlerRegistry, String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| format!("Failed to build reqwest client: {e}"))?;

    let mut registry = HandlerRegistry::new();
    for (mutation_type, method, path) in DEFAULT_ROUTES {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| format!("Invalid method for {mutation_type}: {e}"))?;
        registry.register(Arc::new(HttpBinding::new(
            client.clone(),
            base_url,
            mutation_type,
            method,
            path,
        )));
    }
    Ok(registry)
}
