use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{generate_temp_id, is_temp_id, Mutation, MutationStatus};
use crate::state::SharedState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueMutation {
    #[serde(rename = "type")]
    pub mutation_type: String,
    pub entity_key: Option<String>,
    pub payload: serde_json::Value,
    pub temp_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
}

pub async fn enqueue(
    State(state): State<SharedState>,
    Json(req): Json<EnqueueMutation>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.service.handlers().contains(&req.mutation_type) {
        return Err(AppError::BadRequest(format!(
            "Unknown mutation type: {}",
            req.mutation_type
        )));
    }

    if let Some(temp_id) = req.temp_id.as_deref() {
        if !is_temp_id(temp_id) {
            return Err(AppError::BadRequest(format!("Malformed tempId: {temp_id}")));
        }
    }

    // Creates get a placeholder id the UI can render until the server assigns one.
    let temp_id = match req.temp_id {
        Some(temp_id) => Some(temp_id),
        None if req.mutation_type.starts_with("CREATE_") => Some(generate_temp_id(None)),
        None => None,
    };

    let entity_key = req.entity_key.as_deref().filter(|k| !k.trim().is_empty());
    let id = state
        .service
        .enqueue(&req.mutation_type, entity_key, req.payload, temp_id.clone())
        .await?;

    Ok(Json(json!({ "id": id, "tempId": temp_id })))
}

pub async fn list(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = match params.status.as_deref() {
        Some(s) => Some(
            MutationStatus::parse(s)
                .ok_or_else(|| AppError::BadRequest(format!("Unknown status: {s}")))?,
        ),
        None => None,
    };

    let mutations: Vec<Mutation> = state
        .service
        .list()
        .await
        .into_iter()
        .filter(|m| status.is_none_or(|s| m.status == s))
        .collect();

    Ok(Json(json!({
        "mutations": mutations,
        "stats": state.service.stats().await,
    })))
}

pub async fn get(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Mutation>, AppError> {
    let mutation = state
        .service
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound("Mutation not found".to_string()))?;
    Ok(Json(mutation))
}

pub async fn discard(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.service.discard(id).await?;
    Ok(Json(json!({ "discarded": id })))
}

pub async fn retry(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Mutation>, AppError> {
    let mutation = state.service.retry(id).await?;
    wake(&state);
    Ok(Json(mutation))
}

pub async fn retry_failed(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let requeued = state.service.retry_all_failed().await?;
    if requeued > 0 {
        wake(&state);
    }
    Ok(Json(json!({ "requeued": requeued })))
}

pub async fn clear(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, AppError> {
    state.service.clear().await?;
    Ok(Json(json!({ "cleared": true })))
}

pub async fn export(State(state): State<SharedState>) -> Json<Vec<Mutation>> {
    Json(state.service.export().await)
}

pub async fn import(
    State(state): State<SharedState>,
    Json(records): Json<Vec<Mutation>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let imported = state.service.import(records).await?;
    Ok(Json(json!({ "imported": imported })))
}

pub async fn types(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({ "types": state.service.handlers().types() }))
}

/// Start a drain without holding up the response.
fn wake(state: &SharedState) {
    let service = state.service.clone();
    tokio::spawn(async move {
        service.trigger_drain().await;
    });
}
