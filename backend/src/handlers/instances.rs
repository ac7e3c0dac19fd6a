use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use flowdesk_shared::{EntityRef, Transition, WorkflowHistory, WorkflowInstance};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::Actor;
use crate::error::ApiResult;
use crate::workflows::{StartOutcome, TransitionOutcome};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct StartRequest {
    #[validate(length(min = 3, max = 200))]
    pub entity_type: String,
    #[validate(length(min = 1, max = 100))]
    pub entity_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub transition_id: Uuid,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct NotesRequest {
    pub notes: String,
}

/// Start endpoints live under the workflow they start
pub fn instance_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_instance))
        .route("/:id/transitions", get(available_transitions))
        .route("/:id/transition", post(apply_transition))
        .route("/:id/cancel", post(cancel_instance))
        .route("/:id/history", get(instance_history))
}

pub fn history_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id/notes", put(amend_notes))
}

pub(super) async fn list_instances(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkflowInstance>>> {
    Ok(Json(state.runtime.engine.list_instances(workflow_id).await?))
}

pub(super) async fn start_instance(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<StartOutcome>)> {
    payload.validate()?;
    let entity = EntityRef::new(payload.entity_type, payload.entity_id);
    let outcome = state
        .runtime
        .engine
        .start(workflow_id, entity, actor.user_id, payload.data)
        .await?;

    let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}

async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowInstance>> {
    Ok(Json(state.runtime.engine.get_instance(id).await?))
}

async fn available_transitions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Transition>>> {
    Ok(Json(state.runtime.engine.available_transitions(id).await?))
}

async fn apply_transition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<TransitionRequest>,
) -> ApiResult<Json<TransitionOutcome>> {
    let outcome = state
        .runtime
        .engine
        .apply_transition(id, payload.transition_id, actor.user_id, &payload.notes)
        .await?;
    Ok(Json(outcome))
}

async fn cancel_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<Json<WorkflowInstance>> {
    Ok(Json(state.runtime.engine.cancel(id, actor.user_id).await?))
}

async fn instance_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkflowHistory>>> {
    Ok(Json(state.runtime.engine.history(id).await?))
}

async fn amend_notes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<NotesRequest>,
) -> ApiResult<Json<WorkflowHistory>> {
    Ok(Json(state.runtime.engine.amend_history_notes(id, &payload.notes).await?))
}
