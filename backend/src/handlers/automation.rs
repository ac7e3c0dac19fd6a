use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use flowdesk_shared::{ScheduledWorkflow, WorkflowTrigger};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::Actor;
use crate::error::{ApiResult, AppError};
use crate::jobs::{JobExecutionLog, NewScheduledWorkflow, ScheduleRunReport, ScheduleTickResult};
use crate::workflows::{EntityEvent, NewTrigger, TriggerFiring};
use crate::AppState;

pub fn trigger_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id/activate", post(activate_trigger))
        .route("/:id/deactivate", post(deactivate_trigger))
}

pub fn schedule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_schedule))
        .route("/:id/run", post(run_schedule_now))
        .route("/:id/activate", post(activate_schedule))
        .route("/:id/deactivate", post(deactivate_schedule))
}

pub fn entity_event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(publish_entity_event))
}

pub fn job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs", get(job_logs))
        .route("/:name/run", post(run_job))
}

// ===== Triggers =====

pub(super) async fn list_triggers(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkflowTrigger>>> {
    Ok(Json(state.runtime.triggers.list_triggers(workflow_id).await?))
}

pub(super) async fn create_trigger(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
    Json(payload): Json<NewTrigger>,
) -> ApiResult<(StatusCode, Json<WorkflowTrigger>)> {
    payload.validate()?;
    let trigger = state.runtime.triggers.create_trigger(workflow_id, payload).await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

async fn activate_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowTrigger>> {
    Ok(Json(state.runtime.triggers.activate(id).await?))
}

async fn deactivate_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowTrigger>> {
    Ok(Json(state.runtime.triggers.deactivate(id).await?))
}

async fn publish_entity_event(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(mut event): Json<EntityEvent>,
) -> ApiResult<Json<Vec<TriggerFiring>>> {
    if event.actor.is_none() {
        event.actor = actor.user_id;
    }
    Ok(Json(state.runtime.triggers.on_entity_event(&event).await?))
}

// ===== Scheduled workflows =====

pub(super) async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ScheduledWorkflow>>> {
    Ok(Json(state.schedules.list(workflow_id).await?))
}

pub(super) async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<NewScheduledWorkflow>,
) -> ApiResult<(StatusCode, Json<ScheduledWorkflow>)> {
    payload.validate()?;
    let schedule = state.schedules.create(workflow_id, payload, actor.user_id).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduledWorkflow>> {
    Ok(Json(state.schedules.get(id).await?))
}

async fn run_schedule_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<Json<ScheduleRunReport>> {
    Ok(Json(state.schedules.run_now(id, actor.user_id).await?))
}

async fn activate_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduledWorkflow>> {
    Ok(Json(state.schedules.activate(id).await?))
}

async fn deactivate_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduledWorkflow>> {
    Ok(Json(state.schedules.deactivate(id).await?))
}

// ===== Background jobs =====

async fn job_logs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<JobExecutionLog>>> {
    let logs = match &state.jobs {
        Some(jobs) => jobs.get_execution_logs().await,
        None => Vec::new(),
    };
    Ok(Json(logs))
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ScheduleTickResult>> {
    let jobs = state
        .jobs
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("Background jobs are not running".to_string()))?;
    Ok(Json(jobs.run_job_now(&name).await?))
}
