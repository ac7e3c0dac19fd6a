use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use flowdesk_shared::{State as WorkflowState, Transition, Workflow, WorkflowTemplate};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::{automation, instances, Actor};
use crate::error::ApiResult;
use crate::workflows::definition::WorkflowGraph;
use crate::workflows::{NewState, NewTemplate, NewTransition, NewWorkflow, StateUpdate, TransitionUpdate};
use crate::AppState;

/// Optional overrides when copying a workflow or instantiating a template
#[derive(Debug, Default, Deserialize)]
pub struct CopyRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route("/:id", get(get_workflow).delete(delete_workflow))
        .route("/:id/activate", post(activate_workflow))
        .route("/:id/deactivate", post(deactivate_workflow))
        .route("/:id/clone", post(clone_workflow))
        .route("/:id/states", get(list_states).post(create_state))
        .route("/:id/transitions", get(list_transitions).post(create_transition))
        .route("/:id/instances", get(instances::list_instances).post(instances::start_instance))
        .route("/:id/triggers", get(automation::list_triggers).post(automation::create_trigger))
        .route("/:id/schedules", get(automation::list_schedules).post(automation::create_schedule))
}

pub fn state_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id", put(update_state))
}

pub fn transition_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id", put(update_transition))
}

pub fn template_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_templates).post(create_template))
        .route("/:id", get(get_template))
        .route("/:id/instantiate", post(instantiate_template))
}

async fn list_workflows(State(state): State<Arc<AppState>>, actor: Actor) -> ApiResult<Json<Vec<Workflow>>> {
    let workflows = state
        .runtime
        .definitions
        .list_visible(actor.user_id, &actor.roles)
        .await?;
    Ok(Json(workflows))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<NewWorkflow>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    payload.validate()?;
    let workflow = state
        .runtime
        .definitions
        .create_workflow(payload, actor.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn get_workflow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<WorkflowGraph>> {
    Ok(Json(state.runtime.definitions.get_graph(id).await?))
}

async fn delete_workflow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.runtime.definitions.delete_workflow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_workflow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.runtime.definitions.activate(id).await?))
}

async fn deactivate_workflow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.runtime.definitions.deactivate(id).await?))
}

async fn clone_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
    payload: Option<Json<CopyRequest>>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let Json(payload) = payload.unwrap_or_default();
    let copy = state
        .runtime
        .definitions
        .clone_workflow(id, payload.name, payload.description, actor.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

async fn list_states(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkflowState>>> {
    Ok(Json(state.runtime.definitions.list_states(id).await?))
}

async fn create_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<NewState>,
) -> ApiResult<(StatusCode, Json<WorkflowState>)> {
    payload.validate()?;
    let created = state.runtime.definitions.add_state(id, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StateUpdate>,
) -> ApiResult<Json<WorkflowState>> {
    payload.validate()?;
    Ok(Json(state.runtime.definitions.update_state(id, payload).await?))
}

async fn list_transitions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Transition>>> {
    Ok(Json(state.runtime.definitions.list_transitions(id).await?))
}

async fn create_transition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<NewTransition>,
) -> ApiResult<(StatusCode, Json<Transition>)> {
    payload.validate()?;
    let created = state.runtime.definitions.add_transition(id, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_transition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TransitionUpdate>,
) -> ApiResult<Json<Transition>> {
    payload.validate()?;
    Ok(Json(state.runtime.definitions.update_transition(id, payload).await?))
}

async fn list_templates(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<WorkflowTemplate>>> {
    Ok(Json(state.runtime.definitions.list_templates().await?))
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<NewTemplate>,
) -> ApiResult<(StatusCode, Json<WorkflowTemplate>)> {
    payload.validate()?;
    let template = state
        .runtime
        .definitions
        .create_template(payload, actor.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowTemplate>> {
    Ok(Json(state.runtime.definitions.get_template(id).await?))
}

async fn instantiate_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
    payload: Option<Json<CopyRequest>>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let Json(payload) = payload.unwrap_or_default();
    let workflow = state
        .runtime
        .definitions
        .create_workflow_from_template(id, payload.name, payload.description, actor.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}
