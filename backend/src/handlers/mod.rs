use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::AppState;

pub mod automation;
pub mod instances;
pub mod workflows;

pub use automation::{entity_event_routes, job_routes, schedule_routes, trigger_routes};
pub use instances::{history_routes, instance_routes};
pub use workflows::{state_routes, template_routes, transition_routes, workflow_routes};

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const ROLES_HEADER: &str = "x-actor-roles";

/// The user on whose behalf a request runs, as forwarded by the gateway
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub user_id: Option<Uuid>,
    pub roles: Vec<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = match parts.headers.get(ACTOR_HEADER) {
            Some(value) => {
                let raw = value
                    .to_str()
                    .map_err(|_| AppError::BadRequest(format!("{} is not valid text", ACTOR_HEADER)))?;
                Some(
                    raw.trim()
                        .parse::<Uuid>()
                        .map_err(|_| AppError::BadRequest(format!("{} must be a UUID", ACTOR_HEADER)))?,
                )
            }
            None => None,
        };

        let roles = parts
            .headers
            .get(ROLES_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|role| !role.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { user_id, roles })
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let database = match &state.db_pool {
        Some(pool) => crate::database::ping(pool).await,
        None => true,
    };

    if database {
        (StatusCode::OK, Json(json!({"status": "healthy", "service": "flowdesk-workflows"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy", "service": "flowdesk-workflows", "database": "unreachable"})),
        )
    }
}
