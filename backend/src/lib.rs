//! Flowdesk workflow engine backend
//!
//! Workflow definitions, running instances, lifecycle triggers and scheduled
//! runs, served over HTTP and backed by PostgreSQL.

use axum::{
    http::Method,
    routing::get,
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod services;
pub mod workflows;

#[cfg(test)]
mod tests;

pub use error::{ApiError, ApiResult, AppError};

use config::SmtpConfig;
use jobs::{JobScheduler, ScheduledWorkflowJob};
use services::{LogEmailSink, PgEntityStore, PgNotificationSink, PgTaskSink, SmtpEmailSink};
use workflows::{Collaborators, EmailSink, PgWorkflowStore, SystemClock, WorkflowRuntime};

pub struct AppState {
    pub runtime: WorkflowRuntime,
    pub schedules: ScheduledWorkflowJob,
    pub jobs: Option<Arc<JobScheduler>>,
    pub db_pool: Option<PgPool>,
}

impl AppState {
    pub fn new(runtime: WorkflowRuntime, schedule_row_timeout: Duration) -> Self {
        let schedules = ScheduledWorkflowJob::new(
            runtime.store.clone(),
            runtime.engine.clone(),
            runtime.collaborators.entities.clone(),
            runtime.collaborators.clock.clone(),
            schedule_row_timeout,
        );

        Self {
            runtime,
            schedules,
            jobs: None,
            db_pool: None,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<JobScheduler>) -> Self {
        self.jobs = Some(jobs);
        self
    }
}

/// Engine wired to PostgreSQL storage, with SMTP email when configured
pub fn postgres_runtime(pool: PgPool, smtp: &SmtpConfig) -> WorkflowRuntime {
    let email: Arc<dyn EmailSink> = if smtp.is_configured() {
        Arc::new(SmtpEmailSink::new(smtp))
    } else {
        tracing::warn!("SMTP is not configured, workflow emails will only be logged");
        Arc::new(LogEmailSink)
    };

    let collaborators = Collaborators {
        entities: Arc::new(PgEntityStore::new(pool.clone())),
        notifications: Arc::new(PgNotificationSink::new(pool.clone())),
        tasks: Arc::new(PgTaskSink::new(pool.clone())),
        email,
        clock: Arc::new(SystemClock),
    };

    WorkflowRuntime::new(Arc::new(PgWorkflowStore::new(pool)), collaborators)
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Flowdesk Workflow API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/workflows", handlers::workflow_routes())
        .nest("/api/v1/workflow-states", handlers::state_routes())
        .nest("/api/v1/workflow-transitions", handlers::transition_routes())
        .nest("/api/v1/workflow-templates", handlers::template_routes())
        .nest("/api/v1/workflow-instances", handlers::instance_routes())
        .nest("/api/v1/workflow-history", handlers::history_routes())
        .nest("/api/v1/workflow-triggers", handlers::trigger_routes())
        .nest("/api/v1/scheduled-workflows", handlers::schedule_routes())
        .nest("/api/v1/entity-events", handlers::entity_event_routes())
        .nest("/api/v1/jobs", handlers::job_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
