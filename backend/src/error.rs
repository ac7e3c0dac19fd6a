//! Standardized error handling for the Flowdesk workflow API
//!
//! Every endpoint answers failures with the same JSON envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::jobs::JobError;
use crate::workflows::WorkflowError;

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_ERROR", "NOT_FOUND", "INVALID_TRANSITION")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional field-level errors for validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, Vec<String>>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    ValidationError { details: HashMap<String, Vec<String>> },
    Workflow(WorkflowError),
    InternalError(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Workflow(err) => match err {
                WorkflowError::NotFound { .. } => StatusCode::NOT_FOUND,
                WorkflowError::Validation { .. } | WorkflowError::Configuration(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                WorkflowError::InvalidTransition { .. } | WorkflowError::GuardNotSatisfied { .. } => {
                    StatusCode::BAD_REQUEST
                }
                WorkflowError::InstanceNotActive { .. }
                | WorkflowError::WorkflowNotActive(_)
                | WorkflowError::ConcurrentModification(_)
                | WorkflowError::ScheduleBusy { .. } => StatusCode::CONFLICT,
                WorkflowError::Action { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                WorkflowError::EntityStore(_) => StatusCode::BAD_GATEWAY,
                WorkflowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::Workflow(err) => match err {
                WorkflowError::NotFound { .. } => "NOT_FOUND",
                WorkflowError::Configuration(_) => "CONFIGURATION_ERROR",
                WorkflowError::Validation { .. } => "VALIDATION_ERROR",
                WorkflowError::InvalidTransition { .. } => "INVALID_TRANSITION",
                WorkflowError::GuardNotSatisfied { .. } => "GUARD_NOT_SATISFIED",
                WorkflowError::InstanceNotActive { .. } => "INSTANCE_NOT_ACTIVE",
                WorkflowError::WorkflowNotActive(_) => "WORKFLOW_NOT_ACTIVE",
                WorkflowError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
                WorkflowError::Action { .. } => "ACTION_FAILED",
                WorkflowError::ScheduleBusy { .. } => "SCHEDULE_BUSY",
                WorkflowError::EntityStore(_) => "ENTITY_STORE_ERROR",
                WorkflowError::Storage(_) => "DATABASE_ERROR",
            },
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::BadRequest(msg) => msg.clone(),
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::Workflow(WorkflowError::Storage(msg)) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::Workflow(WorkflowError::Validation { .. }) => "Validation failed".to_string(),
            Self::Workflow(err) => err.to_string(),
        }
    }

    fn details(&self) -> Option<HashMap<String, Vec<String>>> {
        match self {
            Self::ValidationError { details } => Some(details.clone()),
            Self::Workflow(WorkflowError::Validation { field, message }) => {
                Some(HashMap::from([(field.clone(), vec![message.clone()])]))
            }
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Some(details) = self.details() {
            error = error.with_details(details);
        }

        (status, Json(error)).into_response()
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        Self::Workflow(err)
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::WorkflowError(err) => Self::Workflow(err),
            JobError::ConfigError(msg) => Self::BadRequest(msg),
            JobError::SchedulerError(err) => Self::InternalError(err.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages = errors
                    .iter()
                    .map(|e| match &e.message {
                        Some(message) => message.to_string(),
                        None => format!("{} is invalid ({})", field, e.code),
                    })
                    .collect();
                (field.to_string(), messages)
            })
            .collect();
        Self::ValidationError { details }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;
