// Workflow Errors - Error taxonomy shared by every engine component

use flowdesk_shared::{InstanceStatus, ScheduleStatus};
use thiserror::Error;
use uuid::Uuid;

/// Failure raised by an external collaborator (entity store, sinks)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

impl From<sqlx::Error> for CollaboratorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Row".to_string()),
            other => Self::Failed(other.to_string()),
        }
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Failure of a single side effect
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("field path '{0}' cannot be resolved on the entity")]
    PathNotFound(String),
    #[error("invalid action parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Malformed workflow graph. Surfaced to the caller, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Transition '{transition}' is not available from the current state")]
    InvalidTransition { transition: String },

    #[error("Transition conditions not met for '{transition}'")]
    GuardNotSatisfied { transition: String },

    #[error("Workflow instance is {status}, not active")]
    InstanceNotActive { status: InstanceStatus },

    #[error("Workflow '{0}' is not active")]
    WorkflowNotActive(String),

    /// Lost an optimistic version check; re-fetch and retry
    #[error("Workflow instance {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    /// Transition aborted; the instance keeps its pre-transition state
    #[error("Action #{index} ({kind}) failed: {source}")]
    Action {
        index: usize,
        kind: &'static str,
        #[source]
        source: ActionError,
    },

    #[error("Scheduled workflow {id} is {status} and cannot be changed")]
    ScheduleBusy { id: Uuid, status: ScheduleStatus },

    #[error("Entity store error: {0}")]
    EntityStore(#[from] CollaboratorError),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Expected, user-facing outcomes rather than faults
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::GuardNotSatisfied { .. }
                | Self::InstanceNotActive { .. }
                | Self::WorkflowNotActive(_)
        )
    }
}

impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_not_faults() {
        assert!(WorkflowError::GuardNotSatisfied { transition: "Escalate".into() }.is_rejection());
        assert!(WorkflowError::WorkflowNotActive("Onboarding".into()).is_rejection());
        assert!(!WorkflowError::Configuration("no initial state".into()).is_rejection());
        assert!(!WorkflowError::ConcurrentModification(Uuid::new_v4()).is_rejection());
    }

    #[test]
    fn test_action_error_message_names_the_action() {
        let err = WorkflowError::Action {
            index: 1,
            kind: "update_field",
            source: ActionError::PathNotFound("customer.tier".into()),
        };
        assert_eq!(
            err.to_string(),
            "Action #1 (update_field) failed: field path 'customer.tier' cannot be resolved on the entity"
        );
    }
}
