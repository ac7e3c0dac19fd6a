// Workflow Engine
//
// Generic state-machine engine for the business suite: definitions bound to an
// entity type, one running instance per entity, guarded transitions with side
// effects, and lifecycle triggers that start instances automatically.

pub mod actions;
pub mod collaborators;
pub mod conditions;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod store;
pub mod triggers;

pub use collaborators::{
    Clock, Collaborators, EmailSink, EntityStore, ManualClock, MemoryEntityStore, MemoryOutbox,
    NotificationRequest, NotificationSink, OutboxEmail, SystemClock, TaskContext, TaskRequest, TaskSink,
};
pub use definition::{DefinitionService, NewState, NewTemplate, NewTransition, NewWorkflow, StateUpdate, TransitionUpdate};
pub use engine::{InstanceEngine, StartOutcome, TransitionOutcome};
pub use error::{ActionError, CollaboratorError, CollaboratorResult, WorkflowError, WorkflowResult};
pub use executor::ActionExecutor;
pub use store::{MemoryWorkflowStore, PgWorkflowStore, WorkflowStore};
pub use triggers::{EntityEvent, EntityEventKind, NewTrigger, TriggerFiring, TriggerService};

use std::sync::Arc;

/// The engine's services wired to one store and one set of collaborators
#[derive(Clone)]
pub struct WorkflowRuntime {
    pub store: Arc<dyn WorkflowStore>,
    pub collaborators: Collaborators,
    pub definitions: DefinitionService,
    pub engine: InstanceEngine,
    pub triggers: TriggerService,
}

impl WorkflowRuntime {
    pub fn new(store: Arc<dyn WorkflowStore>, collaborators: Collaborators) -> Self {
        let definitions = DefinitionService::new(store.clone(), collaborators.clock.clone());
        let engine = InstanceEngine::new(
            store.clone(),
            collaborators.entities.clone(),
            ActionExecutor::new(collaborators.clone()),
            collaborators.clock.clone(),
        );
        let triggers = TriggerService::new(store.clone(), engine.clone(), collaborators.clock.clone());

        Self {
            store,
            collaborators,
            definitions,
            engine,
            triggers,
        }
    }
}
