// Workflow Store - Persistence boundary for definitions, instances and schedules

mod memory;
mod postgres;

pub use memory::MemoryWorkflowStore;
pub use postgres::PgWorkflowStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdesk_shared::{
    EntityRef, ScheduleStatus, ScheduledWorkflow, State, Transition, Workflow, WorkflowHistory,
    WorkflowInstance, WorkflowStatus, WorkflowTemplate, WorkflowTrigger,
};
use uuid::Uuid;

use super::error::WorkflowResult;

/// Storage for everything the engine owns.
///
/// Implementations must make the multi-row operations atomic:
/// `save_state` (initial-state demotion), `insert_graph`, `insert_instance_if_absent`,
/// `commit_transition`, `update_instance` and `flip_schedule_status`.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // ===== Definitions =====

    async fn insert_workflow(&self, workflow: &Workflow) -> WorkflowResult<()>;

    async fn get_workflow(&self, id: Uuid) -> WorkflowResult<Option<Workflow>>;

    async fn list_workflows(&self) -> WorkflowResult<Vec<Workflow>>;

    async fn set_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        at: DateTime<Utc>,
    ) -> WorkflowResult<()>;

    /// Removes the workflow with its graph, instances, history, triggers and
    /// schedules. Returns false if it did not exist.
    async fn delete_workflow(&self, id: Uuid) -> WorkflowResult<bool>;

    /// Insert or replace a state. An initial state demotes every other
    /// initial state of its workflow in the same step. A duplicate name in
    /// the workflow is a validation error.
    async fn save_state(&self, state: &State) -> WorkflowResult<()>;

    async fn get_state(&self, id: Uuid) -> WorkflowResult<Option<State>>;

    /// Ordered by display order, then name
    async fn list_states(&self, workflow_id: Uuid) -> WorkflowResult<Vec<State>>;

    /// Insert or replace a transition. A duplicate name in the workflow is a
    /// validation error.
    async fn save_transition(&self, transition: &Transition) -> WorkflowResult<()>;

    async fn get_transition(&self, id: Uuid) -> WorkflowResult<Option<Transition>>;

    /// Ordered by display order, then creation time
    async fn list_transitions(&self, workflow_id: Uuid) -> WorkflowResult<Vec<Transition>>;

    /// Insert a new workflow together with its whole graph. Either all rows
    /// land or none do.
    async fn insert_graph(
        &self,
        workflow: &Workflow,
        states: &[State],
        transitions: &[Transition],
    ) -> WorkflowResult<()>;

    // ===== Instances =====

    /// Insert unless an instance for the same (workflow, entity) exists;
    /// returns whichever instance is stored afterwards.
    async fn insert_instance_if_absent(
        &self,
        instance: &WorkflowInstance,
    ) -> WorkflowResult<WorkflowInstance>;

    async fn get_instance(&self, id: Uuid) -> WorkflowResult<Option<WorkflowInstance>>;

    async fn find_instance(
        &self,
        workflow_id: Uuid,
        entity: &EntityRef,
    ) -> WorkflowResult<Option<WorkflowInstance>>;

    async fn list_instances(&self, workflow_id: Uuid) -> WorkflowResult<Vec<WorkflowInstance>>;

    /// Persist the post-transition instance and append its history row,
    /// provided the stored version still equals `expected_version`.
    /// Otherwise fails with `ConcurrentModification` and writes nothing.
    async fn commit_transition(
        &self,
        instance: &WorkflowInstance,
        expected_version: i64,
        history: &WorkflowHistory,
    ) -> WorkflowResult<()>;

    /// Version-checked instance update without a history row
    async fn update_instance(
        &self,
        instance: &WorkflowInstance,
        expected_version: i64,
    ) -> WorkflowResult<()>;

    /// Ordered by (triggered_at, sequence)
    async fn list_history(&self, instance_id: Uuid) -> WorkflowResult<Vec<WorkflowHistory>>;

    async fn get_history(&self, id: Uuid) -> WorkflowResult<Option<WorkflowHistory>>;

    /// Replace the notes of a history row if it is the latest of its
    /// instance. `None` when the row is not the latest.
    async fn amend_latest_history_notes(
        &self,
        id: Uuid,
        notes: &str,
    ) -> WorkflowResult<Option<WorkflowHistory>>;

    // ===== Triggers =====

    async fn save_trigger(&self, trigger: &WorkflowTrigger) -> WorkflowResult<()>;

    async fn get_trigger(&self, id: Uuid) -> WorkflowResult<Option<WorkflowTrigger>>;

    async fn list_triggers(&self, workflow_id: Uuid) -> WorkflowResult<Vec<WorkflowTrigger>>;

    /// Active triggers of active workflows targeting `entity_type`
    async fn list_active_triggers(&self, entity_type: &str)
    -> WorkflowResult<Vec<WorkflowTrigger>>;

    // ===== Schedules =====

    async fn save_schedule(&self, schedule: &ScheduledWorkflow) -> WorkflowResult<()>;

    async fn get_schedule(&self, id: Uuid) -> WorkflowResult<Option<ScheduledWorkflow>>;

    async fn list_schedules(&self, workflow_id: Uuid) -> WorkflowResult<Vec<ScheduledWorkflow>>;

    /// Pending rows whose `next_run` (or `scheduled_date` when unset) is at
    /// or before `now`
    async fn list_due_schedules(&self, now: DateTime<Utc>)
    -> WorkflowResult<Vec<ScheduledWorkflow>>;

    /// Atomically move a schedule whose status is one of `from` to `to`.
    /// Moving to `running` also stamps `last_run`. `None` if the row was not
    /// in any of the `from` statuses.
    async fn flip_schedule_status(
        &self,
        id: Uuid,
        from: &[ScheduleStatus],
        to: ScheduleStatus,
        at: DateTime<Utc>,
    ) -> WorkflowResult<Option<ScheduledWorkflow>>;

    /// Record the end of a run. `next_run` is only written when `Some`.
    async fn finish_schedule(
        &self,
        id: Uuid,
        status: ScheduleStatus,
        next_run: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> WorkflowResult<()>;

    // ===== Templates =====

    async fn save_template(&self, template: &WorkflowTemplate) -> WorkflowResult<()>;

    async fn get_template(&self, id: Uuid) -> WorkflowResult<Option<WorkflowTemplate>>;

    async fn list_templates(&self) -> WorkflowResult<Vec<WorkflowTemplate>>;
}
