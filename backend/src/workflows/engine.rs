// Workflow Engine - Instance lifecycle: start, transition, cancel, history

use flowdesk_shared::{
    EntityRef, InstanceStatus, Transition, WorkflowHistory, WorkflowInstance, WorkflowStatus,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::actions::EffectResult;
use super::collaborators::{Clock, EntityStore};
use super::conditions;
use super::error::{WorkflowError, WorkflowResult};
use super::executor::{ActionExecutor, ExecutionContext};
use super::store::WorkflowStore;

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub instance: WorkflowInstance,
    /// False when an instance for the same (workflow, entity) already existed
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub instance: WorkflowInstance,
    pub history: WorkflowHistory,
    pub effects: Vec<EffectResult>,
}

#[derive(Clone)]
pub struct InstanceEngine {
    store: Arc<dyn WorkflowStore>,
    entities: Arc<dyn EntityStore>,
    executor: ActionExecutor,
    clock: Arc<dyn Clock>,
}

impl InstanceEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        entities: Arc<dyn EntityStore>,
        executor: ActionExecutor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            entities,
            executor,
            clock,
        }
    }

    /// Start the workflow for an entity. Idempotent per (workflow, entity):
    /// an existing instance is returned as-is, whatever the workflow status.
    pub async fn start(
        &self,
        workflow_id: Uuid,
        entity: EntityRef,
        started_by: Option<Uuid>,
        data: Value,
    ) -> WorkflowResult<StartOutcome> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow", workflow_id))?;

        if let Some(existing) = self.store.find_instance(workflow_id, &entity).await? {
            return Ok(StartOutcome {
                instance: existing,
                created: false,
            });
        }

        if workflow.status != WorkflowStatus::Active {
            return Err(WorkflowError::WorkflowNotActive(workflow.name));
        }

        if entity.entity_type != workflow.target_entity_type {
            return Err(WorkflowError::validation(
                "entity_type",
                format!(
                    "workflow '{}' targets {}, not {}",
                    workflow.name, workflow.target_entity_type, entity.entity_type
                ),
            ));
        }

        let initial = self
            .store
            .list_states(workflow_id)
            .await?
            .into_iter()
            .find(|s| s.is_initial)
            .ok_or_else(|| {
                WorkflowError::Configuration(format!(
                    "workflow '{}' has no initial state",
                    workflow.name
                ))
            })?;

        let candidate = WorkflowInstance {
            id: Uuid::new_v4(),
            workflow_id,
            entity,
            current_state_id: Some(initial.id),
            status: InstanceStatus::Active,
            started_by,
            started_at: self.clock.now(),
            completed_at: None,
            data: if data.is_null() { json!({}) } else { data },
            version: 0,
        };

        let instance = self.store.insert_instance_if_absent(&candidate).await?;
        let created = instance.id == candidate.id;
        if created {
            info!(
                "Started workflow '{}' for {} in state '{}' (instance {})",
                workflow.name, instance.entity, initial.name, instance.id
            );
        }

        Ok(StartOutcome { instance, created })
    }

    pub async fn get_instance(&self, id: Uuid) -> WorkflowResult<WorkflowInstance> {
        self.store
            .get_instance(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow instance", id))
    }

    pub async fn find_instance(
        &self,
        workflow_id: Uuid,
        entity: &EntityRef,
    ) -> WorkflowResult<Option<WorkflowInstance>> {
        self.store.find_instance(workflow_id, entity).await
    }

    pub async fn list_instances(&self, workflow_id: Uuid) -> WorkflowResult<Vec<WorkflowInstance>> {
        self.store.list_instances(workflow_id).await
    }

    /// Outgoing transitions of the current state, in declared order. Guards
    /// are not evaluated here.
    pub async fn available_transitions(&self, instance_id: Uuid) -> WorkflowResult<Vec<Transition>> {
        let instance = self.get_instance(instance_id).await?;
        self.transitions_from_current(&instance).await
    }

    async fn transitions_from_current(
        &self,
        instance: &WorkflowInstance,
    ) -> WorkflowResult<Vec<Transition>> {
        let Some(current) = instance.current_state_id else {
            return Ok(Vec::new());
        };
        if !instance.is_active() {
            return Ok(Vec::new());
        }

        let transitions = self.store.list_transitions(instance.workflow_id).await?;
        Ok(transitions
            .into_iter()
            .filter(|t| t.from_state_id == current)
            .collect())
    }

    /// Fire a transition: guard check, actions, then an atomic commit of the
    /// new state, the history row and completion. Actions run without any
    /// storage lock; the commit fails with `ConcurrentModification` if the
    /// instance changed meanwhile. Never retried here.
    pub async fn apply_transition(
        &self,
        instance_id: Uuid,
        transition_id: Uuid,
        actor: Option<Uuid>,
        notes: &str,
    ) -> WorkflowResult<TransitionOutcome> {
        let instance = self.get_instance(instance_id).await?;
        if !instance.is_active() {
            return Err(WorkflowError::InstanceNotActive {
                status: instance.status,
            });
        }

        let transition = self
            .store
            .get_transition(transition_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Transition", transition_id))?;

        let available = transition.workflow_id == instance.workflow_id
            && instance.current_state_id == Some(transition.from_state_id);
        if !available {
            return Err(WorkflowError::InvalidTransition {
                transition: transition.name,
            });
        }

        let mut snapshot = self.entities.snapshot(&instance.entity).await?;
        if !conditions::evaluate(&snapshot, &transition.conditions) {
            info!(
                "Guard rejected transition '{}' for instance {}",
                transition.name, instance.id
            );
            return Err(WorkflowError::GuardNotSatisfied {
                transition: transition.name,
            });
        }

        let target = self
            .store
            .get_state(transition.to_state_id)
            .await?
            .filter(|s| s.workflow_id == instance.workflow_id)
            .ok_or_else(|| {
                WorkflowError::Configuration(format!(
                    "transition '{}' points at a missing state",
                    transition.name
                ))
            })?;

        let expected_version = instance.version;
        let effects = {
            let mut context = ExecutionContext::new(&instance, actor, &mut snapshot);
            self.executor
                .execute_all(&transition.actions, &mut context)
                .await
                .inspect_err(|e| {
                    warn!(
                        "Transition '{}' aborted for instance {}: {}",
                        transition.name, instance.id, e
                    )
                })?
        };

        let now = self.clock.now();
        let mut updated = instance.clone();
        updated.current_state_id = Some(target.id);
        updated.version = expected_version + 1;
        if target.is_final {
            updated.status = InstanceStatus::Completed;
            updated.completed_at = Some(now);
        }

        let history = WorkflowHistory {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            sequence: updated.version,
            from_state_id: transition.from_state_id,
            to_state_id: target.id,
            transition_id: transition.id,
            triggered_by: actor,
            triggered_at: now,
            notes: notes.to_string(),
        };

        if let Err(e) = self
            .store
            .commit_transition(&updated, expected_version, &history)
            .await
        {
            if matches!(e, WorkflowError::ConcurrentModification(_)) {
                warn!(
                    "Instance {} changed while '{}' ran its {} action(s); side effects were not rolled back",
                    instance.id,
                    transition.name,
                    effects.len()
                );
            }
            return Err(e);
        }

        info!(
            "Instance {} moved to '{}' via '{}'{}",
            instance.id,
            target.name,
            transition.name,
            if target.is_final { " (completed)" } else { "" }
        );

        Ok(TransitionOutcome {
            instance: updated,
            history,
            effects,
        })
    }

    /// Cancel an active instance. No history row is written.
    pub async fn cancel(&self, instance_id: Uuid, actor: Option<Uuid>) -> WorkflowResult<WorkflowInstance> {
        let instance = self.get_instance(instance_id).await?;
        if !instance.is_active() {
            return Err(WorkflowError::InstanceNotActive {
                status: instance.status,
            });
        }

        let mut cancelled = instance.clone();
        cancelled.status = InstanceStatus::Cancelled;
        cancelled.version = instance.version + 1;
        self.store.update_instance(&cancelled, instance.version).await?;

        info!(
            "Instance {} cancelled by {}",
            instance.id,
            actor.map_or_else(|| "system".to_string(), |a| a.to_string())
        );
        Ok(cancelled)
    }

    /// Realized transitions ordered by (triggered_at, sequence)
    pub async fn history(&self, instance_id: Uuid) -> WorkflowResult<Vec<WorkflowHistory>> {
        self.get_instance(instance_id).await?;
        self.store.list_history(instance_id).await
    }

    /// Replace the notes of the latest history row of its instance
    pub async fn amend_history_notes(
        &self,
        history_id: Uuid,
        notes: &str,
    ) -> WorkflowResult<WorkflowHistory> {
        if self.store.get_history(history_id).await?.is_none() {
            return Err(WorkflowError::not_found("Workflow history", history_id));
        }

        self.store
            .amend_latest_history_notes(history_id, notes)
            .await?
            .ok_or_else(|| {
                WorkflowError::validation(
                    "history_id",
                    "only the latest history entry of an instance can be amended",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::collaborators::{
        Collaborators, ManualClock, MemoryEntityStore, MockEmailSink, MockNotificationSink,
        MockTaskSink,
    };
    use crate::workflows::definition::{DefinitionService, NewState, NewTransition, NewWorkflow};
    use crate::workflows::store::MemoryWorkflowStore;
    use crate::workflows::error::CollaboratorResult;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use flowdesk_shared::{Action, Condition, Visibility};
    use serde_json::Map;
    use tokio::sync::Barrier;

    /// Holds every field write until `barrier` releases, so concurrent
    /// transitions all get past their guards before any of them commits
    struct GatedEntityStore {
        inner: MemoryEntityStore,
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl EntityStore for GatedEntityStore {
        async fn snapshot(&self, entity: &EntityRef) -> CollaboratorResult<Value> {
            self.inner.snapshot(entity).await
        }

        async fn set_field(&self, entity: &EntityRef, path: &str, value: Value) -> CollaboratorResult<()> {
            self.barrier.wait().await;
            self.inner.set_field(entity, path, value).await
        }

        async fn exists(&self, entity_type: &str, entity_id: &str) -> CollaboratorResult<bool> {
            self.inner.exists(entity_type, entity_id).await
        }

        async fn find(
            &self,
            entity_type: &str,
            filters: &Map<String, Value>,
        ) -> CollaboratorResult<Vec<EntityRef>> {
            self.inner.find(entity_type, filters).await
        }
    }

    struct Fixture {
        definitions: DefinitionService,
        engine: InstanceEngine,
        entities: MemoryEntityStore,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let entities = MemoryEntityStore::new();
        fixture_over(entities.clone(), Arc::new(entities))
    }

    /// `entities` seeds snapshots; `backing` is what the engine reads and writes
    fn fixture_over(entities: MemoryEntityStore, backing: Arc<dyn EntityStore>) -> Fixture {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemoryWorkflowStore::new());
        let clock = ManualClock::new(Utc::now());

        let mut notifications = MockNotificationSink::new();
        notifications.expect_notify().returning(|_| Ok(()));

        let collaborators = Collaborators {
            entities: backing,
            notifications: Arc::new(notifications),
            tasks: Arc::new(MockTaskSink::new()),
            email: Arc::new(MockEmailSink::new()),
            clock: Arc::new(clock.clone()),
        };

        Fixture {
            definitions: DefinitionService::new(store.clone(), collaborators.clock.clone()),
            engine: InstanceEngine::new(
                store,
                collaborators.entities.clone(),
                ActionExecutor::new(collaborators.clone()),
                collaborators.clock.clone(),
            ),
            entities,
            clock,
        }
    }

    struct Approval {
        workflow_id: Uuid,
        submit: Uuid,
        approve: Uuid,
        reject: Uuid,
    }

    /// Draft -> Submitted -> Approved (final) | Rejected (final)
    async fn approval(fixture: &Fixture) -> Approval {
        let defs = &fixture.definitions;
        let workflow = defs
            .create_workflow(
                NewWorkflow {
                    name: "Expense Approval".to_string(),
                    description: String::new(),
                    target_entity_type: "finance.Expense".to_string(),
                    visibility: Visibility::default(),
                },
                None,
            )
            .await
            .unwrap();

        let draft = defs.add_state(workflow.id, NewState::named("Draft").initial()).await.unwrap();
        let submitted = defs.add_state(workflow.id, NewState::named("Submitted").ordered(1)).await.unwrap();
        let approved = defs
            .add_state(workflow.id, NewState::named("Approved").terminal().ordered(2))
            .await
            .unwrap();
        let rejected = defs
            .add_state(workflow.id, NewState::named("Rejected").terminal().ordered(3))
            .await
            .unwrap();

        let submit = defs
            .add_transition(
                workflow.id,
                NewTransition::between("Submit", draft.id, submitted.id)
                    .with_actions(vec![Action::update_field("status", "submitted")]),
            )
            .await
            .unwrap();
        let approve = defs
            .add_transition(
                workflow.id,
                NewTransition::between("Approve", submitted.id, approved.id)
                    .guarded_by(vec![Condition::less_than("amount", 1000)]),
            )
            .await
            .unwrap();
        let reject = defs
            .add_transition(workflow.id, NewTransition::between("Reject", submitted.id, rejected.id))
            .await
            .unwrap();

        defs.activate(workflow.id).await.unwrap();

        Approval {
            workflow_id: workflow.id,
            submit: submit.id,
            approve: approve.id,
            reject: reject.id,
        }
    }

    async fn expense(fixture: &Fixture, id: &str, amount: i64) -> EntityRef {
        let entity = EntityRef::new("finance.Expense", id);
        fixture
            .entities
            .insert(entity.clone(), json!({"amount": amount, "status": "draft"}))
            .await;
        entity
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 200).await;

        let first = fixture
            .engine
            .start(approval.workflow_id, entity.clone(), None, Value::Null)
            .await
            .unwrap();
        let second = fixture
            .engine
            .start(approval.workflow_id, entity, None, json!({"source": "retry"}))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.instance.id, second.instance.id);
        assert_eq!(second.instance.data, json!({}));
    }

    #[tokio::test]
    async fn test_concurrent_starts_converge() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 200).await;

        let starts = (0..8).map(|_| {
            fixture
                .engine
                .start(approval.workflow_id, entity.clone(), None, Value::Null)
        });
        let outcomes = futures::future::join_all(starts).await;

        let ids: std::collections::HashSet<Uuid> = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap().instance.id)
            .collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.as_ref().unwrap().created).count(), 1);
    }

    #[tokio::test]
    async fn test_inactive_workflow_refuses_new_starts_but_returns_existing() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let existing = expense(&fixture, "1", 200).await;
        let fresh = expense(&fixture, "2", 200).await;

        fixture
            .engine
            .start(approval.workflow_id, existing.clone(), None, Value::Null)
            .await
            .unwrap();
        fixture.definitions.deactivate(approval.workflow_id).await.unwrap();

        let err = fixture
            .engine
            .start(approval.workflow_id, fresh, None, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowNotActive(_)));

        let outcome = fixture
            .engine
            .start(approval.workflow_id, existing, None, Value::Null)
            .await
            .unwrap();
        assert!(!outcome.created);
    }

    #[tokio::test]
    async fn test_failed_guard_leaves_no_trace() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 5000).await;

        let instance = fixture
            .engine
            .start(approval.workflow_id, entity, None, Value::Null)
            .await
            .unwrap()
            .instance;
        fixture.engine.apply_transition(instance.id, approval.submit, None, "").await.unwrap();

        let err = fixture
            .engine
            .apply_transition(instance.id, approval.approve, None, "")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::GuardNotSatisfied { .. }));

        let after = fixture.engine.get_instance(instance.id).await.unwrap();
        assert_eq!(after.version, 1);
        assert!(after.is_active());
        assert_eq!(fixture.engine.history(instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_transition_is_rejected() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 10).await;

        let instance = fixture
            .engine
            .start(approval.workflow_id, entity, None, Value::Null)
            .await
            .unwrap()
            .instance;

        let err = fixture
            .engine
            .apply_transition(instance.id, approval.approve, None, "")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

        let available = fixture.engine.available_transitions(instance.id).await.unwrap();
        assert_eq!(available.iter().map(|t| t.id).collect::<Vec<_>>(), vec![approval.submit]);
    }

    #[tokio::test]
    async fn test_final_state_completes_in_same_commit() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 10).await;
        let approver = Uuid::new_v4();

        let instance = fixture
            .engine
            .start(approval.workflow_id, entity.clone(), None, Value::Null)
            .await
            .unwrap()
            .instance;
        fixture.engine.apply_transition(instance.id, approval.submit, None, "").await.unwrap();
        fixture.clock.advance(Duration::minutes(5));

        let outcome = fixture
            .engine
            .apply_transition(instance.id, approval.approve, Some(approver), "within budget")
            .await
            .unwrap();

        assert_eq!(outcome.instance.status, InstanceStatus::Completed);
        assert_eq!(outcome.instance.completed_at, Some(outcome.history.triggered_at));
        assert_eq!(outcome.history.triggered_by, Some(approver));

        let stored = fixture.engine.get_instance(instance.id).await.unwrap();
        assert_eq!(stored.status, InstanceStatus::Completed);
        assert!(fixture.engine.available_transitions(instance.id).await.unwrap().is_empty());

        let err = fixture
            .engine
            .apply_transition(instance.id, approval.reject, None, "")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InstanceNotActive { status: InstanceStatus::Completed }));

        let snapshot = fixture.entities.snapshot(&entity).await.unwrap();
        assert_eq!(snapshot["status"], json!("submitted"));
    }

    #[tokio::test]
    async fn test_stale_version_is_a_concurrent_modification() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 10).await;

        let instance = fixture
            .engine
            .start(approval.workflow_id, entity, None, Value::Null)
            .await
            .unwrap()
            .instance;

        // Another writer commits first
        let mut moved = instance.clone();
        moved.version = 1;
        fixture.engine.store.update_instance(&moved, 0).await.unwrap();

        let mut stale = instance.clone();
        stale.version = 1;
        let err = fixture.engine.store.update_instance(&stale, 0).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ConcurrentModification(id) if id == instance.id));
    }

    #[tokio::test]
    async fn test_racing_transitions_commit_once() {
        let entities = MemoryEntityStore::new();
        let gated = GatedEntityStore {
            inner: entities.clone(),
            barrier: Arc::new(Barrier::new(2)),
        };
        let fixture = fixture_over(entities, Arc::new(gated));
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 10).await;

        let instance = fixture
            .engine
            .start(approval.workflow_id, entity, None, Value::Null)
            .await
            .unwrap()
            .instance;

        let (a, b) = tokio::join!(
            fixture.engine.apply_transition(instance.id, approval.submit, None, "first"),
            fixture.engine.apply_transition(instance.id, approval.submit, None, "second"),
        );

        let (won, lost) = match (a, b) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            other => panic!("expected exactly one winner, got {:?}", other),
        };
        assert!(matches!(lost, WorkflowError::ConcurrentModification(id) if id == instance.id));
        assert_eq!(won.instance.version, 1);

        let history = fixture.engine.history(instance.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].notes, won.history.notes);
        assert_eq!(fixture.engine.get_instance(instance.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_cancel_only_while_active() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 10).await;

        let instance = fixture
            .engine
            .start(approval.workflow_id, entity, None, Value::Null)
            .await
            .unwrap()
            .instance;

        let cancelled = fixture.engine.cancel(instance.id, None).await.unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert!(fixture.engine.history(instance.id).await.unwrap().is_empty());

        let err = fixture.engine.cancel(instance.id, None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InstanceNotActive { .. }));
    }

    #[tokio::test]
    async fn test_only_latest_history_notes_can_be_amended() {
        let fixture = fixture();
        let approval = approval(&fixture).await;
        let entity = expense(&fixture, "1", 10).await;

        let instance = fixture
            .engine
            .start(approval.workflow_id, entity, None, Value::Null)
            .await
            .unwrap()
            .instance;
        let first = fixture
            .engine
            .apply_transition(instance.id, approval.submit, None, "")
            .await
            .unwrap();
        let second = fixture
            .engine
            .apply_transition(instance.id, approval.reject, None, "")
            .await
            .unwrap();

        let amended = fixture
            .engine
            .amend_history_notes(second.history.id, "duplicate claim")
            .await
            .unwrap();
        assert_eq!(amended.notes, "duplicate claim");

        let err = fixture
            .engine
            .amend_history_notes(first.history.id, "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
    }
}
