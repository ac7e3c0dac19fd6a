use chrono::{DateTime, TimeZone, Utc};
use fake::faker::internet::en::SafeEmail;
use fake::faker::lorem::en::Sentence;
use fake::faker::name::en::Name;
use fake::Fake;
use flowdesk_shared::{Action, Condition, EntityRef, Visibility, Workflow};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::ScheduledWorkflowJob;
use crate::workflows::{
    Collaborators, ManualClock, MemoryEntityStore, MemoryOutbox, MemoryWorkflowStore, NewState,
    NewTransition, NewWorkflow, WorkflowRuntime,
};

pub const TICKET: &str = "service.ServiceTicket";
pub const USER: &str = "core.User";

/// The whole engine in memory, with a settable clock
pub struct TestRuntime {
    pub runtime: WorkflowRuntime,
    pub schedules: ScheduledWorkflowJob,
    pub entities: MemoryEntityStore,
    pub outbox: MemoryOutbox,
    pub clock: ManualClock,
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

impl TestRuntime {
    pub fn new() -> Self {
        let entities = MemoryEntityStore::new();
        let outbox = MemoryOutbox::new();
        let clock = ManualClock::new(epoch());

        let collaborators = Collaborators::in_memory(entities.clone(), outbox.clone(), Arc::new(clock.clone()));
        let runtime = WorkflowRuntime::new(Arc::new(MemoryWorkflowStore::new()), collaborators);
        let schedules = ScheduledWorkflowJob::new(
            runtime.store.clone(),
            runtime.engine.clone(),
            runtime.collaborators.entities.clone(),
            runtime.collaborators.clock.clone(),
            Duration::from_secs(5),
        );

        Self {
            runtime,
            schedules,
            entities,
            outbox,
            clock,
        }
    }

    /// A user entity with an email address
    pub async fn user(&self) -> Uuid {
        let id = Uuid::new_v4();
        let name: String = Name().fake();
        let email: String = SafeEmail().fake();
        self.entities
            .insert(
                EntityRef::new(USER, id.to_string()),
                json!({"id": id, "name": name, "email": email}),
            )
            .await;
        id
    }

    pub async fn ticket(&self, id: &str, priority: &str, assignee: Option<Uuid>) -> EntityRef {
        let entity = EntityRef::new(TICKET, id);
        let title: String = Sentence(3..6).fake();
        self.entities
            .insert(
                entity.clone(),
                json!({
                    "title": title,
                    "priority": priority,
                    "status": "new",
                    "assignee": assignee,
                    "sla": {"breached": false},
                }),
            )
            .await;
        entity
    }

    pub async fn snapshot(&self, entity: &EntityRef) -> Value {
        use crate::workflows::EntityStore;
        self.entities.snapshot(entity).await.unwrap()
    }
}

/// Ids of the Ticket Escalation graph
pub struct Escalation {
    pub workflow: Workflow,
    pub new: Uuid,
    pub escalated: Uuid,
    pub resolved: Uuid,
    pub escalate: Uuid,
    pub resolve: Uuid,
}

/// New (initial) -> Escalated -> Resolved (final). Escalating needs an
/// urgent ticket, marks it and notifies the assignee.
pub async fn ticket_escalation(test: &TestRuntime) -> Escalation {
    let defs = &test.runtime.definitions;
    let workflow = defs
        .create_workflow(
            NewWorkflow {
                name: "Ticket Escalation".to_string(),
                description: "Escalate urgent tickets".to_string(),
                target_entity_type: TICKET.to_string(),
                visibility: Visibility {
                    is_public: true,
                    ..Visibility::default()
                },
            },
            None,
        )
        .await
        .unwrap();

    let new = defs.add_state(workflow.id, NewState::named("New").initial()).await.unwrap();
    let escalated = defs
        .add_state(workflow.id, NewState::named("Escalated").ordered(1))
        .await
        .unwrap();
    let resolved = defs
        .add_state(workflow.id, NewState::named("Resolved").terminal().ordered(2))
        .await
        .unwrap();

    let escalate = defs
        .add_transition(
            workflow.id,
            NewTransition::between("Escalate", new.id, escalated.id)
                .guarded_by(vec![Condition::equals("priority", "urgent")])
                .with_actions(vec![
                    Action::update_field("status", "escalated"),
                    Action::notify(&["assignee"], "Ticket escalated", "{{title}} needs attention"),
                ]),
        )
        .await
        .unwrap();
    let resolve = defs
        .add_transition(
            workflow.id,
            NewTransition::between("Resolve", escalated.id, resolved.id)
                .with_actions(vec![Action::update_field("status", "resolved")]),
        )
        .await
        .unwrap();

    let workflow = defs.activate(workflow.id).await.unwrap();

    Escalation {
        workflow,
        new: new.id,
        escalated: escalated.id,
        resolved: resolved.id,
        escalate: escalate.id,
        resolve: resolve.id,
    }
}
