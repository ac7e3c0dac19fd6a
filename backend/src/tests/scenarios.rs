use flowdesk_shared::{Action, InstanceStatus, TriggerType};
use serde_json::{json, Value};

use super::fixtures::{ticket_escalation, TestRuntime, TICKET};
use crate::workflows::{ActionError, EntityEvent, NewTransition, NewTrigger, WorkflowError};

#[tokio::test]
async fn test_low_priority_ticket_cannot_escalate() {
    let test = TestRuntime::new();
    let flow = ticket_escalation(&test).await;
    let ticket = test.ticket("101", "low", None).await;

    let started = test
        .runtime
        .engine
        .start(flow.workflow.id, ticket.clone(), None, Value::Null)
        .await
        .unwrap();

    let err = test
        .runtime
        .engine
        .apply_transition(started.instance.id, flow.escalate, None, "")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::GuardNotSatisfied { .. }));

    let instance = test.runtime.engine.get_instance(started.instance.id).await.unwrap();
    assert_eq!(instance.current_state_id, Some(flow.new));
    assert!(test.runtime.engine.history(instance.id).await.unwrap().is_empty());
    assert_eq!(test.snapshot(&ticket).await["status"], json!("new"));
    assert!(test.outbox.notifications().await.is_empty());
}

#[tokio::test]
async fn test_urgent_ticket_escalates_and_notifies_assignee() {
    let test = TestRuntime::new();
    let flow = ticket_escalation(&test).await;
    let assignee = test.user().await;
    let agent = test.user().await;
    let ticket = test.ticket("102", "urgent", Some(assignee)).await;

    let started = test
        .runtime
        .engine
        .start(flow.workflow.id, ticket.clone(), Some(agent), Value::Null)
        .await
        .unwrap();

    let outcome = test
        .runtime
        .engine
        .apply_transition(started.instance.id, flow.escalate, Some(agent), "customer is down")
        .await
        .unwrap();

    assert_eq!(outcome.instance.current_state_id, Some(flow.escalated));
    assert_eq!(outcome.instance.status, InstanceStatus::Active);
    assert_eq!(outcome.effects.len(), 2);

    let history = test.runtime.engine.history(started.instance.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_state_id, flow.new);
    assert_eq!(history[0].to_state_id, flow.escalated);
    assert_eq!(history[0].triggered_by, Some(agent));
    assert_eq!(history[0].notes, "customer is down");

    assert_eq!(test.snapshot(&ticket).await["status"], json!("escalated"));

    let notifications = test.outbox.notifications().await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].user_id, assignee);
    assert_eq!(notifications[0].entity, ticket);
    assert!(notifications[0].message.ends_with("needs attention"));
    assert!(!notifications[0].message.contains("{{"));
}

#[tokio::test]
async fn test_history_replays_as_connected_path_to_completion() {
    let test = TestRuntime::new();
    let flow = ticket_escalation(&test).await;
    let ticket = test.ticket("103", "urgent", None).await;

    let started = test
        .runtime
        .engine
        .start(flow.workflow.id, ticket, None, Value::Null)
        .await
        .unwrap();
    let id = started.instance.id;

    test.runtime.engine.apply_transition(id, flow.escalate, None, "").await.unwrap();
    test.clock.advance(chrono::Duration::minutes(30));
    let done = test.runtime.engine.apply_transition(id, flow.resolve, None, "").await.unwrap();

    assert_eq!(done.instance.status, InstanceStatus::Completed);
    assert_eq!(done.instance.completed_at, Some(done.history.triggered_at));

    let history = test.runtime.engine.history(id).await.unwrap();
    let mut position = flow.new;
    for row in &history {
        assert_eq!(row.from_state_id, position);
        position = row.to_state_id;
    }
    assert_eq!(position, flow.resolved);
    assert!(history.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));

    let err = test
        .runtime
        .engine
        .apply_transition(id, flow.resolve, None, "")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InstanceNotActive { .. }));
}

#[tokio::test]
async fn test_failing_update_field_leaves_instance_in_place() {
    let test = TestRuntime::new();
    let flow = ticket_escalation(&test).await;

    // A draft copy so transitions can be edited before activation
    let copy = test
        .runtime
        .definitions
        .clone_workflow(flow.workflow.id, None, None, None)
        .await
        .unwrap();
    assert_eq!(copy.name, "Ticket Escalation (Copy)");
    let graph = test.runtime.definitions.get_graph(copy.id).await.unwrap();
    let state = |name: &str| graph.states.iter().find(|s| s.name == name).unwrap().id;

    let broken = test
        .runtime
        .definitions
        .add_transition(
            copy.id,
            NewTransition::between("Reassign", state("New"), state("Escalated")).with_actions(vec![
                Action::update_field("status", "reassigned"),
                Action::notify(&["assignee"], "Reassigned", "Ticket moved"),
                Action::update_field("owner.team", "tier-2"),
            ]),
        )
        .await
        .unwrap();
    test.runtime.definitions.activate(copy.id).await.unwrap();

    let ticket = test.ticket("104", "urgent", None).await;
    let before = test.snapshot(&ticket).await;
    let started = test
        .runtime
        .engine
        .start(copy.id, ticket.clone(), None, Value::Null)
        .await
        .unwrap();

    let err = test
        .runtime
        .engine
        .apply_transition(started.instance.id, broken.id, None, "")
        .await
        .unwrap_err();
    match err {
        WorkflowError::Action { index, kind, source } => {
            assert_eq!(index, 2);
            assert_eq!(kind, "update_field");
            assert!(matches!(source, ActionError::PathNotFound(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let instance = test.runtime.engine.get_instance(started.instance.id).await.unwrap();
    assert_eq!(instance.current_state_id, Some(state("New")));
    assert_eq!(instance.version, started.instance.version);
    assert!(test.runtime.engine.history(instance.id).await.unwrap().is_empty());
    // The earlier status write never reached the ticket
    assert_eq!(test.snapshot(&ticket).await, before);
    assert_eq!(before["status"], json!("new"));
}

#[tokio::test]
async fn test_triggers_start_instances_from_entity_events() {
    let test = TestRuntime::new();
    let flow = ticket_escalation(&test).await;
    let creator = test.user().await;

    let on_create = test
        .runtime
        .triggers
        .create_trigger(
            flow.workflow.id,
            NewTrigger {
                name: "Urgent tickets".to_string(),
                trigger_type: TriggerType::OnCreate,
                field_name: None,
                conditions: vec![flowdesk_shared::Condition::equals("priority", "urgent")],
                is_active: true,
            },
        )
        .await
        .unwrap();

    let low = test.ticket("201", "low", None).await;
    let firings = test
        .runtime
        .triggers
        .on_entity_event(&EntityEvent::created(low.clone(), test.snapshot(&low).await))
        .await
        .unwrap();
    assert!(firings.is_empty());

    let urgent = test.ticket("202", "urgent", None).await;
    let mut snapshot = test.snapshot(&urgent).await;
    snapshot["created_by"] = json!(creator);
    let event = EntityEvent::created(urgent.clone(), snapshot);

    let firings = test.runtime.triggers.on_entity_event(&event).await.unwrap();
    assert_eq!(firings.len(), 1);
    assert!(firings[0].created);
    assert_eq!(firings[0].trigger_id, on_create.id);

    let instance = test
        .runtime
        .engine
        .find_instance(flow.workflow.id, &urgent)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.started_by, Some(creator));
    assert_eq!(instance.entity.entity_type, TICKET);

    // Replaying the event converges on the same instance
    let again = test.runtime.triggers.on_entity_event(&event).await.unwrap();
    assert_eq!(again[0].instance_id, Some(instance.id));
    assert!(!again[0].created);

    test.runtime.triggers.deactivate(on_create.id).await.unwrap();
    let other = test.ticket("203", "urgent", None).await;
    let firings = test
        .runtime
        .triggers
        .on_entity_event(&EntityEvent::created(other.clone(), test.snapshot(&other).await))
        .await
        .unwrap();
    assert!(firings.is_empty());
}

#[tokio::test]
async fn test_field_change_trigger_ignores_unrelated_updates() {
    let test = TestRuntime::new();
    let flow = ticket_escalation(&test).await;

    test.runtime
        .triggers
        .create_trigger(
            flow.workflow.id,
            NewTrigger {
                name: "Priority changed".to_string(),
                trigger_type: TriggerType::OnFieldChange,
                field_name: Some("priority".to_string()),
                conditions: Vec::new(),
                is_active: true,
            },
        )
        .await
        .unwrap();

    let ticket = test.ticket("301", "low", None).await;
    let old = test.snapshot(&ticket).await;

    let mut retitled = old.clone();
    retitled["title"] = json!("Printer on fire");
    let firings = test
        .runtime
        .triggers
        .on_entity_event(&EntityEvent::updated(ticket.clone(), old.clone(), retitled.clone()))
        .await
        .unwrap();
    assert!(firings.is_empty());

    let mut raised = retitled.clone();
    raised["priority"] = json!("urgent");
    let firings = test
        .runtime
        .triggers
        .on_entity_event(&EntityEvent::updated(ticket, retitled, raised))
        .await
        .unwrap();
    assert_eq!(firings.len(), 1);
    assert!(firings[0].error.is_none());
}

#[tokio::test]
async fn test_on_field_change_trigger_requires_field_name() {
    let test = TestRuntime::new();
    let flow = ticket_escalation(&test).await;

    let err = test
        .runtime
        .triggers
        .create_trigger(
            flow.workflow.id,
            NewTrigger {
                name: "Anything".to_string(),
                trigger_type: TriggerType::OnFieldChange,
                field_name: Some("  ".to_string()),
                conditions: Vec::new(),
                is_active: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "field_name"));
}
