// Workflow Triggers - Start instances in reaction to entity lifecycle events

use flowdesk_shared::{Condition, EntityRef, TriggerType, WorkflowTrigger};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::actions::RecipientRole;
use super::collaborators::Clock;
use super::conditions::{self, resolve_path, values_equal};
use super::engine::InstanceEngine;
use super::error::{WorkflowError, WorkflowResult};
use super::store::WorkflowStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityEventKind {
    Created,
    Updated,
    Deleted,
}

/// A domain entity was created, updated or is about to be deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEvent {
    pub kind: EntityEventKind,
    #[serde(flatten)]
    pub entity: EntityRef,
    /// Snapshot before the change, for updates
    #[serde(default)]
    pub old_snapshot: Option<Value>,
    /// Current snapshot; for deletes, the about-to-be-removed state
    pub snapshot: Value,
    #[serde(default)]
    pub actor: Option<Uuid>,
}

impl EntityEvent {
    pub fn created(entity: EntityRef, snapshot: Value) -> Self {
        Self {
            kind: EntityEventKind::Created,
            entity,
            old_snapshot: None,
            snapshot,
            actor: None,
        }
    }

    pub fn updated(entity: EntityRef, old_snapshot: Value, snapshot: Value) -> Self {
        Self {
            kind: EntityEventKind::Updated,
            entity,
            old_snapshot: Some(old_snapshot),
            snapshot,
            actor: None,
        }
    }

    pub fn deleted(entity: EntityRef, snapshot: Value) -> Self {
        Self {
            kind: EntityEventKind::Deleted,
            entity,
            old_snapshot: None,
            snapshot,
            actor: None,
        }
    }

    pub fn by(mut self, actor: Uuid) -> Self {
        self.actor = Some(actor);
        self
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewTrigger {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub field_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Outcome of one trigger that matched an event
#[derive(Debug, Clone, Serialize)]
pub struct TriggerFiring {
    pub trigger_id: Uuid,
    pub workflow_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub created: bool,
    pub error: Option<String>,
}

/// Whether `trigger` reacts to `event`, conditions included
pub fn matches_event(trigger: &WorkflowTrigger, event: &EntityEvent) -> bool {
    let kind_matches = match (trigger.trigger_type, event.kind) {
        (TriggerType::OnCreate, EntityEventKind::Created) => true,
        (TriggerType::OnUpdate, EntityEventKind::Updated) => true,
        (TriggerType::OnDelete, EntityEventKind::Deleted) => true,
        (TriggerType::OnFieldChange, EntityEventKind::Updated) => {
            match (&trigger.field_name, &event.old_snapshot) {
                (Some(field), Some(old)) => field_changed(old, &event.snapshot, field),
                _ => false,
            }
        }
        _ => false,
    };

    kind_matches && conditions::evaluate(&event.snapshot, &trigger.conditions)
}

fn field_changed(old: &Value, new: &Value, field: &str) -> bool {
    match (resolve_path(old, field), resolve_path(new, field)) {
        (Some(before), Some(after)) => !values_equal(before, after),
        (None, None) => false,
        _ => true,
    }
}

#[derive(Clone)]
pub struct TriggerService {
    store: Arc<dyn WorkflowStore>,
    engine: InstanceEngine,
    clock: Arc<dyn Clock>,
}

impl TriggerService {
    pub fn new(store: Arc<dyn WorkflowStore>, engine: InstanceEngine, clock: Arc<dyn Clock>) -> Self {
        Self { store, engine, clock }
    }

    pub async fn create_trigger(
        &self,
        workflow_id: Uuid,
        input: NewTrigger,
    ) -> WorkflowResult<WorkflowTrigger> {
        if self.store.get_workflow(workflow_id).await?.is_none() {
            return Err(WorkflowError::not_found("Workflow", workflow_id));
        }

        let name = input.name.trim();
        if name.is_empty() {
            return Err(WorkflowError::validation("name", "must not be empty"));
        }

        let field_name = input
            .field_name
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        if input.trigger_type == TriggerType::OnFieldChange && field_name.is_none() {
            return Err(WorkflowError::validation(
                "field_name",
                "on_field_change triggers need a field name",
            ));
        }

        let trigger = WorkflowTrigger {
            id: Uuid::new_v4(),
            workflow_id,
            name: name.to_string(),
            trigger_type: input.trigger_type,
            field_name,
            conditions: input.conditions,
            is_active: input.is_active,
            created_at: self.clock.now(),
            updated_at: None,
        };
        self.store.save_trigger(&trigger).await?;

        info!("Created {} trigger '{}' for workflow {}", trigger.trigger_type, trigger.name, workflow_id);
        Ok(trigger)
    }

    pub async fn list_triggers(&self, workflow_id: Uuid) -> WorkflowResult<Vec<WorkflowTrigger>> {
        self.store.list_triggers(workflow_id).await
    }

    pub async fn activate(&self, trigger_id: Uuid) -> WorkflowResult<WorkflowTrigger> {
        self.set_active(trigger_id, true).await
    }

    pub async fn deactivate(&self, trigger_id: Uuid) -> WorkflowResult<WorkflowTrigger> {
        self.set_active(trigger_id, false).await
    }

    async fn set_active(&self, trigger_id: Uuid, is_active: bool) -> WorkflowResult<WorkflowTrigger> {
        let mut trigger = self
            .store
            .get_trigger(trigger_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow trigger", trigger_id))?;

        trigger.is_active = is_active;
        trigger.updated_at = Some(self.clock.now());
        self.store.save_trigger(&trigger).await?;
        Ok(trigger)
    }

    /// Evaluate every live trigger for the entity type and start matching
    /// workflows. A failed start is logged and does not stop the others.
    pub async fn on_entity_event(&self, event: &EntityEvent) -> WorkflowResult<Vec<TriggerFiring>> {
        let triggers = self.store.list_active_triggers(&event.entity.entity_type).await?;
        debug!(
            "{:?} event for {}: {} candidate trigger(s)",
            event.kind,
            event.entity,
            triggers.len()
        );

        let started_by = event
            .actor
            .or_else(|| RecipientRole::Creator.resolve(&event.snapshot, None));

        let mut firings = Vec::new();
        for trigger in triggers.iter().filter(|t| matches_event(t, event)) {
            let result = self
                .engine
                .start(trigger.workflow_id, event.entity.clone(), started_by, Value::Null)
                .await;

            let firing = match result {
                Ok(outcome) => {
                    if outcome.created {
                        info!(
                            "Trigger '{}' started workflow {} for {}",
                            trigger.name, trigger.workflow_id, event.entity
                        );
                    }
                    TriggerFiring {
                        trigger_id: trigger.id,
                        workflow_id: trigger.workflow_id,
                        instance_id: Some(outcome.instance.id),
                        created: outcome.created,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(
                        "Trigger '{}' could not start workflow {} for {}: {}",
                        trigger.name, trigger.workflow_id, event.entity, e
                    );
                    TriggerFiring {
                        trigger_id: trigger.id,
                        workflow_id: trigger.workflow_id,
                        instance_id: None,
                        created: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            firings.push(firing);
        }

        Ok(firings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn trigger(trigger_type: TriggerType, field_name: Option<&str>, conditions: Vec<Condition>) -> WorkflowTrigger {
        WorkflowTrigger {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            name: "t".to_string(),
            trigger_type,
            field_name: field_name.map(str::to_string),
            conditions,
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn ticket() -> EntityRef {
        EntityRef::new("service.ServiceTicket", "7")
    }

    #[test]
    fn test_event_kinds_select_trigger_types() {
        let created = EntityEvent::created(ticket(), json!({"priority": "low"}));
        let deleted = EntityEvent::deleted(ticket(), json!({"priority": "low"}));

        assert!(matches_event(&trigger(TriggerType::OnCreate, None, vec![]), &created));
        assert!(!matches_event(&trigger(TriggerType::OnUpdate, None, vec![]), &created));
        assert!(matches_event(&trigger(TriggerType::OnDelete, None, vec![]), &deleted));
        assert!(!matches_event(&trigger(TriggerType::Scheduled, None, vec![]), &created));
    }

    #[test]
    fn test_field_change_needs_a_real_change() {
        let field_trigger = trigger(TriggerType::OnFieldChange, Some("status"), vec![]);

        let unchanged = EntityEvent::updated(
            ticket(),
            json!({"status": "open", "title": "a"}),
            json!({"status": "open", "title": "b"}),
        );
        let changed = EntityEvent::updated(ticket(), json!({"status": "open"}), json!({"status": "closed"}));
        let appeared = EntityEvent::updated(ticket(), json!({}), json!({"status": "open"}));

        assert!(!matches_event(&field_trigger, &unchanged));
        assert!(matches_event(&field_trigger, &changed));
        assert!(matches_event(&field_trigger, &appeared));
    }

    #[test]
    fn test_trigger_conditions_use_current_snapshot() {
        let urgent_only = trigger(
            TriggerType::OnUpdate,
            None,
            vec![Condition::equals("priority", "urgent")],
        );
        let raised = EntityEvent::updated(ticket(), json!({"priority": "low"}), json!({"priority": "urgent"}));
        let lowered = EntityEvent::updated(ticket(), json!({"priority": "urgent"}), json!({"priority": "low"}));

        assert!(matches_event(&urgent_only, &raised));
        assert!(!matches_event(&urgent_only, &lowered));
    }
}
