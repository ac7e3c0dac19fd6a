// In-memory workflow store, used by tests and database-less runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdesk_shared::{
    EntityRef, ScheduleStatus, ScheduledWorkflow, State, Transition, Workflow, WorkflowHistory,
    WorkflowInstance, WorkflowStatus, WorkflowTemplate, WorkflowTrigger,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::WorkflowStore;
use crate::workflows::error::{WorkflowError, WorkflowResult};

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, Workflow>,
    states: HashMap<Uuid, State>,
    transitions: HashMap<Uuid, Transition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    history: HashMap<Uuid, WorkflowHistory>,
    triggers: HashMap<Uuid, WorkflowTrigger>,
    schedules: HashMap<Uuid, ScheduledWorkflow>,
    templates: HashMap<Uuid, WorkflowTemplate>,
}

/// Every table sits behind one lock so multi-row writes are atomic
#[derive(Clone, Default)]
pub struct MemoryWorkflowStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_version(stored: &WorkflowInstance, expected_version: i64) -> WorkflowResult<()> {
    if stored.version != expected_version {
        return Err(WorkflowError::ConcurrentModification(stored.id));
    }
    Ok(())
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;
        tables.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> WorkflowResult<Option<Workflow>> {
        Ok(self.tables.read().await.workflows.get(&id).cloned())
    }

    async fn list_workflows(&self) -> WorkflowResult<Vec<Workflow>> {
        let tables = self.tables.read().await;
        let mut workflows: Vec<Workflow> = tables.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    async fn set_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        at: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;
        let workflow = tables
            .workflows
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::not_found("Workflow", id))?;
        workflow.status = status;
        workflow.updated_at = Some(at);
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> WorkflowResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.workflows.remove(&id).is_none() {
            return Ok(false);
        }

        let instance_ids: Vec<Uuid> = tables
            .instances
            .values()
            .filter(|i| i.workflow_id == id)
            .map(|i| i.id)
            .collect();
        tables
            .history
            .retain(|_, h| !instance_ids.contains(&h.instance_id));
        tables.instances.retain(|_, i| i.workflow_id != id);
        tables.states.retain(|_, s| s.workflow_id != id);
        tables.transitions.retain(|_, t| t.workflow_id != id);
        tables.triggers.retain(|_, t| t.workflow_id != id);
        tables.schedules.retain(|_, s| s.workflow_id != id);
        Ok(true)
    }

    async fn save_state(&self, state: &State) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;

        let duplicate = tables
            .states
            .values()
            .any(|s| s.workflow_id == state.workflow_id && s.id != state.id && s.name == state.name);
        if duplicate {
            return Err(WorkflowError::validation(
                "name",
                format!("A state named '{}' already exists in this workflow", state.name),
            ));
        }

        if state.is_initial {
            for other in tables.states.values_mut() {
                if other.workflow_id == state.workflow_id && other.id != state.id {
                    other.is_initial = false;
                }
            }
        }

        tables.states.insert(state.id, state.clone());
        Ok(())
    }

    async fn get_state(&self, id: Uuid) -> WorkflowResult<Option<State>> {
        Ok(self.tables.read().await.states.get(&id).cloned())
    }

    async fn list_states(&self, workflow_id: Uuid) -> WorkflowResult<Vec<State>> {
        let tables = self.tables.read().await;
        let mut states: Vec<State> = tables
            .states
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(states)
    }

    async fn save_transition(&self, transition: &Transition) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;

        let duplicate = tables.transitions.values().any(|t| {
            t.workflow_id == transition.workflow_id
                && t.id != transition.id
                && t.name == transition.name
        });
        if duplicate {
            return Err(WorkflowError::validation(
                "name",
                format!(
                    "A transition named '{}' already exists in this workflow",
                    transition.name
                ),
            ));
        }

        tables.transitions.insert(transition.id, transition.clone());
        Ok(())
    }

    async fn insert_graph(
        &self,
        workflow: &Workflow,
        states: &[State],
        transitions: &[Transition],
    ) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;

        let mut state_names = HashSet::new();
        if let Some(state) = states.iter().find(|s| !state_names.insert(s.name.as_str())) {
            return Err(WorkflowError::validation(
                "name",
                format!("A state named '{}' already exists in this workflow", state.name),
            ));
        }
        let mut transition_names = HashSet::new();
        if let Some(transition) = transitions
            .iter()
            .find(|t| !transition_names.insert(t.name.as_str()))
        {
            return Err(WorkflowError::validation(
                "name",
                format!(
                    "A transition named '{}' already exists in this workflow",
                    transition.name
                ),
            ));
        }

        tables.workflows.insert(workflow.id, workflow.clone());
        for state in states {
            tables.states.insert(state.id, state.clone());
        }
        for transition in transitions {
            tables.transitions.insert(transition.id, transition.clone());
        }
        Ok(())
    }

    async fn get_transition(&self, id: Uuid) -> WorkflowResult<Option<Transition>> {
        Ok(self.tables.read().await.transitions.get(&id).cloned())
    }

    async fn list_transitions(&self, workflow_id: Uuid) -> WorkflowResult<Vec<Transition>> {
        let tables = self.tables.read().await;
        let mut transitions: Vec<Transition> = tables
            .transitions
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect();
        transitions.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(transitions)
    }

    async fn insert_instance_if_absent(
        &self,
        instance: &WorkflowInstance,
    ) -> WorkflowResult<WorkflowInstance> {
        let mut tables = self.tables.write().await;

        let existing = tables
            .instances
            .values()
            .find(|i| i.workflow_id == instance.workflow_id && i.entity == instance.entity)
            .cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }

        tables.instances.insert(instance.id, instance.clone());
        Ok(instance.clone())
    }

    async fn get_instance(&self, id: Uuid) -> WorkflowResult<Option<WorkflowInstance>> {
        Ok(self.tables.read().await.instances.get(&id).cloned())
    }

    async fn find_instance(
        &self,
        workflow_id: Uuid,
        entity: &EntityRef,
    ) -> WorkflowResult<Option<WorkflowInstance>> {
        let tables = self.tables.read().await;
        Ok(tables
            .instances
            .values()
            .find(|i| i.workflow_id == workflow_id && &i.entity == entity)
            .cloned())
    }

    async fn list_instances(&self, workflow_id: Uuid) -> WorkflowResult<Vec<WorkflowInstance>> {
        let tables = self.tables.read().await;
        let mut instances: Vec<WorkflowInstance> = tables
            .instances
            .values()
            .filter(|i| i.workflow_id == workflow_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(instances)
    }

    async fn commit_transition(
        &self,
        instance: &WorkflowInstance,
        expected_version: i64,
        history: &WorkflowHistory,
    ) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .instances
            .get(&instance.id)
            .ok_or_else(|| WorkflowError::not_found("Workflow instance", instance.id))?;
        check_version(stored, expected_version)?;

        tables.instances.insert(instance.id, instance.clone());
        tables.history.insert(history.id, history.clone());
        Ok(())
    }

    async fn update_instance(
        &self,
        instance: &WorkflowInstance,
        expected_version: i64,
    ) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .instances
            .get(&instance.id)
            .ok_or_else(|| WorkflowError::not_found("Workflow instance", instance.id))?;
        check_version(stored, expected_version)?;

        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn list_history(&self, instance_id: Uuid) -> WorkflowResult<Vec<WorkflowHistory>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<WorkflowHistory> = tables
            .history
            .values()
            .filter(|h| h.instance_id == instance_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.triggered_at
                .cmp(&b.triggered_at)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        Ok(rows)
    }

    async fn get_history(&self, id: Uuid) -> WorkflowResult<Option<WorkflowHistory>> {
        Ok(self.tables.read().await.history.get(&id).cloned())
    }

    async fn amend_latest_history_notes(
        &self,
        id: Uuid,
        notes: &str,
    ) -> WorkflowResult<Option<WorkflowHistory>> {
        let mut tables = self.tables.write().await;
        let Some(row) = tables.history.get(&id) else {
            return Ok(None);
        };

        let instance_id = row.instance_id;
        let latest = tables
            .history
            .values()
            .filter(|h| h.instance_id == instance_id)
            .map(|h| h.sequence)
            .max();
        if latest != Some(row.sequence) {
            return Ok(None);
        }

        let row = tables
            .history
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::not_found("Workflow history", id))?;
        row.notes = notes.to_string();
        Ok(Some(row.clone()))
    }

    async fn save_trigger(&self, trigger: &WorkflowTrigger) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;
        tables.triggers.insert(trigger.id, trigger.clone());
        Ok(())
    }

    async fn get_trigger(&self, id: Uuid) -> WorkflowResult<Option<WorkflowTrigger>> {
        Ok(self.tables.read().await.triggers.get(&id).cloned())
    }

    async fn list_triggers(&self, workflow_id: Uuid) -> WorkflowResult<Vec<WorkflowTrigger>> {
        let tables = self.tables.read().await;
        let mut triggers: Vec<WorkflowTrigger> = tables
            .triggers
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect();
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(triggers)
    }

    async fn list_active_triggers(
        &self,
        entity_type: &str,
    ) -> WorkflowResult<Vec<WorkflowTrigger>> {
        let tables = self.tables.read().await;
        let mut triggers: Vec<WorkflowTrigger> = tables
            .triggers
            .values()
            .filter(|t| t.is_active)
            .filter(|t| {
                tables.workflows.get(&t.workflow_id).is_some_and(|w| {
                    w.status == WorkflowStatus::Active && w.target_entity_type == entity_type
                })
            })
            .cloned()
            .collect();
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(triggers)
    }

    async fn save_schedule(&self, schedule: &ScheduledWorkflow) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;
        tables.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> WorkflowResult<Option<ScheduledWorkflow>> {
        Ok(self.tables.read().await.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self, workflow_id: Uuid) -> WorkflowResult<Vec<ScheduledWorkflow>> {
        let tables = self.tables.read().await;
        let mut schedules: Vec<ScheduledWorkflow> = tables
            .schedules
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.scheduled_date.cmp(&b.scheduled_date));
        Ok(schedules)
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Vec<ScheduledWorkflow>> {
        let tables = self.tables.read().await;
        let mut due: Vec<ScheduledWorkflow> = tables
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.due_at().cmp(&b.due_at()));
        Ok(due)
    }

    async fn flip_schedule_status(
        &self,
        id: Uuid,
        from: &[ScheduleStatus],
        to: ScheduleStatus,
        at: DateTime<Utc>,
    ) -> WorkflowResult<Option<ScheduledWorkflow>> {
        let mut tables = self.tables.write().await;
        let Some(schedule) = tables.schedules.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&schedule.status) {
            return Ok(None);
        }

        schedule.status = to;
        schedule.updated_at = Some(at);
        if to == ScheduleStatus::Running {
            schedule.last_run = Some(at);
        }
        Ok(Some(schedule.clone()))
    }

    async fn finish_schedule(
        &self,
        id: Uuid,
        status: ScheduleStatus,
        next_run: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;
        let schedule = tables
            .schedules
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::not_found("Scheduled workflow", id))?;
        schedule.status = status;
        schedule.updated_at = Some(at);
        if next_run.is_some() {
            schedule.next_run = next_run;
        }
        Ok(())
    }

    async fn save_template(&self, template: &WorkflowTemplate) -> WorkflowResult<()> {
        let mut tables = self.tables.write().await;
        tables.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> WorkflowResult<Option<WorkflowTemplate>> {
        Ok(self.tables.read().await.templates.get(&id).cloned())
    }

    async fn list_templates(&self) -> WorkflowResult<Vec<WorkflowTemplate>> {
        let tables = self.tables.read().await;
        let mut templates: Vec<WorkflowTemplate> = tables.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
        Ok(templates)
    }
}
