// Workflow Definitions - Graph authoring, integrity checks and templates

use flowdesk_shared::{
    Action, Condition, DEFAULT_STATE_COLOR, State, TemplateDefinition, Transition, Visibility,
    Workflow, WorkflowStatus, WorkflowTemplate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::collaborators::Clock;
use super::error::{WorkflowError, WorkflowResult};
use super::store::WorkflowStore;

static ENTITY_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$").expect("entity type pattern compiles")
});

static COLOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("color pattern compiles"));

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewWorkflow {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `app_label.Model`
    #[validate(length(min = 3, max = 200))]
    pub target_entity_type: String,
    #[serde(default, flatten)]
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct NewState {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub display_order: i32,
    pub color: Option<String>,
}

impl NewState {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn initial(mut self) -> Self {
        self.is_initial = true;
        self
    }

    pub fn terminal(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn ordered(mut self, display_order: i32) -> Self {
        self.display_order = display_order;
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct StateUpdate {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_initial: Option<bool>,
    pub is_final: Option<bool>,
    pub display_order: Option<i32>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewTransition {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub from_state_id: Uuid,
    pub to_state_id: Uuid,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub display_order: i32,
}

impl NewTransition {
    pub fn between(name: &str, from_state_id: Uuid, to_state_id: Uuid) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            from_state_id,
            to_state_id,
            conditions: Vec::new(),
            actions: Vec::new(),
            display_order: 0,
        }
    }

    pub fn guarded_by(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct TransitionUpdate {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub from_state_id: Option<Uuid>,
    pub to_state_id: Option<Uuid>,
    pub conditions: Option<Vec<Condition>>,
    pub actions: Option<Vec<Action>>,
    pub display_order: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewTemplate {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub target_entity_type: String,
    pub definition: TemplateDefinition,
    #[serde(default)]
    pub is_public: bool,
}

/// A workflow with its full graph
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowGraph {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub states: Vec<State>,
    pub transitions: Vec<Transition>,
}

fn require_name(field: &str, value: &str) -> WorkflowResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::validation(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn require_entity_type(value: &str) -> WorkflowResult<()> {
    if !ENTITY_TYPE.is_match(value) {
        return Err(WorkflowError::validation(
            "target_entity_type",
            format!("'{}' is not of the form app_label.Model", value),
        ));
    }
    Ok(())
}

fn resolve_color(color: Option<String>) -> WorkflowResult<String> {
    match color {
        None => Ok(DEFAULT_STATE_COLOR.to_string()),
        Some(c) if c.is_empty() => Ok(DEFAULT_STATE_COLOR.to_string()),
        Some(c) if COLOR.is_match(&c) => Ok(c),
        Some(c) => Err(WorkflowError::validation(
            "color",
            format!("'{}' is not a #rrggbb hex color", c),
        )),
    }
}

/// Authoring operations on workflow graphs
#[derive(Clone)]
pub struct DefinitionService {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
}

impl DefinitionService {
    pub fn new(store: Arc<dyn WorkflowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_workflow(
        &self,
        input: NewWorkflow,
        created_by: Option<Uuid>,
    ) -> WorkflowResult<Workflow> {
        let name = require_name("name", &input.name)?;
        require_entity_type(&input.target_entity_type)?;

        let workflow = Workflow {
            id: Uuid::new_v4(),
            name,
            description: input.description,
            status: WorkflowStatus::Draft,
            target_entity_type: input.target_entity_type,
            visibility: input.visibility,
            created_by,
            created_at: self.clock.now(),
            updated_at: None,
        };
        self.store.insert_workflow(&workflow).await?;

        info!("Created workflow '{}' ({}) for {}", workflow.name, workflow.id, workflow.target_entity_type);
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: Uuid) -> WorkflowResult<Workflow> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow", id))
    }

    pub async fn get_graph(&self, id: Uuid) -> WorkflowResult<WorkflowGraph> {
        let workflow = self.get_workflow(id).await?;
        let states = self.store.list_states(id).await?;
        let transitions = self.store.list_transitions(id).await?;
        Ok(WorkflowGraph {
            workflow,
            states,
            transitions,
        })
    }

    /// Workflows the given user may see
    pub async fn list_visible(
        &self,
        user_id: Option<Uuid>,
        roles: &[String],
    ) -> WorkflowResult<Vec<Workflow>> {
        let workflows = self.store.list_workflows().await?;
        Ok(workflows
            .into_iter()
            .filter(|w| w.is_visible_to(user_id, roles) || (user_id.is_some() && w.created_by == user_id))
            .collect())
    }

    pub async fn list_states(&self, workflow_id: Uuid) -> WorkflowResult<Vec<State>> {
        self.get_workflow(workflow_id).await?;
        self.store.list_states(workflow_id).await
    }

    pub async fn list_transitions(&self, workflow_id: Uuid) -> WorkflowResult<Vec<Transition>> {
        self.get_workflow(workflow_id).await?;
        self.store.list_transitions(workflow_id).await
    }

    pub async fn add_state(&self, workflow_id: Uuid, input: NewState) -> WorkflowResult<State> {
        self.get_workflow(workflow_id).await?;

        let state = State {
            id: Uuid::new_v4(),
            workflow_id,
            name: require_name("name", &input.name)?,
            description: input.description,
            is_initial: input.is_initial,
            is_final: input.is_final,
            display_order: input.display_order,
            color: resolve_color(input.color)?,
            created_at: self.clock.now(),
        };
        self.store.save_state(&state).await?;

        Ok(state)
    }

    pub async fn update_state(&self, state_id: Uuid, update: StateUpdate) -> WorkflowResult<State> {
        let mut state = self
            .store
            .get_state(state_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("State", state_id))?;

        if let Some(name) = update.name {
            state.name = require_name("name", &name)?;
        }
        if let Some(description) = update.description {
            state.description = description;
        }
        if let Some(is_initial) = update.is_initial {
            // Another state takes over by being marked initial itself
            if state.is_initial && !is_initial {
                return Err(WorkflowError::validation(
                    "is_initial",
                    "a workflow keeps exactly one initial state; mark another state initial instead",
                ));
            }
            state.is_initial = is_initial;
        }
        if let Some(is_final) = update.is_final {
            state.is_final = is_final;
        }
        if let Some(display_order) = update.display_order {
            state.display_order = display_order;
        }
        if update.color.is_some() {
            state.color = resolve_color(update.color)?;
        }

        self.store.save_state(&state).await?;
        Ok(state)
    }

    pub async fn initial_state(&self, workflow_id: Uuid) -> WorkflowResult<Option<State>> {
        let states = self.store.list_states(workflow_id).await?;
        Ok(states.into_iter().find(|s| s.is_initial))
    }

    async fn check_endpoint(&self, workflow_id: Uuid, field: &str, state_id: Uuid) -> WorkflowResult<()> {
        match self.store.get_state(state_id).await? {
            Some(state) if state.workflow_id == workflow_id => Ok(()),
            _ => Err(WorkflowError::validation(
                field,
                format!("state {} does not belong to workflow {}", state_id, workflow_id),
            )),
        }
    }

    pub async fn add_transition(
        &self,
        workflow_id: Uuid,
        input: NewTransition,
    ) -> WorkflowResult<Transition> {
        self.get_workflow(workflow_id).await?;
        self.check_endpoint(workflow_id, "from_state_id", input.from_state_id).await?;
        self.check_endpoint(workflow_id, "to_state_id", input.to_state_id).await?;

        let transition = Transition {
            id: Uuid::new_v4(),
            workflow_id,
            name: require_name("name", &input.name)?,
            description: input.description,
            from_state_id: input.from_state_id,
            to_state_id: input.to_state_id,
            conditions: input.conditions,
            actions: input.actions,
            display_order: input.display_order,
            created_at: self.clock.now(),
        };
        self.store.save_transition(&transition).await?;

        Ok(transition)
    }

    pub async fn update_transition(
        &self,
        transition_id: Uuid,
        update: TransitionUpdate,
    ) -> WorkflowResult<Transition> {
        let mut transition = self
            .store
            .get_transition(transition_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Transition", transition_id))?;

        if let Some(name) = update.name {
            transition.name = require_name("name", &name)?;
        }
        if let Some(description) = update.description {
            transition.description = description;
        }
        if let Some(from_state_id) = update.from_state_id {
            transition.from_state_id = from_state_id;
        }
        if let Some(to_state_id) = update.to_state_id {
            transition.to_state_id = to_state_id;
        }
        if let Some(conditions) = update.conditions {
            transition.conditions = conditions;
        }
        if let Some(actions) = update.actions {
            transition.actions = actions;
        }
        if let Some(display_order) = update.display_order {
            transition.display_order = display_order;
        }

        self.check_endpoint(transition.workflow_id, "from_state_id", transition.from_state_id)
            .await?;
        self.check_endpoint(transition.workflow_id, "to_state_id", transition.to_state_id)
            .await?;

        self.store.save_transition(&transition).await?;
        Ok(transition)
    }

    /// Deep-copy the graph into a new draft. Instances, history, triggers
    /// and schedules stay with the source.
    pub async fn clone_workflow(
        &self,
        id: Uuid,
        name: Option<String>,
        description: Option<String>,
        created_by: Option<Uuid>,
    ) -> WorkflowResult<Workflow> {
        let source = self.get_graph(id).await?;
        let now = self.clock.now();

        let name = match name {
            Some(name) => require_name("name", &name)?,
            None => format!("{} (Copy)", source.workflow.name),
        };
        let copy = Workflow {
            id: Uuid::new_v4(),
            name,
            description: description.unwrap_or_else(|| source.workflow.description.clone()),
            status: WorkflowStatus::Draft,
            target_entity_type: source.workflow.target_entity_type.clone(),
            visibility: source.workflow.visibility.clone(),
            created_by: created_by.or(source.workflow.created_by),
            created_at: now,
            updated_at: None,
        };

        let mut state_map: HashMap<Uuid, Uuid> = HashMap::with_capacity(source.states.len());
        let states: Vec<State> = source
            .states
            .iter()
            .map(|state| {
                let cloned = State {
                    id: Uuid::new_v4(),
                    workflow_id: copy.id,
                    created_at: now,
                    ..state.clone()
                };
                state_map.insert(state.id, cloned.id);
                cloned
            })
            .collect();

        let mut transitions = Vec::with_capacity(source.transitions.len());
        for transition in &source.transitions {
            let (Some(&from), Some(&to)) = (
                state_map.get(&transition.from_state_id),
                state_map.get(&transition.to_state_id),
            ) else {
                return Err(WorkflowError::Configuration(format!(
                    "transition '{}' references a state outside workflow {}",
                    transition.name, id
                )));
            };

            transitions.push(Transition {
                id: Uuid::new_v4(),
                workflow_id: copy.id,
                from_state_id: from,
                to_state_id: to,
                created_at: now,
                ..transition.clone()
            });
        }

        self.store.insert_graph(&copy, &states, &transitions).await?;

        info!(
            "Cloned workflow {} into '{}' ({}) with {} states and {} transitions",
            id,
            copy.name,
            copy.id,
            source.states.len(),
            source.transitions.len()
        );
        Ok(copy)
    }

    /// Make the workflow eligible for starts and triggers
    pub async fn activate(&self, id: Uuid) -> WorkflowResult<Workflow> {
        let graph = self.get_graph(id).await?;

        if !graph.states.iter().any(|s| s.is_initial) {
            return Err(WorkflowError::Configuration(format!(
                "workflow '{}' has no initial state",
                graph.workflow.name
            )));
        }

        let state_ids: HashSet<Uuid> = graph.states.iter().map(|s| s.id).collect();
        if let Some(dangling) = graph.transitions.iter().find(|t| {
            !state_ids.contains(&t.from_state_id) || !state_ids.contains(&t.to_state_id)
        }) {
            return Err(WorkflowError::Configuration(format!(
                "transition '{}' has an endpoint outside workflow '{}'",
                dangling.name, graph.workflow.name
            )));
        }

        self.store
            .set_workflow_status(id, WorkflowStatus::Active, self.clock.now())
            .await?;
        info!("Activated workflow '{}' ({})", graph.workflow.name, id);
        self.get_workflow(id).await
    }

    /// Freeze new starts; running instances continue
    pub async fn deactivate(&self, id: Uuid) -> WorkflowResult<Workflow> {
        self.get_workflow(id).await?;
        self.store
            .set_workflow_status(id, WorkflowStatus::Inactive, self.clock.now())
            .await?;
        info!("Deactivated workflow {}", id);
        self.get_workflow(id).await
    }

    pub async fn delete_workflow(&self, id: Uuid) -> WorkflowResult<()> {
        if !self.store.delete_workflow(id).await? {
            return Err(WorkflowError::not_found("Workflow", id));
        }
        info!("Deleted workflow {}", id);
        Ok(())
    }

    // ===== Templates =====

    pub async fn create_template(
        &self,
        input: NewTemplate,
        created_by: Option<Uuid>,
    ) -> WorkflowResult<WorkflowTemplate> {
        let name = require_name("name", &input.name)?;
        require_entity_type(&input.target_entity_type)?;
        validate_template_definition(&input.definition)?;

        let template = WorkflowTemplate {
            id: Uuid::new_v4(),
            name,
            description: input.description,
            category: input.category,
            target_entity_type: input.target_entity_type,
            definition: input.definition,
            is_public: input.is_public,
            created_by,
            created_at: self.clock.now(),
        };
        self.store.save_template(&template).await?;
        Ok(template)
    }

    pub async fn get_template(&self, id: Uuid) -> WorkflowResult<WorkflowTemplate> {
        self.store
            .get_template(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow template", id))
    }

    pub async fn list_templates(&self) -> WorkflowResult<Vec<WorkflowTemplate>> {
        self.store.list_templates().await
    }

    /// Build a draft workflow from a template through the regular authoring
    /// operations, so every graph invariant holds for the result.
    pub async fn create_workflow_from_template(
        &self,
        template_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        created_by: Option<Uuid>,
    ) -> WorkflowResult<Workflow> {
        let template = self.get_template(template_id).await?;
        validate_template_definition(&template.definition)?;

        let workflow = self
            .create_workflow(
                NewWorkflow {
                    name: name.unwrap_or_else(|| template.name.clone()),
                    description: description.unwrap_or_else(|| template.description.clone()),
                    target_entity_type: template.target_entity_type.clone(),
                    visibility: Visibility::default(),
                },
                created_by,
            )
            .await?;

        let mut keys: HashMap<&str, Uuid> = HashMap::new();
        for state in &template.definition.states {
            let created = self
                .add_state(
                    workflow.id,
                    NewState {
                        name: state.name.clone(),
                        description: state.description.clone(),
                        is_initial: state.is_initial,
                        is_final: state.is_final,
                        display_order: state.display_order,
                        color: state.color.clone(),
                    },
                )
                .await?;
            keys.insert(state.key.as_str(), created.id);
        }

        for transition in &template.definition.transitions {
            let from = keys.get(transition.from.as_str()).copied();
            let to = keys.get(transition.to.as_str()).copied();
            let (Some(from), Some(to)) = (from, to) else {
                return Err(WorkflowError::validation(
                    "definition.transitions",
                    format!("transition '{}' references an unknown state key", transition.name),
                ));
            };

            self.add_transition(
                workflow.id,
                NewTransition {
                    name: transition.name.clone(),
                    description: transition.description.clone(),
                    from_state_id: from,
                    to_state_id: to,
                    conditions: transition.conditions.clone(),
                    actions: transition.actions.clone(),
                    display_order: transition.display_order,
                },
            )
            .await?;
        }

        info!("Created workflow {} from template '{}'", workflow.id, template.name);
        Ok(workflow)
    }
}

fn validate_template_definition(definition: &TemplateDefinition) -> WorkflowResult<()> {
    let mut keys = HashSet::new();
    for state in &definition.states {
        if !keys.insert(state.key.as_str()) {
            return Err(WorkflowError::validation(
                "definition.states",
                format!("duplicate state key '{}'", state.key),
            ));
        }
    }

    for transition in &definition.transitions {
        for key in [&transition.from, &transition.to] {
            if !keys.contains(key.as_str()) {
                return Err(WorkflowError::validation(
                    "definition.transitions",
                    format!(
                        "transition '{}' references unknown state key '{}'",
                        transition.name, key
                    ),
                ));
            }
        }
    }

    Ok(())
}
