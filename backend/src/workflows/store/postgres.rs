// PostgreSQL workflow store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdesk_shared::{
    Action, Condition, EntityRef, ScheduleParameters, ScheduleStatus, ScheduledWorkflow, State,
    TemplateDefinition, Transition, UnknownVariant, Visibility, Workflow, WorkflowHistory,
    WorkflowInstance, WorkflowStatus, WorkflowTemplate, WorkflowTrigger,
};
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use super::WorkflowStore;
use crate::workflows::error::{WorkflowError, WorkflowResult};

#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_label<T>(value: String) -> WorkflowResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .parse()
        .map_err(|e: UnknownVariant| WorkflowError::Storage(e.to_string()))
}

/// Unique violations on named graph elements are caller mistakes
fn name_conflict(err: sqlx::Error, element: &str, name: &str) -> WorkflowError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => WorkflowError::validation(
            "name",
            format!("A {} named '{}' already exists in this workflow", element, name),
        ),
        _ => err.into(),
    }
}

fn workflow_from_row(row: &PgRow) -> WorkflowResult<Workflow> {
    Ok(Workflow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status: parse_label(row.try_get("status")?)?,
        target_entity_type: row.try_get("target_entity_type")?,
        visibility: Visibility {
            is_public: row.try_get("is_public")?,
            allowed_users: row.try_get("allowed_users")?,
            allowed_roles: row.try_get("allowed_roles")?,
        },
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transition_from_row(row: &PgRow) -> WorkflowResult<Transition> {
    let conditions: Json<Vec<Condition>> = row.try_get("conditions")?;
    let actions: Json<Vec<Action>> = row.try_get("actions")?;

    Ok(Transition {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        from_state_id: row.try_get("from_state_id")?,
        to_state_id: row.try_get("to_state_id")?,
        conditions: conditions.0,
        actions: actions.0,
        display_order: row.try_get("display_order")?,
        created_at: row.try_get("created_at")?,
    })
}

fn instance_from_row(row: &PgRow) -> WorkflowResult<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        entity: EntityRef {
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
        },
        current_state_id: row.try_get("current_state_id")?,
        status: parse_label(row.try_get("status")?)?,
        started_by: row.try_get("started_by")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        data: row.try_get::<Value, _>("data")?,
        version: row.try_get("version")?,
    })
}

fn trigger_from_row(row: &PgRow) -> WorkflowResult<WorkflowTrigger> {
    let conditions: Json<Vec<Condition>> = row.try_get("conditions")?;

    Ok(WorkflowTrigger {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        name: row.try_get("name")?,
        trigger_type: parse_label(row.try_get("trigger_type")?)?,
        field_name: row.try_get("field_name")?,
        conditions: conditions.0,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn schedule_from_row(row: &PgRow) -> WorkflowResult<ScheduledWorkflow> {
    let parameters: Json<ScheduleParameters> = row.try_get("parameters")?;

    Ok(ScheduledWorkflow {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        schedule_type: parse_label(row.try_get("schedule_type")?)?,
        scheduled_date: row.try_get("scheduled_date")?,
        cron_expression: row.try_get("cron_expression")?,
        parameters: parameters.0,
        status: parse_label(row.try_get("status")?)?,
        last_run: row.try_get("last_run")?,
        next_run: row.try_get("next_run")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn template_from_row(row: &PgRow) -> WorkflowResult<WorkflowTemplate> {
    let definition: Json<TemplateDefinition> = row.try_get("definition")?;

    Ok(WorkflowTemplate {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        target_entity_type: row.try_get("target_entity_type")?,
        definition: definition.0,
        is_public: row.try_get("is_public")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn write_workflow(conn: &mut PgConnection, workflow: &Workflow) -> WorkflowResult<()> {
    sqlx::query(
        r#"
        INSERT INTO workflows (
            id, name, description, status, target_entity_type,
            is_public, allowed_users, allowed_roles, created_by, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(workflow.id)
    .bind(&workflow.name)
    .bind(&workflow.description)
    .bind(workflow.status.as_str())
    .bind(&workflow.target_entity_type)
    .bind(workflow.visibility.is_public)
    .bind(&workflow.visibility.allowed_users)
    .bind(&workflow.visibility.allowed_roles)
    .bind(workflow.created_by)
    .bind(workflow.created_at)
    .bind(workflow.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn write_state(conn: &mut PgConnection, state: &State) -> WorkflowResult<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_states (
            id, workflow_id, name, description, is_initial, is_final, display_order, color, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            description = EXCLUDED.description,
            is_initial = EXCLUDED.is_initial,
            is_final = EXCLUDED.is_final,
            display_order = EXCLUDED.display_order,
            color = EXCLUDED.color
        "#,
    )
    .bind(state.id)
    .bind(state.workflow_id)
    .bind(&state.name)
    .bind(&state.description)
    .bind(state.is_initial)
    .bind(state.is_final)
    .bind(state.display_order)
    .bind(&state.color)
    .bind(state.created_at)
    .execute(conn)
    .await
    .map_err(|e| name_conflict(e, "state", &state.name))?;
    Ok(())
}

async fn write_transition(conn: &mut PgConnection, transition: &Transition) -> WorkflowResult<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_transitions (
            id, workflow_id, name, description, from_state_id, to_state_id,
            conditions, actions, display_order, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            description = EXCLUDED.description,
            from_state_id = EXCLUDED.from_state_id,
            to_state_id = EXCLUDED.to_state_id,
            conditions = EXCLUDED.conditions,
            actions = EXCLUDED.actions,
            display_order = EXCLUDED.display_order
        "#,
    )
    .bind(transition.id)
    .bind(transition.workflow_id)
    .bind(&transition.name)
    .bind(&transition.description)
    .bind(transition.from_state_id)
    .bind(transition.to_state_id)
    .bind(Json(&transition.conditions))
    .bind(Json(&transition.actions))
    .bind(transition.display_order)
    .bind(transition.created_at)
    .execute(conn)
    .await
    .map_err(|e| name_conflict(e, "transition", &transition.name))?;
    Ok(())
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_workflow(&mut *conn, workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> WorkflowResult<Option<Workflow>> {
        sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(workflow_from_row)
            .transpose()
    }

    async fn list_workflows(&self) -> WorkflowResult<Vec<Workflow>> {
        sqlx::query("SELECT * FROM workflows ORDER BY name")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(workflow_from_row)
            .collect()
    }

    async fn set_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        at: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let result = sqlx::query("UPDATE workflows SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::not_found("Workflow", id));
        }
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> WorkflowResult<bool> {
        // Graph, instances, history, triggers and schedules cascade
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_state(&self, state: &State) -> WorkflowResult<()> {
        let mut tx = self.pool.begin().await?;

        // Serialize initial-state changes per workflow
        sqlx::query("SELECT id FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(state.workflow_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow", state.workflow_id))?;

        if state.is_initial {
            sqlx::query(
                "UPDATE workflow_states SET is_initial = FALSE WHERE workflow_id = $1 AND id <> $2 AND is_initial",
            )
            .bind(state.workflow_id)
            .bind(state.id)
            .execute(&mut *tx)
            .await?;
        }

        write_state(&mut *tx, state).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_state(&self, id: Uuid) -> WorkflowResult<Option<State>> {
        let state = sqlx::query_as::<_, State>("SELECT * FROM workflow_states WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(state)
    }

    async fn list_states(&self, workflow_id: Uuid) -> WorkflowResult<Vec<State>> {
        let states = sqlx::query_as::<_, State>(
            "SELECT * FROM workflow_states WHERE workflow_id = $1 ORDER BY display_order, name",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    async fn save_transition(&self, transition: &Transition) -> WorkflowResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_transition(&mut *conn, transition).await
    }

    async fn insert_graph(
        &self,
        workflow: &Workflow,
        states: &[State],
        transitions: &[Transition],
    ) -> WorkflowResult<()> {
        let mut tx = self.pool.begin().await?;
        write_workflow(&mut *tx, workflow).await?;
        for state in states {
            write_state(&mut *tx, state).await?;
        }
        for transition in transitions {
            write_transition(&mut *tx, transition).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_transition(&self, id: Uuid) -> WorkflowResult<Option<Transition>> {
        sqlx::query("SELECT * FROM workflow_transitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(transition_from_row)
            .transpose()
    }

    async fn list_transitions(&self, workflow_id: Uuid) -> WorkflowResult<Vec<Transition>> {
        sqlx::query(
            "SELECT * FROM workflow_transitions WHERE workflow_id = $1 ORDER BY display_order, created_at, name",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(transition_from_row)
        .collect()
    }

    async fn insert_instance_if_absent(
        &self,
        instance: &WorkflowInstance,
    ) -> WorkflowResult<WorkflowInstance> {
        sqlx::query(
            r#"
            INSERT INTO workflow_instances (
                id, workflow_id, entity_type, entity_id, current_state_id, status,
                started_by, started_at, completed_at, data, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (workflow_id, entity_type, entity_id) DO NOTHING
            "#,
        )
        .bind(instance.id)
        .bind(instance.workflow_id)
        .bind(&instance.entity.entity_type)
        .bind(&instance.entity.entity_id)
        .bind(instance.current_state_id)
        .bind(instance.status.as_str())
        .bind(instance.started_by)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(&instance.data)
        .bind(instance.version)
        .execute(&self.pool)
        .await?;

        self.find_instance(instance.workflow_id, &instance.entity)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow instance", instance.id))
    }

    async fn get_instance(&self, id: Uuid) -> WorkflowResult<Option<WorkflowInstance>> {
        sqlx::query("SELECT * FROM workflow_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(instance_from_row)
            .transpose()
    }

    async fn find_instance(
        &self,
        workflow_id: Uuid,
        entity: &EntityRef,
    ) -> WorkflowResult<Option<WorkflowInstance>> {
        sqlx::query(
            "SELECT * FROM workflow_instances WHERE workflow_id = $1 AND entity_type = $2 AND entity_id = $3",
        )
        .bind(workflow_id)
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(instance_from_row)
        .transpose()
    }

    async fn list_instances(&self, workflow_id: Uuid) -> WorkflowResult<Vec<WorkflowInstance>> {
        sqlx::query("SELECT * FROM workflow_instances WHERE workflow_id = $1 ORDER BY started_at")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(instance_from_row)
            .collect()
    }

    async fn commit_transition(
        &self,
        instance: &WorkflowInstance,
        expected_version: i64,
        history: &WorkflowHistory,
    ) -> WorkflowResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET current_state_id = $2, status = $3, completed_at = $4, data = $5, version = $6
            WHERE id = $1 AND version = $7
            "#,
        )
        .bind(instance.id)
        .bind(instance.current_state_id)
        .bind(instance.status.as_str())
        .bind(instance.completed_at)
        .bind(&instance.data)
        .bind(instance.version)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::ConcurrentModification(instance.id));
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_history (
                id, instance_id, sequence, from_state_id, to_state_id, transition_id,
                triggered_by, triggered_at, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(history.id)
        .bind(history.instance_id)
        .bind(history.sequence)
        .bind(history.from_state_id)
        .bind(history.to_state_id)
        .bind(history.transition_id)
        .bind(history.triggered_by)
        .bind(history.triggered_at)
        .bind(&history.notes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_instance(
        &self,
        instance: &WorkflowInstance,
        expected_version: i64,
    ) -> WorkflowResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET current_state_id = $2, status = $3, completed_at = $4, data = $5, version = $6
            WHERE id = $1 AND version = $7
            "#,
        )
        .bind(instance.id)
        .bind(instance.current_state_id)
        .bind(instance.status.as_str())
        .bind(instance.completed_at)
        .bind(&instance.data)
        .bind(instance.version)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::ConcurrentModification(instance.id));
        }
        Ok(())
    }

    async fn list_history(&self, instance_id: Uuid) -> WorkflowResult<Vec<WorkflowHistory>> {
        let rows = sqlx::query_as::<_, WorkflowHistory>(
            "SELECT * FROM workflow_history WHERE instance_id = $1 ORDER BY triggered_at, sequence",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_history(&self, id: Uuid) -> WorkflowResult<Option<WorkflowHistory>> {
        let row =
            sqlx::query_as::<_, WorkflowHistory>("SELECT * FROM workflow_history WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn amend_latest_history_notes(
        &self,
        id: Uuid,
        notes: &str,
    ) -> WorkflowResult<Option<WorkflowHistory>> {
        let row = sqlx::query_as::<_, WorkflowHistory>(
            r#"
            UPDATE workflow_history h
            SET notes = $2
            WHERE h.id = $1
              AND h.sequence = (
                  SELECT MAX(sequence) FROM workflow_history WHERE instance_id = h.instance_id
              )
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(notes)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn save_trigger(&self, trigger: &WorkflowTrigger) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_triggers (
                id, workflow_id, name, trigger_type, field_name, conditions,
                is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                trigger_type = EXCLUDED.trigger_type,
                field_name = EXCLUDED.field_name,
                conditions = EXCLUDED.conditions,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(trigger.id)
        .bind(trigger.workflow_id)
        .bind(&trigger.name)
        .bind(trigger.trigger_type.as_str())
        .bind(&trigger.field_name)
        .bind(Json(&trigger.conditions))
        .bind(trigger.is_active)
        .bind(trigger.created_at)
        .bind(trigger.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_trigger(&self, id: Uuid) -> WorkflowResult<Option<WorkflowTrigger>> {
        sqlx::query("SELECT * FROM workflow_triggers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(trigger_from_row)
            .transpose()
    }

    async fn list_triggers(&self, workflow_id: Uuid) -> WorkflowResult<Vec<WorkflowTrigger>> {
        sqlx::query("SELECT * FROM workflow_triggers WHERE workflow_id = $1 ORDER BY created_at")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(trigger_from_row)
            .collect()
    }

    async fn list_active_triggers(
        &self,
        entity_type: &str,
    ) -> WorkflowResult<Vec<WorkflowTrigger>> {
        sqlx::query(
            r#"
            SELECT t.*
            FROM workflow_triggers t
            JOIN workflows w ON w.id = t.workflow_id
            WHERE t.is_active
              AND w.status = 'active'
              AND w.target_entity_type = $1
            ORDER BY t.created_at
            "#,
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(trigger_from_row)
        .collect()
    }

    async fn save_schedule(&self, schedule: &ScheduledWorkflow) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_workflows (
                id, workflow_id, name, description, schedule_type, scheduled_date,
                cron_expression, parameters, status, last_run, next_run,
                created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                schedule_type = EXCLUDED.schedule_type,
                scheduled_date = EXCLUDED.scheduled_date,
                cron_expression = EXCLUDED.cron_expression,
                parameters = EXCLUDED.parameters,
                status = EXCLUDED.status,
                last_run = EXCLUDED.last_run,
                next_run = EXCLUDED.next_run,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.workflow_id)
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(schedule.schedule_type.as_str())
        .bind(schedule.scheduled_date)
        .bind(&schedule.cron_expression)
        .bind(Json(&schedule.parameters))
        .bind(schedule.status.as_str())
        .bind(schedule.last_run)
        .bind(schedule.next_run)
        .bind(schedule.created_by)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> WorkflowResult<Option<ScheduledWorkflow>> {
        sqlx::query("SELECT * FROM scheduled_workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(schedule_from_row)
            .transpose()
    }

    async fn list_schedules(&self, workflow_id: Uuid) -> WorkflowResult<Vec<ScheduledWorkflow>> {
        sqlx::query(
            "SELECT * FROM scheduled_workflows WHERE workflow_id = $1 ORDER BY scheduled_date",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(schedule_from_row)
        .collect()
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Vec<ScheduledWorkflow>> {
        sqlx::query(
            r#"
            SELECT * FROM scheduled_workflows
            WHERE status = 'pending'
              AND COALESCE(next_run, scheduled_date) <= $1
            ORDER BY COALESCE(next_run, scheduled_date)
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(schedule_from_row)
        .collect()
    }

    async fn flip_schedule_status(
        &self,
        id: Uuid,
        from: &[ScheduleStatus],
        to: ScheduleStatus,
        at: DateTime<Utc>,
    ) -> WorkflowResult<Option<ScheduledWorkflow>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        sqlx::query(
            r#"
            UPDATE scheduled_workflows
            SET status = $3,
                updated_at = $4,
                last_run = CASE WHEN $3 = 'running' THEN $4 ELSE last_run END
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&from)
        .bind(to.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(schedule_from_row)
        .transpose()
    }

    async fn finish_schedule(
        &self,
        id: Uuid,
        status: ScheduleStatus,
        next_run: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_workflows
            SET status = $2, next_run = COALESCE($3, next_run), updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(next_run)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::not_found("Scheduled workflow", id));
        }
        Ok(())
    }

    async fn save_template(&self, template: &WorkflowTemplate) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_templates (
                id, name, description, category, target_entity_type, definition,
                is_public, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                category = EXCLUDED.category,
                target_entity_type = EXCLUDED.target_entity_type,
                definition = EXCLUDED.definition,
                is_public = EXCLUDED.is_public
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.category)
        .bind(&template.target_entity_type)
        .bind(Json(&template.definition))
        .bind(template.is_public)
        .bind(template.created_by)
        .bind(template.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> WorkflowResult<Option<WorkflowTemplate>> {
        sqlx::query("SELECT * FROM workflow_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(template_from_row)
            .transpose()
    }

    async fn list_templates(&self) -> WorkflowResult<Vec<WorkflowTemplate>> {
        sqlx::query("SELECT * FROM workflow_templates ORDER BY category, name")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(template_from_row)
            .collect()
    }
}
