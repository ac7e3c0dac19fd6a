// Scheduled Workflows Job - Starts instances for every entity matching a schedule's filter

use chrono::{DateTime, Utc};
use flowdesk_shared::{ScheduleParameters, ScheduleStatus, ScheduleType, ScheduledWorkflow};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::workflows::{Clock, EntityStore, InstanceEngine, WorkflowError, WorkflowResult, WorkflowStore};

/// Every status a schedule can be claimed from by an operator
const IDLE: [ScheduleStatus; 4] = [
    ScheduleStatus::Pending,
    ScheduleStatus::Completed,
    ScheduleStatus::Failed,
    ScheduleStatus::Cancelled,
];

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewScheduledWorkflow {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule_type: ScheduleType,
    pub scheduled_date: DateTime<Utc>,
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub parameters: ScheduleParameters,
}

/// Outcome of running one schedule row
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRunReport {
    pub schedule_id: Uuid,
    pub status: ScheduleStatus,
    pub matched: usize,
    pub started: usize,
    pub next_run: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScheduleTickResult {
    pub rows_due: usize,
    pub rows_claimed: usize,
    pub rows_completed: usize,
    pub rows_failed: usize,
    pub instances_started: usize,
    pub errors: Vec<String>,
}

/// Parse a cron expression. Five-field expressions get a leading seconds
/// field so both crontab and seconds-resolution forms are accepted.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, String> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

/// When a schedule should run next after `last_run`. `None` means it never
/// runs again.
pub fn next_run_after(
    schedule: &ScheduledWorkflow,
    last_run: DateTime<Utc>,
) -> WorkflowResult<Option<DateTime<Utc>>> {
    match schedule.schedule_type {
        ScheduleType::Once => Ok(None),
        ScheduleType::Cron => {
            let expression = schedule.cron_expression.as_deref().unwrap_or_default();
            let cron = parse_cron(expression)
                .map_err(|e| WorkflowError::Configuration(format!("invalid cron expression: {}", e)))?;
            Ok(cron.after(&last_run).next())
        }
        fixed => Ok(fixed.fixed_interval().map(|interval| last_run + interval)),
    }
}

#[derive(Clone)]
pub struct ScheduledWorkflowJob {
    store: Arc<dyn WorkflowStore>,
    engine: InstanceEngine,
    entities: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    row_timeout: Duration,
}

impl ScheduledWorkflowJob {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        engine: InstanceEngine,
        entities: Arc<dyn EntityStore>,
        clock: Arc<dyn Clock>,
        row_timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            entities,
            clock,
            row_timeout,
        }
    }

    pub async fn create(
        &self,
        workflow_id: Uuid,
        input: NewScheduledWorkflow,
        created_by: Option<Uuid>,
    ) -> WorkflowResult<ScheduledWorkflow> {
        if self.store.get_workflow(workflow_id).await?.is_none() {
            return Err(WorkflowError::not_found("Workflow", workflow_id));
        }

        let name = input.name.trim();
        if name.is_empty() {
            return Err(WorkflowError::validation("name", "must not be empty"));
        }

        let cron_expression = input
            .cron_expression
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if input.schedule_type == ScheduleType::Cron {
            let Some(expression) = &cron_expression else {
                return Err(WorkflowError::validation(
                    "cron_expression",
                    "cron schedules need an expression",
                ));
            };
            parse_cron(expression).map_err(|e| WorkflowError::validation("cron_expression", e))?;
        }

        let schedule = ScheduledWorkflow {
            id: Uuid::new_v4(),
            workflow_id,
            name: name.to_string(),
            description: input.description,
            schedule_type: input.schedule_type,
            scheduled_date: input.scheduled_date,
            cron_expression,
            parameters: input.parameters,
            status: ScheduleStatus::Pending,
            last_run: None,
            next_run: None,
            created_by,
            created_at: self.clock.now(),
            updated_at: None,
        };
        self.store.save_schedule(&schedule).await?;

        info!(
            "Created {} schedule '{}' for workflow {} due {}",
            schedule.schedule_type, schedule.name, workflow_id, schedule.scheduled_date
        );
        Ok(schedule)
    }

    pub async fn get(&self, id: Uuid) -> WorkflowResult<ScheduledWorkflow> {
        self.store
            .get_schedule(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Scheduled workflow", id))
    }

    pub async fn list(&self, workflow_id: Uuid) -> WorkflowResult<Vec<ScheduledWorkflow>> {
        self.store.list_schedules(workflow_id).await
    }

    /// Why a flip found nothing to change
    async fn flip_refused(&self, id: Uuid) -> WorkflowError {
        match self.store.get_schedule(id).await {
            Ok(Some(schedule)) => WorkflowError::ScheduleBusy {
                id,
                status: schedule.status,
            },
            Ok(None) => WorkflowError::not_found("Scheduled workflow", id),
            Err(e) => e,
        }
    }

    /// Put the schedule back in the queue
    pub async fn activate(&self, id: Uuid) -> WorkflowResult<ScheduledWorkflow> {
        match self
            .store
            .flip_schedule_status(id, &IDLE, ScheduleStatus::Pending, self.clock.now())
            .await?
        {
            Some(schedule) => Ok(schedule),
            None => Err(self.flip_refused(id).await),
        }
    }

    /// Take the schedule out of the queue; refused while it runs
    pub async fn deactivate(&self, id: Uuid) -> WorkflowResult<ScheduledWorkflow> {
        match self
            .store
            .flip_schedule_status(id, &IDLE, ScheduleStatus::Cancelled, self.clock.now())
            .await?
        {
            Some(schedule) => Ok(schedule),
            None => Err(self.flip_refused(id).await),
        }
    }

    /// Run immediately on behalf of `actor`, whatever the due date
    pub async fn run_now(&self, id: Uuid, actor: Option<Uuid>) -> WorkflowResult<ScheduleRunReport> {
        let claimed = self
            .store
            .flip_schedule_status(id, &IDLE, ScheduleStatus::Running, self.clock.now())
            .await?;
        let Some(schedule) = claimed else {
            return Err(self.flip_refused(id).await);
        };

        let started_by = actor.or(schedule.created_by);
        let report = self.execute_claimed(schedule, started_by).await;
        Ok(report)
    }

    /// Claim and run every due row concurrently
    pub async fn tick(&self) -> WorkflowResult<ScheduleTickResult> {
        let now = self.clock.now();
        let due = self.store.list_due_schedules(now).await?;

        let mut result = ScheduleTickResult {
            rows_due: due.len(),
            ..ScheduleTickResult::default()
        };
        if due.is_empty() {
            return Ok(result);
        }

        let runs = due.into_iter().map(|schedule| self.claim_and_run(schedule.id, now));
        for report in join_all(runs).await.into_iter().flatten() {
            result.rows_claimed += 1;
            result.instances_started += report.started;
            match report.error {
                Some(error) => {
                    result.rows_failed += 1;
                    result.errors.push(format!("{}: {}", report.schedule_id, error));
                }
                None => result.rows_completed += 1,
            }
        }

        Ok(result)
    }

    /// `None` when another runner claimed the row first
    async fn claim_and_run(&self, id: Uuid, now: DateTime<Utc>) -> Option<ScheduleRunReport> {
        let claimed = self
            .store
            .flip_schedule_status(id, &[ScheduleStatus::Pending], ScheduleStatus::Running, now)
            .await;

        match claimed {
            Ok(Some(schedule)) => {
                let started_by = schedule.created_by;
                Some(self.execute_claimed(schedule, started_by).await)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Could not claim scheduled workflow {}: {}", id, e);
                Some(ScheduleRunReport {
                    schedule_id: id,
                    status: ScheduleStatus::Pending,
                    matched: 0,
                    started: 0,
                    next_run: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    async fn execute_claimed(
        &self,
        schedule: ScheduledWorkflow,
        started_by: Option<Uuid>,
    ) -> ScheduleRunReport {
        let last_run = schedule.last_run.unwrap_or_else(|| self.clock.now());

        let outcome = tokio::time::timeout(self.row_timeout, self.start_matches(&schedule, started_by))
            .await
            .unwrap_or_else(|_| {
                Err(WorkflowError::Storage(format!(
                    "timed out after {}s",
                    self.row_timeout.as_secs()
                )))
            })
            .and_then(|counts| Ok((counts, next_run_after(&schedule, last_run)?)));

        let mut report = ScheduleRunReport {
            schedule_id: schedule.id,
            status: ScheduleStatus::Failed,
            matched: 0,
            started: 0,
            next_run: None,
            error: None,
        };

        match outcome {
            Ok(((matched, started), next_run)) => {
                report.matched = matched;
                report.started = started;
                report.next_run = next_run;
                report.status = match next_run {
                    Some(_) => ScheduleStatus::Pending,
                    None => ScheduleStatus::Completed,
                };
                info!(
                    "Scheduled workflow '{}' matched {} entities, started {} instances",
                    schedule.name, matched, started
                );
            }
            Err(e) => {
                warn!("Scheduled workflow '{}' failed: {}", schedule.name, e);
                report.error = Some(e.to_string());
            }
        }

        if let Err(e) = self
            .store
            .finish_schedule(schedule.id, report.status, report.next_run, self.clock.now())
            .await
        {
            error!("Could not record outcome of scheduled workflow {}: {}", schedule.id, e);
            report.error.get_or_insert_with(|| e.to_string());
        }

        report
    }

    async fn start_matches(
        &self,
        schedule: &ScheduledWorkflow,
        started_by: Option<Uuid>,
    ) -> WorkflowResult<(usize, usize)> {
        let workflow = self
            .store
            .get_workflow(schedule.workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow", schedule.workflow_id))?;

        let entities = self
            .entities
            .find(&workflow.target_entity_type, &schedule.parameters.filters)
            .await?;

        let mut started = 0;
        for entity in &entities {
            let outcome = self
                .engine
                .start(workflow.id, entity.clone(), started_by, schedule.parameters.data.clone())
                .await?;
            if outcome.created {
                started += 1;
            }
        }

        Ok((entities.len(), started))
    }
}
