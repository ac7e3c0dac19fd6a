// Job Scheduler - Central scheduler for background workflow jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use super::{ScheduleTickResult, ScheduledWorkflowJob};
use crate::workflows::WorkflowError;

pub const SCHEDULED_WORKFLOWS_JOB: &str = "scheduled_workflows";

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Workflow error: {0}")]
    WorkflowError(#[from] WorkflowError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub scheduler_enabled: bool,
    /// Six-field cron expression for the due-schedule sweep
    pub scheduled_workflows_cron: String,
    pub schedule_row_timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            // Every minute
            scheduled_workflows_cron: "0 * * * * *".to_string(),
            schedule_row_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

type ExecutionLogs = Arc<RwLock<Vec<JobExecutionLog>>>;

pub struct JobScheduler {
    scheduler: TokioScheduler,
    schedules: ScheduledWorkflowJob,
    config: JobConfig,
    execution_logs: ExecutionLogs,
}

impl JobScheduler {
    pub async fn new(schedules: ScheduledWorkflowJob, config: JobConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            schedules,
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        if !self.config.scheduler_enabled {
            info!("Background job scheduler is disabled");
            return Ok(());
        }

        info!("Starting background job scheduler");

        self.schedule_workflow_sweep().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_workflow_sweep(&self) -> JobResult<()> {
        let cron_expr = self.config.scheduled_workflows_cron.clone();

        let schedules = self.schedules.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let schedules = schedules.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let _ = run_sweep(&schedules, &logs).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled workflow sweep with cron '{}'", cron_expr);

        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<ScheduleTickResult> {
        match job_name {
            SCHEDULED_WORKFLOWS_JOB => run_sweep(&self.schedules, &self.execution_logs)
                .await
                .map_err(JobError::from),
            _ => Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }
    }
}

async fn run_sweep(
    schedules: &ScheduledWorkflowJob,
    logs: &ExecutionLogs,
) -> Result<ScheduleTickResult, WorkflowError> {
    let log_id = Uuid::new_v4();
    let started_at = Utc::now();

    info!("Running scheduled workflow sweep");

    let outcome = schedules.tick().await;
    let completed_at = Utc::now();
    let duration = (completed_at - started_at).num_milliseconds();

    let log = match &outcome {
        Ok(result) => {
            info!(
                "Scheduled workflow sweep completed: {} due, {} claimed, {} instances started",
                result.rows_due, result.rows_claimed, result.instances_started
            );
            JobExecutionLog {
                id: log_id,
                job_name: "Scheduled Workflows".to_string(),
                started_at,
                completed_at: Some(completed_at),
                status: if result.errors.is_empty() {
                    JobStatus::Completed
                } else {
                    JobStatus::PartialFailure
                },
                items_processed: result.rows_claimed as i32,
                errors: result.errors.clone(),
                duration_ms: Some(duration),
            }
        }
        Err(e) => {
            error!("Scheduled workflow sweep failed: {}", e);
            JobExecutionLog {
                id: log_id,
                job_name: "Scheduled Workflows".to_string(),
                started_at,
                completed_at: Some(completed_at),
                status: JobStatus::Failed,
                items_processed: 0,
                errors: vec![e.to_string()],
                duration_ms: Some(duration),
            }
        }
    };

    let mut logs = logs.write().await;
    logs.push(log);
    // Keep only the most recent logs
    if logs.len() > MAX_EXECUTION_LOGS {
        logs.remove(0);
    }

    outcome
}
