// Background Jobs Service
//
// Scheduled workflow runs are swept by tokio-cron-scheduler at a fixed cadence;
// operators can also run a schedule immediately through the API.

pub mod scheduled_workflows;
pub mod scheduler;

pub use scheduled_workflows::{
    NewScheduledWorkflow, ScheduleRunReport, ScheduleTickResult, ScheduledWorkflowJob,
};
pub use scheduler::{
    JobConfig, JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus, SCHEDULED_WORKFLOWS_JOB,
};
