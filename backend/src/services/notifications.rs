// Workflow Notifications - In-app notifications and tasks written to PostgreSQL

use async_trait::async_trait;
use chrono::Utc;
use flowdesk_shared::Notification;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::workflows::{CollaboratorResult, NotificationRequest, NotificationSink, TaskRequest, TaskSink};

#[derive(Debug, Clone)]
pub struct PgNotificationSink {
    pool: PgPool,
}

impl PgNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent first
    pub async fn list_for_user(&self, user_id: Uuid, unread_only: bool) -> CollaboratorResult<Vec<Notification>> {
        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT id, user_id, title, message, notification_type, link,
                   entity_type, entity_id, read, created_at
            FROM notifications
            WHERE user_id = $1 AND (NOT $2 OR read = FALSE)
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(unread_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn notify(&self, notification: NotificationRequest) -> CollaboratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, user_id, title, message, notification_type, link, entity_type, entity_id, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.level)
        .bind(&notification.link)
        .bind(&notification.entity.entity_type)
        .bind(&notification.entity.entity_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgTaskSink {
    pool: PgPool,
}

impl PgTaskSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskSink for PgTaskSink {
    async fn create_task(&self, task: TaskRequest) -> CollaboratorResult<Uuid> {
        let id = Uuid::new_v4();
        let context = &task.context;

        sqlx::query(
            r#"
            INSERT INTO workflow_tasks
                (id, title, description, assignee_id, due_date, workflow_id, instance_id,
                 entity_type, entity_id, project, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.assignee_id)
        .bind(task.due_date)
        .bind(context.workflow_id)
        .bind(context.instance_id)
        .bind(&context.entity.entity_type)
        .bind(&context.entity.entity_id)
        .bind(context.project.as_ref().map(Json))
        .bind(context.created_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        info!("Created task '{}' for {}", task.title, context.entity);
        Ok(id)
    }
}
