// Workflow Executor - Runs transition actions against the collaborators

use flowdesk_shared::{Action, EntityRef, NotificationContent, WorkflowInstance};
use serde_json::{Value, json};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::actions::{EffectResult, RecipientRole, USER_ENTITY_TYPE, render, render_value, resolve_recipients};
use super::collaborators::{Collaborators, NotificationRequest, TaskContext, TaskRequest};
use super::conditions::resolve_parent_mut;
use super::error::{ActionError, WorkflowError, WorkflowResult};

/// Everything an action may read or touch while a transition fires
pub struct ExecutionContext<'a> {
    pub instance: &'a WorkflowInstance,
    pub actor: Option<Uuid>,
    /// Working copy of the entity; `update_field` writes land here first so
    /// later actions observe them
    pub snapshot: &'a mut Value,
    staged: Vec<StagedWrite>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(instance: &'a WorkflowInstance, actor: Option<Uuid>, snapshot: &'a mut Value) -> Self {
        Self {
            instance,
            actor,
            snapshot,
            staged: Vec::new(),
        }
    }
}

/// An `update_field` write held back until every action of the transition
/// has succeeded
#[derive(Debug, Clone)]
struct StagedWrite {
    index: usize,
    field: String,
    value: Value,
    previous: Option<Value>,
}

#[derive(Clone)]
pub struct ActionExecutor {
    collaborators: Collaborators,
}

impl ActionExecutor {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Run actions in declared order. The first failure aborts the rest and
    /// no field write reaches the entity store; otherwise the staged writes
    /// are flushed once every action has succeeded.
    pub async fn execute_all(
        &self,
        actions: &[Action],
        context: &mut ExecutionContext<'_>,
    ) -> WorkflowResult<Vec<EffectResult>> {
        let mut results = Vec::with_capacity(actions.len());

        for (index, action) in actions.iter().enumerate() {
            let staged_before = context.staged.len();
            let result = self
                .execute(action, context)
                .await
                .map_err(|source| WorkflowError::Action {
                    index,
                    kind: action.kind(),
                    source,
                })?;
            for write in &mut context.staged[staged_before..] {
                write.index = index;
            }
            results.push(result);
        }

        self.flush(context).await?;
        Ok(results)
    }

    async fn flush(&self, context: &mut ExecutionContext<'_>) -> WorkflowResult<()> {
        let staged = std::mem::take(&mut context.staged);
        for (written, write) in staged.iter().enumerate() {
            let stored = self
                .collaborators
                .entities
                .set_field(&context.instance.entity, &write.field, write.value.clone())
                .await;
            if let Err(e) = stored {
                self.restore(context.instance, &staged[..written]).await;
                return Err(WorkflowError::Action {
                    index: write.index,
                    kind: "update_field",
                    source: e.into(),
                });
            }
        }
        Ok(())
    }

    /// Undo flushed writes newest first. A field that did not exist before
    /// comes back as null.
    async fn restore(&self, instance: &WorkflowInstance, written: &[StagedWrite]) {
        for write in written.iter().rev() {
            let previous = write.previous.clone().unwrap_or(Value::Null);
            if let Err(e) = self
                .collaborators
                .entities
                .set_field(&instance.entity, &write.field, previous)
                .await
            {
                warn!("Could not restore '{}' on {}: {}", write.field, instance.entity, e);
            }
        }
    }

    pub async fn execute(
        &self,
        action: &Action,
        context: &mut ExecutionContext<'_>,
    ) -> Result<EffectResult, ActionError> {
        let start = Instant::now();
        debug!(
            "Executing {} on {} (instance {})",
            action.kind(),
            context.instance.entity,
            context.instance.id
        );

        let result = match action {
            Action::UpdateField { field, value } => {
                self.update_field(field, value.clone(), context).await
            }
            Action::SendNotification { recipients, data } => {
                self.send_notification(recipients, data, context).await
            }
            Action::CreateTask {
                title,
                description,
                assignee_id,
                due_date,
            } => {
                self.create_task(title, description, *assignee_id, *due_date, context)
                    .await
            }
            Action::SendEmail {
                template,
                recipients,
                data,
            } => self.send_email(template, recipients, data, context).await,
        }?;

        debug!(
            "Action {} finished in {}ms",
            action.kind(),
            start.elapsed().as_millis()
        );
        Ok(result)
    }

    async fn update_field(
        &self,
        field: &str,
        value: Value,
        context: &mut ExecutionContext<'_>,
    ) -> Result<EffectResult, ActionError> {
        let Some((parent, leaf)) = resolve_parent_mut(context.snapshot, field) else {
            return Err(ActionError::PathNotFound(field.to_string()));
        };
        let previous = parent.insert(leaf.to_string(), value.clone());
        context.staged.push(StagedWrite {
            index: 0,
            field: field.to_string(),
            value: value.clone(),
            previous,
        });

        let mut result = EffectResult::new("update_field")
            .with_output(json!({ "field": field, "value": value }));
        result.delivered = 1;
        Ok(result)
    }

    async fn send_notification(
        &self,
        recipients: &[String],
        content: &NotificationContent,
        context: &mut ExecutionContext<'_>,
    ) -> Result<EffectResult, ActionError> {
        let snapshot: &Value = &*context.snapshot;
        let users = resolve_recipients(recipients, snapshot, context.actor);
        let title = render(&content.title, snapshot);
        let message = render(&content.message, snapshot);
        let link = render(&content.link, snapshot);

        let mut result = EffectResult::new("send_notification");
        for user_id in users {
            let request = NotificationRequest {
                user_id,
                title: title.clone(),
                message: message.clone(),
                level: content.level.clone(),
                link: link.clone(),
                entity: context.instance.entity.clone(),
            };

            match self.collaborators.notifications.notify(request).await {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    warn!("Notification to user {} failed: {}", user_id, e);
                    result.failed += 1;
                }
            }
        }

        Ok(result)
    }

    async fn create_task(
        &self,
        title: &str,
        description: &str,
        assignee_id: Option<Uuid>,
        due_date: Option<chrono::NaiveDate>,
        context: &mut ExecutionContext<'_>,
    ) -> Result<EffectResult, ActionError> {
        if title.trim().is_empty() {
            return Err(ActionError::InvalidParameter {
                name: "title",
                reason: "must not be empty".to_string(),
            });
        }

        let assignee = match assignee_id {
            Some(id) => {
                let known = self
                    .collaborators
                    .entities
                    .exists(USER_ENTITY_TYPE, &id.to_string())
                    .await?;
                if !known {
                    warn!("Task assignee {} does not exist, leaving task unassigned", id);
                }
                known.then_some(id)
            }
            None => None,
        };

        let snapshot: &Value = &*context.snapshot;
        let request = TaskRequest {
            title: render(title, snapshot),
            description: render(description, snapshot),
            assignee_id: assignee,
            due_date,
            context: TaskContext {
                workflow_id: context.instance.workflow_id,
                instance_id: context.instance.id,
                entity: context.instance.entity.clone(),
                project: snapshot.get("project").filter(|p| !p.is_null()).cloned(),
                created_by: context.actor.or(context.instance.started_by),
            },
        };

        let task_id = self.collaborators.tasks.create_task(request).await?;
        info!("Workflow instance {} created task {}", context.instance.id, task_id);

        let mut result = EffectResult::new("create_task")
            .with_output(json!({ "task_id": task_id, "assignee_id": assignee }));
        result.delivered = 1;
        Ok(result)
    }

    async fn send_email(
        &self,
        template: &str,
        recipients: &[String],
        data: &Value,
        context: &mut ExecutionContext<'_>,
    ) -> Result<EffectResult, ActionError> {
        let snapshot: &Value = &*context.snapshot;
        let mut addresses: Vec<String> = Vec::new();

        for recipient in recipients {
            let address = match recipient.parse::<RecipientRole>() {
                Ok(role) => match role.resolve(snapshot, context.actor) {
                    Some(user_id) => self.user_email(user_id).await,
                    None => None,
                },
                // Literal addresses pass through unchanged
                Err(()) if recipient.contains('@') => Some(recipient.clone()),
                Err(()) => None,
            };

            match address {
                Some(address) if !addresses.contains(&address) => addresses.push(address),
                Some(_) => {}
                None => debug!("Skipping unresolvable email recipient '{}'", recipient),
            }
        }

        let mut result = EffectResult::new("send_email");
        if addresses.is_empty() {
            return Ok(result);
        }

        let rendered = render_value(data, snapshot);
        match self
            .collaborators
            .email
            .send(template, &addresses, &rendered)
            .await
        {
            Ok(()) => result.delivered = addresses.len(),
            Err(e) => {
                warn!("Email '{}' to {:?} failed: {}", template, addresses, e);
                result.failed = addresses.len();
            }
        }

        Ok(result)
    }

    async fn user_email(&self, user_id: Uuid) -> Option<String> {
        let user = EntityRef::new(USER_ENTITY_TYPE, user_id.to_string());
        match self.collaborators.entities.snapshot(&user).await {
            Ok(snapshot) => snapshot
                .get("email")
                .and_then(Value::as_str)
                .filter(|email| !email.is_empty())
                .map(str::to_string),
            Err(e) => {
                warn!("Could not load email for user {}: {}", user_id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::collaborators::{
        MockClock, MockEmailSink, MockEntityStore, MockNotificationSink, MockTaskSink,
    };
    use crate::workflows::error::CollaboratorError;
    use chrono::Utc;
    use flowdesk_shared::InstanceStatus;
    use std::sync::Arc;

    struct Mocks {
        entities: MockEntityStore,
        notifications: MockNotificationSink,
        tasks: MockTaskSink,
        email: MockEmailSink,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                entities: MockEntityStore::new(),
                notifications: MockNotificationSink::new(),
                tasks: MockTaskSink::new(),
                email: MockEmailSink::new(),
            }
        }

        fn executor(self) -> ActionExecutor {
            ActionExecutor::new(Collaborators {
                entities: Arc::new(self.entities),
                notifications: Arc::new(self.notifications),
                tasks: Arc::new(self.tasks),
                email: Arc::new(self.email),
                clock: Arc::new(MockClock::new()),
            })
        }
    }

    fn instance(started_by: Option<Uuid>) -> WorkflowInstance {
        WorkflowInstance {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            entity: EntityRef::new("service.ServiceTicket", "42"),
            current_state_id: Some(Uuid::new_v4()),
            status: InstanceStatus::Active,
            started_by,
            started_at: Utc::now(),
            completed_at: None,
            data: json!({}),
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_update_field_writes_through_and_updates_working_copy() {
        let mut mocks = Mocks::new();
        mocks
            .entities
            .expect_set_field()
            .withf(|entity, path, value| {
                entity.entity_id == "42" && path == "sla.escalated" && *value == json!(true)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let executor = mocks.executor();

        let instance = instance(None);
        let mut snapshot = json!({"sla": {"escalated": false}});
        let mut context = ExecutionContext::new(&instance, None, &mut snapshot);

        let results = executor
            .execute_all(&[Action::update_field("sla.escalated", true)], &mut context)
            .await
            .unwrap();
        assert_eq!(results[0].delivered, 1);
        assert_eq!(snapshot["sla"]["escalated"], json!(true));
    }

    #[tokio::test]
    async fn test_later_failure_keeps_earlier_writes_off_the_entity() {
        let mut mocks = Mocks::new();
        mocks.entities.expect_set_field().never();
        let executor = mocks.executor();

        let instance = instance(None);
        let mut snapshot = json!({"status": "open"});
        let mut context = ExecutionContext::new(&instance, None, &mut snapshot);

        let actions = vec![
            Action::update_field("status", "reassigned"),
            Action::update_field("owner.team", "tier-2"),
        ];
        let err = executor.execute_all(&actions, &mut context).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Action { index: 1, kind: "update_field", .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_flush_restores_written_fields() {
        let mut mocks = Mocks::new();
        mocks
            .entities
            .expect_set_field()
            .withf(|_, path, value| path == "status" && *value == json!("escalated"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        mocks
            .entities
            .expect_set_field()
            .withf(|_, path, _| path == "priority")
            .times(1)
            .returning(|_, _, _| Err(CollaboratorError::Failed("row locked".into())));
        mocks
            .entities
            .expect_set_field()
            .withf(|_, path, value| path == "status" && *value == json!("open"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let executor = mocks.executor();

        let instance = instance(None);
        let mut snapshot = json!({"status": "open", "priority": "low"});
        let mut context = ExecutionContext::new(&instance, None, &mut snapshot);

        let actions = vec![
            Action::update_field("status", "escalated"),
            Action::update_field("priority", "urgent"),
        ];
        let err = executor.execute_all(&actions, &mut context).await.unwrap_err();
        match err {
            WorkflowError::Action { index, kind, source } => {
                assert_eq!(index, 1);
                assert_eq!(kind, "update_field");
                assert!(matches!(source, ActionError::Collaborator(_)));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_field_with_missing_parent_fails_before_writing() {
        let mut mocks = Mocks::new();
        mocks.entities.expect_set_field().never();
        let executor = mocks.executor();

        let instance = instance(None);
        let mut snapshot = json!({"status": "open"});
        let mut context = ExecutionContext::new(&instance, None, &mut snapshot);

        let err = executor
            .execute(&Action::update_field("sla.escalated", true), &mut context)
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::PathNotFound("sla.escalated".into()));
    }

    #[tokio::test]
    async fn test_notification_failures_are_counted_not_raised() {
        let assignee = Uuid::new_v4();
        let manager = Uuid::new_v4();

        let mut mocks = Mocks::new();
        mocks
            .notifications
            .expect_notify()
            .withf(move |n| n.user_id == assignee && n.title == "Ticket T-9 escalated")
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .notifications
            .expect_notify()
            .withf(move |n| n.user_id == manager)
            .times(1)
            .returning(|_| Err(CollaboratorError::Failed("inbox offline".into())));
        let executor = mocks.executor();

        let instance = instance(None);
        let mut snapshot = json!({
            "number": "T-9",
            "assignee": assignee.to_string(),
            "manager": manager.to_string()
        });
        let mut context = ExecutionContext::new(&instance, None, &mut snapshot);

        let action = Action::notify(&["assignee", "manager", "creator"], "Ticket {{number}} escalated", "");
        let result = executor.execute(&action, &mut context).await.unwrap();
        assert_eq!(result.delivered, 1);
        assert_eq!(result.failed, 1);
    }

    #[tokio::test]
    async fn test_create_task_drops_unknown_assignee_and_carries_context() {
        let ghost = Uuid::new_v4();
        let starter = Uuid::new_v4();

        let mut mocks = Mocks::new();
        mocks
            .entities
            .expect_exists()
            .withf(move |entity_type, id| entity_type == USER_ENTITY_TYPE && id == ghost.to_string())
            .times(1)
            .returning(|_, _| Ok(false));
        mocks
            .tasks
            .expect_create_task()
            .withf(move |task| {
                task.assignee_id.is_none()
                    && task.context.created_by == Some(starter)
                    && task.context.project == Some(json!("apollo"))
                    && task.title == "Follow up T-3"
            })
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));
        let executor = mocks.executor();

        let instance = instance(Some(starter));
        let mut snapshot = json!({"number": "T-3", "project": "apollo"});
        let mut context = ExecutionContext::new(&instance, None, &mut snapshot);

        let action = Action::create_task("Follow up {{number}}", Some(ghost));
        let result = executor.execute(&action, &mut context).await.unwrap();
        assert_eq!(result.delivered, 1);
    }

    #[tokio::test]
    async fn test_send_email_resolves_roles_to_addresses() {
        let creator = Uuid::new_v4();

        let mut mocks = Mocks::new();
        mocks
            .entities
            .expect_snapshot()
            .withf(move |entity| entity.entity_type == USER_ENTITY_TYPE && entity.entity_id == creator.to_string())
            .returning(|_| Ok(json!({"email": "owner@example.com"})));
        mocks
            .email
            .expect_send()
            .withf(|template, recipients, data| {
                template == "invoice_overdue"
                    && recipients == ["owner@example.com".to_string(), "billing@example.com".to_string()]
                    && data["subject"] == json!("Invoice INV-5 overdue")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let executor = mocks.executor();

        let instance = instance(None);
        let mut snapshot = json!({"number": "INV-5", "created_by": creator.to_string()});
        let mut context = ExecutionContext::new(&instance, None, &mut snapshot);

        let action = Action::send_email(
            "invoice_overdue",
            &["creator", "billing@example.com", "assignee"],
            json!({"subject": "Invoice {{number}} overdue"}),
        );
        let result = executor.execute(&action, &mut context).await.unwrap();
        assert_eq!(result.delivered, 2);
    }

    #[tokio::test]
    async fn test_execute_all_stops_at_first_failure() {
        let mut mocks = Mocks::new();
        mocks.tasks.expect_create_task().never();
        let executor = mocks.executor();

        let instance = instance(None);
        let mut snapshot = json!({});
        let mut context = ExecutionContext::new(&instance, None, &mut snapshot);

        let actions = vec![
            Action::update_field("customer.tier", "gold"),
            Action::create_task("never created", None),
        ];
        let err = executor.execute_all(&actions, &mut context).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Action { index: 0, kind: "update_field", .. }
        ));
    }
}
