// Workflow Collaborators - Interfaces to the systems the engine drives but does not own

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use flowdesk_shared::EntityRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::conditions::{resolve_parent_mut, resolve_path, values_equal};
use super::error::{CollaboratorError, CollaboratorResult};

/// Read and mutate domain entities through their JSON snapshot
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn snapshot(&self, entity: &EntityRef) -> CollaboratorResult<Value>;

    /// Set the field at a dot path; the parent of the leaf must exist
    async fn set_field(&self, entity: &EntityRef, path: &str, value: Value)
    -> CollaboratorResult<()>;

    async fn exists(&self, entity_type: &str, entity_id: &str) -> CollaboratorResult<bool>;

    /// Entities of `entity_type` whose dot-path fields equal every filter value
    async fn find(
        &self,
        entity_type: &str,
        filters: &Map<String, Value>,
    ) -> CollaboratorResult<Vec<EntityRef>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub level: String,
    pub link: String,
    pub entity: EntityRef,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: NotificationRequest) -> CollaboratorResult<()>;
}

/// Where a workflow-created task came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub workflow_id: Uuid,
    pub instance_id: Uuid,
    pub entity: EntityRef,
    /// The entity's `project` field, if it has one
    pub project: Option<Value>,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub title: String,
    pub description: String,
    pub assignee_id: Option<Uuid>,
    pub due_date: Option<NaiveDate>,
    pub context: TaskContext,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Returns the id of the created task
    async fn create_task(&self, task: TaskRequest) -> CollaboratorResult<Uuid>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSink: Send + Sync {
    async fn send(&self, template: &str, recipients: &[String], data: &Value)
    -> CollaboratorResult<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for scheduler and timestamp tests
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Every collaborator the engine needs, shared behind `Arc`s
#[derive(Clone)]
pub struct Collaborators {
    pub entities: Arc<dyn EntityStore>,
    pub notifications: Arc<dyn NotificationSink>,
    pub tasks: Arc<dyn TaskSink>,
    pub email: Arc<dyn EmailSink>,
    pub clock: Arc<dyn Clock>,
}

/// Entity snapshots held in memory, keyed by reference
#[derive(Clone, Default)]
pub struct MemoryEntityStore {
    entities: Arc<RwLock<HashMap<EntityRef, Value>>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entity: EntityRef, snapshot: Value) {
        self.entities.write().await.insert(entity, snapshot);
    }

    pub async fn remove(&self, entity: &EntityRef) -> Option<Value> {
        self.entities.write().await.remove(entity)
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn snapshot(&self, entity: &EntityRef) -> CollaboratorResult<Value> {
        self.entities
            .read()
            .await
            .get(entity)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(entity.to_string()))
    }

    async fn set_field(
        &self,
        entity: &EntityRef,
        path: &str,
        value: Value,
    ) -> CollaboratorResult<()> {
        let mut entities = self.entities.write().await;
        let snapshot = entities
            .get_mut(entity)
            .ok_or_else(|| CollaboratorError::NotFound(entity.to_string()))?;
        let (parent, leaf) = resolve_parent_mut(snapshot, path)
            .ok_or_else(|| CollaboratorError::NotFound(format!("{} on {}", path, entity)))?;
        parent.insert(leaf.to_string(), value);
        Ok(())
    }

    async fn exists(&self, entity_type: &str, entity_id: &str) -> CollaboratorResult<bool> {
        let key = EntityRef::new(entity_type, entity_id);
        Ok(self.entities.read().await.contains_key(&key))
    }

    async fn find(
        &self,
        entity_type: &str,
        filters: &Map<String, Value>,
    ) -> CollaboratorResult<Vec<EntityRef>> {
        let entities = self.entities.read().await;
        let mut matches: Vec<EntityRef> = entities
            .iter()
            .filter(|(entity, _)| entity.entity_type == entity_type)
            .filter(|(_, snapshot)| {
                filters.iter().all(|(path, expected)| {
                    resolve_path(snapshot, path).is_some_and(|v| values_equal(v, expected))
                })
            })
            .map(|(entity, _)| entity.clone())
            .collect();
        matches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(matches)
    }
}

/// An email handed to the outbox
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEmail {
    pub template: String,
    pub recipients: Vec<String>,
    pub data: Value,
}

#[derive(Default)]
struct OutboxContents {
    notifications: Vec<NotificationRequest>,
    tasks: Vec<(Uuid, TaskRequest)>,
    emails: Vec<OutboxEmail>,
}

/// Keeps every notification, task and email in memory instead of
/// delivering it
#[derive(Clone, Default)]
pub struct MemoryOutbox {
    contents: Arc<RwLock<OutboxContents>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<NotificationRequest> {
        self.contents.read().await.notifications.clone()
    }

    pub async fn tasks(&self) -> Vec<(Uuid, TaskRequest)> {
        self.contents.read().await.tasks.clone()
    }

    pub async fn emails(&self) -> Vec<OutboxEmail> {
        self.contents.read().await.emails.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryOutbox {
    async fn notify(&self, notification: NotificationRequest) -> CollaboratorResult<()> {
        self.contents.write().await.notifications.push(notification);
        Ok(())
    }
}

#[async_trait]
impl TaskSink for MemoryOutbox {
    async fn create_task(&self, task: TaskRequest) -> CollaboratorResult<Uuid> {
        let id = Uuid::new_v4();
        self.contents.write().await.tasks.push((id, task));
        Ok(id)
    }
}

#[async_trait]
impl EmailSink for MemoryOutbox {
    async fn send(&self, template: &str, recipients: &[String], data: &Value) -> CollaboratorResult<()> {
        self.contents.write().await.emails.push(OutboxEmail {
            template: template.to_string(),
            recipients: recipients.to_vec(),
            data: data.clone(),
        });
        Ok(())
    }
}

impl Collaborators {
    /// Everything in memory: entity snapshots, one outbox for all sinks and
    /// the given clock
    pub fn in_memory(entities: MemoryEntityStore, outbox: MemoryOutbox, clock: Arc<dyn Clock>) -> Self {
        Self {
            entities: Arc::new(entities),
            notifications: Arc::new(outbox.clone()),
            tasks: Arc::new(outbox.clone()),
            email: Arc::new(outbox),
            clock,
        }
    }
}
