use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default UI color for workflow states.
pub const DEFAULT_STATE_COLOR: &str = "#6c757d";

/// Returned when a stored label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

// Status-like enums are stored as TEXT columns and travel as snake_case JSON.
macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

labelled_enum!(
    /// Lifecycle of a workflow definition
    WorkflowStatus, "workflow status" {
        Draft => "draft",
        Active => "active",
        Inactive => "inactive",
    }
);

labelled_enum!(
    /// Lifecycle of a running workflow instance
    InstanceStatus, "instance status" {
        Active => "active",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

labelled_enum!(
    /// Entity lifecycle moments a trigger can react to
    TriggerType, "trigger type" {
        OnCreate => "on_create",
        OnUpdate => "on_update",
        OnDelete => "on_delete",
        OnFieldChange => "on_field_change",
        Scheduled => "scheduled",
    }
);

labelled_enum!(
    ScheduleType, "schedule type" {
        Once => "once",
        Daily => "daily",
        Weekly => "weekly",
        Monthly => "monthly",
        Cron => "cron",
    }
);

labelled_enum!(
    ScheduleStatus, "schedule status" {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
);

impl InstanceStatus {
    /// Terminal instances accept no further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl ScheduleType {
    /// Fixed re-run interval for calendar schedules. `Once` never re-runs and
    /// `Cron` derives its next run from the expression.
    pub fn fixed_interval(&self) -> Option<Duration> {
        match self {
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::weeks(1)),
            Self::Monthly => Some(Duration::days(30)),
            Self::Once | Self::Cron => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once)
    }
}

/// Tagged reference to a domain entity owned by another module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Type tag in `app_label.Model` form, e.g. `service.ServiceTicket`
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.entity_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Visibility {
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub allowed_users: Vec<Uuid>,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub target_entity_type: String,
    #[serde(flatten)]
    pub visibility: Visibility,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Public workflows are visible to everyone; otherwise the user must be
    /// listed directly or hold one of the allowed roles.
    pub fn is_visible_to(&self, user_id: Option<Uuid>, roles: &[String]) -> bool {
        if self.visibility.is_public {
            return true;
        }
        if let Some(user_id) = user_id {
            if self.visibility.allowed_users.contains(&user_id) {
                return true;
            }
        }
        roles
            .iter()
            .any(|role| self.visibility.allowed_roles.contains(role))
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub description: String,
    pub is_initial: bool,
    pub is_final: bool,
    pub display_order: i32,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    IsEmpty,
    IsNotEmpty,
}

/// Guard clause evaluated against an entity snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot-separated path into the snapshot, e.g. `customer.tier`
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::Equals, value.into())
    }

    pub fn not_equals(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::NotEquals, value.into())
    }

    pub fn contains(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::Contains, value.into())
    }

    pub fn greater_than(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, value.into())
    }

    pub fn less_than(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::LessThan, value.into())
    }

    pub fn is_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsEmpty, Value::Null)
    }

    pub fn is_not_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsNotEmpty, Value::Null)
    }
}

fn default_notification_title() -> String {
    "Workflow Notification".to_string()
}

fn default_notification_message() -> String {
    "A workflow action has been triggered".to_string()
}

fn default_notification_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    #[serde(default = "default_notification_title")]
    pub title: String,
    #[serde(default = "default_notification_message")]
    pub message: String,
    #[serde(default = "default_notification_level")]
    pub level: String,
    #[serde(default)]
    pub link: String,
}

impl Default for NotificationContent {
    fn default() -> Self {
        Self {
            title: default_notification_title(),
            message: default_notification_message(),
            level: default_notification_level(),
            link: String::new(),
        }
    }
}

/// Side effect run when a transition fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    UpdateField {
        field: String,
        #[serde(default)]
        value: Value,
    },
    SendNotification {
        /// Recipient roles: `current_user`, `assignee`, `creator`, `manager`
        #[serde(default)]
        recipients: Vec<String>,
        #[serde(default)]
        data: NotificationContent,
    },
    CreateTask {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        assignee_id: Option<Uuid>,
        #[serde(default)]
        due_date: Option<NaiveDate>,
    },
    SendEmail {
        template: String,
        #[serde(default)]
        recipients: Vec<String>,
        #[serde(default)]
        data: Value,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpdateField { .. } => "update_field",
            Self::SendNotification { .. } => "send_notification",
            Self::CreateTask { .. } => "create_task",
            Self::SendEmail { .. } => "send_email",
        }
    }

    pub fn update_field(field: &str, value: impl Into<Value>) -> Self {
        Self::UpdateField {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn notify(recipients: &[&str], title: &str, message: &str) -> Self {
        Self::SendNotification {
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            data: NotificationContent {
                title: title.to_string(),
                message: message.to_string(),
                ..NotificationContent::default()
            },
        }
    }

    pub fn create_task(title: &str, assignee_id: Option<Uuid>) -> Self {
        Self::CreateTask {
            title: title.to_string(),
            description: String::new(),
            assignee_id,
            due_date: None,
        }
    }

    pub fn send_email(template: &str, recipients: &[&str], data: Value) -> Self {
        Self::SendEmail {
            template: template.to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub description: String,
    pub from_state_id: Uuid,
    pub to_state_id: Uuid,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    pub display_order: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_id: Uuid,
    #[serde(flatten)]
    pub entity: EntityRef,
    pub current_state_id: Option<Uuid>,
    pub status: InstanceStatus,
    pub started_by: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub data: Value,
    /// Bumped on every committed change; used for optimistic concurrency
    pub version: i64,
}

impl WorkflowInstance {
    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }
}

/// One realized transition. Append-only.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHistory {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub sequence: i64,
    pub from_state_id: Uuid,
    pub to_state_id: Uuid,
    pub transition_id: Uuid,
    pub triggered_by: Option<Uuid>,
    pub triggered_at: DateTime<Utc>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Only meaningful for `on_field_change`
    pub field_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleParameters {
    /// Equality filters on the target entities, keyed by dot path
    #[serde(default)]
    pub filters: serde_json::Map<String, Value>,
    /// Seed data for every instance the schedule starts
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledWorkflow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub description: String,
    pub schedule_type: ScheduleType,
    pub scheduled_date: DateTime<Utc>,
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub parameters: ScheduleParameters,
    pub status: ScheduleStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ScheduledWorkflow {
    /// `next_run` once the row has run, `scheduled_date` before that
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_run.unwrap_or(self.scheduled_date)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Pending && self.due_at() <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateState {
    /// Template-local key referenced by template transitions
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTransition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub display_order: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    #[serde(default)]
    pub states: Vec<TemplateState>,
    #[serde(default)]
    pub transitions: Vec<TemplateTransition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub category: String,
    pub target_entity_type: String,
    pub definition: TemplateDefinition,
    pub is_public: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub notification_type: String, // info, warning, error, success
    pub link: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_labels_round_trip_through_from_str() {
        assert_eq!("on_field_change".parse::<TriggerType>(), Ok(TriggerType::OnFieldChange));
        assert_eq!(ScheduleStatus::Cancelled.as_str(), "cancelled");
        let err = "archived".parse::<WorkflowStatus>().unwrap_err();
        assert_eq!(err.kind, "workflow status");
    }

    #[test]
    fn test_action_json_uses_type_tag() {
        let action: Action = serde_json::from_value(json!({
            "type": "send_notification",
            "recipients": ["assignee", "manager"],
            "data": {"title": "Escalated"}
        }))
        .unwrap();

        match action {
            Action::SendNotification { recipients, data } => {
                assert_eq!(recipients, vec!["assignee", "manager"]);
                assert_eq!(data.title, "Escalated");
                assert_eq!(data.message, "A workflow action has been triggered");
                assert_eq!(data.level, "info");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_condition_value_defaults_to_null() {
        let condition: Condition =
            serde_json::from_value(json!({"field": "assignee", "operator": "is_empty"})).unwrap();
        assert_eq!(condition.operator, ConditionOperator::IsEmpty);
        assert_eq!(condition.value, Value::Null);
    }

    #[test]
    fn test_schedule_intervals() {
        assert_eq!(ScheduleType::Daily.fixed_interval(), Some(Duration::days(1)));
        assert_eq!(ScheduleType::Monthly.fixed_interval(), Some(Duration::days(30)));
        assert_eq!(ScheduleType::Once.fixed_interval(), None);
        assert!(!ScheduleType::Once.is_recurring());
        assert!(ScheduleType::Cron.is_recurring());
    }

    #[test]
    fn test_workflow_visibility() {
        let member = Uuid::new_v4();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            name: "Leave Approval".to_string(),
            description: String::new(),
            status: WorkflowStatus::Active,
            target_entity_type: "hr.LeaveRequest".to_string(),
            visibility: Visibility {
                is_public: false,
                allowed_users: vec![member],
                allowed_roles: vec!["hr_manager".to_string()],
            },
            created_by: None,
            created_at: Utc::now(),
            updated_at: None,
        };

        assert!(workflow.is_visible_to(Some(member), &[]));
        assert!(workflow.is_visible_to(None, &["hr_manager".to_string()]));
        assert!(!workflow.is_visible_to(Some(Uuid::new_v4()), &["sales".to_string()]));
    }
}
