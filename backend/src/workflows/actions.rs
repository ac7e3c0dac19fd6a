// Workflow Actions - Recipient resolution, placeholder rendering and effect reporting

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::debug;
use uuid::Uuid;

use super::conditions::resolve_path;

/// Entity type under which users are stored
pub const USER_ENTITY_TYPE: &str = "core.User";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern compiles"));

/// Named recipient an action can address, resolved against the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientRole {
    CurrentUser,
    Assignee,
    Creator,
    Manager,
}

impl FromStr for RecipientRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current_user" => Ok(Self::CurrentUser),
            "assignee" => Ok(Self::Assignee),
            "creator" => Ok(Self::Creator),
            "manager" => Ok(Self::Manager),
            _ => Err(()),
        }
    }
}

impl RecipientRole {
    pub fn resolve(&self, snapshot: &Value, actor: Option<Uuid>) -> Option<Uuid> {
        match self {
            Self::CurrentUser => actor,
            Self::Assignee => user_reference(snapshot.get("assignee")?),
            Self::Creator => user_reference(snapshot.get("created_by")?),
            Self::Manager => user_reference(snapshot.get("manager")?),
        }
    }
}

/// A user is referenced either by its id or by an embedded `{"id": ...}` object
fn user_reference(value: &Value) -> Option<Uuid> {
    match value {
        Value::String(s) => Uuid::parse_str(s).ok(),
        Value::Object(map) => map.get("id").and_then(user_reference),
        _ => None,
    }
}

/// Resolve role names to distinct user ids, keeping declaration order.
/// Unknown or unresolvable roles are skipped.
pub fn resolve_recipients(roles: &[String], snapshot: &Value, actor: Option<Uuid>) -> Vec<Uuid> {
    let mut users = Vec::new();
    for role in roles {
        let resolved = role
            .parse::<RecipientRole>()
            .ok()
            .and_then(|r| r.resolve(snapshot, actor));
        match resolved {
            Some(user) if !users.contains(&user) => users.push(user),
            Some(_) => {}
            None => debug!("Skipping unresolvable recipient '{}'", role),
        }
    }
    users
}

/// Replace `{{path}}` placeholders with snapshot values. Unresolved
/// placeholders are left untouched.
pub fn render(template: &str, snapshot: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match resolve_path(snapshot, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Render every string nested inside a JSON value
pub fn render_value(value: &Value, snapshot: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, snapshot)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, snapshot)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, snapshot)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// What one action did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectResult {
    pub kind: &'static str,
    /// Deliveries or writes that succeeded
    pub delivered: usize,
    /// Deliveries that failed and were logged
    pub failed: usize,
    pub output: Option<Value>,
}

impl EffectResult {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            delivered: 0,
            failed: 0,
            output: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}
