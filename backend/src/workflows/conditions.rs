// Workflow Conditions - Guard evaluation over entity snapshots
//
// Every function here is total: a path that cannot be walked, or operands that
// cannot be compared, evaluate to `false` instead of erroring.

use flowdesk_shared::{Condition, ConditionOperator};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Walk a dot-separated path. Objects are indexed by key, arrays by position.
pub fn resolve_path<'a>(snapshot: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(snapshot, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve the object holding the last segment of `path`, returning it with
/// the leaf key. `None` when the parent is missing or is not an object.
pub fn resolve_parent_mut<'a, 'p>(
    snapshot: &'a mut Value,
    path: &'p str,
) -> Option<(&'a mut Map<String, Value>, &'p str)> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };

    if leaf.is_empty() {
        return None;
    }

    let mut current = snapshot;
    if let Some(parent_path) = parent_path {
        for segment in parent_path.split('.') {
            current = match current {
                Value::Object(map) => map.get_mut(segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
    }

    match current {
        Value::Object(map) => Some((map, leaf)),
        _ => None,
    }
}

/// AND of all conditions. An empty list is unconditional.
pub fn evaluate(snapshot: &Value, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|condition| evaluate_condition(snapshot, condition))
}

pub fn evaluate_condition(snapshot: &Value, condition: &Condition) -> bool {
    let Some(field_value) = resolve_path(snapshot, &condition.field) else {
        return false;
    };
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => values_equal(field_value, expected),
        ConditionOperator::NotEquals => !values_equal(field_value, expected),
        ConditionOperator::Contains => contains(field_value, expected),
        ConditionOperator::NotContains => !contains(field_value, expected),
        ConditionOperator::GreaterThan => {
            matches!(compare_ordinal(field_value, expected), Some(Ordering::Greater))
        }
        ConditionOperator::LessThan => {
            matches!(compare_ordinal(field_value, expected), Some(Ordering::Less))
        }
        ConditionOperator::GreaterEqual => matches!(
            compare_ordinal(field_value, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::LessEqual => matches!(
            compare_ordinal(field_value, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ConditionOperator::IsEmpty => is_empty(field_value),
        ConditionOperator::IsNotEmpty => !is_empty(field_value),
    }
}

/// JSON equality, except that numbers compare by value (`5 == 5.0`)
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&text_of(needle)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        other => other.to_string().contains(&text_of(needle)),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numbers compare with numbers and strings with strings; anything else is
/// incomparable.
fn compare_ordinal(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ticket() -> Value {
        json!({
            "priority": "urgent",
            "hours_open": 12,
            "tags": ["vpn", "remote"],
            "assignee": null,
            "customer": {"tier": "gold", "contacts": [{"email": "ops@example.com"}]},
            "opened_on": "2026-03-01"
        })
    }

    #[test]
    fn test_resolve_nested_and_indexed_paths() {
        let snapshot = ticket();
        assert_eq!(resolve_path(&snapshot, "customer.tier"), Some(&json!("gold")));
        assert_eq!(
            resolve_path(&snapshot, "customer.contacts.0.email"),
            Some(&json!("ops@example.com"))
        );
        assert_eq!(resolve_path(&snapshot, "customer.contacts.3.email"), None);
        assert_eq!(resolve_path(&snapshot, "priority.level"), None);
        assert_eq!(resolve_path(&snapshot, "assignee"), Some(&Value::Null));
    }

    #[test]
    fn test_empty_condition_list_passes() {
        assert!(evaluate(&ticket(), &[]));
    }

    #[test]
    fn test_conditions_are_anded() {
        let snapshot = ticket();
        assert!(evaluate(
            &snapshot,
            &[
                Condition::equals("priority", "urgent"),
                Condition::greater_than("hours_open", 4),
            ]
        ));
        assert!(!evaluate(
            &snapshot,
            &[
                Condition::equals("priority", "urgent"),
                Condition::greater_than("hours_open", 48),
            ]
        ));
    }

    #[test]
    fn test_missing_field_fails_closed_for_every_operator() {
        let snapshot = ticket();
        for operator in [
            ConditionOperator::Equals,
            ConditionOperator::NotEquals,
            ConditionOperator::Contains,
            ConditionOperator::NotContains,
            ConditionOperator::GreaterThan,
            ConditionOperator::LessEqual,
            ConditionOperator::IsEmpty,
            ConditionOperator::IsNotEmpty,
        ] {
            let condition = Condition::new("customer.region", operator, json!("emea"));
            assert!(!evaluate_condition(&snapshot, &condition), "{:?}", operator);
        }
    }

    #[test]
    fn test_numeric_equality_ignores_representation() {
        let snapshot = json!({"amount": 5});
        assert!(evaluate_condition(&snapshot, &Condition::equals("amount", 5.0)));
        assert!(!evaluate_condition(&snapshot, &Condition::not_equals("amount", 5.0)));
    }

    #[test]
    fn test_contains_on_strings_arrays_and_objects() {
        let snapshot = ticket();
        assert!(evaluate_condition(&snapshot, &Condition::contains("priority", "urg")));
        assert!(evaluate_condition(&snapshot, &Condition::contains("tags", "vpn")));
        assert!(evaluate_condition(&snapshot, &Condition::contains("customer", "tier")));
        assert!(!evaluate_condition(&snapshot, &Condition::contains("tags", "printer")));
        assert!(evaluate_condition(
            &snapshot,
            &Condition::new("tags", ConditionOperator::NotContains, json!("printer"))
        ));
    }

    #[test]
    fn test_ordinal_type_mismatch_is_false_not_error() {
        let snapshot = ticket();
        // string field against numeric bound, both directions
        assert!(!evaluate_condition(&snapshot, &Condition::greater_than("priority", 3)));
        assert!(!evaluate_condition(&snapshot, &Condition::less_than("priority", 3)));
        assert!(!evaluate_condition(
            &snapshot,
            &Condition::new("hours_open", ConditionOperator::GreaterEqual, json!("10"))
        ));
    }

    #[test]
    fn test_ordinal_strings_compare_lexicographically() {
        let snapshot = ticket();
        assert!(evaluate_condition(&snapshot, &Condition::less_than("opened_on", "2026-04-01")));
        assert!(evaluate_condition(
            &snapshot,
            &Condition::new("opened_on", ConditionOperator::GreaterEqual, json!("2026-03-01"))
        ));
    }

    #[test]
    fn test_emptiness_follows_falsy_values() {
        let snapshot = json!({"assignee": null, "count": 0, "notes": "", "flag": false, "tags": ["a"]});
        assert!(evaluate_condition(&snapshot, &Condition::is_empty("assignee")));
        assert!(evaluate_condition(&snapshot, &Condition::is_empty("count")));
        assert!(evaluate_condition(&snapshot, &Condition::is_empty("notes")));
        assert!(evaluate_condition(&snapshot, &Condition::is_empty("flag")));
        assert!(evaluate_condition(&snapshot, &Condition::is_not_empty("tags")));
    }

    #[test]
    fn test_resolve_parent_mut() {
        let mut snapshot = ticket();
        let (parent, leaf) = resolve_parent_mut(&mut snapshot, "customer.tier").unwrap();
        assert_eq!(leaf, "tier");
        parent.insert(leaf.to_string(), json!("platinum"));
        assert_eq!(snapshot["customer"]["tier"], json!("platinum"));

        assert!(resolve_parent_mut(&mut snapshot, "status").is_some());
        assert!(resolve_parent_mut(&mut snapshot, "sla.deadline").is_none());
        assert!(resolve_parent_mut(&mut snapshot, "priority.level").is_none());
    }
}
