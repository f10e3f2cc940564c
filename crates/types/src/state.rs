//! State entries and the filters used to list them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// One stored value, addressed by group and key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub group_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: Value,
}

impl StateEntry {
    pub fn new(group_id: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            group_id: group_id.into(),
            key: key.into(),
            value_type: value_type_name(&value).to_string(),
            value,
        }
    }
}

/// JSON type name of a value, as reported to inspection tooling.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperation {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
}

/// Predicate over one (possibly nested) field of an entry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFilter {
    /// Dotted path into the value; empty selects the value itself.
    #[serde(default)]
    pub value_key: String,
    pub operation: FilterOperation,
    #[serde(default)]
    pub value: Value,
}

impl StateFilter {
    pub fn new(value_key: impl Into<String>, operation: FilterOperation, value: Value) -> Self {
        Self {
            value_key: value_key.into(),
            operation,
            value,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        let field = select_path(value, &self.value_key);
        match self.operation {
            FilterOperation::IsNull => field.is_none_or(Value::is_null),
            FilterOperation::IsNotNull => field.is_some_and(|field| !field.is_null()),
            FilterOperation::Eq => field.is_some_and(|field| loosely_equal(field, &self.value)),
            FilterOperation::Neq => !field.is_some_and(|field| loosely_equal(field, &self.value)),
            FilterOperation::Gt => compare(field, &self.value) == Some(Ordering::Greater),
            FilterOperation::Gte => matches!(compare(field, &self.value), Some(Ordering::Greater | Ordering::Equal)),
            FilterOperation::Lt => compare(field, &self.value) == Some(Ordering::Less),
            FilterOperation::Lte => matches!(compare(field, &self.value), Some(Ordering::Less | Ordering::Equal)),
            FilterOperation::Contains => field.is_some_and(|field| contains(field, &self.value)),
            FilterOperation::NotContains => !field.is_some_and(|field| contains(field, &self.value)),
            FilterOperation::StartsWith => text_pair(field, &self.value).is_some_and(|(field, needle)| field.starts_with(needle)),
            FilterOperation::EndsWith => text_pair(field, &self.value).is_some_and(|(field, needle)| field.ends_with(needle)),
        }
    }
}

/// Listing scope for `items`: optional group plus a conjunction of filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<StateFilter>>,
}

impl ItemsQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: StateFilter) -> Self {
        self.filter.get_or_insert_with(Vec::new).push(filter);
        self
    }

    pub fn matches(&self, entry: &StateEntry) -> bool {
        if let Some(group_id) = &self.group_id
            && group_id != &entry.group_id
        {
            return false;
        }
        self.filter
            .as_deref()
            .unwrap_or_default()
            .iter()
            .all(|filter| filter.matches(&entry.value))
    }
}

fn select_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

fn loosely_equal(field: &Value, expected: &Value) -> bool {
    match (field, expected) {
        (Value::Number(left), Value::Number(right)) => left.as_f64() == right.as_f64(),
        (Value::Number(number), Value::String(text)) | (Value::String(text), Value::Number(number)) => {
            text.parse::<f64>().ok() == number.as_f64()
        }
        _ => field == expected,
    }
}

fn compare(field: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let field = field?;
    match (field.as_f64(), expected.as_f64()) {
        (Some(left), Some(right)) => left.partial_cmp(&right),
        _ => match (field.as_str(), expected.as_str()) {
            (Some(left), Some(right)) => Some(left.cmp(right)),
            _ => None,
        },
    }
}

fn contains(field: &Value, needle: &Value) -> bool {
    match field {
        Value::String(text) => needle.as_str().is_some_and(|needle| text.contains(needle)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn text_pair<'a>(field: Option<&'a Value>, needle: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((field?.as_str()?, needle.as_str()?))
}
