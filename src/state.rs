//! Typed access to a resource's attribute bag.
//!
//! [`ResourceData`] wraps the JSON object the host sends for a resource. It
//! knows the persistent identifier, remembers the prior snapshot so handlers
//! can ask what changed, and collects warnings raised along the way.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::schema::Diagnostic;
use crate::types::ApplyResult;

/// Attribute bag for one resource instance.
#[derive(Debug, Clone, Default)]
pub struct ResourceData {
    values: Map<String, Value>,
    prior: Option<Map<String, Value>>,
    diagnostics: Vec<Diagnostic>,
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl ResourceData {
    /// Wrap a state or configuration object. Non-objects become empty.
    pub fn new(values: Value) -> Self {
        Self {
            values: into_map(values),
            prior: None,
            diagnostics: Vec::new(),
        }
    }

    /// Wrap planned values and remember `prior` for change detection.
    pub fn with_prior(planned: Value, prior: Value) -> Self {
        Self {
            values: into_map(planned),
            prior: Some(into_map(prior)),
            diagnostics: Vec::new(),
        }
    }

    /// Persistent identifier; empty when absent.
    pub fn id(&self) -> &str {
        self.get_str("id").unwrap_or("")
    }

    /// Record the server-assigned identifier.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.values.insert("id".into(), Value::String(id.into()));
    }

    /// Mark the resource as gone.
    pub fn clear_id(&mut self) {
        self.values.insert("id".into(), Value::String(String::new()));
    }

    /// Raw value of `key`; `null` counts as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    /// String value of `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// String value of `key`, or empty.
    pub fn get_string(&self, key: &str) -> String {
        self.get_str(key).unwrap_or_default().to_string()
    }

    /// Required non-empty string.
    pub fn require_str(&self, key: &str) -> Result<&str, ProviderError> {
        match self.get_str(key) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(ProviderError::Validation(format!(
                "attribute '{}' is required",
                key
            ))),
        }
    }

    /// Boolean value of `key`, `false` when absent.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Integer value of `key`.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Strings of a list attribute, in order.
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        string_items(self.get(key))
    }

    /// Strings of a set attribute.
    pub fn get_string_set(&self, key: &str) -> BTreeSet<String> {
        string_items(self.get(key)).into_iter().collect()
    }

    /// String map attribute.
    pub fn get_string_map(&self, key: &str) -> BTreeMap<String, String> {
        self.get(key)
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Single nested block; accepts both `{..}` and `[{..}]` encodings.
    pub fn get_block(&self, key: &str) -> Option<&Map<String, Value>> {
        match self.get(key)? {
            Value::Object(map) => Some(map),
            Value::Array(items) => items.first().and_then(Value::as_object),
            _ => None,
        }
    }

    /// Set `key` to `value`.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Set a string set attribute, sorted for stable state.
    pub fn set_string_set(&mut self, key: &str, items: impl IntoIterator<Item = String>) {
        let sorted: BTreeSet<String> = items.into_iter().collect();
        self.set(
            key,
            Value::Array(sorted.into_iter().map(Value::String).collect()),
        );
    }

    /// Remove `key`.
    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Prior value of `key`, if a prior snapshot exists.
    pub fn prior(&self, key: &str) -> Option<&Value> {
        self.prior
            .as_ref()
            .and_then(|p| p.get(key))
            .filter(|v| !v.is_null())
    }

    /// Prior string value of `key`.
    pub fn prior_str(&self, key: &str) -> Option<&str> {
        self.prior(key).and_then(Value::as_str)
    }

    /// Whether `key` differs from the prior snapshot. Without a prior
    /// snapshot every set attribute counts as changed.
    pub fn has_change(&self, key: &str) -> bool {
        let Some(prior) = &self.prior else {
            return self.get(key).is_some();
        };
        let before = prior.get(key).filter(|v| !v.is_null());
        // Order-sensitive; use `set_changes` for sets.
        normalise(before) != normalise(self.get(key))
    }

    /// Whether any of `keys` changed.
    pub fn has_changes(&self, keys: &[&str]) -> bool {
        keys.iter().any(|k| self.has_change(k))
    }

    /// `(added, removed)` members of a string set relative to the prior snapshot.
    pub fn set_changes(&self, key: &str) -> (Vec<String>, Vec<String>) {
        let before: BTreeSet<String> = string_items(self.prior(key)).into_iter().collect();
        let after = self.get_string_set(key);
        let added = after.difference(&before).cloned().collect();
        let removed = before.difference(&after).cloned().collect();
        (added, removed)
    }

    /// Record a warning.
    pub fn warn(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Warnings recorded so far.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// The attribute map.
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// State for the host: `Null` when the identifier is empty.
    pub fn into_state(self) -> Value {
        if self.id().is_empty() {
            Value::Null
        } else {
            Value::Object(self.values)
        }
    }

    /// State plus warnings.
    pub fn into_result(self) -> ApplyResult {
        let diagnostics = self.diagnostics.clone();
        ApplyResult::new(self.into_state()).with_diagnostics(diagnostics)
    }
}

fn normalise(value: Option<&Value>) -> Option<&Value> {
    match value {
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::Array(a)) if a.is_empty() => None,
        Some(Value::Object(o)) if o.is_empty() => None,
        other => other,
    }
}

fn string_items(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
