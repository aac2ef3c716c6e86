//! Results handed back to the host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Diagnostic;

/// One attribute that a plan would change. `before` is absent on create,
/// `after` on removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Dotted attribute path.
    pub path: String,
    /// Prior value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    /// Planned value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl AttributeChange {
    /// Change of `path` from `before` to `after`.
    pub fn new(path: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }

    /// `path` appears with `value`.
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// `path` disappears.
    pub fn removed(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, Some(value), None)
    }
}

/// Planned state plus what changes to get there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// State after apply; computed values not yet known are null.
    pub planned_state: Value,
    /// Attribute-level changes.
    pub changes: Vec<AttributeChange>,
    /// The object must be destroyed and created again.
    pub requires_replace: bool,
}

impl PlanResult {
    /// Nothing to do; `state` is kept as is.
    pub fn no_change(state: Value) -> Self {
        Self::with_changes(state, Vec::new(), false)
    }

    /// Plan that moves to `planned_state`.
    pub fn with_changes(
        planned_state: Value,
        changes: Vec<AttributeChange>,
        requires_replace: bool,
    ) -> Self {
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }

    /// Whether apply would do anything.
    pub fn has_changes(&self) -> bool {
        self.requires_replace || !self.changes.is_empty()
    }
}

/// Outcome of create, read or update.
///
/// A `Null` state means the object is gone and the host must forget it.
/// Warnings collected while applying travel in `diagnostics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// State to store.
    pub state: Value,
    /// Warnings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl ApplyResult {
    /// `state` without warnings.
    pub fn new(state: Value) -> Self {
        Self {
            state,
            diagnostics: Vec::new(),
        }
    }

    /// The object no longer exists.
    pub fn gone() -> Self {
        Self::new(Value::Null)
    }

    /// Append `diagnostics`.
    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }

    /// Whether the host should drop the resource.
    pub fn is_gone(&self) -> bool {
        self.state.is_null()
    }
}

/// State recovered from an import id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// Type name, e.g. `hsdp_cdr_org`.
    pub resource_type: String,
    /// State as read from the server.
    pub state: Value,
}

impl ImportedResource {
    /// Pair `state` with its type name.
    pub fn new(resource_type: impl Into<String>, state: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Type names in the catalog, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Resource type names.
    pub resources: Vec<String>,
    /// Data source type names.
    pub data_sources: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_encoding_omits_missing_side() {
        let encoded = serde_json::to_value(AttributeChange::added("name", json!("ward"))).unwrap();
        assert_eq!(encoded, json!({"path": "name", "after": "ward"}));

        let removed = AttributeChange::removed("id", json!("r-1"));
        assert_eq!(removed.before, Some(json!("r-1")));
        assert!(removed.after.is_none());
    }

    #[test]
    fn test_replace_counts_as_change() {
        assert!(!PlanResult::no_change(json!({"id": "1"})).has_changes());
        assert!(PlanResult::with_changes(json!({"id": "1"}), vec![], true).has_changes());
    }

    #[test]
    fn test_apply_result_warnings() {
        assert!(ApplyResult::gone().is_gone());

        let ok = ApplyResult::new(json!({"id": "r-1"}))
            .with_diagnostics(vec![Diagnostic::warning("permission X not found")]);
        assert!(!ok.is_gone());
        assert_eq!(ok.diagnostics.len(), 1);

        let encoded = serde_json::to_value(ApplyResult::new(json!({"id": "r-1"}))).unwrap();
        assert!(encoded.get("diagnostics").is_none());
    }
}
