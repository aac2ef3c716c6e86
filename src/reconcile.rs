//! The contract every resource and data source implements.
//!
//! A [`Resource`] handler gets a [`ResourceData`] and an [`OpContext`] and
//! mutates the data in place: `create` sets the identifier, `read` refreshes
//! server-owned attributes (or clears the identifier when the object is gone),
//! `update` touches only changed fields and `delete` clears the identifier.
//!
//! [`plan_resource`] turns a prior/proposed pair into a [`PlanResult`] using
//! the schema's flags and diff-suppression rules.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::diff::suppressed_by;
use crate::error::ProviderError;
use crate::poll::WaitFor;
use crate::registry::ClientRegistry;
use crate::schema::{Attribute, NestedBlock, Schema};
use crate::state::ResourceData;
use crate::types::{AttributeChange, PlanResult};

/// A string that is not a Go-style duration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid duration '{0}'")]
pub struct DurationError(pub String);

/// Parse a Go-style duration such as `"15m"`, `"1h30m"` or `"1.5s"`.
pub fn parse_duration(text: &str) -> Result<Duration, DurationError> {
    let err = || DurationError(text.to_string());
    let trimmed = text.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    if trimmed.is_empty() {
        return Err(err());
    }

    let mut total = 0f64;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(err)?;
        if number_len == 0 {
            return Err(err());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| err())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(err()),
        };
        total += number * seconds;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_secs_f64(total))
}

/// Default create/update/delete timeouts of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Create timeout.
    pub create: Duration,
    /// Update timeout.
    pub update: Duration,
    /// Delete timeout.
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::minutes(10, 10, 20)
    }
}

impl Timeouts {
    /// Timeouts given in minutes.
    pub const fn minutes(create: u64, update: u64, delete: u64) -> Self {
        Self {
            create: Duration::from_secs(create * 60),
            update: Duration::from_secs(update * 60),
            delete: Duration::from_secs(delete * 60),
        }
    }

    /// Apply overrides from the resource's `timeouts` block.
    pub fn resolve(self, data: &ResourceData) -> Result<Self, ProviderError> {
        let Some(block) = data.get_block("timeouts") else {
            return Ok(self);
        };
        let pick = |key: &str, fallback: Duration| -> Result<Duration, ProviderError> {
            match block.get(key).and_then(Value::as_str) {
                Some(text) if !text.is_empty() => parse_duration(text)
                    .map_err(|e| ProviderError::Validation(format!("timeouts.{}: {}", key, e))),
                _ => Ok(fallback),
            }
        };
        Ok(Self {
            create: pick("create", self.create)?,
            update: pick("update", self.update)?,
            delete: pick("delete", self.delete)?,
        })
    }
}

/// Everything a handler needs besides its own data.
#[derive(Clone)]
pub struct OpContext {
    /// Shared, lazily built API clients.
    pub registry: Arc<ClientRegistry>,
    /// The host's cancellation for this call.
    pub cancel: CancellationToken,
    /// Deadline budget for the current operation.
    pub timeout: Duration,
}

impl OpContext {
    /// Context for one operation.
    pub fn new(registry: Arc<ClientRegistry>, cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            registry,
            cancel,
            timeout,
        }
    }

    /// A waiter bounded by this operation's budget. A provider-wide poll
    /// interval replaces both `interval` and `delay`.
    pub fn wait_for(
        &self,
        pending: &[&str],
        target: &[&str],
        interval: Duration,
        delay: Duration,
    ) -> WaitFor {
        let (interval, delay) = match self.registry.config().poll_interval {
            Some(fixed) => (fixed, Duration::ZERO),
            None => (interval, delay),
        };
        WaitFor::new(pending, target)
            .poll_interval(interval)
            .delay(delay)
            .timeout(self.timeout)
    }
}

/// A managed resource type.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Type name, e.g. `hsdp_iam_org`.
    fn type_name(&self) -> &'static str;

    /// Attribute schema.
    fn schema(&self) -> Schema;

    /// Default timeouts; overridable per instance via the `timeouts` block.
    fn timeouts(&self) -> Timeouts {
        Timeouts::default()
    }

    /// Create the server object and record its identifier.
    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError>;

    /// Refresh server-owned attributes. Clear the identifier when gone.
    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError>;

    /// Apply changed mutable fields. `data` carries the prior snapshot.
    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError>;

    /// Delete the server object. Absent objects are not an error.
    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError>;

    /// Turn an operator-supplied import string into the attributes `read` needs.
    fn import(&self, id: &str) -> Result<Value, ProviderError> {
        if id.is_empty() {
            return Err(ProviderError::Validation("import id must not be empty".into()));
        }
        Ok(json!({ "id": id }))
    }

    /// Rewrite state stored under an older schema version.
    fn upgrade_state(&self, version: u64, state: Value) -> Result<Value, ProviderError> {
        let _ = version;
        Ok(state)
    }
}

/// A read-only data source.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Type name, e.g. `hsdp_config`.
    fn type_name(&self) -> &'static str;

    /// Attribute schema.
    fn schema(&self) -> Schema;

    /// Fill computed attributes from the upstream.
    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError>;
}

fn present(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::Array(a)) if a.is_empty() => None,
        Some(Value::Object(o)) if o.is_empty() => None,
        other => other,
    }
}

fn sorted_items(value: &Value) -> Vec<String> {
    let mut items: Vec<String> = value
        .as_array()
        .map(|a| a.iter().map(Value::to_string).collect())
        .unwrap_or_default();
    items.sort();
    items.dedup();
    items
}

fn same_value(prior: Option<&Value>, proposed: Option<&Value>, as_set: bool) -> bool {
    match (present(prior), present(proposed)) {
        (None, None) => true,
        (Some(a), Some(b)) if as_set => sorted_items(a) == sorted_items(b),
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn single(value: Option<&Value>) -> Option<&Value> {
    match value {
        Some(Value::Array(items)) if items.len() == 1 => items.first(),
        other => other,
    }
}

fn attribute_unchanged(name: &str, attr: &Attribute, prior: Option<&Value>, proposed: Option<&Value>) -> bool {
    if same_value(prior, proposed, attr.attr_type.is_set()) {
        return true;
    }
    if attr.diff_suppress.is_empty() {
        return false;
    }
    let null = Value::Null;
    suppressed_by(
        &attr.diff_suppress,
        name,
        prior.unwrap_or(&null),
        proposed.unwrap_or(&null),
    )
}

fn block_unchanged(block: &NestedBlock, prior: Option<&Value>, proposed: Option<&Value>) -> bool {
    use crate::schema::BlockNestingMode;
    match block.nesting_mode {
        BlockNestingMode::Single => same_value(single(prior), single(proposed), false),
        BlockNestingMode::List => same_value(prior, proposed, false),
    }
}

/// Plan the change from `prior` to `proposed`.
///
/// Computed-only attributes carry their prior value (or stay unknown on
/// create). Optional+computed attributes left unset keep the prior value.
/// Suppressed differences keep the prior value so no update is planned.
/// Changes to `force_new` attributes or blocks require replacement. The
/// `timeouts` block never counts as a change.
pub fn plan_resource(schema: &Schema, prior: Option<&Value>, proposed: &Value) -> PlanResult {
    let proposed_map = proposed.as_object().cloned().unwrap_or_default();
    let prior_map = match prior {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    };

    let mut planned: Map<String, Value> = proposed_map.clone();

    let Some(prior_map) = prior_map else {
        let mut changes = Vec::new();
        for (name, attr) in &schema.block.attributes {
            if attr.flags.is_computed_only() {
                planned.insert(name.clone(), Value::Null);
                continue;
            }
            if present(proposed_map.get(name)).is_none() {
                if let Some(default) = &attr.default {
                    planned.insert(name.clone(), default.clone());
                }
            }
            if let Some(value) = present(planned.get(name)) {
                changes.push(AttributeChange::added(name.clone(), value.clone()));
            }
        }
        for name in schema.block.blocks.keys() {
            if name == "timeouts" {
                continue;
            }
            if let Some(value) = present(planned.get(name)) {
                changes.push(AttributeChange::added(name.clone(), value.clone()));
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        return PlanResult::with_changes(Value::Object(planned), changes, false);
    };

    let mut changes = Vec::new();
    let mut requires_replace = false;

    for (name, attr) in &schema.block.attributes {
        let before = prior_map.get(name);
        let after = proposed_map.get(name);

        if attr.flags.is_computed_only() {
            planned.insert(name.clone(), before.cloned().unwrap_or(Value::Null));
            continue;
        }
        if attr.flags.computed && present(after).is_none() {
            planned.insert(name.clone(), before.cloned().unwrap_or(Value::Null));
            continue;
        }
        let after = match (present(after), &attr.default) {
            (None, Some(default)) => {
                planned.insert(name.clone(), default.clone());
                Some(default)
            },
            _ => after,
        };
        if attribute_unchanged(name, attr, before, after) {
            if let Some(before) = before {
                planned.insert(name.clone(), before.clone());
            }
            continue;
        }
        if attr.force_new {
            requires_replace = true;
        }
        changes.push(AttributeChange::new(
            name.clone(),
            present(before).cloned(),
            present(after).cloned(),
        ));
    }

    for (name, block) in &schema.block.blocks {
        let before = prior_map.get(name);
        let after = proposed_map.get(name);
        if name == "timeouts" || block_unchanged(block, before, after) {
            continue;
        }
        if block.force_new {
            requires_replace = true;
        }
        changes.push(AttributeChange::new(
            name.clone(),
            present(before).cloned(),
            present(after).cloned(),
        ));
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    if changes.is_empty() {
        PlanResult::no_change(Value::Object(planned))
    } else {
        PlanResult::with_changes(Value::Object(planned), changes, requires_replace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffSuppress;
    use crate::schema::Block;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("15").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn test_timeouts_resolve() {
        let data = ResourceData::new(json!({"timeouts": {"create": "12m", "delete": ""}}));
        let resolved = Timeouts::default().resolve(&data).unwrap();
        assert_eq!(resolved.create, Duration::from_secs(720));
        assert_eq!(resolved.update, Duration::from_secs(600));
        assert_eq!(resolved.delete, Duration::from_secs(1200));

        let bad = ResourceData::new(json!({"timeouts": [{"update": "later"}]}));
        assert!(Timeouts::default().resolve(&bad).is_err());
    }

    fn schema() -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("description", Attribute::optional_string())
            .with_attribute(
                "parent",
                Attribute::optional_string().with_diff_suppress(DiffSuppress::CaseInsensitive),
            )
            .with_attribute("type", Attribute::optional_computed_string())
            .with_attribute("scopes", Attribute::optional_string_set())
            .with_attribute(
                "enabled",
                Attribute::optional_bool().with_default(Value::Bool(true)),
            )
            .with_block(
                "channel",
                NestedBlock::single(
                    Block::new().with_attribute("endpoint", Attribute::required_string()),
                ),
            )
            .with_timeouts()
    }

    #[test]
    fn test_plan_create() {
        let plan = plan_resource(&schema(), None, &json!({"name": "ACC-abc"}));
        assert!(plan.planned_state["id"].is_null());
        assert_eq!(plan.planned_state["enabled"], json!(true));
        let paths: Vec<&str> = plan.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["enabled", "name"]);
        assert!(!plan.requires_replace);
    }

    #[test]
    fn test_plan_no_change_with_suppression_and_sets() {
        let prior = json!({
            "id": "org-1",
            "name": "ACC-abc",
            "parent": "ORG-1",
            "type": "Hospital",
            "scopes": ["a", "b"],
            "enabled": true,
            "channel": [{"endpoint": "https://x"}],
            "timeouts": {"create": "5m"}
        });
        let proposed = json!({
            "name": "ACC-abc",
            "parent": "org-1",
            "scopes": ["b", "a"],
            "channel": {"endpoint": "https://x"},
            "timeouts": {"create": "7m"}
        });
        let plan = plan_resource(&schema(), Some(&prior), &proposed);
        assert!(!plan.has_changes(), "{:?}", plan.changes);
        assert_eq!(plan.planned_state["id"], "org-1");
        assert_eq!(plan.planned_state["type"], "Hospital");
        assert_eq!(plan.planned_state["parent"], "ORG-1");
    }

    #[test]
    fn test_plan_update_and_replace() {
        let prior = json!({"id": "1", "name": "a", "description": "old", "enabled": true});
        let plan = plan_resource(
            &schema(),
            Some(&prior),
            &json!({"name": "a", "description": "new"}),
        );
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].path, "description");
        assert!(!plan.requires_replace);

        let plan = plan_resource(&schema(), Some(&prior), &json!({"name": "b", "description": "old"}));
        assert!(plan.requires_replace);
    }

    #[test]
    fn test_plan_empty_and_absent_are_equal() {
        let prior = json!({"id": "1", "name": "a", "description": "", "scopes": [], "enabled": true});
        let plan = plan_resource(&schema(), Some(&prior), &json!({"name": "a"}));
        assert!(!plan.has_changes());
    }
}
