//! Attribute schemas for the provider configuration, resources and data sources.
//!
//! Besides a type and usage flags, an [`Attribute`] carries what the planner
//! and validator need to know about it: replacement on change, defaults,
//! diff-suppression rules, a closed value set and conflicting attributes.
//! Maps are ordered so serialized schemas are stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::DiffSuppress;

/// Value type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// UTF-8 string.
    String,
    /// Signed 64-bit integer.
    Int64,
    /// `true` / `false`.
    Bool,
    /// Ordered elements.
    List(Box<AttributeType>),
    /// Unordered, duplicate-free elements.
    Set(Box<AttributeType>),
    /// String keys to values.
    Map(Box<AttributeType>),
}

impl AttributeType {
    /// `list(element)`.
    pub fn list(element: AttributeType) -> Self {
        Self::List(Box::new(element))
    }

    /// `set(element)`.
    pub fn set(element: AttributeType) -> Self {
        Self::Set(Box::new(element))
    }

    /// `map(element)`.
    pub fn map(element: AttributeType) -> Self {
        Self::Map(Box::new(element))
    }

    /// Whether values compare without regard to order.
    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }
}

/// Who supplies the value, and whether it is secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributeFlags {
    /// The user must set it.
    pub required: bool,
    /// The user may set it.
    pub optional: bool,
    /// The server fills it in.
    pub computed: bool,
    /// Never shown in plans or logs.
    pub sensitive: bool,
}

impl AttributeFlags {
    const NONE: Self = Self {
        required: false,
        optional: false,
        computed: false,
        sensitive: false,
    };

    /// User-supplied, mandatory.
    pub const fn required() -> Self {
        Self {
            required: true,
            ..Self::NONE
        }
    }

    /// User-supplied, may be absent.
    pub const fn optional() -> Self {
        Self {
            optional: true,
            ..Self::NONE
        }
    }

    /// Server-supplied only.
    pub const fn computed() -> Self {
        Self {
            computed: true,
            ..Self::NONE
        }
    }

    /// User may set it; otherwise the server picks.
    pub const fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Self::NONE
        }
    }

    /// Server-supplied and never set by the user.
    pub fn is_computed_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }
}

/// One attribute of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Value type.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Usage flags.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Shown in documentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// A change replaces the resource.
    #[serde(default)]
    pub force_new: bool,
    /// Value planned when the user leaves it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Stored/desired pairs any of these rules consider equal plan no change.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff_suppress: Vec<DiffSuppress>,
    /// Accepted values; empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,
    /// Attributes that must not be set together with this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<String>,
}

impl Attribute {
    /// Attribute of `attr_type` with `flags` and nothing else.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
            diff_suppress: Vec::new(),
            allowed_values: Vec::new(),
            conflicts_with: Vec::new(),
        }
    }

    fn strings(collection: fn(AttributeType) -> AttributeType, flags: AttributeFlags) -> Self {
        Self::new(collection(AttributeType::String), flags)
    }

    /// Mandatory string.
    pub fn required_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::required())
    }

    /// Optional string.
    pub fn optional_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::optional())
    }

    /// Server-assigned string.
    pub fn computed_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::computed())
    }

    /// Optional string the server fills in when absent.
    pub fn optional_computed_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::optional_computed())
    }

    /// Mandatory integer.
    pub fn required_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::required())
    }

    /// Optional integer.
    pub fn optional_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::optional())
    }

    /// Server-assigned integer.
    pub fn computed_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::computed())
    }

    /// Optional flag.
    pub fn optional_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::optional())
    }

    /// Server-assigned flag.
    pub fn computed_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::computed())
    }

    /// Optional `set(string)`.
    pub fn optional_string_set() -> Self {
        Self::strings(AttributeType::set, AttributeFlags::optional())
    }

    /// Mandatory `set(string)`.
    pub fn required_string_set() -> Self {
        Self::strings(AttributeType::set, AttributeFlags::required())
    }

    /// Server-assigned `set(string)`.
    pub fn computed_string_set() -> Self {
        Self::strings(AttributeType::set, AttributeFlags::computed())
    }

    /// Optional `list(string)`.
    pub fn optional_string_list() -> Self {
        Self::strings(AttributeType::list, AttributeFlags::optional())
    }

    /// Server-assigned `list(string)`.
    pub fn computed_string_list() -> Self {
        Self::strings(AttributeType::list, AttributeFlags::computed())
    }

    /// Optional `map(string)`.
    pub fn optional_string_map() -> Self {
        Self::strings(AttributeType::map, AttributeFlags::optional())
    }

    /// Documentation text.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Changing the value replaces the resource.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Planned value when unset.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Hide the value.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }

    /// Add a diff-suppression rule. Rules combine as any-of.
    pub fn with_diff_suppress(mut self, rule: DiffSuppress) -> Self {
        self.diff_suppress.push(rule);
        self
    }

    /// Accept only these strings.
    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = values.into_iter().map(|v| Value::String(v.into())).collect();
        self
    }

    /// Reject configurations that also set `other`.
    pub fn conflicts_with(mut self, other: impl Into<String>) -> Self {
        self.conflicts_with.push(other.into());
        self
    }
}

/// How a nested block repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockNestingMode {
    /// At most one; stored as a one-element list or a bare object.
    #[default]
    Single,
    /// Ordered repetitions.
    List,
}

/// Attributes and nested blocks at one level.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    /// Attributes by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Attribute>,
    /// Nested blocks by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blocks: BTreeMap<String, NestedBlock>,
}

impl Block {
    /// Empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `attr` as `name`.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Add `block` as `name`.
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.blocks.insert(name.into(), block);
        self
    }
}

/// A block nested under a name, with its repetition rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedBlock {
    /// Contents.
    #[serde(flatten)]
    pub block: Block,
    /// Single or list.
    #[serde(default)]
    pub nesting_mode: BlockNestingMode,
    /// Fewest items accepted.
    #[serde(default)]
    pub min_items: u32,
    /// Most items accepted; 0 means no limit.
    #[serde(default)]
    pub max_items: u32,
    /// Any change inside replaces the resource.
    #[serde(default)]
    pub force_new: bool,
}

impl NestedBlock {
    fn of(block: Block, nesting_mode: BlockNestingMode, max_items: u32) -> Self {
        Self {
            block,
            nesting_mode,
            min_items: 0,
            max_items,
            force_new: false,
        }
    }

    /// Zero or one `block`.
    pub fn single(block: Block) -> Self {
        Self::of(block, BlockNestingMode::Single, 1)
    }

    /// Any number of `block`, in order.
    pub fn list(block: Block) -> Self {
        Self::of(block, BlockNestingMode::List, 0)
    }

    /// Require at least `min` items.
    pub fn with_min_items(mut self, min: u32) -> Self {
        self.min_items = min;
        self
    }

    /// Accept at most `max` items.
    pub fn with_max_items(mut self, max: u32) -> Self {
        self.max_items = max;
        self
    }

    /// Any change inside this block replaces the resource.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }
}

/// Versioned schema of one resource or data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Bumped whenever stored state needs an upgrade.
    #[serde(default)]
    pub version: u64,
    /// Top-level attributes and blocks.
    #[serde(flatten)]
    pub block: Block,
}

impl Schema {
    /// Empty schema at `version`.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            block: Block::new(),
        }
    }

    /// Empty schema at version 0.
    pub fn v0() -> Self {
        Self::new(0)
    }

    /// Add a top-level attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.block = self.block.with_attribute(name, attr);
        self
    }

    /// Add a top-level block.
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.block = self.block.with_block(name, block);
        self
    }

    /// Add the computed `id` every resource carries.
    pub fn with_id(self) -> Self {
        self.with_attribute(
            "id",
            Attribute::computed_string().with_description("Server-assigned identifier"),
        )
    }

    /// Add the optional `timeouts` block with `create`, `update` and `delete` durations.
    pub fn with_timeouts(self) -> Self {
        let timeouts = ["create", "update", "delete"]
            .into_iter()
            .fold(Block::new(), |block, op| {
                block.with_attribute(op, Attribute::optional_string())
            });
        self.with_block("timeouts", NestedBlock::single(timeouts))
    }

    /// Top-level attribute `name`.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.block.attributes.get(name)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::v0()
    }
}

/// Everything the provider declares: its own configuration plus every
/// resource and data source type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderSchema {
    /// Provider configuration.
    #[serde(default)]
    pub provider: Schema,
    /// Resource schemas by type name.
    #[serde(default)]
    pub resources: BTreeMap<String, Schema>,
    /// Data source schemas by type name.
    #[serde(default)]
    pub data_sources: BTreeMap<String, Schema>,
}

impl ProviderSchema {
    /// No configuration, resources or data sources yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `schema` for the provider configuration.
    pub fn with_provider_config(mut self, schema: Schema) -> Self {
        self.provider = schema;
        self
    }

    /// Register resource type `name`.
    pub fn with_resource(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.resources.insert(name.into(), schema);
        self
    }

    /// Register data source type `name`.
    pub fn with_data_source(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.data_sources.insert(name.into(), schema);
        self
    }
}

/// Severity of a [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// The operation failed.
    Error,
    /// The operation went through; the user should look at this.
    Warning,
}

/// A message for the user, optionally pinned to an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Error or warning.
    pub severity: DiagnosticSeverity,
    /// One line.
    pub summary: String,
    /// Longer explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Attribute path, e.g. `permissions` or `backend.0.token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    fn of(severity: DiagnosticSeverity, summary: impl Into<String>) -> Self {
        Self {
            severity,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self::of(DiagnosticSeverity::Error, summary)
    }

    /// Warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self::of(DiagnosticSeverity::Warning, summary)
    }

    /// Attach an explanation.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Pin to `attribute`.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Whether the diagnostic fails the operation.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flags() {
        assert!(AttributeFlags::computed().is_computed_only());
        let oc = AttributeFlags::optional_computed();
        assert!(oc.optional && oc.computed);
        assert!(!oc.is_computed_only());
        assert!(!AttributeFlags::required().optional);
    }

    #[test]
    fn test_collection_constructors() {
        assert_eq!(
            Attribute::computed_string_list().attr_type,
            AttributeType::list(AttributeType::String)
        );
        assert!(Attribute::required_string_set().attr_type.is_set());
        assert!(Attribute::required_string_set().flags.required);
        assert_eq!(
            Attribute::optional_string_map().attr_type,
            AttributeType::map(AttributeType::String)
        );
    }

    #[test]
    fn test_attribute_rules() {
        let attr = Attribute::required_string()
            .with_force_new()
            .with_diff_suppress(DiffSuppress::CaseInsensitive)
            .with_allowed_values(["stu3", "r4"])
            .conflicts_with("other");
        assert!(attr.force_new);
        assert_eq!(attr.diff_suppress, vec![DiffSuppress::CaseInsensitive]);
        assert_eq!(attr.allowed_values, vec![json!("stu3"), json!("r4")]);
        assert_eq!(attr.conflicts_with, vec!["other".to_string()]);
    }

    #[test]
    fn test_id_and_timeouts() {
        let schema = Schema::v0().with_id().with_timeouts();
        assert!(schema.attribute("id").unwrap().flags.is_computed_only());
        let timeouts = &schema.block.blocks["timeouts"];
        assert_eq!(timeouts.nesting_mode, BlockNestingMode::Single);
        assert_eq!(timeouts.block.attributes.len(), 3);
    }

    #[test]
    fn test_serialized_rules() {
        let schema = Schema::new(2).with_attribute(
            "policy",
            Attribute::optional_string().with_diff_suppress(DiffSuppress::PolicyJson),
        );
        let value = serde_json::to_value(&schema).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["attributes"]["policy"]["diff_suppress"][0], "policy_json");
        assert!(value["attributes"]["policy"].get("default").is_none());
    }

    #[test]
    fn test_nested_block_limits() {
        let list = NestedBlock::list(Block::new())
            .with_min_items(1)
            .with_force_new();
        assert_eq!(list.max_items, 0);
        assert_eq!(list.min_items, 1);
        assert!(list.force_new);
        assert_eq!(NestedBlock::single(Block::new()).max_items, 1);
    }

    #[test]
    fn test_diagnostics() {
        let d = Diagnostic::warning("not assigned").with_attribute("permissions");
        assert!(!d.is_error());
        assert_eq!(d.attribute.as_deref(), Some("permissions"));
        assert!(Diagnostic::error("bad").with_detail("why").is_error());
    }
}
