//! Offline checks of an attribute bag against its [`Schema`].
//!
//! Runs before any request is made. Every problem becomes an error
//! diagnostic carrying the dotted path of the offending attribute
//! (`channel.endpoint`, `file.0.destination`).
//!
//! ```
//! use hemmer_provider_hsdp::schema::{Attribute, Schema};
//! use hemmer_provider_hsdp::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("name", Attribute::required_string())
//!     .with_attribute("version", Attribute::optional_string().with_allowed_values(["stu3", "r4"]));
//!
//! assert!(validate(&schema, &json!({"name": "ward", "version": "r4"})).is_empty());
//!
//! let diagnostics = validate(&schema, &json!({"name": "ward", "version": "dstu2"}));
//! assert_eq!(diagnostics[0].attribute.as_deref(), Some("version"));
//! ```

use serde_json::{Map, Value};

use crate::reconcile::parse_duration;
use crate::schema::{Attribute, AttributeType, Block, BlockNestingMode, Diagnostic, NestedBlock, Schema};

/// Diagnostics for everything wrong with `value`. Empty when it is valid.
///
/// Computed-only attributes are ignored since the server owns them.
/// `timeouts` entries must parse as durations.
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut walker = Walker::default();
    walker.block(&schema.block, value, "");
    walker.timeouts(value);
    walker.found
}

/// Shorthand for `validate(..).is_empty()`.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    validate(schema, value).is_empty()
}

#[derive(Default)]
struct Walker {
    found: Vec<Diagnostic>,
}

impl Walker {
    fn report(&mut self, path: &str, summary: String, detail: Option<String>) {
        let mut diagnostic = Diagnostic::error(summary);
        if let Some(detail) = detail {
            diagnostic = diagnostic.with_detail(detail);
        }
        if !path.is_empty() {
            diagnostic = diagnostic.with_attribute(path);
        }
        self.found.push(diagnostic);
    }

    fn wrong_type(&mut self, path: &str, expected: &str, got: &Value) {
        self.report(
            path,
            format!("Invalid type for attribute '{}'", path),
            Some(format!("Expected {}, got {}", expected, kind(got))),
        );
    }

    fn block(&mut self, block: &Block, value: &Value, path: &str) {
        let object = match value {
            Value::Null => return,
            Value::Object(object) => object,
            other => {
                self.report(path, "Expected object".into(), Some(format!("Got {}", kind(other))));
                return;
            },
        };

        for (name, attr) in &block.attributes {
            let attr_path = child(path, name);
            self.attribute(attr, object.get(name), &attr_path);
            self.conflicts(block, object, name, path);
        }
        for (name, nested) in &block.blocks {
            self.nested(nested, object.get(name), &child(path, name));
        }
    }

    fn conflicts(&mut self, block: &Block, object: &Map<String, Value>, name: &str, path: &str) {
        let Some(attr) = block.attributes.get(name) else {
            return;
        };
        if !present(object.get(name)) {
            return;
        }
        for other in &attr.conflicts_with {
            if !present(object.get(other)) {
                continue;
            }
            // Mutual declarations report from the lexically smaller side only.
            let mutual = block
                .attributes
                .get(other)
                .is_some_and(|o| o.conflicts_with.iter().any(|c| c == name));
            if mutual && name > other.as_str() {
                continue;
            }
            let attr_path = child(path, name);
            self.report(
                &attr_path,
                format!("Conflicting attributes '{}' and '{}'", attr_path, child(path, other)),
                Some("Only one of these attributes may be set".into()),
            );
        }
    }

    fn attribute(&mut self, attr: &Attribute, value: Option<&Value>, path: &str) {
        if attr.flags.is_computed_only() {
            return;
        }
        let Some(value) = value.filter(|v| !v.is_null()) else {
            if attr.flags.required {
                self.report(
                    path,
                    format!("Missing required attribute '{}'", path),
                    Some("This attribute is required and must be provided".into()),
                );
            }
            return;
        };

        let before = self.found.len();
        self.typed(&attr.attr_type, value, path);
        if self.found.len() == before && !attr.allowed_values.is_empty() {
            self.allowed(&attr.allowed_values, value, path);
        }
    }

    fn allowed(&mut self, allowed: &[Value], value: &Value, path: &str) {
        let members = match value {
            Value::Array(items) => items.as_slice(),
            single => std::slice::from_ref(single),
        };
        for member in members.iter().filter(|m| !allowed.contains(m)) {
            let choices: Vec<String> = allowed.iter().map(Value::to_string).collect();
            self.report(
                path,
                format!("Invalid value for attribute '{}'", path),
                Some(format!("Expected one of [{}], got {}", choices.join(", "), member)),
            );
        }
    }

    fn typed(&mut self, attr_type: &AttributeType, value: &Value, path: &str) {
        match (attr_type, value) {
            (AttributeType::String, Value::String(_)) | (AttributeType::Bool, Value::Bool(_)) => {},
            (AttributeType::Int64, v) if whole_number(v) => {},
            (AttributeType::List(element) | AttributeType::Set(element), Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    self.typed(element, item, &format!("{}.{}", path, i));
                }
            },
            (AttributeType::Map(element), Value::Object(entries)) => {
                for (key, item) in entries {
                    self.typed(element, item, &format!("{}.{}", path, key));
                }
            },
            (expected, got) => self.wrong_type(path, type_name(expected), got),
        }
    }

    fn nested(&mut self, nested: &NestedBlock, value: Option<&Value>, path: &str) {
        let value = value.filter(|v| !v.is_null());
        match (nested.nesting_mode, value) {
            (BlockNestingMode::Single, None) if nested.min_items > 0 => self.report(
                path,
                format!("Missing required block '{}'", path),
                Some("At least one block is required".into()),
            ),
            (BlockNestingMode::List, None) if nested.min_items > 0 => self.report(
                path,
                format!("Block '{}' requires at least {} item(s)", path, nested.min_items),
                None,
            ),
            (_, None) => {},
            // Single blocks arrive either bare or as a one-element list.
            (BlockNestingMode::Single, Some(Value::Array(items))) if items.len() <= 1 => {
                if let Some(item) = items.first() {
                    self.block(&nested.block, item, path);
                }
            },
            (BlockNestingMode::Single, Some(v)) => self.block(&nested.block, v, path),
            (BlockNestingMode::List, Some(Value::Array(items))) => self.items(nested, items, path),
            (BlockNestingMode::List, Some(v)) => self.report(
                path,
                format!("Expected list for block '{}'", path),
                Some(format!("Got {}", kind(v))),
            ),
        }
    }

    fn items(&mut self, nested: &NestedBlock, items: &[Value], path: &str) {
        let count = items.len() as u32;
        if count < nested.min_items {
            self.report(
                path,
                format!(
                    "Block '{}' requires at least {} item(s), got {}",
                    path, nested.min_items, count
                ),
                None,
            );
        }
        if nested.max_items > 0 && count > nested.max_items {
            self.report(
                path,
                format!(
                    "Block '{}' allows at most {} item(s), got {}",
                    path, nested.max_items, count
                ),
                None,
            );
        }
        for (i, item) in items.iter().enumerate() {
            self.block(&nested.block, item, &format!("{}.{}", path, i));
        }
    }

    fn timeouts(&mut self, value: &Value) {
        let Some(timeouts) = value.get("timeouts").and_then(Value::as_object) else {
            return;
        };
        for (op, raw) in timeouts {
            let Some(text) = raw.as_str() else { continue };
            if let Err(e) = parse_duration(text) {
                self.report(
                    &format!("timeouts.{}", op),
                    format!("Invalid timeout for '{}'", op),
                    Some(e.to_string()),
                );
            }
        }
    }
}

/// Set means non-null and, for strings, non-empty.
fn present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn child(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn whole_number(value: &Value) -> bool {
    let Value::Number(n) = value else {
        return false;
    };
    n.as_i64().is_some()
        || n
            .as_f64()
            .is_some_and(|f| f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64)
}

fn type_name(attr_type: &AttributeType) -> &'static str {
    match attr_type {
        AttributeType::String => "string",
        AttributeType::Int64 => "int64",
        AttributeType::Bool => "bool",
        AttributeType::List(_) => "list",
        AttributeType::Set(_) => "set",
        AttributeType::Map(_) => "map",
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
