//! RFC 6902 JSON patch generation.
//!
//! Used by handlers whose upstream rejects full-document PUTs: the handler
//! marshals the server document, mutates a copy locally, and sends the
//! difference between the two.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One JSON patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert a value at `path`.
    Add {
        /// JSON pointer.
        path: String,
        /// Value to insert.
        value: Value,
    },
    /// Remove the value at `path`.
    Remove {
        /// JSON pointer.
        path: String,
    },
    /// Replace the value at `path`.
    Replace {
        /// JSON pointer.
        path: String,
        /// New value.
        value: Value,
    },
}

impl PatchOp {
    /// The JSON pointer this operation targets.
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
        }
    }
}

/// Compute the operations that turn `from` into `to`.
///
/// Objects are diffed key by key; arrays element-wise, with trailing
/// additions appended and trailing removals issued from the end so indices
/// stay valid while the patch is applied in order.
pub fn diff(from: &Value, to: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_at("", from, to, &mut ops);
    ops
}

fn diff_at(path: &str, from: &Value, to: &Value, ops: &mut Vec<PatchOp>) {
    if from == to {
        return;
    }
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            let mut removed: Vec<&String> = a.keys().filter(|k| !b.contains_key(*k)).collect();
            removed.sort();
            for key in removed {
                ops.push(PatchOp::Remove {
                    path: child(path, key),
                });
            }
            let mut keys: Vec<&String> = b.keys().collect();
            keys.sort();
            for key in keys {
                let next = &b[key.as_str()];
                match a.get(key.as_str()) {
                    Some(prev) => diff_at(&child(path, key), prev, next, ops),
                    None => ops.push(PatchOp::Add {
                        path: child(path, key),
                        value: next.clone(),
                    }),
                }
            }
        },
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                diff_at(&child(path, &i.to_string()), &a[i], &b[i], ops);
            }
            for (i, value) in b.iter().enumerate().skip(common) {
                ops.push(PatchOp::Add {
                    path: child(path, &i.to_string()),
                    value: value.clone(),
                });
            }
            for i in (common..a.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: child(path, &i.to_string()),
                });
            }
        },
        _ => ops.push(PatchOp::Replace {
            path: path.to_string(),
            value: to.clone(),
        }),
    }
}

fn child(parent: &str, token: &str) -> String {
    let escaped = token.replace('~', "~0").replace('/', "~1");
    format!("{}/{}", parent, escaped)
}

/// Apply `ops` to `doc`. Used to verify patches before sending them.
pub fn apply(doc: &mut Value, ops: &[PatchOp]) -> Result<(), String> {
    for op in ops {
        match op {
            PatchOp::Add { path, value } => insert(doc, path, value.clone(), false)?,
            PatchOp::Replace { path, value } => insert(doc, path, value.clone(), true)?,
            PatchOp::Remove { path } => remove(doc, path)?,
        }
    }
    Ok(())
}

fn split(path: &str) -> Result<(String, String), String> {
    let idx = path
        .rfind('/')
        .ok_or_else(|| format!("invalid pointer {}", path))?;
    let last = path[idx + 1..].replace("~1", "/").replace("~0", "~");
    Ok((path[..idx].to_string(), last))
}

fn insert(doc: &mut Value, path: &str, value: Value, replace: bool) -> Result<(), String> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, last) = split(path)?;
    let target = doc
        .pointer_mut(&parent)
        .ok_or_else(|| format!("missing parent for {}", path))?;
    match target {
        Value::Object(map) => {
            map.insert(last, value);
            Ok(())
        },
        Value::Array(items) => {
            let index: usize = last
                .parse()
                .map_err(|_| format!("bad array index in {}", path))?;
            if replace && index < items.len() {
                items[index] = value;
                Ok(())
            } else if !replace && index <= items.len() {
                items.insert(index, value);
                Ok(())
            } else {
                Err(format!("index out of range in {}", path))
            }
        },
        _ => Err(format!("cannot index scalar at {}", path)),
    }
}

fn remove(doc: &mut Value, path: &str) -> Result<(), String> {
    let (parent, last) = split(path)?;
    let target = doc
        .pointer_mut(&parent)
        .ok_or_else(|| format!("missing parent for {}", path))?;
    match target {
        Value::Object(map) => map
            .remove(&last)
            .map(|_| ())
            .ok_or_else(|| format!("nothing to remove at {}", path)),
        Value::Array(items) => {
            let index: usize = last
                .parse()
                .map_err(|_| format!("bad array index in {}", path))?;
            if index < items.len() {
                items.remove(index);
                Ok(())
            } else {
                Err(format!("index out of range in {}", path))
            }
        },
        _ => Err(format!("cannot index scalar at {}", path)),
    }
}
