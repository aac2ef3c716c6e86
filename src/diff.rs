//! Diff-suppression predicates.
//!
//! A predicate receives `(key, stored, desired)` and returns `true` when the
//! pair should be treated as "no change". All predicates are pure and
//! symmetric in their value arguments.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signature shared by every predicate.
pub type Predicate = fn(&str, &Value, &Value) -> bool;

/// Named predicates attachable to schema attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffSuppress {
    /// Opaque IDs whose casing differs between write and read.
    CaseInsensitive,
    /// JSON policy documents compared after canonicalisation.
    PolicyJson,
    /// Server `"default"` equals user `""`.
    DefaultSubstitution,
    /// Fields the server fills in after creation.
    ComputedOnWrite,
    /// RFC 3339 timestamps compared by instant.
    Rfc3339,
    /// Base64 payloads compared after decoding.
    Base64,
}

impl DiffSuppress {
    /// The predicate implementing this rule.
    pub fn predicate(self) -> Predicate {
        match self {
            Self::CaseInsensitive => case_insensitive,
            Self::PolicyJson => policy_json_equivalent,
            Self::DefaultSubstitution => default_substitution,
            Self::ComputedOnWrite => computed_on_write,
            Self::Rfc3339 => rfc3339_equal,
            Self::Base64 => base64_equal,
        }
    }

    /// Apply the rule.
    pub fn suppresses(self, key: &str, stored: &Value, desired: &Value) -> bool {
        (self.predicate())(key, stored, desired)
    }
}

/// True if any of `rules` suppresses the change.
pub fn suppressed_by(rules: &[DiffSuppress], key: &str, stored: &Value, desired: &Value) -> bool {
    rules.iter().any(|r| r.suppresses(key, stored, desired))
}

/// Chain predicates: the result suppresses if any member does.
pub fn any_of(predicates: Vec<Predicate>) -> impl Fn(&str, &Value, &Value) -> bool {
    move |key, stored, desired| predicates.iter().any(|p| p(key, stored, desired))
}

fn as_text(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => Some(s.as_str()),
        Value::Null => Some(""),
        _ => None,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Case-insensitive string equality.
pub fn case_insensitive(_key: &str, stored: &Value, desired: &Value) -> bool {
    match (as_text(stored), as_text(desired)) {
        (Some(a), Some(b)) => a.to_lowercase() == b.to_lowercase(),
        _ => stored == desired,
    }
}

/// Both sides parse as JSON policy documents with the same canonical form.
///
/// Arrays inside a policy are order-insensitive and a one-element array is
/// equivalent to its single member (`"Action": "a"` == `"Action": ["a"]`).
pub fn policy_json_equivalent(_key: &str, stored: &Value, desired: &Value) -> bool {
    let parse = |v: &Value| -> Option<Value> {
        match v {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => serde_json::from_str(s).ok(),
            Value::Object(_) | Value::Array(_) => Some(v.clone()),
            _ => None,
        }
    };
    match (parse(stored), parse(desired)) {
        (Some(a), Some(b)) => canonicalise(&a) == canonicalise(&b),
        _ => false,
    }
}

fn canonicalise(v: &Value) -> Value {
    match v {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonicalise(v)))
                .collect(),
        ),
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(canonicalise).collect();
            if items.len() == 1 {
                return items.remove(0);
            }
            items.sort_by_key(|i| i.to_string());
            Value::Array(items)
        },
        other => other.clone(),
    }
}

/// `"default"` on one side equals `""` on the other.
pub fn default_substitution(_key: &str, stored: &Value, desired: &Value) -> bool {
    let norm = |v: &Value| -> Option<String> {
        as_text(v).map(|s| if s == "default" { String::new() } else { s.to_string() })
    };
    match (norm(stored), norm(desired)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// An empty value on either side matches anything: the server fills it in.
pub fn computed_on_write(_key: &str, stored: &Value, desired: &Value) -> bool {
    is_empty(stored) || is_empty(desired) || stored == desired
}

/// Both sides parse as RFC 3339 and denote the same instant.
pub fn rfc3339_equal(_key: &str, stored: &Value, desired: &Value) -> bool {
    let (Some(a), Some(b)) = (as_text(stored), as_text(desired)) else {
        return false;
    };
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Both sides decode to the same bytes.
pub fn base64_equal(_key: &str, stored: &Value, desired: &Value) -> bool {
    let (Some(a), Some(b)) = (as_text(stored), as_text(desired)) else {
        return false;
    };
    let decode = |s: &str| {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        BASE64.decode(compact)
    };
    match (decode(a), decode(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL: [DiffSuppress; 6] = [
        DiffSuppress::CaseInsensitive,
        DiffSuppress::PolicyJson,
        DiffSuppress::DefaultSubstitution,
        DiffSuppress::ComputedOnWrite,
        DiffSuppress::Rfc3339,
        DiffSuppress::Base64,
    ];

    #[test]
    fn test_case_insensitive() {
        assert!(case_insensitive("id", &json!("ABC-def"), &json!("abc-DEF")));
        assert!(!case_insensitive("id", &json!("abc"), &json!("abd")));
    }

    #[test]
    fn test_policy_json_equivalent() {
        let a = json!(r#"{"Statement":[{"Action":["s3:Get","s3:Put"],"Effect":"Allow"}]}"#);
        let b = json!(
            r#"{ "Statement": { "Effect": "Allow", "Action": ["s3:Put", "s3:Get"] } }"#
        );
        assert!(policy_json_equivalent("policy", &a, &b));

        let c = json!(r#"{"Statement":[{"Action":"s3:Get","Effect":"Deny"}]}"#);
        assert!(!policy_json_equivalent("policy", &a, &c));

        assert!(!policy_json_equivalent("policy", &json!("not json"), &a));
    }

    #[test]
    fn test_default_substitution() {
        assert!(default_substitution("scope", &json!("default"), &json!("")));
        assert!(default_substitution("scope", &json!("default"), &Value::Null));
        assert!(!default_substitution("scope", &json!("default"), &json!("custom")));
    }

    #[test]
    fn test_computed_on_write() {
        assert!(computed_on_write("k", &json!("server-value"), &json!("")));
        assert!(computed_on_write("k", &json!("a"), &json!("a")));
        assert!(!computed_on_write("k", &json!("a"), &json!("b")));
    }

    #[test]
    fn test_rfc3339_equal() {
        assert!(rfc3339_equal(
            "end",
            &json!("2026-01-01T10:00:00Z"),
            &json!("2026-01-01T11:00:00+01:00")
        ));
        assert!(!rfc3339_equal(
            "end",
            &json!("2026-01-01T10:00:00Z"),
            &json!("2026-01-01T10:00:01Z")
        ));
    }

    #[test]
    fn test_base64_equal() {
        assert!(base64_equal("cert", &json!("aGVsbG8="), &json!("aGVs\nbG8=")));
        assert!(!base64_equal("cert", &json!("aGVsbG8="), &json!("d29ybGQ=")));
    }

    #[test]
    fn test_any_of() {
        let chained = any_of(vec![case_insensitive, default_substitution]);
        assert!(chained("k", &json!("ABC"), &json!("abc")));
        assert!(chained("k", &json!("default"), &json!("")));
        assert!(!chained("k", &json!("x"), &json!("y")));
    }

    #[test]
    fn test_every_predicate_is_symmetric() {
        let samples = [
            json!(""),
            json!("default"),
            json!("ABC"),
            json!("abc"),
            json!("aGVsbG8="),
            json!("2026-01-01T10:00:00Z"),
            json!("2026-01-01T11:00:00+01:00"),
            json!(r#"{"a":[1,2]}"#),
            json!(r#"{"a":[2,1]}"#),
            Value::Null,
            json!(7),
        ];
        for rule in ALL {
            for x in &samples {
                for y in &samples {
                    assert_eq!(
                        rule.suppresses("k", x, y),
                        rule.suppresses("k", y, x),
                        "{:?} not symmetric for {} / {}",
                        rule,
                        x,
                        y
                    );
                }
            }
        }
    }

    #[test]
    fn test_suppressed_by() {
        let rules = [DiffSuppress::Rfc3339, DiffSuppress::CaseInsensitive];
        assert!(suppressed_by(&rules, "k", &json!("A"), &json!("a")));
        assert!(!suppressed_by(&[], "k", &json!("A"), &json!("a")));
    }
}
