//! Import string parsing.
//!
//! Resources that need more than a bare identifier to be read take a fixed
//! comma-separated tuple, e.g. `store_url,org_id,fhir_version`.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};

use crate::error::ProviderError;

/// FHIR release a store speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FhirFlavour {
    /// STU3 (3.0).
    Stu3,
    /// R4 (4.0).
    R4,
}

impl FhirFlavour {
    /// Every flavour.
    pub const ALL: [FhirFlavour; 2] = [FhirFlavour::Stu3, FhirFlavour::R4];

    /// Attribute value: `stu3` or `r4`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stu3 => "stu3",
            Self::R4 => "r4",
        }
    }

    /// Media type for requests and responses.
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Stu3 => "application/fhir+json;fhirVersion=3.0",
            Self::R4 => "application/fhir+json;fhirVersion=4.0",
        }
    }

    /// Flavour from a capability statement's `fhirVersion` (e.g. `3.0.1`, `4.0.1`).
    pub fn from_fhir_version(version: &str) -> Option<Self> {
        if version.starts_with("3.") {
            Some(Self::Stu3)
        } else if version.starts_with("4.") {
            Some(Self::R4)
        } else {
            None
        }
    }
}

impl fmt::Display for FhirFlavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FhirFlavour {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stu3" => Ok(Self::Stu3),
            "r4" => Ok(Self::R4),
            other => Err(ProviderError::Validation(format!(
                "unsupported FHIR version '{}', expected one of: stu3, r4",
                other
            ))),
        }
    }
}

/// Split `id` into exactly `fields.len()` non-empty parts.
pub fn parse_tuple<'a>(id: &'a str, fields: &[&str]) -> Result<Vec<&'a str>, ProviderError> {
    let parts: Vec<&str> = id.split(',').map(str::trim).collect();
    if parts.len() != fields.len() {
        return Err(ProviderError::Validation(format!(
            "import id '{}' has {} part(s), expected {} in the form {}",
            id,
            parts.len(),
            fields.len(),
            fields.join(",")
        )));
    }
    if let Some(pos) = parts.iter().position(|p| p.is_empty()) {
        return Err(ProviderError::Validation(format!(
            "import id '{}' has an empty {}",
            id, fields[pos]
        )));
    }
    Ok(parts)
}

/// Parse `store_url,<id>,fhir_version` into `{fhir_store, id, version}`.
pub fn fhir_tuple(id: &str, id_field: &str) -> Result<Value, ProviderError> {
    let parts = parse_tuple(id, &["fhir_store", id_field, "version"])?;
    let flavour: FhirFlavour = parts[2].parse()?;
    Ok(json!({
        "fhir_store": parts[0].trim_end_matches('/'),
        "id": parts[1],
        "version": flavour.as_str(),
    }))
}
