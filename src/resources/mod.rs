//! The resource and data source catalog.
//!
//! Every handler follows the same shape: project the attribute bag into the
//! upstream document at the top, make the calls through the shared
//! [`ClientRegistry`](crate::registry::ClientRegistry) clients, and write
//! server-owned fields back into [`ResourceData`](crate::state::ResourceData).
//! Gone-on-404 is handled once by the provider; handlers just propagate.

use std::sync::Arc;

use serde_json::Value;

use tracing::debug;

use crate::client::{ApiClient, ApiRequest};
use crate::diff::suppressed_by;
use crate::error::ProviderError;
use crate::reconcile::{DataSource, OpContext, Resource};
use crate::schema::Schema;

mod cdr_org;
mod cdr_subscription;
mod container_host;
mod data;
mod function;
mod iam_group;
mod iam_immutable;
mod iam_org;
mod iam_role;
mod iam_service;
mod metrics_autoscaler;
mod notification_topic;
mod pki_cert;

pub use cdr_org::CdrOrg;
pub use cdr_subscription::CdrSubscription;
pub use container_host::ContainerHost;
pub use data::{ConfigData, FhirStoreData, IamOrgData, IamPermissionsData};
pub use function::Function;
pub use iam_group::IamGroup;
pub use iam_immutable::ImmutableIdentity;
pub use iam_org::IamOrg;
pub use iam_role::IamRole;
pub use iam_service::IamService;
pub use metrics_autoscaler::MetricsAutoscaler;
pub use notification_topic::NotificationTopic;
pub use pki_cert::PkiCert;

/// Header selecting the identity API version.
pub(crate) const API_VERSION: &str = "API-Version";

/// Root of the identity management API.
pub(crate) const IDENTITY: &str = "/authorize/identity";

/// An identity management request at API version 1.
pub(crate) fn identity(request: ApiRequest) -> ApiRequest {
    request.header(API_VERSION, "1")
}

/// Every managed resource type.
pub fn catalog() -> Vec<Arc<dyn Resource>> {
    vec![
        Arc::new(IamOrg),
        Arc::new(IamGroup),
        Arc::new(IamRole),
        Arc::new(ImmutableIdentity::proposition()),
        Arc::new(ImmutableIdentity::application()),
        Arc::new(IamService),
        Arc::new(CdrOrg),
        Arc::new(CdrSubscription),
        Arc::new(ContainerHost),
        Arc::new(PkiCert),
        Arc::new(NotificationTopic),
        Arc::new(MetricsAutoscaler),
        Arc::new(Function),
    ]
}

/// Every data source type.
pub fn data_sources() -> Vec<Arc<dyn DataSource>> {
    vec![
        Arc::new(ConfigData),
        Arc::new(IamPermissionsData),
        Arc::new(IamOrgData),
        Arc::new(FhirStoreData),
    ]
}

/// String at JSON `pointer`, or empty.
pub(crate) fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

/// Members of a search bundle. Accepts `entry[].resource` and bare `entry[]`.
pub(crate) fn entries(bundle: &Value) -> Vec<&Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| item.get("resource").unwrap_or(item))
                .collect()
        })
        .unwrap_or_default()
}

/// Strings at `field` of every member of `items`.
pub(crate) fn names(items: &[&Value], field: &str) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.get(field).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// `field` of every member of a listing.
///
/// `None` when listing is forbidden: the object itself was readable, so the
/// caller keeps its stored view instead of clearing it.
pub(crate) async fn list_field(
    client: &ApiClient,
    request: &ApiRequest,
    field: &str,
    ctx: &OpContext,
) -> Result<Option<Vec<String>>, ProviderError> {
    match client.send_json::<Value>(request, &ctx.cancel).await {
        Ok(bundle) => Ok(Some(names(&entries(&bundle), field))),
        Err(e) if e.status() == Some(403) => {
            debug!(path = request.path(), "listing forbidden; keeping stored view");
            Ok(None)
        },
        Err(e) => Err(e.into()),
    }
}

/// Check that an existing object can stand in for the one being created.
///
/// `checks` holds `(attribute, desired, found)`; a discriminator the user
/// left empty always matches. Values compare under the attribute's
/// diff-suppression rules in `schema`, the same way plan compares them.
pub(crate) fn ensure_adoptable(
    kind: &str,
    name: &str,
    schema: &Schema,
    checks: &[(&str, &str, &str)],
) -> Result<(), ProviderError> {
    let equivalent = |attr: &str, desired: &str, found: &str| {
        desired == found
            || schema.attribute(attr).is_some_and(|a| {
                suppressed_by(&a.diff_suppress, attr, &Value::from(found), &Value::from(desired))
            })
    };
    let mismatched: Vec<String> = checks
        .iter()
        .filter(|(attr, desired, found)| !desired.is_empty() && !equivalent(attr, desired, found))
        .map(|(attr, desired, found)| format!("{} is '{}', want '{}'", attr, found, desired))
        .collect();
    if mismatched.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::FailedPrecondition(format!(
            "{} '{}' already exists and cannot be adopted: {}",
            kind,
            name,
            mismatched.join("; ")
        )))
    }
}

/// Identifier from a create response: body `id`, else the last segment of `Location`.
pub(crate) fn created_id(body: &Value, location: Option<&str>) -> Result<String, ProviderError> {
    if let Some(id) = body.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        return Ok(id.to_string());
    }
    location
        .and_then(|l| l.trim_end_matches('/').rsplit('/').next())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidResponse("create response carried no identifier".into()))
}

/// Parse a response body, treating an empty body as `{}`.
pub(crate) fn body_json(body: &[u8]) -> Result<Value, ProviderError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffSuppress;
    use crate::schema::Attribute;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn test_catalog_names_unique() {
        let names: BTreeSet<_> = catalog().iter().map(|r| r.type_name()).collect();
        assert_eq!(names.len(), catalog().len());
        assert!(names.contains("hsdp_function"));
        let data: BTreeSet<_> = data_sources().iter().map(|d| d.type_name()).collect();
        assert!(data.contains("hsdp_cdr_fhir_store"));
    }

    #[test]
    fn test_every_resource_has_id_and_timeouts() {
        for resource in catalog() {
            let schema = resource.schema();
            assert!(schema.attribute("id").is_some(), "{}", resource.type_name());
            assert!(
                schema.block.blocks.contains_key("timeouts"),
                "{}",
                resource.type_name()
            );
        }
    }

    #[test]
    fn test_entries() {
        let bundle = json!({"entry": [{"resource": {"id": "a"}}, {"id": "b"}]});
        let items = entries(&bundle);
        assert_eq!(names(&items, "id"), vec!["a", "b"]);
        assert!(entries(&json!({})).is_empty());
    }

    #[test]
    fn test_ensure_adoptable() {
        let schema = Schema::v0()
            .with_attribute("description", Attribute::optional_string())
            .with_attribute(
                "parent_org_id",
                Attribute::required_string().with_diff_suppress(DiffSuppress::CaseInsensitive),
            );
        let check = |checks: &[(&str, &str, &str)]| ensure_adoptable("group", "g", &schema, checks);

        assert!(check(&[("description", "", "other")]).is_ok());
        assert!(check(&[("description", "d", "d")]).is_ok());
        let err = check(&[("description", "d", "other")]).unwrap_err();
        assert!(err.to_string().contains("description is 'other', want 'd'"));

        assert!(check(&[("parent_org_id", "ORG-1", "org-1")]).is_ok());
        assert!(check(&[("description", "D", "d")]).is_err());
        assert!(check(&[("parent_org_id", "org-1", "org-2")]).is_err());
    }

    #[test]
    fn test_created_id() {
        assert_eq!(created_id(&json!({"id": "x"}), None).unwrap(), "x");
        assert_eq!(
            created_id(&json!({}), Some("https://idm/Group/g-1")).unwrap(),
            "g-1"
        );
        assert!(created_id(&json!({}), None).is_err());
    }

    #[test]
    fn test_body_json() {
        assert_eq!(body_json(b"").unwrap(), json!({}));
        assert_eq!(body_json(b"{\"a\":1}").unwrap()["a"], 1);
        assert!(body_json(b"<html>").is_err());
    }
}
