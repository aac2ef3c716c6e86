//! `hsdp_iam_role`: identity roles and their permission sets.
//!
//! Permission changes are one `$assign-permission` call for everything added,
//! then one `$remove-permission` for everything removed. Permissions the
//! server does not know are reported as warnings; the rest of the apply goes on.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{
    body_json, created_id, ensure_adoptable, entries, identity, list_field, str_at, IDENTITY,
};
use crate::client::{ApiClient, ApiRequest};
use crate::diff::DiffSuppress;
use crate::error::ProviderError;
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Diagnostic, Schema};
use crate::state::ResourceData;

fn role_path(id: &str) -> String {
    format!("{}/Role/{}", IDENTITY, id)
}

/// Identity role.
#[derive(Debug, Default)]
pub struct IamRole;

impl IamRole {
    async fn permission_action(
        client: &ApiClient,
        id: &str,
        action: &str,
        permissions: &[String],
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        let path = format!("{}/${}", role_path(id), action);
        let body = json!({ "permissions": permissions });
        client
            .send(&identity(ApiRequest::post(path)).json(&body), &ctx.cancel)
            .await?;
        Ok(())
    }

    async fn sync_permissions(
        client: &ApiClient,
        id: &str,
        added: Vec<String>,
        removed: Vec<String>,
        data: &mut ResourceData,
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        if !added.is_empty() {
            match Self::permission_action(client, id, "assign-permission", &added, ctx).await {
                Ok(()) => {},
                Err(e) if e.is_gone() || e.status() == Some(422) => {
                    warn!(role = id, permissions = ?added, error = %e, "permissions not assigned");
                    data.warn(
                        Diagnostic::warning(format!(
                            "permission(s) not assigned: {}",
                            added.join(", ")
                        ))
                        .with_detail(e.to_string())
                        .with_attribute("permissions"),
                    );
                },
                Err(e) => return Err(e),
            }
        }
        if !removed.is_empty() {
            match Self::permission_action(client, id, "remove-permission", &removed, ctx).await {
                Ok(()) => {},
                Err(e) if e.is_gone() => {
                    info!(role = id, permissions = ?removed, "permissions already absent");
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn permissions(
        client: &ApiClient,
        id: &str,
        ctx: &OpContext,
    ) -> Result<Option<Vec<String>>, ProviderError> {
        let request = identity(ApiRequest::get(format!("{}/Permission", IDENTITY))).query("roleId", id);
        list_field(client, &request, "name", ctx).await
    }

    async fn find(
        client: &ApiClient,
        name: &str,
        org: &str,
        ctx: &OpContext,
    ) -> Result<Option<Value>, ProviderError> {
        let request = identity(ApiRequest::get(format!("{}/Role", IDENTITY)))
            .query("name", name)
            .query("organizationId", org);
        let bundle: Value = client.send_json(&request, &ctx.cancel).await?;
        Ok(entries(&bundle)
            .into_iter()
            .find(|r| str_at(r, "/name") == name)
            .cloned())
    }
}

#[async_trait]
impl Resource for IamRole {
    fn type_name(&self) -> &'static str {
        "hsdp_iam_role"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("description", Attribute::optional_string().with_force_new())
            .with_attribute(
                "managing_organization",
                Attribute::required_string()
                    .with_force_new()
                    .with_diff_suppress(DiffSuppress::CaseInsensitive),
            )
            .with_attribute(
                "permissions",
                Attribute::required_string_set().with_description("Permission names, e.g. GROUP.READ"),
            )
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let name = data.require_str("name")?.to_string();
        let org = data.require_str("managing_organization")?.to_string();
        let body = json!({
            "name": name,
            "description": data.get_string("description"),
            "managingOrganization": org,
        });

        let (id, adopted) = match client
            .send(
                &identity(ApiRequest::post(format!("{}/Role", IDENTITY))).json(&body),
                &ctx.cancel,
            )
            .await
        {
            Ok(response) => (
                created_id(&body_json(&response.body)?, response.location())?,
                false,
            ),
            Err(e) => {
                let err = ProviderError::from(e);
                if !err.is_conflict(false) {
                    return Err(err);
                }
                let Some(existing) = Self::find(&client, &name, &org, ctx).await? else {
                    return Err(err);
                };
                ensure_adoptable(
                    "role",
                    &name,
                    &self.schema(),
                    &[(
                        "description",
                        data.get_str("description").unwrap_or(""),
                        str_at(&existing, "/description"),
                    )],
                )?;
                info!(%name, "adopting existing role");
                (str_at(&existing, "/id").to_string(), true)
            },
        };
        data.set_id(id.as_str());

        let desired = data.get_string_set("permissions");
        let current: std::collections::BTreeSet<String> = if adopted {
            Self::permissions(&client, &id, ctx)
                .await?
                .unwrap_or_default()
                .into_iter()
                .collect()
        } else {
            Default::default()
        };
        let added = desired.difference(&current).cloned().collect();
        let removed = current.difference(&desired).cloned().collect();
        Self::sync_permissions(&client, &id, added, removed, data, ctx).await?;
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        let role: Value = client
            .send_json(&identity(ApiRequest::get(role_path(&id))), &ctx.cancel)
            .await?;
        data.set("name", str_at(&role, "/name"));
        data.set("description", str_at(&role, "/description"));
        data.set("managing_organization", str_at(&role, "/managingOrganization"));
        if let Some(permissions) = Self::permissions(&client, &id, ctx).await? {
            data.set_string_set("permissions", permissions);
        }
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let (added, removed) = data.set_changes("permissions");
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        Self::sync_permissions(&client, &id, added, removed, data, ctx).await?;
        self.read(ctx, data).await
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        client
            .send(&identity(ApiRequest::delete(role_path(&id))), &ctx.cancel)
            .await?;
        data.clear_id();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_path() {
        assert_eq!(role_path("r-1"), "/authorize/identity/Role/r-1");
    }

    #[test]
    fn test_permissions_required_set() {
        let schema = IamRole.schema();
        let permissions = schema.attribute("permissions").unwrap();
        assert!(permissions.flags.required);
        assert!(permissions.attr_type.is_set());
    }
}
