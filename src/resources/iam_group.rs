//! `hsdp_iam_group`: identity groups with role and user membership.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{
    body_json, created_id, ensure_adoptable, entries, identity, list_field, str_at, IDENTITY,
};
use crate::client::{ApiClient, ApiRequest};
use crate::diff::DiffSuppress;
use crate::error::ProviderError;
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Schema};
use crate::state::ResourceData;

fn groups() -> String {
    format!("{}/Group", IDENTITY)
}

fn group_path(id: &str) -> String {
    format!("{}/Group/{}", IDENTITY, id)
}

fn members_body(users: &[String]) -> Value {
    let references: Vec<Value> = users.iter().map(|id| json!({ "reference": id })).collect();
    json!({
        "resourceType": "Parameters",
        "parameter": [{"name": "UserIDCollection", "references": references}]
    })
}

/// Identity group.
#[derive(Debug, Default)]
pub struct IamGroup;

impl IamGroup {
    async fn action(
        client: &ApiClient,
        id: &str,
        action: &str,
        body: Value,
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        let path = format!("{}/${}", group_path(id), action);
        client
            .send(&identity(ApiRequest::post(path)).json(&body), &ctx.cancel)
            .await?;
        Ok(())
    }

    async fn sync_membership(
        client: &ApiClient,
        id: &str,
        data: &ResourceData,
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        let (added, removed) = data.set_changes("roles");
        if !added.is_empty() {
            Self::action(client, id, "assign-role", json!({ "roles": added }), ctx).await?;
        }
        if !removed.is_empty() {
            Self::action(client, id, "remove-role", json!({ "roles": removed }), ctx).await?;
        }

        let (added, removed) = data.set_changes("users");
        if !added.is_empty() {
            Self::action(client, id, "add-members", members_body(&added), ctx).await?;
        }
        if !removed.is_empty() {
            Self::action(client, id, "remove-members", members_body(&removed), ctx).await?;
        }
        Ok(())
    }

    async fn find(
        client: &ApiClient,
        name: &str,
        org: &str,
        ctx: &OpContext,
    ) -> Result<Option<Value>, ProviderError> {
        let request = identity(ApiRequest::get(groups()))
            .query("name", name)
            .query("organizationId", org);
        let bundle: Value = client.send_json(&request, &ctx.cancel).await?;
        Ok(entries(&bundle)
            .into_iter()
            .find(|g| str_at(g, "/name") == name)
            .cloned())
    }
}

#[async_trait]
impl Resource for IamGroup {
    fn type_name(&self) -> &'static str {
        "hsdp_iam_group"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("description", Attribute::optional_string())
            .with_attribute(
                "managing_organization",
                Attribute::required_string()
                    .with_force_new()
                    .with_diff_suppress(DiffSuppress::CaseInsensitive),
            )
            .with_attribute(
                "roles",
                Attribute::optional_string_set().with_description("Role ids assigned to the group"),
            )
            .with_attribute(
                "users",
                Attribute::optional_string_set().with_description("User ids in the group"),
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

        let id = match client
            .send(&identity(ApiRequest::post(groups())).json(&body), &ctx.cancel)
            .await
        {
            Ok(response) => created_id(&body_json(&response.body)?, response.location())?,
            Err(e) => {
                let err = ProviderError::from(e);
                if !err.is_conflict(false) {
                    return Err(err);
                }
                let Some(existing) = Self::find(&client, &name, &org, ctx).await? else {
                    return Err(err);
                };
                ensure_adoptable(
                    "group",
                    &name,
                    &self.schema(),
                    &[
                        (
                            "description",
                            data.get_str("description").unwrap_or(""),
                            str_at(&existing, "/description"),
                        ),
                        (
                            "managing_organization",
                            org.as_str(),
                            str_at(&existing, "/managingOrganization"),
                        ),
                    ],
                )?;
                info!(%name, "adopting existing group");
                str_at(&existing, "/id").to_string()
            },
        };
        data.set_id(id.as_str());

        // Adopted groups may already carry members; only send the difference.
        let mut current = ResourceData::new(json!({ "id": id }));
        self.read(ctx, &mut current).await?;
        let desired = ResourceData::with_prior(
            Value::Object(data.values().clone()),
            Value::Object(current.values().clone()),
        );
        Self::sync_membership(&client, &id, &desired, ctx).await?;
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        let group: Value = client
            .send_json(&identity(ApiRequest::get(group_path(&id))), &ctx.cancel)
            .await?;
        data.set("name", str_at(&group, "/name"));
        data.set("description", str_at(&group, "/description"));
        data.set("managing_organization", str_at(&group, "/managingOrganization"));

        let roles = identity(ApiRequest::get(format!("{}/Role", IDENTITY))).query("groupId", id.as_str());
        if let Some(roles) = list_field(&client, &roles, "id", ctx).await? {
            data.set_string_set("roles", roles);
        }
        let users = identity(ApiRequest::get(format!("{}/User", IDENTITY))).query("groupId", id.as_str());
        if let Some(users) = list_field(&client, &users, "id", ctx).await? {
            data.set_string_set("users", users);
        }
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        if data.has_change("description") {
            let body = json!({
                "name": data.get_string("name"),
                "description": data.get_string("description"),
            });
            client
                .send(&identity(ApiRequest::put(group_path(&id))).json(&body), &ctx.cancel)
                .await?;
        }
        Self::sync_membership(&client, &id, data, ctx).await?;
        self.read(ctx, data).await
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        // Groups with members cannot be deleted.
        let users: Vec<String> = data.get_string_set("users").into_iter().collect();
        if !users.is_empty() {
            match Self::action(&client, &id, "remove-members", members_body(&users), ctx).await {
                Ok(()) => {},
                Err(e) if e.is_gone() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        client
            .send(&identity(ApiRequest::delete(group_path(&id))), &ctx.cancel)
            .await?;
        data.clear_id();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_members_body() {
        let body = members_body(&["u-1".to_string(), "u-2".to_string()]);
        assert_eq!(body["parameter"][0]["name"], "UserIDCollection");
        assert_eq!(body["parameter"][0]["references"][1]["reference"], "u-2");
    }

    #[test]
    fn test_schema_sets() {
        let schema = IamGroup.schema();
        assert!(schema.attribute("roles").unwrap().attr_type.is_set());
        assert!(schema.attribute("managing_organization").unwrap().force_new);
        assert!(!schema.attribute("description").unwrap().force_new);
    }
}
