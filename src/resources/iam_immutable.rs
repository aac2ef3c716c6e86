//! Identity objects that cannot change after creation: propositions and
//! applications.
//!
//! Both live under an owning parent, are created once, and are never mutated
//! upstream. `update` is deliberately a no-op that tells the operator so.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::{body_json, created_id, ensure_adoptable, entries, identity, str_at, IDENTITY};
use crate::client::{ApiClient, ApiRequest};
use crate::error::ProviderError;
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Diagnostic, Schema};
use crate::state::ResourceData;

/// A create-only identity object owned by a parent.
#[derive(Debug, Clone)]
pub struct ImmutableIdentity {
    type_name: &'static str,
    kind: &'static str,
    path: &'static str,
    parent_attr: &'static str,
    parent_json: &'static str,
}

impl ImmutableIdentity {
    /// `hsdp_iam_proposition`, owned by an organization.
    pub fn proposition() -> Self {
        Self {
            type_name: "hsdp_iam_proposition",
            kind: "proposition",
            path: "Proposition",
            parent_attr: "organization_id",
            parent_json: "organizationId",
        }
    }

    /// `hsdp_iam_application`, owned by a proposition.
    pub fn application() -> Self {
        Self {
            type_name: "hsdp_iam_application",
            kind: "application",
            path: "Application",
            parent_attr: "proposition_id",
            parent_json: "propositionId",
        }
    }

    fn collection(&self) -> String {
        format!("{}/{}", IDENTITY, self.path)
    }

    fn item(&self, id: &str) -> String {
        format!("{}/{}/{}", IDENTITY, self.path, id)
    }

    async fn find(
        &self,
        client: &ApiClient,
        name: &str,
        parent: &str,
        ctx: &OpContext,
    ) -> Result<Option<Value>, ProviderError> {
        let request = identity(ApiRequest::get(self.collection()))
            .query("name", name)
            .query(self.parent_json, parent);
        let bundle: Value = client.send_json(&request, &ctx.cancel).await?;
        Ok(entries(&bundle)
            .into_iter()
            .find(|item| str_at(item, "/name") == name)
            .cloned())
    }
}

#[async_trait]
impl Resource for ImmutableIdentity {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute(
                "description",
                Attribute::optional_string().with_description("Recorded at creation; later edits are not sent"),
            )
            .with_attribute(self.parent_attr, Attribute::required_string().with_force_new())
            .with_attribute(
                "global_reference_id",
                Attribute::optional_computed_string().with_force_new(),
            )
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let name = data.require_str("name")?.to_string();
        let parent = data.require_str(self.parent_attr)?.to_string();
        let reference = match data.get_str("global_reference_id").filter(|r| !r.is_empty()) {
            Some(reference) => reference.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let mut body = json!({
            "name": name,
            "description": data.get_string("description"),
            "globalReferenceId": reference,
        });
        body[self.parent_json] = Value::from(parent.as_str());

        let id = match client
            .send(&identity(ApiRequest::post(self.collection())).json(&body), &ctx.cancel)
            .await
        {
            Ok(response) => created_id(&body_json(&response.body)?, response.location())?,
            Err(e) => {
                let err = ProviderError::from(e);
                if !err.is_conflict(false) {
                    return Err(err);
                }
                let Some(existing) = self.find(&client, &name, &parent, ctx).await? else {
                    return Err(err);
                };
                ensure_adoptable(
                    self.kind,
                    &name,
                    &self.schema(),
                    &[(
                        "description",
                        data.get_str("description").unwrap_or(""),
                        str_at(&existing, "/description"),
                    )],
                )?;
                info!(kind = self.kind, %name, "adopting existing object");
                str_at(&existing, "/id").to_string()
            },
        };
        data.set_id(id);
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        let item: Value = client
            .send_json(&identity(ApiRequest::get(self.item(&id))), &ctx.cancel)
            .await?;
        data.set("name", str_at(&item, "/name"));
        data.set("description", str_at(&item, "/description"));
        data.set(self.parent_attr, str_at(&item, &format!("/{}", self.parent_json)));
        data.set("global_reference_id", str_at(&item, "/globalReferenceId"));
        Ok(())
    }

    async fn update(&self, _ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if data.has_change("description") {
            warn!(kind = self.kind, id = data.id(), "description change not applied");
            data.warn(
                Diagnostic::warning(format!("{} cannot be updated upstream", self.kind))
                    .with_detail("the new description is kept in state only")
                    .with_attribute("description"),
            );
        }
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        client
            .send(&identity(ApiRequest::delete(self.item(&id))), &ctx.cancel)
            .await?;
        data.clear_id();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let application = ImmutableIdentity::application();
        assert_eq!(application.item("a-1"), "/authorize/identity/Application/a-1");
        assert_eq!(application.type_name(), "hsdp_iam_application");
    }

    #[test]
    fn test_schema_parent_forces_new() {
        let proposition = ImmutableIdentity::proposition();
        let schema = proposition.schema();
        assert!(schema.attribute("organization_id").unwrap().force_new);
        assert!(!schema.attribute("description").unwrap().force_new);
        assert!(schema.attribute("proposition_id").is_none());
    }
}
