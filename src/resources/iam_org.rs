//! `hsdp_iam_org`: IAM organizations over SCIM.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{body_json, created_id, ensure_adoptable, str_at, API_VERSION};
use crate::client::{ApiClient, ApiRequest};
use crate::diff::DiffSuppress;
use crate::error::ProviderError;
use crate::poll::{PollError, INDETERMINATE};
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Diagnostic, Schema};
use crate::state::ResourceData;

pub(crate) const ORGANIZATIONS: &str = "/authorize/scim/v2/Organizations";
const SCIM_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:philips:hsdp:2.0:Organization";

fn scim(request: ApiRequest) -> ApiRequest {
    request
        .header(API_VERSION, "1")
        .header("Accept", "application/scim+json")
}

/// `value` as a quoted SCIM filter string.
fn scim_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn org_path(id: &str) -> String {
    format!("{}/{}", ORGANIZATIONS, id)
}

/// Fetch one organization.
pub(crate) async fn get_org(
    client: &ApiClient,
    id: &str,
    ctx: &OpContext,
) -> Result<Value, ProviderError> {
    Ok(client
        .send_json(&scim(ApiRequest::get(org_path(id))), &ctx.cancel)
        .await?)
}

fn document(data: &ResourceData) -> Value {
    json!({
        "schemas": [SCIM_SCHEMA],
        "name": data.get_string("name"),
        "displayName": data.get_string("display_name"),
        "description": data.get_string("description"),
        "parent": {"value": data.get_string("parent_org_id")},
        "type": data.get_string("type"),
        "externalId": data.get_string("external_id"),
    })
}

pub(crate) fn apply(data: &mut ResourceData, org: &Value) {
    data.set("name", str_at(org, "/name"));
    data.set("display_name", str_at(org, "/displayName"));
    data.set("description", str_at(org, "/description"));
    data.set("parent_org_id", str_at(org, "/parent/value"));
    data.set("type", str_at(org, "/type"));
    data.set("external_id", str_at(org, "/externalId"));
    data.set(
        "active",
        org.get("active").and_then(Value::as_bool).unwrap_or(true),
    );
    data.set("version", str_at(org, "/meta/version"));
}

/// IAM organization.
#[derive(Debug, Default)]
pub struct IamOrg;

impl IamOrg {
    async fn find_by_name(
        client: &ApiClient,
        name: &str,
        ctx: &OpContext,
    ) -> Result<Option<Value>, ProviderError> {
        let list: Value = client
            .send_json(
                &scim(ApiRequest::get(ORGANIZATIONS))
                    .query("filter", format!("name eq {}", scim_quote(name))),
                &ctx.cancel,
            )
            .await?;
        Ok(list
            .get("Resources")
            .and_then(Value::as_array)
            .and_then(|items| items.iter().find(|org| str_at(org, "/name") == name))
            .cloned())
    }

    async fn wait_for_delete(
        client: &ApiClient,
        id: &str,
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        let status_path = format!("{}/deleteStatus", org_path(id));
        let result = ctx
            .wait_for(
                &["IN_PROGRESS", "QUEUED", INDETERMINATE],
                &["SUCCESS"],
                Duration::from_secs(5),
                Duration::from_secs(2),
            )
            .failure(&["FAILED"])
            .run(&ctx.cancel, || async {
                let request = scim(ApiRequest::get(status_path.clone()));
                match client.send_json::<Value>(&request, &ctx.cancel).await {
                    Ok(body) => Ok(((), str_at(&body, "/status").to_string())),
                    Err(e) => {
                        let err = ProviderError::from(e);
                        if err.is_gone() {
                            Ok(((), "SUCCESS".to_string()))
                        } else {
                            Err(err)
                        }
                    },
                }
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(PollError::FailureState(state)) => Err(ProviderError::delete_failed(
                "iam_org",
                format!("delete status {}", state),
            )),
            Err(other) => Err(other.into()),
        }
    }
}

#[async_trait]
impl Resource for IamOrg {
    fn type_name(&self) -> &'static str {
        "hsdp_iam_org"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("display_name", Attribute::optional_string())
            .with_attribute("description", Attribute::optional_string())
            .with_attribute(
                "parent_org_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_diff_suppress(DiffSuppress::CaseInsensitive),
            )
            .with_attribute("type", Attribute::optional_string())
            .with_attribute("external_id", Attribute::optional_string())
            .with_attribute(
                "wait_for_delete",
                Attribute::optional_bool()
                    .with_default(Value::Bool(false))
                    .with_description("Block until the asynchronous delete finishes"),
            )
            .with_attribute("active", Attribute::computed_bool())
            .with_attribute("version", Attribute::computed_string())
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.iam().await?;
        let name = data.require_str("name")?.to_string();
        let parent = data.require_str("parent_org_id")?.to_string();
        let request = scim(ApiRequest::post(ORGANIZATIONS)).json(&document(data));

        let err = match client.send(&request, &ctx.cancel).await {
            Ok(response) => {
                let org = body_json(&response.body)?;
                data.set_id(created_id(&org, response.location())?);
                info!(id = data.id(), %name, "organization created");
                return self.read(ctx, data).await;
            },
            Err(e) => ProviderError::from(e),
        };
        if !err.is_conflict(false) {
            return Err(err);
        }

        let Some(existing) = Self::find_by_name(&client, &name, ctx).await? else {
            return Err(err);
        };
        ensure_adoptable(
            "organization",
            &name,
            &self.schema(),
            &[
                ("description", data.get_str("description").unwrap_or(""), str_at(&existing, "/description")),
                ("parent_org_id", parent.as_str(), str_at(&existing, "/parent/value")),
            ],
        )?;
        let id = str_at(&existing, "/id");
        if id.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "existing organization has no id".into(),
            ));
        }
        info!(%id, %name, "adopting existing organization");
        data.set_id(id);
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.iam().await?;
        let id = data.id().to_string();
        match get_org(&client, &id, ctx).await {
            Ok(org) => {
                apply(data, &org);
                Ok(())
            },
            Err(err) if err.status() == Some(403) => {
                // A 403 stands for "deleted" only while the parent org is still readable.
                let parent = data.get_string("parent_org_id");
                if parent.is_empty() || get_org(&client, &parent, ctx).await.is_err() {
                    return Err(err);
                }
                warn!(%id, %parent, "organization forbidden but parent readable; treating as gone");
                data.warn(
                    Diagnostic::warning(format!("organization {} is no longer accessible", id))
                        .with_detail("treated as deleted because its parent is still readable"),
                );
                data.clear_id();
                Ok(())
            },
            Err(err) => Err(err),
        }
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if !data.has_changes(&["display_name", "description", "type", "external_id"]) {
            return Ok(());
        }
        let client = ctx.registry.iam().await?;
        let id = data.id().to_string();
        let mut body = document(data);
        body["id"] = Value::from(id.as_str());
        let mut request = scim(ApiRequest::put(org_path(&id))).json(&body);
        if let Some(version) = data.get_str("version").filter(|v| !v.is_empty()) {
            request = request.header("If-Match", version);
        }
        let response = client.send(&request, &ctx.cancel).await?;
        let org = body_json(&response.body)?;
        if org.get("name").is_some() {
            apply(data, &org);
        } else {
            self.read(ctx, data).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.iam().await?;
        let id = data.id().to_string();
        client
            .send(&scim(ApiRequest::delete(org_path(&id))), &ctx.cancel)
            .await?;
        if data.get_bool("wait_for_delete") {
            Self::wait_for_delete(&client, &id, ctx).await?;
        }
        data.clear_id();
        Ok(())
    }
}
