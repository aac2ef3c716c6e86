//! `hsdp_iam_service`: service identities with a server-generated key pair.
//!
//! The private key is only ever returned by the create call, so it is kept
//! from state on every later read.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{body_json, created_id, identity, str_at, IDENTITY};
use crate::client::{ApiClient, ApiRequest};
use crate::error::ProviderError;
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Schema};
use crate::state::ResourceData;

const DEFAULT_VALIDITY_MONTHS: i64 = 12;
const DEFAULT_TOKEN_VALIDITY: i64 = 1800;

fn services() -> String {
    format!("{}/Service", IDENTITY)
}

fn service_path(id: &str) -> String {
    format!("{}/Service/{}", IDENTITY, id)
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// IAM service identity.
#[derive(Debug, Default)]
pub struct IamService;

impl IamService {
    async fn scopes(
        client: &ApiClient,
        id: &str,
        action: &str,
        scopes: &[String],
        default_scopes: &[String],
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        if scopes.is_empty() && default_scopes.is_empty() {
            return Ok(());
        }
        let body = json!({
            "action": action,
            "scopes": scopes,
            "defaultScopes": default_scopes,
        });
        let path = format!("{}/$scopes", service_path(id));
        client
            .send(&identity(ApiRequest::put(path)).json(&body), &ctx.cancel)
            .await?;
        Ok(())
    }

    fn check_default_scopes(data: &ResourceData) -> Result<(), ProviderError> {
        let scopes = data.get_string_set("scopes");
        let stray: Vec<String> = data
            .get_string_set("default_scopes")
            .difference(&scopes)
            .cloned()
            .collect();
        if stray.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::Validation(format!(
                "default_scopes not in scopes: {}",
                stray.join(", ")
            )))
        }
    }
}

#[async_trait]
impl Resource for IamService {
    fn type_name(&self) -> &'static str {
        "hsdp_iam_service"
    }

    fn schema(&self) -> Schema {
        Schema::new(1)
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("description", Attribute::optional_string().with_force_new())
            .with_attribute("application_id", Attribute::required_string().with_force_new())
            .with_attribute(
                "validity",
                Attribute::optional_int64()
                    .with_default(Value::from(DEFAULT_VALIDITY_MONTHS))
                    .with_force_new()
                    .with_description("Key validity in months"),
            )
            .with_attribute(
                "token_validity",
                Attribute::optional_int64()
                    .with_default(Value::from(DEFAULT_TOKEN_VALIDITY))
                    .with_description("Access token lifetime in seconds"),
            )
            .with_attribute("scopes", Attribute::required_string_set())
            .with_attribute("default_scopes", Attribute::required_string_set())
            .with_attribute("service_id", Attribute::computed_string())
            .with_attribute("private_key", Attribute::computed_string().sensitive())
            .with_attribute("organization_id", Attribute::computed_string())
            .with_attribute("expires_on", Attribute::computed_string())
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        Self::check_default_scopes(data)?;
        let client = ctx.registry.idm().await?;
        let body = json!({
            "name": data.require_str("name")?,
            "description": data.get_string("description"),
            "applicationId": data.require_str("application_id")?,
            "validity": data.get_i64("validity").unwrap_or(DEFAULT_VALIDITY_MONTHS),
        });
        let response = client
            .send(&identity(ApiRequest::post(services())).json(&body), &ctx.cancel)
            .await?;
        let created = body_json(&response.body)?;
        let id = created_id(&created, response.location())?;
        data.set_id(id.as_str());
        data.set("private_key", str_at(&created, "/privateKey"));
        info!(%id, service_id = str_at(&created, "/serviceId"), "service created");

        let scopes: Vec<String> = data.get_string_set("scopes").into_iter().collect();
        let defaults: Vec<String> = data.get_string_set("default_scopes").into_iter().collect();
        Self::scopes(&client, &id, "add", &scopes, &defaults, ctx).await?;

        let token_validity = data.get_i64("token_validity").unwrap_or(DEFAULT_TOKEN_VALIDITY);
        if token_validity != DEFAULT_TOKEN_VALIDITY {
            let body = json!({ "accessTokenLifetime": token_validity });
            client
                .send(&identity(ApiRequest::put(service_path(&id))).json(&body), &ctx.cancel)
                .await?;
        }
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        let service: Value = client
            .send_json(&identity(ApiRequest::get(service_path(&id))), &ctx.cancel)
            .await?;
        data.set("name", str_at(&service, "/name"));
        data.set("description", str_at(&service, "/description"));
        data.set("application_id", str_at(&service, "/applicationId"));
        data.set("service_id", str_at(&service, "/serviceId"));
        data.set("organization_id", str_at(&service, "/organizationId"));
        data.set("expires_on", str_at(&service, "/expiresOn"));
        if let Some(lifetime) = service.get("accessTokenLifetime").and_then(Value::as_i64) {
            data.set("token_validity", lifetime);
        }
        data.set_string_set("scopes", string_array(&service, "scopes"));
        data.set_string_set("default_scopes", string_array(&service, "defaultScopes"));
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if !data.has_changes(&["scopes", "default_scopes", "token_validity"]) {
            return Ok(());
        }
        Self::check_default_scopes(data)?;
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();

        let (scopes_added, scopes_removed) = data.set_changes("scopes");
        let (defaults_added, defaults_removed) = data.set_changes("default_scopes");
        Self::scopes(&client, &id, "add", &scopes_added, &defaults_added, ctx).await?;
        Self::scopes(&client, &id, "remove", &scopes_removed, &defaults_removed, ctx).await?;

        if data.has_change("token_validity") {
            let body = json!({
                "accessTokenLifetime": data.get_i64("token_validity").unwrap_or(DEFAULT_TOKEN_VALIDITY),
            });
            client
                .send(&identity(ApiRequest::put(service_path(&id))).json(&body), &ctx.cancel)
                .await?;
        }
        self.read(ctx, data).await
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let id = data.id().to_string();
        client
            .send(&identity(ApiRequest::delete(service_path(&id))), &ctx.cancel)
            .await?;
        data.clear_id();
        Ok(())
    }

    fn upgrade_state(&self, version: u64, state: Value) -> Result<Value, ProviderError> {
        if version > 0 {
            return Ok(state);
        }
        let Value::Object(mut map) = state else {
            return Err(ProviderError::InvalidRequest(
                "service state is not an object".into(),
            ));
        };
        // v0 stored an absolute expiry instead of a validity period.
        map.remove("expires_on");
        map.entry("validity")
            .or_insert_with(|| Value::from(DEFAULT_VALIDITY_MONTHS));
        for key in ["scopes", "default_scopes"] {
            let unique: BTreeSet<String> = map
                .get(key)
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            map.insert(
                key.to_string(),
                Value::Array(unique.into_iter().map(Value::String).collect()),
            );
        }
        Ok(Value::Object(map))
    }
}
