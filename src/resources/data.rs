//! Read-only data sources.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::iam_org::{self, get_org};
use super::{entries, identity, names, str_at, IDENTITY};
use crate::client::ApiRequest;
use crate::discovery::{self, Service};
use crate::error::ProviderError;
use crate::import::FhirFlavour;
use crate::reconcile::{DataSource, OpContext};
use crate::schema::{Attribute, Schema};
use crate::state::ResourceData;

/// `hsdp_config`: endpoint discovery without network calls.
#[derive(Debug, Default)]
pub struct ConfigData;

#[async_trait]
impl DataSource for ConfigData {
    fn type_name(&self) -> &'static str {
        "hsdp_config"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute(
                "service",
                Attribute::required_string().with_allowed_values(Service::ALL.iter().map(|s| s.as_str())),
            )
            .with_attribute("region", Attribute::optional_computed_string())
            .with_attribute("environment", Attribute::optional_computed_string())
            .with_attribute("url", Attribute::computed_string())
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let config = ctx.registry.config();
        let service: Service = data.require_str("service")?.parse()?;
        let region = data
            .get_str("region")
            .filter(|r| !r.is_empty())
            .unwrap_or(&config.region)
            .to_string();
        let environment = data
            .get_str("environment")
            .filter(|e| !e.is_empty())
            .unwrap_or(&config.environment)
            .to_string();

        // The provider's own row honours its endpoint overrides.
        let url = if region == config.region && environment == config.environment {
            config.service_url(service)?
        } else {
            discovery::lookup(&region, &environment, service)?
        };
        data.set("url", url);
        data.set_id(format!("{}-{}-{}", service, region, environment));
        data.set("region", region);
        data.set("environment", environment);
        Ok(())
    }
}

/// `hsdp_iam_permissions`: every permission name the caller can see.
#[derive(Debug, Default)]
pub struct IamPermissionsData;

#[async_trait]
impl DataSource for IamPermissionsData {
    fn type_name(&self) -> &'static str {
        "hsdp_iam_permissions"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("permissions", Attribute::computed_string_set())
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.idm().await?;
        let bundle: Value = client
            .send_json(
                &identity(ApiRequest::get(format!("{}/Permission", IDENTITY))),
                &ctx.cancel,
            )
            .await?;
        let permissions = names(&entries(&bundle), "name");
        debug!(count = permissions.len(), "permissions listed");
        data.set_string_set("permissions", permissions);
        data.set_id("permissions");
        Ok(())
    }
}

/// `hsdp_iam_org`: one organization by id.
#[derive(Debug, Default)]
pub struct IamOrgData;

#[async_trait]
impl DataSource for IamOrgData {
    fn type_name(&self) -> &'static str {
        "hsdp_iam_org"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("org_id", Attribute::required_string())
            .with_attribute("name", Attribute::computed_string())
            .with_attribute("display_name", Attribute::computed_string())
            .with_attribute("description", Attribute::computed_string())
            .with_attribute("parent_org_id", Attribute::computed_string())
            .with_attribute("type", Attribute::computed_string())
            .with_attribute("external_id", Attribute::computed_string())
            .with_attribute("active", Attribute::computed_bool())
            .with_attribute("version", Attribute::computed_string())
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.iam().await?;
        let org_id = data.require_str("org_id")?.to_string();
        let org = get_org(&client, &org_id, ctx).await?;
        iam_org::apply(data, &org);
        data.set_id(org_id);
        Ok(())
    }
}

/// `hsdp_cdr_fhir_store`: a tenant's FHIR endpoint and the release it speaks.
#[derive(Debug, Default)]
pub struct FhirStoreData;

#[async_trait]
impl DataSource for FhirStoreData {
    fn type_name(&self) -> &'static str {
        "hsdp_cdr_fhir_store"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("base_url", Attribute::required_string())
            .with_attribute("fhir_org_id", Attribute::required_string())
            .with_attribute("endpoint", Attribute::computed_string())
            .with_attribute("fhir_version", Attribute::computed_string())
            .with_attribute("version", Attribute::computed_string())
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let base = data.require_str("base_url")?.trim_end_matches('/').to_string();
        let org = data.require_str("fhir_org_id")?.to_string();
        let endpoint = format!("{}/store/fhir/{}", base, org);
        let client = ctx.registry.fhir(&endpoint, "").await?;
        let capabilities: Value = client
            .send_json(
                &ApiRequest::get("metadata").header("Accept", "application/fhir+json"),
                &ctx.cancel,
            )
            .await?;
        let fhir_version = str_at(&capabilities, "/fhirVersion").to_string();
        let flavour = FhirFlavour::from_fhir_version(&fhir_version).ok_or_else(|| {
            ProviderError::InvalidResponse(format!(
                "store {} reports unsupported FHIR version '{}'",
                endpoint, fhir_version
            ))
        })?;
        data.set("version", flavour.as_str());
        data.set("fhir_version", fhir_version);
        data.set("endpoint", endpoint.as_str());
        data.set_id(endpoint);
        Ok(())
    }
}
