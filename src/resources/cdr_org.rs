//! `hsdp_cdr_org`: onboarding an organization into a FHIR store.
//!
//! The FHIR `Organization` id is the IAM organization id, so create is a PUT.
//! Deleting with `purge_delete` runs the store's asynchronous `$purge` and
//! waits for it to finish.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{body_json, str_at};
use crate::client::{ApiClient, ApiRequest};
use crate::error::ProviderError;
use crate::import::{fhir_tuple, FhirFlavour};
use crate::poll::{PollError, INDETERMINATE};
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Schema};
use crate::state::ResourceData;

const IDENTIFIER_SYSTEM: &str = "https://identity.philips-healthsuite.com/organization";

/// Organization as the handler sees it, independent of FHIR release.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Org {
    id: String,
    name: String,
    part_of: String,
}

fn part_of_reference(part_of: &str) -> Value {
    json!({ "reference": format!("Organization/{}", part_of) })
}

fn part_of_id(document: &Value) -> String {
    str_at(document, "/partOf/reference")
        .trim_start_matches("Organization/")
        .to_string()
}

mod stu3 {
    use super::*;

    pub(super) fn encode(org: &Org) -> Value {
        let mut doc = json!({
            "resourceType": "Organization",
            "id": org.id,
            "name": org.name,
            "identifier": [{"use": "usual", "system": IDENTIFIER_SYSTEM, "value": org.id}],
        });
        if !org.part_of.is_empty() {
            doc["partOf"] = part_of_reference(&org.part_of);
        }
        doc
    }

    pub(super) fn decode(doc: &Value) -> Org {
        Org {
            id: str_at(doc, "/id").to_string(),
            name: str_at(doc, "/name").to_string(),
            part_of: part_of_id(doc),
        }
    }
}

mod r4 {
    use super::*;

    pub(super) fn encode(org: &Org) -> Value {
        let mut doc = json!({
            "resourceType": "Organization",
            "id": org.id,
            "active": true,
            "name": org.name,
            "identifier": [{"use": "usual", "system": IDENTIFIER_SYSTEM, "value": org.id}],
        });
        if !org.part_of.is_empty() {
            doc["partOf"] = part_of_reference(&org.part_of);
        }
        doc
    }

    pub(super) fn decode(doc: &Value) -> Org {
        Org {
            id: str_at(doc, "/id").to_string(),
            name: str_at(doc, "/name").to_string(),
            part_of: part_of_id(doc),
        }
    }
}

fn encode(flavour: FhirFlavour, org: &Org) -> Value {
    match flavour {
        FhirFlavour::Stu3 => stu3::encode(org),
        FhirFlavour::R4 => r4::encode(org),
    }
}

fn decode(flavour: FhirFlavour, doc: &Value) -> Org {
    match flavour {
        FhirFlavour::Stu3 => stu3::decode(doc),
        FhirFlavour::R4 => r4::decode(doc),
    }
}

fn flavour(data: &ResourceData) -> Result<FhirFlavour, ProviderError> {
    data.get_str("version")
        .filter(|v| !v.is_empty())
        .unwrap_or("stu3")
        .parse()
}

fn org_path(id: &str) -> String {
    format!("Organization/{}", id)
}

fn fhir(request: ApiRequest, flavour: FhirFlavour) -> ApiRequest {
    request.header("Accept", flavour.media_type())
}

/// FHIR organization.
#[derive(Debug, Default)]
pub struct CdrOrg;

impl CdrOrg {
    async fn client(ctx: &OpContext, data: &ResourceData) -> Result<std::sync::Arc<ApiClient>, ProviderError> {
        let store = data.require_str("fhir_store")?;
        ctx.registry.fhir(store, data.get_str("org_id").unwrap_or("")).await
    }

    async fn put(
        client: &ApiClient,
        flavour: FhirFlavour,
        data: &ResourceData,
        ctx: &OpContext,
    ) -> Result<Value, ProviderError> {
        let org = Org {
            id: data.require_str("org_id")?.to_string(),
            name: data.require_str("name")?.to_string(),
            part_of: data.get_string("part_of"),
        };
        let body = encode(flavour, &org).to_string().into_bytes();
        let request = fhir(ApiRequest::put(org_path(&org.id)), flavour)
            .body_with_type(flavour.media_type(), body);
        let response = client.send(&request, &ctx.cancel).await?;
        body_json(&response.body)
    }

    async fn purge(
        client: &ApiClient,
        flavour: FhirFlavour,
        id: &str,
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        let request = fhir(ApiRequest::post(format!("{}/$purge", org_path(id))), flavour)
            .header("Prefer", "respond-async");
        let response = client.send(&request, &ctx.cancel).await?;
        if response.status != 202 {
            return Err(ProviderError::InvalidResponse(format!(
                "purge answered {}, expected 202",
                response.status
            )));
        }
        let Some(status_url) = response.location().map(str::to_string) else {
            return Err(ProviderError::InvalidResponse(
                "purge response carried no Location".into(),
            ));
        };
        info!(%id, %status_url, "purge accepted");

        let result = ctx
            .wait_for(
                &["PURGING", "QUEUED", INDETERMINATE],
                &["SUCCESS"],
                Duration::from_secs(10),
                Duration::from_secs(5),
            )
            .failure(&["FAILED"])
            .run(&ctx.cancel, || async {
                let body: Value = client
                    .send_json(&ApiRequest::get(status_url.clone()), &ctx.cancel)
                    .await?;
                Ok(((), str_at(&body, "/status").to_string()))
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(PollError::FailureState(state)) => Err(ProviderError::delete_failed(
                "cdr_org",
                format!("purge status {}", state),
            )),
            Err(other) => Err(other.into()),
        }
    }
}

#[async_trait]
impl Resource for CdrOrg {
    fn type_name(&self) -> &'static str {
        "hsdp_cdr_org"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("fhir_store", Attribute::required_string().with_force_new())
            .with_attribute(
                "org_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("IAM organization id, reused as the FHIR id"),
            )
            .with_attribute("name", Attribute::required_string())
            .with_attribute("part_of", Attribute::optional_string())
            .with_attribute(
                "version",
                Attribute::optional_string()
                    .with_default(Value::from("stu3"))
                    .with_allowed_values(["stu3", "r4"])
                    .with_force_new(),
            )
            .with_attribute(
                "purge_delete",
                Attribute::optional_bool()
                    .with_default(Value::Bool(false))
                    .with_description("Purge all clinical data on delete"),
            )
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let flavour = flavour(data)?;
        let client = Self::client(ctx, data).await?;
        Self::put(&client, flavour, data, ctx).await?;
        let id = data.require_str("org_id")?.to_string();
        info!(%id, version = %flavour, "organization onboarded");
        data.set_id(id);
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let flavour = flavour(data)?;
        if data.get_str("org_id").filter(|o| !o.is_empty()).is_none() {
            let id = data.id().to_string();
            data.set("org_id", id);
        }
        let client = Self::client(ctx, data).await?;
        let doc: Value = client
            .send_json(&fhir(ApiRequest::get(org_path(data.id())), flavour), &ctx.cancel)
            .await?;
        let org = decode(flavour, &doc);
        data.set("name", org.name);
        data.set("part_of", org.part_of);
        data.set("version", flavour.as_str());
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if !data.has_changes(&["name", "part_of"]) {
            return Ok(());
        }
        let flavour = flavour(data)?;
        let client = Self::client(ctx, data).await?;
        Self::put(&client, flavour, data, ctx).await?;
        self.read(ctx, data).await
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let flavour = flavour(data)?;
        let client = Self::client(ctx, data).await?;
        let id = data.id().to_string();
        if data.get_bool("purge_delete") {
            Self::purge(&client, flavour, &id, ctx).await?;
        } else {
            client
                .send(&fhir(ApiRequest::delete(org_path(&id)), flavour), &ctx.cancel)
                .await?;
        }
        data.clear_id();
        Ok(())
    }

    fn import(&self, id: &str) -> Result<Value, ProviderError> {
        let mut state = fhir_tuple(id, "org_id")?;
        state["org_id"] = state["id"].clone();
        Ok(state)
    }
}
