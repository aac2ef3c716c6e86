//! `hsdp_cdr_subscription`: FHIR rest-hook subscriptions.
//!
//! STU3 and R4 subscriptions are separate document types. The STU3 one carries
//! the vendor `DeleteUrl` extension; R4 has no equivalent. Updates are sent as
//! a JSON patch computed against the document the store returned, so fields
//! this provider does not manage are left alone.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{body_json, created_id};
use crate::client::{ApiClient, ApiRequest};
use crate::diff::DiffSuppress;
use crate::error::ProviderError;
use crate::import::{fhir_tuple, FhirFlavour};
use crate::patch;
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Schema};
use crate::state::ResourceData;

const DELETE_URL_EXTENSION: &str = "http://foundation.hsdp.io/fhir/StructureDefinition/DeleteUrl";
const JSON_PATCH: &str = "application/json-patch+json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Channel {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    payload: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    header: Vec<String>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

impl Channel {
    fn rest_hook(data: &ResourceData) -> Self {
        Self {
            kind: "rest-hook".into(),
            endpoint: data.get_string("endpoint"),
            payload: "application/fhir+json".into(),
            header: data.get_string_list("headers"),
            other: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Extension {
    url: String,
    #[serde(rename = "valueUri", default, skip_serializing_if = "String::is_empty")]
    value_uri: String,
    #[serde(flatten)]
    other: Map<String, Value>,
}

/// STU3 `Subscription`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stu3Subscription {
    resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    status: String,
    criteria: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    end: String,
    channel: Channel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extension: Vec<Extension>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

impl Stu3Subscription {
    fn delete_endpoint(&self) -> String {
        self.extension
            .iter()
            .find(|e| e.url == DELETE_URL_EXTENSION)
            .map(|e| e.value_uri.clone())
            .unwrap_or_default()
    }

    fn apply(&mut self, data: &ResourceData) {
        self.criteria = data.get_string("criteria");
        self.reason = data.get_string("reason");
        self.end = data.get_string("end");
        let channel = Channel::rest_hook(data);
        self.channel.endpoint = channel.endpoint;
        self.channel.header = channel.header;
        self.extension.retain(|e| e.url != DELETE_URL_EXTENSION);
        let delete_endpoint = data.get_string("delete_endpoint");
        if !delete_endpoint.is_empty() {
            self.extension.push(Extension {
                url: DELETE_URL_EXTENSION.into(),
                value_uri: delete_endpoint,
                other: Map::new(),
            });
        }
    }
}

/// R4 `Subscription`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct R4Subscription {
    resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    status: String,
    criteria: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    end: String,
    channel: Channel,
    #[serde(flatten)]
    other: Map<String, Value>,
}

impl R4Subscription {
    fn apply(&mut self, data: &ResourceData) {
        self.criteria = data.get_string("criteria");
        self.reason = data.get_string("reason");
        self.end = data.get_string("end");
        let channel = Channel::rest_hook(data);
        self.channel.endpoint = channel.endpoint;
        self.channel.header = channel.header;
    }
}

/// Either release's document.
#[derive(Debug, Clone, PartialEq)]
enum Subscription {
    Stu3(Stu3Subscription),
    R4(R4Subscription),
}

fn invalid(e: serde_json::Error) -> ProviderError {
    ProviderError::InvalidResponse(format!("subscription document: {}", e))
}

impl Subscription {
    fn new(flavour: FhirFlavour, data: &ResourceData) -> Self {
        let channel = Channel::rest_hook(data);
        match flavour {
            FhirFlavour::Stu3 => {
                let mut sub = Stu3Subscription {
                    resource_type: "Subscription".into(),
                    id: None,
                    status: "requested".into(),
                    criteria: String::new(),
                    reason: String::new(),
                    end: String::new(),
                    channel,
                    extension: Vec::new(),
                    other: Map::new(),
                };
                sub.apply(data);
                Self::Stu3(sub)
            },
            FhirFlavour::R4 => {
                let mut sub = R4Subscription {
                    resource_type: "Subscription".into(),
                    id: None,
                    status: "requested".into(),
                    criteria: String::new(),
                    reason: String::new(),
                    end: String::new(),
                    channel,
                    other: Map::new(),
                };
                sub.apply(data);
                Self::R4(sub)
            },
        }
    }

    fn decode(flavour: FhirFlavour, doc: &Value) -> Result<Self, ProviderError> {
        Ok(match flavour {
            FhirFlavour::Stu3 => Self::Stu3(serde_json::from_value(doc.clone()).map_err(invalid)?),
            FhirFlavour::R4 => Self::R4(serde_json::from_value(doc.clone()).map_err(invalid)?),
        })
    }

    fn encode(&self) -> Result<Value, ProviderError> {
        let value = match self {
            Self::Stu3(sub) => serde_json::to_value(sub),
            Self::R4(sub) => serde_json::to_value(sub),
        };
        Ok(value?)
    }

    fn apply(&mut self, data: &ResourceData) {
        match self {
            Self::Stu3(sub) => sub.apply(data),
            Self::R4(sub) => sub.apply(data),
        }
    }

    fn write(&self, data: &mut ResourceData) {
        let (criteria, reason, end, status, channel, delete_endpoint) = match self {
            Self::Stu3(s) => (&s.criteria, &s.reason, &s.end, &s.status, &s.channel, s.delete_endpoint()),
            Self::R4(s) => (&s.criteria, &s.reason, &s.end, &s.status, &s.channel, String::new()),
        };
        data.set("criteria", criteria.as_str());
        data.set("reason", reason.as_str());
        data.set("end", end.as_str());
        data.set("status", status.as_str());
        data.set("endpoint", channel.endpoint.as_str());
        data.set("headers", channel.header.clone());
        if matches!(self, Self::Stu3(_)) {
            data.set("delete_endpoint", delete_endpoint);
        }
    }
}

fn flavour(data: &ResourceData) -> Result<FhirFlavour, ProviderError> {
    let flavour: FhirFlavour = data
        .get_str("version")
        .filter(|v| !v.is_empty())
        .unwrap_or("stu3")
        .parse()?;
    if flavour == FhirFlavour::R4 && !data.get_string("delete_endpoint").is_empty() {
        return Err(ProviderError::Validation(
            "delete_endpoint is only supported for stu3 subscriptions".into(),
        ));
    }
    Ok(flavour)
}

fn subscription_path(id: &str) -> String {
    format!("Subscription/{}", id)
}

/// FHIR subscription.
#[derive(Debug, Default)]
pub struct CdrSubscription;

impl CdrSubscription {
    async fn client(ctx: &OpContext, data: &ResourceData) -> Result<std::sync::Arc<ApiClient>, ProviderError> {
        ctx.registry.fhir(data.require_str("fhir_store")?, "").await
    }

    async fn fetch(
        client: &ApiClient,
        flavour: FhirFlavour,
        id: &str,
        ctx: &OpContext,
    ) -> Result<Value, ProviderError> {
        let request = ApiRequest::get(subscription_path(id)).header("Accept", flavour.media_type());
        Ok(client.send_json(&request, &ctx.cancel).await?)
    }
}

#[async_trait]
impl Resource for CdrSubscription {
    fn type_name(&self) -> &'static str {
        "hsdp_cdr_subscription"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("fhir_store", Attribute::required_string().with_force_new())
            .with_attribute("criteria", Attribute::required_string().with_force_new())
            .with_attribute("endpoint", Attribute::required_string())
            .with_attribute(
                "headers",
                Attribute::optional_string_list().with_description("Headers sent with every notification, as `Name: value`"),
            )
            .with_attribute("reason", Attribute::optional_string())
            .with_attribute(
                "end",
                Attribute::optional_string().with_diff_suppress(DiffSuppress::Rfc3339),
            )
            .with_attribute(
                "delete_endpoint",
                Attribute::optional_string().with_description("Called when a subscribed resource is deleted (stu3 only)"),
            )
            .with_attribute("status", Attribute::computed_string())
            .with_attribute(
                "version",
                Attribute::optional_string()
                    .with_default(Value::from("stu3"))
                    .with_allowed_values(["stu3", "r4"])
                    .with_force_new(),
            )
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let flavour = flavour(data)?;
        let client = Self::client(ctx, data).await?;
        let body = Subscription::new(flavour, data).encode()?;
        let request = ApiRequest::post("Subscription")
            .header("Accept", flavour.media_type())
            .body_with_type(flavour.media_type(), body.to_string().into_bytes());
        let response = client.send(&request, &ctx.cancel).await?;
        let id = created_id(&body_json(&response.body)?, response.location())?;
        info!(%id, version = %flavour, "subscription created");
        data.set_id(id);
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let flavour = flavour(data)?;
        let client = Self::client(ctx, data).await?;
        let doc = Self::fetch(&client, flavour, data.id(), ctx).await?;
        Subscription::decode(flavour, &doc)?.write(data);
        data.set("version", flavour.as_str());
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if !data.has_changes(&["endpoint", "headers", "reason", "end", "delete_endpoint"]) {
            return Ok(());
        }
        let flavour = flavour(data)?;
        let client = Self::client(ctx, data).await?;
        let id = data.id().to_string();

        let stored = Self::fetch(&client, flavour, &id, ctx).await?;
        let mut subscription = Subscription::decode(flavour, &stored)?;
        let before = subscription.encode()?;
        subscription.apply(data);
        let ops = patch::diff(&before, &subscription.encode()?);
        if ops.is_empty() {
            debug!(%id, "subscription already matches");
            return self.read(ctx, data).await;
        }
        info!(%id, ops = ops.len(), "patching subscription");
        let request = ApiRequest::patch(subscription_path(&id))
            .header("Accept", flavour.media_type())
            .body_with_type(JSON_PATCH, serde_json::to_vec(&ops)?);
        client.send(&request, &ctx.cancel).await?;
        self.read(ctx, data).await
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = Self::client(ctx, data).await?;
        let id = data.id().to_string();
        client
            .send(&ApiRequest::delete(subscription_path(&id)), &ctx.cancel)
            .await?;
        data.clear_id();
        Ok(())
    }

    fn import(&self, id: &str) -> Result<Value, ProviderError> {
        fhir_tuple(id, "subscription_id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored_stu3() -> Value {
        json!({
            "resourceType": "Subscription",
            "id": "sub-1",
            "meta": {"versionId": "1"},
            "status": "active",
            "criteria": "Patient?",
            "reason": "sync",
            "channel": {
                "type": "rest-hook",
                "endpoint": "https://hook.example/notify",
                "payload": "application/fhir+json",
                "header": ["A: 1"]
            },
            "extension": [{"url": DELETE_URL_EXTENSION, "valueUri": "https://hook.example/deleted"}]
        })
    }

    #[test]
    fn test_stu3_header_change_patches_only_headers() {
        let stored = stored_stu3();
        let mut sub = Subscription::decode(FhirFlavour::Stu3, &stored).unwrap();
        let before = sub.encode().unwrap();
        assert_eq!(before, stored);

        let data = ResourceData::new(json!({
            "criteria": "Patient?",
            "reason": "sync",
            "endpoint": "https://hook.example/notify",
            "headers": ["A: 1", "B: 2"],
            "delete_endpoint": "https://hook.example/deleted"
        }));
        sub.apply(&data);
        let ops = patch::diff(&before, &sub.encode().unwrap());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].path(), "/channel/header/1");
    }

    #[test]
    fn test_write_reads_delete_extension() {
        let sub = Subscription::decode(FhirFlavour::Stu3, &stored_stu3()).unwrap();
        let mut data = ResourceData::new(json!({"id": "sub-1"}));
        sub.write(&mut data);
        assert_eq!(data.get_str("delete_endpoint"), Some("https://hook.example/deleted"));
        assert_eq!(data.get_str("status"), Some("active"));
        assert_eq!(data.get_string_list("headers"), vec!["A: 1"]);
    }

    #[test]
    fn test_r4_rejects_delete_endpoint() {
        let data = ResourceData::new(json!({
            "version": "r4",
            "delete_endpoint": "https://hook.example/deleted"
        }));
        let err = flavour(&data).unwrap_err();
        assert!(err.to_string().contains("stu3"));
    }

    #[test]
    fn test_new_r4_has_no_extension() {
        let data = ResourceData::new(json!({
            "criteria": "Observation?",
            "endpoint": "https://hook.example/notify"
        }));
        let doc = Subscription::new(FhirFlavour::R4, &data).encode().unwrap();
        assert_eq!(doc["status"], "requested");
        assert_eq!(doc["channel"]["type"], "rest-hook");
        assert!(doc.get("extension").is_none());
        assert!(doc["channel"].get("header").is_none());
    }
}
