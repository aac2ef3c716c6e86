//! `hsdp_notification_topic`: notification topics owned by a producer.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{body_json, created_id, str_at};
use crate::client::ApiRequest;
use crate::error::ProviderError;
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Schema};
use crate::state::ResourceData;

const TOPICS: &str = "/core/notification/Topic";

fn topic_path(id: &str) -> String {
    format!("{}/{}", TOPICS, id)
}

fn document(data: &ResourceData) -> Value {
    json!({
        "name": data.get_string("name"),
        "producerId": data.get_string("producer_id"),
        "scope": data.get_str("scope").filter(|s| !s.is_empty()).unwrap_or("public"),
        "allowedScopes": data.get_string_set("allowed_scopes"),
        "isAuditable": data.get_bool("is_auditable"),
        "description": data.get_string("description"),
    })
}

/// Topic id: the service answers with `_id`.
fn topic_id(body: &Value, location: Option<&str>) -> Result<String, ProviderError> {
    match str_at(body, "/_id") {
        "" => created_id(body, location),
        id => Ok(id.to_string()),
    }
}

/// Notification topic.
#[derive(Debug, Default)]
pub struct NotificationTopic;

#[async_trait]
impl Resource for NotificationTopic {
    fn type_name(&self) -> &'static str {
        "hsdp_notification_topic"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("producer_id", Attribute::required_string().with_force_new())
            .with_attribute(
                "scope",
                Attribute::optional_string()
                    .with_default(Value::from("public"))
                    .with_allowed_values(["public", "private"]),
            )
            .with_attribute("allowed_scopes", Attribute::optional_string_set())
            .with_attribute(
                "is_auditable",
                Attribute::optional_bool().with_default(Value::Bool(false)),
            )
            .with_attribute("description", Attribute::optional_string())
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.notification().await?;
        let response = client
            .send(&ApiRequest::post(TOPICS).json(&document(data)), &ctx.cancel)
            .await?;
        let id = topic_id(&body_json(&response.body)?, response.location())?;
        info!(%id, "topic created");
        data.set_id(id);
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.notification().await?;
        let topic: Value = client
            .send_json(&ApiRequest::get(topic_path(data.id())), &ctx.cancel)
            .await?;
        data.set("name", str_at(&topic, "/name"));
        data.set("producer_id", str_at(&topic, "/producerId"));
        data.set("scope", str_at(&topic, "/scope"));
        data.set("description", str_at(&topic, "/description"));
        data.set(
            "is_auditable",
            topic.get("isAuditable").and_then(Value::as_bool).unwrap_or(false),
        );
        let scopes = topic
            .get("allowedScopes")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        data.set_string_set("allowed_scopes", scopes);
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if !data.has_changes(&["scope", "allowed_scopes", "is_auditable", "description"]) {
            return Ok(());
        }
        let client = ctx.registry.notification().await?;
        let id = data.id().to_string();
        let mut body = document(data);
        body["_id"] = Value::from(id.as_str());
        client
            .send(&ApiRequest::put(topic_path(&id)).json(&body), &ctx.cancel)
            .await?;
        self.read(ctx, data).await
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.notification().await?;
        let id = data.id().to_string();
        client
            .send(&ApiRequest::delete(topic_path(&id)), &ctx.cancel)
            .await?;
        data.clear_id();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_id_prefers_underscore_id() {
        assert_eq!(topic_id(&json!({"_id": "t-1"}), None).unwrap(), "t-1");
        assert_eq!(topic_id(&json!({"id": "t-2"}), None).unwrap(), "t-2");
        assert_eq!(
            topic_id(&json!({}), Some("/core/notification/Topic/t-3")).unwrap(),
            "t-3"
        );
    }

    #[test]
    fn test_document_defaults_scope() {
        let doc = document(&ResourceData::new(json!({"name": "alerts", "producer_id": "p"})));
        assert_eq!(doc["scope"], "public");
        assert_eq!(doc["producerId"], "p");
        assert_eq!(doc["allowedScopes"], json!([]));
    }
}
