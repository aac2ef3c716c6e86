//! `hsdp_metrics_autoscaler`: per-application autoscaling rules of a metrics
//! instance, managed through the console API.
//!
//! The rule set always exists upstream, so create and update are the same
//! PUT and delete disables it.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::client::{ApiClient, ApiRequest};
use crate::error::ProviderError;
use crate::import::parse_tuple;
use crate::reconcile::{OpContext, Resource};
use crate::schema::{Attribute, Block, NestedBlock, Schema};
use crate::state::ResourceData;

/// Threshold blocks and the upstream metric each one controls.
const THRESHOLDS: [(&str, &str); 4] = [
    ("threshold_cpu", "cpu"),
    ("threshold_memory", "memory"),
    ("threshold_http_rate", "http-rate"),
    ("threshold_http_latency", "http-latency"),
];

const FIELDS: [&str; 2] = ["metrics_instance_id", "app_name"];

fn autoscaler_path(instance: &str, app: &str) -> String {
    format!("/v3/metrics/{}/autoscalers/{}", instance, app)
}

fn threshold_block() -> NestedBlock {
    NestedBlock::single(
        Block::new()
            .with_attribute(
                "enabled",
                Attribute::optional_bool().with_default(Value::Bool(false)),
            )
            .with_attribute("min", Attribute::optional_int64())
            .with_attribute("max", Attribute::optional_int64()),
    )
    .with_max_items(1)
}

fn document(data: &ResourceData) -> Value {
    let thresholds: Vec<Value> = THRESHOLDS
        .iter()
        .map(|(block, metric)| {
            let fields = data.get_block(block);
            let field = |key: &str| fields.and_then(|f| f.get(key)).cloned();
            json!({
                "name": metric,
                "enabled": field("enabled").and_then(|v| v.as_bool()).unwrap_or(false),
                "min": field("min").unwrap_or(Value::Null),
                "max": field("max").unwrap_or(Value::Null),
            })
        })
        .collect();
    json!({
        "enabled": data.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        "minInstances": data.get_i64("min_instances").unwrap_or(1),
        "maxInstances": data.get_i64("max_instances").unwrap_or(1),
        "thresholds": thresholds,
    })
}

fn apply(data: &mut ResourceData, rules: &Value) {
    if let Some(enabled) = rules.get("enabled").and_then(Value::as_bool) {
        data.set("enabled", enabled);
    }
    if let Some(min) = rules.get("minInstances").and_then(Value::as_i64) {
        data.set("min_instances", min);
    }
    if let Some(max) = rules.get("maxInstances").and_then(Value::as_i64) {
        data.set("max_instances", max);
    }
    let Some(thresholds) = rules.get("thresholds").and_then(Value::as_array) else {
        return;
    };
    for (block, metric) in THRESHOLDS {
        let Some(threshold) = thresholds
            .iter()
            .find(|t| t.get("name").and_then(Value::as_str) == Some(metric))
        else {
            continue;
        };
        let mut fields = Map::new();
        fields.insert(
            "enabled".into(),
            Value::Bool(threshold.get("enabled").and_then(Value::as_bool).unwrap_or(false)),
        );
        for key in ["min", "max"] {
            if let Some(n) = threshold.get(key).and_then(Value::as_i64) {
                fields.insert(key.into(), Value::from(n));
            }
        }
        data.set(block, Value::Array(vec![Value::Object(fields)]));
    }
}

/// Application autoscaler.
#[derive(Debug, Default)]
pub struct MetricsAutoscaler;

impl MetricsAutoscaler {
    fn target(data: &ResourceData) -> Result<(String, String), ProviderError> {
        Ok((
            data.require_str("metrics_instance_id")?.to_string(),
            data.require_str("app_name")?.to_string(),
        ))
    }

    async fn put(
        client: &ApiClient,
        data: &ResourceData,
        body: &Value,
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        let (instance, app) = Self::target(data)?;
        client
            .send(&ApiRequest::put(autoscaler_path(&instance, &app)).json(body), &ctx.cancel)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Resource for MetricsAutoscaler {
    fn type_name(&self) -> &'static str {
        "hsdp_metrics_autoscaler"
    }

    fn schema(&self) -> Schema {
        let mut schema = Schema::v0()
            .with_id()
            .with_attribute("metrics_instance_id", Attribute::required_string().with_force_new())
            .with_attribute("app_name", Attribute::required_string().with_force_new())
            .with_attribute(
                "enabled",
                Attribute::optional_bool().with_default(Value::Bool(true)),
            )
            .with_attribute(
                "min_instances",
                Attribute::optional_int64().with_default(Value::from(1)),
            )
            .with_attribute(
                "max_instances",
                Attribute::optional_int64().with_default(Value::from(1)),
            );
        for (block, _) in THRESHOLDS {
            schema = schema.with_block(block, threshold_block());
        }
        schema.with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.console().await?;
        Self::put(&client, data, &document(data), ctx).await?;
        let (instance, app) = Self::target(data)?;
        info!(%instance, %app, "autoscaler configured");
        data.set_id(format!("{},{}", instance, app));
        self.read(ctx, data).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if data.get_str("app_name").filter(|a| !a.is_empty()).is_none() {
            let id = data.id().to_string();
            let parts = parse_tuple(&id, &FIELDS)?;
            data.set("metrics_instance_id", parts[0]);
            data.set("app_name", parts[1]);
        }
        let client = ctx.registry.console().await?;
        let (instance, app) = Self::target(data)?;
        let body: Value = client
            .send_json(&ApiRequest::get(autoscaler_path(&instance, &app)), &ctx.cancel)
            .await?;
        apply(data, body.get("data").unwrap_or(&body));
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let mut keys = vec!["enabled", "min_instances", "max_instances"];
        keys.extend(THRESHOLDS.iter().map(|(block, _)| *block));
        if !data.has_changes(&keys) {
            return Ok(());
        }
        let client = ctx.registry.console().await?;
        Self::put(&client, data, &document(data), ctx).await?;
        self.read(ctx, data).await
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.console().await?;
        let mut body = document(data);
        body["enabled"] = Value::Bool(false);
        Self::put(&client, data, &body, ctx).await?;
        data.clear_id();
        Ok(())
    }

    fn import(&self, id: &str) -> Result<Value, ProviderError> {
        let parts = parse_tuple(id, &FIELDS)?;
        Ok(json!({
            "id": format!("{},{}", parts[0], parts[1]),
            "metrics_instance_id": parts[0],
            "app_name": parts[1],
        }))
    }
}
