//! `hsdp_function`: container images run by the function runner backend.
//!
//! A function is one code object plus the schedules that run it. The code
//! name is `<name>-<uuid>` and is signed with the backend token; the gateway
//! only forwards calls that carry a valid signature.
//!
//! Three shapes:
//!
//! - `schedule` (cron expression): one schedule whose payload carries the
//!   cron string; the runner interprets it, so the schedule itself never fires.
//! - `run_every`: one recurring schedule at that interval.
//! - neither: a function served through the gateway, backed by a sync and an
//!   async schedule.
//!
//! Every payload is encrypted for the backend cluster. Changing anything the
//! schedules depend on builds a new code object and schedules first and only
//! then cancels the old ones.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::{body_json, created_id, str_at};
use crate::client::{ApiClient, ApiRequest};
use crate::crypto::{code_signature, encrypt_payload};
use crate::error::ProviderError;
use crate::reconcile::{parse_duration, OpContext, Resource};
use crate::registry::FunctionBackend;
use crate::schema::{Attribute, Block, Diagnostic, NestedBlock, Schema};
use crate::state::ResourceData;

/// Interval of schedules that exist only to keep a payload registered.
const DORMANT_INTERVAL_SECS: u64 = 946_080_000;

const DEFAULT_TIMEOUT_SECS: i64 = 1800;

/// Attributes whose change rebuilds the code object and its schedules.
const REBUILD_ON: [&str; 9] = [
    "docker_image",
    "docker_credentials",
    "command",
    "environment",
    "schedule",
    "run_every",
    "start_at",
    "timeout",
    "backend",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum PayloadKind {
    Cron,
    Sync,
    Async,
    Schedule,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Payload {
    version: &'static str,
    #[serde(rename = "type")]
    kind: PayloadKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule: Option<String>,
    code_name: String,
    signature: String,
    command: Vec<String>,
    environment: BTreeMap<String, String>,
}

/// One schedule to register: what to run and how often.
#[derive(Debug, Clone, PartialEq)]
struct Plan {
    payload: Payload,
    run_every: u64,
}

/// Everything needed to build a code object and its schedules.
#[derive(Debug, Clone)]
struct Build {
    name: String,
    image: String,
    credentials: BTreeMap<String, String>,
    command: Vec<String>,
    environment: BTreeMap<String, String>,
    cron: String,
    run_every: String,
    start_at: String,
    timeout: i64,
}

impl Build {
    fn from_data(data: &ResourceData) -> Result<Self, ProviderError> {
        let build = Self {
            name: data.require_str("name")?.to_string(),
            image: data.require_str("docker_image")?.to_string(),
            credentials: data.get_string_map("docker_credentials"),
            command: data.get_string_list("command"),
            environment: data.get_string_map("environment"),
            cron: data.get_string("schedule"),
            run_every: data.get_string("run_every"),
            start_at: data.get_string("start_at"),
            timeout: data.get_i64("timeout").unwrap_or(DEFAULT_TIMEOUT_SECS),
        };
        if !build.cron.is_empty() && !build.run_every.is_empty() {
            return Err(ProviderError::Validation(
                "schedule and run_every are mutually exclusive".into(),
            ));
        }
        Ok(build)
    }

    fn plans(&self, code_name: &str, signature: &str) -> Result<Vec<Plan>, ProviderError> {
        let payload = |kind: PayloadKind, schedule: Option<String>| Payload {
            version: "1",
            kind,
            schedule,
            code_name: code_name.to_string(),
            signature: signature.to_string(),
            command: self.command.clone(),
            environment: self.environment.clone(),
        };
        if !self.cron.is_empty() {
            return Ok(vec![Plan {
                payload: payload(PayloadKind::Cron, Some(self.cron.clone())),
                run_every: DORMANT_INTERVAL_SECS,
            }]);
        }
        if !self.run_every.is_empty() {
            let every = parse_duration(&self.run_every)
                .map_err(|e| ProviderError::Validation(format!("run_every: {}", e)))?;
            if every.as_secs() == 0 {
                return Err(ProviderError::Validation(
                    "run_every must be at least one second".into(),
                ));
            }
            return Ok(vec![Plan {
                payload: payload(PayloadKind::Schedule, None),
                run_every: every.as_secs(),
            }]);
        }
        Ok(vec![
            Plan {
                payload: payload(PayloadKind::Sync, None),
                run_every: DORMANT_INTERVAL_SECS,
            },
            Plan {
                payload: payload(PayloadKind::Async, None),
                run_every: DORMANT_INTERVAL_SECS,
            },
        ])
    }
}

/// Backend block: where the runner lives and how to reach it.
#[derive(Debug, Clone)]
struct Backend {
    api: FunctionBackend,
    cluster_public_key: String,
    gateway: String,
}

impl Backend {
    fn from_data(data: &ResourceData) -> Result<Self, ProviderError> {
        let block = data
            .get_block("backend")
            .ok_or_else(|| ProviderError::Validation("backend block is required".into()))?;
        let field = |key: &str| {
            block
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim_end_matches('/')
                .to_string()
        };
        let backend = Self {
            api: FunctionBackend {
                endpoint: field("endpoint"),
                project: field("project"),
                token: block
                    .get("token")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            },
            cluster_public_key: block
                .get("cluster_public_key")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            gateway: field("gateway"),
        };
        if backend.api.endpoint.is_empty() || backend.api.project.is_empty() {
            return Err(ProviderError::Validation(
                "backend.endpoint and backend.project are required".into(),
            ));
        }
        Ok(backend)
    }

    fn path(&self, rest: &str) -> String {
        format!("/projects/{}/{}", self.api.project, rest)
    }

    fn gateway_base(&self) -> &str {
        if self.gateway.is_empty() {
            &self.api.endpoint
        } else {
            &self.gateway
        }
    }
}

/// The objects one build registered upstream.
#[derive(Debug, Clone)]
struct Deployment {
    code_id: String,
    code_name: String,
    signature: String,
    schedule_ids: Vec<String>,
}

/// Function runner function.
#[derive(Debug, Default)]
pub struct Function;

impl Function {
    async fn client(ctx: &OpContext, backend: &Backend) -> Result<Arc<ApiClient>, ProviderError> {
        ctx.registry.function_backend(&backend.api).await
    }

    async fn deploy(
        client: &ApiClient,
        backend: &Backend,
        build: &Build,
        ctx: &OpContext,
    ) -> Result<Deployment, ProviderError> {
        let code_name = format!("{}-{}", build.name, Uuid::new_v4());
        let signature = code_signature(&backend.api.token, &code_name);
        let plans = build.plans(&code_name, &signature)?;

        let start_at = if build.start_at.is_empty() {
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        } else {
            build.start_at.clone()
        };
        let mut schedules = Vec::with_capacity(plans.len());
        for plan in &plans {
            let plaintext = serde_json::to_vec(&plan.payload)?;
            schedules.push(json!({
                "code_name": code_name,
                "payload": encrypt_payload(&backend.cluster_public_key, &plaintext)?,
                "run_every": plan.run_every,
                "start_at": start_at,
                "timeout": build.timeout,
            }));
        }

        let mut code = json!({
            "name": code_name,
            "image": build.image,
            "env_vars": build.environment,
        });
        if !build.credentials.is_empty() {
            code["docker_creds"] = json!(build.credentials);
        }
        let response = client
            .send(&ApiRequest::post(backend.path("codes")).json(&code), &ctx.cancel)
            .await?;
        let code_id = created_id(&body_json(&response.body)?, response.location())?;
        info!(%code_id, %code_name, "code registered");

        // From here on a failure must not leave the code object behind.
        let scheduled = match client
            .send_json::<Value>(
                &ApiRequest::post(backend.path("schedules")).json(&json!({ "schedules": schedules })),
                &ctx.cancel,
            )
            .await
        {
            Ok(created) => {
                let ids: Vec<String> = created
                    .get("schedules")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|s| str_at(s, "/id").to_string())
                            .filter(|id| !id.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                if ids.len() == plans.len() {
                    Ok(ids)
                } else {
                    let err = ProviderError::InvalidResponse(format!(
                        "requested {} schedule(s), backend returned {}",
                        plans.len(),
                        ids.len()
                    ));
                    Err((ids, err))
                }
            },
            Err(e) => Err((Vec::new(), ProviderError::from(e))),
        };
        let schedule_ids = match scheduled {
            Ok(ids) => ids,
            Err((partial, err)) => {
                if let Err(cleanup) = Self::retire(client, backend, &code_id, &partial, ctx).await {
                    warn!(%code_id, error = %cleanup, "failed to remove code after unsuccessful deploy");
                }
                return Err(err);
            },
        };
        Ok(Deployment {
            code_id,
            code_name,
            signature,
            schedule_ids,
        })
    }

    /// Cancel schedules and remove the code object. Already-absent pieces are fine.
    async fn retire(
        client: &ApiClient,
        backend: &Backend,
        code_id: &str,
        schedule_ids: &[String],
        ctx: &OpContext,
    ) -> Result<(), ProviderError> {
        for id in schedule_ids {
            let request = ApiRequest::post(backend.path(&format!("schedules/{}/cancel", id)));
            match client.send(&request, &ctx.cancel).await {
                Ok(_) => {},
                Err(e) => {
                    let err = ProviderError::from(e);
                    if !err.is_gone() {
                        return Err(err);
                    }
                },
            }
        }
        if code_id.is_empty() {
            return Ok(());
        }
        match client
            .send(
                &ApiRequest::delete(backend.path(&format!("codes/{}", code_id))),
                &ctx.cancel,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = ProviderError::from(e);
                if err.is_gone() {
                    Ok(())
                } else {
                    Err(err)
                }
            },
        }
    }

    fn record(data: &mut ResourceData, backend: &Backend, deployment: Deployment) {
        let base = backend.gateway_base().to_string();
        data.set_id(deployment.code_id.as_str());
        data.set(
            "endpoint",
            format!("{}/function/{}", base, deployment.code_name),
        );
        data.set(
            "async_endpoint",
            format!("{}/async-function/{}", base, deployment.code_name),
        );
        data.set("code_name", deployment.code_name);
        data.set("signature", deployment.signature);
        data.set("schedule_ids", deployment.schedule_ids);
    }
}

#[async_trait]
impl Resource for Function {
    fn type_name(&self) -> &'static str {
        "hsdp_function"
    }

    fn schema(&self) -> Schema {
        let backend = Block::new()
            .with_attribute("endpoint", Attribute::required_string())
            .with_attribute("project", Attribute::required_string())
            .with_attribute("token", Attribute::required_string().sensitive())
            .with_attribute("cluster_public_key", Attribute::required_string())
            .with_attribute("gateway", Attribute::optional_string());

        Schema::v0()
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("docker_image", Attribute::required_string())
            .with_attribute(
                "docker_credentials",
                Attribute::optional_string_map().sensitive(),
            )
            .with_attribute("command", Attribute::optional_string_list())
            .with_attribute("environment", Attribute::optional_string_map().sensitive())
            .with_attribute(
                "schedule",
                Attribute::optional_string()
                    .conflicts_with("run_every")
                    .with_description("Cron expression, e.g. */5 * * * *"),
            )
            .with_attribute(
                "run_every",
                Attribute::optional_string()
                    .conflicts_with("schedule")
                    .with_description("Interval such as 15m"),
            )
            .with_attribute("start_at", Attribute::optional_string())
            .with_attribute(
                "timeout",
                Attribute::optional_int64()
                    .with_default(Value::from(DEFAULT_TIMEOUT_SECS))
                    .with_description("Run timeout in seconds"),
            )
            .with_block(
                "backend",
                NestedBlock::single(backend)
                    .with_min_items(1)
                    .with_max_items(1),
            )
            .with_attribute("code_name", Attribute::computed_string())
            .with_attribute("signature", Attribute::computed_string())
            .with_attribute("schedule_ids", Attribute::computed_string_list())
            .with_attribute("endpoint", Attribute::computed_string())
            .with_attribute("async_endpoint", Attribute::computed_string())
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let build = Build::from_data(data)?;
        let backend = Backend::from_data(data)?;
        let client = Self::client(ctx, &backend).await?;
        let deployment = Self::deploy(&client, &backend, &build, ctx).await?;
        Self::record(data, &backend, deployment);
        Ok(())
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let backend = Backend::from_data(data)?;
        let client = Self::client(ctx, &backend).await?;
        let code: Value = client
            .send_json(
                &ApiRequest::get(backend.path(&format!("codes/{}", data.id()))),
                &ctx.cancel,
            )
            .await?;
        let image = str_at(&code, "/image");
        if !image.is_empty() {
            data.set("docker_image", image);
        }
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if !data.has_changes(&REBUILD_ON) {
            return Ok(());
        }
        let build = Build::from_data(data)?;
        let backend = Backend::from_data(data)?;
        let client = Self::client(ctx, &backend).await?;
        let old_code = data.id().to_string();
        let old_schedules: Vec<String> = data
            .prior("schedule_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let deployment = Self::deploy(&client, &backend, &build, ctx).await?;
        info!(new = %deployment.code_id, old = %old_code, "function rebuilt");
        Self::record(data, &backend, deployment);

        // The old backend may be gone when the backend block itself changed.
        let old_backend = match data.prior("backend") {
            Some(prior) => {
                let prior = ResourceData::new(json!({ "backend": prior.clone() }));
                Backend::from_data(&prior).unwrap_or_else(|_| backend.clone())
            },
            None => backend.clone(),
        };
        let old_client = Self::client(ctx, &old_backend).await?;
        if let Err(e) = Self::retire(&old_client, &old_backend, &old_code, &old_schedules, ctx).await {
            warn!(code = %old_code, error = %e, "old function not retired");
            data.warn(
                Diagnostic::warning("previous function version was not cleaned up")
                    .with_detail(e.to_string()),
            );
        }
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let backend = Backend::from_data(data)?;
        let client = Self::client(ctx, &backend).await?;
        let code_id = data.id().to_string();
        let schedules = data.get_string_list("schedule_ids");
        Self::retire(&client, &backend, &code_id, &schedules, ctx).await?;
        data.clear_id();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(cron: &str, run_every: &str) -> Build {
        Build {
            name: "hello".into(),
            image: "philipslabs/hello:latest".into(),
            credentials: BTreeMap::new(),
            command: vec!["/app/run".into()],
            environment: BTreeMap::from([("MODE".to_string(), "test".to_string())]),
            cron: cron.into(),
            run_every: run_every.into(),
            start_at: String::new(),
            timeout: 60,
        }
    }

    #[test]
    fn test_cron_is_one_dormant_schedule() {
        let plans = build("*/5 * * * *", "").plans("hello-1", "sig").unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].run_every, DORMANT_INTERVAL_SECS);
        let payload = serde_json::to_value(&plans[0].payload).unwrap();
        assert_eq!(payload["type"], "cron");
        assert_eq!(payload["schedule"], "*/5 * * * *");
        assert_eq!(payload["environment"]["MODE"], "test");
    }

    #[test]
    fn test_function_is_sync_and_async_pair() {
        let plans = build("", "").plans("hello-1", "sig").unwrap();
        let kinds: Vec<PayloadKind> = plans.iter().map(|p| p.payload.kind).collect();
        assert_eq!(kinds, vec![PayloadKind::Sync, PayloadKind::Async]);
        assert!(plans.iter().all(|p| p.run_every == DORMANT_INTERVAL_SECS));
        let payload = serde_json::to_value(&plans[0].payload).unwrap();
        assert!(payload.get("schedule").is_none());
    }

    #[test]
    fn test_run_every_interval() {
        let plans = build("", "15m").plans("hello-1", "sig").unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].run_every, 900);
        assert_eq!(plans[0].payload.kind, PayloadKind::Schedule);
        assert!(build("", "soon").plans("hello-1", "sig").is_err());
    }

    #[test]
    fn test_schedule_conflicts_with_run_every() {
        let data = ResourceData::new(json!({
            "name": "hello",
            "docker_image": "img",
            "schedule": "*/5 * * * *",
            "run_every": "5m"
        }));
        assert!(Build::from_data(&data).is_err());
    }

    #[test]
    fn test_backend_requires_project() {
        let data = ResourceData::new(json!({
            "backend": [{"endpoint": "https://runner", "token": "t", "cluster_public_key": "k"}]
        }));
        assert!(Backend::from_data(&data).is_err());

        let data = ResourceData::new(json!({
            "backend": [{"endpoint": "https://runner/", "project": "p", "token": "t", "cluster_public_key": "k"}]
        }));
        let backend = Backend::from_data(&data).unwrap();
        assert_eq!(backend.path("codes"), "/projects/p/codes");
        assert_eq!(backend.gateway_base(), "https://runner");
    }
}
