//! `hsdp_container_host`: fleet instances with post-boot provisioning.
//!
//! Create asks the fleet API for an instance, waits for it to run, then (when
//! `file` blocks or `commands` are set) waits for SSH, uploads the files and
//! runs the commands in order. The first failing command fails the apply;
//! the next apply adopts the instance through the create conflict path.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{ensure_adoptable, str_at};
use crate::client::{ApiClient, ApiRequest};
use crate::error::ProviderError;
use crate::poll::{PollError, INDETERMINATE};
use crate::reconcile::{OpContext, Resource, Timeouts};
use crate::schema::{Attribute, Block, NestedBlock, Schema};
use crate::ssh::{IdentityFile, Launcher, SshSession, SshTarget};
use crate::state::ResourceData;

const CREATE: &str = "/v3/api/create";
const DETAILS: &str = "/v3/api/instance_details";
const ADD_TAGS: &str = "/v3/api/add_tags";
const REMOVE_TAGS: &str = "/v3/api/remove_tags";
const DESTROY: &str = "/v3/api/destroy";

const TERMINATED: &str = "terminated";

/// One file to place on the host before commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Upload {
    content: String,
    destination: String,
    permissions: String,
}

fn uploads(data: &ResourceData) -> Vec<Upload> {
    data.get("file")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| Upload {
                    content: str_at(item, "/content").to_string(),
                    destination: str_at(item, "/destination").to_string(),
                    permissions: str_at(item, "/permissions").to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn tag_object<'a>(tags: impl IntoIterator<Item = (&'a String, &'a String)>) -> Value {
    Value::Object(
        tags.into_iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect::<Map<String, Value>>(),
    )
}

/// `(upserted, removed)` tags relative to the prior snapshot.
fn tag_changes(data: &ResourceData) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let after = data.get_string_map("tags");
    let before: BTreeMap<String, String> = data
        .prior("tags")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let upserted = after
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let removed = before
        .iter()
        .filter(|(k, _)| !after.contains_key(*k))
        .map(|(k, _)| (k.clone(), String::new()))
        .collect();
    (upserted, removed)
}

/// Fleet container host.
#[derive(Debug, Default)]
pub struct ContainerHost;

impl ContainerHost {
    async fn details(
        client: &ApiClient,
        name: &str,
        ctx: &OpContext,
    ) -> Result<Value, ProviderError> {
        let request = ApiRequest::post(DETAILS).json(&json!({ "ec2_name": name }));
        Ok(client.send_json(&request, &ctx.cancel).await?)
    }

    async fn wait_for_state(
        client: &ApiClient,
        name: &str,
        pending: &[&str],
        target: &[&str],
        failure: &[&str],
        ctx: &OpContext,
    ) -> Result<Value, ProviderError> {
        let result = ctx
            .wait_for(pending, target, Duration::from_secs(10), Duration::from_secs(5))
            .failure(failure)
            .run(&ctx.cancel, || async {
                match Self::details(client, name, ctx).await {
                    Ok(details) => {
                        let state = str_at(&details, "/instance_state").to_string();
                        Ok((details, state))
                    },
                    Err(e) if e.is_gone() && target.contains(&TERMINATED) => {
                        Ok((Value::Null, TERMINATED.to_string()))
                    },
                    Err(e) => Err(e),
                }
            })
            .await;
        match result {
            Ok(details) => Ok(details),
            Err(PollError::FailureState(state)) if target.contains(&TERMINATED) => Err(
                ProviderError::delete_failed("container_host", format!("instance state {}", state)),
            ),
            Err(other) => Err(other.into()),
        }
    }

    async fn provision(
        ctx: &OpContext,
        data: &ResourceData,
        host: &str,
    ) -> Result<(), ProviderError> {
        let files = uploads(data);
        let commands = data.get_string_list("commands");
        if files.is_empty() && commands.is_empty() {
            return Ok(());
        }
        let user = data.get_string("user");
        let private_key = data.get_string("private_key");
        if user.is_empty() || private_key.is_empty() {
            return Err(ProviderError::Validation(
                "user and private_key are required to provision files or commands".into(),
            ));
        }

        let identity = IdentityFile::write(&private_key).await?;
        let target = SshTarget::new(host, user)
            .with_bastion(data.get_string("bastion_host"))
            .with_identity_file(identity.path());
        let session = SshSession::new(Launcher::Ssh(target));

        ctx.wait_for(
            &["unreachable", INDETERMINATE],
            &["reachable"],
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
        .run(&ctx.cancel, || async {
            match session.run("true", None, &ctx.cancel).await {
                Ok(_) => Ok(((), "reachable".to_string())),
                Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
                Err(e) => {
                    warn!(%host, error = %e, "host not reachable over ssh yet");
                    Ok(((), "unreachable".to_string()))
                },
            }
        })
        .await?;

        for file in &files {
            session
                .upload(
                    file.content.as_bytes(),
                    &file.destination,
                    Some(file.permissions.as_str()),
                    &ctx.cancel,
                )
                .await?;
        }
        session.run_all(&commands, &ctx.cancel).await?;
        info!(%host, files = files.len(), commands = commands.len(), "host provisioned");
        Ok(())
    }

    fn apply(data: &mut ResourceData, details: &Value) {
        data.set("instance_id", str_at(details, "/instance_id"));
        data.set("private_ip", str_at(details, "/private_address"));
        data.set("role", str_at(details, "/role"));
        data.set("state", str_at(details, "/instance_state"));
        let instance_type = str_at(details, "/instance_type");
        if !instance_type.is_empty() {
            data.set("instance_type", instance_type);
        }
        if let Some(tags) = details.get("tags").filter(|t| t.is_object()) {
            data.set("tags", tags.clone());
        }
    }
}

#[async_trait]
impl Resource for ContainerHost {
    fn type_name(&self) -> &'static str {
        "hsdp_container_host"
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::minutes(12, 12, 22)
    }

    fn schema(&self) -> Schema {
        let file = Block::new()
            .with_attribute("content", Attribute::required_string().sensitive())
            .with_attribute("destination", Attribute::required_string())
            .with_attribute("permissions", Attribute::optional_string());

        Schema::v0()
            .with_id()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute(
                "instance_type",
                Attribute::optional_string()
                    .with_default(Value::from("t2.medium"))
                    .with_force_new(),
            )
            .with_attribute("image", Attribute::optional_string().with_force_new())
            .with_attribute(
                "instance_role",
                Attribute::optional_string()
                    .with_default(Value::from("container-host"))
                    .with_force_new(),
            )
            .with_attribute("volume_type", Attribute::optional_string().with_force_new())
            .with_attribute("iops", Attribute::optional_int64().with_force_new())
            .with_attribute(
                "encrypt_volumes",
                Attribute::optional_bool()
                    .with_default(Value::Bool(true))
                    .with_force_new(),
            )
            .with_attribute("security_groups", Attribute::optional_string_set().with_force_new())
            .with_attribute("user_groups", Attribute::optional_string_set().with_force_new())
            .with_attribute("tags", Attribute::optional_string_map())
            .with_attribute("user", Attribute::optional_string())
            .with_attribute("private_key", Attribute::optional_string().sensitive())
            .with_attribute("bastion_host", Attribute::optional_string())
            .with_attribute(
                "commands",
                Attribute::optional_string_list()
                    .with_force_new()
                    .with_description("Run once over SSH after the files are uploaded"),
            )
            .with_block("file", NestedBlock::list(file).with_force_new())
            .with_attribute("instance_id", Attribute::computed_string())
            .with_attribute("private_ip", Attribute::computed_string())
            .with_attribute("role", Attribute::computed_string())
            .with_attribute("state", Attribute::computed_string())
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.cartel().await?;
        let name = data.require_str("name")?.to_string();
        let instance_type = data.get_string("instance_type");
        let body = json!({
            "ec2_name": name,
            "instance_type": instance_type,
            "image": data.get_string("image"),
            "role": data.get_string("instance_role"),
            "volume_type": data.get_string("volume_type"),
            "iops": data.get_i64("iops").unwrap_or(0),
            "encrypt_vols": data.get_bool("encrypt_volumes"),
            "security_group": data.get_string_set("security_groups"),
            "user_groups": data.get_string_set("user_groups"),
            "tags": data.get("tags").cloned().unwrap_or_else(|| json!({})),
        });

        match client.send(&ApiRequest::post(CREATE).json(&body), &ctx.cancel).await {
            Ok(_) => info!(%name, "instance requested"),
            Err(e) => {
                let err = ProviderError::from(e);
                if !err.is_conflict(true) {
                    return Err(err);
                }
                let existing = match Self::details(&client, &name, ctx).await {
                    Ok(details) => details,
                    Err(_) => return Err(err),
                };
                ensure_adoptable(
                    "container host",
                    &name,
                    &self.schema(),
                    &[(
                        "instance_type",
                        instance_type.as_str(),
                        str_at(&existing, "/instance_type"),
                    )],
                )?;
                info!(%name, "adopting existing instance");
            },
        }

        let details = Self::wait_for_state(
            &client,
            &name,
            &["pending", "provisioning", INDETERMINATE],
            &["running", "succeeded"],
            &["failed", TERMINATED, "shutting-down", "stopped"],
            ctx,
        )
        .await?;
        let instance_id = str_at(&details, "/instance_id").to_string();
        if instance_id.is_empty() {
            return Err(ProviderError::InvalidResponse(format!(
                "instance {} reported no instance_id",
                name
            )));
        }
        data.set_id(instance_id);
        Self::apply(data, &details);

        let host = str_at(&details, "/private_address").to_string();
        Self::provision(ctx, data, &host).await
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.cartel().await?;
        let name = data.require_str("name")?.to_string();
        let details = Self::details(&client, &name, ctx).await?;
        let actual = str_at(&details, "/instance_id");
        if str_at(&details, "/instance_state") == TERMINATED {
            info!(%name, "instance terminated");
            data.clear_id();
            return Ok(());
        }
        if actual != data.id() {
            return Err(ProviderError::InstanceIdMismatch {
                expected: data.id().to_string(),
                actual: actual.to_string(),
            });
        }
        Self::apply(data, &details);
        Ok(())
    }

    async fn update(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        if !data.has_change("tags") {
            return Ok(());
        }
        let client = ctx.registry.cartel().await?;
        let name = data.require_str("name")?.to_string();
        let (upserted, removed) = tag_changes(data);
        if !upserted.is_empty() {
            let body = json!({ "ec2_name": name, "tags": tag_object(&upserted) });
            client.send(&ApiRequest::post(ADD_TAGS).json(&body), &ctx.cancel).await?;
        }
        if !removed.is_empty() {
            let body = json!({ "ec2_name": name, "tags": tag_object(&removed) });
            client.send(&ApiRequest::post(REMOVE_TAGS).json(&body), &ctx.cancel).await?;
        }
        self.read(ctx, data).await
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = ctx.registry.cartel().await?;
        let name = data.require_str("name")?.to_string();
        client
            .send(
                &ApiRequest::post(DESTROY).json(&json!({ "ec2_name": name })),
                &ctx.cancel,
            )
            .await?;
        Self::wait_for_state(
            &client,
            &name,
            &["running", "stopping", "shutting-down", INDETERMINATE],
            &[TERMINATED],
            &["failed"],
            ctx,
        )
        .await?;
        data.clear_id();
        Ok(())
    }
}
