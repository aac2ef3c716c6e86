//! `hsdp_pki_cert`: certificates issued by a PKI tenant.
//!
//! Certificates are immutable: every input forces a new certificate except
//! the optional `principal`, which only selects the identity used to call PKI.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::str_at;
use crate::client::{ApiClient, ApiRequest};
use crate::error::ProviderError;
use crate::reconcile::{OpContext, Resource};
use crate::registry::Principal;
use crate::schema::{Attribute, Block, NestedBlock, Schema};
use crate::state::ResourceData;

fn tenant_path(tenant: &str, rest: &str) -> String {
    format!("/core/pki/api/{}/{}", tenant, rest)
}

fn principal(data: &ResourceData) -> Option<Principal> {
    let block = data.get_block("principal")?;
    let field = |key: &str| {
        block
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let service_id = field("service_id");
    if service_id.is_empty() {
        return None;
    }
    Some(Principal {
        service_id,
        private_key: field("private_key"),
    })
}

fn comma_list(items: impl IntoIterator<Item = String>) -> String {
    items.into_iter().collect::<Vec<_>>().join(",")
}

/// PKI certificate.
#[derive(Debug, Default)]
pub struct PkiCert;

impl PkiCert {
    async fn client(ctx: &OpContext, data: &ResourceData) -> Result<std::sync::Arc<ApiClient>, ProviderError> {
        ctx.registry.pki(principal(data).as_ref()).await
    }
}

#[async_trait]
impl Resource for PkiCert {
    fn type_name(&self) -> &'static str {
        "hsdp_pki_cert"
    }

    fn schema(&self) -> Schema {
        let principal = Block::new()
            .with_attribute("service_id", Attribute::optional_string())
            .with_attribute("private_key", Attribute::optional_string().sensitive());

        Schema::v0()
            .with_id()
            .with_attribute(
                "tenant_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("PKI tenant logical path"),
            )
            .with_attribute("role", Attribute::required_string().with_force_new())
            .with_attribute("common_name", Attribute::required_string().with_force_new())
            .with_attribute("alt_names", Attribute::optional_string_set().with_force_new())
            .with_attribute("ip_sans", Attribute::optional_string_set().with_force_new())
            .with_attribute("uri_sans", Attribute::optional_string_set().with_force_new())
            .with_attribute("ttl", Attribute::optional_string().with_force_new())
            .with_attribute(
                "exclude_cn_from_sans",
                Attribute::optional_bool()
                    .with_default(Value::Bool(false))
                    .with_force_new(),
            )
            .with_block("principal", NestedBlock::single(principal).with_max_items(1))
            .with_attribute("cert_pem", Attribute::computed_string())
            .with_attribute("private_key_pem", Attribute::computed_string().sensitive())
            .with_attribute("issuing_ca_pem", Attribute::computed_string())
            .with_attribute("serial_number", Attribute::computed_string())
            .with_attribute("expiration", Attribute::computed_int64())
            .with_timeouts()
    }

    async fn create(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = Self::client(ctx, data).await?;
        let tenant = data.require_str("tenant_id")?.to_string();
        let role = data.require_str("role")?.to_string();
        let body = json!({
            "common_name": data.require_str("common_name")?,
            "alt_names": comma_list(data.get_string_set("alt_names")),
            "ip_sans": comma_list(data.get_string_set("ip_sans")),
            "uri_sans": comma_list(data.get_string_set("uri_sans")),
            "ttl": data.get_string("ttl"),
            "exclude_cn_from_sans": data.get_bool("exclude_cn_from_sans"),
            "private_key_format": "pem",
        });
        let issued: Value = client
            .send_json(
                &ApiRequest::post(tenant_path(&tenant, &format!("issue/{}", role))).json(&body),
                &ctx.cancel,
            )
            .await?;

        let serial = str_at(&issued, "/data/serial_number").to_string();
        if serial.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "issued certificate has no serial number".into(),
            ));
        }
        info!(%serial, %tenant, %role, "certificate issued");
        data.set_id(serial.as_str());
        data.set("serial_number", serial);
        data.set("cert_pem", str_at(&issued, "/data/certificate"));
        data.set("private_key_pem", str_at(&issued, "/data/private_key"));
        data.set("issuing_ca_pem", str_at(&issued, "/data/issuing_ca"));
        if let Some(expiration) = issued.pointer("/data/expiration").and_then(Value::as_i64) {
            data.set("expiration", expiration);
        }
        Ok(())
    }

    async fn read(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = Self::client(ctx, data).await?;
        let tenant = data.require_str("tenant_id")?.to_string();
        let serial = data.id().to_string();
        let cert: Value = client
            .send_json(
                &ApiRequest::get(tenant_path(&tenant, &format!("cert/{}", serial))),
                &ctx.cancel,
            )
            .await?;
        let revoked = cert
            .pointer("/data/revocation_time")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if revoked > 0 {
            info!(%serial, revoked, "certificate revoked");
            data.clear_id();
            return Ok(());
        }
        let pem = str_at(&cert, "/data/certificate");
        if !pem.is_empty() {
            data.set("cert_pem", pem);
        }
        data.set("serial_number", serial);
        Ok(())
    }

    async fn update(&self, _ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        // Only `principal` can reach here; it is used for later calls, nothing to send.
        debug!(serial = data.id(), "certificate update is local only");
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, data: &mut ResourceData) -> Result<(), ProviderError> {
        let client = Self::client(ctx, data).await?;
        let tenant = data.require_str("tenant_id")?.to_string();
        let serial = data.id().to_string();
        client
            .send(
                &ApiRequest::post(tenant_path(&tenant, "revoke"))
                    .json(&json!({ "serial_number": serial })),
                &ctx.cancel,
            )
            .await?;
        info!(%serial, "certificate revoked");
        data.clear_id();
        Ok(())
    }
}
