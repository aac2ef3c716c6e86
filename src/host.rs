//! The boundary the IaC host drives.
//!
//! The host owns the transport; it calls these methods with attribute bags
//! and stores whatever state comes back. Create, read and update return an
//! [`ApplyResult`] whose `Null` state means "drop this resource".
//!
//! # Example
//!
//! ```ignore
//! use hemmer_provider_hsdp::{HsdpProvider, ProviderService};
//! use tokio_util::sync::CancellationToken;
//!
//! let provider = HsdpProvider::new();
//! provider.configure(json!({"region": "us-east"})).await?;
//! let result = provider
//!     .create("hsdp_iam_org", json!({"name": "ACC-abc"}), &CancellationToken::new())
//!     .await?;
//! ```

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::types::{ApplyResult, ImportedResource, PlanResult, ProviderMetadata};

/// Operations the host runtime invokes on the provider.
///
/// Only `schema`, `configure`, `plan`, the four CRUD calls and
/// `read_data_source` are mandatory. The defaults accept everything and
/// import nothing.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// Schema of the provider configuration, every resource and data source.
    fn schema(&self) -> ProviderSchema;

    /// Names of the resources and data sources, in schema order.
    fn metadata(&self) -> ProviderMetadata {
        let schema = self.schema();
        ProviderMetadata {
            resources: schema.resources.into_keys().collect(),
            data_sources: schema.data_sources.into_keys().collect(),
        }
    }

    /// Check a provider configuration without applying it.
    async fn validate_provider_config(&self, _config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(Vec::new())
    }

    /// Apply the provider configuration. Warnings come back as diagnostics.
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Cancel in-flight work and release clients.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Check a resource configuration before planning.
    async fn validate_resource_config(&self, _type_name: &str, _config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(Vec::new())
    }

    /// Rewrite state stored under schema `version` into the current shape.
    async fn upgrade_resource_state(&self, _type_name: &str, _version: u64, state: Value) -> Result<Value, ProviderError> {
        Ok(state)
    }

    /// Plan the change from `prior_state` to `proposed_state`. A `Null`
    /// proposal plans destruction.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create the object described by `planned_state`.
    async fn create(&self, resource_type: &str, planned_state: Value, cancel: &CancellationToken) -> Result<ApplyResult, ProviderError>;

    /// Refresh from the server; a gone object yields a `Null` state.
    async fn read(&self, resource_type: &str, current_state: Value, cancel: &CancellationToken) -> Result<ApplyResult, ProviderError>;

    /// Update in place.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, ProviderError>;

    /// Delete. An object that is already gone counts as deleted.
    async fn delete(&self, resource_type: &str, current_state: Value, cancel: &CancellationToken) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Turn an operator-supplied import id into state `read` can refresh.
    async fn import_resource(&self, resource_type: &str, _id: &str) -> Result<Vec<ImportedResource>, ProviderError> {
        Err(ProviderError::Unimplemented(format!("{} cannot be imported", resource_type)))
    }

    /// Check a data source configuration.
    async fn validate_data_source_config(&self, _type_name: &str, _config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(Vec::new())
    }

    /// Read a data source. The result always carries an id.
    async fn read_data_source(&self, data_source_type: &str, config: Value, cancel: &CancellationToken) -> Result<ApplyResult, ProviderError>;
}
