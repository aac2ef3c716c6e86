//! [`HsdpProvider`]: the [`ProviderService`] the host talks to.
//!
//! Holds the catalog and, once configured, the process-wide
//! [`ClientRegistry`]. Every host call resolves its handler by type name,
//! builds an [`OpContext`] with a budget from the resource's timeouts and
//! maps the handler's outcome onto the host's state conventions:
//!
//! - read of a gone object returns a `Null` state;
//! - delete of a gone object succeeds;
//! - warnings collected by the handler travel with the result.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{self, Config};
use crate::error::ProviderError;
use crate::host::ProviderService;
use crate::logging;
use crate::reconcile::{plan_resource, DataSource, OpContext, Resource, Timeouts};
use crate::registry::ClientRegistry;
use crate::resources;
use crate::retry::Backoff;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::state::ResourceData;
use crate::types::{ApplyResult, AttributeChange, ImportedResource, PlanResult};
use crate::validation;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Op {
    Create,
    Read,
    Update,
    Delete,
}

impl Op {
    fn budget(self, timeouts: &Timeouts) -> Duration {
        match self {
            Op::Create => timeouts.create,
            Op::Read | Op::Update => timeouts.update,
            Op::Delete => timeouts.delete,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Read => "read",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

/// The HSDP provider.
pub struct HsdpProvider {
    resources: BTreeMap<&'static str, Arc<dyn Resource>>,
    data_sources: BTreeMap<&'static str, Arc<dyn DataSource>>,
    registry: RwLock<Option<Arc<ClientRegistry>>>,
    shutdown: CancellationToken,
    backoff: Backoff,
    poll_interval: Option<Duration>,
    env: EnvLookup,
}

impl Default for HsdpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HsdpProvider {
    /// Provider with the full catalog, reading `HSDP_*` from the process environment.
    pub fn new() -> Self {
        Self {
            resources: resources::catalog()
                .into_iter()
                .map(|r| (r.type_name(), r))
                .collect(),
            data_sources: resources::data_sources()
                .into_iter()
                .map(|d| (d.type_name(), d))
                .collect(),
            registry: RwLock::new(None),
            shutdown: CancellationToken::new(),
            backoff: Backoff::default(),
            poll_interval: None,
            env: Arc::new(|name: &str| std::env::var(name).ok()),
        }
    }

    /// Use `lookup` instead of the process environment for `HSDP_*` fallbacks.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Override the retry backoff of every client.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Poll long-running operations every `interval` instead of each
    /// resource's default.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// The configured registry.
    pub async fn registry(&self) -> Result<Arc<ClientRegistry>, ProviderError> {
        self.registry
            .read()
            .await
            .clone()
            .ok_or_else(|| ProviderError::FailedPrecondition("provider is not configured".into()))
    }

    fn resource(&self, resource_type: &str) -> Result<Arc<dyn Resource>, ProviderError> {
        self.resources
            .get(resource_type)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(resource_type.to_string()))
    }

    fn data_source(&self, data_source_type: &str) -> Result<Arc<dyn DataSource>, ProviderError> {
        self.data_sources
            .get(data_source_type)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(data_source_type.to_string()))
    }

    fn parse_config(&self, config: &Value) -> Result<Config, ProviderError> {
        let env = Arc::clone(&self.env);
        Config::from_value_with_env(config, move |name| env(name))
    }

    /// A token cancelled by either the host or `stop`.
    fn link(&self, cancel: &CancellationToken) -> CancellationToken {
        let linked = self.shutdown.child_token();
        let host = cancel.clone();
        let watched = linked.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = host.cancelled() => watched.cancel(),
                _ = watched.cancelled() => {},
            }
        });
        linked
    }

    async fn within<F>(&self, what: String, budget: Duration, fut: F) -> Result<(), ProviderError>
    where
        F: Future<Output = Result<(), ProviderError>>,
    {
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::DeadlineExceeded(format!(
                "{} did not finish within {:?}",
                what, budget
            ))),
        }
    }

    async fn run(
        &self,
        op: Op,
        resource: &dyn Resource,
        data: &mut ResourceData,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let registry = self.registry().await?;
        let budget = op.budget(&resource.timeouts().resolve(data)?);
        let token = self.link(cancel);
        let _guard = token.clone().drop_guard();
        let ctx = OpContext::new(registry, token, budget);
        let what = format!("{} {}", op.as_str(), resource.type_name());

        match op {
            Op::Create => self.within(what, budget, resource.create(&ctx, data)).await,
            Op::Read => self.within(what, budget, resource.read(&ctx, data)).await,
            Op::Update => self.within(what, budget, resource.update(&ctx, data)).await,
            Op::Delete => self.within(what, budget, resource.delete(&ctx, data)).await,
        }
    }
}

#[async_trait::async_trait]
impl ProviderService for HsdpProvider {
    fn schema(&self) -> ProviderSchema {
        let mut schema = ProviderSchema::new().with_provider_config(config::provider_schema());
        for (name, resource) in &self.resources {
            schema = schema.with_resource(*name, resource.schema());
        }
        for (name, data_source) in &self.data_sources {
            schema = schema.with_data_source(*name, data_source.schema());
        }
        schema
    }

    #[instrument(skip(self, config))]
    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let mut diagnostics = validation::validate(&config::provider_schema(), &config);
        match self.parse_config(&config) {
            Ok(parsed) => diagnostics.extend(parsed.validate()),
            Err(e) => diagnostics.extend(e.into_diagnostics()),
        }
        Ok(diagnostics)
    }

    #[instrument(skip(self, config))]
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let mut parsed = self.parse_config(&config)?;
        let mut diagnostics = parsed.validate();
        if diagnostics.iter().any(Diagnostic::is_error) {
            warn!(diagnostics = diagnostics.len(), "provider configuration rejected");
            return Ok(diagnostics);
        }

        let mut slot = self.registry.write().await;
        if slot.is_some() {
            diagnostics.push(Diagnostic::warning(
                "provider already configured; keeping the existing configuration",
            ));
            return Ok(diagnostics);
        }

        if let Some(path) = parsed.debug_log.as_deref().filter(|p| !p.is_empty()) {
            if let Err(e) = logging::attach_debug_log(path) {
                diagnostics.push(
                    Diagnostic::warning("debug log not written")
                        .with_detail(e.to_string())
                        .with_attribute("debug_log"),
                );
            }
        }

        parsed.backoff = self.backoff.clone();
        parsed.poll_interval = self.poll_interval;
        info!(
            region = %parsed.region,
            environment = %parsed.environment,
            retry_max = parsed.retry_max,
            "provider configured"
        );
        *slot = Some(Arc::new(ClientRegistry::new(parsed)?));
        Ok(diagnostics)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        info!("stopping provider");
        self.shutdown.cancel();
        self.registry.write().await.take();
        logging::detach_debug_log();
        Ok(())
    }

    #[instrument(skip(self, config))]
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let resource = self.resource(resource_type)?;
        Ok(validation::validate(&resource.schema(), &config))
    }

    #[instrument(skip(self, state))]
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: u64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let current = resource.schema().version;
        if version >= current {
            return Ok(state);
        }
        info!(from = version, to = current, "upgrading resource state");
        resource.upgrade_state(version, state)
    }

    #[instrument(skip(self, prior_state, proposed_state, _config))]
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let resource = self.resource(resource_type)?;
        let prior = prior_state.filter(|p| !p.is_null());

        if proposed_state.is_null() {
            let id = prior
                .as_ref()
                .and_then(|p| p.get("id"))
                .cloned()
                .unwrap_or(Value::Null);
            return Ok(PlanResult::with_changes(
                Value::Null,
                vec![AttributeChange::removed("id", id)],
                false,
            ));
        }
        Ok(plan_resource(&resource.schema(), prior.as_ref(), &proposed_state))
    }

    #[instrument(skip(self, planned_state, cancel))]
    async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, ProviderError> {
        let resource = self.resource(resource_type)?;
        let mut data = ResourceData::new(planned_state);
        self.run(Op::Create, resource.as_ref(), &mut data, cancel).await?;
        info!(id = data.id(), "created");
        Ok(data.into_result())
    }

    #[instrument(skip(self, current_state, cancel))]
    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, ProviderError> {
        let resource = self.resource(resource_type)?;
        let mut data = ResourceData::new(current_state);
        if data.id().is_empty() {
            return Ok(ApplyResult::gone());
        }
        match self.run(Op::Read, resource.as_ref(), &mut data, cancel).await {
            Ok(()) => Ok(data.into_result()),
            Err(e) if e.is_gone() => {
                info!(id = data.id(), "resource gone upstream");
                Ok(ApplyResult::gone())
            },
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, prior_state, planned_state, cancel))]
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, ProviderError> {
        let resource = self.resource(resource_type)?;
        let mut data = ResourceData::with_prior(planned_state, prior_state);
        self.run(Op::Update, resource.as_ref(), &mut data, cancel).await?;
        info!(id = data.id(), "updated");
        Ok(data.into_result())
    }

    #[instrument(skip(self, current_state, cancel))]
    async fn delete(
        &self,
        resource_type: &str,
        current_state: Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let resource = self.resource(resource_type)?;
        let mut data = ResourceData::new(current_state);
        if data.id().is_empty() {
            return Ok(vec![]);
        }
        match self.run(Op::Delete, resource.as_ref(), &mut data, cancel).await {
            Ok(()) => {},
            Err(e) if e.is_gone() => info!(id = data.id(), "already deleted"),
            Err(e) => return Err(e),
        }
        data.clear_id();
        Ok(data.diagnostics().to_vec())
    }

    #[instrument(skip(self))]
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let resource = self.resource(resource_type)?;
        let state = resource.import(id)?;
        Ok(vec![ImportedResource::new(resource_type, state)])
    }

    #[instrument(skip(self, config))]
    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let data_source = self.data_source(data_source_type)?;
        Ok(validation::validate(&data_source.schema(), &config))
    }

    #[instrument(skip(self, config, cancel))]
    async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, ProviderError> {
        let data_source = self.data_source(data_source_type)?;
        let registry = self.registry().await?;
        let budget = Timeouts::default().update;
        let token = self.link(cancel);
        let _guard = token.clone().drop_guard();
        let ctx = OpContext::new(registry, token, budget);

        let mut data = ResourceData::new(config);
        let what = format!("read {}", data_source_type);
        self.within(what, budget, data_source.read(&ctx, &mut data))
            .await?;
        Ok(data.into_result())
    }
}
