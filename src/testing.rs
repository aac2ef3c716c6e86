//! In-process test harness.
//!
//! [`ProviderTester`] calls a [`ProviderService`] directly, the way the host
//! would, so resource behaviour can be exercised against an HTTP mock.
//! [`mock_provider_config`] points every HSDP service at one mock server.
//!
//! ```ignore
//! let server = wiremock::MockServer::start().await;
//! let tester = ProviderTester::new(HsdpProvider::new());
//! tester.configure(mock_provider_config(&server.uri())).await?;
//!
//! let result = tester
//!     .create("hsdp_notification_topic", json!({"name": "alerts", "producer_id": "p-1"}))
//!     .await?;
//! assert_eq!(result.state["name"], "alerts");
//! ```

use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::host::ProviderService;
use crate::schema::{Diagnostic, DiagnosticSeverity, ProviderSchema};
use crate::types::{ApplyResult, ImportedResource, PlanResult};

/// Configuration sending every service to `base_url`, with org admin
/// (password grant), UAA and cartel credentials filled in.
pub fn mock_provider_config(base_url: &str) -> Value {
    let mut config = json!({
        "region": "us-east",
        "environment": "client-test",
        "oauth2_client_id": "client",
        "oauth2_password": "client-secret",
        "org_admin_username": "admin",
        "org_admin_password": "admin-password",
        "uaa_username": "cf-user",
        "uaa_password": "cf-password",
        "shared_key": "shared",
        "secret_key": "secret",
        "cartel_token": "cartel-token",
        "cartel_secret": "cartel-secret",
        "retry_max": 2
    });
    for key in [
        "iam_url",
        "idm_url",
        "s3creds_url",
        "notification_url",
        "uaa_url",
        "console_url",
        "pki_url",
        "cartel_host",
        "ai_inference_endpoint",
    ] {
        config[key] = Value::String(base_url.to_string());
    }
    config
}

/// Failure of a tester call that reports through diagnostics.
#[derive(Debug, Error)]
pub enum TestError {
    /// Error diagnostics came back.
    #[error("{}", render(.0))]
    Diagnostics(Vec<Diagnostic>),
    /// The call itself failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

fn render(diagnostics: &[Diagnostic]) -> String {
    let mut out = format!("{} error diagnostic(s)", diagnostics.len());
    for d in diagnostics {
        out.push_str("\n  ");
        out.push_str(&d.summary);
        if let Some(detail) = &d.detail {
            out.push_str(": ");
            out.push_str(detail);
        }
        if let Some(attribute) = &d.attribute {
            out.push_str(&format!(" (at {})", attribute));
        }
    }
    out
}

fn errors_only(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<Diagnostic> = diagnostics.into_iter().filter(Diagnostic::is_error).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

/// Drives a provider without a host. All calls share one cancellation token.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
    cancel: CancellationToken,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Wrap `provider`.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cancel: CancellationToken::new(),
        }
    }

    /// Full provider schema.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    /// Resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    /// Data source type names.
    pub fn data_source_types(&self) -> Vec<String> {
        self.provider.metadata().data_sources
    }

    /// Validate the provider configuration; error diagnostics become `Err`.
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        errors_only(self.provider.validate_provider_config(config).await?)
    }

    /// Configure the provider; error diagnostics become `Err`.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        errors_only(self.provider.configure(config).await?)
    }

    /// Stop the provider.
    pub async fn stop(&self) -> Result<(), ProviderError> {
        self.provider.stop().await
    }

    /// Validate a resource configuration; error diagnostics become `Err`.
    pub async fn validate_resource_config(&self, resource_type: &str, config: Value) -> Result<(), TestError> {
        errors_only(self.provider.validate_resource_config(resource_type, config).await?)
    }

    /// Plan with no prior state. `config` doubles as the proposed state.
    pub async fn plan_create(&self, resource_type: &str, config: Value) -> Result<PlanResult, ProviderError> {
        self.provider.plan(resource_type, None, config.clone(), config).await
    }

    /// Plan from `prior` to `config`.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider.plan(resource_type, Some(prior), config.clone(), config).await
    }

    /// Create from a planned state.
    pub async fn create(&self, resource_type: &str, planned: Value) -> Result<ApplyResult, ProviderError> {
        self.provider.create(resource_type, planned, &self.cancel).await
    }

    /// Refresh `state`.
    pub async fn read(&self, resource_type: &str, state: Value) -> Result<ApplyResult, ProviderError> {
        self.provider.read(resource_type, state, &self.cancel).await
    }

    /// Update from `prior` to `planned`.
    pub async fn update(
        &self,
        resource_type: &str,
        prior: Value,
        planned: Value,
    ) -> Result<ApplyResult, ProviderError> {
        self.provider.update(resource_type, prior, planned, &self.cancel).await
    }

    /// Delete; the returned warnings are non-fatal.
    pub async fn delete(&self, resource_type: &str, state: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        self.provider.delete(resource_type, state, &self.cancel).await
    }

    /// Resolve an import id.
    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    /// Upgrade `state` stored under schema `version`.
    pub async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: u64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.upgrade_resource_state(resource_type, version, state).await
    }

    /// Read a data source.
    pub async fn read_data_source(&self, data_source_type: &str, config: Value) -> Result<ApplyResult, ProviderError> {
        self.provider.read_data_source(data_source_type, config, &self.cancel).await
    }

    /// Import `id` and refresh it, the way `hemmer import` does.
    pub async fn lifecycle_import(&self, resource_type: &str, id: &str) -> Result<Value, ProviderError> {
        let imported = self
            .import_resource(resource_type, id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("import of '{}' returned nothing", id)))?;
        Ok(self.read(resource_type, imported.state).await?.state)
    }
}

fn summaries<'a>(diagnostics: impl Iterator<Item = &'a Diagnostic>) -> Vec<&'a str> {
    diagnostics.map(|d| d.summary.as_str()).collect()
}

fn changed_paths(plan: &PlanResult) -> Vec<&str> {
    plan.changes.iter().map(|c| c.path.as_str()).collect()
}

/// Panics unless `plan` creates without replacing.
pub fn assert_plan_creates(plan: &PlanResult) {
    assert!(!plan.changes.is_empty(), "create plan has no changes");
    assert!(!plan.requires_replace, "create plan requires replacement");
}

/// Panics if `plan` would do anything.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        !plan.has_changes(),
        "expected an empty plan, got changes to {:?} (replace: {})",
        changed_paths(plan),
        plan.requires_replace
    );
}

/// Panics unless `plan` replaces the resource.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(plan.requires_replace, "expected replacement, changes: {:?}", changed_paths(plan));
}

/// Panics unless `plan` changes something without replacing.
pub fn assert_plan_updates_in_place(plan: &PlanResult) {
    assert!(!plan.changes.is_empty(), "expected an in-place update, got no changes");
    assert!(!plan.requires_replace, "expected an in-place update, got replacement");
}

/// Panics unless `plan` touches `path`.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    assert!(
        plan.changes.iter().any(|c| c.path == path),
        "'{}' not among changed attributes {:?}",
        path,
        changed_paths(plan)
    );
}

/// Panics on any error diagnostic.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors = summaries(diagnostics.iter().filter(|d| d.is_error()));
    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
}

/// Panics unless an error summary contains `needle`.
pub fn assert_error_contains(diagnostics: &[Diagnostic], needle: &str) {
    assert_severity_contains(diagnostics, DiagnosticSeverity::Error, needle);
}

/// Panics unless a warning summary contains `needle`.
pub fn assert_warning_contains(diagnostics: &[Diagnostic], needle: &str) {
    assert_severity_contains(diagnostics, DiagnosticSeverity::Warning, needle);
}

fn assert_severity_contains(diagnostics: &[Diagnostic], severity: DiagnosticSeverity, needle: &str) {
    assert!(
        diagnostics
            .iter()
            .any(|d| d.severity == severity && d.summary.contains(needle)),
        "no {:?} containing '{}' in {:?}",
        severity,
        needle,
        summaries(diagnostics.iter())
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HsdpProvider;

    fn tester() -> ProviderTester<HsdpProvider> {
        ProviderTester::new(HsdpProvider::new().with_env(|_| None))
    }

    #[tokio::test]
    async fn test_catalog_listing() {
        let tester = tester();
        tokio_test::assert_ok!(tester.configure(mock_provider_config("http://127.0.0.1:9")).await);
        assert!(tester.resource_types().contains(&"hsdp_cdr_org".to_string()));
        assert!(tester.data_source_types().contains(&"hsdp_config".to_string()));
        assert!(tester.schema().resources.contains_key("hsdp_function"));
    }

    #[tokio::test]
    async fn test_bad_region_is_a_diagnostic() {
        let err = tester()
            .validate_provider_config(json!({"region": "mars"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::Diagnostics(_)));
        assert!(err.to_string().contains("Unknown region"));
    }

    #[tokio::test]
    async fn test_plans() {
        let tester = tester();
        let plan = tester
            .plan_create("hsdp_notification_topic", json!({"name": "alerts", "producer_id": "p-1"}))
            .await
            .unwrap();
        assert_plan_creates(&plan);
        assert_plan_changes_attribute(&plan, "name");

        let prior = json!({
            "id": "t-1",
            "name": "alerts",
            "producer_id": "p-1",
            "scope": "public",
            "allowed_scopes": [],
            "is_auditable": false,
            "description": "old"
        });
        let mut config = prior.clone();
        config["description"] = json!("new");
        let plan = tester
            .plan_update("hsdp_notification_topic", prior.clone(), config)
            .await
            .unwrap();
        assert_plan_updates_in_place(&plan);

        let mut renamed = prior.clone();
        renamed["name"] = json!("renamed");
        let plan = tester
            .plan_update("hsdp_notification_topic", prior.clone(), renamed)
            .await
            .unwrap();
        assert_plan_replaces(&plan);

        let plan = tester
            .plan_update("hsdp_notification_topic", prior.clone(), prior)
            .await
            .unwrap();
        assert_plan_no_changes(&plan);
    }

    #[tokio::test]
    async fn test_resource_config_and_state_upgrade() {
        let tester = tester();
        let err = tester
            .validate_resource_config("hsdp_iam_service", json!({"application_id": "app-1"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Missing required attribute 'name'"), "{}", err);

        let upgraded = tester
            .upgrade_resource_state(
                "hsdp_iam_service",
                0,
                json!({"id": "s-1", "expires_on": "2026-01-01T00:00:00Z", "scopes": ["openid"]}),
            )
            .await
            .unwrap();
        assert!(upgraded.get("expires_on").is_none());
        assert_eq!(upgraded["validity"], 12);
    }

    #[test]
    fn test_severity_assertions() {
        let diagnostics = [
            Diagnostic::warning("permission X.READ not found"),
            Diagnostic::error("Conflicting credentials"),
        ];
        assert_warning_contains(&diagnostics, "X.READ");
        assert_error_contains(&diagnostics, "Conflicting");
        assert_no_errors(&diagnostics[..1]);
    }

    #[test]
    #[should_panic(expected = "unexpected errors")]
    fn test_assert_no_errors_panics() {
        assert_no_errors(&[Diagnostic::error("boom")]);
    }

    #[test]
    fn test_error_rendering() {
        let err = TestError::Diagnostics(vec![
            Diagnostic::error("First").with_attribute("field1"),
            Diagnostic::error("Second").with_detail("more info"),
        ]);
        let rendered = err.to_string();
        assert!(rendered.starts_with("2 error diagnostic(s)"));
        assert!(rendered.contains("First (at field1)"));
        assert!(rendered.contains("Second: more info"));
    }
}
