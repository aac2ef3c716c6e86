//! Provider configuration.
//!
//! Built from the host's configuration object. Every key that is absent (or
//! null, or an empty string) falls back to `HSDP_<KEY>` in the environment,
//! so `iam_url` can come from `HSDP_IAM_URL`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::discovery::{self, Service};
use crate::error::ProviderError;
use crate::retry::{Backoff, DEFAULT_MAX_RETRIES};
use crate::schema::{Attribute, Diagnostic, Schema};

/// Every recognised configuration key.
pub const KEYS: [&str; 27] = [
    "region",
    "environment",
    "iam_url",
    "idm_url",
    "s3creds_url",
    "notification_url",
    "uaa_url",
    "console_url",
    "pki_url",
    "cartel_host",
    "ai_inference_endpoint",
    "oauth2_client_id",
    "oauth2_password",
    "org_admin_username",
    "org_admin_password",
    "service_id",
    "service_private_key",
    "uaa_username",
    "uaa_password",
    "shared_key",
    "secret_key",
    "cartel_token",
    "cartel_secret",
    "cartel_no_tls",
    "cartel_skip_verify",
    "retry_max",
    "debug_log",
];

const BOOL_KEYS: [&str; 2] = ["cartel_no_tls", "cartel_skip_verify"];
const INT_KEYS: [&str; 1] = ["retry_max"];

/// Process-wide provider configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Discovery region.
    pub region: String,
    /// Discovery environment.
    pub environment: String,
    /// IAM base URL override.
    pub iam_url: Option<String>,
    /// IDM base URL override.
    pub idm_url: Option<String>,
    /// S3 credentials service override.
    pub s3creds_url: Option<String>,
    /// Notification service override.
    pub notification_url: Option<String>,
    /// UAA override.
    pub uaa_url: Option<String>,
    /// Console override.
    pub console_url: Option<String>,
    /// PKI override.
    pub pki_url: Option<String>,
    /// Container host fleet host name or URL.
    pub cartel_host: Option<String>,
    /// AI inference endpoint.
    pub ai_inference_endpoint: Option<String>,
    /// OAuth2 client id.
    pub oauth2_client_id: Option<String>,
    /// OAuth2 client secret.
    pub oauth2_password: Option<String>,
    /// Org admin login.
    pub org_admin_username: Option<String>,
    /// Org admin password.
    pub org_admin_password: Option<String>,
    /// Service identity id.
    pub service_id: Option<String>,
    /// Service identity private key (PEM).
    pub service_private_key: Option<String>,
    /// UAA login.
    pub uaa_username: Option<String>,
    /// UAA password.
    pub uaa_password: Option<String>,
    /// Request signing shared key.
    pub shared_key: Option<String>,
    /// Request signing secret key.
    pub secret_key: Option<String>,
    /// Cartel token.
    pub cartel_token: Option<String>,
    /// Cartel secret.
    pub cartel_secret: Option<String>,
    /// Talk to cartel over plain HTTP.
    pub cartel_no_tls: bool,
    /// Skip TLS verification for cartel.
    pub cartel_skip_verify: bool,
    /// Retry bound for every HTTP call.
    pub retry_max: u32,
    /// Append-only debug log file.
    pub debug_log: Option<String>,
    /// Backoff parameters; not configurable from the host.
    #[serde(skip)]
    pub backoff: Backoff,
    /// Overrides every poller's interval; not configurable from the host.
    #[serde(skip)]
    pub poll_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: "us-east".into(),
            environment: "client-test".into(),
            iam_url: None,
            idm_url: None,
            s3creds_url: None,
            notification_url: None,
            uaa_url: None,
            console_url: None,
            pki_url: None,
            cartel_host: None,
            ai_inference_endpoint: None,
            oauth2_client_id: None,
            oauth2_password: None,
            org_admin_username: None,
            org_admin_password: None,
            service_id: None,
            service_private_key: None,
            uaa_username: None,
            uaa_password: None,
            shared_key: None,
            secret_key: None,
            cartel_token: None,
            cartel_secret: None,
            cartel_no_tls: false,
            cartel_skip_verify: false,
            retry_max: DEFAULT_MAX_RETRIES,
            debug_log: None,
            backoff: Backoff::default(),
            poll_interval: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("region", &self.region)
            .field("environment", &self.environment)
            .field("iam_url", &self.iam_url)
            .field("idm_url", &self.idm_url)
            .field("oauth2_client_id", &self.oauth2_client_id)
            .field("org_admin_username", &self.org_admin_username)
            .field("service_id", &self.service_id)
            .field("retry_max", &self.retry_max)
            .field("debug_log", &self.debug_log)
            .finish_non_exhaustive()
    }
}

fn is_unset(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

fn env_value(key: &str, raw: String) -> Value {
    if BOOL_KEYS.contains(&key) {
        Value::Bool(matches!(raw.as_str(), "1" | "true" | "TRUE" | "True"))
    } else if INT_KEYS.contains(&key) {
        raw.parse::<u64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw))
    } else {
        Value::String(raw)
    }
}

impl Config {
    /// Build from the host object with `HSDP_*` fallback from the process environment.
    pub fn from_value(value: &Value) -> Result<Self, ProviderError> {
        Self::from_value_with_env(value, |name| std::env::var(name).ok())
    }

    /// Build from the host object with a custom environment lookup.
    pub fn from_value_with_env<F>(value: &Value, env: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged: Map<String, Value> = match value {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(ProviderError::Configuration(
                    "provider configuration must be an object".into(),
                ))
            },
        };

        for key in KEYS {
            if is_unset(merged.get(key)) {
                let var = format!("HSDP_{}", key.to_uppercase());
                match env(&var).filter(|v| !v.is_empty()) {
                    Some(raw) => {
                        merged.insert(key.to_string(), env_value(key, raw));
                    },
                    None => {
                        merged.remove(key);
                    },
                }
            }
        }
        // Ignore the block the host uses for per-resource timeouts, if any.
        merged.retain(|k, _| KEYS.contains(&k.as_str()));

        serde_json::from_value(Value::Object(merged))
            .map_err(|e| ProviderError::Configuration(format!("invalid provider configuration: {}", e)))
    }

    /// Configure-time checks. Errors here stop the provider from serving.
    pub fn validate(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let set = |v: &Option<String>| v.as_deref().map(|s| !s.is_empty()).unwrap_or(false);

        if set(&self.org_admin_password) && set(&self.service_private_key) {
            diagnostics.push(
                Diagnostic::error("Conflicting credentials")
                    .with_detail(
                        "org_admin_username/org_admin_password cannot be combined with service_id/service_private_key",
                    )
                    .with_attribute("service_id"),
            );
        }
        if set(&self.service_id) != set(&self.service_private_key) {
            diagnostics.push(
                Diagnostic::error("Incomplete service credentials")
                    .with_detail("service_id and service_private_key must be set together")
                    .with_attribute(if set(&self.service_id) {
                        "service_private_key"
                    } else {
                        "service_id"
                    }),
            );
        }
        if set(&self.org_admin_username) != set(&self.org_admin_password) {
            diagnostics.push(
                Diagnostic::error("Incomplete org admin credentials")
                    .with_detail("org_admin_username and org_admin_password must be set together")
                    .with_attribute("org_admin_password"),
            );
        }
        let overridden = set(&self.iam_url) && set(&self.idm_url);
        if !overridden && !discovery::is_known(&self.region, &self.environment) {
            diagnostics.push(
                Diagnostic::error(format!(
                    "Unknown region/environment '{}'/'{}'",
                    self.region, self.environment
                ))
                .with_detail("set iam_url and idm_url explicitly, or use a known region and environment")
                .with_attribute("region"),
            );
        }
        diagnostics
    }

    fn override_for(&self, service: Service) -> Option<&str> {
        let value = match service {
            Service::Iam => &self.iam_url,
            Service::Idm => &self.idm_url,
            Service::S3Creds => &self.s3creds_url,
            Service::Notification => &self.notification_url,
            Service::Uaa => &self.uaa_url,
            Service::Console => &self.console_url,
            Service::Pki => &self.pki_url,
            Service::Cartel => &self.cartel_host,
            Service::Logging => &None,
        };
        value.as_deref().filter(|s| !s.is_empty())
    }

    /// Base URL for `service`: explicit override first, then discovery.
    pub fn service_url(&self, service: Service) -> Result<String, ProviderError> {
        match self.override_for(service) {
            Some(url) if service == Service::Cartel => Ok(self.cartel_url(url)),
            Some(url) => Ok(url.trim_end_matches('/').to_string()),
            None => discovery::lookup(&self.region, &self.environment, service),
        }
    }

    fn cartel_url(&self, host: &str) -> String {
        if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else if self.cartel_no_tls {
            format!("http://{}", host)
        } else {
            format!("https://{}", host)
        }
    }

    /// Configured retry bound.
    pub fn retry_max(&self) -> u32 {
        self.retry_max
    }
}

/// Schema of the provider configuration block.
pub fn provider_schema() -> Schema {
    let url = |desc: &str| Attribute::optional_string().with_description(desc);
    Schema::v0()
        .with_attribute(
            "region",
            Attribute::optional_string()
                .with_description("Discovery region")
                .with_default(Value::from("us-east")),
        )
        .with_attribute(
            "environment",
            Attribute::optional_string()
                .with_description("Discovery environment")
                .with_default(Value::from("client-test")),
        )
        .with_attribute("iam_url", url("IAM base URL"))
        .with_attribute("idm_url", url("IDM base URL"))
        .with_attribute("s3creds_url", url("S3 credentials base URL"))
        .with_attribute("notification_url", url("Notification base URL"))
        .with_attribute("uaa_url", url("UAA base URL"))
        .with_attribute("console_url", url("Console base URL"))
        .with_attribute("pki_url", url("PKI base URL"))
        .with_attribute("cartel_host", url("Container host fleet host"))
        .with_attribute("ai_inference_endpoint", url("AI inference endpoint"))
        .with_attribute("oauth2_client_id", Attribute::optional_string())
        .with_attribute("oauth2_password", Attribute::optional_string().sensitive())
        .with_attribute(
            "org_admin_username",
            Attribute::optional_string()
                .conflicts_with("service_id")
                .conflicts_with("service_private_key"),
        )
        .with_attribute(
            "org_admin_password",
            Attribute::optional_string()
                .sensitive()
                .conflicts_with("service_id")
                .conflicts_with("service_private_key"),
        )
        .with_attribute("service_id", Attribute::optional_string())
        .with_attribute("service_private_key", Attribute::optional_string().sensitive())
        .with_attribute("uaa_username", Attribute::optional_string())
        .with_attribute("uaa_password", Attribute::optional_string().sensitive())
        .with_attribute("shared_key", Attribute::optional_string())
        .with_attribute("secret_key", Attribute::optional_string().sensitive())
        .with_attribute("cartel_token", Attribute::optional_string().sensitive())
        .with_attribute("cartel_secret", Attribute::optional_string().sensitive())
        .with_attribute("cartel_no_tls", Attribute::optional_bool())
        .with_attribute("cartel_skip_verify", Attribute::optional_bool())
        .with_attribute(
            "retry_max",
            Attribute::optional_int64().with_default(Value::from(DEFAULT_MAX_RETRIES)),
        )
        .with_attribute(
            "debug_log",
            Attribute::optional_string().with_description("Append-only debug log path"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_value_with_env(&json!({}), no_env).unwrap();
        assert_eq!(config.region, "us-east");
        assert_eq!(config.environment, "client-test");
        assert_eq!(config.retry_max, 8);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_env_fallback() {
        let env: HashMap<&str, &str> = [
            ("HSDP_IAM_URL", "https://iam.env"),
            ("HSDP_RETRY_MAX", "3"),
            ("HSDP_CARTEL_NO_TLS", "true"),
            ("HSDP_REGION", "eu-west"),
        ]
        .into_iter()
        .collect();
        let lookup = |name: &str| env.get(name).map(|v| v.to_string());

        let config =
            Config::from_value_with_env(&json!({"region": "us-east", "idm_url": ""}), lookup)
                .unwrap();
        // Explicit attribute wins.
        assert_eq!(config.region, "us-east");
        assert_eq!(config.iam_url.as_deref(), Some("https://iam.env"));
        assert_eq!(config.retry_max, 3);
        assert!(config.cartel_no_tls);
        assert!(config.idm_url.is_none());
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(Config::from_value_with_env(&json!("x"), no_env).is_err());
        assert!(Config::from_value_with_env(&json!({"retry_max": "many"}), no_env).is_err());
    }

    #[test]
    fn test_credential_conflicts() {
        let config = Config::from_value_with_env(
            &json!({
                "org_admin_username": "admin",
                "org_admin_password": "pw",
                "service_id": "svc",
                "service_private_key": "key"
            }),
            no_env,
        )
        .unwrap();
        let diags = config.validate();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].summary, "Conflicting credentials");
    }

    #[test]
    fn test_service_pair_required() {
        let config =
            Config::from_value_with_env(&json!({"service_id": "svc"}), no_env).unwrap();
        let diags = config.validate();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].attribute.as_deref(), Some("service_private_key"));
    }

    #[test]
    fn test_unknown_region_needs_overrides() {
        let config =
            Config::from_value_with_env(&json!({"region": "mars"}), no_env).unwrap();
        assert_eq!(config.validate().len(), 1);

        let config = Config::from_value_with_env(
            &json!({"region": "mars", "iam_url": "https://iam", "idm_url": "https://idm"}),
            no_env,
        )
        .unwrap();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_service_url() {
        let config = Config::from_value_with_env(
            &json!({"iam_url": "https://iam.local/", "cartel_host": "cartel.local", "cartel_no_tls": true}),
            no_env,
        )
        .unwrap();
        assert_eq!(config.service_url(Service::Iam).unwrap(), "https://iam.local");
        assert_eq!(config.service_url(Service::Cartel).unwrap(), "http://cartel.local");
        assert_eq!(
            config.service_url(Service::Idm).unwrap(),
            "https://idm-client-test.us-east.philips-healthsuite.com"
        );
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = Config::from_value_with_env(
            &json!({"org_admin_password": "hunter2", "oauth2_password": "s3cret"}),
            no_env,
        )
        .unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_provider_schema_covers_keys() {
        let schema = provider_schema();
        for key in KEYS {
            assert!(schema.attribute(key).is_some(), "missing {}", key);
        }
        assert!(schema.attribute("service_private_key").unwrap().flags.sensitive);
    }
}
