//! Lazily built, process-wide API clients.
//!
//! Every accessor is keyed by its arguments: the same `(service, endpoint,
//! org)` returns the same [`ApiClient`] for the lifetime of the registry.
//! Construction authenticates eagerly, so credential problems surface on the
//! first resource that needs the client. Concurrent first calls for one key
//! share a single construction.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::auth::{Grant, RequestSigner, TokenManager};
use crate::client::{ApiClient, Credential};
use crate::config::Config;
use crate::discovery::Service;
use crate::error::ProviderError;
use crate::retry::Retrier;

/// Short digest of a secret, so a rotated credential maps to a new client
/// without the secret itself sitting in the key.
fn fingerprint(secret: &str) -> String {
    hex::encode(&Sha256::digest(secret.as_bytes())[..8])
}

/// Cache key of one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    /// IAM (organizations, token issuance).
    Iam,
    /// IDM (groups, roles, propositions, applications, services).
    Idm,
    /// Notification topics.
    Notification,
    /// Console (autoscalers).
    Console,
    /// Shared-key signed credentials service.
    S3Creds,
    /// Container host fleet.
    Cartel,
    /// FHIR store on behalf of an organization.
    Fhir {
        /// Store base URL.
        store: String,
        /// Organization the caller acts for.
        org: String,
    },
    /// PKI, optionally as a dedicated service principal.
    Pki {
        /// Principal service id, `None` for the provider credentials.
        principal: Option<String>,
        /// Fingerprint of the principal's private key.
        key: Option<String>,
    },
    /// AI inference endpoint.
    Inference {
        /// Endpoint base URL.
        endpoint: String,
    },
    /// Function runner backend.
    Function {
        /// Backend API base URL.
        endpoint: String,
        /// Backend project.
        project: String,
        /// Fingerprint of the API token.
        token: String,
    },
}

/// A service identity that acts instead of the provider credentials.
#[derive(Clone)]
pub struct Principal {
    /// Service identity id.
    pub service_id: String,
    /// PEM-encoded private key.
    pub private_key: String,
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Principal")
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

/// Credentials of a function runner backend.
#[derive(Clone)]
pub struct FunctionBackend {
    /// API base URL.
    pub endpoint: String,
    /// Project id.
    pub project: String,
    /// API token.
    pub token: String,
}

impl std::fmt::Debug for FunctionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionBackend")
            .field("endpoint", &self.endpoint)
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

type Slot = Arc<OnceCell<Arc<ApiClient>>>;

/// Factory and cache for per-service clients.
pub struct ClientRegistry {
    config: Config,
    http: reqwest::Client,
    cartel_http: reqwest::Client,
    iam_tokens: OnceCell<Arc<TokenManager>>,
    uaa_tokens: OnceCell<Arc<TokenManager>>,
    clients: Mutex<HashMap<ClientKey, Slot>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl ClientRegistry {
    /// Registry over `config`. No network traffic happens here.
    pub fn new(config: Config) -> Result<Self, ProviderError> {
        let user_agent = concat!("hemmer-provider-hsdp/", env!("CARGO_PKG_VERSION"));
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ProviderError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        let cartel_http = reqwest::Client::builder()
            .user_agent(user_agent)
            .danger_accept_invalid_certs(config.cartel_skip_verify)
            .build()
            .map_err(|e| ProviderError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            http,
            cartel_http,
            iam_tokens: OnceCell::new(),
            uaa_tokens: OnceCell::new(),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Configuration the registry was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of clients built or being built.
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Whether no client was requested yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn retrier(&self) -> Retrier {
        Retrier::new(self.config.retry_max).with_backoff(self.config.backoff.clone())
    }

    fn token_url(&self) -> Result<String, ProviderError> {
        Ok(format!(
            "{}/authorize/oauth2/token",
            self.config.service_url(Service::Iam)?
        ))
    }

    fn iam_grant(&self) -> Result<Grant, ProviderError> {
        let config = &self.config;
        if let (Some(service_id), Some(private_key)) = (
            non_empty(&config.service_id),
            non_empty(&config.service_private_key),
        ) {
            return Ok(Grant::JwtBearer {
                token_url: self.token_url()?,
                service_id: service_id.to_string(),
                private_key: private_key.to_string(),
            });
        }
        let (Some(username), Some(password)) = (
            non_empty(&config.org_admin_username),
            non_empty(&config.org_admin_password),
        ) else {
            return Err(ProviderError::MissingCredentials(
                "org_admin_username/org_admin_password or service_id/service_private_key".into(),
            ));
        };
        let (Some(client_id), Some(client_secret)) = (
            non_empty(&config.oauth2_client_id),
            non_empty(&config.oauth2_password),
        ) else {
            return Err(ProviderError::MissingCredentials(
                "oauth2_client_id/oauth2_password".into(),
            ));
        };
        Ok(Grant::Password {
            token_url: self.token_url()?,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    async fn iam_tokens(&self) -> Result<Arc<TokenManager>, ProviderError> {
        let tokens = self
            .iam_tokens
            .get_or_try_init(|| async {
                let grant = self.iam_grant()?;
                debug!(?grant, "building IAM token manager");
                Ok::<_, ProviderError>(Arc::new(TokenManager::new(grant, self.http.clone())))
            })
            .await?;
        Ok(Arc::clone(tokens))
    }

    async fn uaa_tokens(&self) -> Result<Arc<TokenManager>, ProviderError> {
        let tokens = self
            .uaa_tokens
            .get_or_try_init(|| async {
                let (Some(username), Some(password)) = (
                    non_empty(&self.config.uaa_username),
                    non_empty(&self.config.uaa_password),
                ) else {
                    return Err(ProviderError::MissingCredentials(
                        "uaa_username/uaa_password".into(),
                    ));
                };
                let grant = Grant::Uaa {
                    token_url: format!("{}/oauth/token", self.config.service_url(Service::Uaa)?),
                    username: username.to_string(),
                    password: password.to_string(),
                };
                Ok::<_, ProviderError>(Arc::new(TokenManager::new(grant, self.http.clone())))
            })
            .await?;
        Ok(Arc::clone(tokens))
    }

    async fn cached<F, Fut>(&self, key: ClientKey, build: F) -> Result<Arc<ApiClient>, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ApiClient, ProviderError>>,
    {
        let slot = {
            let mut clients = self.clients.lock().await;
            Arc::clone(clients.entry(key.clone()).or_default())
        };
        let client = slot
            .get_or_try_init(|| async move {
                let client = build().await?;
                client.authenticate().await?;
                info!(?key, base_url = client.base_url(), "client ready");
                Ok::<_, ProviderError>(Arc::new(client))
            })
            .await?;
        Ok(Arc::clone(client))
    }

    async fn bearer_client(&self, base_url: String) -> Result<ApiClient, ProviderError> {
        let tokens = self.iam_tokens().await?;
        Ok(ApiClient::new(
            self.http.clone(),
            base_url,
            Credential::Bearer(tokens),
            self.retrier(),
        ))
    }

    /// IAM client.
    pub async fn iam(&self) -> Result<Arc<ApiClient>, ProviderError> {
        self.cached(ClientKey::Iam, || async {
            self.bearer_client(self.config.service_url(Service::Iam)?).await
        })
        .await
    }

    /// IDM client.
    pub async fn idm(&self) -> Result<Arc<ApiClient>, ProviderError> {
        self.cached(ClientKey::Idm, || async {
            self.bearer_client(self.config.service_url(Service::Idm)?).await
        })
        .await
    }

    /// Notification client.
    pub async fn notification(&self) -> Result<Arc<ApiClient>, ProviderError> {
        self.cached(ClientKey::Notification, || async {
            self.bearer_client(self.config.service_url(Service::Notification)?)
                .await
        })
        .await
    }

    /// FHIR store client, acting for `org_id` unless it is empty.
    pub async fn fhir(&self, store_url: &str, org_id: &str) -> Result<Arc<ApiClient>, ProviderError> {
        let key = ClientKey::Fhir {
            store: store_url.trim_end_matches('/').to_string(),
            org: org_id.to_string(),
        };
        self.cached(key, || async {
            let client = self.bearer_client(store_url.to_string()).await?;
            Ok(if org_id.is_empty() {
                client
            } else {
                client.with_header("X-Org-Id", org_id)
            })
        })
        .await
    }

    /// PKI client, as `principal` when given.
    pub async fn pki(&self, principal: Option<&Principal>) -> Result<Arc<ApiClient>, ProviderError> {
        let key = ClientKey::Pki {
            principal: principal.map(|p| p.service_id.clone()),
            key: principal.map(|p| fingerprint(&p.private_key)),
        };
        self.cached(key, || async {
            let base_url = self.config.service_url(Service::Pki)?;
            let tokens = match principal {
                Some(p) => Arc::new(TokenManager::new(
                    Grant::JwtBearer {
                        token_url: self.token_url()?,
                        service_id: p.service_id.clone(),
                        private_key: p.private_key.clone(),
                    },
                    self.http.clone(),
                )),
                None => self.iam_tokens().await?,
            };
            Ok(ApiClient::new(
                self.http.clone(),
                base_url,
                Credential::Bearer(tokens),
                self.retrier(),
            ))
        })
        .await
    }

    /// AI inference client for `endpoint`, or the configured endpoint when `None`.
    pub async fn inference(&self, endpoint: Option<&str>) -> Result<Arc<ApiClient>, ProviderError> {
        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .or_else(|| non_empty(&self.config.ai_inference_endpoint))
            .ok_or_else(|| {
                ProviderError::Configuration(
                    "ai_inference_endpoint is not configured".into(),
                )
            })?
            .trim_end_matches('/')
            .to_string();
        self.cached(
            ClientKey::Inference {
                endpoint: endpoint.clone(),
            },
            || self.bearer_client(endpoint),
        )
        .await
    }

    /// Console client, authenticated against UAA.
    pub async fn console(&self) -> Result<Arc<ApiClient>, ProviderError> {
        self.cached(ClientKey::Console, || async {
            let tokens = self.uaa_tokens().await?;
            Ok(ApiClient::new(
                self.http.clone(),
                self.config.service_url(Service::Console)?,
                Credential::Bearer(tokens),
                self.retrier(),
            ))
        })
        .await
    }

    /// Shared-key signed credentials service client.
    pub async fn s3creds(&self) -> Result<Arc<ApiClient>, ProviderError> {
        self.cached(ClientKey::S3Creds, || async {
            let (Some(shared), Some(secret)) = (
                non_empty(&self.config.shared_key),
                non_empty(&self.config.secret_key),
            ) else {
                return Err(ProviderError::MissingCredentials("shared_key/secret_key".into()));
            };
            Ok(ApiClient::new(
                self.http.clone(),
                self.config.service_url(Service::S3Creds)?,
                Credential::Signed(RequestSigner::new(shared, secret)),
                self.retrier(),
            ))
        })
        .await
    }

    /// Container host fleet client.
    pub async fn cartel(&self) -> Result<Arc<ApiClient>, ProviderError> {
        self.cached(ClientKey::Cartel, || async {
            let (Some(token), Some(secret)) = (
                non_empty(&self.config.cartel_token),
                non_empty(&self.config.cartel_secret),
            ) else {
                return Err(ProviderError::MissingCredentials(
                    "cartel_token/cartel_secret".into(),
                ));
            };
            Ok(ApiClient::new(
                self.cartel_http.clone(),
                self.config.service_url(Service::Cartel)?,
                Credential::Signed(RequestSigner::new(token, secret)),
                self.retrier(),
            ))
        })
        .await
    }

    /// Function runner backend client.
    pub async fn function_backend(
        &self,
        backend: &FunctionBackend,
    ) -> Result<Arc<ApiClient>, ProviderError> {
        if backend.token.is_empty() {
            return Err(ProviderError::MissingCredentials("backend.token".into()));
        }
        let key = ClientKey::Function {
            endpoint: backend.endpoint.trim_end_matches('/').to_string(),
            project: backend.project.clone(),
            token: fingerprint(&backend.token),
        };
        self.cached(key, || async {
            Ok(ApiClient::new(
                self.http.clone(),
                backend.endpoint.clone(),
                Credential::Anonymous,
                self.retrier(),
            )
            .with_header("Authorization", format!("OAuth {}", backend.token)))
        })
        .await
    }
}
