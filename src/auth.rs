//! Credentials: token grants, a single-flight token cache, and request signing.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::error::ProviderError;
use crate::retry::AuthRefresh;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a JWT bearer assertion.
const ASSERTION_LIFETIME_MINUTES: i64 = 60;

/// How an access token is obtained.
#[derive(Clone)]
pub enum Grant {
    /// IAM resource-owner password grant with OAuth2 client credentials.
    Password {
        /// `{iam}/authorize/oauth2/token`
        token_url: String,
        /// OAuth2 client id.
        client_id: String,
        /// OAuth2 client secret.
        client_secret: String,
        /// Org admin login.
        username: String,
        /// Org admin password.
        password: String,
    },
    /// IAM JWT bearer grant signed with a service identity's private key.
    JwtBearer {
        /// `{iam}/authorize/oauth2/token`
        token_url: String,
        /// Service identity id; used as issuer and subject.
        service_id: String,
        /// PEM-encoded RSA private key.
        private_key: String,
    },
    /// UAA password grant used by console services.
    Uaa {
        /// `{uaa}/oauth/token`
        token_url: String,
        /// UAA login.
        username: String,
        /// UAA password.
        password: String,
    },
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { token_url, username, .. } => f
                .debug_struct("Password")
                .field("token_url", token_url)
                .field("username", username)
                .finish_non_exhaustive(),
            Self::JwtBearer { token_url, service_id, .. } => f
                .debug_struct("JwtBearer")
                .field("token_url", token_url)
                .field("service_id", service_id)
                .finish_non_exhaustive(),
            Self::Uaa { token_url, username, .. } => f
                .debug_struct("Uaa")
                .field("token_url", token_url)
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl Grant {
    fn token_url(&self) -> &str {
        match self {
            Self::Password { token_url, .. }
            | Self::JwtBearer { token_url, .. }
            | Self::Uaa { token_url, .. } => token_url,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::JwtBearer { .. } => "jwt-bearer",
            Self::Uaa { .. } => "uaa",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    1800
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    exp: i64,
}

/// Build the RS256 assertion for a JWT bearer grant.
pub fn sign_assertion(
    service_id: &str,
    private_key: &str,
    audience: &str,
    now: DateTime<Utc>,
) -> Result<String, ProviderError> {
    // Keys pasted into config often carry literal "\n" sequences.
    let pem = private_key.replace("\\n", "\n");
    let key = EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| ProviderError::Configuration(format!("invalid service_private_key: {}", e)))?;
    let claims = AssertionClaims {
        iss: service_id,
        sub: service_id,
        aud: audience,
        exp: (now + Duration::minutes(ASSERTION_LIFETIME_MINUTES)).timestamp(),
    };
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| ProviderError::Configuration(format!("cannot sign assertion: {}", e)))
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self, grace_period: Duration) -> bool {
        Utc::now() + grace_period >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct TokenSlot {
    token: Option<CachedToken>,
    generation: u64,
}

/// Caches one bearer token and refreshes it at most once at a time.
///
/// Callers that arrive while a refresh is running wait on it and then read the
/// new token instead of starting their own.
#[derive(Debug)]
pub struct TokenManager {
    grant: Grant,
    http: reqwest::Client,
    slot: RwLock<TokenSlot>,
    refresh_lock: Mutex<()>,
    grace_period: Duration,
}

impl TokenManager {
    /// Token manager for `grant` using `http` for token requests.
    pub fn new(grant: Grant, http: reqwest::Client) -> Self {
        Self {
            grant,
            http,
            slot: RwLock::new(TokenSlot::default()),
            refresh_lock: Mutex::new(()),
            grace_period: Duration::seconds(60),
        }
    }

    /// Number of completed refreshes.
    pub async fn generation(&self) -> u64 {
        self.slot.read().await.generation
    }

    /// A token valid for at least the grace period, refreshing if needed.
    pub async fn token(&self) -> Result<String, ProviderError> {
        let observed = {
            let slot = self.slot.read().await;
            if let Some(token) = &slot.token {
                if !token.is_expired(self.grace_period) {
                    return Ok(token.access_token.clone());
                }
            }
            slot.generation
        };
        self.refresh_after(observed, false).await?;
        self.slot
            .read()
            .await
            .token
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| ProviderError::AuthFailed {
                status: 0,
                detail: "no token after refresh".into(),
            })
    }

    /// Discard the current token and fetch a new one.
    pub async fn force_refresh(&self) -> Result<(), ProviderError> {
        let observed = self.generation().await;
        self.refresh_after(observed, true).await
    }

    async fn refresh_after(&self, observed: u64, force: bool) -> Result<(), ProviderError> {
        let _guard = self.refresh_lock.lock().await;
        {
            let slot = self.slot.read().await;
            if slot.generation != observed {
                debug!(grant = self.grant.kind(), "token refreshed by another caller");
                return Ok(());
            }
            if !force {
                if let Some(token) = &slot.token {
                    if !token.is_expired(self.grace_period) {
                        return Ok(());
                    }
                }
            }
        }

        let fresh = self.acquire().await?;
        let mut slot = self.slot.write().await;
        slot.token = Some(fresh);
        slot.generation += 1;
        Ok(())
    }

    #[instrument(skip(self), fields(grant = self.grant.kind()))]
    async fn acquire(&self) -> Result<CachedToken, ProviderError> {
        let url = self.grant.token_url();
        let request = match &self.grant {
            Grant::Password {
                client_id,
                client_secret,
                username,
                password,
                ..
            } => self
                .http
                .post(url)
                .basic_auth(client_id, Some(client_secret))
                .header("Api-Version", "2")
                .form(&[
                    ("grant_type", "password"),
                    ("username", username.as_str()),
                    ("password", password.as_str()),
                ]),
            Grant::JwtBearer {
                service_id,
                private_key,
                ..
            } => {
                let assertion = sign_assertion(service_id, private_key, url, Utc::now())?;
                self.http.post(url).header("Api-Version", "2").form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ])
            },
            Grant::Uaa {
                username, password, ..
            } => self.http.post(url).basic_auth("cf", Some("")).form(&[
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ]),
        };

        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::AuthFailed {
                status: 0,
                detail: format!("token request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "token request rejected");
            return Err(ProviderError::AuthFailed {
                status: status.as_u16(),
                detail: body,
            });
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("cannot parse token response: {}", e))
        })?;
        let expires_at = Utc::now() + Duration::seconds(parsed.expires_in);
        debug!(
            "acquired token, expires at {}",
            expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl AuthRefresh for TokenManager {
    async fn refresh(&self) -> Result<(), ProviderError> {
        self.force_refresh().await
    }
}

/// Name of the date header covered by the signature.
pub const SIGNED_DATE_HEADER: &str = "SignedDate";

/// Name of the signature header.
pub const SIGNATURE_HEADER: &str = "hsdp-api-signature";

/// HMAC-SHA256 request signer for shared-key services.
#[derive(Clone)]
pub struct RequestSigner {
    shared_key: String,
    secret_key: String,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("shared_key", &self.shared_key)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Signer for the given key pair.
    pub fn new(shared_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            shared_key: shared_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Headers to attach to a request sent at `now`.
    pub fn headers(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let signed_date = now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let signature = self.signature(&signed_date);
        vec![
            (SIGNED_DATE_HEADER, signed_date),
            (
                SIGNATURE_HEADER,
                format!(
                    "HmacSHA256;Credential:{};SignedHeaders:{};Signature:{}",
                    self.shared_key, SIGNED_DATE_HEADER, signature
                ),
            ),
        ]
    }

    fn signature(&self, signed_date: &str) -> String {
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(self.secret_key.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(signed_date.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}
