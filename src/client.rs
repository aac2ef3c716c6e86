//! Per-service HTTP client.
//!
//! An [`ApiClient`] pairs a base URL with a credential and a [`Retrier`].
//! Every request goes through [`ApiClient::send`], which attaches the bearer
//! token or request signature on each attempt and lets the retrier decide
//! what happens on failure.

use std::sync::Arc;

use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::auth::{RequestSigner, TokenManager};
use crate::error::ProviderError;
use crate::retry::{AuthRefresh, Retrier};

/// Failure of a single HTTP exchange.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// No response was received.
    #[error("transport: {0}")]
    Transport(String),
    /// The response body could not be decoded.
    #[error("decode: {0}")]
    Decode(String),
    /// The request URL could not be built.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,
    /// Obtaining credentials failed.
    #[error(transparent)]
    Auth(ProviderError),
}

impl ApiError {
    /// HTTP status, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// How requests are authenticated.
#[derive(Debug, Clone)]
pub enum Credential {
    /// No credentials.
    Anonymous,
    /// OAuth2 bearer token, refreshed through the shared manager.
    Bearer(Arc<TokenManager>),
    /// HMAC request signature.
    Signed(RequestSigner),
}

/// A request description that can be replayed on every attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    retry_on: Vec<u16>,
}

impl ApiRequest {
    /// New request; `path` is relative to the client base URL, or absolute.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            retry_on: Vec::new(),
        }
    }

    /// GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// PUT request.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// PATCH request.
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Append a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// JSON body with `application/json` content type.
    pub fn json(self, body: &Value) -> Self {
        self.body_with_type("application/json", body.to_string().into_bytes())
    }

    /// Raw body with the given content type.
    pub fn body_with_type(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = Some(body);
        self
    }

    /// Retry these statuses on top of the client's defaults.
    pub fn retry_on(mut self, codes: &[u16]) -> Self {
        self.retry_on.extend_from_slice(codes);
        self
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path or URL.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A buffered response with a success status.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    headers: HeaderMap,
    /// Raw body.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Body as (lossy) UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Header value, if present and printable.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `Location` header.
    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }
}

/// HTTP client bound to one service endpoint and credential.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credential: Credential,
    retrier: Retrier,
    default_headers: Vec<(String, String)>,
}

impl ApiClient {
    /// Client for `base_url`.
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        credential: Credential,
        retrier: Retrier,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
            retrier,
            default_headers: Vec::new(),
        }
    }

    /// Send `key: value` on every request.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((key.into(), value.into()));
        self
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The credential attached to requests.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Resolve `path` below the base URL. Absolute URLs pass through.
    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        let invalid = |e: url::ParseError| ApiError::InvalidUrl(format!("{}: {}", path, e));
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).map_err(invalid);
        }
        if path.is_empty() {
            return Url::parse(&self.base_url).map_err(invalid);
        }
        // The trailing slash keeps the last base segment when joining.
        Url::parse(&format!("{}/", self.base_url))
            .and_then(|base| base.join(path.trim_start_matches('/')))
            .map_err(invalid)
    }

    /// Fetch a token eagerly so credential problems surface at construction.
    pub async fn authenticate(&self) -> Result<(), ProviderError> {
        if let Credential::Bearer(tokens) = &self.credential {
            tokens.token().await?;
        }
        Ok(())
    }

    /// Send `request`, retrying according to the client's policy.
    pub async fn send(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ApiError> {
        let retrier = if request.retry_on.is_empty() {
            self.retrier.clone()
        } else {
            self.retrier.clone().also_retry(&request.retry_on)
        };
        let refresher: Option<&dyn AuthRefresh> = match &self.credential {
            Credential::Bearer(tokens) => Some(tokens.as_ref()),
            _ => None,
        };
        retrier
            .run(cancel, refresher, || self.attempt(request, cancel))
            .await
    }

    /// Send and decode the JSON body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError> {
        self.send(request, cancel).await?.json()
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path)?;
        let mut builder = self.http.request(request.method.clone(), url.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(key.as_str(), value.as_str());
        }
        match &self.credential {
            Credential::Anonymous => {},
            Credential::Bearer(tokens) => {
                let token = tokens.token().await.map_err(ApiError::Auth)?;
                builder = builder.bearer_auth(token);
            },
            Credential::Signed(signer) => {
                for (key, value) in signer.headers(Utc::now()) {
                    builder = builder.header(key, value);
                }
            },
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let method = &request.method;
        debug!(%method, %url, "sending HTTP request");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            result = builder.send() => result.map_err(|e| {
                debug!(%method, %url, error = %e, "HTTP request failed");
                ApiError::Transport(e.to_string())
            })?,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            bytes = response.bytes() => bytes.map_err(|e| ApiError::Transport(e.to_string()))?,
        };
        debug!(%method, %url, %status, "received HTTP response");

        if status.is_success() || status.is_redirection() {
            Ok(ApiResponse {
                status: status.as_u16(),
                headers,
                body: body.to_vec(),
            })
        } else {
            Err(ApiError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Grant;
    use crate::retry::Backoff;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn retrier() -> Retrier {
        Retrier::new(3).with_backoff(Backoff::with_initial(Duration::from_millis(1)))
    }

    fn anonymous(server: &MockServer) -> ApiClient {
        ApiClient::new(reqwest::Client::new(), server.uri(), Credential::Anonymous, retrier())
    }

    #[test]
    fn test_url_resolution() {
        let client = ApiClient::new(
            reqwest::Client::new(),
            "https://cdr.example/store/fhir/ORG/",
            Credential::Anonymous,
            Retrier::default(),
        );
        assert_eq!(client.base_url(), "https://cdr.example/store/fhir/ORG");
        assert_eq!(
            client.url("Organization/1").unwrap().as_str(),
            "https://cdr.example/store/fhir/ORG/Organization/1"
        );
        assert_eq!(
            client.url("/Organization/1/$purge?x=1").unwrap().as_str(),
            "https://cdr.example/store/fhir/ORG/Organization/1/$purge?x=1"
        );
        assert_eq!(client.url("https://other/x").unwrap().as_str(), "https://other/x");
        assert_eq!(client.url("").unwrap().path(), "/store/fhir/ORG");

        let broken = ApiClient::new(
            reqwest::Client::new(),
            "not a url",
            Credential::Anonymous,
            Retrier::default(),
        );
        assert!(matches!(broken.url("x"), Err(ApiError::InvalidUrl(_))));
    }

    #[test]
    fn test_request_builder() {
        let req = ApiRequest::post("/x")
            .header("Content-Type", "text/plain")
            .json(&serde_json::json!({"a": 1}))
            .retry_on(&[404]);
        assert_eq!(req.method(), &Method::POST);
        let content_types: Vec<_> = req
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(content_types[0].1, "application/json");
        assert_eq!(req.retry_on, vec![404]);
    }

    #[tokio::test]
    async fn test_send_json_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/core/notification/Topic"))
            .and(query_param("name", "alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"total": 1})))
            .mount(&server)
            .await;

        let client = anonymous(&server);
        let value: Value = client
            .send_json(
                &ApiRequest::get("/core/notification/Topic").query("name", "alerts"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(value["total"], 1);
    }

    #[tokio::test]
    async fn test_error_status_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/things"))
            .and(body_json(serde_json::json!({"name": "x"})))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad name"))
            .expect(1)
            .mount(&server)
            .await;

        let err = anonymous(&server)
            .send(
                &ApiRequest::post("/things").json(&serde_json::json!({"name": "x"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            ApiError::Status { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "bad name");
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_per_request_retry_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eventually"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eventually"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let response = anonymous(&server)
            .send(
                &ApiRequest::get("/eventually").retry_on(&[404]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_bearer_refresh_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/authorize/oauth2/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok", "expires_in": 1800})),
            )
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resource"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resource"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let tokens = Arc::new(TokenManager::new(
            Grant::Password {
                token_url: format!("{}/authorize/oauth2/token", server.uri()),
                client_id: "c".into(),
                client_secret: "s".into(),
                username: "u".into(),
                password: "p".into(),
            },
            reqwest::Client::new(),
        ));
        let client = ApiClient::new(
            reqwest::Client::new(),
            server.uri(),
            Credential::Bearer(Arc::clone(&tokens)),
            retrier(),
        );
        let response = client
            .send(&ApiRequest::get("/resource"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(tokens.generation().await, 2);
    }

    #[tokio::test]
    async fn test_signed_requests_carry_signature() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/signed"))
            .and(header_exists("signeddate"))
            .and(header_exists("hsdp-api-signature"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(
            reqwest::Client::new(),
            server.uri(),
            Credential::Signed(RequestSigner::new("k", "s")),
            retrier(),
        )
        .with_header("Api-Version", "1");
        let response = client
            .send(&ApiRequest::get("/signed"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, 204);
    }

    #[tokio::test]
    async fn test_location_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Organization/o1/$purge"))
            .respond_with(
                ResponseTemplate::new(202).insert_header("Location", "https://cdr/status/1"),
            )
            .mount(&server)
            .await;

        let response = anonymous(&server)
            .send(
                &ApiRequest::post("/Organization/o1/$purge"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(response.location(), Some("https://cdr/status/1"));
    }
}
