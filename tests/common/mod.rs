//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use hemmer_provider_hsdp::retry::Backoff;
use hemmer_provider_hsdp::testing::{mock_provider_config, ProviderTester};
use hemmer_provider_hsdp::HsdpProvider;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const IAM_TOKEN_PATH: &str = "/authorize/oauth2/token";
pub const UAA_TOKEN_PATH: &str = "/oauth/token";

/// Provider isolated from the process environment, with millisecond waits.
pub fn provider() -> HsdpProvider {
    HsdpProvider::new()
        .with_env(|_| None)
        .with_backoff(Backoff::with_initial(Duration::from_millis(1)))
        .with_poll_interval(Duration::from_millis(1))
}

pub fn token_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": "access-token",
        "token_type": "bearer",
        "expires_in": 3600
    }))
}

/// Mount the IAM and UAA token endpoints.
pub async fn mount_tokens(server: &MockServer) {
    for token_path in [IAM_TOKEN_PATH, UAA_TOKEN_PATH] {
        Mock::given(method("POST"))
            .and(path(token_path))
            .respond_with(token_response())
            .mount(server)
            .await;
    }
}

/// A configured tester whose services all live on `server`.
pub async fn tester(server: &MockServer) -> ProviderTester<HsdpProvider> {
    mount_tokens(server).await;
    configured(server).await
}

/// A configured tester; token endpoints are left to the caller.
pub async fn configured(server: &MockServer) -> ProviderTester<HsdpProvider> {
    let tester = ProviderTester::new(provider());
    tester
        .configure(mock_provider_config(&server.uri()))
        .await
        .unwrap();
    tester
}

/// FHIR store base URL on `server`.
pub fn store(server: &MockServer) -> String {
    format!("{}/store/fhir/ROOT", server.uri())
}
