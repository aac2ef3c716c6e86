mod common;

use hemmer_provider_hsdp::testing::assert_warning_contains;
use hemmer_provider_hsdp::ProviderError;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOPICS: &str = "/core/notification/Topic";

fn topic() -> Value {
    json!({
        "_id": "t-1",
        "name": "alerts",
        "producerId": "p-1",
        "scope": "public",
        "allowedScopes": [],
        "isAuditable": false,
        "description": "alerting"
    })
}

#[tokio::test]
async fn test_unauthorized_refreshes_token_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::IAM_TOKEN_PATH))
        .respond_with(common::token_response())
        .expect(2)
        .mount(&server)
        .await;
    let tester = common::configured(&server).await;

    Mock::given(method("POST"))
        .and(path(TOPICS))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOPICS))
        .and(header("Authorization", "Bearer access-token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"_id": "t-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/t-1", TOPICS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(topic()))
        .mount(&server)
        .await;

    let result = tester
        .create(
            "hsdp_notification_topic",
            json!({"name": "alerts", "producer_id": "p-1", "description": "alerting"}),
        )
        .await
        .unwrap();
    assert_eq!(result.state["id"], "t-1");
    assert_eq!(result.state["scope"], "public");
}

#[tokio::test]
async fn test_not_found_is_gone() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("{}/t-404", TOPICS)))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/t-404", TOPICS)))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let state = json!({"id": "t-404", "name": "alerts", "producer_id": "p-1"});
    let read = tester
        .read("hsdp_notification_topic", state.clone())
        .await
        .unwrap();
    assert!(read.is_gone());

    let diagnostics = tester.delete("hsdp_notification_topic", state).await.unwrap();
    assert!(diagnostics.is_empty());
}

#[tokio::test]
async fn test_missing_token_endpoint_is_not_gone() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::IAM_TOKEN_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/t-1", TOPICS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(topic()))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/t-1", TOPICS)))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;
    let tester = common::configured(&server).await;
    let state = json!({"id": "t-1", "name": "alerts", "producer_id": "p-1"});

    let err = tester
        .read("hsdp_notification_topic", state.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::AuthFailed { status: 404, .. }), "{:?}", err);

    let err = tester.delete("hsdp_notification_topic", state).await.unwrap_err();
    assert!(matches!(err, ProviderError::AuthFailed { status: 404, .. }), "{:?}", err);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("{}/t-1", TOPICS)))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/t-1", TOPICS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(topic()))
        .expect(1)
        .mount(&server)
        .await;

    let read = tester
        .read("hsdp_notification_topic", json!({"id": "t-1"}))
        .await
        .unwrap();
    assert_eq!(read.state["description"], "alerting");
}

#[tokio::test]
async fn test_no_op_updates_make_no_requests() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    let cases = [
        (
            "hsdp_iam_proposition",
            json!({
                "id": "prop-1",
                "name": "prop",
                "description": "old",
                "organization_id": "org-1",
                "global_reference_id": "ref-1"
            }),
            "description",
            json!("new"),
        ),
        (
            "hsdp_iam_application",
            json!({
                "id": "app-1",
                "name": "app",
                "description": "old",
                "proposition_id": "prop-1",
                "global_reference_id": "ref-2"
            }),
            "description",
            json!("new"),
        ),
        (
            "hsdp_pki_cert",
            json!({
                "id": "11:22",
                "tenant_id": "tenant",
                "role": "web",
                "common_name": "web.example",
                "principal": [{"service_id": "svc-a", "private_key": "KEY-A"}]
            }),
            "principal",
            json!([{"service_id": "svc-b", "private_key": "KEY-B"}]),
        ),
    ];

    for (resource_type, prior, attribute, value) in cases {
        let mut planned = prior.clone();
        planned[attribute] = value.clone();
        let result = tester
            .update(resource_type, prior, planned)
            .await
            .unwrap_or_else(|e| panic!("{}: {}", resource_type, e));
        assert_eq!(result.state[attribute], value, "{}", resource_type);
        if resource_type == "hsdp_pki_cert" {
            assert!(result.diagnostics.is_empty());
        } else {
            assert_warning_contains(&result.diagnostics, "cannot be updated");
        }
    }

    let requests = server.received_requests().await.unwrap();
    assert!(requests.is_empty(), "unexpected requests: {:?}", requests);
}

#[tokio::test]
async fn test_autoscaler_import_round_trip() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("GET"))
        .and(path("/v3/metrics/guid-1/autoscalers/web"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "enabled": true,
                "minInstances": 2,
                "maxInstances": 4,
                "thresholds": [{"name": "cpu", "enabled": true, "min": 10, "max": 80}]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let state = tester
        .lifecycle_import("hsdp_metrics_autoscaler", "guid-1,web")
        .await
        .unwrap();
    assert_eq!(state["id"], "guid-1,web");
    assert_eq!(state["metrics_instance_id"], "guid-1");
    assert_eq!(state["max_instances"], 4);
    assert_eq!(state["threshold_cpu"][0]["max"], 80);

    let err = tester
        .import_resource("hsdp_metrics_autoscaler", "guid-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Validation(_)));
}

#[tokio::test]
async fn test_config_data_source() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    let own = tester
        .read_data_source("hsdp_config", json!({"service": "iam"}))
        .await
        .unwrap();
    assert_eq!(own.state["url"], server.uri());
    assert_eq!(own.state["region"], "us-east");

    let other = tester
        .read_data_source(
            "hsdp_config",
            json!({"service": "iam", "region": "eu-west", "environment": "prod"}),
        )
        .await
        .unwrap();
    assert_eq!(
        other.state["url"],
        "https://iam-service.eu-west.philips-healthsuite.com"
    );
    assert_eq!(other.state["id"], "iam-eu-west-prod");
}

#[tokio::test]
async fn test_operations_fail_after_stop() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;
    tester.stop().await.unwrap();

    let err = tester
        .read("hsdp_notification_topic", json!({"id": "t-1"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::FailedPrecondition(_)));
}
