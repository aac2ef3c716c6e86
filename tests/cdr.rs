mod common;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_org_purge_waits_for_success() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;
    let status_url = format!("{}/purge-status/job-1", server.uri());

    Mock::given(method("POST"))
        .and(path("/store/fhir/ROOT/Organization/org-1/$purge"))
        .and(header("Prefer", "respond-async"))
        .and(header("X-Org-Id", "org-1"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", status_url.as_str()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/purge-status/job-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "PURGING"})))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/purge-status/job-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "SUCCESS"})))
        .expect(1)
        .mount(&server)
        .await;

    let diagnostics = tester
        .delete(
            "hsdp_cdr_org",
            json!({
                "id": "org-1",
                "fhir_store": common::store(&server),
                "org_id": "org-1",
                "name": "Hospital",
                "version": "stu3",
                "purge_delete": true
            }),
        )
        .await
        .unwrap();
    assert!(diagnostics.is_empty());
}

#[tokio::test]
async fn test_org_purge_failure_is_reported() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;
    let status_url = format!("{}/purge-status/job-2", server.uri());

    Mock::given(method("POST"))
        .and(path("/store/fhir/ROOT/Organization/org-2/$purge"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", status_url.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/purge-status/job-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "FAILED"})))
        .mount(&server)
        .await;

    let err = tester
        .delete(
            "hsdp_cdr_org",
            json!({
                "id": "org-2",
                "fhir_store": common::store(&server),
                "org_id": "org-2",
                "name": "Clinic",
                "purge_delete": true
            }),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("FAILED"), "{}", err);
}

#[tokio::test]
async fn test_subscription_header_change_is_patched() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("GET"))
        .and(path("/store/fhir/ROOT/Subscription/sub-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Subscription",
            "id": "sub-1",
            "status": "active",
            "criteria": "Patient?",
            "reason": "sync",
            "channel": {
                "type": "rest-hook",
                "endpoint": "https://hook.example/notify",
                "payload": "application/fhir+json",
                "header": ["A: 1"]
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/store/fhir/ROOT/Subscription/sub-1"))
        .and(header("Content-Type", "application/json-patch+json"))
        .and(body_json(json!([
            {"op": "add", "path": "/channel/header/1", "value": "B: 2"}
        ])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let prior = json!({
        "id": "sub-1",
        "fhir_store": common::store(&server),
        "criteria": "Patient?",
        "endpoint": "https://hook.example/notify",
        "headers": ["A: 1"],
        "reason": "sync",
        "version": "stu3"
    });
    let mut planned = prior.clone();
    planned["headers"] = json!(["A: 1", "B: 2"]);

    let result = tester
        .update("hsdp_cdr_subscription", prior, planned)
        .await
        .unwrap();
    assert_eq!(result.state["status"], "active");
}

#[tokio::test]
async fn test_org_import_reads_r4_document() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("GET"))
        .and(path("/store/fhir/ROOT/Organization/org-9"))
        .and(header("Accept", "application/fhir+json;fhirVersion=4.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Organization",
            "id": "org-9",
            "active": true,
            "name": "Ward 9",
            "partOf": {"reference": "Organization/org-1"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let state = tester
        .lifecycle_import(
            "hsdp_cdr_org",
            &format!("{},org-9,r4", common::store(&server)),
        )
        .await
        .unwrap();
    assert_eq!(state["id"], "org-9");
    assert_eq!(state["org_id"], "org-9");
    assert_eq!(state["name"], "Ward 9");
    assert_eq!(state["part_of"], "org-1");
    assert_eq!(state["version"], "r4");
}

#[tokio::test]
async fn test_fhir_store_data_source() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("GET"))
        .and(path("/store/fhir/ROOT/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "CapabilityStatement",
            "fhirVersion": "3.0.1"
        })))
        .mount(&server)
        .await;

    let result = tester
        .read_data_source(
            "hsdp_cdr_fhir_store",
            json!({"base_url": format!("{}/", server.uri()), "fhir_org_id": "ROOT"}),
        )
        .await
        .unwrap();
    assert_eq!(result.state["version"], "stu3");
    assert_eq!(result.state["fhir_version"], "3.0.1");
    assert_eq!(result.state["endpoint"], common::store(&server));
}
