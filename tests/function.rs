mod common;

use hemmer_provider_hsdp::crypto::verify_code_signature;
use hemmer_provider_hsdp::testing::assert_warning_contains;
use hemmer_provider_hsdp::ProviderError;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLUSTER_PUBLIC_KEY: &str = include_str!("fixtures/cluster_public.pem");

fn backend(server: &MockServer) -> Value {
    json!([{
        "endpoint": server.uri(),
        "project": "p1",
        "token": "backend-token",
        "cluster_public_key": CLUSTER_PUBLIC_KEY
    }])
}

async fn schedules_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.unwrap();
    let request = requests
        .iter()
        .find(|r| r.url.path() == "/projects/p1/schedules")
        .expect("schedules were registered");
    serde_json::from_slice(&request.body).unwrap()
}

#[tokio::test]
async fn test_cron_function_registers_one_dormant_schedule() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p1/codes"))
        .and(header("Authorization", "OAuth backend-token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "code-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"schedules": [{"id": "sched-1"}]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let result = tester
        .create(
            "hsdp_function",
            json!({
                "name": "nightly",
                "docker_image": "registry.example/nightly:1",
                "schedule": "0 2 * * *",
                "start_at": "2026-01-01T00:00:00Z",
                "backend": backend(&server)
            }),
        )
        .await
        .unwrap();

    let state = result.state;
    assert_eq!(state["id"], "code-1");
    assert_eq!(state["schedule_ids"], json!(["sched-1"]));
    let code_name = state["code_name"].as_str().unwrap();
    assert!(code_name.starts_with("nightly-"));
    assert_eq!(
        state["endpoint"],
        format!("{}/function/{}", server.uri(), code_name)
    );
    assert!(verify_code_signature(
        "backend-token",
        code_name,
        state["signature"].as_str().unwrap()
    ));

    let body = schedules_body(&server).await;
    let schedules = body["schedules"].as_array().unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0]["run_every"], 946_080_000u64);
    assert_eq!(schedules[0]["code_name"], code_name);
    assert_eq!(schedules[0]["start_at"], "2026-01-01T00:00:00Z");
    assert!(!schedules[0]["payload"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_gateway_function_registers_sync_and_async_schedules() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p1/codes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "code-2"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "schedules": [{"id": "sched-sync"}, {"id": "sched-async"}]
        })))
        .mount(&server)
        .await;

    let result = tester
        .create(
            "hsdp_function",
            json!({
                "name": "api",
                "docker_image": "registry.example/api:1",
                "backend": backend(&server)
            }),
        )
        .await
        .unwrap();
    assert_eq!(
        result.state["schedule_ids"],
        json!(["sched-sync", "sched-async"])
    );
    let body = schedules_body(&server).await;
    assert_eq!(body["schedules"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_function_delete_cancels_schedules_then_code() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules/sched-1/cancel"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/projects/p1/codes/code-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let diagnostics = tester
        .delete(
            "hsdp_function",
            json!({
                "id": "code-1",
                "name": "nightly",
                "docker_image": "registry.example/nightly:1",
                "schedule_ids": ["sched-1"],
                "backend": backend(&server)
            }),
        )
        .await
        .unwrap();
    assert!(diagnostics.is_empty());
}

fn deployed(server: &MockServer, image: &str) -> Value {
    json!({
        "id": "code-old",
        "name": "nightly",
        "docker_image": image,
        "schedule": "0 2 * * *",
        "code_name": "nightly-old",
        "schedule_ids": ["sched-old"],
        "backend": backend(server)
    })
}

async fn mount_deploy(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/projects/p1/codes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "code-new"})))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"schedules": [{"id": "sched-new"}]})),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn backend_calls(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().starts_with("/projects/"))
        .map(|r| format!("{} {}", r.method, r.url.path()))
        .collect()
}

#[tokio::test]
async fn test_function_update_deploys_before_retiring_old_version() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;
    mount_deploy(&server).await;
    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules/sched-old/cancel"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/projects/p1/codes/code-old"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let result = tester
        .update(
            "hsdp_function",
            deployed(&server, "registry.example/nightly:1"),
            deployed(&server, "registry.example/nightly:2"),
        )
        .await
        .unwrap();
    assert_eq!(result.state["id"], "code-new");
    assert_eq!(result.state["schedule_ids"], json!(["sched-new"]));
    assert!(result.diagnostics.is_empty());

    assert_eq!(
        backend_calls(&server).await,
        vec![
            "POST /projects/p1/codes",
            "POST /projects/p1/schedules",
            "POST /projects/p1/schedules/sched-old/cancel",
            "DELETE /projects/p1/codes/code-old",
        ]
    );
}

#[tokio::test]
async fn test_function_update_warns_when_old_version_lingers() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;
    mount_deploy(&server).await;
    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules/sched-old/cancel"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/projects/p1/codes/code-old"))
        .respond_with(ResponseTemplate::new(403).set_body_string("locked"))
        .mount(&server)
        .await;

    let result = tester
        .update(
            "hsdp_function",
            deployed(&server, "registry.example/nightly:1"),
            deployed(&server, "registry.example/nightly:2"),
        )
        .await
        .unwrap();
    assert_eq!(result.state["id"], "code-new");
    assert_warning_contains(&result.diagnostics, "not cleaned up");
}

#[tokio::test]
async fn test_failed_schedule_registration_removes_new_code() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p1/codes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "code-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad cron"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/projects/p1/codes/code-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let err = tester
        .create(
            "hsdp_function",
            json!({
                "name": "nightly",
                "docker_image": "registry.example/nightly:1",
                "schedule": "0 2 * * *",
                "backend": backend(&server)
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(422));
}

#[tokio::test]
async fn test_short_schedule_reply_cancels_partial_schedules() {
    let server = MockServer::start().await;
    let tester = common::tester(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p1/codes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "code-2"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"schedules": [{"id": "sched-sync"}]})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/projects/p1/schedules/sched-sync/cancel"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/projects/p1/codes/code-2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let err = tester
        .create(
            "hsdp_function",
            json!({
                "name": "api",
                "docker_image": "registry.example/api:1",
                "backend": backend(&server)
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::InvalidResponse(_)), "{}", err);
}
