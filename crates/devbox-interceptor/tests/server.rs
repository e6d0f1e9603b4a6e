//! Serves the router over plain HTTP and talks to it like the API server would.

use std::net::SocketAddr;

use devbox_interceptor::{router, MutationConfig};
use serde_json::{json, Value};

async fn serve() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(MutationConfig::new(
        "tw-init:1",
        "tw-toolkit:1",
        "http://devbox-storage:9000/devbox/bin",
    ));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn health_is_ok() {
    let addr = serve().await;
    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn mutate_requires_json() {
    let addr = serve().await;
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/mutate"))
        .header("content-type", "text/plain")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "invalid content type");
}

#[tokio::test]
async fn mutate_answers_admission_review() {
    let addr = serve().await;
    let review = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "abc-123",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "job", "labels": {"testworkflowid-resource": "r1"}},
                "spec": {"containers": [{"name": "main", "image": "tw-toolkit:1", "command": ["/toolkit"]}]},
            },
        },
    });
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/mutate"))
        .json(&review)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "AdmissionReview");
    assert_eq!(body["response"]["uid"], "abc-123");
    assert_eq!(body["response"]["allowed"], true);
    assert!(body["response"]["patch"].as_str().is_some_and(|p| !p.is_empty()));
}

#[tokio::test]
async fn mutate_rejects_non_pods() {
    let addr = serve().await;
    let review = json!({
        "request": {"uid": "x", "kind": {"kind": "ConfigMap"}, "object": {}},
    });
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/mutate"))
        .json(&review)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
