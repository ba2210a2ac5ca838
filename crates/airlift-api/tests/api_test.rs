// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deployment API client behaviour against an in-process server.

use airlift_api::{ApiClient, AuthTokenProvider, DeploymentStatus, StaticTokenProvider};
use airlift_error::ErrorKind;
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct Recorded {
    bodies: Arc<Mutex<Vec<(String, Value)>>>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
}

impl Recorded {
    fn push(&self, path: &str, headers: HeaderMap, body: &[u8]) {
        let value = serde_json::from_slice(body).unwrap_or(Value::Null);
        self.bodies.lock().unwrap().push((path.to_string(), value));
        self.headers.lock().unwrap().push(headers);
    }
}

async fn start(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

fn client(base: &str) -> ApiClient {
    ApiClient::new(
        base,
        reqwest::Client::new(),
        Arc::new(StaticTokenProvider::new("secret-token")),
    )
    .unwrap()
}

fn provides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

const DEPLOYMENT_JSON: &str = r#"{
    "id": "dep-42",
    "artifact": {
        "source": {"uri": "https://cdn.example.com/a.mender", "expire": "2026-09-01T00:00:00Z"},
        "artifact_name": "release-2",
        "device_types_compatible": ["test-device"]
    }
}"#;

// ---------------------------------------------------------------------------
// check_new_deployments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn v2_endpoint_receives_full_provides() {
    let recorded = Recorded::default();
    let app = Router::new().route(
        "/api/devices/v2/deployments/device/deployments/next",
        post(
            |State(recorded): State<Recorded>, headers: HeaderMap, body: String| async move {
                recorded.push("v2", headers, body.as_bytes());
                (StatusCode::OK, DEPLOYMENT_JSON)
            },
        ),
    )
    .with_state(recorded.clone());
    let base = start(app).await;

    let deployment = client(&base)
        .check_new_deployments(
            "test-device",
            &provides(&[("artifact_name", "release-1"), ("rootfs-image.checksum", "abc")]),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(deployment.id, "dep-42");
    assert_eq!(deployment.uri, "https://cdn.example.com/a.mender");
    assert_eq!(deployment.expire.as_deref(), Some("2026-09-01T00:00:00Z"));

    let bodies = recorded.bodies.lock().unwrap();
    let sent = &bodies[0].1["device_provides"];
    assert_eq!(sent["device_type"], "test-device");
    assert_eq!(sent["artifact_name"], "release-1");
    assert_eq!(sent["rootfs-image.checksum"], "abc");

    let headers = recorded.headers.lock().unwrap();
    assert_eq!(
        headers[0].get("authorization").unwrap(),
        "Bearer secret-token"
    );
}

#[tokio::test]
async fn no_content_means_no_deployment() {
    let app = Router::new().route(
        "/api/devices/v2/deployments/device/deployments/next",
        post(|| async { StatusCode::NO_CONTENT }),
    );
    let base = start(app).await;
    let result = client(&base)
        .check_new_deployments("dev", &provides(&[("artifact_name", "v1")]))
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn v2_404_falls_back_to_v1_get_with_encoded_query() {
    let recorded = Recorded::default();
    let app = Router::new()
        .route(
            "/api/devices/v2/deployments/device/deployments/next",
            post(|| async { StatusCode::NOT_FOUND }),
        )
        .route(
            "/api/devices/v1/deployments/device/deployments/next",
            get(
                |State(recorded): State<Recorded>,
                 axum::extract::RawQuery(query): axum::extract::RawQuery| async move {
                    recorded.push(
                        "v1",
                        HeaderMap::new(),
                        format!("{:?}", query).as_bytes(),
                    );
                    assert_eq!(
                        query.as_deref(),
                        Some("artifact_name=release+1%2Fbeta&device_type=test-device")
                    );
                    (StatusCode::OK, DEPLOYMENT_JSON)
                },
            ),
        )
        .with_state(recorded.clone());
    let base = start(app).await;

    let deployment = client(&base)
        .check_new_deployments("test-device", &provides(&[("artifact_name", "release 1/beta")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.id, "dep-42");
}

#[tokio::test]
async fn error_envelope_message_is_included() {
    let app = Router::new().route(
        "/api/devices/v2/deployments/device/deployments/next",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error": "database on fire"}"#,
            )
        }),
    );
    let base = start(app).await;
    let err = client(&base)
        .check_new_deployments("dev", &provides(&[("artifact_name", "v1")]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedHttpResponse);
    assert!(err.message().contains("500"));
    assert!(err.message().contains("database on fire"));
}

#[tokio::test]
async fn missing_artifact_name_in_provides_is_rejected_locally() {
    let base = start(Router::new()).await;
    let err = client(&base)
        .check_new_deployments("dev", &BTreeMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn deployment_without_id_is_parse_error() {
    let app = Router::new().route(
        "/api/devices/v2/deployments/device/deployments/next",
        post(|| async { (StatusCode::OK, r#"{"artifact":{"source":{"uri":"x"}}}"#) }),
    );
    let base = start(app).await;
    let err = client(&base)
        .check_new_deployments("dev", &provides(&[("artifact_name", "v1")]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert!(err.message().contains("deployment ID"));
}

// ---------------------------------------------------------------------------
// push_status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_body_includes_substate_only_when_set() {
    let recorded = Recorded::default();
    let app = Router::new()
        .route(
            "/api/devices/v1/deployments/device/deployments/{id}/status",
            put(
                |State(recorded): State<Recorded>, headers: HeaderMap, body: String| async move {
                    recorded.push("status", headers, body.as_bytes());
                    StatusCode::NO_CONTENT
                },
            ),
        )
        .with_state(recorded.clone());
    let base = start(app).await;
    let api = client(&base);

    api.push_status("dep-42", DeploymentStatus::Downloading, "")
        .await
        .unwrap();
    api.push_status("dep-42", DeploymentStatus::Failure, "ArtifactInstall")
        .await
        .unwrap();

    let bodies = recorded.bodies.lock().unwrap();
    assert_eq!(bodies[0].1, serde_json::json!({"status": "downloading"}));
    assert_eq!(
        bodies[1].1,
        serde_json::json!({"status": "failure", "substate": "ArtifactInstall"})
    );
}

#[tokio::test]
async fn status_409_is_deployment_aborted() {
    let app = Router::new().route(
        "/api/devices/v1/deployments/device/deployments/{id}/status",
        put(|| async { StatusCode::CONFLICT }),
    );
    let base = start(app).await;
    let err = client(&base)
        .push_status("dep-42", DeploymentStatus::Installing, "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeploymentAborted);
}

#[tokio::test]
async fn status_500_is_unexpected_response() {
    let app = Router::new().route(
        "/api/devices/v1/deployments/device/deployments/{id}/status",
        put(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let base = start(app).await;
    let err = client(&base)
        .push_status("dep-42", DeploymentStatus::Success, "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedHttpResponse);
}

// ---------------------------------------------------------------------------
// 401 refresh
// ---------------------------------------------------------------------------

struct FlakyAuth {
    refreshes: AtomicUsize,
}

#[async_trait]
impl AuthTokenProvider for FlakyAuth {
    async fn token(&self) -> airlift_error::Result<String> {
        Ok("stale".to_string())
    }

    async fn refresh(&self) -> airlift_error::Result<String> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok("fresh".to_string())
    }
}

#[tokio::test]
async fn single_401_is_retried_after_refresh() {
    let app = Router::new().route(
        "/api/devices/v1/deployments/device/deployments/{id}/status",
        put(|headers: HeaderMap| async move {
            if headers.get("authorization").unwrap() == "Bearer fresh" {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::UNAUTHORIZED
            }
        }),
    );
    let base = start(app).await;

    let auth = Arc::new(FlakyAuth {
        refreshes: AtomicUsize::new(0),
    });
    let api = ApiClient::new(&base, reqwest::Client::new(), auth.clone()).unwrap();
    api.push_status("dep-42", DeploymentStatus::Success, "")
        .await
        .unwrap();
    assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_401_is_fatal() {
    let app = Router::new().route(
        "/api/devices/v1/deployments/device/deployments/{id}/status",
        put(|| async { StatusCode::UNAUTHORIZED }),
    );
    let base = start(app).await;

    let auth = Arc::new(FlakyAuth {
        refreshes: AtomicUsize::new(0),
    });
    let api = ApiClient::new(&base, reqwest::Client::new(), auth.clone()).unwrap();
    let err = api
        .push_status("dep-42", DeploymentStatus::Success, "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedHttpResponse);
    assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// push_logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn log_push_sends_sanitized_body_with_exact_length() {
    let recorded: Arc<Mutex<Vec<(Option<String>, Vec<u8>)>>> = Arc::default();
    let sink = recorded.clone();
    let app = Router::new().route(
        "/api/devices/v1/deployments/device/deployments/{id}/log",
        put(move |headers: HeaderMap, body: axum::body::Bytes| {
            let sink = sink.clone();
            async move {
                let content_length = headers
                    .get("content-length")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                sink.lock().unwrap().push((content_length, body.to_vec()));
                StatusCode::NO_CONTENT
            }
        }),
    );
    let base = start(app).await;

    let dir = tempfile::tempdir().unwrap();
    let log_file = dir.path().join("deployments.0001.dep-42.log");
    std::fs::write(
        &log_file,
        concat!(
            r#"{"timestamp":"t1","level":"info","message":"started"}"#, "\n",
            "GARBAGE LINE\n",
            r#"{"timestamp":"t2","level":"info","message":"installing"}"#, "\n",
            "ANOTHER BAD ONE\n",
            r#"{"timestamp":"t3","level":"info","message":"done"}"#, "\n",
        ),
    )
    .unwrap();

    client(&base).push_logs("dep-42", &log_file).await.unwrap();

    let recorded = recorded.lock().unwrap();
    let (content_length, body) = &recorded[0];
    assert_eq!(
        content_length.as_deref(),
        Some(body.len().to_string().as_str())
    );

    let parsed: Value = serde_json::from_slice(body).unwrap();
    let messages = parsed["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 6);
    assert!(
        messages[0]["message"]
            .as_str()
            .unwrap()
            .contains("INVALID ENTRIES")
    );
    assert_eq!(messages[2]["message"], "(CORRUPTED LOG DATA)");
    assert_eq!(messages[2]["timestamp"], "t1");
    assert_eq!(messages[4]["timestamp"], "t2");

    // The sanitizer's side file must be gone.
    assert!(!dir.path().join("deployments.0001.dep-42.log.sanitized").exists());
}
