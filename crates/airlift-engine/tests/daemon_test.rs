// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon deployment flows against a mock deployment service.

use airlift_api::{ApiClient, StaticTokenProvider};
use airlift_artifact::testutil::ArtifactBuilder;
use airlift_config::{ClientConfig, ConfigFile};
use airlift_engine::daemon::{Daemon, DeviceRebooter, NoopInventory};
use airlift_engine::{EngineContext, StateData, save_state_data};
use airlift_error::Result;
use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path as AxPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use serde_json::Value;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock deployment service
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Server {
    artifact: Arc<Vec<u8>>,
    offered: Arc<AtomicBool>,
    statuses: Arc<Mutex<Vec<(String, String)>>>,
    logs: Arc<Mutex<Vec<Value>>>,
    /// Status value that gets a 409 instead of a 204.
    abort_on_status: Option<String>,
    base: Arc<Mutex<String>>,
}

impl Server {
    fn new(artifact: Vec<u8>) -> Self {
        Self {
            artifact: Arc::new(artifact),
            offered: Arc::new(AtomicBool::new(false)),
            statuses: Arc::new(Mutex::new(Vec::new())),
            logs: Arc::new(Mutex::new(Vec::new())),
            abort_on_status: None,
            base: Arc::new(Mutex::new(String::new())),
        }
    }

    fn statuses(&self) -> Vec<(String, String)> {
        self.statuses.lock().unwrap().clone()
    }

    async fn start(self) -> (String, Server) {
        let app = Router::new()
            .route(
                "/api/devices/v2/deployments/device/deployments/next",
                post(next_deployment),
            )
            .route(
                "/api/devices/v1/deployments/device/deployments/{id}/status",
                put(push_status),
            )
            .route(
                "/api/devices/v1/deployments/device/deployments/{id}/log",
                put(push_logs),
            )
            .route("/artifact.mender", get(serve_artifact))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        let base = format!("http://{addr}");
        *self.base.lock().unwrap() = base.clone();
        (base, self)
    }
}

async fn next_deployment(State(server): State<Server>) -> axum::response::Response {
    use axum::response::IntoResponse;
    if server.offered.swap(true, Ordering::SeqCst) {
        return StatusCode::NO_CONTENT.into_response();
    }
    let base = server.base.lock().unwrap().clone();
    let body = serde_json::json!({
        "id": "dep-7",
        "artifact": {"source": {"uri": format!("{base}/artifact.mender")}}
    });
    (StatusCode::OK, body.to_string()).into_response()
}

async fn push_status(
    State(server): State<Server>,
    AxPath(_id): AxPath<String>,
    body: String,
) -> StatusCode {
    let doc: Value = serde_json::from_str(&body).unwrap();
    let status = doc["status"].as_str().unwrap_or_default().to_string();
    let substate = doc["substate"].as_str().unwrap_or_default().to_string();
    server.statuses.lock().unwrap().push((status.clone(), substate));
    if server.abort_on_status.as_deref() == Some(status.as_str()) {
        StatusCode::CONFLICT
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn push_logs(
    State(server): State<Server>,
    AxPath(_id): AxPath<String>,
    body: axum::body::Bytes,
) -> StatusCode {
    let doc: Value = serde_json::from_slice(&body).unwrap();
    server.logs.lock().unwrap().push(doc);
    StatusCode::NO_CONTENT
}

async fn serve_artifact(State(server): State<Server>) -> Vec<u8> {
    server.artifact.as_ref().clone()
}

// ---------------------------------------------------------------------------
// Device fixture
// ---------------------------------------------------------------------------

struct Device {
    dir: tempfile::TempDir,
    config: ClientConfig,
}

impl Device {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("device_type"), "device_type=test-device\n").unwrap();
        let mut config = ClientConfig::resolve(ConfigFile::default(), &data);
        config.retry_poll_count = 1;
        config.retry_poll_interval_seconds = 1;
        std::fs::create_dir_all(&config.module_directory).unwrap();
        Self { dir, config }
    }

    fn module(&self, body: &str) {
        let path = self.config.module_directory.join("rootfs-image");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "LOG={}", self.hook_log().display()).unwrap();
        writeln!(file, "echo \"$1\" >> \"$LOG\"").unwrap();
        write!(file, "{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn hook_log(&self) -> std::path::PathBuf {
        self.dir.path().join("hooks.log")
    }

    fn hooks(&self) -> Vec<String> {
        std::fs::read_to_string(self.hook_log())
            .unwrap_or_default()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    fn daemon(&self, base: &str, rebooter: Arc<dyn DeviceRebooter>) -> (Daemon, CancellationToken) {
        let ctx = EngineContext::open(self.config.clone()).unwrap();
        ctx.device
            .commit_artifact_data("release-1", "", None, None, |_| Ok(()))
            .unwrap();
        let api = ApiClient::new(
            base,
            reqwest::Client::new(),
            Arc::new(StaticTokenProvider::new("token")),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let daemon = Daemon::new(ctx, api, rebooter, Arc::new(NoopInventory), cancel.clone());
        (daemon, cancel)
    }

    fn provides(&self, daemon: &Daemon) -> Vec<(String, String)> {
        daemon
            .context()
            .device
            .load_provides()
            .unwrap()
            .into_iter()
            .collect()
    }
}

struct RecordingRebooter {
    reboots: AtomicUsize,
}

#[async_trait]
impl DeviceRebooter for RecordingRebooter {
    async fn reboot(&self) -> Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn artifact_bytes() -> Vec<u8> {
    ArtifactBuilder::new("release-2")
        .device_types(&["test-device"])
        .provides(&[("rootfs-image.checksum", "beef")])
        .clears_provides(&["rootfs-image.*"])
        .file("rootfs.ext4", b"daemon payload")
        .build()
}

fn no_reboot() -> Arc<RecordingRebooter> {
    Arc::new(RecordingRebooter {
        reboots: AtomicUsize::new(0),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offered_deployment_installs_and_reports_success() {
    let device = Device::new();
    device.module("exit 0\n");
    let (base, server) = Server::new(artifact_bytes()).start().await;
    let (daemon, _cancel) = device.daemon(&base, no_reboot());

    daemon.check_for_update().await;

    assert_eq!(
        server
            .statuses()
            .iter()
            .map(|(s, _)| s.as_str())
            .collect::<Vec<_>>(),
        ["downloading", "installing", "success"]
    );
    assert!(
        device
            .provides(&daemon)
            .contains(&("artifact_name".into(), "release-2".into()))
    );
    let hooks = device.hooks();
    assert!(hooks.contains(&"ArtifactCommit".to_string()));
    assert!(hooks.contains(&"Cleanup".to_string()));
    // No deployment record left behind.
    assert!(
        airlift_engine::load_state_data(&daemon.context().store, 28)
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn automatic_reboot_interposes_between_install_and_commit() {
    let device = Device::new();
    device.module("[ \"$1\" = NeedsArtifactReboot ] && echo Automatic\nexit 0\n");
    let (base, server) = Server::new(artifact_bytes()).start().await;
    let rebooter = no_reboot();
    let (daemon, _cancel) = device.daemon(&base, rebooter.clone());

    daemon.check_for_update().await;

    assert_eq!(rebooter.reboots.load(Ordering::SeqCst), 1);
    // The core rebooted; ArtifactReboot must not have been invoked.
    assert!(!device.hooks().contains(&"ArtifactReboot".to_string()));
    assert!(device.hooks().contains(&"ArtifactVerifyReboot".to_string()));
    assert_eq!(
        server
            .statuses()
            .iter()
            .map(|(s, _)| s.as_str())
            .collect::<Vec<_>>(),
        ["downloading", "installing", "rebooting", "success"]
    );
}

#[tokio::test]
async fn install_failure_reports_substate_and_pushes_logs() {
    let device = Device::new();
    device.module("[ \"$1\" = ArtifactInstall ] && exit 1\nexit 0\n");
    let (base, server) = Server::new(artifact_bytes()).start().await;
    let (daemon, _cancel) = device.daemon(&base, no_reboot());

    daemon.check_for_update().await;

    let statuses = server.statuses();
    let (last_status, substate) = statuses.last().unwrap();
    assert_eq!(last_status, "failure");
    assert_eq!(substate, "update-install");

    // Logs were pushed as a well-formed messages document.
    let logs = server.logs.lock().unwrap();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0]["messages"].as_array().unwrap().is_empty());

    // No rollback support: the device state is poisoned.
    assert!(
        device
            .provides(&daemon)
            .contains(&("artifact_name".into(), "release-2_INCONSISTENT".into()))
    );
}

#[tokio::test]
async fn server_side_abort_still_runs_local_rollback() {
    let device = Device::new();
    device.module("[ \"$1\" = SupportsRollback ] && echo Yes\nexit 0\n");
    let mut server = Server::new(artifact_bytes());
    server.abort_on_status = Some("installing".to_string());
    let (base, _server) = server.start().await;
    let (daemon, _cancel) = device.daemon(&base, no_reboot());

    daemon.check_for_update().await;

    // The abort arrived before install; the module rolled back locally.
    let hooks = device.hooks();
    assert!(hooks.contains(&"ArtifactRollback".to_string()));
    assert!(hooks.contains(&"Cleanup".to_string()));
    assert!(!hooks.contains(&"ArtifactCommit".to_string()));

    // Device state unchanged after the successful rollback.
    assert!(
        device
            .provides(&daemon)
            .contains(&("artifact_name".into(), "release-1".into()))
    );
    assert!(
        airlift_engine::load_state_data(&daemon.context().store, 28)
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn startup_recovery_after_reboot_finishes_the_commit() {
    let device = Device::new();
    device.module("exit 0\n");
    let (base, server) = Server::new(artifact_bytes()).start().await;
    let (daemon, cancel) = device.daemon(&base, no_reboot());

    // Seed the record a pre-reboot client would have left behind.
    let mut data = StateData::new_for_deployment("dep-7".into(), format!("{base}/artifact.mender"), None);
    data.in_state = "after-reboot".into();
    data.artifact_name = "release-2".into();
    data.payload_types = vec!["rootfs-image".into()];
    data.update_info.reboot_requested = vec!["reboot-type-automatic".into()];
    data.update_info.supports_rollback = "rollback-supported".into();
    save_state_data(&daemon.context().store, &mut data, 28).unwrap();

    // Run with cancellation pre-set: recovery happens, the idle loop exits.
    cancel.cancel();
    daemon.run().await.unwrap();

    let hooks = device.hooks();
    assert!(hooks.contains(&"ArtifactVerifyReboot".to_string()));
    assert!(hooks.contains(&"ArtifactCommit".to_string()));
    assert_eq!(
        server
            .statuses()
            .iter()
            .map(|(s, _)| s.as_str())
            .collect::<Vec<_>>(),
        ["success"]
    );
    assert!(
        device
            .provides(&daemon)
            .contains(&("artifact_name".into(), "release-2".into()))
    );
}

#[tokio::test]
async fn startup_recovery_mid_install_rolls_back() {
    let device = Device::new();
    device.module("[ \"$1\" = SupportsRollback ] && echo Yes\nexit 0\n");
    let (base, server) = Server::new(artifact_bytes()).start().await;
    let (daemon, cancel) = device.daemon(&base, no_reboot());

    let mut data = StateData::new_for_deployment("dep-7".into(), format!("{base}/artifact.mender"), None);
    data.in_state = "update-install".into();
    data.artifact_name = "release-2".into();
    data.payload_types = vec!["rootfs-image".into()];
    save_state_data(&daemon.context().store, &mut data, 28).unwrap();

    cancel.cancel();
    daemon.run().await.unwrap();

    let hooks = device.hooks();
    assert!(hooks.contains(&"ArtifactRollback".to_string()));
    assert!(hooks.contains(&"ArtifactFailure".to_string()));
    let statuses = server.statuses();
    assert_eq!(statuses.last().unwrap().0, "failure");
    // The device keeps its previous identity after the rollback.
    assert!(
        device
            .provides(&daemon)
            .contains(&("artifact_name".into(), "release-1".into()))
    );
}

#[tokio::test]
async fn clean_store_recovers_to_idle() {
    let device = Device::new();
    device.module("exit 0\n");
    let (base, _server) = Server::new(artifact_bytes()).start().await;
    let (daemon, cancel) = device.daemon(&base, no_reboot());

    cancel.cancel();
    daemon.run().await.unwrap();
    assert!(device.hooks().is_empty());
}
