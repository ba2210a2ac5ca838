// SPDX-License-Identifier: MIT OR Apache-2.0
//! The long-running update daemon.
//!
//! Idle → poll → download → install → reboot → verify → commit → cleanup,
//! with rollback mirrors on the failure side.  Every transition writes the
//! deployment state record first, so a power cut mid-deployment resumes at
//! the recorded state on the next start.  Two signals shortcut the idle
//! wait: SIGUSR1 forces an update check, SIGUSR2 an inventory submission;
//! repeated signals during an in-flight check coalesce.

use crate::context::EngineContext;
use crate::deployment_log::DeploymentLog;
use crate::standalone::{stage_streamed, stage_unpacked};
use crate::state_data::{
    REBOOT_TYPE_AUTOMATIC, REBOOT_TYPE_CUSTOM, REBOOT_TYPE_NONE, StateData,
    load_state_data, remove_state_data_txn, rollback_support_from_db, rollback_support_to_db,
    save_state_data,
};
use airlift_api::{ApiClient, DeploymentStatus};
use airlift_context::BROKEN_ARTIFACT_SUFFIX;
use airlift_error::{Error, ErrorKind, Result};
use airlift_http::ResumingClient;
use airlift_modules::{Hook, ModuleRunner, RebootAction, TreeContext, WorkTree};
use airlift_scripts::{ScriptAction, ScriptState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// Deployment record state names.  The strings predate this client and stay
// as-is so records survive up- and downgrades.
const STATE_DOWNLOAD: &str = "update-store";
const STATE_ARTIFACT_INSTALL: &str = "update-install";
const STATE_ARTIFACT_REBOOT: &str = "reboot";
const STATE_ARTIFACT_VERIFY_REBOOT: &str = "after-reboot";
const STATE_ARTIFACT_COMMIT: &str = "update-commit";
const STATE_AFTER_COMMIT: &str = "update-after-commit";
const STATE_ARTIFACT_ROLLBACK: &str = "rollback";
const STATE_ARTIFACT_ROLLBACK_REBOOT: &str = "rollback-reboot";
const STATE_ARTIFACT_VERIFY_ROLLBACK_REBOOT: &str = "after-rollback-reboot";
const STATE_ARTIFACT_FAILURE: &str = "update-error";
const STATE_CLEANUP: &str = "cleanup";
const STATE_STATUS_REPORT_RETRY: &str = "update-retry-report";
// Legacy names older clients may have written.
const LEGACY_AFTER_FIRST_COMMIT: &str = "update-after-first-commit";
const LEGACY_VERIFY_ROLLBACK_REBOOT: &str = "verify-rollback-reboot";
const LEGACY_STATUS_REPORT_ERROR: &str = "status-report-error";

// ---------------------------------------------------------------------------
// Collaborator interfaces
// ---------------------------------------------------------------------------

/// Reboots the device when a payload asks for an automatic reboot.
#[async_trait]
pub trait DeviceRebooter: Send + Sync {
    /// Trigger a system reboot.  On success the process usually dies.
    async fn reboot(&self) -> Result<()>;
}

/// Production rebooter: invokes the system `reboot` command.
pub struct SystemRebooter;

#[async_trait]
impl DeviceRebooter for SystemRebooter {
    async fn reboot(&self) -> Result<()> {
        info!("rebooting the device");
        let status = tokio::process::Command::new("reboot")
            .status()
            .await
            .map_err(|err| Error::new(ErrorKind::Io, format!("reboot command: {err}")))?;
        if !status.success() {
            return Err(Error::new(ErrorKind::Io, "reboot command failed"));
        }
        // Give the system a moment; the reboot will tear this process down.
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(Error::new(ErrorKind::Io, "device did not reboot"))
    }
}

/// Inventory submission lives outside the core; the daemon only triggers it.
#[async_trait]
pub trait InventoryNotifier: Send + Sync {
    /// Gather and push inventory now.
    async fn submit(&self) -> Result<()>;
}

/// Default notifier when no inventory subsystem is wired in.
pub struct NoopInventory;

#[async_trait]
impl InventoryNotifier for NoopInventory {
    async fn submit(&self) -> Result<()> {
        tracing::debug!("no inventory subsystem configured");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The daemon: owns the engine context and the deployment API client.
pub struct Daemon {
    ctx: EngineContext,
    api: ApiClient,
    rebooter: Arc<dyn DeviceRebooter>,
    inventory: Arc<dyn InventoryNotifier>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Assemble a daemon.
    pub fn new(
        ctx: EngineContext,
        api: ApiClient,
        rebooter: Arc<dyn DeviceRebooter>,
        inventory: Arc<dyn InventoryNotifier>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            api,
            rebooter,
            inventory,
            cancel,
        }
    }

    /// Engine context accessor (used by the CLI for bootstrap handling).
    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Run until cancelled.
    ///
    /// Starts with crash recovery, then alternates idle waits with update
    /// checks and inventory submissions.
    pub async fn run(&self) -> Result<()> {
        self.recover_on_startup().await?;

        #[cfg(unix)]
        let (mut check_signal, mut inventory_signal) = {
            use tokio::signal::unix::{SignalKind, signal};
            (
                signal(SignalKind::user_defined1())
                    .map_err(|err| Error::new(ErrorKind::Io, err.to_string()))?,
                signal(SignalKind::user_defined2())
                    .map_err(|err| Error::new(ErrorKind::Io, err.to_string()))?,
            )
        };

        let update_poll = Duration::from_secs(self.ctx.config.update_poll_interval_seconds);
        let inventory_poll = Duration::from_secs(self.ctx.config.inventory_poll_interval_seconds);
        // First tick one full interval out; startup already checked state.
        let mut update_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + update_poll, update_poll);
        let mut inventory_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + inventory_poll,
            inventory_poll,
        );
        update_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        inventory_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!("daemon shutting down");
                    return Ok(());
                }
                _ = update_timer.tick() => {
                    self.check_for_update().await;
                }
                _ = check_signal.recv() => {
                    info!("forced update check");
                    self.check_for_update().await;
                    update_timer.reset();
                }
                _ = inventory_timer.tick() => {
                    self.submit_inventory().await;
                }
                _ = inventory_signal.recv() => {
                    info!("forced inventory submission");
                    self.submit_inventory().await;
                    inventory_timer.reset();
                }
            }
        }
    }

    async fn submit_inventory(&self) {
        if let Err(err) = self.inventory.submit().await {
            warn!(%err, "inventory submission failed");
        }
    }

    /// One update check; a found deployment runs to completion.
    pub async fn check_for_update(&self) {
        let outcome = async {
            let device_type = self.ctx.device.device_type()?;
            let provides = self.ctx.device.load_provides()?;
            self.api.check_new_deployments(&device_type, &provides).await
        }
        .await;

        match outcome {
            Ok(None) => {
                tracing::debug!("no deployment pending");
            }
            Ok(Some(next)) => {
                info!(deployment_id = %next.id, "deployment received");
                let data = StateData::new_for_deployment(next.id, next.uri, next.expire);
                self.run_deployment(data, Recovery::None).await;
            }
            Err(err) => {
                warn!(%err, "update check failed");
            }
        }
    }

    // -- recovery ----------------------------------------------------------

    async fn recover_on_startup(&self) -> Result<()> {
        let data = match load_state_data(&self.ctx.store, self.ctx.config.state_loop_cap) {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::StateDataStoreCountExceeded => {
                // The loop breaker tripped while re-saving; force the
                // deployment into the failure path without another save.
                error!("deployment exceeded the state store count, aborting it");
                self.ctx.store.write_transaction(|txn| {
                    remove_state_data_txn(txn).map_err(airlift_store::StoreError::Domain)
                })?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        info!(state = %data.in_state, deployment_id = %data.update_info.id, "recovering deployment");
        let recovery = match data.in_state.as_str() {
            STATE_ARTIFACT_REBOOT | STATE_ARTIFACT_VERIFY_REBOOT => Recovery::VerifyReboot,
            STATE_ARTIFACT_ROLLBACK_REBOOT
            | STATE_ARTIFACT_VERIFY_ROLLBACK_REBOOT
            | LEGACY_VERIFY_ROLLBACK_REBOOT => Recovery::VerifyRollbackReboot,
            STATE_AFTER_COMMIT | LEGACY_AFTER_FIRST_COMMIT => Recovery::AfterCommit,
            STATE_CLEANUP => Recovery::Cleanup,
            STATE_STATUS_REPORT_RETRY => Recovery::ReportOnly,
            LEGACY_STATUS_REPORT_ERROR => {
                // Historic terminal state; nothing left to do.
                self.ctx.store.write_transaction(|txn| {
                    remove_state_data_txn(txn).map_err(airlift_store::StoreError::Domain)
                })?;
                return Ok(());
            }
            // Everything else (including unknown states) is treated as an
            // interrupted install and rolled back.
            _ => Recovery::Failure,
        };
        self.run_deployment(data, recovery).await;
        Ok(())
    }

    // -- deployment driver ---------------------------------------------------

    async fn run_deployment(&self, data: StateData, recovery: Recovery) {
        let log = match DeploymentLog::begin(
            &self.ctx.config.update_log_path,
            &data.update_info.id,
        ) {
            Ok(log) => Some(Arc::new(log)),
            Err(err) => {
                error!(%err, "was not able to set up the deployment log");
                None
            }
        };

        let mut deployment = DaemonDeployment {
            daemon: self,
            data,
            log,
            module: None,
            tree: None,
            failed_state: None,
        };
        deployment.drive(recovery).await;
    }
}

enum Recovery {
    None,
    VerifyReboot,
    VerifyRollbackReboot,
    AfterCommit,
    Cleanup,
    ReportOnly,
    Failure,
}

struct DaemonDeployment<'a> {
    daemon: &'a Daemon,
    data: StateData,
    log: Option<Arc<DeploymentLog>>,
    module: Option<ModuleRunner>,
    tree: Option<WorkTree>,
    /// State the deployment failed in, reported as the status substate.
    failed_state: Option<String>,
}

impl DaemonDeployment<'_> {
    fn ctx(&self) -> &EngineContext {
        &self.daemon.ctx
    }

    fn log_record(&self, level: &str, message: &str) {
        if let Some(ref log) = self.log {
            log.record(level, message);
        }
    }

    fn save_state(&mut self, in_state: &str) -> Result<()> {
        self.data.in_state = in_state.to_string();
        let store = &self.daemon.ctx.store;
        let state_loop_cap = self.daemon.ctx.config.state_loop_cap;
        save_state_data(store, &mut self.data, state_loop_cap)
    }

    async fn drive(&mut self, recovery: Recovery) {
        let outcome = match recovery {
            Recovery::None => self.fresh_deployment().await,
            Recovery::VerifyReboot => {
                if self.attach_module() {
                    self.verify_reboot_and_commit().await
                } else {
                    Err(Error::new(ErrorKind::DatabaseValue, "cannot re-attach module"))
                }
            }
            Recovery::VerifyRollbackReboot => {
                self.failed_state = Some(STATE_ARTIFACT_VERIFY_ROLLBACK_REBOOT.to_string());
                if self.attach_module() {
                    let err = Error::new(
                        ErrorKind::Validation,
                        "recovered mid-rollback; finishing the rollback",
                    );
                    self.verify_rollback_reboot().await;
                    let rollback_ok = self.data.update_info.all_rollbacks_successful;
                    self.artifact_failure_and_cleanup(rollback_ok).await;
                    Err(err)
                } else {
                    Err(Error::new(ErrorKind::DatabaseValue, "cannot re-attach module"))
                }
            }
            Recovery::AfterCommit => {
                // The commit hook ran; the provides rewrite may not have.
                if self.attach_module() {
                    let committed = self.ctx().device.commit_artifact_data(
                        &self.data.artifact_name.clone(),
                        &self.data.artifact_group.clone(),
                        self.data.artifact_provides.clone().as_ref(),
                        self.data.clears_artifact_provides.clone().as_ref(),
                        |_| Ok(()),
                    );
                    match committed {
                        Ok(()) => self.cleanup_success().await,
                        Err(err) => Err(err),
                    }
                } else {
                    Err(Error::new(ErrorKind::DatabaseValue, "cannot re-attach module"))
                }
            }
            Recovery::Cleanup => {
                if self.attach_module() {
                    self.cleanup_success().await
                } else {
                    Err(Error::new(ErrorKind::DatabaseValue, "cannot re-attach module"))
                }
            }
            Recovery::ReportOnly => {
                self.finish_success_report().await;
                Ok(())
            }
            Recovery::Failure => {
                self.failed_state = Some(self.data.in_state.clone());
                if self.attach_module() {
                    self.failure_path().await;
                }
                Err(Error::new(
                    ErrorKind::Validation,
                    "deployment interrupted; rolled back",
                ))
            }
        };

        match outcome {
            Ok(()) => {
                info!(deployment_id = %self.data.update_info.id, "deployment finished");
            }
            Err(err) => {
                error!(%err, "deployment failed");
                self.log_record("error", &err.to_string());
                self.report_failure().await;
            }
        }
    }

    /// The success spine; any error drops into the failure path.
    async fn fresh_deployment(&mut self) -> Result<()> {
        self.log_record("info", "deployment started");
        self.push_status(DeploymentStatus::Downloading, "").await?;

        if let Err(err) = self.download_and_install().await {
            self.failure_path().await;
            return Err(err);
        }

        // Reboot leg.
        let reboot = self.data.update_info.reboot_requested.first().cloned();
        if matches!(
            reboot.as_deref(),
            Some(REBOOT_TYPE_AUTOMATIC) | Some(REBOOT_TYPE_CUSTOM)
        ) {
            if let Err(err) = self.reboot_leg().await {
                self.failure_path().await;
                return Err(err);
            }
        }

        if let Err(err) = self.commit_leg().await {
            self.failure_path().await;
            return Err(err);
        }
        self.cleanup_success().await?;
        Ok(())
    }

    async fn download_and_install(&mut self) -> Result<()> {
        if let Err(err) = self.save_state(STATE_DOWNLOAD) {
            return Err(self.mark_failed(STATE_DOWNLOAD, err));
        }
        if let Err(err) = self.ctx().clear_artifact_scripts() {
            return Err(self.mark_failed(STATE_DOWNLOAD, err));
        }

        // Fetch and parse the artifact header.
        let uri = self.data.update_info.source.uri.clone();
        let resumer = ResumingClient::new(self.ctx().http.clone());
        let downloaded = resumer.download(&uri, &self.daemon.cancel).await;
        let (_, reader) = match downloaded {
            Ok(pair) => pair,
            Err(err) => return Err(self.mark_failed(STATE_DOWNLOAD, err)),
        };
        let bridge: Box<dyn std::io::Read + Send> = Box::new(SyncIoBridge::new_with_handle(
            reader,
            tokio::runtime::Handle::current(),
        ));
        let parser_config = self.ctx().parser_config();
        let parsed = tokio::task::spawn_blocking(move || {
            let artifact = airlift_artifact::parse(bridge, &parser_config)?;
            let header = artifact.header().clone();
            Ok::<_, Error>((artifact, header))
        })
        .await;
        let (artifact, header) = match parsed {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(self.mark_failed(STATE_DOWNLOAD, err)),
            Err(err) => {
                return Err(self.mark_failed(
                    STATE_DOWNLOAD,
                    Error::new(ErrorKind::Programming, format!("parse task panicked: {err}")),
                ));
            }
        };

        if header.is_empty_payload() {
            return Err(self.mark_failed(
                STATE_DOWNLOAD,
                Error::new(
                    ErrorKind::Validation,
                    "empty-payload artifacts are not deployable through the server",
                ),
            ));
        }

        self.data.fill_from_header(&header);
        if let Err(err) = self.save_state(STATE_DOWNLOAD) {
            return Err(self.mark_failed(STATE_DOWNLOAD, err));
        }

        match self
            .ctx()
            .device
            .matches_artifact_depends(&header.combined_depends())
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.mark_failed(
                    STATE_DOWNLOAD,
                    Error::new(
                        ErrorKind::DependencyMismatch,
                        "artifact depends are not satisfied by this device",
                    ),
                ));
            }
            Err(err) => return Err(self.mark_failed(STATE_DOWNLOAD, err)),
        }

        if let Err(err) = self.prepare_module(&header) {
            return Err(self.mark_failed(STATE_DOWNLOAD, err));
        }
        self.log_record("info", "downloading payload");

        if let Err(err) = self
            .ctx()
            .scripts
            .run_scripts(ScriptState::Download, ScriptAction::Enter)
            .await
        {
            return Err(self.mark_failed(STATE_DOWNLOAD, err));
        }

        let download = {
            let module = self.module.as_ref().expect("module prepared");
            let tree = self.tree.as_ref().expect("tree prepared").clone();
            let cancel = self.daemon.cancel.clone();
            async move {
                if module.provide_payload_file_sizes(&cancel).await? {
                    let stage =
                        tokio::task::spawn_blocking(move || stage_streamed(artifact, &tree));
                    let hook = module.run_hook(Hook::Download, &cancel);
                    let (staged, hooked) = tokio::join!(stage, hook);
                    staged.map_err(|err| {
                        Error::new(ErrorKind::Programming, format!("stage task panicked: {err}"))
                    })??;
                    hooked
                } else {
                    let staged =
                        tokio::task::spawn_blocking(move || stage_unpacked(artifact, &tree)).await;
                    staged.map_err(|err| {
                        Error::new(ErrorKind::Programming, format!("stage task panicked: {err}"))
                    })??;
                    module.run_hook(Hook::Download, &cancel).await
                }
            }
        }
        .await;
        if let Err(err) = download {
            self.ctx().scripts.run_error_scripts(ScriptState::Download).await;
            return Err(self.mark_failed(STATE_DOWNLOAD, err));
        }
        if let Err(err) = self
            .ctx()
            .scripts
            .run_scripts(ScriptState::Download, ScriptAction::Leave)
            .await
        {
            return Err(self.mark_failed(STATE_DOWNLOAD, err));
        }

        // Install.
        self.push_status(DeploymentStatus::Installing, "").await?;
        if let Err(err) = self.save_state(STATE_ARTIFACT_INSTALL) {
            return Err(self.mark_failed(STATE_ARTIFACT_INSTALL, err));
        }
        self.log_record("info", "installing artifact");
        if let Err(err) = self
            .run_module_state(ScriptState::ArtifactInstall, Hook::ArtifactInstall)
            .await
        {
            return Err(self.mark_failed(STATE_ARTIFACT_INSTALL, err));
        }

        // Record reboot and rollback facts for the legs that follow (and for
        // recovery after the reboot).
        let reboot = self.query_needs_reboot().await;
        let reboot = match reboot {
            Ok(reboot) => reboot,
            Err(err) => return Err(self.mark_failed(STATE_ARTIFACT_INSTALL, err)),
        };
        self.data.update_info.reboot_requested = vec![reboot_action_to_db(reboot).to_string()];
        let rollback = self.query_supports_rollback().await;
        let rollback = match rollback {
            Ok(rollback) => rollback,
            Err(err) => return Err(self.mark_failed(STATE_ARTIFACT_INSTALL, err)),
        };
        self.data.update_info.supports_rollback = rollback_support_to_db(rollback).to_string();
        Ok(())
    }

    async fn query_needs_reboot(&self) -> Result<RebootAction> {
        self.module
            .as_ref()
            .expect("module prepared")
            .needs_reboot(&self.daemon.cancel)
            .await
    }

    async fn query_supports_rollback(&self) -> Result<bool> {
        self.module
            .as_ref()
            .expect("module prepared")
            .supports_rollback(&self.daemon.cancel)
            .await
    }

    async fn reboot_leg(&mut self) -> Result<()> {
        self.push_status(DeploymentStatus::Rebooting, "").await?;
        self.save_state(STATE_ARTIFACT_REBOOT)
            .map_err(|err| self.mark_failed(STATE_ARTIFACT_REBOOT, err))?;
        self.log_record("info", "rebooting to finish the install");

        self.ctx()
            .scripts
            .run_scripts(ScriptState::ArtifactReboot, ScriptAction::Enter)
            .await
            .map_err(|err| self.mark_failed(STATE_ARTIFACT_REBOOT, err))?;

        let automatic = self.data.update_info.reboot_requested.first().map(String::as_str)
            == Some(REBOOT_TYPE_AUTOMATIC);
        let rebooted = if automatic {
            // The core reboots; ArtifactReboot is not invoked.
            self.daemon.rebooter.reboot().await
        } else {
            self.module
                .as_ref()
                .expect("module prepared")
                .run_hook(Hook::ArtifactReboot, &self.daemon.cancel)
                .await
        };
        if let Err(err) = rebooted {
            self.ctx()
                .scripts
                .run_error_scripts(ScriptState::ArtifactReboot)
                .await;
            return Err(self.mark_failed(STATE_ARTIFACT_REBOOT, err));
        }

        self.verify_reboot().await
    }

    async fn verify_reboot(&mut self) -> Result<()> {
        self.save_state(STATE_ARTIFACT_VERIFY_REBOOT)
            .map_err(|err| self.mark_failed(STATE_ARTIFACT_VERIFY_REBOOT, err))?;
        if let Err(err) = self
            .module
            .as_ref()
            .expect("module prepared")
            .run_hook(Hook::ArtifactVerifyReboot, &self.daemon.cancel)
            .await
        {
            self.ctx()
                .scripts
                .run_error_scripts(ScriptState::ArtifactReboot)
                .await;
            return Err(self.mark_failed(STATE_ARTIFACT_VERIFY_REBOOT, err));
        }
        self.ctx()
            .scripts
            .run_scripts(ScriptState::ArtifactReboot, ScriptAction::Leave)
            .await
            .map_err(|err| self.mark_failed(STATE_ARTIFACT_VERIFY_REBOOT, err))?;
        Ok(())
    }

    async fn verify_reboot_and_commit(&mut self) -> Result<()> {
        self.verify_reboot().await?;
        self.commit_leg().await?;
        self.cleanup_success().await
    }

    async fn commit_leg(&mut self) -> Result<()> {
        self.save_state(STATE_ARTIFACT_COMMIT)
            .map_err(|err| self.mark_failed(STATE_ARTIFACT_COMMIT, err))?;
        self.log_record("info", "committing artifact");
        if let Err(err) = self
            .run_module_state(ScriptState::ArtifactCommit, Hook::ArtifactCommit)
            .await
        {
            self.ctx()
                .scripts
                .run_error_scripts(ScriptState::ArtifactCommit)
                .await;
            return Err(self.mark_failed(STATE_ARTIFACT_COMMIT, err));
        }

        self.save_state(STATE_AFTER_COMMIT)
            .map_err(|err| self.mark_failed(STATE_AFTER_COMMIT, err))?;
        self.ctx()
            .device
            .commit_artifact_data(
                &self.data.artifact_name.clone(),
                &self.data.artifact_group.clone(),
                self.data.artifact_provides.clone().as_ref(),
                self.data.clears_artifact_provides.clone().as_ref(),
                |_| Ok(()),
            )
            .map_err(|err| self.mark_failed(STATE_AFTER_COMMIT, err))?;
        Ok(())
    }

    /// Cleanup after a committed deployment, then report success.
    async fn cleanup_success(&mut self) -> Result<()> {
        self.save_state(STATE_CLEANUP)
            .map_err(|err| self.mark_failed(STATE_CLEANUP, err))?;
        if let Some(module) = self.module.as_ref() {
            if let Err(err) = module.run_hook(Hook::Cleanup, &self.daemon.cancel).await {
                warn!(%err, "cleanup hook failed after commit");
                self.log_record("warning", &format!("cleanup failed: {err}"));
            }
        }
        if let Some(ref tree) = self.tree {
            if let Err(err) = tree.delete() {
                warn!(%err, "could not remove the module work tree");
            }
        }
        self.ctx()
            .store
            .write_transaction(|txn| {
                remove_state_data_txn(txn).map_err(airlift_store::StoreError::Domain)
            })
            .map_err(Error::from)?;

        self.finish_success_report().await;
        Ok(())
    }

    async fn finish_success_report(&mut self) {
        self.log_record("info", "deployment succeeded");
        if let Err(err) = self.push_status(DeploymentStatus::Success, "").await {
            if err.kind() == ErrorKind::DeploymentAborted {
                warn!("server aborted the deployment after local success");
            } else {
                error!(%err, "could not report success");
            }
        }
        // The record (if any) is gone either way; the server has the logs
        // only on failure.
        let _ = self.ctx().store.write_transaction(|txn| {
            remove_state_data_txn(txn).map_err(airlift_store::StoreError::Domain)
        });
    }

    // -- failure side --------------------------------------------------------

    fn mark_failed(&mut self, state: &str, err: Error) -> Error {
        if self.failed_state.is_none() {
            self.failed_state = Some(state.to_string());
        }
        self.log_record("error", &format!("{state}: {err}"));
        err
    }

    /// Roll back when supported, then `ArtifactFailure` and `Cleanup`.
    async fn failure_path(&mut self) {
        if self.module.is_none() {
            // Failed before the module existed; only the record needs
            // clearing.  Nothing was installed.
            let _ = self.ctx().store.write_transaction(|txn| {
                remove_state_data_txn(txn).map_err(airlift_store::StoreError::Domain)
            });
            return;
        }

        let supported = match self.rollback_supported().await {
            Ok(supported) => supported,
            Err(err) => {
                error!(%err, "could not query rollback support");
                self.data.update_info.all_rollbacks_successful = false;
                self.artifact_failure_and_cleanup(false).await;
                return;
            }
        };

        let mut rolled_back = false;
        if supported {
            rolled_back = self.rollback_leg().await;
        }
        self.artifact_failure_and_cleanup(rolled_back).await;
    }

    async fn rollback_supported(&mut self) -> Result<bool> {
        if !self.data.update_info.supports_rollback.is_empty() {
            return rollback_support_from_db(&self.data.update_info.supports_rollback);
        }
        let module = self.module.as_ref().expect("module prepared");
        let supported = module.supports_rollback(&self.daemon.cancel).await?;
        self.data.update_info.supports_rollback = rollback_support_to_db(supported).to_string();
        Ok(supported)
    }

    async fn rollback_leg(&mut self) -> bool {
        if let Err(err) = self.save_state(STATE_ARTIFACT_ROLLBACK) {
            error!(%err, "cannot persist rollback state");
            return false;
        }
        self.log_record("info", "rolling back");
        if let Err(err) = self
            .run_module_state(ScriptState::ArtifactRollback, Hook::ArtifactRollback)
            .await
        {
            error!(%err, "rollback failed");
            self.log_record("error", &format!("rollback failed: {err}"));
            self.data.update_info.all_rollbacks_successful = false;
            self.ctx()
                .scripts
                .run_error_scripts(ScriptState::ArtifactRollback)
                .await;
            return false;
        }

        // Rollback reboot mirror.
        let needs_reboot = matches!(
            self.data.update_info.reboot_requested.first().map(String::as_str),
            Some(REBOOT_TYPE_AUTOMATIC) | Some(REBOOT_TYPE_CUSTOM)
        );
        if needs_reboot {
            if let Err(err) = self.save_state(STATE_ARTIFACT_ROLLBACK_REBOOT) {
                error!(%err, "cannot persist rollback-reboot state");
                self.data.update_info.all_rollbacks_successful = false;
                return false;
            }
            let automatic = self.data.update_info.reboot_requested.first().map(String::as_str)
                == Some(REBOOT_TYPE_AUTOMATIC);
            let rebooted = if automatic {
                self.daemon.rebooter.reboot().await
            } else {
                self.module
                    .as_ref()
                    .expect("module prepared")
                    .run_hook(Hook::ArtifactRollbackReboot, &self.daemon.cancel)
                    .await
            };
            if let Err(err) = rebooted {
                error!(%err, "rollback reboot failed");
                self.data.update_info.all_rollbacks_successful = false;
                return false;
            }
            self.verify_rollback_reboot().await;
        }
        self.data.update_info.all_rollbacks_successful
    }

    async fn verify_rollback_reboot(&mut self) {
        if let Err(err) = self.save_state(STATE_ARTIFACT_VERIFY_ROLLBACK_REBOOT) {
            error!(%err, "cannot persist verify-rollback-reboot state");
            self.data.update_info.all_rollbacks_successful = false;
            return;
        }
        if let Err(err) = self
            .module
            .as_ref()
            .expect("module prepared")
            .run_hook(Hook::ArtifactVerifyRollbackReboot, &self.daemon.cancel)
            .await
        {
            error!(%err, "rollback reboot verification failed");
            self.data.update_info.all_rollbacks_successful = false;
        }
    }

    async fn artifact_failure_and_cleanup(&mut self, rolled_back: bool) {
        if self.save_state(STATE_ARTIFACT_FAILURE).is_ok() {
            if let Err(err) = self
                .run_module_state(ScriptState::ArtifactFailure, Hook::ArtifactFailure)
                .await
            {
                error!(%err, "ArtifactFailure hook failed");
                self.data.update_info.all_rollbacks_successful = false;
                self.ctx()
                    .scripts
                    .run_error_scripts(ScriptState::ArtifactFailure)
                    .await;
            }
        }

        let _ = self.save_state(STATE_CLEANUP);
        if let Some(module) = self.module.as_ref() {
            if let Err(err) = module.run_hook(Hook::Cleanup, &self.daemon.cancel).await {
                error!(%err, "cleanup hook failed");
            }
        }
        if let Some(ref tree) = self.tree {
            let _ = tree.delete();
        }

        let fully_rolled_back = rolled_back && self.data.update_info.all_rollbacks_successful;
        let finalized = if fully_rolled_back {
            self.ctx()
                .store
                .write_transaction(|txn| {
                    remove_state_data_txn(txn).map_err(airlift_store::StoreError::Domain)
                })
                .map_err(Error::from)
        } else if self.data.artifact_name.is_empty() {
            // Never got as far as parsing an artifact; nothing to poison.
            self.ctx()
                .store
                .write_transaction(|txn| {
                    remove_state_data_txn(txn).map_err(airlift_store::StoreError::Domain)
                })
                .map_err(Error::from)
        } else {
            // Failed without a (working) rollback: poison the artifact name
            // so depends checks reject this device state.
            self.data.artifact_name.push_str(BROKEN_ARTIFACT_SUFFIX);
            if let Some(ref mut provides) = self.data.artifact_provides {
                provides.insert("artifact_name".to_string(), self.data.artifact_name.clone());
            }
            self.ctx().device.commit_artifact_data(
                &self.data.artifact_name.clone(),
                &self.data.artifact_group.clone(),
                self.data.artifact_provides.clone().as_ref(),
                self.data.clears_artifact_provides.clone().as_ref(),
                |txn| remove_state_data_txn(txn),
            )
        };
        if let Err(err) = finalized {
            error!(%err, "error while updating database after failure");
        }
    }

    /// Report failure (status with substate, then logs).  A 409 means the
    /// server already moved on; local teardown has run regardless.
    async fn report_failure(&mut self) {
        let substate = self.failed_state.clone().unwrap_or_default();
        match self
            .push_status(DeploymentStatus::Failure, &substate)
            .await
        {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::DeploymentAborted => {
                warn!("server aborted the deployment; continuing local cleanup");
            }
            Err(err) => {
                error!(%err, "could not report failure status");
            }
        }

        if let Some(log) = self.log.clone() {
            if let Err(err) = self
                .daemon
                .api
                .push_logs(&self.data.update_info.id, log.path())
                .await
            {
                error!(%err, "could not push deployment logs");
            }
        }
    }

    /// Status push with the configured retry budget; aborts pass through.
    async fn push_status(&mut self, status: DeploymentStatus, substate: &str) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self
                .daemon
                .api
                .push_status(&self.data.update_info.id, status, substate)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::DeploymentAborted => return Err(err),
                Err(err) => {
                    attempts += 1;
                    if attempts > self.ctx().config.retry_poll_count {
                        return Err(err);
                    }
                    warn!(%err, attempts, "status push failed, will retry");
                    let _ = self.save_state(STATE_STATUS_REPORT_RETRY);
                    tokio::select! {
                        () = self.daemon.cancel.cancelled() => {
                            return Err(Error::new(ErrorKind::Cancelled, "status push cancelled"));
                        }
                        () = tokio::time::sleep(Duration::from_secs(
                            self.ctx().config.retry_poll_interval_seconds,
                        )) => {}
                    }
                }
            }
        }
    }

    // -- shared helpers ------------------------------------------------------

    fn prepare_module(&mut self, header: &airlift_artifact::ArtifactHeader) -> Result<()> {
        let provides = self.ctx().device.load_provides()?;
        let device_type = self.ctx().device.device_type()?;
        let tree_context = TreeContext {
            current_artifact_name: provides.get("artifact_name").cloned().unwrap_or_default(),
            current_artifact_group: provides.get("artifact_group").cloned().unwrap_or_default(),
            device_type,
            artifact_name: header.artifact_name().to_string(),
            artifact_group: header.artifact_group().to_string(),
            payload_type: header.payload_type().to_string(),
            raw_header_info: header.raw_header_info.clone(),
            raw_type_info: header.raw_type_info.clone(),
            raw_meta_data: header.raw_meta_data.clone(),
        };
        let tree = WorkTree::prepare(self.ctx().config.module_work_dir(), &tree_context)?;
        let mut module = ModuleRunner::new(
            &self.ctx().config.module_directory,
            header.payload_type(),
            tree.root(),
            self.ctx().module_timeout(),
        )?;
        if let Some(log) = self.log.clone() {
            module.set_stderr_sink(Arc::new(move |line: &str| {
                log.record("warning", line);
            }));
        }
        self.tree = Some(tree);
        self.module = Some(module);
        Ok(())
    }

    /// Re-attach module and tree from the persisted record (recovery).
    fn attach_module(&mut self) -> bool {
        let Some(payload_type) = self.data.payload_types.first().cloned() else {
            return false;
        };
        let work_dir = self.ctx().config.module_work_dir();
        let tree = match WorkTree::open(&work_dir) {
            Ok(tree) => Ok(tree),
            Err(_) => WorkTree::prepare(
                &work_dir,
                &TreeContext {
                    artifact_name: self.data.artifact_name.clone(),
                    artifact_group: self.data.artifact_group.clone(),
                    payload_type: payload_type.clone(),
                    ..Default::default()
                },
            ),
        };
        let Ok(tree) = tree else { return false };
        match ModuleRunner::new(
            &self.ctx().config.module_directory,
            &payload_type,
            tree.root(),
            self.ctx().module_timeout(),
        ) {
            Ok(mut module) => {
                if let Some(log) = self.log.clone() {
                    module.set_stderr_sink(Arc::new(move |line: &str| {
                        log.record("warning", line);
                    }));
                }
                self.tree = Some(tree);
                self.module = Some(module);
                true
            }
            Err(err) => {
                error!(%err, "cannot re-attach update module");
                false
            }
        }
    }

    async fn run_module_state(&self, script_state: ScriptState, hook: Hook) -> Result<()> {
        self.ctx()
            .scripts
            .run_scripts(script_state, ScriptAction::Enter)
            .await?;
        self.module
            .as_ref()
            .expect("module prepared")
            .run_hook(hook, &self.daemon.cancel)
            .await?;
        self.ctx()
            .scripts
            .run_scripts(script_state, ScriptAction::Leave)
            .await?;
        Ok(())
    }
}

fn reboot_action_to_db(action: RebootAction) -> &'static str {
    match action {
        RebootAction::No => REBOOT_TYPE_NONE,
        RebootAction::Automatic => REBOOT_TYPE_AUTOMATIC,
        RebootAction::Yes => REBOOT_TYPE_CUSTOM,
    }
}
