// SPDX-License-Identifier: MIT OR Apache-2.0
//! Standalone install driver: the same engine as the daemon, driven by a
//! local file or URL instead of the deployment service.
//!
//! The flow is linear — prepare, download, install, then either hold for an
//! explicit commit/rollback (when the module supports rollback) or commit
//! immediately.  Every transition persists the state record *before* doing
//! the state's work, so a crash at any point resumes at the right place.
//! Results accumulate into a [`ResultFlags`] mask plus an error chain; a
//! failure in the teardown path never erases the error that caused it.

use crate::context::EngineContext;
use crate::result::{ResultAndError, ResultFlags};
use crate::state_data::{
    REBOOT_TYPE_AUTOMATIC, REBOOT_TYPE_CUSTOM, REBOOT_TYPE_NONE, STATE_DATA_VERSION, StateData,
    rollback_support_from_db, rollback_support_to_db,
};
use airlift_artifact::{Artifact, ArtifactHeader};
use airlift_context::BROKEN_ARTIFACT_SUFFIX;
use airlift_error::{Error, ErrorKind, Result};
use airlift_http::ResumingClient;
use airlift_modules::{Hook, ModuleRunner, RebootAction, TreeContext, WorkTree};
use airlift_scripts::{ScriptAction, ScriptState};
use airlift_store::{STANDALONE_STATE_KEY, Store, StoreError};
use std::io::Read;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// Standalone state names persisted in the record.
const STATE_DOWNLOAD: &str = "download";
const STATE_ARTIFACT_INSTALL: &str = "artifact-install";
const STATE_PENDING_COMMIT: &str = "pending-commit";
const STATE_ARTIFACT_COMMIT: &str = "artifact-commit";
const STATE_ARTIFACT_ROLLBACK: &str = "artifact-rollback";
const STATE_ARTIFACT_FAILURE: &str = "artifact-failure";
const STATE_CLEANUP: &str = "cleanup";

// ---------------------------------------------------------------------------
// Record persistence (standalone slot)
// ---------------------------------------------------------------------------

fn save_standalone(store: &Store, data: &mut StateData, loop_cap: u64) -> Result<()> {
    if data.update_info.state_data_store_count >= loop_cap {
        return Err(Error::new(
            ErrorKind::StateDataStoreCountExceeded,
            "state looping detected, breaking out of loop",
        ));
    }
    data.update_info.state_data_store_count += 1;
    let content =
        serde_json::to_vec(data).map_err(|err| Error::new(ErrorKind::Programming, err.to_string()))?;
    store
        .write(STANDALONE_STATE_KEY, &content)
        .map_err(Error::from)
}

fn load_standalone(store: &Store) -> Result<Option<StateData>> {
    let bytes = match store.read(STANDALONE_STATE_KEY) {
        Ok(bytes) => bytes,
        Err(StoreError::KeyNotFound(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let data: StateData = serde_json::from_slice(&bytes)
        .map_err(|err| Error::new(ErrorKind::DatabaseValue, err.to_string()))?;
    if data.version != STATE_DATA_VERSION {
        return Err(Error::new(
            ErrorKind::DatabaseValue,
            "standalone state data version not supported by this client",
        ));
    }
    Ok(Some(data))
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Install an artifact from a local path or an http(s) URL.
pub async fn install(ctx: &EngineContext, src: &str, cancel: &CancellationToken) -> ResultAndError {
    let mut outcome = ResultAndError::default();

    match load_standalone(&ctx.store) {
        Ok(None) => {}
        Ok(Some(_)) => {
            outcome.update(
                ResultFlags::FAILED,
                Some(Error::new(
                    ErrorKind::Validation,
                    "another update is already in progress; commit or roll it back first",
                )),
            );
            return outcome;
        }
        Err(err) => {
            outcome.update(ResultFlags::FAILED, Some(err));
            return outcome;
        }
    }

    let mut driver = Driver::new(ctx, cancel.clone());
    driver.run_install(src).await;
    driver.finish(outcome)
}

/// Resume an interrupted standalone operation at its persisted state.
pub async fn resume(ctx: &EngineContext, cancel: &CancellationToken) -> ResultAndError {
    continue_from_record(ctx, cancel, Continue::Resume).await
}

/// Commit an installed-but-uncommitted update.
pub async fn commit(ctx: &EngineContext, cancel: &CancellationToken) -> ResultAndError {
    continue_from_record(ctx, cancel, Continue::Commit).await
}

/// Roll back an installed-but-uncommitted update.
pub async fn rollback(ctx: &EngineContext, cancel: &CancellationToken) -> ResultAndError {
    continue_from_record(ctx, cancel, Continue::Rollback).await
}

enum Continue {
    Resume,
    Commit,
    Rollback,
}

async fn continue_from_record(
    ctx: &EngineContext,
    cancel: &CancellationToken,
    how: Continue,
) -> ResultAndError {
    let mut outcome = ResultAndError::default();
    let data = match load_standalone(&ctx.store) {
        Ok(Some(data)) => data,
        Ok(None) => {
            outcome.update(
                ResultFlags::NO_UPDATE_IN_PROGRESS | ResultFlags::FAILED,
                Some(Error::new(ErrorKind::NoUpdateInProgress, "no update in progress")),
            );
            return outcome;
        }
        Err(err) => {
            outcome.update(ResultFlags::FAILED, Some(err));
            return outcome;
        }
    };

    let mut driver = Driver::new(ctx, cancel.clone());
    driver.data = data;

    match how {
        Continue::Resume => driver.run_resume().await,
        Continue::Commit => {
            if driver.attach_module().await {
                driver.do_commit().await;
            }
        }
        Continue::Rollback => {
            if driver.attach_module().await {
                driver.do_user_rollback().await;
            }
        }
    }
    driver.finish(outcome)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver<'a> {
    ctx: &'a EngineContext,
    cancel: CancellationToken,
    outcome: ResultAndError,
    data: StateData,
    module: Option<ModuleRunner>,
    tree: Option<WorkTree>,
}

impl<'a> Driver<'a> {
    fn new(ctx: &'a EngineContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            outcome: ResultAndError::default(),
            data: StateData {
                version: STATE_DATA_VERSION,
                ..Default::default()
            },
            module: None,
            tree: None,
        }
    }

    fn fail(&mut self, flags: ResultFlags, err: Error) {
        self.outcome.update(flags | ResultFlags::FAILED, Some(err));
    }

    /// Persist the record with `in_state`, carrying the bookkeeping flags.
    fn save_state(&mut self, in_state: &str) -> Result<()> {
        self.data.in_state = in_state.to_string();
        if self.outcome.result.contains(ResultFlags::FAILED) {
            self.data.failed = true;
        }
        if self.outcome.result.contains(ResultFlags::ROLLED_BACK)
            || self.outcome.result.contains(ResultFlags::NO_ROLLBACK_NECESSARY)
        {
            self.data.rolled_back = true;
        }
        if self.outcome.result.contains(ResultFlags::ROLLBACK_FAILED) {
            self.data.rolled_back = false;
        }
        save_standalone(&self.ctx.store, &mut self.data, self.ctx.config.state_loop_cap)
    }

    /// Exit bookkeeping: a persisted failure flag must not leak into the
    /// *next* run — a resumed rollback reports its own outcome, not the
    /// install failure that caused it.
    fn finish(mut self, mut outcome: ResultAndError) -> ResultAndError {
        if self.data.failed {
            if let Ok(Some(mut data)) = load_standalone(&self.ctx.store) {
                data.failed = false;
                if let Err(err) = save_standalone(
                    &self.ctx.store,
                    &mut data,
                    self.ctx.config.state_loop_cap,
                ) {
                    self.outcome.update(ResultFlags::FAILED, Some(err));
                }
            }
        }
        outcome.update(self.outcome.result, self.outcome.error.take());
        outcome
    }

    // -- install -----------------------------------------------------------

    async fn run_install(&mut self, src: &str) {
        let early_fail = ResultFlags::NO_ROLLBACK_NECESSARY;

        if let Err(err) = self.ctx.clear_artifact_scripts() {
            self.fail(early_fail, err);
            return;
        }

        let reader = match open_artifact_reader(self.ctx, src, &self.cancel).await {
            Ok(reader) => reader,
            Err(err) => {
                self.fail(early_fail, err);
                return;
            }
        };

        let parser_config = self.ctx.parser_config();
        let parsed = tokio::task::spawn_blocking(move || {
            let artifact = airlift_artifact::parse(reader, &parser_config)?;
            let header = artifact.header().clone();
            Ok::<_, Error>((artifact, header))
        })
        .await;
        let (artifact, header) = match flatten_join(parsed) {
            Ok(pair) => pair,
            Err(err) => {
                self.fail(early_fail, err);
                return;
            }
        };

        self.data = StateData {
            version: STATE_DATA_VERSION,
            ..Default::default()
        };
        self.data.fill_from_header(&header);
        self.data.update_info.all_rollbacks_successful = true;

        if header.is_empty_payload() {
            self.do_empty_payload_artifact(artifact).await;
            return;
        }

        info!(artifact_name = %self.data.artifact_name, "installing artifact");

        match self.ctx.device.matches_artifact_depends(&header.combined_depends()) {
            Ok(true) => {}
            Ok(false) => {
                self.fail(
                    early_fail,
                    Error::new(
                        ErrorKind::DependencyMismatch,
                        "artifact depends are not satisfied by this device",
                    ),
                );
                return;
            }
            Err(err) => {
                self.fail(early_fail, err);
                return;
            }
        }

        if !self.prepare_module(&header) {
            return;
        }

        // Download.
        if let Err(err) = self.save_state(STATE_DOWNLOAD) {
            self.fail(early_fail, err);
            return;
        }
        if let Err(err) = self.do_download(artifact).await {
            error!(%err, "streaming failed");
            self.fail(early_fail, err);
            self.ctx.scripts.run_error_scripts(ScriptState::Download).await;
            self.cleanup_after_failure().await;
            return;
        }
        self.outcome.update(ResultFlags::DOWNLOADED, None);

        // ArtifactInstall.
        if let Err(err) = self.save_state(STATE_ARTIFACT_INSTALL) {
            self.fail(ResultFlags::NONE, err);
            self.installation_failure_handler().await;
            return;
        }
        if let Err(err) = self.run_module_state(ScriptState::ArtifactInstall, Hook::ArtifactInstall).await {
            error!(%err, "installation failed");
            self.fail(ResultFlags::NONE, err);
            self.installation_failure_handler().await;
            return;
        }
        self.outcome.update(ResultFlags::INSTALLED, None);

        self.reboot_and_rollback_query().await;
    }

    async fn do_empty_payload_artifact(&mut self, mut artifact: Artifact<ArtifactReader>) {
        info!("artifact with empty payload, committing immediately");
        // Drives the (empty or absent) data section so its checks still run.
        let drained = tokio::task::spawn_blocking(move || {
            artifact.next_payload().map(|payload| payload.is_none())
        })
        .await;
        match flatten_join(drained) {
            Ok(true) => {}
            Ok(false) => {
                self.fail(
                    ResultFlags::NONE,
                    Error::new(ErrorKind::Validation, "empty-payload artifact carries a payload"),
                );
                return;
            }
            Err(err) => {
                self.fail(ResultFlags::NONE, err);
                return;
            }
        }

        let commit = self.ctx.device.commit_artifact_data(
            &self.data.artifact_name.clone(),
            &self.data.artifact_group.clone(),
            self.data.artifact_provides.clone().as_ref(),
            self.data.clears_artifact_provides.clone().as_ref(),
            |_| Ok(()),
        );
        match commit {
            Ok(()) => {
                self.outcome.update(
                    ResultFlags::DOWNLOADED | ResultFlags::INSTALLED | ResultFlags::COMMITTED,
                    None,
                );
            }
            Err(err) => {
                self.fail(ResultFlags::FAILED_IN_POST_COMMIT, err);
            }
        }
    }

    fn prepare_module(&mut self, header: &ArtifactHeader) -> bool {
        let provides = match self.ctx.device.load_provides() {
            Ok(provides) => provides,
            Err(err) => {
                self.fail(ResultFlags::NO_ROLLBACK_NECESSARY, err);
                return false;
            }
        };
        let device_type = match self.ctx.device.device_type() {
            Ok(device_type) => device_type,
            Err(err) => {
                self.fail(ResultFlags::NO_ROLLBACK_NECESSARY, err);
                return false;
            }
        };

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
        let tree = match WorkTree::prepare(self.ctx.config.module_work_dir(), &tree_context) {
            Ok(tree) => tree,
            Err(err) => {
                self.fail(ResultFlags::NO_ROLLBACK_NECESSARY, err);
                return false;
            }
        };

        let module = match ModuleRunner::new(
            &self.ctx.config.module_directory,
            header.payload_type(),
            tree.root(),
            self.ctx.module_timeout(),
        ) {
            Ok(module) => module,
            Err(err) => {
                self.fail(ResultFlags::NO_ROLLBACK_NECESSARY, err);
                return false;
            }
        };

        self.tree = Some(tree);
        self.module = Some(module);
        true
    }

    /// Re-attach module and tree from a persisted record (resume paths).
    async fn attach_module(&mut self) -> bool {
        let payload_type = match self.data.payload_types.first() {
            Some(payload_type) => payload_type.clone(),
            None => {
                self.fail(
                    ResultFlags::NONE,
                    Error::new(ErrorKind::DatabaseValue, "state record has no payload type"),
                );
                return false;
            }
        };

        let work_dir = self.ctx.config.module_work_dir();
        let tree = match WorkTree::open(&work_dir) {
            Ok(tree) => tree,
            Err(_) => {
                // Interrupted before the tree was built; reconstruct the
                // parts the failure path needs.
                let tree_context = TreeContext {
                    artifact_name: self.data.artifact_name.clone(),
                    artifact_group: self.data.artifact_group.clone(),
                    payload_type: payload_type.clone(),
                    ..Default::default()
                };
                match WorkTree::prepare(&work_dir, &tree_context) {
                    Ok(tree) => tree,
                    Err(err) => {
                        self.fail(ResultFlags::NONE, err);
                        return false;
                    }
                }
            }
        };

        match ModuleRunner::new(
            &self.ctx.config.module_directory,
            &payload_type,
            tree.root(),
            self.ctx.module_timeout(),
        ) {
            Ok(module) => {
                self.tree = Some(tree);
                self.module = Some(module);
                true
            }
            Err(err) => {
                self.fail(ResultFlags::NONE, err);
                false
            }
        }
    }

    async fn run_resume(&mut self) {
        let state = self.data.in_state.clone();
        info!(state = %state, "resuming standalone operation");
        match state.as_str() {
            STATE_DOWNLOAD => {
                // The payload stream is gone; the only way forward is out.
                self.fail(
                    ResultFlags::NO_ROLLBACK_NECESSARY,
                    Error::new(
                        ErrorKind::Validation,
                        "interrupted during download; aborting the update",
                    ),
                );
                if self.attach_module().await {
                    self.cleanup_after_failure().await;
                }
            }
            STATE_ARTIFACT_INSTALL | STATE_PENDING_COMMIT => {
                self.outcome
                    .update(ResultFlags::DOWNLOADED | ResultFlags::INSTALLED, None);
                if self.attach_module().await {
                    self.reboot_and_rollback_query().await;
                }
            }
            STATE_ARTIFACT_COMMIT => {
                if self.attach_module().await {
                    self.do_commit().await;
                }
            }
            STATE_ARTIFACT_ROLLBACK => {
                self.outcome.update(ResultFlags::FAILED, None);
                if self.attach_module().await {
                    self.rollback_and_finalize().await;
                }
            }
            STATE_ARTIFACT_FAILURE => {
                self.outcome.update(ResultFlags::FAILED, None);
                if self.attach_module().await {
                    self.artifact_failure_and_cleanup().await;
                }
            }
            STATE_CLEANUP => {
                if self.attach_module().await {
                    self.cleanup_state().await;
                }
            }
            other => {
                self.fail(
                    ResultFlags::NONE,
                    Error::new(
                        ErrorKind::DatabaseValue,
                        format!("unknown standalone state '{other}'"),
                    ),
                );
            }
        }
    }

    // -- states ------------------------------------------------------------

    async fn do_download(&mut self, artifact: Artifact<ArtifactReader>) -> Result<()> {
        self.ctx
            .scripts
            .run_scripts(ScriptState::Download, ScriptAction::Enter)
            .await?;

        let module = self.module.as_ref().expect("module prepared");
        let tree = self.tree.as_ref().expect("tree prepared").clone();
        let streams_mode = module.provide_payload_file_sizes(&self.cancel).await?;

        if streams_mode {
            // The module streams the files itself: publish sizes, then feed
            // the named pipes while the Download hook runs.
            let stage = tokio::task::spawn_blocking(move || stage_streamed(artifact, &tree));
            let hook = module.run_hook(Hook::Download, &self.cancel);
            let (staged, hooked) = tokio::join!(stage, hook);
            flatten_join(staged)?;
            hooked?;
        } else {
            let staged = tokio::task::spawn_blocking(move || stage_unpacked(artifact, &tree)).await;
            flatten_join(staged)?;
            module.run_hook(Hook::Download, &self.cancel).await?;
        }

        self.ctx
            .scripts
            .run_scripts(ScriptState::Download, ScriptAction::Leave)
            .await?;
        Ok(())
    }

    async fn run_module_state(&mut self, script_state: ScriptState, hook: Hook) -> Result<()> {
        self.ctx
            .scripts
            .run_scripts(script_state, ScriptAction::Enter)
            .await?;
        self.module
            .as_ref()
            .expect("module prepared")
            .run_hook(hook, &self.cancel)
            .await?;
        self.ctx
            .scripts
            .run_scripts(script_state, ScriptAction::Leave)
            .await?;
        Ok(())
    }

    async fn reboot_and_rollback_query(&mut self) {
        let queried = self
            .module
            .as_ref()
            .expect("module prepared")
            .needs_reboot(&self.cancel)
            .await;
        let reboot = match queried {
            Ok(reboot) => reboot,
            Err(err) => {
                error!(%err, "could not query for reboot");
                self.fail(ResultFlags::NONE, err);
                self.installation_failure_handler().await;
                return;
            }
        };
        self.data.update_info.reboot_requested = vec![reboot_action_to_db(reboot).to_string()];
        if reboot != RebootAction::No {
            self.outcome.update(ResultFlags::REBOOT_REQUIRED, None);
        }

        let queried = self
            .module
            .as_ref()
            .expect("module prepared")
            .supports_rollback(&self.cancel)
            .await;
        let rollback_support = match queried {
            Ok(support) => support,
            Err(err) => {
                error!(%err, "could not query for rollback support");
                self.fail(ResultFlags::NONE, err);
                self.installation_failure_handler().await;
                return;
            }
        };
        self.data.update_info.supports_rollback =
            rollback_support_to_db(rollback_support).to_string();

        if rollback_support {
            // Hold for an explicit commit or rollback.
            if let Err(err) = self.save_state(STATE_PENDING_COMMIT) {
                self.fail(ResultFlags::NONE, err);
                self.installation_failure_handler().await;
            }
            return;
        }

        info!("update module does not support rollback, committing immediately");
        self.outcome.update(ResultFlags::AUTO_COMMIT_WANTED, None);
        self.do_commit().await;
    }

    async fn do_commit(&mut self) {
        if let Err(err) = self.save_state(STATE_ARTIFACT_COMMIT) {
            self.fail(ResultFlags::NONE, err);
            self.installation_failure_handler().await;
            return;
        }
        if let Err(err) = self
            .run_module_state(ScriptState::ArtifactCommit, Hook::ArtifactCommit)
            .await
        {
            error!(%err, "commit failed");
            self.fail(ResultFlags::NONE, err);
            self.ctx
                .scripts
                .run_error_scripts(ScriptState::ArtifactCommit)
                .await;
            self.installation_failure_handler().await;
            return;
        }
        self.outcome.update(ResultFlags::COMMITTED, None);

        // Post-commit: cleanup and the provides rewrite.  Failures here no
        // longer undo the install.
        if let Err(err) = self.save_state(STATE_CLEANUP) {
            self.fail(ResultFlags::FAILED_IN_POST_COMMIT, err);
            return;
        }
        let module = self.module.as_ref().expect("module prepared");
        if let Err(err) = module.run_hook(Hook::Cleanup, &self.cancel).await {
            self.fail(
                ResultFlags::CLEANUP_FAILED | ResultFlags::FAILED_IN_POST_COMMIT,
                err,
            );
        }
        if let Some(ref tree) = self.tree {
            if let Err(err) = tree.delete() {
                self.fail(
                    ResultFlags::CLEANUP_FAILED | ResultFlags::FAILED_IN_POST_COMMIT,
                    err,
                );
            }
        }

        let commit = self.ctx.device.commit_artifact_data(
            &self.data.artifact_name.clone(),
            &self.data.artifact_group.clone(),
            self.data.artifact_provides.clone().as_ref(),
            self.data.clears_artifact_provides.clone().as_ref(),
            |txn| txn.remove(STANDALONE_STATE_KEY).map_err(Error::from),
        );
        match commit {
            Ok(()) => {
                self.data.failed = false;
                self.outcome.update(ResultFlags::CLEANED, None);
            }
            Err(err) => {
                self.fail(ResultFlags::FAILED_IN_POST_COMMIT, err.context("error while updating database"));
            }
        }
    }

    /// Explicit `rollback` command: unsupported rollback is a hard stop.
    async fn do_user_rollback(&mut self) {
        let module = self.module.as_ref().expect("module prepared");
        let support = if self.data.update_info.supports_rollback.is_empty() {
            module.supports_rollback(&self.cancel).await
        } else {
            rollback_support_from_db(&self.data.update_info.supports_rollback)
        };
        match support {
            Ok(true) => {
                self.outcome.update(ResultFlags::FAILED, None);
                self.rollback_and_finalize().await;
            }
            Ok(false) => {
                self.fail(
                    ResultFlags::NO_ROLLBACK,
                    Error::new(
                        ErrorKind::Validation,
                        "update module does not support rollback",
                    ),
                );
            }
            Err(err) => {
                self.fail(ResultFlags::NO_ROLLBACK | ResultFlags::ROLLBACK_FAILED, err);
            }
        }
    }

    /// Shared failure path out of install/commit: roll back when possible,
    /// then `ArtifactFailure`, `Cleanup`, and the database exit.
    async fn installation_failure_handler(&mut self) {
        let module = self.module.as_ref().expect("module prepared");
        let support = match module.supports_rollback(&self.cancel).await {
            Ok(support) => support,
            Err(err) => {
                self.fail(ResultFlags::NO_ROLLBACK | ResultFlags::ROLLBACK_FAILED, err);
                self.artifact_failure_and_cleanup().await;
                return;
            }
        };
        self.data.update_info.supports_rollback = rollback_support_to_db(support).to_string();

        if support {
            self.rollback_and_finalize().await;
        } else {
            self.outcome.update(ResultFlags::NO_ROLLBACK, None);
            self.artifact_failure_and_cleanup().await;
        }
    }

    async fn rollback_and_finalize(&mut self) {
        if let Err(err) = self.save_state(STATE_ARTIFACT_ROLLBACK) {
            self.fail(ResultFlags::ROLLBACK_FAILED, err);
            self.artifact_failure_and_cleanup().await;
            return;
        }
        match self
            .run_module_state(ScriptState::ArtifactRollback, Hook::ArtifactRollback)
            .await
        {
            Ok(()) => {
                self.outcome.update(ResultFlags::ROLLED_BACK, None);
            }
            Err(err) => {
                self.data.update_info.all_rollbacks_successful = false;
                self.fail(ResultFlags::ROLLBACK_FAILED, err);
                self.ctx
                    .scripts
                    .run_error_scripts(ScriptState::ArtifactRollback)
                    .await;
            }
        }
        self.artifact_failure_and_cleanup().await;
    }

    async fn artifact_failure_and_cleanup(&mut self) {
        if let Err(err) = self.save_state(STATE_ARTIFACT_FAILURE) {
            self.fail(ResultFlags::ROLLBACK_FAILED, err);
            self.cleanup_state().await;
            return;
        }
        if let Err(err) = self
            .run_module_state(ScriptState::ArtifactFailure, Hook::ArtifactFailure)
            .await
        {
            self.data.update_info.all_rollbacks_successful = false;
            self.fail(ResultFlags::ROLLBACK_FAILED, err);
            self.ctx
                .scripts
                .run_error_scripts(ScriptState::ArtifactFailure)
                .await;
        }
        self.cleanup_state().await;
    }

    async fn cleanup_after_failure(&mut self) {
        // Failure before anything was installed: nothing to roll back.
        self.outcome.update(ResultFlags::NO_ROLLBACK_NECESSARY, None);
        self.cleanup_state().await;
    }

    async fn cleanup_state(&mut self) {
        if let Err(err) = self.save_state(STATE_CLEANUP) {
            self.fail(ResultFlags::ROLLBACK_FAILED, err);
            return;
        }

        if let Some(module) = self.module.as_ref() {
            if let Err(err) = module.run_hook(Hook::Cleanup, &self.cancel).await {
                self.fail(ResultFlags::CLEANUP_FAILED, err);
                self.data.failed = true;
            }
        }
        if let Some(ref tree) = self.tree {
            if let Err(err) = tree.delete() {
                self.fail(ResultFlags::CLEANUP_FAILED, err);
            }
        }

        let finalized = if self.data.rolled_back {
            // Successful rollback: the device state never changed.
            self.ctx
                .store
                .remove(STANDALONE_STATE_KEY)
                .map_err(Error::from)
        } else {
            if self.data.failed {
                // Unsuccessful rollback or missing rollback support: poison
                // the artifact name so depends checks reject this state.
                self.data.artifact_name.push_str(BROKEN_ARTIFACT_SUFFIX);
                if let Some(ref mut provides) = self.data.artifact_provides {
                    provides.insert("artifact_name".to_string(), self.data.artifact_name.clone());
                }
            }
            self.ctx.device.commit_artifact_data(
                &self.data.artifact_name.clone(),
                &self.data.artifact_group.clone(),
                self.data.artifact_provides.clone().as_ref(),
                self.data.clears_artifact_provides.clone().as_ref(),
                |txn| txn.remove(STANDALONE_STATE_KEY).map_err(Error::from),
            )
        };
        match finalized {
            Ok(()) => {
                self.data.failed = false;
                self.outcome.update(ResultFlags::CLEANED, None);
            }
            Err(err) => {
                self.fail(
                    ResultFlags::ROLLBACK_FAILED,
                    err.context("error while updating database"),
                );
            }
        }
    }
}

fn reboot_action_to_db(action: RebootAction) -> &'static str {
    match action {
        RebootAction::No => REBOOT_TYPE_NONE,
        RebootAction::Automatic => REBOOT_TYPE_AUTOMATIC,
        RebootAction::Yes => REBOOT_TYPE_CUSTOM,
    }
}

// ---------------------------------------------------------------------------
// Payload staging
// ---------------------------------------------------------------------------

type ArtifactReader = Box<dyn Read + Send>;

async fn open_artifact_reader(
    ctx: &EngineContext,
    src: &str,
    cancel: &CancellationToken,
) -> Result<ArtifactReader> {
    if src.starts_with("http://") || src.starts_with("https://") {
        let client = ResumingClient::new(ctx.http.clone());
        let (_, reader) = client.download(src, cancel).await?;
        let bridge = SyncIoBridge::new_with_handle(reader, tokio::runtime::Handle::current());
        Ok(Box::new(bridge))
    } else {
        let file = std::fs::File::open(src)
            .map_err(|err| Error::from(err).context(format!("cannot open '{src}'")))?;
        Ok(Box::new(file))
    }
}

/// Unpack every payload file into the tree's `files/` directory.
pub(crate) fn stage_unpacked(mut artifact: Artifact<ArtifactReader>, tree: &WorkTree) -> Result<()> {
    let Some(mut payload) = artifact.next_payload()? else {
        return Err(Error::new(ErrorKind::Parse, "artifact carries no payload"));
    };
    while let Some(mut file) = payload.next_file()? {
        let name = file.name.clone();
        tree.stage_file(&name, &mut file)?;
    }
    drop(payload);
    // A second payload is rejected by the parser; this drives that check.
    artifact.next_payload()?;
    Ok(())
}

/// Publish size sidecars and feed each file through a named pipe for a
/// module that streams payload files itself.
pub(crate) fn stage_streamed(
    mut artifact: Artifact<ArtifactReader>,
    tree: &WorkTree,
) -> Result<()> {
    let Some(mut payload) = artifact.next_payload()? else {
        return Err(Error::new(ErrorKind::Parse, "artifact carries no payload"));
    };
    while let Some(mut file) = payload.next_file()? {
        let name = file.name.clone();
        tree.write_size_sidecar(&name, file.size)?;
        let fifo = tree.create_stream_fifo(&name)?;
        // Opening the write end blocks until the module opens the read end.
        let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo)?;
        std::io::copy(&mut file, &mut writer)?;
    }
    drop(payload);
    artifact.next_payload()?;
    Ok(())
}

fn flatten_join<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(Error::new(
            ErrorKind::Programming,
            format!("blocking stage panicked: {err}"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Bootstrap artifact
// ---------------------------------------------------------------------------

/// Install the bootstrap artifact on first boot.
///
/// Runs only when the device has no provides yet; the file is deleted
/// afterwards whether the install succeeded or not.
pub async fn install_bootstrap_artifact(
    ctx: &EngineContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = ctx.config.bootstrap_artifact_path();

    let has_provides = !ctx.device.load_provides()?.is_empty();
    if has_provides {
        remove_bootstrap(&path);
        return Ok(());
    }
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no bootstrap artifact found");
        return Ok(());
    }

    info!("installing the bootstrap artifact");
    let outcome = install(ctx, &path.display().to_string(), cancel).await;
    remove_bootstrap(&path);
    match outcome.error {
        None => Ok(()),
        Some(err) => Err(err.context("failed to install the bootstrap artifact")),
    }
}

fn remove_bootstrap(path: &std::path::Path) {
    if path.exists() {
        if let Err(err) = std::fs::remove_file(path) {
            error!(%err, "failed to delete the bootstrap artifact");
        }
    }
}
