// SPDX-License-Identifier: MIT OR Apache-2.0
//! Update-module execution.
//!
//! An update module is an external executable implementing the payload
//! semantics behind a fixed hook CLI: the core invokes
//! `<modules-dir>/<payload-type> <hook>` with the per-deployment scratch
//! tree as working directory.  Value-returning hooks answer with exactly one
//! token on stdout; everything else communicates through the exit status.
//! Stderr is forwarded to the deployment log.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod tree;

pub use tree::{TreeContext, WorkTree};

use airlift_error::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Operational hooks every update module must accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Query: does the module stream payload files itself?
    ProvidePayloadFileSizes,
    /// Receive the payload.
    Download,
    /// Query: can a failed install be rolled back?
    SupportsRollback,
    /// Apply the payload.
    ArtifactInstall,
    /// Query: does the install require a reboot, and who performs it?
    NeedsArtifactReboot,
    /// Perform a module-driven reboot.
    ArtifactReboot,
    /// Confirm the reboot brought the new artifact up.
    ArtifactVerifyReboot,
    /// Make the install permanent.
    ArtifactCommit,
    /// Undo the install.
    ArtifactRollback,
    /// Reboot as part of a rollback.
    ArtifactRollbackReboot,
    /// Confirm the rollback reboot.
    ArtifactVerifyRollbackReboot,
    /// Last-resort cleanup after failure.
    ArtifactFailure,
    /// Release per-deployment resources.
    Cleanup,
}

impl Hook {
    /// The positional argument handed to the module.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProvidePayloadFileSizes => "ProvidePayloadFileSizes",
            Self::Download => "Download",
            Self::SupportsRollback => "SupportsRollback",
            Self::ArtifactInstall => "ArtifactInstall",
            Self::NeedsArtifactReboot => "NeedsArtifactReboot",
            Self::ArtifactReboot => "ArtifactReboot",
            Self::ArtifactVerifyReboot => "ArtifactVerifyReboot",
            Self::ArtifactCommit => "ArtifactCommit",
            Self::ArtifactRollback => "ArtifactRollback",
            Self::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            Self::ArtifactVerifyRollbackReboot => "ArtifactVerifyRollbackReboot",
            Self::ArtifactFailure => "ArtifactFailure",
            Self::Cleanup => "Cleanup",
        }
    }
}

/// Answer to [`Hook::NeedsArtifactReboot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebootAction {
    /// No reboot needed.
    #[default]
    No,
    /// The core reboots the device; `ArtifactReboot` is not invoked.
    Automatic,
    /// The module reboots through its `ArtifactReboot` hook.
    Yes,
}

/// Sink for module stderr lines, wired to the deployment log by the engine.
pub type StderrSink = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Launches one update module against one scratch tree.
pub struct ModuleRunner {
    module_path: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
    stderr_sink: Option<StderrSink>,
}

impl ModuleRunner {
    /// Create a runner for `<modules_dir>/<payload_type>` over `work_dir`.
    ///
    /// Fails with [`ErrorKind::Validation`] when no module of that name is
    /// installed.
    pub fn new(
        modules_dir: &Path,
        payload_type: &str,
        work_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self> {
        let module_path = modules_dir.join(payload_type);
        if !module_path.is_file() {
            return Err(Error::new(
                ErrorKind::Validation,
                format!("no update module for payload type '{payload_type}'"),
            ));
        }
        Ok(Self {
            module_path,
            work_dir: work_dir.into(),
            timeout,
            stderr_sink: None,
        })
    }

    /// Forward module stderr lines to `sink` in addition to the process log.
    pub fn set_stderr_sink(&mut self, sink: StderrSink) {
        self.stderr_sink = Some(sink);
    }

    /// Invoke a non-query hook; non-zero exit is a failure.
    pub async fn run_hook(&self, hook: Hook, cancel: &CancellationToken) -> Result<()> {
        let output = self.invoke(hook, cancel).await?;
        if !output.is_empty() {
            debug!(hook = hook.as_str(), "unexpected module stdout ignored");
        }
        Ok(())
    }

    /// `SupportsRollback` query.
    pub async fn supports_rollback(&self, cancel: &CancellationToken) -> Result<bool> {
        match self.query_token(Hook::SupportsRollback, cancel).await?.as_deref() {
            None | Some("No") => Ok(false),
            Some("Yes") => Ok(true),
            Some(other) => Err(bad_token(Hook::SupportsRollback, other)),
        }
    }

    /// `NeedsArtifactReboot` query.
    pub async fn needs_reboot(&self, cancel: &CancellationToken) -> Result<RebootAction> {
        match self.query_token(Hook::NeedsArtifactReboot, cancel).await?.as_deref() {
            None | Some("No") => Ok(RebootAction::No),
            Some("Yes") => Ok(RebootAction::Yes),
            Some("Automatic") => Ok(RebootAction::Automatic),
            Some(other) => Err(bad_token(Hook::NeedsArtifactReboot, other)),
        }
    }

    /// `ProvidePayloadFileSizes` query.
    pub async fn provide_payload_file_sizes(&self, cancel: &CancellationToken) -> Result<bool> {
        match self
            .query_token(Hook::ProvidePayloadFileSizes, cancel)
            .await?
            .as_deref()
        {
            None | Some("No") => Ok(false),
            Some("Yes") => Ok(true),
            Some(other) => Err(bad_token(Hook::ProvidePayloadFileSizes, other)),
        }
    }

    async fn query_token(
        &self,
        hook: Hook,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let lines = self.invoke(hook, cancel).await?;
        let mut tokens = lines.iter().filter(|l| !l.trim().is_empty());
        let first = tokens.next().map(|l| l.trim().to_string());
        if tokens.next().is_some() {
            return Err(Error::new(
                ErrorKind::Validation,
                format!(
                    "update module printed more than one line for {}",
                    hook.as_str()
                ),
            ));
        }
        Ok(first)
    }

    /// Run the module with the hook argument, capturing stdout line-wise.
    async fn invoke(&self, hook: Hook, cancel: &CancellationToken) -> Result<Vec<String>> {
        if cancel.is_cancelled() {
            return Err(Error::new(ErrorKind::Cancelled, "hook skipped after cancel"));
        }

        let mut command = std::process::Command::new(&self.module_path);
        command
            .arg(hook.as_str())
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = tokio::process::Command::from(command).spawn().map_err(|err| {
            Error::new(
                ErrorKind::Io,
                format!("cannot execute update module '{}'", self.module_path.display()),
            )
            .with_source(err)
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Programming, "module stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Programming, "module stderr unavailable"))?;

        let sink = self.stderr_sink.clone();
        let module = self.module_path.display().to_string();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "update_module.stderr", module = %module, "{line}");
                if let Some(ref sink) = sink {
                    sink(&line);
                }
            }
        });

        let collect_stdout = async {
            let mut collected = Vec::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.map_err(Error::from)? {
                collected.push(line);
            }
            Ok::<_, Error>(collected)
        };

        // The timeout covers the whole hook, including a module that hangs
        // while holding its stdout open.
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                terminate_group(pid, &mut child).await;
                let _ = stderr_task.await;
                return Err(Error::new(
                    ErrorKind::Cancelled,
                    format!("{} hook cancelled", hook.as_str()),
                ));
            }
            outcome = tokio::time::timeout(self.timeout, async {
                let lines = collect_stdout.await?;
                let status = child.wait().await.map_err(Error::from)?;
                Ok::<_, Error>((lines, status))
            }) => outcome.unwrap_or_else(|_| {
                Err(Error::new(
                    ErrorKind::Io,
                    format!("{} hook timed out", hook.as_str()),
                ))
            }),
        };

        let (lines, status) = match outcome {
            Ok(pair) => pair,
            Err(err) => {
                terminate_group(pid, &mut child).await;
                let _ = stderr_task.await;
                return Err(err);
            }
        };
        let _ = stderr_task.await;

        if !status.success() {
            return Err(Error::new(
                ErrorKind::Io,
                format!(
                    "update module {} hook exited with {}",
                    hook.as_str(),
                    status.code().map_or_else(|| "signal".to_string(), |c| c.to_string())
                ),
            ));
        }
        Ok(lines)
    }
}

fn bad_token(hook: Hook, token: &str) -> Error {
    Error::new(
        ErrorKind::Validation,
        format!("unexpected {} response '{token}'", hook.as_str()),
    )
}

/// SIGTERM the whole process group, give it a grace period, then SIGKILL.
async fn terminate_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    const GRACE: Duration = Duration::from_secs(10);

    #[cfg(unix)]
    if let Some(pid) = pid {
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGTERM);
        if tokio::time::timeout(GRACE, child.wait()).await.is_ok() {
            return;
        }
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
        let _ = child.wait().await;
        return;
    }

    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    fn install_module(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        write!(file, "{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn runner(modules_dir: &Path, work_dir: &Path) -> ModuleRunner {
        ModuleRunner::new(
            modules_dir,
            "test-module",
            work_dir,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn missing_module_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = match ModuleRunner::new(dir.path(), "ghost", dir.path(), Duration::from_secs(1))
        {
            Err(err) => err,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn hook_receives_name_and_cwd() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(
            modules.path(),
            "test-module",
            "echo \"$1\" > hook-invoked\npwd > cwd\n",
        );
        let cancel = CancellationToken::new();
        runner(modules.path(), work.path())
            .run_hook(Hook::ArtifactInstall, &cancel)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(work.path().join("hook-invoked"))
                .unwrap()
                .trim(),
            "ArtifactInstall"
        );
        let cwd = std::fs::read_to_string(work.path().join("cwd")).unwrap();
        assert_eq!(
            std::fs::canonicalize(cwd.trim()).unwrap(),
            std::fs::canonicalize(work.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(modules.path(), "test-module", "exit 3\n");
        let cancel = CancellationToken::new();
        let err = runner(modules.path(), work.path())
            .run_hook(Hook::ArtifactCommit, &cancel)
            .await
            .unwrap_err();
        assert!(err.message().contains("exited with 3"));
    }

    #[tokio::test]
    async fn rollback_query_parses_tokens() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(
            modules.path(),
            "test-module",
            "case \"$1\" in SupportsRollback) echo Yes;; esac\n",
        );
        let cancel = CancellationToken::new();
        let r = runner(modules.path(), work.path());
        assert!(r.supports_rollback(&cancel).await.unwrap());
        // Other hooks print nothing; queries default to No.
        assert_eq!(r.needs_reboot(&cancel).await.unwrap(), RebootAction::No);
        assert!(!r.provide_payload_file_sizes(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn automatic_reboot_token() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(
            modules.path(),
            "test-module",
            "[ \"$1\" = NeedsArtifactReboot ] && echo Automatic\nexit 0\n",
        );
        let cancel = CancellationToken::new();
        assert_eq!(
            runner(modules.path(), work.path())
                .needs_reboot(&cancel)
                .await
                .unwrap(),
            RebootAction::Automatic
        );
    }

    #[tokio::test]
    async fn garbage_token_is_validation_error() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(modules.path(), "test-module", "echo Maybe\n");
        let cancel = CancellationToken::new();
        let err = runner(modules.path(), work.path())
            .supports_rollback(&cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn multiple_stdout_lines_rejected_for_queries() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(modules.path(), "test-module", "echo Yes\necho No\n");
        let cancel = CancellationToken::new();
        let err = runner(modules.path(), work.path())
            .supports_rollback(&cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn stderr_reaches_the_sink() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(modules.path(), "test-module", "echo oops >&2\n");
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = collected.clone();
        let mut r = runner(modules.path(), work.path());
        r.set_stderr_sink(Arc::new(move |line: &str| {
            sink_lines.lock().unwrap().push(line.to_string());
        }));
        let cancel = CancellationToken::new();
        r.run_hook(Hook::Cleanup, &cancel).await.unwrap();
        assert_eq!(collected.lock().unwrap().as_slice(), ["oops"]);
    }

    #[tokio::test]
    async fn timeout_terminates_the_module() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(modules.path(), "test-module", "sleep 30\n");
        let r = ModuleRunner::new(
            modules.path(),
            "test-module",
            work.path(),
            Duration::from_millis(100),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let err = r.run_hook(Hook::ArtifactInstall, &cancel).await.unwrap_err();
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_hook() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(modules.path(), "test-module", "sleep 30\n");
        let r = runner(modules.path(), work.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = r.run_hook(Hook::ArtifactReboot, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn already_cancelled_token_short_circuits() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        install_module(modules.path(), "test-module", "echo ran > marker\n");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner(modules.path(), work.path())
            .run_hook(Hook::Download, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!work.path().join("marker").exists());
    }
}
