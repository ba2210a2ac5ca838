// SPDX-License-Identifier: MIT OR Apache-2.0
//! State-script execution.
//!
//! Artifacts (and the device image itself) can ship hook scripts that run at
//! state-machine boundaries.  Scripts are discovered by a strict filename
//! grammar, run in lexicographic order, and get a retry protocol: exit code
//! 21 means "try me again later", bounded by a per-script retry budget.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use airlift_error::{Error, ErrorKind, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Exit code a script uses to request a later retry.
pub const RETRY_LATER_EXIT_CODE: i32 = 21;

/// Script format version this client understands.
pub const SUPPORTED_SCRIPT_VERSION: &str = "3";

static SCRIPT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(Download|ArtifactInstall|ArtifactReboot|ArtifactCommit|ArtifactRollback|ArtifactFailure)_(Enter|Leave|Error)_[0-9]{2}_[A-Za-z0-9_.-]+$",
    )
    .expect("script name regex")
});

// ---------------------------------------------------------------------------
// States and actions
// ---------------------------------------------------------------------------

/// State-machine boundary a script attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    /// Payload download.
    Download,
    /// `ArtifactInstall` hook.
    ArtifactInstall,
    /// `ArtifactReboot` hook.
    ArtifactReboot,
    /// `ArtifactCommit` hook.
    ArtifactCommit,
    /// `ArtifactRollback` hook.
    ArtifactRollback,
    /// `ArtifactFailure` hook.
    ArtifactFailure,
}

impl ScriptState {
    /// Filename prefix of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "Download",
            Self::ArtifactInstall => "ArtifactInstall",
            Self::ArtifactReboot => "ArtifactReboot",
            Self::ArtifactCommit => "ArtifactCommit",
            Self::ArtifactRollback => "ArtifactRollback",
            Self::ArtifactFailure => "ArtifactFailure",
        }
    }

    /// Download scripts ship with the device image, artifact scripts with
    /// the artifact.
    fn is_artifact_scoped(&self) -> bool {
        !matches!(self, Self::Download)
    }
}

/// When the script runs relative to its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    /// Before the state's work.
    Enter,
    /// After the state's work succeeded.
    Leave,
    /// After the state's work failed (best effort).
    Error,
}

impl ScriptAction {
    /// Filename component of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "Enter",
            Self::Leave => "Leave",
            Self::Error => "Error",
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Timing policy for script execution.
#[derive(Debug, Clone)]
pub struct ScriptTimings {
    /// Wall-clock timeout per script invocation.
    pub timeout: Duration,
    /// Wait between retries of a script that exited with code 21.
    pub retry_interval: Duration,
    /// Total budget for one script including its own run time.
    pub retry_timeout: Duration,
}

impl Default for ScriptTimings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            retry_interval: Duration::from_secs(60),
            retry_timeout: Duration::from_secs(1800),
        }
    }
}

/// Runs the state scripts found in the configured directories.
pub struct ScriptRunner {
    artifact_scripts_dir: PathBuf,
    rootfs_scripts_dir: PathBuf,
    timings: ScriptTimings,
}

impl ScriptRunner {
    /// Create a runner over the artifact and rootfs script directories.
    pub fn new(
        artifact_scripts_dir: impl Into<PathBuf>,
        rootfs_scripts_dir: impl Into<PathBuf>,
        timings: ScriptTimings,
    ) -> Self {
        Self {
            artifact_scripts_dir: artifact_scripts_dir.into(),
            rootfs_scripts_dir: rootfs_scripts_dir.into(),
            timings,
        }
    }

    /// Run every matching script for `state`/`action`, in filename order.
    pub async fn run_scripts(&self, state: ScriptState, action: ScriptAction) -> Result<()> {
        let dir = if state.is_artifact_scoped() {
            &self.artifact_scripts_dir
        } else {
            &self.rootfs_scripts_dir
        };
        check_version_file(dir)?;

        for script in discover(dir, state, action)? {
            self.run_one(&script).await?;
        }
        Ok(())
    }

    /// Run the `_Error_` scripts for `state`, best effort.
    ///
    /// Failures are logged and swallowed so they never mask the error that
    /// triggered them.
    pub async fn run_error_scripts(&self, state: ScriptState) {
        if let Err(err) = self.run_scripts(state, ScriptAction::Error).await {
            error!(state = state.as_str(), %err, "error script failed");
        }
    }

    async fn run_one(&self, script: &Path) -> Result<()> {
        let name = script
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<script>")
            .to_string();
        let budget_start = Instant::now();

        loop {
            info!(script = %name, "running state script");
            let status = run_process(script, self.timings.timeout).await?;

            match status {
                0 => return Ok(()),
                RETRY_LATER_EXIT_CODE => {
                    let spent = budget_start.elapsed() + self.timings.retry_interval;
                    if spent >= self.timings.retry_timeout {
                        return Err(Error::new(
                            ErrorKind::Cancelled,
                            format!("retry budget exhausted for state script '{name}'"),
                        ));
                    }
                    info!(script = %name, "script requested retry");
                    tokio::time::sleep(self.timings.retry_interval).await;
                }
                code => {
                    return Err(Error::new(
                        ErrorKind::Io,
                        format!("state script '{name}' exited with code {code}"),
                    ));
                }
            }
        }
    }
}

fn check_version_file(dir: &Path) -> Result<()> {
    match std::fs::read_to_string(dir.join("version")) {
        Ok(content) => {
            if content.trim() == SUPPORTED_SCRIPT_VERSION {
                Ok(())
            } else {
                Err(Error::new(
                    ErrorKind::Validation,
                    format!(
                        "unsupported state script version '{}' in {}",
                        content.trim(),
                        dir.display()
                    ),
                ))
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::from(err)),
    }
}

fn discover(dir: &Path, state: ScriptState, action: ScriptAction) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::from(err)),
    };

    let prefix = format!("{}_{}_", state.as_str(), action.as_str());
    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !SCRIPT_NAME.is_match(&name) {
            continue;
        }
        if name.starts_with(&prefix) {
            scripts.push(entry.path());
        }
    }
    // Lexicographic on the full filename, so `..._01_...` precedes `..._02_...`.
    scripts.sort();
    Ok(scripts)
}

async fn run_process(script: &Path, timeout: Duration) -> Result<i32> {
    let mut command = std::process::Command::new(script);
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = tokio::process::Command::from(command)
        .spawn()
        .map_err(|err| {
            Error::new(
                ErrorKind::Io,
                format!("cannot execute state script '{}'", script.display()),
            )
            .with_source(err)
        })?;
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        let script_name = script.display().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(script = %script_name, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let script_name = script.display().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(script = %script_name, "{line}");
            }
        });
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(Error::from)?;
            Ok(status.code().unwrap_or(-1))
        }
        Err(_) => {
            terminate_group(pid, &mut child).await;
            Err(Error::new(
                ErrorKind::Io,
                format!("state script '{}' timed out", script.display()),
            ))
        }
    }
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

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        write!(file, "{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn runner(dir: &Path, timings: ScriptTimings) -> ScriptRunner {
        ScriptRunner::new(dir, dir, timings)
    }

    fn fast_timings() -> ScriptTimings {
        ScriptTimings {
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(20),
            retry_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn runs_scripts_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("order");
        write_script(
            dir.path(),
            "ArtifactInstall_Enter_02_second",
            &format!("echo two >> {}\n", marker.display()),
        );
        write_script(
            dir.path(),
            "ArtifactInstall_Enter_01_first",
            &format!("echo one >> {}\n", marker.display()),
        );

        runner(dir.path(), fast_timings())
            .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Enter)
            .await
            .unwrap();

        let order = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(order, "one\ntwo\n");
    }

    #[tokio::test]
    async fn ignores_non_matching_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        write_script(
            dir.path(),
            "ArtifactInstall_Enter_1_badnum", // needs two digits
            &format!("echo no >> {}\n", marker.display()),
        );
        write_script(
            dir.path(),
            "readme.txt",
            &format!("echo no >> {}\n", marker.display()),
        );

        runner(dir.path(), fast_timings())
            .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Enter)
            .await
            .unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn missing_directory_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        ScriptRunner::new(&gone, &gone, fast_timings())
            .run_scripts(ScriptState::Download, ScriptAction::Enter)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn version_file_with_3_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "3\n").unwrap();
        runner(dir.path(), fast_timings())
            .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Enter)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bad_version_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "foobar").unwrap();
        let err = runner(dir.path(), fast_timings())
            .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Enter)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "ArtifactCommit_Enter_01_fail", "exit 7\n");
        let err = runner(dir.path(), fast_timings())
            .run_scripts(ScriptState::ArtifactCommit, ScriptAction::Enter)
            .await
            .unwrap_err();
        assert!(err.message().contains("exited with code 7"));
    }

    #[tokio::test]
    async fn exit_21_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        // Fails with 21 until the third attempt.
        write_script(
            dir.path(),
            "ArtifactInstall_Enter_01_retry",
            &format!(
                "n=$(cat {c} 2>/dev/null || echo 0)\n\
                 n=$((n+1))\n\
                 echo $n > {c}\n\
                 [ $n -ge 3 ] && exit 0\n\
                 exit 21\n",
                c = counter.display()
            ),
        );

        runner(dir.path(), fast_timings())
            .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Enter)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "3");
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "ArtifactInstall_Enter_01_forever", "exit 21\n");
        let timings = ScriptTimings {
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(30),
            retry_timeout: Duration::from_millis(100),
        };
        let err = runner(dir.path(), timings)
            .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Enter)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn timeout_kills_the_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "ArtifactReboot_Enter_01_hang", "sleep 30\n");
        let timings = ScriptTimings {
            timeout: Duration::from_millis(100),
            ..fast_timings()
        };
        let err = runner(dir.path(), timings)
            .run_scripts(ScriptState::ArtifactReboot, ScriptAction::Enter)
            .await
            .unwrap_err();
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn error_scripts_never_fail_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "ArtifactFailure_Error_01_broken", "exit 1\n");
        runner(dir.path(), fast_timings())
            .run_error_scripts(ScriptState::ArtifactFailure)
            .await;
    }

    #[tokio::test]
    async fn download_scripts_come_from_the_rootfs_dir() {
        let artifact_dir = tempfile::tempdir().unwrap();
        let rootfs_dir = tempfile::tempdir().unwrap();
        let marker = rootfs_dir.path().join("ran");
        write_script(
            rootfs_dir.path(),
            "Download_Enter_01_probe",
            &format!("echo yes >> {}\n", marker.display()),
        );
        // A Download script in the artifact dir must not run.
        write_script(
            artifact_dir.path(),
            "Download_Enter_01_probe",
            &format!("echo no >> {}\n", marker.display()),
        );

        ScriptRunner::new(artifact_dir.path(), rootfs_dir.path(), fast_timings())
            .run_scripts(ScriptState::Download, ScriptAction::Enter)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "yes\n");
    }
}
