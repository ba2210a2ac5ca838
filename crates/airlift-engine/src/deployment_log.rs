// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-deployment log files.
//!
//! Every deployment writes line-delimited JSON records to
//! `deployments.NNNN.<id>.log` under the update log directory; `0000` is the
//! active deployment, older files shift up and fall off after the second.
//! The daemon pushes these files to the server on failure, which is why the
//! record format matches what the log-push sanitizer expects.

use airlift_error::{Error, ErrorKind, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::error;

const KEEP_LOGS: usize = 2;

/// Open log sink for one deployment.
pub struct DeploymentLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl DeploymentLog {
    /// Start logging for `deployment_id`, rotating older deployment logs.
    ///
    /// Re-opening the log of the deployment already at slot `0000` (crash
    /// recovery) appends instead of rotating.
    pub fn begin(dir: &Path, deployment_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let active = dir.join(format!("deployments.0000.{deployment_id}.log"));
        if !active.exists() {
            rotate(dir)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active)?;
        Ok(Self {
            path: active,
            file: Mutex::new(file),
        })
    }

    /// Path of the active log file (handed to the log-push endpoint).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; failures are logged, never fatal.
    pub fn record(&self, level: &str, message: &str) {
        let entry = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            "level": level,
            "message": message,
        });
        let mut file = self.file.lock().expect("deployment log lock poisoned");
        if let Err(err) = writeln!(file, "{entry}") {
            error!(%err, "could not write deployment log record");
        }
    }
}

/// Shift `deployments.NNNN.*` up by one, dropping everything past the cap.
fn rotate(dir: &Path) -> Result<()> {
    let mut logs: Vec<(usize, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(index) = parse_log_index(name) else {
            continue;
        };
        logs.push((index, entry.path()));
    }
    // Highest first so renames never collide.
    logs.sort_by(|a, b| b.0.cmp(&a.0));

    for (index, path) in logs {
        if index + 1 >= KEEP_LOGS {
            std::fs::remove_file(&path)?;
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::new(ErrorKind::Programming, "log path without a name"))?;
        let rest = &name["deployments.0000".len()..];
        let renamed = dir.join(format!("deployments.{:04}{rest}", index + 1));
        std::fs::rename(&path, renamed)?;
    }
    Ok(())
}

fn parse_log_index(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("deployments.")?;
    if !name.ends_with(".log") {
        return None;
    }
    let (index, _) = rest.split_once('.')?;
    if index.len() != 4 {
        return None;
    }
    index.parse().ok()
}
