// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the airlift client.
//!
//! Configuration comes from a JSON file (`--config`), optionally merged over
//! a fallback file (`--fallback-config`): every field present in the main
//! file wins, absent fields fall through to the fallback, and anything still
//! unset gets a built-in default.  Unknown keys are ignored with a warning so
//! that configs written for newer clients keep working.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("cannot read config file {path}: {reason}")]
    Unreadable {
        /// Path that was requested.
        path: String,
        /// Underlying I/O failure.
        reason: String,
    },

    /// The file could not be parsed as a JSON object.
    #[error("failed to parse config {path}: {reason}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed.
    #[error("config validation failed: {reason}")]
    Validation {
        /// Description of the failed constraint.
        reason: String,
    },

    /// Conflicting proxy environment variables.
    #[error("conflicting proxy environment: {reason}")]
    ProxyEnv {
        /// Description of the conflict.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Config file schema
// ---------------------------------------------------------------------------

/// Raw on-disk configuration.  All fields are optional so that a main file
/// and a fallback file can be merged field-by-field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfigFile {
    /// Base URL of the deployment service.
    #[serde(rename = "ServerURL", skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    /// Paths to public keys accepted for artifact signature verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_verify_keys: Option<Vec<PathBuf>>,

    /// Seconds between update checks in daemon mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_poll_interval_seconds: Option<u64>,

    /// Seconds between inventory submissions in daemon mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_poll_interval_seconds: Option<u64>,

    /// Seconds between status-report retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_poll_interval_seconds: Option<u64>,

    /// Maximum number of status-report retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_poll_count: Option<u64>,

    /// File holding `device_type=<type>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type_file: Option<PathBuf>,

    /// Directory for update modules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_directory: Option<PathBuf>,

    /// Directory for rootfs-installed state scripts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs_scripts_path: Option<PathBuf>,

    /// Per-script wall-clock timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_script_timeout_seconds: Option<u64>,

    /// Total retry budget for a retrying state script, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_script_retry_timeout_seconds: Option<u64>,

    /// Interval between state-script retries, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_script_retry_interval_seconds: Option<u64>,

    /// Per-hook timeout for update modules, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_timeout_seconds: Option<u64>,

    /// Cap on deployment state-record writes before a loop is assumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_loop_cap: Option<u64>,
}

const KNOWN_KEYS: &[&str] = &[
    "ServerURL",
    "ArtifactVerifyKeys",
    "UpdatePollIntervalSeconds",
    "InventoryPollIntervalSeconds",
    "RetryPollIntervalSeconds",
    "RetryPollCount",
    "DeviceTypeFile",
    "ModuleDirectory",
    "RootfsScriptsPath",
    "StateScriptTimeoutSeconds",
    "StateScriptRetryTimeoutSeconds",
    "StateScriptRetryIntervalSeconds",
    "ModuleTimeoutSeconds",
    "StateLoopCap",
];

impl ConfigFile {
    /// Parse a JSON string, warning about (and dropping) unknown keys.
    pub fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(content).map_err(|err| ConfigError::Parse {
            path: origin.to_string(),
            reason: err.to_string(),
        })?;
        let Value::Object(ref obj) = value else {
            return Err(ConfigError::Parse {
                path: origin.to_string(),
                reason: "top level is not an object".to_string(),
            });
        };
        for key in obj.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!(config = origin, key = key.as_str(), "ignoring unknown config key");
            }
        }
        serde_json::from_value(value).map_err(|err| ConfigError::Parse {
            path: origin.to_string(),
            reason: err.to_string(),
        })
    }

    /// Load and parse a config file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Merge `self` (main) over `fallback`: present fields in `self` win.
    #[must_use]
    pub fn merged_over(self, fallback: ConfigFile) -> ConfigFile {
        ConfigFile {
            server_url: self.server_url.or(fallback.server_url),
            artifact_verify_keys: self.artifact_verify_keys.or(fallback.artifact_verify_keys),
            update_poll_interval_seconds: self
                .update_poll_interval_seconds
                .or(fallback.update_poll_interval_seconds),
            inventory_poll_interval_seconds: self
                .inventory_poll_interval_seconds
                .or(fallback.inventory_poll_interval_seconds),
            retry_poll_interval_seconds: self
                .retry_poll_interval_seconds
                .or(fallback.retry_poll_interval_seconds),
            retry_poll_count: self.retry_poll_count.or(fallback.retry_poll_count),
            device_type_file: self.device_type_file.or(fallback.device_type_file),
            module_directory: self.module_directory.or(fallback.module_directory),
            rootfs_scripts_path: self.rootfs_scripts_path.or(fallback.rootfs_scripts_path),
            state_script_timeout_seconds: self
                .state_script_timeout_seconds
                .or(fallback.state_script_timeout_seconds),
            state_script_retry_timeout_seconds: self
                .state_script_retry_timeout_seconds
                .or(fallback.state_script_retry_timeout_seconds),
            state_script_retry_interval_seconds: self
                .state_script_retry_interval_seconds
                .or(fallback.state_script_retry_interval_seconds),
            module_timeout_seconds: self.module_timeout_seconds.or(fallback.module_timeout_seconds),
            state_loop_cap: self.state_loop_cap.or(fallback.state_loop_cap),
        }
    }
}

// ---------------------------------------------------------------------------
// Effective configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration with every default applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the deployment service (empty in pure standalone use).
    pub server_url: String,
    /// Public keys accepted for artifact signature verification.
    pub artifact_verify_keys: Vec<PathBuf>,
    /// Data directory: state store, device type file, scratch trees.
    pub data_dir: PathBuf,
    /// Seconds between update checks.
    pub update_poll_interval_seconds: u64,
    /// Seconds between inventory submissions.
    pub inventory_poll_interval_seconds: u64,
    /// Seconds between status-report retries.
    pub retry_poll_interval_seconds: u64,
    /// Maximum number of status-report retries.
    pub retry_poll_count: u64,
    /// File holding `device_type=<type>`.
    pub device_type_file: PathBuf,
    /// Directory holding update modules.
    pub module_directory: PathBuf,
    /// Directory for rootfs-installed state scripts.
    pub rootfs_scripts_path: PathBuf,
    /// Directory the artifact's state scripts are unpacked into.
    pub artifact_scripts_path: PathBuf,
    /// Directory for deployment log files.
    pub update_log_path: PathBuf,
    /// Per-script wall-clock timeout in seconds.
    pub state_script_timeout_seconds: u64,
    /// Total retry budget for a retrying state script, in seconds.
    pub state_script_retry_timeout_seconds: u64,
    /// Interval between state-script retries, in seconds.
    pub state_script_retry_interval_seconds: u64,
    /// Per-hook timeout for update modules, in seconds.
    pub module_timeout_seconds: u64,
    /// Cap on deployment state-record writes before a loop is assumed.
    pub state_loop_cap: u64,
}

impl ClientConfig {
    /// Resolve a merged [`ConfigFile`] against `data_dir` and the defaults.
    pub fn resolve(file: ConfigFile, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        ClientConfig {
            server_url: file.server_url.unwrap_or_default(),
            artifact_verify_keys: file.artifact_verify_keys.unwrap_or_default(),
            update_poll_interval_seconds: file.update_poll_interval_seconds.unwrap_or(1800),
            inventory_poll_interval_seconds: file
                .inventory_poll_interval_seconds
                .unwrap_or(28_800),
            retry_poll_interval_seconds: file.retry_poll_interval_seconds.unwrap_or(300),
            retry_poll_count: file.retry_poll_count.unwrap_or(10),
            device_type_file: file
                .device_type_file
                .unwrap_or_else(|| data_dir.join("device_type")),
            module_directory: file
                .module_directory
                .unwrap_or_else(|| data_dir.join("modules/v3")),
            rootfs_scripts_path: file
                .rootfs_scripts_path
                .unwrap_or_else(|| data_dir.join("scripts")),
            artifact_scripts_path: data_dir.join("artifact-scripts"),
            update_log_path: data_dir.join("deployment-logs"),
            state_script_timeout_seconds: file.state_script_timeout_seconds.unwrap_or(3600),
            state_script_retry_timeout_seconds: file
                .state_script_retry_timeout_seconds
                .unwrap_or(1800),
            state_script_retry_interval_seconds: file
                .state_script_retry_interval_seconds
                .unwrap_or(60),
            module_timeout_seconds: file.module_timeout_seconds.unwrap_or(14_400),
            state_loop_cap: file.state_loop_cap.unwrap_or(28),
            data_dir,
        }
    }

    /// Path of the on-device state store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("airlift-store.json")
    }

    /// Path of the bootstrap artifact, installed once on first boot.
    pub fn bootstrap_artifact_path(&self) -> PathBuf {
        self.data_dir.join("bootstrap.airlift")
    }

    /// Path of the daemon pid file, used by `check-update`/`send-inventory`.
    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("airlift.pid")
    }

    /// Per-deployment scratch tree root for update modules.
    pub fn module_work_dir(&self) -> PathBuf {
        self.data_dir.join("module-work")
    }
}

// ---------------------------------------------------------------------------
// Proxy environment validation
// ---------------------------------------------------------------------------

const PROXY_VARS: &[(&str, &str)] = &[
    ("HTTP_PROXY", "http_proxy"),
    ("HTTPS_PROXY", "https_proxy"),
    ("NO_PROXY", "no_proxy"),
];

/// Reject environments that set both case forms of a proxy variable.
///
/// HTTP stacks disagree on which form wins, so a mixed environment would make
/// download behavior depend on library internals.  The variables themselves
/// are consumed by the HTTP client, not here.
pub fn validate_proxy_env(
    get: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    for (upper, lower) in PROXY_VARS {
        if get(upper).is_some() && get(lower).is_some() {
            return Err(ConfigError::ProxyEnv {
                reason: format!("both {upper} and {lower} are set; use only one form"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_full_config() {
        let cfg = ConfigFile::parse(
            r#"{
                "ServerURL": "https://updates.example.com",
                "UpdatePollIntervalSeconds": 600,
                "ArtifactVerifyKeys": ["/etc/airlift/key.pem"],
                "DeviceTypeFile": "/etc/airlift/device_type"
            }"#,
            "test",
        )
        .unwrap();
        assert_eq!(cfg.server_url.as_deref(), Some("https://updates.example.com"));
        assert_eq!(cfg.update_poll_interval_seconds, Some(600));
        assert_eq!(
            cfg.artifact_verify_keys.as_deref(),
            Some(&[PathBuf::from("/etc/airlift/key.pem")][..])
        );
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = ConfigFile::parse(
            r#"{"ServerURL": "https://x", "FutureFeatureToggle": true}"#,
            "test",
        )
        .unwrap();
        assert_eq!(cfg.server_url.as_deref(), Some("https://x"));
    }

    #[test]
    fn non_object_top_level_is_rejected() {
        let err = ConfigFile::parse("[1,2,3]", "test").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn merge_prefers_main_file() {
        let fallback = ConfigFile {
            server_url: Some("https://fallback".into()),
            update_poll_interval_seconds: Some(100),
            retry_poll_count: Some(3),
            ..Default::default()
        };
        let main = ConfigFile {
            server_url: Some("https://main".into()),
            ..Default::default()
        };
        let merged = main.merged_over(fallback);
        assert_eq!(merged.server_url.as_deref(), Some("https://main"));
        assert_eq!(merged.update_poll_interval_seconds, Some(100));
        assert_eq!(merged.retry_poll_count, Some(3));
    }

    #[test]
    fn resolve_applies_defaults_under_data_dir() {
        let cfg = ClientConfig::resolve(ConfigFile::default(), "/var/lib/airlift");
        assert_eq!(cfg.update_poll_interval_seconds, 1800);
        assert_eq!(cfg.state_loop_cap, 28);
        assert_eq!(
            cfg.device_type_file,
            PathBuf::from("/var/lib/airlift/device_type")
        );
        assert_eq!(
            cfg.store_path(),
            PathBuf::from("/var/lib/airlift/airlift-store.json")
        );
        assert_eq!(
            cfg.module_directory,
            PathBuf::from("/var/lib/airlift/modules/v3")
        );
    }

    #[test]
    fn load_missing_file_errors() {
        let err = ConfigFile::load(Path::new("/definitely/not/here.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("airlift.conf");
        std::fs::write(&path, r#"{"ServerURL": "https://disk"}"#).unwrap();
        let cfg = ConfigFile::load(&path).unwrap();
        assert_eq!(cfg.server_url.as_deref(), Some("https://disk"));
    }

    #[test]
    fn proxy_env_single_form_is_fine() {
        validate_proxy_env(env(&[("HTTP_PROXY", "http://proxy:3128")])).unwrap();
        validate_proxy_env(env(&[("no_proxy", "localhost")])).unwrap();
        validate_proxy_env(env(&[])).unwrap();
    }

    #[test]
    fn proxy_env_mixed_case_is_rejected() {
        let err = validate_proxy_env(env(&[
            ("HTTPS_PROXY", "http://a:3128"),
            ("https_proxy", "http://b:3128"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ProxyEnv { .. }));
    }

    #[test]
    fn proxy_env_mixed_case_same_value_is_still_rejected() {
        let err = validate_proxy_env(env(&[
            ("NO_PROXY", "localhost"),
            ("no_proxy", "localhost"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ProxyEnv { .. }));
    }
}
