// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared wiring for every install driver.

use airlift_artifact::{ParserConfig, VerifyPolicy};
use airlift_config::ClientConfig;
use airlift_context::DeviceContext;
use airlift_error::{Error, ErrorKind, Result};
use airlift_scripts::{ScriptRunner, ScriptTimings};
use airlift_store::Store;
use std::sync::Arc;
use std::time::Duration;

/// Everything an install driver needs: configuration, the open store, device
/// identity, script runner, and an HTTP client.
pub struct EngineContext {
    /// Resolved client configuration.
    pub config: ClientConfig,
    /// The on-device state store.
    pub store: Arc<Store>,
    /// Device identity and provides database.
    pub device: DeviceContext,
    /// State-script runner.
    pub scripts: ScriptRunner,
    /// HTTP client shared by downloads and API calls.
    pub http: reqwest::Client,
}

impl EngineContext {
    /// Open the store and assemble the context.
    pub fn open(config: ClientConfig) -> Result<Self> {
        let store = Arc::new(Store::open(config.store_path()).map_err(Error::from)?);
        let device = DeviceContext::new(store.clone(), &config.device_type_file);
        device.initialize()?;

        let scripts = ScriptRunner::new(
            &config.artifact_scripts_path,
            &config.rootfs_scripts_path,
            ScriptTimings {
                timeout: Duration::from_secs(config.state_script_timeout_seconds),
                retry_interval: Duration::from_secs(config.state_script_retry_interval_seconds),
                retry_timeout: Duration::from_secs(config.state_script_retry_timeout_seconds),
            },
        );

        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| Error::new(ErrorKind::Io, format!("HTTP client: {err}")))?;

        Ok(Self {
            config,
            store,
            device,
            scripts,
            http,
        })
    }

    /// Parser configuration for artifact parsing under this context.
    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig {
            artifact_verify_keys: self.config.artifact_verify_keys.clone(),
            verify_signature: if self.config.artifact_verify_keys.is_empty() {
                VerifyPolicy::IfPossible
            } else {
                VerifyPolicy::Required
            },
            artifact_scripts_dir: Some(self.config.artifact_scripts_path.clone()),
        }
    }

    /// Per-hook timeout for update modules.
    pub fn module_timeout(&self) -> Duration {
        Duration::from_secs(self.config.module_timeout_seconds)
    }

    /// Remove leftover artifact scripts from an earlier deployment.
    pub fn clear_artifact_scripts(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.config.artifact_scripts_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::from(err).context("when preparing to parse artifact")),
        }
    }
}
