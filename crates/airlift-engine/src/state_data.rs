// SPDX-License-Identifier: MIT OR Apache-2.0
//! The persistent deployment state record.
//!
//! One serialized document tracks where an in-flight update stands, so a
//! power cut at any point leaves enough on disk to resume or roll back.  Two
//! store slots exist: writers normally use the committed slot and clear the
//! uncommitted one; a client carrying a *newer* schema stages its record in
//! the uncommitted slot instead, so that the older client can still read the
//! committed record after a rollback to the old software.

use airlift_error::{Error, ErrorKind, Result};
use airlift_store::{STATE_DATA_KEY, STATE_DATA_UNCOMMITTED_KEY, Store, StoreError, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version this client reads and writes.
pub const STATE_DATA_VERSION: u64 = 2;

/// Default cap on state-record writes per deployment before a reboot loop is
/// assumed.
pub const DEFAULT_STATE_LOOP_CAP: u64 = 28;

// ---------------------------------------------------------------------------
// Database string values
// ---------------------------------------------------------------------------

/// `SupportsRollback` database value: module confirmed rollback support.
pub const ROLLBACK_SUPPORTED: &str = "rollback-supported";
/// `SupportsRollback` database value: module denied rollback support.
pub const ROLLBACK_NOT_SUPPORTED: &str = "rollback-not-supported";

/// `RebootRequested` database value: no reboot.
pub const REBOOT_TYPE_NONE: &str = "";
/// `RebootRequested` database value: the core reboots the device.
pub const REBOOT_TYPE_AUTOMATIC: &str = "reboot-type-automatic";
/// `RebootRequested` database value: the module reboots through its hook.
pub const REBOOT_TYPE_CUSTOM: &str = "reboot-type-custom";

/// Convert a module's rollback answer to its database string.
pub fn rollback_support_to_db(supported: bool) -> &'static str {
    if supported {
        ROLLBACK_SUPPORTED
    } else {
        ROLLBACK_NOT_SUPPORTED
    }
}

/// Parse a `SupportsRollback` database string.
pub fn rollback_support_from_db(value: &str) -> Result<bool> {
    match value {
        ROLLBACK_SUPPORTED => Ok(true),
        ROLLBACK_NOT_SUPPORTED => Ok(false),
        other => Err(Error::new(
            ErrorKind::DatabaseValue,
            format!("'{other}' is not a valid value for SupportsRollback"),
        )),
    }
}

/// Validate a `RebootRequested` database string.
pub fn check_reboot_requested(value: &str) -> Result<()> {
    match value {
        REBOOT_TYPE_NONE | REBOOT_TYPE_AUTOMATIC | REBOOT_TYPE_CUSTOM => Ok(()),
        other => Err(Error::new(
            ErrorKind::DatabaseValue,
            format!("'{other}' is not a valid value for RebootRequested"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Where the artifact bytes come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSource {
    /// Download URI.
    #[serde(rename = "URI")]
    pub uri: String,
    /// URI expiry, empty when the server sent none.
    #[serde(rename = "Expire", default)]
    pub expire: String,
}

/// Server-side deployment bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Deployment id assigned by the server; empty in standalone mode.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Artifact source.
    #[serde(rename = "Source", default)]
    pub source: ArtifactSource,
    /// Device types the artifact declares compatible.
    #[serde(rename = "CompatibleDevices", default)]
    pub compatible_devices: Vec<String>,
    /// Per-payload reboot action database strings.
    #[serde(rename = "RebootRequested", default)]
    pub reboot_requested: Vec<String>,
    /// Rollback-support database string, empty until queried.
    #[serde(rename = "SupportsRollback", default)]
    pub supports_rollback: String,
    /// Incremented on every record write; a loop breaker.
    #[serde(rename = "StateDataStoreCount", default)]
    pub state_data_store_count: u64,
    /// `true` while the authoritative record sits in the uncommitted slot.
    #[serde(rename = "HasDBSchemaUpdate", default)]
    pub has_db_schema_update: bool,
    /// `false` once any rollback step failed.
    #[serde(rename = "AllRollbacksSuccessful", default)]
    pub all_rollbacks_successful: bool,
}

/// The deployment state record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateData {
    /// Record schema version.
    #[serde(rename = "Version")]
    pub version: u64,
    /// Name of the state-machine node the deployment is at.
    #[serde(rename = "Name", default)]
    pub in_state: String,
    /// Name of the incoming artifact.
    #[serde(rename = "ArtifactName", default)]
    pub artifact_name: String,
    /// Group of the incoming artifact.
    #[serde(rename = "ArtifactGroup", default)]
    pub artifact_group: String,
    /// Provides declared by the artifact's type-info, when any.
    #[serde(rename = "ArtifactProvides", default)]
    pub artifact_provides: Option<BTreeMap<String, String>>,
    /// Clears-provides patterns declared by the artifact, when any.
    #[serde(rename = "ClearsArtifactProvides", default)]
    pub clears_artifact_provides: Option<Vec<String>>,
    /// Payload types; exactly one entry once an artifact was parsed.
    #[serde(rename = "PayloadTypes", default)]
    pub payload_types: Vec<String>,
    /// Server-side deployment bookkeeping.
    #[serde(rename = "UpdateInfo", default)]
    pub update_info: UpdateInfo,
    /// Whether this deployment has recorded a failure.
    #[serde(rename = "Failed", default)]
    pub failed: bool,
    /// Whether this deployment rolled back (or needed no rollback).
    #[serde(rename = "RolledBack", default)]
    pub rolled_back: bool,
}

impl StateData {
    /// Fresh record for a new deployment.
    pub fn new_for_deployment(id: String, uri: String, expire: Option<String>) -> Self {
        StateData {
            version: STATE_DATA_VERSION,
            update_info: UpdateInfo {
                id,
                source: ArtifactSource {
                    uri,
                    expire: expire.unwrap_or_default(),
                },
                all_rollbacks_successful: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Copy artifact header facts into the record.
    pub fn fill_from_header(&mut self, header: &airlift_artifact::ArtifactHeader) {
        self.artifact_name = header.artifact_name().to_string();
        self.artifact_group = header.artifact_group().to_string();
        self.artifact_provides = header.provides().cloned();
        self.clears_artifact_provides = header.clears_provides().cloned();
        self.payload_types = vec![header.payload_type().to_string()];
        self.update_info.compatible_devices = header
            .combined_depends()
            .get("device_type")
            .cloned()
            .unwrap_or_default();
    }

    fn validate(&self) -> Result<()> {
        if self.version != STATE_DATA_VERSION {
            return Err(Error::new(
                ErrorKind::Validation,
                "state data version not supported by this client",
            ));
        }
        // A deployment that failed before the artifact was parsed legally has
        // neither payload types nor a name.
        if self.payload_types.is_empty() && self.artifact_name.is_empty() {
            return Ok(());
        }
        if self.payload_types.len() != 1 {
            return Err(Error::new(
                ErrorKind::Validation,
                format!(
                    "only exactly one payload type is supported, got {}",
                    self.payload_types.len()
                ),
            ));
        }
        for reboot in &self.update_info.reboot_requested {
            check_reboot_requested(reboot)?;
        }
        if !self.update_info.supports_rollback.is_empty() {
            rollback_support_from_db(&self.update_info.supports_rollback)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Write the record inside an open transaction, bumping the write counter.
///
/// Exceeding `loop_cap` aborts with [`ErrorKind::StateDataStoreCountExceeded`]
/// — the deployment is looping (e.g. through reboots) and must be broken out
/// of.
pub fn save_state_data_txn(
    txn: &mut Transaction<'_>,
    state_data: &mut StateData,
    loop_cap: u64,
) -> Result<()> {
    if state_data.update_info.state_data_store_count >= loop_cap {
        return Err(Error::new(
            ErrorKind::StateDataStoreCountExceeded,
            "state looping detected, breaking out of loop",
        ));
    }
    state_data.update_info.state_data_store_count += 1;

    let content = serde_json::to_vec(state_data)
        .map_err(|err| Error::new(ErrorKind::Programming, err.to_string()))?;

    if state_data.update_info.has_db_schema_update {
        // Leave the committed slot for the older client to come back to.
        txn.write(STATE_DATA_UNCOMMITTED_KEY, &content)
            .map_err(Error::from)?;
    } else {
        txn.remove(STATE_DATA_UNCOMMITTED_KEY).map_err(Error::from)?;
        txn.write(STATE_DATA_KEY, &content).map_err(Error::from)?;
    }
    Ok(())
}

/// Write the record in its own transaction.
pub fn save_state_data(store: &Store, state_data: &mut StateData, loop_cap: u64) -> Result<()> {
    store
        .write_transaction(|txn| {
            save_state_data_txn(txn, state_data, loop_cap).map_err(StoreError::Domain)
        })
        .map_err(Error::from)
}

/// Load the record; `Ok(None)` when no deployment is in flight.
///
/// The committed slot is tried first; a schema mismatch there falls back to
/// the uncommitted slot (and remembers that in `has_db_schema_update`).
/// Every successful load re-saves the record, so the write counter also
/// advances across crash-recovery cycles.
pub fn load_state_data(store: &Store, loop_cap: u64) -> Result<Option<StateData>> {
    let loaded = store.write_transaction(|txn| {
        let committed = match txn.read(STATE_DATA_KEY) {
            Ok(bytes) => Some(bytes),
            Err(StoreError::KeyNotFound(_)) => None,
            Err(err) => return Err(err),
        };

        let mut state_data = match committed {
            Some(bytes) => match parse_record(&bytes) {
                Ok(data) => data,
                Err(err) if err.kind() == ErrorKind::Validation => {
                    // Schema mismatch: try the staged record.
                    let bytes = match txn.read(STATE_DATA_UNCOMMITTED_KEY) {
                        Ok(bytes) => bytes,
                        Err(inner) => {
                            return Err(StoreError::Domain(
                                err.context("could not load state data")
                                    .followed_by(Error::from(inner)),
                            ));
                        }
                    };
                    let mut data = match parse_record(&bytes) {
                        Ok(data) => data,
                        Err(inner) => {
                            return Err(StoreError::Domain(
                                err.context("could not load state data").followed_by(inner),
                            ));
                        }
                    };
                    data.update_info.has_db_schema_update = true;
                    data
                }
                Err(err) => {
                    return Err(StoreError::Domain(err.context("could not load state data")));
                }
            },
            None => return Ok(None),
        };

        save_state_data_txn(txn, &mut state_data, loop_cap).map_err(StoreError::Domain)?;
        Ok(Some(state_data))
    });
    loaded.map_err(Error::from)
}

/// Remove both record slots inside an open transaction.
pub fn remove_state_data_txn(txn: &mut Transaction<'_>) -> Result<()> {
    txn.remove(STATE_DATA_KEY).map_err(Error::from)?;
    txn.remove(STATE_DATA_UNCOMMITTED_KEY).map_err(Error::from)
}

fn parse_record(bytes: &[u8]) -> Result<StateData> {
    let state_data: StateData = serde_json::from_slice(bytes)
        .map_err(|err| Error::new(ErrorKind::DatabaseValue, err.to_string()))?;
    state_data.validate()?;
    Ok(state_data)
}
