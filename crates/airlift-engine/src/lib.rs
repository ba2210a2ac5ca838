// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deployment state machines for the airlift update client.
//!
//! Two drivers share one engine: [`standalone`] runs a linear install /
//! commit / rollback flow from a local file or URL, [`daemon::Daemon`] runs
//! the long-lived poll–install–report loop against the deployment service.
//! Both persist every transition through the state record in
//! [`state_data`], which is what makes them crash-recoverable.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod deployment_log;
mod result;
mod state_data;

pub mod daemon;
pub mod standalone;

pub use context::EngineContext;
pub use deployment_log::DeploymentLog;
pub use result::{ResultAndError, ResultFlags};
pub use state_data::{
    ArtifactSource, DEFAULT_STATE_LOOP_CAP, REBOOT_TYPE_AUTOMATIC, REBOOT_TYPE_CUSTOM,
    REBOOT_TYPE_NONE, ROLLBACK_NOT_SUPPORTED, ROLLBACK_SUPPORTED, STATE_DATA_VERSION, StateData,
    UpdateInfo, check_reboot_requested, load_state_data, remove_state_data_txn,
    rollback_support_from_db, rollback_support_to_db, save_state_data, save_state_data_txn,
};
