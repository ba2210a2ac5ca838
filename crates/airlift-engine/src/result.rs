// SPDX-License-Identifier: MIT OR Apache-2.0
//! Composable result mask returned by the standalone state machine.

use airlift_error::Error;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask describing everything a standalone operation did (and failed at).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultFlags(u32);

impl ResultFlags {
    /// Nothing happened.
    pub const NONE: ResultFlags = ResultFlags(0);
    /// The payload was delivered to the update module.
    pub const DOWNLOADED: ResultFlags = ResultFlags(1 << 0);
    /// `ArtifactInstall` succeeded.
    pub const INSTALLED: ResultFlags = ResultFlags(1 << 1);
    /// `ArtifactCommit` succeeded.
    pub const COMMITTED: ResultFlags = ResultFlags(1 << 2);
    /// A rollback ran to completion.
    pub const ROLLED_BACK: ResultFlags = ResultFlags(1 << 3);
    /// The module does not support rollback.
    pub const NO_ROLLBACK: ResultFlags = ResultFlags(1 << 4);
    /// Failure happened before anything needed rolling back.
    pub const NO_ROLLBACK_NECESSARY: ResultFlags = ResultFlags(1 << 5);
    /// The device must reboot to finish the install.
    pub const REBOOT_REQUIRED: ResultFlags = ResultFlags(1 << 6);
    /// A rollback was attempted and failed.
    pub const ROLLBACK_FAILED: ResultFlags = ResultFlags(1 << 7);
    /// The module's `Cleanup` hook failed.
    pub const CLEANUP_FAILED: ResultFlags = ResultFlags(1 << 8);
    /// Failure after the commit point; the install itself stands.
    pub const FAILED_IN_POST_COMMIT: ResultFlags = ResultFlags(1 << 9);
    /// Per-deployment resources were released.
    pub const CLEANED: ResultFlags = ResultFlags(1 << 10);
    /// The operation failed.
    pub const FAILED: ResultFlags = ResultFlags(1 << 11);
    /// Commit/rollback was requested with nothing in flight.
    pub const NO_UPDATE_IN_PROGRESS: ResultFlags = ResultFlags(1 << 12);
    /// The module supports no rollback, so the install auto-committed.
    pub const AUTO_COMMIT_WANTED: ResultFlags = ResultFlags(1 << 13);

    /// Does the mask contain every bit of `other`?
    pub fn contains(self, other: ResultFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Exit code for the CLI.
    ///
    /// Failures map to 2; a pending reboot maps to 4 only when the caller
    /// opted into reboot exit codes, otherwise it is success.
    pub fn exit_code(self, reboot_exit_code: bool) -> i32 {
        if self.contains(ResultFlags::FAILED) {
            2
        } else if reboot_exit_code && self.contains(ResultFlags::REBOOT_REQUIRED) {
            4
        } else {
            0
        }
    }
}

impl BitOr for ResultFlags {
    type Output = ResultFlags;

    fn bitor(self, rhs: ResultFlags) -> ResultFlags {
        ResultFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResultFlags {
    fn bitor_assign(&mut self, rhs: ResultFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ResultFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(ResultFlags, &str)] = &[
            (ResultFlags::DOWNLOADED, "downloaded"),
            (ResultFlags::INSTALLED, "installed"),
            (ResultFlags::COMMITTED, "committed"),
            (ResultFlags::ROLLED_BACK, "rolled-back"),
            (ResultFlags::NO_ROLLBACK, "no-rollback"),
            (ResultFlags::NO_ROLLBACK_NECESSARY, "no-rollback-necessary"),
            (ResultFlags::REBOOT_REQUIRED, "reboot-required"),
            (ResultFlags::ROLLBACK_FAILED, "rollback-failed"),
            (ResultFlags::CLEANUP_FAILED, "cleanup-failed"),
            (ResultFlags::FAILED_IN_POST_COMMIT, "failed-in-post-commit"),
            (ResultFlags::CLEANED, "cleaned"),
            (ResultFlags::FAILED, "failed"),
            (ResultFlags::NO_UPDATE_IN_PROGRESS, "no-update-in-progress"),
            (ResultFlags::AUTO_COMMIT_WANTED, "auto-commit-wanted"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(*flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// A result mask together with the accumulated error chain.
#[derive(Debug, Default)]
pub struct ResultAndError {
    /// What the operation did.
    pub result: ResultFlags,
    /// Primary error with follow-ups, when anything failed.
    pub error: Option<Error>,
}

impl ResultAndError {
    /// Merge another step's outcome into this one.
    pub fn update(&mut self, result: ResultFlags, error: Option<Error>) {
        self.result |= result;
        if let Some(err) = error {
            self.error = airlift_error::accumulate(self.error.take(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_all_bits() {
        let mask = ResultFlags::DOWNLOADED | ResultFlags::INSTALLED;
        assert!(mask.contains(ResultFlags::DOWNLOADED));
        assert!(mask.contains(ResultFlags::DOWNLOADED | ResultFlags::INSTALLED));
        assert!(!mask.contains(ResultFlags::COMMITTED));
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(ResultFlags::COMMITTED.exit_code(false), 0);
        assert_eq!(
            (ResultFlags::FAILED | ResultFlags::ROLLED_BACK).exit_code(false),
            2
        );
        let reboot = ResultFlags::INSTALLED | ResultFlags::REBOOT_REQUIRED;
        assert_eq!(reboot.exit_code(true), 4);
        assert_eq!(reboot.exit_code(false), 0);
        // Failed wins over reboot-required.
        let both = reboot | ResultFlags::FAILED;
        assert_eq!(both.exit_code(true), 2);
    }

    #[test]
    fn display_lists_flag_names() {
        let mask = ResultFlags::DOWNLOADED | ResultFlags::FAILED;
        assert_eq!(mask.to_string(), "downloaded|failed");
        assert_eq!(ResultFlags::NONE.to_string(), "none");
    }

    #[test]
    fn update_accumulates_errors_in_order() {
        let mut outcome = ResultAndError::default();
        outcome.update(ResultFlags::FAILED, Some(Error::new(
            airlift_error::ErrorKind::Io,
            "first",
        )));
        outcome.update(ResultFlags::ROLLBACK_FAILED, Some(Error::new(
            airlift_error::ErrorKind::Io,
            "second",
        )));
        let err = outcome.error.unwrap();
        assert_eq!(err.message(), "first");
        assert_eq!(err.followed().len(), 1);
        assert!(outcome.result.contains(ResultFlags::ROLLBACK_FAILED));
    }
}
