// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the airlift update client.
//!
//! Every airlift error carries an [`ErrorKind`] (a closed, machine-readable
//! classification), a human-readable message, an optional cause, and a chain
//! of follow-up errors.  The follow-up chain exists because teardown paths
//! (rollback, cleanup) can fail *after* the primary failure; those errors are
//! accumulated with [`Error::followed_by`] instead of shadowing the first one.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Closed classification of airlift failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Artifact or JSON input is syntactically malformed.
    Parse,
    /// Syntactically valid input with bad semantics (unknown key, wrong shape).
    Validation,
    /// Manifest signature missing or invalid while verify keys are configured.
    Signature,
    /// Artifact depends not satisfied by the device (device type, provides).
    DependencyMismatch,
    /// The state store holds a record this client cannot interpret.
    DatabaseValue,
    /// An update exceeded the state-transition cap; a state loop is suspected.
    StateDataStoreCountExceeded,
    /// Commit or rollback was requested with no update in progress.
    NoUpdateInProgress,
    /// HTTP status code outside the accepted set for the operation.
    UnexpectedHttpResponse,
    /// The server aborted the deployment (HTTP 409 on a status push).
    DeploymentAborted,
    /// A retry/backoff budget was exhausted.
    MaxRetriesExceeded,
    /// Non-fatal sentinel: the device must reboot to continue.
    RebootRequired,
    /// The operation was cancelled cooperatively.
    Cancelled,
    /// Underlying I/O failure (filesystem, pipe, child process plumbing).
    Io,
    /// Invariant violated; indicates a bug in this client.
    Programming,
}

impl ErrorKind {
    /// Stable string tag for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse error",
            Self::Validation => "validation error",
            Self::Signature => "signature error",
            Self::DependencyMismatch => "dependency mismatch",
            Self::DatabaseValue => "invalid database value",
            Self::StateDataStoreCountExceeded => "state data store count exceeded",
            Self::NoUpdateInProgress => "no update in progress",
            Self::UnexpectedHttpResponse => "unexpected HTTP response",
            Self::DeploymentAborted => "deployment aborted on server",
            Self::MaxRetriesExceeded => "maximum retries exceeded",
            Self::RebootRequired => "reboot required",
            Self::Cancelled => "operation cancelled",
            Self::Io => "I/O error",
            Self::Programming => "programming error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// An airlift error: kind, message, optional cause, follow-up chain.
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    followed: Vec<Error>,
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            followed: Vec::new(),
        }
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Prefix the message with an operation context, keeping kind and cause.
    #[must_use]
    pub fn context(mut self, ctx: impl AsRef<str>) -> Self {
        self.message = format!("{}: {}", ctx.as_ref(), self.message);
        self
    }

    /// Record `next` as a follow-up failure without shadowing `self`.
    ///
    /// The receiver stays the primary error; callers that only care about one
    /// error use [`Error::kind`] of the primary, loggers print the whole chain.
    #[must_use]
    pub fn followed_by(mut self, next: Error) -> Self {
        self.followed.push(next);
        self
    }

    /// The machine-readable kind of the primary error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns `true` if the primary error is of the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Returns `true` if the primary error *or any follow-up* has this kind.
    pub fn chain_contains(&self, kind: ErrorKind) -> bool {
        self.kind == kind || self.followed.iter().any(|e| e.chain_contains(kind))
    }

    /// The human-readable message of the primary error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Follow-up errors accumulated by [`Error::followed_by`].
    pub fn followed(&self) -> &[Error] {
        &self.followed
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(ref src) = self.source {
            write!(f, ": {src}")?;
        }
        for next in &self.followed {
            write!(f, "; followed by: {next}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.followed.is_empty() {
            d.field("followed", &self.followed);
        }
        d.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Parse, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Accumulation helper
// ---------------------------------------------------------------------------

/// Merge an optional primary error with a new failure.
///
/// Teardown code often runs several steps, each of which may fail; the first
/// failure becomes the primary and later ones are chained behind it.
pub fn accumulate(primary: Option<Error>, next: Error) -> Option<Error> {
    match primary {
        None => Some(next),
        Some(err) => Some(err.followed_by(next)),
    }
}
