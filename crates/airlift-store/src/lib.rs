// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transactional key→bytes store backing all persistent client state.
//!
//! The store is deliberately small: string keys, byte values, snapshot
//! transactions that commit atomically on clean return.  A missing key is a
//! distinguishable [`StoreError::KeyNotFound`], never an empty value — the
//! deployment state machines branch on that distinction.
//!
//! Two backings exist behind the same [`Store`] type: a pure in-memory map
//! (tests, `show-*` commands against scratch state) and a file-backed map
//! persisted as one JSON document with write-to-temp-then-rename commits.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use airlift_error::{Error, ErrorKind};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Reserved keys
// ---------------------------------------------------------------------------

/// Installed artifact name.
pub const ARTIFACT_NAME_KEY: &str = "artifact-name";
/// Installed artifact group.
pub const ARTIFACT_GROUP_KEY: &str = "artifact-group";
/// JSON object of additional provides.
pub const ARTIFACT_PROVIDES_KEY: &str = "artifact-provides";
/// Committed deployment state record.
pub const STATE_DATA_KEY: &str = "state";
/// Staged deployment state record during a schema upgrade.
pub const STATE_DATA_UNCOMMITTED_KEY: &str = "state-uncommitted";
/// Standalone deployment state record.
pub const STANDALONE_STATE_KEY: &str = "standalone-state";
/// Cached API token; removed on startup.
pub const AUTH_TOKEN_KEY: &str = "authtoken";
/// Token cache invalidator; removed on startup.
pub const AUTH_TOKEN_INVALIDATOR_KEY: &str = "auth-token-cache-invalidator";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The backing file could not be read or written.
    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file exists but does not hold a valid store document.
    #[error("store contents corrupted: {0}")]
    Corrupt(String),

    /// A domain error raised inside a transaction closure.
    #[error(transparent)]
    Domain(#[from] Error),
}

impl StoreError {
    /// Returns `true` for the missing-key case.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(inner) => inner,
            StoreError::Io(io) => Error::new(ErrorKind::Io, io.to_string()),
            StoreError::Corrupt(msg) => Error::new(ErrorKind::DatabaseValue, msg),
            StoreError::KeyNotFound(key) => {
                Error::new(ErrorKind::DatabaseValue, format!("key not found: {key}"))
            }
        }
    }
}

/// Store result alias.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Handle passed to transaction closures.
///
/// Reads see a consistent snapshot; writes become visible to other callers
/// only when the closure returns `Ok` and the transaction commits.
pub struct Transaction<'a> {
    map: &'a mut BTreeMap<String, Vec<u8>>,
}

impl Transaction<'_> {
    /// Read the value stored under `key`.
    pub fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.map
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    /// Read the value under `key` as a UTF-8 string; `Ok(None)` when absent.
    pub fn read_string_opt(&self, key: &str) -> StoreResult<Option<String>> {
        match self.read(key) {
            Ok(bytes) => {
                let s = String::from_utf8(bytes).map_err(|_| {
                    StoreError::Corrupt(format!("value under '{key}' is not UTF-8"))
                })?;
                Ok(Some(s))
            }
            Err(StoreError::KeyNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Stage a write of `value` under `key`.
    pub fn write(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Stage removal of `key`; removing an absent key is not an error.
    pub fn remove(&mut self, key: &str) -> StoreResult<()> {
        self.map.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

enum Backing {
    Memory,
    File(PathBuf),
}

/// Transactional key→bytes store.
pub struct Store {
    backing: Backing,
    inner: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Store {
    /// Create an in-memory store.  Contents die with the value.
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open (or create) the file-backed store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read(&path) {
            Ok(bytes) => parse_document(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            backing: Backing::File(path),
            inner: Mutex::new(map),
        })
    }

    /// Read the value stored under `key`.
    pub fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        let map = self.inner.lock().expect("store lock poisoned");
        map.get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    /// Write `value` under `key`, committing immediately.
    pub fn write(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.write_transaction(|txn| txn.write(key, value))
    }

    /// Remove `key`, committing immediately.  Absent keys are not an error.
    pub fn remove(&self, key: &str) -> StoreResult<()> {
        self.write_transaction(|txn| txn.remove(key))
    }

    /// Run `f` against a read-only snapshot.
    pub fn read_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let map = self.inner.lock().expect("store lock poisoned");
        let mut snapshot = map.clone();
        let txn = Transaction { map: &mut snapshot };
        f(&txn)
    }

    /// Run `f` against a writable snapshot; commit atomically on `Ok`.
    ///
    /// When `f` returns an error the staged writes are discarded and, for a
    /// file-backed store, nothing touches the disk.
    pub fn write_transaction<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut map = self.inner.lock().expect("store lock poisoned");
        let mut staged = map.clone();
        let mut txn = Transaction { map: &mut staged };
        let value = f(&mut txn)?;
        if let Backing::File(ref path) = self.backing {
            persist(path, &staged)?;
        }
        *map = staged;
        Ok(value)
    }
}

fn parse_document(bytes: &[u8]) -> StoreResult<BTreeMap<String, Vec<u8>>> {
    let doc: Map<String, Value> = serde_json::from_slice(bytes)
        .map_err(|err| StoreError::Corrupt(format!("not a JSON object: {err}")))?;
    let mut map = BTreeMap::new();
    for (key, value) in doc {
        let Value::String(encoded) = value else {
            return Err(StoreError::Corrupt(format!(
                "value under '{key}' is not a string"
            )));
        };
        // Values are stored hex-encoded so arbitrary bytes survive JSON.
        let bytes = hex::decode(&encoded)
            .map_err(|_| StoreError::Corrupt(format!("value under '{key}' is not hex")))?;
        map.insert(key, bytes);
    }
    Ok(map)
}

fn persist(path: &Path, map: &BTreeMap<String, Vec<u8>>) -> StoreResult<()> {
    let mut doc = Map::new();
    for (key, value) in map {
        doc.insert(key.clone(), Value::String(hex::encode(value)));
    }
    let serialized = serde_json::to_vec(&Value::Object(doc))
        .map_err(|err| StoreError::Corrupt(err.to_string()))?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
