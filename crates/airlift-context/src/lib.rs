// SPDX-License-Identifier: MIT OR Apache-2.0
//! Device identity and the artifact-provides database.
//!
//! The context answers two questions for the update engine: *what is this
//! device* (device type plus the provides map left behind by earlier
//! installs) and *may this artifact install here* (depends matching).  It
//! also owns the one transaction that rewrites the provides map on commit.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use airlift_error::{Error, ErrorKind, Result};
use airlift_store::{
    ARTIFACT_GROUP_KEY, ARTIFACT_NAME_KEY, ARTIFACT_PROVIDES_KEY, AUTH_TOKEN_INVALIDATOR_KEY,
    AUTH_TOKEN_KEY, Store, StoreError, Transaction,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

/// Provides map: opaque key→value facts the device declares about itself.
pub type ProvidesData = BTreeMap<String, String>;

/// Wildcard patterns naming provides keys an artifact erases before applying
/// its own.
pub type ClearsProvidesData = Vec<String>;

/// Depends map extracted from an artifact header, `device_type` included.
pub type DependsData = BTreeMap<String, Vec<String>>;

/// Suffix marking an artifact whose rollback failed or was unsupported, so
/// later `artifact_name` dependency checks reject the device state.
pub const BROKEN_ARTIFACT_SUFFIX: &str = "_INCONSISTENT";

// ---------------------------------------------------------------------------
// Wildcard matching
// ---------------------------------------------------------------------------

/// Match `candidate` against a clears pattern where `*` spans any run.
///
/// Non-wildcard prefixes and suffixes are anchored; middle fragments are
/// located left to right without overlapping.
pub fn clears_match(candidate: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return candidate.is_empty();
    }

    let fragments: Vec<&str> = pattern.split('*').collect();

    if !fragments[0].is_empty() && !candidate.starts_with(fragments[0]) {
        return false;
    }
    let last = fragments[fragments.len() - 1];
    if !last.is_empty() && !candidate.ends_with(last) {
        return false;
    }

    let mut boundary = 0;
    for fragment in &fragments {
        if fragment.is_empty() {
            continue;
        }
        match candidate[boundary..].find(fragment) {
            Some(at) => boundary += at + fragment.len(),
            None => return false,
        }
    }
    true
}

/// Delete every provides key matching any clears pattern, then overlay the
/// new provides.
pub fn filter_provides(
    new_provides: &ProvidesData,
    clears_provides: &ClearsProvidesData,
    existing: &mut ProvidesData,
) {
    for pattern in clears_provides {
        existing.retain(|key, _| !clears_match(key, pattern));
    }
    for (key, value) in new_provides {
        existing.insert(key.clone(), value.clone());
    }
}

// ---------------------------------------------------------------------------
// Depends matching
// ---------------------------------------------------------------------------

/// Pure form of the depends check, for callers that already hold the inputs.
pub fn artifact_matches_context(
    provides: &ProvidesData,
    device_type: &str,
    depends: &DependsData,
) -> Result<bool> {
    if !provides.contains_key("artifact_name") {
        return Err(Error::new(
            ErrorKind::Validation,
            "missing artifact_name value in provides",
        ));
    }

    let device_types = depends.get("device_type").ok_or_else(|| {
        Error::new(
            ErrorKind::Programming,
            "artifact depends without device_type",
        )
    })?;
    if !device_types.iter().any(|t| t == device_type) {
        error!(device_type, "artifact device type doesn't match");
        return Ok(false);
    }

    for (key, allowed) in depends {
        if key == "device_type" {
            continue;
        }
        match provides.get(key) {
            None => {
                error!(key, "missing key in provides, required by artifact depends");
                return Ok(false);
            }
            Some(value) if !allowed.iter().any(|a| a == value) => {
                error!(
                    key,
                    value, "provides value doesn't match any of the artifact depends"
                );
                return Ok(false);
            }
            Some(_) => {}
        }
    }

    Ok(true)
}

// ---------------------------------------------------------------------------
// DeviceContext
// ---------------------------------------------------------------------------

/// Device-wide state shared by every install driver.
pub struct DeviceContext {
    store: Arc<Store>,
    device_type_file: PathBuf,
}

impl DeviceContext {
    /// Create a context over an open store.
    pub fn new(store: Arc<Store>, device_type_file: impl Into<PathBuf>) -> Self {
        Self {
            store,
            device_type_file: device_type_file.into(),
        }
    }

    /// One-time startup maintenance: drop stale auth-token cache entries.
    pub fn initialize(&self) -> Result<()> {
        self.store.remove(AUTH_TOKEN_KEY).map_err(Error::from)?;
        self.store
            .remove(AUTH_TOKEN_INVALIDATOR_KEY)
            .map_err(Error::from)?;
        Ok(())
    }

    /// Shared handle to the underlying store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Read the device type from its file.
    ///
    /// The file holds exactly one `device_type=<type>` line; trailing content
    /// is a validation error.
    pub fn device_type(&self) -> Result<String> {
        let content = std::fs::read_to_string(&self.device_type_file).map_err(|err| {
            Error::new(
                ErrorKind::Io,
                format!(
                    "failed to read device type from '{}'",
                    self.device_type_file.display()
                ),
            )
            .with_source(err)
        })?;

        let mut lines = content.lines();
        let first = lines.next().unwrap_or("");
        let Some(device_type) = first.strip_prefix("device_type=") else {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("failed to parse device_type data '{first}'"),
            ));
        };
        if lines.any(|line| !line.is_empty()) {
            return Err(Error::new(ErrorKind::Validation, "trailing device_type data"));
        }
        Ok(device_type.to_string())
    }

    /// Load the provides map.
    pub fn load_provides(&self) -> Result<ProvidesData> {
        self.store
            .read_transaction(|txn| load_provides_txn(txn).map_err(StoreError::Domain))
            .map_err(Error::from)
    }

    /// Check whether an artifact's depends admit this device.
    pub fn matches_artifact_depends(&self, depends: &DependsData) -> Result<bool> {
        let device_type = self.device_type()?;
        let provides = self.load_provides()?;
        artifact_matches_context(&provides, &device_type, depends)
    }

    /// Rewrite the provides map for a committed artifact, atomically with
    /// whatever bookkeeping `txn_fn` performs (typically clearing the
    /// deployment state record).
    ///
    /// Provides algebra:
    /// * both absent — erase everything (name/group still set below),
    /// * provides absent — filter by clears only,
    /// * clears absent — legacy replace-everything (`["*"]`),
    /// * both present — filter by clears, then overlay provides.
    pub fn commit_artifact_data(
        &self,
        artifact_name: &str,
        artifact_group: &str,
        new_provides: Option<&ProvidesData>,
        clears_provides: Option<&ClearsProvidesData>,
        txn_fn: impl FnOnce(&mut Transaction<'_>) -> Result<()>,
    ) -> Result<()> {
        self.store
            .write_transaction(|txn| {
                let mut modified = load_provides_txn(txn).map_err(StoreError::Domain)?;

                match (new_provides, clears_provides) {
                    (None, None) => modified.clear(),
                    (None, Some(clears)) => {
                        filter_provides(&ProvidesData::new(), clears, &mut modified);
                    }
                    (Some(provides), None) => modified = provides.clone(),
                    (Some(provides), Some(clears)) => {
                        filter_provides(provides, clears, &mut modified);
                    }
                }

                if !artifact_name.is_empty() {
                    modified.insert("artifact_name".to_string(), artifact_name.to_string());
                }
                if !artifact_group.is_empty() {
                    modified.insert("artifact_group".to_string(), artifact_group.to_string());
                }

                let name = modified.get("artifact_name").cloned().unwrap_or_default();
                if name.is_empty() {
                    return Err(StoreError::Domain(Error::new(
                        ErrorKind::Programming,
                        "committing artifact data without an artifact name",
                    )));
                }
                txn.write(ARTIFACT_NAME_KEY, name.as_bytes())?;

                match modified.get("artifact_group") {
                    Some(group) if !group.is_empty() => {
                        txn.write(ARTIFACT_GROUP_KEY, group.as_bytes())?;
                    }
                    _ => txn.remove(ARTIFACT_GROUP_KEY)?,
                }

                let rest: BTreeMap<&String, &String> = modified
                    .iter()
                    .filter(|(k, _)| *k != "artifact_name" && *k != "artifact_group")
                    .collect();
                if rest.is_empty() {
                    txn.remove(ARTIFACT_PROVIDES_KEY)?;
                } else {
                    let serialized =
                        serde_json::to_vec(&rest).map_err(|err| StoreError::Corrupt(err.to_string()))?;
                    txn.write(ARTIFACT_PROVIDES_KEY, &serialized)?;
                }

                txn_fn(txn).map_err(StoreError::Domain)
            })
            .map_err(Error::from)
    }
}

/// Load the provides map inside an open transaction.
pub fn load_provides_txn(txn: &Transaction<'_>) -> Result<ProvidesData> {
    let mut provides = ProvidesData::new();

    if let Some(name) = txn
        .read_string_opt(ARTIFACT_NAME_KEY)
        .map_err(Error::from)?
        .filter(|s| !s.is_empty())
    {
        provides.insert("artifact_name".to_string(), name);
    }
    if let Some(group) = txn
        .read_string_opt(ARTIFACT_GROUP_KEY)
        .map_err(Error::from)?
        .filter(|s| !s.is_empty())
    {
        provides.insert("artifact_group".to_string(), group);
    }

    let Some(raw) = txn
        .read_string_opt(ARTIFACT_PROVIDES_KEY)
        .map_err(Error::from)?
    else {
        return Ok(provides);
    };
    if raw.is_empty() {
        return Ok(provides);
    }

    let doc: Value = serde_json::from_str(&raw)
        .map_err(|err| Error::new(ErrorKind::DatabaseValue, err.to_string()))?;
    let Value::Object(obj) = doc else {
        return Err(Error::new(
            ErrorKind::DatabaseValue,
            "stored provides is not a JSON object",
        ));
    };
    for (key, value) in obj {
        let Value::String(s) = value else {
            return Err(Error::new(
                ErrorKind::DatabaseValue,
                "unexpected non-string data in provides",
            ));
        };
        provides.insert(key, s);
    }
    Ok(provides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn context_with_device_type(device_type_line: &str) -> (tempfile::TempDir, DeviceContext) {
        let dir = tempfile::tempdir().unwrap();
        let dt_path = dir.path().join("device_type");
        let mut f = std::fs::File::create(&dt_path).unwrap();
        write!(f, "{device_type_line}").unwrap();
        let ctx = DeviceContext::new(Arc::new(Store::in_memory()), &dt_path);
        (dir, ctx)
    }

    fn provides(pairs: &[(&str, &str)]) -> ProvidesData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // -- wildcard matching ------------------------------------------------

    #[test]
    fn clears_wildcard_table() {
        assert!(clears_match("a.b.c", "a.*"));
        assert!(clears_match("a.b.c", "*.c"));
        assert!(clears_match("a.b.c", "a*c"));
        assert!(!clears_match("a.b.c", "a.x"));
        assert!(clears_match("anything", "*"));
        assert!(clears_match("rootfs-image.checksum", "rootfs-image.*"));
        assert!(!clears_match("data-partition.checksum", "rootfs-image.*"));
        assert!(clears_match("exact", "exact"));
        assert!(!clears_match("exact2", "exact"));
        assert!(clears_match("", ""));
        assert!(!clears_match("x", ""));
        assert!(clears_match("abcabc", "a*b*c"));
    }

    #[test]
    fn middle_fragments_do_not_overlap() {
        // "aa" must be found twice in sequence.
        assert!(clears_match("aaaa", "*aa*aa*"));
        assert!(!clears_match("aaa", "*aa*aa*"));
    }

    // -- filter/commit algebra --------------------------------------------

    #[test]
    fn filter_clears_then_overlays() {
        let mut existing = provides(&[
            ("rootfs-image.checksum", "old"),
            ("rootfs-image.version", "v1"),
            ("data.thing", "keep"),
        ]);
        let new = provides(&[("rootfs-image.checksum", "new")]);
        filter_provides(&new, &vec!["rootfs-image.*".to_string()], &mut existing);
        assert_eq!(
            existing,
            provides(&[("rootfs-image.checksum", "new"), ("data.thing", "keep")])
        );
    }

    #[test]
    fn commit_both_missing_erases_all() {
        let (_dir, ctx) = context_with_device_type("device_type=test-device\n");
        ctx.commit_artifact_data("v1", "", Some(&provides(&[("extra", "x")])), None, |_| Ok(()))
            .unwrap();
        ctx.commit_artifact_data("v2", "", None, None, |_| Ok(())).unwrap();
        let loaded = ctx.load_provides().unwrap();
        assert_eq!(loaded, provides(&[("artifact_name", "v2")]));
    }

    #[test]
    fn commit_missing_clears_replaces_everything() {
        let (_dir, ctx) = context_with_device_type("device_type=test-device\n");
        ctx.commit_artifact_data("v1", "grp", Some(&provides(&[("a", "1")])), None, |_| Ok(()))
            .unwrap();
        ctx.commit_artifact_data("v2", "", Some(&provides(&[("b", "2")])), None, |_| Ok(()))
            .unwrap();
        let loaded = ctx.load_provides().unwrap();
        // Replace-everything also drops the group the previous artifact set.
        assert_eq!(loaded, provides(&[("artifact_name", "v2"), ("b", "2")]));
    }

    #[test]
    fn commit_missing_provides_filters_only() {
        let (_dir, ctx) = context_with_device_type("device_type=test-device\n");
        ctx.commit_artifact_data(
            "v1",
            "",
            Some(&provides(&[("keep.me", "1"), ("drop.me", "2")])),
            Some(&vec![]),
            |_| Ok(()),
        )
        .unwrap();
        ctx.commit_artifact_data("v2", "", None, Some(&vec!["drop.*".to_string()]), |_| Ok(()))
            .unwrap();
        let loaded = ctx.load_provides().unwrap();
        assert_eq!(
            loaded,
            provides(&[("artifact_name", "v2"), ("keep.me", "1")])
        );
    }

    #[test]
    fn commit_standard_case_matches_invariant() {
        let (_dir, ctx) = context_with_device_type("device_type=test-device\n");
        ctx.commit_artifact_data(
            "v1",
            "",
            Some(&provides(&[("rootfs-image.checksum", "old"), ("other", "o")])),
            Some(&vec![]),
            |_| Ok(()),
        )
        .unwrap();
        ctx.commit_artifact_data(
            "v2",
            "release",
            Some(&provides(&[("rootfs-image.checksum", "new")])),
            Some(&vec!["rootfs-image.*".to_string()]),
            |_| Ok(()),
        )
        .unwrap();
        let loaded = ctx.load_provides().unwrap();
        assert_eq!(
            loaded,
            provides(&[
                ("artifact_name", "v2"),
                ("artifact_group", "release"),
                ("rootfs-image.checksum", "new"),
                ("other", "o"),
            ])
        );
    }

    #[test]
    fn commit_without_name_anywhere_is_programming_error() {
        let (_dir, ctx) = context_with_device_type("device_type=test-device\n");
        let err = ctx
            .commit_artifact_data("", "", None, None, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Programming);
    }

    #[test]
    fn commit_runs_txn_fn_atomically() {
        let (_dir, ctx) = context_with_device_type("device_type=test-device\n");
        let err = ctx
            .commit_artifact_data("v1", "", None, None, |_| {
                Err(Error::new(ErrorKind::Io, "forced"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        // The aborted transaction must not have committed the name.
        assert!(ctx.load_provides().unwrap().is_empty());
    }

    // -- depends matching --------------------------------------------------

    fn depends(pairs: &[(&str, &[&str])]) -> DependsData {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    #[test]
    fn depends_matching_device_type() {
        let p = provides(&[("artifact_name", "v1")]);
        let d = depends(&[("device_type", &["test-device", "other"])]);
        assert!(artifact_matches_context(&p, "test-device", &d).unwrap());
        assert!(!artifact_matches_context(&p, "third", &d).unwrap());
    }

    #[test]
    fn depends_requires_provides_key() {
        let p = provides(&[("artifact_name", "v1")]);
        let d = depends(&[
            ("device_type", &["dev"]),
            ("rootfs-image.checksum", &["abc"]),
        ]);
        assert!(!artifact_matches_context(&p, "dev", &d).unwrap());

        let p2 = provides(&[("artifact_name", "v1"), ("rootfs-image.checksum", "abc")]);
        assert!(artifact_matches_context(&p2, "dev", &d).unwrap());

        let p3 = provides(&[("artifact_name", "v1"), ("rootfs-image.checksum", "zzz")]);
        assert!(!artifact_matches_context(&p3, "dev", &d).unwrap());
    }

    #[test]
    fn depends_without_artifact_name_in_provides_is_error() {
        let p = ProvidesData::new();
        let d = depends(&[("device_type", &["dev"])]);
        let err = artifact_matches_context(&p, "dev", &d).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    // -- device type -------------------------------------------------------

    #[test]
    fn device_type_parses_single_line() {
        let (_dir, ctx) = context_with_device_type("device_type=raspberrypi4\n");
        assert_eq!(ctx.device_type().unwrap(), "raspberrypi4");
    }

    #[test]
    fn device_type_rejects_garbage() {
        let (_dir, ctx) = context_with_device_type("devicetype=oops\n");
        assert_eq!(ctx.device_type().unwrap_err().kind(), ErrorKind::Parse);
    }

    #[test]
    fn device_type_rejects_trailing_data() {
        let (_dir, ctx) = context_with_device_type("device_type=dev\nmore\n");
        assert_eq!(ctx.device_type().unwrap_err().kind(), ErrorKind::Validation);
    }

    // -- init --------------------------------------------------------------

    #[test]
    fn initialize_removes_stale_tokens() {
        let (_dir, ctx) = context_with_device_type("device_type=dev\n");
        ctx.store().write(AUTH_TOKEN_KEY, b"stale").unwrap();
        ctx.initialize().unwrap();
        assert!(ctx.store().read(AUTH_TOKEN_KEY).unwrap_err().is_key_not_found());
    }
}
