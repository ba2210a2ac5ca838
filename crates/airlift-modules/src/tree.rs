// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-deployment scratch tree handed to update modules.
//!
//! Layout (module's view, read-only except `tmp/`):
//!
//! ```text
//! version                  "3\n"
//! current_artifact_name    "<name>\n"
//! current_artifact_group   "<group>\n"   (only if set)
//! current_device_type      "<type>\n"
//! header/artifact_name
//! header/artifact_group
//! header/payload_type
//! header/header_info       raw JSON as shipped
//! header/type_info         raw JSON as shipped
//! header/meta-data         raw JSON as shipped, if present
//! files/                   payload files (or size sidecars + streams)
//! tmp/                     module-owned scratch
//! ```

use airlift_error::{Error, ErrorKind, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Module file-tree format version.
const TREE_VERSION: &str = "3";

/// Everything needed to lay out a scratch tree.
#[derive(Debug, Clone, Default)]
pub struct TreeContext {
    /// Artifact name currently installed on the device.
    pub current_artifact_name: String,
    /// Artifact group currently installed on the device, empty when unset.
    pub current_artifact_group: String,
    /// Device type.
    pub device_type: String,
    /// Name of the incoming artifact.
    pub artifact_name: String,
    /// Group of the incoming artifact, empty when unset.
    pub artifact_group: String,
    /// Payload type of the incoming artifact.
    pub payload_type: String,
    /// `header-info` exactly as shipped.
    pub raw_header_info: String,
    /// `type-info` exactly as shipped.
    pub raw_type_info: String,
    /// `meta-data` exactly as shipped, when present.
    pub raw_meta_data: Option<String>,
}

/// A prepared scratch tree on disk.
#[derive(Debug, Clone)]
pub struct WorkTree {
    root: PathBuf,
}

impl WorkTree {
    /// Build (or rebuild) the tree at `root`.
    ///
    /// A leftover tree from an interrupted deployment is removed first.
    pub fn prepare(root: impl Into<PathBuf>, ctx: &TreeContext) -> Result<Self> {
        let root = root.into();
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(root.join("header"))?;
        std::fs::create_dir_all(root.join("files"))?;
        std::fs::create_dir_all(root.join("tmp"))?;

        std::fs::write(root.join("version"), format!("{TREE_VERSION}\n"))?;
        std::fs::write(
            root.join("current_artifact_name"),
            format!("{}\n", ctx.current_artifact_name),
        )?;
        if !ctx.current_artifact_group.is_empty() {
            std::fs::write(
                root.join("current_artifact_group"),
                format!("{}\n", ctx.current_artifact_group),
            )?;
        }
        std::fs::write(
            root.join("current_device_type"),
            format!("{}\n", ctx.device_type),
        )?;

        std::fs::write(root.join("header/artifact_name"), &ctx.artifact_name)?;
        std::fs::write(root.join("header/artifact_group"), &ctx.artifact_group)?;
        std::fs::write(root.join("header/payload_type"), &ctx.payload_type)?;
        std::fs::write(root.join("header/header_info"), &ctx.raw_header_info)?;
        std::fs::write(root.join("header/type_info"), &ctx.raw_type_info)?;
        if let Some(ref meta) = ctx.raw_meta_data {
            std::fs::write(root.join("header/meta-data"), meta)?;
        }

        Ok(Self { root })
    }

    /// Open an already prepared tree (crash recovery).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::new(
                ErrorKind::Validation,
                format!("file tree does not exist: {}", root.display()),
            ));
        }
        Ok(Self { root })
    }

    /// Tree root (the module's working directory).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `files/` directory payload files land in.
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    /// Copy one payload file into `files/`, returning the byte count.
    pub fn stage_file(&self, name: &str, reader: &mut dyn Read) -> Result<u64> {
        let path = self.checked_file_path(name)?;
        let mut file = std::fs::File::create(&path)?;
        let written = std::io::copy(reader, &mut file)?;
        Ok(written)
    }

    /// Write the `<name>.size` sidecar used when the module streams payload
    /// files itself.
    pub fn write_size_sidecar(&self, name: &str, size: u64) -> Result<()> {
        let path = self.checked_file_path(&format!("{name}.size"))?;
        std::fs::write(path, format!("{size}\n"))?;
        Ok(())
    }

    /// Create the named pipe a self-streaming module reads `name` from.
    #[cfg(unix)]
    pub fn create_stream_fifo(&self, name: &str) -> Result<PathBuf> {
        let path = self.checked_file_path(name)?;
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600))
            .map_err(|err| Error::new(ErrorKind::Io, format!("mkfifo {}: {err}", path.display())))?;
        Ok(path)
    }

    /// Remove the whole tree.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn checked_file_path(&self, name: &str) -> Result<PathBuf> {
        if name.contains('/') || name == ".." {
            return Err(Error::new(
                ErrorKind::Validation,
                format!("payload file name '{name}' must not contain path separators"),
            ));
        }
        Ok(self.files_dir().join(name))
    }
}
