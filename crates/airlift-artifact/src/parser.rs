// SPDX-License-Identifier: MIT OR Apache-2.0
//! The streaming artifact parser.
//!
//! The outer tar must contain, in this exact order: `version`, `manifest`,
//! optionally `manifest.sig`, `header.tar[.gz|.xz|.zst]`, then the payload
//! `data/0000.tar[.gz|.xz|.zst]`.  Parsing is a state machine keyed on the
//! expected next filename; any other entry is a parse error.  [`parse`]
//! consumes the stream through the header (verifying the manifest signature
//! on the way); the payload is then pulled file-by-file so it can be fed to
//! an update module without ever buffering it whole.

use crate::digest::{DigestReader, sha256};
use crate::header::{ArtifactHeader, HeaderInfo, TypeInfo, validate_meta_data};
use crate::manifest::Manifest;
use crate::verify::{VerifyKey, decode_signature, verify_with_any};
use airlift_error::{Error, ErrorKind, Result};
use crate::tar_stream::{EntryReader, TarStream};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

const MAX_VERSION_SIZE: u64 = 4 << 10;
const MAX_MANIFEST_SIZE: u64 = 4 << 20;
const MAX_SIGNATURE_SIZE: u64 = 64 << 10;
const MAX_HEADER_FILE_SIZE: u64 = 1 << 20;
const MAX_SCRIPT_SIZE: u64 = 8 << 20;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Signature verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyPolicy {
    /// Verify when both a signature and keys are available; warn otherwise.
    #[default]
    IfPossible,
    /// A valid signature is mandatory.
    Required,
    /// Never verify; warn when a signature is present.
    Skip,
}

/// Parser configuration.
#[derive(Default)]
pub struct ParserConfig {
    /// Public keys accepted for manifest verification, tried in order.
    pub artifact_verify_keys: Vec<PathBuf>,
    /// Signature policy.
    pub verify_signature: VerifyPolicy,
    /// Directory the artifact's state scripts are written into.
    pub artifact_scripts_dir: Option<PathBuf>,
}

/// Version of the state-script format shipped in artifacts.
const ARTIFACT_SCRIPTS_VERSION: u32 = 3;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn unexpected_token(got: &str, expected: &str) -> Error {
    Error::new(
        ErrorKind::Parse,
        format!("Got unexpected token '{got}' expected '{expected}'"),
    )
}

type PayloadTar<'a, R> = TarStream<Decompressor<DigestReader<EntryReader<'a, R>>>>;

/// A parsed artifact, positioned just before its payload.
pub struct Artifact<R> {
    outer: ManifestedStream<R>,
    header: ArtifactHeader,
    payload_consumed: bool,
}

/// Parse and verify everything up to and including the header.
pub fn parse<R: Read>(reader: R, config: &ParserConfig) -> Result<Artifact<R>> {
    let mut outer = TarStream::new(reader);

    // version
    let meta = outer
        .next_entry()?
        .ok_or_else(|| Error::new(ErrorKind::Parse, "empty artifact"))?;
    if meta.name != "version" {
        return Err(unexpected_token(&meta.name, "version"));
    }
    let version_bytes = outer.read_entry_to_vec(MAX_VERSION_SIZE)?;
    check_version(&version_bytes)?;

    // manifest
    let meta = outer
        .next_entry()?
        .ok_or_else(|| unexpected_token("EOF", "manifest"))?;
    if meta.name != "manifest" {
        return Err(unexpected_token(&meta.name, "manifest"));
    }
    let manifest = Manifest::parse(outer.read_entry_to_vec(MAX_MANIFEST_SIZE)?)?;

    // The version file streamed before the manifest existed; check it now.
    if sha256(&version_bytes) != manifest.digest_of("version")? {
        return Err(Error::new(
            ErrorKind::Parse,
            "checksum mismatch for 'version'",
        ));
    }

    // manifest.sig (optional), then header.tar[.*]
    let meta = outer
        .next_entry()?
        .ok_or_else(|| unexpected_token("EOF", "header.tar"))?;
    let header_meta = if meta.name == "manifest.sig" {
        let signature_b64 = outer.read_entry_to_vec(MAX_SIGNATURE_SIZE)?;
        verify_signature(config, manifest.raw(), Some(&signature_b64))?;
        outer
            .next_entry()?
            .ok_or_else(|| unexpected_token("EOF", "header.tar"))?
    } else {
        verify_signature(config, manifest.raw(), None)?;
        meta
    };

    if !header_meta.name.starts_with("header.tar") {
        return Err(unexpected_token(&header_meta.name, "header.tar"));
    }
    let expected_digest = manifest.digest_of(&header_meta.name)?;
    let digest_reader = DigestReader::new(outer.entry_reader(), &header_meta.name, expected_digest);
    let decompressor = Decompressor::for_name(digest_reader, &header_meta.name)?;
    let mut inner = TarStream::new(decompressor);

    let header = parse_header_tar(&mut inner, config)?;

    inner.drain()?;
    inner.into_inner().into_inner().finish()?;

    debug!(
        artifact_name = header.artifact_name(),
        payload_type = header.payload_type(),
        "artifact header parsed"
    );

    Ok(Artifact {
        outer: ManifestedStream::wrap(outer, manifest),
        header,
        payload_consumed: false,
    })
}

fn check_version(bytes: &[u8]) -> Result<()> {
    #[derive(serde::Deserialize)]
    struct Version {
        format: String,
        version: i64,
    }
    let version: Version = serde_json::from_slice(bytes)
        .map_err(|err| Error::new(ErrorKind::Parse, format!("version: {err}")))?;
    if version.format != "mender" {
        return Err(Error::new(
            ErrorKind::Validation,
            format!("unsupported artifact format '{}'", version.format),
        ));
    }
    if version.version != 3 {
        return Err(Error::new(
            ErrorKind::Validation,
            format!("unsupported artifact version {}", version.version),
        ));
    }
    Ok(())
}

fn verify_signature(
    config: &ParserConfig,
    manifest_raw: &[u8],
    signature_b64: Option<&[u8]>,
) -> Result<()> {
    match config.verify_signature {
        VerifyPolicy::Skip => {
            if signature_b64.is_some() {
                warn!("artifact is signed but signature verification is disabled");
            }
            return Ok(());
        }
        VerifyPolicy::Required if signature_b64.is_none() => {
            return Err(Error::new(
                ErrorKind::Signature,
                "artifact is unsigned but a signature is required",
            ));
        }
        VerifyPolicy::Required if config.artifact_verify_keys.is_empty() => {
            return Err(Error::new(
                ErrorKind::Signature,
                "signature verification required but no verify keys are configured",
            ));
        }
        _ => {}
    }

    let Some(signature_b64) = signature_b64 else {
        if !config.artifact_verify_keys.is_empty() {
            warn!("verify keys are configured but the artifact is unsigned");
        }
        return Ok(());
    };
    if config.artifact_verify_keys.is_empty() {
        warn!("artifact is signed but no verify keys are configured");
        return Ok(());
    }

    let keys = config
        .artifact_verify_keys
        .iter()
        .map(|path| VerifyKey::from_file(path))
        .collect::<Result<Vec<_>>>()?;
    let signature = decode_signature(signature_b64)?;
    verify_with_any(&keys, manifest_raw, &signature)
}

fn parse_header_tar<R: Read>(
    inner: &mut TarStream<R>,
    config: &ParserConfig,
) -> Result<ArtifactHeader> {
    // header-info comes first.
    let meta = inner
        .next_entry()?
        .ok_or_else(|| unexpected_token("EOF", "header-info"))?;
    if meta.name != "header-info" {
        return Err(unexpected_token(&meta.name, "header-info"));
    }
    let raw_header_info =
        String::from_utf8(inner.read_entry_to_vec(MAX_HEADER_FILE_SIZE)?)
            .map_err(|_| Error::new(ErrorKind::Parse, "header-info is not UTF-8"))?;
    let info = HeaderInfo::parse(&raw_header_info)?;

    // Optional scripts, then headers/0000/type-info, then optional meta-data.
    let mut scripts_written = false;
    let mut raw_type_info: Option<String> = None;
    let mut raw_meta_data: Option<String> = None;

    while let Some(meta) = inner.next_entry()? {
        if meta.is_dir {
            continue;
        }
        if let Some(script_name) = meta.name.strip_prefix("scripts/") {
            if raw_type_info.is_some() {
                return Err(unexpected_token(&meta.name, "headers/0000/meta-data"));
            }
            write_script(inner, config, script_name, &mut scripts_written)?;
            continue;
        }
        if let Some(rest) = meta.name.strip_prefix("headers/") {
            let Some((index, file)) = rest.split_once('/') else {
                return Err(unexpected_token(&meta.name, "headers/0000/type-info"));
            };
            if index != "0000" {
                return Err(Error::new(
                    ErrorKind::Parse,
                    format!("Unexpected index order: expected 0000, got {index}"),
                ));
            }
            match file {
                "type-info" => {
                    if raw_type_info.is_some() {
                        return Err(unexpected_token(&meta.name, "headers/0000/meta-data"));
                    }
                    let raw = String::from_utf8(inner.read_entry_to_vec(MAX_HEADER_FILE_SIZE)?)
                        .map_err(|_| Error::new(ErrorKind::Parse, "type-info is not UTF-8"))?;
                    raw_type_info = Some(raw);
                }
                "meta-data" => {
                    if raw_type_info.is_none() {
                        return Err(unexpected_token(&meta.name, "headers/0000/type-info"));
                    }
                    if raw_meta_data.is_some() {
                        return Err(unexpected_token(&meta.name, "EOF"));
                    }
                    let raw = String::from_utf8(inner.read_entry_to_vec(MAX_HEADER_FILE_SIZE)?)
                        .map_err(|_| Error::new(ErrorKind::Parse, "meta-data is not UTF-8"))?;
                    raw_meta_data = Some(raw);
                }
                other => {
                    return Err(unexpected_token(other, "type-info"));
                }
            }
            continue;
        }
        return Err(unexpected_token(&meta.name, "headers/0000/type-info"));
    }

    let raw_type_info =
        raw_type_info.ok_or_else(|| unexpected_token("EOF", "headers/0000/type-info"))?;
    let type_info = TypeInfo::parse(&raw_type_info)?;

    let meta_data = match raw_meta_data {
        Some(ref raw) => {
            let doc: serde_json::Value = serde_json::from_str(raw)
                .map_err(|err| Error::new(ErrorKind::Parse, format!("meta-data: {err}")))?;
            validate_meta_data(&doc)?;
            Some(doc)
        }
        None => None,
    };

    let header = ArtifactHeader {
        info,
        type_info,
        meta_data,
        raw_header_info,
        raw_type_info,
        raw_meta_data,
    };

    // The payload types named by header-info and type-info must agree.
    let info_type = header.info.payloads[0].payload_type.clone().unwrap_or_default();
    let type_info_type = header.type_info.payload_type.clone().unwrap_or_default();
    if info_type != type_info_type {
        return Err(Error::new(
            ErrorKind::Validation,
            format!("payload type mismatch: header-info '{info_type}', type-info '{type_info_type}'"),
        ));
    }
    if header.is_empty_payload() && header.meta_data.is_some() {
        return Err(Error::new(
            ErrorKind::Validation,
            "empty-payload artifact must not carry meta-data",
        ));
    }

    Ok(header)
}

fn write_script<R: Read>(
    inner: &mut TarStream<R>,
    config: &ParserConfig,
    script_name: &str,
    scripts_written: &mut bool,
) -> Result<()> {
    let Some(ref dir) = config.artifact_scripts_dir else {
        // No scripts dir configured (e.g. `show-artifact`); discard.
        inner.read_entry_to_vec(MAX_SCRIPT_SIZE)?;
        return Ok(());
    };
    if script_name.contains('/') {
        return Err(Error::new(
            ErrorKind::Validation,
            format!("state script '{script_name}' must not contain path separators"),
        ));
    }
    if !*scripts_written {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join("version"),
            format!("{ARTIFACT_SCRIPTS_VERSION}\n"),
        )?;
        *scripts_written = true;
    }
    let path = dir.join(script_name);
    let mut file = std::fs::File::create(&path)?;
    std::io::copy(&mut inner.entry_reader().take(MAX_SCRIPT_SIZE), &mut file)?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }
    debug!(script = script_name, "state script extracted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Payload streaming
// ---------------------------------------------------------------------------

impl<R: Read> Artifact<R> {
    /// The parsed header.
    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    /// Advance to the payload.
    ///
    /// The first call yields the single payload (or `None` for an
    /// empty-payload artifact); a second call verifies the stream ends and
    /// rejects extra payloads.
    pub fn next_payload(&mut self) -> Result<Option<Payload<'_, R>>> {
        if self.payload_consumed {
            return match self.outer.stream.next_entry()? {
                Some(meta) => Err(Error::new(
                    ErrorKind::Validation,
                    format!("multiple payloads are not supported (got '{}')", meta.name),
                )),
                None => Ok(None),
            };
        }
        self.payload_consumed = true;

        let meta = match self.outer.stream.next_entry()? {
            Some(meta) => meta,
            None => {
                if self.header.is_empty_payload() {
                    return Ok(None);
                }
                return Err(unexpected_token("EOF", "data/0000.tar"));
            }
        };
        check_data_entry_name(&meta.name)?;

        let expected = self.outer.manifest.digest_of(&meta.name)?;
        let digest_reader =
            DigestReader::new(self.outer.stream.entry_reader(), &meta.name, expected);
        let decompressor = Decompressor::for_name(digest_reader, &meta.name)?;
        let tar = TarStream::new(decompressor);

        if self.header.is_empty_payload() {
            // Tolerated only when it carries nothing.
            let mut payload = Payload { tar: Some(tar) };
            if payload.next_file()?.is_some() {
                return Err(Error::new(
                    ErrorKind::Validation,
                    "empty-payload artifact carries payload files",
                ));
            }
            return Ok(None);
        }

        Ok(Some(Payload { tar: Some(tar) }))
    }
}

fn check_data_entry_name(name: &str) -> Result<()> {
    let Some(rest) = name.strip_prefix("data/") else {
        return Err(unexpected_token(name, "data/0000.tar"));
    };
    let Some((index, _)) = rest.split_once(".tar") else {
        return Err(unexpected_token(name, "data/0000.tar"));
    };
    if index.len() == 4 && index.chars().all(|c| c.is_ascii_digit()) {
        if index != "0000" {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("Unexpected index order: expected 0000, got {index}"),
            ));
        }
        Ok(())
    } else {
        Err(unexpected_token(name, "data/0000.tar"))
    }
}

/// The single payload: an ordered stream of files.
pub struct Payload<'a, R: Read> {
    tar: Option<PayloadTar<'a, R>>,
}

impl<'a, R: Read> Payload<'a, R> {
    /// Advance to the next payload file.
    ///
    /// Returning `Ok(None)` means every file was streamed *and* the payload's
    /// checksum matched the manifest; a mismatch surfaces here or as a read
    /// error, never as silent truncation.
    pub fn next_file(&mut self) -> Result<Option<PayloadFile<'_, 'a, R>>> {
        let Some(tar) = self.tar.as_mut() else {
            return Ok(None);
        };
        loop {
            match tar.next_entry()? {
                Some(meta) if meta.is_dir => continue,
                Some(meta) => {
                    return Ok(Some(PayloadFile {
                        name: meta.name,
                        size: meta.size,
                        payload: self,
                    }));
                }
                None => {
                    let mut tar = self.tar.take().expect("payload tar present");
                    tar.drain()?;
                    tar.into_inner().into_inner().finish()?;
                    return Ok(None);
                }
            }
        }
    }
}

/// One file inside the payload.
pub struct PayloadFile<'p, 'a, R: Read> {
    /// File name as stored in the payload tar.
    pub name: String,
    /// File size in bytes.
    pub size: u64,
    payload: &'p mut Payload<'a, R>,
}

impl<R: Read> Read for PayloadFile<'_, '_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(tar) = self.payload.tar.as_mut() else {
            return Ok(0);
        };
        tar.entry_reader().read(buf)
    }
}

// ---------------------------------------------------------------------------
// Compression dispatch
// ---------------------------------------------------------------------------

/// Decompressor selected by the entry's file extension.
pub enum Decompressor<R: Read> {
    /// Uncompressed `.tar`.
    Plain(R),
    /// `.tar.gz`
    Gz(flate2::read::GzDecoder<R>),
    /// `.tar.xz`
    Xz(xz2::read::XzDecoder<R>),
    /// `.tar.zst`
    Zst(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Decompressor<R> {
    /// Pick the decompressor for a `*.tar[.gz|.xz|.zst]` entry name.
    pub fn for_name(inner: R, name: &str) -> Result<Self> {
        if name.ends_with(".tar") {
            Ok(Decompressor::Plain(inner))
        } else if name.ends_with(".tar.gz") {
            Ok(Decompressor::Gz(flate2::read::GzDecoder::new(inner)))
        } else if name.ends_with(".tar.xz") {
            Ok(Decompressor::Xz(xz2::read::XzDecoder::new(inner)))
        } else if name.ends_with(".tar.zst") {
            let decoder = zstd::stream::read::Decoder::new(inner)
                .map_err(|err| Error::new(ErrorKind::Io, err.to_string()))?;
            Ok(Decompressor::Zst(decoder))
        } else {
            Err(Error::new(
                ErrorKind::Parse,
                format!("unsupported compression for '{name}'"),
            ))
        }
    }

    /// Unwrap back to the raw reader.
    pub fn into_inner(self) -> R {
        match self {
            Decompressor::Plain(inner) => inner,
            Decompressor::Gz(decoder) => decoder.into_inner(),
            Decompressor::Xz(decoder) => decoder.into_inner(),
            Decompressor::Zst(decoder) => decoder.finish().into_inner(),
        }
    }
}

impl<R: Read> Read for Decompressor<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Decompressor::Plain(inner) => inner.read(buf),
            Decompressor::Gz(decoder) => decoder.read(buf),
            Decompressor::Xz(decoder) => decoder.read(buf),
            Decompressor::Zst(decoder) => decoder.read(buf),
        }
    }
}

// ---------------------------------------------------------------------------
// Outer stream + manifest bundle
// ---------------------------------------------------------------------------

struct ManifestedStream<R> {
    stream: TarStream<R>,
    manifest: Manifest,
}

impl<R> ManifestedStream<R> {
    fn wrap(stream: TarStream<R>, manifest: Manifest) -> Self {
        Self { stream, manifest }
    }
}
