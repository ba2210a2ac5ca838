// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact manifest: the digest list every later file is checked against.

use airlift_error::{Error, ErrorKind, Result};
use std::collections::BTreeMap;

/// Parsed manifest plus the exact bytes it was parsed from.
///
/// The raw bytes are kept because the detached signature covers them as-is;
/// re-serializing would change what gets verified.
#[derive(Debug, Clone)]
pub struct Manifest {
    raw: Vec<u8>,
    digests: BTreeMap<String, [u8; 32]>,
}

impl Manifest {
    /// Parse `<64 hex chars><two spaces><relative path>` lines.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::new(ErrorKind::Parse, "manifest is not ASCII"))?;

        let mut digests = BTreeMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((digest_hex, name)) = line.split_once("  ") else {
                return Err(Error::new(
                    ErrorKind::Parse,
                    format!("malformed manifest line '{line}'"),
                ));
            };
            if digest_hex.len() != 64 || name.is_empty() {
                return Err(Error::new(
                    ErrorKind::Parse,
                    format!("malformed manifest line '{line}'"),
                ));
            }
            let bytes = hex::decode(digest_hex)
                .map_err(|_| Error::new(ErrorKind::Parse, format!("bad manifest digest '{digest_hex}'")))?;
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&bytes);
            digests.insert(name.to_string(), digest);
        }
        Ok(Self { raw, digests })
    }

    /// Digest recorded for `name`, or a validation error when absent.
    pub fn digest_of(&self, name: &str) -> Result<[u8; 32]> {
        self.digests.get(name).copied().ok_or_else(|| {
            Error::new(
                ErrorKind::Validation,
                format!("file '{name}' not listed in the manifest"),
            )
        })
    }

    /// The exact bytes the signature covers.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256;

    #[test]
    fn parses_lines_with_two_spaces() {
        let digest = hex::encode(sha256(b"x"));
        let raw = format!("{digest}  version\n{digest}  data/0000.tar.gz\n");
        let manifest = Manifest::parse(raw.into_bytes()).unwrap();
        assert_eq!(manifest.digest_of("version").unwrap(), sha256(b"x"));
        assert_eq!(manifest.digest_of("data/0000.tar.gz").unwrap(), sha256(b"x"));
    }

    #[test]
    fn missing_file_is_validation_error() {
        let manifest = Manifest::parse(Vec::new()).unwrap();
        let err = manifest.digest_of("header.tar.gz").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn rejects_single_space_separator() {
        let digest = hex::encode(sha256(b"x"));
        let raw = format!("{digest} version\n");
        assert!(Manifest::parse(raw.into_bytes()).is_err());
    }

    #[test]
    fn rejects_short_digest() {
        let raw = b"abcd  version\n".to_vec();
        assert!(Manifest::parse(raw).is_err());
    }

    #[test]
    fn raw_bytes_are_preserved_verbatim() {
        let digest = hex::encode(sha256(b"x"));
        let raw = format!("{digest}  version"); // no trailing newline
        let manifest = Manifest::parse(raw.clone().into_bytes()).unwrap();
        assert_eq!(manifest.raw(), raw.as_bytes());
    }
}
