// SPDX-License-Identifier: MIT OR Apache-2.0
//! Running SHA-256 enforcement over streamed artifact entries.

use airlift_error::{Error, ErrorKind, Result};
use sha2::{Digest, Sha256};
use std::io::Read;

/// Reader that hashes every byte passing through it and compares the final
/// digest against the manifest entry for the file.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
    expected: [u8; 32],
    name: String,
}

impl<R: Read> DigestReader<R> {
    /// Wrap `inner`; `expected` is the manifest digest for `name`.
    pub fn new(inner: R, name: impl Into<String>, expected: [u8; 32]) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected,
            name: name.into(),
        }
    }

    /// Drain any unread bytes, then check the digest.
    ///
    /// Must be called exactly once, after the consumer is done with the
    /// wrapped stream; a mismatch is fatal for the whole artifact.
    pub fn finish(mut self) -> Result<()> {
        std::io::copy(&mut self, &mut std::io::sink())?;
        let actual: [u8; 32] = self.hasher.finalize().into();
        if actual != self.expected {
            return Err(Error::new(
                ErrorKind::Parse,
                format!(
                    "checksum mismatch for '{}': expected {}, got {}",
                    self.name,
                    hex::encode(self.expected),
                    hex::encode(actual)
                ),
            ));
        }
        Ok(())
    }

}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// SHA-256 of a fully buffered blob.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
