// SPDX-License-Identifier: MIT OR Apache-2.0
//! Streaming parser for signed airlift update artifacts.
//!
//! An artifact is a layered tar bundle: a small `version` document, a
//! `manifest` of SHA-256 digests, an optional detached signature over the
//! manifest, a metadata tarball, and a single payload tarball.  The parser
//! never holds the payload in memory; it exposes the payload as a pull
//! stream of files whose digests are enforced as the bytes flow past.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod digest;
mod header;
mod manifest;
mod parser;
mod tar_stream;
mod verify;

#[cfg(feature = "testutil")]
pub mod testutil;

pub use header::{
    ArtifactHeader, HeaderDepends, HeaderInfo, HeaderProvides, OneOrMany, PayloadInfo, TypeInfo,
    validate_meta_data,
};
pub use manifest::Manifest;
pub use parser::{Artifact, Decompressor, ParserConfig, Payload, PayloadFile, VerifyPolicy, parse};
pub use verify::{VerifyKey, decode_signature, verify_with_any};
