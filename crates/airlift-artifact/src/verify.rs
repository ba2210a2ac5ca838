// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest signature verification.
//!
//! A `manifest.sig` file holds the base64 of a detached signature over the
//! exact manifest bytes.  Three key families are accepted.  RSA and ECDSA
//! sign the SHA-256 digest of the manifest; Ed25519 signs the manifest bytes
//! directly.  ECDSA signatures are normally ASN.1 DER, but the historical
//! raw `r||s` 64-byte encoding is accepted as a fallback, trying big-endian
//! halves first and little-endian second.

use airlift_error::{Error, ErrorKind, Result};
use base64::Engine;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};
use signature::Verifier;
use std::path::Path;
use tracing::debug;

/// A public key accepted for manifest verification.
pub enum VerifyKey {
    /// RSA with PKCS#1 v1.5 padding over SHA-256.
    Rsa(Box<RsaPublicKey>),
    /// ECDSA over P-256 with SHA-256.
    Ecdsa(p256::ecdsa::VerifyingKey),
    /// Ed25519 over the raw message.
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl VerifyKey {
    /// Parse a PEM-encoded SubjectPublicKeyInfo (or PKCS#1 RSA) public key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
            return Ok(VerifyKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_pem(pem) {
            return Ok(VerifyKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = p256::PublicKey::from_public_key_pem(pem) {
            return Ok(VerifyKey::Ecdsa(p256::ecdsa::VerifyingKey::from(&key)));
        }
        if let Ok(key) = ed25519_dalek::VerifyingKey::from_public_key_pem(pem) {
            return Ok(VerifyKey::Ed25519(key));
        }
        Err(Error::new(
            ErrorKind::Signature,
            "public key is not RSA, ECDSA P-256, or Ed25519",
        ))
    }

    /// Load a key from a PEM file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|err| {
            Error::new(
                ErrorKind::Signature,
                format!("cannot read verify key '{}'", path.display()),
            )
            .with_source(err)
        })?;
        Self::from_pem(&pem).map_err(|err| err.context(path.display().to_string()))
    }

    /// Check `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self {
            VerifyKey::Rsa(key) => {
                let digest = Sha256::digest(message);
                key.verify(rsa::Pkcs1v15Sign::new::<Sha256>(), digest.as_slice(), signature)
                    .is_ok()
            }
            VerifyKey::Ecdsa(key) => ecdsa_candidates(signature)
                .iter()
                .any(|sig| key.verify(message, sig).is_ok()),
            VerifyKey::Ed25519(key) => {
                let Ok(bytes) = <&[u8; 64]>::try_from(signature) else {
                    return false;
                };
                let sig = ed25519_dalek::Signature::from_bytes(bytes);
                key.verify(message, &sig).is_ok()
            }
        }
    }
}

/// All plausible decodings of an ECDSA signature blob, DER first.
fn ecdsa_candidates(signature: &[u8]) -> Vec<p256::ecdsa::Signature> {
    let mut candidates = Vec::new();
    if let Ok(sig) = p256::ecdsa::Signature::from_der(signature) {
        candidates.push(sig);
    }
    if signature.len() == 64 {
        if let Ok(sig) = p256::ecdsa::Signature::from_slice(signature) {
            candidates.push(sig);
        }
        let mut swapped = [0u8; 64];
        for (i, b) in signature[..32].iter().rev().enumerate() {
            swapped[i] = *b;
        }
        for (i, b) in signature[32..].iter().rev().enumerate() {
            swapped[32 + i] = *b;
        }
        if let Ok(sig) = p256::ecdsa::Signature::from_slice(&swapped) {
            candidates.push(sig);
        }
    }
    candidates
}

/// Decode the base64 content of `manifest.sig`, whitespace tolerated.
pub fn decode_signature(content: &[u8]) -> Result<Vec<u8>> {
    let compact: Vec<u8> = content
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(&compact)
        .map_err(|err| Error::new(ErrorKind::Signature, format!("manifest.sig is not base64: {err}")))
}

/// Verify `message` against `signature` with each key in order; the first
/// success accepts, all failures reject.
pub fn verify_with_any(keys: &[VerifyKey], message: &[u8], signature: &[u8]) -> Result<()> {
    for (index, key) in keys.iter().enumerate() {
        if key.verify(message, signature) {
            debug!(key_index = index, "manifest signature verified");
            return Ok(());
        }
    }
    Err(Error::new(
        ErrorKind::Signature,
        "manifest signature does not verify against any configured key",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use signature::Signer;

    const MESSAGE: &[u8] = b"digest-one  version\ndigest-two  header.tar.gz\n";

    fn rsa_pair() -> (rsa::RsaPrivateKey, VerifyKey) {
        let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let pem = public.to_public_key_pem(rsa::pkcs8::LineEnding::LF).unwrap();
        (private, VerifyKey::from_pem(&pem).unwrap())
    }

    fn p256_pair() -> (p256::ecdsa::SigningKey, VerifyKey) {
        let private = p256::ecdsa::SigningKey::from_slice(&[0x17u8; 32]).unwrap();
        let public = p256::PublicKey::from(*private.verifying_key());
        let pem = public
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        (private, VerifyKey::from_pem(&pem).unwrap())
    }

    fn ed25519_pair() -> (ed25519_dalek::SigningKey, VerifyKey) {
        let private = ed25519_dalek::SigningKey::from_bytes(&[0x21u8; 32]);
        let pem = private
            .verifying_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        (private, VerifyKey::from_pem(&pem).unwrap())
    }

    #[test]
    fn rsa_sign_verify_roundtrip() {
        let (private, key) = rsa_pair();
        let digest = Sha256::digest(MESSAGE);
        let sig = private
            .sign(rsa::Pkcs1v15Sign::new::<Sha256>(), digest.as_slice())
            .unwrap();
        assert!(key.verify(MESSAGE, &sig));
        assert!(!key.verify(b"tampered", &sig));
        let mut flipped = sig.clone();
        flipped[0] ^= 1;
        assert!(!key.verify(MESSAGE, &flipped));
    }

    #[test]
    fn ecdsa_der_and_raw_encodings_verify() {
        let (private, key) = p256_pair();
        let sig: p256::ecdsa::Signature = private.sign(MESSAGE);
        let der = sig.to_der();
        let raw_bytes = sig.to_bytes();
        let raw = raw_bytes.as_slice();

        assert!(key.verify(MESSAGE, der.as_bytes()));
        // Raw big-endian r||s.
        assert!(key.verify(MESSAGE, raw));
        // Raw little-endian halves.
        let mut le = [0u8; 64];
        for (i, b) in raw[..32].iter().rev().enumerate() {
            le[i] = *b;
        }
        for (i, b) in raw[32..].iter().rev().enumerate() {
            le[32 + i] = *b;
        }
        assert!(key.verify(MESSAGE, &le));
        assert!(!key.verify(b"tampered", der.as_bytes()));
    }

    #[test]
    fn ed25519_signs_message_directly() {
        let (private, key) = ed25519_pair();
        let sig = private.sign(MESSAGE);
        assert!(key.verify(MESSAGE, &sig.to_bytes()));
        assert!(!key.verify(b"tampered", &sig.to_bytes()));
        assert!(!key.verify(MESSAGE, &[0u8; 63]));
    }

    #[test]
    fn verify_with_any_tries_keys_in_order() {
        let (_, wrong) = ed25519_pair();
        let (private, right) = rsa_pair();
        let digest = Sha256::digest(MESSAGE);
        let sig = private
            .sign(rsa::Pkcs1v15Sign::new::<Sha256>(), digest.as_slice())
            .unwrap();

        verify_with_any(&[wrong, right], MESSAGE, &sig).unwrap();

        let (_, only_wrong) = ed25519_pair();
        let err = verify_with_any(&[only_wrong], MESSAGE, &sig).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Signature);
    }

    #[test]
    fn decode_signature_tolerates_newlines() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"rawsig");
        let wrapped = format!("{}\n", encoded);
        assert_eq!(decode_signature(wrapped.as_bytes()).unwrap(), b"rawsig");
        assert!(decode_signature(b"!!not-base64!!").is_err());
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let err = match VerifyKey::from_pem("-----BEGIN GARBAGE-----\nzz\n-----END GARBAGE-----\n")
        {
            Err(err) => err,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), ErrorKind::Signature);
    }
}
