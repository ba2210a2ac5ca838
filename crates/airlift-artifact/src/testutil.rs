// SPDX-License-Identifier: MIT OR Apache-2.0
//! Test-support builder producing well-formed (and deliberately broken)
//! artifacts without shelling out to external tooling.

use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;

/// Compression applied to the header and payload tarballs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression (`.tar`).
    None,
    /// gzip (`.tar.gz`).
    #[default]
    Gzip,
    /// xz (`.tar.xz`).
    Xz,
    /// zstd (`.tar.zst`).
    Zstd,
}

impl Compression {
    fn suffix(self) -> &'static str {
        match self {
            Compression::None => ".tar",
            Compression::Gzip => ".tar.gz",
            Compression::Xz => ".tar.xz",
            Compression::Zstd => ".tar.zst",
        }
    }

    fn compress(self, raw: &[u8]) -> Vec<u8> {
        match self {
            Compression::None => raw.to_vec(),
            Compression::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
                enc.write_all(raw).unwrap();
                enc.finish().unwrap()
            }
            Compression::Xz => {
                let mut enc = xz2::write::XzEncoder::new(Vec::new(), 1);
                enc.write_all(raw).unwrap();
                enc.finish().unwrap()
            }
            Compression::Zstd => zstd::stream::encode_all(raw, 1).unwrap(),
        }
    }
}

/// Builder for in-memory test artifacts.
pub struct ArtifactBuilder {
    artifact_name: String,
    artifact_group: Option<String>,
    device_types: Vec<String>,
    depends_artifact_name: Option<Vec<String>>,
    payload_type: Option<String>,
    provides: Option<BTreeMap<String, String>>,
    clears_provides: Option<Vec<String>>,
    meta_data: Option<String>,
    files: Vec<(String, Vec<u8>)>,
    scripts: Vec<(String, Vec<u8>)>,
    compression: Compression,
    signer: Option<Box<dyn Fn(&[u8]) -> Vec<u8>>>,
    corrupt_payload_digest: bool,
    omit_data_entry: bool,
}

impl ArtifactBuilder {
    /// Start a builder for a rootfs-image artifact named `artifact_name`.
    pub fn new(artifact_name: &str) -> Self {
        Self {
            artifact_name: artifact_name.to_string(),
            artifact_group: None,
            device_types: vec!["test-device".to_string()],
            depends_artifact_name: None,
            payload_type: Some("rootfs-image".to_string()),
            provides: None,
            clears_provides: None,
            meta_data: None,
            files: Vec::new(),
            scripts: Vec::new(),
            compression: Compression::default(),
            signer: None,
            corrupt_payload_digest: false,
            omit_data_entry: false,
        }
    }

    /// Set the artifact group.
    pub fn group(mut self, group: &str) -> Self {
        self.artifact_group = Some(group.to_string());
        self
    }

    /// Replace the accepted device types.
    pub fn device_types(mut self, types: &[&str]) -> Self {
        self.device_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Add an `artifact_name` depends list.
    pub fn depends_on_artifact_names(mut self, names: &[&str]) -> Self {
        self.depends_artifact_name = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Set the payload type (`None` → empty-payload artifact).
    pub fn payload_type(mut self, payload_type: Option<&str>) -> Self {
        self.payload_type = payload_type.map(|t| t.to_string());
        if self.payload_type.is_none() {
            self.omit_data_entry = true;
        }
        self
    }

    /// Set type-info `artifact_provides`.
    pub fn provides(mut self, pairs: &[(&str, &str)]) -> Self {
        self.provides = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    /// Set type-info `clears_artifact_provides`.
    pub fn clears_provides(mut self, patterns: &[&str]) -> Self {
        self.clears_provides = Some(patterns.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Attach a raw `meta-data` document.
    pub fn meta_data(mut self, raw: &str) -> Self {
        self.meta_data = Some(raw.to_string());
        self
    }

    /// Add a payload file.
    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.files.push((name.to_string(), content.to_vec()));
        self
    }

    /// Add a state script shipped in the header.
    pub fn script(mut self, name: &str, content: &[u8]) -> Self {
        self.scripts.push((name.to_string(), content.to_vec()));
        self
    }

    /// Select tarball compression.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sign the manifest with `signer` (raw signature bytes in, base64 out).
    pub fn signed_with(mut self, signer: impl Fn(&[u8]) -> Vec<u8> + 'static) -> Self {
        self.signer = Some(Box::new(signer));
        self
    }

    /// Corrupt the manifest digest of the payload, leaving the rest intact.
    pub fn corrupt_payload_digest(mut self) -> Self {
        self.corrupt_payload_digest = true;
        self
    }

    /// Ship an empty `data/0000` tarball even for an empty-payload artifact.
    pub fn with_empty_data_entry(mut self) -> Self {
        self.omit_data_entry = false;
        self
    }

    /// Produce the artifact bytes.
    pub fn build(self) -> Vec<u8> {
        let version = br#"{"format":"mender","version":3}"#.to_vec();

        let header_tar = self.build_header_tar();
        let header_blob = self.compression.compress(&header_tar);
        let header_name = format!("header{}", self.compression.suffix());

        let data_blob = if self.omit_data_entry {
            None
        } else {
            let data_tar = build_tar(
                &self
                    .files
                    .iter()
                    .map(|(n, c)| (n.as_str(), c.as_slice()))
                    .collect::<Vec<_>>(),
            );
            Some(self.compression.compress(&data_tar))
        };
        let data_name = format!("data/0000{}", self.compression.suffix());

        let mut manifest = String::new();
        manifest.push_str(&manifest_line(&version, "version"));
        manifest.push_str(&manifest_line(&header_blob, &header_name));
        if let Some(ref blob) = data_blob {
            if self.corrupt_payload_digest {
                let bogus = hex::encode(Sha256::digest(b"not the payload"));
                manifest.push_str(&format!("{bogus}  {data_name}\n"));
            } else {
                manifest.push_str(&manifest_line(blob, &data_name));
            }
        }
        let manifest = manifest.into_bytes();

        let mut outer: Vec<(String, Vec<u8>)> = vec![
            ("version".to_string(), version),
            ("manifest".to_string(), manifest.clone()),
        ];
        if let Some(ref signer) = self.signer {
            let signature = signer(&manifest);
            let encoded = base64::engine::general_purpose::STANDARD.encode(signature);
            outer.push(("manifest.sig".to_string(), format!("{encoded}\n").into_bytes()));
        }
        outer.push((header_name, header_blob));
        if let Some(blob) = data_blob {
            outer.push((data_name, blob));
        }

        build_tar(
            &outer
                .iter()
                .map(|(n, c)| (n.as_str(), c.as_slice()))
                .collect::<Vec<_>>(),
        )
    }

    fn build_header_tar(&self) -> Vec<u8> {
        let payload_type = self.payload_type.clone().unwrap_or_default();

        let mut provides = serde_json::Map::new();
        provides.insert("artifact_name".into(), self.artifact_name.clone().into());
        if let Some(ref group) = self.artifact_group {
            provides.insert("artifact_group".into(), group.clone().into());
        }
        let mut depends = serde_json::Map::new();
        depends.insert("device_type".into(), self.device_types.clone().into());
        if let Some(ref names) = self.depends_artifact_name {
            depends.insert("artifact_name".into(), names.clone().into());
        }
        let header_info = serde_json::json!({
            "payloads": [{"type": payload_type}],
            "artifact_provides": provides,
            "artifact_depends": depends,
        })
        .to_string();

        let mut type_info = serde_json::Map::new();
        type_info.insert("type".into(), payload_type.into());
        if let Some(ref p) = self.provides {
            type_info.insert("artifact_provides".into(), serde_json::json!(p));
        }
        if let Some(ref c) = self.clears_provides {
            type_info.insert("clears_artifact_provides".into(), serde_json::json!(c));
        }
        let type_info = serde_json::Value::Object(type_info).to_string();

        let mut entries: Vec<(String, Vec<u8>)> =
            vec![("header-info".to_string(), header_info.into_bytes())];
        for (name, content) in &self.scripts {
            entries.push((format!("scripts/{name}"), content.clone()));
        }
        entries.push(("headers/0000/type-info".to_string(), type_info.into_bytes()));
        if let Some(ref meta) = self.meta_data {
            entries.push((
                "headers/0000/meta-data".to_string(),
                meta.clone().into_bytes(),
            ));
        }

        build_tar(
            &entries
                .iter()
                .map(|(n, c)| (n.as_str(), c.as_slice()))
                .collect::<Vec<_>>(),
        )
    }
}

fn manifest_line(content: &[u8], name: &str) -> String {
    format!("{}  {name}\n", hex::encode(Sha256::digest(content)))
}

fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_ustar();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap()
}
