// SPDX-License-Identifier: MIT OR Apache-2.0
//! Header metadata types: `header-info`, per-payload `type-info`, `meta-data`.

use airlift_error::{Error, ErrorKind, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Largest integer that round-trips exactly through a double.
const MAX_EXACT_INT: i64 = (1 << 53) - 1;

// ---------------------------------------------------------------------------
// header-info
// ---------------------------------------------------------------------------

/// Top-level `header-info` document.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInfo {
    /// Payload descriptors; exactly one is supported.
    pub payloads: Vec<PayloadInfo>,
    /// Identity the artifact provides.
    pub artifact_provides: HeaderProvides,
    /// Constraints on the device the artifact installs onto.
    pub artifact_depends: HeaderDepends,
}

/// One entry of `header-info.payloads`.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadInfo {
    /// Payload type; empty for the install-nothing artifact.
    #[serde(rename = "type", default)]
    pub payload_type: Option<String>,
}

/// `header-info.artifact_provides`.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderProvides {
    /// Name the device records after a successful install.
    pub artifact_name: String,
    /// Optional group name.
    #[serde(default)]
    pub artifact_group: Option<String>,
}

/// `header-info.artifact_depends`.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderDepends {
    /// Device types the artifact accepts.
    pub device_type: Vec<String>,
    /// Previously installed artifact names the artifact accepts.
    #[serde(default)]
    pub artifact_name: Option<Vec<String>>,
    /// Artifact groups the artifact accepts.
    #[serde(default)]
    pub artifact_group: Option<Vec<String>>,
}

impl HeaderInfo {
    /// Parse and semantically validate a `header-info` document.
    pub fn parse(raw: &str) -> Result<Self> {
        let info: HeaderInfo = serde_json::from_str(raw)
            .map_err(|err| Error::new(ErrorKind::Parse, format!("header-info: {err}")))?;
        if info.payloads.len() != 1 {
            return Err(Error::new(
                ErrorKind::Validation,
                format!("exactly one payload is supported, got {}", info.payloads.len()),
            ));
        }
        if info.artifact_depends.device_type.is_empty() {
            return Err(Error::new(
                ErrorKind::Validation,
                "header-info depends on no device type",
            ));
        }
        if let Some(ref names) = info.artifact_depends.artifact_name {
            if names.is_empty() {
                return Err(Error::new(
                    ErrorKind::Validation,
                    "empty artifact_name depends list",
                ));
            }
        }
        if let Some(ref groups) = info.artifact_depends.artifact_group {
            if groups.is_empty() {
                return Err(Error::new(
                    ErrorKind::Validation,
                    "empty artifact_group depends list",
                ));
            }
        }
        Ok(info)
    }
}

// ---------------------------------------------------------------------------
// type-info
// ---------------------------------------------------------------------------

/// A depends value: a single string or a list of allowed strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    /// Single allowed value.
    One(String),
    /// List of allowed values.
    Many(Vec<String>),
}

impl OneOrMany {
    /// View as a list of allowed values.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

/// Per-payload `headers/NNNN/type-info` document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TypeInfo {
    /// Payload type; absent or empty for the install-nothing artifact.
    #[serde(rename = "type", default)]
    pub payload_type: Option<String>,
    /// Provides applied to the device on commit.
    #[serde(default)]
    pub artifact_provides: Option<BTreeMap<String, String>>,
    /// Additional depends beyond the header-info ones.
    #[serde(default)]
    pub artifact_depends: Option<BTreeMap<String, OneOrMany>>,
    /// Wildcard patterns of provides keys erased before applying.
    #[serde(default)]
    pub clears_artifact_provides: Option<Vec<String>>,
}

impl TypeInfo {
    /// Parse a `type-info` document.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| Error::new(ErrorKind::Parse, format!("type-info: {err}")))
    }
}

// ---------------------------------------------------------------------------
// meta-data
// ---------------------------------------------------------------------------

/// Validate a `meta-data` document against the allowed shapes.
///
/// Top level must be an object; values must be strings, numbers, or arrays
/// whose elements are all strings or all numbers.  Integers that do not
/// round-trip exactly through a double are rejected.
pub fn validate_meta_data(doc: &Value) -> Result<()> {
    let Value::Object(obj) = doc else {
        return Err(Error::new(
            ErrorKind::Validation,
            "meta-data top level must be an object",
        ));
    };
    for (key, value) in obj {
        match value {
            Value::String(_) => {}
            Value::Number(_) => check_number(key, value)?,
            Value::Array(items) => {
                let all_strings = items.iter().all(Value::is_string);
                let all_numbers = items.iter().all(Value::is_number);
                if !(all_strings || all_numbers) {
                    return Err(Error::new(
                        ErrorKind::Validation,
                        format!("meta-data array '{key}' must be all strings or all numbers"),
                    ));
                }
                for item in items {
                    if item.is_number() {
                        check_number(key, item)?;
                    }
                }
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::Validation,
                    format!("meta-data value '{key}' has an unsupported type"),
                ));
            }
        }
    }
    Ok(())
}

fn check_number(key: &str, value: &Value) -> Result<()> {
    let exact = match (value.as_i64(), value.as_u64()) {
        (Some(i), _) => i.abs() <= MAX_EXACT_INT,
        (None, Some(u)) => u <= MAX_EXACT_INT as u64,
        // Already a float; doubles are what they are.
        (None, None) => true,
    };
    if !exact {
        return Err(Error::new(
            ErrorKind::Validation,
            format!("meta-data number '{key}' exceeds the exact double range"),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ArtifactHeader
// ---------------------------------------------------------------------------

/// Everything the header tarball said about the single payload.
///
/// The raw JSON strings are kept verbatim because the update module receives
/// them as shipped, byte for byte.
#[derive(Debug, Clone)]
pub struct ArtifactHeader {
    /// Parsed `header-info`.
    pub info: HeaderInfo,
    /// Parsed `type-info`.
    pub type_info: TypeInfo,
    /// Parsed `meta-data`, when present.
    pub meta_data: Option<Value>,
    /// `header-info` exactly as shipped.
    pub raw_header_info: String,
    /// `type-info` exactly as shipped.
    pub raw_type_info: String,
    /// `meta-data` exactly as shipped, when present.
    pub raw_meta_data: Option<String>,
}

impl ArtifactHeader {
    /// Artifact name from `header-info.artifact_provides`.
    pub fn artifact_name(&self) -> &str {
        &self.info.artifact_provides.artifact_name
    }

    /// Artifact group, empty when unset.
    pub fn artifact_group(&self) -> &str {
        self.info
            .artifact_provides
            .artifact_group
            .as_deref()
            .unwrap_or("")
    }

    /// Payload type, empty for the install-nothing artifact.
    pub fn payload_type(&self) -> &str {
        self.info.payloads[0].payload_type.as_deref().unwrap_or("")
    }

    /// `true` when this artifact carries no payload and commits immediately.
    pub fn is_empty_payload(&self) -> bool {
        self.payload_type().is_empty()
    }

    /// Depends from header-info and type-info merged into one map,
    /// `device_type` included.
    pub fn combined_depends(&self) -> BTreeMap<String, Vec<String>> {
        let mut depends = BTreeMap::new();
        depends.insert(
            "device_type".to_string(),
            self.info.artifact_depends.device_type.clone(),
        );
        if let Some(ref names) = self.info.artifact_depends.artifact_name {
            depends.insert("artifact_name".to_string(), names.clone());
        }
        if let Some(ref groups) = self.info.artifact_depends.artifact_group {
            depends.insert("artifact_group".to_string(), groups.clone());
        }
        if let Some(ref extra) = self.type_info.artifact_depends {
            for (key, value) in extra {
                depends.insert(key.clone(), value.to_vec());
            }
        }
        depends
    }

    /// Provides declared by the payload's type-info.
    pub fn provides(&self) -> Option<&BTreeMap<String, String>> {
        self.type_info.artifact_provides.as_ref()
    }

    /// Clears-provides patterns declared by the payload's type-info.
    pub fn clears_provides(&self) -> Option<&Vec<String>> {
        self.type_info.clears_artifact_provides.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEADER_INFO: &str = r#"{
        "payloads": [{"type": "rootfs-image"}],
        "artifact_provides": {"artifact_name": "release-2", "artifact_group": "stable"},
        "artifact_depends": {"device_type": ["test-device"], "artifact_name": ["release-1"]}
    }"#;

    #[test]
    fn header_info_parses() {
        let info = HeaderInfo::parse(HEADER_INFO).unwrap();
        assert_eq!(info.artifact_provides.artifact_name, "release-2");
        assert_eq!(info.payloads[0].payload_type.as_deref(), Some("rootfs-image"));
    }

    #[test]
    fn header_info_rejects_multiple_payloads() {
        let raw = r#"{
            "payloads": [{"type": "a"}, {"type": "b"}],
            "artifact_provides": {"artifact_name": "x"},
            "artifact_depends": {"device_type": ["d"]}
        }"#;
        let err = HeaderInfo::parse(raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn header_info_requires_device_type() {
        let raw = r#"{
            "payloads": [{"type": "a"}],
            "artifact_provides": {"artifact_name": "x"},
            "artifact_depends": {"device_type": []}
        }"#;
        assert!(HeaderInfo::parse(raw).is_err());
    }

    #[test]
    fn type_info_depends_accepts_string_or_list() {
        let ti = TypeInfo::parse(
            r#"{"type": "rootfs-image",
                "artifact_depends": {"rootfs-image.checksum": "abc", "other": ["x", "y"]}}"#,
        )
        .unwrap();
        let depends = ti.artifact_depends.unwrap();
        assert_eq!(depends["rootfs-image.checksum"].to_vec(), vec!["abc"]);
        assert_eq!(depends["other"].to_vec(), vec!["x", "y"]);
    }

    #[test]
    fn combined_depends_merges_sources() {
        let header = ArtifactHeader {
            info: HeaderInfo::parse(HEADER_INFO).unwrap(),
            type_info: TypeInfo::parse(
                r#"{"type": "rootfs-image", "artifact_depends": {"rootfs-image.checksum": "abc"}}"#,
            )
            .unwrap(),
            meta_data: None,
            raw_header_info: HEADER_INFO.to_string(),
            raw_type_info: String::new(),
            raw_meta_data: None,
        };
        let depends = header.combined_depends();
        assert_eq!(depends["device_type"], vec!["test-device"]);
        assert_eq!(depends["artifact_name"], vec!["release-1"]);
        assert_eq!(depends["rootfs-image.checksum"], vec!["abc"]);
    }

    // -- meta-data ---------------------------------------------------------

    #[test]
    fn meta_data_accepts_flat_shapes() {
        validate_meta_data(&json!({
            "name": "thing",
            "count": 7,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "ports": [80, 443]
        }))
        .unwrap();
    }

    #[test]
    fn meta_data_rejects_non_object_top_level() {
        assert!(validate_meta_data(&json!(["a"])).is_err());
        assert!(validate_meta_data(&json!("s")).is_err());
    }

    #[test]
    fn meta_data_rejects_nested_objects() {
        let err = validate_meta_data(&json!({"nested": {"a": 1}})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn meta_data_rejects_mixed_arrays() {
        assert!(validate_meta_data(&json!({"mix": ["a", 1]})).is_err());
    }

    #[test]
    fn meta_data_rejects_huge_integers() {
        assert!(validate_meta_data(&json!({"n": 9007199254740991i64})).is_ok());
        assert!(validate_meta_data(&json!({"n": 9007199254740992i64})).is_err());
        assert!(validate_meta_data(&json!({"n": -9007199254740992i64})).is_err());
        assert!(validate_meta_data(&json!({"ns": [9007199254740992i64]})).is_err());
    }

    #[test]
    fn meta_data_rejects_bool_and_null() {
        assert!(validate_meta_data(&json!({"b": true})).is_err());
        assert!(validate_meta_data(&json!({"n": null})).is_err());
    }
}
