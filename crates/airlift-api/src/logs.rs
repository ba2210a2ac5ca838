// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deployment-log sanitization for the log push endpoint.
//!
//! The on-device deployment log is line-delimited JSON, but a crash can
//! leave a torn line behind and the server insists on a well-formed
//! `{"messages":[…]}` document with an exact `Content-Length`.  The
//! sanitizer therefore produces the complete request body into a side file:
//! valid records pass through byte-for-byte, unparseable lines become a
//! synthetic `(CORRUPTED LOG DATA)` record stamped with the last known
//! timestamp, and when any sanitization happened a leading notice record
//! announces it.

use airlift_error::{Error, ErrorKind, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

const DEFAULT_TIMESTAMP: &str = "1970-01-01T00:00:00.000000000Z";
const CORRUPT_MESSAGE: &str = "(CORRUPTED LOG DATA)";
const NOTICE_MESSAGE: &str = "(THE ORIGINAL LOGS CONTAINED INVALID ENTRIES)";

/// Outcome of a sanitization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedLogs {
    /// `true` when every input line was a valid record.
    pub clean: bool,
    /// Size in bytes of the produced body.
    pub body_len: u64,
}

fn synthetic_record(timestamp: &str, message: &str) -> String {
    serde_json::json!({
        "timestamp": timestamp,
        "level": "ERROR",
        "message": message,
    })
    .to_string()
}

fn line_timestamp(line: &str) -> Option<String> {
    let doc: Value = serde_json::from_str(line).ok()?;
    doc.get("timestamp")?.as_str().map(|s| s.to_string())
}

/// Produce the full `{"messages":[…]}` request body into `dst`.
pub fn sanitize_log_file(src: &Path, dst: &Path) -> Result<SanitizedLogs> {
    // First pass: find out whether sanitization will be needed and what the
    // first valid timestamp is, so the notice record can lead the body.
    let mut clean = true;
    let mut first_timestamp: Option<String> = None;
    {
        let reader = BufReader::new(std::fs::File::open(src)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if serde_json::from_str::<Value>(&line).is_ok() {
                if first_timestamp.is_none() {
                    first_timestamp = line_timestamp(&line);
                }
            } else {
                clean = false;
            }
        }
    }

    // Second pass: write the body.
    let reader = BufReader::new(std::fs::File::open(src)?);
    let mut out = std::fs::File::create(dst)?;
    out.write_all(b"{\"messages\":[")?;

    let mut wrote_any = false;
    let mut last_timestamp = first_timestamp
        .clone()
        .unwrap_or_else(|| DEFAULT_TIMESTAMP.to_string());

    if !clean {
        let notice = synthetic_record(&last_timestamp, NOTICE_MESSAGE);
        out.write_all(notice.as_bytes())?;
        wrote_any = true;
    }

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = if serde_json::from_str::<Value>(trimmed).is_ok() {
            if let Some(ts) = line_timestamp(trimmed) {
                last_timestamp = ts;
            }
            trimmed.to_string()
        } else {
            synthetic_record(&last_timestamp, CORRUPT_MESSAGE)
        };
        if wrote_any {
            out.write_all(b",")?;
        }
        out.write_all(record.as_bytes())?;
        wrote_any = true;
    }

    out.write_all(b"]}")?;
    out.flush()?;

    let body_len = out.metadata()?.len();
    Ok(SanitizedLogs { clean, body_len })
}

/// Sanitize `src` and hand the produced body to `consume`; the side file is
/// removed afterwards on every path.
pub async fn with_sanitized_body<T, F, Fut>(src: &Path, consume: F) -> Result<T>
where
    F: FnOnce(SanitizedLogs, Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let side = side_file_path(src);
    let outcome = sanitize_log_file(src, &side);
    let result = match outcome {
        Ok(summary) => match std::fs::read(&side) {
            Ok(body) => consume(summary, body).await,
            Err(err) => Err(Error::from(err)),
        },
        Err(err) => Err(err),
    };
    if side.exists() {
        if let Err(err) = std::fs::remove_file(&side) {
            tracing::error!(%err, "failed to delete auxiliary logs file");
        }
    }
    result
}

fn side_file_path(src: &Path) -> std::path::PathBuf {
    let mut name = src.file_name().unwrap_or_default().to_os_string();
    name.push(".sanitized");
    src.with_file_name(name)
}
