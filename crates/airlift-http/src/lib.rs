// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resumable HTTP downloads.
//!
//! [`ResumingClient`] turns an unreliable HTTP GET into a reliable byte
//! stream: when the first response carries a parsable `Content-Length`, any
//! mid-body failure triggers a backoff wait and a `Range` request picking up
//! at the current offset.  The consumer sees one uninterrupted stream; a
//! response that cannot be stitched back seamlessly (wrong range, changed
//! size) is fatal rather than silently corrupting the download.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;

pub use backoff::ExponentialBackoff;

use airlift_error::{Error, ErrorKind, Result};
use bytes::Bytes;
use futures::StreamExt;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static CONTENT_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^bytes\s+(\d+)\s*-\s*(\d+)\s*/\s*(\d+|\*)$").expect("content-range regex")
});

/// Parsed `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte position of this response.
    pub start: u64,
    /// Last byte position of this response.
    pub end: u64,
    /// Total resource size; `None` when the server reported `*`.
    pub total: Option<u64>,
}

/// Parse a `Content-Range: bytes <start>-<end>/<total|*>` header.
///
/// Non-numeric endpoints are rejected.
pub fn parse_content_range(header: &str) -> Result<ContentRange> {
    let captures = CONTENT_RANGE.captures(header).ok_or_else(|| {
        Error::new(
            ErrorKind::Validation,
            format!("invalid Content-Range returned from server: '{header}'"),
        )
    })?;
    let start: u64 = captures[1]
        .parse()
        .map_err(|_| Error::new(ErrorKind::Validation, "Content-Range start overflows"))?;
    let end: u64 = captures[2]
        .parse()
        .map_err(|_| Error::new(ErrorKind::Validation, "Content-Range end overflows"))?;
    if start > end {
        return Err(Error::new(
            ErrorKind::Validation,
            format!("invalid Content-Range returned from server: '{header}'"),
        ));
    }
    let total = match &captures[3] {
        "*" => None,
        digits => Some(digits.parse().map_err(|_| {
            Error::new(ErrorKind::Validation, "Content-Range total overflows")
        })?),
    };
    Ok(ContentRange { start, end, total })
}

// ---------------------------------------------------------------------------
// ResumingClient
// ---------------------------------------------------------------------------

/// What the downloader learned from the first response.
#[derive(Debug, Clone, Copy)]
pub struct DownloadInfo {
    /// Total size, when the server announced one.
    pub size: Option<u64>,
    /// Whether mid-stream failures will be resumed with `Range` requests.
    pub resumable: bool,
}

/// Pacing for resume attempts.
#[derive(Debug, Clone)]
pub struct ResumePolicy {
    /// Interval of the first wait; later waits triple every three attempts.
    pub first_interval: Duration,
    /// Attempt budget before giving up.
    pub max_attempts: u32,
    /// Optional cap on any single wait.
    pub max_interval: Option<Duration>,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            first_interval: Duration::from_secs(60),
            max_attempts: 10,
            max_interval: None,
        }
    }
}

impl ResumePolicy {
    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff::new(self.first_interval, self.max_attempts);
        if let Some(cap) = self.max_interval {
            backoff = backoff.with_max_interval(cap);
        }
        backoff
    }
}

/// HTTP GET with transparent range-based resumption.
pub struct ResumingClient {
    client: reqwest::Client,
    policy: ResumePolicy,
}

impl ResumingClient {
    /// Wrap a reqwest client with the default resume policy.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            policy: ResumePolicy::default(),
        }
    }

    /// Override the resume pacing.
    #[must_use]
    pub fn with_policy(mut self, policy: ResumePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start downloading `url`.
    ///
    /// Returns the download metadata and an [`AsyncRead`] yielding the
    /// resource bytes.  Errors the resumer cannot recover from surface as
    /// read errors on the stream.
    pub async fn download(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(DownloadInfo, impl AsyncRead + Send + Unpin + use<>)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| Error::new(ErrorKind::Io, format!("GET {url}: {err}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::new(
                ErrorKind::UnexpectedHttpResponse,
                format!("{}: GET {url}", status.as_u16()),
            ));
        }

        let size = content_length(&response);
        let resumable = size.is_some();
        if !resumable {
            debug!(url, "response lacks a usable Content-Length; resume disabled");
        }
        let info = DownloadInfo { size, resumable };

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        let driver = Driver {
            client: self.client.clone(),
            url: url.to_string(),
            backoff: self.policy.backoff(),
            total: size,
            offset: 0,
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run(response, tx));

        Ok((info, StreamReader::new(ReceiverStream::new(rx))))
    }
}

fn content_length(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(reqwest::header::CONTENT_LENGTH)?;
    let parsed = value.to_str().ok()?.trim().parse::<u64>().ok()?;
    (parsed > 0).then_some(parsed)
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

struct Driver {
    client: reqwest::Client,
    url: String,
    backoff: ExponentialBackoff,
    total: Option<u64>,
    offset: u64,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self, first: reqwest::Response, tx: mpsc::Sender<std::io::Result<Bytes>>) {
        let mut response = first;
        loop {
            match self.pump(response, &tx).await {
                PumpOutcome::Done => return,
                PumpOutcome::ConsumerGone => return,
                PumpOutcome::Cancelled => {
                    let _ = tx
                        .send(Err(to_io(Error::new(
                            ErrorKind::Cancelled,
                            "download cancelled",
                        ))))
                        .await;
                    return;
                }
                PumpOutcome::Broken(reason) => {
                    let Some(total) = self.total else {
                        let _ = tx.send(Err(to_io(reason))).await;
                        return;
                    };
                    info!(
                        url = %self.url,
                        offset = self.offset,
                        %reason,
                        "will try to resume after error"
                    );
                    match self.resume(total).await {
                        Ok(next) => response = next,
                        Err(err) => {
                            let _ = tx.send(Err(to_io(err))).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Forward body chunks until the response ends, errors, or is cancelled.
    async fn pump(
        &mut self,
        response: reqwest::Response,
        tx: &mpsc::Sender<std::io::Result<Bytes>>,
    ) -> PumpOutcome {
        let mut stream = response.bytes_stream();
        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => return PumpOutcome::Cancelled,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(chunk)) => {
                    self.offset += chunk.len() as u64;
                    if tx.send(Ok(chunk)).await.is_err() {
                        return PumpOutcome::ConsumerGone;
                    }
                }
                Some(Err(err)) => {
                    return PumpOutcome::Broken(Error::new(
                        ErrorKind::Io,
                        format!("reading body: {err}"),
                    ));
                }
                None => {
                    // Clean end of this response; is the resource complete?
                    match self.total {
                        Some(total) if self.offset < total => {
                            return PumpOutcome::Broken(Error::new(
                                ErrorKind::Io,
                                format!(
                                    "connection closed at byte {} of {total}",
                                    self.offset
                                ),
                            ));
                        }
                        _ => return PumpOutcome::Done,
                    }
                }
            }
        }
    }

    /// Wait out the backoff and issue the next `Range` request.
    async fn resume(&mut self, total: u64) -> Result<reqwest::Response> {
        loop {
            let interval = self.backoff.next_interval().map_err(|err| {
                err.context("giving up on resuming the download")
            })?;
            info!(
                url = %self.url,
                seconds = interval.as_secs(),
                "resuming download after wait"
            );
            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(Error::new(ErrorKind::Cancelled, "download cancelled"));
                }
                () = tokio::time::sleep(interval) => {}
            }

            let range = format!("bytes={}-{}", self.offset, total - 1);
            let response = match self
                .client
                .get(&self.url)
                .header(reqwest::header::RANGE, &range)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(url = %self.url, %err, "resume request failed; rescheduling");
                    continue;
                }
            };

            if response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
                return Err(Error::new(
                    ErrorKind::UnexpectedHttpResponse,
                    format!("{}: range GET {}", response.status().as_u16(), self.url),
                ));
            }

            let header = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    Error::new(ErrorKind::Validation, "206 response without Content-Range")
                })?;
            let content_range = parse_content_range(header)?;

            if let Some(reported) = content_range.total {
                if reported != total {
                    return Err(Error::new(
                        ErrorKind::Validation,
                        format!(
                            "size of resource changed after download was resumed (expected {total}, got {reported})"
                        ),
                    ));
                }
            }
            if content_range.start != self.offset || content_range.end != total - 1 {
                return Err(Error::new(
                    ErrorKind::Validation,
                    format!(
                        "server returned a different range than requested: requested {}-{}, got {}-{}",
                        self.offset,
                        total - 1,
                        content_range.start,
                        content_range.end
                    ),
                ));
            }

            return Ok(response);
        }
    }
}

enum PumpOutcome {
    Done,
    ConsumerGone,
    Cancelled,
    Broken(Error),
}

fn to_io(err: Error) -> std::io::Error {
    let kind = match err.kind() {
        ErrorKind::Cancelled => std::io::ErrorKind::Interrupted,
        _ => std::io::ErrorKind::Other,
    };
    std::io::Error::new(kind, err)
}
