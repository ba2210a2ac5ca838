// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client for the deployment service.
//!
//! Three operations: poll for the next deployment, push a status update,
//! push the deployment log.  Every request carries a bearer token from an
//! [`AuthTokenProvider`]; a 401 is retried once after a token refresh, a
//! second 401 fails the call.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod logs;

pub use logs::{SanitizedLogs, sanitize_log_file, with_sanitized_body};

use airlift_error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, header};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

const DEPLOYMENTS_NEXT_V1: &str = "/api/devices/v1/deployments/device/deployments/next";
const DEPLOYMENTS_NEXT_V2: &str = "/api/devices/v2/deployments/device/deployments/next";
const DEPLOYMENTS_PREFIX: &str = "/api/devices/v1/deployments/device/deployments";

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Source of bearer tokens, implemented outside the core.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    /// Current token.
    async fn token(&self) -> Result<String>;
    /// Force a refresh (after a 401) and return the new token.
    async fn refresh(&self) -> Result<String>;
}

/// Fixed-token provider for standalone use and tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Provider that always hands out `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Status values accepted by the deployment status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    /// Update module is installing.
    Installing,
    /// Paused before installing.
    PauseBeforeInstalling,
    /// Artifact download in progress.
    Downloading,
    /// Paused before rebooting.
    PauseBeforeRebooting,
    /// Reboot in progress.
    Rebooting,
    /// Paused before committing.
    PauseBeforeCommitting,
    /// Deployment finished successfully.
    Success,
    /// Deployment failed.
    Failure,
    /// The artifact was already installed.
    AlreadyInstalled,
}

impl DeploymentStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::PauseBeforeInstalling => "pause_before_installing",
            Self::Downloading => "downloading",
            Self::PauseBeforeRebooting => "pause_before_rebooting",
            Self::Rebooting => "rebooting",
            Self::PauseBeforeCommitting => "pause_before_committing",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::AlreadyInstalled => "already-installed",
        }
    }
}

/// The next deployment the server wants this device to run.
///
/// Only the fields needed to fetch the artifact are taken from the response;
/// everything else is read from the artifact itself, which is signed and
/// therefore authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextDeployment {
    /// Server-side deployment id.
    pub id: String,
    /// Artifact download URI.
    pub uri: String,
    /// Expiry of the download URI, when the server provided one.
    pub expire: Option<String>,
}

impl NextDeployment {
    fn from_json(doc: &Value) -> Result<Self> {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(ErrorKind::Parse, "could not get deployment ID")
            })?
            .to_string();
        let uri = doc
            .pointer("/artifact/source/uri")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Parse,
                    "could not get artifact URI for deployment",
                )
            })?
            .to_string();
        let expire = doc
            .pointer("/artifact/source/expire")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        debug!(deployment_id = %id, "deployment offered by server");
        Ok(Self { id, uri, expire })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Deployment-service API client.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    auth: Arc<dyn AuthTokenProvider>,
}

impl ApiClient {
    /// Create a client for the server at `base_url`.
    pub fn new(
        base_url: &str,
        http: reqwest::Client,
        auth: Arc<dyn AuthTokenProvider>,
    ) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|err| {
            Error::new(
                ErrorKind::Validation,
                format!("invalid server URL '{base_url}': {err}"),
            )
        })?;
        Ok(Self { http, base, auth })
    }

    /// Poll for the next deployment.
    ///
    /// Tries the v2 endpoint (POST with the full provides map); a 404 falls
    /// back to the v1 endpoint (GET with `artifact_name`/`device_type`).
    pub async fn check_new_deployments(
        &self,
        device_type: &str,
        provides: &BTreeMap<String, String>,
    ) -> Result<Option<NextDeployment>> {
        let artifact_name = provides.get("artifact_name").ok_or_else(|| {
            Error::new(ErrorKind::Validation, "missing artifact name data")
        })?;

        let mut device_provides = serde_json::Map::new();
        device_provides.insert("device_type".to_string(), device_type.into());
        for (key, value) in provides {
            device_provides.insert(key.clone(), value.clone().into());
        }
        let body = serde_json::json!({ "device_provides": device_provides });

        let url = self.endpoint(DEPLOYMENTS_NEXT_V2)?;
        let response = self
            .send_authorized(Method::POST, url.clone(), Some(body.to_string()))
            .await?;

        match response.status() {
            StatusCode::OK => {
                let doc: Value = response.json().await.map_err(|err| {
                    Error::new(ErrorKind::Parse, format!("deployment response: {err}"))
                })?;
                NextDeployment::from_json(&doc).map(Some)
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::NOT_FOUND => {
                debug!("v2 deployments endpoint missing, falling back to v1");
                self.check_new_deployments_v1(device_type, artifact_name).await
            }
            status => Err(unexpected_response(status, response).await),
        }
    }

    async fn check_new_deployments_v1(
        &self,
        device_type: &str,
        artifact_name: &str,
    ) -> Result<Option<NextDeployment>> {
        let mut url = self.endpoint(DEPLOYMENTS_NEXT_V1)?;
        url.query_pairs_mut()
            .append_pair("artifact_name", artifact_name)
            .append_pair("device_type", device_type);

        let response = self.send_authorized(Method::GET, url, None).await?;
        match response.status() {
            StatusCode::OK => {
                let doc: Value = response.json().await.map_err(|err| {
                    Error::new(ErrorKind::Parse, format!("deployment response: {err}"))
                })?;
                NextDeployment::from_json(&doc).map(Some)
            }
            StatusCode::NO_CONTENT => Ok(None),
            status => Err(unexpected_response(status, response).await),
        }
    }

    /// Push a deployment status update.
    ///
    /// A 409 means the server aborted the deployment; the caller treats that
    /// as terminal for the deployment.
    pub async fn push_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        substate: &str,
    ) -> Result<()> {
        if deployment_id.is_empty() {
            return Err(Error::new(
                ErrorKind::Programming,
                "status push without a deployment ID",
            ));
        }
        let mut body = serde_json::Map::new();
        body.insert("status".to_string(), status.as_str().into());
        if !substate.is_empty() {
            body.insert("substate".to_string(), substate.into());
        }
        let url = self.endpoint(&format!("{DEPLOYMENTS_PREFIX}/{deployment_id}/status"))?;
        let response = self
            .send_authorized(
                Method::PUT,
                url,
                Some(Value::Object(body).to_string()),
            )
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::CONFLICT => Err(Error::new(
                ErrorKind::DeploymentAborted,
                "could not send status update to server",
            )),
            status => Err(unexpected_response(status, response).await),
        }
    }

    /// Push the deployment log file.
    ///
    /// The file is sanitized into a well-formed `{"messages":[…]}` body with
    /// an exact `Content-Length` (the server rejects chunked encoding here).
    pub async fn push_logs(&self, deployment_id: &str, log_file: &Path) -> Result<()> {
        if deployment_id.is_empty() {
            return Err(Error::new(
                ErrorKind::Programming,
                "log push without a deployment ID",
            ));
        }
        let url = self.endpoint(&format!("{DEPLOYMENTS_PREFIX}/{deployment_id}/log"))?;

        with_sanitized_body(log_file, |summary, body| async move {
            if !summary.clean {
                warn!(deployment_id, "deployment log contained invalid entries");
            }
            let response = self
                .send_authorized_bytes(Method::PUT, url, body)
                .await?;
            match response.status() {
                StatusCode::NO_CONTENT => Ok(()),
                status => Err(unexpected_response(status, response).await),
            }
        })
        .await
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|err| {
            Error::new(ErrorKind::Validation, format!("bad endpoint '{path}': {err}"))
        })
    }

    async fn send_authorized(
        &self,
        method: Method,
        url: Url,
        json_body: Option<String>,
    ) -> Result<reqwest::Response> {
        let body = json_body.map(|b| b.into_bytes()).unwrap_or_default();
        self.send_with_retry(method, url, body, "application/json")
            .await
    }

    async fn send_authorized_bytes(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        self.send_with_retry(method, url, body, "application/json")
            .await
    }

    /// Issue the request; on 401 refresh the token and retry exactly once.
    async fn send_with_retry(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<reqwest::Response> {
        let mut token = self.auth.token().await?;
        for attempt in 0..2 {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::ACCEPT, "application/json");
            if !body.is_empty() {
                request = request
                    .header(header::CONTENT_TYPE, content_type)
                    .body(body.clone());
            }
            let response = request.send().await.map_err(|err| {
                Error::new(ErrorKind::Io, format!("{method} {url}: {err}"))
            })?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if attempt == 0 {
                warn!(%url, "request unauthorized, refreshing token");
                token = self.auth.refresh().await?;
            }
        }
        Err(Error::new(
            ErrorKind::UnexpectedHttpResponse,
            format!("401: authorization rejected twice for {url}"),
        ))
    }
}

/// Build the error for a status outside the operation's accepted set,
/// including the server's `{"error": …}` message when one is present.
async fn unexpected_response(status: StatusCode, response: reqwest::Response) -> Error {
    let detail = match response.bytes().await {
        Ok(body) => serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|doc| doc.get("error").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string()),
        Err(_) => String::new(),
    };
    error!(status = status.as_u16(), detail = %detail, "unexpected response from server");
    Error::new(
        ErrorKind::UnexpectedHttpResponse,
        format!("got unexpected response {}: {detail}", status.as_u16()),
    )
}
