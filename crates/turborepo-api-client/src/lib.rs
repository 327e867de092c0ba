#![deny(clippy::all)]
//! HTTP client for the remote cache artifact API.
//!
//! The wire protocol is `GET|PUT|HEAD /v8/artifacts/<hash>?teamId=…[&slug=…]`
//! with a bearer token. 2xx is success, 404 is a miss, any other 4xx is
//! terminal for the run, and 5xx or transport failures are retried by the
//! caller through [`retry`].

pub mod retry;

use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
pub use reqwest::Response;
use thiserror::Error;

pub const API_ARTIFACTS_PATH: &str = "/v8/artifacts";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to contact remote cache: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("remote cache request was forbidden; check your token and team")]
    Forbidden,
    #[error("unknown status {code}: {message}")]
    UnknownStatus { code: String, message: String },
}

impl Error {
    /// Whether a retry might help: transport trouble or a server error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ReqwestError(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .is_some_and(|status| status.is_server_error())
            }
            Error::Forbidden | Error::UnknownStatus { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct APIAuth {
    pub token: String,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
}

#[derive(Debug, Clone)]
pub struct APIClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    fetch_timeout: Duration,
    upload_timeout: Duration,
    use_preflight: bool,
}

impl APIClient {
    pub fn new(
        base_url: impl AsRef<str>,
        fetch_timeout: Duration,
        upload_timeout: Duration,
        version: &str,
        use_preflight: bool,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(APIClient {
            client,
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            user_agent: format!("turbo {version}"),
            fetch_timeout,
            upload_timeout,
            use_preflight,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn artifact_url(&self, hash: &str) -> String {
        format!("{}{}/{}", self.base_url, API_ARTIFACTS_PATH, hash)
    }

    fn artifact_request(
        &self,
        method: Method,
        hash: &str,
        timeout: Duration,
        auth: &APIAuth,
    ) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, self.artifact_url(hash))
            .timeout(timeout)
            .header("User-Agent", &self.user_agent)
            .header("Authorization", format!("Bearer {}", auth.token));
        if let Some(team_id) = &auth.team_id {
            request = request.query(&[("teamId", team_id.as_str())]);
        }
        if let Some(team_slug) = &auth.team_slug {
            request = request.query(&[("slug", team_slug.as_str())]);
        }
        request
    }

    /// Best-effort CORS-style preflight. Failures are ignored; the real
    /// request will surface any actual problem.
    async fn preflight(&self, hash: &str, request_method: &str, auth: &APIAuth) {
        if !self.use_preflight {
            return;
        }
        let result = self
            .artifact_request(Method::OPTIONS, hash, self.fetch_timeout, auth)
            .header("Access-Control-Request-Method", request_method)
            .header("Access-Control-Request-Headers", "Authorization")
            .send()
            .await;
        if let Err(err) = result {
            tracing::debug!("artifact preflight failed: {err}");
        }
    }

    /// Downloads an artifact. `Ok(None)` is a cache miss.
    pub async fn fetch_artifact(
        &self,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        self.preflight(hash, "GET", auth).await;
        let response = self
            .artifact_request(Method::GET, hash, self.fetch_timeout, auth)
            .send()
            .await?;
        Self::handle_optional_response(response).await
    }

    /// Checks artifact existence without downloading. `Ok(None)` is a miss.
    pub async fn artifact_exists(
        &self,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        self.preflight(hash, "HEAD", auth).await;
        let response = self
            .artifact_request(Method::HEAD, hash, self.fetch_timeout, auth)
            .send()
            .await?;
        Self::handle_optional_response(response).await
    }

    /// Uploads an artifact body. `duration` is the task's wall time in
    /// milliseconds; `tag` is the optional HMAC integrity tag.
    pub async fn put_artifact(
        &self,
        hash: &str,
        body: Vec<u8>,
        duration: u64,
        tag: Option<&str>,
        auth: &APIAuth,
    ) -> Result<(), Error> {
        self.preflight(hash, "PUT", auth).await;
        let mut request = self
            .artifact_request(Method::PUT, hash, self.upload_timeout, auth)
            .header("Content-Type", "application/octet-stream")
            .header("x-artifact-duration", duration.to_string())
            .body(body);
        if let Some(tag) = tag {
            request = request.header("x-artifact-tag", tag);
        }

        let response = request.send().await?;
        Self::handle_status(response).await?;
        Ok(())
    }

    async fn handle_optional_response(response: Response) -> Result<Option<Response>, Error> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_status(response).await?))
    }

    async fn handle_status(response: Response) -> Result<Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            return Err(Error::Forbidden);
        }
        // Keep the status attached so that is_retryable can see 5xx.
        if let Err(err) = response.error_for_status_ref() {
            return Err(Error::ReqwestError(err));
        }
        Err(Error::UnknownStatus {
            code: status.as_str().to_string(),
            message: "unexpected response".to_string(),
        })
    }
}
