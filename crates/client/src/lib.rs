//! kexp REST executor: one authenticated HTTP request, one normalized
//! outcome.
//!
//! The executor is stateless aside from its configuration and is safe to
//! share across concurrent callers. Two underlying clients are kept: a
//! short-timeout one for ordinary requests and an untimed one for
//! long-poll watch and log-follow streams.

#![forbid(unsafe_code)]

use std::time::Duration;

use reqwest::{header, Method, Response, StatusCode};
use tracing::{debug, error};
use url::Url;

pub mod config;
pub mod paths;

pub use config::ClusterContext;

/// Default bound for non-streaming requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{method} '{url}' returned HTTP {status}:\n{body}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("config: {0}")]
    Config(String),
}

/// Authenticated request executor for one cluster context.
pub struct RestClient {
    ctx: ClusterContext,
    short: reqwest::Client,
    streaming: reqwest::Client,
}

impl RestClient {
    /// Build a client for the given context. Certificate verification is
    /// disabled; the tool targets clusters with self-signed certificates.
    pub fn new(ctx: ClusterContext) -> Result<Self, ClientError> {
        let short = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let streaming = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { ctx, short, streaming })
    }

    pub fn context(&self) -> &ClusterContext {
        &self.ctx
    }

    pub fn server(&self) -> &Url {
        &self.ctx.server
    }

    /// Issue one request and classify the outcome: 2xx and 404 yield the
    /// body (404 means "absent", which callers inspect); anything else is
    /// folded into an error together with the body.
    pub async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<String, ClientError> {
        debug!(%method, %url, has_body = body.is_some(), "rest call");
        let mut req = self.short.request(method.clone(), url.clone());
        req = self.authorize(req, &url);
        if method == Method::PATCH {
            req = req
                .header(header::CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
                .header(header::ACCEPT, "*/*");
        }
        if let Some(b) = body {
            req = req.body(b);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            if status == StatusCode::NOT_FOUND {
                debug!(%url, "no resources found");
            }
            return Ok(text);
        }
        error!(%method, %url, %status, "request failed");
        Err(ClientError::Status { method, url: url.to_string(), status, body: text })
    }

    /// Open a long-poll streaming GET (watch, log follow). No read timeout;
    /// the connection stays up until the caller drops the response.
    pub async fn open_stream(&self, url: Url) -> Result<Response, ClientError> {
        debug!(%url, "opening stream");
        let req = self.authorize(self.streaming.get(url.clone()), &url);
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status { method: Method::GET, url: url.to_string(), status, body });
        }
        Ok(resp)
    }

    /// Lightweight reachability probe: list cluster nodes.
    pub async fn probe(&self) -> Result<(), ClientError> {
        let url = paths::list(self.server(), "api/v1", "nodes", None)?;
        self.execute(Method::GET, url, None).await.map(|_| ())
    }

    /// Attach the bearer token, except for loopback targets (local proxy).
    fn authorize(&self, req: reqwest::RequestBuilder, url: &Url) -> reqwest::RequestBuilder {
        if is_loopback(url) {
            req
        } else {
            req.bearer_auth(&self.ctx.token)
        }
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(d)) => d == "localhost",
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
