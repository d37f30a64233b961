//! Not-found fallback fetch.
//!
//! When a page of the chosen version is missing, the response is held while
//! substitute content is fetched. The hold resolves exactly once: with the
//! fetched body, with a failure, or on timeout.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::{Rewrite, VERSION_PLACEHOLDER};
use crate::error::FetchError;

/// Ceiling on how long a response may be held for fallback content.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_millis(1500);

/// A substitute-content fetch: `GET path` with `Host: host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    pub host: String,
    pub path: String,
}

impl FallbackRequest {
    /// Builds the request for `version`, if both a fallback host and a
    /// not-found template are configured.
    pub fn for_version(rewrite: &Rewrite, version: &str) -> Option<Self> {
        if !rewrite.has_not_found_fallback() {
            return None;
        }
        Some(Self {
            host: rewrite.host.clone(),
            path: rewrite.not_found.replace(VERSION_PLACEHOLDER, version),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: Bytes,
}

/// Transport for fallback fetches.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, request: &FallbackRequest) -> Result<FetchedPage, FetchError>;
}

/// Outcome of a fallback fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackResolution {
    Fetched(Bytes),
    Failed(String),
    TimedOut,
}

/// Fallback progress for one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FallbackState {
    #[default]
    Idle,
    Pending(FallbackRequest),
    Resolved(FallbackResolution),
}

impl FallbackState {
    pub fn begin(&mut self, request: FallbackRequest) {
        *self = Self::Pending(request);
    }

    /// Moves `Pending` to `Resolved`. Returns false, leaving the state as
    /// is, when there is nothing pending.
    pub fn resolve(&mut self, resolution: FallbackResolution) -> bool {
        if !self.is_pending() {
            return false;
        }
        *self = Self::Resolved(resolution);
        true
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Body to send instead of the upstream one, once fetched.
    pub fn replacement_body(&self) -> Option<&Bytes> {
        match self {
            Self::Resolved(FallbackResolution::Fetched(body)) => Some(body),
            _ => None,
        }
    }
}

/// Fetches with a bounded wait.
pub async fn fetch_with_timeout(
    fetcher: &dyn ContentFetcher,
    request: &FallbackRequest,
    timeout: Duration,
) -> FallbackResolution {
    match tokio::time::timeout(timeout, fetcher.fetch(request)).await {
        Ok(Ok(page)) => {
            if !(200..300).contains(&page.status) {
                tracing::warn!(
                    status = page.status,
                    path = %request.path,
                    "fallback content returned non-success status"
                );
            }
            FallbackResolution::Fetched(page.body)
        }
        Ok(Err(e)) => FallbackResolution::Failed(e.to_string()),
        Err(_) => FallbackResolution::TimedOut,
    }
}

/// Resolves a pending fallback.
///
/// The state is written only after the fetch completes, so dropping this
/// future (the client went away) leaves the state untouched.
pub async fn run_fallback(state: &mut FallbackState, fetcher: &dyn ContentFetcher, timeout: Duration) {
    let FallbackState::Pending(request) = state else {
        return;
    };
    let request = request.clone();
    let resolution = fetch_with_timeout(fetcher, &request, timeout).await;
    match &resolution {
        FallbackResolution::Fetched(body) => {
            tracing::info!(path = %request.path, bytes = body.len(), "fallback content fetched")
        }
        FallbackResolution::Failed(reason) => {
            tracing::warn!(path = %request.path, error = %reason, "fallback fetch failed")
        }
        FallbackResolution::TimedOut => {
            tracing::warn!(path = %request.path, timeout_ms = timeout.as_millis() as u64, "fallback fetch timed out")
        }
    }
    state.resolve(resolution);
}

/// Plain HTTP/1 fetcher against the gateway's upstream.
pub struct HyperFetcher {
    client: Client<HttpConnector, Empty<Bytes>>,
    upstream: String,
}

impl HyperFetcher {
    /// `upstream` is an `IP:PORT` authority.
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            upstream: upstream.into(),
        }
    }
}

#[async_trait]
impl ContentFetcher for HyperFetcher {
    async fn fetch(&self, request: &FallbackRequest) -> Result<FetchedPage, FetchError> {
        let uri = format!("http://{}{}", self.upstream, request.path);
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(http::header::HOST, request.host.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?
            .to_bytes();

        Ok(FetchedPage { status, body })
    }
}
