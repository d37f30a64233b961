//! Pingora ProxyHttp implementation for the gray gateway.
//!
//! Hosts the gray engine inside Pingora's request lifecycle: the decision
//! is made in `request_filter` and request mutations are applied in
//! `upstream_request_filter`. `response_filter` applies response mutations
//! and writes a fetched not-found page itself; `response_body_filter`
//! buffers bodies that get injected into.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Bytes;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::error::HeaderError;
use crate::gray::{
    apply_mutations, finish_body, plan_request, plan_response, run_fallback, BodyAction,
    ContentFetcher, FallbackState, HeaderBag, HeaderSink, RequestPlan, RequestSignals,
};
use crate::store::{ConfigStore, Generation};

use super::Upstream;

/// Per-request context for the gateway proxy.
///
/// Holds the configuration generation the request started with, so a
/// concurrent config push never changes a decision midway.
#[derive(Default)]
pub struct GatewayCtx {
    pub generation: Option<Arc<Generation>>,
    /// `None` when gray routing does not apply to this request.
    pub plan: Option<RequestPlan>,
    pub body: BodyAction,
    pub buffer: Vec<u8>,
    pub fallback: FallbackState,
    /// The fetched fallback page has been written downstream; upstream
    /// body chunks are dropped.
    pub replaced: bool,
}

impl GatewayCtx {
    /// Request-header phase: pins `generation` and plans the request.
    pub fn start(&mut self, generation: Arc<Generation>, signals: &RequestSignals) {
        self.plan = plan_request(&generation.config, signals);
        self.generation = Some(generation);
    }

    /// Response-header phase.
    ///
    /// A resolved fallback is written to `downstream` right here, because
    /// an upstream 404 with an empty body never reaches the body phase.
    pub async fn on_response_header<D: Downstream + ?Sized>(
        &mut self,
        upstream_response: &mut ResponseHeader,
        downstream: &mut D,
        fetcher: &dyn ContentFetcher,
        timeout: Duration,
    ) -> Result<()> {
        let (Some(generation), Some(plan)) = (&self.generation, &mut self.plan) else {
            return Ok(());
        };

        let status = upstream_response.status.as_u16();
        let content_type = upstream_response
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let response_plan = plan_response(&generation.config, &mut plan.decision, status, content_type);
        log_rejected(apply_mutations(upstream_response, &response_plan.mutations));

        if let BodyAction::Fallback(request) = &response_plan.body {
            self.fallback.begin(request.clone());
            run_fallback(&mut self.fallback, fetcher, timeout).await;

            if let Some(page) = self.fallback.replacement_body().cloned() {
                upstream_response.remove_header("transfer-encoding");
                upstream_response.insert_header(http::header::CONTENT_LENGTH, page.len().to_string())?;
                downstream.send_header(upstream_response.clone()).await?;
                downstream.send_body(page).await?;
                self.replaced = true;
            }
        }
        self.body = response_plan.body;
        Ok(())
    }

    /// Response-body phase. Buffering actions hold every chunk and emit the
    /// finished body at end of stream.
    pub fn on_response_body(&mut self, body: &mut Option<Bytes>, end_of_stream: bool) {
        if self.replaced {
            *body = None;
            return;
        }
        if !self.body.buffers() {
            return;
        }
        let Some(generation) = &self.generation else {
            return;
        };

        if let Some(chunk) = body.take() {
            self.buffer.extend_from_slice(&chunk);
        }
        if end_of_stream {
            *body = Some(finish_body(
                &self.body,
                &self.buffer,
                &self.fallback,
                &generation.config.injection,
            ));
            self.buffer = Vec::new();
        }
    }
}

/// Client side of the connection, for responses the gateway writes itself.
#[async_trait]
pub trait Downstream: Send {
    async fn send_header(&mut self, header: ResponseHeader) -> Result<()>;

    /// Sends the complete body and ends the response.
    async fn send_body(&mut self, body: Bytes) -> Result<()>;
}

#[async_trait]
impl Downstream for Session {
    async fn send_header(&mut self, header: ResponseHeader) -> Result<()> {
        self.write_response_header(Box::new(header), false).await
    }

    async fn send_body(&mut self, body: Bytes) -> Result<()> {
        self.write_response_body(Some(body), true).await
    }
}

/// Gateway proxy that applies gray routing in front of a single upstream.
pub struct GatewayProxy {
    store: Arc<ConfigStore>,
    upstream: Upstream,
    fetcher: Arc<dyn ContentFetcher>,
    fallback_timeout: Duration,
}

impl GatewayProxy {
    pub fn new(
        store: Arc<ConfigStore>,
        upstream: Upstream,
        fetcher: Arc<dyn ContentFetcher>,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            store,
            upstream,
            fetcher,
            fallback_timeout,
        }
    }
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let Some(generation) = self.store.snapshot() else {
            return Ok(false);
        };

        let peer_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip());
        let signals = request_signals(session.req_header(), peer_ip);
        ctx.start(generation, &signals);
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Ok(Box::new(self.upstream.to_peer()))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(plan) = &ctx.plan {
            log_rejected(apply_mutations(upstream_request, &plan.mutations));
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        ctx.on_response_header(
            upstream_response,
            session,
            self.fetcher.as_ref(),
            self.fallback_timeout,
        )
        .await
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        ctx.on_response_body(body, end_of_stream);
        Ok(None)
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let version = ctx
            .plan
            .as_ref()
            .map(|p| p.decision.version())
            .unwrap_or("-");
        let page = ctx.plan.as_ref().is_some_and(|p| p.decision.is_page);
        let not_found = ctx.plan.as_ref().is_some_and(|p| p.decision.not_found);

        tracing::info!(
            method = method,
            path = path,
            status = status,
            version = version,
            page = page,
            fallback = not_found,
            "request completed"
        );
    }
}

/// Collects the request signals the gray engine reads.
///
/// Header values that are not visible ASCII are skipped.
pub fn request_signals(req: &RequestHeader, peer_ip: Option<IpAddr>) -> RequestSignals {
    let headers: HeaderBag = req
        .headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect();
    let path = req
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let signals = RequestSignals::new(path, headers);
    match peer_ip {
        Some(ip) => signals.with_peer_ip(ip),
        None => signals,
    }
}

fn log_rejected(rejected: Vec<HeaderError>) {
    for e in rejected {
        tracing::warn!(error = %e, "header mutation skipped");
    }
}

impl HeaderSink for RequestHeader {
    fn set_header(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        if name == ":path" {
            let uri = value
                .parse::<http::Uri>()
                .map_err(|e| HeaderError::new(name, e))?;
            self.set_uri(uri);
            return Ok(());
        }
        self.insert_header(name.to_string(), value)
            .map_err(|e| HeaderError::new(name, e))
    }

    fn append_header(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        RequestHeader::append_header(self, name.to_string(), value)
            .map(|_| ())
            .map_err(|e| HeaderError::new(name, e))
    }

    fn remove_header(&mut self, name: &str) {
        RequestHeader::remove_header(self, name);
    }
}

impl HeaderSink for ResponseHeader {
    fn set_header(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        if name == ":status" {
            let code = value
                .parse::<u16>()
                .map_err(|e| HeaderError::new(name, e))?;
            return self
                .set_status(code)
                .map_err(|e| HeaderError::new(name, e));
        }
        self.insert_header(name.to_string(), value)
            .map_err(|e| HeaderError::new(name, e))
    }

    fn append_header(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        ResponseHeader::append_header(self, name.to_string(), value)
            .map(|_| ())
            .map_err(|e| HeaderError::new(name, e))
    }

    fn remove_header(&mut self, name: &str) {
        ResponseHeader::remove_header(self, name);
    }
}
