//! HTTP health server for Kubernetes probes.
//!
//! `/healthz` reports liveness. `/readyz` reports readiness, which requires
//! a loaded gray configuration.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::store::ConfigStore;

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Handles health check requests.
///
/// Returns 200 "ok" for `/healthz`. `/readyz` returns 200 "ok" once a
/// configuration is loaded and 503 before. Any other path is a 404.
pub async fn health_handler<B>(
    req: Request<B>,
    store: Arc<ConfigStore>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => text_response(StatusCode::OK, "ok"),
        "/readyz" if store.is_loaded() => text_response(StatusCode::OK, "ok"),
        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "no configuration"),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

/// Starts the HTTP health server on the given address.
///
/// Runs indefinitely, accepting connections and handling health requests.
pub async fn start_health_server(addr: SocketAddr, store: Arc<ConfigStore>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_health(listener, store).await
}

/// Serves health requests on an already bound listener.
pub async fn serve_health(listener: TcpListener, store: Arc<ConfigStore>) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let store = store.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, store.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}
