//! Prometheus scrape endpoint
//!
//! Serves `GET /metrics` (text exposition format) and `GET /health` on a
//! dedicated listener, separate from the upload traffic.

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Metrics server error
#[derive(Debug, thiserror::Error)]
pub enum MetricsServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Running metrics listener
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsServer {
    /// Bind `address` and start serving in the background
    ///
    /// Port 0 binds an OS-assigned port; see [`MetricsServer::local_addr`].
    pub async fn start(address: &str) -> Result<Self, MetricsServerError> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(serve(listener, shutdown_rx));
        tracing::info!(address = %local_addr, "Metrics server listening");

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve(listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(route))
                        .await;
                });
            }
        }
    }
}

async fn route(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, content_type, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match encode_metrics() {
            Some(buffer) => (StatusCode::OK, TextEncoder::new().format_type().to_string(), buffer),
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain".to_string(),
                b"Failed to encode metrics".to_vec(),
            ),
        },
        (&Method::GET, "/health") => (
            StatusCode::OK,
            "application/json".to_string(),
            br#"{"status":"ok"}"#.to_vec(),
        ),
        _ => (
            StatusCode::NOT_FOUND,
            "text/plain".to_string(),
            b"Not Found".to_vec(),
        ),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn encode_metrics() -> Option<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .ok()?;
    Some(buffer)
}
