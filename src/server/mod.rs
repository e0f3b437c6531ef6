//! HTTP server module
//!
//! Accepts HTTP/1.1 connections with `hyper`, resolves each request to an
//! endpoint and tus operation, and drives the protocol engine.
//!
//! # Endpoints
//!
//! * `GET /health` - Health check (returns "ok")
//! * `{prefix}` and `{prefix}/{id}` - tus operations, see [`crate::router`]
//! * Unknown paths return 404, unsupported methods on known paths 405

pub mod endpoint;

pub use endpoint::Endpoint;

use crate::config::Config;
use crate::metrics::server::MetricsServer;
use crate::router::{EndpointResolver, RouterError, TusOperation, TusRequestParser};
use crate::storage::ChunkStream;
use crate::tus::{self, RequestHeaders, TusResponse};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Endpoint setup failed: {0}")]
    EndpointError(String),
}

/// Shared request handling state
struct AppState {
    resolver: EndpointResolver,
    endpoints: HashMap<String, Endpoint>,
    public_base_url: String,
}

/// tus HTTP server
pub struct Server {
    state: Arc<AppState>,
    listener: TcpListener,
    local_addr: SocketAddr,
    metrics: Option<String>,
}

impl Server {
    /// Build every endpoint backend and bind the listener
    ///
    /// Port 0 binds an OS-assigned port; see [`Server::local_addr`].
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            endpoints.push(Endpoint::build(endpoint).await?);
        }
        Self::bind_with_endpoints(config, endpoints).await
    }

    /// Bind the listener for endpoints whose backends are already built
    pub async fn bind_with_endpoints(
        config: Config,
        endpoints: Vec<Endpoint>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!(address = %local_addr, endpoints = endpoints.len(), "Server bound");

        let metrics = config
            .metrics
            .enabled
            .then(|| format!("{}:{}", addr.ip(), config.metrics.port));

        let state = AppState {
            resolver: EndpointResolver::new(&config),
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.config.name.clone(), e))
                .collect(),
            public_base_url: config.server.public_base_url.clone().unwrap_or_default(),
        };

        Ok(Self {
            state: Arc::new(state),
            listener,
            local_addr,
            metrics,
        })
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until Ctrl-C
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves
    ///
    /// In-flight connections keep running on their own tasks; only the accept
    /// loop stops.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let mut metrics_server = match &self.metrics {
            Some(address) => Some(
                MetricsServer::start(address)
                    .await
                    .map_err(|e| ServerError::BindError(e.to_string()))?,
            ),
            None => None,
        };

        info!(address = %self.local_addr, "Accepting tus requests");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle_request(req, state).await }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    warn!(peer = %peer_addr, error = %e, "Error serving connection");
                }
            });
        }

        if let Some(metrics_server) = metrics_server.as_mut() {
            metrics_server.shutdown().await;
        }
        info!("Shutting down server");
        Ok(())
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

/// Render an engine response as an HTTP response
fn into_http(response: TusResponse, method: &Method) -> Response<Full<Bytes>> {
    let body = match (&response.body, method) {
        (Some(body), m) if *m != Method::HEAD => Bytes::from(body.clone()),
        _ => Bytes::new(),
    };

    let mut http = Response::new(Full::new(body));
    *http.status_mut() =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().append(name, value);
            }
            _ => warn!(header = %name, "Dropping unrepresentable response header"),
        }
    }
    if response.body.is_some() {
        http.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    http
}

fn request_headers(req: &Request<Incoming>) -> RequestHeaders {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn chunk_stream(body: Incoming) -> ChunkStream {
    Box::pin(body.into_data_stream().map_err(io::Error::other))
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(method = %method, path = %path, "Handling request");

    if path == "/health" && method == Method::GET {
        return Ok(plain(StatusCode::OK, "ok"));
    }

    let (config, rest) = match state.resolver.resolve(&path) {
        Ok(found) => found,
        Err(_) => return Ok(plain(StatusCode::NOT_FOUND, "Not Found")),
    };
    let Some(endpoint) = state.endpoints.get(&config.name) else {
        error!(endpoint = %config.name, "Endpoint has no backend");
        return Ok(plain(StatusCode::NOT_FOUND, "Not Found"));
    };

    let operation = match TusRequestParser::parse(method.as_str(), rest) {
        Ok(op) => op,
        Err(RouterError::MethodNotAllowed(_)) => {
            return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"))
        }
        Err(_) => return Ok(plain(StatusCode::NOT_FOUND, "Not Found")),
    };

    let headers = request_headers(&req);
    let max_size = endpoint.config.max_size;

    let response = match operation {
        TusOperation::Options => tus::handle_options(max_size),
        TusOperation::Create => tus::respond(
            tus::handle_creation(
                &headers,
                max_size,
                endpoint.backend(),
                |id| endpoint.location(&state.public_base_url, id),
                |id, meta| endpoint.business_meta(id, meta),
            )
            .await,
        ),
        TusOperation::Head { upload_id } => {
            tus::respond(tus::handle_head(&upload_id, &headers, endpoint.backend()).await)
        }
        TusOperation::Patch { upload_id } => {
            let body = chunk_stream(req.into_body());
            tus::respond(tus::handle_patch(&upload_id, &headers, endpoint.backend(), body).await)
        }
    };

    Ok(into_http(response, &method))
}
