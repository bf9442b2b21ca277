//! Pooled HTTP client for forwarding requests to the dev server

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HOST;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to the dev server
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Forward `req` to the same path on `target`
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        target: &Uri,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = upstream_uri(target, &req)?;
        let authority = target
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| PoolError::RequestBuild(format!("target has no authority: {}", target)))?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(uri);

        // Dev servers commonly reject unknown Host headers; the original host
        // travels in X-Forwarded-Host instead
        for (key, value) in parts.headers.iter() {
            if key != HOST {
                builder = builder.header(key, value);
            }
        }
        builder = builder.header(HOST, authority);

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// `target`'s scheme and authority joined with the request's path and query
pub fn upstream_uri<B>(target: &Uri, req: &Request<B>) -> Result<Uri, PoolError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut parts = target.clone().into_parts();
    parts.path_and_query = Some(
        path.parse()
            .map_err(|e: hyper::http::uri::InvalidUri| PoolError::RequestBuild(e.to_string()))?,
    );
    Uri::from_parts(parts).map_err(|e| PoolError::RequestBuild(e.to_string()))
}
