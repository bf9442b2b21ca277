use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::supervisor::DevServerBridge;
use crate::target::GateError;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Per-connection state shared by every request on it
struct RequestContext {
    bridge: Arc<DevServerBridge>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    client_addr: SocketAddr,
}

/// Reverse proxy that forwards every request to the supervised dev server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    bridge: Arc<DevServerBridge>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        bridge: Arc<DevServerBridge>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, bridge, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        bridge: Arc<DevServerBridge>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            bridge,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Max time to wait for the dev server to answer once it is ready
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::new(RequestContext {
                                bridge: Arc::clone(&self.bridge),
                                pool: Arc::clone(&self.pool),
                                request_timeout: self.request_timeout,
                                client_addr: addr,
                            });

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<RequestContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades (live reload)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<RequestContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let client_host = forwarded_host(&req);

    // We are the first hop, so X-Forwarded-* are overwritten rather than appended
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&ctx.client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = client_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id = %request_id, "Incoming request");

    // Each request gets its own startup wait, so an early timeout does not
    // doom requests made after the dev server comes up
    let startup_timeout = ctx.bridge.startup_timeout();
    let target = match ctx.bridge.get_target(startup_timeout).await {
        Ok(target) => target,
        Err(e @ GateError::Timeout { .. }) => {
            warn!(
                request_id = %request_id,
                timeout_secs = startup_timeout.as_secs(),
                "Dev server not ready in time"
            );
            return Ok(json_error_response(ProxyErrorCode::StartupTimeout, e.to_string()));
        }
        Err(GateError::Startup(e)) => {
            error!(request_id = %request_id, error = %e, "Dev server unavailable");
            return Ok(json_error_response(
                ProxyErrorCode::DevServerStartFailed,
                e.to_string(),
            ));
        }
    };

    if is_upgrade_request(&req) {
        return handle_upgrade(req, target, request_id).await;
    }

    let result = tokio::time::timeout(ctx.request_timeout, ctx.pool.send_request(req, &target)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(%target, error = %e, "Failed to forward request to dev server");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to the dev server",
            ))
        }
        Err(_) => {
            warn!(
                %target,
                timeout_secs = ctx.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::UpstreamTimeout,
                format!(
                    "Dev server did not respond within {} seconds",
                    ctx.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// The host the client asked for: the Host header, or the `:authority` of
/// HTTP/2 requests, which arrives in the URI instead
fn forwarded_host<B>(req: &Request<B>) -> Option<HeaderValue> {
    if let Some(host) = req.headers().get(hyper::header::HOST) {
        return Some(host.clone());
    }
    req.uri()
        .authority()
        .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// `host:port` to dial for `target`
fn target_authority(target: &Uri) -> Option<String> {
    let host = target.host()?;
    let port = target.port_u16().unwrap_or(80);
    Some(format!("{}:{}", host, port))
}

/// Build the raw HTTP upgrade request to send to the dev server
fn build_upgrade_request<B>(req: &Request<B>, authority: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the status line and headers of the dev server's upgrade response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between client and dev server
async fn forward_bidirectional(client: Upgraded, mut upstream: TcpStream, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                request_id,
                client_to_upstream,
                upstream_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

fn empty_response(status: StatusCode, headers: &[(String, String)]) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| json_error_response(ProxyErrorCode::InternalError, "Invalid upgrade response"))
}

/// Tunnel a WebSocket (or other) upgrade to the dev server
async fn handle_upgrade(
    req: Request<Incoming>,
    target: Uri,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(authority) = target_authority(&target) else {
        return Ok(json_error_response(
            ProxyErrorCode::InternalError,
            format!("Dev server target has no host: {}", target),
        ));
    };

    debug!(request_id = %request_id, %authority, "Handling upgrade request");
    let raw_request = build_upgrade_request(&req, &authority);

    let mut upstream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(%authority, error = %e, "Failed to connect to dev server for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to the dev server: {}", e),
            ));
        }
    };

    if let Err(e) = upstream.write_all(&raw_request).await {
        error!(error = %e, "Failed to send upgrade request to dev server");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match upstream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Dev server closed connection",
            ));
        }
        Err(e) => {
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to read dev server response: {}", e),
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Invalid upgrade response from dev server",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(request_id = %request_id, %status, "Dev server rejected upgrade request");
        return Ok(empty_response(status, &response_headers));
    }

    let response = empty_response(StatusCode::SWITCHING_PROTOCOLS, &response_headers);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => forward_bidirectional(upgraded, upstream, &request_id).await,
            Err(e) => error!(request_id = %request_id, error = %e, "Failed to upgrade client connection"),
        }
    });

    Ok(response)
}
