//! Deciding when the dev server can take traffic
//!
//! Readiness needs two signals, in order: the build tool reports a successful
//! compile on stdout, and then the port answers HTTP. The build line alone can
//! arrive before the listener is bound. Probing alone would make a broken
//! build look like a slow start.

use crate::config::ProbeConfig;
use crate::lines::{wait_for_match, LineWaitError};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use regex::Regex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// A failed readiness probe. These only drive the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no response within {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),
    #[error("invalid probe request: {0}")]
    Request(#[from] hyper::http::Error),
}

/// Shutdown was requested while still waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("shutdown requested")]
pub struct ShutdownRequested;

/// Per-attempt timeout for the probe loop.
///
/// Starts at the initial timeout and grows by a fixed increment after each
/// failure, never past the cap. Slow `localhost` resolution gets more room
/// without slowing down the steady state.
#[derive(Debug, Clone)]
pub struct ProbeBackoff {
    current: Duration,
    increment: Duration,
    cap: Duration,
}

impl ProbeBackoff {
    pub fn new(config: &ProbeConfig) -> Self {
        let cap = config.max_timeout();
        Self {
            current: config.initial_timeout().min(cap),
            increment: config.timeout_increment(),
            cap,
        }
    }

    /// Timeout for the next attempt
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a failed attempt, returning the new timeout
    pub fn advance(&mut self) -> Duration {
        self.current = (self.current + self.increment).min(self.cap);
        self.current
    }
}

/// Waits for the build tool's success line on stdout
#[derive(Debug, Clone)]
pub struct BuildSignal {
    pattern: Regex,
    timeout: Duration,
}

impl BuildSignal {
    pub fn new(pattern: Regex, timeout: Duration) -> Self {
        Self { pattern, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the matching line
    pub async fn wait(&self, stdout: &mut broadcast::Receiver<String>) -> Result<String, LineWaitError> {
        wait_for_match(stdout, &self.pattern, self.timeout).await
    }
}

/// Sends HEAD requests to the dev server
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpProbe {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        // Readiness is decided once, so there is nothing worth pooling
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client }
    }

    /// Send one HEAD request. Any HTTP status counts as a response.
    pub async fn probe(&self, uri: &Uri, timeout: Duration) -> Result<StatusCode, ProbeError> {
        let req = Request::builder()
            .method(Method::HEAD)
            .uri(uri.clone())
            .body(Empty::<Bytes>::new())?;

        match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response.status()),
            Ok(Err(e)) => Err(ProbeError::Connect(e)),
            Err(_) => Err(ProbeError::Timeout(timeout)),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once shutdown is signalled or the shutdown sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Probe `uri` until it answers with any HTTP response.
///
/// There is no overall deadline; callers bound their own wait. The loop only
/// gives up when shutdown is requested. Probes run one at a time.
pub async fn wait_until_accepting(
    probe: &HttpProbe,
    uri: &Uri,
    config: &ProbeConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<StatusCode, ShutdownRequested> {
    let mut backoff = ProbeBackoff::new(config);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let timeout = backoff.current();

        let result = tokio::select! {
            result = probe.probe(uri, timeout) => result,
            _ = shutdown_requested(shutdown) => return Err(ShutdownRequested),
        };

        match result {
            Ok(status) => {
                debug!(%uri, attempt, %status, "Dev server answered readiness probe");
                return Ok(status);
            }
            Err(e) => {
                debug!(
                    %uri,
                    attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    error = %e,
                    "Dev server not accepting requests yet"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.retry_delay()) => {}
            _ = shutdown_requested(shutdown) => return Err(ShutdownRequested),
        }

        backoff.advance();
    }
}
