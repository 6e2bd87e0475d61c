//! Loopback HTTP client for the sandbox
//!
//! Keeps connections to the sandbox process open between script executions so
//! each request does not pay for a new TCP handshake.

use http_body_util::{Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
}

impl PoolError {
    /// True when no connection could be established at all
    pub fn is_connect(&self) -> bool {
        match self {
            PoolError::Client(e) => e.is_connect(),
        }
    }
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Result of one liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// An HTTP response came back, whatever its status
    Answered,
    /// Nothing accepts connections on the port
    Refused,
    /// A connection was made but no response arrived in time.
    /// `php -S` serves one request at a time, so a busy sandbox looks like this.
    NoAnswer,
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept to the sandbox
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

/// Pooled HTTP/1.1 client talking to 127.0.0.1
pub struct ConnectionPool {
    /// Client for script executions (buffered request bodies)
    client: Client<HttpConnector, Full<Bytes>>,
    /// Client for liveness probes; never pools, a probe must open a fresh connection
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
        }
    }

    /// Send a fully built request; redirects are never followed
    pub async fn send_request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, PoolError> {
        Ok(self.client.request(req).await?)
    }

    /// Ask the loopback port for `/` and wait at most `wait` for a response.
    /// Any status counts as an answer; the sandbox returns 404 for its empty root.
    pub async fn probe(&self, port: u16, wait: Duration) -> ProbeOutcome {
        let uri = format!("http://127.0.0.1:{}/", port);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return ProbeOutcome::Refused,
        };

        match timeout(wait, self.probe_client.request(req)).await {
            Ok(Ok(_)) => ProbeOutcome::Answered,
            Ok(Err(e)) if e.is_connect() => ProbeOutcome::Refused,
            Ok(Err(e)) => {
                debug!(port, error = %e, "Probe connection failed after connecting");
                ProbeOutcome::NoAnswer
            }
            Err(_) => ProbeOutcome::NoAnswer,
        }
    }
}
