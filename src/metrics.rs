//! DogStatsD metrics.
//!
//! One `Metrics` handle is built at startup and cloned into every component;
//! emission is fire-and-forget UDP through a queuing sink, so the hot path
//! never blocks on the agent. A disabled handle (no client) exists for tests
//! and for commands that do not report.

use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence::prelude::*;
use cadence::{QueuingMetricSink, StatsdClient, UdpMetricSink};
use tracing::debug;

// Bounds the queue between callers and the UDP sender thread.
const QUEUE_SIZE: usize = 32 * 1024;

const ACTIVE_CONNECTIONS: &str = "connections.active";

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("binding metrics socket: {0}")]
    Socket(#[from] std::io::Error),
    #[error("resolving DogStatsD endpoint: {0}")]
    Sink(String),
}

/// Cloneable handle to the DogStatsD sink.
#[derive(Clone)]
pub struct Metrics {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    client: StatsdClient,
    active_connections: AtomicI64,
}

impl Metrics {
    /// Build a handle emitting to `host:port`, with metric names prefixed by
    /// `namespace` when given. Resolution failures are startup errors;
    /// everything after that is best-effort.
    pub fn new(host: &str, port: u16, namespace: Option<&str>) -> Result<Metrics, MetricsError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| MetricsError::Sink(e.to_string()))?
            .next()
            .ok_or_else(|| MetricsError::Sink(format!("no address for {host}:{port}")))?;
        let sink = UdpMetricSink::from(addr, socket)
            .map_err(|e| MetricsError::Sink(e.to_string()))?;
        let sink = QueuingMetricSink::with_capacity(sink, QUEUE_SIZE);
        debug!(%addr, "DogStatsD sink configured");
        Ok(Metrics::from_client(StatsdClient::from_sink(
            namespace.unwrap_or(""),
            sink,
        )))
    }

    /// A handle that drops everything.
    pub fn disabled() -> Metrics {
        Metrics { inner: None }
    }

    fn from_client(client: StatsdClient) -> Metrics {
        Metrics {
            inner: Some(Arc::new(Inner {
                client,
                active_connections: AtomicI64::new(0),
            })),
        }
    }

    pub fn incr(&self, key: &str) {
        self.count(key, 1);
    }

    pub fn count(&self, key: &str, value: i64) {
        if let Some(inner) = &self.inner {
            let _ = inner.client.count(key, value);
        }
    }

    pub fn decr(&self, key: &str) {
        self.decr_by(key, 1);
    }

    /// Decrementing by zero emits a zero-valued counter event rather than a
    /// negated zero.
    pub fn decr_by(&self, key: &str, value: i64) {
        self.count(key, if value == 0 { 0 } else { -value });
    }

    pub fn gauge(&self, key: &str, value: u64) {
        if let Some(inner) = &self.inner {
            let _ = inner.client.gauge(key, value);
        }
    }

    pub fn time(&self, key: &str, elapsed: Duration) {
        if let Some(inner) = &self.inner {
            let _ = inner.client.time(key, elapsed);
        }
    }

    /// Scope that emits `key` as a timing on every exit path.
    pub fn timed(&self, key: &'static str) -> Timing {
        Timing {
            metrics: self.clone(),
            key,
            start: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        if let Some(inner) = &self.inner {
            let now = inner.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
            let _ = inner.client.gauge(ACTIVE_CONNECTIONS, now.max(0) as u64);
        }
    }

    pub fn connection_closed(&self) {
        if let Some(inner) = &self.inner {
            let now = inner.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
            let _ = inner.client.gauge(ACTIVE_CONNECTIONS, now.max(0) as u64);
        }
    }
}

/// Timing scope; records its start on construction and emits on drop.
pub struct Timing {
    metrics: Metrics,
    key: &'static str,
    start: Instant,
}

impl Drop for Timing {
    fn drop(&mut self) {
        self.metrics.time(self.key, self.start.elapsed());
    }
}
