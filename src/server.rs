//! TCP listener and connection handling.
//!
//! Glues the pipeline together: accepts syslog connections, runs the line
//! codec and parser over each, and publishes parsed events into the shared
//! bounded queue. Hosts the batcher task and the shipper worker pool.
//!
//! # Connection lifecycle
//! A handler streams until EOF, a socket error, an oversize line, or server
//! shutdown. Malformed lines never kill a connection; a full queue blocks
//! the enqueue, which surfaces to the sender as TCP backpressure. During
//! shutdown an in-flight enqueue gets `cleanup_timeout` to complete before
//! the connection is force-closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::batcher;
use crate::bigquery::BigQuery;
use crate::codec::{LineCodec, LineError};
use crate::config::{Settings, TableRef};
use crate::event::DownloadEvent;
use crate::metrics::Metrics;
use crate::parser::{self, ParseSkip};
use crate::shipper;

/// Run the ingestion server on an already-bound listener until `shutdown`
/// flips to true, then drain: stop accepting, give each connection its
/// cleanup window, flush the partial batch, and let the shipper pool finish.
pub async fn run(
    listener: TcpListener,
    settings: Settings,
    client: BigQuery,
    table: TableRef,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) {
    let (queue_tx, queue_rx) = mpsc::channel::<DownloadEvent>(settings.queued_events);
    let (handoff_tx, handoff_rx) = mpsc::channel(settings.api_max_connections);

    let mut workers = JoinSet::new();
    let handoff_rx = shipper::shared_handoff(handoff_rx);
    for id in 0..settings.api_max_connections {
        workers.spawn(shipper::worker(
            id,
            handoff_rx.clone(),
            client.clone(),
            table.clone(),
            settings.retry.clone(),
            metrics.clone(),
        ));
    }

    let batcher = tokio::spawn(batcher::run(
        queue_rx,
        handoff_tx,
        settings.batch_size,
        settings.batch_timeout,
    ));

    let connection = Arc::new(ConnectionParams {
        token: settings.token.clone(),
        max_line_size: settings.max_line_size,
        recv_size: settings.recv_size,
        cleanup_timeout: settings.cleanup_timeout,
        queued_events: settings.queued_events,
    });

    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped sender counts as a shutdown request.
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutdown requested, no longer accepting connections");
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    handlers.spawn(handle_connection(
                        stream,
                        peer,
                        queue_tx.clone(),
                        connection.clone(),
                        metrics.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    drop(listener);

    // Handlers observe the same shutdown signal and drain themselves.
    while handlers.join_next().await.is_some() {}

    // With every producer gone the queue closes, the batcher flushes its
    // partial batch and exits, closing the handoff; the workers then drain
    // whatever is buffered and finish their in-flight deliveries.
    drop(queue_tx);
    if let Err(e) = batcher.await {
        warn!(error = %e, "batcher task failed");
    }
    while workers.join_next().await.is_some() {}
    info!("server drained");
}

struct ConnectionParams {
    token: Option<String>,
    max_line_size: usize,
    recv_size: usize,
    cleanup_timeout: Duration,
    queued_events: usize,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    queue: mpsc::Sender<DownloadEvent>,
    params: Arc<ConnectionParams>,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%peer, "connection opened");
    metrics.connection_opened();

    let mut lines = FramedRead::with_capacity(
        stream,
        LineCodec::new(params.max_line_size),
        params.recv_size,
    );

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(%peer, "draining connection for shutdown");
                    break;
                }
            }
            framed = lines.next() => match framed {
                None => {
                    debug!(%peer, "connection closed by peer");
                    break;
                }
                Some(Err(LineError::TooLong(limit))) => {
                    warn!(%peer, limit, "closing connection: line too long");
                    metrics.incr("connections.line_too_long");
                    break;
                }
                Some(Err(LineError::Io(e))) => {
                    warn!(%peer, error = %e, "closing connection: socket error");
                    break;
                }
                Some(Ok(line)) => match parser::parse_line(&line, params.token.as_deref()) {
                    Ok(event) => {
                        metrics.incr("events.parsing.succeeded");
                        match enqueue(&queue, event, &mut shutdown, params.cleanup_timeout).await {
                            EnqueueOutcome::Sent => {
                                let depth = params.queued_events - queue.capacity();
                                metrics.gauge("queue.depth", depth as u64);
                            }
                            EnqueueOutcome::Closed => break,
                            EnqueueOutcome::TimedOut => {
                                warn!(%peer, "cleanup timeout while draining, force-closing");
                                break;
                            }
                        }
                    }
                    Err(ParseSkip::AuthReject) => {
                        metrics.incr("events.rejected.auth");
                    }
                    Err(skip) => {
                        debug!(%peer, %skip, "discarding line");
                        metrics.incr("events.parsing.failed");
                    }
                },
            },
        }
    }

    metrics.connection_closed();
    debug!(%peer, "connection closed");
}

enum EnqueueOutcome {
    Sent,
    Closed,
    TimedOut,
}

// Publish one event into the shared queue. A full queue blocks indefinitely
// while the server is up (that is the backpressure contract); once shutdown
// begins the wait is bounded by `cleanup_timeout`.
async fn enqueue(
    queue: &mpsc::Sender<DownloadEvent>,
    event: DownloadEvent,
    shutdown: &mut watch::Receiver<bool>,
    cleanup_timeout: Duration,
) -> EnqueueOutcome {
    let send = queue.send(event);
    tokio::pin!(send);

    if !*shutdown.borrow() {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {}
            sent = &mut send => {
                return match sent {
                    Ok(()) => EnqueueOutcome::Sent,
                    Err(_) => EnqueueOutcome::Closed,
                };
            }
        }
    }

    match tokio::time::timeout(cleanup_timeout, &mut send).await {
        Ok(Ok(())) => EnqueueOutcome::Sent,
        Ok(Err(_)) => EnqueueOutcome::Closed,
        Err(_) => EnqueueOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn enqueue_blocks_until_the_consumer_drains() {
        let (tx, mut rx) = mpsc::channel::<DownloadEvent>(1);
        let (_sd_tx, sd_rx) = watch::channel(false);

        // Fill the queue.
        tx.send(sample_event()).await.unwrap();

        let tx2 = tx.clone();
        let mut sd2 = sd_rx.clone();
        let blocked = tokio::spawn(async move {
            enqueue(&tx2, sample_event(), &mut sd2, Duration::from_secs(30)).await
        });

        // The producer cannot finish while the queue is full.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!blocked.is_finished());

        // One dequeue releases it.
        rx.recv().await.unwrap();
        assert!(matches!(blocked.await.unwrap(), EnqueueOutcome::Sent));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_times_out_during_shutdown() {
        let (tx, _rx_keepalive) = mpsc::channel::<DownloadEvent>(1);
        let (sd_tx, mut sd_rx) = watch::channel(false);

        tx.send(sample_event()).await.unwrap();
        sd_tx.send(true).unwrap();

        let outcome = enqueue(&tx, sample_event(), &mut sd_rx, Duration::from_millis(100)).await;
        assert!(matches!(outcome, EnqueueOutcome::TimedOut));
    }

    #[tokio::test]
    async fn enqueue_reports_closed_queue() {
        let (tx, rx) = mpsc::channel::<DownloadEvent>(1);
        drop(rx);
        let (_sd_tx, mut sd_rx) = watch::channel(false);
        let outcome = enqueue(&tx, sample_event(), &mut sd_rx, Duration::from_secs(1)).await;
        assert!(matches!(outcome, EnqueueOutcome::Closed));
    }

    fn sample_event() -> DownloadEvent {
        crate::parser::parse_line(
            "<134>2024-01-01T00:00:00Z cache-fra19132 linehaul[1]: 2|2024-01-01T00:00:00Z|/packages/ab/cd/requests-2.31.0-py3-none-any.whl|||US|uv/0.4.18",
            None,
        )
        .unwrap()
    }
}
