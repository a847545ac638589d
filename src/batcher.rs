//! Queue-draining batcher.
//!
//! A single task that owns the consumer half of the event queue and groups
//! events into batches, closed by whichever comes first:
//! - the batch reaches `batch_size`, or
//! - `batch_timeout` elapses after the batch's first event arrived.
//!
//! Closed batches go to the shipper pool over a small bounded handoff
//! channel; when that buffer is full the batcher blocks, which in turn fills
//! the event queue and backpressures the connections. When every producer is
//! gone (shutdown), the partial batch is flushed before the task exits.

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::event::DownloadEvent;

/// An ordered group of events delivered in one API call.
#[derive(Debug)]
pub struct Batch {
    pub events: Vec<DownloadEvent>,
    /// When the first event of this batch was pulled off the queue; bounds
    /// delivery latency.
    pub first_enqueued_at: Instant,
}

pub async fn run(
    mut queue: mpsc::Receiver<DownloadEvent>,
    handoff: mpsc::Sender<Batch>,
    batch_size: usize,
    batch_timeout: std::time::Duration,
) {
    let mut pending: Vec<DownloadEvent> = Vec::with_capacity(batch_size);
    let mut first_at: Option<Instant> = None;

    loop {
        let deadline = first_at.map(|at| at + batch_timeout);
        let deadline = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            received = queue.recv() => match received {
                Some(event) => {
                    if pending.is_empty() {
                        first_at = Some(Instant::now());
                    }
                    pending.push(event);
                    if pending.len() >= batch_size {
                        flush(&mut pending, &mut first_at, &handoff).await;
                    }
                }
                None => {
                    if !pending.is_empty() {
                        flush(&mut pending, &mut first_at, &handoff).await;
                    }
                    info!("event queue closed, batcher exiting");
                    return;
                }
            },
            () = deadline => {
                if !pending.is_empty() {
                    debug!(size = pending.len(), "closing batch on timeout");
                    flush(&mut pending, &mut first_at, &handoff).await;
                } else {
                    first_at = None;
                }
            }
        }
    }
}

async fn flush(
    pending: &mut Vec<DownloadEvent>,
    first_at: &mut Option<Instant>,
    handoff: &mpsc::Sender<Batch>,
) {
    let batch = Batch {
        events: std::mem::take(pending),
        first_enqueued_at: first_at.take().unwrap_or_else(Instant::now),
    };
    if handoff.send(batch).await.is_err() {
        // Shipper pool is gone; shutdown is already in progress.
        debug!("handoff channel closed, dropping batch");
    }
}
