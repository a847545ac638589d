//! Batch delivery worker pool.
//!
//! A fixed number of workers pull batches off the handoff channel and drive
//! them into BigQuery. Delivery is at-least-once: transient failures are
//! retried with capped exponential backoff and jitter, and a batch leaves a
//! worker only as delivered, partially delivered (per-row rejects dropped),
//! or dropped after the retry budget or a permanent API error.
//!
//! Batches are independent; nothing orders them across workers.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::batcher::Batch;
use crate::bigquery::{ApiError, BigQuery};
use crate::config::{RetryPolicy, TableRef};
use crate::metrics::Metrics;

/// Handle on the handoff channel shared by the worker pool. Workers take the
/// lock only long enough to pull the next batch.
pub type SharedHandoff = Arc<Mutex<mpsc::Receiver<Batch>>>;

pub fn shared_handoff(receiver: mpsc::Receiver<Batch>) -> SharedHandoff {
    Arc::new(Mutex::new(receiver))
}

/// One shipper worker. Runs until the handoff channel closes and drains.
pub async fn worker(
    id: usize,
    handoff: SharedHandoff,
    client: BigQuery,
    table: TableRef,
    retry: RetryPolicy,
    metrics: Metrics,
) {
    loop {
        let batch = handoff.lock().await.recv().await;
        let Some(batch) = batch else {
            debug!(worker = id, "handoff channel closed, worker exiting");
            return;
        };
        deliver(&client, &table, batch, &retry, &metrics).await;
    }
}

// Drive one batch to a final disposition.
async fn deliver(
    client: &BigQuery,
    table: &TableRef,
    batch: Batch,
    retry: &RetryPolicy,
    metrics: &Metrics,
) {
    let size = batch.events.len();
    for attempt in 1..=retry.max_attempts {
        let outcome = {
            let _timing = metrics.timed("bigquery.request.duration");
            client.insert_all(table, &batch.events).await
        };
        match outcome {
            Ok(result) => {
                if !result.failed.is_empty() {
                    for row in &result.failed {
                        error!(
                            index = row.index,
                            reasons = ?row.errors.iter().map(|e| e.reason.as_str()).collect::<Vec<_>>(),
                            "row rejected by BigQuery, dropping"
                        );
                    }
                    metrics.count("bigquery.rows.dropped", result.failed.len() as i64);
                }
                metrics.count("bigquery.rows.sent", result.delivered as i64);
                metrics.incr("batches.sent");
                debug!(size, attempt, "batch delivered");
                return;
            }
            Err(ApiError::Permanent { status, body }) => {
                error!(size, status, body = %body, "batch rejected permanently, dropping");
                metrics.incr("batches.dropped");
                return;
            }
            Err(ApiError::Transient(reason)) => {
                if attempt == retry.max_attempts {
                    break;
                }
                metrics.incr("batches.retried");
                let wait = retry.backoff(attempt);
                warn!(size, attempt, %reason, wait_ms = wait.as_millis() as u64, "transient delivery failure, backing off");
                tokio::time::sleep(wait).await;
            }
        }
    }
    error!(size, attempts = retry.max_attempts, "retry budget exhausted, dropping batch");
    metrics.incr("batches.dropped");
}
