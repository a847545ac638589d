//! End-to-end pipeline tests: a real TCP syslog connection on one side, a
//! local stand-in for the BigQuery API on the other.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

use linehaul::bigquery::{BigQuery, BigQueryBuilder};
use linehaul::config::{RetryPolicy, Settings, TableRef};
use linehaul::metrics::Metrics;
use linehaul::server;

const WHEEL: &str = "/packages/ab/cd/requests-2.31.0-py3-none-any.whl";

// ---------------------------------------------------------------------------
// Mock warehouse
// ---------------------------------------------------------------------------

/// One recorded API call: the bearer token it carried and its JSON body.
#[derive(Debug, Clone)]
struct Recorded {
    authorization: Option<String>,
    body: Value,
}

/// Scripted response for the next insertAll call; anything unscripted
/// succeeds with an empty body.
enum Scripted {
    Status(u16),
    Body(Value),
}

#[derive(Clone)]
struct Warehouse {
    requests: Arc<Mutex<Vec<Recorded>>>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
}

impl Warehouse {
    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    async fn wait_for_requests(&self, n: usize, wait: Duration) -> Vec<Recorded> {
        let deadline = Instant::now() + wait;
        loop {
            let requests = self.requests();
            if requests.len() >= n {
                return requests;
            }
            assert!(
                Instant::now() < deadline,
                "expected {n} warehouse requests, saw {}",
                requests.len()
            );
            sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn record_and_respond(
    warehouse: Warehouse,
    headers: HeaderMap,
    body: Value,
) -> (StatusCode, Json<Value>) {
    warehouse.requests.lock().unwrap().push(Recorded {
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        body,
    });
    match warehouse.script.lock().unwrap().pop_front() {
        Some(Scripted::Status(code)) => (
            StatusCode::from_u16(code).unwrap(),
            Json(json!({ "error": { "message": "scripted failure" } })),
        ),
        Some(Scripted::Body(value)) => (StatusCode::OK, Json(value)),
        None => (StatusCode::OK, Json(json!({}))),
    }
}

async fn spawn_warehouse(script: Vec<Scripted>) -> (SocketAddr, Warehouse) {
    let warehouse = Warehouse {
        requests: Arc::new(Mutex::new(Vec::new())),
        script: Arc::new(Mutex::new(script.into())),
    };

    let app = Router::new()
        .route(
            "/bigquery/v2/projects/{project}/datasets/{dataset}/tables/{table}/insertAll",
            post(
                |State(warehouse): State<Warehouse>, headers: HeaderMap, Json(body): Json<Value>| {
                    record_and_respond(warehouse, headers, body)
                },
            ),
        )
        .route(
            "/bigquery/v2/projects/{project}/datasets/{dataset}/tables/{table}",
            patch(
                |State(warehouse): State<Warehouse>, headers: HeaderMap, Json(body): Json<Value>| {
                    record_and_respond(warehouse, headers, body)
                },
            ),
        )
        .with_state(warehouse.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, warehouse)
}

fn warehouse_client(addr: SocketAddr) -> BigQuery {
    let mut builder = BigQueryBuilder::default();
    builder
        .set_access_token("test-token")
        .set_api_root(&format!("http://{addr}"))
        .set_timeout(Duration::from_secs(5));
    builder.build().unwrap()
}

// ---------------------------------------------------------------------------
// Pipeline harness
// ---------------------------------------------------------------------------

struct Overrides {
    token: Option<&'static str>,
    max_line_size: usize,
    batch_size: usize,
    batch_timeout: Duration,
    cleanup_timeout: Duration,
    retry: RetryPolicy,
}

impl Default for Overrides {
    fn default() -> Self {
        Overrides {
            token: None,
            max_line_size: 16384,
            batch_size: 1,
            batch_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 10,
                max_wait: Duration::from_millis(50),
                multiplier: 0.01,
            },
        }
    }
}

struct Pipeline {
    addr: SocketAddr,
    warehouse: Warehouse,
    shutdown: watch::Sender<bool>,
    server: tokio::task::JoinHandle<()>,
}

async fn start_pipeline(overrides: Overrides, script: Vec<Scripted>) -> Pipeline {
    let (warehouse_addr, warehouse) = spawn_warehouse(script).await;
    let client = warehouse_client(warehouse_addr);
    let table: TableRef = "the-psf.pypi.downloads".parse().unwrap();

    let settings = Settings {
        bind: "127.0.0.1".parse().unwrap(),
        port: 0,
        token: overrides.token.map(str::to_owned),
        max_line_size: overrides.max_line_size,
        recv_size: 8192,
        cleanup_timeout: overrides.cleanup_timeout,
        queued_events: 1024,
        batch_size: overrides.batch_size,
        batch_timeout: overrides.batch_timeout,
        retry: overrides.retry,
        api_timeout: Duration::from_secs(5),
        api_max_connections: 4,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server::run(
        listener,
        settings,
        client,
        table,
        Metrics::disabled(),
        shutdown_rx,
    ));

    Pipeline {
        addr,
        warehouse,
        shutdown: shutdown_tx,
        server,
    }
}

async fn connect(pipeline: &Pipeline) -> TcpStream {
    TcpStream::connect(pipeline.addr).await.unwrap()
}

async fn send_line(stream: &mut TcpStream, line: &str) {
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    stream.flush().await.unwrap();
}

fn download_line(token: Option<&str>, timestamp: &str, url: &str, user_agent: &str) -> String {
    let prefix = token.map(|t| format!("{t} ")).unwrap_or_default();
    format!(
        "<134>{timestamp} cache-fra19132 linehaul[411617]: {prefix}2|{timestamp}|{url}|TLSv1.3|ECDHE-RSA-AES128-GCM-SHA256|US|{user_agent}"
    )
}

fn rows(recorded: &Recorded) -> &Vec<Value> {
    recorded.body["rows"].as_array().expect("rows array")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_delivers_one_parsed_row() {
    let pipeline = start_pipeline(
        Overrides {
            token: Some("T"),
            ..Overrides::default()
        },
        vec![],
    )
    .await;

    let mut conn = connect(&pipeline).await;
    send_line(
        &mut conn,
        &download_line(Some("T"), "2024-01-01T00:00:00Z", WHEEL, "pip/23.0 {\"python\":\"3.11.4\",\"installer\":{\"name\":\"pip\",\"version\":\"23.0\"}}"),
    )
    .await;

    let requests = pipeline
        .warehouse
        .wait_for_requests(1, Duration::from_secs(5))
        .await;
    let request = &requests[0];
    assert_eq!(request.authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(request.body["skipInvalidRows"], Value::Bool(false));
    assert_eq!(request.body["ignoreUnknownValues"], Value::Bool(false));

    let rows = rows(request);
    assert_eq!(rows.len(), 1);
    let row = &rows[0]["json"];
    assert_eq!(row["project"], "requests");
    assert_eq!(row["version"], "2.31.0");
    assert_eq!(row["filename"], "requests-2.31.0-py3-none-any.whl");
    assert_eq!(row["timestamp"], "2024-01-01T00:00:00Z");
    assert_eq!(row["details"]["installer"]["name"], "pip");
}

#[tokio::test]
async fn mismatched_token_lines_are_rejected_silently() {
    let pipeline = start_pipeline(
        Overrides {
            token: Some("T"),
            ..Overrides::default()
        },
        vec![],
    )
    .await;

    let mut conn = connect(&pipeline).await;
    // Wrong token first; a correctly-authenticated line afterwards proves
    // the connection survived the reject.
    send_line(
        &mut conn,
        &download_line(Some("X"), "2024-01-01T00:00:00Z", WHEEL, "uv/0.4.18"),
    )
    .await;
    send_line(
        &mut conn,
        &download_line(Some("T"), "2024-01-01T00:00:01Z", WHEEL, "uv/0.4.18"),
    )
    .await;

    let requests = pipeline
        .warehouse
        .wait_for_requests(1, Duration::from_secs(5))
        .await;
    assert_eq!(rows(&requests[0]).len(), 1);
    assert_eq!(rows(&requests[0])[0]["json"]["timestamp"], "2024-01-01T00:00:01Z");

    // Nothing else trickles in for the rejected line.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline.warehouse.requests().len(), 1);
}

#[tokio::test]
async fn oversize_line_closes_the_connection() {
    let pipeline = start_pipeline(
        Overrides {
            max_line_size: 64,
            ..Overrides::default()
        },
        vec![],
    )
    .await;

    let mut conn = connect(&pipeline).await;
    conn.write_all(&[b'a'; 65]).await.unwrap();
    conn.flush().await.unwrap();

    // The server sends nothing, so a read completes only when it closes.
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .expect("server should close the connection");
    assert_eq!(read.unwrap(), 0, "expected EOF");
    assert!(pipeline.warehouse.requests().is_empty());
}

#[tokio::test]
async fn undersized_batch_ships_on_timeout() {
    let pipeline = start_pipeline(
        Overrides {
            batch_size: 500,
            batch_timeout: Duration::from_secs(1),
            ..Overrides::default()
        },
        vec![],
    )
    .await;

    let mut conn = connect(&pipeline).await;
    let started = Instant::now();
    send_line(
        &mut conn,
        &download_line(None, "2024-01-01T00:00:00Z", WHEEL, "uv/0.4.18"),
    )
    .await;

    let requests = pipeline
        .warehouse
        .wait_for_requests(1, Duration::from_secs(10))
        .await;
    let waited = started.elapsed();
    assert_eq!(rows(&requests[0]).len(), 1);
    assert!(waited >= Duration::from_millis(800), "shipped after {waited:?}");
    assert!(waited <= Duration::from_secs(5), "shipped after {waited:?}");
}

#[tokio::test]
async fn transient_failures_retry_the_same_batch() {
    let pipeline = start_pipeline(
        Overrides::default(),
        vec![Scripted::Status(503), Scripted::Status(503)],
    )
    .await;

    let mut conn = connect(&pipeline).await;
    send_line(
        &mut conn,
        &download_line(None, "2024-01-01T00:00:00Z", WHEEL, "uv/0.4.18"),
    )
    .await;

    let requests = pipeline
        .warehouse
        .wait_for_requests(3, Duration::from_secs(5))
        .await;
    assert_eq!(requests.len(), 3);
    // The same batch, byte for byte, on every attempt.
    assert_eq!(requests[0].body, requests[1].body);
    assert_eq!(requests[1].body, requests[2].body);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.warehouse.requests().len(), 3, "no retries after success");
}

#[tokio::test]
async fn permanent_failure_drops_the_batch_and_keeps_going() {
    let pipeline = start_pipeline(Overrides::default(), vec![Scripted::Status(400)]).await;

    let mut conn = connect(&pipeline).await;
    send_line(
        &mut conn,
        &download_line(None, "2024-01-01T00:00:00Z", WHEEL, "uv/0.4.18"),
    )
    .await;
    let requests = pipeline
        .warehouse
        .wait_for_requests(1, Duration::from_secs(5))
        .await;
    assert_eq!(rows(&requests[0])[0]["json"]["timestamp"], "2024-01-01T00:00:00Z");

    // A later event still flows; the dropped batch is never resent.
    send_line(
        &mut conn,
        &download_line(None, "2024-01-01T00:00:05Z", WHEEL, "uv/0.4.18"),
    )
    .await;
    let requests = pipeline
        .warehouse
        .wait_for_requests(2, Duration::from_secs(5))
        .await;
    assert_eq!(requests.len(), 2);
    assert_eq!(rows(&requests[1])[0]["json"]["timestamp"], "2024-01-01T00:00:05Z");
}

#[tokio::test]
async fn per_row_rejects_do_not_trigger_retries() {
    let pipeline = start_pipeline(
        Overrides {
            batch_size: 2,
            ..Overrides::default()
        },
        vec![Scripted::Body(json!({
            "insertErrors": [
                { "index": 0, "errors": [{ "reason": "invalid", "message": "bad row" }] }
            ]
        }))],
    )
    .await;

    let mut conn = connect(&pipeline).await;
    send_line(
        &mut conn,
        &download_line(None, "2024-01-01T00:00:00Z", WHEEL, "uv/0.4.18"),
    )
    .await;
    send_line(
        &mut conn,
        &download_line(None, "2024-01-01T00:00:01Z", WHEEL, "uv/0.4.18"),
    )
    .await;

    let requests = pipeline
        .warehouse
        .wait_for_requests(1, Duration::from_secs(5))
        .await;
    assert_eq!(rows(&requests[0]).len(), 2);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        pipeline.warehouse.requests().len(),
        1,
        "per-row errors must not be retried"
    );
}

#[tokio::test]
async fn shutdown_flushes_the_partial_batch() {
    let pipeline = start_pipeline(
        Overrides {
            batch_size: 500,
            batch_timeout: Duration::from_secs(3600),
            ..Overrides::default()
        },
        vec![],
    )
    .await;

    let mut conn = connect(&pipeline).await;
    send_line(
        &mut conn,
        &download_line(None, "2024-01-01T00:00:00Z", WHEEL, "uv/0.4.18"),
    )
    .await;
    // Let the event reach the batcher before pulling the plug.
    sleep(Duration::from_millis(200)).await;

    pipeline.shutdown.send(true).unwrap();
    timeout(Duration::from_secs(10), pipeline.server)
        .await
        .expect("server should drain and exit")
        .unwrap();

    let requests = pipeline.warehouse.requests();
    assert_eq!(requests.len(), 1, "partial batch must flush on shutdown");
    assert_eq!(rows(&requests[0]).len(), 1);
}

#[tokio::test]
async fn events_from_one_connection_stay_ordered_within_a_batch() {
    let pipeline = start_pipeline(
        Overrides {
            batch_size: 3,
            ..Overrides::default()
        },
        vec![],
    )
    .await;

    let mut conn = connect(&pipeline).await;
    for second in 0..3 {
        send_line(
            &mut conn,
            &download_line(None, &format!("2024-01-01T00:00:0{second}Z"), WHEEL, "uv/0.4.18"),
        )
        .await;
    }

    let requests = pipeline
        .warehouse
        .wait_for_requests(1, Duration::from_secs(5))
        .await;
    let rows = rows(&requests[0]);
    assert_eq!(rows.len(), 3);
    for (second, row) in rows.iter().enumerate() {
        assert_eq!(
            row["json"]["timestamp"],
            format!("2024-01-01T00:00:0{second}Z")
        );
    }
}

#[tokio::test]
async fn migrate_patches_the_table_schema() {
    let (warehouse_addr, warehouse) = spawn_warehouse(vec![]).await;
    let client = warehouse_client(warehouse_addr);
    let table: TableRef = "the-psf.pypi.downloads".parse().unwrap();

    let fields: Value = serde_json::from_str(include_str!("../src/schema.json")).unwrap();
    client.update_schema(&table, &fields).await.unwrap();

    let requests = warehouse.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer test-token"));
    let patched = &requests[0].body["schema"]["fields"];
    assert_eq!(patched, &fields);
    assert_eq!(patched[0]["name"], "timestamp");
}
