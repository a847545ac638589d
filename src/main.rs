// linehaul: Listens for syslog download events and loads them into BigQuery.

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use linehaul::bigquery::{BigQuery, BigQueryBuilder};
use linehaul::cli::{Cli, Command, CredentialArgs, MigrateArgs, ServerArgs};
use linehaul::config::{Credentials, Settings, TableRef};
use linehaul::metrics::Metrics;
use linehaul::server;

// BigQuery schema the migrate command synchronizes the table to.
const SCHEMA_JSON: &str = include_str!("schema.json");

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "linehaul starting");

    let metrics = match Metrics::new(
        &cli.datadog_host,
        cli.datadog_port,
        cli.datadog_namespace.as_deref(),
    ) {
        Ok(metrics) => metrics,
        Err(e) => fatal(&format!("failed to configure DogStatsD: {e}")),
    };

    let result = match cli.command {
        Command::Server(args) => run_server(args, metrics).await,
        Command::Migrate(args) => run_migrate(args).await,
    };

    if let Err(e) = result {
        fatal(&e.to_string());
    }
}

fn fatal(message: &str) -> ! {
    eprintln!("FATAL: {message}");
    std::process::exit(1);
}

async fn run_server(
    args: ServerArgs,
    metrics: Metrics,
) -> Result<(), Box<dyn std::error::Error>> {
    let table: TableRef = args.table.parse()?;
    let settings = args.settings();
    let client = build_client(&args.credentials, Some(&settings))?;

    log_settings(&settings);

    let listener = TcpListener::bind((settings.bind, settings.port)).await?;
    info!(bind = %settings.bind, port = settings.port, table = %table, "listening for syslog connections");

    let shutdown = spawn_signal_listener();
    server::run(listener, settings, client, table, metrics, shutdown).await;
    info!("linehaul stopped");
    Ok(())
}

async fn run_migrate(args: MigrateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let table: TableRef = args.table.parse()?;
    let client = build_client(&args.credentials, None)?;
    let fields: serde_json::Value = serde_json::from_str(SCHEMA_JSON)?;
    client.update_schema(&table, &fields).await?;
    info!(table = %table, "table schema synchronized");
    Ok(())
}

fn build_client(
    credentials: &CredentialArgs,
    settings: Option<&Settings>,
) -> Result<BigQuery, Box<dyn std::error::Error>> {
    let credentials = Credentials::load(
        credentials.credentials_file.as_deref(),
        credentials.credentials_blob.as_deref(),
    )?;
    let mut builder = BigQueryBuilder::default();
    builder.set_credentials(credentials);
    if let Some(settings) = settings {
        builder
            .set_timeout(settings.api_timeout)
            .set_max_connections(settings.api_max_connections);
    }
    Ok(builder.build()?)
}

// Echo the effective configuration so a misconfigured deployment is obvious
// from the debug log. The token is never written out.
fn log_settings(settings: &Settings) {
    debug!(
        bind = %settings.bind,
        port = settings.port,
        token = settings.token.as_ref().map(|_| "**********").unwrap_or("<unset>"),
        max_line_size = settings.max_line_size,
        recv_size = settings.recv_size,
        cleanup_timeout_s = settings.cleanup_timeout.as_secs(),
        queued_events = settings.queued_events,
        batch_size = settings.batch_size,
        batch_timeout_s = settings.batch_timeout.as_secs(),
        retry_max_attempts = settings.retry.max_attempts,
        retry_max_wait_s = settings.retry.max_wait.as_secs_f64(),
        retry_multiplier = settings.retry.multiplier,
        api_timeout_s = settings.api_timeout.as_secs(),
        api_max_connections = settings.api_max_connections,
        "configuration",
    );
}

// SIGINT and SIGTERM both begin a graceful drain; the watch channel fans the
// signal out to the acceptor and every connection handler.
fn spawn_signal_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
