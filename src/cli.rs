//! Command-line surface.
//!
//! `linehaul server <TABLE>` runs the ingestion daemon in the foreground;
//! `linehaul migrate <TABLE>` synchronizes the BigQuery table schema and
//! exits. Every option can also be supplied through a `LINEHAUL_*`
//! environment variable.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{RetryPolicy, Settings};

#[derive(Debug, Parser)]
#[command(
    name = "linehaul",
    version,
    about = "The Linehaul statistics daemon.",
    long_about = "Linehaul is a daemon that implements the syslog protocol, listening for \
                  specially formatted messages corresponding to download events of Python \
                  packages. For each event it receives it processes them, and then loads \
                  them into a BigQuery database."
)]
pub struct Cli {
    /// The verbosity of the console logger.
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// The host where the DogStatsD instance is located.
    #[arg(long, global = true, value_name = "ADDR", default_value = "127.0.0.1")]
    pub datadog_host: String,

    /// The port that the DogStatsD instance is listening on.
    #[arg(long, global = true, value_name = "PORT", default_value_t = 8125)]
    pub datadog_port: u16,

    /// The namespace for DataDog metrics.
    #[arg(long, global = true)]
    pub datadog_namespace: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Spew,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The equivalent `tracing` filter directive.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Spew => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the Linehaul server.
    ///
    /// Starts a server in the foreground that listens for incoming syslog
    /// events, processes them, and then inserts them into the BigQuery table
    /// at TABLE.
    Server(ServerArgs),
    /// Synchronizes the BigQuery table schema.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// The IP address to bind to.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// The port to bind to.
    #[arg(long, value_name = "PORT", default_value_t = 512)]
    pub port: u16,

    /// A token used to authenticate a remote syslog stream.
    #[arg(long, env = "LINEHAUL_TOKEN")]
    pub token: Option<String>,

    /// The maximum length in bytes of a single incoming syslog event.
    #[arg(long, value_name = "BYTES", default_value_t = 16384)]
    pub max_line_size: usize,

    /// How many bytes to read per recv.
    #[arg(long, value_name = "BYTES", default_value_t = 8192)]
    pub recv_size: usize,

    /// How long to wait for a connection to close gracefully.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub cleanup_timeout: u64,

    /// How many events to queue for processing before applying backpressure.
    #[arg(long, default_value_t = 10000)]
    pub queued_events: usize,

    /// The number of events to send in each BigQuery API call.
    #[arg(long, default_value_t = 500)]
    pub batch_size: usize,

    /// How long to wait before sending a smaller than --batch-size batch of
    /// events to BigQuery.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub batch_timeout: u64,

    /// The maximum number of times to retry sending a batch to BigQuery.
    #[arg(long, default_value_t = 10)]
    pub retry_max_attempts: u32,

    /// The maximum length of time to wait between retrying sending a batch
    /// to BigQuery.
    #[arg(long, value_name = "SECONDS", default_value_t = 60.0)]
    pub retry_max_wait: f64,

    /// The multiplier for exponential back off between retrying sending a
    /// batch to BigQuery.
    #[arg(long, value_name = "SECONDS", default_value_t = 0.5)]
    pub retry_multiplier: f64,

    /// How long to wait for a single API call to BigQuery to complete.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub api_timeout: u64,

    /// Maximum number of concurrent connections to BigQuery.
    #[arg(long, default_value_t = 30)]
    pub api_max_connections: usize,

    /// BigQuery table identifier of the form ProjectId.DataSetId.TableId.
    #[arg(value_name = "TABLE")]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// BigQuery table identifier of the form ProjectId.DataSetId.TableId.
    #[arg(value_name = "TABLE")]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct CredentialArgs {
    /// A path to the credentials JSON for a GCP service account.
    #[arg(long, value_name = "PATH", env = "LINEHAUL_CREDENTIALS_FILE")]
    pub credentials_file: Option<PathBuf>,

    /// A base64 encoded JSON blob of credentials for a GCP service account.
    #[arg(long, value_name = "BLOB", env = "LINEHAUL_CREDENTIALS_BLOB")]
    pub credentials_blob: Option<String>,
}

impl ServerArgs {
    pub fn settings(&self) -> Settings {
        Settings {
            bind: self.bind,
            port: self.port,
            token: self.token.clone(),
            max_line_size: self.max_line_size,
            recv_size: self.recv_size,
            cleanup_timeout: Duration::from_secs(self.cleanup_timeout),
            queued_events: self.queued_events,
            batch_size: self.batch_size,
            batch_timeout: Duration::from_secs(self.batch_timeout),
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                max_wait: Duration::from_secs_f64(self.retry_max_wait),
                multiplier: self.retry_multiplier,
            },
            api_timeout: Duration::from_secs(self.api_timeout),
            api_max_connections: self.api_max_connections,
        }
    }
}
