use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use amqprims_client::{Connection, ConnectionConfig, Credentials};
use clap::{Args, Subcommand};
use tracing::debug;

use crate::exit::{client_error, io_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod consume;
pub mod declare_queue;
pub mod info;
pub mod publish;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and print negotiated tunables and server properties.
    Info(InfoArgs),
    /// Declare a queue and print its message and consumer counts.
    DeclareQueue(DeclareQueueArgs),
    /// Publish one message.
    Publish(PublishArgs),
    /// Consume from a queue and print deliveries.
    Consume(ConsumeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Info(args) => block_on(info::run(args, format)),
        Command::DeclareQueue(args) => block_on(declare_queue::run(args, format)),
        Command::Publish(args) => block_on(publish::run(args, format)),
        Command::Consume(args) => block_on(consume::run(args, format)),
        Command::Version(args) => version::run(args),
    }
}

fn block_on<F>(fut: F) -> CliResult<i32>
where
    F: Future<Output = CliResult<i32>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start runtime", &err))?;
    runtime.block_on(fut)
}

/// Broker connection settings shared by every networked subcommand.
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Broker host.
    #[arg(long, env = "AMQP_HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// Broker port.
    #[arg(long, env = "AMQP_PORT", default_value_t = amqprims_transport::DEFAULT_PORT)]
    pub port: u16,
    /// User name for PLAIN authentication.
    #[arg(long, env = "AMQP_USER", default_value = "guest")]
    pub user: String,
    /// Password for PLAIN authentication.
    #[arg(long, env = "AMQP_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub password: String,
    /// Virtual host.
    #[arg(long, env = "AMQP_VHOST", default_value = "/")]
    pub vhost: String,
    /// Requested heartbeat interval in seconds (0 disables heartbeats).
    #[arg(long, env = "AMQP_HEARTBEAT", default_value_t = 60)]
    pub heartbeat: u16,
    /// Requested maximum frame size in bytes.
    #[arg(long, env = "AMQP_FRAME_MAX", default_value_t = 131_072)]
    pub frame_max: u32,
    /// Connect, handshake and per-call timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

impl ConnectArgs {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn config(&self) -> CliResult<ConnectionConfig> {
        let timeout = parse_duration(&self.timeout)?;
        Ok(ConnectionConfig::default()
            .with_credentials(Credentials::new(&self.user, &self.password))
            .with_virtual_host(&self.vhost)
            .with_heartbeat(self.heartbeat)
            .with_frame_max(self.frame_max)
            .with_connection_name(format!("amqprims-cli/{}", env!("CARGO_PKG_VERSION")))
            .with_handshake_timeout(timeout)
            .with_close_timeout(timeout)
            .with_rpc_timeout(timeout))
    }

    pub async fn connect(&self) -> CliResult<Connection> {
        let config = self.config()?;
        let addr = self.addr();
        debug!(%addr, vhost = %self.vhost, "connecting");
        Connection::connect(&addr, config)
            .await
            .map_err(|err| client_error("connect failed", err))
    }
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub conn: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct DeclareQueueArgs {
    /// Queue name. Empty asks the broker to generate one.
    #[arg(default_value = "")]
    pub queue: String,
    /// Only check that the queue exists.
    #[arg(long)]
    pub passive: bool,
    /// Survive a broker restart.
    #[arg(long)]
    pub durable: bool,
    /// Restrict the queue to this connection.
    #[arg(long)]
    pub exclusive: bool,
    /// Delete the queue once its last consumer is gone.
    #[arg(long)]
    pub auto_delete: bool,
    #[command(flatten)]
    pub conn: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Exchange to publish to. Empty is the default exchange.
    #[arg(long, short = 'e', default_value = "")]
    pub exchange: String,
    /// Routing key (the queue name when using the default exchange).
    #[arg(long, short = 'k')]
    pub routing_key: String,
    /// Message body as a string.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read the message body from a file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Content type property.
    #[arg(long)]
    pub content_type: Option<String>,
    /// Mark the message persistent.
    #[arg(long)]
    pub persistent: bool,
    /// Ask the broker to return the message if it cannot be routed.
    #[arg(long)]
    pub mandatory: bool,
    /// Enable publisher confirms and wait for the broker's ack.
    #[arg(long)]
    pub confirm: bool,
    #[command(flatten)]
    pub conn: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct ConsumeArgs {
    /// Queue to consume from.
    pub queue: String,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Let the broker consider messages acknowledged on delivery.
    #[arg(long)]
    pub no_ack: bool,
    /// Maximum unacknowledged deliveries in flight.
    #[arg(long)]
    pub prefetch: Option<u16>,
    #[command(flatten)]
    pub conn: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
