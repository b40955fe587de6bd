use std::net::SocketAddr;
use std::time::Duration;
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tracing::{info, Level};
use telemetry_sender::config::SenderConfig;
use telemetry_sender::sender::TcpSender;

/// Forwards lines from stdin to a collector, one message per line (including the line break).
///  Stop and restart the collector to watch the sender reconnect.
///
/// Try it with `nc -lk 8124` as a collector.
#[derive(Parser, Debug)]
struct Args {
    /// collector address
    #[arg(long, default_value = "127.0.0.1:8124")]
    collector: SocketAddr,

    /// sent as the first line of every connection
    #[arg(long, default_value = "demo-session")]
    session: String,

    #[arg(long, default_value_t = 1000)]
    reconnect_millis: u64,

    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::TRACE } else { Level::INFO })
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = SenderConfig::new(args.collector, format!("{}\n", args.session));
    config.reconnect_initial_interval = Duration::from_millis(args.reconnect_millis);
    config.reconnect_max_interval = Duration::from_millis(args.reconnect_millis);

    let mut sender = TcpSender::new(Handle::current(), config)?;
    sender.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !sender.status().is_connected() {
            info!("not connected to {:?} - this line is dropped", sender.endpoint());
        }
        sender.send(Bytes::from(format!("{}\n", line)));
    }

    info!("end of input");
    Ok(())
}
