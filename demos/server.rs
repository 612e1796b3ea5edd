use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use kcpnet::{Server, ServerConfig, SessionHandler, Sid};
use tokio::select;
use tokio::signal::ctrl_c;
use tokio::time::{interval, Duration};
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    #[clap(default_value = "127.0.0.1:17555")]
    address: String,

    /// interval for broadcasting a message to all clients, 0 for no broadcast
    #[clap(long, default_value_t = 0)]
    broadcast_interval_secs: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoggingHandler;

#[async_trait]
impl SessionHandler for LoggingHandler {
    async fn on_message(&self, sid: Sid, from: SocketAddr, msg: Vec<u8>) {
        info!("session {} ({:?}): {}", sid, from, String::from_utf8_lossy(&msg));
    }

    async fn on_session_created(&self, sid: Sid, remote_addr: SocketAddr) {
        info!("new session {} with {:?}", sid, remote_addr);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let addr: SocketAddr = args.address.parse()?;
    let server = Server::new(Arc::new(ServerConfig::default()), Arc::new(LoggingHandler));
    server.start(addr).await?;

    if args.broadcast_interval_secs == 0 {
        ctrl_c().await?;
    }
    else {
        let mut ticks = interval(Duration::from_secs(args.broadcast_interval_secs));
        let mut counter = 0u64;
        loop {
            select! {
                r = ctrl_c() => {
                    r?;
                    break;
                }
                _ = ticks.tick() => {
                    counter += 1;
                    let msg = format!("Broadcast {} from server", counter);
                    server.broadcast_message(msg.as_bytes()).await;
                }
            }
        }
    }

    info!("shutting down with {} sessions", server.session_count().await);
    server.close().await;
    Ok(())
}
