use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use kcpnet::{Client, ClientConfig, SessionHandler, Sid};
use tokio::time::{sleep, Duration};
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    #[clap(default_value = "127.0.0.1:17555")]
    server_address: String,

    #[clap(long, default_value_t = 10)]
    num_messages: u32,

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

    let server_addr: SocketAddr = args.server_address.parse()?;
    let client = Client::new(Arc::new(ClientConfig::default()), Arc::new(LoggingHandler));
    client.start(server_addr).await?;

    if !client.connect().await {
        return Err(anyhow!("could not connect to {:?}", server_addr));
    }
    info!("connected as session {:?}", client.sid().await);

    for i in 0..args.num_messages {
        let msg = format!("Message {} from client", i);
        client.send_message(msg.as_bytes()).await;
        sleep(Duration::from_millis(100)).await;
    }

    // give KCP time to deliver and receive acknowledgements
    sleep(Duration::from_secs(1)).await;
    client.close().await;
    Ok(())
}
