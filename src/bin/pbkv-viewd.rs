use std::net::SocketAddr;

use clap::Parser;
use pbkv::ViewServer;
use tokio::signal::ctrl_c;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    /// Address this view service listens on. Its identity, as far as the
    /// replicas are concerned.
    #[clap(long, default_value = "127.0.0.1:5000")]
    addr: SocketAddr,

    #[clap(long, default_value = "info", env = "PBKV_LOG")]
    log_level: tracing_subscriber::filter::LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level)
        .init();

    info!("pbkv-viewd version: {}", env!("CARGO_PKG_VERSION"));

    let server = ViewServer::new(app.addr);
    let handle = server.clone();
    tokio::spawn(async move {
        match ctrl_c().await {
            Ok(_) => info!("received shutdown signal"),
            Err(e) => error!("error receiving ctrl-c: {e}"),
        };
        handle.kill();
    });

    server.run().await?;
    Ok(())
}
