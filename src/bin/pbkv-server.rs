use std::net::SocketAddr;

use clap::Parser;
use pbkv::PbServer;
use tokio::signal::ctrl_c;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    /// Address this replica listens on. Doubles as its identity with the
    /// view service.
    #[clap(long, default_value = "127.0.0.1:4000")]
    addr: SocketAddr,

    /// Address of the view service.
    #[clap(long, default_value = "127.0.0.1:5000")]
    viewservice: String,

    #[clap(long, default_value = "info", env = "PBKV_LOG")]
    log_level: tracing_subscriber::filter::LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level)
        .init();

    info!(
        "pbkv-server version: {}, view service: {}",
        env!("CARGO_PKG_VERSION"),
        app.viewservice
    );

    let server = PbServer::new(app.addr, &app.viewservice)?;
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
