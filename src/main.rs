use anyhow::Result;
use clap::Parser;
use pgbridge::config::Config;
use pgbridge::server::ProxyServer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .init();

    let server = ProxyServer::new(config)?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        shutdown.cancel();
    });

    server.run().await
}
