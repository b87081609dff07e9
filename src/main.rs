use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use imcs::admin::init_service;
use imcs::config::Cli;
use imcs::session::handle_connection;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let server = init_service(&cli.data_dir, cli.port, &cli.admin_password)
        .await
        .context("initializing service")?;

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("binding port {}", cli.port))?;
    info!("listening on port {}", cli.port);

    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        let server = server.clone();
        let client_id = server.next_client_id();
        log::debug!("accepted connection {client_id} from {peer}");
        tokio::spawn(async move {
            handle_connection(server, stream, client_id).await;
        });
    }
}
