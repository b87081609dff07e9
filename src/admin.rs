//! Opens the store, builds the `Server`, and evicts whatever is already
//! listening on our port before binding it ourselves.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::driver::NumberGuessDriver;
use crate::persistence::Store;
use crate::state::Server;
use std::sync::Arc;

pub async fn init_service(data_dir: &Path, port: u16, admin_password: &str) -> Result<Arc<Server>> {
    let store = Store::open(data_dir).with_context(|| format!("opening store at {data_dir:?}"))?;
    let server = Server::new(store, admin_password.to_string(), Box::new(NumberGuessDriver))
        .context("initializing server state")?;

    if let Err(e) = perform_takeover(port, admin_password).await {
        log::warn!("graceful takeover attempt did not complete cleanly: {e:#}");
    }
    wait_until_port_free(port).await?;

    Ok(server)
}

/// Any deviation from the expected handshake is treated as "nothing was
/// listening" rather than a hard error, since that's the common case on a
/// cold start.
async fn perform_takeover(port: u16, admin_password: &str) -> Result<()> {
    let stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => return Ok(()),
        Err(e) => return Err(e).context("connecting to incumbent instance"),
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    reader.read_line(&mut line).await.context("reading banner")?;
    if !line.starts_with("100 ") {
        bail!("unexpected banner from incumbent: {line:?}");
    }

    write_half
        .write_all(format!("me admin {admin_password}\n").as_bytes())
        .await
        .context("sending admin login")?;
    line.clear();
    reader.read_line(&mut line).await.context("reading login reply")?;
    if !line.starts_with("201 ") {
        bail!("incumbent rejected admin login: {line:?}");
    }

    write_half.write_all(b"stop\n").await.context("sending stop")?;
    line.clear();
    reader.read_line(&mut line).await.context("reading stop reply")?;
    if !line.starts_with("205 ") {
        bail!("incumbent rejected stop: {line:?}");
    }

    Ok(())
}

/// Poll until nothing answers on `port`, so our own bind doesn't race the
/// incumbent's shutdown.
async fn wait_until_port_free(port: u16) -> Result<()> {
    for _ in 0..50 {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => return Ok(()),
            _ => sleep(Duration::from_millis(100)).await,
        }
    }
    Err(anyhow!("port {port} still occupied after waiting for takeover to complete"))
}
