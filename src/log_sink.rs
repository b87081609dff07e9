//! Per-game transcript sink. While a game is in progress, driver-level
//! events are appended to `log/<gameId>` via a `tokio::task_local!` scope,
//! so `log_sink::log(...)` doesn't need a file handle threaded through
//! every call.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

tokio::task_local! {
    static CURRENT_LOG: RefCell<Option<File>>;
}

pub async fn with_log_file<F>(path: &Path, fut: F) -> Result<F::Output>
where
    F: std::future::Future,
{
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening transcript {path:?}"))?;
    Ok(CURRENT_LOG.scope(RefCell::new(Some(file)), fut).await)
}

pub fn log(message: &str) {
    let wrote = CURRENT_LOG
        .try_with(|cell| {
            if let Some(file) = cell.borrow_mut().as_mut() {
                let timestamp = chrono::Utc::now().to_rfc3339();
                let _ = writeln!(file, "{timestamp} {message}");
                true
            } else {
                false
            }
        })
        .unwrap_or(false);

    if !wrote {
        log::info!("{message}");
    }
}
