//! Config file watcher.
//!
//! Edits to the config file are not applied to a running miner. A `[wallet]`
//! section appearing in the file is treated as a runtime wallet mutation
//! attempt and refused through the miner handle.

use anyhow::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use minewarden_core::MinerHandle;

use crate::config::load_config;

/// Source name reported for mutation attempts made through the file
pub const CONFIG_RELOAD_SOURCE: &str = "config file reload";

/// Start watching `path`. The returned watcher must be kept alive.
pub fn spawn(
    path: PathBuf,
    miner: Arc<MinerHandle>,
    cancel: CancellationToken,
) -> Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                let _ = tx.send(());
            }
        }
        Err(e) => warn!("Config watch error: {}", e),
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "Watching config file");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.recv() => match changed {
                    Some(()) => on_change(&path, &miner),
                    None => break,
                },
            }
        }
        debug!("Config watcher stopped");
    });

    Ok(watcher)
}

fn on_change(path: &Path, miner: &MinerHandle) {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Config file changed but could not be read: {:#}", e);
            return;
        }
    };

    match config.wallet {
        Some(attempted) => {
            // Refused and logged by the wallet guard
            let _ = miner.update_wallet(CONFIG_RELOAD_SOURCE, &attempted);
        }
        None => info!("Config file changed; restart minewarden to apply it"),
    }
}
