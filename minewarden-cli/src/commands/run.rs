use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use minewarden_core::{Miner, MinerHandle};
use minewarden_stratum::{TcpConnector, WalletGuard};

use crate::config::{load_config, load_wallet};
use crate::engine::{self, EngineMode};
use crate::status_file::write_status;
use crate::watch;

/// Source name reported when the config file carries a wallet
pub const CONFIG_FILE_SOURCE: &str = "config file";

/// Connect to the configured pools and mine
#[derive(Args)]
pub struct RunArgs {
    /// TOML file holding payout_address and worker_name
    #[arg(long, env = "MINEWARDEN_WALLET_FILE")]
    pub wallet_file: Option<PathBuf>,

    /// Hash engine bridge
    #[arg(long, value_enum, default_value_t = EngineMode::Stdio)]
    pub engine: EngineMode,

    /// Write the status snapshot here as JSON
    #[arg(long, env = "MINEWARDEN_STATUS_FILE")]
    pub status_file: Option<PathBuf>,

    /// Seconds between status reports
    #[arg(long, default_value_t = 30)]
    pub status_interval: u64,

    /// Do not watch the config file for changes
    #[arg(long)]
    pub no_watch: bool,
}

pub async fn execute(args: RunArgs, config_path: &Path) -> Result<()> {
    let file = load_config(config_path)?;
    let wallet = Arc::new(
        WalletGuard::new(load_wallet(args.wallet_file.as_deref())?).context("Invalid wallet")?,
    );

    let config = file.miner_config();
    let connector = Arc::new(TcpConnector::new(&config.stratum));
    let (miner, engine_channels) = Miner::start_with_feed_config(config, wallet, connector)?;
    let miner = Arc::new(miner);

    if let Some(attempted) = &file.wallet {
        // Refused and logged; mining continues with the trusted wallet
        let _ = miner.update_wallet(CONFIG_FILE_SOURCE, attempted);
    }

    let cancel = CancellationToken::new();
    let engine_task = tokio::spawn(engine::run(args.engine, engine_channels, cancel.clone()));

    let _watcher = if args.no_watch {
        None
    } else {
        match watch::spawn(config_path.to_path_buf(), miner.clone(), cancel.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Config file watch unavailable: {:#}", e);
                None
            }
        }
    };

    let mut report = interval(Duration::from_secs(args.status_interval.max(1)));
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                info!("Interrupted, shutting down");
                break;
            }
            _ = report.tick() => report_status(&miner, args.status_file.as_deref()),
        }
    }

    miner.shutdown().await;
    report_status(&miner, args.status_file.as_deref());

    cancel.cancel();
    match engine_task.await {
        Ok(Err(e)) => warn!("Engine bridge failed: {:#}", e),
        Err(e) => warn!("Engine bridge task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

fn report_status(miner: &MinerHandle, status_file: Option<&Path>) {
    let status = miner.status();
    if status.pool.no_pool_reachable {
        warn!("{}", status.summary());
    } else {
        info!("{}", status.summary());
    }

    let tripped = status.tripped_endpoints();
    if !tripped.is_empty() {
        info!(endpoints = ?tripped, "Circuit breakers not closed");
    }

    if let Some(path) = status_file {
        if let Err(e) = write_status(path, &status) {
            warn!("Failed to write status file: {:#}", e);
        }
    }
}
