//! Connect to a pool and print the work it hands out.
//!
//! Set `MINEWARDEN_PAYOUT_ADDRESS` (and optionally `MINEWARDEN_WORKER`) first.
//! Shares are not submitted; hashing is left to an external engine.

use minewarden_stratum::{
    PoolEndpoint, PoolManager, StratumConfig, TcpConnector, WalletConfig, WalletGuard, WorkEvent,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("minewarden_stratum=debug")
        .init();

    let config = StratumConfig {
        pools: vec![
            // Replace with real pool addresses
            PoolEndpoint::new("primary", "stratum+tcp://pool.example.com:3333", 0),
            PoolEndpoint::new("backup", "stratum+tcp://backup.example.com:3333", 1),
        ],
        ..Default::default()
    };

    let wallet = Arc::new(WalletGuard::new(WalletConfig::from_env("rig01")?)?);
    info!(worker = %wallet.identity(), "Starting");

    let connector = Arc::new(TcpConnector::new(&config));
    let (work_tx, mut work_rx) = mpsc::channel(64);
    let (pool, _task) = PoolManager::start(config, wallet, connector, work_tx)?;

    loop {
        tokio::select! {
            event = work_rx.recv() => match event {
                Some(WorkEvent::NewJob(work)) => info!(
                    endpoint = %work.endpoint,
                    job_id = %work.job.job_id,
                    difficulty = %work.difficulty,
                    "New job"
                ),
                Some(WorkEvent::Reset) => info!("Work reset"),
                Some(other) => info!("{:?}", other),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(status = ?pool.status(), "Shutting down");
    pool.shutdown().await;
    Ok(())
}
