use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use minewarden_stratum::{
    Connector, PoolHandle, PoolManager, StratumConfig, WalletConfig, WalletGuard, WorkEvent,
};

use crate::{
    error::{MinerError, Result},
    feed::{FeedConfig, ProfitabilityFeed},
    guardian::{EconomicGuardian, GuardianConfig, GuardianStatus, PauseFlag},
    status::MiningStatus,
    submitter::{Candidate, ShareCounters, ShareSubmitter, SubmitterConfig},
};

/// Buffered work events between the pool manager and the submitter
const WORK_CHANNEL_CAPACITY: usize = 256;

/// Miner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Pool endpoints and protocol tunables
    pub stratum: StratumConfig,

    #[serde(default)]
    pub submitter: SubmitterConfig,

    #[serde(default)]
    pub guardian: GuardianConfig,

    /// Profitability source polled by the guardian
    #[serde(default)]
    pub feed: FeedConfig,

    /// Capacity of the engine-facing channels
    #[serde(default = "default_engine_channel_capacity")]
    pub engine_channel_capacity: usize,
}

fn default_engine_channel_capacity() -> usize { 1024 }

impl MinerConfig {
    pub fn new(stratum: StratumConfig) -> Self {
        Self {
            stratum,
            submitter: SubmitterConfig::default(),
            guardian: GuardianConfig::default(),
            feed: FeedConfig::default(),
            engine_channel_capacity: default_engine_channel_capacity(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.stratum.validate()?;

        if self.guardian.enabled && self.guardian.tick_interval_secs == 0 {
            return Err(MinerError::InvalidConfiguration(
                "guardian.tick_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.guardian.consecutive_ticks == 0 {
            return Err(MinerError::InvalidConfiguration(
                "guardian.consecutive_ticks must be at least 1".to_string(),
            ));
        }
        if !self.guardian.min_margin.is_finite() {
            return Err(MinerError::InvalidConfiguration(
                "guardian.min_margin must be a finite number".to_string(),
            ));
        }
        if self.submitter.duplicate_filter_jobs == 0 || self.engine_channel_capacity == 0 {
            return Err(MinerError::InvalidConfiguration(
                "submitter.duplicate_filter_jobs and engine_channel_capacity must be non-zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Engine side of the miner: work out, candidates in
pub struct EngineChannels {
    pub work_rx: mpsc::Receiver<WorkEvent>,
    pub candidate_tx: mpsc::Sender<Candidate>,
}

/// Entry point wiring the pool manager, submitter and guardian together
pub struct Miner;

impl Miner {
    /// Spawn every miner task. Must be called inside a tokio runtime.
    pub fn start(
        config: MinerConfig,
        wallet: Arc<WalletGuard>,
        connector: Arc<dyn Connector>,
        feed: Arc<dyn ProfitabilityFeed>,
    ) -> Result<(MinerHandle, EngineChannels)> {
        config.validate()?;
        info!(
            identity = wallet.identity(),
            pools = config.stratum.pools.len(),
            guardian = config.guardian.enabled,
            "Starting miner"
        );

        let cancel = CancellationToken::new();
        let pause = PauseFlag::new();

        let (pool_work_tx, pool_work_rx) = mpsc::channel(WORK_CHANNEL_CAPACITY);
        let (pool, pool_task) =
            PoolManager::start(config.stratum.clone(), wallet.clone(), connector, pool_work_tx)?;

        let (engine_tx, work_rx) = mpsc::channel(config.engine_channel_capacity);
        let (candidate_tx, candidate_rx) = mpsc::channel(config.engine_channel_capacity);

        let submitter = ShareSubmitter::new(&config.submitter, pool.clone(), pause.clone());
        let counters = submitter.counters();
        let submitter_task = tokio::spawn(submitter.run(
            pool_work_rx,
            engine_tx,
            candidate_rx,
            cancel.clone(),
        ));

        let guardian = EconomicGuardian::new(config.guardian.clone(), pause.clone());
        let guardian_status = guardian.status_handle();
        let mut tasks = vec![pool_task, submitter_task];
        if config.guardian.enabled {
            tasks.push(tokio::spawn(guardian.run(feed, cancel.clone())));
        } else {
            info!("Economic guardian disabled, submission is never paused");
        }

        let handle = MinerHandle {
            wallet: ArcSwap::new(wallet),
            retired_rejections: AtomicU64::new(0),
            pool,
            pause,
            counters,
            guardian_status,
            cancel,
            tasks: Mutex::new(tasks),
        };

        Ok((
            handle,
            EngineChannels {
                work_rx,
                candidate_tx,
            },
        ))
    }

    /// Like [`Miner::start`], building the feed from `config.feed`
    pub fn start_with_feed_config(
        config: MinerConfig,
        wallet: Arc<WalletGuard>,
        connector: Arc<dyn Connector>,
    ) -> Result<(MinerHandle, EngineChannels)> {
        let feed = config
            .feed
            .build()
            .map_err(|e| MinerError::Feed(format!("{:#}", e)))?;
        Self::start(config, wallet, connector, feed)
    }
}

/// Control and status handle for a running miner
pub struct MinerHandle {
    wallet: ArcSwap<WalletGuard>,
    /// Rejected mutation attempts counted by guards replaced on restart
    retired_rejections: AtomicU64,
    pool: PoolHandle,
    pause: PauseFlag,
    counters: Arc<RwLock<ShareCounters>>,
    guardian_status: Arc<RwLock<GuardianStatus>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MinerHandle {
    pub fn status(&self) -> MiningStatus {
        let wallet = self.wallet.load();
        MiningStatus {
            timestamp: Utc::now(),
            wallet_identity: wallet.identity().to_string(),
            wallet_rejected_updates: wallet.rejected_updates()
                + self.retired_rejections.load(Ordering::Relaxed),
            pool: self.pool.status(),
            shares: self.counters.read().clone(),
            paused: self.pause.is_paused(),
            guardian: self.guardian_status.read().clone(),
        }
    }

    pub fn identity(&self) -> String {
        self.wallet.load().identity().to_string()
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    /// Runtime wallet change request from `source`. Always refused; the
    /// identity in use is left untouched.
    pub fn update_wallet(&self, source: &str, attempted: &WalletConfig) -> Result<()> {
        self.wallet.load().reject_update(source, attempted)?;
        Ok(())
    }

    /// Operator restart with a new wallet: every session is dropped and every
    /// endpoint handshakes again under the new identity.
    pub async fn restart(&self, wallet: WalletConfig) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MinerError::Shutdown);
        }

        let guard = Arc::new(WalletGuard::new(wallet)?);
        info!(
            from = %self.wallet.load().identity(),
            to = guard.identity(),
            "Restarting miner with new wallet"
        );
        self.pool.restart(guard.clone()).await?;
        let retired = self.wallet.swap(guard);
        self.retired_rejections
            .fetch_add(retired.rejected_updates(), Ordering::Relaxed);
        Ok(())
    }

    /// Close every session through CLOSING, then stop all tasks
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Stopping miner");

        self.pool.shutdown().await;
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Miner task ended abnormally: {}", e);
            }
        }

        debug!(shares = ?*self.counters.read(), "Final share counters");
        info!("Miner stopped");
    }
}
