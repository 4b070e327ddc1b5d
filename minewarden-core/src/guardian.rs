//! Economic pause gate.
//!
//! The guardian polls a [`ProfitabilityFeed`] on its own clock and flips a
//! [`PauseFlag`] after `consecutive_ticks` ticks on the same side of the
//! minimum margin. It never touches pool connections: sessions stay
//! authorized while paused, and only share submission stops.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::{ProfitabilityFeed, ProfitabilitySnapshot};

/// Single-writer, multi-reader pause flag
#[derive(Debug, Clone, Default)]
pub struct PauseFlag(Arc<AtomicBool>);

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the previous value
    pub fn set(&self, paused: bool) -> bool {
        self.0.swap(paused, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between feed polls
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Margin below which a tick counts as unprofitable
    #[serde(default)]
    pub min_margin: f64,

    /// Ticks on one side of `min_margin` needed to switch
    #[serde(default = "default_consecutive_ticks")]
    pub consecutive_ticks: u32,
}

fn default_enabled() -> bool { true }
fn default_tick_interval_secs() -> u64 { 60 }
fn default_consecutive_ticks() -> u32 { 3 }

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
            min_margin: 0.0,
            consecutive_ticks: default_consecutive_ticks(),
        }
    }
}

impl GuardianConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardianEvent {
    Paused { margin: f64 },
    Resumed { margin: f64 },
}

/// Guardian state for the status query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardianStatus {
    pub enabled: bool,
    pub paused: bool,
    pub below_streak: u32,
    pub above_streak: u32,
    pub last_snapshot: Option<ProfitabilitySnapshot>,
    pub failed_polls: u64,
}

pub struct EconomicGuardian {
    config: GuardianConfig,
    pause: PauseFlag,
    below_streak: u32,
    above_streak: u32,
    status: Arc<RwLock<GuardianStatus>>,
}

impl EconomicGuardian {
    pub fn new(config: GuardianConfig, pause: PauseFlag) -> Self {
        let status = GuardianStatus {
            enabled: config.enabled,
            paused: pause.is_paused(),
            ..GuardianStatus::default()
        };
        Self {
            config,
            pause,
            below_streak: 0,
            above_streak: 0,
            status: Arc::new(RwLock::new(status)),
        }
    }

    pub fn status_handle(&self) -> Arc<RwLock<GuardianStatus>> {
        self.status.clone()
    }

    /// Feed one snapshot through the hysteresis
    pub fn observe(&mut self, snapshot: ProfitabilitySnapshot) -> Option<GuardianEvent> {
        let margin = snapshot.margin();
        if margin < self.config.min_margin {
            self.below_streak += 1;
            self.above_streak = 0;
        } else {
            self.above_streak += 1;
            self.below_streak = 0;
        }

        let needed = self.config.consecutive_ticks.max(1);
        let paused = self.pause.is_paused();
        let event = if !paused && self.below_streak >= needed {
            self.pause.set(true);
            Some(GuardianEvent::Paused { margin })
        } else if paused && self.above_streak >= needed {
            self.pause.set(false);
            Some(GuardianEvent::Resumed { margin })
        } else {
            None
        };

        match event {
            Some(GuardianEvent::Paused { margin }) => {
                warn!(margin, ticks = self.below_streak, "Mining unprofitable, pausing share submission")
            }
            Some(GuardianEvent::Resumed { margin }) => {
                info!(margin, ticks = self.above_streak, "Mining profitable again, resuming share submission")
            }
            None => debug!(
                margin,
                below = self.below_streak,
                above = self.above_streak,
                "Profitability tick"
            ),
        }

        let mut status = self.status.write();
        status.paused = self.pause.is_paused();
        status.below_streak = self.below_streak;
        status.above_streak = self.above_streak;
        status.last_snapshot = Some(snapshot);

        event
    }

    fn record_failed_poll(&self) {
        self.status.write().failed_polls += 1;
    }

    /// Poll `feed` every tick until cancelled
    pub async fn run(mut self, feed: Arc<dyn ProfitabilityFeed>, cancel: CancellationToken) {
        let period = self.config.tick_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            feed = feed.name(),
            interval_secs = period.as_secs(),
            ticks = self.config.consecutive_ticks,
            "Economic guardian started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A poll may not outlive its tick
            match timeout(period, feed.poll()).await {
                Ok(Ok(snapshot)) => {
                    self.observe(snapshot);
                }
                Ok(Err(e)) => {
                    warn!(feed = feed.name(), "Profitability poll failed: {:#}", e);
                    self.record_failed_poll();
                }
                Err(_) => {
                    warn!(feed = feed.name(), "Profitability poll timed out");
                    self.record_failed_poll();
                }
            }
        }

        debug!("Economic guardian stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn guardian() -> EconomicGuardian {
        EconomicGuardian::new(GuardianConfig::default(), PauseFlag::new())
    }

    fn tick(margin: f64) -> ProfitabilitySnapshot {
        ProfitabilitySnapshot::new(1.0 + margin, 1.0)
    }

    #[test]
    fn test_pause_after_three_negative_ticks() {
        let mut guardian = guardian();
        assert_eq!(guardian.observe(tick(-0.5)), None);
        assert_eq!(guardian.observe(tick(-0.5)), None);
        assert!(!guardian.pause.is_paused());

        assert_eq!(guardian.observe(tick(-0.25)), Some(GuardianEvent::Paused { margin: -0.25 }));
        assert!(guardian.pause.is_paused());

        // Further bad ticks do not re-emit
        assert_eq!(guardian.observe(tick(-1.0)), None);
    }

    #[test]
    fn test_resume_after_three_positive_ticks() {
        let mut guardian = guardian();
        for _ in 0..3 {
            guardian.observe(tick(-1.0));
        }
        assert!(guardian.pause.is_paused());

        guardian.observe(tick(0.5));
        guardian.observe(tick(0.5));
        assert!(guardian.pause.is_paused());
        assert_eq!(guardian.observe(tick(0.5)), Some(GuardianEvent::Resumed { margin: 0.5 }));
        assert!(!guardian.pause.is_paused());
    }

    #[test]
    fn test_interrupted_streak_restarts() {
        let mut guardian = guardian();
        guardian.observe(tick(-1.0));
        guardian.observe(tick(-1.0));
        guardian.observe(tick(1.0));
        guardian.observe(tick(-1.0));
        guardian.observe(tick(-1.0));
        assert!(!guardian.pause.is_paused());
        assert_eq!(guardian.status.read().below_streak, 2);
    }

    struct ScriptedFeed {
        results: Mutex<VecDeque<anyhow::Result<ProfitabilitySnapshot>>>,
    }

    #[async_trait]
    impl ProfitabilityFeed for ScriptedFeed {
        async fn poll(&self) -> anyhow::Result<ProfitabilitySnapshot> {
            self.results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ProfitabilitySnapshot::new(1.0, 2.0)))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_neither_advances_nor_resets() {
        let feed = Arc::new(ScriptedFeed {
            results: Mutex::new(VecDeque::from(vec![
                Ok(tick(-1.0)),
                Ok(tick(-1.0)),
                Err(anyhow!("feed down")),
                Ok(tick(-1.0)),
            ])),
        });
        let pause = PauseFlag::new();
        let guardian = EconomicGuardian::new(GuardianConfig::default(), pause.clone());
        let status = guardian.status_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(guardian.run(feed, cancel.clone()));

        // Ticks at 0, 60 and 120 s: two bad ticks and a failed poll
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(!pause.is_paused());
        assert_eq!(status.read().below_streak, 2);
        assert_eq!(status.read().failed_polls, 1);

        // Third bad tick at 180 s completes the streak
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(pause.is_paused());

        cancel.cancel();
        task.await.unwrap();
    }
}
