//! Candidate solutions to pool submissions.
//!
//! [`ShareSubmitter`] sits between the pool manager and the hash engine. Work
//! events pass through it on their way out, keeping its job book in step with
//! the active session. Candidates coming back are checked against the pause
//! flag, the job book and the duplicate filter, then submitted in arrival order
//! on the active session. Pool answers are reconciled asynchronously so a slow
//! response never holds up later candidates.

use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use minewarden_stratum::{
    PoolHandle, SessionId, ShareState, SubmitParams, Work, WorkEvent,
};

use crate::{dedup::DuplicateFilter, guardian::PauseFlag};

/// A solution produced by the hash engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub job_id: String,
    pub nonce: u32,
    /// Hex, exactly `extranonce2_size` bytes
    pub extranonce2: String,
    /// Rolled ntime; the job's ntime when absent
    #[serde(default)]
    pub ntime: Option<u32>,
}

/// What happened to a candidate at dispatch time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Submitted,
    Paused,
    NoSession,
    Stale,
    Duplicate,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitterConfig {
    /// Jobs remembered by the duplicate filter
    #[serde(default = "default_duplicate_filter_jobs")]
    pub duplicate_filter_jobs: usize,
}

fn default_duplicate_filter_jobs() -> usize { 64 }

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            duplicate_filter_jobs: default_duplicate_filter_jobs(),
        }
    }
}

/// Share accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareCounters {
    /// Accepted on the current active session
    pub session_accepted: u64,
    /// Rejected on the current active session
    pub session_rejected: u64,

    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub rejected_by_reason: BTreeMap<String, u64>,
    pub timed_out: u64,
    pub in_flight: u64,

    pub duplicates_suppressed: u64,
    pub discarded_paused: u64,
    pub discarded_stale: u64,
    pub discarded_no_session: u64,
    pub discarded_invalid: u64,
}

type Outcome = BoxFuture<'static, (SessionId, ShareState)>;

pub struct ShareSubmitter {
    pool: PoolHandle,
    pause: PauseFlag,
    filter: DuplicateFilter,
    counters: Arc<RwLock<ShareCounters>>,

    /// Session the job book belongs to
    session: Option<SessionId>,
    jobs: HashMap<String, Work>,

    in_flight: FuturesUnordered<Outcome>,
}

impl ShareSubmitter {
    pub fn new(config: &SubmitterConfig, pool: PoolHandle, pause: PauseFlag) -> Self {
        Self {
            pool,
            pause,
            filter: DuplicateFilter::new(config.duplicate_filter_jobs),
            counters: Arc::new(RwLock::new(ShareCounters::default())),
            session: None,
            jobs: HashMap::new(),
            in_flight: FuturesUnordered::new(),
        }
    }

    pub fn counters(&self) -> Arc<RwLock<ShareCounters>> {
        self.counters.clone()
    }

    /// Track a work event, before it is forwarded to the engine
    pub fn on_work(&mut self, event: &WorkEvent) {
        match event {
            WorkEvent::NewJob(work) => {
                if self.session != Some(work.session_id) {
                    self.switch_session(Some(work.session_id));
                }
                self.jobs.insert(work.job.job_id.clone(), work.clone());
            }
            WorkEvent::Invalidate { job_ids } => {
                for job_id in job_ids {
                    self.jobs.remove(job_id);
                    self.filter.evict_job(job_id);
                }
            }
            WorkEvent::Reset => self.switch_session(None),
            WorkEvent::Difficulty { .. } => {}
        }
    }

    fn switch_session(&mut self, session: Option<SessionId>) {
        if self.session.is_some() || session.is_some() {
            debug!(from = ?self.session, to = ?session, "Share book switched session");
        }
        self.session = session;
        self.jobs.clear();
        self.filter.clear();

        let mut counters = self.counters.write();
        counters.session_accepted = 0;
        counters.session_rejected = 0;
    }

    /// Check and dispatch one candidate
    pub async fn submit(&mut self, candidate: Candidate) -> Disposition {
        let disposition = self.dispatch(candidate).await;

        let mut counters = self.counters.write();
        match &disposition {
            Disposition::Submitted => {
                counters.submitted += 1;
                counters.in_flight = self.in_flight.len() as u64;
            }
            Disposition::Paused => counters.discarded_paused += 1,
            Disposition::NoSession => counters.discarded_no_session += 1,
            Disposition::Stale => counters.discarded_stale += 1,
            Disposition::Duplicate => counters.duplicates_suppressed += 1,
            Disposition::Invalid(_) => counters.discarded_invalid += 1,
        }
        disposition
    }

    async fn dispatch(&mut self, candidate: Candidate) -> Disposition {
        if self.pause.is_paused() {
            trace!(job_id = %candidate.job_id, "Submission paused, candidate discarded");
            return Disposition::Paused;
        }

        let Some(session) = self.pool.active_session() else {
            debug!(job_id = %candidate.job_id, "No active session, candidate discarded");
            return Disposition::NoSession;
        };

        if self.session != Some(session.id()) {
            return Disposition::Stale;
        }
        let Some(work) = self.jobs.get(&candidate.job_id) else {
            debug!(job_id = %candidate.job_id, "Candidate for unknown or stale job");
            return Disposition::Stale;
        };

        let expected = work.extranonce2_size * 2;
        if candidate.extranonce2.len() != expected || hex::decode(&candidate.extranonce2).is_err() {
            let reason = format!(
                "extranonce2 {:?} is not {} hex digits",
                candidate.extranonce2, expected
            );
            warn!(job_id = %candidate.job_id, "{}", reason);
            return Disposition::Invalid(reason);
        }

        if !self
            .filter
            .insert(&candidate.job_id, candidate.nonce, &candidate.extranonce2)
        {
            debug!(job_id = %candidate.job_id, nonce = candidate.nonce, "Duplicate share suppressed");
            return Disposition::Duplicate;
        }

        let share = SubmitParams {
            job_id: candidate.job_id,
            extranonce2: candidate.extranonce2.to_ascii_lowercase(),
            ntime: candidate.ntime.unwrap_or_else(|| work.job.ntime_value()),
            nonce: candidate.nonce,
        };

        match session.submit(share).await {
            Ok(outcome) => {
                let session_id = session.id();
                self.in_flight.push(
                    async move {
                        // A dropped sender means the session ended first
                        let state = outcome.await.unwrap_or(ShareState::TimedOut);
                        (session_id, state)
                    }
                    .boxed(),
                );
                Disposition::Submitted
            }
            Err(e) => {
                debug!("Active session refused share: {}", e);
                Disposition::Stale
            }
        }
    }

    fn record_outcome(&mut self, session: SessionId, state: ShareState) {
        let current = self.session == Some(session);
        let mut counters = self.counters.write();
        counters.in_flight = self.in_flight.len() as u64;

        match state {
            ShareState::Accepted => {
                counters.accepted += 1;
                if current {
                    counters.session_accepted += 1;
                }
            }
            ShareState::Rejected(reason) => {
                counters.rejected += 1;
                if current {
                    counters.session_rejected += 1;
                }
                *counters
                    .rejected_by_reason
                    .entry(reason.label().to_string())
                    .or_default() += 1;
            }
            ShareState::TimedOut => counters.timed_out += 1,
            ShareState::Pending => {}
        }
    }

    /// Pump work events out to the engine and candidates in until cancelled
    pub async fn run(
        mut self,
        mut work_rx: mpsc::Receiver<WorkEvent>,
        engine_tx: mpsc::Sender<WorkEvent>,
        mut candidate_rx: mpsc::Receiver<Candidate>,
        cancel: CancellationToken,
    ) {
        info!("Share submitter started");
        let mut candidates_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = work_rx.recv() => {
                    let Some(event) = event else { break };
                    self.on_work(&event);
                    if engine_tx.send(event).await.is_err() {
                        debug!("Hash engine stopped listening for work");
                    }
                }
                candidate = candidate_rx.recv(), if candidates_open => match candidate {
                    Some(candidate) => {
                        self.submit(candidate).await;
                    }
                    None => {
                        debug!("Candidate channel closed");
                        candidates_open = false;
                    }
                },
                Some((session, state)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.record_outcome(session, state);
                }
            }
        }

        // Let submits already on the wire settle
        while let Some((session, state)) = self.in_flight.next().await {
            self.record_outcome(session, state);
        }
        info!("Share submitter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minewarden_stratum::{
        mock::{MockConnector, PoolScript},
        PoolEndpoint, PoolManager, RejectReason, StratumConfig, WalletConfig, WalletGuard,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        submitter: ShareSubmitter,
        work_rx: mpsc::Receiver<WorkEvent>,
        connector: Arc<MockConnector>,
        pause: PauseFlag,
    }

    async fn harness(script: PoolScript) -> Harness {
        let connector = Arc::new(MockConnector::new());
        connector.script("primary", script);
        let config = StratumConfig {
            pools: vec![PoolEndpoint::new("primary", "stratum+tcp://primary:3333", 0)],
            ..StratumConfig::default()
        };
        let wallet = Arc::new(
            WalletGuard::new(WalletConfig {
                payout_address: "bc1qaddr".to_string(),
                worker_name: "rig01".to_string(),
            })
            .unwrap(),
        );
        let (work_tx, work_rx) = mpsc::channel(64);
        let (pool, _task) = PoolManager::start(config, wallet, connector.clone(), work_tx).unwrap();
        let pause = PauseFlag::new();
        let submitter = ShareSubmitter::new(&SubmitterConfig::default(), pool, pause.clone());

        let mut harness = Harness {
            submitter,
            work_rx,
            connector,
            pause,
        };
        harness.pump_until_job().await;
        harness
    }

    impl Harness {
        async fn pump_until_job(&mut self) {
            loop {
                let event = timeout(Duration::from_secs(30), self.work_rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                self.submitter.on_work(&event);
                if matches!(event, WorkEvent::NewJob(_)) {
                    return;
                }
            }
        }

        async fn settle(&mut self) {
            while let Some((session, state)) = self.submitter.in_flight.next().await {
                self.submitter.record_outcome(session, state);
            }
        }
    }

    fn candidate(job_id: &str, nonce: u32) -> Candidate {
        Candidate {
            job_id: job_id.to_string(),
            nonce,
            extranonce2: "00000001".to_string(),
            ntime: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_share_counted() {
        let mut h = harness(PoolScript::with_job("abc")).await;
        assert_eq!(h.submitter.submit(candidate("abc", 0x1234)).await, Disposition::Submitted);
        h.settle().await;

        let counters = h.submitter.counters().read().clone();
        assert_eq!(counters.submitted, 1);
        assert_eq!(counters.accepted, 1);
        assert_eq!(counters.session_accepted, 1);
        assert_eq!(counters.in_flight, 0);

        let pool = h.connector.pool("primary").await;
        assert_eq!(pool.submits().len(), 1);
        assert_eq!(pool.submits()[0][4], "00001234");
        // Job ntime used when the engine did not roll it
        assert_eq!(pool.submits()[0][3], "5f5e1000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_never_reaches_pool() {
        let mut h = harness(PoolScript::with_job("abc")).await;
        assert_eq!(h.submitter.submit(candidate("abc", 7)).await, Disposition::Submitted);
        assert_eq!(h.submitter.submit(candidate("abc", 7)).await, Disposition::Duplicate);
        h.settle().await;

        assert_eq!(h.connector.pool("primary").await.submits().len(), 1);
        assert_eq!(h.submitter.counters().read().duplicates_suppressed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_candidates_discarded_without_network() {
        let mut h = harness(PoolScript::with_job("abc")).await;
        h.pause.set(true);
        assert_eq!(h.submitter.submit(candidate("abc", 1)).await, Disposition::Paused);
        assert_eq!(h.submitter.submit(candidate("abc", 2)).await, Disposition::Paused);

        assert!(h.connector.pool("primary").await.submits().is_empty());
        assert_eq!(h.submitter.counters().read().discarded_paused, 2);

        // Paused candidates were never recorded, so they can be submitted later
        h.pause.set(false);
        assert_eq!(h.submitter.submit(candidate("abc", 1)).await, Disposition::Submitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_job_is_stale() {
        let mut h = harness(PoolScript::with_job("abc")).await;
        assert_eq!(h.submitter.submit(candidate("zzz", 1)).await, Disposition::Stale);
        assert_eq!(h.submitter.counters().read().discarded_stale, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_extranonce2_size_is_invalid() {
        let mut h = harness(PoolScript::with_job("abc")).await;
        let mut short = candidate("abc", 1);
        short.extranonce2 = "0001".to_string();
        assert!(matches!(h.submitter.submit(short).await, Disposition::Invalid(_)));
        assert!(h.connector.pool("primary").await.submits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_counted_by_reason() {
        let mut h = harness(PoolScript {
            submit_error: Some((21, "Job not found".to_string())),
            ..PoolScript::with_job("abc")
        })
        .await;
        h.submitter.submit(candidate("abc", 1)).await;
        h.settle().await;

        let counters = h.submitter.counters().read().clone();
        assert_eq!(counters.rejected, 1);
        assert_eq!(counters.session_rejected, 1);
        assert_eq!(
            counters.rejected_by_reason.get(RejectReason::StaleJob.label()),
            Some(&1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_job_becomes_stale() {
        let mut h = harness(PoolScript::with_job("abc")).await;
        h.connector.pool("primary").await.notify("def", true);
        h.pump_until_job().await;

        assert_eq!(h.submitter.submit(candidate("abc", 1)).await, Disposition::Stale);
        assert_eq!(h.submitter.submit(candidate("def", 1)).await, Disposition::Submitted);
    }
}
