//! Pool selection and failover.
//!
//! [`PoolManager`] runs as a single task that owns the endpoint list, one
//! [`CircuitBreaker`] per endpoint and every [`StratumSession`] it opens. At most
//! one session is active for submission; a second one (the candidate) may be
//! connecting, either because nothing is active or as a warm standby while the
//! active session is degraded. A candidate only becomes active once AUTHORIZED.
//! Replaced sessions are closed through CLOSING so their in-flight submits can
//! still settle.

use arc_swap::{ArcSwap, ArcSwapOption};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    breaker::{BreakerStatus, CircuitBreaker},
    config::{BackoffConfig, PoolEndpoint, StratumConfig},
    connection::Connector,
    error::{BreakerAction, Result, StratumError},
    session::{CloseReason, SessionEvent, SessionHandle, SessionMessage, SessionState, StratumSession},
    wallet::WalletGuard,
    work::{SessionId, Work, WorkEvent},
};

const SESSION_EVENT_BUFFER: usize = 256;

/// Runtime status of one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub name: String,
    pub url: String,
    pub priority: u32,
    pub breaker: BreakerStatus,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Read-only view of the pool layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub active_endpoint: Option<String>,
    pub active_session: Option<SessionId>,
    pub active_state: Option<SessionState>,
    /// Endpoint of a session being established, if any
    pub candidate_endpoint: Option<String>,
    pub endpoints: Vec<EndpointStatus>,
    /// Every endpoint is unavailable and nothing is active
    pub no_pool_reachable: bool,
}

enum PoolCommand {
    Restart(Arc<WalletGuard>),
    Shutdown(oneshot::Sender<()>),
}

struct Shared {
    active: ArcSwapOption<SessionHandle>,
    status: ArcSwap<PoolStatus>,
}

/// Cloneable handle to the pool manager task
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    /// The session currently used for submission
    pub fn active_session(&self) -> Option<Arc<SessionHandle>> {
        self.shared.active.load_full()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus::clone(&self.shared.status.load())
    }

    /// Drop every session and handshake again with a new wallet
    pub async fn restart(&self, wallet: Arc<WalletGuard>) -> Result<()> {
        self.commands
            .send(PoolCommand::Restart(wallet))
            .await
            .map_err(|_| StratumError::Shutdown)
    }

    /// Close every session through CLOSING and stop the manager
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(PoolCommand::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct EndpointSlot {
    endpoint: PoolEndpoint,
    breaker: CircuitBreaker,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Tracked {
    handle: SessionHandle,
    index: usize,
}

struct Candidate {
    session: Tracked,
    deadline: Instant,
}

/// Pool selection, failover and session ownership
pub struct PoolManager {
    config: Arc<StratumConfig>,
    wallet: Arc<WalletGuard>,
    connector: Arc<dyn Connector>,
    endpoints: Vec<EndpointSlot>,

    shared: Arc<Shared>,
    commands: mpsc::Receiver<PoolCommand>,
    session_tx: mpsc::Sender<SessionMessage>,
    session_rx: mpsc::Receiver<SessionMessage>,
    work_tx: mpsc::Sender<WorkEvent>,

    active: Option<Tracked>,
    candidate: Option<Candidate>,
    draining: HashMap<SessionId, usize>,

    /// Job ids handed out for the active session, oldest first
    active_jobs: Vec<String>,

    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
    degraded_deadline: Option<Instant>,
    no_pool_reachable: bool,
}

fn build_backoff(config: &BackoffConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_ms))
        .with_max_interval(Duration::from_millis(config.max_ms))
        .with_multiplier(config.multiplier)
        .with_randomization_factor(config.jitter)
        .with_max_elapsed_time(None)
        .build()
}

impl PoolManager {
    /// Validate the configuration and spawn the manager task.
    ///
    /// Work for the hash engine is sent to `work_tx`.
    pub fn start(
        config: StratumConfig,
        wallet: Arc<WalletGuard>,
        connector: Arc<dyn Connector>,
        work_tx: mpsc::Sender<WorkEvent>,
    ) -> Result<(PoolHandle, JoinHandle<()>)> {
        config.validate()?;

        let endpoints: Vec<EndpointSlot> = config
            .ordered_endpoints()
            .into_iter()
            .map(|endpoint| EndpointSlot {
                endpoint,
                breaker: CircuitBreaker::new(&config.breaker),
                last_failure: None,
                last_error: None,
            })
            .collect();
        if endpoints.is_empty() {
            return Err(StratumError::NoPoolsConfigured);
        }

        let shared = Arc::new(Shared {
            active: ArcSwapOption::empty(),
            status: ArcSwap::from_pointee(PoolStatus::default()),
        });
        let (command_tx, command_rx) = mpsc::channel(16);
        let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_BUFFER);

        let manager = Self {
            backoff: build_backoff(&config.backoff),
            config: Arc::new(config),
            wallet,
            connector,
            endpoints,
            shared: shared.clone(),
            commands: command_rx,
            session_tx,
            session_rx,
            work_tx,
            active: None,
            candidate: None,
            draining: HashMap::new(),
            active_jobs: Vec::new(),
            retry_at: None,
            degraded_deadline: None,
            no_pool_reachable: false,
        };
        manager.publish_status();

        let task = tokio::spawn(manager.run());
        Ok((
            PoolHandle {
                shared,
                commands: command_tx,
            },
            task,
        ))
    }

    async fn run(mut self) {
        info!(endpoints = self.endpoints.len(), "Pool manager started");

        loop {
            let now = Instant::now();
            self.expire_candidate(now);
            self.expire_degraded(now).await;
            self.maintain(now);
            self.advance_breakers(now);
            self.publish_status();

            let wake = self.next_wake(now);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PoolCommand::Restart(wallet)) => self.restart(wallet).await,
                    Some(PoolCommand::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = self.session_rx.recv() => self.on_session_message(message).await,
                _ = sleep_until(wake.unwrap_or(now)), if wake.is_some() => {}
            }
        }

        info!("Pool manager stopped");
    }

    /// Open a candidate session when one is needed and allowed
    fn maintain(&mut self, now: Instant) {
        if self.candidate.is_some() {
            return;
        }

        let exclude = match &self.active {
            None => None,
            Some(active) if active.handle.state() == SessionState::Degraded => Some(active.index),
            Some(_) => return,
        };

        if self.retry_at.map_or(false, |at| now < at) {
            return;
        }

        match self.select_endpoint(now, exclude) {
            Some(index) => {
                self.retry_at = None;
                self.open_candidate(index, now);
            }
            None if self.active.is_none() => self.set_no_pool_reachable(true),
            None => {}
        }
    }

    /// Move breakers whose cooldown has elapsed to half-open
    fn advance_breakers(&mut self, now: Instant) {
        for slot in &mut self.endpoints {
            slot.breaker.state(now);
        }
    }

    /// First endpoint in priority order whose breaker allows an attempt
    fn select_endpoint(&mut self, now: Instant, exclude: Option<usize>) -> Option<usize> {
        self.endpoints
            .iter_mut()
            .enumerate()
            .filter(|(index, _)| Some(*index) != exclude)
            .find_map(|(index, slot)| slot.breaker.allows(now).then_some(index))
    }

    fn open_candidate(&mut self, index: usize, now: Instant) {
        let slot = &mut self.endpoints[index];
        slot.breaker.on_attempt();

        info!(
            endpoint = %slot.endpoint.name,
            url = %slot.endpoint.url,
            standby = self.active.is_some(),
            "Opening pool session"
        );

        let handle = StratumSession::spawn(
            slot.endpoint.clone(),
            self.config.clone(),
            self.wallet.clone(),
            self.connector.clone(),
            self.session_tx.clone(),
        );
        self.candidate = Some(Candidate {
            session: Tracked { handle, index },
            deadline: now + self.config.failover_timeout(),
        });
    }

    fn expire_candidate(&mut self, now: Instant) {
        let expired = self
            .candidate
            .as_ref()
            .map_or(false, |candidate| now >= candidate.deadline);
        if !expired {
            return;
        }

        if let Some(candidate) = self.candidate.take() {
            let index = candidate.session.index;
            warn!(
                endpoint = %self.endpoints[index].endpoint.name,
                "Pool session not authorized within failover timeout"
            );
            self.retire(candidate.session);
            self.record_failure(index, &StratumError::Timeout, now);
        }
    }

    /// Close a degraded session once the self-heal grace is over and no
    /// replacement is on the way
    async fn expire_degraded(&mut self, now: Instant) {
        let Some(deadline) = self.degraded_deadline else {
            return;
        };
        if now < deadline || self.candidate.is_some() {
            return;
        }
        let still_degraded = self
            .active
            .as_ref()
            .map_or(false, |active| active.handle.state() == SessionState::Degraded);
        if !still_degraded {
            self.degraded_deadline = None;
            return;
        }
        let exclude = self.active.as_ref().map(|active| active.index);
        if self.select_endpoint(now, exclude).is_some() {
            return;
        }

        self.degraded_deadline = None;
        if let Some(active) = self.active.take() {
            let index = active.index;
            warn!(
                endpoint = %self.endpoints[index].endpoint.name,
                "Degraded session did not recover, closing"
            );
            self.retire(active);
            self.clear_active().await;
            self.record_failure(index, &StratumError::Timeout, now);
        }
    }

    fn next_wake(&self, now: Instant) -> Option<Instant> {
        let mut wake: Vec<Instant> = Vec::new();
        wake.extend(self.retry_at);
        wake.extend(self.degraded_deadline);
        wake.extend(self.candidate.as_ref().map(|c| c.deadline));
        wake.extend(self.endpoints.iter().filter_map(|s| s.breaker.reopens_at()));
        wake.into_iter().filter(|at| *at > now).min()
    }

    async fn on_session_message(&mut self, message: SessionMessage) {
        let id = message.session;

        if self.is_candidate(id) {
            self.on_candidate_event(message.event).await;
        } else if self.is_active(id) {
            self.on_active_event(message.event).await;
        } else if let SessionEvent::Closed(_) = message.event {
            if let Some(index) = self.draining.remove(&id) {
                debug!(session = %id, endpoint = %self.endpoints[index].endpoint.name, "Drained session closed");
            }
        }
    }

    async fn on_candidate_event(&mut self, event: SessionEvent) {
        let now = Instant::now();
        match event {
            SessionEvent::Authorized { work, .. } => {
                let Some(candidate) = self.candidate.take() else {
                    return;
                };
                let index = candidate.session.index;
                self.endpoints[index].breaker.record_success();

                let active_healthy = self
                    .active
                    .as_ref()
                    .map_or(false, |active| active.handle.state() == SessionState::Authorized);
                if active_healthy {
                    debug!(
                        endpoint = %self.endpoints[index].endpoint.name,
                        "Active session recovered, dropping standby"
                    );
                    self.retire(candidate.session);
                    return;
                }

                self.promote(candidate.session, work).await;
            }
            SessionEvent::Closed(reason) => {
                let Some(candidate) = self.candidate.take() else {
                    return;
                };
                let index = candidate.session.index;
                match reason {
                    CloseReason::Failed(error) => self.record_failure(index, &error, now),
                    _ => self.endpoints[index].breaker.release_trial(),
                }
            }
            // Nothing else is emitted before authorization
            _ => {}
        }
    }

    async fn on_active_event(&mut self, event: SessionEvent) {
        let now = Instant::now();
        match event {
            SessionEvent::NewJob(work) => self.forward_job(work).await,
            SessionEvent::DifficultyChanged(difficulty) => {
                self.send_work(WorkEvent::Difficulty {
                    difficulty,
                    target: difficulty.target_hex(),
                })
                .await;
            }
            SessionEvent::Degraded { .. } => {
                self.degraded_deadline = Some(now + self.config.self_heal_grace());
            }
            SessionEvent::Recovered => {
                self.degraded_deadline = None;
                if let Some(candidate) = self.candidate.take() {
                    let index = candidate.session.index;
                    info!(
                        endpoint = %self.endpoints[index].endpoint.name,
                        "Active session recovered, cancelling standby"
                    );
                    self.endpoints[index].breaker.release_trial();
                    self.retire(candidate.session);
                }
            }
            SessionEvent::Closed(reason) => {
                let Some(active) = self.active.take() else {
                    return;
                };
                let index = active.index;
                self.clear_active().await;
                match reason {
                    CloseReason::Failed(error) => {
                        warn!(endpoint = %self.endpoints[index].endpoint.name, "Active session lost: {}", error);
                        self.record_failure(index, &error, now);
                    }
                    CloseReason::PoolReconnect => {
                        info!(endpoint = %self.endpoints[index].endpoint.name, "Reconnecting at pool request");
                    }
                    CloseReason::Requested => {}
                }
            }
            SessionEvent::Authorized { .. } => {}
        }
    }

    /// Make an authorized candidate the active session
    async fn promote(&mut self, session: Tracked, work: Option<Work>) {
        let index = session.index;
        if let Some(previous) = self.active.take() {
            info!(
                from = %self.endpoints[previous.index].endpoint.name,
                to = %self.endpoints[index].endpoint.name,
                "Failing over to new pool session"
            );
            self.retire(previous);
        } else {
            info!(endpoint = %self.endpoints[index].endpoint.name, "Pool session active");
        }

        self.shared.active.store(Some(Arc::new(session.handle.clone())));
        self.active = Some(session);
        self.active_jobs.clear();
        self.degraded_deadline = None;
        self.retry_at = None;
        self.backoff.reset();
        self.set_no_pool_reachable(false);

        self.send_work(WorkEvent::Reset).await;
        if let Some(work) = work {
            self.forward_job(work).await;
        }
    }

    async fn forward_job(&mut self, work: Work) {
        let mut stale = Vec::new();
        if work.job.clean_jobs {
            stale.append(&mut self.active_jobs);
        }
        self.active_jobs.retain(|id| *id != work.job.job_id);
        self.active_jobs.push(work.job.job_id.clone());
        while self.active_jobs.len() > self.config.max_tracked_jobs {
            stale.push(self.active_jobs.remove(0));
        }

        if !stale.is_empty() {
            self.send_work(WorkEvent::Invalidate { job_ids: stale }).await;
        }
        self.send_work(WorkEvent::NewJob(work)).await;
    }

    async fn clear_active(&mut self) {
        self.shared.active.store(None);
        self.active_jobs.clear();
        self.degraded_deadline = None;
        self.send_work(WorkEvent::Reset).await;
    }

    /// Put a session into CLOSING and keep it until it reports closed
    fn retire(&mut self, session: Tracked) {
        session.handle.close();
        self.draining.insert(session.handle.id(), session.index);
    }

    fn record_failure(&mut self, index: usize, error: &StratumError, now: Instant) {
        let slot = &mut self.endpoints[index];
        slot.last_failure = Some(Utc::now());
        slot.last_error = Some(error.to_string());

        match error.breaker_action() {
            BreakerAction::CountFailure => {
                if slot.breaker.record_failure(now) {
                    warn!(
                        endpoint = %slot.endpoint.name,
                        failures = slot.breaker.consecutive_failures(),
                        "Endpoint skipped until cooldown"
                    );
                }
            }
            BreakerAction::ForceOpen => {
                error!(endpoint = %slot.endpoint.name, "Pool rejected worker: {}", error);
                slot.breaker.force_open(now);
            }
            BreakerAction::Ignore => slot.breaker.release_trial(),
        }

        if let Some(delay) = self.backoff.next_backoff() {
            debug!(delay_ms = delay.as_millis() as u64, "Reconnect backoff");
            self.retry_at = Some(now + delay);
        }
    }

    fn set_no_pool_reachable(&mut self, unreachable: bool) {
        if unreachable == self.no_pool_reachable {
            return;
        }
        self.no_pool_reachable = unreachable;
        if unreachable {
            let retry_in = self
                .next_wake(Instant::now())
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs());
            error!(retry_in_secs = ?retry_in, "No pool reachable");
        } else {
            info!("Pool connectivity restored");
        }
    }

    async fn restart(&mut self, wallet: Arc<WalletGuard>) {
        info!(worker = %wallet.identity(), "Restarting pool sessions");
        self.wallet = wallet;

        if let Some(candidate) = self.candidate.take() {
            self.retire(candidate.session);
        }
        if let Some(active) = self.active.take() {
            self.retire(active);
        }
        self.clear_active().await;

        for slot in &mut self.endpoints {
            slot.breaker = CircuitBreaker::new(&self.config.breaker);
            slot.last_error = None;
        }
        self.backoff.reset();
        self.retry_at = None;
        self.set_no_pool_reachable(false);
    }

    async fn shutdown(&mut self) {
        info!("Shutting down pool sessions");
        if let Some(candidate) = self.candidate.take() {
            self.retire(candidate.session);
        }
        if let Some(active) = self.active.take() {
            self.retire(active);
        }
        self.clear_active().await;
        self.publish_status();

        // Give draining sessions their bounded window, plus slack for the close itself
        let deadline = Instant::now() + self.config.drain_timeout() + Duration::from_secs(1);
        while !self.draining.is_empty() {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    warn!(sessions = self.draining.len(), "Sessions still draining at shutdown");
                    break;
                }
                Some(message) = self.session_rx.recv() => {
                    if let SessionEvent::Closed(_) = message.event {
                        self.draining.remove(&message.session);
                    }
                }
            }
        }
        self.publish_status();
    }

    fn is_candidate(&self, id: SessionId) -> bool {
        self.candidate
            .as_ref()
            .map_or(false, |c| c.session.handle.id() == id)
    }

    fn is_active(&self, id: SessionId) -> bool {
        self.active.as_ref().map_or(false, |a| a.handle.id() == id)
    }

    fn publish_status(&self) {
        let endpoints = self
            .endpoints
            .iter()
            .map(|slot| EndpointStatus {
                name: slot.endpoint.name.clone(),
                url: slot.endpoint.url.clone(),
                priority: slot.endpoint.priority,
                breaker: slot.breaker.status(),
                consecutive_failures: slot.breaker.consecutive_failures(),
                last_failure: slot.last_failure,
                last_error: slot.last_error.clone(),
            })
            .collect();

        let status = PoolStatus {
            active_endpoint: self
                .active
                .as_ref()
                .map(|a| self.endpoints[a.index].endpoint.name.clone()),
            active_session: self.active.as_ref().map(|a| a.handle.id()),
            active_state: self.active.as_ref().map(|a| a.handle.state()),
            candidate_endpoint: self
                .candidate
                .as_ref()
                .map(|c| self.endpoints[c.session.index].endpoint.name.clone()),
            endpoints,
            no_pool_reachable: self.no_pool_reachable,
        };
        self.shared.status.store(Arc::new(status));
    }

    async fn send_work(&self, event: WorkEvent) {
        if self.work_tx.send(event).await.is_err() {
            debug!("Work receiver dropped");
        }
    }
}
