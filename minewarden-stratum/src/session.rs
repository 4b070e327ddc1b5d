//! One Stratum V1 session against one endpoint.
//!
//! A session runs as its own task: connect, `mining.subscribe`,
//! `mining.authorize`, then a read loop that tracks jobs and difficulty,
//! correlates submit responses and watches for pool silence. It reports to
//! the [`PoolManager`](crate::pool::PoolManager) through [`SessionMessage`]s and
//! accepts submits through a cloneable [`SessionHandle`].

use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{interval, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    config::{PoolEndpoint, StratumConfig},
    connection::{Connector, Transport},
    difficulty::DifficultyController,
    error::{Result, StratumError},
    protocol::{
        methods, parse_set_difficulty, parse_set_extranonce, Difficulty, Job, RejectReason,
        ShareState, StratumMessage, StratumNotification, StratumReply, StratumRequest,
        StratumResponse, SubmitParams, SubscribeResult,
    },
    wallet::WalletGuard,
    work::{SessionId, Work},
};

/// Commands queued to a session (bounded)
const COMMAND_BUFFER: usize = 256;

/// How often outstanding submits are checked for timeout
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    Authorizing,
    Authorized,
    /// Authorized but the pool went quiet
    Degraded,
    /// Draining outstanding submits before disconnect
    Closing,
}

impl SessionState {
    /// Shares may be submitted in these states
    pub fn accepts_shares(&self) -> bool {
        matches!(self, SessionState::Authorized | SessionState::Degraded)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Subscribed => "subscribed",
            SessionState::Authorizing => "authorizing",
            SessionState::Authorized => "authorized",
            SessionState::Degraded => "degraded",
            SessionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Why a session ended
#[derive(Debug)]
pub enum CloseReason {
    /// Closed on request (failover, restart, shutdown)
    Requested,
    /// Pool sent client.reconnect
    PoolReconnect,
    Failed(StratumError),
}

/// What a session reports to its owner
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake finished; carries the newest job seen so far, if any
    Authorized {
        work: Option<Work>,
        difficulty: Difficulty,
    },
    NewJob(Work),
    DifficultyChanged(Difficulty),
    /// No mining.notify for the silence timeout
    Degraded { silent_for: Duration },
    /// A notify arrived while degraded
    Recovered,
    Closed(CloseReason),
}

/// A [`SessionEvent`] tagged with its session
#[derive(Debug)]
pub struct SessionMessage {
    pub session: SessionId,
    pub event: SessionEvent,
}

enum SessionCommand {
    Submit {
        share: SubmitParams,
        reply: oneshot::Sender<ShareState>,
    },
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    endpoint: Arc<PoolEndpoint>,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    close: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.name)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> &PoolEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Queue a share. Submits go out in the order they are queued.
    ///
    /// The receiver resolves to the final share state. A dropped sender means
    /// the session ended before the pool answered.
    pub async fn submit(&self, share: SubmitParams) -> Result<oneshot::Receiver<ShareState>> {
        let state = self.state();
        if !state.accepts_shares() {
            return Err(StratumError::Protocol(format!(
                "session {} is {}, not accepting shares",
                self.id, state
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Submit { share, reply })
            .await
            .map_err(|_| StratumError::Disconnected)?;
        Ok(rx)
    }

    /// Ask the session to drain and close
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.state() == SessionState::Disconnected
    }

    /// Wait until the session reaches `target` or disconnects
    pub async fn wait_for(&self, target: SessionState) -> SessionState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current == target || current == SessionState::Disconnected {
                return current;
            }
            if state.changed().await.is_err() {
                return SessionState::Disconnected;
            }
        }
    }
}

struct PendingSubmit {
    reply: oneshot::Sender<ShareState>,
    job_id: String,
    nonce: u32,
    sent_at: Instant,
}

/// Why a pending submit is dropped without a pool answer
#[derive(Debug, PartialEq, Eq)]
enum Expiry {
    /// No answer within the submit timeout
    TimedOut,
    /// Nobody is waiting for the outcome any more
    Abandoned,
}

impl PendingSubmit {
    fn expiry(&self, now: Instant, submit_timeout: Duration) -> Option<Expiry> {
        if self.reply.is_closed() {
            Some(Expiry::Abandoned)
        } else if now.saturating_duration_since(self.sent_at) >= submit_timeout {
            Some(Expiry::TimedOut)
        } else {
            None
        }
    }
}

enum Flow {
    Continue,
    Reconnect,
}

/// Session task state
pub struct StratumSession {
    id: SessionId,
    endpoint: Arc<PoolEndpoint>,
    config: Arc<StratumConfig>,
    wallet: Arc<WalletGuard>,
    events: mpsc::Sender<SessionMessage>,
    commands: mpsc::Receiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    close: CancellationToken,

    next_id: u64,
    subscription: Option<SubscribeResult>,
    difficulty: DifficultyController,

    jobs: JobBook,

    pending: HashMap<u64, PendingSubmit>,
    suggest_request: Option<u64>,
    last_notify: Instant,
}

/// Jobs a share may still be submitted against, oldest first
#[derive(Debug)]
struct JobBook {
    jobs: VecDeque<Job>,
    limit: usize,
}

impl JobBook {
    fn new(limit: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Record a notified job. `clean_jobs` drops everything before it.
    fn accept(&mut self, job: Job) {
        if job.clean_jobs {
            self.jobs.clear();
        }
        self.jobs.retain(|existing| existing.job_id != job.job_id);
        self.jobs.push_back(job);
        while self.jobs.len() > self.limit {
            self.jobs.pop_front();
        }
    }

    fn contains(&self, job_id: &str) -> bool {
        self.jobs.iter().any(|job| job.job_id == job_id)
    }

    fn latest(&self) -> Option<&Job> {
        self.jobs.back()
    }
}

impl StratumSession {
    /// Spawn a session task for `endpoint`
    pub fn spawn(
        endpoint: PoolEndpoint,
        config: Arc<StratumConfig>,
        wallet: Arc<WalletGuard>,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<SessionMessage>,
    ) -> SessionHandle {
        let id = Uuid::new_v4();
        let endpoint = Arc::new(endpoint);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let close = CancellationToken::new();

        let session = Self {
            id,
            endpoint: endpoint.clone(),
            difficulty: DifficultyController::new(config.suggest_difficulty, config.suggest_warmup()),
            jobs: JobBook::new(config.max_tracked_jobs),
            config,
            wallet,
            events,
            commands: command_rx,
            state: state_tx,
            close: close.clone(),
            next_id: 1,
            subscription: None,
            pending: HashMap::new(),
            suggest_request: None,
            last_notify: Instant::now(),
        };

        tokio::spawn(session.run(connector));

        SessionHandle {
            id,
            endpoint,
            commands: command_tx,
            state: state_rx,
            close,
        }
    }

    async fn run(mut self, connector: Arc<dyn Connector>) {
        let reason = match self.establish(connector.as_ref()).await {
            Ok(mut transport) => {
                let reason = match self.serve(transport.as_mut()).await {
                    Ok(Flow::Continue) => CloseReason::Requested,
                    Ok(Flow::Reconnect) => CloseReason::PoolReconnect,
                    Err(e) => CloseReason::Failed(e),
                };
                if !matches!(reason, CloseReason::Failed(_)) {
                    self.drain(transport.as_mut()).await;
                }
                if let Err(e) = transport.shutdown().await {
                    trace!(session = %self.id, "Transport shutdown: {}", e);
                }
                reason
            }
            Err(_) if self.close.is_cancelled() => CloseReason::Requested,
            Err(e) => CloseReason::Failed(e),
        };

        self.abandon_queued();
        // Dropping the reply senders resolves any remaining submits as unknown
        self.pending.clear();
        self.set_state(SessionState::Disconnected);

        match &reason {
            CloseReason::Failed(e) => {
                warn!(session = %self.id, endpoint = %self.endpoint.name, "Session ended: {}", e)
            }
            _ => info!(session = %self.id, endpoint = %self.endpoint.name, "Session closed"),
        }
        self.emit(SessionEvent::Closed(reason)).await;
    }

    /// Connect, subscribe and authorize
    async fn establish(&mut self, connector: &dyn Connector) -> Result<Box<dyn Transport>> {
        self.set_state(SessionState::Connecting);
        info!(session = %self.id, endpoint = %self.endpoint.name, url = %self.endpoint.url, "Connecting to pool");

        let mut transport = tokio::select! {
            biased;
            _ = self.close.cancelled() => return Err(StratumError::Shutdown),
            result = timeout(self.config.connection_timeout(), connector.connect(&self.endpoint)) => {
                result.map_err(|_| StratumError::Timeout)??
            }
        };

        // Subscribe
        let id = self.next_request_id();
        let response = self
            .request(
                transport.as_mut(),
                StratumRequest::subscribe(id, &self.config.user_agent),
            )
            .await?;
        if let Some(error) = response.rpc_error() {
            return Err(StratumError::Subscription(error.message));
        }
        let result = response
            .result
            .as_ref()
            .ok_or_else(|| StratumError::Subscription("missing result".to_string()))?;
        let subscription = SubscribeResult::from_response(result)?;
        debug!(
            session = %self.id,
            extranonce1 = %subscription.extranonce1,
            extranonce2_size = subscription.extranonce2_size,
            "Subscribed"
        );
        self.subscription = Some(subscription);
        self.set_state(SessionState::Subscribed);

        // Authorize with the guarded identity only
        self.set_state(SessionState::Authorizing);
        let id = self.next_request_id();
        let response = self
            .request(
                transport.as_mut(),
                StratumRequest::authorize(id, self.wallet.identity(), &self.endpoint.password),
            )
            .await?;
        if !response.is_true() {
            let message = response
                .rpc_error()
                .map(|e| e.message)
                .unwrap_or_else(|| "pool refused worker".to_string());
            return Err(StratumError::Authorization(message));
        }

        let now = Instant::now();
        self.last_notify = now;
        self.difficulty.on_authorized(now);
        self.set_state(SessionState::Authorized);
        info!(
            session = %self.id,
            endpoint = %self.endpoint.name,
            worker = %self.wallet.identity(),
            "Worker authorized"
        );

        let work = self.jobs.latest().map(|job| self.work_for(job));
        self.emit(SessionEvent::Authorized {
            work,
            difficulty: self.difficulty.current(),
        })
        .await;

        Ok(transport)
    }

    /// Send a handshake request and wait for its response, handling
    /// notifications that arrive in between.
    async fn request(
        &mut self,
        transport: &mut dyn Transport,
        request: StratumRequest,
    ) -> Result<StratumResponse> {
        let id = request.id;
        transport.write_line(&request.to_line()?).await?;
        let deadline = Instant::now() + self.config.response_timeout();

        loop {
            let line = tokio::select! {
                biased;
                _ = self.close.cancelled() => return Err(StratumError::Shutdown),
                _ = sleep_until(deadline) => return Err(StratumError::Timeout),
                line = transport.read_line() => line?.ok_or(StratumError::Disconnected)?,
            };

            match StratumMessage::parse(&line)? {
                StratumMessage::Response(response) if response.request_id() == Some(id) => {
                    return Ok(response)
                }
                StratumMessage::Response(response) => {
                    debug!(session = %self.id, id = ?response.id, "Ignoring response to unknown request");
                }
                StratumMessage::Notification(notification) => {
                    if let Flow::Reconnect = self.handle_notification(transport, notification).await? {
                        return Err(StratumError::Disconnected);
                    }
                }
            }
        }
    }

    /// Main loop once authorized
    async fn serve(&mut self, transport: &mut dyn Transport) -> Result<Flow> {
        let mut sweep = interval(PENDING_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let watching_silence = self.current_state() == SessionState::Authorized;
            let silence_deadline = self.last_notify + self.config.silence_timeout();
            let suggest_at = self.difficulty.suggestion_due();

            tokio::select! {
                biased;
                _ = self.close.cancelled() => return Ok(Flow::Continue),
                line = transport.read_line() => {
                    let line = line?.ok_or(StratumError::Disconnected)?;
                    match StratumMessage::parse(&line)? {
                        StratumMessage::Response(response) => self.reconcile(response),
                        StratumMessage::Notification(notification) => {
                            if let Flow::Reconnect = self.handle_notification(transport, notification).await? {
                                return Ok(Flow::Reconnect);
                            }
                        }
                    }
                }
                Some(command) = self.commands.recv() => self.handle_command(transport, command).await?,
                _ = sleep_until(silence_deadline), if watching_silence => {
                    let silent_for = self.last_notify.elapsed();
                    warn!(
                        session = %self.id,
                        endpoint = %self.endpoint.name,
                        silent_secs = silent_for.as_secs(),
                        "No job updates from pool, session degraded"
                    );
                    self.set_state(SessionState::Degraded);
                    self.emit(SessionEvent::Degraded { silent_for }).await;
                }
                _ = sleep_until(suggest_at.unwrap_or(silence_deadline)), if suggest_at.is_some() => {
                    self.send_suggestion(transport).await?;
                }
                _ = sweep.tick() => self.sweep_pending(),
            }
        }
    }

    async fn handle_notification(
        &mut self,
        transport: &mut dyn Transport,
        notification: StratumNotification,
    ) -> Result<Flow> {
        match notification.method.as_str() {
            methods::NOTIFY => {
                let job = Job::from_notify_params(&notification.params)?;
                self.accept_job(job).await;
            }
            methods::SET_DIFFICULTY => {
                let difficulty = parse_set_difficulty(&notification.params)?;
                self.difficulty.apply(difficulty);
                info!(session = %self.id, difficulty = %difficulty, "New difficulty");
                if self.current_state().accepts_shares() {
                    self.emit(SessionEvent::DifficultyChanged(difficulty)).await;
                }
            }
            methods::SET_EXTRANONCE => {
                let (extranonce1, extranonce2_size) = parse_set_extranonce(&notification.params)?;
                info!(
                    session = %self.id,
                    extranonce1 = %extranonce1,
                    extranonce2_size,
                    "Extranonce updated"
                );
                if let Some(subscription) = self.subscription.as_mut() {
                    subscription.extranonce1 = extranonce1;
                    subscription.extranonce2_size = extranonce2_size;
                }
            }
            methods::PING => {
                if let Some(id) = notification.id {
                    transport.write_line(&StratumReply::pong(id).to_line()?).await?;
                }
            }
            methods::RECONNECT => {
                warn!(session = %self.id, endpoint = %self.endpoint.name, "Pool requested reconnection");
                return Ok(Flow::Reconnect);
            }
            methods::SHOW_MESSAGE => {
                let message = notification
                    .params
                    .first()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                info!(session = %self.id, endpoint = %self.endpoint.name, "Pool message: {}", message);
            }
            other => debug!(session = %self.id, "Unknown notification: {}", other),
        }
        Ok(Flow::Continue)
    }

    async fn accept_job(&mut self, job: Job) {
        self.last_notify = Instant::now();

        self.jobs.accept(job);

        let state = self.current_state();
        if state == SessionState::Degraded {
            info!(session = %self.id, endpoint = %self.endpoint.name, "Pool resumed sending jobs");
            self.set_state(SessionState::Authorized);
            self.emit(SessionEvent::Recovered).await;
        }

        if state.accepts_shares() {
            if let Some(job) = self.jobs.latest() {
                debug!(session = %self.id, "New mining job: {}", job);
                let work = self.work_for(job);
                self.emit(SessionEvent::NewJob(work)).await;
            }
        }
    }

    async fn handle_command(
        &mut self,
        transport: &mut dyn Transport,
        command: SessionCommand,
    ) -> Result<()> {
        match command {
            SessionCommand::Submit { share, reply } => {
                if !self.is_job_valid(&share.job_id) {
                    debug!(session = %self.id, job_id = %share.job_id, "Share for stale job dropped locally");
                    let _ = reply.send(ShareState::Rejected(RejectReason::StaleJob));
                    return Ok(());
                }

                let expected = self.extranonce2_size() * 2;
                if share.extranonce2.len() != expected || hex::decode(&share.extranonce2).is_err() {
                    let _ = reply.send(ShareState::Rejected(RejectReason::Unknown(format!(
                        "extranonce2 must be {} hex digits",
                        expected
                    ))));
                    return Ok(());
                }

                let id = self.next_request_id();
                let request = StratumRequest::submit(id, self.wallet.identity(), &share);
                transport.write_line(&request.to_line()?).await?;
                trace!(session = %self.id, id, job_id = %share.job_id, nonce = share.nonce, "Share submitted");

                self.pending.insert(
                    id,
                    PendingSubmit {
                        reply,
                        job_id: share.job_id,
                        nonce: share.nonce,
                        sent_at: Instant::now(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Match a response to its outstanding submit
    fn reconcile(&mut self, response: StratumResponse) {
        let Some(id) = response.request_id() else {
            debug!(session = %self.id, "Ignoring response without id");
            return;
        };

        if self.suggest_request == Some(id) {
            self.suggest_request = None;
            if let Some(error) = response.rpc_error() {
                debug!(session = %self.id, "Pool declined difficulty suggestion: {}", error.message);
            }
            return;
        }

        let Some(pending) = self.pending.remove(&id) else {
            debug!(session = %self.id, id, "Ignoring response to unknown request");
            return;
        };

        let state = ShareState::from_response(&response);
        match &state {
            ShareState::Accepted => {
                debug!(session = %self.id, job_id = %pending.job_id, nonce = pending.nonce, "Share accepted")
            }
            ShareState::Rejected(reason) => warn!(
                session = %self.id,
                job_id = %pending.job_id,
                nonce = pending.nonce,
                "Share rejected: {}",
                reason
            ),
            _ => {}
        }
        let _ = pending.reply.send(state);
    }

    fn sweep_pending(&mut self) {
        let submit_timeout = self.config.submit_timeout();
        let now = Instant::now();
        let expired: Vec<(u64, Expiry)> = self
            .pending
            .iter()
            .filter_map(|(id, p)| p.expiry(now, submit_timeout).map(|expiry| (*id, expiry)))
            .collect();

        for (id, expiry) in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            match expiry {
                Expiry::TimedOut => {
                    warn!(session = %self.id, job_id = %pending.job_id, nonce = pending.nonce, "Share timed out");
                    let _ = pending.reply.send(ShareState::TimedOut);
                }
                Expiry::Abandoned => {
                    debug!(session = %self.id, job_id = %pending.job_id, nonce = pending.nonce, "Share outcome no longer awaited");
                }
            }
        }
    }

    async fn send_suggestion(&mut self, transport: &mut dyn Transport) -> Result<()> {
        if let Some(suggestion) = self.difficulty.take_suggestion() {
            let id = self.next_request_id();
            info!(session = %self.id, difficulty = %suggestion, "Suggesting difficulty");
            transport
                .write_line(&StratumRequest::suggest_difficulty(id, suggestion.value()).to_line()?)
                .await?;
            self.suggest_request = Some(id);
        }
        Ok(())
    }

    /// Read only responses until pending submits resolve or the drain window ends
    async fn drain(&mut self, transport: &mut dyn Transport) {
        self.set_state(SessionState::Closing);
        self.abandon_queued();
        if self.pending.is_empty() {
            return;
        }

        debug!(session = %self.id, pending = self.pending.len(), "Draining outstanding submits");
        let deadline = Instant::now() + self.config.drain_timeout();
        while !self.pending.is_empty() {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                line = transport.read_line() => match line {
                    Ok(Some(line)) => {
                        if let Ok(StratumMessage::Response(response)) = StratumMessage::parse(&line) {
                            self.reconcile(response);
                        }
                    }
                    _ => break,
                },
            }
        }
    }

    /// Queued but unsent submits can no longer reach this pool
    fn abandon_queued(&mut self) {
        self.commands.close();
        while let Ok(SessionCommand::Submit { reply, .. }) = self.commands.try_recv() {
            let _ = reply.send(ShareState::Rejected(RejectReason::StaleJob));
        }
    }

    fn is_job_valid(&self, job_id: &str) -> bool {
        self.jobs.contains(job_id)
    }

    fn extranonce2_size(&self) -> usize {
        self.subscription
            .as_ref()
            .map(|s| s.extranonce2_size)
            .unwrap_or_default()
    }

    fn work_for(&self, job: &Job) -> Work {
        let (extranonce1, extranonce2_size) = self
            .subscription
            .as_ref()
            .map(|s| (s.extranonce1.clone(), s.extranonce2_size))
            .unwrap_or_default();

        Work {
            session_id: self.id,
            endpoint: self.endpoint.name.clone(),
            job: job.clone(),
            extranonce1,
            extranonce2_size,
            difficulty: self.difficulty.current(),
            target: self.difficulty.target_hex(),
        }
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(session = %self.id, endpoint = %self.endpoint.name, "{} -> {}", previous, state);
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let message = SessionMessage {
            session: self.id,
            event,
        };
        if self.events.send(message).await.is_err() {
            trace!(session = %self.id, "Session owner gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{notify_params, MockConnector, PoolScript};
    use crate::wallet::WalletConfig;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn wallet() -> Arc<WalletGuard> {
        Arc::new(
            WalletGuard::new(WalletConfig {
                payout_address: "bc1qaddr".to_string(),
                worker_name: "rig01".to_string(),
            })
            .unwrap(),
        )
    }

    fn start(
        connector: Arc<MockConnector>,
        config: StratumConfig,
    ) -> (SessionHandle, mpsc::Receiver<SessionMessage>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let handle = StratumSession::spawn(
            PoolEndpoint::new("primary", "stratum+tcp://primary:3333", 0),
            Arc::new(config),
            wallet(),
            connector,
            events_tx,
        );
        (handle, events_rx)
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionMessage>) -> SessionEvent {
        timeout(Duration::from_secs(300), events.recv())
            .await
            .expect("event timeout")
            .expect("events closed")
            .event
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_reaches_authorized() {
        let connector = Arc::new(MockConnector::new());
        connector.script("primary", PoolScript::default());
        let (handle, mut events) = start(connector.clone(), StratumConfig::default());

        match next_event(&mut events).await {
            SessionEvent::Authorized { work, difficulty } => {
                assert_eq!(difficulty, Difficulty(1.0));
                assert!(work.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(handle.state(), SessionState::Authorized);

        let pool = connector.pool("primary").await;
        let sent = pool.received();
        assert!(sent[0].contains("\"method\":\"mining.subscribe\""));
        assert_eq!(
            sent[1],
            r#"{"id":2,"method":"mining.authorize","params":["bc1qaddr.rig01","x"]}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_uses_wallet_identity_and_difficulty() {
        let connector = Arc::new(MockConnector::new());
        connector.script("primary", PoolScript::default());
        let (handle, mut events) = start(connector.clone(), StratumConfig::default());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authorized { .. }));

        let pool = connector.pool("primary").await;
        pool.set_difficulty(4.0);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::DifficultyChanged(Difficulty(d)) if d == 4.0
        ));
        pool.notify("abc", true);
        match next_event(&mut events).await {
            SessionEvent::NewJob(work) => {
                assert_eq!(work.job.job_id, "abc");
                assert_eq!(work.difficulty, Difficulty(4.0));
                assert_eq!(work.extranonce2_size, 4);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let outcome = handle
            .submit(SubmitParams {
                job_id: "abc".to_string(),
                extranonce2: "00000001".to_string(),
                ntime: 0x5f5e1000,
                nonce: 0x1234,
            })
            .await
            .unwrap();
        assert_eq!(outcome.await.unwrap(), ShareState::Accepted);

        let submit = pool
            .received()
            .into_iter()
            .find(|l| l.contains("mining.submit"))
            .unwrap();
        assert_eq!(
            submit,
            r#"{"id":3,"method":"mining.submit","params":["bc1qaddr.rig01","abc","00000001","5f5e1000","00001234"]}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_jobs_makes_old_jobs_stale() {
        let connector = Arc::new(MockConnector::new());
        connector.script("primary", PoolScript::default());
        let (handle, mut events) = start(connector.clone(), StratumConfig::default());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authorized { .. }));

        let pool = connector.pool("primary").await;
        pool.notify("old", false);
        assert!(matches!(next_event(&mut events).await, SessionEvent::NewJob(_)));
        pool.notify("new", true);
        assert!(matches!(next_event(&mut events).await, SessionEvent::NewJob(_)));

        let outcome = handle
            .submit(SubmitParams {
                job_id: "old".to_string(),
                extranonce2: "00000000".to_string(),
                ntime: 1,
                nonce: 7,
            })
            .await
            .unwrap();
        assert_eq!(
            outcome.await.unwrap(),
            ShareState::Rejected(RejectReason::StaleJob)
        );
        assert!(!pool.received().iter().any(|l| l.contains("mining.submit")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_share_maps_reason() {
        let connector = Arc::new(MockConnector::new());
        connector.script(
            "primary",
            PoolScript {
                submit_error: Some((23, "Low difficulty share".to_string())),
                ..PoolScript::default()
            },
        );
        let (handle, mut events) = start(connector.clone(), StratumConfig::default());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authorized { .. }));
        connector.pool("primary").await.notify("j1", true);
        assert!(matches!(next_event(&mut events).await, SessionEvent::NewJob(_)));

        let outcome = handle
            .submit(SubmitParams {
                job_id: "j1".to_string(),
                extranonce2: "0000000a".to_string(),
                ntime: 1,
                nonce: 1,
            })
            .await
            .unwrap();
        assert_eq!(
            outcome.await.unwrap(),
            ShareState::Rejected(RejectReason::LowDifficulty)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_submit_times_out() {
        let connector = Arc::new(MockConnector::new());
        connector.script(
            "primary",
            PoolScript {
                answer_submits: false,
                ..PoolScript::default()
            },
        );
        let (handle, mut events) = start(connector.clone(), StratumConfig::default());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authorized { .. }));
        connector.pool("primary").await.notify("j1", true);
        assert!(matches!(next_event(&mut events).await, SessionEvent::NewJob(_)));

        let outcome = handle
            .submit(SubmitParams {
                job_id: "j1".to_string(),
                extranonce2: "00000000".to_string(),
                ntime: 1,
                nonce: 1,
            })
            .await
            .unwrap();
        assert_eq!(outcome.await.unwrap(), ShareState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_degrades_and_notify_recovers() {
        let connector = Arc::new(MockConnector::new());
        connector.script("primary", PoolScript::default());
        let (handle, mut events) = start(connector.clone(), StratumConfig::default());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authorized { .. }));

        match next_event(&mut events).await {
            SessionEvent::Degraded { silent_for } => {
                assert!(silent_for >= Duration::from_secs(90))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(handle.state(), SessionState::Degraded);

        connector.pool("primary").await.notify("late", false);
        assert!(matches!(next_event(&mut events).await, SessionEvent::Recovered));
        assert!(matches!(next_event(&mut events).await, SessionEvent::NewJob(_)));
        assert_eq!(handle.state(), SessionState::Authorized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_authorization_fails_session() {
        let connector = Arc::new(MockConnector::new());
        connector.script(
            "primary",
            PoolScript {
                authorize: false,
                ..PoolScript::default()
            },
        );
        let (handle, mut events) = start(connector, StratumConfig::default());

        match next_event(&mut events).await {
            SessionEvent::Closed(CloseReason::Failed(StratumError::Authorization(_))) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_closes_session() {
        let connector = Arc::new(MockConnector::new());
        connector.script("primary", PoolScript::default());
        let (_handle, mut events) = start(connector.clone(), StratumConfig::default());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authorized { .. }));

        connector.pool("primary").await.send_raw("{not json");
        match next_event(&mut events).await {
            SessionEvent::Closed(CloseReason::Failed(StratumError::Protocol(_))) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_and_reconnect_closes_gracefully() {
        let connector = Arc::new(MockConnector::new());
        connector.script("primary", PoolScript::default());
        let (_handle, mut events) = start(connector.clone(), StratumConfig::default());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authorized { .. }));

        let pool = connector.pool("primary").await;
        pool.send_raw(&json!({"id": 99, "method": "mining.ping", "params": []}).to_string());
        pool.send_raw(&json!({"id": null, "method": "client.reconnect", "params": []}).to_string());

        match next_event(&mut events).await {
            SessionEvent::Closed(CloseReason::PoolReconnect) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert!(pool
            .received()
            .iter()
            .any(|l| l == r#"{"id":99,"result":"pong","error":null}"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggestion_sent_after_warmup() {
        let connector = Arc::new(MockConnector::new());
        connector.script("primary", PoolScript::default());
        let config = StratumConfig {
            suggest_difficulty: Some(512.0),
            ..StratumConfig::default()
        };
        let (_handle, mut events) = start(connector.clone(), config);
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authorized { .. }));

        let pool = connector.pool("primary").await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        let suggestions: Vec<String> = pool
            .received()
            .into_iter()
            .filter(|l| l.contains("mining.suggest_difficulty"))
            .collect();
        assert_eq!(
            suggestions,
            vec![r#"{"id":3,"method":"mining.suggest_difficulty","params":[512.0]}"#.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_seen_during_handshake_is_in_snapshot() {
        let connector = Arc::new(MockConnector::new());
        connector.script(
            "primary",
            PoolScript {
                job_before_authorize: Some("early".to_string()),
                ..PoolScript::default()
            },
        );
        let (_handle, mut events) = start(connector, StratumConfig::default());

        match next_event(&mut events).await {
            SessionEvent::Authorized { work: Some(work), .. } => {
                assert_eq!(work.job.job_id, "early");
                assert_eq!(work.job, Job::from_notify_params(&notify_params("early", true)).unwrap());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_submit_expiry() {
        let (reply, outcome) = oneshot::channel();
        let pending = PendingSubmit {
            reply,
            job_id: "j1".to_string(),
            nonce: 1,
            sent_at: Instant::now(),
        };
        let submit_timeout = Duration::from_secs(30);
        assert_eq!(pending.expiry(Instant::now(), submit_timeout), None);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            pending.expiry(Instant::now(), submit_timeout),
            Some(Expiry::TimedOut)
        );

        // A dropped receiver is not reported as a timeout
        drop(outcome);
        assert_eq!(
            pending.expiry(Instant::now(), submit_timeout),
            Some(Expiry::Abandoned)
        );
    }

    fn job(job_id: &str, clean_jobs: bool) -> Job {
        Job::from_notify_params(&notify_params(job_id, clean_jobs)).unwrap()
    }

    #[test]
    fn test_job_book_keeps_latest_within_limit() {
        let mut book = JobBook::new(2);
        book.accept(job("a", false));
        book.accept(job("b", false));
        book.accept(job("c", false));

        assert!(!book.contains("a"));
        assert!(book.contains("b"));
        assert_eq!(book.latest().map(|j| j.job_id.as_str()), Some("c"));
    }

    proptest! {
        /// No job announced before the latest clean_jobs notify stays submittable.
        #[test]
        fn prop_clean_jobs_blocks_older_jobs(
            notifies in prop::collection::vec((0u8..6, prop::bool::weighted(0.3)), 1..120),
            limit in 1usize..8,
        ) {
            let mut book = JobBook::new(limit);
            let mut announced: HashMap<String, usize> = HashMap::new();
            let mut last_clean = None;

            for (step, (id, clean)) in notifies.into_iter().enumerate() {
                let job_id = format!("job{}", id);
                book.accept(job(&job_id, clean));
                announced.insert(job_id.clone(), step);
                if clean {
                    last_clean = Some(step);
                }

                prop_assert!(book.contains(&job_id));
                prop_assert_eq!(book.latest().map(|j| j.job_id.clone()), Some(job_id));
                for (other, at) in &announced {
                    if last_clean.map_or(false, |clean_at| *at < clean_at) {
                        prop_assert!(!book.contains(other), "{} outlived clean_jobs", other);
                    }
                }
                prop_assert!(book.jobs.len() <= limit);
            }
        }
    }
}
