//! Scripted in-process pools for tests.
//!
//! [`MockConnector`] hands out [`MockTransport`]s wired by channels to a small
//! pool task that follows a [`PoolScript`]. Tests drive the pool side through
//! [`MockPool`]: push notifications, inspect what the client wrote, drop the
//! connection.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{mpsc, Notify};

use crate::{
    config::PoolEndpoint,
    connection::{Connector, Transport},
    error::{Result, StratumError},
    protocol::methods,
};

/// How the scripted pool behaves on each connection
#[derive(Debug, Clone)]
pub struct PoolScript {
    /// Refuse TCP connections outright
    pub refuse: bool,

    /// Answer mining.subscribe (a silent pool times the handshake out)
    pub answer_subscribe: bool,

    /// Accept mining.authorize
    pub authorize: bool,

    pub extranonce1: String,
    pub extranonce2_size: usize,

    /// Job pushed between the subscribe and authorize responses
    pub job_before_authorize: Option<String>,

    /// Difficulty pushed right after authorization
    pub difficulty: Option<f64>,

    /// Job pushed right after authorization
    pub initial_job: Option<String>,

    /// Reject every submit with this code and message
    pub submit_error: Option<(i64, String)>,

    /// Answer submits at all
    pub answer_submits: bool,
}

impl Default for PoolScript {
    fn default() -> Self {
        Self {
            refuse: false,
            answer_subscribe: true,
            authorize: true,
            extranonce1: "08000002".to_string(),
            extranonce2_size: 4,
            job_before_authorize: None,
            difficulty: None,
            initial_job: None,
            submit_error: None,
            answer_submits: true,
        }
    }
}

impl PoolScript {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Healthy pool that sends a job as soon as the worker is authorized
    pub fn with_job(job_id: &str) -> Self {
        Self {
            initial_job: Some(job_id.to_string()),
            ..Self::default()
        }
    }
}

/// Valid mining.notify params for `job_id`
pub fn notify_params(job_id: &str, clean_jobs: bool) -> Vec<Value> {
    vec![
        json!(job_id),
        json!("00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054"),
        json!("01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008"),
        json!("072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000"),
        json!([]),
        json!("20000000"),
        json!("1705ae3a"),
        json!("5f5e1000"),
        json!(clean_jobs),
    ]
}

fn notify_line(job_id: &str, clean_jobs: bool) -> String {
    json!({"id": null, "method": methods::NOTIFY, "params": notify_params(job_id, clean_jobs)})
        .to_string()
}

/// Client end of a scripted connection
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Option<String>>,
    outgoing: mpsc::UnboundedSender<String>,
    received: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_line(&mut self) -> Result<Option<String>> {
        match self.incoming.recv().await {
            Some(Some(line)) => Ok(Some(line)),
            Some(None) | None => Ok(None),
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        if let Ok(mut received) = self.received.lock() {
            received.push(line.to_string());
        }
        self.outgoing
            .send(line.to_string())
            .map_err(|_| StratumError::Disconnected)
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Pool end of a scripted connection
#[derive(Clone)]
pub struct MockPool {
    endpoint: String,
    received: Arc<Mutex<Vec<String>>>,
    to_client: mpsc::UnboundedSender<Option<String>>,
}

impl MockPool {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Every line the client wrote, in order
    pub fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Params of every mining.submit the client sent
    pub fn submits(&self) -> Vec<Vec<Value>> {
        self.received()
            .iter()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|msg| msg["method"] == methods::SUBMIT)
            .filter_map(|msg| msg["params"].as_array().cloned())
            .collect()
    }

    pub fn notify(&self, job_id: &str, clean_jobs: bool) {
        self.send_raw(&notify_line(job_id, clean_jobs));
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        self.send_raw(
            &json!({"id": null, "method": methods::SET_DIFFICULTY, "params": [difficulty]})
                .to_string(),
        );
    }

    pub fn send_raw(&self, line: &str) {
        let _ = self.to_client.send(Some(line.to_string()));
    }

    /// Close the connection from the pool side
    pub fn disconnect(&self) {
        let _ = self.to_client.send(None);
    }
}

/// Connector that dials scripted pools by endpoint name
#[derive(Default)]
pub struct MockConnector {
    scripts: Mutex<HashMap<String, PoolScript>>,
    attempts: Mutex<HashMap<String, u32>>,
    pools: Mutex<HashMap<String, Vec<MockPool>>>,
    connected: Notify,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the behavior for future connections to `endpoint`
    pub fn script(&self, endpoint: &str, script: PoolScript) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(endpoint.to_string(), script);
        }
    }

    /// Connection attempts made to `endpoint`, refused ones included
    pub fn attempts(&self, endpoint: &str) -> u32 {
        self.attempts
            .lock()
            .ok()
            .and_then(|attempts| attempts.get(endpoint).copied())
            .unwrap_or_default()
    }

    /// Accepted connections to `endpoint`
    pub fn connections(&self, endpoint: &str) -> usize {
        self.pools
            .lock()
            .ok()
            .and_then(|pools| pools.get(endpoint).map(Vec::len))
            .unwrap_or_default()
    }

    /// Latest accepted connection to `endpoint`, waiting for one if needed
    pub async fn pool(&self, endpoint: &str) -> MockPool {
        loop {
            let connected = self.connected.notified();
            if let Some(pool) = self.latest(endpoint) {
                return pool;
            }
            connected.await;
        }
    }

    fn latest(&self, endpoint: &str) -> Option<MockPool> {
        self.pools
            .lock()
            .ok()
            .and_then(|pools| pools.get(endpoint).and_then(|p| p.last().cloned()))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &PoolEndpoint) -> Result<Box<dyn Transport>> {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts.entry(endpoint.name.clone()).or_default() += 1;
        }

        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|scripts| scripts.get(&endpoint.name).cloned())
            .unwrap_or_else(PoolScript::refusing);

        if script.refuse {
            return Err(StratumError::Connection(format!(
                "{}: connection refused",
                endpoint.url
            )));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let received = Arc::new(Mutex::new(Vec::new()));

        let pool = MockPool {
            endpoint: endpoint.name.clone(),
            received: received.clone(),
            to_client: to_client.clone(),
        };
        if let Ok(mut pools) = self.pools.lock() {
            pools.entry(endpoint.name.clone()).or_default().push(pool);
        }
        self.connected.notify_waiters();

        tokio::spawn(run_pool(script, from_client, to_client));

        Ok(Box::new(MockTransport {
            incoming,
            outgoing,
            received,
        }))
    }
}

async fn run_pool(
    script: PoolScript,
    mut from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Option<String>>,
) {
    let send = |value: Value| {
        let _ = to_client.send(Some(value.to_string()));
    };

    while let Some(line) = from_client.recv().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = message["id"].clone();
        if id.is_null() {
            continue;
        }

        match message["method"].as_str().unwrap_or_default() {
            methods::SUBSCRIBE => {
                if !script.answer_subscribe {
                    continue;
                }
                send(json!({
                    "id": id,
                    "result": [
                        [["mining.set_difficulty", "d1"], ["mining.notify", "n1"]],
                        script.extranonce1,
                        script.extranonce2_size
                    ],
                    "error": null
                }));
                if let Some(job_id) = &script.job_before_authorize {
                    let _ = to_client.send(Some(notify_line(job_id, true)));
                }
            }
            methods::AUTHORIZE => {
                if !script.authorize {
                    send(json!({"id": id, "result": false, "error": [24, "Unauthorized worker", null]}));
                    continue;
                }
                send(json!({"id": id, "result": true, "error": null}));
                if let Some(difficulty) = script.difficulty {
                    send(json!({"id": null, "method": methods::SET_DIFFICULTY, "params": [difficulty]}));
                }
                if let Some(job_id) = &script.initial_job {
                    let _ = to_client.send(Some(notify_line(job_id, true)));
                }
            }
            methods::SUBMIT => {
                if !script.answer_submits {
                    continue;
                }
                match &script.submit_error {
                    Some((code, message)) => {
                        send(json!({"id": id, "result": null, "error": [code, message, null]}))
                    }
                    None => send(json!({"id": id, "result": true, "error": null})),
                }
            }
            // Replies to our pings and anything else
            "" => {}
            _ => send(json!({"id": id, "result": true, "error": null})),
        }
    }
}
