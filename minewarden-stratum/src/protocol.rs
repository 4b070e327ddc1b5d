use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Result, StratumError};

/// Stratum JSON-RPC request sent by the client.
///
/// Field order is `id`, `method`, `params` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumRequest {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

/// Stratum JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

/// Reply to a server-initiated request (e.g. mining.ping)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumReply {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

/// Stratum JSON-RPC error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumRpcError {
    pub code: i64,
    pub message: String,
}

/// Stratum notification or server request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumNotification {
    /// Null for notifications, set for server requests that expect a reply
    pub id: Option<Value>,
    pub method: String,
    pub params: Vec<Value>,
}

/// Any message received from the pool
#[derive(Debug, Clone, PartialEq)]
pub enum StratumMessage {
    Response(StratumResponse),
    Notification(StratumNotification),
}

/// Stratum methods
pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const NOTIFY: &str = "mining.notify";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
    pub const SET_EXTRANONCE: &str = "mining.set_extranonce";
    pub const SUGGEST_DIFFICULTY: &str = "mining.suggest_difficulty";
    pub const PING: &str = "mining.ping";
    pub const RECONNECT: &str = "client.reconnect";
    pub const SHOW_MESSAGE: &str = "client.show_message";
}

/// Stratum V1 submit error codes
pub mod error_codes {
    pub const OTHER: i64 = 20;
    pub const JOB_NOT_FOUND: i64 = 21;
    pub const DUPLICATE_SHARE: i64 = 22;
    pub const LOW_DIFFICULTY: i64 = 23;
    pub const UNAUTHORIZED_WORKER: i64 = 24;
    pub const NOT_SUBSCRIBED: i64 = 25;
}

impl StratumRequest {
    /// Create a mining.subscribe request
    pub fn subscribe(id: u64, user_agent: &str) -> Self {
        Self {
            id,
            method: methods::SUBSCRIBE.to_string(),
            params: vec![Value::String(user_agent.to_string())],
        }
    }

    /// Create a mining.authorize request
    pub fn authorize(id: u64, username: &str, password: &str) -> Self {
        Self {
            id,
            method: methods::AUTHORIZE.to_string(),
            params: vec![
                Value::String(username.to_string()),
                Value::String(password.to_string()),
            ],
        }
    }

    /// Create a mining.submit request
    pub fn submit(id: u64, username: &str, share: &SubmitParams) -> Self {
        Self {
            id,
            method: methods::SUBMIT.to_string(),
            params: vec![
                Value::String(username.to_string()),
                Value::String(share.job_id.clone()),
                Value::String(share.extranonce2.clone()),
                Value::String(format!("{:08x}", share.ntime)),
                Value::String(format!("{:08x}", share.nonce)),
            ],
        }
    }

    /// Create a mining.suggest_difficulty request
    pub fn suggest_difficulty(id: u64, difficulty: f64) -> Self {
        let value = serde_json::Number::from_f64(difficulty)
            .map(Value::Number)
            .unwrap_or(Value::Null);

        Self {
            id,
            method: methods::SUGGEST_DIFFICULTY.to_string(),
            params: vec![value],
        }
    }

    /// Serialize to a single wire line (without the trailing newline)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl StratumReply {
    pub fn pong(id: Value) -> Self {
        Self {
            id,
            result: Value::String("pong".to_string()),
            error: Value::Null,
        }
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl StratumMessage {
    /// Parse one line received from the pool.
    ///
    /// Anything that is neither a response nor a method call is a protocol error.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| StratumError::Protocol(format!("malformed JSON: {}", e)))?;

        let obj = value
            .as_object()
            .ok_or_else(|| StratumError::Protocol("message is not a JSON object".to_string()))?;

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| StratumError::Protocol("method is not a string".to_string()))?
                .to_string();

            let params = match obj.get("params") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(arr)) => arr.clone(),
                Some(_) => {
                    return Err(StratumError::Protocol(format!(
                        "{} params is not an array",
                        method
                    )))
                }
            };

            let id = obj.get("id").filter(|id| !id.is_null()).cloned();

            return Ok(StratumMessage::Notification(StratumNotification {
                id,
                method,
                params,
            }));
        }

        if obj.contains_key("result") || obj.contains_key("error") {
            return Ok(StratumMessage::Response(StratumResponse {
                id: obj.get("id").filter(|id| !id.is_null()).cloned(),
                result: obj.get("result").filter(|r| !r.is_null()).cloned(),
                error: obj.get("error").filter(|e| !e.is_null()).cloned(),
            }));
        }

        Err(StratumError::Protocol(format!(
            "unrecognized message: {}",
            line
        )))
    }
}

impl StratumResponse {
    /// Numeric request id, if any
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Decode the error member, accepting both the `[code, message, data]`
    /// triple and the `{code, message}` object form.
    pub fn rpc_error(&self) -> Option<StratumRpcError> {
        let error = self.error.as_ref()?;

        let parsed = match error {
            Value::Array(arr) => StratumRpcError {
                code: arr.first().and_then(Value::as_i64).unwrap_or(error_codes::OTHER),
                message: arr
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string(),
            },
            Value::Object(obj) => StratumRpcError {
                code: obj.get("code").and_then(Value::as_i64).unwrap_or(error_codes::OTHER),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string(),
            },
            Value::String(s) => StratumRpcError {
                code: error_codes::OTHER,
                message: s.clone(),
            },
            other => StratumRpcError {
                code: error_codes::OTHER,
                message: other.to_string(),
            },
        };

        Some(parsed)
    }

    /// True when the pool answered `result: true` without an error
    pub fn is_true(&self) -> bool {
        self.error.is_none() && self.result.as_ref().and_then(Value::as_bool) == Some(true)
    }
}

/// Why the pool refused a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    StaleJob,
    Duplicate,
    LowDifficulty,
    Unauthorized,
    Unknown(String),
}

impl RejectReason {
    /// Map a submit error onto a rejection reason.
    pub fn from_rpc_error(error: &StratumRpcError) -> Self {
        match error.code {
            error_codes::JOB_NOT_FOUND => RejectReason::StaleJob,
            error_codes::DUPLICATE_SHARE => RejectReason::Duplicate,
            error_codes::LOW_DIFFICULTY => RejectReason::LowDifficulty,
            error_codes::UNAUTHORIZED_WORKER | error_codes::NOT_SUBSCRIBED => {
                RejectReason::Unauthorized
            }
            _ => {
                let message = error.message.to_ascii_lowercase();
                if message.contains("stale") || message.contains("job not found") {
                    RejectReason::StaleJob
                } else if message.contains("duplicate") {
                    RejectReason::Duplicate
                } else if message.contains("low difficulty") || message.contains("above target") {
                    RejectReason::LowDifficulty
                } else if message.contains("unauthorized") {
                    RejectReason::Unauthorized
                } else {
                    RejectReason::Unknown(error.message.clone())
                }
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::StaleJob => "stale-job",
            RejectReason::Duplicate => "duplicate",
            RejectReason::LowDifficulty => "low-difficulty",
            RejectReason::Unauthorized => "unauthorized",
            RejectReason::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Unknown(msg) => write!(f, "unknown ({})", msg),
            other => f.write_str(other.label()),
        }
    }
}

/// Lifecycle of a submitted share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareState {
    Pending,
    Accepted,
    Rejected(RejectReason),
    TimedOut,
}

impl ShareState {
    /// Reconcile a submit response into a final share state
    pub fn from_response(response: &StratumResponse) -> Self {
        if let Some(error) = response.rpc_error() {
            return ShareState::Rejected(RejectReason::from_rpc_error(&error));
        }

        match response.result.as_ref().and_then(Value::as_bool) {
            Some(true) => ShareState::Accepted,
            _ => ShareState::Rejected(RejectReason::Unknown("pool returned false".to_string())),
        }
    }
}

/// Mining job received from pool (mining.notify)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branches: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
}

impl Job {
    /// Parse from mining.notify params
    pub fn from_notify_params(params: &[Value]) -> Result<Self> {
        if params.len() < 9 {
            return Err(StratumError::Protocol(format!(
                "mining.notify expects 9 params, got {}",
                params.len()
            )));
        }

        let job_id = str_param(params, 0, "job_id")?;
        if job_id.is_empty() {
            return Err(StratumError::Protocol("empty job_id".to_string()));
        }

        let prev_hash = hex_param(params, 1, "prev_hash")?;
        if prev_hash.len() != 64 {
            return Err(StratumError::Protocol(format!(
                "prev_hash must be 32 bytes, got {} hex chars",
                prev_hash.len()
            )));
        }

        let merkle_branches = params[4]
            .as_array()
            .ok_or_else(|| StratumError::Protocol("merkle_branches not an array".to_string()))?
            .iter()
            .map(|v| {
                v.as_str()
                    .filter(|s| hex::decode(s).is_ok())
                    .map(String::from)
                    .ok_or_else(|| StratumError::Protocol("invalid merkle branch".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let version = u32_hex_param(params, 5, "version")?;
        let nbits = u32_hex_param(params, 6, "nbits")?;
        let ntime = u32_hex_param(params, 7, "ntime")?;

        let clean_jobs = params[8]
            .as_bool()
            .ok_or_else(|| StratumError::Protocol("clean_jobs not a bool".to_string()))?;

        Ok(Self {
            job_id,
            prev_hash,
            coinbase1: hex_param(params, 2, "coinbase1")?,
            coinbase2: hex_param(params, 3, "coinbase2")?,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }

    /// Job ntime as an integer
    pub fn ntime_value(&self) -> u32 {
        u32::from_str_radix(&self.ntime, 16).unwrap_or_default()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job {} (clean: {})", self.job_id, self.clean_jobs)
    }
}

/// Share fields placed on the wire by mining.submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitParams {
    pub job_id: String,
    /// Hex-encoded extranonce2, exactly `extranonce2_size` bytes
    pub extranonce2: String,
    pub ntime: u32,
    pub nonce: u32,
}

/// Mining.subscribe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    pub subscription_id: Option<String>,
    pub extranonce1: String,
    pub extranonce2_size: usize,
}

impl SubscribeResult {
    /// Parse `[[subscriptions...], extranonce1, extranonce2_size]`
    pub fn from_response(result: &Value) -> Result<Self> {
        let arr = result
            .as_array()
            .ok_or_else(|| StratumError::Subscription("result is not an array".to_string()))?;

        if arr.len() < 3 {
            return Err(StratumError::Subscription(
                "result is too short".to_string(),
            ));
        }

        // Prefer the mining.notify subscription id
        let subscription_id = arr[0].as_array().and_then(|subs| {
            let pairs: Vec<(&str, &str)> = subs
                .iter()
                .filter_map(|s| {
                    let pair = s.as_array()?;
                    Some((pair.first()?.as_str()?, pair.get(1)?.as_str()?))
                })
                .collect();
            pairs
                .iter()
                .find(|(method, _)| *method == methods::NOTIFY)
                .or_else(|| pairs.first())
                .map(|(_, id)| id.to_string())
        });

        let (extranonce1, extranonce2_size) = parse_extranonce(&arr[1], &arr[2])
            .map_err(|e| StratumError::Subscription(e.to_string()))?;

        Ok(Self {
            subscription_id,
            extranonce1,
            extranonce2_size,
        })
    }
}

/// Parse mining.set_extranonce params `[extranonce1, extranonce2_size]`
pub fn parse_set_extranonce(params: &[Value]) -> Result<(String, usize)> {
    if params.len() < 2 {
        return Err(StratumError::Protocol(
            "mining.set_extranonce expects 2 params".to_string(),
        ));
    }
    parse_extranonce(&params[0], &params[1])
}

/// Parse mining.set_difficulty params `[difficulty]`
pub fn parse_set_difficulty(params: &[Value]) -> Result<Difficulty> {
    let value = params
        .first()
        .and_then(Value::as_f64)
        .ok_or_else(|| StratumError::Protocol("difficulty not a number".to_string()))?;

    Difficulty::new(value)
}

fn parse_extranonce(extranonce1: &Value, size: &Value) -> Result<(String, usize)> {
    let extranonce1 = extranonce1
        .as_str()
        .filter(|s| hex::decode(s).is_ok())
        .ok_or_else(|| StratumError::Protocol("extranonce1 is not hex".to_string()))?
        .to_string();

    let size = size
        .as_u64()
        .filter(|n| (1..=16).contains(n))
        .ok_or_else(|| StratumError::Protocol("invalid extranonce2_size".to_string()))?
        as usize;

    Ok((extranonce1, size))
}

fn str_param(params: &[Value], idx: usize, name: &str) -> Result<String> {
    params[idx]
        .as_str()
        .map(String::from)
        .ok_or_else(|| StratumError::Protocol(format!("{} not a string", name)))
}

fn hex_param(params: &[Value], idx: usize, name: &str) -> Result<String> {
    let value = str_param(params, idx, name)?;
    hex::decode(&value).map_err(|e| StratumError::Protocol(format!("{} hex: {}", name, e)))?;
    Ok(value)
}

fn u32_hex_param(params: &[Value], idx: usize, name: &str) -> Result<String> {
    let value = str_param(params, idx, name)?;
    if value.len() != 8 || u32::from_str_radix(&value, 16).is_err() {
        return Err(StratumError::Protocol(format!(
            "{} must be 8 hex digits, got {:?}",
            name, value
        )));
    }
    Ok(value)
}

/// Pool share difficulty
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Difficulty(pub f64);

impl Difficulty {
    /// Validated constructor: difficulty must be finite and positive
    pub fn new(value: f64) -> Result<Self> {
        if value.is_finite() && value > 0.0 {
            Ok(Difficulty(value))
        } else {
            Err(StratumError::Protocol(format!("invalid difficulty {}", value)))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Convert difficulty to a 256-bit big-endian target.
    ///
    /// `target = 0xffff * 2^208 / difficulty`, saturating at all-ones.
    pub fn to_target(&self) -> [u8; 32] {
        if !(self.0.is_finite() && self.0 > 0.0) {
            return [0xff; 32];
        }

        let quotient = 65535.0 / self.0;
        let bits = quotient.to_bits();
        let exp_bits = ((bits >> 52) & 0x7ff) as i64;
        let fraction = bits & ((1u64 << 52) - 1);
        let (mantissa, exponent) = if exp_bits == 0 {
            (fraction, -1074)
        } else {
            (fraction | (1u64 << 52), exp_bits - 1075)
        };

        // quotient * 2^208 == mantissa * 2^shift
        let shift = exponent + 208;
        if shift + 53 > 256 {
            return [0xff; 32];
        }

        let mut target = [0u8; 32];
        for bit in 0..53i64 {
            if (mantissa >> bit) & 1 == 0 {
                continue;
            }
            let pos = bit + shift;
            if pos < 0 {
                continue;
            }
            let byte = 31 - (pos / 8) as usize;
            target[byte] |= 1 << (pos % 8);
        }
        target
    }

    /// Target as 64 hex digits
    pub fn target_hex(&self) -> String {
        hex::encode(self.to_target())
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty(1.0)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn notify_params(job_id: &str, clean: bool) -> Vec<Value> {
        vec![
            json!(job_id),
            json!("00000000000000000000000000000000000000000000000000000000deadbeef"),
            json!("01000000"),
            json!("ffffffff"),
            json!(["aa", "bb"]),
            json!("20000000"),
            json!("1d00ffff"),
            json!("5f5e1000"),
            json!(clean),
        ]
    }

    #[test]
    fn test_difficulty_to_target() {
        assert_eq!(
            Difficulty(1.0).target_hex(),
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
        assert!(Difficulty(4.0).target_hex().starts_with("000000003fffc000"));

        // Higher difficulty = lower target
        assert!(Difficulty(256.0).to_target() < Difficulty(1.0).to_target());
        assert_eq!(Difficulty(0.0).to_target(), [0xff; 32]);
    }

    #[test]
    fn test_request_wire_format() {
        let req = StratumRequest::subscribe(1, "minewarden/0.1.0");
        assert_eq!(
            req.to_line().unwrap(),
            r#"{"id":1,"method":"mining.subscribe","params":["minewarden/0.1.0"]}"#
        );

        let req = StratumRequest::authorize(2, "bc1qaddr.rig01", "x");
        assert_eq!(
            req.to_line().unwrap(),
            r#"{"id":2,"method":"mining.authorize","params":["bc1qaddr.rig01","x"]}"#
        );

        let share = SubmitParams {
            job_id: "abc".to_string(),
            extranonce2: "00000001".to_string(),
            ntime: 0x5f5e1000,
            nonce: 0x1234,
        };
        let req = StratumRequest::submit(7, "bc1qaddr.rig01", &share);
        assert_eq!(
            req.to_line().unwrap(),
            r#"{"id":7,"method":"mining.submit","params":["bc1qaddr.rig01","abc","00000001","5f5e1000","00001234"]}"#
        );

        let req = StratumRequest::suggest_difficulty(9, 512.0);
        assert_eq!(
            req.to_line().unwrap(),
            r#"{"id":9,"method":"mining.suggest_difficulty","params":[512.0]}"#
        );
    }

    #[test]
    fn test_message_classification() {
        let msg = StratumMessage::parse(
            r#"{"id":null,"method":"mining.set_difficulty","params":[4]}"#,
        )
        .unwrap();
        assert!(matches!(msg, StratumMessage::Notification(ref n) if n.id.is_none()));

        let msg = StratumMessage::parse(r#"{"id":3,"result":true,"error":null}"#).unwrap();
        match msg {
            StratumMessage::Response(resp) => {
                assert_eq!(resp.request_id(), Some(3));
                assert!(resp.is_true());
            }
            other => panic!("unexpected {:?}", other),
        }

        let msg = StratumMessage::parse(r#"{"id":"p1","method":"mining.ping","params":[]}"#).unwrap();
        assert!(matches!(msg, StratumMessage::Notification(ref n) if n.id == Some(json!("p1"))));

        assert!(StratumMessage::parse("not json").is_err());
        assert!(StratumMessage::parse("[1,2,3]").is_err());
        assert!(StratumMessage::parse(r#"{"id":1}"#).is_err());
    }

    #[test]
    fn test_submit_outcome_mapping() {
        let outcome = |line: &str| match StratumMessage::parse(line).unwrap() {
            StratumMessage::Response(resp) => ShareState::from_response(&resp),
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(outcome(r#"{"id":1,"result":true,"error":null}"#), ShareState::Accepted);
        assert_eq!(
            outcome(r#"{"id":1,"result":null,"error":[21,"Job not found",null]}"#),
            ShareState::Rejected(RejectReason::StaleJob)
        );
        assert_eq!(
            outcome(r#"{"id":1,"result":null,"error":[22,"Duplicate share",null]}"#),
            ShareState::Rejected(RejectReason::Duplicate)
        );
        assert_eq!(
            outcome(r#"{"id":1,"result":false,"error":{"code":23,"message":"Low difficulty"}}"#),
            ShareState::Rejected(RejectReason::LowDifficulty)
        );
        assert_eq!(
            outcome(r#"{"id":1,"result":null,"error":[24,"Unauthorized worker",null]}"#),
            ShareState::Rejected(RejectReason::Unauthorized)
        );
        assert_eq!(
            outcome(r#"{"id":1,"result":null,"error":[20,"Stale share",null]}"#),
            ShareState::Rejected(RejectReason::StaleJob)
        );
        assert_eq!(
            outcome(r#"{"id":1,"result":false,"error":null}"#),
            ShareState::Rejected(RejectReason::Unknown("pool returned false".to_string()))
        );
    }

    #[test]
    fn test_job_parsing() {
        let job = Job::from_notify_params(&notify_params("job123", true)).unwrap();
        assert_eq!(job.job_id, "job123");
        assert_eq!(job.merkle_branches, vec!["aa", "bb"]);
        assert_eq!(job.ntime_value(), 0x5f5e1000);
        assert!(job.clean_jobs);

        let mut bad = notify_params("job123", false);
        bad[1] = json!("deadbeef");
        assert!(Job::from_notify_params(&bad).is_err());

        let mut bad = notify_params("job123", false);
        bad[8] = json!("yes");
        assert!(Job::from_notify_params(&bad).is_err());

        assert!(Job::from_notify_params(&notify_params("job123", false)[..5]).is_err());
    }

    #[test]
    fn test_subscribe_result_parsing() {
        let result = json!([
            [["mining.set_difficulty", "sub-diff"], ["mining.notify", "sub-notify"]],
            "08000002",
            4
        ]);
        let parsed = SubscribeResult::from_response(&result).unwrap();
        assert_eq!(parsed.subscription_id.as_deref(), Some("sub-notify"));
        assert_eq!(parsed.extranonce1, "08000002");
        assert_eq!(parsed.extranonce2_size, 4);

        assert!(SubscribeResult::from_response(&json!([[], "zz", 4])).is_err());
        assert!(SubscribeResult::from_response(&json!([[], "08000002", 0])).is_err());
        assert!(SubscribeResult::from_response(&json!(true)).is_err());
    }

    #[test]
    fn test_set_difficulty_and_extranonce() {
        assert_eq!(parse_set_difficulty(&[json!(4)]).unwrap(), Difficulty(4.0));
        assert_eq!(parse_set_difficulty(&[json!(0.5)]).unwrap(), Difficulty(0.5));
        assert!(parse_set_difficulty(&[json!(0)]).is_err());
        assert!(parse_set_difficulty(&[]).is_err());

        let (en1, size) = parse_set_extranonce(&[json!("abcd"), json!(8)]).unwrap();
        assert_eq!(en1, "abcd");
        assert_eq!(size, 8);
        assert!(parse_set_extranonce(&[json!("abcd")]).is_err());
    }
}
