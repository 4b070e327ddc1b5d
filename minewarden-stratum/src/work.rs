//! Work handed to the external hash engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Difficulty, Job};

/// Identifier of one StratumSession
pub type SessionId = Uuid;

/// A job plus everything needed to build headers for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    /// Session the job belongs to; job ids are only unique per session
    pub session_id: SessionId,

    /// Endpoint name
    pub endpoint: String,

    pub job: Job,

    pub extranonce1: String,

    pub extranonce2_size: usize,

    /// Difficulty in force when the job was handed out
    pub difficulty: Difficulty,

    /// Target derived from `difficulty`, 64 hex digits
    pub target: String,
}

/// Messages on the outward job channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkEvent {
    /// New job on the active session
    NewJob(Work),

    /// These jobs are stale; stop hashing them
    Invalidate { job_ids: Vec<String> },

    /// Active session switched or lost; every earlier job is stale
    Reset,

    /// Pool target changed on the active session
    Difficulty { difficulty: Difficulty, target: String },
}
