//! Minewarden mining core
//!
//! Connects an external hash engine to the pool layer of
//! [`minewarden_stratum`]: work flows out on a channel, candidate solutions
//! flow back through the [`ShareSubmitter`], and the [`EconomicGuardian`] can
//! pause submission without touching pool connections.

pub mod dedup;
pub mod error;
pub mod feed;
pub mod guardian;
pub mod miner;
pub mod status;
pub mod submitter;

// Re-export main types
pub use dedup::DuplicateFilter;
pub use error::{MinerError, Result};
pub use feed::{FeedConfig, HttpFeed, ProfitabilityFeed, ProfitabilitySnapshot, StaticFeed};
pub use guardian::{EconomicGuardian, GuardianConfig, GuardianEvent, GuardianStatus, PauseFlag};
pub use miner::{EngineChannels, Miner, MinerConfig, MinerHandle};
pub use status::MiningStatus;
pub use submitter::{Candidate, Disposition, ShareCounters, ShareSubmitter, SubmitterConfig};
