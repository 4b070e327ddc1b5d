//! Minewarden Stratum Client
//!
//! Stratum V1 sessions with priority failover, per-endpoint circuit breakers
//! and a write-once payout identity.
//!
//! # Features
//!
//! - Stratum V1 wire protocol (subscribe, authorize, notify, set_difficulty,
//!   set_extranonce, submit, suggest_difficulty)
//! - Priority-ordered failover with circuit breakers and jittered backoff
//! - Warm standby while the active session is degraded
//! - Graceful CLOSING that lets in-flight submits settle
//! - Every share credited to one [`WalletGuard`] identity
//!
//! # Example
//!
//! ```no_run
//! use minewarden_stratum::{
//!     PoolEndpoint, PoolManager, StratumConfig, TcpConnector, WalletConfig, WalletGuard, WorkEvent,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StratumConfig {
//!         pools: vec![
//!             PoolEndpoint::new("primary", "stratum+tcp://pool.example.com:3333", 0),
//!             PoolEndpoint::new("backup", "stratum+ssl://backup.example.com:443", 1),
//!         ],
//!         ..Default::default()
//!     };
//!
//!     let wallet = Arc::new(WalletGuard::new(WalletConfig::from_env("rig01")?)?);
//!     let connector = Arc::new(TcpConnector::new(&config));
//!     let (work_tx, mut work_rx) = mpsc::channel(64);
//!     let (pool, _task) = PoolManager::start(config, wallet, connector, work_tx)?;
//!
//!     while let Some(event) = work_rx.recv().await {
//!         if let WorkEvent::NewJob(work) = event {
//!             println!("New job {} from {}", work.job.job_id, work.endpoint);
//!         }
//!     }
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod config;
pub mod connection;
pub mod difficulty;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod wallet;
pub mod work;

// Re-export main types
pub use breaker::{BreakerStatus, CircuitBreaker, CircuitState};
pub use config::{BackoffConfig, BreakerConfig, PoolEndpoint, StratumConfig};
pub use connection::{Connector, TcpConnector, Transport};
pub use difficulty::DifficultyController;
pub use error::{BreakerAction, Result, StratumError};
pub use pool::{EndpointStatus, PoolHandle, PoolManager, PoolStatus};
pub use protocol::{Difficulty, Job, RejectReason, ShareState, SubmitParams};
pub use session::{SessionHandle, SessionState, StratumSession};
pub use wallet::{WalletConfig, WalletGuard};
pub use work::{SessionId, Work, WorkEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_user_agent_carries_version() {
        let config = StratumConfig::default();
        assert_eq!(config.user_agent, format!("minewarden/{}", VERSION));
    }
}
