use thiserror::Error;

/// Stratum client error types
#[derive(Error, Debug)]
pub enum StratumError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wallet configuration is locked: {0}")]
    WalletLocked(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No pools configured")]
    NoPoolsConfigured,

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Session disconnected")]
    Disconnected,

    #[error("Client shutdown")]
    Shutdown,
}

/// What a session failure means for the endpoint's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAction {
    /// Count one failure toward the threshold
    CountFailure,

    /// Open the breaker for a full cooldown regardless of the count
    ForceOpen,

    /// Leave the breaker untouched
    Ignore,
}

impl StratumError {
    /// Classify this error for the circuit breaker.
    pub fn breaker_action(&self) -> BreakerAction {
        match self {
            StratumError::Connection(_)
            | StratumError::Tls(_)
            | StratumError::Io(_)
            | StratumError::Timeout
            | StratumError::Disconnected
            | StratumError::Protocol(_)
            | StratumError::Subscription(_)
            | StratumError::Serialization(_) => BreakerAction::CountFailure,
            StratumError::Authorization(_) => BreakerAction::ForceOpen,
            StratumError::WalletLocked(_)
            | StratumError::InvalidConfiguration(_)
            | StratumError::NoPoolsConfigured
            | StratumError::Shutdown => BreakerAction::Ignore,
        }
    }
}

pub type Result<T> = std::result::Result<T, StratumError>;
