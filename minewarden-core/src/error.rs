use minewarden_stratum::StratumError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MinerError {
    #[error(transparent)]
    Stratum(#[from] StratumError),

    #[error("Profitability feed error: {0}")]
    Feed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("Miner is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, MinerError>;
