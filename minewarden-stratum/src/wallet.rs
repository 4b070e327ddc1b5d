//! Payout identity shared by every session.
//!
//! A [`WalletGuard`] is built once from a trusted source and handed out as
//! `Arc<WalletGuard>`. It has no setters: the only mutation entry point,
//! [`WalletGuard::reject_update`], always fails, logs the attempt and leaves
//! the composed identity untouched.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

use crate::error::{Result, StratumError};

/// Environment variable holding the payout address
pub const PAYOUT_ADDRESS_ENV: &str = "MINEWARDEN_PAYOUT_ADDRESS";

/// Environment variable holding the worker name
pub const WORKER_NAME_ENV: &str = "MINEWARDEN_WORKER";

/// Payout address and worker name as injected by the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Wallet address credited for accepted shares
    pub payout_address: String,

    /// Worker name appended to the address
    pub worker_name: String,
}

impl WalletConfig {
    /// Read the wallet from `MINEWARDEN_PAYOUT_ADDRESS` / `MINEWARDEN_WORKER`,
    /// using `default_worker` when no worker name is set.
    pub fn from_env(default_worker: &str) -> Result<Self> {
        let payout_address = std::env::var(PAYOUT_ADDRESS_ENV).map_err(|_| {
            StratumError::InvalidConfiguration(format!("{} is not set", PAYOUT_ADDRESS_ENV))
        })?;
        let worker_name = std::env::var(WORKER_NAME_ENV)
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default_worker.to_string());

        Ok(Self {
            payout_address,
            worker_name,
        })
    }

    fn validate(&self) -> Result<()> {
        let address = self.payout_address.trim();
        if address.is_empty() {
            return Err(StratumError::InvalidConfiguration(
                "payout address is empty".to_string(),
            ));
        }
        if address.contains('.') || address.chars().any(char::is_whitespace) {
            return Err(StratumError::InvalidConfiguration(format!(
                "payout address contains invalid characters: {}",
                address
            )));
        }

        let worker = self.worker_name.trim();
        if worker.is_empty() {
            return Err(StratumError::InvalidConfiguration(
                "worker name is empty".to_string(),
            ));
        }
        if !worker
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StratumError::InvalidConfiguration(format!(
                "worker name may only contain [A-Za-z0-9_-]: {}",
                worker
            )));
        }

        Ok(())
    }
}

/// Write-once holder of the payout identity
#[derive(Debug)]
pub struct WalletGuard {
    config: WalletConfig,

    /// Composed `"<payout_address>.<worker_name>"`
    identity: String,

    /// Number of rejected mutation attempts
    rejected_updates: AtomicU64,
}

impl WalletGuard {
    /// Build the guard. Fails if the address or worker name is empty or malformed.
    pub fn new(config: WalletConfig) -> Result<Self> {
        config.validate()?;

        let config = WalletConfig {
            payout_address: config.payout_address.trim().to_string(),
            worker_name: config.worker_name.trim().to_string(),
        };
        let identity = format!("{}.{}", config.payout_address, config.worker_name);

        Ok(Self {
            config,
            identity,
            rejected_updates: AtomicU64::new(0),
        })
    }

    /// Username used for `mining.authorize` and every `mining.submit`.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn payout_address(&self) -> &str {
        &self.config.payout_address
    }

    pub fn worker_name(&self) -> &str {
        &self.config.worker_name
    }

    /// Attempt to replace the wallet at runtime.
    ///
    /// Always rejected. The attempt is logged with its `source` and counted;
    /// the identity is unchanged.
    pub fn reject_update(&self, source: &str, attempted: &WalletConfig) -> Result<()> {
        self.rejected_updates.fetch_add(1, Ordering::Relaxed);
        error!(
            source = %source,
            attempted_address = %attempted.payout_address,
            identity = %self.identity,
            "Rejected runtime wallet mutation"
        );
        Err(StratumError::WalletLocked(format!(
            "payout identity cannot be changed at runtime (attempted from {})",
            source
        )))
    }

    /// How many mutation attempts have been rejected so far.
    pub fn rejected_updates(&self) -> u64 {
        self.rejected_updates.load(Ordering::Relaxed)
    }
}
