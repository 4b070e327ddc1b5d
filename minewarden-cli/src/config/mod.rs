use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use minewarden_core::{FeedConfig, GuardianConfig, MinerConfig, SubmitterConfig};
use minewarden_stratum::{StratumConfig, WalletConfig};

static CONFIG_PATH: OnceCell<PathBuf> = OnceCell::new();

/// Contents of the TOML config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    pub stratum: StratumConfig,

    #[serde(default)]
    pub submitter: SubmitterConfig,

    #[serde(default)]
    pub guardian: GuardianConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    /// Never honoured. The payout identity comes from the environment or a
    /// wallet file; a section here is reported as a mutation attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<WalletConfig>,
}

impl FileConfig {
    pub fn miner_config(&self) -> MinerConfig {
        let mut config = MinerConfig::new(self.stratum.clone());
        config.submitter = self.submitter.clone();
        config.guardian = self.guardian.clone();
        config.feed = self.feed.clone();
        config
    }
}

/// Get the config file path
pub fn get_config_path() -> PathBuf {
    CONFIG_PATH.get().cloned().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("minewarden")
            .join("config.toml")
    })
}

/// Set custom config path
pub fn set_config_path(path: &str) {
    let _ = CONFIG_PATH.set(PathBuf::from(path));
}

pub fn parse_config(contents: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(contents)?;
    Ok(config)
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found at {}",
            path.display()
        ));
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("parsing {}", path.display()))
}

/// Wallet secret file: `payout_address` and optional `worker_name`
#[derive(Debug, Deserialize)]
struct WalletFile {
    payout_address: String,
    worker_name: Option<String>,
}

/// Read the payout identity from its trusted source: `wallet_file` when
/// given, otherwise the environment.
pub fn load_wallet(wallet_file: Option<&Path>) -> Result<WalletConfig> {
    match wallet_file {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("reading wallet file {}", path.display()))?;
            let file: WalletFile = toml::from_str(&contents)
                .with_context(|| format!("parsing wallet file {}", path.display()))?;
            Ok(WalletConfig {
                payout_address: file.payout_address,
                worker_name: file.worker_name.unwrap_or_else(default_worker_name),
            })
        }
        None => WalletConfig::from_env(&default_worker_name())
            .context("no --wallet-file was given"),
    }
}

/// Host name reduced to a valid worker name
pub fn default_worker_name() -> String {
    let host = gethostname::gethostname().to_string_lossy().to_string();
    let name: String = host
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if name.is_empty() {
        "minewarden".to_string()
    } else {
        name
    }
}
