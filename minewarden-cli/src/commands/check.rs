use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use std::path::{Path, PathBuf};
use tabled::{settings::Style, Table, Tabled};

use minewarden_stratum::WalletGuard;

use crate::config::{load_config, load_wallet};

/// Validate the configuration and wallet without connecting
#[derive(Args)]
pub struct CheckArgs {
    /// TOML file holding payout_address and worker_name
    #[arg(long, env = "MINEWARDEN_WALLET_FILE")]
    pub wallet_file: Option<PathBuf>,
}

#[derive(Tabled)]
struct PoolRow {
    #[tabled(rename = "Pool")]
    name: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "TLS")]
    tls: String,
    #[tabled(rename = "Prio")]
    priority: u32,
    #[tabled(rename = "Enabled")]
    enabled: String,
}

pub async fn execute(args: CheckArgs, config_path: &Path) -> Result<()> {
    let file = load_config(config_path)?;
    file.miner_config()
        .validate()
        .context("Invalid configuration")?;

    let wallet = WalletGuard::new(load_wallet(args.wallet_file.as_deref())?)
        .context("Invalid wallet")?;

    println!("{}", "✓ Configuration validated successfully".green());
    println!();
    println!("  {} {}", "Config:".bold(), config_path.display());
    println!("  {} {}", "Identity:".bold(), wallet.identity().white());
    if file.wallet.is_some() {
        println!(
            "  {} {}",
            "Warning:".yellow().bold(),
            "[wallet] in the config file is ignored; use the environment or --wallet-file"
        );
    }
    println!("  {} {:?}", "Feed:".bold(), file.feed);
    println!();

    let mut pools = file.stratum.pools.clone();
    pools.sort_by_key(|pool| pool.priority);

    let mut rows = Vec::new();
    for pool in &pools {
        let address = pool.parse_url()?;
        rows.push(PoolRow {
            name: pool.name.clone(),
            host: address.host,
            port: address.port,
            tls: if address.tls { "yes" } else { "no" }.to_string(),
            priority: pool.priority,
            enabled: if pool.enabled { "yes" } else { "no" }.to_string(),
        });
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);

    Ok(())
}
