use anyhow::Result;
use chrono::Utc;
use clap::Args;
use colored::*;
use std::path::PathBuf;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

use minewarden_core::MiningStatus;
use minewarden_stratum::{BreakerStatus, EndpointStatus};

use crate::status_file::read_status;

/// Show the status written by a running miner
#[derive(Args)]
pub struct StatusArgs {
    /// Status file written by `minewarden run --status-file`
    #[arg(short, long, env = "MINEWARDEN_STATUS_FILE")]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(short, long)]
    pub json: bool,

    /// Watch mode - refresh every N seconds
    #[arg(short, long)]
    pub watch: Option<u64>,
}

#[derive(Tabled)]
struct EndpointRow {
    #[tabled(rename = "Pool")]
    name: String,
    #[tabled(rename = "URL")]
    url: String,
    #[tabled(rename = "Prio")]
    priority: u32,
    #[tabled(rename = "Breaker")]
    breaker: String,
    #[tabled(rename = "Failures")]
    failures: u32,
    #[tabled(rename = "Last failure")]
    last_failure: String,
}

pub async fn execute(args: StatusArgs) -> Result<()> {
    loop {
        if args.watch.is_some() {
            print!("\x1B[2J\x1B[1;1H");
        }

        match read_status(&args.file) {
            Ok(status) if args.json => println!("{}", serde_json::to_string_pretty(&status)?),
            Ok(status) => show_status(&status),
            Err(e) => {
                println!("{} {:#}", "⚠ No status available:".yellow().bold(), e);
                if args.watch.is_none() {
                    return Ok(());
                }
            }
        }

        match args.watch {
            Some(interval) => tokio::time::sleep(Duration::from_secs(interval.max(1))).await,
            None => break,
        }
    }

    Ok(())
}

fn show_status(status: &MiningStatus) {
    let age = Utc::now().signed_duration_since(status.timestamp).num_seconds();
    println!(
        "{} {} | {} | updated {}s ago",
        "minewarden".bold().cyan(),
        env!("CARGO_PKG_VERSION").bright_black(),
        status.wallet_identity.white(),
        age.max(0)
    );
    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_black());

    let pool = match (&status.pool.active_endpoint, &status.pool.active_state) {
        (Some(endpoint), Some(state)) => format!("{} ({})", endpoint, state).green(),
        _ if status.pool.no_pool_reachable => "NO POOL REACHABLE".red().bold(),
        _ => "connecting".yellow(),
    };
    println!("  {} {}", "Pool:".bold(), pool);
    if let Some(candidate) = &status.pool.candidate_endpoint {
        println!("  {} {}", "Standby:".bold(), candidate.yellow());
    }

    let shares = &status.shares;
    println!(
        "  {} {} / {} accepted ({} this session)",
        "Shares:".bold(),
        shares.accepted.to_string().green(),
        shares.accepted + shares.rejected,
        shares.session_accepted
    );
    if shares.rejected > 0 {
        let reasons: Vec<String> = shares
            .rejected_by_reason
            .iter()
            .map(|(reason, count)| format!("{} {}", count, reason))
            .collect();
        println!("  {} {}", "Rejected:".bold(), reasons.join(", ").red());
    }
    println!(
        "  {} {} duplicate, {} stale, {} paused, {} timed out",
        "Dropped:".bold(),
        shares.duplicates_suppressed,
        shares.discarded_stale,
        shares.discarded_paused,
        shares.timed_out
    );

    let gate = if status.paused {
        "PAUSED".red().bold()
    } else {
        "submitting".green()
    };
    match &status.guardian.last_snapshot {
        Some(snapshot) => println!(
            "  {} {} (margin {:.4})",
            "Economics:".bold(),
            gate,
            snapshot.margin()
        ),
        None => println!("  {} {}", "Economics:".bold(), gate),
    }
    if status.wallet_rejected_updates > 0 {
        println!(
            "  {} {} rejected wallet change attempt(s)",
            "Wallet:".bold(),
            status.wallet_rejected_updates.to_string().red()
        );
    }
    println!();

    let rows: Vec<EndpointRow> = status.pool.endpoints.iter().map(endpoint_row).collect();
    if !rows.is_empty() {
        let table = Table::new(rows).with(Style::rounded()).to_string();
        println!("{}", table);
    }
}

fn endpoint_row(endpoint: &EndpointStatus) -> EndpointRow {
    let breaker = match endpoint.breaker {
        BreakerStatus::Closed => "closed".green(),
        BreakerStatus::HalfOpen => "half-open".yellow(),
        BreakerStatus::Open => "open".red(),
    };

    EndpointRow {
        name: endpoint.name.clone(),
        url: endpoint.url.clone(),
        priority: endpoint.priority,
        breaker: breaker.to_string(),
        failures: endpoint.consecutive_failures,
        last_failure: endpoint
            .last_failure
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string()),
    }
}
