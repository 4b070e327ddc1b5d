use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use minewarden_stratum::{BreakerStatus, PoolStatus};

use crate::{guardian::GuardianStatus, submitter::ShareCounters};

/// Read-only snapshot for monitoring layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningStatus {
    pub timestamp: DateTime<Utc>,

    /// Composed `"<payout_address>.<worker_name>"`
    pub wallet_identity: String,
    pub wallet_rejected_updates: u64,

    pub pool: PoolStatus,
    pub shares: ShareCounters,

    pub paused: bool,
    pub guardian: GuardianStatus,
}

impl MiningStatus {
    /// One-line summary for periodic logging
    pub fn summary(&self) -> String {
        self.to_string()
    }

    /// Endpoints whose breaker is not closed
    pub fn tripped_endpoints(&self) -> Vec<&str> {
        self.pool
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.breaker != BreakerStatus::Closed)
            .map(|endpoint| endpoint.name.as_str())
            .collect()
    }
}

impl fmt::Display for MiningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.pool.active_endpoint, &self.pool.active_state) {
            (Some(endpoint), Some(state)) => write!(f, "pool {} ({})", endpoint, state)?,
            _ if self.pool.no_pool_reachable => write!(f, "NO POOL REACHABLE")?,
            _ => write!(f, "connecting")?,
        }

        write!(
            f,
            " | shares {}/{} accepted (session {}/{})",
            self.shares.accepted,
            self.shares.accepted + self.shares.rejected,
            self.shares.session_accepted,
            self.shares.session_accepted + self.shares.session_rejected,
        )?;
        if self.shares.timed_out > 0 {
            write!(f, ", {} timed out", self.shares.timed_out)?;
        }
        if self.paused {
            write!(f, " | PAUSED")?;
            if let Some(snapshot) = &self.guardian.last_snapshot {
                write!(f, " (margin {:.4})", snapshot.margin())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ProfitabilitySnapshot;

    fn status() -> MiningStatus {
        MiningStatus {
            timestamp: Utc::now(),
            wallet_identity: "bc1qaddr.rig01".to_string(),
            wallet_rejected_updates: 0,
            pool: PoolStatus::default(),
            shares: ShareCounters::default(),
            paused: false,
            guardian: GuardianStatus::default(),
        }
    }

    #[test]
    fn test_summary_reports_outage() {
        let mut status = status();
        status.pool.no_pool_reachable = true;
        assert!(status.summary().starts_with("NO POOL REACHABLE"));
    }

    #[test]
    fn test_summary_reports_pause_margin() {
        let mut status = status();
        status.paused = true;
        status.guardian.last_snapshot = Some(ProfitabilitySnapshot::new(1.0, 1.5));
        status.shares.accepted = 3;
        status.shares.rejected = 1;

        let summary = status.summary();
        assert!(summary.contains("shares 3/4 accepted"));
        assert!(summary.ends_with("PAUSED (margin -0.5000)"));
    }

    #[test]
    fn test_status_serializes_to_json() {
        let json = serde_json::to_value(status()).unwrap();
        assert_eq!(json["wallet_identity"], "bc1qaddr.rig01");
        assert_eq!(json["pool"]["no_pool_reachable"], false);
    }
}
