//! Profitability feeds polled by the economic guardian.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

/// Revenue and cost rates at one point in time, in the same unit (e.g. USD/hour)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitabilitySnapshot {
    pub revenue_rate: f64,
    pub cost_rate: f64,
    pub timestamp: DateTime<Utc>,
}

impl ProfitabilitySnapshot {
    pub fn new(revenue_rate: f64, cost_rate: f64) -> Self {
        Self {
            revenue_rate,
            cost_rate,
            timestamp: Utc::now(),
        }
    }

    pub fn margin(&self) -> f64 {
        self.revenue_rate - self.cost_rate
    }
}

/// Source of profitability data
#[async_trait]
pub trait ProfitabilityFeed: Send + Sync {
    async fn poll(&self) -> Result<ProfitabilitySnapshot>;

    fn name(&self) -> &str;
}

/// Feed selection in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedConfig {
    /// Fixed rates
    Static { revenue_rate: f64, cost_rate: f64 },
    /// GET a JSON document `{"revenue_rate": .., "cost_rate": ..}`
    Http {
        url: String,
        #[serde(default = "default_http_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_http_timeout_secs() -> u64 { 10 }

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig::Static {
            revenue_rate: 1.0,
            cost_rate: 0.0,
        }
    }
}

impl FeedConfig {
    pub fn build(&self) -> Result<Arc<dyn ProfitabilityFeed>> {
        Ok(match self {
            FeedConfig::Static {
                revenue_rate,
                cost_rate,
            } => Arc::new(StaticFeed::new(*revenue_rate, *cost_rate)),
            FeedConfig::Http { url, timeout_secs } => {
                Arc::new(HttpFeed::new(url, Duration::from_secs(*timeout_secs))?)
            }
        })
    }
}

/// Constant rates
pub struct StaticFeed {
    revenue_rate: f64,
    cost_rate: f64,
}

impl StaticFeed {
    pub fn new(revenue_rate: f64, cost_rate: f64) -> Self {
        Self {
            revenue_rate,
            cost_rate,
        }
    }
}

#[async_trait]
impl ProfitabilityFeed for StaticFeed {
    async fn poll(&self) -> Result<ProfitabilitySnapshot> {
        Ok(ProfitabilitySnapshot::new(self.revenue_rate, self.cost_rate))
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[derive(Deserialize)]
struct RatesDocument {
    revenue_rate: f64,
    cost_rate: f64,
}

/// Rates fetched over HTTP
pub struct HttpFeed {
    client: reqwest::Client,
    url: String,
}

impl HttpFeed {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("minewarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ProfitabilityFeed for HttpFeed {
    async fn poll(&self) -> Result<ProfitabilitySnapshot> {
        let rates: RatesDocument = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {}", self.url))?
            .error_for_status()?
            .json()
            .await
            .context("decoding profitability document")?;

        if !rates.revenue_rate.is_finite() || !rates.cost_rate.is_finite() {
            anyhow::bail!("profitability rates must be finite numbers");
        }
        Ok(ProfitabilitySnapshot::new(rates.revenue_rate, rates.cost_rate))
    }

    fn name(&self) -> &str {
        &self.url
    }
}
