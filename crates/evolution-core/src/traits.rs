use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MarketDataError;
use crate::types::{Bar, Interval, Quote};

/// A single upstream market-data source. The gateway owns a fixed, ordered
/// list of these and layers rate limiting, caching and failover on top.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch interval-aligned bars for the window. Missing bars are holes;
    /// providers never interpolate.
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError>;

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, MarketDataError>;
}
