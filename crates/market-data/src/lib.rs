//! Market Data Gateway
//!
//! Uniform access to OHLCV history and quotes across a fixed, ordered list
//! of providers, with per-provider token buckets, hash-stable caching and
//! single-pass failover.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use evolution_core::{BarSeries, Interval, MarketDataError, MarketDataProvider, Quote};

pub mod polygon;
pub mod regime;
pub mod sim;
mod token_bucket;

pub use polygon::PolygonProvider;
pub use regime::{classify_latest, classify_regimes};
pub use sim::SimProvider;
pub use token_bucket::{TokenBucket, TokenBucketConfig};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a cached quote stays fresh.
    pub quote_ttl_seconds: i64,
    /// Upper bound on interval slots a single bar request may span.
    pub max_window_bars: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            quote_ttl_seconds: 30,
            max_window_bars: 50_000,
        }
    }
}

/// Point-in-time view of one provider's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCounters {
    pub upstream_requests: u64,
    pub rate_limit_rejections: u64,
    pub upstream_failures: u64,
}

struct ProviderSlot {
    provider: Arc<dyn MarketDataProvider>,
    bucket: TokenBucket,
    upstream_requests: AtomicU64,
    rate_limit_rejections: AtomicU64,
    upstream_failures: AtomicU64,
}

impl ProviderSlot {
    fn counters(&self) -> ProviderCounters {
        ProviderCounters {
            upstream_requests: self.upstream_requests.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct MarketDataGateway {
    slots: Vec<ProviderSlot>,
    bars_cache: DashMap<String, BarSeries>,
    quote_cache: DashMap<String, (Quote, DateTime<Utc>)>,
    config: GatewayConfig,
}

impl MarketDataGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            slots: Vec::new(),
            bars_cache: DashMap::new(),
            quote_cache: DashMap::new(),
            config,
        }
    }

    /// Append a provider to the failover order.
    pub fn with_provider(
        mut self,
        provider: Arc<dyn MarketDataProvider>,
        bucket: TokenBucketConfig,
    ) -> Self {
        self.slots.push(ProviderSlot {
            provider,
            bucket: TokenBucket::new(bucket),
            upstream_requests: AtomicU64::new(0),
            rate_limit_rejections: AtomicU64::new(0),
            upstream_failures: AtomicU64::new(0),
        });
        self
    }

    pub fn provider_counters(&self, name: &str) -> Option<ProviderCounters> {
        self.slots
            .iter()
            .find(|s| s.provider.name() == name)
            .map(|s| s.counters())
    }

    /// Drain a provider's token bucket. Test hook for the rate-limit path.
    pub fn drain_bucket(&self, name: &str) {
        if let Some(slot) = self.slots.iter().find(|s| s.provider.name() == name) {
            slot.bucket.drain();
        }
    }

    /// Historical bars for (symbol, interval, window).
    ///
    /// Providers are tried in configured order, at most once each per call.
    /// Failover happens only on `rate_limited` / `upstream_unavailable`;
    /// other errors propagate immediately. Results are cached under a
    /// hash-stable key, which also pins the snapshot epoch: repeated
    /// requests for the same window return the identical series.
    pub async fn get_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSeries, MarketDataError> {
        let requested = ((end - start).num_seconds().max(0) / interval.seconds()) as u64;
        if requested > self.config.max_window_bars {
            return Err(MarketDataError::WindowTooLarge {
                requested_bars: requested,
                max_bars: self.config.max_window_bars,
            });
        }

        let key = bars_cache_key(symbol, interval, start, end);
        if let Some(hit) = self.bars_cache.get(&key) {
            return Ok(hit.clone());
        }

        let mut last_err: Option<MarketDataError> = None;
        for slot in &self.slots {
            if !slot.bucket.try_acquire() {
                slot.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    provider = slot.provider.name(),
                    symbol,
                    "token bucket empty, failing over"
                );
                last_err = Some(MarketDataError::RateLimited {
                    provider: slot.provider.name().to_string(),
                });
                continue;
            }

            slot.upstream_requests.fetch_add(1, Ordering::Relaxed);
            match slot.provider.fetch_bars(symbol, interval, start, end).await {
                Ok(bars) => {
                    let series = BarSeries {
                        symbol: symbol.to_string(),
                        interval,
                        start,
                        end,
                        bars,
                    };
                    self.bars_cache.insert(key, series.clone());
                    return Ok(series);
                }
                Err(e) if e.triggers_failover() => {
                    slot.upstream_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        provider = slot.provider.name(),
                        symbol,
                        error = %e,
                        "provider failed, trying next"
                    );
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| MarketDataError::UpstreamUnavailable {
            provider: "none".to_string(),
            message: "no providers configured".to_string(),
        }))
    }

    /// Latest quote, stale up to the configured TTL.
    pub async fn get_quote(&self, symbol: &str) -> Result<Quote, MarketDataError> {
        if let Some(hit) = self.quote_cache.get(symbol) {
            let (quote, fetched_at) = hit.value();
            let age = (Utc::now() - *fetched_at).num_seconds();
            if age <= self.config.quote_ttl_seconds {
                return Ok(quote.clone());
            }
        }

        let mut last_err: Option<MarketDataError> = None;
        for slot in &self.slots {
            if !slot.bucket.try_acquire() {
                slot.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
                last_err = Some(MarketDataError::RateLimited {
                    provider: slot.provider.name().to_string(),
                });
                continue;
            }

            slot.upstream_requests.fetch_add(1, Ordering::Relaxed);
            match slot.provider.fetch_quote(symbol).await {
                Ok(quote) => {
                    self.quote_cache
                        .insert(symbol.to_string(), (quote.clone(), Utc::now()));
                    return Ok(quote);
                }
                Err(e) if e.triggers_failover() => {
                    slot.upstream_failures.fetch_add(1, Ordering::Relaxed);
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| MarketDataError::UpstreamUnavailable {
            provider: "none".to_string(),
            message: "no providers configured".to_string(),
        }))
    }
}

fn bars_cache_key(
    symbol: &str,
    interval: Interval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    format!(
        "{symbol}|{}|{}|{}",
        interval.as_str(),
        start.to_rfc3339(),
        end.to_rfc3339()
    )
}
