use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration as StdDuration;

use evolution_core::{Bar, Interval, MarketDataError, MarketDataProvider, Quote, Sentiment};

use crate::regime::classify_latest;

const BASE_URL: &str = "https://api.polygon.io";

/// Polygon.io aggregates provider.
///
/// Maps upstream failures onto the gateway's error contract: HTTP 429 is
/// `rate_limited`, 404 is `symbol_unknown`, everything else that prevents a
/// response is `upstream_unavailable`. The gateway's token bucket sits in
/// front of this client, so no retry or sleep happens here.
pub struct PolygonProvider {
    api_key: String,
    client: Client,
    base_url: String,
}

impl PolygonProvider {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            api_key,
            client,
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn range_params(interval: Interval) -> (u32, &'static str) {
        match interval {
            Interval::Min15 => (15, "minute"),
            Interval::Hour1 => (1, "hour"),
            Interval::Day1 => (1, "day"),
        }
    }

    fn unavailable(&self, message: impl Into<String>) -> MarketDataError {
        MarketDataError::UpstreamUnavailable {
            provider: "polygon".to_string(),
            message: message.into(),
        }
    }

    async fn get_aggregates(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        let (multiplier, timespan) = Self::range_params(interval);
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            symbol,
            multiplier,
            timespan,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", "50000"),
            ])
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        match response.status().as_u16() {
            429 => {
                return Err(MarketDataError::RateLimited {
                    provider: "polygon".to_string(),
                })
            }
            404 => return Err(MarketDataError::SymbolUnknown(symbol.to_string())),
            s if s >= 400 => {
                let body = response.text().await.unwrap_or_default();
                return Err(self.unavailable(format!("HTTP {s}: {body}")));
            }
            _ => {}
        }

        let agg: AggregateResponse = response
            .json()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let mut bars: Vec<Bar> = agg
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| {
                DateTime::from_timestamp_millis(r.t).map(|ts| Bar {
                    timestamp: ts,
                    open: r.o,
                    high: r.h,
                    low: r.l,
                    close: r.c,
                    volume: r.v,
                })
            })
            .collect();
        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }
}

#[async_trait]
impl MarketDataProvider for PolygonProvider {
    fn name(&self) -> &str {
        "polygon"
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        self.get_aggregates(symbol, interval, start, end).await
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, MarketDataError> {
        let end = Utc::now();
        let start = end - Duration::days(60);
        let bars = self.get_aggregates(symbol, Interval::Day1, start, end).await?;
        let last = bars
            .last()
            .ok_or_else(|| MarketDataError::SymbolUnknown(symbol.to_string()))?;

        let change = |back: usize| -> f64 {
            if bars.len() > back {
                let prev = bars[bars.len() - 1 - back].close;
                if prev != 0.0 {
                    return last.close / prev - 1.0;
                }
            }
            0.0
        };
        let change_24h = change(1);
        let change_7d = change(5);

        let returns: Vec<f64> = bars
            .windows(2)
            .filter(|w| w[0].close != 0.0)
            .map(|w| w[1].close / w[0].close - 1.0)
            .collect();
        let annualized_vol = if returns.len() > 1 {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let var =
                returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
            var.sqrt() * (252.0f64).sqrt()
        } else {
            0.0
        };

        let sentiment = if change_7d > 0.01 {
            Sentiment::Bullish
        } else if change_7d < -0.01 {
            Sentiment::Bearish
        } else {
            Sentiment::Neutral
        };
        let (regime, regime_confidence) = classify_latest(&bars);

        Ok(Quote {
            symbol: symbol.to_string(),
            price: last.close,
            change_24h,
            change_7d,
            annualized_vol,
            volume: last.volume,
            sentiment,
            regime,
            regime_confidence,
            as_of: last.timestamp,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    #[serde(default)]
    results: Option<Vec<AggregateBar>>,
}

#[derive(Debug, Deserialize)]
struct AggregateBar {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}
