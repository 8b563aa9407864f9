use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use evolution_core::{Bar, Interval, MarketDataError, MarketDataProvider, Quote, Sentiment};

use crate::regime::classify_latest;

/// Deterministic synthetic market-data source.
///
/// The series for a symbol is a pure function of (symbol, interval, window):
/// the generator is seeded from the symbol name, bars are emitted on a
/// trading calendar, and a small deterministic subset of slots is skipped to
/// produce explicit gaps. This is the default provider when no API key is
/// configured and the stub provider used throughout the test suites.
pub struct SimProvider {
    name: String,
    /// Shift applied to the per-symbol seed; lets tests stand up two
    /// providers with distinct but stable data.
    seed_offset: u64,
}

impl SimProvider {
    pub fn new() -> Self {
        Self {
            name: "sim".to_string(),
            seed_offset: 0,
        }
    }

    pub fn with_name(name: &str, seed_offset: u64) -> Self {
        Self {
            name: name.to_string(),
            seed_offset,
        }
    }

    fn symbol_seed(&self, symbol: &str) -> u64 {
        let digest = Sha256::digest(symbol.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes).wrapping_add(self.seed_offset)
    }

    fn validate_symbol(symbol: &str) -> Result<(), MarketDataError> {
        let ok = !symbol.is_empty()
            && symbol.len() <= 6
            && symbol.chars().all(|c| c.is_ascii_uppercase());
        if ok {
            Ok(())
        } else {
            Err(MarketDataError::SymbolUnknown(symbol.to_string()))
        }
    }

    fn generate_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Bar> {
        let seed = self.symbol_seed(symbol);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut price = 80.0 + (seed % 8000) as f64 / 100.0;
        let step = Duration::seconds(interval.seconds());

        let mut bars = Vec::new();
        let mut ts = start;
        let mut i: u64 = 0;
        while ts < end {
            let is_session = !matches!(ts.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun);
            // Deterministic sparse holes, roughly half a percent of slots.
            let hole = (i.wrapping_mul(2654435761).wrapping_add(seed)) % 211 == 0;

            // Advance the walk even for skipped slots so the path does not
            // depend on which slots are emitted.
            let cycle = (i as f64 / 40.0).sin();
            let noise: f64 = rng.gen_range(-1.0..1.0);
            let ret = 0.0004 + 0.004 * cycle + 0.012 * noise;
            let open = price;
            price = (price * (1.0 + ret)).max(0.5);
            let spread = price * (0.002 + 0.006 * noise.abs());

            if is_session && !hole {
                bars.push(Bar {
                    timestamp: ts,
                    open,
                    high: open.max(price) + spread,
                    low: open.min(price) - spread,
                    close: price,
                    volume: 500_000.0 + 1_000_000.0 * ((i as f64 / 7.0).sin().abs()),
                });
            }

            ts += step;
            i += 1;
        }
        bars
    }
}

impl Default for SimProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for SimProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        Self::validate_symbol(symbol)?;
        Ok(self.generate_bars(symbol, interval, start, end))
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, MarketDataError> {
        Self::validate_symbol(symbol)?;
        let end = Utc::now();
        let start = end - Duration::days(60);
        let bars = self.generate_bars(symbol, Interval::Day1, start, end);
        let last = bars.last().ok_or_else(|| MarketDataError::UpstreamUnavailable {
            provider: self.name.clone(),
            message: "empty synthetic window".to_string(),
        })?;

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
            .map(|w| w[1].close / w[0].close - 1.0)
            .collect();
        let vol = if returns.len() > 1 {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / returns.len() as f64;
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
            annualized_vol: vol,
            volume: last.volume,
            sentiment,
            regime,
            regime_confidence,
            as_of: last.timestamp,
        })
    }
}
