use std::collections::BTreeMap;

use evolution_core::{Bar, Indicator, Operand, Predicate, PriceField, RuleSet};

/// Per-bar values of every indicator a rule set references, keyed by the
/// indicator's canonical form. Each value at index `i` is computed from
/// bars with index `<= i` only; no look-ahead.
pub struct FeatureFrame {
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl FeatureFrame {
    pub fn build(rules: &RuleSet, bars: &[Bar]) -> Self {
        let mut columns = BTreeMap::new();
        for indicator in rules.indicators() {
            columns.insert(indicator_key(&indicator), compute(&indicator, bars));
        }
        Self { columns }
    }

    fn indicator_value(&self, indicator: &Indicator, i: usize) -> Option<f64> {
        self.columns
            .get(&indicator_key(indicator))
            .and_then(|col| col.get(i).copied().flatten())
    }

    fn operand_value(&self, op: &Operand, bars: &[Bar], i: usize) -> Option<f64> {
        match op {
            Operand::Price { field } => Some(price_value(&bars[i], *field)),
            Operand::Indicator { indicator } => self.indicator_value(indicator, i),
            Operand::Const { value } => Some(*value),
        }
    }

    /// Evaluate a predicate at bar `i`. Undefined operands (indicator
    /// warm-up) make the predicate false rather than erroring.
    pub fn eval(&self, predicate: &Predicate, bars: &[Bar], i: usize) -> bool {
        let (left, right) = predicate.operands();
        let (Some(l), Some(r)) = (
            self.operand_value(left, bars, i),
            self.operand_value(right, bars, i),
        ) else {
            return false;
        };

        match predicate {
            Predicate::Gt { .. } => l > r,
            Predicate::Lt { .. } => l < r,
            Predicate::CrossesAbove { .. } | Predicate::CrossesBelow { .. } => {
                if i == 0 {
                    return false;
                }
                let (Some(pl), Some(pr)) = (
                    self.operand_value(left, bars, i - 1),
                    self.operand_value(right, bars, i - 1),
                ) else {
                    return false;
                };
                match predicate {
                    Predicate::CrossesAbove { .. } => pl <= pr && l > r,
                    _ => pl >= pr && l < r,
                }
            }
        }
    }
}

fn indicator_key(indicator: &Indicator) -> String {
    format!("{}({})", indicator.family(), indicator.period())
}

fn price_value(bar: &Bar, field: PriceField) -> f64 {
    match field {
        PriceField::Open => bar.open,
        PriceField::High => bar.high,
        PriceField::Low => bar.low,
        PriceField::Close => bar.close,
        PriceField::Volume => bar.volume,
    }
}

/// Compute one indicator column over the full series.
pub fn compute(indicator: &Indicator, bars: &[Bar]) -> Vec<Option<f64>> {
    let period = indicator.period() as usize;
    match indicator {
        Indicator::Sma { .. } => rolling(bars, period, |window| {
            let sum: f64 = window.iter().map(|b| b.close).sum();
            sum / window.len() as f64
        }),
        Indicator::HighestHigh { .. } => rolling(bars, period, |window| {
            window.iter().map(|b| b.high).fold(f64::MIN, f64::max)
        }),
        Indicator::LowestLow { .. } => rolling(bars, period, |window| {
            window.iter().map(|b| b.low).fold(f64::MAX, f64::min)
        }),
        Indicator::Ema { .. } => ema(bars, period),
        Indicator::Rsi { .. } => rsi(bars, period),
        Indicator::Atr { .. } => atr(bars, period),
        Indicator::Momentum { .. } => momentum(bars, period),
    }
}

fn rolling(bars: &[Bar], period: usize, f: impl Fn(&[Bar]) -> f64) -> Vec<Option<f64>> {
    bars.iter()
        .enumerate()
        .map(|(i, _)| {
            if i + 1 >= period {
                Some(f(&bars[i + 1 - period..=i]))
            } else {
                None
            }
        })
        .collect()
}

fn ema(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if bars.len() < period {
        return out;
    }
    // Seed with the SMA of the first `period` closes, then smooth.
    let seed: f64 = bars[..period].iter().map(|b| b.close).sum::<f64>() / period as f64;
    let k = 2.0 / (period as f64 + 1.0);
    let mut value = seed;
    out[period - 1] = Some(value);
    for i in period..bars.len() {
        value = (bars[i].close - value) * k + value;
        out[i] = Some(value);
    }
    out
}

fn rsi(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if bars.len() <= period {
        return out;
    }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = bars[i].close - bars[i - 1].close;
        if delta >= 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in period + 1..bars.len() {
        let delta = bars[i].close - bars[i - 1].close;
        let (gain, loss) = if delta >= 0.0 {
            (delta, 0.0)
        } else {
            (0.0, -delta)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

fn atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if bars.len() <= period {
        return out;
    }
    let true_range = |i: usize| -> f64 {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;
        (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs())
    };
    let mut value: f64 = (1..=period).map(true_range).sum::<f64>() / period as f64;
    out[period] = Some(value);
    for i in period + 1..bars.len() {
        value = (value * (period as f64 - 1.0) + true_range(i)) / period as f64;
        out[i] = Some(value);
    }
    out
}

fn momentum(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            if i >= period && bars[i - period].close != 0.0 {
                Some((bar.close / bars[i - period].close - 1.0) * 100.0)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::days(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000.0,
            })
            .collect()
    }

    #[test]
    fn sma_warms_up_then_averages() {
        let bars = bars(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let col = compute(&Indicator::Sma { period: 3 }, &bars);
        assert_eq!(col[0], None);
        assert_eq!(col[1], None);
        assert_eq!(col[2], Some(2.0));
        assert_eq!(col[4], Some(4.0));
    }

    #[test]
    fn rsi_is_100_on_monotone_gains() {
        let bars = bars(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let col = compute(&Indicator::Rsi { period: 3 }, &bars);
        assert_eq!(col[3], Some(100.0));
    }

    #[test]
    fn momentum_uses_lagged_close() {
        let bars = bars(&[100.0, 101.0, 102.0, 110.0]);
        let col = compute(&Indicator::Momentum { period: 3 }, &bars);
        assert_eq!(col[2], None);
        assert!((col[3].unwrap() - 10.0).abs() < 1e-9);
    }
}
