use evolution_core::{Bar, RegimeTag};

const TREND_WINDOW: usize = 20;
const RECENT_WINDOW: usize = 10;
const MIN_VOL_SAMPLE: usize = 20;
const HIGH_VOL_RATIO: f64 = 1.5;
const LOW_VOL_RATIO: f64 = 0.6;

/// Classify every bar into the closed regime set.
///
/// Volatility extremes win over trend: the ratio of the recent 10-bar
/// return stdev to the full trailing-window stdev decides high_vol/low_vol,
/// otherwise the sign of the trailing 20-bar return decides bull/bear.
/// Pure and deterministic; scheduler tests rely on it as the stub
/// classifier.
pub fn classify_regimes(bars: &[Bar]) -> Vec<RegimeTag> {
    let returns = bar_returns(bars);
    bars.iter()
        .enumerate()
        .map(|(i, _)| classify_at(bars, &returns, i))
        .collect()
}

/// Regime and confidence for the latest bar; used for quotes.
pub fn classify_latest(bars: &[Bar]) -> (RegimeTag, f64) {
    if bars.is_empty() {
        return (RegimeTag::LowVol, 0.0);
    }
    let returns = bar_returns(bars);
    let i = bars.len() - 1;
    let tag = classify_at(bars, &returns, i);
    let confidence = if returns.len() >= MIN_VOL_SAMPLE {
        0.9
    } else {
        0.4
    };
    (tag, confidence)
}

fn bar_returns(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            if w[0].close != 0.0 {
                w[1].close / w[0].close - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

fn classify_at(bars: &[Bar], returns: &[f64], i: usize) -> RegimeTag {
    // returns[j] is the return into bar j+1, so bar i has seen returns[..i].
    let available = &returns[..i.min(returns.len())];
    if available.len() < 3 {
        let first = bars[0].close;
        return if bars[i].close >= first {
            RegimeTag::Bull
        } else {
            RegimeTag::Bear
        };
    }

    if available.len() >= MIN_VOL_SAMPLE {
        let full_vol = stdev(available);
        let recent = &available[available.len() - RECENT_WINDOW..];
        let recent_vol = stdev(recent);
        if full_vol > 0.0 {
            let ratio = recent_vol / full_vol;
            if ratio >= HIGH_VOL_RATIO {
                return RegimeTag::HighVol;
            }
            if ratio <= LOW_VOL_RATIO {
                return RegimeTag::LowVol;
            }
        }
    }

    let lookback = TREND_WINDOW.min(i);
    let anchor = bars[i - lookback].close;
    if anchor != 0.0 && bars[i].close / anchor - 1.0 >= 0.0 {
        RegimeTag::Bull
    } else {
        RegimeTag::Bear
    }
}

fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}
