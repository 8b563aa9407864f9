use evolution_core::{Interval, MetricRecord, TradeRecord};

/// Build a `MetricRecord` from closed trades and the per-bar simple returns
/// of the same segment. Reductions run left-to-right over the inputs in
/// chronological order; callers provide them already ordered.
pub fn metric_record(trades: &[TradeRecord], returns: &[f64], interval: Interval) -> MetricRecord {
    let total_trades = trades.len() as u32;

    let wins: Vec<f64> = trades
        .iter()
        .map(|t| t.return_pct)
        .filter(|r| *r > 0.0)
        .collect();
    let losses: Vec<f64> = trades
        .iter()
        .map(|t| t.return_pct)
        .filter(|r| *r < 0.0)
        .collect();

    let win_rate = if total_trades > 0 {
        Some(wins.len() as f64 / total_trades as f64)
    } else {
        None
    };

    let avg_reward_risk = match (mean(&wins), mean(&losses)) {
        (Some(avg_win), Some(avg_loss)) if avg_loss != 0.0 => Some(avg_win / avg_loss.abs()),
        _ => None,
    };

    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().map(|r| r.abs()).sum();
    let profit_factor = if gross_loss > 0.0 {
        Some(gross_profit / gross_loss)
    } else {
        None
    };

    let bars_per_year = interval.bars_per_year();
    let (sharpe, sortino) = risk_ratios(returns, bars_per_year);

    let (max_drawdown, longest_drawdown_bars) = drawdown_stats(returns);

    let annualized_return = if !returns.is_empty() {
        let growth: f64 = returns.iter().fold(1.0, |acc, r| acc * (1.0 + r));
        if growth > 0.0 {
            Some(growth.powf(bars_per_year / returns.len() as f64) - 1.0)
        } else {
            Some(-1.0)
        }
    } else {
        None
    };

    MetricRecord {
        total_trades,
        win_rate,
        avg_reward_risk,
        sharpe,
        sortino,
        max_drawdown,
        profit_factor,
        annualized_return,
        longest_drawdown_bars,
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn risk_ratios(returns: &[f64], bars_per_year: f64) -> (Option<f64>, Option<f64>) {
    if returns.len() < 2 {
        return (None, None);
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    let annualizer = bars_per_year.sqrt();

    let sharpe = if std_dev > 0.0 {
        Some(mean / std_dev * annualizer)
    } else {
        None
    };

    let downside: Vec<f64> = returns
        .iter()
        .filter(|r| **r < 0.0)
        .map(|r| r.powi(2))
        .collect();
    let sortino = if downside.is_empty() {
        sharpe
    } else {
        let downside_dev = (downside.iter().sum::<f64>() / downside.len() as f64).sqrt();
        if downside_dev > 0.0 {
            Some(mean / downside_dev * annualizer)
        } else {
            sharpe
        }
    };

    (sharpe, sortino)
}

/// Max drawdown as a fraction of peak, and the longest stretch of bars
/// spent below a prior equity peak.
fn drawdown_stats(returns: &[f64]) -> (Option<f64>, Option<u32>) {
    if returns.is_empty() {
        return (None, None);
    }
    let mut equity = 1.0f64;
    let mut peak = 1.0f64;
    let mut max_dd = 0.0f64;
    let mut below_peak: u32 = 0;
    let mut longest: u32 = 0;

    for r in returns {
        equity *= 1.0 + r;
        if equity > peak {
            peak = equity;
            below_peak = 0;
        } else {
            below_peak += 1;
            longest = longest.max(below_peak);
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak);
        }
    }

    (Some(max_dd), Some(longest))
}
