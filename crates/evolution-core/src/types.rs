use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bar interval supported by the gateway and the backtest engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Min15,
    Hour1,
    Day1,
}

impl Interval {
    pub fn seconds(&self) -> i64 {
        match self {
            Interval::Min15 => 15 * 60,
            Interval::Hour1 => 60 * 60,
            Interval::Day1 => 24 * 60 * 60,
        }
    }

    /// Bars per trading year, used to annualize return-series statistics.
    pub fn bars_per_year(&self) -> f64 {
        match self {
            Interval::Min15 => 252.0 * 26.0,
            Interval::Hour1 => 252.0 * 6.5,
            Interval::Day1 => 252.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min15 => "15min",
            Interval::Hour1 => "1hour",
            Interval::Day1 => "1day",
        }
    }
}

/// An ordered bar series for one (symbol, interval, window) request.
///
/// Gaps are explicit holes: a missing bar is simply absent from `bars`,
/// never interpolated. `gap_fraction` reports how much of the window is
/// missing relative to the interval-aligned expectation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    pub symbol: String,
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bars: Vec<Bar>,
}

impl BarSeries {
    /// Number of interval slots the window spans.
    pub fn expected_bars(&self) -> usize {
        let span = (self.end - self.start).num_seconds().max(0);
        // Calendar slots scaled to trading time: 5/7 of days are sessions.
        let slots = span / self.interval.seconds();
        ((slots as f64) * 5.0 / 7.0).floor().max(1.0) as usize
    }

    pub fn gap_fraction(&self) -> f64 {
        let expected = self.expected_bars();
        if expected == 0 {
            return 0.0;
        }
        let missing = expected.saturating_sub(self.bars.len());
        missing as f64 / expected as f64
    }
}

/// Coarse sentiment tag attached to quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

/// Market regime classification, a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeTag {
    Bull,
    Bear,
    HighVol,
    LowVol,
}

impl RegimeTag {
    pub const ALL: [RegimeTag; 4] = [
        RegimeTag::Bull,
        RegimeTag::Bear,
        RegimeTag::HighVol,
        RegimeTag::LowVol,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeTag::Bull => "bull",
            RegimeTag::Bear => "bear",
            RegimeTag::HighVol => "high_vol",
            RegimeTag::LowVol => "low_vol",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bull" => Some(RegimeTag::Bull),
            "bear" => Some(RegimeTag::Bear),
            "high_vol" => Some(RegimeTag::HighVol),
            "low_vol" => Some(RegimeTag::LowVol),
            _ => None,
        }
    }
}

/// Latest quote for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change_24h: f64,
    pub change_7d: f64,
    pub annualized_vol: f64,
    pub volume: f64,
    pub sentiment: Sentiment,
    pub regime: RegimeTag,
    pub regime_confidence: f64,
    pub as_of: DateTime<Utc>,
}

/// Strategy lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Experiment,
    Candidate,
    Proposable,
    Discarded,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Experiment => "experiment",
            StrategyStatus::Candidate => "candidate",
            StrategyStatus::Proposable => "proposable",
            StrategyStatus::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "experiment" => Some(StrategyStatus::Experiment),
            "candidate" => Some(StrategyStatus::Candidate),
            "proposable" => Some(StrategyStatus::Proposable),
            "discarded" => Some(StrategyStatus::Discarded),
            _ => None,
        }
    }

    /// Discarded is terminal; no transition leaves it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StrategyStatus::Discarded)
    }
}

/// Asset class a strategy trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equities,
    Crypto,
    Forex,
    Futures,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Equities => "equities",
            AssetClass::Crypto => "crypto",
            AssetClass::Forex => "forex",
            AssetClass::Futures => "futures",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "equities" => Some(AssetClass::Equities),
            "crypto" => Some(AssetClass::Crypto),
            "forex" => Some(AssetClass::Forex),
            "futures" => Some(AssetClass::Futures),
            _ => None,
        }
    }
}

/// The closed set of rule-space edits the mutator can apply. Exactly one
/// kind is applied per child; lineage edges record which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    ParameterJitter,
    RuleSwap,
    ThresholdShift,
    WindowResize,
    IndicatorSubstitute,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::ParameterJitter => "parameter_jitter",
            MutationKind::RuleSwap => "rule_swap",
            MutationKind::ThresholdShift => "threshold_shift",
            MutationKind::WindowResize => "window_resize",
            MutationKind::IndicatorSubstitute => "indicator_substitute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parameter_jitter" => Some(MutationKind::ParameterJitter),
            "rule_swap" => Some(MutationKind::RuleSwap),
            "threshold_shift" => Some(MutationKind::ThresholdShift),
            "window_resize" => Some(MutationKind::WindowResize),
            "indicator_substitute" => Some(MutationKind::IndicatorSubstitute),
            _ => None,
        }
    }
}

/// Canonical metric record produced per backtest segment.
///
/// Field names are consumed by the recommendation API and stored as JSON;
/// they must stay stable. `None` means insufficient data for that metric.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricRecord {
    pub total_trades: u32,
    /// Fraction of closed trades that were profitable, in [0, 1].
    pub win_rate: Option<f64>,
    /// Average winning return over average losing return magnitude.
    pub avg_reward_risk: Option<f64>,
    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,
    /// Peak-to-trough drawdown as a fraction of peak equity.
    pub max_drawdown: Option<f64>,
    pub profit_factor: Option<f64>,
    pub annualized_return: Option<f64>,
    /// Longest stretch of bars spent below a prior equity peak.
    pub longest_drawdown_bars: Option<u32>,
}

/// One sample of the aggregated equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub bar_index: usize,
    pub equity: f64,
    /// Running drawdown, `(peak - equity) / peak`.
    pub drawdown: f64,
}

/// A closed trade from the backtest replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub entry_index: usize,
    pub exit_index: usize,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Net return of the trade after costs, as a fraction.
    pub return_pct: f64,
    /// Round-trip transaction cost as a fraction of notional.
    pub cost_pct: f64,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Rule,
    StopLoss,
    TakeProfit,
    MaxHold,
    WindowEnd,
}

/// Deterministic result of one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub run_id: String,
    pub window_hash: String,
    pub seed: u64,
    pub train: MetricRecord,
    pub test: MetricRecord,
    /// Test-segment metrics per symbol, keyed by symbol.
    pub per_symbol_test: BTreeMap<String, MetricRecord>,
    /// Equal-weight aggregated equity curve over the whole window.
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<TradeRecord>,
    /// Aggregated per-bar simple returns of the test segment, in order.
    pub test_bar_returns: Vec<f64>,
    /// Regime tag of each test-segment bar, aligned with `test_bar_returns`.
    pub test_bar_regimes: Vec<RegimeTag>,
    pub interval: Interval,
    pub train_bars: usize,
    pub test_bars: usize,
}
