use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use evolution_core::{AssetClass, MetricRecord, RuleSet, StrategyStatus};

/// A strategy row as stored, including its full evaluation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub asset_class: AssetClass,
    pub symbols: Vec<String>,
    pub rules: RuleSet,
    pub fingerprint: String,
    pub status: StrategyStatus,
    pub score: Option<f64>,
    pub train_metrics: Option<MetricRecord>,
    pub test_metrics: Option<MetricRecord>,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub evolution_attempts: i64,
    pub is_proposable: bool,
    pub generalized: bool,
    pub per_symbol_performance: BTreeMap<String, MetricRecord>,
    pub explanation_human: Option<String>,
    pub risk_note: Option<String>,
    pub estimated_profit_min: Option<f64>,
    pub estimated_profit_max: Option<f64>,
    pub discard_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a strategy. Evaluation state starts at its initial
/// values: status experiment, no score, zero attempts.
#[derive(Debug, Clone)]
pub struct NewStrategy {
    pub name: String,
    pub description: String,
    pub owner: String,
    pub asset_class: AssetClass,
    pub symbols: Vec<String>,
    pub rules: RuleSet,
    /// Override for deterministic tests; `None` means now.
    pub created_at: Option<DateTime<Utc>>,
}

/// The complete post-evaluation state of one strategy, written atomically.
#[derive(Debug, Clone)]
pub struct EvaluationUpdate {
    pub status: StrategyStatus,
    pub score: Option<f64>,
    pub train_metrics: Option<MetricRecord>,
    pub test_metrics: Option<MetricRecord>,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub is_proposable: bool,
    pub generalized: bool,
    pub per_symbol_performance: BTreeMap<String, MetricRecord>,
    pub explanation_human: Option<String>,
    pub risk_note: Option<String>,
    pub estimated_profit_min: Option<f64>,
    pub estimated_profit_max: Option<f64>,
    pub discard_reason: Option<String>,
}
