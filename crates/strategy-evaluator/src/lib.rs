//! Evaluator
//!
//! Maps a backtest outcome onto an updated evaluation state. A pure
//! transform over values: no I/O and no suspension points. The scheduler
//! persists the returned state and writes the regime snapshots to the MCN.

use std::collections::BTreeMap;

use backtest_engine::metric_record;
use serde::Serialize;

use evolution_core::{
    BacktestError, BacktestResult, EvaluationThresholds, MetricRecord, RegimeTag, StrategyStatus,
};

/// Everything the evaluator needs to know about the strategy under review.
#[derive(Debug, Clone)]
pub struct EvaluationInput {
    pub status: StrategyStatus,
    pub evolution_attempts: i64,
    pub novelty: f64,
}

/// A regime re-score of the test segment, destined for the MCN.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeScore {
    pub regime: RegimeTag,
    pub metrics: MetricRecord,
    pub passed: bool,
}

/// The full success-path state update, applied atomically by the repository.
#[derive(Debug, Clone, Serialize)]
pub struct StateUpdate {
    pub status: StrategyStatus,
    pub score: f64,
    pub train_metrics: MetricRecord,
    pub test_metrics: MetricRecord,
    pub is_proposable: bool,
    pub generalized: bool,
    pub per_symbol_performance: BTreeMap<String, MetricRecord>,
    pub explanation_human: String,
    pub risk_note: String,
    pub estimated_profit_min: Option<f64>,
    pub estimated_profit_max: Option<f64>,
    pub regime_scores: Vec<RegimeScore>,
    pub regime_pass_count: usize,
}

/// What the scheduler should do with the strategy after this evaluation.
#[derive(Debug, Clone)]
pub enum EvaluationDecision {
    /// No state change; the attempt counter is bumped and the strategy is
    /// retried on a later tick.
    RetryLater { reason: String },
    /// Terminal: discard with the recorded reason.
    Discard { reason: String },
    /// Success path: persist the update and record MCN snapshots.
    Update(Box<StateUpdate>),
}

pub struct Evaluator {
    thresholds: EvaluationThresholds,
}

impl Evaluator {
    pub fn new(thresholds: EvaluationThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &EvaluationThresholds {
        &self.thresholds
    }

    /// Apply the promotion/demotion rules in order, first match wins for
    /// the terminal transitions.
    pub fn evaluate(
        &self,
        input: &EvaluationInput,
        outcome: &Result<BacktestResult, BacktestError>,
    ) -> EvaluationDecision {
        let result = match outcome {
            Err(error) => return self.evaluate_failure(input, error),
            Ok(result) => result,
        };

        // Regime re-score of the test segment, restricted per tag.
        let regime_scores = score_regimes(result);
        let regime_pass_count = regime_scores.iter().filter(|r| r.passed).count();

        // Overfitting gate: missing Sharpe counts as zero.
        let train_sharpe = result.train.sharpe.unwrap_or(0.0);
        let test_sharpe = result.test.sharpe.unwrap_or(0.0);
        let overfitting_gap = train_sharpe - test_sharpe;
        if overfitting_gap > self.thresholds.g_max || test_sharpe < self.thresholds.s_min_test {
            tracing::debug!(
                overfitting_gap,
                test_sharpe,
                "strategy fails the train/test divergence gate"
            );
            return EvaluationDecision::Discard {
                reason: format!(
                    "train/test divergence: gap {overfitting_gap:.2} (max {:.2}), \
                     test sharpe {test_sharpe:.2} (min {:.2})",
                    self.thresholds.g_max, self.thresholds.s_min_test
                ),
            };
        }

        let score = self.score(&result.test, input.novelty);

        let win_rate = result.test.win_rate.unwrap_or(0.0);
        let status = if score >= self.thresholds.t_proposable
            && result.test.total_trades >= self.thresholds.n_min
            && win_rate >= self.thresholds.w_min
            && regime_pass_count >= self.thresholds.r_min
        {
            StrategyStatus::Proposable
        } else if score >= self.thresholds.t_candidate {
            StrategyStatus::Candidate
        } else {
            StrategyStatus::Experiment
        };

        let generalized = result
            .per_symbol_test
            .values()
            .filter(|m| m.annualized_return.is_some_and(|r| r > 0.0))
            .count()
            >= self.thresholds.k_min_symbols;

        let (estimated_profit_min, estimated_profit_max) = profit_range(result);

        let update = StateUpdate {
            status,
            score,
            train_metrics: result.train.clone(),
            test_metrics: result.test.clone(),
            is_proposable: status == StrategyStatus::Proposable,
            generalized,
            per_symbol_performance: result.per_symbol_test.clone(),
            explanation_human: explanation(result, score, status),
            risk_note: risk_note(result, regime_pass_count),
            estimated_profit_min,
            estimated_profit_max,
            regime_scores,
            regime_pass_count,
        };
        EvaluationDecision::Update(Box::new(update))
    }

    fn evaluate_failure(
        &self,
        input: &EvaluationInput,
        error: &BacktestError,
    ) -> EvaluationDecision {
        if error.is_fatal() {
            return EvaluationDecision::Discard {
                reason: error.to_string(),
            };
        }
        if error.is_data_quality() && input.evolution_attempts + 1 >= self.thresholds.a_max {
            return EvaluationDecision::Discard {
                reason: format!(
                    "data quality after {} attempts: {error}",
                    input.evolution_attempts + 1
                ),
            };
        }
        EvaluationDecision::RetryLater {
            reason: error.to_string(),
        }
    }

    /// The frozen score formula. Any change here is a schema change.
    fn score(&self, test: &MetricRecord, novelty: f64) -> f64 {
        let sharpe = test.sharpe.unwrap_or(0.0);
        let win_rate = test.win_rate.unwrap_or(0.0);
        let max_drawdown = test.max_drawdown.unwrap_or(1.0);
        let profit_factor = test.profit_factor.unwrap_or(0.0);

        0.35 * clip(sharpe / 3.0)
            + 0.25 * win_rate
            + 0.20 * clip(1.0 - max_drawdown)
            + 0.15 * clip(profit_factor / 3.0)
            + 0.05 * novelty.clamp(0.0, 1.0)
    }
}

fn clip(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Re-score the test segment restricted to each regime's bars. A regime
/// passes on a positive cumulative return with non-negative Sharpe; a
/// regime with no bars fails.
fn score_regimes(result: &BacktestResult) -> Vec<RegimeScore> {
    RegimeTag::ALL
        .iter()
        .map(|tag| {
            let returns: Vec<f64> = result
                .test_bar_returns
                .iter()
                .zip(result.test_bar_regimes.iter())
                .filter(|(_, regime)| *regime == tag)
                .map(|(r, _)| *r)
                .collect();

            let metrics = metric_record(&[], &returns, result.interval);
            let cumulative = returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;
            let passed = !returns.is_empty()
                && cumulative > 0.0
                && metrics.sharpe.is_none_or(|s| s >= 0.0);
            RegimeScore {
                regime: *tag,
                metrics,
                passed,
            }
        })
        .collect()
}

/// Estimated profit range: min/max of per-symbol test annualized returns,
/// falling back to the aggregate test return.
fn profit_range(result: &BacktestResult) -> (Option<f64>, Option<f64>) {
    let returns: Vec<f64> = result
        .per_symbol_test
        .values()
        .filter_map(|m| m.annualized_return)
        .collect();
    if returns.is_empty() {
        return (result.test.annualized_return, result.test.annualized_return);
    }
    let min = returns.iter().copied().fold(f64::INFINITY, f64::min);
    let max = returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (Some(min), Some(max))
}

fn explanation(result: &BacktestResult, score: f64, status: StrategyStatus) -> String {
    let test = &result.test;
    format!(
        "Out-of-sample: {} trades, {:.0}% win rate, Sharpe {:.2}, profit factor {:.2}, \
         annualized return {:.1}%. Composite score {:.2} -> {}.",
        test.total_trades,
        test.win_rate.unwrap_or(0.0) * 100.0,
        test.sharpe.unwrap_or(0.0),
        test.profit_factor.unwrap_or(0.0),
        test.annualized_return.unwrap_or(0.0) * 100.0,
        score,
        status.as_str(),
    )
}

fn risk_note(result: &BacktestResult, regime_pass_count: usize) -> String {
    let test = &result.test;
    format!(
        "Historical max drawdown {:.1}% over {} test bars; longest underwater stretch \
         {} bars. Profitable in {regime_pass_count} of 4 market regimes; results outside \
         tested regimes may differ.",
        test.max_drawdown.unwrap_or(0.0) * 100.0,
        result.test_bars,
        test.longest_drawdown_bars.unwrap_or(0),
    )
}

#[cfg(test)]
mod tests;
