use std::collections::BTreeMap;

use evolution_core::{
    BacktestError, BacktestResult, EvaluationThresholds, Interval, MetricRecord, RegimeTag,
    StrategyStatus,
};

use crate::{EvaluationDecision, EvaluationInput, Evaluator};

fn metric(trades: u32, win_rate: f64, sharpe: f64, profit_factor: f64, dd: f64) -> MetricRecord {
    MetricRecord {
        total_trades: trades,
        win_rate: Some(win_rate),
        avg_reward_risk: Some(1.5),
        sharpe: Some(sharpe),
        sortino: Some(sharpe * 1.1),
        max_drawdown: Some(dd),
        profit_factor: Some(profit_factor),
        annualized_return: Some(0.18),
        longest_drawdown_bars: Some(12),
    }
}

/// Build a result whose test segment passes the first `passing` regimes.
fn result(train: MetricRecord, test: MetricRecord, passing: usize) -> BacktestResult {
    let mut test_bar_returns = Vec::new();
    let mut test_bar_regimes = Vec::new();
    for (i, tag) in RegimeTag::ALL.iter().enumerate() {
        let block: [f64; 4] = if i < passing {
            [0.010, 0.008, 0.012, 0.005]
        } else {
            [-0.010, -0.020, 0.001, -0.005]
        };
        for r in block {
            test_bar_returns.push(r);
            test_bar_regimes.push(*tag);
        }
    }
    BacktestResult {
        run_id: "run".to_string(),
        window_hash: "window".to_string(),
        seed: 1,
        train,
        test,
        per_symbol_test: BTreeMap::new(),
        equity_curve: Vec::new(),
        trades: Vec::new(),
        test_bar_returns,
        test_bar_regimes,
        interval: Interval::Day1,
        train_bars: 280,
        test_bars: 16,
    }
}

fn input(status: StrategyStatus, attempts: i64, novelty: f64) -> EvaluationInput {
    EvaluationInput {
        status,
        evolution_attempts: attempts,
        novelty,
    }
}

fn evaluator() -> Evaluator {
    Evaluator::new(EvaluationThresholds::default())
}

fn expect_update(decision: EvaluationDecision) -> crate::StateUpdate {
    match decision {
        EvaluationDecision::Update(update) => *update,
        other => panic!("expected Update, got {other:?}"),
    }
}

#[test]
fn strong_out_of_sample_run_is_promoted() {
    // Test record from the promotion scenario: 80 trades, 62% win rate,
    // Sharpe 2.1, profit factor 2.5, drawdown 12%; train Sharpe 2.3.
    let outcome = Ok(result(
        metric(90, 0.60, 2.3, 2.4, 0.10),
        metric(80, 0.62, 2.1, 2.5, 0.12),
        4,
    ));
    let decision = evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.6), &outcome);

    let update = expect_update(decision);
    assert_eq!(update.status, StrategyStatus::Proposable);
    assert!(update.is_proposable);
    assert_eq!(update.regime_scores.len(), 4);
    assert_eq!(update.regime_pass_count, 4);
    // 0.35*(2.1/3) + 0.25*0.62 + 0.2*0.88 + 0.15*(2.5/3) + 0.05*0.6
    assert!((update.score - 0.731).abs() < 1e-9, "score {}", update.score);
    assert!(!update.explanation_human.is_empty());
    assert!(!update.risk_note.is_empty());
}

#[test]
fn overfitting_gap_discards() {
    let outcome = Ok(result(
        metric(90, 0.60, 2.8, 2.4, 0.10),
        metric(80, 0.62, 0.2, 2.5, 0.12),
        4,
    ));
    let decision = evaluator().evaluate(&input(StrategyStatus::Candidate, 1, 0.6), &outcome);
    match decision {
        EvaluationDecision::Discard { reason } => {
            assert!(reason.contains("divergence"), "reason: {reason}");
        }
        other => panic!("expected Discard, got {other:?}"),
    }
}

#[test]
fn weak_test_sharpe_discards_even_without_gap() {
    let outcome = Ok(result(
        metric(90, 0.60, 0.4, 2.4, 0.10),
        metric(80, 0.62, 0.1, 2.5, 0.12),
        4,
    ));
    let decision = evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.6), &outcome);
    assert!(matches!(decision, EvaluationDecision::Discard { .. }));
}

#[test]
fn middling_score_lands_on_candidate() {
    let outcome = Ok(result(
        metric(60, 0.52, 1.2, 1.6, 0.18),
        metric(55, 0.50, 1.05, 1.5, 0.20),
        4,
    ));
    let decision = evaluator().evaluate(&input(StrategyStatus::Experiment, 1, 0.6), &outcome);
    let update = expect_update(decision);
    assert_eq!(update.status, StrategyStatus::Candidate);
    assert!(!update.is_proposable);
    assert!(update.score >= 0.40 && update.score < 0.70, "score {}", update.score);
}

#[test]
fn high_score_without_enough_trades_is_not_promoted() {
    let outcome = Ok(result(
        metric(40, 0.65, 2.3, 2.6, 0.08),
        metric(30, 0.64, 2.2, 2.7, 0.09),
        4,
    ));
    let decision = evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.8), &outcome);
    let update = expect_update(decision);
    assert_eq!(update.status, StrategyStatus::Candidate);
    assert!(!update.is_proposable);
}

#[test]
fn too_few_passing_regimes_blocks_promotion() {
    let outcome = Ok(result(
        metric(90, 0.62, 2.3, 2.5, 0.10),
        metric(80, 0.62, 2.1, 2.5, 0.12),
        2,
    ));
    let decision = evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.6), &outcome);
    let update = expect_update(decision);
    assert_eq!(update.status, StrategyStatus::Candidate);
    assert_eq!(update.regime_pass_count, 2);
}

#[test]
fn weak_newer_backtest_demotes_a_proposable() {
    let outcome = Ok(result(
        metric(60, 0.45, 0.8, 1.1, 0.30),
        metric(55, 0.42, 0.6, 1.0, 0.35),
        1,
    ));
    let decision = evaluator().evaluate(&input(StrategyStatus::Proposable, 2, 0.3), &outcome);
    let update = expect_update(decision);
    assert_eq!(update.status, StrategyStatus::Experiment);
    assert!(!update.is_proposable);
}

#[test]
fn insufficient_bars_just_retries_below_the_attempt_limit() {
    let outcome = Err(BacktestError::InsufficientBars {
        segment: "test",
        have: 20,
        need: 50,
    });
    let decision = evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.5), &outcome);
    assert!(matches!(decision, EvaluationDecision::RetryLater { .. }));
}

#[test]
fn data_quality_failures_discard_at_the_attempt_limit() {
    let outcome = Err(BacktestError::InsufficientBars {
        segment: "test",
        have: 20,
        need: 50,
    });
    // Attempt 5 of a_max = 5.
    let decision = evaluator().evaluate(&input(StrategyStatus::Experiment, 4, 0.5), &outcome);
    match decision {
        EvaluationDecision::Discard { reason } => assert!(reason.contains("data quality")),
        other => panic!("expected Discard, got {other:?}"),
    }
}

#[test]
fn transient_failures_never_discard() {
    let outcome = Err(BacktestError::Timeout { limit_seconds: 120 });
    let decision = evaluator().evaluate(&input(StrategyStatus::Candidate, 40, 0.5), &outcome);
    assert!(matches!(decision, EvaluationDecision::RetryLater { .. }));
}

#[test]
fn malformed_rules_discard_immediately() {
    let outcome = Err(BacktestError::MalformedRuleSet("no entry rule".to_string()));
    let decision = evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.5), &outcome);
    assert!(matches!(decision, EvaluationDecision::Discard { .. }));
}

#[test]
fn generalized_needs_profits_on_enough_symbols() {
    let mut res = result(
        metric(90, 0.60, 2.3, 2.4, 0.10),
        metric(80, 0.62, 2.1, 2.5, 0.12),
        4,
    );
    for (symbol, ret) in [("AAPL", 0.2), ("MSFT", 0.1), ("NVDA", 0.3)] {
        res.per_symbol_test.insert(
            symbol.to_string(),
            MetricRecord {
                annualized_return: Some(ret),
                ..metric(20, 0.6, 1.5, 2.0, 0.1)
            },
        );
    }
    let update = expect_update(
        evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.6), &Ok(res.clone())),
    );
    assert!(update.generalized);
    assert_eq!(update.estimated_profit_min, Some(0.1));
    assert_eq!(update.estimated_profit_max, Some(0.3));

    // Two losing symbols drop it below the threshold.
    res.per_symbol_test.get_mut("AAPL").unwrap().annualized_return = Some(-0.05);
    let update = expect_update(
        evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.6), &Ok(res)),
    );
    assert!(!update.generalized);
}

#[test]
fn proposable_invariant_holds_for_every_update() {
    let cases = [
        (metric(80, 0.62, 2.1, 2.5, 0.12), 4usize),
        (metric(55, 0.50, 1.05, 1.5, 0.20), 4),
        (metric(55, 0.42, 0.9, 1.0, 0.35), 1),
        (metric(30, 0.64, 2.2, 2.7, 0.09), 4),
    ];
    for (test, passing) in cases {
        let outcome = Ok(result(metric(90, 0.6, test.sharpe.unwrap() + 0.1, 2.0, 0.1), test, passing));
        if let EvaluationDecision::Update(update) =
            evaluator().evaluate(&input(StrategyStatus::Experiment, 0, 0.5), &outcome)
        {
            assert_eq!(
                update.is_proposable,
                update.status == StrategyStatus::Proposable
            );
        }
    }
}
