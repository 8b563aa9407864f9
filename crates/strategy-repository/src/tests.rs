use chrono::{Duration, Utc};

use evolution_core::{
    AssetClass, Indicator, MetricRecord, Operand, Predicate, RuleSet, StrategyStatus,
};

use crate::models::{EvaluationUpdate, NewStrategy};
use crate::StrategyRepository;

async fn repository() -> StrategyRepository {
    // One connection: every pooled connection to :memory: would otherwise
    // see its own empty database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let repo = StrategyRepository::new(pool);
    repo.init_tables().await.unwrap();
    repo
}

fn rules(fast: u32, slow: u32) -> RuleSet {
    RuleSet {
        entry: vec![Predicate::CrossesAbove {
            left: Operand::Indicator {
                indicator: Indicator::Sma { period: fast },
            },
            right: Operand::Indicator {
                indicator: Indicator::Sma { period: slow },
            },
        }],
        exit: vec![Predicate::CrossesBelow {
            left: Operand::Indicator {
                indicator: Indicator::Sma { period: fast },
            },
            right: Operand::Indicator {
                indicator: Indicator::Sma { period: slow },
            },
        }],
        stop_loss_pct: Some(0.05),
        take_profit_pct: None,
        max_hold_bars: None,
    }
}

fn new_strategy(name: &str, fast: u32, age_days: i64) -> NewStrategy {
    NewStrategy {
        name: name.to_string(),
        description: "test strategy".to_string(),
        owner: "tester".to_string(),
        asset_class: AssetClass::Equities,
        symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
        rules: rules(fast, 50),
        created_at: Some(Utc::now() - Duration::days(age_days)),
    }
}

fn evaluation(status: StrategyStatus, score: f64, backtest_age_days: i64) -> EvaluationUpdate {
    EvaluationUpdate {
        status,
        score: Some(score),
        train_metrics: Some(MetricRecord::default()),
        test_metrics: Some(MetricRecord::default()),
        last_backtest_at: Some(Utc::now() - Duration::days(backtest_age_days)),
        is_proposable: status == StrategyStatus::Proposable,
        generalized: false,
        per_symbol_performance: Default::default(),
        explanation_human: Some("explanation".to_string()),
        risk_note: Some("risk".to_string()),
        estimated_profit_min: Some(-0.05),
        estimated_profit_max: Some(0.20),
        discard_reason: None,
    }
}

#[tokio::test]
async fn insert_starts_in_initial_state() {
    let repo = repository().await;
    let id = repo.insert(&new_strategy("alpha", 10, 0)).await.unwrap();
    let strategy = repo.get(id).await.unwrap().unwrap();

    assert_eq!(strategy.status, StrategyStatus::Experiment);
    assert_eq!(strategy.score, None);
    assert_eq!(strategy.evolution_attempts, 0);
    assert!(!strategy.is_proposable);
    assert!(strategy.last_backtest_at.is_none());
    assert_eq!(strategy.fingerprint.len(), 64);
}

#[tokio::test]
async fn never_backtested_beats_stale_candidate() {
    let repo = repository().await;
    // A candidate last backtested 10 days ago...
    let stale = repo.insert(&new_strategy("stale", 12, 30)).await.unwrap();
    repo.apply_evaluation(stale, &evaluation(StrategyStatus::Candidate, 0.5, 10))
        .await
        .unwrap();
    // ...and a never-backtested strategy created yesterday.
    let fresh = repo.insert(&new_strategy("fresh", 10, 1)).await.unwrap();

    let stale_before = Utc::now() - Duration::days(7);
    let batch = repo.select_backtest_batch(stale_before, 1).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, fresh);
}

#[tokio::test]
async fn selection_orders_all_four_tiers() {
    let repo = repository().await;

    let tier1 = repo.insert(&new_strategy("stale", 12, 40)).await.unwrap();
    repo.apply_evaluation(tier1, &evaluation(StrategyStatus::Candidate, 0.5, 10))
        .await
        .unwrap();

    let tier2 = repo.insert(&new_strategy("experiment", 14, 20)).await.unwrap();
    repo.apply_evaluation(tier2, &evaluation(StrategyStatus::Experiment, 0.2, 1))
        .await
        .unwrap();

    let tier3 = repo.insert(&new_strategy("candidate", 16, 20)).await.unwrap();
    repo.apply_evaluation(tier3, &evaluation(StrategyStatus::Candidate, 0.5, 1))
        .await
        .unwrap();

    let tier0 = repo.insert(&new_strategy("never", 18, 1)).await.unwrap();

    let stale_before = Utc::now() - Duration::days(7);
    let batch = repo.select_backtest_batch(stale_before, 10).await.unwrap();
    let ids: Vec<i64> = batch.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![tier0, tier1, tier2, tier3]);
}

#[tokio::test]
async fn discarded_strategies_are_not_selected() {
    let repo = repository().await;
    let id = repo.insert(&new_strategy("dead", 10, 1)).await.unwrap();
    repo.discard(id, "overfitting gap exceeded").await.unwrap();

    let stale_before = Utc::now() - Duration::days(7);
    let batch = repo.select_backtest_batch(stale_before, 10).await.unwrap();
    assert!(batch.is_empty());

    let strategy = repo.get(id).await.unwrap().unwrap();
    assert_eq!(strategy.status, StrategyStatus::Discarded);
    assert_eq!(
        strategy.discard_reason.as_deref(),
        Some("overfitting gap exceeded")
    );
}

#[tokio::test]
async fn discarded_rows_reject_further_evaluations() {
    let repo = repository().await;
    let id = repo.insert(&new_strategy("dead", 10, 1)).await.unwrap();
    repo.discard(id, "rules 2").await.unwrap();

    let applied = repo
        .apply_evaluation(id, &evaluation(StrategyStatus::Proposable, 0.9, 0))
        .await
        .unwrap();
    assert!(!applied, "discarded row must stay terminal");
    let strategy = repo.get(id).await.unwrap().unwrap();
    assert_eq!(strategy.status, StrategyStatus::Discarded);
    assert!(!strategy.is_proposable);
}

#[tokio::test]
async fn attempts_only_ever_increase() {
    let repo = repository().await;
    let id = repo.insert(&new_strategy("retry", 10, 1)).await.unwrap();
    repo.record_attempt(id).await.unwrap();
    repo.record_attempt(id).await.unwrap();
    let strategy = repo.get(id).await.unwrap().unwrap();
    assert_eq!(strategy.evolution_attempts, 2);
    // Attempt bumps leave the rest of the row untouched.
    assert!(strategy.last_backtest_at.is_none());
    assert_eq!(strategy.status, StrategyStatus::Experiment);
}

#[tokio::test]
async fn top_proposable_orders_by_score_and_hides_the_rest() {
    let repo = repository().await;

    let low = repo.insert(&new_strategy("low", 10, 1)).await.unwrap();
    repo.apply_evaluation(low, &evaluation(StrategyStatus::Proposable, 0.72, 0))
        .await
        .unwrap();

    let high = repo.insert(&new_strategy("high", 12, 1)).await.unwrap();
    repo.apply_evaluation(high, &evaluation(StrategyStatus::Proposable, 0.91, 0))
        .await
        .unwrap();

    let candidate = repo.insert(&new_strategy("cand", 14, 1)).await.unwrap();
    repo.apply_evaluation(candidate, &evaluation(StrategyStatus::Candidate, 0.5, 0))
        .await
        .unwrap();

    let top = repo.top_proposable(10).await.unwrap();
    let ids: Vec<i64> = top.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![high, low]);
    for strategy in &top {
        assert!(strategy.is_proposable);
        assert!(strategy.explanation_human.is_some());
        assert!(strategy.risk_note.is_some());
        assert!(strategy.estimated_profit_min.is_some());
        assert!(strategy.estimated_profit_max.is_some());
    }
}

#[tokio::test]
async fn evaluation_update_is_atomic_per_row() {
    let repo = repository().await;
    let id = repo.insert(&new_strategy("atomic", 10, 1)).await.unwrap();

    let mut update = evaluation(StrategyStatus::Proposable, 0.8, 0);
    update.generalized = true;
    repo.apply_evaluation(id, &update).await.unwrap();

    let strategy = repo.get(id).await.unwrap().unwrap();
    // The invariant holds on every observed row.
    assert_eq!(
        strategy.is_proposable,
        strategy.status == StrategyStatus::Proposable
    );
    assert!(strategy.generalized);
    assert_eq!(strategy.score, Some(0.8));
    assert!(strategy.train_metrics.is_some() && strategy.test_metrics.is_some());
}
