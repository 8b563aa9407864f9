use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use evolution_core::{
    AdminControls, AssetClass, Bar, Indicator, Interval, MarketDataError, MarketDataProvider,
    Operand, Predicate, Quote, RuleSet, StrategyStatus,
};
use evolution_scheduler::{EvolutionScheduler, SchedulerConfig};
use market_data::{GatewayConfig, MarketDataGateway, SimProvider, TokenBucketConfig};
use strategy_memory::StrategyMemory;
use strategy_repository::{NewStrategy, StrategyRepository};

fn window_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap()
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
        stop_loss_pct: Some(0.08),
        take_profit_pct: None,
        max_hold_bars: None,
    }
}

fn new_strategy(name: &str, fast: u32) -> NewStrategy {
    NewStrategy {
        name: name.to_string(),
        description: "integration test strategy".to_string(),
        owner: "tester".to_string(),
        asset_class: AssetClass::Equities,
        symbols: vec![
            "AAPL".to_string(),
            "MSFT".to_string(),
            "NVDA".to_string(),
        ],
        rules: rules(fast, 40),
        created_at: None,
    }
}

struct Stack {
    scheduler: Arc<EvolutionScheduler>,
    repository: Arc<StrategyRepository>,
    memory: Arc<StrategyMemory>,
    controls: Arc<AdminControls>,
}

async fn stack_with_gateway(gateway: MarketDataGateway) -> Stack {
    // One connection: every pooled connection to :memory: would otherwise
    // see its own empty database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let repository = Arc::new(StrategyRepository::new(pool.clone()));
    repository.init_tables().await.unwrap();
    let memory = Arc::new(StrategyMemory::new(pool));
    memory.init_tables().await.unwrap();
    let controls = Arc::new(AdminControls::default());

    let config = SchedulerConfig {
        window_end: Some(window_end()),
        ..SchedulerConfig::default()
    };
    let scheduler = Arc::new(EvolutionScheduler::new(
        Arc::clone(&repository),
        Arc::new(gateway),
        Arc::clone(&memory),
        Arc::clone(&controls),
        config,
    ));
    Stack {
        scheduler,
        repository,
        memory,
        controls,
    }
}

async fn stack() -> Stack {
    let gateway = MarketDataGateway::new(GatewayConfig::default())
        .with_provider(Arc::new(SimProvider::new()), TokenBucketConfig::default());
    stack_with_gateway(gateway).await
}

#[tokio::test]
async fn tick_with_empty_queue_is_a_noop() {
    let stack = stack().await;
    let summary = stack.scheduler.run_tick().await.unwrap();
    assert_eq!(summary.selected, 0);
    assert_eq!(summary.evaluated, 0);
    assert!(stack.repository.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn tick_evaluates_a_fresh_strategy_end_to_end() {
    let stack = stack().await;
    let id = stack
        .repository
        .insert(&new_strategy("alpha", 10))
        .await
        .unwrap();

    let summary = stack.scheduler.run_tick().await.unwrap();
    assert_eq!(summary.selected, 1);

    let strategy = stack.repository.get(id).await.unwrap().unwrap();
    // Whatever path the evaluation took, the invariant holds.
    assert_eq!(
        strategy.is_proposable,
        strategy.status == StrategyStatus::Proposable
    );

    match strategy.status {
        StrategyStatus::Discarded => {
            assert!(strategy.discard_reason.is_some());
        }
        _ => {
            assert!(strategy.last_backtest_at.is_some());
            assert!(strategy.test_metrics.is_some());
            assert!(strategy.score.is_some());
            assert!(!strategy.per_symbol_performance.is_empty());
            // Regime snapshots land in the MCN on every success path.
            let snapshots = stack
                .memory
                .regime_snapshots(&strategy.fingerprint)
                .await
                .unwrap();
            assert_eq!(snapshots.len(), 4);
        }
    }
}

#[tokio::test]
async fn shutdown_before_the_tick_leaves_state_untouched() {
    let stack = stack().await;
    let a = stack.repository.insert(&new_strategy("a", 10)).await.unwrap();
    let b = stack.repository.insert(&new_strategy("b", 12)).await.unwrap();

    stack.scheduler.request_shutdown();
    let summary = stack.scheduler.run_tick().await.unwrap();
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.evaluated, 0);

    for id in [a, b] {
        let strategy = stack.repository.get(id).await.unwrap().unwrap();
        assert!(strategy.last_backtest_at.is_none());
        assert_eq!(strategy.evolution_attempts, 0);
        assert_eq!(strategy.status, StrategyStatus::Experiment);
    }
}

#[tokio::test]
async fn exhausted_tick_budget_defers_work_to_the_next_tick() {
    let gateway = MarketDataGateway::new(GatewayConfig::default())
        .with_provider(Arc::new(SimProvider::new()), TokenBucketConfig::default());
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let repository = Arc::new(StrategyRepository::new(pool.clone()));
    repository.init_tables().await.unwrap();
    let memory = Arc::new(StrategyMemory::new(pool));
    memory.init_tables().await.unwrap();

    let scheduler = Arc::new(EvolutionScheduler::new(
        Arc::clone(&repository),
        Arc::new(gateway),
        memory,
        Arc::new(AdminControls::default()),
        SchedulerConfig {
            window_end: Some(window_end()),
            tick_max_seconds: 0,
            ..SchedulerConfig::default()
        },
    ));

    let id = repository.insert(&new_strategy("deferred", 10)).await.unwrap();

    // The deadline has already passed when the worker starts, so the unit
    // is deferred rather than run.
    let summary = scheduler.run_tick().await.unwrap();
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.skipped, 1);

    let strategy = repository.get(id).await.unwrap().unwrap();
    assert!(strategy.last_backtest_at.is_none());
    assert_eq!(strategy.evolution_attempts, 0);
}

#[tokio::test]
async fn replay_over_a_fixed_snapshot_is_deterministic() {
    let run = || async {
        let stack = stack().await;
        let id = stack
            .repository
            .insert(&new_strategy("replay", 10))
            .await
            .unwrap();
        stack.scheduler.run_tick().await.unwrap();
        let strategy = stack.repository.get(id).await.unwrap().unwrap();
        (
            strategy.status,
            strategy.score,
            strategy.evolution_attempts,
            serde_json::to_string(&strategy.train_metrics).unwrap(),
            serde_json::to_string(&strategy.test_metrics).unwrap(),
            serde_json::to_string(&strategy.per_symbol_performance).unwrap(),
        )
    };

    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
}

/// Sim provider wrapper that records how many bar fetches run at once.
struct TrackingProvider {
    inner: SimProvider,
    current: Arc<AtomicI64>,
    peak: Arc<AtomicI64>,
}

#[async_trait]
impl MarketDataProvider for TrackingProvider {
    fn name(&self) -> &str {
        "tracking"
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let result = self.inner.fetch_bars(symbol, interval, start, end).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, MarketDataError> {
        self.inner.fetch_quote(symbol).await
    }
}

#[tokio::test]
async fn concurrency_budget_of_one_serializes_the_work() {
    let current = Arc::new(AtomicI64::new(0));
    let peak = Arc::new(AtomicI64::new(0));
    let gateway = MarketDataGateway::new(GatewayConfig::default()).with_provider(
        Arc::new(TrackingProvider {
            inner: SimProvider::new(),
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
        }),
        TokenBucketConfig {
            capacity: 1000.0,
            refill_per_second: 1000.0,
        },
    );
    let stack = stack_with_gateway(gateway).await;
    stack.controls.set_max_concurrent_backtests(1);

    let mut ids = Vec::new();
    for (name, fast) in [("one", 8), ("two", 10), ("three", 12)] {
        ids.push(stack.repository.insert(&new_strategy(name, fast)).await.unwrap());
    }

    // Batch size is min(C_max, queue depth): one strategy per tick.
    for _ in 0..3 {
        let summary = stack.scheduler.run_tick().await.unwrap();
        assert_eq!(summary.selected, 1);
    }

    assert!(peak.load(Ordering::SeqCst) <= 1, "backtests overlapped");

    // Each of the original three got exactly one pass across the ticks;
    // children spawned along the way wait for later ticks.
    for id in ids {
        let strategy = stack.repository.get(id).await.unwrap().unwrap();
        let touched = strategy.last_backtest_at.is_some()
            || strategy.evolution_attempts > 0
            || strategy.status == StrategyStatus::Discarded;
        assert!(touched, "strategy {} untouched", strategy.id);
    }
}

#[tokio::test]
async fn mutation_step_spawns_linked_experiments() {
    let stack = stack().await;
    let id = stack
        .repository
        .insert(&new_strategy("parent", 10))
        .await
        .unwrap();
    let parent = stack.repository.get(id).await.unwrap().unwrap();
    let parent_fp = stack.memory.register(&parent.rules).await.unwrap();

    let spawned = stack
        .scheduler
        .run_mutation_step(&parent, &parent_fp)
        .await
        .unwrap();
    assert!(spawned > 0, "expected children from the mutation step");

    let all = stack.repository.all().await.unwrap();
    assert_eq!(all.len(), 1 + spawned);

    let mut child_fps = std::collections::HashSet::new();
    for child in all.iter().filter(|s| s.id != id) {
        assert_eq!(child.status, StrategyStatus::Experiment);
        assert_eq!(child.evolution_attempts, 0);
        assert_ne!(child.fingerprint, parent_fp);
        assert!(child_fps.insert(child.fingerprint.clone()));

        // Each child is linked under the parent in the MCN.
        let path = stack.memory.lineage(&child.fingerprint).await.unwrap();
        assert_eq!(path.len(), 1);
    }

    let parent_after = stack.repository.get(id).await.unwrap().unwrap();
    assert_eq!(parent_after.evolution_attempts, 1);
}

#[tokio::test]
async fn repeated_mutation_steps_do_not_duplicate_children() {
    let stack = stack().await;
    let id = stack
        .repository
        .insert(&new_strategy("parent", 10))
        .await
        .unwrap();
    let parent = stack.repository.get(id).await.unwrap().unwrap();
    let parent_fp = stack.memory.register(&parent.rules).await.unwrap();

    let first = stack
        .scheduler
        .run_mutation_step(&parent, &parent_fp)
        .await
        .unwrap();
    // Same parent, same attempt count: the same draws are all known now,
    // so the second step spawns nothing new from round one draws.
    let parent_again = stack.repository.get(id).await.unwrap().unwrap();
    let second = stack
        .scheduler
        .run_mutation_step(&parent_again, &parent_fp)
        .await
        .unwrap();

    let all = stack.repository.all().await.unwrap();
    assert_eq!(all.len(), 1 + first + second);

    let mut fps = std::collections::HashSet::new();
    for strategy in all.iter().filter(|s| s.id != id) {
        assert!(
            fps.insert(strategy.fingerprint.clone()),
            "duplicate child fingerprint"
        );
    }
}

#[tokio::test]
async fn recommendation_surface_only_shows_proposables() {
    let stack = stack().await;
    stack
        .repository
        .insert(&new_strategy("alpha", 10))
        .await
        .unwrap();
    stack.scheduler.run_tick().await.unwrap();

    for strategy in stack.repository.top_proposable(10).await.unwrap() {
        assert_eq!(strategy.status, StrategyStatus::Proposable);
        assert!(strategy.is_proposable);
        assert!(strategy.score.is_some());
    }
}
