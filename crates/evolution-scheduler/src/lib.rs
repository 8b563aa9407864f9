//! Evolution Scheduler
//!
//! Periodic orchestrator of the strategy lifecycle: selects candidates by
//! priority, drives Backtest -> Evaluator -> Mutator under a live-tunable
//! concurrency budget, persists state atomically and records lineage and
//! regime snapshots into the MCN.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use backtest_engine::{BacktestConfig, BacktestEngine, BacktestRequest};
use evolution_core::{
    AdminControls, BacktestError, BarSeries, EvaluationThresholds, Interval, StrategyStatus,
};
use market_data::MarketDataGateway;
use strategy_evaluator::{EvaluationDecision, EvaluationInput, Evaluator, StateUpdate};
use strategy_memory::StrategyMemory;
use strategy_mutator::{Mutator, MutatorConfig};
use strategy_repository::{EvaluationUpdate, NewStrategy, Strategy, StrategyRepository};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Backtests older than this are considered stale (A_stale).
    pub stale_after_days: i64,
    /// Wall-clock budget for one tick; unstarted work waits for the next.
    pub tick_max_seconds: u64,
    /// Per-backtest timeout (T_bt_max).
    pub backtest_timeout_seconds: u64,
    /// Base historical window requested per backtest.
    pub lookback_days: i64,
    /// Extra lookback granted per accrued attempt, for thin data.
    pub lookback_growth_days: i64,
    pub interval: Interval,
    /// Lineage depth consulted when rejecting duplicate children.
    pub generational_depth: usize,
    /// Fixed window end for deterministic replays; `None` means now.
    pub window_end: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stale_after_days: 7,
            tick_max_seconds: 240,
            backtest_timeout_seconds: 120,
            lookback_days: 730,
            lookback_growth_days: 180,
            interval: Interval::Day1,
            generational_depth: 1,
            window_end: None,
        }
    }
}

/// What one tick did, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub selected: usize,
    pub evaluated: usize,
    pub retried: usize,
    pub discarded: usize,
    pub children_spawned: usize,
    pub skipped: usize,
}

pub struct EvolutionScheduler {
    repository: Arc<StrategyRepository>,
    gateway: Arc<MarketDataGateway>,
    memory: Arc<StrategyMemory>,
    controls: Arc<AdminControls>,
    evaluator: Arc<Evaluator>,
    mutator: Arc<Mutator>,
    config: SchedulerConfig,
    backtest_config: BacktestConfig,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl EvolutionScheduler {
    pub fn new(
        repository: Arc<StrategyRepository>,
        gateway: Arc<MarketDataGateway>,
        memory: Arc<StrategyMemory>,
        controls: Arc<AdminControls>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            gateway,
            memory,
            controls,
            evaluator: Arc::new(Evaluator::new(EvaluationThresholds::default())),
            mutator: Arc::new(Mutator::new(MutatorConfig::default())),
            config,
            backtest_config: BacktestConfig::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_thresholds(mut self, thresholds: EvaluationThresholds) -> Self {
        self.evaluator = Arc::new(Evaluator::new(thresholds));
        self
    }

    pub fn with_mutator_config(mut self, config: MutatorConfig) -> Self {
        self.mutator = Arc::new(Mutator::new(config));
        self
    }

    pub fn with_backtest_config(mut self, config: BacktestConfig) -> Self {
        self.backtest_config = config;
        self
    }

    /// Flag polled between bar batches and between work units. Setting it
    /// lets in-flight backtests stop at the next batch boundary.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Long-running evolution loop: sleep, tick, repeat. The interval and
    /// the concurrency budget are re-read at every tick boundary, so admin
    /// changes apply to the next tick, never an in-flight one.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        tracing::info!(
            interval_seconds = self.controls.evolution_interval_seconds(),
            "evolution loop started"
        );
        loop {
            let wait = Duration::from_secs(self.controls.evolution_interval_seconds());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown_notify.notified() => {}
            }
            if self.is_shutdown() {
                break;
            }
            match self.run_tick().await {
                Ok(summary) => {
                    tracing::info!(
                        selected = summary.selected,
                        evaluated = summary.evaluated,
                        retried = summary.retried,
                        discarded = summary.discarded,
                        children = summary.children_spawned,
                        skipped = summary.skipped,
                        "evolution tick complete"
                    );
                }
                Err(e) => tracing::error!("evolution tick failed: {e:#}"),
            }
        }
        tracing::info!("evolution loop stopped");
        Ok(())
    }

    /// Monitoring loop: read-only population health summary.
    pub async fn run_monitor_until_shutdown(&self) -> Result<()> {
        loop {
            let wait = Duration::from_secs(self.controls.monitoring_interval_seconds());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown_notify.notified() => {}
            }
            if self.is_shutdown() {
                break;
            }
            if let Err(e) = self.run_monitor_pass().await {
                tracing::warn!("monitoring pass failed: {e:#}");
            }
        }
        Ok(())
    }

    pub async fn run_monitor_pass(&self) -> Result<()> {
        let counts = self.repository.status_counts().await?;
        let top = self.repository.top_proposable(1).await?;
        tracing::info!(
            population = ?counts,
            top_score = top.first().and_then(|s| s.score),
            "population health"
        );
        Ok(())
    }

    /// One scheduler tick. The concurrency budget is read once here; at
    /// most that many backtests are in flight at any moment, and a strategy
    /// gets at most one state write per tick.
    pub async fn run_tick(&self) -> Result<TickSummary> {
        let budget = self.controls.max_concurrent_backtests();
        let stale_before = Utc::now() - chrono::Duration::days(self.config.stale_after_days);
        let batch = self
            .repository
            .select_backtest_batch(stale_before, budget as i64)
            .await?;

        let mut summary = TickSummary {
            selected: batch.len(),
            ..TickSummary::default()
        };
        if batch.is_empty() {
            return Ok(summary);
        }

        tracing::info!(
            batch = batch.len(),
            budget,
            "tick starting"
        );

        let deadline = Instant::now() + Duration::from_secs(self.config.tick_max_seconds);
        let semaphore = Semaphore::new(budget);

        let workers = batch.into_iter().map(|strategy| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                // Work not yet started at the deadline or after shutdown is
                // left for the next tick; in-flight backtests are never cut
                // mid-run here.
                if self.is_shutdown() || Instant::now() >= deadline {
                    return WorkerOutcome::Skipped;
                }
                self.process_strategy(strategy).await
            }
        });

        for outcome in futures_util::future::join_all(workers).await {
            match outcome {
                WorkerOutcome::Evaluated { spawned_children } => {
                    summary.evaluated += 1;
                    summary.children_spawned += spawned_children;
                }
                WorkerOutcome::Retried => summary.retried += 1,
                WorkerOutcome::Discarded => summary.discarded += 1,
                WorkerOutcome::Skipped => summary.skipped += 1,
                WorkerOutcome::Failed => {}
            }
        }

        Ok(summary)
    }

    /// Run one strategy through backtest -> evaluate -> persist -> memory,
    /// then the mutation step when it lands on candidate.
    async fn process_strategy(&self, strategy: Strategy) -> WorkerOutcome {
        let outcome = self.run_backtest(&strategy).await;

        // Shutdown mid-backtest discards the result without any state
        // change; the strategy is picked up again on a later tick.
        if matches!(outcome, Err(BacktestError::Cancelled)) {
            tracing::info!(strategy = strategy.id, "backtest cancelled by shutdown");
            return WorkerOutcome::Skipped;
        }

        let fingerprint = match self.memory.register(&strategy.rules).await {
            Ok(fp) => fp,
            Err(e) => {
                // Fingerprint collision with a conflicting rule set is a
                // logic error: fatal for the strategy.
                if matches!(e, strategy_memory::MemoryError::FingerprintConflict { .. }) {
                    let _ = self
                        .repository
                        .discard(strategy.id, &format!("fingerprint conflict: {e}"))
                        .await;
                    return WorkerOutcome::Discarded;
                }
                tracing::error!(strategy = strategy.id, "memory register failed: {e}");
                return WorkerOutcome::Failed;
            }
        };

        let novelty = match self.memory.novelty(&fingerprint).await {
            Ok(novelty) => novelty,
            Err(e) => {
                tracing::error!(strategy = strategy.id, "novelty lookup failed: {e}");
                return WorkerOutcome::Failed;
            }
        };

        let input = EvaluationInput {
            status: strategy.status,
            evolution_attempts: strategy.evolution_attempts,
            novelty,
        };
        let decision = self.evaluator.evaluate(&input, &outcome);

        match decision {
            EvaluationDecision::RetryLater { reason } => {
                tracing::info!(strategy = strategy.id, %reason, "backtest retried later");
                if self.repository.record_attempt(strategy.id).await.is_err() {
                    return WorkerOutcome::Failed;
                }
                WorkerOutcome::Retried
            }
            EvaluationDecision::Discard { reason } => {
                tracing::warn!(strategy = strategy.id, %reason, "strategy discarded");
                // Data-quality discards still count the attempt that
                // exhausted the limit.
                if outcome.as_ref().is_err_and(|e| e.is_data_quality()) {
                    let _ = self.repository.record_attempt(strategy.id).await;
                }
                if self.repository.discard(strategy.id, &reason).await.is_err() {
                    return WorkerOutcome::Failed;
                }
                WorkerOutcome::Discarded
            }
            EvaluationDecision::Update(update) => {
                let result = outcome.as_ref().expect("update implies success");
                if let Err(e) = self
                    .persist_success(&strategy, &fingerprint, &update, &result.window_hash)
                    .await
                {
                    // Infrastructure failure: the previous committed state
                    // stands and the tick continues with other strategies.
                    tracing::error!(strategy = strategy.id, "persist failed: {e:#}");
                    return WorkerOutcome::Failed;
                }

                let mut spawned_children = 0;
                if update.status == StrategyStatus::Candidate
                    && strategy.evolution_attempts < self.evaluator.thresholds().a_max
                {
                    match self.run_mutation_step(&strategy, &fingerprint).await {
                        Ok(count) => spawned_children = count,
                        Err(e) => {
                            tracing::error!(strategy = strategy.id, "mutation step failed: {e:#}")
                        }
                    }
                }
                WorkerOutcome::Evaluated { spawned_children }
            }
        }
    }

    /// Fetch bars and run the engine under the per-backtest timeout.
    async fn run_backtest(
        &self,
        strategy: &Strategy,
    ) -> Result<evolution_core::BacktestResult, BacktestError> {
        let end = self.config.window_end.unwrap_or_else(Utc::now);
        // Strategies starved of bars get a wider window on later passes.
        let lookback = self.config.lookback_days
            + self.config.lookback_growth_days * strategy.evolution_attempts.clamp(0, 4);
        let start = end - chrono::Duration::days(lookback);

        let mut series: Vec<BarSeries> = Vec::with_capacity(strategy.symbols.len());
        for symbol in &strategy.symbols {
            let bars = self
                .gateway
                .get_bars(symbol, self.config.interval, start, end)
                .await?;
            series.push(bars);
        }

        let request = BacktestRequest {
            rules: strategy.rules.clone(),
            series,
            seed: fingerprint_seed(&strategy.fingerprint),
        };
        let engine = BacktestEngine::new(self.backtest_config.clone());
        let cancel = Arc::clone(&self.shutdown);
        let limit = self.config.backtest_timeout_seconds;

        let task = tokio::task::spawn_blocking(move || engine.run(&request, &cancel));
        match tokio::time::timeout(Duration::from_secs(limit), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                tracing::error!("backtest task failed: {join_error}");
                Err(BacktestError::Timeout {
                    limit_seconds: limit,
                })
            }
            Err(_) => Err(BacktestError::Timeout {
                limit_seconds: limit,
            }),
        }
    }

    /// Persist the evaluation atomically and record the MCN rows. Regime
    /// snapshots are written on every non-discarded path.
    async fn persist_success(
        &self,
        strategy: &Strategy,
        fingerprint: &str,
        update: &StateUpdate,
        window_hash: &str,
    ) -> Result<()> {
        let row_update = EvaluationUpdate {
            status: update.status,
            score: Some(update.score),
            train_metrics: Some(update.train_metrics.clone()),
            test_metrics: Some(update.test_metrics.clone()),
            last_backtest_at: Some(Utc::now()),
            is_proposable: update.is_proposable,
            generalized: update.generalized,
            per_symbol_performance: update.per_symbol_performance.clone(),
            explanation_human: Some(update.explanation_human.clone()),
            risk_note: Some(update.risk_note.clone()),
            estimated_profit_min: update.estimated_profit_min,
            estimated_profit_max: update.estimated_profit_max,
            discard_reason: None,
        };
        self.repository
            .apply_evaluation(strategy.id, &row_update)
            .await?;

        self.memory
            .record_evaluation(
                fingerprint,
                window_hash,
                update.train_metrics.sharpe,
                update.test_metrics.sharpe,
            )
            .await?;
        for regime in &update.regime_scores {
            self.memory
                .record_regime(
                    fingerprint,
                    regime.regime,
                    window_hash,
                    &regime.metrics,
                    regime.passed,
                )
                .await?;
        }
        Ok(())
    }

    /// Mutation step for a candidate parent: propose children, reject
    /// known fingerprints within the generational depth, register and link
    /// the survivors, insert them as fresh experiments, and count the
    /// attempt against the parent.
    pub async fn run_mutation_step(&self, parent: &Strategy, parent_fp: &str) -> Result<usize> {
        let known = self
            .memory
            .descendants_within_depth(parent_fp, self.config.generational_depth)
            .await?;

        let target = self.mutator.max_children();
        let mut accepted = Vec::new();
        // Rejected candidates are replaced from fresh draws, so rejections
        // do not count against the fan-out.
        for round in 0..3u64 {
            if accepted.len() >= target {
                break;
            }
            let seed = mutation_seed(parent_fp, parent.evolution_attempts, round);
            let proposals =
                self.mutator
                    .propose(&parent.rules, seed, target - accepted.len());
            for child in proposals {
                if known.contains(&child.fingerprint)
                    || child.fingerprint == parent_fp
                    || accepted
                        .iter()
                        .any(|c: &strategy_mutator::ProposedChild| c.fingerprint == child.fingerprint)
                {
                    continue;
                }
                accepted.push(child);
            }
        }

        let mut spawned = 0;
        for child in &accepted {
            self.memory.register(&child.rules).await?;
            self.memory
                .link_child(parent_fp, &child.fingerprint, child.kind)
                .await?;
            let name = format!("{} v{}", parent.name, &child.fingerprint[..8]);
            self.repository
                .insert(&NewStrategy {
                    name,
                    description: format!(
                        "Derived from {} by {}",
                        parent.name,
                        child.kind.as_str()
                    ),
                    owner: parent.owner.clone(),
                    asset_class: parent.asset_class,
                    symbols: parent.symbols.clone(),
                    rules: child.rules.clone(),
                    created_at: None,
                })
                .await?;
            spawned += 1;
        }

        self.repository.record_attempt(parent.id).await?;
        tracing::info!(
            parent = parent.id,
            children = spawned,
            "mutation step complete"
        );
        Ok(spawned)
    }
}

enum WorkerOutcome {
    Evaluated { spawned_children: usize },
    Retried,
    Discarded,
    Skipped,
    Failed,
}

/// Deterministic per-strategy seed from the fingerprint prefix.
fn fingerprint_seed(fingerprint: &str) -> u64 {
    u64::from_str_radix(fingerprint.get(..16).unwrap_or("0"), 16).unwrap_or(0)
}

fn mutation_seed(fingerprint: &str, attempts: i64, round: u64) -> u64 {
    fingerprint_seed(fingerprint)
        .wrapping_add(attempts as u64)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(round)
}
