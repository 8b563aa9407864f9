//! Strategy Repository
//!
//! The only component that persists strategy state. Every write to a
//! strategy row is a single statement, so readers never observe a mix of
//! old and new fields; the scheduler's priority selection is one
//! deterministic query.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use evolution_core::{AssetClass, MetricRecord, RuleSet, StrategyStatus};

pub mod models;
pub use models::{EvaluationUpdate, NewStrategy, Strategy};

pub struct StrategyRepository {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct StrategyRow {
    id: i64,
    name: String,
    description: String,
    owner: String,
    asset_class: String,
    symbols_json: String,
    rules_json: String,
    fingerprint: String,
    status: String,
    score: Option<f64>,
    train_metrics_json: Option<String>,
    test_metrics_json: Option<String>,
    last_backtest_at: Option<DateTime<Utc>>,
    evolution_attempts: i64,
    is_proposable: i64,
    generalized: i64,
    per_symbol_json: Option<String>,
    explanation_human: Option<String>,
    risk_note: Option<String>,
    estimated_profit_min: Option<f64>,
    estimated_profit_max: Option<f64>,
    discard_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl StrategyRow {
    fn into_strategy(self) -> Result<Strategy> {
        let rules: RuleSet = serde_json::from_str(&self.rules_json)?;
        let symbols: Vec<String> = serde_json::from_str(&self.symbols_json)?;
        let train_metrics: Option<MetricRecord> = self
            .train_metrics_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let test_metrics: Option<MetricRecord> = self
            .test_metrics_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let per_symbol_performance: BTreeMap<String, MetricRecord> = self
            .per_symbol_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();

        Ok(Strategy {
            id: self.id,
            name: self.name,
            description: self.description,
            owner: self.owner,
            asset_class: AssetClass::parse(&self.asset_class)
                .ok_or_else(|| anyhow::anyhow!("bad asset class: {}", self.asset_class))?,
            symbols,
            rules,
            fingerprint: self.fingerprint,
            status: StrategyStatus::parse(&self.status)
                .ok_or_else(|| anyhow::anyhow!("bad status: {}", self.status))?,
            score: self.score,
            train_metrics,
            test_metrics,
            last_backtest_at: self.last_backtest_at,
            evolution_attempts: self.evolution_attempts,
            is_proposable: self.is_proposable != 0,
            generalized: self.generalized != 0,
            per_symbol_performance,
            explanation_human: self.explanation_human,
            risk_note: self.risk_note,
            estimated_profit_min: self.estimated_profit_min,
            estimated_profit_max: self.estimated_profit_max,
            discard_reason: self.discard_reason,
            created_at: self.created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, name, description, owner, asset_class, symbols_json, \
     rules_json, fingerprint, status, score, train_metrics_json, test_metrics_json, \
     last_backtest_at, evolution_attempts, is_proposable, generalized, per_symbol_json, \
     explanation_human, risk_note, estimated_profit_min, estimated_profit_max, \
     discard_reason, created_at";

impl StrategyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL DEFAULT '',
                asset_class TEXT NOT NULL,
                symbols_json TEXT NOT NULL,
                rules_json TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'experiment',
                score REAL,
                train_metrics_json TEXT,
                test_metrics_json TEXT,
                last_backtest_at TEXT,
                evolution_attempts INTEGER NOT NULL DEFAULT 0,
                is_proposable INTEGER NOT NULL DEFAULT 0,
                generalized INTEGER NOT NULL DEFAULT 0,
                per_symbol_json TEXT,
                explanation_human TEXT,
                risk_note TEXT,
                estimated_profit_min REAL,
                estimated_profit_max REAL,
                discard_reason TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_strategies_status ON strategies (status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a new strategy in its initial evaluation state.
    pub async fn insert(&self, new: &NewStrategy) -> Result<i64> {
        new.rules
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid rule set: {e}"))?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO strategies (
                name, description, owner, asset_class, symbols_json, rules_json,
                fingerprint, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'experiment', ?)
            RETURNING id",
        )
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.owner)
        .bind(new.asset_class.as_str())
        .bind(serde_json::to_string(&new.symbols)?)
        .bind(serde_json::to_string(&new.rules)?)
        .bind(new.rules.fingerprint())
        .bind(new.created_at.unwrap_or_else(Utc::now))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Strategy>> {
        let row: Option<StrategyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM strategies WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StrategyRow::into_strategy).transpose()
    }

    /// The scheduler's prioritized selection, as one deterministic query:
    ///
    /// 1. never backtested, oldest created first;
    /// 2. backtested before `stale_before`, oldest backtest first;
    /// 3. experiments, oldest created first;
    /// 4. candidates/proposables, oldest backtest first.
    ///
    /// Discarded strategies are excluded; ids break remaining ties so the
    /// ordering is total.
    pub async fn select_backtest_batch(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Strategy>> {
        let rows: Vec<StrategyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM strategies
             WHERE status != 'discarded'
             ORDER BY
                 CASE
                     WHEN last_backtest_at IS NULL THEN 0
                     WHEN last_backtest_at < ?1 THEN 1
                     WHEN status = 'experiment' THEN 2
                     ELSE 3
                 END,
                 CASE
                     WHEN last_backtest_at IS NULL THEN created_at
                     WHEN last_backtest_at < ?1 THEN last_backtest_at
                     WHEN status = 'experiment' THEN created_at
                     ELSE last_backtest_at
                 END ASC,
                 id ASC
             LIMIT ?2"
        ))
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StrategyRow::into_strategy).collect()
    }

    /// Apply one evaluation outcome atomically. A single UPDATE writes
    /// every evaluation field; the guard keeps discarded rows terminal.
    pub async fn apply_evaluation(&self, id: i64, update: &EvaluationUpdate) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE strategies SET
                status = ?,
                score = ?,
                train_metrics_json = ?,
                test_metrics_json = ?,
                last_backtest_at = ?,
                is_proposable = ?,
                generalized = ?,
                per_symbol_json = ?,
                explanation_human = ?,
                risk_note = ?,
                estimated_profit_min = ?,
                estimated_profit_max = ?,
                discard_reason = ?
             WHERE id = ? AND status != 'discarded'",
        )
        .bind(update.status.as_str())
        .bind(update.score)
        .bind(
            update
                .train_metrics
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(
            update
                .test_metrics
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(update.last_backtest_at)
        .bind(update.is_proposable as i64)
        .bind(update.generalized as i64)
        .bind(serde_json::to_string(&update.per_symbol_performance)?)
        .bind(&update.explanation_human)
        .bind(&update.risk_note)
        .bind(update.estimated_profit_min)
        .bind(update.estimated_profit_max)
        .bind(&update.discard_reason)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Bump the attempt counter only; the rest of the row is untouched.
    pub async fn record_attempt(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE strategies SET evolution_attempts = evolution_attempts + 1 WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Discard with a recorded reason. Terminal.
    pub async fn discard(&self, id: i64, reason: &str) -> Result<()> {
        tracing::debug!(strategy = id, reason, "marking strategy discarded");
        sqlx::query(
            "UPDATE strategies SET status = 'discarded', is_proposable = 0, discard_reason = ?
             WHERE id = ?",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recommendation read surface: proposable strategies by score
    /// descending with their metrics, explanation, risk note and estimated
    /// profit range. Discarded strategies are invisible here by definition.
    pub async fn top_proposable(&self, limit: i64) -> Result<Vec<Strategy>> {
        let rows: Vec<StrategyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM strategies
             WHERE status = 'proposable'
             ORDER BY score DESC, id ASC
             LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StrategyRow::into_strategy).collect()
    }

    /// Population counts per status, for the monitoring worker.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM strategies GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every strategy row, ordered by id. Used by replay-style tests.
    pub async fn all(&self) -> Result<Vec<Strategy>> {
        let rows: Vec<StrategyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM strategies ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StrategyRow::into_strategy).collect()
    }
}

#[cfg(test)]
mod tests;
