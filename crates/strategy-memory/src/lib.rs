//! MCN Memory
//!
//! Content-addressed store of strategy fingerprints, lineage edges and
//! per-regime performance snapshots. Supplies novelty and robustness
//! scores. Append-mostly: only regime snapshots and the train/test Sharpe
//! pair are overwritten, and only by newer evaluations.

use std::collections::{BTreeSet, HashSet, VecDeque};

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

use evolution_core::{MetricRecord, MutationKind, RegimeTag, RuleSet};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("lineage cycle detected linking {parent} -> {child}")]
    CycleDetected { parent: String, child: String },

    #[error("fingerprint collision for {fingerprint}: conflicting rule sets")]
    FingerprintConflict { fingerprint: String },

    #[error("fingerprint not registered: {0}")]
    UnknownFingerprint(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// How many recent fingerprints novelty compares against.
    pub novelty_neighborhood: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            novelty_neighborhood: 256,
        }
    }
}

/// A stored regime snapshot.
#[derive(Debug, Clone)]
pub struct RegimeSnapshot {
    pub regime: RegimeTag,
    pub metrics: MetricRecord,
    pub passed: bool,
    pub window_hash: String,
}

pub struct StrategyMemory {
    pool: SqlitePool,
    config: MemoryConfig,
}

impl StrategyMemory {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            config: MemoryConfig::default(),
        }
    }

    pub fn with_config(pool: SqlitePool, config: MemoryConfig) -> Self {
        Self { pool, config }
    }

    pub async fn init_tables(&self) -> Result<(), MemoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mcn_fingerprints (
                fingerprint TEXT PRIMARY KEY,
                rule_canonical TEXT NOT NULL,
                features_json TEXT NOT NULL,
                registered_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mcn_lineage (
                parent_fp TEXT NOT NULL,
                child_fp TEXT NOT NULL,
                mutation_kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (parent_fp, child_fp)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mcn_regime_snapshots (
                fingerprint TEXT NOT NULL,
                regime TEXT NOT NULL,
                window_hash TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                passed INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (fingerprint, regime)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mcn_evaluations (
                fingerprint TEXT PRIMARY KEY,
                window_hash TEXT NOT NULL,
                train_sharpe REAL,
                test_sharpe REAL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Register a rule set under its fingerprint. Idempotent: re-registering
    /// the same rules is a no-op; the same fingerprint with different
    /// canonical rules is a conflict.
    pub async fn register(&self, rules: &RuleSet) -> Result<String, MemoryError> {
        let fingerprint = rules.fingerprint();
        let canonical = rules.canonical();

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT rule_canonical FROM mcn_fingerprints WHERE fingerprint = ?")
                .bind(&fingerprint)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((stored,)) = existing {
            if stored == canonical {
                return Ok(fingerprint);
            }
            tracing::error!(%fingerprint, "conflicting rule sets under one fingerprint");
            return Err(MemoryError::FingerprintConflict { fingerprint });
        }

        let features: Vec<String> = rules.feature_set().into_iter().collect();
        sqlx::query(
            "INSERT INTO mcn_fingerprints (fingerprint, rule_canonical, features_json, registered_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&fingerprint)
        .bind(&canonical)
        .bind(serde_json::to_string(&features)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(fingerprint)
    }

    pub async fn is_registered(&self, fingerprint: &str) -> Result<bool, MemoryError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM mcn_fingerprints WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Link a child to its parent. The lineage graph must stay a DAG: a
    /// self-link or a link that would close a cycle is rejected.
    pub async fn link_child(
        &self,
        parent_fp: &str,
        child_fp: &str,
        kind: MutationKind,
    ) -> Result<(), MemoryError> {
        if parent_fp == child_fp {
            return Err(MemoryError::CycleDetected {
                parent: parent_fp.to_string(),
                child: child_fp.to_string(),
            });
        }
        for fp in [parent_fp, child_fp] {
            if !self.is_registered(fp).await? {
                return Err(MemoryError::UnknownFingerprint(fp.to_string()));
            }
        }

        // Walk the parent's ancestry; finding the child there means the new
        // edge would close a cycle.
        let mut queue = VecDeque::from([parent_fp.to_string()]);
        let mut seen = HashSet::new();
        while let Some(fp) = queue.pop_front() {
            if !seen.insert(fp.clone()) {
                continue;
            }
            let parents: Vec<(String,)> =
                sqlx::query_as("SELECT parent_fp FROM mcn_lineage WHERE child_fp = ?")
                    .bind(&fp)
                    .fetch_all(&self.pool)
                    .await?;
            for (ancestor,) in parents {
                if ancestor == child_fp {
                    tracing::warn!(parent = parent_fp, child = child_fp, "lineage cycle rejected");
                    return Err(MemoryError::CycleDetected {
                        parent: parent_fp.to_string(),
                        child: child_fp.to_string(),
                    });
                }
                queue.push_back(ancestor);
            }
        }

        sqlx::query(
            "INSERT OR IGNORE INTO mcn_lineage (parent_fp, child_fp, mutation_kind, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(parent_fp)
        .bind(child_fp)
        .bind(kind.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store a regime snapshot, overwriting the prior one for this
    /// (fingerprint, regime). Last writer wins under the same window hash.
    pub async fn record_regime(
        &self,
        fingerprint: &str,
        regime: RegimeTag,
        window_hash: &str,
        metrics: &MetricRecord,
        passed: bool,
    ) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT OR REPLACE INTO mcn_regime_snapshots
             (fingerprint, regime, window_hash, metrics_json, passed, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(fingerprint)
        .bind(regime.as_str())
        .bind(window_hash)
        .bind(serde_json::to_string(metrics)?)
        .bind(passed as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store the latest train/test Sharpe pair; robustness reads it back so
    /// the score stays a pure function of stored rows.
    pub async fn record_evaluation(
        &self,
        fingerprint: &str,
        window_hash: &str,
        train_sharpe: Option<f64>,
        test_sharpe: Option<f64>,
    ) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT OR REPLACE INTO mcn_evaluations
             (fingerprint, window_hash, train_sharpe, test_sharpe, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(fingerprint)
        .bind(window_hash)
        .bind(train_sharpe)
        .bind(test_sharpe)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn regime_snapshots(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<RegimeSnapshot>, MemoryError> {
        let rows: Vec<(String, String, i64, String)> = sqlx::query_as(
            "SELECT regime, metrics_json, passed, window_hash
             FROM mcn_regime_snapshots WHERE fingerprint = ? ORDER BY regime",
        )
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for (regime, metrics_json, passed, window_hash) in rows {
            let Some(regime) = RegimeTag::parse(&regime) else {
                continue;
            };
            snapshots.push(RegimeSnapshot {
                regime,
                metrics: serde_json::from_str(&metrics_json)?,
                passed: passed != 0,
                window_hash,
            });
        }
        Ok(snapshots)
    }

    /// Novelty in [0, 1]: one minus the maximum Jaccard similarity between
    /// this fingerprint's rule-feature set and any other registered
    /// fingerprint in the configured neighborhood.
    pub async fn novelty(&self, fingerprint: &str) -> Result<f64, MemoryError> {
        let target: Option<(String,)> =
            sqlx::query_as("SELECT features_json FROM mcn_fingerprints WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        let Some((features_json,)) = target else {
            return Err(MemoryError::UnknownFingerprint(fingerprint.to_string()));
        };
        let target: BTreeSet<String> =
            serde_json::from_str::<Vec<String>>(&features_json)?.into_iter().collect();

        let neighbors: Vec<(String,)> = sqlx::query_as(
            "SELECT features_json FROM mcn_fingerprints
             WHERE fingerprint != ?
             ORDER BY registered_at DESC, fingerprint
             LIMIT ?",
        )
        .bind(fingerprint)
        .bind(self.config.novelty_neighborhood)
        .fetch_all(&self.pool)
        .await?;

        let mut max_similarity = 0.0f64;
        for (neighbor_json,) in neighbors {
            let neighbor: BTreeSet<String> =
                serde_json::from_str::<Vec<String>>(&neighbor_json)?.into_iter().collect();
            max_similarity = max_similarity.max(jaccard(&target, &neighbor));
        }
        Ok((1.0 - max_similarity).clamp(0.0, 1.0))
    }

    /// Robustness in [0, 100]: the equally-weighted regime pass fraction
    /// (missing regimes count as fail), scaled by the clipped test/train
    /// Sharpe ratio, normalized back to 100.
    pub async fn robustness(&self, fingerprint: &str) -> Result<f64, MemoryError> {
        let snapshots = self.regime_snapshots(fingerprint).await?;
        let pass_count = RegimeTag::ALL
            .iter()
            .filter(|tag| snapshots.iter().any(|s| s.regime == **tag && s.passed))
            .count();
        let pass_fraction = pass_count as f64 / RegimeTag::ALL.len() as f64;

        let evaluation: Option<(Option<f64>, Option<f64>)> =
            sqlx::query_as("SELECT train_sharpe, test_sharpe FROM mcn_evaluations WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;

        let ratio = match evaluation {
            Some((Some(train), Some(test))) if train > 0.0 => (test / train).clamp(0.0, 1.5),
            Some((_, Some(test))) if test > 0.0 => 1.5,
            _ => 0.0,
        };

        Ok(pass_fraction * (ratio / 1.5) * 100.0)
    }

    /// Ancestry path of mutation kinds, walking from this fingerprint back
    /// to its root ancestor (nearest edge first).
    pub async fn lineage(&self, fingerprint: &str) -> Result<Vec<MutationKind>, MemoryError> {
        let mut path = Vec::new();
        let mut current = fingerprint.to_string();
        let mut seen = HashSet::new();

        while seen.insert(current.clone()) {
            let edge: Option<(String, String)> = sqlx::query_as(
                "SELECT parent_fp, mutation_kind FROM mcn_lineage
                 WHERE child_fp = ? ORDER BY created_at, parent_fp LIMIT 1",
            )
            .bind(&current)
            .fetch_optional(&self.pool)
            .await?;

            match edge {
                Some((parent, kind)) => {
                    if let Some(kind) = MutationKind::parse(&kind) {
                        path.push(kind);
                    }
                    current = parent;
                }
                None => break,
            }
        }
        Ok(path)
    }

    /// Fingerprints reachable from `parent_fp` by descending at most
    /// `depth` lineage edges. Used by the mutation acceptance check.
    pub async fn descendants_within_depth(
        &self,
        parent_fp: &str,
        depth: usize,
    ) -> Result<HashSet<String>, MemoryError> {
        let mut out = HashSet::new();
        let mut frontier = vec![parent_fp.to_string()];
        for _ in 0..depth {
            let mut next = Vec::new();
            for fp in &frontier {
                let children: Vec<(String,)> =
                    sqlx::query_as("SELECT child_fp FROM mcn_lineage WHERE parent_fp = ?")
                        .bind(fp)
                        .fetch_all(&self.pool)
                        .await?;
                for (child,) in children {
                    if out.insert(child.clone()) {
                        next.push(child);
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        Ok(out)
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}
