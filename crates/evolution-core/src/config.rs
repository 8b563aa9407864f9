use std::sync::atomic::{AtomicU64, Ordering};

/// Frozen evaluation thresholds. All values are configuration and must be
/// reproducible in tests; the score formula consuming them is a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationThresholds {
    /// Maximum tolerated train-minus-test Sharpe gap.
    pub g_max: f64,
    /// Minimum test Sharpe before a strategy is discarded outright.
    pub s_min_test: f64,
    pub t_proposable: f64,
    pub t_candidate: f64,
    /// Minimum closed test trades for promotion.
    pub n_min: u32,
    /// Minimum test win rate for promotion.
    pub w_min: f64,
    /// Minimum passing regimes for promotion.
    pub r_min: usize,
    /// Evolution attempt limit; data-quality failures beyond it discard.
    pub a_max: i64,
    /// Distinct profitable symbols required for the generalized flag.
    pub k_min_symbols: usize,
}

impl Default for EvaluationThresholds {
    fn default() -> Self {
        Self {
            g_max: 0.6,
            s_min_test: 0.3,
            t_proposable: 0.70,
            t_candidate: 0.40,
            n_min: 50,
            w_min: 0.55,
            r_min: 3,
            a_max: 5,
            k_min_symbols: 3,
        }
    }
}

pub const MIN_CONCURRENT_BACKTESTS: u64 = 1;
pub const MAX_CONCURRENT_BACKTESTS: u64 = 20;
pub const MIN_WORKER_INTERVAL_SECONDS: u64 = 30;

/// Live-tunable scheduler parameters published by the admin control plane.
///
/// Values are read once at each tick boundary; an in-flight tick is never
/// reconfigured. Setters clamp to the documented ranges.
#[derive(Debug)]
pub struct AdminControls {
    max_concurrent_backtests: AtomicU64,
    evolution_interval_seconds: AtomicU64,
    monitoring_interval_seconds: AtomicU64,
}

impl Default for AdminControls {
    fn default() -> Self {
        Self {
            max_concurrent_backtests: AtomicU64::new(4),
            evolution_interval_seconds: AtomicU64::new(300),
            monitoring_interval_seconds: AtomicU64::new(300),
        }
    }
}

impl AdminControls {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let controls = Self::default();
        if let Some(v) = read_env_u64("MAX_CONCURRENT_BACKTESTS") {
            controls.set_max_concurrent_backtests(v);
        }
        if let Some(v) = read_env_u64("EVOLUTION_INTERVAL_SECONDS") {
            controls.set_evolution_interval_seconds(v);
        }
        if let Some(v) = read_env_u64("MONITORING_WORKER_INTERVAL_SECONDS") {
            controls.set_monitoring_interval_seconds(v);
        }
        controls
    }

    pub fn max_concurrent_backtests(&self) -> usize {
        self.max_concurrent_backtests.load(Ordering::Relaxed) as usize
    }

    pub fn evolution_interval_seconds(&self) -> u64 {
        self.evolution_interval_seconds.load(Ordering::Relaxed)
    }

    pub fn monitoring_interval_seconds(&self) -> u64 {
        self.monitoring_interval_seconds.load(Ordering::Relaxed)
    }

    pub fn set_max_concurrent_backtests(&self, value: u64) {
        let clamped = value.clamp(MIN_CONCURRENT_BACKTESTS, MAX_CONCURRENT_BACKTESTS);
        if clamped != value {
            tracing::warn!(
                requested = value,
                applied = clamped,
                "max_concurrent_backtests clamped to valid range"
            );
        }
        self.max_concurrent_backtests
            .store(clamped, Ordering::Relaxed);
    }

    pub fn set_evolution_interval_seconds(&self, value: u64) {
        let clamped = value.max(MIN_WORKER_INTERVAL_SECONDS);
        self.evolution_interval_seconds
            .store(clamped, Ordering::Relaxed);
    }

    pub fn set_monitoring_interval_seconds(&self, value: u64) {
        let clamped = value.max(MIN_WORKER_INTERVAL_SECONDS);
        self.monitoring_interval_seconds
            .store(clamped, Ordering::Relaxed);
    }
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
