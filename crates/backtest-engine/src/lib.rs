//! Backtest Engine
//!
//! Deterministic replay of a strategy rule set over historical bar series
//! with a calendar train/test split. Given the same rule set, symbol list,
//! window, interval, cost model and seed, the result is byte-identical
//! across runs: all floating-point reductions run left-to-right in
//! chronological order at double precision.

pub mod engine;
pub mod indicators;
pub mod metrics;


pub use engine::{BacktestConfig, BacktestEngine, BacktestRequest};
pub use metrics::metric_record;
