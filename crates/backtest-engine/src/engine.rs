use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use evolution_core::{
    BacktestError, BacktestResult, BarSeries, EquityPoint, ExitReason, RegimeTag, RuleSet,
    TradeRecord,
};
use market_data::classify_regimes;

use crate::indicators::FeatureFrame;
use crate::metrics::metric_record;

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Calendar fraction of the window assigned to the train segment.
    pub train_ratio: f64,
    /// Per-side transaction cost in basis points.
    pub cost_bps: f64,
    /// Minimum bars each segment must hold, per symbol.
    pub min_segment_bars: usize,
    /// Maximum tolerated missing-bar fraction per symbol.
    pub max_gap_fraction: f64,
    /// Cancellation flag is polled every this many bars.
    pub cancel_check_every: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.7,
            cost_bps: 10.0,
            min_segment_bars: 50,
            max_gap_fraction: 0.15,
            cancel_check_every: 256,
        }
    }
}

/// One backtest work unit: a rule set replayed over pre-fetched series.
#[derive(Debug, Clone)]
pub struct BacktestRequest {
    pub rules: RuleSet,
    pub series: Vec<BarSeries>,
    pub seed: u64,
}

pub struct BacktestEngine {
    config: BacktestConfig,
}

struct OpenPosition {
    entry_index: usize,
    entry_price: f64,
}

/// Per-symbol replay output before aggregation.
struct SymbolReplay {
    symbol: String,
    timestamps: Vec<DateTime<Utc>>,
    /// Multiplicative equity factor of each bar (1.0 = flat).
    factors: Vec<f64>,
    trades: Vec<TradeRecord>,
    split_index: usize,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    /// Replay the rule set over every symbol and aggregate.
    ///
    /// Deterministic: symbols are processed in sorted order, reductions are
    /// chronological left-to-right, and the run id derives from the inputs.
    pub fn run(
        &self,
        request: &BacktestRequest,
        cancel: &AtomicBool,
    ) -> Result<BacktestResult, BacktestError> {
        request
            .rules
            .validate()
            .map_err(|e| BacktestError::MalformedRuleSet(e.to_string()))?;

        if request.series.is_empty() {
            return Err(BacktestError::InsufficientBars {
                segment: "train",
                have: 0,
                need: self.config.min_segment_bars,
            });
        }

        let mut series: Vec<&BarSeries> = request.series.iter().collect();
        series.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        for s in &series {
            let fraction = s.gap_fraction();
            if fraction > self.config.max_gap_fraction {
                return Err(BacktestError::DataGapExceedsThreshold {
                    symbol: s.symbol.clone(),
                    fraction,
                    limit: self.config.max_gap_fraction,
                });
            }
        }

        let start = series.iter().map(|s| s.start).min().expect("non-empty");
        let end = series.iter().map(|s| s.end).max().expect("non-empty");
        let total_secs = (end - start).num_seconds().max(0);
        let split_ts = start + Duration::seconds((total_secs as f64 * self.config.train_ratio) as i64);

        // Segment sizing is enforced per symbol before any replay starts.
        for s in &series {
            let split_index = s.bars.partition_point(|b| b.timestamp < split_ts);
            let train = split_index;
            let test = s.bars.len() - split_index;
            if train < self.config.min_segment_bars {
                return Err(BacktestError::InsufficientBars {
                    segment: "train",
                    have: train,
                    need: self.config.min_segment_bars,
                });
            }
            if test < self.config.min_segment_bars {
                return Err(BacktestError::InsufficientBars {
                    segment: "test",
                    have: test,
                    need: self.config.min_segment_bars,
                });
            }
        }

        let cost_rate = self.config.cost_bps / 10_000.0;
        let mut bars_processed: usize = 0;
        let mut replays = Vec::with_capacity(series.len());
        for &s in &series {
            let split_index = s.bars.partition_point(|b| b.timestamp < split_ts);
            replays.push(self.replay_symbol(
                &request.rules,
                s,
                split_index,
                cost_rate,
                cancel,
                &mut bars_processed,
            )?);
        }

        // Per-symbol test metrics feed per_symbol_performance.
        let interval = series[0].interval;
        let mut per_symbol_test = BTreeMap::new();
        for replay in &replays {
            let test_trades: Vec<TradeRecord> = replay
                .trades
                .iter()
                .filter(|t| t.entry_index >= replay.split_index)
                .cloned()
                .collect();
            let test_returns: Vec<f64> = replay.factors[replay.split_index..]
                .iter()
                .map(|f| f - 1.0)
                .collect();
            per_symbol_test.insert(
                replay.symbol.clone(),
                metric_record(&test_trades, &test_returns, interval),
            );
        }

        // Unified timeline over the union of bar timestamps.
        let mut timeline: Vec<DateTime<Utc>> = replays
            .iter()
            .flat_map(|r| r.timestamps.iter().copied())
            .collect();
        timeline.sort();
        timeline.dedup();
        let agg_split = timeline.partition_point(|ts| *ts < split_ts);

        // Equal-weight aggregation of per-symbol equity curves, each
        // normalized to 1.0 and carried forward across its holes.
        let equity_by_symbol: Vec<Vec<f64>> = replays
            .iter()
            .map(|r| {
                let mut cursor = 0usize;
                let mut equity = 1.0f64;
                timeline
                    .iter()
                    .map(|ts| {
                        while cursor < r.timestamps.len() && r.timestamps[cursor] <= *ts {
                            equity *= r.factors[cursor];
                            cursor += 1;
                        }
                        equity
                    })
                    .collect()
            })
            .collect();

        let n_symbols = replays.len() as f64;
        let aggregate_equity: Vec<f64> = (0..timeline.len())
            .map(|t| equity_by_symbol.iter().map(|e| e[t]).sum::<f64>() / n_symbols)
            .collect();

        let mut aggregate_returns = Vec::with_capacity(timeline.len());
        for t in 0..timeline.len() {
            let prev = if t == 0 { 1.0 } else { aggregate_equity[t - 1] };
            let r = if prev != 0.0 {
                aggregate_equity[t] / prev - 1.0
            } else {
                0.0
            };
            aggregate_returns.push(r);
        }

        let mut equity_curve = Vec::with_capacity(timeline.len());
        let mut peak = 1.0f64;
        for (t, equity) in aggregate_equity.iter().enumerate() {
            if *equity > peak {
                peak = *equity;
            }
            let drawdown = if peak > 0.0 { (peak - equity) / peak } else { 0.0 };
            equity_curve.push(EquityPoint {
                bar_index: t,
                equity: *equity,
                drawdown,
            });
        }

        // Aggregate trade log, chronological with symbol tiebreak.
        let mut trades: Vec<TradeRecord> = replays.iter().flat_map(|r| r.trades.clone()).collect();
        trades.sort_by(|a, b| {
            a.entry_time
                .cmp(&b.entry_time)
                .then_with(|| a.symbol.cmp(&b.symbol))
                .then(a.entry_index.cmp(&b.entry_index))
        });

        let train_trades: Vec<TradeRecord> = trades
            .iter()
            .filter(|t| t.entry_time < split_ts)
            .cloned()
            .collect();
        let test_trades: Vec<TradeRecord> = trades
            .iter()
            .filter(|t| t.entry_time >= split_ts)
            .cloned()
            .collect();

        let train = metric_record(&train_trades, &aggregate_returns[..agg_split], interval);
        let test = metric_record(&test_trades, &aggregate_returns[agg_split..], interval);

        let test_bar_returns = aggregate_returns[agg_split..].to_vec();
        let test_bar_regimes = self.test_regimes(series[0], &timeline[agg_split..]);

        let window_hash = window_hash(&series);
        let run_id = run_id(&request.rules, &window_hash, request.seed);
        tracing::debug!(
            run_id,
            symbols = series.len(),
            trades = trades.len(),
            "backtest replay complete"
        );

        Ok(BacktestResult {
            run_id,
            window_hash,
            seed: request.seed,
            train,
            test,
            per_symbol_test,
            equity_curve,
            trades,
            test_bar_returns,
            test_bar_regimes,
            interval,
            train_bars: agg_split,
            test_bars: timeline.len() - agg_split,
        })
    }

    /// Replay one symbol. The position is force-closed at each segment
    /// boundary so train and test trades never interleave; entries are not
    /// taken on a segment's final bar.
    fn replay_symbol(
        &self,
        rules: &RuleSet,
        series: &BarSeries,
        split_index: usize,
        cost_rate: f64,
        cancel: &AtomicBool,
        bars_processed: &mut usize,
    ) -> Result<SymbolReplay, BacktestError> {
        let bars = &series.bars;
        let frame = FeatureFrame::build(rules, bars);

        let mut factors = vec![1.0f64; bars.len()];
        let mut trades = Vec::new();
        let mut position: Option<OpenPosition> = None;

        for i in 0..bars.len() {
            *bars_processed += 1;
            if *bars_processed % self.config.cancel_check_every == 0
                && cancel.load(Ordering::Relaxed)
            {
                return Err(BacktestError::Cancelled);
            }

            let segment_last = i + 1 == split_index || i + 1 == bars.len();
            let bar = &bars[i];

            if let Some(pos) = &position {
                let prev_close = bars[i - 1].close;
                let stop_price = rules.stop_loss_pct.map(|p| pos.entry_price * (1.0 - p));
                let take_price = rules.take_profit_pct.map(|p| pos.entry_price * (1.0 + p));

                let exit = if stop_price.is_some_and(|sp| bar.low <= sp) {
                    Some((stop_price.unwrap(), ExitReason::StopLoss))
                } else if take_price.is_some_and(|tp| bar.high >= tp) {
                    Some((take_price.unwrap(), ExitReason::TakeProfit))
                } else if rules.exit.iter().any(|p| frame.eval(p, bars, i)) {
                    Some((bar.close, ExitReason::Rule))
                } else if rules
                    .max_hold_bars
                    .is_some_and(|h| (i - pos.entry_index) as u32 >= h)
                {
                    Some((bar.close, ExitReason::MaxHold))
                } else if segment_last {
                    Some((bar.close, ExitReason::WindowEnd))
                } else {
                    None
                };

                match exit {
                    Some((exit_price, reason)) => {
                        factors[i] = exit_price / prev_close * (1.0 - cost_rate);
                        let pos = position.take().expect("position checked above");
                        let return_pct = exit_price / pos.entry_price
                            * (1.0 - cost_rate)
                            * (1.0 - cost_rate)
                            - 1.0;
                        trades.push(TradeRecord {
                            symbol: series.symbol.clone(),
                            entry_index: pos.entry_index,
                            exit_index: i,
                            entry_time: bars[pos.entry_index].timestamp,
                            exit_time: bar.timestamp,
                            entry_price: pos.entry_price,
                            exit_price,
                            return_pct,
                            cost_pct: 1.0 - (1.0 - cost_rate) * (1.0 - cost_rate),
                            exit_reason: reason,
                        });
                    }
                    None => {
                        factors[i] = bar.close / prev_close;
                    }
                }
            } else if !segment_last && rules.entry.iter().all(|p| frame.eval(p, bars, i)) {
                // Enter at this bar's close; exposure starts next bar.
                position = Some(OpenPosition {
                    entry_index: i,
                    entry_price: bar.close,
                });
                factors[i] = 1.0 - cost_rate;
            }
        }

        Ok(SymbolReplay {
            symbol: series.symbol.clone(),
            timestamps: bars.iter().map(|b| b.timestamp).collect(),
            factors,
            trades,
            split_index,
        })
    }

    /// Tag each test-timeline point with the regime of the primary symbol
    /// at its latest bar at or before that point.
    fn test_regimes(&self, primary: &BarSeries, test_timeline: &[DateTime<Utc>]) -> Vec<RegimeTag> {
        let tags = classify_regimes(&primary.bars);
        let timestamps: Vec<DateTime<Utc>> = primary.bars.iter().map(|b| b.timestamp).collect();
        test_timeline
            .iter()
            .map(|ts| {
                let idx = timestamps.partition_point(|t| t <= ts);
                if idx == 0 {
                    tags.first().copied().unwrap_or(RegimeTag::Bull)
                } else {
                    tags[idx - 1]
                }
            })
            .collect()
    }
}

fn window_hash(series: &[&BarSeries]) -> String {
    let mut hasher = Sha256::new();
    for s in series {
        hasher.update(s.symbol.as_bytes());
        hasher.update(s.interval.as_str().as_bytes());
        hasher.update(s.start.timestamp().to_be_bytes());
        hasher.update(s.end.timestamp().to_be_bytes());
        hasher.update((s.bars.len() as u64).to_be_bytes());
        for bar in &s.bars {
            hasher.update(bar.timestamp.timestamp().to_be_bytes());
            hasher.update(bar.close.to_bits().to_be_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

fn run_id(rules: &RuleSet, window_hash: &str, seed: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rules.fingerprint().as_bytes());
    hasher.update(window_hash.as_bytes());
    hasher.update(seed.to_be_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}
