use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use thiserror::Error;

/// Bounds every lookback period must respect.
pub const MIN_PERIOD: u32 = 2;
pub const MAX_PERIOD: u32 = 400;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("rule set has no entry predicate")]
    NoEntryRule,
    #[error("rule set has no exit condition")]
    NoExitCondition,
    #[error("indicator period {0} outside [{MIN_PERIOD}, {MAX_PERIOD}]")]
    PeriodOutOfRange(u32),
    #[error("non-finite numeric parameter: {0}")]
    NonFiniteParameter(String),
}

/// Output shape of an indicator. Substitution is only legal within a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Same scale as price (moving averages, channels).
    PriceLevel,
    /// Bounded or zero-centered oscillator.
    Oscillator,
    /// Non-negative range measure.
    Range,
}

/// Closed indicator set available to rule predicates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Indicator {
    Sma { period: u32 },
    Ema { period: u32 },
    Rsi { period: u32 },
    Atr { period: u32 },
    Momentum { period: u32 },
    HighestHigh { period: u32 },
    LowestLow { period: u32 },
}

impl Indicator {
    pub fn period(&self) -> u32 {
        match self {
            Indicator::Sma { period }
            | Indicator::Ema { period }
            | Indicator::Rsi { period }
            | Indicator::Atr { period }
            | Indicator::Momentum { period }
            | Indicator::HighestHigh { period }
            | Indicator::LowestLow { period } => *period,
        }
    }

    pub fn with_period(&self, period: u32) -> Indicator {
        match self {
            Indicator::Sma { .. } => Indicator::Sma { period },
            Indicator::Ema { .. } => Indicator::Ema { period },
            Indicator::Rsi { .. } => Indicator::Rsi { period },
            Indicator::Atr { .. } => Indicator::Atr { period },
            Indicator::Momentum { .. } => Indicator::Momentum { period },
            Indicator::HighestHigh { .. } => Indicator::HighestHigh { period },
            Indicator::LowestLow { .. } => Indicator::LowestLow { period },
        }
    }

    pub fn output_shape(&self) -> OutputShape {
        match self {
            Indicator::Sma { .. }
            | Indicator::Ema { .. }
            | Indicator::HighestHigh { .. }
            | Indicator::LowestLow { .. } => OutputShape::PriceLevel,
            Indicator::Rsi { .. } | Indicator::Momentum { .. } => OutputShape::Oscillator,
            Indicator::Atr { .. } => OutputShape::Range,
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Indicator::Sma { .. } => "sma",
            Indicator::Ema { .. } => "ema",
            Indicator::Rsi { .. } => "rsi",
            Indicator::Atr { .. } => "atr",
            Indicator::Momentum { .. } => "momentum",
            Indicator::HighestHigh { .. } => "highest_high",
            Indicator::LowestLow { .. } => "lowest_low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl PriceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceField::Open => "open",
            PriceField::High => "high",
            PriceField::Low => "low",
            PriceField::Close => "close",
            PriceField::Volume => "volume",
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operand {
    Price { field: PriceField },
    Indicator { indicator: Indicator },
    Const { value: f64 },
}

/// Binary predicate over two operands. Cross predicates compare the
/// previous and current bar, the rest only the current bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmp", rename_all = "snake_case")]
pub enum Predicate {
    Gt { left: Operand, right: Operand },
    Lt { left: Operand, right: Operand },
    CrossesAbove { left: Operand, right: Operand },
    CrossesBelow { left: Operand, right: Operand },
}

impl Predicate {
    pub fn operands(&self) -> (&Operand, &Operand) {
        match self {
            Predicate::Gt { left, right }
            | Predicate::Lt { left, right }
            | Predicate::CrossesAbove { left, right }
            | Predicate::CrossesBelow { left, right } => (left, right),
        }
    }

    pub fn operands_mut(&mut self) -> (&mut Operand, &mut Operand) {
        match self {
            Predicate::Gt { left, right }
            | Predicate::Lt { left, right }
            | Predicate::CrossesAbove { left, right }
            | Predicate::CrossesBelow { left, right } => (left, right),
        }
    }

    pub fn comparator(&self) -> &'static str {
        match self {
            Predicate::Gt { .. } => "gt",
            Predicate::Lt { .. } => "lt",
            Predicate::CrossesAbove { .. } => "crosses_above",
            Predicate::CrossesBelow { .. } => "crosses_below",
        }
    }
}

/// Structured, deterministic description of a strategy's trading rules.
///
/// Entry predicates are AND-joined, exit predicates OR-joined. Stops, take
/// profits and the hold limit are additional exit conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub entry: Vec<Predicate>,
    pub exit: Vec<Predicate>,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub max_hold_bars: Option<u32>,
}

impl RuleSet {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.entry.is_empty() {
            return Err(RuleError::NoEntryRule);
        }
        let has_exit = !self.exit.is_empty()
            || self.stop_loss_pct.is_some()
            || self.take_profit_pct.is_some()
            || self.max_hold_bars.is_some();
        if !has_exit {
            return Err(RuleError::NoExitCondition);
        }
        for pred in self.entry.iter().chain(self.exit.iter()) {
            let (l, r) = pred.operands();
            for op in [l, r] {
                match op {
                    Operand::Indicator { indicator } => {
                        let p = indicator.period();
                        if !(MIN_PERIOD..=MAX_PERIOD).contains(&p) {
                            return Err(RuleError::PeriodOutOfRange(p));
                        }
                    }
                    Operand::Const { value } => {
                        if !value.is_finite() {
                            return Err(RuleError::NonFiniteParameter(format!("{value}")));
                        }
                    }
                    Operand::Price { .. } => {}
                }
            }
        }
        for (name, v) in [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
        ] {
            if let Some(v) = v {
                if !v.is_finite() || v <= 0.0 {
                    return Err(RuleError::NonFiniteParameter(name.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Canonical textual form: a fixed-order tree walk with floats rendered
    /// at 6 decimal places. Structurally identical rule sets canonicalize
    /// identically regardless of construction order of optional fields.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        out.push_str("entry[");
        for (i, p) in self.entry.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_predicate(&mut out, p);
        }
        out.push_str("];exit[");
        for (i, p) in self.exit.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_predicate(&mut out, p);
        }
        out.push_str("];stop:");
        write_opt_float(&mut out, self.stop_loss_pct);
        out.push_str(";take:");
        write_opt_float(&mut out, self.take_profit_pct);
        out.push_str(";hold:");
        match self.max_hold_bars {
            Some(n) => {
                let _ = write!(out, "{n}");
            }
            None => out.push_str("none"),
        }
        out
    }

    /// Stable content hash of the canonical form, hex-encoded (64 chars).
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex::encode(digest)
    }

    /// Structural feature tokens used for novelty (Jaccard) comparisons.
    /// Periods are bucketed so near-identical lookbacks share features.
    pub fn feature_set(&self) -> BTreeSet<String> {
        let mut features = BTreeSet::new();
        for (side, preds) in [("entry", &self.entry), ("exit", &self.exit)] {
            for p in preds {
                features.insert(format!("{side}:{}", p.comparator()));
                let (l, r) = p.operands();
                for op in [l, r] {
                    match op {
                        Operand::Price { field } => {
                            features.insert(format!("price:{}", field.as_str()));
                        }
                        Operand::Indicator { indicator } => {
                            features.insert(format!(
                                "ind:{}:{}",
                                indicator.family(),
                                period_bucket(indicator.period())
                            ));
                        }
                        Operand::Const { .. } => {
                            features.insert(format!("{side}:const"));
                        }
                    }
                }
            }
        }
        if self.stop_loss_pct.is_some() {
            features.insert("stop_loss".to_string());
        }
        if self.take_profit_pct.is_some() {
            features.insert("take_profit".to_string());
        }
        if self.max_hold_bars.is_some() {
            features.insert("max_hold".to_string());
        }
        features
    }

    /// All indicators referenced anywhere in the tree, deduplicated by
    /// canonical form, in walk order.
    pub fn indicators(&self) -> Vec<Indicator> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for p in self.entry.iter().chain(self.exit.iter()) {
            let (l, r) = p.operands();
            for op in [l, r] {
                if let Operand::Indicator { indicator } = op {
                    let mut key = String::new();
                    write_indicator(&mut key, indicator);
                    if seen.insert(key) {
                        out.push(*indicator);
                    }
                }
            }
        }
        out
    }
}

fn period_bucket(period: u32) -> &'static str {
    match period {
        0..=10 => "p10",
        11..=20 => "p20",
        21..=50 => "p50",
        51..=100 => "p100",
        _ => "pmax",
    }
}

fn write_indicator(out: &mut String, ind: &Indicator) {
    let _ = write!(out, "{}({})", ind.family(), ind.period());
}

fn write_operand(out: &mut String, op: &Operand) {
    match op {
        Operand::Price { field } => {
            let _ = write!(out, "price:{}", field.as_str());
        }
        Operand::Indicator { indicator } => {
            out.push_str("ind:");
            write_indicator(out, indicator);
        }
        Operand::Const { value } => {
            let _ = write!(out, "const:{value:.6}");
        }
    }
}

fn write_predicate(out: &mut String, p: &Predicate) {
    out.push_str(p.comparator());
    out.push('(');
    let (l, r) = p.operands();
    write_operand(out, l);
    out.push(',');
    write_operand(out, r);
    out.push(')');
}

fn write_opt_float(out: &mut String, v: Option<f64>) {
    match v {
        Some(v) => {
            let _ = write!(out, "{v:.6}");
        }
        None => out.push_str("none"),
    }
}
