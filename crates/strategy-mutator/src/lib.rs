//! Mutator
//!
//! Produces child rule sets from a parent via rule-space edits. Exactly one
//! mutation kind is applied per child; malformed or structurally duplicate
//! candidates are dropped and replaced, so rejections never count against
//! the requested fan-out. Draws come from a seeded `StdRng`, making the
//! proposals a pure function of (parent, seed, count).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use evolution_core::{
    Indicator, MutationKind, Operand, OutputShape, Predicate, PriceField, RuleSet, MAX_PERIOD,
    MIN_PERIOD,
};

#[derive(Debug, Clone)]
pub struct MutatorConfig {
    /// Maximum accepted children per mutation step (M).
    pub max_children: usize,
    /// Relative width of parameter jitter (±p).
    pub jitter_pct: f64,
    /// Proposal attempts allowed per accepted child before giving up.
    pub attempts_per_child: usize,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            max_children: 4,
            jitter_pct: 0.15,
            attempts_per_child: 8,
        }
    }
}

/// One accepted candidate child.
#[derive(Debug, Clone)]
pub struct ProposedChild {
    pub rules: RuleSet,
    pub kind: MutationKind,
    pub fingerprint: String,
}

pub struct Mutator {
    config: MutatorConfig,
}

impl Mutator {
    pub fn new(config: MutatorConfig) -> Self {
        Self { config }
    }

    pub fn max_children(&self) -> usize {
        self.config.max_children
    }

    /// Generate up to `count` well-formed children, each structurally
    /// distinct from the parent and from one another.
    pub fn propose(&self, parent: &RuleSet, seed: u64, count: usize) -> Vec<ProposedChild> {
        let mut rng = StdRng::seed_from_u64(seed);
        let parent_fp = parent.fingerprint();
        let mut accepted: Vec<ProposedChild> = Vec::new();
        let budget = count * self.config.attempts_per_child;

        for _ in 0..budget {
            if accepted.len() >= count {
                break;
            }
            let kind = pick_kind(&mut rng);
            let Some(child) = self.apply(parent, kind, &mut rng) else {
                continue;
            };
            if child.validate().is_err() {
                continue;
            }
            let fingerprint = child.fingerprint();
            if fingerprint == parent_fp
                || accepted.iter().any(|c| c.fingerprint == fingerprint)
            {
                continue;
            }
            accepted.push(ProposedChild {
                rules: child,
                kind,
                fingerprint,
            });
        }

        if accepted.len() < count {
            tracing::debug!(
                requested = count,
                accepted = accepted.len(),
                "proposal budget exhausted before fan-out filled"
            );
        }
        accepted
    }

    /// Apply exactly one mutation of the given kind, or `None` when the
    /// parent offers no site for it.
    fn apply(&self, parent: &RuleSet, kind: MutationKind, rng: &mut StdRng) -> Option<RuleSet> {
        let mut child = parent.clone();
        match kind {
            MutationKind::ParameterJitter => self.jitter_parameter(&mut child, rng)?,
            MutationKind::RuleSwap => swap_rule(&mut child, rng)?,
            MutationKind::ThresholdShift => shift_threshold(&mut child, rng)?,
            MutationKind::WindowResize => resize_window(&mut child, rng)?,
            MutationKind::IndicatorSubstitute => substitute_indicator(&mut child, rng)?,
        }
        Some(child)
    }

    fn jitter_parameter(&self, rules: &mut RuleSet, rng: &mut StdRng) -> Option<()> {
        // Jitter sites: stop loss, take profit, max hold.
        let mut sites: Vec<usize> = Vec::new();
        if rules.stop_loss_pct.is_some() {
            sites.push(0);
        }
        if rules.take_profit_pct.is_some() {
            sites.push(1);
        }
        if rules.max_hold_bars.is_some() {
            sites.push(2);
        }
        if sites.is_empty() {
            return None;
        }

        let factor = 1.0 + self.config.jitter_pct * rng.gen_range(-1.0..1.0f64);
        match sites[rng.gen_range(0..sites.len())] {
            0 => {
                let v = rules.stop_loss_pct.take().expect("site checked");
                rules.stop_loss_pct = Some((v * factor).max(0.005));
            }
            1 => {
                let v = rules.take_profit_pct.take().expect("site checked");
                rules.take_profit_pct = Some((v * factor).max(0.005));
            }
            _ => {
                let v = rules.max_hold_bars.take().expect("site checked");
                let jittered = ((v as f64 * factor).round() as u32).max(1);
                rules.max_hold_bars = Some(jittered);
            }
        }
        Some(())
    }
}

fn pick_kind(rng: &mut StdRng) -> MutationKind {
    match rng.gen_range(0..5u8) {
        0 => MutationKind::ParameterJitter,
        1 => MutationKind::RuleSwap,
        2 => MutationKind::ThresholdShift,
        3 => MutationKind::WindowResize,
        _ => MutationKind::IndicatorSubstitute,
    }
}

/// Fixed library of replacement predicates, all arity 2.
fn library_predicate(rng: &mut StdRng) -> Predicate {
    let sma = |period| Operand::Indicator {
        indicator: Indicator::Sma { period },
    };
    let close = Operand::Price {
        field: PriceField::Close,
    };
    match rng.gen_range(0..6u8) {
        0 => Predicate::CrossesAbove {
            left: sma(10),
            right: sma(30),
        },
        1 => Predicate::CrossesBelow {
            left: sma(10),
            right: sma(30),
        },
        2 => Predicate::Lt {
            left: Operand::Indicator {
                indicator: Indicator::Rsi { period: 14 },
            },
            right: Operand::Const { value: 30.0 },
        },
        3 => Predicate::Gt {
            left: Operand::Indicator {
                indicator: Indicator::Rsi { period: 14 },
            },
            right: Operand::Const { value: 70.0 },
        },
        4 => Predicate::Gt {
            left: Operand::Indicator {
                indicator: Indicator::Momentum { period: 20 },
            },
            right: Operand::Const { value: 0.0 },
        },
        _ => Predicate::Gt {
            left: close,
            right: Operand::Indicator {
                indicator: Indicator::Ema { period: 50 },
            },
        },
    }
}

fn swap_rule(rules: &mut RuleSet, rng: &mut StdRng) -> Option<()> {
    let entry_len = rules.entry.len();
    let total = entry_len + rules.exit.len();
    if total == 0 {
        return None;
    }
    let slot = rng.gen_range(0..total);
    let replacement = library_predicate(rng);
    if slot < entry_len {
        rules.entry[slot] = replacement;
    } else {
        rules.exit[slot - entry_len] = replacement;
    }
    Some(())
}

fn shift_threshold(rules: &mut RuleSet, rng: &mut StdRng) -> Option<()> {
    let shift = rng.gen_range(-0.15..0.15f64);
    let mut const_slots = 0usize;
    for_each_operand(rules, |op| {
        if matches!(op, Operand::Const { .. }) {
            const_slots += 1;
        }
    });
    if const_slots == 0 {
        return None;
    }
    let target = rng.gen_range(0..const_slots);

    let mut index = 0usize;
    for_each_operand_mut(rules, |op| {
        if let Operand::Const { value } = op {
            if index == target {
                let delta = if *value == 0.0 { shift * 10.0 } else { *value * shift };
                *value += delta;
            }
            index += 1;
        }
    });
    Some(())
}

fn resize_window(rules: &mut RuleSet, rng: &mut StdRng) -> Option<()> {
    let mut indicator_slots = 0usize;
    for_each_operand(rules, |op| {
        if matches!(op, Operand::Indicator { .. }) {
            indicator_slots += 1;
        }
    });
    if indicator_slots == 0 {
        return None;
    }
    let target = rng.gen_range(0..indicator_slots);
    let scale = rng.gen_range(0.5..1.5f64);

    let mut index = 0usize;
    let mut changed = false;
    for_each_operand_mut(rules, |op| {
        if let Operand::Indicator { indicator } = op {
            if index == target {
                let old = indicator.period();
                let resized =
                    ((old as f64 * scale).round() as u32).clamp(MIN_PERIOD, MAX_PERIOD);
                if resized != old {
                    *indicator = indicator.with_period(resized);
                    changed = true;
                }
            }
            index += 1;
        }
    });
    changed.then_some(())
}

fn substitute_indicator(rules: &mut RuleSet, rng: &mut StdRng) -> Option<()> {
    let mut indicator_slots = 0usize;
    for_each_operand(rules, |op| {
        if matches!(op, Operand::Indicator { .. }) {
            indicator_slots += 1;
        }
    });
    if indicator_slots == 0 {
        return None;
    }
    let target = rng.gen_range(0..indicator_slots);
    let pick = rng.gen_range(0..4u8);

    let mut index = 0usize;
    let mut changed = false;
    for_each_operand_mut(rules, |op| {
        if let Operand::Indicator { indicator } = op {
            if index == target {
                if let Some(substitute) = same_shape_substitute(indicator, pick) {
                    *indicator = substitute;
                    changed = true;
                }
            }
            index += 1;
        }
    });
    changed.then_some(())
}

/// Swap an indicator for another family with the same output shape,
/// keeping the period. Single-member shapes have no substitute.
fn same_shape_substitute(indicator: &Indicator, pick: u8) -> Option<Indicator> {
    let period = indicator.period();
    let candidates: Vec<Indicator> = match indicator.output_shape() {
        OutputShape::PriceLevel => vec![
            Indicator::Sma { period },
            Indicator::Ema { period },
            Indicator::HighestHigh { period },
            Indicator::LowestLow { period },
        ],
        OutputShape::Oscillator => vec![
            Indicator::Rsi { period },
            Indicator::Momentum { period },
        ],
        OutputShape::Range => return None,
    };
    let alternatives: Vec<Indicator> = candidates
        .into_iter()
        .filter(|c| c.family() != indicator.family())
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    Some(alternatives[pick as usize % alternatives.len()])
}

fn for_each_operand(rules: &RuleSet, mut f: impl FnMut(&Operand)) {
    for p in rules.entry.iter().chain(rules.exit.iter()) {
        let (l, r) = p.operands();
        f(l);
        f(r);
    }
}

fn for_each_operand_mut(rules: &mut RuleSet, mut f: impl FnMut(&mut Operand)) {
    for p in rules.entry.iter_mut().chain(rules.exit.iter_mut()) {
        let (l, r) = p.operands_mut();
        f(l);
        f(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> RuleSet {
        RuleSet {
            entry: vec![
                Predicate::CrossesAbove {
                    left: Operand::Indicator {
                        indicator: Indicator::Sma { period: 10 },
                    },
                    right: Operand::Indicator {
                        indicator: Indicator::Sma { period: 50 },
                    },
                },
                Predicate::Gt {
                    left: Operand::Indicator {
                        indicator: Indicator::Rsi { period: 14 },
                    },
                    right: Operand::Const { value: 50.0 },
                },
            ],
            exit: vec![Predicate::CrossesBelow {
                left: Operand::Indicator {
                    indicator: Indicator::Sma { period: 10 },
                },
                right: Operand::Indicator {
                    indicator: Indicator::Sma { period: 50 },
                },
            }],
            stop_loss_pct: Some(0.05),
            take_profit_pct: Some(0.12),
            max_hold_bars: Some(40),
        }
    }

    #[test]
    fn proposals_are_wellformed_and_distinct() {
        let mutator = Mutator::new(MutatorConfig::default());
        let children = mutator.propose(&parent(), 42, 4);
        assert_eq!(children.len(), 4);

        let parent_fp = parent().fingerprint();
        let mut seen = std::collections::HashSet::new();
        for child in &children {
            child.rules.validate().expect("child must stay well-formed");
            assert_ne!(child.fingerprint, parent_fp);
            assert!(seen.insert(child.fingerprint.clone()), "duplicate child");
        }
    }

    #[test]
    fn proposals_are_deterministic_per_seed() {
        let mutator = Mutator::new(MutatorConfig::default());
        let a = mutator.propose(&parent(), 7, 4);
        let b = mutator.propose(&parent(), 7, 4);
        let fps = |cs: &[ProposedChild]| {
            cs.iter().map(|c| c.fingerprint.clone()).collect::<Vec<_>>()
        };
        assert_eq!(fps(&a), fps(&b));

        let c = mutator.propose(&parent(), 8, 4);
        assert_ne!(fps(&a), fps(&c), "different seed should vary proposals");
    }

    #[test]
    fn each_child_records_exactly_one_kind() {
        let mutator = Mutator::new(MutatorConfig::default());
        for child in mutator.propose(&parent(), 3, 6) {
            assert!(MutationKind::parse(child.kind.as_str()).is_some());
        }
    }

    #[test]
    fn sites_missing_for_a_kind_still_fill_the_fanout() {
        // No consts, no stops: threshold_shift and parameter_jitter have no
        // sites, yet the fan-out is still reached through other kinds.
        let sparse = RuleSet {
            entry: vec![Predicate::CrossesAbove {
                left: Operand::Indicator {
                    indicator: Indicator::Sma { period: 10 },
                },
                right: Operand::Indicator {
                    indicator: Indicator::Sma { period: 50 },
                },
            }],
            exit: vec![Predicate::CrossesBelow {
                left: Operand::Indicator {
                    indicator: Indicator::Sma { period: 10 },
                },
                right: Operand::Indicator {
                    indicator: Indicator::Sma { period: 50 },
                },
            }],
            stop_loss_pct: None,
            take_profit_pct: None,
            max_hold_bars: None,
        };
        let mutator = Mutator::new(MutatorConfig::default());
        let children = mutator.propose(&sparse, 11, 3);
        assert_eq!(children.len(), 3);
        for child in &children {
            assert!(!matches!(child.kind, MutationKind::ParameterJitter));
            assert!(!matches!(child.kind, MutationKind::ThresholdShift));
        }
    }

    #[test]
    fn substitution_stays_within_output_shape() {
        let sub = same_shape_substitute(&Indicator::Sma { period: 20 }, 0).unwrap();
        assert_eq!(sub.output_shape(), OutputShape::PriceLevel);
        assert_ne!(sub.family(), "sma");

        let osc = same_shape_substitute(&Indicator::Rsi { period: 14 }, 1).unwrap();
        assert_eq!(osc.output_shape(), OutputShape::Oscillator);
        assert_eq!(osc.family(), "momentum");

        assert!(same_shape_substitute(&Indicator::Atr { period: 14 }, 0).is_none());
    }
}
