//! Stateful per-snapshot rule evaluation.
//!
//! The evaluator is pure with respect to the engine: it reads one snapshot
//! and its own [`RuleState`], and never mutates feeds, structures or the
//! exchange. Stateful nodes (crossovers and windows) tick exactly once per
//! snapshot; boolean results follow short-circuit semantics, but every
//! sub-expression is still visited so node state never goes stale.
//!
//! NaN handling is three-valued: a comparison touching NaN is *unknown*,
//! `not(unknown)` stays unknown, and unknown coerces to false wherever a
//! decision is made (case match, window sample). This is what makes
//! `Not(NaN comparison)` false rather than true.

use crate::rules::ast::{
    CmpOp, CompiledIntent, CompiledRules, Expr, Operand, WindowAggregate, WindowSampling,
};
use crate::snapshot::Snapshot;
use std::collections::VecDeque;

/// Per-run evaluator state, indexed by compile-time node ids.
#[derive(Debug, Clone)]
pub struct RuleState {
    nodes: Vec<NodeState>,
    /// Per-block match cache for `setup_ref`, reset each snapshot.
    setup_cache: Vec<Option<bool>>,
}

#[derive(Debug, Clone)]
enum NodeState {
    Cross {
        prev_lhs: f64,
    },
    Window {
        ring: VecDeque<bool>,
        last_native_idx: Option<usize>,
    },
}

impl RuleState {
    pub fn new(rules: &CompiledRules) -> Self {
        let mut nodes = vec![NodeState::Cross { prev_lhs: f64::NAN }; rules.node_count];
        for block in &rules.blocks {
            for (expr, _) in &block.cases {
                init_window_nodes(expr, &mut nodes);
            }
        }
        Self {
            nodes,
            setup_cache: vec![None; rules.blocks.len()],
        }
    }
}

fn init_window_nodes(expr: &Expr, nodes: &mut [NodeState]) {
    match expr {
        Expr::Window {
            node_id,
            samples,
            expr,
            ..
        } => {
            nodes[*node_id] = NodeState::Window {
                ring: VecDeque::with_capacity(*samples),
                last_native_idx: None,
            };
            init_window_nodes(expr, nodes);
        }
        Expr::All(children) | Expr::Any(children) => {
            for c in children {
                init_window_nodes(c, nodes);
            }
        }
        Expr::Not(child) => init_window_nodes(child, nodes),
        _ => {}
    }
}

/// A block's result for one snapshot.
#[derive(Debug, Clone)]
pub struct BlockOutcome<'a> {
    pub block_idx: usize,
    pub block_id: &'a str,
    /// Index of the first matching case, None when the else branch fired.
    pub matched_case: Option<usize>,
    pub intents: &'a [CompiledIntent],
}

/// Evaluate every block against one snapshot, first-match-wins per block.
///
/// All case expressions are visited (stateful nodes tick) even after an
/// earlier case matched; only the emitted intents honour case priority.
pub fn evaluate_snapshot<'a>(
    rules: &'a CompiledRules,
    snap: &Snapshot<'_>,
    state: &mut RuleState,
) -> Vec<BlockOutcome<'a>> {
    state.setup_cache.fill(None);

    let mut outcomes = Vec::with_capacity(rules.blocks.len());
    for (block_idx, block) in rules.blocks.iter().enumerate() {
        let mut matched: Option<usize> = None;
        for (case_idx, (expr, _)) in block.cases.iter().enumerate() {
            let value = eval_expr(expr, snap, state);
            if matched.is_none() && value == Some(true) {
                matched = Some(case_idx);
            }
        }

        state.setup_cache[block_idx] = Some(matched.is_some());

        let intents: &[CompiledIntent] = match matched {
            Some(case_idx) => &block.cases[case_idx].1,
            None => &block.else_intents,
        };
        outcomes.push(BlockOutcome {
            block_idx,
            block_id: &block.id,
            matched_case: matched,
            intents,
        });
    }

    outcomes
}

fn read(operand: &Operand, snap: &Snapshot<'_>) -> f64 {
    match operand {
        Operand::Const(v) => *v,
        Operand::Path(p) => snap.get(p),
    }
}

/// Three-valued evaluation: None means "unknown" (NaN was involved).
fn eval_expr(expr: &Expr, snap: &Snapshot<'_>, state: &mut RuleState) -> Option<bool> {
    match expr {
        Expr::Cond { op, lhs, rhs, tol } => {
            let l = read(lhs, snap);
            let r = read(rhs, snap);
            if l.is_nan() || r.is_nan() {
                return None;
            }
            Some(match op {
                CmpOp::Gt => l > r,
                CmpOp::Gte => l >= r,
                CmpOp::Lt => l < r,
                CmpOp::Lte => l <= r,
                CmpOp::Eq => l == r,
                CmpOp::NearAbs => (l - r).abs() <= *tol,
                CmpOp::NearPct => {
                    if r == 0.0 {
                        false
                    } else {
                        ((l - r) / r).abs() <= *tol
                    }
                }
            })
        }
        Expr::Cross {
            node_id,
            above,
            lhs,
            rhs,
        } => {
            let l = read(lhs, snap);
            let r = read(rhs, snap);
            let NodeState::Cross { prev_lhs } = &mut state.nodes[*node_id] else {
                unreachable!("node {node_id} is not a crossover slot");
            };
            let prev = *prev_lhs;
            *prev_lhs = l;

            if prev.is_nan() || l.is_nan() || r.is_nan() {
                // First evaluation sample (or NaN operands): never a cross.
                return Some(false);
            }
            Some(if *above {
                prev <= r && l > r
            } else {
                prev >= r && l < r
            })
        }
        Expr::In { lhs, values } => {
            let l = read(lhs, snap);
            if l.is_nan() {
                return None;
            }
            Some(values.iter().any(|v| *v == l))
        }
        Expr::Between { lhs, lower, upper } => {
            let l = read(lhs, snap);
            let lo = read(lower, snap);
            let hi = read(upper, snap);
            if l.is_nan() || lo.is_nan() || hi.is_nan() {
                return None;
            }
            Some(l >= lo && l <= hi)
        }
        Expr::All(children) => {
            let mut result = Some(true);
            for c in children {
                match eval_expr(c, snap, state) {
                    Some(false) => result = Some(false),
                    None if result == Some(true) => result = None,
                    _ => {}
                }
            }
            result
        }
        Expr::Any(children) => {
            let mut result = Some(false);
            for c in children {
                match eval_expr(c, snap, state) {
                    Some(true) => result = Some(true),
                    None if result == Some(false) => result = None,
                    _ => {}
                }
            }
            result
        }
        Expr::Not(child) => eval_expr(child, snap, state).map(|b| !b),
        Expr::Window {
            node_id,
            sampling,
            samples,
            aggregate,
            expr,
        } => {
            // Unknown samples are recorded as false: a window never counts
            // evidence it does not have.
            let value = eval_expr(expr, snap, state) == Some(true);

            let NodeState::Window {
                ring,
                last_native_idx,
            } = &mut state.nodes[*node_id]
            else {
                unreachable!("node {node_id} is not a window slot");
            };

            match sampling {
                WindowSampling::MinuteSampled => {
                    ring.push_back(value);
                    if ring.len() > *samples {
                        ring.pop_front();
                    }
                }
                WindowSampling::NativeBars { role } => {
                    match snap.role_idx(*role) {
                        None => {
                            // No closed bar at this role yet; nothing to record.
                        }
                        Some(idx) if Some(idx) != *last_native_idx => {
                            *last_native_idx = Some(idx);
                            ring.push_back(value);
                            if ring.len() > *samples {
                                ring.pop_front();
                            }
                        }
                        Some(_) => {
                            // Same native bar: the latest evaluation wins.
                            if let Some(back) = ring.back_mut() {
                                *back = value;
                            }
                        }
                    }
                }
            }

            Some(match aggregate {
                WindowAggregate::All => ring.len() == *samples && ring.iter().all(|&v| v),
                WindowAggregate::Any => ring.iter().any(|&v| v),
                WindowAggregate::AtLeast { min_true } => {
                    ring.iter().filter(|&&v| v).count() >= *min_true
                }
            })
        }
        Expr::SetupRef { block_idx } => state.setup_cache[*block_idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::test_support::bars_from_closes;
    use crate::feed::{Feed, MultiFeed};
    use crate::rules::compile::{compile_blocks, RuleLimits};
    use crate::rules::spec::BlockSpec;
    use crate::structure::StructureEngine;
    use crate::timeframe::{TfRole, Timeframe};
    use std::collections::BTreeMap;

    const T0: i64 = 1_704_067_200_000;

    /// Two hourly bars, 120 minutes; `fast` crosses over `slow` on bar 1.
    fn crossing_store() -> (MultiFeed, StructureEngine) {
        let mut exec = Feed::from_bars(
            "BTCUSDT",
            Timeframe::H1,
            &bars_from_closes(Timeframe::H1, T0, &[100.0, 104.0, 108.0]),
        )
        .unwrap();
        exec.set_indicator("sma_2", vec![f64::NAN, 102.0, 106.0]).unwrap();
        exec.set_indicator("sma_3", vec![f64::NAN, 104.0, 104.0]).unwrap();

        let quote_closes: Vec<f64> = (0..180).map(|i| 100.0 + i as f64 * 0.05).collect();
        let quote = Feed::from_bars(
            "BTCUSDT",
            Timeframe::M1,
            &bars_from_closes(Timeframe::M1, T0, &quote_closes),
        )
        .unwrap();

        let mut feeds = BTreeMap::new();
        feeds.insert(TfRole::Exec, exec);
        let feeds = MultiFeed::new(feeds, quote).unwrap();
        let structures = StructureEngine::from_decls(&[], feeds.exec()).unwrap();
        (feeds, structures)
    }

    fn block(json: serde_json::Value) -> BlockSpec {
        serde_json::from_value(json).unwrap()
    }

    fn snapshot<'a>(
        feeds: &'a MultiFeed,
        structures: &'a StructureEngine,
        quote_idx: usize,
    ) -> Snapshot<'a> {
        let exec_idx = quote_idx / 60;
        Snapshot::new(feeds, structures, exec_idx, quote_idx)
    }

    #[test]
    fn crossover_fires_once_when_value_flips() {
        let (feeds, structures) = crossing_store();
        let rules = compile_blocks(
            &[block(serde_json::json!({
                "id": "entry",
                "cases": [{
                    "when": {"op": "cross_above", "lhs": "sma_2", "rhs": "sma_3"},
                    "emit": [{"action": "entry_long"}]
                }]
            }))],
            &feeds,
            &structures,
            RuleLimits::default(),
        )
        .unwrap();
        let mut state = RuleState::new(&rules);

        let mut fired_at = Vec::new();
        // Walk the minutes of exec bars 1 and 2 (hourly values become
        // visible at minutes 119 and 179 respectively).
        for q in 60..180 {
            let snap = snapshot(&feeds, &structures, q);
            let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
            if outcomes[0].matched_case.is_some() {
                fired_at.push(q);
            }
        }

        // sma_2 (102 -> 106) crosses sma_3 (104) exactly when bar 2's
        // values appear, at minute 179. One firing, no repeats.
        assert_eq!(fired_at, vec![179]);
    }

    #[test]
    fn crossover_first_sample_is_false() {
        let (feeds, structures) = crossing_store();
        let rules = compile_blocks(
            &[block(serde_json::json!({
                "id": "entry",
                "cases": [{
                    // Constant rhs below every sma_2 value: always "above".
                    "when": {"op": "cross_above", "lhs": "sma_2", "rhs": 50.0},
                    "emit": [{"action": "entry_long"}]
                }]
            }))],
            &feeds,
            &structures,
            RuleLimits::default(),
        )
        .unwrap();
        let mut state = RuleState::new(&rules);

        let snap = snapshot(&feeds, &structures, 119);
        let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
        // First sample ever: no previous value, so no cross.
        assert_eq!(outcomes[0].matched_case, None);
    }

    #[test]
    fn nan_comparisons_are_false_and_not_nan_is_false() {
        let (feeds, structures) = crossing_store();
        let rules = compile_blocks(
            &[
                block(serde_json::json!({
                    "id": "plain",
                    "cases": [{
                        "when": {"op": "gt", "lhs": "sma_2", "rhs": 0.0},
                        "emit": [{"action": "entry_long"}]
                    }]
                })),
                block(serde_json::json!({
                    "id": "negated",
                    "cases": [{
                        "when": {"op": "not", "expr": {"op": "gt", "lhs": "sma_2", "rhs": 0.0}},
                        "emit": [{"action": "entry_long"}]
                    }]
                })),
            ],
            &feeds,
            &structures,
            RuleLimits::default(),
        )
        .unwrap();
        let mut state = RuleState::new(&rules);

        // Minute 30: no hourly close yet, sma_2 reads NaN.
        let snap = snapshot(&feeds, &structures, 30);
        let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
        assert_eq!(outcomes[0].matched_case, None, "NaN comparison is false");
        assert_eq!(outcomes[1].matched_case, None, "not(NaN cmp) is also false");
    }

    #[test]
    fn holds_for_duration_requires_full_window() {
        let (feeds, structures) = crossing_store();
        let rules = compile_blocks(
            &[block(serde_json::json!({
                "id": "steady",
                "cases": [{
                    "when": {
                        "op": "holds_for_duration", "duration": "5m",
                        "expr": {"op": "gt", "lhs": "price.close", "rhs": 0.0}
                    },
                    "emit": [{"action": "entry_long"}]
                }]
            }))],
            &feeds,
            &structures,
            RuleLimits::default(),
        )
        .unwrap();
        let mut state = RuleState::new(&rules);

        let mut results = Vec::new();
        for q in 0..6 {
            let snap = snapshot(&feeds, &structures, q);
            let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
            results.push(outcomes[0].matched_case.is_some());
        }
        // Needs 5 recorded samples before it can hold.
        assert_eq!(results, vec![false, false, false, false, true, true]);
    }

    #[test]
    fn occurred_within_remembers_brief_spikes() {
        let (feeds, structures) = crossing_store();
        let rules = compile_blocks(
            &[block(serde_json::json!({
                "id": "spike",
                "cases": [{
                    "when": {
                        "op": "occurred_within_duration", "duration": "10m",
                        // Quote closes pass 103 at minute 60.
                        "expr": {"op": "gt", "lhs": "price.close", "rhs": 103.0}
                    },
                    "emit": [{"action": "entry_long"}]
                }]
            }))],
            &feeds,
            &structures,
            RuleLimits::default(),
        )
        .unwrap();
        let mut state = RuleState::new(&rules);

        // Quote close at minute q is 100 + q*0.05: crosses 103 at q=61.
        let mut first_true = None;
        for q in 0..80 {
            let snap = snapshot(&feeds, &structures, q);
            let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
            if outcomes[0].matched_case.is_some() && first_true.is_none() {
                first_true = Some(q);
            }
        }
        assert_eq!(first_true, Some(61));

        // Still true 9 minutes later (within the 10m window)...
        let snap = snapshot(&feeds, &structures, 69);
        let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
        assert!(outcomes[0].matched_case.is_some());
    }

    #[test]
    fn count_true_thresholds() {
        let (feeds, structures) = crossing_store();
        let rules = compile_blocks(
            &[block(serde_json::json!({
                "id": "mostly",
                "cases": [{
                    "when": {
                        "op": "count_true_duration", "duration": "4m", "min_true": 3,
                        "expr": {"op": "gt", "lhs": "price.close", "rhs": 100.1}
                    },
                    "emit": [{"action": "entry_long"}]
                }]
            }))],
            &feeds,
            &structures,
            RuleLimits::default(),
        )
        .unwrap();
        let mut state = RuleState::new(&rules);

        // close(q) = 100 + q*0.05 > 100.1 from q=3 on.
        let mut results = Vec::new();
        for q in 0..7 {
            let snap = snapshot(&feeds, &structures, q);
            let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
            results.push(outcomes[0].matched_case.is_some());
        }
        // True samples start at q=3; three of them accumulate by q=5.
        assert_eq!(results, vec![false, false, false, false, false, true, true]);
    }

    #[test]
    fn setup_ref_uses_same_snapshot_cache() {
        let (feeds, structures) = crossing_store();
        let rules = compile_blocks(
            &[
                block(serde_json::json!({
                    "id": "risk_on",
                    "reusable": true,
                    "cases": [{"when": {"op": "gt", "lhs": "price.close", "rhs": 100.0}}]
                })),
                block(serde_json::json!({
                    "id": "entry",
                    "cases": [{
                        "when": {"op": "all", "exprs": [
                            {"op": "setup_ref", "id": "risk_on"},
                            {"op": "gt", "lhs": "price.close", "rhs": 101.0}
                        ]},
                        "emit": [{"action": "entry_long"}]
                    }]
                })),
            ],
            &feeds,
            &structures,
            RuleLimits::default(),
        )
        .unwrap();
        let mut state = RuleState::new(&rules);

        // Minute 10: close 100.5 -> setup true, entry gate false.
        let snap = snapshot(&feeds, &structures, 10);
        let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
        assert!(outcomes[0].matched_case.is_some());
        assert!(outcomes[1].matched_case.is_none());

        // Minute 30: close 101.5 -> both true.
        let snap = snapshot(&feeds, &structures, 30);
        let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
        assert!(outcomes[1].matched_case.is_some());
    }

    #[test]
    fn else_branch_fires_when_no_case_matches() {
        let (feeds, structures) = crossing_store();
        let rules = compile_blocks(
            &[block(serde_json::json!({
                "id": "gate",
                "cases": [{
                    "when": {"op": "gt", "lhs": "price.close", "rhs": 1e9},
                    "emit": [{"action": "entry_long"}]
                }],
                "else": [{"action": "no_action"}]
            }))],
            &feeds,
            &structures,
            RuleLimits::default(),
        )
        .unwrap();
        let mut state = RuleState::new(&rules);

        let snap = snapshot(&feeds, &structures, 10);
        let outcomes = evaluate_snapshot(&rules, &snap, &mut state);
        assert_eq!(outcomes[0].matched_case, None);
        assert_eq!(outcomes[0].intents.len(), 1);
        assert_eq!(
            outcomes[0].intents[0].kind,
            crate::rules::spec::IntentKind::NoAction
        );
    }
}
