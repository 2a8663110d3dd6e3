//! Typed, feed-bound rule AST.
//!
//! Produced by [`crate::rules::compile`]; every path has been resolved to a
//! [`PathRef`], every operator checked, and every stateful node (crossover,
//! window) assigned a slot in the run's [`crate::rules::eval::RuleState`].

use crate::params::ParamValue;
use crate::rules::spec::IntentKind;
use crate::snapshot::PathRef;
use crate::timeframe::TfRole;
use serde::Serialize;

/// Comparison operators dispatched by `Cond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    NearAbs,
    NearPct,
}

/// A resolved operand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operand {
    Const(f64),
    Path(PathRef),
}

/// How a window node counts samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WindowSampling {
    /// One sample per 1-minute sub-bar; `samples` is the window in minutes.
    MinuteSampled,
    /// One sample per closed bar of `role`'s timeframe.
    NativeBars { role: TfRole },
}

/// Aggregation applied over a window's recorded samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WindowAggregate {
    /// True on every sample (HoldsFor).
    All,
    /// True on at least one sample (OccurredWithin).
    Any,
    /// True on at least `min_true` samples (CountTrue).
    AtLeast { min_true: usize },
}

/// Compiled expression tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Cond {
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
        /// Tolerance for the near_* operators; unused otherwise.
        tol: f64,
    },
    /// TradingView crossover semantics with the previous evaluation sample;
    /// `node_id` indexes the per-run crossover state.
    Cross {
        node_id: usize,
        above: bool,
        lhs: Operand,
        rhs: Operand,
    },
    In {
        lhs: Operand,
        values: Vec<f64>,
    },
    Between {
        lhs: Operand,
        lower: Operand,
        upper: Operand,
    },
    All(Vec<Expr>),
    Any(Vec<Expr>),
    Not(Box<Expr>),
    Window {
        node_id: usize,
        sampling: WindowSampling,
        /// Ring capacity: minutes for MinuteSampled, bars for NativeBars.
        samples: usize,
        aggregate: WindowAggregate,
        expr: Box<Expr>,
    },
    /// Cached boolean of an earlier reusable block (by block index).
    SetupRef {
        block_idx: usize,
    },
}

/// Metadata binding carried on a compiled intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetadataBinding {
    Static(ParamValue),
    /// Resolved from the snapshot at emit time; NaN there is an
    /// evaluation error (fail-loud).
    Feature(PathRef),
}

/// A compiled intent ready for the runner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledIntent {
    pub kind: IntentKind,
    pub percent: Option<f64>,
    pub metadata: Vec<(String, MetadataBinding)>,
}

/// One compiled block.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledBlock {
    pub id: String,
    pub reusable: bool,
    /// Case conditions with their emit lists, in declaration order.
    pub cases: Vec<(Expr, Vec<CompiledIntent>)>,
    pub else_intents: Vec<CompiledIntent>,
}

/// Everything the evaluator needs, plus the derived warmup and the AST hash
/// for the compile/serialise/re-compile idempotence audit.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledRules {
    pub blocks: Vec<CompiledBlock>,
    /// Number of stateful node slots (crossovers + windows).
    pub node_count: usize,
    /// Exec bars the rules need before evaluation can start.
    pub warmup_exec_bars: usize,
    /// sha256 over the canonical serialised AST.
    pub ast_hash: String,
}

impl CompiledRules {
    pub fn block_idx(&self, id: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }
}
