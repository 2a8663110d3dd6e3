//! Declarative trading rules: parsed block shapes, the typed AST they
//! compile into, and the stateful per-snapshot evaluator.
//!
//! Blocks arrive as data (the Play's `blocks` list), get compiled once
//! against the run's feeds and structures, and are then evaluated at every
//! 1-minute sub-bar. Compilation fails loudly on unknown feature keys,
//! unknown operators, float `eq`, and windows over the configured maximum;
//! nothing is deferred to run time that can be rejected up front.

pub mod ast;
pub mod compile;
pub mod eval;
pub mod spec;

pub use ast::{CmpOp, CompiledBlock, CompiledIntent, CompiledRules, Expr, MetadataBinding, Operand};
pub use compile::{compile_blocks, RuleLimits};
pub use eval::{evaluate_snapshot, BlockOutcome, RuleState};
pub use spec::{BlockSpec, CaseSpec, ExprSpec, IntentKind, IntentSpec, MetadataSpec, OperandSpec};
