//! Parsed rule-block shapes as consumed from the Play.
//!
//! This is the declarative surface the YAML/JSON collaborator hands over;
//! nothing here is executable until [`crate::rules::compile`] turns it into
//! a typed AST bound to the run's feeds and structures.

use crate::params::ParamValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A rule block: ordered cases with a shared optional `else` emit list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub id: String,
    /// Reusable blocks can be referenced by `setup_ref` from later blocks;
    /// their boolean (any case matched) is cached per snapshot.
    #[serde(default)]
    pub reusable: bool,
    pub cases: Vec<CaseSpec>,
    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    pub else_emit: Vec<IntentSpec>,
}

/// One case: a condition and the intents it emits when it matches first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSpec {
    pub when: ExprSpec,
    #[serde(default)]
    pub emit: Vec<IntentSpec>,
}

/// An operand: a literal number or a snapshot path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperandSpec {
    Number(f64),
    Path(String),
}

/// Declarative expression tree, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ExprSpec {
    Gt {
        lhs: OperandSpec,
        rhs: OperandSpec,
    },
    Gte {
        lhs: OperandSpec,
        rhs: OperandSpec,
    },
    Lt {
        lhs: OperandSpec,
        rhs: OperandSpec,
    },
    Lte {
        lhs: OperandSpec,
        rhs: OperandSpec,
    },
    /// Exact equality; integer/enum/bool-valued operands only.
    Eq {
        lhs: OperandSpec,
        rhs: OperandSpec,
    },
    In {
        lhs: OperandSpec,
        values: Vec<f64>,
    },
    /// Inclusive on both bounds.
    Between {
        lhs: OperandSpec,
        lower: OperandSpec,
        upper: OperandSpec,
    },
    NearAbs {
        lhs: OperandSpec,
        rhs: OperandSpec,
        tol: f64,
    },
    NearPct {
        lhs: OperandSpec,
        rhs: OperandSpec,
        tol: f64,
    },
    CrossAbove {
        lhs: OperandSpec,
        rhs: OperandSpec,
    },
    CrossBelow {
        lhs: OperandSpec,
        rhs: OperandSpec,
    },
    All {
        exprs: Vec<ExprSpec>,
    },
    Any {
        exprs: Vec<ExprSpec>,
    },
    Not {
        expr: Box<ExprSpec>,
    },
    /// True when `expr` held at every anchor-TF step across the window.
    HoldsFor {
        bars: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_tf: Option<String>,
        expr: Box<ExprSpec>,
    },
    /// True when `expr` held at least once across the window.
    OccurredWithin {
        bars: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_tf: Option<String>,
        expr: Box<ExprSpec>,
    },
    /// True when `expr` held at least `min_true` times across the window.
    CountTrue {
        bars: usize,
        min_true: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_tf: Option<String>,
        expr: Box<ExprSpec>,
    },
    /// Duration variants always sample at the 1-minute rate.
    HoldsForDuration {
        duration: String,
        expr: Box<ExprSpec>,
    },
    OccurredWithinDuration {
        duration: String,
        expr: Box<ExprSpec>,
    },
    CountTrueDuration {
        duration: String,
        min_true: usize,
        expr: Box<ExprSpec>,
    },
    /// Cached boolean of an earlier reusable block.
    SetupRef {
        id: String,
    },
}

/// Intent actions a case may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    EntryLong,
    EntryShort,
    ExitLong,
    ExitShort,
    ExitAll,
    NoAction,
}

impl IntentKind {
    pub fn is_entry(&self) -> bool {
        matches!(self, IntentKind::EntryLong | IntentKind::EntryShort)
    }

    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            IntentKind::ExitLong | IntentKind::ExitShort | IntentKind::ExitAll
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::EntryLong => "entry_long",
            IntentKind::EntryShort => "entry_short",
            IntentKind::ExitLong => "exit_long",
            IntentKind::ExitShort => "exit_short",
            IntentKind::ExitAll => "exit_all",
            IntentKind::NoAction => "no_action",
        }
    }
}

/// Metadata attached to an intent: a static value or a feature binding
/// resolved from the snapshot at emit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataSpec {
    FeatureRef { feature: String },
    Static(ParamValue),
}

/// An emitted intent with optional partial-exit percent and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSpec {
    pub action: IntentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_json_round_trip() {
        let json = serde_json::json!({
            "id": "entry",
            "cases": [{
                "when": {
                    "op": "all",
                    "exprs": [
                        {"op": "cross_above", "lhs": "ema_9", "rhs": "ema_21"},
                        {"op": "gt", "lhs": "price.close", "rhs": 100.0}
                    ]
                },
                "emit": [{"action": "entry_long"}]
            }],
            "else": [{"action": "no_action"}]
        });

        let block: BlockSpec = serde_json::from_value(json).unwrap();
        assert_eq!(block.id, "entry");
        assert_eq!(block.cases.len(), 1);
        assert_eq!(block.else_emit.len(), 1);
        match &block.cases[0].when {
            ExprSpec::All { exprs } => assert_eq!(exprs.len(), 2),
            other => panic!("unexpected parse: {other:?}"),
        }

        let back = serde_json::to_value(&block).unwrap();
        let reparsed: BlockSpec = serde_json::from_value(back).unwrap();
        assert_eq!(reparsed, block);
    }

    #[test]
    fn operand_number_vs_path() {
        let n: OperandSpec = serde_json::from_value(serde_json::json!(42.5)).unwrap();
        assert_eq!(n, OperandSpec::Number(42.5));
        let p: OperandSpec = serde_json::from_value(serde_json::json!("rsi_14")).unwrap();
        assert_eq!(p, OperandSpec::Path("rsi_14".into()));
    }

    #[test]
    fn unknown_operator_fails_parse() {
        let json = serde_json::json!({"op": "xor", "exprs": []});
        assert!(serde_json::from_value::<ExprSpec>(json).is_err());
    }

    #[test]
    fn metadata_feature_ref_vs_static() {
        let m: MetadataSpec =
            serde_json::from_value(serde_json::json!({"feature": "atr_14"})).unwrap();
        assert_eq!(
            m,
            MetadataSpec::FeatureRef {
                feature: "atr_14".into()
            }
        );

        let s: MetadataSpec = serde_json::from_value(serde_json::json!("breakout")).unwrap();
        assert_eq!(s, MetadataSpec::Static(ParamValue::from("breakout")));
    }

    #[test]
    fn window_spec_parses_anchor() {
        let json = serde_json::json!({
            "op": "holds_for",
            "bars": 3,
            "anchor_tf": "1h",
            "expr": {"op": "gt", "lhs": "rsi_14", "rhs": 50.0}
        });
        let e: ExprSpec = serde_json::from_value(json).unwrap();
        match e {
            ExprSpec::HoldsFor { bars, anchor_tf, .. } => {
                assert_eq!(bars, 3);
                assert_eq!(anchor_tf.as_deref(), Some("1h"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
