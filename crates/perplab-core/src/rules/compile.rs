//! Compiles declarative block specs into the typed AST.
//!
//! All name resolution and operator checking happens here, before any bar
//! is processed: unknown feature keys, unknown setup references, float `eq`
//! and over-long windows are configuration errors, not runtime surprises.

use crate::error::{PerpLabError, Result};
use crate::feed::MultiFeed;
use crate::hashing::hash_canonical;
use crate::rules::ast::{
    CmpOp, CompiledBlock, CompiledIntent, CompiledRules, Expr, MetadataBinding, Operand,
    WindowAggregate, WindowSampling,
};
use crate::rules::spec::{BlockSpec, ExprSpec, IntentSpec, MetadataSpec, OperandSpec};
use crate::snapshot::{PathRef, PathResolver};
use crate::structure::{FieldClass, StructureEngine};
use crate::timeframe::{TfRole, Timeframe};

/// Compile-time limits on rule shapes.
#[derive(Debug, Clone, Copy)]
pub struct RuleLimits {
    /// Longest window any operator may cover, in minutes.
    pub max_window_minutes: usize,
}

impl Default for RuleLimits {
    fn default() -> Self {
        Self {
            max_window_minutes: 24 * 60,
        }
    }
}

/// Compile every block against the run's feeds and structures.
pub fn compile_blocks(
    blocks: &[BlockSpec],
    feeds: &MultiFeed,
    structures: &StructureEngine,
    limits: RuleLimits,
) -> Result<CompiledRules> {
    let mut compiler = Compiler {
        resolver: PathResolver::new(feeds, structures),
        feeds,
        limits,
        node_count: 0,
        warmup_exec_bars: 0,
        compiled_ids: Vec::new(),
    };

    let mut compiled = Vec::with_capacity(blocks.len());
    for block in blocks {
        if compiler.compiled_ids.iter().any(|(id, _)| id == &block.id) {
            return Err(PerpLabError::Config(format!(
                "duplicate block id '{}'",
                block.id
            )));
        }

        let mut cases = Vec::with_capacity(block.cases.len());
        for case in &block.cases {
            let expr = compiler.compile_expr(&block.id, &case.when)?;
            let intents = compiler.compile_intents(&block.id, &case.emit)?;
            cases.push((expr, intents));
        }
        let else_intents = compiler.compile_intents(&block.id, &block.else_emit)?;

        compiler
            .compiled_ids
            .push((block.id.clone(), block.reusable));
        compiled.push(CompiledBlock {
            id: block.id.clone(),
            reusable: block.reusable,
            cases,
            else_intents,
        });
    }

    let ast_hash = hash_canonical(&compiled)?;
    Ok(CompiledRules {
        blocks: compiled,
        node_count: compiler.node_count,
        warmup_exec_bars: compiler.warmup_exec_bars,
        ast_hash,
    })
}

struct Compiler<'a> {
    resolver: PathResolver<'a>,
    feeds: &'a MultiFeed,
    limits: RuleLimits,
    node_count: usize,
    warmup_exec_bars: usize,
    /// (id, reusable) of blocks compiled so far, for setup_ref checks.
    compiled_ids: Vec<(String, bool)>,
}

impl Compiler<'_> {
    fn exec_tf(&self) -> Timeframe {
        self.feeds.exec().tf()
    }

    fn next_node(&mut self) -> usize {
        let id = self.node_count;
        self.node_count += 1;
        id
    }

    fn bump_warmup(&mut self, exec_bars: usize) {
        self.warmup_exec_bars = self.warmup_exec_bars.max(exec_bars);
    }

    fn compile_operand(&mut self, block_id: &str, op: &OperandSpec) -> Result<(Operand, FieldClass)> {
        match op {
            OperandSpec::Number(v) => Ok((Operand::Const(*v), FieldClass::Numeric)),
            OperandSpec::Path(path) => {
                let (path_ref, class) = self.resolver.compile(path).map_err(|e| {
                    PerpLabError::Config(format!("block '{block_id}': {e}"))
                })?;
                self.bump_warmup(self.offset_warmup(&path_ref));
                Ok((Operand::Path(path_ref), class))
            }
        }
    }

    /// Exec bars a static offset reaches back.
    fn offset_warmup(&self, path: &PathRef) -> usize {
        match path {
            PathRef::Price { offset, .. } => {
                offset.div_ceil(self.exec_tf().minutes() as usize)
            }
            PathRef::Indicator { role, offset, .. } => {
                let role_tf = self
                    .feeds
                    .feed(*role)
                    .map(|f| f.tf())
                    .unwrap_or(self.exec_tf());
                let dilation = role_tf
                    .dilation(self.exec_tf())
                    .unwrap_or(1) as usize;
                offset * dilation
            }
            PathRef::Structure { .. } => 0,
        }
    }

    fn compile_cmp(
        &mut self,
        block_id: &str,
        op: CmpOp,
        lhs: &OperandSpec,
        rhs: &OperandSpec,
        tol: f64,
    ) -> Result<Expr> {
        let (lhs, lhs_class) = self.compile_operand(block_id, lhs)?;
        let (rhs, rhs_class) = self.compile_operand(block_id, rhs)?;

        if op == CmpOp::Eq {
            self.check_eq_operand(block_id, &lhs, lhs_class)?;
            self.check_eq_operand(block_id, &rhs, rhs_class)?;
        }
        if matches!(op, CmpOp::NearAbs | CmpOp::NearPct) && !(tol >= 0.0) {
            return Err(PerpLabError::Config(format!(
                "block '{block_id}': near_* tolerance must be non-negative"
            )));
        }

        Ok(Expr::Cond { op, lhs, rhs, tol })
    }

    /// `eq` accepts integer constants and discrete fields only; float
    /// equality is rejected at compile time.
    fn check_eq_operand(
        &self,
        block_id: &str,
        operand: &Operand,
        class: FieldClass,
    ) -> Result<()> {
        match operand {
            Operand::Const(v) => {
                if v.fract() != 0.0 {
                    return Err(PerpLabError::Config(format!(
                        "block '{block_id}': eq on float literal {v}; use near_abs/near_pct"
                    )));
                }
            }
            Operand::Path(p) => {
                if class != FieldClass::Discrete {
                    return Err(PerpLabError::Config(format!(
                        "block '{block_id}': eq on continuous path '{}'; use near_abs/near_pct",
                        p.canonical()
                    )));
                }
            }
        }
        Ok(())
    }

    fn compile_cross(
        &mut self,
        block_id: &str,
        above: bool,
        lhs: &OperandSpec,
        rhs: &OperandSpec,
    ) -> Result<Expr> {
        let (lhs, _) = self.compile_operand(block_id, lhs)?;
        let (rhs, _) = self.compile_operand(block_id, rhs)?;
        if matches!(lhs, Operand::Const(_)) {
            return Err(PerpLabError::Config(format!(
                "block '{block_id}': crossover lhs must be a path"
            )));
        }
        // One previous sample of history.
        self.bump_warmup(1);
        Ok(Expr::Cross {
            node_id: self.next_node(),
            above,
            lhs,
            rhs,
        })
    }

    fn compile_window(
        &mut self,
        block_id: &str,
        bars: usize,
        anchor_tf: Option<&str>,
        aggregate: WindowAggregate,
        expr: &ExprSpec,
    ) -> Result<Expr> {
        if bars == 0 {
            return Err(PerpLabError::Config(format!(
                "block '{block_id}': window length must be at least 1 bar"
            )));
        }

        let inner = self.compile_expr(block_id, expr)?;

        let (sampling, samples, window_minutes) = match anchor_tf {
            Some(label) => {
                // Anchored windows are measured in minutes and re-sampled at
                // the 1-minute rate.
                let tf = Timeframe::parse(label)?;
                let minutes = bars * tf.minutes() as usize;
                (WindowSampling::MinuteSampled, minutes, minutes)
            }
            None => {
                let role = primary_role(&inner).unwrap_or(TfRole::Exec);
                let tf = self
                    .feeds
                    .feed(role)
                    .map(|f| f.tf())
                    .unwrap_or(self.exec_tf());
                let minutes = bars * tf.minutes() as usize;
                (WindowSampling::NativeBars { role }, bars, minutes)
            }
        };

        self.check_window_minutes(block_id, window_minutes)?;
        if let WindowAggregate::AtLeast { min_true } = aggregate {
            if min_true == 0 || min_true > samples {
                return Err(PerpLabError::Config(format!(
                    "block '{block_id}': count_true min_true {min_true} outside 1..={samples}"
                )));
            }
        }

        self.bump_warmup(window_minutes.div_ceil(self.exec_tf().minutes() as usize));

        Ok(Expr::Window {
            node_id: self.next_node(),
            sampling,
            samples,
            aggregate,
            expr: Box::new(inner),
        })
    }

    fn compile_duration_window(
        &mut self,
        block_id: &str,
        duration: &str,
        aggregate: WindowAggregate,
        expr: &ExprSpec,
    ) -> Result<Expr> {
        let minutes = parse_duration_minutes(duration)?;
        if minutes == 0 {
            return Err(PerpLabError::Config(format!(
                "block '{block_id}': duration '{duration}' is empty"
            )));
        }
        self.check_window_minutes(block_id, minutes)?;

        let inner = self.compile_expr(block_id, expr)?;
        if let WindowAggregate::AtLeast { min_true } = aggregate {
            if min_true == 0 || min_true > minutes {
                return Err(PerpLabError::Config(format!(
                    "block '{block_id}': count_true min_true {min_true} outside 1..={minutes}"
                )));
            }
        }

        self.bump_warmup(minutes.div_ceil(self.exec_tf().minutes() as usize));

        Ok(Expr::Window {
            node_id: self.next_node(),
            sampling: WindowSampling::MinuteSampled,
            samples: minutes,
            aggregate,
            expr: Box::new(inner),
        })
    }

    fn check_window_minutes(&self, block_id: &str, minutes: usize) -> Result<()> {
        if minutes > self.limits.max_window_minutes {
            return Err(PerpLabError::Config(format!(
                "block '{block_id}': window of {minutes} minutes exceeds the configured max of {}",
                self.limits.max_window_minutes
            )));
        }
        Ok(())
    }

    fn compile_expr(&mut self, block_id: &str, spec: &ExprSpec) -> Result<Expr> {
        match spec {
            ExprSpec::Gt { lhs, rhs } => self.compile_cmp(block_id, CmpOp::Gt, lhs, rhs, 0.0),
            ExprSpec::Gte { lhs, rhs } => self.compile_cmp(block_id, CmpOp::Gte, lhs, rhs, 0.0),
            ExprSpec::Lt { lhs, rhs } => self.compile_cmp(block_id, CmpOp::Lt, lhs, rhs, 0.0),
            ExprSpec::Lte { lhs, rhs } => self.compile_cmp(block_id, CmpOp::Lte, lhs, rhs, 0.0),
            ExprSpec::Eq { lhs, rhs } => self.compile_cmp(block_id, CmpOp::Eq, lhs, rhs, 0.0),
            ExprSpec::NearAbs { lhs, rhs, tol } => {
                self.compile_cmp(block_id, CmpOp::NearAbs, lhs, rhs, *tol)
            }
            ExprSpec::NearPct { lhs, rhs, tol } => {
                self.compile_cmp(block_id, CmpOp::NearPct, lhs, rhs, *tol)
            }
            ExprSpec::CrossAbove { lhs, rhs } => self.compile_cross(block_id, true, lhs, rhs),
            ExprSpec::CrossBelow { lhs, rhs } => self.compile_cross(block_id, false, lhs, rhs),
            ExprSpec::In { lhs, values } => {
                let (lhs, _) = self.compile_operand(block_id, lhs)?;
                Ok(Expr::In {
                    lhs,
                    values: values.clone(),
                })
            }
            ExprSpec::Between { lhs, lower, upper } => {
                let (lhs, _) = self.compile_operand(block_id, lhs)?;
                let (lower, _) = self.compile_operand(block_id, lower)?;
                let (upper, _) = self.compile_operand(block_id, upper)?;
                Ok(Expr::Between { lhs, lower, upper })
            }
            ExprSpec::All { exprs } => Ok(Expr::All(
                exprs
                    .iter()
                    .map(|e| self.compile_expr(block_id, e))
                    .collect::<Result<_>>()?,
            )),
            ExprSpec::Any { exprs } => Ok(Expr::Any(
                exprs
                    .iter()
                    .map(|e| self.compile_expr(block_id, e))
                    .collect::<Result<_>>()?,
            )),
            ExprSpec::Not { expr } => Ok(Expr::Not(Box::new(self.compile_expr(block_id, expr)?))),
            ExprSpec::HoldsFor {
                bars,
                anchor_tf,
                expr,
            } => self.compile_window(
                block_id,
                *bars,
                anchor_tf.as_deref(),
                WindowAggregate::All,
                expr,
            ),
            ExprSpec::OccurredWithin {
                bars,
                anchor_tf,
                expr,
            } => self.compile_window(
                block_id,
                *bars,
                anchor_tf.as_deref(),
                WindowAggregate::Any,
                expr,
            ),
            ExprSpec::CountTrue {
                bars,
                min_true,
                anchor_tf,
                expr,
            } => self.compile_window(
                block_id,
                *bars,
                anchor_tf.as_deref(),
                WindowAggregate::AtLeast {
                    min_true: *min_true,
                },
                expr,
            ),
            ExprSpec::HoldsForDuration { duration, expr } => {
                self.compile_duration_window(block_id, duration, WindowAggregate::All, expr)
            }
            ExprSpec::OccurredWithinDuration { duration, expr } => {
                self.compile_duration_window(block_id, duration, WindowAggregate::Any, expr)
            }
            ExprSpec::CountTrueDuration {
                duration,
                min_true,
                expr,
            } => self.compile_duration_window(
                block_id,
                duration,
                WindowAggregate::AtLeast {
                    min_true: *min_true,
                },
                expr,
            ),
            ExprSpec::SetupRef { id } => {
                let idx = self
                    .compiled_ids
                    .iter()
                    .position(|(bid, _)| bid == id)
                    .ok_or_else(|| {
                        PerpLabError::Config(format!(
                            "block '{block_id}': setup_ref '{id}' does not name an earlier block"
                        ))
                    })?;
                if !self.compiled_ids[idx].1 {
                    return Err(PerpLabError::Config(format!(
                        "block '{block_id}': setup_ref '{id}' targets a block not marked reusable"
                    )));
                }
                Ok(Expr::SetupRef { block_idx: idx })
            }
        }
    }

    fn compile_intents(
        &mut self,
        block_id: &str,
        intents: &[IntentSpec],
    ) -> Result<Vec<CompiledIntent>> {
        intents
            .iter()
            .map(|intent| {
                if let Some(pct) = intent.percent {
                    if !intent.kind_accepts_percent() {
                        return Err(PerpLabError::Config(format!(
                            "block '{block_id}': percent is only valid on exit intents"
                        )));
                    }
                    if !(pct > 0.0 && pct <= 100.0) {
                        return Err(PerpLabError::Config(format!(
                            "block '{block_id}': percent {pct} outside (0, 100]"
                        )));
                    }
                }

                let metadata = intent
                    .metadata
                    .iter()
                    .map(|(k, v)| {
                        let binding = match v {
                            MetadataSpec::Static(value) => MetadataBinding::Static(value.clone()),
                            MetadataSpec::FeatureRef { feature } => {
                                let (path, _) = self.resolver.compile(feature).map_err(|e| {
                                    PerpLabError::Config(format!("block '{block_id}': {e}"))
                                })?;
                                MetadataBinding::Feature(path)
                            }
                        };
                        Ok((k.clone(), binding))
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(CompiledIntent {
                    kind: intent.action,
                    percent: intent.percent,
                    metadata,
                })
            })
            .collect()
    }
}

impl IntentSpec {
    fn kind_accepts_percent(&self) -> bool {
        self.action.is_exit()
    }
}

/// The leftmost path's role decides a native window's sampling timeframe;
/// price paths sample at the quote rate, handled by the caller mapping
/// None -> exec and price -> still minute-grained via its own role.
fn primary_role(expr: &Expr) -> Option<TfRole> {
    match expr {
        Expr::Cond { lhs, rhs, .. } | Expr::Cross { lhs, rhs, .. } => {
            operand_role(lhs).or_else(|| operand_role(rhs))
        }
        Expr::In { lhs, .. } => operand_role(lhs),
        Expr::Between { lhs, lower, upper } => operand_role(lhs)
            .or_else(|| operand_role(lower))
            .or_else(|| operand_role(upper)),
        Expr::All(children) | Expr::Any(children) => children.iter().find_map(primary_role),
        Expr::Not(child) => primary_role(child),
        Expr::Window { expr, .. } => primary_role(expr),
        Expr::SetupRef { .. } => None,
    }
}

fn operand_role(op: &Operand) -> Option<TfRole> {
    match op {
        Operand::Path(PathRef::Indicator { role, .. }) => Some(*role),
        Operand::Path(PathRef::Structure { .. }) => Some(TfRole::Exec),
        // Price paths live on the 1-minute quote feed; no declared role.
        Operand::Path(PathRef::Price { .. }) => None,
        Operand::Const(_) => None,
    }
}

/// Parse `"90m"`, `"2h"`, `"1d"` into whole minutes.
fn parse_duration_minutes(s: &str) -> Result<usize> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.len().saturating_sub(1));
    let n: usize = digits.parse().map_err(|_| {
        PerpLabError::Config(format!("malformed duration '{s}' (expected like 90m, 2h)"))
    })?;
    match unit {
        "m" => Ok(n),
        "h" => Ok(n * 60),
        "d" => Ok(n * 1440),
        _ => Err(PerpLabError::Config(format!(
            "malformed duration '{s}' (unit must be m, h or d)"
        ))),
    }
}
