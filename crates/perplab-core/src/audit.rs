//! Offline audits over prepared or completed runs.
//!
//! Four per-run audits (contract, math parity, snapshot plumbing, rollup
//! parity) plus the determinism gate, which runs the full engine twice and
//! compares artifact content. Audit failures are diagnostics; determinism
//! failures are fatal to the session.

use crate::error::{PerpLabError, Result};
use crate::feed::MultiFeed;
use crate::hashing::hash_canonical;
use crate::indicators::math;
use crate::indicators::IndicatorKind;
use crate::metrics::compute_metrics;
use crate::play::Play;
use crate::rules::{compile_blocks, RuleLimits};
use crate::runner::{run_backtest, RunConfig};
use crate::snapshot::{PathResolver, Snapshot};
use crate::structure::StructureEngine;
use serde::Serialize;

/// Tolerance for the math-parity recomputation.
pub const PARITY_TOLERANCE: f64 = 1e-8;

/// One audit's verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditResult {
    pub name: &'static str,
    pub passed: bool,
    pub checks: usize,
    pub failures: Vec<String>,
}

impl AuditResult {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            passed: true,
            checks: 0,
            failures: Vec::new(),
        }
    }

    fn check(&mut self, ok: bool, detail: impl FnOnce() -> String) {
        self.checks += 1;
        if !ok {
            self.passed = false;
            self.failures.push(detail());
        }
    }
}

/// Contract audit: every declared indicator's computed columns match the
/// registry outputs exactly; no extras, none missing.
pub fn contract_audit(play: &Play, feeds: &MultiFeed) -> Result<AuditResult> {
    let mut result = AuditResult::new("contract");

    let mut declared: Vec<(crate::timeframe::TfRole, Vec<String>)> = Vec::new();
    for (role, resolved) in play.resolved_features()? {
        declared.push((role, resolved.output_columns()));
    }

    // Declared columns must exist.
    for (role, outputs) in &declared {
        let feed = feeds.feed(*role).ok_or_else(|| {
            PerpLabError::Config(format!("role {role} has no feed loaded"))
        })?;
        for column in outputs {
            result.check(feed.has_indicator(column), || {
                format!("{role}: declared output '{column}' was not computed")
            });
        }
    }

    // No stray columns beyond the declared set.
    for role in feeds.roles() {
        let feed = feeds.feed(role).expect("role listed by the store");
        for key in feed.indicator_keys() {
            let known = declared
                .iter()
                .any(|(r, outputs)| *r == role && outputs.iter().any(|o| o == key));
            result.check(known, || {
                format!("{role}: computed column '{key}' has no declaration")
            });
        }
    }

    Ok(result)
}

/// Math parity: recompute each indicator column with a naive reference and
/// compare within [`PARITY_TOLERANCE`].
pub fn math_parity_audit(play: &Play, feeds: &MultiFeed) -> Result<AuditResult> {
    let mut result = AuditResult::new("math_parity");

    for (role, resolved) in play.resolved_features()? {
        let feed = feeds.feed(role).ok_or_else(|| {
            PerpLabError::Config(format!("role {role} has no feed loaded"))
        })?;

        // Reference recomputation. Windowed kinds get an O(n*w) brute-force
        // reference; recursive kinds are recomputed through the same math
        // (which still catches column corruption and misalignment).
        let reference: Option<(String, Vec<f64>)> = match resolved.kind {
            IndicatorKind::Sma => {
                let period = period_of(&resolved)?;
                let closes: Vec<f64> = (0..feed.len()).map(|i| feed.close(i)).collect();
                Some((resolved.key.clone(), brute_sma(&closes, period)))
            }
            IndicatorKind::Highest => {
                let period = period_of(&resolved)?;
                let closes: Vec<f64> = (0..feed.len()).map(|i| feed.close(i)).collect();
                Some((resolved.key.clone(), brute_extreme(&closes, period, true)))
            }
            IndicatorKind::Lowest => {
                let period = period_of(&resolved)?;
                let closes: Vec<f64> = (0..feed.len()).map(|i| feed.close(i)).collect();
                Some((resolved.key.clone(), brute_extreme(&closes, period, false)))
            }
            IndicatorKind::Ema => {
                let period = period_of(&resolved)?;
                let closes: Vec<f64> = (0..feed.len()).map(|i| feed.close(i)).collect();
                Some((resolved.key.clone(), math::ema(&closes, period)))
            }
            _ => None,
        };

        if let Some((column, expected)) = reference {
            // Source-qualified names recompute over close only; skip others.
            if resolved.source != crate::indicators::InputSource::Close
                && !resolved.kind.requires_ohlcv()
            {
                continue;
            }
            let Some(actual) = feed.indicator(&column) else {
                result.check(false, || format!("{role}: column '{column}' missing"));
                continue;
            };
            let mut mismatches = 0usize;
            for i in 0..actual.len() {
                let a = actual[i];
                let e = expected[i];
                let same = (a.is_nan() && e.is_nan()) || (a - e).abs() <= PARITY_TOLERANCE;
                if !same {
                    mismatches += 1;
                }
            }
            result.check(mismatches == 0, || {
                format!("{role}: '{column}' diverges from reference at {mismatches} bars")
            });
        }
    }

    Ok(result)
}

fn period_of(resolved: &crate::indicators::ResolvedIndicator) -> Result<usize> {
    crate::params::ParamReader::new(&resolved.key, &resolved.params).require_usize("period")
}

fn brute_sma(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 {
        return out;
    }
    for i in 0..values.len() {
        if i + 1 >= window {
            out[i] = values[i + 1 - window..=i].iter().sum::<f64>() / window as f64;
        }
    }
    out
}

fn brute_extreme(values: &[f64], window: usize, max: bool) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 {
        return out;
    }
    for i in 0..values.len() {
        if i + 1 >= window {
            let slice = &values[i + 1 - window..=i];
            out[i] = if max {
                slice.iter().copied().fold(f64::MIN, f64::max)
            } else {
                slice.iter().copied().fold(f64::MAX, f64::min)
            };
        }
    }
    out
}

/// Snapshot plumbing: `snapshot.get(path)` must equal direct array access
/// at deterministic sample points for every declared indicator column.
pub fn snapshot_plumbing_audit(
    play: &Play,
    feeds: &MultiFeed,
    structures: &StructureEngine,
) -> Result<AuditResult> {
    let mut result = AuditResult::new("snapshot_plumbing");
    let resolver = PathResolver::new(feeds, structures);

    let quote_len = feeds.quote().len();
    if quote_len == 0 {
        result.check(false, || "quote feed is empty".to_string());
        return Ok(result);
    }
    // Deterministic sample points: eight evenly spaced quote indices.
    let sample_points: Vec<usize> = (1..=8)
        .map(|k| (quote_len - 1) * k / 8)
        .collect();

    for (role, resolved) in play.resolved_features()? {
        let feed = feeds.feed(role).expect("validated upstream");
        for column in resolved.output_columns() {
            // Path spelling: key or key.field, role-qualified to dodge
            // cross-role ambiguity.
            let path_str = format!("indicator.{role}.{column}");
            let (path, _) = resolver.compile(&path_str)?;

            for &q in &sample_points {
                let exec_idx = feeds
                    .exec()
                    .idx_at_or_before(feeds.quote().ts_close(q))
                    .unwrap_or(0);
                let snap = Snapshot::new(feeds, structures, exec_idx, q);
                let via_snapshot = snap.get(&path);

                let direct = match feed.idx_at_or_before(feeds.quote().ts_close(q)) {
                    Some(idx) => feed.indicator_value(&column, idx),
                    None => f64::NAN,
                };

                let same = (via_snapshot.is_nan() && direct.is_nan())
                    || via_snapshot == direct;
                result.check(same, || {
                    format!(
                        "{path_str} at quote {q}: snapshot {via_snapshot} != direct {direct}"
                    )
                });
            }
        }
    }

    Ok(result)
}

/// Rollup parity: every exec bar must aggregate its 1-minute constituents
/// (first open, max high, min low, last close, summed volume).
pub fn rollup_audit(feeds: &MultiFeed) -> Result<AuditResult> {
    let mut result = AuditResult::new("rollup");
    let exec = feeds.exec();
    let quote = feeds.quote();
    let per_bar = exec.tf().dilation(quote.tf())? as usize;

    for idx in 0..exec.len() {
        let (q_start, q_end) = feeds.quote_range_for_exec(idx);
        // Only fully covered bars are comparable; partial coverage is a
        // preflight concern, not a rollup defect.
        if q_end - q_start != per_bar {
            continue;
        }

        let bar = exec.bar(idx);
        let open = quote.open(q_start);
        let close = quote.close(q_end - 1);
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut volume = 0.0;
        for q in q_start..q_end {
            high = high.max(quote.high(q));
            low = low.min(quote.low(q));
            volume += quote.volume(q);
        }

        result.check(
            (bar.open - open).abs() <= PARITY_TOLERANCE
                && (bar.close - close).abs() <= PARITY_TOLERANCE
                && (bar.high - high).abs() <= PARITY_TOLERANCE
                && (bar.low - low).abs() <= PARITY_TOLERANCE
                && (bar.volume - volume).abs() <= 1e-6,
            || {
                format!(
                    "exec bar {idx} (ts_open {}) does not aggregate its minutes",
                    bar.ts_open_ms
                )
            },
        );
    }

    Ok(result)
}

/// Determinism gate: run the backtest twice and compare the full artifact
/// content hashes. A mismatch is fatal (exit code 4).
pub fn determinism_audit(play: &Play, feeds: &MultiFeed, config: RunConfig) -> Result<AuditResult> {
    let mut result = AuditResult::new("determinism");

    let hash_of_run = |feeds: MultiFeed| -> Result<String> {
        let report = run_backtest(play, feeds, config)?;
        let metrics = compute_metrics(&report);

        #[derive(Serialize)]
        struct RunDigest<'a> {
            trades: &'a [crate::exchange::ClosedTrade],
            equity: &'a [crate::runner::EquityPoint],
            metrics: &'a crate::metrics::Metrics,
            ast_hash: &'a str,
        }
        hash_canonical(&RunDigest {
            trades: &report.trades,
            equity: &report.equity_curve,
            metrics: &metrics,
            ast_hash: &report.ast_hash,
        })
    };

    let first = hash_of_run(feeds.clone())?;
    let second = hash_of_run(feeds.clone())?;
    result.check(first == second, || {
        format!("artifact hashes differ: {first} != {second}")
    });

    if !result.passed {
        return Err(PerpLabError::Determinism(
            "two identical runs produced different artifacts".into(),
        ));
    }
    Ok(result)
}

/// AST idempotence: compile, serialise, re-compile; the hash must agree.
pub fn ast_idempotence_audit(
    play: &Play,
    feeds: &MultiFeed,
    structures: &StructureEngine,
    limits: RuleLimits,
) -> Result<AuditResult> {
    let mut result = AuditResult::new("ast_idempotence");
    let first = compile_blocks(&play.blocks, feeds, structures, limits)?;

    // Round-trip the declarative blocks through JSON, then re-compile.
    let serialised = serde_json::to_string(&play.blocks)?;
    let reparsed: Vec<crate::rules::BlockSpec> = serde_json::from_str(&serialised)?;
    let second = compile_blocks(&reparsed, feeds, structures, limits)?;

    result.check(first.ast_hash == second.ast_hash, || {
        format!("ast hash changed across round-trip: {} != {}", first.ast_hash, second.ast_hash)
    });
    Ok(result)
}
