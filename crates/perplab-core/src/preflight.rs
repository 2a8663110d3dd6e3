//! Preflight: data-coverage and feasibility checks before a run.
//!
//! Checks for:
//! - OHLCV coverage per declared timeframe, window minus warmup
//! - 1-minute quote coverage over the whole window (>= 95% required)
//! - Warmup computability from the registries
//! - Window operators within the configured maximum (via rule compilation)
//! - Basic data quality (gaps, OHLC violations)
//!
//! Failures carry actionable diagnostics and map to process exit code 2.

use crate::error::{PerpLabError, Result};
use crate::feed::{Feed, MultiFeed};
use crate::play::Play;
use crate::rules::{compile_blocks, RuleLimits};
use crate::runner::compute_warmup;
use crate::structure::StructureEngine;
use crate::timeframe::TfRole;
use serde::Serialize;

/// Minimum acceptable 1-minute coverage over the trading window.
pub const MIN_QUOTE_COVERAGE: f64 = 0.95;

/// Coverage numbers for one feed role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleCoverage {
    pub role: TfRole,
    pub tf: String,
    pub first_ts_open_ms: i64,
    pub last_ts_close_ms: i64,
    pub bars_present: usize,
    pub bars_expected: usize,
    pub coverage: f64,
    /// Interior gaps (missing bars between present neighbours).
    pub gap_bars: usize,
}

/// A data-quality finding that does not necessarily fail preflight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QualityIssue {
    Gap {
        role: TfRole,
        after_ts_close_ms: i64,
        missing_bars: usize,
    },
    InvalidOhlc {
        role: TfRole,
        ts_open_ms: i64,
        reason: String,
    },
}

/// The preflight result for one (play, window) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreflightReport {
    pub play_id: String,
    pub symbol: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub warmup_bars: usize,
    pub warmup_start_ms: i64,
    pub roles: Vec<RoleCoverage>,
    pub quote_coverage: f64,
    pub issues: Vec<QualityIssue>,
    pub ok: bool,
}

/// Run every preflight check. Indicator columns are computed here (they
/// are needed to resolve rule paths and are reused by the run itself).
///
/// Returns the report on success; gate failures return a
/// [`PerpLabError::Preflight`] carrying the first actionable diagnostic.
pub fn run_preflight(
    play: &Play,
    feeds: &mut MultiFeed,
    window_start_ms: i64,
    window_end_ms: i64,
    limits: RuleLimits,
) -> Result<PreflightReport> {
    play.validate()?;

    if window_end_ms <= window_start_ms {
        return Err(PerpLabError::Preflight(format!(
            "window end {window_end_ms} is not after start {window_start_ms}"
        )));
    }

    // Prep indicators so that structures and rules can resolve columns.
    for (role, resolved) in play.resolved_features()? {
        let feed = feeds.feed_mut(role).ok_or_else(|| {
            PerpLabError::Config(format!(
                "feature '{}' declared on role {role} with no feed loaded",
                resolved.key
            ))
        })?;
        resolved.compute_into(feed)?;
    }

    // Warmup must be computable from the registries; rule compilation also
    // enforces the window-operator maximum.
    let structures = StructureEngine::from_decls(&play.structures, feeds.exec())?;
    let rules = compile_blocks(&play.blocks, feeds, &structures, limits)?;
    let warmup_bars = compute_warmup(play, feeds, &structures, &rules)?;
    let warmup_start_ms = window_start_ms - warmup_bars as i64 * feeds.exec().tf().duration_ms();

    let mut issues = Vec::new();
    let mut roles = Vec::new();

    for role in feeds.roles().collect::<Vec<_>>() {
        let feed = feeds.feed(role).expect("role listed by the store");
        // Every role must reach back through the warmup span; coarser-role
        // indicator warmups are already folded into the exec-bar count.
        let required_start = warmup_start_ms;
        let coverage = role_coverage(feed, role, required_start, window_end_ms, &mut issues)?;

        if coverage.first_ts_open_ms > required_start {
            return Err(PerpLabError::Preflight(format!(
                "{role} data starts at {} but warmup needs {} ({} bars before the window); \
                 extend the input range or reduce warmup",
                coverage.first_ts_open_ms, required_start, warmup_bars
            )));
        }
        if coverage.last_ts_close_ms < window_end_ms {
            return Err(PerpLabError::Preflight(format!(
                "{role} data ends at {} before the window end {window_end_ms}",
                coverage.last_ts_close_ms
            )));
        }

        roles.push(coverage);
    }

    // Dense 1-minute coverage gate over the whole window.
    let quote = feeds.quote();
    let window_minutes = ((window_end_ms - window_start_ms) / 60_000) as usize;
    let present = count_bars_between(quote, window_start_ms, window_end_ms);
    let quote_coverage = if window_minutes > 0 {
        present as f64 / window_minutes as f64
    } else {
        0.0
    };
    if quote_coverage < MIN_QUOTE_COVERAGE {
        return Err(PerpLabError::Preflight(format!(
            "1-minute coverage {:.2}% is below the {:.0}% gate ({present} of {window_minutes} \
             minutes); run data sync or shrink the window",
            quote_coverage * 100.0,
            MIN_QUOTE_COVERAGE * 100.0
        )));
    }

    Ok(PreflightReport {
        play_id: play.id.clone(),
        symbol: play.symbol.clone(),
        window_start_ms,
        window_end_ms,
        warmup_bars,
        warmup_start_ms,
        roles,
        quote_coverage,
        issues,
        ok: true,
    })
}

fn role_coverage(
    feed: &Feed,
    role: TfRole,
    from_ms: i64,
    to_ms: i64,
    issues: &mut Vec<QualityIssue>,
) -> Result<RoleCoverage> {
    if feed.is_empty() {
        return Err(PerpLabError::Preflight(format!("{role} feed is empty")));
    }

    let tf_ms = feed.tf().duration_ms();
    let first = feed.first_ts_open().expect("non-empty");
    let last = feed.last_ts_close().expect("non-empty");

    // Interior gaps and shape checks over the requested range.
    let mut gap_bars = 0usize;
    let mut prev_close: Option<i64> = None;
    let mut present = 0usize;
    for idx in 0..feed.len() {
        let bar = feed.bar(idx);
        if bar.ts_close_ms <= from_ms || bar.ts_open_ms >= to_ms {
            continue;
        }
        present += 1;

        if let Err(e) = bar.validate(feed.tf()) {
            issues.push(QualityIssue::InvalidOhlc {
                role,
                ts_open_ms: bar.ts_open_ms,
                reason: e.to_string(),
            });
        }

        if let Some(prev) = prev_close {
            if bar.ts_open_ms > prev {
                let missing = ((bar.ts_open_ms - prev) / tf_ms) as usize;
                gap_bars += missing;
                issues.push(QualityIssue::Gap {
                    role,
                    after_ts_close_ms: prev,
                    missing_bars: missing,
                });
            }
        }
        prev_close = Some(bar.ts_close_ms);
    }

    let span_start = from_ms.max(first);
    let expected = (((to_ms - span_start).max(0)) / tf_ms) as usize;
    let coverage = if expected > 0 {
        present as f64 / expected as f64
    } else {
        1.0
    };

    Ok(RoleCoverage {
        role,
        tf: feed.tf().label(),
        first_ts_open_ms: first,
        last_ts_close_ms: last,
        bars_present: present,
        bars_expected: expected,
        coverage,
        gap_bars,
    })
}

fn count_bars_between(feed: &Feed, from_ms: i64, to_ms: i64) -> usize {
    (0..feed.len())
        .filter(|&i| {
            let open = feed.ts_open(i);
            open >= from_ms && open < to_ms
        })
        .count()
}
