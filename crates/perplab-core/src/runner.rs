//! Run orchestration: warmup, the trading loop, and the 1-minute sub-loop.
//!
//! The runner owns every mutable piece for one run (structures, rule state,
//! the exchange) and sequences them deterministically: structures update on
//! the closed exec bar, the exchange replays the bar's minute path for
//! pre-existing orders and brackets, then the sub-loop walks the same
//! minutes evaluating rules with the minute close as mark price. At most
//! one entry is submitted per exec bar; exits may repeat up to a full
//! close.

use crate::bar::Bar;
use crate::error::{PerpLabError, Result};
use crate::exchange::{
    ClosedTrade, Exchange, Fill, FillReason, LedgerSnapshot, OrderRequest, Rejection, Side,
    SubmitOutcome,
};
use crate::feed::MultiFeed;
use crate::params::ParamValue;
use crate::play::{BracketRule, ExitMode, Play};
use crate::risk::{bracket_prices, size_entry, SizeOutcome};
use crate::rules::{
    compile_blocks, evaluate_snapshot, CompiledRules, IntentKind, MetadataBinding, RuleLimits,
    RuleState,
};
use crate::snapshot::{PathRef, PathResolver, Snapshot};
use crate::structure::StructureEngine;
use serde::{Deserialize, Serialize};

const DAY_MS: i64 = 86_400_000;

/// Window and limits for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub rule_limits: RuleLimits,
}

/// One point of the equity curve, recorded at each exec bar close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts_ms: i64,
    pub equity_usdt: f64,
    pub cash_usdt: f64,
    pub position_margin_usdt: f64,
    pub unrealized_pnl_usdt: f64,
    pub mark_price: f64,
}

impl EquityPoint {
    fn from_ledger(ts_ms: i64, mark_price: f64, ledger: &LedgerSnapshot) -> Self {
        Self {
            ts_ms,
            equity_usdt: ledger.equity_usdt,
            cash_usdt: ledger.cash_usdt,
            position_margin_usdt: ledger.position_margin_usdt,
            unrealized_pnl_usdt: ledger.unrealized_pnl_usdt,
            mark_price,
        }
    }
}

/// Metadata value resolved at emit time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResolvedMeta {
    Static(ParamValue),
    Feature(f64),
}

/// A processed signal, kept for diagnostics and audits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalRecord {
    pub ts_ms: i64,
    pub block_id: String,
    pub action: IntentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<(String, ResolvedMeta)>,
    /// Whether the signal led to an order submission.
    pub submitted: bool,
}

/// Everything a completed run produced.
#[derive(Debug)]
pub struct RunReport {
    pub play_id: String,
    pub play_version: String,
    pub symbol: String,
    pub starting_equity_usdt: f64,
    pub final_equity_usdt: f64,
    pub warmup_bars: usize,
    pub bars_processed: usize,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub first_trading_ts_ms: i64,
    pub last_trading_ts_ms: i64,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<ClosedTrade>,
    pub fills: Vec<Fill>,
    pub rejections: Vec<Rejection>,
    pub signals: Vec<SignalRecord>,
    pub total_fees_usdt: f64,
    pub total_funding_usdt: f64,
    pub signals_emitted: usize,
    pub entries_submitted: usize,
    pub liquidations: usize,
    pub stopped_by_daily_loss: bool,
    /// Hash of the compiled rule AST, for the manifest.
    pub ast_hash: String,
    /// Exec bars where rules were evaluated (after warmup).
    pub evaluated_bars: usize,
}

/// The single entry point: run `play` over `feeds` for the given window.
///
/// `feeds` must carry raw OHLCV for every declared role plus the 1-minute
/// quote feed; indicators are computed here. Preflight checks should have
/// run before this call, but hard failures (missing warmup data) are still
/// rejected rather than mis-simulated.
pub fn run_backtest(play: &Play, mut feeds: MultiFeed, config: RunConfig) -> Result<RunReport> {
    play.validate()?;

    // Prep: indicators once per declared feature, dense columns per role.
    for (role, resolved) in play.resolved_features()? {
        let feed = feeds.feed_mut(role).ok_or_else(|| {
            PerpLabError::Config(format!("feature '{}' on undeclared role {role}", resolved.key))
        })?;
        resolved.compute_into(feed)?;
    }

    let mut structures = StructureEngine::from_decls(&play.structures, feeds.exec())?;
    let rules = compile_blocks(&play.blocks, &feeds, &structures, config.rule_limits)?;
    let mut rule_state = RuleState::new(&rules);

    let warmup_bars = compute_warmup(play, &feeds, &structures, &rules)?;

    // Bracket ATR lookups are compiled once, like every other path.
    let atr_path = compile_bracket_atr_path(play, &feeds, &structures)?;

    let exec_len = feeds.exec().len();
    let trading_start = first_idx_at_or_after(&feeds, config.window_start_ms);
    let trading_end = feeds
        .exec()
        .idx_at_or_before(config.window_end_ms)
        .ok_or_else(|| {
            PerpLabError::Preflight("window ends before the first exec bar".into())
        })?;

    if trading_start > trading_end || trading_start >= exec_len {
        return Err(PerpLabError::Preflight(format!(
            "empty trading window: start idx {trading_start}, end idx {trading_end}"
        )));
    }
    if trading_start < warmup_bars {
        return Err(PerpLabError::Preflight(format!(
            "warmup needs {warmup_bars} exec bars before the window, only {trading_start} available"
        )));
    }

    // Warmup: detectors see every bar, nothing else runs.
    for idx in trading_start - warmup_bars..trading_start {
        let bar = feeds.exec().bar(idx);
        structures.update_bar(idx, &bar, feeds.exec());
    }

    tracing::info!(
        play = %play.id,
        symbol = %play.symbol,
        warmup_bars,
        bars = trading_end - trading_start + 1,
        "starting trading loop"
    );

    let mut exchange = Exchange::new(play.account.clone());
    let mut equity_curve = Vec::with_capacity(trading_end - trading_start + 1);
    let mut fills: Vec<Fill> = Vec::new();
    let mut signals: Vec<SignalRecord> = Vec::new();
    let mut minute_buf: Vec<Bar> = Vec::with_capacity(
        feeds.exec().tf().minutes() as usize,
    );
    let mut signals_emitted = 0usize;
    let mut entries_submitted = 0usize;
    let mut liquidations = 0usize;
    let mut stopped_by_daily_loss = false;
    let mut evaluated_bars = 0usize;

    let mut current_day = i64::MIN;
    let mut day_open_equity = play.account.starting_equity_usdt;
    let mut last_equity = play.account.starting_equity_usdt;

    let mut bar_idx = trading_start;
    while bar_idx <= trading_end {
        let bar = feeds.exec().bar(bar_idx);

        // 1-2. Canonical bar, incremental structures.
        structures.update_bar(bar_idx, &bar, feeds.exec());

        // 3. Exchange: queued orders, liquidation, bracket, funding, MTM.
        let (q_start, q_end) = feeds.quote_range_for_exec(bar_idx);
        minute_buf.clear();
        for q in q_start..q_end {
            minute_buf.push(feeds.quote().bar(q));
        }
        let step = exchange.process_bar(&bar, &minute_buf)?;
        if step.liquidated {
            liquidations += 1;
        }
        fills.extend(step.fills.iter().copied());

        // 4. Terminal daily stop, if configured.
        let day = bar.ts_close_ms.div_euclid(DAY_MS);
        if day != current_day {
            current_day = day;
            day_open_equity = last_equity;
        }
        if let Some(limit_pct) = play.policy.daily_loss_limit_pct {
            let floor = day_open_equity * (1.0 - limit_pct / 100.0);
            if step.ledger.equity_usdt < floor {
                tracing::warn!(
                    equity = step.ledger.equity_usdt,
                    floor,
                    "daily loss limit hit; halting run"
                );
                if let Some(fill) = exchange.close_position_market(
                    bar.close,
                    FillReason::ExitSignal,
                    bar.ts_close_ms,
                )? {
                    fills.push(fill);
                }
                let ledger = exchange.ledger_snapshot(bar.close);
                equity_curve.push(EquityPoint::from_ledger(bar.ts_close_ms, bar.close, &ledger));
                stopped_by_daily_loss = true;
                break;
            }
        }

        // 5-6. 1-minute sub-loop: snapshot, evaluate, size, submit.
        evaluated_bars += 1;
        let mut entered_this_bar = false;
        'minutes: for q in q_start..q_end {
            let snap = Snapshot::new(&feeds, &structures, bar_idx, q);
            let outcomes = evaluate_snapshot(&rules, &snap, &mut rule_state);

            for outcome in &outcomes {
                for intent in outcome.intents {
                    if intent.kind == IntentKind::NoAction {
                        continue;
                    }
                    signals_emitted += 1;

                    let metadata = resolve_metadata(&intent.metadata, &snap)?;
                    let mut submitted = false;

                    match intent.kind {
                        IntentKind::EntryLong | IntentKind::EntryShort => {
                            let side = if intent.kind == IntentKind::EntryLong {
                                Side::Long
                            } else {
                                Side::Short
                            };
                            if !entered_this_bar
                                && exchange.position().is_none()
                                && direction_allowed(play, side)
                            {
                                submitted = try_enter(
                                    play,
                                    &mut exchange,
                                    &snap,
                                    side,
                                    atr_path.as_ref(),
                                    &mut fills,
                                )?;
                                if submitted {
                                    entries_submitted += 1;
                                    entered_this_bar = true;
                                }
                            }
                        }
                        IntentKind::ExitLong | IntentKind::ExitShort | IntentKind::ExitAll => {
                            if play.policy.exit_mode != ExitMode::SlTpOnly {
                                submitted = try_exit(
                                    &mut exchange,
                                    &snap,
                                    intent.kind,
                                    intent.percent,
                                    &mut fills,
                                )?;
                            }
                        }
                        IntentKind::NoAction => unreachable!("filtered above"),
                    }

                    signals.push(SignalRecord {
                        ts_ms: snap.ts_ms(),
                        block_id: outcome.block_id.to_string(),
                        action: intent.kind,
                        percent: intent.percent,
                        metadata,
                        submitted,
                    });

                    // One entry per exec bar: the first submission that
                    // sticks ends this bar's evaluation.
                    if submitted && intent.kind.is_entry() {
                        break 'minutes;
                    }
                }
            }
        }

        // 7. Equity point at bar close, after sub-loop fills.
        let ledger = exchange.ledger_snapshot(bar.close);
        last_equity = ledger.equity_usdt;
        equity_curve.push(EquityPoint::from_ledger(bar.ts_close_ms, bar.close, &ledger));

        bar_idx += 1;
    }

    // End of data: flatten any open position at the last processed close.
    if !stopped_by_daily_loss {
        let last_bar = feeds.exec().bar(trading_end);
        if let Some(fill) = exchange.close_position_market(
            last_bar.close,
            FillReason::ExitEndOfData,
            last_bar.ts_close_ms,
        )? {
            fills.push(fill);
            let ledger = exchange.ledger_snapshot(last_bar.close);
            last_equity = ledger.equity_usdt;
            if let Some(point) = equity_curve.last_mut() {
                *point = EquityPoint::from_ledger(last_bar.ts_close_ms, last_bar.close, &ledger);
            }
        }
    }

    let first_trading_ts_ms = feeds.exec().ts_open(trading_start);
    let last_trading_ts_ms = equity_curve
        .last()
        .map(|p| p.ts_ms)
        .unwrap_or(first_trading_ts_ms);

    tracing::info!(
        trades = exchange.trades().len(),
        final_equity = last_equity,
        "run complete"
    );

    Ok(RunReport {
        play_id: play.id.clone(),
        play_version: play.version.clone(),
        symbol: play.symbol.clone(),
        starting_equity_usdt: play.account.starting_equity_usdt,
        final_equity_usdt: last_equity,
        warmup_bars,
        bars_processed: equity_curve.len(),
        window_start_ms: config.window_start_ms,
        window_end_ms: config.window_end_ms,
        first_trading_ts_ms,
        last_trading_ts_ms,
        equity_curve,
        trades: exchange.trades().to_vec(),
        fills,
        rejections: exchange.rejections().to_vec(),
        signals,
        total_fees_usdt: exchange.total_fees_usdt(),
        total_funding_usdt: exchange.total_funding_usdt(),
        signals_emitted,
        entries_submitted,
        liquidations,
        stopped_by_daily_loss,
        ast_hash: rules.ast_hash.clone(),
        evaluated_bars,
    })
}

fn direction_allowed(play: &Play, side: Side) -> bool {
    match side {
        Side::Long => play.policy.direction.allows_long(),
        Side::Short => play.policy.direction.allows_short(),
    }
}

/// Size and submit an entry at the snapshot's mark price. Returns whether
/// an order was submitted (filled or rejected by the venue).
fn try_enter(
    play: &Play,
    exchange: &mut Exchange,
    snap: &Snapshot<'_>,
    side: Side,
    atr_path: Option<&PathRef>,
    fills: &mut Vec<Fill>,
) -> Result<bool> {
    let mark = snap.mark_price();
    let atr = atr_path.map(|p| snap.get(p)).unwrap_or(f64::NAN);

    let Some((sl, tp)) = bracket_prices(
        &play.risk,
        play.policy.exit_mode,
        side,
        mark,
        play.risk.sizing.leverage(),
        atr,
    )?
    else {
        // Bracket not priceable yet (cold ATR): skip, never default.
        tracing::debug!(ts = snap.ts_ms(), "entry skipped: bracket not priceable");
        return Ok(false);
    };

    let ledger = exchange.ledger_snapshot(mark);
    let outcome = size_entry(
        &play.risk,
        ledger.equity_usdt,
        ledger.available_balance_usdt,
        play.account.max_leverage,
        play.account.min_notional_usdt,
        mark,
        atr,
    )?;

    let (size_usdt, leverage) = match outcome {
        SizeOutcome::Sized {
            size_usdt,
            leverage,
        } => (size_usdt, leverage),
        SizeOutcome::BelowMin { size_usdt } => {
            // Counted through the venue's rejection path.
            let req = OrderRequest::market(side, size_usdt, play.risk.sizing.leverage());
            exchange.submit(req, mark, snap.ts_ms())?;
            return Ok(false);
        }
        SizeOutcome::Zero => return Ok(false),
    };

    let req = OrderRequest::market(side, size_usdt, leverage).with_bracket(sl, tp);
    match exchange.submit(req, mark, snap.ts_ms())? {
        SubmitOutcome::Filled(fill) => {
            fills.push(fill);
            Ok(true)
        }
        SubmitOutcome::Resting(_) => Ok(true),
        SubmitOutcome::Rejected(_) => Ok(false),
    }
}

/// Submit a reduce-only exit for the matching intent, honouring `percent`.
fn try_exit(
    exchange: &mut Exchange,
    snap: &Snapshot<'_>,
    kind: IntentKind,
    percent: Option<f64>,
    fills: &mut Vec<Fill>,
) -> Result<bool> {
    let Some(pos) = exchange.position() else {
        return Ok(false);
    };
    let matches_side = match kind {
        IntentKind::ExitLong => pos.side == Side::Long,
        IntentKind::ExitShort => pos.side == Side::Short,
        IntentKind::ExitAll => true,
        _ => false,
    };
    if !matches_side {
        return Ok(false);
    }

    let fraction = percent.unwrap_or(100.0) / 100.0;
    let size_usdt = pos.size_usdt * fraction;
    let leverage = pos.leverage;
    let order_side = pos.side.opposite();

    let req = OrderRequest::market(order_side, size_usdt, leverage).reduce_only();
    match exchange.submit(req, snap.mark_price(), snap.ts_ms())? {
        SubmitOutcome::Filled(fill) => {
            fills.push(fill);
            Ok(true)
        }
        SubmitOutcome::Resting(_) => Ok(true),
        SubmitOutcome::Rejected(_) => Ok(false),
    }
}

/// Resolve intent metadata against the snapshot; unresolvable feature
/// bindings fail the run loudly.
fn resolve_metadata(
    bindings: &[(String, MetadataBinding)],
    snap: &Snapshot<'_>,
) -> Result<Vec<(String, ResolvedMeta)>> {
    bindings
        .iter()
        .map(|(key, binding)| match binding {
            MetadataBinding::Static(v) => Ok((key.clone(), ResolvedMeta::Static(v.clone()))),
            MetadataBinding::Feature(path) => {
                let value = snap.get(path);
                if value.is_nan() {
                    return Err(PerpLabError::Evaluation(format!(
                        "metadata '{key}' references '{}' which is unresolved at ts {}",
                        path.canonical(),
                        snap.ts_ms()
                    )));
                }
                Ok((key.clone(), ResolvedMeta::Feature(value)))
            }
        })
        .collect()
}

/// Compile the bracket's ATR feature path, if the risk model uses one.
/// When both bracket legs are ATR-based they must share one feature; two
/// different columns would make "the ATR at entry" ambiguous.
fn compile_bracket_atr_path(
    play: &Play,
    feeds: &MultiFeed,
    structures: &StructureEngine,
) -> Result<Option<PathRef>> {
    let mut keys: Vec<&str> = Vec::new();
    for rule in [&play.risk.stop_loss, &play.risk.take_profit]
        .into_iter()
        .flatten()
    {
        if let BracketRule::AtrMult { atr_key, .. } = rule {
            if !keys.contains(&atr_key.as_str()) {
                keys.push(atr_key);
            }
        }
    }
    match keys.as_slice() {
        [] => Ok(None),
        [key] => {
            let resolver = PathResolver::new(feeds, structures);
            let (path, _) = resolver.compile(key)?;
            Ok(Some(path))
        }
        _ => Err(PerpLabError::Config(format!(
            "stop_loss and take_profit reference different ATR features: {}",
            keys.join(", ")
        ))),
    }
}

/// Warmup is the max of indicator, structure and rule-window requirements,
/// in exec bars.
pub fn compute_warmup(
    play: &Play,
    feeds: &MultiFeed,
    structures: &StructureEngine,
    rules: &CompiledRules,
) -> Result<usize> {
    let exec_tf = feeds.exec().tf();
    let mut warmup = 0usize;

    for (role, resolved) in play.resolved_features()? {
        let role_tf = feeds
            .feed(role)
            .map(|f| f.tf())
            .unwrap_or(exec_tf);
        let dilation = role_tf.dilation(exec_tf)? as usize;
        warmup = warmup.max(resolved.warmup_bars * dilation);
    }

    warmup = warmup.max(structures.warmup_bars());
    warmup = warmup.max(rules.warmup_exec_bars);
    Ok(warmup)
}

fn first_idx_at_or_after(feeds: &MultiFeed, ts_ms: i64) -> usize {
    let exec = feeds.exec();
    let mut idx = exec.idx_at_or_before(ts_ms).map(|i| i + 1).unwrap_or(0);
    // idx now points at the first bar closing after ts; step back while its
    // open is still inside the window.
    while idx > 0 && exec.ts_open(idx - 1) >= ts_ms {
        idx -= 1;
    }
    idx
}
