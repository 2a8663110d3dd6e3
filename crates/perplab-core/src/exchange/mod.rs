//! The simulated exchange: Bybit-style linear perpetuals, isolated margin,
//! one-way mode.
//!
//! Each exec bar is processed as a fixed phase sequence over the bar's
//! 1-minute path: liquidation check, queued order triggers, open-position
//! TP/SL (stop-loss wins ties), funding settlement, mark-to-market. Signals
//! and new submissions happen afterwards, in the runner's sub-loop.

pub mod book;
pub mod ledger;
pub mod order;
pub mod position;

pub use book::OrderBook;
pub use ledger::{Ledger, LedgerSnapshot};
pub use order::{
    Fill, FillReason, Order, OrderId, OrderStatus, OrderType, RejectReason, Rejection, Side,
    TimeInForce, TriggerDirection,
};
pub use position::{roi_stop_price, Position};

use crate::bar::Bar;
use crate::error::{PerpLabError, Result};
use crate::play::AccountConfig;
use serde::{Deserialize, Serialize};

/// One row per closing fill, the source of `trades.parquet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: i64,
    pub entry_ts_ms: i64,
    pub exit_ts_ms: i64,
    pub side: Side,
    pub size_qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Exit fee plus the pro-rata share of the entry fee.
    pub fees_usdt: f64,
    /// Net of the fees above; funding is accounted at the ledger level.
    pub pnl_usdt: f64,
    pub exit_reason: FillReason,
    pub mae_usdt: f64,
    pub mfe_usdt: f64,
    pub leverage: f64,
}

/// Everything needed to submit one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub side: Side,
    pub size_usdt: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub trigger_direction: Option<TriggerDirection>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: f64,
}

impl OrderRequest {
    pub fn market(side: Side, size_usdt: f64, leverage: f64) -> Self {
        Self {
            side,
            size_usdt,
            order_type: OrderType::Market,
            limit_price: None,
            trigger_price: None,
            trigger_direction: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
            leverage,
        }
    }

    pub fn with_bracket(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Market order executed immediately.
    Filled(Fill),
    /// Limit/stop order accepted into the book.
    Resting(OrderId),
    /// Rejected with a recorded reason; not an error.
    Rejected(RejectReason),
}

/// Per-bar result from [`Exchange::process_bar`].
#[derive(Debug, Clone)]
pub struct BarStep {
    pub fills: Vec<Fill>,
    pub liquidated: bool,
    pub ledger: LedgerSnapshot,
}

/// The exchange state for one run.
#[derive(Debug)]
pub struct Exchange {
    account: AccountConfig,
    book: OrderBook,
    position: Option<Position>,
    ledger: Ledger,
    next_order_id: OrderId,
    next_trade_id: i64,
    rejections: Vec<Rejection>,
    trades: Vec<ClosedTrade>,
    total_fees_usdt: f64,
    total_funding_usdt: f64,
}

const FUNDING_INTERVAL_MS: i64 = 8 * 60 * 60 * 1000;

impl Exchange {
    pub fn new(account: AccountConfig) -> Self {
        let ledger = Ledger::new(account.starting_equity_usdt);
        Self {
            account,
            book: OrderBook::new(),
            position: None,
            ledger,
            next_order_id: 1,
            next_trade_id: 1,
            rejections: Vec::new(),
            trades: Vec::new(),
            total_fees_usdt: 0.0,
            total_funding_usdt: 0.0,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn trades(&self) -> &[ClosedTrade] {
        &self.trades
    }

    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    pub fn total_fees_usdt(&self) -> f64 {
        self.total_fees_usdt
    }

    pub fn total_funding_usdt(&self) -> f64 {
        self.total_funding_usdt
    }

    pub fn ledger_snapshot(&self, mark: f64) -> LedgerSnapshot {
        self.ledger.snapshot(
            self.position.as_ref(),
            mark,
            self.account.maintenance_margin_rate,
        )
    }

    pub fn equity(&self, mark: f64) -> f64 {
        self.ledger_snapshot(mark).equity_usdt
    }

    fn taker_frac(&self) -> f64 {
        self.account.taker_fee_bps / 10_000.0
    }

    fn maker_frac(&self) -> f64 {
        self.account.maker_fee_bps / 10_000.0
    }

    fn slip_frac(&self) -> f64 {
        self.account.slippage_bps / 10_000.0
    }

    /// Slippage-adjusted execution price for the executing order side:
    /// buys (long orders) pay up, sells receive less.
    fn slipped(&self, price: f64, order_side: Side) -> f64 {
        price * (1.0 + order_side.sign() * self.slip_frac())
    }

    fn reject(&mut self, ts_ms: i64, reason: RejectReason, side: Side, size_usdt: f64) -> SubmitOutcome {
        tracing::debug!(reason = reason.as_str(), %side, size_usdt, "order rejected");
        self.rejections.push(Rejection {
            ts_ms,
            reason,
            side,
            size_usdt,
        });
        SubmitOutcome::Rejected(reason)
    }

    /// Submit an order at evaluation time. `mark` is the current 1-minute
    /// mark price; market orders execute against it immediately.
    pub fn submit(&mut self, req: OrderRequest, mark: f64, ts_ms: i64) -> Result<SubmitOutcome> {
        if req.leverage < 1.0 || req.leverage > self.account.max_leverage {
            return Ok(self.reject(ts_ms, RejectReason::ExceedsMaxLeverage, req.side, req.size_usdt));
        }

        if req.reduce_only {
            let position_side = self.position.as_ref().map(|p| p.side);
            match position_side {
                None => {
                    return Ok(self.reject(
                        ts_ms,
                        RejectReason::ReduceOnlyWithoutPosition,
                        req.side,
                        req.size_usdt,
                    ))
                }
                Some(side) if side == req.side => {
                    // A reduce-only order must oppose the position.
                    return Ok(self.reject(
                        ts_ms,
                        RejectReason::OneWayViolation,
                        req.side,
                        req.size_usdt,
                    ));
                }
                Some(_) => {}
            }
        } else {
            if self.position.is_some() {
                return Ok(self.reject(
                    ts_ms,
                    RejectReason::OneWayViolation,
                    req.side,
                    req.size_usdt,
                ));
            }
            if req.size_usdt < self.account.min_notional_usdt {
                return Ok(self.reject(
                    ts_ms,
                    RejectReason::BelowMinNotional,
                    req.side,
                    req.size_usdt,
                ));
            }
        }

        match req.order_type {
            OrderType::Market => self.execute_market(req, mark, ts_ms),
            OrderType::Limit => {
                let Some(limit) = req.limit_price else {
                    return Err(PerpLabError::Config(
                        "limit order without a limit price".into(),
                    ));
                };
                // Minimal TIF semantics at submission.
                match req.time_in_force {
                    TimeInForce::PostOnly => {
                        let crosses = match req.side {
                            Side::Long => limit >= mark,
                            Side::Short => limit <= mark,
                        };
                        if crosses {
                            return Ok(self.reject(
                                ts_ms,
                                RejectReason::TimeInForce,
                                req.side,
                                req.size_usdt,
                            ));
                        }
                    }
                    TimeInForce::Ioc | TimeInForce::Fok => {
                        // Resting is the only fill path in the simulator, so
                        // immediate-or-cancel limits can never fill.
                        return Ok(self.reject(
                            ts_ms,
                            RejectReason::TimeInForce,
                            req.side,
                            req.size_usdt,
                        ));
                    }
                    TimeInForce::Gtc => {}
                }
                Ok(SubmitOutcome::Resting(self.rest_order(req, ts_ms)))
            }
            OrderType::StopMarket | OrderType::StopLimit => {
                if req.trigger_price.is_none() || req.trigger_direction.is_none() {
                    return Err(PerpLabError::Config(
                        "stop order without trigger price/direction".into(),
                    ));
                }
                if req.order_type == OrderType::StopLimit && req.limit_price.is_none() {
                    return Err(PerpLabError::Config(
                        "stop-limit order without a limit price".into(),
                    ));
                }
                Ok(SubmitOutcome::Resting(self.rest_order(req, ts_ms)))
            }
        }
    }

    fn rest_order(&mut self, req: OrderRequest, ts_ms: i64) -> OrderId {
        let id = self.next_order_id;
        self.next_order_id += 1;
        self.book.submit(Order {
            id,
            side: req.side,
            size_usdt: req.size_usdt,
            order_type: req.order_type,
            limit_price: req.limit_price,
            trigger_price: req.trigger_price,
            trigger_direction: req.trigger_direction,
            time_in_force: req.time_in_force,
            reduce_only: req.reduce_only,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            leverage: req.leverage,
            created_ts_ms: ts_ms,
            status: OrderStatus::New,
        });
        id
    }

    pub fn cancel_order(&mut self, id: OrderId) -> bool {
        self.book.cancel(id)
    }

    pub fn amend_order(&mut self, id: OrderId, f: impl FnOnce(&mut Order)) -> bool {
        self.book.amend(id, f)
    }

    fn execute_market(
        &mut self,
        req: OrderRequest,
        mark: f64,
        ts_ms: i64,
    ) -> Result<SubmitOutcome> {
        if req.reduce_only {
            let price = self.slipped(mark, req.side);
            let fill =
                self.close_against_position(price, req.size_usdt, FillReason::ExitSignal, ts_ms)?;
            return Ok(match fill {
                Some(f) => SubmitOutcome::Filled(f),
                None => self.reject(
                    ts_ms,
                    RejectReason::ReduceOnlyWithoutPosition,
                    req.side,
                    req.size_usdt,
                ),
            });
        }

        let price = self.slipped(mark, req.side);
        let fee = self.taker_frac() * req.size_usdt;
        let margin = req.size_usdt / req.leverage;
        if margin + fee > self.ledger.cash_usdt {
            return Ok(self.reject(
                ts_ms,
                RejectReason::InsufficientBalance,
                req.side,
                req.size_usdt,
            ));
        }

        let position = Position::open(
            req.side,
            req.size_usdt,
            price,
            req.leverage,
            fee,
            req.stop_loss,
            req.take_profit,
            ts_ms,
        );
        self.ledger.on_open(position.margin_usdt, fee);
        self.total_fees_usdt += fee;

        let fill = Fill {
            ts_ms,
            price,
            size_qty: position.size_qty,
            fee_usdt: fee,
            reason: FillReason::Entry,
            slippage_applied_bps: self.account.slippage_bps,
        };
        tracing::debug!(side = %req.side, price, size_usdt = req.size_usdt, "entry filled");
        self.position = Some(position);
        Ok(SubmitOutcome::Filled(fill))
    }

    /// Close part or all of the open position at `price`. `size_usdt` is
    /// the requested exit notional, clamped to the remaining position
    /// (reduce-only semantics). Returns None when flat.
    fn close_against_position(
        &mut self,
        price: f64,
        size_usdt: f64,
        reason: FillReason,
        ts_ms: i64,
    ) -> Result<Option<Fill>> {
        let taker_frac = self.taker_frac();
        let Some(pos) = self.position.as_mut() else {
            return Ok(None);
        };

        let qty_requested = size_usdt / pos.entry_price;
        let qty_closed = qty_requested.min(pos.size_qty);
        let gross = (price - pos.entry_price) * qty_closed * pos.side.sign();

        let fee = if reason == FillReason::ExitLiquidation {
            // The close fee is baked into the bankruptcy price.
            0.0
        } else {
            taker_frac * qty_closed * price
        };

        let entry_fee_share = pos.entry_fee_per_qty * qty_closed;
        let mae = pos.max_adverse_usdt;
        let mfe = pos.max_favorable_usdt;
        let side = pos.side;
        let entry_price = pos.entry_price;
        let entry_ts = pos.opened_ts_ms;
        let leverage = pos.leverage;

        pos.fees_usdt += fee;
        let margin_released = pos.reduce(qty_closed);
        let now_flat = pos.is_dust();

        self.ledger.on_close(margin_released, gross - fee);
        self.total_fees_usdt += fee;

        let reason = if !now_flat && reason == FillReason::ExitSignal {
            FillReason::ExitPartial
        } else {
            reason
        };

        self.trades.push(ClosedTrade {
            trade_id: self.next_trade_id,
            entry_ts_ms: entry_ts,
            exit_ts_ms: ts_ms,
            side,
            size_qty: qty_closed,
            entry_price,
            exit_price: price,
            fees_usdt: fee + entry_fee_share,
            pnl_usdt: gross - fee - entry_fee_share,
            exit_reason: reason,
            mae_usdt: mae,
            mfe_usdt: mfe,
            leverage,
        });
        self.next_trade_id += 1;

        if now_flat {
            self.position = None;
            self.book.cancel_reduce_only();
        }

        tracing::debug!(
            reason = reason.as_str(),
            price,
            qty = qty_closed,
            flat = now_flat,
            "exit filled"
        );

        Ok(Some(Fill {
            ts_ms,
            price,
            size_qty: qty_closed,
            fee_usdt: fee,
            reason,
            slippage_applied_bps: 0.0,
        }))
    }

    /// Force-close at `mark` (end of data or terminal stop).
    pub fn close_position_market(
        &mut self,
        mark: f64,
        reason: FillReason,
        ts_ms: i64,
    ) -> Result<Option<Fill>> {
        let Some(pos) = self.position.as_ref() else {
            return Ok(None);
        };
        let order_side = pos.side.opposite();
        let price = self.slipped(mark, order_side);
        let size = pos.size_usdt;
        self.close_against_position(price, size, reason, ts_ms)
    }

    /// Process one exec bar against its 1-minute path.
    ///
    /// `minutes` must be the quote bars covering `bar`'s interval in time
    /// order; when the quote feed has a gap the exec bar itself stands in
    /// as a single coarse minute.
    pub fn process_bar(&mut self, bar: &Bar, minutes: &[Bar]) -> Result<BarStep> {
        let fallback = [*bar];
        let minutes: &[Bar] = if minutes.is_empty() { &fallback } else { minutes };

        let mut fills = Vec::new();
        let mut liquidated = false;

        // Phase 1: liquidation, evaluated before anything else touches the
        // position. A bar that would both liquidate and hit TP reports the
        // liquidation.
        let liq_breach = self.position.as_ref().and_then(|pos| {
            let liq_price = pos.liquidation_price(self.account.maintenance_margin_rate);
            minutes
                .iter()
                .find(|m| match pos.side {
                    Side::Long => m.low <= liq_price,
                    Side::Short => m.high >= liq_price,
                })
                .map(|minute| {
                    (
                        pos.bankruptcy_price(),
                        pos.size_usdt,
                        minute.ts_close_ms,
                        liq_price,
                    )
                })
        });
        if let Some((price, size, ts, liq_price)) = liq_breach {
            tracing::debug!(liq_price, bankruptcy = price, "liquidation triggered");
            if let Some(fill) =
                self.close_against_position(price, size, FillReason::ExitLiquidation, ts)?
            {
                fills.push(fill);
            }
            liquidated = true;
        }

        // Phase 2: queued order triggers, in submission order, each scanning
        // the minute path from the bar's start.
        for id in self.book.active_ids() {
            if let Some(fill) = self.try_fill_resting(id, minutes)? {
                fills.push(fill);
            }
        }

        // Phase 3: open-position TP/SL over the minute path. On a minute
        // where both would trigger, the stop-loss wins.
        if self.position.is_some() {
            if let Some(fill) = self.scan_bracket(minutes)? {
                fills.push(fill);
            }
        }

        // Phase 4: funding at each 8h boundary inside the bar.
        self.settle_funding(bar, minutes);

        // Phase 5: mark-to-market and invariants.
        if let Some(pos) = self.position.as_mut() {
            pos.update_excursions(bar.high, bar.low);
        }
        let ledger = self.ledger_snapshot(bar.close);
        if ledger.equity_usdt < -1e-6 {
            return Err(PerpLabError::Exchange(format!(
                "negative equity {:.6} at ts {} without liquidation",
                ledger.equity_usdt, bar.ts_close_ms
            )));
        }

        Ok(BarStep {
            fills,
            liquidated,
            ledger,
        })
    }

    /// Try to fill one resting order against the minute path. Stop-limits
    /// convert on their trigger minute and may fill as limits later in the
    /// same bar.
    fn try_fill_resting(&mut self, id: OrderId, minutes: &[Bar]) -> Result<Option<Fill>> {
        let Some(order) = self.book.get(id) else {
            return Ok(None);
        };
        if !order.is_active() {
            return Ok(None);
        }
        let order = order.clone();

        // Orphaned reduce-only orders die once the position is gone.
        if order.reduce_only && self.position.is_none() {
            self.book.cancel(id);
            return Ok(None);
        }

        let mut limit_active_from = match order.status {
            OrderStatus::Triggered => Some(0),
            _ => None,
        };

        if matches!(order.order_type, OrderType::Limit) {
            limit_active_from = Some(0);
        }

        if limit_active_from.is_none() {
            // Stop order still waiting on its trigger.
            let trigger = order.trigger_price.expect("validated at submission");
            let dir = order.trigger_direction.expect("validated at submission");
            let hit = minutes.iter().position(|m| match dir {
                TriggerDirection::RisesTo => m.high >= trigger,
                TriggerDirection::FallsTo => m.low <= trigger,
            });
            let Some(k) = hit else {
                return Ok(None);
            };

            match order.order_type {
                OrderType::StopMarket => {
                    // Fills at the trigger minute's open plus slippage.
                    let minute = &minutes[k];
                    let price = self.slipped(minute.open, order.side);
                    return self.fill_order(id, price, self.taker_frac(), minute.ts_close_ms);
                }
                OrderType::StopLimit => {
                    self.book.amend(id, |o| o.status = OrderStatus::Triggered);
                    limit_active_from = Some(k);
                }
                _ => unreachable!("trigger scan only runs for stop orders"),
            }
        }

        let from = limit_active_from.expect("set above");
        let limit = order.limit_price.expect("validated at submission");
        for minute in &minutes[from..] {
            let crossed = match order.side {
                Side::Long => minute.low <= limit,
                Side::Short => minute.high >= limit,
            };
            if !crossed {
                continue;
            }
            // Price improvement when the minute opens beyond the limit.
            let price = match order.side {
                Side::Long => minute.open.min(limit),
                Side::Short => minute.open.max(limit),
            };
            return self.fill_order(id, price, self.maker_frac(), minute.ts_close_ms);
        }

        Ok(None)
    }

    /// Execute a resting order at `price`, charging `fee_frac` of notional.
    fn fill_order(
        &mut self,
        id: OrderId,
        price: f64,
        fee_frac: f64,
        ts_ms: i64,
    ) -> Result<Option<Fill>> {
        let Some(order) = self.book.get(id).cloned() else {
            return Ok(None);
        };

        if order.reduce_only {
            let Some(fill) =
                self.close_against_position(price, order.size_usdt, FillReason::ExitSignal, ts_ms)?
            else {
                self.book.cancel(id);
                return Ok(None);
            };
            self.book.amend(id, |o| o.status = OrderStatus::Filled);
            return Ok(Some(fill));
        }

        // Entry fill from a resting order.
        if self.position.is_some() {
            // Another order got there first this bar; one-way mode.
            self.book.cancel(id);
            self.rejections.push(Rejection {
                ts_ms,
                reason: RejectReason::OneWayViolation,
                side: order.side,
                size_usdt: order.size_usdt,
            });
            return Ok(None);
        }

        let fee = fee_frac * order.size_usdt;
        let margin = order.size_usdt / order.leverage;
        if margin + fee > self.ledger.cash_usdt {
            self.book.cancel(id);
            self.rejections.push(Rejection {
                ts_ms,
                reason: RejectReason::InsufficientBalance,
                side: order.side,
                size_usdt: order.size_usdt,
            });
            return Ok(None);
        }

        let position = Position::open(
            order.side,
            order.size_usdt,
            price,
            order.leverage,
            fee,
            order.stop_loss,
            order.take_profit,
            ts_ms,
        );
        self.ledger.on_open(position.margin_usdt, fee);
        self.total_fees_usdt += fee;
        self.position = Some(position);
        self.book.amend(id, |o| o.status = OrderStatus::Filled);

        Ok(Some(Fill {
            ts_ms,
            price,
            size_qty: order.size_usdt / price,
            fee_usdt: fee,
            reason: FillReason::Entry,
            slippage_applied_bps: 0.0,
        }))
    }

    /// Walk the minute path for the open position's bracket. Fills happen
    /// at the trigger price exactly (limit fill semantics).
    fn scan_bracket(&mut self, minutes: &[Bar]) -> Result<Option<Fill>> {
        let Some(pos) = self.position.as_ref() else {
            return Ok(None);
        };
        let (sl, tp, side, size) = (pos.stop_loss, pos.take_profit, pos.side, pos.size_usdt);

        for minute in minutes {
            let sl_hit = sl.is_some_and(|p| match side {
                Side::Long => minute.low <= p,
                Side::Short => minute.high >= p,
            });
            let tp_hit = tp.is_some_and(|p| match side {
                Side::Long => minute.high >= p,
                Side::Short => minute.low <= p,
            });

            // Conservative tie-break: the stop-loss wins the minute.
            if sl_hit {
                return self.close_against_position(
                    sl.expect("sl_hit implies Some"),
                    size,
                    FillReason::ExitSl,
                    minute.ts_close_ms,
                );
            }
            if tp_hit {
                return self.close_against_position(
                    tp.expect("tp_hit implies Some"),
                    size,
                    FillReason::ExitTp,
                    minute.ts_close_ms,
                );
            }
        }
        Ok(None)
    }

    /// Settle funding for every 8-hour boundary inside `(ts_open, ts_close]`,
    /// marking at the minute that closes on the boundary.
    fn settle_funding(&mut self, bar: &Bar, minutes: &[Bar]) {
        if self.account.funding_rate_8h == 0.0 {
            return;
        }
        let Some(pos) = self.position.as_mut() else {
            return;
        };

        let mut boundary =
            (bar.ts_open_ms / FUNDING_INTERVAL_MS + 1) * FUNDING_INTERVAL_MS;
        while boundary <= bar.ts_close_ms {
            let mark = minutes
                .iter()
                .find(|m| m.ts_close_ms == boundary)
                .map(|m| m.close)
                .unwrap_or(bar.close);
            // Positive rates are paid by longs and received by shorts.
            let funding =
                -pos.side.sign() * self.account.funding_rate_8h * pos.size_qty * mark;
            pos.funding_usdt += funding;
            self.ledger.on_funding(funding);
            self.total_funding_usdt += funding;
            tracing::debug!(boundary, funding, "funding settled");
            boundary += FUNDING_INTERVAL_MS;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{account, exec_bar_from_minutes, flat_minutes};
    use super::*;

    const T0: i64 = 1_704_067_200_000; // 2024-01-01 00:00 UTC, an 8h boundary

    fn entry_long(ex: &mut Exchange, size: f64, leverage: f64, mark: f64) -> Fill {
        match ex
            .submit(OrderRequest::market(Side::Long, size, leverage), mark, T0)
            .unwrap()
        {
            SubmitOutcome::Filled(f) => f,
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[test]
    fn market_entry_locks_margin_and_pays_taker_fee() {
        let mut acct = account();
        acct.taker_fee_bps = 10.0;
        let mut ex = Exchange::new(acct);

        let fill = entry_long(&mut ex, 1_000.0, 4.0, 50_000.0);
        assert_eq!(fill.reason, FillReason::Entry);
        assert!((fill.fee_usdt - 1.0).abs() < 1e-9);

        let snap = ex.ledger_snapshot(50_000.0);
        assert!((snap.position_margin_usdt - 250.0).abs() < 1e-9);
        assert!((snap.cash_usdt - (10_000.0 - 250.0 - 1.0)).abs() < 1e-9);
        assert!((snap.equity_usdt - (10_000.0 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn slippage_moves_entry_price_adversely() {
        let mut acct = account();
        acct.slippage_bps = 10.0;
        let mut ex = Exchange::new(acct);

        let fill = entry_long(&mut ex, 1_000.0, 1.0, 50_000.0);
        assert!((fill.price - 50_050.0).abs() < 1e-9);
        assert_eq!(fill.slippage_applied_bps, 10.0);
    }

    #[test]
    fn one_way_mode_rejects_second_entry() {
        let mut ex = Exchange::new(account());
        entry_long(&mut ex, 1_000.0, 1.0, 50_000.0);

        let outcome = ex
            .submit(OrderRequest::market(Side::Short, 500.0, 1.0), 50_000.0, T0)
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(RejectReason::OneWayViolation));
        assert_eq!(ex.rejections().len(), 1);
    }

    #[test]
    fn below_min_notional_is_recorded_not_fatal() {
        let mut ex = Exchange::new(account());
        let outcome = ex
            .submit(OrderRequest::market(Side::Long, 4.0, 1.0), 50_000.0, T0)
            .unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected(RejectReason::BelowMinNotional)
        );
        assert!(ex.position().is_none());
    }

    #[test]
    fn leverage_above_max_is_rejected() {
        let mut ex = Exchange::new(account());
        let outcome = ex
            .submit(OrderRequest::market(Side::Long, 1_000.0, 50.0), 50_000.0, T0)
            .unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected(RejectReason::ExceedsMaxLeverage)
        );
    }

    #[test]
    fn sl_fills_at_trigger_price() {
        let mut ex = Exchange::new(account());
        let sl = roi_stop_price(Side::Long, 50_000.0, 2.0, 1.0, true);
        let req = OrderRequest::market(Side::Long, 1_000.0, 1.0).with_bracket(Some(sl), None);
        ex.submit(req, 50_000.0, T0).unwrap();

        // Next bar dips to exactly the stop.
        let mut minutes = flat_minutes(T0 + 60_000, 60, 49_500.0);
        minutes[30].low = 49_000.0;
        let bar = exec_bar_from_minutes(&minutes);
        let step = ex.process_bar(&bar, &minutes).unwrap();

        assert_eq!(step.fills.len(), 1);
        let fill = &step.fills[0];
        assert_eq!(fill.reason, FillReason::ExitSl);
        assert!((fill.price - 49_000.0).abs() < 1e-9);
        assert!(ex.position().is_none());

        // Realised ROI on margin is -2% (fees are zeroed in this account).
        let trade = &ex.trades()[0];
        assert!((trade.pnl_usdt / 1_000.0 + 0.02).abs() < 1e-9);
    }

    #[test]
    fn sl_wins_when_both_trigger_in_one_minute() {
        let mut ex = Exchange::new(account());
        let req = OrderRequest::market(Side::Long, 1_000.0, 1.0)
            .with_bracket(Some(49_000.0), Some(51_000.0));
        ex.submit(req, 50_000.0, T0).unwrap();

        let mut minutes = flat_minutes(T0 + 60_000, 60, 50_000.0);
        // One violent minute spans both bracket legs.
        minutes[10].high = 51_500.0;
        minutes[10].low = 48_500.0;
        let bar = exec_bar_from_minutes(&minutes);
        let step = ex.process_bar(&bar, &minutes).unwrap();

        assert_eq!(step.fills[0].reason, FillReason::ExitSl);
    }

    #[test]
    fn tp_fills_when_reached_first() {
        let mut ex = Exchange::new(account());
        let req = OrderRequest::market(Side::Long, 1_000.0, 1.0)
            .with_bracket(Some(49_000.0), Some(51_000.0));
        ex.submit(req, 50_000.0, T0).unwrap();

        let mut minutes = flat_minutes(T0 + 60_000, 60, 50_500.0);
        minutes[5].high = 51_200.0; // TP minute
        minutes[40].low = 48_000.0; // SL later in the bar
        let bar = exec_bar_from_minutes(&minutes);
        let step = ex.process_bar(&bar, &minutes).unwrap();

        // TP minute comes first in the path.
        assert_eq!(step.fills[0].reason, FillReason::ExitTp);
        assert!((step.fills[0].price - 51_000.0).abs() < 1e-9);
    }

    #[test]
    fn liquidation_beats_tp_in_the_same_bar() {
        // Scenario F: long 1000 USDT at 10x, mmr 0.5%.
        let mut ex = Exchange::new(account());
        let req = OrderRequest::market(Side::Long, 1_000.0, 10.0).with_bracket(None, Some(55_000.0));
        ex.submit(req, 50_000.0, T0).unwrap();

        let mut minutes = flat_minutes(T0 + 60_000, 60, 50_000.0);
        minutes[20].high = 55_500.0; // would hit TP
        minutes[45].low = 44_500.0; // breaches liquidation price 45 250
        let bar = exec_bar_from_minutes(&minutes);
        let step = ex.process_bar(&bar, &minutes).unwrap();

        assert!(step.liquidated);
        assert_eq!(step.fills[0].reason, FillReason::ExitLiquidation);
        // Bankruptcy price, no separate fee.
        assert!((step.fills[0].price - 45_000.0).abs() < 1e-9);
        assert_eq!(step.fills[0].fee_usdt, 0.0);
        // The full margin is gone, nothing more.
        assert!((ex.ledger_snapshot(44_500.0).equity_usdt - 9_900.0).abs() < 1e-9);
    }

    #[test]
    fn partial_exit_keeps_entry_price() {
        let mut ex = Exchange::new(account());
        ex.submit(OrderRequest::market(Side::Long, 1_000.0, 2.0), 50_000.0, T0)
            .unwrap();

        // Scenario D: exit 50%.
        let outcome = ex
            .submit(
                OrderRequest::market(Side::Short, 500.0, 2.0).reduce_only(),
                51_000.0,
                T0 + 3_600_000,
            )
            .unwrap();
        let SubmitOutcome::Filled(fill) = outcome else {
            panic!("expected fill");
        };
        assert_eq!(fill.reason, FillReason::ExitPartial);

        let pos = ex.position().unwrap();
        assert_eq!(pos.entry_price, 50_000.0);
        assert!((pos.size_usdt - 500.0).abs() < 1e-9);
        assert!((pos.size_qty - 0.01).abs() < 1e-12);

        // Realised half the 1000-point move on 0.01 qty = 10 USDT.
        assert!((ex.trades()[0].pnl_usdt - 10.0).abs() < 1e-9);
    }

    #[test]
    fn reduce_only_clamps_to_position_size() {
        let mut ex = Exchange::new(account());
        ex.submit(OrderRequest::market(Side::Long, 1_000.0, 1.0), 50_000.0, T0)
            .unwrap();

        let outcome = ex
            .submit(
                OrderRequest::market(Side::Short, 5_000.0, 1.0).reduce_only(),
                50_000.0,
                T0 + 60_000,
            )
            .unwrap();
        let SubmitOutcome::Filled(fill) = outcome else {
            panic!("expected fill");
        };
        // Clamped to 0.02 qty; position closed, never flipped.
        assert!((fill.size_qty - 0.02).abs() < 1e-12);
        assert!(ex.position().is_none());
    }

    #[test]
    fn stop_market_triggers_on_minute_and_fills_at_open() {
        let mut ex = Exchange::new(account());
        let req = OrderRequest {
            side: Side::Long,
            size_usdt: 1_000.0,
            order_type: OrderType::StopMarket,
            limit_price: None,
            trigger_price: Some(50_500.0),
            trigger_direction: Some(TriggerDirection::RisesTo),
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
            leverage: 1.0,
        };
        let outcome = ex.submit(req, 50_000.0, T0).unwrap();
        assert!(matches!(outcome, SubmitOutcome::Resting(_)));

        let mut minutes = flat_minutes(T0 + 60_000, 60, 50_100.0);
        minutes[15].high = 50_600.0; // trigger minute
        let bar = exec_bar_from_minutes(&minutes);
        let step = ex.process_bar(&bar, &minutes).unwrap();

        assert_eq!(step.fills.len(), 1);
        assert_eq!(step.fills[0].reason, FillReason::Entry);
        // Fills at that minute's open (no slippage configured).
        assert!((step.fills[0].price - 50_100.0).abs() < 1e-9);
        assert!(ex.position().is_some());
    }

    #[test]
    fn limit_fill_takes_price_improvement_and_maker_fee() {
        let mut acct = account();
        acct.maker_fee_bps = 2.0;
        acct.taker_fee_bps = 10.0;
        let mut ex = Exchange::new(acct);

        let req = OrderRequest {
            side: Side::Long,
            size_usdt: 1_000.0,
            order_type: OrderType::Limit,
            limit_price: Some(49_800.0),
            trigger_price: None,
            trigger_direction: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
            leverage: 1.0,
        };
        ex.submit(req, 50_000.0, T0).unwrap();

        // A minute gaps down through the limit: fill at the better open.
        let mut minutes = flat_minutes(T0 + 60_000, 60, 49_900.0);
        minutes[8] = Bar::new(
            minutes[8].ts_open_ms,
            minutes[8].ts_close_ms,
            49_700.0,
            49_950.0,
            49_650.0,
            49_900.0,
            10.0,
        );
        let bar = exec_bar_from_minutes(&minutes);
        let step = ex.process_bar(&bar, &minutes).unwrap();

        assert_eq!(step.fills.len(), 1);
        assert!((step.fills[0].price - 49_700.0).abs() < 1e-9);
        // Maker fee: 2 bps of 1000 = 0.2
        assert!((step.fills[0].fee_usdt - 0.2).abs() < 1e-9);
    }

    #[test]
    fn funding_settles_on_8h_boundaries() {
        let mut acct = account();
        acct.funding_rate_8h = 0.0001;
        let mut ex = Exchange::new(acct);
        ex.submit(OrderRequest::market(Side::Long, 1_000.0, 1.0), 50_000.0, T0)
            .unwrap();

        // Bar from 07:00 to 08:00 crosses the 08:00 boundary.
        let start = T0 + 7 * 3_600_000;
        let minutes = flat_minutes(start, 60, 50_000.0);
        let bar = exec_bar_from_minutes(&minutes);
        let step = ex.process_bar(&bar, &minutes).unwrap();

        // Long pays: 0.0001 * 0.02 * 50_000 = 0.1 USDT
        assert!((ex.total_funding_usdt() + 0.1).abs() < 1e-9);
        assert!((step.ledger.cash_usdt - (10_000.0 - 1_000.0 - 0.1)).abs() < 1e-9);

        // A bar that crosses no boundary settles nothing.
        let minutes2 = flat_minutes(start + 3_600_000, 60, 50_000.0);
        let bar2 = exec_bar_from_minutes(&minutes2);
        ex.process_bar(&bar2, &minutes2).unwrap();
        assert!((ex.total_funding_usdt() + 0.1).abs() < 1e-9);
    }

    #[test]
    fn equity_survives_full_round_trip() {
        let mut acct = account();
        acct.taker_fee_bps = 5.0;
        let mut ex = Exchange::new(acct);
        ex.submit(OrderRequest::market(Side::Long, 1_000.0, 2.0), 50_000.0, T0)
            .unwrap();
        ex.close_position_market(52_000.0, FillReason::ExitSignal, T0 + 3_600_000)
            .unwrap();

        // PnL = (52_000 - 50_000) * 0.02 = 40; fees = 0.5 + 0.52
        let snap = ex.ledger_snapshot(52_000.0);
        assert!((snap.equity_usdt - (10_000.0 + 40.0 - 0.5 - 0.52)).abs() < 1e-9);
        assert!(ex.position().is_none());
    }
}
