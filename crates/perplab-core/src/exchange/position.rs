//! The open position: isolated margin, one-way mode.

use super::order::Side;
use serde::{Deserialize, Serialize};

/// A single open position. At most one exists per run; reduce-only fills
/// shrink it and can never flip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    /// Entry notional in USDT (entry_price × size_qty).
    pub size_usdt: f64,
    /// Base-asset quantity.
    pub size_qty: f64,
    pub entry_price: f64,
    pub leverage: f64,
    /// Isolated margin currently backing the position.
    pub margin_usdt: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Worst unrealized PnL seen, in USDT (most negative excursion).
    pub max_adverse_usdt: f64,
    /// Best unrealized PnL seen, in USDT.
    pub max_favorable_usdt: f64,
    /// Accrued funding PnL, signed.
    pub funding_usdt: f64,
    /// Fees paid over the position's life (entry plus exits so far).
    pub fees_usdt: f64,
    /// Entry fee per unit of quantity, for pro-rata attribution on closes.
    pub entry_fee_per_qty: f64,
    pub opened_ts_ms: i64,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        side: Side,
        size_usdt: f64,
        entry_price: f64,
        leverage: f64,
        entry_fee: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        opened_ts_ms: i64,
    ) -> Self {
        let size_qty = size_usdt / entry_price;
        Self {
            side,
            size_usdt,
            size_qty,
            entry_price,
            leverage,
            margin_usdt: size_usdt / leverage,
            stop_loss,
            take_profit,
            max_adverse_usdt: 0.0,
            max_favorable_usdt: 0.0,
            funding_usdt: 0.0,
            fees_usdt: entry_fee,
            entry_fee_per_qty: entry_fee / size_qty,
            opened_ts_ms,
        }
    }

    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        (mark - self.entry_price) * self.size_qty * self.side.sign()
    }

    pub fn notional(&self, mark: f64) -> f64 {
        self.size_qty * mark
    }

    /// ROI on margin at `mark`, as a fraction.
    pub fn roi_on_margin(&self, mark: f64) -> f64 {
        self.unrealized_pnl(mark) / self.margin_usdt
    }

    /// Maintenance margin, anchored to the entry notional so the
    /// liquidation price has a closed form.
    pub fn maintenance_margin(&self, mmr: f64) -> f64 {
        self.size_usdt * mmr
    }

    /// Price at which isolated-margin equity hits the maintenance floor.
    ///
    /// Longs: `entry × (1 − 1/leverage + mmr)`; shorts mirrored.
    pub fn liquidation_price(&self, mmr: f64) -> f64 {
        match self.side {
            Side::Long => self.entry_price * (1.0 - 1.0 / self.leverage + mmr),
            Side::Short => self.entry_price * (1.0 + 1.0 / self.leverage - mmr),
        }
    }

    /// Price at which the margin is exactly exhausted. Liquidations fill
    /// here; the close fee is absorbed into this price rather than charged
    /// separately.
    pub fn bankruptcy_price(&self) -> f64 {
        match self.side {
            Side::Long => self.entry_price * (1.0 - 1.0 / self.leverage),
            Side::Short => self.entry_price * (1.0 + 1.0 / self.leverage),
        }
    }

    /// Track intra-bar excursions against the bar's extremes.
    pub fn update_excursions(&mut self, bar_high: f64, bar_low: f64) {
        let (best_px, worst_px) = match self.side {
            Side::Long => (bar_high, bar_low),
            Side::Short => (bar_low, bar_high),
        };
        let best = self.unrealized_pnl(best_px);
        let worst = self.unrealized_pnl(worst_px);
        if best > self.max_favorable_usdt {
            self.max_favorable_usdt = best;
        }
        if worst < self.max_adverse_usdt {
            self.max_adverse_usdt = worst;
        }
    }

    /// Quantity closed by a reduce of `fraction` of the current size.
    pub fn qty_for_fraction(&self, fraction: f64) -> f64 {
        self.size_qty * fraction.clamp(0.0, 1.0)
    }

    /// Shrink the position after a reduce-only fill of `qty_closed`.
    /// Returns the margin released. The entry price is untouched.
    pub fn reduce(&mut self, qty_closed: f64) -> f64 {
        let fraction = (qty_closed / self.size_qty).clamp(0.0, 1.0);
        let margin_released = self.margin_usdt * fraction;
        self.size_qty -= qty_closed;
        self.size_usdt = self.size_qty * self.entry_price;
        self.margin_usdt -= margin_released;
        margin_released
    }

    pub fn is_dust(&self) -> bool {
        self.size_qty <= 1e-12 || self.size_usdt <= 1e-6
    }
}

/// Translate an ROI-on-margin stop percentage into a price.
///
/// A stop of `pct` percent ROI at leverage `L` sits `entry × pct/100/L`
/// away from entry, so the realised ROI at the stop is `pct` at any
/// leverage. `adverse` picks the losing direction (stop-loss) versus the
/// winning one (take-profit).
pub fn roi_stop_price(side: Side, entry: f64, pct: f64, leverage: f64, adverse: bool) -> f64 {
    let distance = entry * (pct / 100.0) / leverage;
    let dir = side.sign() * if adverse { -1.0 } else { 1.0 };
    entry + dir * distance
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position() -> Position {
        Position::open(
            Side::Long,
            1_000.0,
            50_000.0,
            10.0,
            0.55,
            None,
            None,
            0,
        )
    }

    #[test]
    fn open_derives_qty_and_margin() {
        let p = long_position();
        assert!((p.size_qty - 0.02).abs() < 1e-12);
        assert!((p.margin_usdt - 100.0).abs() < 1e-12);
    }

    #[test]
    fn unrealized_pnl_sign() {
        let p = long_position();
        assert!(p.unrealized_pnl(51_000.0) > 0.0);
        assert!(p.unrealized_pnl(49_000.0) < 0.0);

        let mut s = long_position();
        s.side = Side::Short;
        assert!(s.unrealized_pnl(49_000.0) > 0.0);
    }

    #[test]
    fn liquidation_price_formula() {
        let p = long_position();
        // 50000 * (1 - 0.1 + 0.005) = 45250
        assert!((p.liquidation_price(0.005) - 45_250.0).abs() < 1e-9);
        // Bankruptcy at 50000 * 0.9 = 45000
        assert!((p.bankruptcy_price() - 45_000.0).abs() < 1e-9);
    }

    #[test]
    fn liquidation_at_bankruptcy_consumes_exactly_the_margin() {
        let p = long_position();
        let loss = p.unrealized_pnl(p.bankruptcy_price());
        assert!((loss + p.margin_usdt).abs() < 1e-9);
    }

    #[test]
    fn roi_stop_scales_inversely_with_leverage() {
        // Scenario A: sl 2% at 1x -> 49 000
        let sl = roi_stop_price(Side::Long, 50_000.0, 2.0, 1.0, true);
        assert!((sl - 49_000.0).abs() < 1e-9);

        // Scenario B: sl 2% at 3x -> 49 666.67
        let sl = roi_stop_price(Side::Long, 50_000.0, 2.0, 3.0, true);
        assert!((sl - 50_000.0 * (1.0 - 0.02 / 3.0)).abs() < 1e-9);

        // TP is symmetric
        let tp = roi_stop_price(Side::Long, 50_000.0, 4.0, 2.0, false);
        assert!((tp - 51_000.0).abs() < 1e-9);

        // Shorts mirror
        let sl = roi_stop_price(Side::Short, 50_000.0, 2.0, 1.0, true);
        assert!((sl - 51_000.0).abs() < 1e-9);
    }

    #[test]
    fn roi_at_stop_equals_configured_pct() {
        for leverage in [1.0, 3.0, 10.0] {
            let mut p = long_position();
            p.leverage = leverage;
            p.margin_usdt = p.size_usdt / leverage;
            let sl = roi_stop_price(Side::Long, p.entry_price, 2.0, leverage, true);
            let roi = p.roi_on_margin(sl);
            assert!(
                (roi + 0.02).abs() < 1e-9,
                "leverage {leverage}: roi {roi} != -2%"
            );
        }
    }

    #[test]
    fn reduce_preserves_entry_price_and_releases_margin() {
        let mut p = long_position();
        let released = p.reduce(0.01);
        assert!((released - 50.0).abs() < 1e-9);
        assert_eq!(p.entry_price, 50_000.0);
        assert!((p.size_qty - 0.01).abs() < 1e-12);
        assert!((p.size_usdt - 500.0).abs() < 1e-9);
        assert!(!p.is_dust());

        p.reduce(p.size_qty);
        assert!(p.is_dust());
    }

    #[test]
    fn excursions_track_extremes() {
        let mut p = long_position();
        p.update_excursions(51_000.0, 49_500.0);
        assert!((p.max_favorable_usdt - 20.0).abs() < 1e-9);
        assert!((p.max_adverse_usdt + 10.0).abs() < 1e-9);

        // A milder bar does not shrink the extremes.
        p.update_excursions(50_100.0, 49_900.0);
        assert!((p.max_favorable_usdt - 20.0).abs() < 1e-9);
        assert!((p.max_adverse_usdt + 10.0).abs() < 1e-9);
    }
}
