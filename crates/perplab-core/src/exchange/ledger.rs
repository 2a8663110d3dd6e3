//! Account ledger: cash plus derived per-bar snapshots.

use super::position::Position;
use serde::{Deserialize, Serialize};

/// Mutable account cash. Position margin lives on the position itself;
/// equity is always derived, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    /// Free collateral (excludes margin locked in the open position).
    pub cash_usdt: f64,
}

impl Ledger {
    pub fn new(starting_equity_usdt: f64) -> Self {
        Self {
            cash_usdt: starting_equity_usdt,
        }
    }

    /// Lock margin and pay the entry fee.
    pub fn on_open(&mut self, margin_usdt: f64, fee_usdt: f64) {
        self.cash_usdt -= margin_usdt + fee_usdt;
    }

    /// Release margin and settle realized PnL net of the exit fee.
    pub fn on_close(&mut self, margin_released_usdt: f64, realized_pnl_usdt: f64) {
        self.cash_usdt += margin_released_usdt + realized_pnl_usdt;
    }

    /// Funding settles straight into cash.
    pub fn on_funding(&mut self, funding_usdt: f64) {
        self.cash_usdt += funding_usdt;
    }

    /// Point-in-time account snapshot at `mark`.
    pub fn snapshot(&self, position: Option<&Position>, mark: f64, mmr: f64) -> LedgerSnapshot {
        let (margin, upnl, mm) = match position {
            Some(p) => (
                p.margin_usdt,
                p.unrealized_pnl(mark),
                p.maintenance_margin(mmr),
            ),
            None => (0.0, 0.0, 0.0),
        };
        LedgerSnapshot {
            cash_usdt: self.cash_usdt,
            position_margin_usdt: margin,
            unrealized_pnl_usdt: upnl,
            equity_usdt: self.cash_usdt + margin + upnl,
            available_balance_usdt: self.cash_usdt,
            maintenance_margin_usdt: mm,
        }
    }
}

/// Immutable account view recorded once per exec bar and on every fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub cash_usdt: f64,
    pub position_margin_usdt: f64,
    pub unrealized_pnl_usdt: f64,
    pub equity_usdt: f64,
    pub available_balance_usdt: f64,
    pub maintenance_margin_usdt: f64,
}
