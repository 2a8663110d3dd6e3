//! Performance metrics over a completed run.
//!
//! Everything here is a pure function of the run report; two identical
//! reports always produce byte-identical metrics (no wall-clock reads, no
//! float reductions in nondeterministic order).

use crate::exchange::FillReason;
use crate::runner::RunReport;
use crate::timeframe::MINUTE_MS;
use serde::{Deserialize, Serialize};

const MS_PER_YEAR: f64 = 365.25 * 24.0 * 3_600_000.0;

/// Final run metrics, serialised into `result.json` with sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    // Returns
    pub starting_equity_usdt: f64,
    pub final_equity_usdt: f64,
    pub net_profit_usdt: f64,
    pub total_return_pct: f64,
    pub cagr_pct: f64,

    // Drawdown
    pub max_drawdown_pct: f64,
    pub max_drawdown_usdt: f64,
    pub max_drawdown_duration_bars: u64,
    pub time_underwater_pct: f64,

    // Risk-adjusted
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub equity_volatility_ann_pct: f64,
    pub var_95_bar_pct: f64,
    pub cvar_95_bar_pct: f64,
    pub best_bar_return_pct: f64,
    pub worst_bar_return_pct: f64,

    // Trades
    pub num_trades: u64,
    pub num_wins: u64,
    pub num_losses: u64,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub expectancy_usdt: f64,
    pub avg_trade_pnl_usdt: f64,
    pub median_trade_pnl_usdt: f64,
    pub avg_win_usdt: f64,
    pub avg_loss_usdt: f64,
    pub payoff_ratio: f64,
    pub largest_win_usdt: f64,
    pub largest_loss_usdt: f64,
    pub max_consecutive_wins: u64,
    pub max_consecutive_losses: u64,

    // Excursions
    pub avg_mae_usdt: f64,
    pub avg_mfe_usdt: f64,
    pub worst_mae_usdt: f64,
    pub best_mfe_usdt: f64,

    // Holding / exposure
    pub time_in_market_pct: f64,
    pub avg_holding_hours: f64,
    pub max_holding_hours: f64,
    pub min_holding_hours: f64,
    pub turnover: f64,

    // Leverage / margin
    pub avg_trade_leverage: f64,
    pub max_trade_leverage: f64,
    pub max_margin_usage_pct: f64,
    pub max_maintenance_stress_pct: f64,

    // Costs
    pub fees_total_usdt: f64,
    pub funding_total_usdt: f64,
    pub fees_pct_of_gross: f64,

    // Event counts
    pub liquidations: u64,
    pub rejections_total: u64,
    pub signals_emitted: u64,
    pub entries_submitted: u64,
    pub exits_tp: u64,
    pub exits_sl: u64,
    pub exits_signal: u64,
    pub exits_partial: u64,
    pub exits_liquidation: u64,
    pub exits_end_of_data: u64,

    // Window
    pub bars_processed: u64,
    pub evaluated_bars: u64,
    pub warmup_bars: u64,
    pub window_days: f64,
}

/// Compute all metrics from a completed run.
pub fn compute_metrics(report: &RunReport) -> Metrics {
    let initial = report.starting_equity_usdt;
    let final_eq = report.final_equity_usdt;
    let net = final_eq - initial;
    let total_return = if initial > 0.0 { net / initial } else { 0.0 };

    let window_ms = (report.last_trading_ts_ms - report.first_trading_ts_ms).max(0);
    let years = window_ms as f64 / MS_PER_YEAR;
    let cagr = calculate_cagr(initial, final_eq, years);

    let equity: Vec<f64> = report.equity_curve.iter().map(|p| p.equity_usdt).collect();
    let (max_dd_pct, max_dd_usdt, max_dd_bars, underwater_bars) = drawdown_stats(&equity);

    let bar_returns: Vec<f64> = equity
        .windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();

    // Annualisation from the exec bar spacing.
    let bar_ms = report
        .equity_curve
        .windows(2)
        .map(|w| w[1].ts_ms - w[0].ts_ms)
        .next()
        .unwrap_or(60 * MINUTE_MS);
    let bars_per_year = MS_PER_YEAR / bar_ms as f64;

    let sharpe = calculate_sharpe(&bar_returns, bars_per_year);
    let sortino = calculate_sortino(&bar_returns, bars_per_year);
    let calmar = if max_dd_pct > 0.0 { cagr / max_dd_pct } else { 0.0 };
    let vol_ann = stddev(&bar_returns) * bars_per_year.sqrt();

    let (var_95, cvar_95) = var_cvar(&bar_returns, 0.95);
    let best_bar = bar_returns.iter().copied().fold(0.0_f64, f64::max);
    let worst_bar = bar_returns.iter().copied().fold(0.0_f64, f64::min);

    // Trade statistics.
    let trades = &report.trades;
    let num_trades = trades.len() as u64;
    let wins: Vec<f64> = trades.iter().filter(|t| t.pnl_usdt > 0.0).map(|t| t.pnl_usdt).collect();
    let losses: Vec<f64> = trades.iter().filter(|t| t.pnl_usdt < 0.0).map(|t| t.pnl_usdt).collect();
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().map(|p| p.abs()).sum();

    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let total_pnl: f64 = trades.iter().map(|t| t.pnl_usdt).sum();
    let avg_trade = mean_or_zero(total_pnl, num_trades);
    let avg_win = mean_or_zero(gross_profit, wins.len() as u64);
    let avg_loss = mean_or_zero(-gross_loss, losses.len() as u64);
    let payoff = if avg_loss != 0.0 { avg_win / avg_loss.abs() } else { 0.0 };

    let win_rate = if num_trades > 0 {
        wins.len() as f64 / num_trades as f64
    } else {
        0.0
    };
    // Expectancy per trade from the win/loss decomposition.
    let expectancy = win_rate * avg_win + (1.0 - win_rate) * avg_loss;

    let mut pnls: Vec<f64> = trades.iter().map(|t| t.pnl_usdt).collect();
    pnls.sort_by(|a, b| a.partial_cmp(b).expect("trade pnl is never NaN"));
    let median = if pnls.is_empty() {
        0.0
    } else if pnls.len() % 2 == 1 {
        pnls[pnls.len() / 2]
    } else {
        (pnls[pnls.len() / 2 - 1] + pnls[pnls.len() / 2]) / 2.0
    };

    let (max_win_streak, max_loss_streak) = streaks(trades.iter().map(|t| t.pnl_usdt));

    let holding_hours: Vec<f64> = trades
        .iter()
        .map(|t| (t.exit_ts_ms - t.entry_ts_ms) as f64 / 3_600_000.0)
        .collect();

    let bars_in_market = report
        .equity_curve
        .iter()
        .filter(|p| p.position_margin_usdt > 0.0)
        .count() as f64;

    let traded_notional: f64 = report
        .fills
        .iter()
        .map(|f| f.size_qty * f.price)
        .sum();
    let avg_capital = (initial + final_eq) / 2.0;
    let turnover = if years > 0.0 && avg_capital > 0.0 {
        traded_notional / avg_capital / years
    } else {
        0.0
    };

    let max_margin_usage = report
        .equity_curve
        .iter()
        .filter(|p| p.equity_usdt > 0.0)
        .map(|p| p.position_margin_usdt / p.equity_usdt)
        .fold(0.0_f64, f64::max);

    // Worst proximity to the maintenance floor, as margin consumed.
    let max_maintenance_stress = report
        .equity_curve
        .iter()
        .filter(|p| p.position_margin_usdt > 0.0)
        .map(|p| {
            let position_equity = p.position_margin_usdt + p.unrealized_pnl_usdt;
            if position_equity > 0.0 {
                1.0 - position_equity / p.position_margin_usdt
            } else {
                1.0
            }
        })
        .fold(0.0_f64, f64::max);

    let gross_abs = gross_profit + gross_loss;
    let fees_pct_of_gross = if gross_abs > 0.0 {
        report.total_fees_usdt / gross_abs
    } else {
        0.0
    };

    let count_reason =
        |r: FillReason| trades.iter().filter(|t| t.exit_reason == r).count() as u64;

    Metrics {
        starting_equity_usdt: initial,
        final_equity_usdt: final_eq,
        net_profit_usdt: net,
        total_return_pct: total_return * 100.0,
        cagr_pct: cagr * 100.0,

        max_drawdown_pct: max_dd_pct * 100.0,
        max_drawdown_usdt: max_dd_usdt,
        max_drawdown_duration_bars: max_dd_bars,
        time_underwater_pct: percent_of(underwater_bars as f64, equity.len() as f64),

        sharpe,
        sortino,
        calmar,
        equity_volatility_ann_pct: vol_ann * 100.0,
        var_95_bar_pct: var_95 * 100.0,
        cvar_95_bar_pct: cvar_95 * 100.0,
        best_bar_return_pct: best_bar * 100.0,
        worst_bar_return_pct: worst_bar * 100.0,

        num_trades,
        num_wins: wins.len() as u64,
        num_losses: losses.len() as u64,
        win_rate_pct: win_rate * 100.0,
        profit_factor,
        expectancy_usdt: expectancy,
        avg_trade_pnl_usdt: avg_trade,
        median_trade_pnl_usdt: median,
        avg_win_usdt: avg_win,
        avg_loss_usdt: avg_loss,
        payoff_ratio: payoff,
        largest_win_usdt: wins.iter().copied().fold(0.0_f64, f64::max),
        largest_loss_usdt: losses.iter().copied().fold(0.0_f64, f64::min),
        max_consecutive_wins: max_win_streak,
        max_consecutive_losses: max_loss_streak,

        avg_mae_usdt: mean_slice(trades.iter().map(|t| t.mae_usdt)),
        avg_mfe_usdt: mean_slice(trades.iter().map(|t| t.mfe_usdt)),
        worst_mae_usdt: trades.iter().map(|t| t.mae_usdt).fold(0.0_f64, f64::min),
        best_mfe_usdt: trades.iter().map(|t| t.mfe_usdt).fold(0.0_f64, f64::max),

        time_in_market_pct: percent_of(bars_in_market, equity.len() as f64),
        avg_holding_hours: mean_slice(holding_hours.iter().copied()),
        max_holding_hours: holding_hours.iter().copied().fold(0.0_f64, f64::max),
        min_holding_hours: if holding_hours.is_empty() {
            0.0
        } else {
            holding_hours.iter().copied().fold(f64::MAX, f64::min)
        },
        turnover,

        avg_trade_leverage: mean_slice(trades.iter().map(|t| t.leverage)),
        max_trade_leverage: trades.iter().map(|t| t.leverage).fold(0.0_f64, f64::max),
        max_margin_usage_pct: max_margin_usage * 100.0,
        max_maintenance_stress_pct: max_maintenance_stress * 100.0,

        fees_total_usdt: report.total_fees_usdt,
        funding_total_usdt: report.total_funding_usdt,
        fees_pct_of_gross: fees_pct_of_gross * 100.0,

        liquidations: report.liquidations as u64,
        rejections_total: report.rejections.len() as u64,
        signals_emitted: report.signals_emitted as u64,
        entries_submitted: report.entries_submitted as u64,
        exits_tp: count_reason(FillReason::ExitTp),
        exits_sl: count_reason(FillReason::ExitSl),
        exits_signal: count_reason(FillReason::ExitSignal),
        exits_partial: count_reason(FillReason::ExitPartial),
        exits_liquidation: count_reason(FillReason::ExitLiquidation),
        exits_end_of_data: count_reason(FillReason::ExitEndOfData),

        bars_processed: report.bars_processed as u64,
        evaluated_bars: report.evaluated_bars as u64,
        warmup_bars: report.warmup_bars as u64,
        window_days: window_ms as f64 / 86_400_000.0,
    }
}

fn percent_of(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

fn mean_or_zero(sum: f64, n: u64) -> f64 {
    if n > 0 {
        sum / n as f64
    } else {
        0.0
    }
}

fn mean_slice(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0u64;
    for v in values {
        sum += v;
        n += 1;
    }
    mean_or_zero(sum, n)
}

fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Calculate CAGR from initial and final values over a number of years.
pub fn calculate_cagr(initial: f64, final_value: f64, years: f64) -> f64 {
    if initial <= 0.0 || years <= 0.0 || final_value <= 0.0 {
        return 0.0;
    }
    (final_value / initial).powf(1.0 / years) - 1.0
}

/// Annualized Sharpe ratio over per-bar returns, risk-free rate zero.
pub fn calculate_sharpe(bar_returns: &[f64], bars_per_year: f64) -> f64 {
    if bar_returns.is_empty() {
        return 0.0;
    }
    let n = bar_returns.len() as f64;
    let mean = bar_returns.iter().sum::<f64>() / n;
    let sd = stddev(bar_returns);
    if sd == 0.0 {
        return 0.0;
    }
    (mean * bars_per_year) / (sd * bars_per_year.sqrt())
}

/// Annualized Sortino ratio: like Sharpe but only downside deviation.
pub fn calculate_sortino(bar_returns: &[f64], bars_per_year: f64) -> f64 {
    if bar_returns.is_empty() {
        return 0.0;
    }
    let n = bar_returns.len() as f64;
    let mean = bar_returns.iter().sum::<f64>() / n;
    let downside = (bar_returns
        .iter()
        .map(|r| if *r < 0.0 { r.powi(2) } else { 0.0 })
        .sum::<f64>()
        / n)
        .sqrt();
    if downside == 0.0 {
        return 0.0;
    }
    (mean * bars_per_year) / (downside * bars_per_year.sqrt())
}

/// Maximum drawdown stats: (pct, usdt, longest peak-to-recovery bars,
/// bars spent below the running peak).
fn drawdown_stats(equity: &[f64]) -> (f64, f64, u64, u64) {
    if equity.is_empty() {
        return (0.0, 0.0, 0, 0);
    }

    let mut peak = equity[0];
    let mut peak_idx = 0usize;
    let mut max_dd_pct = 0.0;
    let mut max_dd_usdt = 0.0;
    let mut max_duration = 0u64;
    let mut underwater = 0u64;

    for (i, &eq) in equity.iter().enumerate() {
        if eq >= peak {
            peak = eq;
            peak_idx = i;
        } else {
            underwater += 1;
            let dd_usdt = peak - eq;
            let dd_pct = if peak > 0.0 { dd_usdt / peak } else { 0.0 };
            if dd_pct > max_dd_pct {
                max_dd_pct = dd_pct;
            }
            if dd_usdt > max_dd_usdt {
                max_dd_usdt = dd_usdt;
            }
            let duration = (i - peak_idx) as u64;
            if duration > max_duration {
                max_duration = duration;
            }
        }
    }

    (max_dd_pct, max_dd_usdt, max_duration, underwater)
}

/// Historical VaR and CVaR at `confidence` on per-bar returns, reported as
/// positive loss fractions.
fn var_cvar(bar_returns: &[f64], confidence: f64) -> (f64, f64) {
    if bar_returns.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted: Vec<f64> = bar_returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("bar returns are never NaN"));

    let idx = ((1.0 - confidence) * sorted.len() as f64).floor() as usize;
    let idx = idx.min(sorted.len() - 1);
    let var = -sorted[idx];

    let tail = &sorted[..=idx];
    let cvar = -tail.iter().sum::<f64>() / tail.len() as f64;

    (var.max(0.0), cvar.max(0.0))
}

fn streaks(pnls: impl Iterator<Item = f64>) -> (u64, u64) {
    let mut max_wins = 0u64;
    let mut max_losses = 0u64;
    let mut wins = 0u64;
    let mut losses = 0u64;
    for pnl in pnls {
        if pnl > 0.0 {
            wins += 1;
            losses = 0;
        } else if pnl < 0.0 {
            losses += 1;
            wins = 0;
        } else {
            wins = 0;
            losses = 0;
        }
        max_wins = max_wins.max(wins);
        max_losses = max_losses.max(losses);
    }
    (max_wins, max_losses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cagr() {
        // $100 -> $200 in 5 years = ~14.87% CAGR
        let cagr = calculate_cagr(100.0, 200.0, 5.0);
        assert!((cagr - 0.1487).abs() < 0.001);
    }

    #[test]
    fn test_max_drawdown() {
        let equity = vec![100.0, 110.0, 105.0, 120.0, 90.0, 100.0];
        let (dd_pct, dd_usdt, _, underwater) = drawdown_stats(&equity);
        // Peak 120, trough 90 -> 25%
        assert!((dd_pct - 0.25).abs() < 1e-9);
        assert!((dd_usdt - 30.0).abs() < 1e-9);
        assert_eq!(underwater, 3);
    }

    #[test]
    fn drawdown_duration_counts_bars_from_peak() {
        let equity = vec![100.0, 120.0, 110.0, 115.0, 118.0, 121.0];
        let (_, _, duration, _) = drawdown_stats(&equity);
        // Peak at idx 1; the deepest point of the recovery is idx 4.
        assert_eq!(duration, 3);
    }

    #[test]
    fn sharpe_zero_for_flat_curve() {
        let returns = vec![0.0; 100];
        assert_eq!(calculate_sharpe(&returns, 8760.0), 0.0);
    }

    #[test]
    fn sortino_ignores_upside_volatility() {
        // Alternating +1%/+3%: no downside at all.
        let returns: Vec<f64> = (0..50)
            .map(|i| if i % 2 == 0 { 0.01 } else { 0.03 })
            .collect();
        assert_eq!(calculate_sortino(&returns, 8760.0), 0.0);
        assert!(calculate_sharpe(&returns, 8760.0) > 0.0);
    }

    #[test]
    fn var_cvar_tail_ordering() {
        let mut returns = vec![0.01; 95];
        returns.extend_from_slice(&[-0.02, -0.03, -0.04, -0.05, -0.10]);
        let (var, cvar) = var_cvar(&returns, 0.95);
        assert!(var > 0.0);
        // CVaR averages the tail beyond VaR, so it is at least as bad.
        assert!(cvar >= var);
    }

    #[test]
    fn streak_tracking() {
        let pnls = vec![1.0, 2.0, -1.0, -1.0, -1.0, 3.0, 4.0, 5.0, -2.0];
        let (w, l) = streaks(pnls.into_iter());
        assert_eq!(w, 3);
        assert_eq!(l, 3);
    }
}
