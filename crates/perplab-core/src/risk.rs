//! Risk layer: bracket pricing and order sizing.
//!
//! Translates a Play's risk model into a concrete stop-loss/take-profit
//! pair and an order notional, given the account state at signal time.

use crate::error::{PerpLabError, Result};
use crate::exchange::{roi_stop_price, Side};
use crate::play::{BracketRule, ExitMode, RiskModel, SizingRule};

/// Stop-loss and take-profit prices for an entry at `entry_price`.
///
/// `atr` is the value of the declared ATR feature at signal time; it is
/// only consulted by `atr_mult` rules. A NaN ATR there means the bracket
/// cannot be priced yet and the entry must be skipped (never silently
/// defaulted), signalled by `Ok(None)`.
pub fn bracket_prices(
    risk: &RiskModel,
    exit_mode: ExitMode,
    side: Side,
    entry_price: f64,
    leverage: f64,
    atr: f64,
) -> Result<Option<(Option<f64>, Option<f64>)>> {
    if exit_mode == ExitMode::Signal {
        // Signal mode never arms a bracket.
        return Ok(Some((None, None)));
    }

    let price_for = |rule: &BracketRule, adverse: bool| -> Option<f64> {
        match rule {
            BracketRule::RoiPct { pct } => {
                Some(roi_stop_price(side, entry_price, *pct, leverage, adverse))
            }
            BracketRule::PricePct { pct } => {
                let dir = side.sign() * if adverse { -1.0 } else { 1.0 };
                Some(entry_price * (1.0 + dir * pct / 100.0))
            }
            BracketRule::AtrMult { mult, .. } => {
                if !atr.is_finite() {
                    return None;
                }
                let dir = side.sign() * if adverse { -1.0 } else { 1.0 };
                Some(entry_price + dir * mult * atr)
            }
        }
    };

    let sl = match &risk.stop_loss {
        Some(rule) => match price_for(rule, true) {
            Some(p) => Some(p),
            None => return Ok(None),
        },
        None => None,
    };
    let tp = match &risk.take_profit {
        Some(rule) => match price_for(rule, false) {
            Some(p) => Some(p),
            None => return Ok(None),
        },
        None => None,
    };

    Ok(Some((sl, tp)))
}

/// Stop distance as a fraction of entry price, for risk-based sizing.
fn stop_distance_frac(rule: &BracketRule, leverage: f64, entry_price: f64, atr: f64) -> Option<f64> {
    match rule {
        BracketRule::RoiPct { pct } => Some(pct / 100.0 / leverage),
        BracketRule::PricePct { pct } => Some(pct / 100.0),
        BracketRule::AtrMult { mult, .. } => {
            if atr.is_finite() && entry_price > 0.0 {
                Some(mult * atr / entry_price)
            } else {
                None
            }
        }
    }
}

/// Outcome of sizing one intent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeOutcome {
    /// Submit an order of this notional.
    Sized { size_usdt: f64, leverage: f64 },
    /// Below the account minimum: a recorded signal rejection, not an error.
    BelowMin { size_usdt: f64 },
    /// Computed size is exactly zero; bypasses the min-notional gate and
    /// produces no order here.
    Zero,
}

/// Compute the order notional for an entry intent.
pub fn size_entry(
    risk: &RiskModel,
    equity_usdt: f64,
    available_usdt: f64,
    max_leverage: f64,
    min_notional_usdt: f64,
    entry_price: f64,
    atr: f64,
) -> Result<SizeOutcome> {
    let leverage = risk.sizing.leverage();
    let raw = match &risk.sizing {
        SizingRule::PercentEquity { pct, .. } => equity_usdt * pct / 100.0 * leverage,
        SizingRule::RiskBased { risk_pct, .. } => {
            let sl = risk.stop_loss.as_ref().ok_or_else(|| {
                PerpLabError::Config("risk_based sizing requires a stop_loss rule".into())
            })?;
            match stop_distance_frac(sl, leverage, entry_price, atr) {
                Some(frac) if frac > 0.0 => equity_usdt * risk_pct / 100.0 / frac * leverage,
                _ => return Ok(SizeOutcome::Zero),
            }
        }
        SizingRule::FixedUsdt { usdt, .. } => *usdt,
    };

    // Cap at what the account can actually margin.
    let size_usdt = raw.min(available_usdt * max_leverage).max(0.0);

    if size_usdt == 0.0 {
        return Ok(SizeOutcome::Zero);
    }
    if size_usdt < min_notional_usdt {
        return Ok(SizeOutcome::BelowMin { size_usdt });
    }
    Ok(SizeOutcome::Sized { size_usdt, leverage })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play::RiskModel;

    fn roi_risk() -> RiskModel {
        RiskModel {
            stop_loss: Some(BracketRule::RoiPct { pct: 2.0 }),
            take_profit: Some(BracketRule::RoiPct { pct: 4.0 }),
            sizing: SizingRule::PercentEquity {
                pct: 10.0,
                leverage: 3.0,
            },
        }
    }

    #[test]
    fn percent_equity_scales_with_leverage() {
        let out = size_entry(&roi_risk(), 10_000.0, 10_000.0, 10.0, 5.0, 50_000.0, f64::NAN)
            .unwrap();
        // 10% of 10k at 3x = 3000
        assert_eq!(
            out,
            SizeOutcome::Sized {
                size_usdt: 3_000.0,
                leverage: 3.0
            }
        );
    }

    #[test]
    fn size_caps_at_available_times_max_leverage() {
        let out = size_entry(&roi_risk(), 10_000.0, 100.0, 10.0, 5.0, 50_000.0, f64::NAN)
            .unwrap();
        assert_eq!(
            out,
            SizeOutcome::Sized {
                size_usdt: 1_000.0,
                leverage: 3.0
            }
        );
    }

    #[test]
    fn below_min_is_reported_not_sized() {
        let mut risk = roi_risk();
        risk.sizing = SizingRule::FixedUsdt {
            usdt: 3.0,
            leverage: 1.0,
        };
        let out = size_entry(&risk, 10_000.0, 10_000.0, 10.0, 5.0, 50_000.0, f64::NAN).unwrap();
        assert!(matches!(out, SizeOutcome::BelowMin { .. }));
    }

    #[test]
    fn zero_size_bypasses_the_gate() {
        let mut risk = roi_risk();
        risk.sizing = SizingRule::FixedUsdt {
            usdt: 0.0,
            leverage: 1.0,
        };
        let out = size_entry(&risk, 10_000.0, 10_000.0, 10.0, 5.0, 50_000.0, f64::NAN).unwrap();
        assert_eq!(out, SizeOutcome::Zero);
    }

    #[test]
    fn risk_based_size_uses_stop_distance() {
        let risk = RiskModel {
            stop_loss: Some(BracketRule::PricePct { pct: 1.0 }),
            take_profit: None,
            sizing: SizingRule::RiskBased {
                risk_pct: 1.0,
                leverage: 2.0,
            },
        };
        // Risking 1% of 10k = 100 over a 1% stop distance -> 10_000 * 2x
        let out = size_entry(&risk, 10_000.0, 1e12, 25.0, 5.0, 50_000.0, f64::NAN).unwrap();
        assert_eq!(
            out,
            SizeOutcome::Sized {
                size_usdt: 20_000.0,
                leverage: 2.0
            }
        );
    }

    #[test]
    fn roi_bracket_prices_depend_on_leverage() {
        let (sl, tp) = bracket_prices(
            &roi_risk(),
            ExitMode::FirstHit,
            Side::Long,
            50_000.0,
            3.0,
            f64::NAN,
        )
        .unwrap()
        .unwrap();
        assert!((sl.unwrap() - 50_000.0 * (1.0 - 0.02 / 3.0)).abs() < 1e-9);
        assert!((tp.unwrap() - 50_000.0 * (1.0 + 0.04 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn signal_mode_arms_no_bracket() {
        let out = bracket_prices(
            &roi_risk(),
            ExitMode::Signal,
            Side::Long,
            50_000.0,
            3.0,
            f64::NAN,
        )
        .unwrap()
        .unwrap();
        assert_eq!(out, (None, None));
    }

    #[test]
    fn atr_bracket_without_warm_atr_skips_entry() {
        let risk = RiskModel {
            stop_loss: Some(BracketRule::AtrMult {
                mult: 2.0,
                atr_key: "atr_14".into(),
            }),
            take_profit: None,
            sizing: SizingRule::PercentEquity {
                pct: 10.0,
                leverage: 1.0,
            },
        };
        let out = bracket_prices(
            &risk,
            ExitMode::FirstHit,
            Side::Long,
            50_000.0,
            1.0,
            f64::NAN,
        )
        .unwrap();
        assert!(out.is_none());

        let out = bracket_prices(&risk, ExitMode::FirstHit, Side::Long, 50_000.0, 1.0, 250.0)
            .unwrap()
            .unwrap();
        assert!((out.0.unwrap() - 49_500.0).abs() < 1e-9);
    }
}
