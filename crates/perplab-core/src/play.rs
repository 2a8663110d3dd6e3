//! The Play: a declarative strategy specification, consumed as data.
//!
//! The surface syntax (YAML) is parsed by a collaborator; the core receives
//! this shape, validates it once, and treats it as immutable for the whole
//! run. All derived state (feeds, compiled rules, detectors, the exchange)
//! is owned by the engine.

use crate::error::{PerpLabError, Result};
use crate::indicators::ResolvedIndicator;
use crate::params::Params;
use crate::rules::BlockSpec;
use crate::structure::{StructureDecl, StructureKind};
use crate::timeframe::{TfRole, Timeframe};
use serde::{Deserialize, Serialize};

/// Account and venue parameters for the simulated exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub starting_equity_usdt: f64,
    pub max_leverage: f64,
    pub margin_mode: MarginMode,
    pub taker_fee_bps: f64,
    pub maker_fee_bps: f64,
    pub slippage_bps: f64,
    /// Maintenance margin rate as a fraction (0.005 = 0.5%).
    pub maintenance_margin_rate: f64,
    /// Orders below this notional are rejected with a recorded reason.
    #[serde(default = "default_min_notional")]
    pub min_notional_usdt: f64,
    /// Flat funding rate applied per 8-hour settlement, as a fraction.
    #[serde(default)]
    pub funding_rate_8h: f64,
}

fn default_min_notional() -> f64 {
    5.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginMode {
    Isolated,
    Cross,
}

/// Timeframes by role. The exec timeframe must be the finest declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframesDecl {
    pub exec: Timeframe,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub htf: Option<Timeframe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtf: Option<Timeframe>,
}

impl TimeframesDecl {
    pub fn get(&self, role: TfRole) -> Option<Timeframe> {
        match role {
            TfRole::Exec => Some(self.exec),
            TfRole::Htf => self.htf,
            TfRole::Mtf => self.mtf,
        }
    }

    pub fn declared_roles(&self) -> Vec<TfRole> {
        let mut roles = vec![TfRole::Exec];
        if self.htf.is_some() {
            roles.push(TfRole::Htf);
        }
        if self.mtf.is_some() {
            roles.push(TfRole::Mtf);
        }
        roles
    }
}

/// One indicator declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDecl {
    /// Canonical key (`ema_20`, `macd_12_26_9`, ...); validated against the
    /// registry's canonical naming.
    pub key: String,
    pub kind: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default = "default_role")]
    pub role: TfRole,
}

fn default_role() -> TfRole {
    TfRole::Exec
}

/// Position policy: direction filter and exit style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPolicy {
    pub direction: TradeDirection,
    pub exit_mode: ExitMode,
    /// Optional terminal stop: halt the run when equity drops this percent
    /// below the UTC day's opening equity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_loss_limit_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    LongOnly,
    ShortOnly,
    LongShort,
}

impl TradeDirection {
    pub fn allows_long(&self) -> bool {
        matches!(self, TradeDirection::LongOnly | TradeDirection::LongShort)
    }

    pub fn allows_short(&self) -> bool {
        matches!(self, TradeDirection::ShortOnly | TradeDirection::LongShort)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitMode {
    /// Only the bracket (SL/TP) closes positions; exit intents are ignored.
    SlTpOnly,
    /// Only exit intents close positions; no bracket is attached.
    Signal,
    /// Both are armed; whichever triggers first closes.
    FirstHit,
}

/// Stop-loss / take-profit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BracketRule {
    /// Percent of ROI on margin; the price distance shrinks with leverage.
    RoiPct { pct: f64 },
    /// Percent of entry price, leverage-independent.
    PricePct { pct: f64 },
    /// ATR multiple read from a declared feature at entry time.
    AtrMult { mult: f64, atr_key: String },
}

/// Order sizing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingRule {
    /// `equity × pct/100 × leverage`, capped by available balance × max leverage.
    PercentEquity { pct: f64, leverage: f64 },
    /// `(equity × risk_pct/100) / stop_distance_frac × leverage`.
    RiskBased { risk_pct: f64, leverage: f64 },
    FixedUsdt { usdt: f64, leverage: f64 },
}

impl SizingRule {
    pub fn leverage(&self) -> f64 {
        match self {
            SizingRule::PercentEquity { leverage, .. }
            | SizingRule::RiskBased { leverage, .. }
            | SizingRule::FixedUsdt { leverage, .. } => *leverage,
        }
    }
}

/// Risk model: bracket rules plus sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<BracketRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<BracketRule>,
    pub sizing: SizingRule,
}

/// The complete strategy specification for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Play {
    pub id: String,
    pub version: String,
    pub symbol: String,
    pub account: AccountConfig,
    pub timeframes: TimeframesDecl,
    #[serde(default)]
    pub features: Vec<FeatureDecl>,
    #[serde(default)]
    pub structures: Vec<StructureDecl>,
    pub policy: PositionPolicy,
    pub blocks: Vec<BlockSpec>,
    pub risk: RiskModel,
}

impl Play {
    /// Structural validation that needs no market data. Feed-dependent
    /// checks (rule compilation, structure aux columns) run at prep time.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.symbol.is_empty() {
            return Err(PerpLabError::Config(
                "play id and symbol must be non-empty".into(),
            ));
        }

        let acct = &self.account;
        if acct.starting_equity_usdt <= 0.0 {
            return Err(PerpLabError::Config(
                "starting_equity_usdt must be positive".into(),
            ));
        }
        if acct.max_leverage < 1.0 {
            return Err(PerpLabError::Config("max_leverage must be >= 1".into()));
        }
        if acct.margin_mode != MarginMode::Isolated {
            return Err(PerpLabError::Config(
                "only isolated margin is supported".into(),
            ));
        }
        if !(0.0..0.1).contains(&acct.maintenance_margin_rate) {
            return Err(PerpLabError::Config(
                "maintenance_margin_rate must lie in [0, 0.1)".into(),
            ));
        }

        // Exec must be the finest declared timeframe and every coarser role
        // must dilate evenly over it.
        for role in [TfRole::Htf, TfRole::Mtf] {
            if let Some(tf) = self.timeframes.get(role) {
                if tf < self.timeframes.exec {
                    return Err(PerpLabError::Config(format!(
                        "{role} timeframe {tf} is finer than exec {}",
                        self.timeframes.exec
                    )));
                }
                tf.dilation(self.timeframes.exec)?;
            }
        }

        // Features resolve against the registry; roles must be declared.
        for f in &self.features {
            if self.timeframes.get(f.role).is_none() {
                return Err(PerpLabError::Config(format!(
                    "feature '{}' declared on role {} with no timeframe",
                    f.key, f.role
                )));
            }
            ResolvedIndicator::resolve(&f.key, &f.kind, f.source.as_deref(), &f.params)?;
        }

        // Structure kinds parse; dependency wiring is validated when the
        // engine is built, ordering included.
        for s in &self.structures {
            StructureKind::parse(&s.kind)?;
        }

        let leverage = self.risk.sizing.leverage();
        if leverage < 1.0 || leverage > acct.max_leverage {
            return Err(PerpLabError::Config(format!(
                "sizing leverage {leverage} outside 1..={}",
                acct.max_leverage
            )));
        }

        match self.policy.exit_mode {
            ExitMode::SlTpOnly | ExitMode::FirstHit => {
                if self.risk.stop_loss.is_none() {
                    return Err(PerpLabError::Config(format!(
                        "exit_mode {:?} requires a stop_loss rule",
                        self.policy.exit_mode
                    )));
                }
            }
            ExitMode::Signal => {}
        }

        for rule in [&self.risk.stop_loss, &self.risk.take_profit]
            .into_iter()
            .flatten()
        {
            match rule {
                BracketRule::RoiPct { pct } | BracketRule::PricePct { pct } => {
                    if *pct <= 0.0 {
                        return Err(PerpLabError::Config(
                            "bracket percent must be positive".into(),
                        ));
                    }
                }
                BracketRule::AtrMult { mult, atr_key } => {
                    if *mult <= 0.0 {
                        return Err(PerpLabError::Config(
                            "bracket ATR multiple must be positive".into(),
                        ));
                    }
                    if !self.features.iter().any(|f| &f.key == atr_key) {
                        return Err(PerpLabError::Config(format!(
                            "bracket references undeclared feature '{atr_key}'"
                        )));
                    }
                }
            }
        }

        if let Some(limit) = self.policy.daily_loss_limit_pct {
            if !(0.0..100.0).contains(&limit) || limit == 0.0 {
                return Err(PerpLabError::Config(
                    "daily_loss_limit_pct must lie in (0, 100)".into(),
                ));
            }
        }

        if self.blocks.is_empty() {
            return Err(PerpLabError::Config(
                "play declares no rule blocks".into(),
            ));
        }

        Ok(())
    }

    /// Resolved indicator declarations, in declaration order.
    pub fn resolved_features(&self) -> Result<Vec<(TfRole, ResolvedIndicator)>> {
        self.features
            .iter()
            .map(|f| {
                Ok((
                    f.role,
                    ResolvedIndicator::resolve(&f.key, &f.kind, f.source.as_deref(), &f.params)?,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use serde_json::json;

    /// A minimal valid Play: hourly EMA crossover long with ROI brackets.
    pub fn ema_cross_play() -> Play {
        serde_json::from_value(json!({
            "id": "ema-cross-demo",
            "version": "1",
            "symbol": "BTCUSDT",
            "account": {
                "starting_equity_usdt": 10_000.0,
                "max_leverage": 10.0,
                "margin_mode": "isolated",
                "taker_fee_bps": 5.5,
                "maker_fee_bps": 2.0,
                "slippage_bps": 1.0,
                "maintenance_margin_rate": 0.005
            },
            "timeframes": {"exec": "1h"},
            "features": [
                {"key": "ema_9", "kind": "ema", "params": {"period": 9}},
                {"key": "ema_21", "kind": "ema", "params": {"period": 21}}
            ],
            "policy": {"direction": "long_only", "exit_mode": "first_hit"},
            "blocks": [
                {
                    "id": "entry",
                    "cases": [{
                        "when": {"op": "cross_above", "lhs": "ema_9", "rhs": "ema_21"},
                        "emit": [{"action": "entry_long"}]
                    }]
                },
                {
                    "id": "exit",
                    "cases": [{
                        "when": {"op": "cross_below", "lhs": "ema_9", "rhs": "ema_21"},
                        "emit": [{"action": "exit_long"}]
                    }]
                }
            ],
            "risk": {
                "stop_loss": {"mode": "roi_pct", "pct": 2.0},
                "take_profit": {"mode": "roi_pct", "pct": 4.0},
                "sizing": {"mode": "percent_equity", "pct": 10.0, "leverage": 3.0}
            }
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ema_cross_play;
    use super::*;

    #[test]
    fn valid_play_passes() {
        assert!(ema_cross_play().validate().is_ok());
    }

    #[test]
    fn rejects_cross_margin() {
        let mut play = ema_cross_play();
        play.account.margin_mode = MarginMode::Cross;
        assert!(play.validate().is_err());
    }

    #[test]
    fn rejects_sizing_leverage_over_max() {
        let mut play = ema_cross_play();
        play.risk.sizing = SizingRule::PercentEquity {
            pct: 10.0,
            leverage: 25.0,
        };
        assert!(play.validate().is_err());
    }

    #[test]
    fn rejects_htf_finer_than_exec() {
        let mut play = ema_cross_play();
        play.timeframes.htf = Some(Timeframe::M15);
        assert!(play.validate().is_err());
    }

    #[test]
    fn sl_tp_only_requires_stop() {
        let mut play = ema_cross_play();
        play.policy.exit_mode = ExitMode::SlTpOnly;
        play.risk.stop_loss = None;
        assert!(play.validate().is_err());
    }

    #[test]
    fn atr_bracket_must_reference_declared_feature() {
        let mut play = ema_cross_play();
        play.risk.stop_loss = Some(BracketRule::AtrMult {
            mult: 2.0,
            atr_key: "atr_14".into(),
        });
        assert!(play.validate().is_err());
    }

    #[test]
    fn unknown_feature_kind_is_config_error() {
        let mut play = ema_cross_play();
        play.features[0].kind = "hull_ma".into();
        assert!(play.validate().is_err());
    }

    #[test]
    fn play_json_round_trip() {
        let play = ema_cross_play();
        let s = serde_json::to_string(&play).unwrap();
        let back: Play = serde_json::from_str(&s).unwrap();
        assert_eq!(back, play);
    }
}
