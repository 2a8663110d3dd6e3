//! Prep-time indicator layer.
//!
//! Indicators are computed once over their timeframe's feed and stored as
//! dense columns; the hot loop only ever reads them by index. The registry
//! defines, per kind, the accepted parameters, the input series, the output
//! names and a warmup formula (a pure function of the parameters).

pub mod math;

use crate::error::{PerpLabError, Result};
use crate::feed::Feed;
use crate::params::{ParamReader, Params};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registered indicator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Sma,
    Ema,
    Rsi,
    Atr,
    Macd,
    Bbands,
    Stoch,
    Highest,
    Lowest,
    Vwap,
}

impl IndicatorKind {
    /// Parse a declaration's kind string. Unknown kinds are a configuration
    /// error raised before any bar is processed.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sma" => Ok(IndicatorKind::Sma),
            "ema" => Ok(IndicatorKind::Ema),
            "rsi" => Ok(IndicatorKind::Rsi),
            "atr" => Ok(IndicatorKind::Atr),
            "macd" => Ok(IndicatorKind::Macd),
            "bbands" => Ok(IndicatorKind::Bbands),
            "stoch" => Ok(IndicatorKind::Stoch),
            "highest" => Ok(IndicatorKind::Highest),
            "lowest" => Ok(IndicatorKind::Lowest),
            "vwap" => Ok(IndicatorKind::Vwap),
            other => Err(PerpLabError::Config(format!(
                "unknown indicator kind '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Sma => "sma",
            IndicatorKind::Ema => "ema",
            IndicatorKind::Rsi => "rsi",
            IndicatorKind::Atr => "atr",
            IndicatorKind::Macd => "macd",
            IndicatorKind::Bbands => "bbands",
            IndicatorKind::Stoch => "stoch",
            IndicatorKind::Highest => "highest",
            IndicatorKind::Lowest => "lowest",
            IndicatorKind::Vwap => "vwap",
        }
    }

    /// Output field names. Single-output kinds expose one unnamed column
    /// stored under the declaration key itself.
    pub fn outputs(&self) -> &'static [&'static str] {
        match self {
            IndicatorKind::Macd => &["macd", "signal", "histogram"],
            IndicatorKind::Bbands => &["upper", "middle", "lower"],
            IndicatorKind::Stoch => &["k", "d"],
            _ => &[],
        }
    }

    pub fn is_multi_output(&self) -> bool {
        !self.outputs().is_empty()
    }

    /// True when the kind consumes full OHLCV bars rather than one series.
    pub fn requires_ohlcv(&self) -> bool {
        matches!(
            self,
            IndicatorKind::Atr | IndicatorKind::Stoch | IndicatorKind::Vwap
        )
    }

    fn accepted_params(&self) -> &'static [&'static str] {
        match self {
            IndicatorKind::Sma
            | IndicatorKind::Ema
            | IndicatorKind::Rsi
            | IndicatorKind::Highest
            | IndicatorKind::Lowest
            | IndicatorKind::Vwap => &["period"],
            IndicatorKind::Atr => &["period", "method"],
            IndicatorKind::Macd => &["fast", "slow", "signal"],
            IndicatorKind::Bbands => &["period", "std_mult"],
            IndicatorKind::Stoch => &["k_period", "k_smooth", "d_period"],
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The series an indicator reads from its feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    #[default]
    Close,
    Open,
    High,
    Low,
    Hlc3,
    /// Full OHLCV bars; only valid for kinds that require them.
    Ohlcv,
}

impl InputSource {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "close" => Ok(InputSource::Close),
            "open" => Ok(InputSource::Open),
            "high" => Ok(InputSource::High),
            "low" => Ok(InputSource::Low),
            "hlc3" => Ok(InputSource::Hlc3),
            "ohlcv" => Ok(InputSource::Ohlcv),
            other => Err(PerpLabError::Config(format!(
                "unknown indicator input source '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputSource::Close => "close",
            InputSource::Open => "open",
            InputSource::High => "high",
            InputSource::Low => "low",
            InputSource::Hlc3 => "hlc3",
            InputSource::Ohlcv => "ohlcv",
        }
    }
}

/// A fully validated indicator declaration bound to one feed.
///
/// Resolution checks kind, parameters and input-source compatibility and
/// pins the warmup; anything wrong is a configuration error before the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedIndicator {
    pub key: String,
    pub kind: IndicatorKind,
    pub source: InputSource,
    pub params: Params,
    pub warmup_bars: usize,
}

impl ResolvedIndicator {
    pub fn resolve(
        key: &str,
        kind_str: &str,
        source_str: Option<&str>,
        params: &Params,
    ) -> Result<Self> {
        let kind = IndicatorKind::parse(kind_str)?;
        let reader = ParamReader::new(key, params);
        reader.check_known(kind.accepted_params())?;

        let source = match source_str {
            Some(s) => InputSource::parse(s)?,
            None => {
                if kind.requires_ohlcv() {
                    InputSource::Ohlcv
                } else {
                    InputSource::Close
                }
            }
        };

        if kind.requires_ohlcv() && source != InputSource::Ohlcv {
            return Err(PerpLabError::Config(format!(
                "{key}: indicator kind '{kind}' reads full bars; source '{}' is incompatible",
                source.as_str()
            )));
        }
        if !kind.requires_ohlcv() && source == InputSource::Ohlcv {
            return Err(PerpLabError::Config(format!(
                "{key}: indicator kind '{kind}' reads a single series; declare a price source"
            )));
        }

        let warmup_bars = warmup_bars(kind, &reader)?;

        let resolved = Self {
            key: key.to_string(),
            kind,
            source,
            params: params.clone(),
            warmup_bars,
        };

        let canonical = resolved.canonical_key()?;
        if key != canonical {
            return Err(PerpLabError::Config(format!(
                "feature key '{key}' does not match canonical name '{canonical}'"
            )));
        }

        Ok(resolved)
    }

    /// Canonical column name derived from kind, parameters and source
    /// (e.g. `ema_20`, `macd_12_26_9`, `highest_50_high`).
    pub fn canonical_key(&self) -> Result<String> {
        let r = ParamReader::new(&self.key, &self.params);
        let mut name = match self.kind {
            IndicatorKind::Sma
            | IndicatorKind::Ema
            | IndicatorKind::Rsi
            | IndicatorKind::Highest
            | IndicatorKind::Lowest
            | IndicatorKind::Vwap => {
                format!("{}_{}", self.kind, r.require_usize("period")?)
            }
            IndicatorKind::Atr => {
                let period = r.require_usize("period")?;
                match r.opt_str("method", "wilder")? {
                    "wilder" => format!("atr_{period}"),
                    "sma" => format!("atr_sma_{period}"),
                    other => {
                        return Err(PerpLabError::Config(format!(
                            "{}: unknown atr method '{other}' (expected wilder or sma)",
                            self.key
                        )))
                    }
                }
            }
            IndicatorKind::Macd => format!(
                "macd_{}_{}_{}",
                r.require_usize("fast")?,
                r.require_usize("slow")?,
                r.require_usize("signal")?
            ),
            IndicatorKind::Bbands => {
                let period = r.require_usize("period")?;
                let mult = r.opt_f64("std_mult", 2.0)?;
                if mult == 2.0 {
                    format!("bbands_{period}")
                } else {
                    format!("bbands_{period}_{}", format_mult(mult))
                }
            }
            IndicatorKind::Stoch => format!(
                "stoch_{}_{}_{}",
                r.require_usize("k_period")?,
                r.opt_usize("k_smooth", 1)?,
                r.opt_usize("d_period", 3)?
            ),
        };

        // Non-default single-series sources are part of the name.
        if !self.kind.requires_ohlcv() && self.source != InputSource::Close {
            name.push('_');
            name.push_str(self.source.as_str());
        }

        Ok(name)
    }

    /// Column names this declaration writes into its feed.
    pub fn output_columns(&self) -> Vec<String> {
        if self.kind.is_multi_output() {
            self.kind
                .outputs()
                .iter()
                .map(|field| format!("{}.{field}", self.key))
                .collect()
        } else {
            vec![self.key.clone()]
        }
    }

    /// Compute the indicator over `feed` and attach its columns.
    ///
    /// Returns false when every value inside the post-warmup window is NaN;
    /// that is a soft ready-gate signal for the caller, not an error.
    pub fn compute_into(&self, feed: &mut Feed) -> Result<bool> {
        let r = ParamReader::new(&self.key, &self.params);
        let columns: Vec<(String, Vec<f64>)> = match self.kind {
            IndicatorKind::Sma => {
                let period = r.require_usize("period")?;
                vec![(self.key.clone(), math::sma(&self.series(feed), period))]
            }
            IndicatorKind::Ema => {
                let period = r.require_usize("period")?;
                vec![(self.key.clone(), math::ema(&self.series(feed), period))]
            }
            IndicatorKind::Rsi => {
                let period = r.require_usize("period")?;
                vec![(self.key.clone(), math::rsi(&self.series(feed), period))]
            }
            IndicatorKind::Highest => {
                let period = r.require_usize("period")?;
                vec![(
                    self.key.clone(),
                    math::rolling_max(&self.series(feed), period),
                )]
            }
            IndicatorKind::Lowest => {
                let period = r.require_usize("period")?;
                vec![(
                    self.key.clone(),
                    math::rolling_min(&self.series(feed), period),
                )]
            }
            IndicatorKind::Atr => {
                let period = r.require_usize("period")?;
                let (high, low, close) = ohlc_slices(feed);
                let values = match r.opt_str("method", "wilder")? {
                    "sma" => math::atr_sma(&high, &low, &close, period),
                    _ => math::atr_wilder(&high, &low, &close, period),
                };
                vec![(self.key.clone(), values)]
            }
            IndicatorKind::Vwap => {
                let period = r.require_usize("period")?;
                let (high, low, close) = ohlc_slices(feed);
                let volume: Vec<f64> = (0..feed.len()).map(|i| feed.volume(i)).collect();
                vec![(
                    self.key.clone(),
                    math::rolling_vwap(&high, &low, &close, &volume, period),
                )]
            }
            IndicatorKind::Macd => {
                let (line, signal, hist) = math::macd(
                    &self.series(feed),
                    r.require_usize("fast")?,
                    r.require_usize("slow")?,
                    r.require_usize("signal")?,
                );
                vec![
                    (format!("{}.macd", self.key), line),
                    (format!("{}.signal", self.key), signal),
                    (format!("{}.histogram", self.key), hist),
                ]
            }
            IndicatorKind::Bbands => {
                let (upper, middle, lower) = math::bollinger(
                    &self.series(feed),
                    r.require_usize("period")?,
                    r.opt_f64("std_mult", 2.0)?,
                );
                vec![
                    (format!("{}.upper", self.key), upper),
                    (format!("{}.middle", self.key), middle),
                    (format!("{}.lower", self.key), lower),
                ]
            }
            IndicatorKind::Stoch => {
                let (high, low, close) = ohlc_slices(feed);
                let (k, d) = math::stochastic(
                    &high,
                    &low,
                    &close,
                    r.require_usize("k_period")?,
                    r.opt_usize("k_smooth", 1)?,
                    r.opt_usize("d_period", 3)?,
                );
                vec![(format!("{}.k", self.key), k), (format!("{}.d", self.key), d)]
            }
        };

        let mut any_finite = false;
        for (name, values) in columns {
            if values[self.warmup_bars.min(values.len().saturating_sub(1))..]
                .iter()
                .any(|v| v.is_finite())
            {
                any_finite = true;
            }
            feed.set_indicator(name, values)?;
        }

        if !any_finite {
            tracing::warn!(key = %self.key, "indicator is all-NaN past warmup; ready gate stays closed");
        }
        Ok(any_finite)
    }

    fn series(&self, feed: &Feed) -> Vec<f64> {
        let n = feed.len();
        match self.source {
            InputSource::Close | InputSource::Ohlcv => (0..n).map(|i| feed.close(i)).collect(),
            InputSource::Open => (0..n).map(|i| feed.open(i)).collect(),
            InputSource::High => (0..n).map(|i| feed.high(i)).collect(),
            InputSource::Low => (0..n).map(|i| feed.low(i)).collect(),
            InputSource::Hlc3 => (0..n)
                .map(|i| (feed.high(i) + feed.low(i) + feed.close(i)) / 3.0)
                .collect(),
        }
    }
}

fn ohlc_slices(feed: &Feed) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = feed.len();
    (
        (0..n).map(|i| feed.high(i)).collect(),
        (0..n).map(|i| feed.low(i)).collect(),
        (0..n).map(|i| feed.close(i)).collect(),
    )
}

/// Warmup bar count for a kind given its parameters.
fn warmup_bars(kind: IndicatorKind, r: &ParamReader<'_>) -> Result<usize> {
    Ok(match kind {
        IndicatorKind::Sma
        | IndicatorKind::Ema
        | IndicatorKind::Bbands
        | IndicatorKind::Highest
        | IndicatorKind::Lowest
        | IndicatorKind::Vwap
        | IndicatorKind::Atr => r.require_usize("period")?,
        IndicatorKind::Rsi => r.require_usize("period")? + 1,
        IndicatorKind::Macd => r.require_usize("slow")? + r.require_usize("signal")? - 1,
        IndicatorKind::Stoch => {
            r.require_usize("k_period")? + r.opt_usize("k_smooth", 1)? + r.opt_usize("d_period", 3)?
                - 2
        }
    })
}

/// Format a float parameter for canonical names without a trailing `.0`.
fn format_mult(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}").replace('.', "p")
    }
}
