//! Timeframes and timeframe roles.

use crate::error::{PerpLabError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds in one minute.
pub const MINUTE_MS: i64 = 60_000;

/// A candle timeframe, stored as a whole number of minutes.
///
/// Only timeframes that divide evenly into the venue's kline set are
/// accepted; everything in the engine (dilation, forward-fill, funding
/// boundaries) assumes bars are aligned to UTC midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    minutes: u32,
}

impl Timeframe {
    pub const M1: Timeframe = Timeframe { minutes: 1 };
    pub const M5: Timeframe = Timeframe { minutes: 5 };
    pub const M15: Timeframe = Timeframe { minutes: 15 };
    pub const M30: Timeframe = Timeframe { minutes: 30 };
    pub const H1: Timeframe = Timeframe { minutes: 60 };
    pub const H4: Timeframe = Timeframe { minutes: 240 };
    pub const D1: Timeframe = Timeframe { minutes: 1440 };

    /// Parse a timeframe label like `"1m"`, `"15m"`, `"1h"`, `"4h"`, `"1d"`.
    pub fn parse(label: &str) -> Result<Self> {
        let minutes = match label {
            "1m" => 1,
            "3m" => 3,
            "5m" => 5,
            "15m" => 15,
            "30m" => 30,
            "1h" => 60,
            "2h" => 120,
            "4h" => 240,
            "6h" => 360,
            "12h" => 720,
            "1d" => 1440,
            other => {
                return Err(PerpLabError::Config(format!(
                    "unknown timeframe '{other}' (expected one of 1m 3m 5m 15m 30m 1h 2h 4h 6h 12h 1d)"
                )))
            }
        };
        Ok(Self { minutes })
    }

    /// The timeframe's length in whole minutes.
    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    /// The timeframe's length in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        self.minutes as i64 * MINUTE_MS
    }

    /// Number of exec-TF bars covered by one bar at this (coarser) TF.
    ///
    /// `self` must be a whole multiple of `finer`.
    pub fn dilation(&self, finer: Timeframe) -> Result<u32> {
        if self.minutes % finer.minutes != 0 {
            return Err(PerpLabError::Config(format!(
                "timeframe {self} is not a whole multiple of {finer}"
            )));
        }
        Ok(self.minutes / finer.minutes)
    }

    /// Canonical label (`"1m"`, `"1h"`, ...).
    pub fn label(&self) -> String {
        match self.minutes {
            m if m % 1440 == 0 => format!("{}d", m / 1440),
            m if m % 60 == 0 => format!("{}h", m / 60),
            m => format!("{m}m"),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl TryFrom<String> for Timeframe {
    type Error = PerpLabError;

    fn try_from(value: String) -> Result<Self> {
        Timeframe::parse(&value)
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> String {
        tf.label()
    }
}

/// Role a timeframe plays in a backtest.
///
/// The execution timeframe is the finest declared timeframe; higher/medium
/// roles forward-fill between their closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TfRole {
    Exec,
    Htf,
    Mtf,
}

impl TfRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TfRole::Exec => "exec",
            TfRole::Htf => "htf",
            TfRole::Mtf => "mtf",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "exec" => Ok(TfRole::Exec),
            "htf" => Ok(TfRole::Htf),
            "mtf" => Ok(TfRole::Mtf),
            other => Err(PerpLabError::Config(format!(
                "unknown timeframe role '{other}' (expected exec, htf, or mtf)"
            ))),
        }
    }
}

impl fmt::Display for TfRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
