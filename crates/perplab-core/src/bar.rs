//! Bar (OHLCV) data types.

use crate::error::{PerpLabError, Result};
use crate::timeframe::Timeframe;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar representing price action over a time period.
///
/// `ts_open_ms` is the inclusive open of the interval, `ts_close_ms` the
/// exclusive close (`ts_open_ms + tf.duration_ms()`). All prices are quoted
/// in USDT for a linear perpetual contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Interval open timestamp (UTC, milliseconds, inclusive)
    pub ts_open_ms: i64,

    /// Interval close timestamp (UTC, milliseconds, exclusive)
    pub ts_close_ms: i64,

    /// Opening price
    pub open: f64,

    /// Highest price during the interval
    pub high: f64,

    /// Lowest price during the interval
    pub low: f64,

    /// Closing price
    pub close: f64,

    /// Base-asset volume traded during the interval
    pub volume: f64,
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ts_open_ms: i64,
        ts_close_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            ts_open_ms,
            ts_close_ms,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Check the bar's shape invariants against its timeframe.
    ///
    /// A valid bar satisfies `ts_close - ts_open == tf_duration`,
    /// `low <= min(open, close)` and `high >= max(open, close)`.
    pub fn validate(&self, tf: Timeframe) -> Result<()> {
        if self.ts_close_ms - self.ts_open_ms != tf.duration_ms() {
            return Err(PerpLabError::Preflight(format!(
                "bar at ts_open={} spans {}ms, expected {}ms for {}",
                self.ts_open_ms,
                self.ts_close_ms - self.ts_open_ms,
                tf.duration_ms(),
                tf
            )));
        }
        if self.low > self.open.min(self.close) {
            return Err(PerpLabError::Preflight(format!(
                "bar at ts_open={}: low {} above body {}",
                self.ts_open_ms,
                self.low,
                self.open.min(self.close)
            )));
        }
        if self.high < self.open.max(self.close) {
            return Err(PerpLabError::Preflight(format!(
                "bar at ts_open={}: high {} below body {}",
                self.ts_open_ms,
                self.high,
                self.open.max(self.close)
            )));
        }
        Ok(())
    }

    /// Returns the bar's range (high - low).
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Returns the bar's body size (absolute difference between open and close).
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Returns true if this is a bullish (green) bar.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Returns true if this is a bearish (red) bar.
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}
