//! Array-backed OHLCV feeds and the multi-timeframe feed store.
//!
//! Feeds are built once at prep time from Polars frames and are immutable
//! afterwards; the hot loop reads them through O(1) index access only.
//! Key invariant: any temporal lookup resolves to the highest index whose
//! `ts_close_ms` does not exceed the queried timestamp (closed candles only).

use crate::bar::Bar;
use crate::error::{PerpLabError, Result};
use crate::timeframe::{TfRole, Timeframe};
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap};

/// Dense column storage for one (symbol, timeframe) pair.
///
/// Indicator columns are aligned 1:1 with bars; a missing value is the NaN
/// sentinel. Columns are attached by the indicator layer at prep time and
/// never resized afterwards.
#[derive(Debug, Clone)]
pub struct Feed {
    symbol: String,
    tf: Timeframe,
    ts_open_ms: Vec<i64>,
    ts_close_ms: Vec<i64>,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
    indicators: BTreeMap<String, Vec<f64>>,
    close_to_idx: HashMap<i64, usize>,
}

impl Feed {
    /// Build a feed from in-memory bars. Bars must be sorted ascending by
    /// `ts_open_ms` with no duplicates; each bar must span exactly `tf`.
    pub fn from_bars(symbol: impl Into<String>, tf: Timeframe, bars: &[Bar]) -> Result<Self> {
        let n = bars.len();
        let mut feed = Feed {
            symbol: symbol.into(),
            tf,
            ts_open_ms: Vec::with_capacity(n),
            ts_close_ms: Vec::with_capacity(n),
            open: Vec::with_capacity(n),
            high: Vec::with_capacity(n),
            low: Vec::with_capacity(n),
            close: Vec::with_capacity(n),
            volume: Vec::with_capacity(n),
            indicators: BTreeMap::new(),
            close_to_idx: HashMap::with_capacity(n),
        };

        for (i, bar) in bars.iter().enumerate() {
            bar.validate(tf)?;
            if let Some(&prev) = feed.ts_open_ms.last() {
                if bar.ts_open_ms <= prev {
                    return Err(PerpLabError::Preflight(format!(
                        "{} {}: bars out of order at index {i} (ts_open {} after {})",
                        feed.symbol, tf, bar.ts_open_ms, prev
                    )));
                }
            }
            feed.ts_open_ms.push(bar.ts_open_ms);
            feed.ts_close_ms.push(bar.ts_close_ms);
            feed.open.push(bar.open);
            feed.high.push(bar.high);
            feed.low.push(bar.low);
            feed.close.push(bar.close);
            feed.volume.push(bar.volume);
            feed.close_to_idx.insert(bar.ts_close_ms, i);
        }

        Ok(feed)
    }

    /// Build a feed from a Polars frame with the canonical input schema:
    /// `ts_open_ms:i64, ts_close_ms:i64, open..volume:f64`, sorted ascending.
    pub fn from_dataframe(df: &DataFrame, symbol: impl Into<String>, tf: Timeframe) -> Result<Self> {
        let ts_open = int_column(df, "ts_open_ms")?;
        let ts_close = int_column(df, "ts_close_ms")?;
        let open = float_column(df, "open")?;
        let high = float_column(df, "high")?;
        let low = float_column(df, "low")?;
        let close = float_column(df, "close")?;
        let volume = float_column(df, "volume")?;

        let mut bars = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            bars.push(Bar::new(
                ts_open[i], ts_close[i], open[i], high[i], low[i], close[i], volume[i],
            ));
        }
        Self::from_bars(symbol, tf, &bars)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn tf(&self) -> Timeframe {
        self.tf
    }

    pub fn len(&self) -> usize {
        self.ts_open_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts_open_ms.is_empty()
    }

    /// Materialize the canonical bar at `idx`.
    pub fn bar(&self, idx: usize) -> Bar {
        Bar {
            ts_open_ms: self.ts_open_ms[idx],
            ts_close_ms: self.ts_close_ms[idx],
            open: self.open[idx],
            high: self.high[idx],
            low: self.low[idx],
            close: self.close[idx],
            volume: self.volume[idx],
        }
    }

    pub fn ts_open(&self, idx: usize) -> i64 {
        self.ts_open_ms[idx]
    }

    pub fn ts_close(&self, idx: usize) -> i64 {
        self.ts_close_ms[idx]
    }

    pub fn open(&self, idx: usize) -> f64 {
        self.open[idx]
    }

    pub fn high(&self, idx: usize) -> f64 {
        self.high[idx]
    }

    pub fn low(&self, idx: usize) -> f64 {
        self.low[idx]
    }

    pub fn close(&self, idx: usize) -> f64 {
        self.close[idx]
    }

    pub fn volume(&self, idx: usize) -> f64 {
        self.volume[idx]
    }

    pub fn first_ts_open(&self) -> Option<i64> {
        self.ts_open_ms.first().copied()
    }

    pub fn last_ts_close(&self) -> Option<i64> {
        self.ts_close_ms.last().copied()
    }

    /// Attach a named indicator column. The column must be bar-aligned.
    pub fn set_indicator(&mut self, key: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let key = key.into();
        if values.len() != self.len() {
            return Err(PerpLabError::Config(format!(
                "indicator '{key}' column length {} does not match feed length {}",
                values.len(),
                self.len()
            )));
        }
        self.indicators.insert(key, values);
        Ok(())
    }

    /// Full indicator column, if declared.
    pub fn indicator(&self, key: &str) -> Option<&[f64]> {
        self.indicators.get(key).map(|v| v.as_slice())
    }

    /// Indicator value at `idx`; NaN when the key is unknown or not yet warm.
    pub fn indicator_value(&self, key: &str, idx: usize) -> f64 {
        match self.indicators.get(key) {
            Some(col) => col[idx],
            None => f64::NAN,
        }
    }

    pub fn has_indicator(&self, key: &str) -> bool {
        self.indicators.contains_key(key)
    }

    /// Declared indicator keys, in sorted order.
    pub fn indicator_keys(&self) -> impl Iterator<Item = &str> {
        self.indicators.keys().map(|k| k.as_str())
    }

    /// Exact-close lookup: index of the bar closing at `ts_close_ms`.
    pub fn idx_at_close(&self, ts_close_ms: i64) -> Option<usize> {
        self.close_to_idx.get(&ts_close_ms).copied()
    }

    /// Greatest index whose close does not exceed `ts_ms`, or None when the
    /// first bar closes after `ts_ms`. This is the forward-fill primitive.
    pub fn idx_at_or_before(&self, ts_ms: i64) -> Option<usize> {
        let n = self.ts_close_ms.partition_point(|&close| close <= ts_ms);
        n.checked_sub(1)
    }
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let col = df
        .column(name)
        .map_err(|_| PerpLabError::Preflight(format!("OHLCV frame missing column '{name}'")))?
        .f64()
        .map_err(|e| PerpLabError::Preflight(format!("column '{name}' is not f64: {e}")))?;
    Ok(col.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

fn int_column(df: &DataFrame, name: &str) -> Result<Vec<i64>> {
    let col = df
        .column(name)
        .map_err(|_| PerpLabError::Preflight(format!("OHLCV frame missing column '{name}'")))?
        .i64()
        .map_err(|e| PerpLabError::Preflight(format!("column '{name}' is not i64: {e}")))?;
    col.into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| {
                PerpLabError::Preflight(format!("column '{name}' has null at row {i}"))
            })
        })
        .collect()
}

/// The feed store: one feed per declared role plus the dense 1-minute quote
/// feed used for intra-bar fills and sub-loop mark prices.
#[derive(Debug, Clone)]
pub struct MultiFeed {
    feeds: BTreeMap<TfRole, Feed>,
    quote: Feed,
}

impl MultiFeed {
    /// Assemble the store. The exec feed must be present and be the finest
    /// declared timeframe; the quote feed must be 1-minute; all feeds must
    /// share one symbol.
    pub fn new(feeds: BTreeMap<TfRole, Feed>, quote: Feed) -> Result<Self> {
        let exec = feeds
            .get(&TfRole::Exec)
            .ok_or_else(|| PerpLabError::Config("no exec feed declared".into()))?;

        if quote.tf() != Timeframe::M1 {
            return Err(PerpLabError::Config(format!(
                "quote feed must be 1m, got {}",
                quote.tf()
            )));
        }

        for (role, feed) in &feeds {
            if feed.symbol() != quote.symbol() {
                return Err(PerpLabError::Config(format!(
                    "feed {role} symbol '{}' differs from quote symbol '{}'",
                    feed.symbol(),
                    quote.symbol()
                )));
            }
            if *role != TfRole::Exec && feed.tf() < exec.tf() {
                return Err(PerpLabError::Config(format!(
                    "role {role} timeframe {} is finer than exec {}; exec must be the finest",
                    feed.tf(),
                    exec.tf()
                )));
            }
            // Coarser roles must dilate evenly over exec bars.
            feed.tf().dilation(exec.tf())?;
        }

        Ok(Self { feeds, quote })
    }

    pub fn symbol(&self) -> &str {
        self.quote.symbol()
    }

    pub fn feed(&self, role: TfRole) -> Option<&Feed> {
        self.feeds.get(&role)
    }

    pub fn feed_mut(&mut self, role: TfRole) -> Option<&mut Feed> {
        self.feeds.get_mut(&role)
    }

    pub fn exec(&self) -> &Feed {
        &self.feeds[&TfRole::Exec]
    }

    pub fn quote(&self) -> &Feed {
        &self.quote
    }

    pub fn roles(&self) -> impl Iterator<Item = TfRole> + '_ {
        self.feeds.keys().copied()
    }

    /// Forward-fill lookup: index into `role`'s feed visible at `ts_ms`
    /// (highest index whose close is at or before `ts_ms`).
    pub fn role_idx_at(&self, role: TfRole, ts_ms: i64) -> Option<usize> {
        self.feeds.get(&role).and_then(|f| f.idx_at_or_before(ts_ms))
    }

    /// Half-open quote index range `[start, end)` covering the minutes of
    /// exec bar `exec_idx`. Empty when the quote feed has no bars there.
    pub fn quote_range_for_exec(&self, exec_idx: usize) -> (usize, usize) {
        let exec = self.exec();
        let open = exec.ts_open(exec_idx);
        let close = exec.ts_close(exec_idx);
        let start = self
            .quote
            .ts_close_ms
            .partition_point(|&c| c <= open);
        let end = self.quote.ts_close_ms.partition_point(|&c| c <= close);
        (start, end)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::bars_from_closes;
    use super::*;

    const T0: i64 = 1_704_067_200_000; // 2024-01-01 00:00 UTC

    fn hourly_feed(closes: &[f64]) -> Feed {
        let bars = bars_from_closes(Timeframe::H1, T0, closes);
        Feed::from_bars("BTCUSDT", Timeframe::H1, &bars).unwrap()
    }

    fn minute_feed(n: usize) -> Feed {
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + i as f64 * 0.1).collect();
        let bars = bars_from_closes(Timeframe::M1, T0, &closes);
        Feed::from_bars("BTCUSDT", Timeframe::M1, &bars).unwrap()
    }

    #[test]
    fn from_bars_rejects_out_of_order() {
        let mut bars = bars_from_closes(Timeframe::H1, T0, &[1.0, 2.0, 3.0]);
        bars.swap(0, 2);
        assert!(Feed::from_bars("BTCUSDT", Timeframe::H1, &bars).is_err());
    }

    #[test]
    fn idx_at_or_before_forward_fills() {
        let feed = hourly_feed(&[1.0, 2.0, 3.0]);
        // Before first close
        assert_eq!(feed.idx_at_or_before(T0), None);
        // Exactly at first close
        assert_eq!(feed.idx_at_or_before(T0 + 3_600_000), Some(0));
        // Mid second bar still sees the first close
        assert_eq!(feed.idx_at_or_before(T0 + 5_400_000), Some(0));
        // Far in the future clamps to the last bar
        assert_eq!(feed.idx_at_or_before(T0 + 86_400_000), Some(2));
    }

    #[test]
    fn idx_at_close_is_exact() {
        let feed = hourly_feed(&[1.0, 2.0, 3.0]);
        assert_eq!(feed.idx_at_close(T0 + 7_200_000), Some(1));
        assert_eq!(feed.idx_at_close(T0 + 7_200_001), None);
    }

    #[test]
    fn indicator_columns_are_length_checked() {
        let mut feed = hourly_feed(&[1.0, 2.0, 3.0]);
        assert!(feed.set_indicator("ema_2", vec![f64::NAN, 1.5]).is_err());
        assert!(feed
            .set_indicator("ema_2", vec![f64::NAN, 1.5, 2.5])
            .is_ok());
        assert!(feed.indicator_value("ema_2", 0).is_nan());
        assert_eq!(feed.indicator_value("ema_2", 2), 2.5);
        assert!(feed.indicator_value("missing", 0).is_nan());
    }

    #[test]
    fn multi_feed_requires_exec_and_1m_quote() {
        let quote = minute_feed(120);
        let mut feeds = BTreeMap::new();
        feeds.insert(TfRole::Exec, hourly_feed(&[1.0, 2.0]));
        assert!(MultiFeed::new(feeds.clone(), quote.clone()).is_ok());

        // Quote at the wrong TF is rejected
        let bad_quote = hourly_feed(&[1.0, 2.0]);
        assert!(MultiFeed::new(feeds.clone(), bad_quote).is_err());

        // Missing exec is rejected
        let empty: BTreeMap<TfRole, Feed> = BTreeMap::new();
        assert!(MultiFeed::new(empty, quote).is_err());
    }

    #[test]
    fn multi_feed_rejects_htf_finer_than_exec() {
        let quote = minute_feed(120);
        let mut feeds = BTreeMap::new();
        feeds.insert(TfRole::Exec, hourly_feed(&[1.0, 2.0]));
        let m15_bars = bars_from_closes(Timeframe::M15, T0, &[1.0; 8]);
        feeds.insert(
            TfRole::Htf,
            Feed::from_bars("BTCUSDT", Timeframe::M15, &m15_bars).unwrap(),
        );
        assert!(MultiFeed::new(feeds, quote).is_err());
    }

    #[test]
    fn quote_range_covers_exec_bar_minutes() {
        let quote = minute_feed(180);
        let mut feeds = BTreeMap::new();
        feeds.insert(TfRole::Exec, hourly_feed(&[1.0, 2.0, 3.0]));
        let mf = MultiFeed::new(feeds, quote).unwrap();

        let (start, end) = mf.quote_range_for_exec(0);
        assert_eq!((start, end), (0, 60));
        let (start, end) = mf.quote_range_for_exec(2);
        assert_eq!((start, end), (120, 180));
    }
}
