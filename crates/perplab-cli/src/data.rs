//! Candle loading from local Parquet/CSV files.
//!
//! Network ingestion lives outside this tool; the CLI only reads files the
//! data layer has already materialised, in the canonical schema
//! `ts_open_ms:i64, ts_close_ms:i64, open..volume:f64`.

use crate::config::CliConfig;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use perplab_core::feed::{Feed, MultiFeed};
use perplab_core::play::Play;
use perplab_core::timeframe::Timeframe;
use polars::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// Parse a `YYYY-MM-DD` window bound into UTC midnight milliseconds.
pub fn parse_date_ms(s: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{s}' (expected YYYY-MM-DD)"))?;
    let dt = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid");
    Ok(dt.and_utc().timestamp_millis())
}

fn read_frame(parquet: &Path, csv: &Path) -> Result<DataFrame> {
    if parquet.exists() {
        let file = File::open(parquet)
            .with_context(|| format!("open {}", parquet.display()))?;
        return ParquetReader::new(file)
            .finish()
            .with_context(|| format!("read {}", parquet.display()));
    }
    if csv.exists() {
        return LazyCsvReader::new(csv)
            .with_has_header(true)
            .finish()
            .and_then(|lf| lf.collect())
            .with_context(|| format!("read {}", csv.display()));
    }
    bail!(
        "no candle file at {} or {}; materialise the data first",
        parquet.display(),
        csv.display()
    )
}

/// Load one feed for (symbol, timeframe).
pub fn load_feed(config: &CliConfig, symbol: &str, tf: Timeframe) -> Result<Feed> {
    let (parquet, csv) = config.candle_path(symbol, &tf.label());
    let df = read_frame(&parquet, &csv)?;
    Feed::from_dataframe(&df, symbol, tf)
        .with_context(|| format!("building {symbol} {tf} feed"))
}

/// Load every feed a Play declares, plus the mandatory 1-minute quotes.
pub fn load_feeds_for_play(config: &CliConfig, play: &Play) -> Result<MultiFeed> {
    let mut feeds = BTreeMap::new();
    for role in play.timeframes.declared_roles() {
        let tf = play
            .timeframes
            .get(role)
            .expect("declared role has a timeframe");
        feeds.insert(role, load_feed(config, &play.symbol, tf)?);
    }
    let quote = load_feed(config, &play.symbol, Timeframe::M1)?;
    Ok(MultiFeed::new(feeds, quote)?)
}

/// Load and validate a Play JSON file.
pub fn load_play(path: &str) -> Result<Play> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading play file {path}"))?;
    let play: Play =
        serde_json::from_str(&text).with_context(|| format!("parsing play file {path}"))?;
    play.validate()?;
    Ok(play)
}

/// Role labels for display, in a stable order.
pub fn role_summary(play: &Play) -> String {
    play.timeframes
        .declared_roles()
        .iter()
        .filter_map(|role| {
            play.timeframes
                .get(*role)
                .map(|tf| format!("{role}={tf}"))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_parsing_round_trip() {
        let ms = parse_date_ms("2024-01-01").unwrap();
        assert_eq!(ms, 1_704_067_200_000);
        assert!(parse_date_ms("01/02/2024").is_err());
    }

    #[test]
    fn missing_candle_files_error_mentions_both_paths() {
        let config = CliConfig::default();
        let err = load_feed(&config, "NOSUCH", Timeframe::H1).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("1h.parquet"));
        assert!(msg.contains("1h.csv"));
    }
}
