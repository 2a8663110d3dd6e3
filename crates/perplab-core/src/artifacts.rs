//! Run artifacts: manifest, result metrics, trades/equity Parquet tables.
//!
//! Artifact content is a pure function of the Play, the window and the run
//! report. No wall-clock timestamps, no environment reads; two runs of the
//! same Play over the same window write byte-identical files, which is the
//! determinism audit's gate.

use crate::error::{PerpLabError, Result};
use crate::hashing::{canonical_json_pretty, hash_canonical, sha256_hex};
use crate::metrics::Metrics;
use crate::params::Params;
use crate::play::{AccountConfig, Play, PositionPolicy, RiskModel, TimeframesDecl};
use crate::runner::RunReport;
use crate::structure::{kind_output_fields, StructureKind};
use crate::timeframe::TfRole;
use chrono::DateTime;
use polars::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: &str = "1.0.0";
pub const ENGINE_NAME: &str = "perplab-core";

/// Engine identity written into every manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl EngineInfo {
    pub fn current() -> Self {
        Self {
            name: ENGINE_NAME,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// One feature declaration with its registry-resolved outputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureManifest {
    pub key: String,
    pub kind: String,
    pub role: TfRole,
    pub params: Params,
    pub source: Option<String>,
    pub outputs: Vec<String>,
    pub warmup_bars: usize,
}

/// One structure declaration with its registry output fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructureManifest {
    pub key: String,
    pub kind: String,
    pub depends_on: Option<String>,
    pub params: Params,
    pub outputs: Vec<String>,
}

/// The run manifest (`manifest.json`, sorted keys).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub schema_version: &'static str,
    pub engine: EngineInfo,
    pub play_id: String,
    pub play_version: String,
    pub symbol: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    /// RFC 3339 render of the window bounds, derived from the timestamps
    /// (never from the wall clock).
    pub window_start_iso: String,
    pub window_end_iso: String,
    pub timeframes: TimeframesDecl,
    pub features: Vec<FeatureManifest>,
    pub structures: Vec<StructureManifest>,
    pub blocks: Vec<String>,
    pub ast_hash: String,
    pub account: AccountConfig,
    pub policy: PositionPolicy,
    pub risk: RiskModel,
    pub warmup_bars: usize,
    /// Hash over engine identity, component identifiers and the canonical
    /// Play: changes when any code path or configuration changes.
    pub pipeline_signature: String,
    /// Content address of this run under `runs/`.
    pub run_hash: String,
}

/// Component identifiers folded into the pipeline signature. Renaming or
/// adding a core component changes every signature, which is the point.
const COMPONENTS: &[&str] = &[
    "feed",
    "indicators",
    "structure",
    "snapshot",
    "rules",
    "exchange",
    "risk",
    "runner",
    "metrics",
    "artifacts",
];

/// Build the deterministic manifest for a run.
pub fn build_manifest(play: &Play, report: &RunReport) -> Result<Manifest> {
    let features = play
        .resolved_features()?
        .into_iter()
        .map(|(role, resolved)| FeatureManifest {
            key: resolved.key.clone(),
            kind: resolved.kind.as_str().to_string(),
            role,
            params: resolved.params.clone(),
            source: Some(resolved.source.as_str().to_string()),
            outputs: resolved.output_columns(),
            warmup_bars: resolved.warmup_bars,
        })
        .collect();

    let structures = play
        .structures
        .iter()
        .map(|decl| {
            let kind = StructureKind::parse(&decl.kind)?;
            Ok(StructureManifest {
                key: decl.key.clone(),
                kind: decl.kind.clone(),
                depends_on: decl.depends_on.clone(),
                params: decl.params.clone(),
                outputs: kind_output_fields(kind)
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let pipeline_signature = pipeline_signature(play)?;
    let run_hash = run_hash(
        &pipeline_signature,
        report.window_start_ms,
        report.window_end_ms,
    );

    Ok(Manifest {
        schema_version: SCHEMA_VERSION,
        engine: EngineInfo::current(),
        play_id: play.id.clone(),
        play_version: play.version.clone(),
        symbol: play.symbol.clone(),
        window_start_ms: report.window_start_ms,
        window_end_ms: report.window_end_ms,
        window_start_iso: iso_utc(report.window_start_ms),
        window_end_iso: iso_utc(report.window_end_ms),
        timeframes: play.timeframes,
        features,
        structures,
        blocks: play.blocks.iter().map(|b| b.id.clone()).collect(),
        ast_hash: report.ast_hash.clone(),
        account: play.account.clone(),
        policy: play.policy.clone(),
        risk: play.risk.clone(),
        warmup_bars: report.warmup_bars,
        pipeline_signature,
        run_hash,
    })
}

fn iso_utc(ts_ms: i64) -> String {
    DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts_ms.to_string())
}

/// Hash over engine identity, component identifiers and the canonical Play.
pub fn pipeline_signature(play: &Play) -> Result<String> {
    #[derive(Serialize)]
    struct SignatureInput<'a> {
        engine: EngineInfo,
        components: &'static [&'static str],
        play: &'a Play,
    }
    hash_canonical(&SignatureInput {
        engine: EngineInfo::current(),
        components: COMPONENTS,
        play,
    })
}

/// Short content address for the run directory.
pub fn run_hash(pipeline_signature: &str, window_start_ms: i64, window_end_ms: i64) -> String {
    let input = format!("{pipeline_signature}:{window_start_ms}:{window_end_ms}");
    sha256_hex(input.as_bytes())[..16].to_string()
}

/// Paths of the artifacts written for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub result: PathBuf,
    pub trades: PathBuf,
    pub equity: PathBuf,
    pub logs_dir: PathBuf,
}

/// Write the full artifact set under
/// `{out_root}/runs/{play_id}/{symbol}/{run_hash}/`.
pub fn write_artifacts(
    play: &Play,
    report: &RunReport,
    metrics: &Metrics,
    out_root: &Path,
) -> Result<RunPaths> {
    let manifest = build_manifest(play, report)?;

    let dir = out_root
        .join("runs")
        .join(&play.id)
        .join(&play.symbol)
        .join(&manifest.run_hash);
    let logs_dir = dir.join("logs");
    fs::create_dir_all(&logs_dir)?;

    let paths = RunPaths {
        manifest: dir.join("manifest.json"),
        result: dir.join("result.json"),
        trades: dir.join("trades.parquet"),
        equity: dir.join("equity.parquet"),
        logs_dir,
        dir,
    };

    fs::write(&paths.manifest, canonical_json_pretty(&manifest)?)?;
    fs::write(&paths.result, canonical_json_pretty(metrics)?)?;

    let mut trades_df = trades_to_dataframe(report)?;
    write_parquet(&paths.trades, &mut trades_df)?;

    let mut equity_df = equity_to_dataframe(report)?;
    write_parquet(&paths.equity, &mut equity_df)?;

    tracing::info!(dir = %paths.dir.display(), "artifacts written");
    Ok(paths)
}

/// Write a partial error report before aborting (evaluation and exchange
/// failures only; config/preflight errors never get this far).
pub fn write_error_log(run_dir: &Path, error: &PerpLabError) -> Result<PathBuf> {
    #[derive(Serialize)]
    struct ErrorLog {
        kind: &'static str,
        message: String,
    }
    let kind = match error {
        PerpLabError::Evaluation(_) => "evaluation",
        PerpLabError::Exchange(_) => "exchange",
        PerpLabError::Determinism(_) => "determinism",
        _ => "other",
    };
    let logs = run_dir.join("logs");
    fs::create_dir_all(&logs)?;
    let path = logs.join("error.json");
    fs::write(
        &path,
        canonical_json_pretty(&ErrorLog {
            kind,
            message: error.to_string(),
        })?,
    )?;
    Ok(path)
}

/// One row per closed trade, schema per the artifact contract.
pub fn trades_to_dataframe(report: &RunReport) -> Result<DataFrame> {
    let trades = &report.trades;
    let trade_id: Vec<i64> = trades.iter().map(|t| t.trade_id).collect();
    let entry_ts: Vec<i64> = trades.iter().map(|t| t.entry_ts_ms).collect();
    let exit_ts: Vec<i64> = trades.iter().map(|t| t.exit_ts_ms).collect();
    let side: Vec<String> = trades.iter().map(|t| t.side.as_str().to_string()).collect();
    let size_qty: Vec<f64> = trades.iter().map(|t| t.size_qty).collect();
    let entry_price: Vec<f64> = trades.iter().map(|t| t.entry_price).collect();
    let exit_price: Vec<f64> = trades.iter().map(|t| t.exit_price).collect();
    let fees: Vec<f64> = trades.iter().map(|t| t.fees_usdt).collect();
    let pnl: Vec<f64> = trades.iter().map(|t| t.pnl_usdt).collect();
    let reason: Vec<String> = trades
        .iter()
        .map(|t| t.exit_reason.as_str().to_string())
        .collect();
    let mae: Vec<f64> = trades.iter().map(|t| t.mae_usdt).collect();
    let mfe: Vec<f64> = trades.iter().map(|t| t.mfe_usdt).collect();
    let leverage: Vec<f64> = trades.iter().map(|t| t.leverage).collect();

    DataFrame::new(vec![
        Series::new("trade_id".into(), trade_id).into(),
        Series::new("entry_ts_ms".into(), entry_ts).into(),
        Series::new("exit_ts_ms".into(), exit_ts).into(),
        Series::new("side".into(), side).into(),
        Series::new("size_qty".into(), size_qty).into(),
        Series::new("entry_price".into(), entry_price).into(),
        Series::new("exit_price".into(), exit_price).into(),
        Series::new("fees_usdt".into(), fees).into(),
        Series::new("pnl_usdt".into(), pnl).into(),
        Series::new("exit_reason".into(), reason).into(),
        Series::new("mae_usdt".into(), mae).into(),
        Series::new("mfe_usdt".into(), mfe).into(),
        Series::new("leverage".into(), leverage).into(),
    ])
    .map_err(PerpLabError::from)
}

/// The equity curve, one row per exec bar.
pub fn equity_to_dataframe(report: &RunReport) -> Result<DataFrame> {
    let curve = &report.equity_curve;
    let ts: Vec<i64> = curve.iter().map(|p| p.ts_ms).collect();
    let equity: Vec<f64> = curve.iter().map(|p| p.equity_usdt).collect();
    let cash: Vec<f64> = curve.iter().map(|p| p.cash_usdt).collect();
    let margin: Vec<f64> = curve.iter().map(|p| p.position_margin_usdt).collect();
    let upnl: Vec<f64> = curve.iter().map(|p| p.unrealized_pnl_usdt).collect();
    let mark: Vec<f64> = curve.iter().map(|p| p.mark_price).collect();

    DataFrame::new(vec![
        Series::new("ts_ms".into(), ts).into(),
        Series::new("equity_usdt".into(), equity).into(),
        Series::new("cash_usdt".into(), cash).into(),
        Series::new("position_margin_usdt".into(), margin).into(),
        Series::new("unrealized_pnl_usdt".into(), upnl).into(),
        Series::new("mark_price".into(), mark).into(),
    ])
    .map_err(PerpLabError::from)
}

fn write_parquet(path: &Path, df: &mut DataFrame) -> Result<()> {
    let mut file = fs::File::create(path)?;
    ParquetWriter::new(&mut file)
        .finish(df)
        .map_err(PerpLabError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ClosedTrade, FillReason, Side};
    use crate::play::test_support::ema_cross_play;
    use crate::runner::EquityPoint;

    fn dummy_report() -> RunReport {
        RunReport {
            play_id: "ema-cross-demo".into(),
            play_version: "1".into(),
            symbol: "BTCUSDT".into(),
            starting_equity_usdt: 10_000.0,
            final_equity_usdt: 10_040.0,
            warmup_bars: 21,
            bars_processed: 2,
            window_start_ms: 1_704_067_200_000,
            window_end_ms: 1_704_074_400_000,
            first_trading_ts_ms: 1_704_067_200_000,
            last_trading_ts_ms: 1_704_074_400_000,
            equity_curve: vec![
                EquityPoint {
                    ts_ms: 1_704_070_800_000,
                    equity_usdt: 10_000.0,
                    cash_usdt: 10_000.0,
                    position_margin_usdt: 0.0,
                    unrealized_pnl_usdt: 0.0,
                    mark_price: 50_000.0,
                },
                EquityPoint {
                    ts_ms: 1_704_074_400_000,
                    equity_usdt: 10_040.0,
                    cash_usdt: 10_040.0,
                    position_margin_usdt: 0.0,
                    unrealized_pnl_usdt: 0.0,
                    mark_price: 52_000.0,
                },
            ],
            trades: vec![ClosedTrade {
                trade_id: 1,
                entry_ts_ms: 1_704_067_260_000,
                exit_ts_ms: 1_704_070_860_000,
                side: Side::Long,
                size_qty: 0.02,
                entry_price: 50_000.0,
                exit_price: 52_000.0,
                fees_usdt: 0.0,
                pnl_usdt: 40.0,
                exit_reason: FillReason::ExitTp,
                mae_usdt: -5.0,
                mfe_usdt: 45.0,
                leverage: 3.0,
            }],
            fills: vec![],
            rejections: vec![],
            signals: vec![],
            total_fees_usdt: 0.0,
            total_funding_usdt: 0.0,
            signals_emitted: 1,
            entries_submitted: 1,
            liquidations: 0,
            stopped_by_daily_loss: false,
            ast_hash: "a".repeat(64),
            evaluated_bars: 2,
        }
    }

    #[test]
    fn manifest_is_deterministic() {
        let play = ema_cross_play();
        let report = dummy_report();
        let a = build_manifest(&play, &report).unwrap();
        let b = build_manifest(&play, &report).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.run_hash.len(), 16);
        assert_eq!(a.pipeline_signature.len(), 64);
    }

    #[test]
    fn pipeline_signature_tracks_play_changes() {
        let play = ema_cross_play();
        let sig = pipeline_signature(&play).unwrap();

        let mut changed = play.clone();
        changed.account.taker_fee_bps = 7.5;
        let sig2 = pipeline_signature(&changed).unwrap();
        assert_ne!(sig, sig2);
    }

    #[test]
    fn artifacts_written_byte_identical_across_runs() {
        let play = ema_cross_play();
        let report = dummy_report();
        let metrics = crate::metrics::compute_metrics(&report);

        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        let a = write_artifacts(&play, &report, &metrics, tmp_a.path()).unwrap();
        let b = write_artifacts(&play, &report, &metrics, tmp_b.path()).unwrap();

        for (pa, pb) in [
            (&a.manifest, &b.manifest),
            (&a.result, &b.result),
            (&a.trades, &b.trades),
            (&a.equity, &b.equity),
        ] {
            let bytes_a = std::fs::read(pa).unwrap();
            let bytes_b = std::fs::read(pb).unwrap();
            assert_eq!(bytes_a, bytes_b, "{} differs", pa.display());
        }
    }

    #[test]
    fn manifest_json_keys_are_sorted() {
        let play = ema_cross_play();
        let report = dummy_report();
        let manifest = build_manifest(&play, &report).unwrap();
        let text = canonical_json_pretty(&manifest).unwrap();

        let top_level: serde_json::Value = serde_json::from_str(&text).unwrap();
        let keys: Vec<&String> = top_level.as_object().unwrap().keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn parquet_round_trip_preserves_rows() {
        let report = dummy_report();
        let mut df = trades_to_dataframe(&report).unwrap();
        assert_eq!(df.height(), 1);

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trades.parquet");
        write_parquet(&path, &mut df).unwrap();

        let back = ParquetReader::new(std::fs::File::open(&path).unwrap())
            .finish()
            .unwrap();
        assert_eq!(back.height(), 1);
        assert_eq!(
            back.column("exit_reason")
                .unwrap()
                .str()
                .unwrap()
                .get(0)
                .unwrap(),
            "exit_tp"
        );
    }
}
