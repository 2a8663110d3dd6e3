//! `perplab run`: preflight, execute, write artifacts, print a summary.

use crate::config::CliConfig;
use crate::data::{load_feeds_for_play, load_play, parse_date_ms, role_summary};
use anyhow::Result;
use colored::Colorize;
use perplab_core::artifacts::{write_artifacts, write_error_log};
use perplab_core::metrics::{compute_metrics, Metrics};
use perplab_core::preflight::run_preflight;
use perplab_core::prelude::RuleLimits;
use perplab_core::runner::{run_backtest, RunConfig};
use perplab_core::PerpLabError;
use rayon::prelude::*;
use std::path::PathBuf;

struct RunSummary {
    play_id: String,
    symbol: String,
    roles: String,
    metrics: Metrics,
    dir: PathBuf,
}

pub fn execute(
    config: &CliConfig,
    play_paths: &[String],
    start: &str,
    end: &str,
    no_preflight: bool,
) -> Result<()> {
    let window_start_ms = parse_date_ms(start)?;
    let window_end_ms = parse_date_ms(end)?;
    let run_config = RunConfig {
        window_start_ms,
        window_end_ms,
        rule_limits: RuleLimits::default(),
    };

    // Feeds are immutable once prepped, so a batch fans out cleanly; each
    // play owns its run state while sharing nothing mutable.
    let results: Vec<Result<RunSummary>> = play_paths
        .par_iter()
        .map(|path| run_one(config, path, run_config, no_preflight))
        .collect();

    let mut failed = false;
    for (path, result) in play_paths.iter().zip(results) {
        match result {
            Ok(summary) => print_summary(&summary),
            Err(e) => {
                failed = true;
                eprintln!("{} {path}: {e:#}", "FAILED".red().bold());
            }
        }
    }

    if failed {
        anyhow::bail!("one or more runs failed");
    }
    Ok(())
}

fn run_one(
    config: &CliConfig,
    play_path: &str,
    run_config: RunConfig,
    no_preflight: bool,
) -> Result<RunSummary> {
    let play = load_play(play_path)?;
    let mut feeds = load_feeds_for_play(config, &play)?;

    if !no_preflight {
        run_preflight(
            &play,
            &mut feeds,
            run_config.window_start_ms,
            run_config.window_end_ms,
            run_config.rule_limits,
        )?;
    }

    let report = match run_backtest(&play, feeds, run_config) {
        Ok(report) => report,
        Err(e @ (PerpLabError::Evaluation(_) | PerpLabError::Exchange(_))) => {
            // Fail-loud errors leave a partial error log behind.
            let dir = config
                .artifacts_root()
                .join("runs")
                .join(&play.id)
                .join(&play.symbol)
                .join("aborted");
            let _ = write_error_log(&dir, &e);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    let metrics = compute_metrics(&report);
    let paths = write_artifacts(&play, &report, &metrics, config.artifacts_root())?;

    Ok(RunSummary {
        play_id: play.id.clone(),
        symbol: play.symbol.clone(),
        roles: role_summary(&play),
        metrics,
        dir: paths.dir,
    })
}

fn print_summary(summary: &RunSummary) {
    let m = &summary.metrics;
    println!(
        "{} {} {} ({})",
        "OK".green().bold(),
        summary.play_id.bold(),
        summary.symbol,
        summary.roles
    );
    println!(
        "  return {:>8.2}%   max dd {:>6.2}%   sharpe {:>5.2}   trades {:>4}   win rate {:>5.1}%",
        m.total_return_pct, m.max_drawdown_pct, m.sharpe, m.num_trades, m.win_rate_pct
    );
    println!(
        "  fees {:>10.2}   funding {:>8.2}   liquidations {}   rejections {}",
        m.fees_total_usdt, m.funding_total_usdt, m.liquidations, m.rejections_total
    );
    println!("  artifacts: {}", summary.dir.display());
}
