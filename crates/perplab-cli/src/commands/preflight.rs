//! `perplab preflight`: coverage and warmup checks without running.

use crate::config::CliConfig;
use crate::data::{load_feeds_for_play, load_play, parse_date_ms};
use anyhow::Result;
use colored::Colorize;
use perplab_core::preflight::run_preflight;
use perplab_core::prelude::RuleLimits;

pub fn execute(config: &CliConfig, play_path: &str, start: &str, end: &str) -> Result<()> {
    let play = load_play(play_path)?;
    let mut feeds = load_feeds_for_play(config, &play)?;

    let report = run_preflight(
        &play,
        &mut feeds,
        parse_date_ms(start)?,
        parse_date_ms(end)?,
        RuleLimits::default(),
    )?;

    println!(
        "{} {} {} window {start}..{end}",
        "PREFLIGHT OK".green().bold(),
        report.play_id.bold(),
        report.symbol
    );
    println!(
        "  warmup: {} exec bars (data needed from ts {})",
        report.warmup_bars, report.warmup_start_ms
    );
    for role in &report.roles {
        println!(
            "  {:>4} {:>4}  bars {:>7}/{:<7}  coverage {:>6.2}%  gaps {}",
            role.role.to_string(),
            role.tf,
            role.bars_present,
            role.bars_expected,
            role.coverage * 100.0,
            role.gap_bars
        );
    }
    println!("  1m coverage: {:.2}%", report.quote_coverage * 100.0);

    if report.issues.is_empty() {
        println!("  data quality: clean");
    } else {
        println!(
            "  data quality: {} issue(s), first: {:?}",
            report.issues.len().to_string().yellow(),
            report.issues[0]
        );
    }
    Ok(())
}
