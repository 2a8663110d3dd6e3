//! `perplab audit`: offline audits against prepared data, plus the
//! optional determinism gate (two full runs, hashed artifacts).

use crate::config::CliConfig;
use crate::data::{load_feeds_for_play, load_play, parse_date_ms};
use anyhow::Result;
use colored::Colorize;
use perplab_core::audit::{
    ast_idempotence_audit, contract_audit, determinism_audit, math_parity_audit, rollup_audit,
    snapshot_plumbing_audit, AuditResult,
};
use perplab_core::prelude::RuleLimits;
use perplab_core::runner::RunConfig;
use perplab_core::structure::StructureEngine;

pub fn execute(
    config: &CliConfig,
    play_path: &str,
    start: &str,
    end: &str,
    determinism: bool,
) -> Result<()> {
    let play = load_play(play_path)?;
    let mut feeds = load_feeds_for_play(config, &play)?;

    // Prep indicators the same way a run would; audits inspect the result.
    for (role, resolved) in play.resolved_features()? {
        if let Some(feed) = feeds.feed_mut(role) {
            resolved.compute_into(feed)?;
        }
    }
    let structures = StructureEngine::from_decls(&play.structures, feeds.exec())?;

    let mut results: Vec<AuditResult> = vec![
        contract_audit(&play, &feeds)?,
        math_parity_audit(&play, &feeds)?,
        snapshot_plumbing_audit(&play, &feeds, &structures)?,
        rollup_audit(&feeds)?,
        ast_idempotence_audit(&play, &feeds, &structures, RuleLimits::default())?,
    ];

    if determinism {
        let run_config = RunConfig {
            window_start_ms: parse_date_ms(start)?,
            window_end_ms: parse_date_ms(end)?,
            rule_limits: RuleLimits::default(),
        };
        // Fatal on mismatch: the ? propagates exit code 4.
        results.push(determinism_audit(&play, &feeds, run_config)?);
    }

    println!("{} {}", "AUDITS".bold(), play.id.bold());
    let mut all_passed = true;
    for result in &results {
        let verdict = if result.passed {
            "PASS".green().bold()
        } else {
            all_passed = false;
            "FAIL".red().bold()
        };
        println!(
            "  {verdict} {:<20} {} checks",
            result.name, result.checks
        );
        for failure in result.failures.iter().take(5) {
            println!("        {}", failure.yellow());
        }
    }

    if !all_passed {
        anyhow::bail!("one or more audits failed");
    }
    Ok(())
}
