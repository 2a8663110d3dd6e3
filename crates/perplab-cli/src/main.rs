//! PerpLab CLI - command-line interface for the perp backtester.

use clap::{Parser, Subcommand};
use perplab_cli::commands;
use perplab_cli::config::CliConfig;
use perplab_core::PerpLabError;
use perplab_logging::{init_cli_logging, LogConfig};

#[derive(Parser)]
#[command(name = "perplab")]
#[command(author, version, about = "Deterministic perp-futures backtester", long_about = None)]
struct Cli {
    /// Path to perplab.toml (defaults to ./perplab.toml when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more Plays over a window
    Run {
        /// Play JSON files
        #[arg(short, long, required = true, num_args = 1..)]
        plays: Vec<String>,

        /// Window start (YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Window end (YYYY-MM-DD)
        #[arg(long)]
        end: String,

        /// Skip preflight (not recommended)
        #[arg(long, default_value_t = false)]
        no_preflight: bool,
    },

    /// Check data coverage and warmup feasibility without running
    Preflight {
        #[arg(short, long)]
        play: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,
    },

    /// Offline audits: contract, math parity, plumbing, rollup, determinism
    Audit {
        #[arg(short, long)]
        play: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Also run the determinism gate (two full runs)
        #[arg(long, default_value_t = false)]
        determinism: bool,
    },
}

fn main() {
    let _guard = init_cli_logging(&LogConfig::from_env());
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref());

    let result = match cli.command {
        Commands::Run {
            plays,
            start,
            end,
            no_preflight,
        } => commands::run::execute(&config, &plays, &start, &end, no_preflight),
        Commands::Preflight { play, start, end } => {
            commands::preflight::execute(&config, &play, &start, &end)
        }
        Commands::Audit {
            play,
            start,
            end,
            determinism,
        } => commands::audit::execute(&config, &play, &start, &end, determinism),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        let code = e
            .downcast_ref::<PerpLabError>()
            .map(PerpLabError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
