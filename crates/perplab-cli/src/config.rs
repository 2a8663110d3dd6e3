//! CLI configuration from `perplab.toml`.
//!
//! Only paths live here; engine behaviour comes exclusively from the Play.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Root of candle data: `{data_dir}/{symbol}/{tf}.parquet` (or `.csv`).
    pub data_dir: PathBuf,
    /// Root for run artifacts: `{artifacts_dir}/runs/...`.
    pub artifacts_dir: PathBuf,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/candles"),
            artifacts_dir: PathBuf::from("data"),
        }
    }
}

impl CliConfig {
    /// Load from an explicit path, else `./perplab.toml`, else defaults.
    pub fn load(explicit: Option<&str>) -> Self {
        let path = explicit
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("perplab.toml"));
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("warning: invalid {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) if explicit.is_some() => {
                eprintln!(
                    "warning: config {} not readable; using defaults",
                    path.display()
                );
                Self::default()
            }
            Err(_) => Self::default(),
        }
    }

    pub fn candle_path(&self, symbol: &str, tf_label: &str) -> (PathBuf, PathBuf) {
        let dir = self.data_dir.join(symbol);
        (
            dir.join(format!("{tf_label}.parquet")),
            dir.join(format!("{tf_label}.csv")),
        )
    }

    pub fn artifacts_root(&self) -> &Path {
        &self.artifacts_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_config_file() {
        let config = CliConfig::load(None);
        assert_eq!(config.data_dir, PathBuf::from("data/candles"));
    }

    #[test]
    fn parses_toml_overrides() {
        let config: CliConfig =
            toml::from_str("data_dir = \"/tmp/candles\"\nartifacts_dir = \"/tmp/out\"").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/candles"));
        assert_eq!(config.artifacts_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn candle_paths_by_symbol_and_tf() {
        let config = CliConfig::default();
        let (parquet, csv) = config.candle_path("BTCUSDT", "1h");
        assert!(parquet.ends_with("BTCUSDT/1h.parquet"));
        assert!(csv.ends_with("BTCUSDT/1h.csv"));
    }
}
