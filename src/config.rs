// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Structs used to configure the ingestion pipeline and the `capingest` command line application in general.
//!
//! Typically instantiated using `serde_yaml`. Durations are strings such as `500ms`, `30s` or `5m`.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::constants::{
    DEFAULT_FOUR_CHUNKS_BELOW, DEFAULT_MAX_CHUNKS, DEFAULT_SINGLE_CHUNK_BELOW,
    DEFAULT_TWO_CHUNKS_BELOW,
};

const DEFAULT_CONFIG_STR: &str = include_str!("../etc/example-config.yml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log: LogConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory for temporary chunk files. Defaults to the system temp directory.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Per-chunk decoder deadline.
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout: String,

    #[serde(default = "default_split_timeout")]
    pub split_timeout: String,

    /// A chunk whose malformed line ratio exceeds this fails the run.
    #[serde(default = "default_max_malformed_ratio")]
    pub max_malformed_ratio: f64,

    /// How far a merged timestamp may fall behind its predecessor before the merge aborts.
    #[serde(default = "default_max_timestamp_regression")]
    pub max_timestamp_regression: String,

    /// Bypasses the size tiers when set.
    #[serde(default)]
    pub force_chunks: Option<usize>,

    #[serde(default)]
    pub planner: PlannerConfig,

    pub tools: ToolsConfig,
}

fn default_chunk_timeout() -> String {
    "10m".to_string()
}

fn default_split_timeout() -> String {
    "10m".to_string()
}

fn default_max_malformed_ratio() -> f64 {
    0.5
}

fn default_max_timestamp_regression() -> String {
    "0ms".to_string()
}

/// Size bands (in bytes) used by the chunk planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub single_chunk_below: u64,
    pub two_chunks_below: u64,
    pub four_chunks_below: u64,
    pub max_chunks: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            single_chunk_below: DEFAULT_SINGLE_CHUNK_BELOW,
            two_chunks_below: DEFAULT_TWO_CHUNKS_BELOW,
            four_chunks_below: DEFAULT_FOUR_CHUNKS_BELOW,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub counter: ToolTemplate,
    pub splitter: ToolTemplate,
    pub decoder: ToolTemplate,
}

/// An external tool invocation. Arguments that are exactly a placeholder
/// (`{input}`, `{output}`, `{records}`, `{fields}`) are substituted; nothing is
/// ever passed through a shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// The configuration shipped in `etc/example-config.yml`.
    pub fn embedded_default() -> Result<Self, ConfigError> {
        Self::from_yaml_str(DEFAULT_CONFIG_STR)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml_str(&contents),
            Err(e) => {
                warn!("could not open config ({e}), using default config");
                Self::from_yaml_str(DEFAULT_CONFIG_STR)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let ingest = &self.ingest;

        if let Err(e) = parse_duration(&ingest.chunk_timeout) {
            return Err(ConfigError::Invalid(format!("Invalid chunk timeout: {e}")));
        }
        if let Err(e) = parse_duration(&ingest.split_timeout) {
            return Err(ConfigError::Invalid(format!("Invalid split timeout: {e}")));
        }
        if let Err(e) = parse_duration(&ingest.max_timestamp_regression) {
            return Err(ConfigError::Invalid(format!(
                "Invalid timestamp regression tolerance: {e}"
            )));
        }

        if !(0.0..=1.0).contains(&ingest.max_malformed_ratio) {
            return Err(ConfigError::Invalid(format!(
                "max_malformed_ratio must be within [0, 1], got {}",
                ingest.max_malformed_ratio
            )));
        }

        let planner = &ingest.planner;
        if planner.max_chunks == 0 {
            return Err(ConfigError::Invalid("planner.max_chunks must be >= 1".into()));
        }
        if !(planner.single_chunk_below <= planner.two_chunks_below
            && planner.two_chunks_below <= planner.four_chunks_below)
        {
            return Err(ConfigError::Invalid(
                "planner size bands must be non-decreasing".into(),
            ));
        }
        if ingest.force_chunks == Some(0) {
            return Err(ConfigError::Invalid("force_chunks must be >= 1".into()));
        }

        for (name, tool) in [
            ("counter", &ingest.tools.counter),
            ("splitter", &ingest.tools.splitter),
            ("decoder", &ingest.tools.decoder),
        ] {
            if tool.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} program is empty")));
            }
        }

        Ok(())
    }

    pub fn get_chunk_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.ingest.chunk_timeout)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse chunk timeout: {e}")))
    }

    pub fn get_split_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.ingest.split_timeout)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse split timeout: {e}")))
    }

    pub fn get_max_timestamp_regression(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.ingest.max_timestamp_regression).map_err(|e| {
            ConfigError::Invalid(format!("Failed to parse timestamp regression: {e}"))
        })
    }
}

pub fn parse_duration(duration_str: &str) -> Result<Duration, ConfigError> {
    let mut s = duration_str.trim().to_string();
    if s.ends_with("ms") {
        s.truncate(s.len() - 2);
        Ok(Duration::from_millis(s.parse::<u64>().map_err(|e| {
            ConfigError::Invalid(format!("Invalid milliseconds value: {e}"))
        })?))
    } else if s.ends_with('s') {
        s.truncate(s.len() - 1);
        Ok(Duration::from_secs(s.parse::<u64>().map_err(|e| {
            ConfigError::Invalid(format!("Invalid seconds value: {e}"))
        })?))
    } else if s.ends_with('m') {
        s.truncate(s.len() - 1);
        let minutes = s
            .parse::<u64>()
            .map_err(|e| ConfigError::Invalid(format!("Invalid minutes value: {e}")))?;
        minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::Invalid(format!("duration too large: {duration_str}")))
    } else if s.ends_with('h') {
        s.truncate(s.len() - 1);
        let hours = s
            .parse::<u64>()
            .map_err(|e| ConfigError::Invalid(format!("Invalid hours value: {e}")))?;
        hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::Invalid(format!("duration too large: {duration_str}")))
    } else {
        Err(ConfigError::Invalid(format!(
            "invalid suffix in duration: {duration_str}"
        )))
    }
}

#[cfg(test)]
mod test {
    use super::{parse_duration, Config};
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let res = Config::from_file("/nonexistent_file_path");

        match res {
            Ok(config) => {
                assert_eq!(config.ingest.tools.decoder.program, "tshark");
                assert_eq!(config.get_max_timestamp_regression().unwrap(), Duration::ZERO);
            }
            Err(e) => {
                eprintln!("{e}");
                panic!("could not parse default config")
            }
        };
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("xs").is_err());
        assert!(parse_duration(&format!("{}m", u64::MAX / 60 + 1)).is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX)).is_err());
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let yaml = r#"
log:
  level: info
ingest:
  max_malformed_ratio: 1.5
  tools:
    counter: { program: capinfos }
    splitter: { program: editcap }
    decoder: { program: tshark }
"#;
        assert!(Config::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let yaml = r#"
log:
  level: debug
ingest:
  tools:
    counter: { program: capinfos, args: ["-c", "{input}"] }
    splitter: { program: editcap }
    decoder: { program: tshark }
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.get_chunk_timeout().unwrap(), Duration::from_secs(600));
        assert_eq!(config.ingest.planner.max_chunks, 16);
        assert_eq!(config.ingest.max_malformed_ratio, 0.5);
        assert!(config.ingest.force_chunks.is_none());
    }
}
