//! Configuration for the reassembly benchmark.

use reasm::{HugepageSize, MAX_MESSAGE_SIZE};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Bytes at the front of every generated message: serial (u64) and length (u16).
pub const MESSAGE_HEADER_LEN: usize = 10;

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub pool: PoolConfig,
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// General benchmark settings.
#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// How long to run.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// Number of ring consumer threads.
    #[serde(default = "default_consumers")]
    pub consumers: usize,
    /// Optional list of CPU cores to pin threads to (e.g., "0-3,6-8"). The
    /// writer takes the first entry.
    pub cpu_list: Option<String>,
    /// Workload RNG seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Pool shape.
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Ring depth (power of two).
    pub depth: u64,
    /// Spare slots for in-progress messages (at least 2).
    pub burst: u64,
    /// Origin id stamped on published entries.
    #[serde(default)]
    pub origin: u64,
    /// Hugepage preference for the pool region.
    #[serde(default)]
    pub hugepages: Hugepages,
}

/// Hugepage setting.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Hugepages {
    #[default]
    None,
    #[serde(rename = "2mb")]
    TwoMegabyte,
    #[serde(rename = "1gb")]
    OneGigabyte,
}

impl From<Hugepages> for HugepageSize {
    fn from(value: Hugepages) -> Self {
        match value {
            Hugepages::None => HugepageSize::None,
            Hugepages::TwoMegabyte => HugepageSize::TwoMegabyte,
            Hugepages::OneGigabyte => HugepageSize::OneGigabyte,
        }
    }
}

/// Synthetic fragment workload.
#[derive(Debug, Deserialize)]
pub struct WorkloadConfig {
    /// Concurrent streams with a message in flight.
    pub streams: usize,
    /// Message size range.
    pub message: MessageConfig,
    /// Fragment payload size in bytes.
    pub fragment_size: usize,
    /// Percentage of fragments resent after being delivered once.
    #[serde(default)]
    pub duplicate: u8,
    /// Percentage of fragments dropped, aborting their message.
    #[serde(default)]
    pub loss: u8,
    /// Percentage of fragment sends replaced by abandoning the message
    /// without a cancel, leaving its slot to be reclaimed.
    #[serde(default)]
    pub abandon: u8,
}

/// Message size range. Sizes above the reassembly limit exercise the
/// too-large abort.
#[derive(Debug, Deserialize)]
pub struct MessageConfig {
    pub min: usize,
    pub max: usize,
}

/// Log output format.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter, overridden by RUST_LOG.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default)]
    pub target: bool,
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

fn default_consumers() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let workload = &self.workload;
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if workload.streams == 0 {
            return invalid("workload.streams must be at least 1".into());
        }
        if workload.fragment_size == 0 {
            return invalid("workload.fragment_size must be at least 1".into());
        }
        if workload.message.min < MESSAGE_HEADER_LEN || workload.message.min > workload.message.max {
            return invalid(format!(
                "workload.message must satisfy {MESSAGE_HEADER_LEN} <= min <= max (got {}..={})",
                workload.message.min, workload.message.max
            ));
        }
        if workload.message.max > u16::MAX as usize {
            return invalid(format!(
                "workload.message.max {} exceeds {}",
                workload.message.max,
                u16::MAX
            ));
        }
        for (name, pct) in [
            ("duplicate", workload.duplicate),
            ("loss", workload.loss),
            ("abandon", workload.abandon),
        ] {
            if pct > 100 {
                return invalid(format!("workload.{name} must be a percentage (got {pct})"));
            }
        }
        if let Some(cpu_list) = &self.general.cpu_list {
            parse_cpu_list(cpu_list).map_err(|e| ConfigError::Invalid(format!("cpu_list: {e}")))?;
        }
        Ok(())
    }

    /// Whether generated messages can exceed the reassembly limit.
    pub fn oversized_messages(&self) -> bool {
        self.workload.message.max > MAX_MESSAGE_SIZE
    }
}

/// Deserialize a duration from a human-readable string (e.g., "60s", "5m").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a CPU list string like "0-3,6-8" into a Vec of CPU IDs.
pub fn parse_cpu_list(s: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .trim()
                .parse()
                .map_err(|e| format!("invalid CPU id '{}': {}", start, e))?;
            let end: usize = end
                .trim()
                .parse()
                .map_err(|e| format!("invalid CPU id '{}': {}", end, e))?;
            if start > end {
                return Err(format!("invalid range {}-{}", start, end));
            }
            cpus.extend(start..=end);
        } else {
            let cpu: usize = part
                .parse()
                .map_err(|e| format!("invalid CPU id '{}': {}", part, e))?;
            cpus.push(cpu);
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [general]
        duration = "10s"
        consumers = 2
        cpu_list = "0-2"

        [pool]
        depth = 1024
        burst = 64
        origin = 3
        hugepages = "2mb"

        [workload]
        streams = 32
        fragment_size = 300
        duplicate = 5
        loss = 1
        abandon = 1

        [workload.message]
        min = 64
        max = 1232

        [logging]
        level = "debug"
        format = "json"
    "#;

    #[test]
    fn test_parse_example() {
        let config = Config::parse(EXAMPLE).unwrap();
        assert_eq!(config.general.duration, Duration::from_secs(10));
        assert_eq!(config.general.consumers, 2);
        assert_eq!(config.general.seed, 42);
        assert_eq!(config.pool.hugepages, Hugepages::TwoMegabyte);
        assert_eq!(HugepageSize::from(config.pool.hugepages), HugepageSize::TwoMegabyte);
        assert_eq!(config.workload.message.max, 1232);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.timestamps);
        assert!(!config.oversized_messages());
    }

    #[test]
    fn test_rejects_bad_workload() {
        let bad = EXAMPLE.replace("loss = 1", "loss = 101");
        assert!(matches!(Config::parse(&bad), Err(ConfigError::Invalid(_))));

        let bad = EXAMPLE.replace("min = 64", "min = 4");
        assert!(matches!(Config::parse(&bad), Err(ConfigError::Invalid(_))));

        let bad = EXAMPLE.replace("streams = 32", "streams = 0");
        assert!(matches!(Config::parse(&bad), Err(ConfigError::Invalid(_))));

        let bad = EXAMPLE.replace("duration = \"10s\"", "duration = \"soon\"");
        assert!(matches!(Config::parse(&bad), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,6-8").unwrap(), vec![0, 1, 2, 3, 6, 7, 8]);
        assert_eq!(parse_cpu_list("5").unwrap(), vec![5]);
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("x").is_err());
    }
}
