//! Configuration for record and replay runs
//!
//! Supports YAML and TOML configuration files with a validation pass.
//! CLI flags override file values; see `main.rs`.

use crate::error::{Result, RetraceError};
use crate::models::NoiseMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Noise applied to every test set plus per-set overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalNoise {
    #[serde(default)]
    pub global: NoiseMap,
    #[serde(default)]
    pub test_sets: BTreeMap<String, NoiseMap>,
}

/// Top-level configuration consumed by the recorder and the replayer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command that launches the application under test
    pub command: String,
    /// Root directory holding the test sets
    pub path: PathBuf,
    /// Directory reports are written under; defaults to `<path>/reports`
    pub test_report_path: PathBuf,
    /// Port the transparent proxy listens on
    pub proxy_port: u16,
    /// Seconds to wait after launching the application before driving requests
    pub delay: u64,
    /// Per-request timeout in seconds for simulated requests
    pub api_timeout: u64,
    /// Seconds of silence after which an incomplete capture buffer is swept
    pub buffer_inactivity_timeout: u64,
    /// Interval in milliseconds between capture sweeps
    pub sweep_interval_ms: u64,
    /// Outgoing ports piped blind instead of being recorded/mocked
    pub pass_through_ports: Vec<u16>,
    /// Compare arrays as multisets instead of positionally
    pub ignore_ordering: bool,
    /// Forward `GOCOVERDIR` to the application for coverage collection
    pub coverage: bool,
    /// Address the application is reachable at when containerised;
    /// container-IP discovery itself is an external concern
    pub container_ip: Option<String>,
    /// Response paths excluded from comparison
    pub global_noise: GlobalNoise,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: String::new(),
            path: PathBuf::from("./retrace"),
            test_report_path: PathBuf::from("./retrace/reports"),
            proxy_port: 16789,
            delay: 5,
            api_timeout: 5,
            buffer_inactivity_timeout: 5,
            sweep_interval_ms: 500,
            pass_through_ports: Vec::new(),
            ignore_ordering: false,
            coverage: false,
            container_ip: None,
            global_noise: GlobalNoise::default(),
        }
    }
}

/// Load configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| RetraceError::Config(format!("Failed to read config file {:?}: {}", path, e)))?;

    let config = parse_config(&content, path)?;
    validate_config(&config)?;

    info!("Configuration loaded from {:?}", path);
    Ok(config)
}

/// Parse configuration from string content
fn parse_config(content: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

    match extension {
        "yaml" | "yml" => serde_yaml::from_str(content)
            .map_err(|e| RetraceError::ConfigParse(e.to_string())),
        "toml" => toml::from_str(content).map_err(|e| e.into()),
        _ => Err(RetraceError::Config(format!(
            "Unsupported config format: {}",
            extension
        ))),
    }
}

/// Validate a configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.api_timeout == 0 {
        return Err(RetraceError::Config(
            "api_timeout must be at least 1 second".to_string(),
        ));
    }
    if config.sweep_interval_ms == 0 {
        return Err(RetraceError::Config(
            "sweep_interval_ms must be non-zero".to_string(),
        ));
    }

    // Noise regexes must compile up front, not at first comparison.
    let all_noise = std::iter::once(&config.global_noise.global)
        .chain(config.global_noise.test_sets.values());
    for noise in all_noise {
        for (path, patterns) in noise {
            for pattern in patterns {
                regex::Regex::new(pattern).map_err(|e| {
                    RetraceError::Config(format!(
                        "Invalid noise regex for path {:?}: {}",
                        path, e
                    ))
                })?;
            }
        }
    }

    Ok(())
}
