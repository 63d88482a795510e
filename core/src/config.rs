use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Tree model configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub autogroup: AutogroupConfig,

    #[serde(default)]
    pub missing_instrumentation: MissingInstrumentationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Environment variable naming a TOML file read by [`Config::load`].
pub const CONFIG_ENV: &str = "WATERFALL_CONFIG";

impl Config {
    /// Reads and validates a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        contents
            .parse()
            .with_context(|| format!("loading {}", path.display()))
    }

    /// Like [`Config::from_file`], but an unreadable or invalid file only
    /// costs a warning.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.as_ref().display(), "{:#}, using default tree config", e);
            Self::default()
        })
    }

    /// Settings from the file named by `WATERFALL_CONFIG`, or the defaults
    /// when it is unset.
    pub fn load() -> Self {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file_or_default(path),
            None => Self::default(),
        }
    }

    /// The defaults rendered as TOML, as a starting point for a config file.
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default()).context("rendering default config")
    }

    /// Rejects settings the autogrouping passes cannot honour.
    pub fn validate(&self) -> Result<()> {
        let autogroup = &self.autogroup;
        ensure!(
            autogroup.sibling_min_run >= 2,
            "autogroup.sibling_min_run must be at least 2, got {}",
            autogroup.sibling_min_run
        );
        ensure!(
            autogroup.parent_min_chain >= 2,
            "autogroup.parent_min_chain must be at least 2, got {}",
            autogroup.parent_min_chain
        );

        let threshold = self.missing_instrumentation.threshold_ms;
        ensure!(
            threshold.is_finite() && threshold >= 0.0,
            "missing_instrumentation.threshold_ms must be a non-negative number, got {}",
            threshold
        );

        let level = self.logging.level.to_ascii_lowercase();
        ensure!(
            matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error"),
            "logging.level {:?} is not a log level",
            self.logging.level
        );
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    /// Parses TOML and validates the result.
    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("parsing tree config")?;
        config.validate()?;
        Ok(config)
    }
}

/// Which autogrouping passes run and how long a run must be.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AutogroupConfig {
    #[serde(default = "default_true")]
    pub parent: bool,

    #[serde(default = "default_true")]
    pub sibling: bool,

    #[serde(default = "default_sibling_min_run")]
    pub sibling_min_run: usize,

    #[serde(default = "default_parent_min_chain")]
    pub parent_min_chain: usize,
}

impl Default for AutogroupConfig {
    fn default() -> Self {
        Self {
            parent: true,
            sibling: true,
            sibling_min_run: default_sibling_min_run(),
            parent_min_chain: default_parent_min_chain(),
        }
    }
}

/// Gap detection between consecutive sibling spans.
///
/// A gap strictly larger than `threshold_ms` gets a marker node. With a
/// threshold of 0 every positive gap qualifies.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MissingInstrumentationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_threshold_ms")]
    pub threshold_ms: f64,
}

impl Default for MissingInstrumentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: default_threshold_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default providers ---------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_sibling_min_run() -> usize {
    5
}

fn default_parent_min_chain() -> usize {
    2
}

fn default_threshold_ms() -> f64 {
    100.0
}

fn default_log_level() -> String {
    "info".to_string()
}

// Tests ---------------------------------------------------------------------
