//! Throttle configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::ThrottleError;

/// Top-level configuration: one shared counter plus throttle defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global concurrency budget
    pub counter: CounterConfig,

    /// Per-throttle admission settings
    pub throttle: ThrottleConfig,
}

impl Config {
    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ThrottleError> {
        self.counter.validate()?;
        self.throttle.validate()
    }

    /// Load from `config_path`, else the first readable candidate file
    ///
    /// An explicit path must load. Candidates (`./.rangethrottle.yml`, then
    /// `<config_dir>/rangethrottle/rangethrottle.yml`) that fail to parse are
    /// skipped with a warning, and defaults apply when none is usable.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        debug!(?config_path, "Config::load: called");
        if let Some(path) = config_path {
            return Self::load_from_file(path).with_context(|| format!("Unusable throttle config {}", path.display()));
        }

        for candidate in Self::candidates() {
            if !candidate.is_file() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(path = %candidate.display(), "Config::load: skipping candidate: {e:#}"),
            }
        }

        debug!("Config::load: no candidate found, using defaults");
        Ok(Self::default())
    }

    fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".rangethrottle.yml")];
        paths.extend(dirs::config_dir().map(|dir| dir.join("rangethrottle").join("rangethrottle.yml")));
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).context("Cannot read throttle config")?;
        let config: Self = serde_yaml::from_str(&content).context("Malformed throttle config")?;
        config.validate().context("Throttle config rejected")?;

        info!(path = %path.display(), ?config, "Config::load_from_file: loaded");
        Ok(config)
    }
}

/// Global concurrency budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Max requests in flight across every throttle sharing the counter
    #[serde(rename = "max-req-count")]
    pub max_req_count: usize,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self { max_req_count: 4 }
    }
}

impl CounterConfig {
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.max_req_count == 0 {
            return Err(ThrottleError::InvalidConfig(
                "max-req-count must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-throttle admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Max points in one admitted (merged) range
    pub limit: usize,

    /// Favor the low end when merging and truncating
    #[serde(rename = "min-first")]
    pub min_first: bool,

    /// Eviction window per tag; defaults to the counter's max-req-count
    #[serde(rename = "lru-capacity")]
    pub lru_capacity: Option<usize>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            min_first: true,
            lru_capacity: None,
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.limit == 0 {
            return Err(ThrottleError::InvalidConfig("limit must be a positive integer".to_string()));
        }
        if self.lru_capacity == Some(0) {
            return Err(ThrottleError::InvalidConfig(
                "lru-capacity must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    /// Eviction window for a throttle attached to a counter of `max_req_count`
    pub fn lru_capacity_for(&self, max_req_count: usize) -> NonZeroUsize {
        self.lru_capacity
            .and_then(NonZeroUsize::new)
            .or_else(|| NonZeroUsize::new(max_req_count))
            .unwrap_or(NonZeroUsize::MIN)
    }
}
