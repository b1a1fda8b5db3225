//! Run configuration -- TOML file with CLI overrides layered on top.

use crate::controller::QualityThresholds;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub thresholds: QualityThresholds,
    pub generator: GeneratorConfig,
    /// Bound on concurrent rule queries within one evaluation pass.
    pub workers: usize,
    /// Availability-probe timeout in seconds.
    pub health_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub index: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// External generator command; CTI on stdin, YAML batch on stdout.
    pub command: Option<String>,
    pub args: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: "detquench-eval".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            thresholds: QualityThresholds::default(),
            generator: GeneratorConfig::default(),
            workers: crate::harness::DEFAULT_WORKERS,
            health_timeout_secs: 3,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load from the given path, or fall back to defaults when absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_gates() {
        let config = Config::default();
        assert_eq!(config.thresholds.min_precision, 0.60);
        assert_eq!(config.thresholds.min_recall, 0.70);
        assert_eq!(config.thresholds.max_iterations, 3);
        assert_eq!(config.backend.url, "http://localhost:9200");
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detquench.toml");
        std::fs::write(
            &path,
            "[thresholds]\nmin_precision = 0.8\nmin_recall = 0.7\nmax_iterations = 5\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.thresholds.min_precision, 0.8);
        assert_eq!(config.thresholds.max_iterations, 5);
        assert_eq!(config.backend.index, "detquench-eval");
    }
}
