//! Pipeline Configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Path to the SQLite database holding the raw/staging/prod tables.
    pub db_path: PathBuf,

    /// Root of the partitioned raw input files
    /// (`<raw_dir>/<entity>/<YYYY-MM-DD>/data.jsonl`).
    pub raw_dir: PathBuf,

    /// Quality thresholds.
    #[serde(default)]
    pub quality: QualityThresholds,
}

/// Thresholds consumed by the quality validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Maximum acceptable raw -> staging data loss, as a fraction.
    pub max_data_loss: f64,
    /// Tolerance when reconciling revenue totals across layers.
    pub revenue_tolerance: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_data_loss: 0.20,
            revenue_tolerance: 0.01,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("medallion.db"),
            raw_dir: PathBuf::from("raw_data"),
            quality: QualityThresholds::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parse config file {}", path.display()))
    }
}
