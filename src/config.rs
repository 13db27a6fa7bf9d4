//! Artifact locations, imputation defaults, and training hyperparameters.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_GAP_DAYS: i64 = 14;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub training_corpus_path: PathBuf,
    pub cluster_mapping_path: PathBuf,
    pub models_dir: PathBuf,
    pub model_metadata_path: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            training_corpus_path: PathBuf::from("data/train.csv"),
            cluster_mapping_path: PathBuf::from("data/cluster_mapping.csv"),
            models_dir: PathBuf::from("models"),
            model_metadata_path: PathBuf::from("models/metadata.json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImputationDefaults {
    pub lag: f64,
    pub rolling_mean: f64,
    pub rolling_std: f64,
}

impl Default for ImputationDefaults {
    fn default() -> Self {
        Self {
            lag: 15_981.26,
            rolling_mean: 15_981.26,
            rolling_std: 22_711.18,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuityConfig {
    pub max_gap_days: i64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            max_gap_days: DEFAULT_MAX_GAP_DAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackTrainingConfig {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub subsample: f64,
    pub seed: u64,
}

impl Default for FallbackTrainingConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 4,
            min_samples_leaf: 5,
            subsample: 0.8,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub artifacts: ArtifactConfig,
    pub imputation: ImputationDefaults,
    pub continuity: ContinuityConfig,
    pub fallback_training: FallbackTrainingConfig,
}

pub fn artifact_config_from_env() -> ArtifactConfig {
    let mut config = ArtifactConfig::default();

    if let Some(path) = env_path("SALES_TRAINING_CORPUS") {
        config.training_corpus_path = path;
    }
    if let Some(path) = env_path("SALES_CLUSTER_MAPPING") {
        config.cluster_mapping_path = path;
    }
    if let Some(path) = env_path("SALES_MODELS_DIR") {
        config.models_dir = path;
    }
    if let Some(path) = env_path("SALES_MODEL_METADATA") {
        config.model_metadata_path = path;
    }

    config
}

pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig {
        artifacts: artifact_config_from_env(),
        ..PipelineConfig::default()
    };

    if let Some(value) = env_f64("SALES_DEFAULT_LAG") {
        config.imputation.lag = value;
    }
    if let Some(value) = env_f64("SALES_DEFAULT_MEAN") {
        config.imputation.rolling_mean = value;
    }
    if let Some(value) = env_f64("SALES_DEFAULT_STD") {
        config.imputation.rolling_std = value;
    }
    if let Some(days) = env::var("SALES_MAX_GAP_DAYS")
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|days| *days > 0)
    {
        config.continuity.max_gap_days = days;
    }

    config
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}
