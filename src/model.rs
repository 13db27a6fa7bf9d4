//! Regression models scored by the cluster router.
//!
//! Models are additive ensembles of regression trees stored as JSON:
//!
//! ```json
//! {
//!   "model_type": "gradient_boosted_regressor",
//!   "model_name": "cluster_0",
//!   "feature_names": ["store", "temperature", "..."],
//!   "schema_fingerprint": "9f2c...",
//!   "learning_rate": 0.1,
//!   "init_value": 15981.26,
//!   "trees": [
//!     { "nodes": [
//!       {"feature": 10, "threshold": 20500.0, "left": 1, "right": 2, "value": null},
//!       {"feature": -1, "threshold": 0.0, "left": -1, "right": -1, "value": -830.5},
//!       {"feature": -1, "threshold": 0.0, "left": -1, "right": -1, "value": 1210.0}
//!     ]}
//!   ]
//! }
//! ```
//!
//! A prediction is `init_value + learning_rate * sum(leaf values)`.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::FallbackTrainingConfig;
use crate::features::{
    assert_schema_compatible, feature_schema, FeatureError, FeatureVector, FEATURE_COLUMNS,
    FEATURE_COUNT, FEATURE_SCHEMA_VERSION,
};
use crate::history::mean;
use crate::observability::log_artifact_source;

pub const MODEL_TYPE: &str = "gradient_boosted_regressor";

pub trait SalesRegressor: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> f64;

    fn name(&self) -> &str;
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected model_type 'gradient_boosted_regressor', got '{0}'")]
    UnexpectedModelType(String),
    #[error("feature names do not match the feature column list")]
    FeatureMismatch,
    #[error(transparent)]
    Schema(#[from] FeatureError),
    #[error("invalid learning_rate {0} (expected 0 < lr <= 1)")]
    InvalidLearningRate(f64),
    #[error("tree {tree}: {reason}")]
    InvalidTree { tree: usize, reason: String },
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("{features} feature rows but {targets} targets")]
    LengthMismatch { features: usize, targets: usize },
    #[error("non-finite target at row {0}")]
    NonFiniteTarget(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionNode {
    pub feature: i32,
    pub threshold: f64,
    pub left: i32,
    pub right: i32,
    pub value: Option<f64>,
}

impl RegressionNode {
    fn leaf(value: f64) -> Self {
        Self {
            feature: -1,
            threshold: 0.0,
            left: -1,
            right: -1,
            value: Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<RegressionNode>,
}

impl RegressionTree {
    // NaN or `<= threshold` goes left.
    fn predict(&self, features: &FeatureVector) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &self.nodes[idx];
            if node.feature < 0 {
                return node.value.unwrap_or(0.0);
            }
            let value = features
                .get(node.feature as usize)
                .copied()
                .unwrap_or(f64::NAN);
            idx = if value.is_nan() || value <= node.threshold {
                node.left as usize
            } else {
                node.right as usize
            };
        }
    }

    // Children must point forward, which also rules out cycles.
    fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.feature < 0 {
                match node.value {
                    Some(value) if value.is_finite() => continue,
                    _ => return Err(format!("leaf {idx} has no finite value")),
                }
            }
            if node.feature as usize >= FEATURE_COUNT {
                return Err(format!("node {idx} splits on unknown feature {}", node.feature));
            }
            for child in [node.left, node.right] {
                if child <= idx as i32 || child as usize >= self.nodes.len() {
                    return Err(format!("node {idx} has invalid child {child}"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ModelFile {
    model_type: String,
    model_name: String,
    feature_names: Vec<String>,
    schema_fingerprint: String,
    learning_rate: f64,
    init_value: f64,
    trees: Vec<RegressionTree>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientBoostedRegressor {
    name: String,
    learning_rate: f64,
    init_value: f64,
    trees: Vec<RegressionTree>,
}

impl GradientBoostedRegressor {
    pub fn from_json_str(json: &str) -> Result<Self, ModelError> {
        let file: ModelFile = serde_json::from_str(json)?;

        if file.model_type != MODEL_TYPE {
            return Err(ModelError::UnexpectedModelType(file.model_type));
        }
        if !file.feature_names.iter().map(String::as_str).eq(FEATURE_COLUMNS) {
            return Err(ModelError::FeatureMismatch);
        }
        assert_schema_compatible(
            FEATURE_SCHEMA_VERSION,
            &file.schema_fingerprint,
            &feature_schema(),
        )?;
        if !(file.learning_rate > 0.0 && file.learning_rate <= 1.0) {
            return Err(ModelError::InvalidLearningRate(file.learning_rate));
        }
        for (tree_idx, tree) in file.trees.iter().enumerate() {
            tree.validate()
                .map_err(|reason| ModelError::InvalidTree { tree: tree_idx, reason })?;
        }

        Ok(Self {
            name: file.model_name,
            learning_rate: file.learning_rate,
            init_value: file.init_value,
            trees: file.trees,
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ModelError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn to_json_string(&self) -> Result<String, ModelError> {
        let schema = feature_schema();
        let file = ModelFile {
            model_type: MODEL_TYPE.to_string(),
            model_name: self.name.clone(),
            feature_names: schema.columns,
            schema_fingerprint: schema.fingerprint,
            learning_rate: self.learning_rate,
            init_value: self.init_value,
            trees: self.trees.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

impl SalesRegressor for GradientBoostedRegressor {
    fn predict(&self, features: &FeatureVector) -> f64 {
        let boost: f64 = self.trees.iter().map(|tree| tree.predict(features)).sum();
        self.init_value + self.learning_rate * boost
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn train_gradient_boosted(
    features: &[FeatureVector],
    targets: &[f64],
    config: &FallbackTrainingConfig,
) -> Result<GradientBoostedRegressor, ModelError> {
    if features.len() != targets.len() {
        return Err(ModelError::LengthMismatch {
            features: features.len(),
            targets: targets.len(),
        });
    }
    if features.is_empty() {
        return Err(ModelError::EmptyTrainingSet);
    }
    if let Some(row) = targets.iter().position(|t| !t.is_finite()) {
        return Err(ModelError::NonFiniteTarget(row));
    }
    if !(config.learning_rate > 0.0 && config.learning_rate <= 1.0) {
        return Err(ModelError::InvalidLearningRate(config.learning_rate));
    }

    info!(
        component = "model",
        event = "model.train.start",
        rows = features.len(),
        n_estimators = config.n_estimators,
        max_depth = config.max_depth,
        seed = config.seed
    );

    let init_value = mean(targets);
    let mut predictions = vec![init_value; targets.len()];
    let mut rng = StdRng::seed_from_u64(config.seed);
    let sample_size = ((targets.len() as f64 * config.subsample.clamp(0.0, 1.0)).ceil() as usize)
        .clamp(1, targets.len());
    let mut order: Vec<usize> = (0..targets.len()).collect();
    let mut trees = Vec::with_capacity(config.n_estimators);

    for _ in 0..config.n_estimators {
        order.shuffle(&mut rng);
        let mut sample = order[..sample_size].to_vec();
        let residuals: Vec<f64> = targets
            .iter()
            .zip(&predictions)
            .map(|(target, prediction)| target - prediction)
            .collect();

        let mut builder = TreeBuilder {
            features,
            residuals: &residuals,
            max_depth: config.max_depth,
            min_samples_leaf: config.min_samples_leaf.max(1),
            nodes: Vec::new(),
        };
        builder.grow(&mut sample, 0);
        let tree = RegressionTree {
            nodes: builder.nodes,
        };

        for (prediction, row) in predictions.iter_mut().zip(features) {
            *prediction += config.learning_rate * tree.predict(row);
        }
        trees.push(tree);
    }

    let model = GradientBoostedRegressor {
        name: "global".to_string(),
        learning_rate: config.learning_rate,
        init_value,
        trees,
    };
    debug!(
        component = "model",
        event = "model.train.finish",
        trees = model.n_trees(),
        init_value
    );
    Ok(model)
}

struct TreeBuilder<'a> {
    features: &'a [FeatureVector],
    residuals: &'a [f64],
    max_depth: usize,
    min_samples_leaf: usize,
    nodes: Vec<RegressionNode>,
}

struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl TreeBuilder<'_> {
    fn grow(&mut self, rows: &mut [usize], depth: usize) -> usize {
        let idx = self.nodes.len();
        let values: Vec<f64> = rows.iter().map(|&row| self.residuals[row]).collect();
        let leaf_value = mean(&values);

        let split = if depth < self.max_depth && rows.len() >= 2 * self.min_samples_leaf {
            self.best_split(rows)
        } else {
            None
        };
        let Some(split) = split else {
            self.nodes.push(RegressionNode::leaf(leaf_value));
            return idx;
        };

        self.nodes.push(RegressionNode {
            feature: split.feature as i32,
            threshold: split.threshold,
            left: -1,
            right: -1,
            value: None,
        });

        let features = self.features;
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&row| features[row][split.feature] <= split.threshold);
        let mut left_rows = left_rows;
        let mut right_rows = right_rows;

        let left = self.grow(&mut left_rows, depth + 1);
        let right = self.grow(&mut right_rows, depth + 1);
        self.nodes[idx].left = left as i32;
        self.nodes[idx].right = right as i32;
        idx
    }

    fn best_split(&self, rows: &mut [usize]) -> Option<Split> {
        let n = rows.len();
        let total: f64 = rows.iter().map(|&row| self.residuals[row]).sum();
        let parent_score = total * total / n as f64;
        let mut best: Option<Split> = None;

        for feature in 0..FEATURE_COUNT {
            rows.sort_by(|a, b| self.features[*a][feature].total_cmp(&self.features[*b][feature]));

            let mut left_sum = 0.0;
            for i in 0..n - 1 {
                left_sum += self.residuals[rows[i]];
                let left_n = i + 1;
                let right_n = n - left_n;
                if left_n < self.min_samples_leaf || right_n < self.min_samples_leaf {
                    continue;
                }
                let here = self.features[rows[i]][feature];
                let next = self.features[rows[i + 1]][feature];
                if here >= next {
                    continue;
                }

                let right_sum = total - left_sum;
                let score =
                    left_sum * left_sum / left_n as f64 + right_sum * right_sum / right_n as f64;
                let gain = score - parent_score;
                if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(Split {
                        feature,
                        threshold: here + (next - here) / 2.0,
                        gain,
                    });
                }
            }
        }

        best
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub approach: String,
    pub model_type: String,
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
    #[serde(default)]
    pub n_clusters: Option<u32>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub features: Vec<String>,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            approach: "Clustering".to_string(),
            model_type: "Gradient Boosted Trees".to_string(),
            rmse: 63_519.94,
            mae: 42_650.00,
            mape: 4.24,
            n_clusters: Some(4),
            description: "One gradient-boosted tree model per store cluster (k=4)".to_string(),
            features: vec![
                "Lags: 1, 2, 4, 52 weeks".to_string(),
                "Rolling features: means and std".to_string(),
                "Cyclic encoding: week, month".to_string(),
                "Exogenous variables: temperature, fuel price, CPI, unemployment".to_string(),
            ],
        }
    }
}

pub fn load_model_metadata(path: &Path) -> ModelMetadata {
    let parsed = fs::read_to_string(path)
        .map_err(|err| err.to_string())
        .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()));

    match parsed {
        Ok(metadata) => {
            log_artifact_source("model_metadata", Some(path), None);
            metadata
        }
        Err(reason) => {
            log_artifact_source("model_metadata", Some(path), Some(&reason));
            ModelMetadata::default()
        }
    }
}
