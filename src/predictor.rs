//! Cluster routing and scoring.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clusters::ClusterAssignment;
use crate::config::{FallbackTrainingConfig, ImputationDefaults};
use crate::features::{build_features, FeatureMode, FeatureRow, FeatureVector};
use crate::history::TrainingCorpus;
use crate::model::{train_gradient_boosted, GradientBoostedRegressor, ModelError, SalesRegressor};

pub const MODEL_FILE_PREFIX: &str = "gbt_cluster_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub store: u32,
    pub date: NaiveDate,
    pub predicted_sales: f64,
    pub cluster: u32,
}

#[derive(Debug, Clone, Error)]
#[error("no per-cluster models available in {}", .models_dir.display())]
pub struct ResourceUnavailable {
    pub models_dir: PathBuf,
    pub missing: Vec<u32>,
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("cannot obtain fallback training data: {0}")]
    TrainingDataUnavailable(String),
    #[error("fallback model training failed: {0}")]
    Training(#[from] ModelError),
}

#[derive(Clone, Default)]
pub struct ClusterModels {
    by_cluster: BTreeMap<u32, Arc<dyn SalesRegressor>>,
}

impl ClusterModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cluster: u32, model: impl SalesRegressor + 'static) {
        self.by_cluster.insert(cluster, Arc::new(model));
    }

    pub fn get(&self, cluster: u32) -> Option<&dyn SalesRegressor> {
        self.by_cluster.get(&cluster).map(|model| model.as_ref())
    }

    pub fn cluster_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_cluster.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_cluster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cluster.is_empty()
    }
}

impl fmt::Debug for ClusterModels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.by_cluster.iter().map(|(id, model)| (id, model.name())))
            .finish()
    }
}

pub fn model_path(models_dir: &Path, cluster: u32) -> PathBuf {
    models_dir.join(format!("{MODEL_FILE_PREFIX}{cluster}.json"))
}

/// Loads `gbt_cluster_{id}.json` for every requested cluster. Missing and
/// unreadable files are skipped; the call only fails when nothing loaded.
pub fn load_cluster_models(
    models_dir: &Path,
    cluster_ids: &BTreeSet<u32>,
) -> Result<ClusterModels, ResourceUnavailable> {
    let mut models = ClusterModels::new();
    let mut missing = Vec::new();

    for &cluster in cluster_ids {
        let path = model_path(models_dir, cluster);
        if !path.exists() {
            debug!(
                component = "predictor",
                event = "predictor.model.absent",
                cluster,
                path = %path.display()
            );
            missing.push(cluster);
            continue;
        }
        match GradientBoostedRegressor::from_json_file(&path) {
            Ok(model) => models.insert(cluster, model),
            Err(err) => {
                warn!(
                    component = "predictor",
                    event = "predictor.model.unreadable",
                    cluster,
                    path = %path.display(),
                    error = %err
                );
                missing.push(cluster);
            }
        }
    }

    if models.is_empty() {
        warn!(
            component = "predictor",
            event = "predictor.models.unavailable",
            models_dir = %models_dir.display(),
            requested = cluster_ids.len()
        );
        return Err(ResourceUnavailable {
            models_dir: models_dir.to_path_buf(),
            missing,
        });
    }

    info!(
        component = "predictor",
        event = "predictor.models.loaded",
        loaded = models.len(),
        missing = ?missing
    );
    Ok(models)
}

pub fn train_global_model(
    corpus: &TrainingCorpus,
    defaults: &ImputationDefaults,
    config: &FallbackTrainingConfig,
) -> Result<GradientBoostedRegressor, PredictError> {
    let (rows, _) = build_features(corpus.observations(), FeatureMode::Backtest, None, defaults)
        .map_err(|err| PredictError::TrainingDataUnavailable(err.to_string()))?;

    let mut features: Vec<FeatureVector> = Vec::with_capacity(rows.len());
    let mut targets = Vec::with_capacity(rows.len());
    for row in &rows {
        if let Some(target) = row.weekly_sales {
            features.push(row.to_vector());
            targets.push(target);
        }
    }

    Ok(train_gradient_boosted(&features, &targets, config)?)
}

pub fn predict_sales<F>(
    mut rows: Vec<FeatureRow>,
    mapping: &ClusterAssignment,
    models: Result<&ClusterModels, &ResourceUnavailable>,
    fallback: F,
) -> Result<Vec<PredictionRow>, PredictError>
where
    F: FnOnce() -> Result<Arc<dyn SalesRegressor>, PredictError>,
{
    let unmapped_rows = mapping.assign(&mut rows);

    let predictions = match models {
        Ok(models) => route_by_cluster(&rows, models),
        Err(unavailable) => {
            warn!(
                component = "predictor",
                event = "predictor.fallback.global_model",
                reason = %unavailable,
                rows = rows.len()
            );
            let model = fallback()?;
            rows.iter()
                .map(|row| prediction(row, model.as_ref()))
                .collect()
        }
    };

    info!(
        component = "predictor",
        event = "predictor.finish",
        input_rows = rows.len(),
        unmapped_rows,
        predictions = predictions.len()
    );
    Ok(predictions)
}

fn route_by_cluster(rows: &[FeatureRow], models: &ClusterModels) -> Vec<PredictionRow> {
    let mut by_cluster: BTreeMap<u32, Vec<&FeatureRow>> = BTreeMap::new();
    for row in rows {
        by_cluster
            .entry(row.cluster.unwrap_or_default())
            .or_default()
            .push(row);
    }

    let mut out = Vec::with_capacity(rows.len());
    for (cluster, block) in by_cluster {
        let Some(model) = models.get(cluster) else {
            warn!(
                component = "predictor",
                event = "predictor.cluster.skipped",
                cluster,
                rows = block.len(),
                reason = "no_model"
            );
            continue;
        };
        out.extend(block.into_iter().map(|row| prediction(row, model)));
        debug!(
            component = "predictor",
            event = "predictor.cluster.scored",
            cluster,
            model = model.name()
        );
    }
    out
}

fn prediction(row: &FeatureRow, model: &dyn SalesRegressor) -> PredictionRow {
    PredictionRow {
        store: row.store,
        date: row.date,
        predicted_sales: model.predict(&row.to_vector()),
        cluster: row.cluster.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::RawObservation;

    struct Constant(f64);

    impl SalesRegressor for Constant {
        fn predict(&self, _: &FeatureVector) -> f64 {
            self.0
        }

        fn name(&self) -> &str {
            "constant"
        }
    }

    fn feature_rows(stores: &[u32]) -> Vec<FeatureRow> {
        let start = NaiveDate::from_ymd_opt(2012, 1, 6).unwrap();
        let observations: Vec<RawObservation> = stores
            .iter()
            .flat_map(|&store| {
                (0..3).map(move |w| RawObservation {
                    store,
                    date: start + chrono::Duration::weeks(w),
                    holiday_flag: 0,
                    temperature: 40.0,
                    fuel_price: 3.5,
                    cpi: 220.0,
                    unemployment: 6.5,
                    weekly_sales: None,
                })
            })
            .collect();
        build_features(
            &observations,
            FeatureMode::Operational,
            None,
            &ImputationDefaults::default(),
        )
        .unwrap()
        .0
    }

    fn mapping(pairs: &[(u32, u32)]) -> ClusterAssignment {
        ClusterAssignment::new(pairs.iter().copied().collect())
    }

    fn no_fallback() -> Result<Arc<dyn SalesRegressor>, PredictError> {
        panic!("fallback must not be used when cluster models exist")
    }

    #[test]
    fn routes_clusters_in_ascending_order() {
        let mut models = ClusterModels::new();
        models.insert(0, Constant(10.0));
        models.insert(1, Constant(20.0));

        let rows = feature_rows(&[1, 2, 3]);
        let out = predict_sales(
            rows,
            &mapping(&[(1, 1), (2, 0), (3, 1)]),
            Ok(&models),
            no_fallback,
        )
        .unwrap();

        assert_eq!(out.len(), 9);
        let clusters: Vec<u32> = out.iter().map(|p| p.cluster).collect();
        assert_eq!(clusters, vec![0, 0, 0, 1, 1, 1, 1, 1, 1]);
        assert!(out[..3].iter().all(|p| p.store == 2 && p.predicted_sales == 10.0));
        assert_eq!(out[3].store, 1);
        assert_eq!(out[8].store, 3);
    }

    #[test]
    fn rows_of_clusters_without_a_model_are_dropped() {
        let mut models = ClusterModels::new();
        models.insert(0, Constant(1.0));

        let out = predict_sales(
            feature_rows(&[1, 2, 9]),
            &mapping(&[(1, 0), (2, 3)]),
            Ok(&models),
            no_fallback,
        )
        .unwrap();

        // store 2 -> cluster 3 has no model; store 9 is unmapped -> cluster 0
        assert_eq!(out.len(), 6);
        assert!(out.iter().all(|p| p.cluster == 0));
        assert!(out.iter().any(|p| p.store == 9));
    }

    #[test]
    fn unavailable_models_use_the_fallback_for_every_row() {
        let unavailable = ResourceUnavailable {
            models_dir: PathBuf::from("models"),
            missing: vec![0, 1],
        };
        let out = predict_sales(
            feature_rows(&[4, 5]),
            &mapping(&[(4, 0), (5, 1)]),
            Err(&unavailable),
            || Ok(Arc::new(Constant(7.5)) as Arc<dyn SalesRegressor>),
        )
        .unwrap();
        assert_eq!(out.len(), 6);
        assert!(out.iter().all(|p| p.predicted_sales == 7.5));
        assert_eq!(out[0].cluster, 0);
        assert_eq!(out[5].cluster, 1);

        let err = predict_sales(
            feature_rows(&[4]),
            &mapping(&[(4, 0)]),
            Err(&unavailable),
            || Err(PredictError::TrainingDataUnavailable("missing".into())),
        )
        .unwrap_err();
        assert!(matches!(err, PredictError::TrainingDataUnavailable(_)));
    }

    #[test]
    fn loader_skips_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let ids: BTreeSet<u32> = [0, 1, 2].into_iter().collect();

        let err = load_cluster_models(dir.path(), &ids).unwrap_err();
        assert_eq!(err.missing, vec![0, 1, 2]);

        std::fs::write(model_path(dir.path(), 1), "{not json").unwrap();
        let features: Vec<FeatureVector> = (0..10).map(|i| [i as f64; 22]).collect();
        let targets: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let config = FallbackTrainingConfig {
            n_estimators: 3,
            min_samples_leaf: 2,
            ..FallbackTrainingConfig::default()
        };
        train_gradient_boosted(&features, &targets, &config)
            .unwrap()
            .save_json(&model_path(dir.path(), 2))
            .unwrap();

        let models = load_cluster_models(dir.path(), &ids).unwrap();
        assert_eq!(models.cluster_ids().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn global_model_needs_enough_history() {
        let start = NaiveDate::from_ymd_opt(2010, 2, 5).unwrap();
        let short: Vec<RawObservation> = (0..10)
            .map(|w| RawObservation {
                store: 1,
                date: start + chrono::Duration::weeks(w),
                holiday_flag: 0,
                temperature: 40.0,
                fuel_price: 3.0,
                cpi: 210.0,
                unemployment: 8.0,
                weekly_sales: Some(1000.0 + w as f64),
            })
            .collect();
        let corpus = TrainingCorpus::from_observations(short);

        let err = train_global_model(
            &corpus,
            &ImputationDefaults::default(),
            &FallbackTrainingConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PredictError::TrainingDataUnavailable(_)));
    }
}
