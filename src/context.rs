//! Process-wide, read-only artifacts shared by forecast requests.
//!
//! Each artifact is loaded on first use and kept until the context is dropped;
//! nothing here is mutated by a request. Tests inject fixtures through
//! [`ForecastContext::builder`] instead of touching disk.

use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::clusters::{load_cluster_mapping, ClusterAssignment, UNMAPPED_CLUSTER};
use crate::config::{pipeline_config_from_env, PipelineConfig};
use crate::history::{load_historical_stats, CorpusError, HistoricalStats, TrainingCorpus};
use crate::model::{load_model_metadata, ModelMetadata, SalesRegressor};
use crate::observability::log_artifact_source;
use crate::predictor::{
    load_cluster_models, train_global_model, ClusterModels, PredictError, ResourceUnavailable,
};

#[derive(Debug)]
pub struct ForecastContext {
    config: PipelineConfig,
    historical_stats: OnceLock<Option<HistoricalStats>>,
    cluster_mapping: OnceLock<ClusterAssignment>,
    cluster_models: OnceLock<Result<ClusterModels, ResourceUnavailable>>,
    model_metadata: OnceLock<ModelMetadata>,
    training_corpus: Option<TrainingCorpus>,
}

impl ForecastContext {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            historical_stats: OnceLock::new(),
            cluster_mapping: OnceLock::new(),
            cluster_models: OnceLock::new(),
            model_metadata: OnceLock::new(),
            training_corpus: None,
        }
    }

    pub fn from_env() -> Self {
        Self::new(pipeline_config_from_env())
    }

    pub fn builder() -> ForecastContextBuilder {
        ForecastContextBuilder::default()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn historical_stats(&self) -> Option<&HistoricalStats> {
        self.historical_stats
            .get_or_init(|| {
                let path = &self.config.artifacts.training_corpus_path;
                let stats = load_historical_stats(path);
                if stats.is_some() {
                    log_artifact_source("historical_stats", Some(path), None);
                }
                stats
            })
            .as_ref()
    }

    pub fn cluster_mapping(&self) -> &ClusterAssignment {
        self.cluster_mapping
            .get_or_init(|| load_cluster_mapping(&self.config.artifacts.cluster_mapping_path))
    }

    pub fn cluster_models(&self) -> Result<&ClusterModels, &ResourceUnavailable> {
        self.cluster_models
            .get_or_init(|| {
                // unmapped stores route to cluster 0 even when the mapping never names it
                let mut cluster_ids = self.cluster_mapping().cluster_ids();
                cluster_ids.insert(UNMAPPED_CLUSTER);
                load_cluster_models(&self.config.artifacts.models_dir, &cluster_ids)
            })
            .as_ref()
    }

    pub fn model_metadata(&self) -> &ModelMetadata {
        self.model_metadata
            .get_or_init(|| load_model_metadata(&self.config.artifacts.model_metadata_path))
    }

    pub fn training_corpus(&self) -> Result<Cow<'_, TrainingCorpus>, CorpusError> {
        match &self.training_corpus {
            Some(corpus) => Ok(Cow::Borrowed(corpus)),
            None => TrainingCorpus::load(&self.config.artifacts.training_corpus_path).map(Cow::Owned),
        }
    }

    pub fn fallback_model(&self) -> Result<Arc<dyn SalesRegressor>, PredictError> {
        let corpus = self
            .training_corpus()
            .map_err(|err| PredictError::TrainingDataUnavailable(err.to_string()))?;
        info!(
            component = "context",
            event = "context.fallback.training",
            corpus_rows = corpus.len()
        );
        let model = train_global_model(
            &corpus,
            &self.config.imputation,
            &self.config.fallback_training,
        )?;
        Ok(Arc::new(model))
    }
}

impl Default for ForecastContext {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

#[derive(Debug, Default)]
pub struct ForecastContextBuilder {
    config: PipelineConfig,
    historical_stats: Option<Option<HistoricalStats>>,
    cluster_mapping: Option<ClusterAssignment>,
    cluster_models: Option<ClusterModels>,
    model_metadata: Option<ModelMetadata>,
    training_corpus: Option<TrainingCorpus>,
}

impl ForecastContextBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn historical_stats(mut self, stats: Option<HistoricalStats>) -> Self {
        self.historical_stats = Some(stats);
        self
    }

    pub fn cluster_mapping(mut self, mapping: ClusterAssignment) -> Self {
        self.cluster_mapping = Some(mapping);
        self
    }

    pub fn cluster_models(mut self, models: ClusterModels) -> Self {
        self.cluster_models = Some(models);
        self
    }

    pub fn model_metadata(mut self, metadata: ModelMetadata) -> Self {
        self.model_metadata = Some(metadata);
        self
    }

    pub fn training_corpus(mut self, corpus: TrainingCorpus) -> Self {
        self.training_corpus = Some(corpus);
        self
    }

    pub fn build(self) -> ForecastContext {
        let mut context = ForecastContext::new(self.config);

        if let Some(stats) = self.historical_stats {
            log_artifact_source("historical_stats", None, None);
            context.historical_stats = OnceLock::from(stats);
        }
        if let Some(mapping) = self.cluster_mapping {
            log_artifact_source("cluster_mapping", None, None);
            context.cluster_mapping = OnceLock::from(mapping);
        }
        if let Some(models) = self.cluster_models {
            log_artifact_source("cluster_models", None, None);
            let models = if models.is_empty() {
                Err(ResourceUnavailable {
                    models_dir: context.config.artifacts.models_dir.clone(),
                    missing: Vec::new(),
                })
            } else {
                Ok(models)
            };
            context.cluster_models = OnceLock::from(models);
        }
        if let Some(metadata) = self.model_metadata {
            context.model_metadata = OnceLock::from(metadata);
        }
        context.training_corpus = self.training_corpus;

        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifactConfig;
    use crate::history::StoreStats;

    fn assert_send_sync<T: Send + Sync>() {}

    fn config_in(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            artifacts: ArtifactConfig {
                training_corpus_path: dir.join("train.csv"),
                cluster_mapping_path: dir.join("mapping.csv"),
                models_dir: dir.join("models"),
                model_metadata_path: dir.join("metadata.json"),
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn context_is_shareable_across_threads() {
        assert_send_sync::<ForecastContext>();
    }

    #[test]
    fn missing_artifacts_degrade_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ForecastContext::new(config_in(dir.path()));

        assert!(ctx.historical_stats().is_none());
        assert_eq!(ctx.cluster_mapping().len(), 45);
        let unavailable = ctx.cluster_models().unwrap_err();
        assert_eq!(unavailable.missing, vec![0, 1, 2, 3]);
        assert_eq!(ctx.model_metadata(), &ModelMetadata::default());
        assert!(matches!(
            ctx.fallback_model(),
            Err(PredictError::TrainingDataUnavailable(_))
        ));
    }

    #[test]
    fn injected_artifacts_are_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = HistoricalStats::default();
        stats.insert(
            1,
            StoreStats {
                mean: 1.0,
                median: 2.0,
                std: 3.0,
            },
        );
        let ctx = ForecastContext::builder()
            .config(config_in(dir.path()))
            .historical_stats(Some(stats.clone()))
            .cluster_mapping(ClusterAssignment::round_robin(2, 2))
            .cluster_models(ClusterModels::new())
            .build();

        assert_eq!(ctx.historical_stats(), Some(&stats));
        assert_eq!(ctx.cluster_mapping().cluster_of(2), Some(0));
        assert!(ctx.cluster_models().is_err());
    }

    #[test]
    fn unmapped_cluster_model_is_loaded_even_when_the_mapping_omits_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.artifacts.cluster_mapping_path, "store,cluster\n1,1\n2,2\n").unwrap();

        let ctx = ForecastContext::new(config);
        let unavailable = ctx.cluster_models().unwrap_err();
        assert_eq!(unavailable.missing, vec![0, 1, 2]);
    }
}
