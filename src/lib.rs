//! Weekly store sales forecasting core.
//!
//! An uploaded table is validated, checked for date gaps, turned into a fixed
//! feature vector per row, and scored by per-cluster regression models. See
//! [`run_forecast`] for the request entry point.

mod clusters;
mod config;
mod context;
mod continuity;
mod export;
mod features;
mod history;
mod model;
mod observability;
mod pipeline;
mod predictor;
mod summary;
mod table;
mod validation;

pub use clusters::{
    load_cluster_mapping, ClusterAssignment, ClusterMappingError, DEFAULT_CLUSTER_COUNT,
    DEFAULT_STORE_COUNT, UNMAPPED_CLUSTER,
};
pub use config::{
    artifact_config_from_env, pipeline_config_from_env, ArtifactConfig, ContinuityConfig,
    FallbackTrainingConfig, ImputationDefaults, PipelineConfig, DEFAULT_MAX_GAP_DAYS,
};
pub use context::{ForecastContext, ForecastContextBuilder};
pub use continuity::check_temporal_continuity;
pub use export::{write_predictions_csv, write_predictions_csv_file, EXPORT_COLUMNS};
pub use features::{
    assert_schema_compatible, build_features, feature_schema, FeatureError, FeatureMode,
    FeatureReport, FeatureRow, FeatureSchema, FeatureVector, FEATURE_COLUMNS, FEATURE_COUNT,
    FEATURE_SCHEMA_VERSION, LAGS, ROLLING_MEAN_WINDOWS, ROLLING_STD_WINDOW,
};
pub use history::{
    load_historical_stats, CorpusError, HistoricalStats, StoreStats, TrainingCorpus, CORPUS_TABLE,
};
pub use model::{
    load_model_metadata, train_gradient_boosted, GradientBoostedRegressor, ModelError,
    ModelMetadata, RegressionNode, RegressionTree, SalesRegressor, MODEL_TYPE,
};
pub use observability::{
    init_logging, log_artifact_source, log_pipeline_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    build_table_features, run_forecast, run_forecast_csv, ForecastOutput, PipelineError,
};
pub use predictor::{
    load_cluster_models, model_path, predict_sales, train_global_model, ClusterModels,
    PredictError, PredictionRow, ResourceUnavailable, MODEL_FILE_PREFIX,
};
pub use summary::{summarize, SummaryStats};
pub use table::{
    parse_date_dayfirst, parse_number, RawObservation, RawTable, TableError, REQUIRED_COLUMNS,
    TARGET_COLUMN,
};
pub use validation::{validate_table, ValidationIssue, ValidationReport};
