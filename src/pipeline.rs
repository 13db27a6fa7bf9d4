//! Request boundary: one uploaded table in, forecasts and a summary out.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::ImputationDefaults;
use crate::context::ForecastContext;
use crate::continuity::check_temporal_continuity;
use crate::features::{build_features, FeatureError, FeatureMode, FeatureReport, FeatureRow};
use crate::history::HistoricalStats;
use crate::observability::log_pipeline_start;
use crate::predictor::{predict_sales, PredictError, PredictionRow};
use crate::summary::{summarize, SummaryStats};
use crate::table::{RawTable, TableError};
use crate::validation::validate_table;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("cannot read input table: {0}")]
    Input(#[from] TableError),
    #[error("no data available after feature engineering ({input_rows} rows in, {dropped_rows} dropped)")]
    EmptyResult {
        input_rows: usize,
        dropped_rows: usize,
    },
    #[error("cannot load training data: {0}")]
    TrainingDataUnavailable(String),
    #[error("processing failed: {0}")]
    Processing(String),
}

impl From<FeatureError> for PipelineError {
    fn from(err: FeatureError) -> Self {
        match err {
            FeatureError::EmptyResult {
                input_rows,
                dropped_rows,
            } => Self::EmptyResult {
                input_rows,
                dropped_rows,
            },
            other => Self::Processing(other.to_string()),
        }
    }
}

impl From<PredictError> for PipelineError {
    fn from(err: PredictError) -> Self {
        match err {
            PredictError::TrainingDataUnavailable(reason) => Self::TrainingDataUnavailable(reason),
            other => Self::Processing(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastOutput {
    pub predictions: Vec<PredictionRow>,
    pub summary: SummaryStats,
    pub continuity_warnings: Vec<String>,
    pub feature_report: FeatureReport,
    pub validation_message: String,
    pub target_stripped: bool,
}

pub fn run_forecast(table: &RawTable, ctx: &ForecastContext) -> Result<ForecastOutput, PipelineError> {
    let result = match panic::catch_unwind(AssertUnwindSafe(|| forecast(table, ctx))) {
        Ok(result) => result,
        Err(payload) => Err(PipelineError::Processing(panic_message(payload.as_ref()))),
    };

    if let Err(err) = &result {
        match err {
            PipelineError::Validation(_) => warn!(
                component = "pipeline",
                event = "pipeline.rejected",
                error = %err
            ),
            _ => error!(
                component = "pipeline",
                event = "pipeline.failed",
                rows = table.len(),
                error = %err
            ),
        }
    }
    result
}

pub fn run_forecast_csv(path: &Path, ctx: &ForecastContext) -> Result<ForecastOutput, PipelineError> {
    let table = RawTable::from_path(path)?;
    run_forecast(&table, ctx)
}

pub fn build_table_features(
    table: &RawTable,
    stats: Option<&HistoricalStats>,
    defaults: &ImputationDefaults,
) -> Result<(Vec<FeatureRow>, FeatureReport), PipelineError> {
    let report = validate_table(table);
    if !report.ok {
        return Err(PipelineError::Validation(report.message));
    }
    let observations = table.observations()?;
    Ok(build_features(
        &observations,
        FeatureMode::for_table(table),
        stats,
        defaults,
    )?)
}

fn forecast(table: &RawTable, ctx: &ForecastContext) -> Result<ForecastOutput, PipelineError> {
    let target_stripped = table.has_target();
    log_pipeline_start(table.len(), target_stripped);

    let validation = validate_table(table);
    if !validation.ok {
        return Err(PipelineError::Validation(validation.message));
    }

    let observations = table.without_target().observations()?;
    if target_stripped {
        info!(
            component = "pipeline",
            event = "pipeline.target_stripped",
            rows = observations.len()
        );
    }

    let config = ctx.config();
    let continuity_warnings =
        check_temporal_continuity(&observations, config.continuity.max_gap_days);

    let (rows, feature_report) = build_features(
        &observations,
        FeatureMode::Operational,
        ctx.historical_stats(),
        &config.imputation,
    )?;

    let predictions = predict_sales(
        rows,
        ctx.cluster_mapping(),
        ctx.cluster_models(),
        || ctx.fallback_model(),
    )?;
    let summary = summarize(&predictions);

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        predictions = summary.count,
        stores = summary.unique_stores,
        continuity_warnings = continuity_warnings.len()
    );

    Ok(ForecastOutput {
        predictions,
        summary,
        continuity_warnings,
        feature_report,
        validation_message: validation.message,
        target_stripped,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("unexpected panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("unexpected panic: {msg}")
    } else {
        "unexpected panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::ClusterAssignment;
    use crate::features::FeatureVector;
    use crate::model::SalesRegressor;
    use crate::predictor::ClusterModels;

    struct Exploding;

    impl SalesRegressor for Exploding {
        fn predict(&self, _: &FeatureVector) -> f64 {
            panic!("model blew up")
        }

        fn name(&self) -> &str {
            "exploding"
        }
    }

    fn table(rows: &[&str]) -> RawTable {
        let mut csv = String::from("Store,Date,Holiday_Flag,Temperature,Fuel_Price,CPI,Unemployment\n");
        for row in rows {
            csv.push_str(row);
            csv.push('\n');
        }
        RawTable::from_reader(csv.as_bytes()).unwrap()
    }

    #[test]
    fn validation_failure_is_returned_verbatim() {
        let ctx = ForecastContext::default();
        let err = run_forecast(&table(&["99,05-02-2010,0,40,3,210,8"]), &ctx).unwrap_err();
        match err {
            PipelineError::Validation(message) => assert!(message.contains("store")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn panics_become_processing_errors() {
        let mut models = ClusterModels::new();
        models.insert(1, Exploding);
        let ctx = ForecastContext::builder()
            .historical_stats(None)
            .cluster_mapping(ClusterAssignment::round_robin(4, 4))
            .cluster_models(models)
            .build();

        let err = run_forecast(&table(&["1,05-02-2010,0,40,3,210,8"]), &ctx).unwrap_err();
        match err {
            PipelineError::Processing(message) => assert!(message.contains("model blew up")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn feature_errors_map_to_pipeline_errors() {
        let err: PipelineError = FeatureError::EmptyResult {
            input_rows: 5,
            dropped_rows: 5,
        }
        .into();
        assert!(matches!(
            err,
            PipelineError::EmptyResult {
                input_rows: 5,
                dropped_rows: 5
            }
        ));

        let err: PipelineError = PredictError::TrainingDataUnavailable("gone".into()).into();
        assert_eq!(err.to_string(), "cannot load training data: gone");
    }
}
