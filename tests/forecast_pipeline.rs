use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use chrono::{Duration, NaiveDate};
use sales_forecast::{
    build_features, model_path, run_forecast, run_forecast_csv, summarize, train_gradient_boosted,
    write_predictions_csv, ArtifactConfig, FallbackTrainingConfig, FeatureMode, FeatureVector,
    ForecastContext, ImputationDefaults, PipelineConfig, PipelineError, RawTable, TrainingCorpus,
};
use tempfile::TempDir;

const HEADER: &str = "Store,Date,Weekly_Sales,Holiday_Flag,Temperature,Fuel_Price,CPI,Unemployment";

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2010, 2, 5).expect("valid start date")
}

fn sales(store: u32, week: i64) -> f64 {
    let base = if store == 1 { 1_500_000.0 } else { 400_000.0 };
    base + 25_000.0 * ((week % 13) as f64) + if week % 52 == 46 { 300_000.0 } else { 0.0 }
}

/// Weekly rows for each store starting `offset` weeks after the corpus start.
fn weekly_csv(stores: &[u32], offset: i64, weeks: i64, with_target: bool) -> String {
    let mut csv = if with_target {
        format!("{HEADER}\n")
    } else {
        format!("{}\n", HEADER.replace("Weekly_Sales,", ""))
    };
    for &store in stores {
        for w in offset..offset + weeks {
            let date = (start() + Duration::weeks(w)).format("%d-%m-%Y");
            let holiday = u8::from(w % 52 == 46);
            let temperature = 30.0 + (w % 52) as f64;
            let target = if with_target {
                format!("{:.2},", sales(store, w))
            } else {
                String::new()
            };
            writeln!(
                csv,
                "{store},{date},{target}{holiday},{temperature},3.1,{},7.5",
                210.0 + w as f64 * 0.1
            )
            .expect("write to string");
        }
    }
    csv
}

fn artifacts(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        artifacts: ArtifactConfig {
            training_corpus_path: dir.join("train.csv"),
            cluster_mapping_path: dir.join("cluster_mapping.csv"),
            models_dir: dir.join("models"),
            model_metadata_path: dir.join("models/metadata.json"),
        },
        fallback_training: FallbackTrainingConfig {
            n_estimators: 20,
            ..FallbackTrainingConfig::default()
        },
        ..PipelineConfig::default()
    }
}

/// Trains one model per `(store, cluster)` pair on that store's corpus rows.
fn save_store_models(config: &PipelineConfig, store_clusters: &[(u32, u32)]) {
    let corpus =
        TrainingCorpus::load(&config.artifacts.training_corpus_path).expect("corpus loads");
    let (rows, _) = build_features(
        corpus.observations(),
        FeatureMode::Backtest,
        None,
        &ImputationDefaults::default(),
    )
    .expect("back-test features");

    for &(store, cluster) in store_clusters {
        let (features, targets): (Vec<FeatureVector>, Vec<f64>) = rows
            .iter()
            .filter(|row| row.store == store)
            .map(|row| (row.to_vector(), row.weekly_sales.expect("target kept")))
            .unzip();
        let model = train_gradient_boosted(&features, &targets, &config.fallback_training)
            .expect("model trains")
            .with_name(format!("cluster_{cluster}"));
        model
            .save_json(&model_path(&config.artifacts.models_dir, cluster))
            .expect("model saves");
    }
}

/// Corpus of 80 weeks for stores 1 and 2, mapping 1 -> 0 and 2 -> 1, and
/// optionally one model per cluster trained on that corpus.
fn seed_artifacts(with_models: bool) -> (TempDir, PipelineConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = artifacts(dir.path());
    fs::write(
        &config.artifacts.training_corpus_path,
        weekly_csv(&[1, 2], 0, 80, true),
    )
    .expect("write corpus");
    fs::write(
        &config.artifacts.cluster_mapping_path,
        "store,cluster\n1,0\n2,1\n",
    )
    .expect("write mapping");

    if with_models {
        save_store_models(&config, &[(1, 0), (2, 1)]);
    }

    (dir, config)
}

#[test]
fn two_stores_sixty_weeks_route_to_their_clusters() {
    let (_dir, config) = seed_artifacts(true);
    let ctx = ForecastContext::new(config);
    let table = RawTable::from_reader(weekly_csv(&[1, 2], 80, 60, false).as_bytes())
        .expect("input parses");

    let out = run_forecast(&table, &ctx).expect("forecast succeeds");

    assert_eq!(out.predictions.len(), 120);
    assert!(!out.target_stripped);
    assert!(out.continuity_warnings.is_empty());
    assert_eq!(out.feature_report.dropped_rows, 0);
    assert!(out.validation_message.contains("120 rows, 2 stores"));
    for row in &out.predictions {
        let expected_cluster = if row.store == 1 { 0 } else { 1 };
        assert_eq!(row.cluster, expected_cluster);
        assert!(row.predicted_sales.is_finite());
    }
    // cluster 0 block first, store 1 sorted by date
    assert!(out.predictions[..60].iter().all(|row| row.store == 1));
    assert!(out.predictions[..60].windows(2).all(|w| w[0].date < w[1].date));

    assert_eq!(out.summary, summarize(&out.predictions));
    assert_eq!(out.summary.unique_stores, 2);
    assert_eq!(out.summary.unique_dates, 60);
    // store 1 sells far more than store 2 in the corpus
    let store_mean = |store: u32| {
        let values: Vec<f64> = out
            .predictions
            .iter()
            .filter(|row| row.store == store)
            .map(|row| row.predicted_sales)
            .collect();
        values.iter().sum::<f64>() / values.len() as f64
    };
    assert!(store_mean(1) > store_mean(2));
}

#[test]
fn unmapped_store_uses_the_cluster_zero_model_when_the_mapping_lacks_it() {
    let (_dir, config) = seed_artifacts(false);
    fs::write(
        &config.artifacts.cluster_mapping_path,
        "store,cluster\n1,1\n2,2\n",
    )
    .expect("write mapping");
    save_store_models(&config, &[(2, 0), (1, 1), (2, 2)]);
    let ctx = ForecastContext::new(config);
    let table = RawTable::from_reader(weekly_csv(&[1, 3], 80, 4, false).as_bytes())
        .expect("input parses");

    let out = run_forecast(&table, &ctx).expect("forecast succeeds");

    assert_eq!(out.predictions.len(), 8);
    // cluster 0 block first
    assert!(out.predictions[..4]
        .iter()
        .all(|row| row.store == 3 && row.cluster == 0));
    assert!(out.predictions[4..]
        .iter()
        .all(|row| row.store == 1 && row.cluster == 1));
    assert!(out.predictions.iter().all(|row| row.predicted_sales.is_finite()));
}

#[test]
fn ground_truth_in_the_upload_is_ignored() {
    let (_dir, config) = seed_artifacts(true);
    let ctx = ForecastContext::new(config);
    let without = RawTable::from_reader(weekly_csv(&[1, 2], 80, 10, false).as_bytes())
        .expect("input parses");
    let with = RawTable::from_reader(weekly_csv(&[1, 2], 80, 10, true).as_bytes())
        .expect("input parses");

    let a = run_forecast(&without, &ctx).expect("forecast succeeds");
    let b = run_forecast(&with, &ctx).expect("forecast succeeds");

    assert!(b.target_stripped);
    assert_eq!(a.predictions, b.predictions);
}

#[test]
fn missing_cluster_models_train_a_global_model() {
    let (_dir, config) = seed_artifacts(false);
    let ctx = ForecastContext::new(config);
    let table = RawTable::from_reader(weekly_csv(&[1, 2, 7], 80, 4, false).as_bytes())
        .expect("input parses");

    let out = run_forecast(&table, &ctx).expect("fallback forecast succeeds");

    assert_eq!(out.predictions.len(), 12);
    assert!(out.predictions.iter().all(|row| row.predicted_sales.is_finite()));
    // store 7 is not in the mapping
    assert!(out
        .predictions
        .iter()
        .filter(|row| row.store == 7)
        .all(|row| row.cluster == 0));
}

#[test]
fn no_models_and_no_corpus_is_a_training_data_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = ForecastContext::new(artifacts(dir.path()));
    let table = RawTable::from_reader(weekly_csv(&[3], 0, 3, false).as_bytes())
        .expect("input parses");

    let err = run_forecast(&table, &ctx).expect_err("nothing to score with");
    assert!(matches!(err, PipelineError::TrainingDataUnavailable(_)));
}

#[test]
fn csv_entry_point_and_export() {
    let (dir, config) = seed_artifacts(true);
    let ctx = ForecastContext::new(config);
    let input = dir.path().join("upload.csv");
    fs::write(&input, weekly_csv(&[2], 90, 3, false)).expect("write upload");

    let out = run_forecast_csv(&input, &ctx).expect("forecast succeeds");
    let mut buf = Vec::new();
    write_predictions_csv(&mut buf, &out.predictions).expect("export succeeds");
    let text = String::from_utf8(buf).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "store,date,predicted_sales");
    let first_date = (start() + Duration::weeks(90)).format("%Y-%m-%d").to_string();
    assert!(lines[1].starts_with(&format!("2,{first_date},")));

    let missing = run_forecast_csv(&dir.path().join("absent.csv"), &ctx)
        .expect_err("missing upload fails");
    assert!(matches!(missing, PipelineError::Input(_)));
}

#[test]
fn shared_context_serves_concurrent_requests() {
    let (_dir, config) = seed_artifacts(true);
    let ctx = ForecastContext::new(config);
    let table = RawTable::from_reader(weekly_csv(&[1, 2], 80, 5, false).as_bytes())
        .expect("input parses");

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| run_forecast(&table, &ctx)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread joins"))
            .collect()
    });

    let first = results[0].as_ref().expect("forecast succeeds");
    for result in &results {
        assert_eq!(result.as_ref().expect("forecast succeeds"), first);
    }
}
