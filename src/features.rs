//! Calendar, cyclic, lag, and rolling features for the per-cluster models.
//!
//! Two construction paths exist and are selected once per call:
//! - [`FeatureMode::Backtest`] builds lags and rolling aggregates from the
//!   observed target and drops rows whose history is too short.
//! - [`FeatureMode::Operational`] ignores any target and fills every lag and
//!   rolling column with per-store historical statistics (or global defaults).

use std::collections::BTreeMap;
use std::f64::consts::PI;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ImputationDefaults;
use crate::history::{HistoricalStats, StoreStats};
use crate::table::{RawObservation, RawTable};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const FEATURE_COUNT: usize = 22;

pub const FEATURE_COLUMNS: [&str; FEATURE_COUNT] = [
    "store",
    "temperature",
    "fuel_price",
    "cpi",
    "unemployment",
    "holiday_flag",
    "year",
    "month",
    "quarter",
    "week",
    "lag_1",
    "lag_2",
    "lag_4",
    "lag_52",
    "rolling_mean_4",
    "rolling_mean_12",
    "rolling_mean_26",
    "rolling_std_4",
    "week_sin",
    "week_cos",
    "month_sin",
    "month_cos",
];

pub const LAGS: [usize; 4] = [1, 2, 4, 52];
pub const ROLLING_MEAN_WINDOWS: [usize; 3] = [4, 12, 26];
pub const ROLLING_STD_WINDOW: usize = 4;

pub type FeatureVector = [f64; FEATURE_COUNT];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureMode {
    Backtest,
    Operational,
}

impl FeatureMode {
    pub fn for_table(table: &RawTable) -> Self {
        if table.has_target() {
            Self::Backtest
        } else {
            Self::Operational
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub store: u32,
    pub date: NaiveDate,
    pub holiday_flag: u8,
    pub temperature: f64,
    pub fuel_price: f64,
    pub cpi: f64,
    pub unemployment: f64,
    pub year: i32,
    pub month: u32,
    pub quarter: u32,
    pub week: u32,
    pub week_sin: f64,
    pub week_cos: f64,
    pub month_sin: f64,
    pub month_cos: f64,
    pub lag_1: f64,
    pub lag_2: f64,
    pub lag_4: f64,
    pub lag_52: f64,
    pub rolling_mean_4: f64,
    pub rolling_mean_12: f64,
    pub rolling_mean_26: f64,
    pub rolling_std_4: f64,
    // Ground truth; only kept on the back-test path.
    pub weekly_sales: Option<f64>,
    pub cluster: Option<u32>,
}

impl FeatureRow {
    pub fn to_vector(&self) -> FeatureVector {
        [
            self.store as f64,
            self.temperature,
            self.fuel_price,
            self.cpi,
            self.unemployment,
            self.holiday_flag as f64,
            self.year as f64,
            self.month as f64,
            self.quarter as f64,
            self.week as f64,
            self.lag_1,
            self.lag_2,
            self.lag_4,
            self.lag_52,
            self.rolling_mean_4,
            self.rolling_mean_12,
            self.rolling_mean_26,
            self.rolling_std_4,
            self.week_sin,
            self.week_cos,
            self.month_sin,
            self.month_cos,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureReport {
    pub mode: FeatureMode,
    pub input_rows: usize,
    pub output_rows: usize,
    pub dropped_rows: usize,
    pub defaulted_stores: Vec<u32>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("no rows left after feature engineering ({input_rows} in, {dropped_rows} dropped)")]
    EmptyResult {
        input_rows: usize,
        dropped_rows: usize,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy)]
struct Calendar {
    year: i32,
    month: u32,
    quarter: u32,
    week: u32,
    week_sin: f64,
    week_cos: f64,
    month_sin: f64,
    month_cos: f64,
}

impl Calendar {
    fn of(date: NaiveDate) -> Self {
        let month = date.month();
        let week = date.iso_week().week();
        let week_angle = 2.0 * PI * week as f64 / 52.0;
        let month_angle = 2.0 * PI * month as f64 / 12.0;
        Self {
            year: date.year(),
            month,
            quarter: (month - 1) / 3 + 1,
            week,
            week_sin: week_angle.sin(),
            week_cos: week_angle.cos(),
            month_sin: month_angle.sin(),
            month_cos: month_angle.cos(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HistoryFeatures {
    lags: [Option<f64>; 4],
    rolling_means: [Option<f64>; 3],
    rolling_std: Option<f64>,
}

pub fn feature_schema() -> FeatureSchema {
    let columns: Vec<String> = FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect();
    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, &columns);
    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

pub fn build_features(
    observations: &[RawObservation],
    mode: FeatureMode,
    stats: Option<&HistoricalStats>,
    defaults: &ImputationDefaults,
) -> Result<(Vec<FeatureRow>, FeatureReport), FeatureError> {
    let input_rows = observations.len();
    let stores = observations
        .iter()
        .map(|obs| obs.store)
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    info!(
        component = "features",
        event = "features.build.start",
        mode = ?mode,
        rows = input_rows,
        stores
    );

    let mut sorted: Vec<&RawObservation> = observations.iter().collect();
    sorted.sort_by_key(|obs| (obs.store, obs.date));

    let (history, defaulted_stores) = match mode {
        FeatureMode::Backtest => (backtest_history(&sorted), Vec::new()),
        FeatureMode::Operational => imputed_history(&sorted, stats, defaults),
    };

    let mut rows = Vec::with_capacity(sorted.len());
    for (obs, hist) in sorted.iter().zip(history) {
        let weekly_sales = match mode {
            FeatureMode::Backtest => match obs.weekly_sales {
                Some(value) => Some(value),
                None => continue,
            },
            FeatureMode::Operational => None,
        };
        if let Some(row) = assemble_row(obs, &hist, weekly_sales) {
            rows.push(row);
        }
    }

    let dropped_rows = input_rows - rows.len();
    if dropped_rows > 0 {
        warn!(
            component = "features",
            event = "features.build.rows_dropped",
            dropped_rows,
            reason = "incomplete_history"
        );
    }

    if rows.is_empty() {
        return Err(FeatureError::EmptyResult {
            input_rows,
            dropped_rows,
        });
    }

    let report = FeatureReport {
        mode,
        input_rows,
        output_rows: rows.len(),
        dropped_rows,
        defaulted_stores,
    };

    info!(
        component = "features",
        event = "features.build.finish",
        output_rows = report.output_rows,
        dropped_rows = report.dropped_rows,
        defaulted_stores = report.defaulted_stores.len(),
        column_count = FEATURE_COUNT
    );

    Ok((rows, report))
}

fn assemble_row(
    obs: &RawObservation,
    hist: &HistoryFeatures,
    weekly_sales: Option<f64>,
) -> Option<FeatureRow> {
    let finite = |value: Option<f64>| value.filter(|v| v.is_finite());
    let [lag_1, lag_2, lag_4, lag_52] = hist.lags;
    let [rolling_mean_4, rolling_mean_12, rolling_mean_26] = hist.rolling_means;
    let calendar = Calendar::of(obs.date);

    Some(FeatureRow {
        store: obs.store,
        date: obs.date,
        holiday_flag: obs.holiday_flag,
        temperature: obs.temperature,
        fuel_price: obs.fuel_price,
        cpi: obs.cpi,
        unemployment: obs.unemployment,
        year: calendar.year,
        month: calendar.month,
        quarter: calendar.quarter,
        week: calendar.week,
        week_sin: calendar.week_sin,
        week_cos: calendar.week_cos,
        month_sin: calendar.month_sin,
        month_cos: calendar.month_cos,
        lag_1: finite(lag_1)?,
        lag_2: finite(lag_2)?,
        lag_4: finite(lag_4)?,
        lag_52: finite(lag_52)?,
        rolling_mean_4: finite(rolling_mean_4)?,
        rolling_mean_12: finite(rolling_mean_12)?,
        rolling_mean_26: finite(rolling_mean_26)?,
        rolling_std_4: finite(hist.rolling_std)?,
        weekly_sales,
        cluster: None,
    })
}

// Shifts the target within each store by row position. Rolling aggregates
// run over the one-period-shifted series and need at least one observed
// value (two for the standard deviation).
fn backtest_history(sorted: &[&RawObservation]) -> Vec<HistoryFeatures> {
    let mut out = Vec::with_capacity(sorted.len());
    for group in sorted.chunk_by(|a, b| a.store == b.store) {
        let targets: Vec<Option<f64>> = group.iter().map(|obs| obs.weekly_sales).collect();
        let shifted: Vec<Option<f64>> = (0..targets.len())
            .map(|i| if i == 0 { None } else { targets[i - 1] })
            .collect();

        for i in 0..targets.len() {
            let mut hist = HistoryFeatures::default();
            for (slot, lag) in LAGS.iter().enumerate() {
                hist.lags[slot] = i.checked_sub(*lag).and_then(|j| targets[j]);
            }
            for (slot, window) in ROLLING_MEAN_WINDOWS.iter().enumerate() {
                let values = window_values(&shifted, i, *window);
                hist.rolling_means[slot] = (!values.is_empty()).then(|| crate::history::mean(&values));
            }
            let values = window_values(&shifted, i, ROLLING_STD_WINDOW);
            hist.rolling_std = (values.len() >= 2).then(|| crate::history::sample_std(&values));
            out.push(hist);
        }
    }
    out
}

fn window_values(series: &[Option<f64>], end: usize, window: usize) -> Vec<f64> {
    let start = (end + 1).saturating_sub(window);
    series[start..=end].iter().flatten().copied().collect()
}

fn imputed_history(
    sorted: &[&RawObservation],
    stats: Option<&HistoricalStats>,
    defaults: &ImputationDefaults,
) -> (Vec<HistoryFeatures>, Vec<u32>) {
    if stats.is_none() {
        warn!(
            component = "features",
            event = "features.imputation.global_defaults",
            lag = defaults.lag,
            rolling_mean = defaults.rolling_mean,
            rolling_std = defaults.rolling_std
        );
    }

    let mut per_store: BTreeMap<u32, (HistoryFeatures, bool)> = BTreeMap::new();
    let history = sorted
        .iter()
        .map(|obs| {
            per_store
                .entry(obs.store)
                .or_insert_with(|| {
                    let store_stats = stats.and_then(|s| s.get(obs.store));
                    (
                        imputed_for_store(store_stats, defaults),
                        store_stats.is_none(),
                    )
                })
                .0
        })
        .collect();

    let defaulted: Vec<u32> = per_store
        .iter()
        .filter(|(_, (_, defaulted))| *defaulted)
        .map(|(store, _)| *store)
        .collect();
    if stats.is_some() && !defaulted.is_empty() {
        warn!(
            component = "features",
            event = "features.imputation.stores_without_history",
            stores = ?defaulted
        );
    }

    (history, defaulted)
}

fn imputed_for_store(store_stats: Option<&StoreStats>, defaults: &ImputationDefaults) -> HistoryFeatures {
    let pick = |value: Option<f64>, fallback: f64| {
        Some(value.filter(|v| v.is_finite()).unwrap_or(fallback))
    };
    let lag = pick(store_stats.map(|s| s.median), defaults.lag);
    let rolling_mean = pick(store_stats.map(|s| s.mean), defaults.rolling_mean);

    HistoryFeatures {
        lags: [lag; 4],
        rolling_means: [rolling_mean; 3],
        rolling_std: pick(store_stats.map(|s| s.std), defaults.rolling_std),
    }
}

fn schema_fingerprint(version: u32, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!(
        "lags:{:?};rolling_means:{:?};rolling_std:{};",
        LAGS, ROLLING_MEAN_WINDOWS, ROLLING_STD_WINDOW
    ));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
