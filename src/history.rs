//! Offline training corpus access and per-store target statistics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ImputationDefaults;
use crate::table::{parse_date_dayfirst, RawObservation, RawTable, TableError};

pub const CORPUS_TABLE: &str = "training_rows";

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("training corpus not found at {0}")]
    NotFound(PathBuf),
    #[error("table error: {0}")]
    Table(#[from] TableError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("training corpus at {0} has no weekly_sales column")]
    MissingTarget(PathBuf),
    #[error("training corpus at {0} has no rows with a target value")]
    Empty(PathBuf),
    #[error("invalid date '{0}' in training corpus")]
    InvalidDate(String),
    #[error("invalid store id {0} in training corpus")]
    InvalidStore(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingCorpus {
    observations: Vec<RawObservation>,
}

impl TrainingCorpus {
    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        if !path.exists() {
            return Err(CorpusError::NotFound(path.to_path_buf()));
        }

        let corpus = match path.extension().and_then(|ext| ext.to_str()) {
            Some("sqlite") | Some("db") => Self::from_sqlite_path(path)?,
            _ => Self::from_csv_path(path)?,
        };

        if corpus.target_count() == 0 {
            return Err(CorpusError::Empty(path.to_path_buf()));
        }

        info!(
            component = "history",
            event = "corpus.loaded",
            path = %path.display(),
            rows = corpus.observations.len(),
            stores = corpus.store_count()
        );

        Ok(corpus)
    }

    pub fn from_observations(observations: Vec<RawObservation>) -> Self {
        Self { observations }
    }

    fn from_csv_path(path: &Path) -> Result<Self, CorpusError> {
        let table = RawTable::from_path(path)?;
        if !table.has_target() {
            return Err(CorpusError::MissingTarget(path.to_path_buf()));
        }
        Ok(Self {
            observations: table.observations()?,
        })
    }

    fn from_sqlite_path(path: &Path) -> Result<Self, CorpusError> {
        let conn = Connection::open(path)?;
        let mut stmt = conn.prepare(&format!(
            "
            SELECT
                store,
                date,
                holiday_flag,
                temperature,
                fuel_price,
                cpi,
                unemployment,
                weekly_sales
            FROM {CORPUS_TABLE}
            ORDER BY store ASC, date ASC
            "
        ))?;

        let mut rows = stmt.query([])?;
        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            let store: i64 = row.get(0)?;
            let raw_date: String = row.get(1)?;
            let date =
                parse_date_dayfirst(&raw_date).ok_or(CorpusError::InvalidDate(raw_date))?;
            let holiday_flag: i64 = row.get(2)?;
            observations.push(RawObservation {
                store: u32::try_from(store).map_err(|_| CorpusError::InvalidStore(store))?,
                date,
                holiday_flag: u8::from(holiday_flag != 0),
                temperature: row.get(3)?,
                fuel_price: row.get(4)?,
                cpi: row.get(5)?,
                unemployment: row.get(6)?,
                weekly_sales: row.get(7)?,
            });
        }

        Ok(Self { observations })
    }

    pub fn observations(&self) -> &[RawObservation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    fn target_count(&self) -> usize {
        self.observations
            .iter()
            .filter(|obs| obs.weekly_sales.is_some())
            .count()
    }

    fn store_count(&self) -> usize {
        self.observations
            .iter()
            .map(|obs| obs.store)
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub mean: f64,
    pub median: f64,
    // Sample standard deviation; NaN for a single observation.
    pub std: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalStats {
    by_store: BTreeMap<u32, StoreStats>,
}

impl HistoricalStats {
    pub fn from_observations(observations: &[RawObservation]) -> Self {
        let mut sales_by_store: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for obs in observations {
            if let Some(sales) = obs.weekly_sales {
                sales_by_store.entry(obs.store).or_default().push(sales);
            }
        }

        let by_store = sales_by_store
            .into_iter()
            .map(|(store, mut values)| {
                let stats = StoreStats {
                    mean: mean(&values),
                    median: median(&mut values),
                    std: sample_std(&values),
                };
                (store, stats)
            })
            .collect();

        Self { by_store }
    }

    pub fn insert(&mut self, store: u32, stats: StoreStats) {
        self.by_store.insert(store, stats);
    }

    pub fn get(&self, store: u32) -> Option<&StoreStats> {
        self.by_store.get(&store)
    }

    pub fn len(&self) -> usize {
        self.by_store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_store.is_empty()
    }
}

/// Reads the corpus at `path` and computes per-store statistics. Any failure
/// is logged and turned into `None`; callers fall back to global defaults.
pub fn load_historical_stats(path: &Path) -> Option<HistoricalStats> {
    match TrainingCorpus::load(path) {
        Ok(corpus) => {
            let stats = HistoricalStats::from_observations(corpus.observations());
            info!(
                component = "history",
                event = "history.stats.loaded",
                path = %path.display(),
                stores = stats.len()
            );
            Some(stats)
        }
        Err(err) => {
            warn!(
                component = "history",
                event = "history.stats.unavailable",
                path = %path.display(),
                error = %err
            );
            None
        }
    }
}

impl ImputationDefaults {
    pub fn from_corpus(corpus: &TrainingCorpus) -> Option<Self> {
        let values: Vec<f64> = corpus
            .observations()
            .iter()
            .filter_map(|obs| obs.weekly_sales)
            .collect();
        if values.len() < 2 {
            return None;
        }

        let global_mean = mean(&values);
        Some(Self {
            lag: global_mean,
            rolling_mean: global_mean,
            rolling_std: sample_std(&values),
        })
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

pub(crate) fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - m;
            d * d
        })
        .sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}
