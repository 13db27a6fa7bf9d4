//! Store to cluster mapping.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::features::FeatureRow;
use crate::observability::log_artifact_source;
use crate::table::parse_number;

pub const UNMAPPED_CLUSTER: u32 = 0;
pub const DEFAULT_CLUSTER_COUNT: u32 = 4;
pub const DEFAULT_STORE_COUNT: u32 = 45;

#[derive(Debug, Error)]
pub enum ClusterMappingError {
    #[error("cluster mapping not found at {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("cluster mapping is missing column '{0}'")]
    MissingColumn(&'static str),
    #[error("cluster mapping row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },
    #[error("cluster mapping has no rows")]
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    by_store: BTreeMap<u32, u32>,
}

impl ClusterAssignment {
    pub fn new(by_store: BTreeMap<u32, u32>) -> Self {
        Self { by_store }
    }

    pub fn round_robin(stores: u32, clusters: u32) -> Self {
        let clusters = clusters.max(1);
        Self {
            by_store: (1..=stores).map(|store| (store, store % clusters)).collect(),
        }
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ClusterMappingError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let position = |name: &'static str| {
            headers
                .iter()
                .position(|header| header.eq_ignore_ascii_case(name))
                .ok_or(ClusterMappingError::MissingColumn(name))
        };
        let store_idx = position("store")?;
        let cluster_idx = position("cluster")?;

        let mut by_store = BTreeMap::new();
        for (row, record) in csv_reader.records().enumerate() {
            let record = record?;
            let row = row + 1;
            let store = integer_cell(record.get(store_idx), row, "store")?;
            let cluster = integer_cell(record.get(cluster_idx), row, "cluster")?;
            by_store.insert(store, cluster);
        }

        if by_store.is_empty() {
            return Err(ClusterMappingError::Empty);
        }
        Ok(Self { by_store })
    }

    pub fn from_path(path: &Path) -> Result<Self, ClusterMappingError> {
        if !path.exists() {
            return Err(ClusterMappingError::NotFound(path.display().to_string()));
        }
        Self::from_reader(fs::File::open(path)?)
    }

    pub fn cluster_of(&self, store: u32) -> Option<u32> {
        self.by_store.get(&store).copied()
    }

    pub fn cluster_ids(&self) -> BTreeSet<u32> {
        self.by_store.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_store.is_empty()
    }

    pub fn assign(&self, rows: &mut [FeatureRow]) -> usize {
        let mut unmapped_rows = 0;
        let mut unmapped_stores = BTreeSet::new();
        for row in rows.iter_mut() {
            let cluster = match self.cluster_of(row.store) {
                Some(cluster) => cluster,
                None => {
                    unmapped_rows += 1;
                    unmapped_stores.insert(row.store);
                    UNMAPPED_CLUSTER
                }
            };
            row.cluster = Some(cluster);
        }

        if unmapped_rows > 0 {
            warn!(
                component = "clusters",
                event = "clusters.unmapped_stores",
                rows = unmapped_rows,
                stores = ?unmapped_stores,
                cluster = UNMAPPED_CLUSTER
            );
        }
        unmapped_rows
    }
}

pub fn load_cluster_mapping(path: &Path) -> ClusterAssignment {
    match ClusterAssignment::from_path(path) {
        Ok(mapping) => {
            log_artifact_source("cluster_mapping", Some(path), None);
            mapping
        }
        Err(err) => {
            let reason = err.to_string();
            log_artifact_source("cluster_mapping", Some(path), Some(&reason));
            ClusterAssignment::round_robin(DEFAULT_STORE_COUNT, DEFAULT_CLUSTER_COUNT)
        }
    }
}

fn integer_cell(raw: Option<&str>, row: usize, column: &str) -> Result<u32, ClusterMappingError> {
    let raw = raw.unwrap_or_default();
    parse_number(raw)
        .filter(|value| value.fract() == 0.0 && *value >= 0.0 && *value <= u32::MAX as f64)
        .map(|value| value as u32)
        .ok_or_else(|| ClusterMappingError::InvalidRow {
            row,
            reason: format!("invalid {column} '{raw}'"),
        })
}
