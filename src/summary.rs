//! Descriptive statistics over a forecast. An empty forecast has `count` zero
//! and NaN for every float.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::history::{mean, median, sample_std};
use crate::predictor::PredictionRow;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
    pub total: f64,
    pub unique_stores: usize,
    pub unique_dates: usize,
}

pub fn summarize(predictions: &[PredictionRow]) -> SummaryStats {
    if predictions.is_empty() {
        return SummaryStats {
            count: 0,
            mean: f64::NAN,
            median: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            std: f64::NAN,
            total: f64::NAN,
            unique_stores: 0,
            unique_dates: 0,
        };
    }

    let mut values: Vec<f64> = predictions.iter().map(|p| p.predicted_sales).collect();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    SummaryStats {
        count: values.len(),
        mean: mean(&values),
        std: sample_std(&values),
        total: values.iter().sum(),
        min,
        max,
        median: median(&mut values),
        unique_stores: predictions.iter().map(|p| p.store).collect::<BTreeSet<_>>().len(),
        unique_dates: predictions.iter().map(|p| p.date).collect::<BTreeSet<_>>().len(),
    }
}
