//! Advisory per-store date gap scan. Never blocks the pipeline.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::table::RawObservation;

/// Returns one warning per store that has fewer than two observations or at
/// least one gap between consecutive dates longer than `max_gap_days`. An
/// empty result means every series is continuous.
pub fn check_temporal_continuity(observations: &[RawObservation], max_gap_days: i64) -> Vec<String> {
    let mut dates_by_store: BTreeMap<u32, Vec<NaiveDate>> = BTreeMap::new();
    for obs in observations {
        dates_by_store.entry(obs.store).or_default().push(obs.date);
    }

    let mut warnings = Vec::new();
    for (store, mut dates) in dates_by_store {
        if dates.len() < 2 {
            warnings.push(format!(
                "Store {store}: only {} observation(s)",
                dates.len()
            ));
            continue;
        }

        dates.sort_unstable();
        let gaps: Vec<i64> = dates
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).num_days())
            .filter(|days| *days > max_gap_days)
            .collect();

        if let Some(max_gap) = gaps.iter().copied().max() {
            warn!(
                component = "continuity",
                event = "continuity.gap_detected",
                store,
                gap_count = gaps.len(),
                max_gap_days = max_gap
            );
            warnings.push(format!(
                "Store {store}: {} gap(s) detected (max: {max_gap} days)",
                gaps.len()
            ));
        }
    }

    info!(
        component = "continuity",
        event = "continuity.finish",
        threshold_days = max_gap_days,
        warnings = warnings.len()
    );

    warnings
}
