//! Row-count anomaly policy shared by the file and warehouse validators.

use crate::types::DateAnomaly;
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Median of a count distribution. Even-sized inputs average the middle pair.
pub fn median(counts: &[u64]) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    let mut sorted = counts.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    }
}

/// Flag every date whose count is below half or above twice the median.
pub fn date_count_anomalies(rows_per_date: &BTreeMap<NaiveDate, u64>) -> Vec<DateAnomaly> {
    let counts: Vec<u64> = rows_per_date.values().copied().collect();
    let m = median(&counts);
    if m <= 0.0 {
        return Vec::new();
    }
    rows_per_date
        .iter()
        .filter(|(_, &c)| (c as f64) < 0.5 * m || (c as f64) > 2.0 * m)
        .map(|(&date, &count)| DateAnomaly {
            date,
            count,
            ratio: count as f64 / m,
        })
        .collect()
}
