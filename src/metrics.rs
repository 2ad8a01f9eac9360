//! Transfer speed statistics shared by the probe engine and reporting code.

pub use crate::features::metrics::{
    MeasurementQuality, analyze_speed_samples, compute_measurement_quality,
};

use crate::features::metrics::stats;

/// Nearest-rank percentile of unsorted `values`, `pct` in 0..=100.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    stats::percentile(&stats::sorted(values), pct)
}

#[cfg(test)]
mod tests {
    use super::percentile;

    #[test]
    fn percentile_sorts_its_input() {
        let values = [150.0, 50.0, 100.0];
        assert_eq!(percentile(&values, 50.0), 100.0);
        assert_eq!(percentile(&values, 0.0), 50.0);
        assert_eq!(percentile(&values, 100.0), 150.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
