use std::cmp::Ordering;

pub(crate) fn sort_values(values: &mut [f64]) {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
}

pub(crate) fn sorted(values: &[f64]) -> Vec<f64> {
    let mut copy = values.to_vec();
    sort_values(&mut copy);
    copy
}

/// Nearest-rank percentile over an already sorted slice, `pct` in 0..=100.
pub(crate) fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let last = sorted.len() - 1;
    let rank = (pct / 100.0) * last as f64 + 0.5;
    let idx = if rank <= 0.0 {
        0
    } else {
        (rank as usize).min(last)
    };
    sorted[idx]
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub(crate) fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance_sum: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (variance_sum / values.len() as f64).sqrt()
}

pub(crate) fn coef_variation(stddev: f64, mean: f64) -> f64 {
    if mean > 0.0 { stddev / mean } else { 0.0 }
}

/// Ordinary least squares slope of `y` over `x`.
pub(crate) fn slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (x, y) in points {
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }
    let den = n * sum_x2 - sum_x * sum_x;
    if den == 0.0 {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / den
}

/// Mean of `|v - prev| / prev` across consecutive values, as a fraction.
pub(crate) fn jitter_mean_abs_rel(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let total: f64 = values
        .windows(2)
        .filter(|pair| pair[0] > 0.0)
        .map(|pair| (pair[1] - pair[0]).abs() / pair[0])
        .sum();
    total / (values.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::{coef_variation, jitter_mean_abs_rel, mean, percentile, slope, sorted, stddev};

    #[test]
    fn percentile_extremes_match_min_and_max() {
        let values = sorted(&[42.0, 7.0, 19.5, 3.0, 88.0, 61.0]);
        assert_eq!(percentile(&values, 0.0), 3.0);
        assert_eq!(percentile(&values, 100.0), 88.0);
    }

    #[test]
    fn percentile_is_monotonic() {
        let values = sorted(&[5.0, 1.0, 9.0, 2.0, 7.0, 3.0, 8.0, 4.0, 6.0, 10.0, 11.0]);
        let mut previous = f64::MIN;
        for pct in 0..=100 {
            let value = percentile(&values, pct as f64);
            assert!(value >= previous, "p{pct} went backwards");
            previous = value;
        }
    }

    #[test]
    fn percentile_of_empty_is_zero() {
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn population_stddev_and_cov() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let m = mean(&values);
        assert_eq!(m, 5.0);
        assert_eq!(stddev(&values, m), 2.0);
        assert_eq!(coef_variation(2.0, 5.0), 0.4);
        assert_eq!(coef_variation(2.0, 0.0), 0.0);
    }

    #[test]
    fn slope_of_linear_ramp() {
        let points = [(0.0, 100.0), (1.0, 200.0), (2.0, 300.0)];
        assert!((slope(&points) - 100.0).abs() < 1e-9);
        assert_eq!(slope(&[(1.0, 5.0)]), 0.0);
    }

    #[test]
    fn jitter_is_mean_relative_change() {
        let jitter = jitter_mean_abs_rel(&[100.0, 110.0, 99.0]);
        assert!((jitter - 0.1).abs() < 1e-9);
    }
}
