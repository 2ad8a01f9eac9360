use super::stats::{coef_variation, jitter_mean_abs_rel, mean, percentile, slope, sorted, stddev};
use crate::model::{PlateauSegment, SpeedAnalysis, SpeedSample};

const PLATEAU_BAND: f64 = 0.10;
const PLATEAU_MIN_SAMPLES: usize = 3;
const PLATEAU_STABLE_COV: f64 = 0.15;
const QUALITY_MIN_SAMPLES: usize = 8;
const QUALITY_MIN_DURATION_MS: i64 = 800;
const QUALITY_MAX_MOE_PCT: f64 = 10.0;
const Z_95: f64 = 1.96;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeasurementQuality {
    pub sample_count: usize,
    pub ci95_rel_moe_pct: f64,
    pub required_samples_for_10pct_95ci: usize,
    pub quality_good: bool,
}

/// Confidence-interval judgment of whether the mean speed is trustworthy.
pub fn compute_measurement_quality(samples: &[SpeedSample]) -> MeasurementQuality {
    let n = samples.len();
    if n == 0 {
        return MeasurementQuality::default();
    }
    let duration_ms = samples[n - 1].time_ms - samples[0].time_ms;
    let speeds: Vec<f64> = samples.iter().map(|s| s.speed_kbps).collect();
    let avg = mean(&speeds);
    if avg <= 0.0 {
        return MeasurementQuality {
            sample_count: n,
            ..MeasurementQuality::default()
        };
    }
    let std = if n > 1 { stddev(&speeds, avg) } else { 0.0 };
    let cv = coef_variation(std, avg);
    let ci95 = Z_95 * cv / (n as f64).sqrt() * 100.0;
    let required = if cv > 0.0 {
        (Z_95 * cv / 0.10).powi(2).ceil() as usize
    } else {
        0
    };
    let quality_good = n >= QUALITY_MIN_SAMPLES
        && duration_ms >= QUALITY_MIN_DURATION_MS
        && ci95 > 0.0
        && ci95 <= QUALITY_MAX_MOE_PCT;

    MeasurementQuality {
        sample_count: n,
        ci95_rel_moe_pct: ci95,
        required_samples_for_10pct_95ci: required,
        quality_good,
    }
}

pub fn analyze_speed_samples(samples: &[SpeedSample]) -> SpeedAnalysis {
    let speeds: Vec<f64> = samples.iter().map(|s| s.speed_kbps).collect();
    if speeds.is_empty() {
        return SpeedAnalysis::default();
    }

    let avg = mean(&speeds);
    let std = stddev(&speeds, avg);
    let cov = coef_variation(std, avg);
    let ordered = sorted(&speeds);
    let points: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| (s.time_ms as f64 / 1000.0, s.speed_kbps))
        .collect();

    let mut analysis = SpeedAnalysis {
        average_kbps: avg,
        stddev_kbps: std,
        coef_variation: cov,
        min_kbps: ordered[0],
        max_kbps: ordered[ordered.len() - 1],
        p50_kbps: percentile(&ordered, 50.0),
        p90_kbps: percentile(&ordered, 90.0),
        p95_kbps: percentile(&ordered, 95.0),
        p99_kbps: percentile(&ordered, 99.0),
        slope_kbps_per_sec: slope(&points),
        jitter_mean_abs_pct: jitter_mean_abs_rel(&speeds),
        patterns: detect_patterns(&speeds, avg, std),
        ..SpeedAnalysis::default()
    };

    if speeds.len() > 2 && analysis.p50_kbps > 0.0 && cov > 0.0 {
        analysis.plateau_segments = detect_plateaus(samples, analysis.p50_kbps);
        analysis.plateau_count = analysis.plateau_segments.len();
        analysis.longest_plateau_ms = analysis
            .plateau_segments
            .iter()
            .map(|seg| seg.duration_ms)
            .max()
            .unwrap_or(0);
        analysis.plateau_stable = analysis.plateau_count > 0 && cov < PLATEAU_STABLE_COV;
    }

    let quality = compute_measurement_quality(samples);
    analysis.sample_count = quality.sample_count;
    analysis.ci95_rel_moe_pct = quality.ci95_rel_moe_pct;
    analysis.required_samples_for_10pct_95ci = quality.required_samples_for_10pct_95ci;
    analysis.quality_good = quality.quality_good;
    analysis.insights = build_insights(&analysis);
    analysis
}

/// Shape labels evaluated over the speeds in arrival order.
fn detect_patterns(speeds: &[f64], avg: f64, std: f64) -> Vec<String> {
    let mut patterns = Vec::new();
    let n = speeds.len();
    if n <= 2 {
        return patterns;
    }
    let first = speeds[0];
    let last = speeds[n - 1];
    let max = speeds.iter().copied().fold(f64::MIN, f64::max);

    let mut push = |label: &str| patterns.push(label.to_string());
    if max > 0.0 && first < 0.5 * max {
        push("slow start until max speed");
    }
    if max > 0.0 && last < 0.5 * max {
        push("good speed at begin but slow in the end");
    }
    if avg > 0.0 && std > 0.5 * avg {
        push("highly volatile speed measurement over whole window");
    }
    if avg > 0.0 && std < 0.1 * avg {
        push("stable speed throughout transfer");
    }
    if max > 0.0 && first > 0.8 * max {
        push("fast start, reaches max speed quickly");
    }
    if max > 0.0 && last > 0.8 * max {
        push("fast end, maintains speed until finish");
    }
    if n > 5 {
        let mid = speeds[n / 2];
        if mid < 0.5 * max && first > 0.7 * max && last > 0.7 * max {
            push("mid-transfer dip: speed drops in the middle");
        }
        if first < 0.5 * max && mid > 0.8 * max {
            push("slow start, then speed recovers mid-transfer");
        }
        if speeds.windows(2).all(|w| w[1] <= w[0]) && first > last {
            push("gradual decline: speed decreases throughout transfer");
        }
        if speeds.windows(2).all(|w| w[1] >= w[0]) && last > first {
            push("gradual increase: speed increases throughout transfer");
        }
    }
    patterns
}

/// Maximal runs of samples within 10% of the median speed.
fn detect_plateaus(samples: &[SpeedSample], p50: f64) -> Vec<PlateauSegment> {
    let threshold = PLATEAU_BAND * p50;
    let mut segments = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut run_sum = 0.0;

    let mut close_run = |start: usize, end_exclusive: usize, sum: f64| {
        let len = end_exclusive - start;
        if len >= PLATEAU_MIN_SAMPLES {
            let start_ms = samples[start].time_ms;
            let end_ms = samples[end_exclusive - 1].time_ms;
            segments.push(PlateauSegment {
                start_ms,
                end_ms,
                duration_ms: end_ms - start_ms,
                avg_kbps: sum / len as f64,
            });
        }
    };

    for (i, sample) in samples.iter().enumerate() {
        if (sample.speed_kbps - p50).abs() <= threshold {
            if run_start.is_none() {
                run_start = Some(i);
                run_sum = 0.0;
            }
            run_sum += sample.speed_kbps;
        } else if let Some(start) = run_start.take() {
            close_run(start, i, run_sum);
        }
    }
    if let Some(start) = run_start {
        close_run(start, samples.len(), run_sum);
    }
    segments
}

fn build_insights(a: &SpeedAnalysis) -> Vec<String> {
    let mut insights = Vec::new();
    if a.p50_kbps > 0.0 && a.p99_kbps > 0.0 {
        let ratio = a.p99_kbps / a.p50_kbps;
        let label = if ratio < 1.2 {
            "very stable throughput"
        } else if ratio < 1.8 {
            "moderate variability"
        } else {
            "high variability"
        };
        insights.push(format!("Stability: p99/p50={ratio:.2} -> {label}"));
    }
    if a.p50_kbps > 0.0 && a.p90_kbps >= a.p50_kbps {
        let gap = (a.p90_kbps - a.p50_kbps) / a.p50_kbps * 100.0;
        insights.push(format!("Headroom: p90 is {gap:.1}% above median"));
    }
    if a.p95_kbps > 0.0 && a.p99_kbps >= a.p95_kbps {
        let spike = a.p99_kbps / a.p95_kbps;
        if spike > 1.2 {
            insights.push(format!("Rare high spikes: p99 {spike:.2}x p95"));
        } else {
            insights.push("Tail spikes minimal (p99 close to p95)".to_string());
        }
    }
    let slope = a.slope_kbps_per_sec;
    if slope != 0.0 {
        if slope.abs() < 0.05 * a.average_kbps {
            insights.push(format!("Slope ~{slope:.1} kbps/s: plateau early"));
        } else if slope > 0.0 {
            insights.push(format!("Positive ramp: +{slope:.1} kbps/s (throughput building)"));
        } else {
            insights.push(format!("Negative ramp: {slope:.1} kbps/s (declining throughput)"));
        }
    }
    if a.jitter_mean_abs_pct > 0.0 {
        let pct = a.jitter_mean_abs_pct * 100.0;
        let label = if pct < 5.0 {
            "very low jitter"
        } else if pct < 15.0 {
            "moderate jitter"
        } else {
            "high jitter"
        };
        insights.push(format!("Jitter: mean abs change {pct:.1}% -> {label}"));
    }
    if a.coef_variation > 0.0 {
        insights.push(format!("Variation: CoV {:.1}%", a.coef_variation * 100.0));
    }
    if !a.patterns.is_empty() {
        let shown: Vec<&str> = a.patterns.iter().take(5).map(String::as_str).collect();
        insights.push(format!("Patterns: {}", shown.join(", ")));
    }
    if a.plateau_count > 0 {
        let suffix = if a.plateau_stable { ", stable" } else { "" };
        insights.push(format!(
            "Plateaus: {} (longest {} ms){suffix}",
            a.plateau_count, a.longest_plateau_ms
        ));
    }
    insights
}
