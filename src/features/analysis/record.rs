use super::reasons::normalize_error_reason_detailed;
use crate::config::SPEED_SAMPLE_INTERVAL;
use crate::model::{ResultEnvelope, SpeedSample};
use crate::probe::ENTERPRISE_PROXIES;
use chrono::{DateTime, Utc};

/// Per-line thresholds fixed for one analysis run.
#[derive(Clone, Copy, Debug)]
pub(super) struct LineRules {
    pub low_speed_threshold_kbps: f64,
    pub micro_stall_min_gap_ms: i64,
}

/// Compact projection of one telemetry line. Only what aggregation reads
/// is kept, so large files do not hold full envelopes in memory.
#[derive(Clone, Debug, Default)]
pub(super) struct LineRecord {
    pub run_tag: String,
    pub situation: String,
    pub ip_family: String,
    pub url: String,
    pub timestamp: Option<DateTime<Utc>>,

    pub speed: f64,
    pub ttfb: f64,
    pub bytes: f64,
    pub first_rtt: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub plateau_count: f64,
    pub longest_plateau: f64,
    pub jitter_pct: f64,
    pub slope: f64,
    pub coef_var_pct: f64,
    pub head_get_ratio: f64,
    pub plateau_stable: bool,

    pub dns_ms: f64,
    pub dns_legacy_ms: f64,
    pub connect_ms: f64,
    pub tls_ms: f64,

    pub cache_present: bool,
    pub proxy_suspected: bool,
    pub enterprise_proxy: bool,
    pub ip_mismatch: bool,
    pub prefetch_suspected: bool,
    pub warm_cache_suspected: bool,
    pub conn_reused: bool,
    pub has_error: bool,
    pub error_reason: String,
    pub stalled: bool,
    pub stall_elapsed_ms: f64,
    pub pre_ttfb_stall: bool,
    pub partial_body: bool,
    pub chunked: bool,

    pub http_protocol: String,
    pub tls_version: String,
    pub alpn: String,

    pub proxy_name: String,
    pub using_env_proxy: bool,
    pub dns_server: String,
    pub dns_server_network: String,
    pub next_hop: String,
    pub next_hop_source: String,

    pub sample_ms: i64,
    pub low_speed_ms: i64,
    pub micro_stalls: usize,
    pub micro_stall_ms: i64,
}

fn positive(value: Option<i64>) -> f64 {
    value.filter(|v| *v > 0).map(|v| v as f64).unwrap_or(0.0)
}

fn first_positive(candidates: &[Option<i64>]) -> f64 {
    candidates
        .iter()
        .copied()
        .map(positive)
        .find(|v| *v > 0.0)
        .unwrap_or(0.0)
}

impl LineRecord {
    /// `raw` is the undecoded line; error presence is a substring match on it.
    pub fn from_envelope(envelope: ResultEnvelope, raw: &[u8], rules: LineRules) -> Option<Self> {
        let meta = envelope.meta?;
        let sr = envelope.site_result?;

        let mut record = LineRecord {
            run_tag: meta.run_tag,
            situation: meta.situation,
            timestamp: DateTime::parse_from_rfc3339(&meta.timestamp_utc)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            speed: sr.transfer_speed_kbps.unwrap_or(0.0),
            ttfb: positive(sr.trace_ttfb_ms),
            bytes: positive(sr.transfer_size_bytes),
            first_rtt: sr.first_rtt_goodput_kbps.unwrap_or(0.0),
            head_get_ratio: sr.head_get_time_ratio.unwrap_or(0.0),
            dns_ms: first_positive(&[sr.trace_dns_ms, sr.dns_time_ms]),
            dns_legacy_ms: positive(sr.dns_time_ms),
            connect_ms: first_positive(&[
                sr.trace_connect_ms,
                sr.tcp_time_ms,
                sr.http_connect_time_ms,
            ]),
            tls_ms: first_positive(&[sr.trace_tls_ms, sr.ssl_handshake_time_ms]),
            cache_present: sr.cache_present,
            proxy_suspected: sr.proxy_suspected,
            enterprise_proxy: ENTERPRISE_PROXIES.contains(&sr.proxy_name.as_str()),
            ip_mismatch: sr.ip_mismatch,
            prefetch_suspected: sr.prefetch_suspected,
            warm_cache_suspected: sr.warm_cache_suspected,
            conn_reused: sr.connection_reused_second_get,
            has_error: contains(raw, b"tcp_error") || contains(raw, b"http_error"),
            stalled: sr.transfer_stalled,
            stall_elapsed_ms: positive(sr.stall_elapsed_ms),
            pre_ttfb_stall: sr.http_error.contains("stall_pre_ttfb"),
            partial_body: sr.content_length_mismatch || sr.http_error.starts_with("partial_body"),
            chunked: sr.chunked,
            ..LineRecord::default()
        };

        if let Some(analysis) = &sr.speed_analysis {
            record.p50 = analysis.p50_kbps;
            record.p90 = analysis.p90_kbps;
            record.p95 = analysis.p95_kbps;
            record.p99 = analysis.p99_kbps.max(0.0);
            record.plateau_count = analysis.plateau_count as f64;
            record.longest_plateau = analysis.longest_plateau_ms as f64;
            record.jitter_pct = analysis.jitter_mean_abs_pct.max(0.0) * 100.0;
            record.slope = analysis.slope_kbps_per_sec;
            record.coef_var_pct = analysis.coef_variation.max(0.0) * 100.0;
            record.plateau_stable = analysis.plateau_stable;
        }

        let threshold = rules.low_speed_threshold_kbps;
        let interval = SPEED_SAMPLE_INTERVAL.as_millis() as i64;
        record.sample_ms = sr.transfer_speed_samples.len() as i64 * interval;
        record.low_speed_ms = sr
            .transfer_speed_samples
            .iter()
            .filter(|sample| sample.speed_kbps < threshold)
            .count() as i64
            * interval;
        let (count, total) = micro_stalls(&sr.transfer_speed_samples, rules.micro_stall_min_gap_ms);
        record.micro_stalls = count;
        record.micro_stall_ms = total;

        record.error_reason = if !sr.tcp_error.is_empty() {
            normalize_error_reason_detailed(&sr.tcp_error, sr.head_status.unwrap_or(0), "tcp")
        } else if !sr.ssl_error.is_empty() {
            normalize_error_reason_detailed(&sr.ssl_error, sr.head_status.unwrap_or(0), "tls")
        } else if !sr.http_error.is_empty() {
            normalize_error_reason_detailed(&sr.http_error, sr.head_status.unwrap_or(0), "http")
        } else {
            String::new()
        };

        record.ip_family = sr.ip_family;
        record.url = sr.url;
        record.http_protocol = sr.http_protocol;
        record.tls_version = sr.tls_version;
        record.alpn = sr.alpn;
        record.proxy_name = sr.proxy_name;
        record.using_env_proxy = sr.using_env_proxy;
        record.dns_server = sr.dns_server;
        record.dns_server_network = sr.dns_server_network;
        record.next_hop = sr.next_hop;
        record.next_hop_source = sr.next_hop_source;
        Some(record)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Runs of samples whose cumulative byte count does not grow. A run spans
/// from the last sample that made progress to its last flat sample and
/// counts when that span reaches `min_gap_ms`. Returns (count, total ms).
pub(super) fn micro_stalls(samples: &[SpeedSample], min_gap_ms: i64) -> (usize, i64) {
    let mut count = 0;
    let mut total = 0;
    let mut run_start: Option<i64> = None;
    let mut run_end = 0;
    for pair in samples.windows(2) {
        let (prev, current) = (&pair[0], &pair[1]);
        if current.bytes <= prev.bytes {
            run_start.get_or_insert(prev.time_ms);
            run_end = current.time_ms;
            continue;
        }
        if let Some(start) = run_start.take() {
            let span = run_end - start;
            if span >= min_gap_ms {
                count += 1;
                total += span;
            }
        }
    }
    if let Some(start) = run_start {
        let span = run_end - start;
        if span >= min_gap_ms {
            count += 1;
            total += span;
        }
    }
    (count, total)
}
