use super::record::LineRecord;
use crate::analysis::{ScopeSummary, UNKNOWN_PROTOCOL};
use crate::features::metrics::stats::{mean, percentile, sorted};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Running per-protocol tallies.
#[derive(Default)]
struct ProtocolTally {
    lines: usize,
    speeds: Vec<f64>,
    stalls: usize,
    errors: usize,
    partials: usize,
}

fn rate(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let ordered = sorted(values);
    ordered[ordered.len() / 2]
}

fn rates(counts: &BTreeMap<String, usize>, total: usize) -> BTreeMap<String, f64> {
    counts
        .iter()
        .map(|(key, count)| (key.clone(), rate(*count, total)))
        .collect()
}

/// Share of `event` attributed to each protocol; protocols without a single
/// occurrence are left out and the map is empty when nothing happened.
fn shares(
    tallies: &BTreeMap<String, ProtocolTally>,
    event: impl Fn(&ProtocolTally) -> usize,
) -> BTreeMap<String, f64> {
    let total: usize = tallies.values().map(&event).sum();
    if total == 0 {
        return BTreeMap::new();
    }
    tallies
        .iter()
        .filter(|(_, tally)| event(tally) > 0)
        .map(|(key, tally)| (key.clone(), rate(event(tally), total)))
        .collect()
}

pub(super) fn summarize(records: &[&LineRecord]) -> ScopeSummary {
    let lines = records.len();
    let mut speeds = Vec::new();
    let mut ttfbs = Vec::new();
    let mut bytes = Vec::new();
    let mut firsts = Vec::new();
    let (mut p50s, mut p90s, mut p95s, mut p99s, mut ratios) =
        (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());
    let (mut plateau_counts, mut longest, mut jitters, mut slopes, mut coef_vars) =
        (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());
    let (mut head_get_ratios, mut dns, mut dns_legacy, mut connects, mut tls) =
        (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());
    let mut stall_elapsed = Vec::new();
    let (mut micro_ms, mut micro_counts) = (Vec::new(), Vec::new());

    let mut cache = 0;
    let mut proxy = 0;
    let mut enterprise = 0;
    let mut server_proxy = 0;
    let mut ip_mismatch = 0;
    let mut prefetch = 0;
    let mut warm_cache = 0;
    let mut reused = 0;
    let mut plateau_stable = 0;
    let mut errors = 0;
    let mut stalls = 0;
    let mut pre_ttfb = 0;
    let mut partials = 0;
    let mut chunked = 0;
    let mut micro_lines = 0;
    let (mut sample_ms, mut low_speed_ms) = (0i64, 0i64);

    let mut protocols: BTreeMap<String, ProtocolTally> = BTreeMap::new();
    let mut tls_versions: BTreeMap<String, usize> = BTreeMap::new();
    let mut alpns: BTreeMap<String, usize> = BTreeMap::new();
    let mut first_ts: Option<DateTime<Utc>> = None;
    let mut last_ts: Option<DateTime<Utc>> = None;

    let push = |values: &mut Vec<f64>, value: f64| {
        if value > 0.0 {
            values.push(value);
        }
    };
    for record in records {
        if let Some(ts) = record.timestamp {
            first_ts = Some(first_ts.map_or(ts, |current| current.min(ts)));
            last_ts = Some(last_ts.map_or(ts, |current| current.max(ts)));
        }
        push(&mut speeds, record.speed);
        push(&mut ttfbs, record.ttfb);
        push(&mut bytes, record.bytes);
        push(&mut firsts, record.first_rtt);
        push(&mut p50s, record.p50);
        push(&mut p90s, record.p90);
        push(&mut p95s, record.p95);
        push(&mut p99s, record.p99);
        if record.p50 > 0.0 && record.p99 > 0.0 {
            ratios.push(record.p99 / record.p50);
        }
        push(&mut plateau_counts, record.plateau_count);
        push(&mut longest, record.longest_plateau);
        push(&mut jitters, record.jitter_pct);
        if record.slope != 0.0 {
            slopes.push(record.slope);
        }
        push(&mut coef_vars, record.coef_var_pct);
        push(&mut head_get_ratios, record.head_get_ratio);
        push(&mut dns, record.dns_ms);
        push(&mut dns_legacy, record.dns_legacy_ms);
        push(&mut connects, record.connect_ms);
        push(&mut tls, record.tls_ms);

        cache += usize::from(record.cache_present);
        proxy += usize::from(record.proxy_suspected);
        enterprise += usize::from(record.enterprise_proxy);
        server_proxy += usize::from(record.proxy_suspected && !record.enterprise_proxy);
        ip_mismatch += usize::from(record.ip_mismatch);
        prefetch += usize::from(record.prefetch_suspected);
        warm_cache += usize::from(record.warm_cache_suspected);
        reused += usize::from(record.conn_reused);
        plateau_stable += usize::from(record.plateau_stable);
        errors += usize::from(record.has_error);
        pre_ttfb += usize::from(record.pre_ttfb_stall);
        partials += usize::from(record.partial_body);
        chunked += usize::from(record.chunked);
        if record.stalled {
            stalls += 1;
            if record.stall_elapsed_ms > 0.0 {
                stall_elapsed.push(record.stall_elapsed_ms);
            }
        }
        if record.micro_stalls > 0 {
            micro_lines += 1;
            micro_ms.push(record.micro_stall_ms as f64);
            micro_counts.push(record.micro_stalls as f64);
        }
        sample_ms += record.sample_ms;
        low_speed_ms += record.low_speed_ms;

        let key = if record.http_protocol.is_empty() {
            UNKNOWN_PROTOCOL.to_string()
        } else {
            record.http_protocol.clone()
        };
        let tally = protocols.entry(key).or_default();
        tally.lines += 1;
        if record.speed > 0.0 {
            tally.speeds.push(record.speed);
        }
        tally.stalls += usize::from(record.stalled);
        tally.errors += usize::from(record.has_error);
        tally.partials += usize::from(record.partial_body);

        if !record.tls_version.is_empty() {
            *tls_versions.entry(record.tls_version.clone()).or_default() += 1;
        }
        if !record.alpn.is_empty() {
            *alpns.entry(record.alpn.clone()).or_default() += 1;
        }
    }

    let speed_sorted = sorted(&speeds);
    let ttfb_sorted = sorted(&ttfbs);
    let protocol_counts: BTreeMap<String, usize> = protocols
        .iter()
        .map(|(key, tally)| (key.clone(), tally.lines))
        .collect();
    let per_protocol = |value: &dyn Fn(&ProtocolTally) -> f64| -> BTreeMap<String, f64> {
        protocols
            .iter()
            .map(|(key, tally)| (key.clone(), value(tally)))
            .collect()
    };

    ScopeSummary {
        lines,
        avg_speed: mean(&speeds),
        median_speed: median(&speeds),
        avg_ttfb: mean(&ttfbs),
        avg_bytes: mean(&bytes),
        error_lines: errors,
        avg_first_rtt_goodput: mean(&firsts),
        avg_p50_speed: mean(&p50s),
        avg_p90_speed: mean(&p90s),
        avg_p95_speed: mean(&p95s),
        avg_p99_speed: mean(&p99s),
        avg_p99_p50_ratio: mean(&ratios),
        avg_plateau_count: mean(&plateau_counts),
        avg_longest_plateau: mean(&longest),
        avg_jitter_pct: mean(&jitters),
        avg_slope_kbps_per_sec: mean(&slopes),
        avg_coef_variation_pct: mean(&coef_vars),
        batch_duration_ms: match (first_ts, last_ts) {
            (Some(first), Some(last)) if last > first => (last - first).num_milliseconds(),
            _ => 0,
        },

        speed_p25_kbps: percentile(&speed_sorted, 25.0),
        speed_p50_kbps: percentile(&speed_sorted, 50.0),
        speed_p75_kbps: percentile(&speed_sorted, 75.0),
        speed_p90_kbps: percentile(&speed_sorted, 90.0),
        speed_p95_kbps: percentile(&speed_sorted, 95.0),
        speed_p99_kbps: percentile(&speed_sorted, 99.0),
        ttfb_p25_ms: percentile(&ttfb_sorted, 25.0),
        ttfb_p50_ms: percentile(&ttfb_sorted, 50.0),
        ttfb_p75_ms: percentile(&ttfb_sorted, 75.0),
        ttfb_p90_ms: percentile(&ttfb_sorted, 90.0),
        ttfb_p95_ms: percentile(&ttfb_sorted, 95.0),
        ttfb_p99_ms: percentile(&ttfb_sorted, 99.0),

        avg_dns_ms: mean(&dns),
        avg_dns_legacy_ms: mean(&dns_legacy),
        avg_connect_ms: mean(&connects),
        avg_tls_handshake: mean(&tls),
        avg_head_get_time_ratio: mean(&head_get_ratios),

        cache_hit_rate_pct: rate(cache, lines),
        proxy_suspected_rate_pct: rate(proxy, lines),
        enterprise_proxy_rate_pct: rate(enterprise, lines),
        server_proxy_rate_pct: rate(server_proxy, lines),
        ip_mismatch_rate_pct: rate(ip_mismatch, lines),
        prefetch_suspected_rate_pct: rate(prefetch, lines),
        warm_cache_suspected_rate_pct: rate(warm_cache, lines),
        conn_reuse_rate_pct: rate(reused, lines),
        plateau_stable_rate_pct: rate(plateau_stable, lines),

        stall_rate_pct: rate(stalls, lines),
        avg_stall_elapsed_ms: mean(&stall_elapsed),
        pre_ttfb_stall_rate_pct: rate(pre_ttfb, lines),
        partial_body_rate_pct: rate(partials, lines),
        chunked_rate_pct: rate(chunked, lines),
        low_speed_time_share_pct: if sample_ms > 0 {
            low_speed_ms as f64 / sample_ms as f64 * 100.0
        } else {
            0.0
        },
        micro_stall_rate_pct: rate(micro_lines, lines),
        avg_micro_stall_ms: mean(&micro_ms),
        avg_micro_stall_count: mean(&micro_counts),

        http_protocol_rate_pct: rates(&protocol_counts, lines),
        http_protocol_counts: protocol_counts,
        avg_speed_by_http_protocol_kbps: per_protocol(&|tally| mean(&tally.speeds)),
        stall_rate_by_http_protocol_pct: per_protocol(&|tally| rate(tally.stalls, tally.lines)),
        error_rate_by_http_protocol_pct: per_protocol(&|tally| rate(tally.errors, tally.lines)),
        partial_body_rate_by_http_protocol_pct: per_protocol(&|tally| {
            rate(tally.partials, tally.lines)
        }),
        stall_share_by_http_protocol_pct: shares(&protocols, |tally| tally.stalls),
        error_share_by_http_protocol_pct: shares(&protocols, |tally| tally.errors),
        partial_share_by_http_protocol_pct: shares(&protocols, |tally| tally.partials),
        tls_version_rate_pct: rates(&tls_versions, lines),
        tls_version_counts: tls_versions,
        alpn_rate_pct: rates(&alpns, lines),
        alpn_counts: alpns,
    }
}
