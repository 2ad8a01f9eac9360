use super::record::{LineRules, micro_stalls};
use super::{
    LineFilter, analyze_recent_results, analyze_recent_results_full,
    analyze_recent_results_full_with_options, compare_last_vs_previous, debug_summary_line,
    read_records,
};
use crate::analysis::{AnalysisError, AnalyzeOptions, BatchSummary, UNKNOWN_PROTOCOL};
use crate::model::SpeedSample;
use serde_json::{Value, json};
use std::io::{Cursor, Write};
use std::path::Path;
use tempfile::NamedTempFile;

const SCHEMA: u32 = 3;

fn line_with(tag: &str, situation: &str, schema: u32, site: Value) -> String {
    json!({
        "meta": {
            "timestamp_utc": "2025-03-01T10:00:00Z",
            "schema_version": schema,
            "run_tag": tag,
            "situation": situation,
        },
        "site_result": site,
    })
    .to_string()
}

fn line(tag: &str, site: Value) -> String {
    line_with(tag, "", SCHEMA, site)
}

fn results_file(lines: &[String]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    for line in lines {
        writeln!(file, "{line}").expect("write line");
    }
    file.flush().expect("flush");
    file
}

fn analyze(lines: &[String]) -> Vec<BatchSummary> {
    let file = results_file(lines);
    analyze_recent_results(file.path(), SCHEMA, 10).expect("analysis")
}

fn single(lines: &[String]) -> BatchSummary {
    let mut batches = analyze(lines);
    assert_eq!(batches.len(), 1);
    batches.remove(0)
}

fn samples(points: &[(i64, i64, f64)]) -> Value {
    let samples: Vec<Value> = points
        .iter()
        .map(|(time_ms, bytes, speed_kbps)| {
            json!({"time_ms": time_ms, "bytes": bytes, "speed_kbps": speed_kbps})
        })
        .collect();
    Value::Array(samples)
}

fn approx(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn stall_rate_and_average_elapsed() {
    let batch = single(&[
        line(
            "B1",
            json!({"transfer_speed_kbps": 800.0, "transfer_stalled": true, "stall_elapsed_ms": 750}),
        ),
        line("B1", json!({"transfer_speed_kbps": 1200.0})),
    ]);
    approx(batch.overall.stall_rate_pct, 50.0);
    approx(batch.overall.avg_stall_elapsed_ms, 750.0);
    approx(batch.overall.avg_speed, 1000.0);
}

#[test]
fn micro_stall_span_must_reach_min_gap() {
    let long_gap = samples(&[
        (100, 1000, 800.0),
        (200, 1000, 0.0),
        (400, 1000, 0.0),
        (700, 1000, 0.0),
        (800, 2000, 800.0),
    ]);
    let short_gap = samples(&[
        (100, 1000, 800.0),
        (300, 1000, 0.0),
        (500, 1000, 0.0),
        (600, 3000, 1600.0),
    ]);
    let batch = single(&[
        line("B1", json!({"transfer_speed_samples": long_gap})),
        line("B1", json!({"transfer_speed_samples": short_gap})),
    ]);
    approx(batch.overall.micro_stall_rate_pct, 50.0);
    approx(batch.overall.avg_micro_stall_ms, 600.0);
    approx(batch.overall.avg_micro_stall_count, 1.0);
}

#[test]
fn micro_stalls_counts_trailing_runs() {
    let points = [
        (0, 0),
        (100, 500),
        (200, 500),
        (300, 500),
        (400, 900),
        (500, 900),
        (1100, 900),
    ];
    let samples: Vec<SpeedSample> = points
        .iter()
        .map(|(time_ms, bytes)| SpeedSample {
            time_ms: *time_ms,
            bytes: *bytes,
            speed_kbps: 0.0,
        })
        .collect();
    assert_eq!(micro_stalls(&samples, 200), (2, 900));
    assert_eq!(micro_stalls(&samples, 500), (1, 700));
    assert_eq!(micro_stalls(&[], 500), (0, 0));
}

#[test]
fn low_speed_share_is_time_weighted() {
    let batch = single(&[
        line(
            "B1",
            json!({"transfer_speed_samples": samples(&[(100, 10, 500.0), (200, 20, 1500.0)])}),
        ),
        line(
            "B1",
            json!({"transfer_speed_samples": samples(&[
                (100, 10, 500.0),
                (200, 20, 500.0),
                (300, 30, 500.0),
                (400, 40, 500.0),
                (500, 90, 1500.0),
            ])}),
        ),
    ]);
    approx(batch.overall.low_speed_time_share_pct, 5.0 / 7.0 * 100.0);

    let file = results_file(&[line(
        "B1",
        json!({"transfer_speed_samples": samples(&[(100, 10, 500.0), (200, 20, 1500.0)])}),
    )]);
    let options = AnalyzeOptions {
        low_speed_threshold_kbps: 2000.0,
        ..AnalyzeOptions::default()
    };
    let batches =
        analyze_recent_results_full_with_options(file.path(), SCHEMA, 10, &options).expect("ok");
    approx(batches[0].overall.low_speed_time_share_pct, 100.0);
}

#[test]
fn protocol_mix_rates_and_shares() {
    let batch = single(&[
        line(
            "B1",
            json!({"http_protocol": "HTTP/2", "transfer_stalled": true, "transfer_speed_kbps": 900.0}),
        ),
        line(
            "B1",
            json!({"http_protocol": "HTTP/2", "http_error": "boom", "transfer_speed_kbps": 1100.0}),
        ),
        line(
            "B1",
            json!({"http_protocol": "HTTP/1.1", "transfer_stalled": true}),
        ),
        line("B1", json!({"transfer_speed_kbps": 400.0})),
    ]);
    let s = &batch.overall;
    assert_eq!(s.http_protocol_counts.get("HTTP/2"), Some(&2));
    assert_eq!(s.http_protocol_counts.get(UNKNOWN_PROTOCOL), Some(&1));
    approx(s.http_protocol_rate_pct["HTTP/2"], 50.0);
    approx(s.avg_speed_by_http_protocol_kbps["HTTP/2"], 1000.0);
    approx(s.stall_rate_by_http_protocol_pct["HTTP/1.1"], 100.0);
    approx(s.error_rate_by_http_protocol_pct["HTTP/2"], 50.0);

    approx(s.stall_share_by_http_protocol_pct["HTTP/2"], 50.0);
    approx(s.stall_share_by_http_protocol_pct["HTTP/1.1"], 50.0);
    assert!(!s.stall_share_by_http_protocol_pct.contains_key(UNKNOWN_PROTOCOL));
    assert_eq!(s.error_share_by_http_protocol_pct.len(), 1);
    approx(s.error_share_by_http_protocol_pct["HTTP/2"], 100.0);
    assert!(s.partial_share_by_http_protocol_pct.is_empty());
}

#[test]
fn partial_body_rates_per_family() {
    let batch = single(&[
        line(
            "B1",
            json!({"ip_family": "ipv4", "content_length_mismatch": true}),
        ),
        line(
            "B1",
            json!({"ip_family": "ipv4", "http_error": "partial_body: expected=10 read=5"}),
        ),
        line("B1", json!({"ip_family": "ipv6", "transfer_speed_kbps": 500.0})),
    ]);
    approx(batch.overall.partial_body_rate_pct, 200.0 / 3.0);
    let v4 = batch.ipv4.as_ref().expect("ipv4 subset");
    let v6 = batch.ipv6.as_ref().expect("ipv6 subset");
    assert_eq!(v4.lines, 2);
    approx(v4.partial_body_rate_pct, 100.0);
    approx(v6.partial_body_rate_pct, 0.0);
    assert_eq!(batch.error_reason_counts.get("partial_body"), Some(&1));
}

#[test]
fn family_subsets_are_omitted_when_absent() {
    let batch = single(&[line("B1", json!({"ip_family": "ipv4"}))]);
    assert!(batch.ipv4.is_some());
    assert!(batch.ipv6.is_none());
}

#[test]
fn pre_ttfb_stall_rate() {
    let batch = single(&[
        line("B1", json!({"http_error": "stall_pre_ttfb"})),
        line("B1", json!({"trace_ttfb_ms": 80})),
    ]);
    approx(batch.overall.pre_ttfb_stall_rate_pct, 50.0);
    assert_eq!(batch.error_reason_counts.get("stall_pre_ttfb"), Some(&1));
    assert_eq!(batch.overall.error_lines, 1);
}

#[test]
fn timing_averages_fall_back_across_sources() {
    let batch = single(&[
        line(
            "B1",
            json!({
                "trace_connect_ms": 10, "tcp_time_ms": 99,
                "trace_tls_ms": 40, "ssl_handshake_time_ms": 99,
                "trace_dns_ms": 5, "dns_time_ms": 15,
            }),
        ),
        line(
            "B1",
            json!({"tcp_time_ms": 20, "ssl_handshake_time_ms": 60, "dns_time_ms": 25}),
        ),
        line("B1", json!({"http_connect_time_ms": 30})),
    ]);
    let s = &batch.overall;
    approx(s.avg_connect_ms, 20.0);
    approx(s.avg_tls_handshake, 50.0);
    approx(s.avg_dns_ms, 15.0);
    approx(s.avg_dns_legacy_ms, 20.0);
}

#[test]
fn error_lines_and_reasons_by_url() {
    let batch = single(&[
        line(
            "B1",
            json!({"url": "https://a.example/", "tcp_error": "dial tcp 1.2.3.4:443: connection refused"}),
        ),
        line(
            "B1",
            json!({"url": "https://a.example/", "tcp_error": "dial tcp 1.2.3.4:443: connection refused"}),
        ),
        line("B1", json!({"url": "https://b.example/"})),
        line(
            "B1",
            json!({"url": "https://c.example/", "http_error": "unexpected EOF"}),
        ),
        line(
            "B1",
            json!({"url": "https://d.example/", "ssl_error": "x509: certificate has expired"}),
        ),
    ]);
    assert_eq!(batch.error_lines_by_url.len(), 2);
    assert_eq!(batch.error_lines_by_url["https://a.example/"], 2);
    assert_eq!(batch.error_lines_by_url["https://c.example/"], 1);
    assert_eq!(batch.overall.error_lines, 3);
    assert_eq!(batch.error_reason_counts["conn_refused"], 2);
    assert_eq!(batch.error_reason_counts["eof"], 1);
    assert_eq!(batch.error_reason_counts["tls_cert_expired"], 1);
}

#[test]
fn diagnostics_take_latest_non_empty_values() {
    let batch = single(&[
        line(
            "B1",
            json!({"url": "https://first/", "dns_server": "1.1.1.1", "next_hop": "192.168.1.1", "next_hop_source": "ip_route"}),
        ),
        line(
            "B1",
            json!({"url": "https://second/", "dns_server": "8.8.8.8", "dns_server_network": "udp"}),
        ),
        line("B1", json!({})),
    ]);
    assert_eq!(batch.dns_server, "8.8.8.8");
    assert_eq!(batch.dns_server_network, "udp");
    assert_eq!(batch.next_hop, "192.168.1.1");
    assert_eq!(batch.next_hop_source, "ip_route");
    assert_eq!(batch.sample_url, "https://second/");
}

#[test]
fn ttfb_mean_and_percentiles() {
    let batch = single(&[
        line("B1", json!({"trace_ttfb_ms": 50})),
        line("B1", json!({"trace_ttfb_ms": 100})),
        line("B1", json!({"trace_ttfb_ms": 150})),
    ]);
    let s = &batch.overall;
    approx(s.avg_ttfb, 100.0);
    approx(s.ttfb_p50_ms, 100.0);
    approx(s.ttfb_p99_ms, 150.0);
    approx(s.speed_p50_kbps, 0.0);
}

#[test]
fn proxy_classification_rates() {
    let batch = single(&[
        line(
            "B1",
            json!({"proxy_name": "zscaler", "proxy_suspected": true, "using_env_proxy": true}),
        ),
        line("B1", json!({"proxy_name": "cloudflare", "proxy_suspected": true})),
        line("B1", json!({})),
        line("B1", json!({})),
    ]);
    let s = &batch.overall;
    approx(s.proxy_suspected_rate_pct, 50.0);
    approx(s.enterprise_proxy_rate_pct, 25.0);
    approx(s.server_proxy_rate_pct, 25.0);
    assert_eq!(batch.proxy_used_lines, 2);
    assert_eq!(batch.proxy_using_env_lines, 1);
    assert_eq!(batch.proxy_name_counts["zscaler"], 1);
    approx(batch.proxy_name_rate_pct["cloudflare"], 25.0);
    approx(batch.env_proxy_usage_rate_pct, 25.0);
    approx(batch.classified_proxy_rate_pct, 50.0);
}

#[test]
fn batch_duration_spans_line_timestamps() {
    let first = json!({
        "meta": {"timestamp_utc": "2025-03-01T10:00:00Z", "schema_version": SCHEMA, "run_tag": "B1"},
        "site_result": {},
    });
    let second = json!({
        "meta": {"timestamp_utc": "2025-03-01T10:00:02.5Z", "schema_version": SCHEMA, "run_tag": "B1"},
        "site_result": {},
    });
    let batch = single(&[first.to_string(), second.to_string()]);
    assert_eq!(batch.overall.batch_duration_ms, 2500);
}

#[test]
fn comparison_needs_two_batches() {
    let one = analyze(&[line(
        "B1",
        json!({"transfer_speed_kbps": 1000.0, "trace_ttfb_ms": 50}),
    )]);
    let cmp = compare_last_vs_previous(&one);
    assert_eq!(cmp.speed_delta_pct, 0.0);
    assert_eq!(cmp.ttfb_delta_pct, 0.0);
    assert_eq!(cmp.prev_avg_speed_kbps, 0.0);
    assert_eq!(compare_last_vs_previous(&[]), cmp);

    let two = analyze(&[
        line(
            "B1",
            json!({"transfer_speed_kbps": 1000.0, "trace_ttfb_ms": 50}),
        ),
        line("B2", json!({"transfer_speed_kbps": 600.0, "trace_ttfb_ms": 90})),
    ]);
    let cmp = compare_last_vs_previous(&two);
    approx(cmp.speed_delta_pct, -40.0);
    approx(cmp.ttfb_delta_pct, 80.0);
    approx(cmp.prev_avg_speed_kbps, 1000.0);
    approx(cmp.prev_avg_ttfb_ms, 50.0);
}

#[test]
fn comparison_against_zero_baseline_is_zero() {
    let batches = analyze(&[
        line("B1", json!({})),
        line("B2", json!({"transfer_speed_kbps": 600.0, "trace_ttfb_ms": 90})),
    ]);
    let cmp = compare_last_vs_previous(&batches);
    assert_eq!(cmp.speed_delta_pct, 0.0);
    assert_eq!(cmp.ttfb_delta_pct, 0.0);
}

#[test]
fn situation_filter_is_case_insensitive() {
    let file = results_file(&[
        line_with("B1", "Home", SCHEMA, json!({})),
        line_with("B2", "office", SCHEMA, json!({})),
        line_with("B3", "home", SCHEMA, json!({})),
    ]);
    let batches = analyze_recent_results_full(file.path(), SCHEMA, 10, "HOME").expect("ok");
    let tags: Vec<&str> = batches.iter().map(|b| b.run_tag.as_str()).collect();
    assert_eq!(tags, ["B1", "B3"]);
    assert_eq!(batches[0].situation, "Home");

    let err = analyze_recent_results_full(file.path(), SCHEMA, 10, "cafe").expect_err("no match");
    assert!(matches!(err, AnalysisError::NoRecords));
}

#[test]
fn situation_filter_is_not_trimmed() {
    let file = results_file(&[line_with("B1", "Home", SCHEMA, json!({}))]);
    let err = analyze_recent_results_full(file.path(), SCHEMA, 10, " home").expect_err("padded");
    assert!(matches!(err, AnalysisError::NoRecords));
}

#[test]
fn unusable_lines_are_skipped() {
    let batch = single(&[
        line_with("OLD", "", 2, json!({})),
        line("", json!({})),
        "not json".to_string(),
        json!({"meta": {"schema_version": SCHEMA, "run_tag": "B1"}}).to_string(),
        String::new(),
        line("B1", json!({"transfer_speed_kbps": 10.0})),
    ]);
    assert_eq!(batch.run_tag, "B1");
    assert_eq!(batch.overall.lines, 1);
}

#[test]
fn schema_mismatch_only_yields_no_records() {
    let file = results_file(&[line_with("B1", "", 2, json!({}))]);
    let err = analyze_recent_results(file.path(), SCHEMA, 10).expect_err("no records");
    assert!(matches!(err, AnalysisError::NoRecords));
}

#[test]
fn missing_file_is_an_open_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.jsonl");
    let err = analyze_recent_results(&path, SCHEMA, 10).expect_err("open");
    assert!(matches!(err, AnalysisError::Open { .. }));
}

#[test]
fn keeps_most_recent_batches_in_tag_order() {
    let batches = analyze(&[
        line("20250103_000000", json!({})),
        line("20250101_000000", json!({})),
        line("20250104_000000", json!({})),
        line("20250102_000000", json!({})),
        line("20250103_000000", json!({})),
    ]);
    assert_eq!(batches.len(), 4);

    let file = results_file(&[
        line("20250103_000000", json!({})),
        line("20250101_000000", json!({})),
        line("20250104_000000", json!({})),
        line("20250102_000000", json!({})),
        line("20250103_000000", json!({})),
    ]);
    let batches = analyze_recent_results(file.path(), SCHEMA, 2).expect("ok");
    let tags: Vec<&str> = batches.iter().map(|b| b.run_tag.as_str()).collect();
    assert_eq!(tags, ["20250103_000000", "20250104_000000"]);
    assert_eq!(batches[0].overall.lines, 2);
}

fn filter() -> LineFilter {
    LineFilter {
        schema_version: SCHEMA,
        situation: String::new(),
        rules: LineRules {
            low_speed_threshold_kbps: 1000.0,
            micro_stall_min_gap_ms: 500,
        },
    }
}

#[test]
fn oversized_line_is_fatal() {
    let good = line("B1", json!({}));
    let limit = good.len();
    let input = format!("{good}\n{good}\n");
    let records = read_records(Cursor::new(input), Path::new("mem"), limit, &filter())
        .expect("lines at the limit");
    assert_eq!(records.len(), 2);

    let input = format!("{good}\n{good} \n");
    let err = read_records(Cursor::new(input), Path::new("mem"), limit, &filter())
        .expect_err("too large");
    assert!(matches!(err, AnalysisError::LineTooLarge { limit: l, .. } if l == limit));
}

#[test]
fn final_line_without_newline_is_read() {
    let input = format!("{}\r\n{}", line("B1", json!({})), line("B2", json!({})));
    let records =
        read_records(Cursor::new(input), Path::new("mem"), 4096, &filter()).expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].run_tag, "B2");
}

#[test]
fn debug_line_reports_stalls() {
    let file = results_file(&[
        line(
            "B1",
            json!({"transfer_stalled": true, "stall_elapsed_ms": 1200, "http_protocol": "HTTP/2"}),
        ),
        line("B1", json!({"http_protocol": "HTTP/2"})),
    ]);
    let options = AnalyzeOptions {
        debug: true,
        ..AnalyzeOptions::default()
    };
    let batches =
        analyze_recent_results_full_with_options(file.path(), SCHEMA, 10, &options).expect("ok");
    let text = debug_summary_line(&batches[0]);
    assert!(text.contains("stalls=50.0%"), "{text}");
    assert!(text.contains("avg_stall=1200ms"), "{text}");
    assert!(text.contains("protocols=HTTP/2:2"), "{text}");
}

#[test]
fn summaries_serialize_with_flat_overall_fields() {
    let batch = single(&[line(
        "B1",
        json!({"transfer_speed_kbps": 1000.0, "ip_family": "ipv4"}),
    )]);
    let value = serde_json::to_value(&batch).expect("serialize");
    assert_eq!(value["run_tag"], "B1");
    assert_eq!(value["lines"], 1);
    assert_eq!(value["avg_speed_kbps"], 1000.0);
    assert_eq!(value["ipv4"]["lines"], 1);
    assert!(value.get("ipv6").is_none());
}
