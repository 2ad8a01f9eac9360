use serde::{Deserialize, Serialize};

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

/// One JSON line of telemetry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultEnvelope {
    pub meta: Option<Meta>,
    pub site_result: Option<SiteResult>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedSample {
    pub time_ms: i64,
    pub bytes: i64,
    pub speed_kbps: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauSegment {
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration_ms: i64,
    pub avg_kbps: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedAnalysis {
    pub average_kbps: f64,
    pub stddev_kbps: f64,
    pub coef_variation: f64,
    pub min_kbps: f64,
    pub max_kbps: f64,
    pub p50_kbps: f64,
    pub p90_kbps: f64,
    pub p95_kbps: f64,
    pub p99_kbps: f64,
    pub slope_kbps_per_sec: f64,
    pub jitter_mean_abs_pct: f64,
    pub patterns: Vec<String>,
    pub plateau_count: usize,
    pub longest_plateau_ms: i64,
    pub plateau_stable: bool,
    pub plateau_segments: Vec<PlateauSegment>,
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub sample_count: usize,
    #[serde(rename = "ci95_rel_moe_pct", skip_serializing_if = "is_zero_f64")]
    pub ci95_rel_moe_pct: f64,
    #[serde(
        rename = "required_samples_for_10pct_95ci",
        skip_serializing_if = "is_zero_usize"
    )]
    pub required_samples_for_10pct_95ci: usize,
    #[serde(skip_serializing_if = "is_false")]
    pub quality_good: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub insights: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationPoint {
    pub target_kbps: f64,
    pub observed_kbps: f64,
    pub error_pct: f64,
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub samples: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub calibrated_utc: String,
    pub probe_duration_ms: i64,
    pub max_kbps: f64,
    pub ranges: Vec<CalibrationPoint>,
}

/// Per-process metadata attached to every emitted line.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    pub timestamp_utc: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub situation: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_tag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_cpu: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gomaxprocs: Option<usize>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_avg_1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_avg_5: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_avg_15: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kernel_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub local_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default_iface: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub public_ipv4_candidates: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub public_ipv6_candidates: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub public_ipv4_consensus: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub public_ipv6_consensus: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ipv4_asn_number: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub public_ipv4_asn_org: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ipv6_asn_number: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub public_ipv6_asn_org: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub connection_type: String,
    pub containerized: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub home_office_estimate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_selftest_kbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Calibration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_free_or_available_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_root_total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_root_free_bytes: Option<u64>,
    pub schema_version: u32,
}

/// Full observation of one probe against one site and address.
///
/// Numeric measurements are `None` when the phase never ran; strings and
/// flags are omitted from the wire when empty or false.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tcp_error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_handshake_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ssl_error: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_ttfb_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_status: Option<u16>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub head_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub http_error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_time_ms: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_size_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_speed_kbps: Option<f64>,
    #[serde(skip_serializing_if = "is_false")]
    pub transfer_stalled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall_elapsed_ms: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub second_get_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second_get_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub second_get_header_age: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub second_get_x_cache: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub second_get_content_range: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub second_get_error: String,
    #[serde(skip_serializing_if = "is_false")]
    pub second_get_cache_present: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_head_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "is_false")]
    pub warm_head_speedup: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub warm_cache_suspected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dial_count: Option<u32>,
    #[serde(skip_serializing_if = "is_false")]
    pub connection_reused_second_get: bool,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub http_protocol: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_cipher: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alpn: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transfer_encoding: String,
    #[serde(skip_serializing_if = "is_false")]
    pub chunked: bool,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub country_configured: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country_geoip: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_ips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resolved_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_index: Option<usize>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip_family: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dns_server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dns_server_network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn_number: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub asn_org: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_ip: String,

    #[serde(skip_serializing_if = "is_false")]
    pub cache_present: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub ip_mismatch: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub prefetch_suspected: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub proxy_suspected: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub probe_header_value: String,
    #[serde(skip_serializing_if = "is_false")]
    pub probe_echoed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_get_time_ratio: Option<f64>,

    #[serde(skip_serializing_if = "is_false")]
    pub retried_once: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub retried_head: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub retried_get: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub retried_range: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_dns_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_connect_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_tls_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_time_to_conn_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_connect_time_ms: Option<i64>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub header_via: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub header_x_cache: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub header_age: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub header_server: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_source: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub proxy_indicators: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub env_proxy_url: String,
    #[serde(skip_serializing_if = "is_false")]
    pub env_proxy_bypassed: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub using_env_proxy: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_remote_ip: String,
    #[serde(skip_serializing_if = "is_false")]
    pub proxy_remote_is_proxy: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub origin_ip_candidate: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_hop: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_hop_source: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_cert_subject: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_cert_issuer: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_rtt_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_rtt_goodput_kbps: Option<f64>,
    #[serde(skip_serializing_if = "is_false")]
    pub content_length_mismatch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length_header: Option<i64>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transfer_speed_samples: Vec<SpeedSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_analysis: Option<SpeedAnalysis>,
}
