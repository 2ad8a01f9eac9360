//! Batch aggregation over the JSON Lines results file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use crate::features::analysis::reasons::{
    normalize_error_reason, normalize_error_reason_detailed, normalize_http_reason,
};
pub use crate::features::analysis::{
    analyze_recent_results, analyze_recent_results_full, analyze_recent_results_full_with_options,
    compare_last_vs_previous, debug_summary_line,
};

pub const DEFAULT_MAX_BATCHES: usize = 10;
pub const DEFAULT_LOW_SPEED_THRESHOLD_KBPS: f64 = 1000.0;
pub const DEFAULT_MICRO_STALL_MIN_GAP_MS: i64 = 500;
/// Absolute cap on one logical line; anything larger is a fatal error.
pub const MAX_LINE_BYTES: usize = 200 * 1024 * 1024;
pub const UNKNOWN_PROTOCOL: &str = "(unknown)";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalyzeOptions {
    /// Case-insensitive match on `meta.situation`; empty keeps everything.
    pub situation_filter: String,
    /// Samples below this speed count toward the low-speed share.
    /// Non-positive selects [`DEFAULT_LOW_SPEED_THRESHOLD_KBPS`].
    pub low_speed_threshold_kbps: f64,
    /// Shortest no-progress span that counts as a micro-stall.
    /// Non-positive selects [`DEFAULT_MICRO_STALL_MIN_GAP_MS`].
    pub micro_stall_min_gap_ms: i64,
    /// Log discovered tags and a one-line summary per batch. The
    /// `ANALYSIS_DEBUG` environment variable turns this on as well.
    pub debug: bool,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line too large: exceeds limit of {limit} bytes in {path}")]
    LineTooLarge { path: PathBuf, limit: usize },
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no records")]
    NoRecords,
    #[error("no batches")]
    NoBatches,
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

/// Metrics for one set of lines: a whole batch or one IP family of it.
/// Every rate is a percentage of this scope's own `lines`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSummary {
    pub lines: usize,
    #[serde(rename = "avg_speed_kbps")]
    pub avg_speed: f64,
    #[serde(rename = "median_speed_kbps")]
    pub median_speed: f64,
    #[serde(rename = "avg_ttfb_ms")]
    pub avg_ttfb: f64,
    pub avg_bytes: f64,
    pub error_lines: usize,
    #[serde(rename = "avg_first_rtt_goodput_kbps")]
    pub avg_first_rtt_goodput: f64,
    #[serde(rename = "avg_p50_kbps")]
    pub avg_p50_speed: f64,
    #[serde(rename = "avg_p90_kbps", skip_serializing_if = "is_zero")]
    pub avg_p90_speed: f64,
    #[serde(rename = "avg_p95_kbps", skip_serializing_if = "is_zero")]
    pub avg_p95_speed: f64,
    #[serde(rename = "avg_p99_kbps", skip_serializing_if = "is_zero")]
    pub avg_p99_speed: f64,
    pub avg_p99_p50_ratio: f64,
    pub avg_plateau_count: f64,
    #[serde(rename = "avg_longest_plateau_ms")]
    pub avg_longest_plateau: f64,
    #[serde(rename = "avg_jitter_mean_abs_pct")]
    pub avg_jitter_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub avg_slope_kbps_per_sec: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub avg_coef_variation_pct: f64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub batch_duration_ms: i64,

    pub speed_p25_kbps: f64,
    pub speed_p50_kbps: f64,
    pub speed_p75_kbps: f64,
    pub speed_p90_kbps: f64,
    pub speed_p95_kbps: f64,
    pub speed_p99_kbps: f64,
    pub ttfb_p25_ms: f64,
    pub ttfb_p50_ms: f64,
    pub ttfb_p75_ms: f64,
    pub ttfb_p90_ms: f64,
    pub ttfb_p95_ms: f64,
    pub ttfb_p99_ms: f64,

    #[serde(skip_serializing_if = "is_zero")]
    pub avg_dns_ms: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub avg_dns_legacy_ms: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub avg_connect_ms: f64,
    #[serde(rename = "avg_tls_handshake_ms", skip_serializing_if = "is_zero")]
    pub avg_tls_handshake: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub avg_head_get_time_ratio: f64,

    #[serde(skip_serializing_if = "is_zero")]
    pub cache_hit_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub proxy_suspected_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub enterprise_proxy_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub server_proxy_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub ip_mismatch_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub prefetch_suspected_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub warm_cache_suspected_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub conn_reuse_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub plateau_stable_rate_pct: f64,

    #[serde(skip_serializing_if = "is_zero")]
    pub stall_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub avg_stall_elapsed_ms: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub pre_ttfb_stall_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub partial_body_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub chunked_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub low_speed_time_share_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub micro_stall_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub avg_micro_stall_ms: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub avg_micro_stall_count: f64,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub http_protocol_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub http_protocol_rate_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub avg_speed_by_http_protocol_kbps: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub stall_rate_by_http_protocol_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub error_rate_by_http_protocol_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub partial_body_rate_by_http_protocol_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub stall_share_by_http_protocol_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub error_share_by_http_protocol_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub partial_share_by_http_protocol_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tls_version_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tls_version_rate_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub alpn_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub alpn_rate_pct: BTreeMap<String, f64>,
}

/// Same metrics as the batch, restricted to one IP family.
pub type FamilySummary = ScopeSummary;

/// Aggregate for one `run_tag`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSummary {
    pub run_tag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub situation: String,
    #[serde(flatten)]
    pub overall: ScopeSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<FamilySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<FamilySummary>,

    #[serde(skip_serializing_if = "is_zero_usize")]
    pub proxy_used_lines: usize,
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub proxy_using_env_lines: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub proxy_name_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub proxy_name_rate_pct: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "is_zero")]
    pub env_proxy_usage_rate_pct: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub classified_proxy_rate_pct: f64,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub dns_server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dns_server_network: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_hop: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_hop_source: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sample_url: String,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub error_lines_by_url: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub error_reason_counts: BTreeMap<String, usize>,
}

fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}

/// Last batch against the unweighted mean of every earlier batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchComparison {
    pub speed_delta_pct: f64,
    pub ttfb_delta_pct: f64,
    pub prev_avg_speed_kbps: f64,
    pub prev_avg_ttfb_ms: f64,
}
