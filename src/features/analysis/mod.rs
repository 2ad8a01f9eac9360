pub(crate) mod reasons;
mod record;
mod scope;

#[cfg(test)]
mod tests;

use crate::analysis::{
    AnalysisError, AnalyzeOptions, BatchComparison, BatchSummary, DEFAULT_LOW_SPEED_THRESHOLD_KBPS,
    DEFAULT_MAX_BATCHES, DEFAULT_MICRO_STALL_MIN_GAP_MS, MAX_LINE_BYTES,
};
use crate::model::ResultEnvelope;
use record::{LineRecord, LineRules};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::info;

const DEBUG_ENV: &str = "ANALYSIS_DEBUG";

/// Batches of `schema_version` lines, oldest first, at most `max_batches`.
pub fn analyze_recent_results(
    path: impl AsRef<Path>,
    schema_version: u32,
    max_batches: usize,
) -> Result<Vec<BatchSummary>, AnalysisError> {
    analyze_recent_results_full_with_options(
        path,
        schema_version,
        max_batches,
        &AnalyzeOptions::default(),
    )
}

/// Same as [`analyze_recent_results`], keeping only lines whose situation
/// matches `situation` case-insensitively.
pub fn analyze_recent_results_full(
    path: impl AsRef<Path>,
    schema_version: u32,
    max_batches: usize,
    situation: &str,
) -> Result<Vec<BatchSummary>, AnalysisError> {
    let options = AnalyzeOptions {
        situation_filter: situation.to_string(),
        ..AnalyzeOptions::default()
    };
    analyze_recent_results_full_with_options(path, schema_version, max_batches, &options)
}

pub fn analyze_recent_results_full_with_options(
    path: impl AsRef<Path>,
    schema_version: u32,
    max_batches: usize,
    options: &AnalyzeOptions,
) -> Result<Vec<BatchSummary>, AnalysisError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| AnalysisError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let filter = LineFilter {
        schema_version,
        situation: options.situation_filter.to_lowercase(),
        rules: LineRules {
            low_speed_threshold_kbps: if options.low_speed_threshold_kbps > 0.0 {
                options.low_speed_threshold_kbps
            } else {
                DEFAULT_LOW_SPEED_THRESHOLD_KBPS
            },
            micro_stall_min_gap_ms: if options.micro_stall_min_gap_ms > 0 {
                options.micro_stall_min_gap_ms
            } else {
                DEFAULT_MICRO_STALL_MIN_GAP_MS
            },
        },
    };
    let records = read_records(BufReader::new(file), path, MAX_LINE_BYTES, &filter)?;
    let debug = options.debug || std::env::var(DEBUG_ENV).is_ok_and(|value| !value.is_empty());
    summarize_batches(records, max_batches, debug)
}

struct LineFilter {
    schema_version: u32,
    /// Lowercased; empty keeps every situation.
    situation: String,
    rules: LineRules,
}

impl LineFilter {
    fn project(&self, raw: &[u8]) -> Option<LineRecord> {
        let envelope: ResultEnvelope = serde_json::from_slice(raw).ok()?;
        let meta = envelope.meta.as_ref()?;
        if meta.schema_version != self.schema_version || meta.run_tag.is_empty() {
            return None;
        }
        if !self.situation.is_empty() && meta.situation.to_lowercase() != self.situation {
            return None;
        }
        LineRecord::from_envelope(envelope, raw, self.rules)
    }
}

/// Reads newline-delimited records, holding at most `limit` bytes of one
/// line at a time. Undecodable and filtered lines are skipped silently.
fn read_records<R: BufRead>(
    mut reader: R,
    path: &Path,
    limit: usize,
    filter: &LineFilter,
) -> Result<Vec<LineRecord>, AnalysisError> {
    let mut records = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = (&mut reader)
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut line)
            .map_err(|source| AnalysisError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if read == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        if line.len() > limit {
            return Err(AnalysisError::LineTooLarge {
                path: path.to_path_buf(),
                limit,
            });
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if let Some(record) = filter.project(&line) {
            records.push(record);
        }
    }
    Ok(records)
}

fn summarize_batches(
    records: Vec<LineRecord>,
    max_batches: usize,
    debug: bool,
) -> Result<Vec<BatchSummary>, AnalysisError> {
    if records.is_empty() {
        return Err(AnalysisError::NoRecords);
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut batches: Vec<(String, Vec<LineRecord>)> = Vec::new();
    for record in records {
        let slot = match index.get(&record.run_tag) {
            Some(slot) => *slot,
            None => {
                if debug {
                    info!(run_tag = %record.run_tag, "discovered batch");
                }
                index.insert(record.run_tag.clone(), batches.len());
                batches.push((record.run_tag.clone(), Vec::new()));
                batches.len() - 1
            }
        };
        batches[slot].1.push(record);
    }
    if batches.is_empty() {
        return Err(AnalysisError::NoBatches);
    }

    batches.sort_by(|a, b| a.0.cmp(&b.0));
    let keep = if max_batches == 0 {
        DEFAULT_MAX_BATCHES
    } else {
        max_batches
    };
    if batches.len() > keep {
        batches.drain(..batches.len() - keep);
    }

    let summaries = batches
        .iter()
        .map(|(tag, lines)| {
            let summary = summarize_batch(tag, lines);
            if debug {
                info!(lines = lines.len(), "{}", debug_summary_line(&summary));
            }
            summary
        })
        .collect();
    Ok(summaries)
}

fn family(lines: &[LineRecord], name: &str) -> Option<crate::analysis::FamilySummary> {
    let subset: Vec<&LineRecord> = lines.iter().filter(|r| r.ip_family == name).collect();
    (!subset.is_empty()).then(|| scope::summarize(&subset))
}

/// Latest non-empty value of `field`, scanning from the end of the batch.
fn latest(lines: &[LineRecord], field: impl Fn(&LineRecord) -> &str) -> String {
    lines
        .iter()
        .rev()
        .map(&field)
        .find(|value| !value.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn summarize_batch(tag: &str, lines: &[LineRecord]) -> BatchSummary {
    let all: Vec<&LineRecord> = lines.iter().collect();
    let total = lines.len();
    let pct = |count: usize| {
        if total == 0 {
            0.0
        } else {
            count as f64 / total as f64 * 100.0
        }
    };

    let mut proxy_name_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut error_lines_by_url: BTreeMap<String, usize> = BTreeMap::new();
    let mut error_reason_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut env_proxy = 0;
    for line in lines {
        if !line.proxy_name.is_empty() {
            *proxy_name_counts.entry(line.proxy_name.clone()).or_default() += 1;
        }
        env_proxy += usize::from(line.using_env_proxy);
        if line.has_error && !line.url.is_empty() {
            *error_lines_by_url.entry(line.url.clone()).or_default() += 1;
        }
        if !line.error_reason.is_empty() {
            *error_reason_counts
                .entry(line.error_reason.clone())
                .or_default() += 1;
        }
    }
    let proxy_used_lines: usize = proxy_name_counts.values().sum();

    BatchSummary {
        run_tag: tag.to_string(),
        situation: lines
            .iter()
            .map(|r| r.situation.as_str())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string(),
        overall: scope::summarize(&all),
        ipv4: family(lines, "ipv4"),
        ipv6: family(lines, "ipv6"),
        proxy_used_lines,
        proxy_using_env_lines: env_proxy,
        proxy_name_rate_pct: proxy_name_counts
            .iter()
            .map(|(name, count)| (name.clone(), pct(*count)))
            .collect(),
        proxy_name_counts,
        env_proxy_usage_rate_pct: pct(env_proxy),
        classified_proxy_rate_pct: pct(proxy_used_lines),
        dns_server: latest(lines, |r| r.dns_server.as_str()),
        dns_server_network: latest(lines, |r| r.dns_server_network.as_str()),
        next_hop: latest(lines, |r| r.next_hop.as_str()),
        next_hop_source: latest(lines, |r| r.next_hop_source.as_str()),
        sample_url: latest(lines, |r| r.url.as_str()),
        error_lines_by_url,
        error_reason_counts,
    }
}

/// Speed and TTFB movement of the last batch against the mean of all the
/// batches before it. Fewer than two batches compare as all zeros.
pub fn compare_last_vs_previous(summaries: &[BatchSummary]) -> BatchComparison {
    let Some((last, previous)) = summaries.split_last() else {
        return BatchComparison::default();
    };
    if previous.is_empty() {
        return BatchComparison::default();
    }
    let count = previous.len() as f64;
    let prev_speed = previous.iter().map(|s| s.overall.avg_speed).sum::<f64>() / count;
    let prev_ttfb = previous.iter().map(|s| s.overall.avg_ttfb).sum::<f64>() / count;

    let delta = |current: f64, prior: f64| {
        if prior <= 0.0 {
            return 0.0;
        }
        let value = (current - prior) / prior * 100.0;
        if value.is_finite() { value } else { 0.0 }
    };
    BatchComparison {
        speed_delta_pct: delta(last.overall.avg_speed, prev_speed),
        ttfb_delta_pct: delta(last.overall.avg_ttfb, prev_ttfb),
        prev_avg_speed_kbps: prev_speed,
        prev_avg_ttfb_ms: prev_ttfb,
    }
}

/// One-line digest used by the aggregation debug log.
pub fn debug_summary_line(summary: &BatchSummary) -> String {
    let s = &summary.overall;
    let mut line = format!(
        "summary {} lines={} avg_speed={:.1} avg_ttfb={:.0} errors={} p50={:.1} ratio={:.2} \
         jitter={:.1}% slope={:.2} cov%={:.1} cache_hit={:.1}% reuse={:.1}% stalls={:.1}% \
         avg_stall={:.0}ms pre_ttfb={:.1}% partial={:.1}% low_speed={:.1}% micro_stalls={:.1}%",
        summary.run_tag,
        s.lines,
        s.avg_speed,
        s.avg_ttfb,
        s.error_lines,
        s.avg_p50_speed,
        s.avg_p99_p50_ratio,
        s.avg_jitter_pct,
        s.avg_slope_kbps_per_sec,
        s.avg_coef_variation_pct,
        s.cache_hit_rate_pct,
        s.conn_reuse_rate_pct,
        s.stall_rate_pct,
        s.avg_stall_elapsed_ms,
        s.pre_ttfb_stall_rate_pct,
        s.partial_body_rate_pct,
        s.low_speed_time_share_pct,
        s.micro_stall_rate_pct,
    );
    if !s.http_protocol_counts.is_empty() {
        let mix: Vec<String> = s
            .http_protocol_counts
            .iter()
            .map(|(proto, count)| format!("{proto}:{count}"))
            .collect();
        line.push_str(&format!(" protocols={}", mix.join(",")));
    }
    if summary.env_proxy_usage_rate_pct > 0.0 {
        line.push_str(&format!(" env_proxy={:.1}%", summary.env_proxy_usage_rate_pct));
    }
    if summary.classified_proxy_rate_pct > 0.0 {
        line.push_str(&format!(
            " proxy_classified={:.1}%",
            summary.classified_proxy_rate_pct
        ));
    }
    line
}
