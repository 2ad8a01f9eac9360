//! Per site and per address probe sequence:
//! DNS, TCP connect, TLS handshake, HEAD, GET with transfer sampling,
//! ranged GET and a warm HEAD. Every path ends in exactly one `SiteResult`.

mod client;
mod dns;
mod helpers;
mod tls;
mod watch;

use crate::common::net::{env_proxy_for, ip_family, parse_target_url, url_host, url_port};
use crate::common::time::{Deadline, millis, positive_millis};
use crate::config::{
    self, ProbeTunables, RANGE_HEADER, RETRY_BACKOFF, TCP_CONNECT_TIMEOUT, TLS_HANDSHAKE_TIMEOUT,
};
use crate::features::metrics::analyze_speed_samples;
use crate::meta::{detect_next_hop, wrap_result};
use crate::model::SiteResult;
use crate::probe::{
    DEADLINE_EXCEEDED, PhaseError, ProbeErrorKind, ProbeOutcome, Site, cache_present,
    classify_cert_proxy, classify_proxy, is_transient,
};
use crate::writer::write_result;
use client::{Exchange, HttpClient, Method, RecorderLimits, RequestSpec, STALL_ABORT};
use helpers::{content_range_len, kib_per_sec, percent_of, transfer_codings};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// DNS facts shared by every address probed for one site.
#[derive(Clone, Debug, Default)]
pub(crate) struct DnsContext {
    pub ips: Vec<String>,
    pub elapsed: Duration,
    pub server: String,
    pub server_network: String,
}

/// Resolves the site once and probes each selected address in turn, all
/// under one site deadline. Emits one line per address, or a single line
/// when resolution fails.
pub fn monitor_site(site: &Site) -> Vec<ProbeOutcome> {
    let tunables = config::tunables();
    let Some(url) = parse_target_url(&site.url) else {
        error!(site = %site.name, url = %site.url, "invalid url");
        return Vec::new();
    };
    info!(site = %site.name, "start");
    let deadline = Deadline::after(tunables.site_timeout);
    let dns_timeout = if tunables.site_timeout.is_zero() {
        tunables.dns_timeout
    } else {
        deadline.cap(tunables.site_timeout)
    };

    let host = url_host(&url);
    debug!(site = %site.name, host = %host, "dns lookup");
    let answer = match dns::resolve(&host, dns_timeout) {
        Ok(answer) => answer,
        Err((err, elapsed)) => {
            warn!(site = %site.name, error = %err, "DNS failed");
            let result = SiteResult {
                name: site.name.clone(),
                url: site.url.clone(),
                country_configured: site.country.clone(),
                dns_time_ms: positive_millis(elapsed),
                http_error: err.message,
                ..SiteResult::default()
            };
            let outcome = ProbeOutcome::from(&result);
            write_result(wrap_result(result));
            return vec![outcome];
        }
    };

    let dns = DnsContext {
        ips: answer.ips.iter().map(ToString::to_string).collect(),
        elapsed: answer.elapsed,
        server: answer.server,
        server_network: answer.server_network,
    };
    let selected = dns::select_ips(&answer.ips, tunables.max_ips_per_site);
    let site_started = Instant::now();
    let mut outcomes = Vec::with_capacity(selected.len());
    for (index, ip) in selected.into_iter().enumerate() {
        if deadline.expired() {
            warn!(
                site = %site.name,
                elapsed_ms = millis(site_started.elapsed()),
                "site timeout reached, skipping remaining addresses"
            );
            break;
        }
        let result = probe_ip(site, &url, ip, index, &dns, deadline, &tunables);
        outcomes.push(ProbeOutcome::from(&result));
        write_result(wrap_result(result));
    }
    outcomes
}

/// Probes one pre-resolved address. `dns_ips` is every address resolved
/// for the site and decides `ip_index` and `ip_mismatch`.
pub fn monitor_site_ip(
    site: &Site,
    ip: &str,
    dns_ips: &[String],
    dns_time_ms: i64,
) -> Option<ProbeOutcome> {
    let Ok(addr) = ip.trim().parse::<IpAddr>() else {
        error!(site = %site.name, ip, "invalid ip");
        return None;
    };
    let Some(url) = parse_target_url(&site.url) else {
        error!(site = %site.name, url = %site.url, "invalid url");
        return None;
    };
    let tunables = config::tunables();
    let index = dns_ips.iter().position(|entry| entry == ip).unwrap_or(0);
    let dns = DnsContext {
        ips: dns_ips.to_vec(),
        elapsed: Duration::from_millis(u64::try_from(dns_time_ms).unwrap_or(0)),
        ..DnsContext::default()
    };
    let deadline = Deadline::after(tunables.site_timeout);
    let result = probe_ip(site, &url, addr, index, &dns, deadline, &tunables);
    let outcome = ProbeOutcome::from(&result);
    write_result(wrap_result(result));
    Some(outcome)
}

/// URL, connection pin and proxy shared by every request of one probe.
struct Endpoint {
    url: String,
    resolve: String,
    proxy: String,
    timeout: Duration,
}

impl Endpoint {
    fn spec<'a>(
        &'a self,
        method: Method,
        headers: &'a [String],
        limits: RecorderLimits,
    ) -> RequestSpec<'a> {
        RequestSpec {
            method,
            url: &self.url,
            resolve: &self.resolve,
            proxy: &self.proxy,
            headers,
            timeout: self.timeout,
            limits,
        }
    }
}

pub(crate) fn probe_ip(
    site: &Site,
    url: &Url,
    ip: IpAddr,
    index: usize,
    dns: &DnsContext,
    deadline: Deadline,
    tunables: &ProbeTunables,
) -> SiteResult {
    let ip_text = ip.to_string();
    let label = format!("{} {}", site.name, ip_text);
    info!(probe = %label, "start");

    let env_proxy = env_proxy_for(url);
    let mut sr = SiteResult {
        name: site.name.clone(),
        url: site.url.clone(),
        ip: ip_text.clone(),
        country_configured: site.country.clone(),
        dns_ips: dns.ips.clone(),
        dns_time_ms: positive_millis(dns.elapsed),
        resolved_ip: ip_text.clone(),
        ip_index: Some(index),
        ip_family: ip_family(&ip).to_string(),
        dns_server: dns.server.clone(),
        dns_server_network: dns.server_network.clone(),
        env_proxy_url: env_proxy.url.clone(),
        env_proxy_bypassed: env_proxy.bypassed,
        ..SiteResult::default()
    };

    let host = url_host(url);
    let port = url_port(url);
    debug!(probe = %label, port, "tcp connect");
    let (connected, tcp_elapsed) = connect(SocketAddr::new(ip, port), &deadline);
    sr.tcp_time_ms = positive_millis(tcp_elapsed);
    let stream = match connected {
        Ok(stream) => stream,
        Err(err) => {
            warn!(probe = %label, error = %err, "TCP connect failed");
            sr.tcp_error = err.message;
            return sr;
        }
    };

    if url.scheme() == "https" {
        debug!(probe = %label, "tls handshake");
        let mut limit = TLS_HANDSHAKE_TIMEOUT.min(tunables.http_timeout);
        if !tunables.site_timeout.is_zero() {
            limit = limit.min(tunables.site_timeout);
        }
        let started = Instant::now();
        let outcome = if deadline.expired() {
            Err(PhaseError::deadline())
        } else {
            tls::handshake(stream, &host, deadline.cap(limit))
        };
        sr.ssl_handshake_time_ms = positive_millis(started.elapsed());
        match outcome {
            Ok(summary) => {
                sr.tls_version = summary.version;
                sr.tls_cipher = summary.cipher;
                sr.alpn = summary.alpn;
                sr.tls_cert_subject = summary.cert_subject;
                sr.tls_cert_issuer = summary.cert_issuer;
                if let Some(vendor) = classify_cert_proxy(&sr.tls_cert_subject, &sr.tls_cert_issuer)
                {
                    sr.proxy_name = vendor.to_string();
                    sr.proxy_source = "tls_cert".to_string();
                    sr.proxy_indicators.push(format!("cert:{vendor}"));
                }
            }
            Err(err) => {
                warn!(probe = %label, error = %err, "TLS failed");
                sr.ssl_error = err.message;
                return sr;
            }
        }
    } else {
        drop(stream);
    }

    let token = Uuid::new_v4().simple().to_string();
    let probe_headers = vec![format!("X-Probe: {token}")];
    let range_headers = vec![probe_headers[0].clone(), RANGE_HEADER.to_string()];
    let endpoint = Endpoint {
        url: url.to_string(),
        resolve: format!("{host}:{port}:{}", pin_address(ip)),
        proxy: env_proxy.url.clone(),
        timeout: tunables.http_timeout,
    };
    sr.using_env_proxy = !endpoint.proxy.is_empty();
    let stall = tunables.stall_timeout;
    let rtt = Duration::from_millis(u64::try_from(sr.tcp_time_ms.unwrap_or(0).max(1)).unwrap_or(1));

    let mut client = HttpClient::new();
    let mut dials = 0u32;
    let mut remote_ip = String::new();

    debug!(probe = %label, "HEAD");
    let head_spec = endpoint.spec(Method::Head, &probe_headers, RecorderLimits::default());
    let (head, retried_head) = with_retry(&label, "HEAD", || {
        let exchange = client.execute(&head_spec, &deadline);
        dials += exchange.connects;
        exchange
    });
    note_remote(&mut sr, &mut remote_ip, &head);
    sr.head_time_ms = positive_millis(head.elapsed);
    if retried_head {
        sr.retried_once = true;
        sr.retried_head = true;
    }
    if head.responded() {
        fill_protocol_and_encoding(&mut sr, &head);
        sr.head_status = head.status;
    } else if let Some(err) = &head.error {
        sr.head_error = err.message.clone();
    }

    debug!(probe = %label, "GET");
    let get_spec = endpoint.spec(
        Method::Get,
        &probe_headers,
        RecorderLimits {
            stall_timeout: stall,
            stall_before_headers: false,
            sample: true,
            rtt,
        },
    );
    let (get, retried_get) = with_retry(&label, "GET", || {
        let signals = client.signals();
        let _pre_ttfb = (tunables.pre_ttfb_stall && !stall.is_zero())
            .then(|| watch::pre_ttfb_guard(label.clone(), signals.clone(), stall));
        let _watchdog =
            (!stall.is_zero()).then(|| watch::progress_watchdog(label.clone(), signals, stall));
        let exchange = client.execute(&get_spec, &deadline);
        dials += exchange.connects;
        exchange
    });
    note_remote(&mut sr, &mut remote_ip, &get);
    if retried_get {
        sr.retried_once = true;
        sr.retried_get = true;
    }
    sr.http_connect_time_ms = positive_millis(get.headers_elapsed.unwrap_or(get.elapsed));
    sr.trace_dns_ms = positive_millis(get.timings.namelookup);
    sr.trace_connect_ms = positive_millis(get.timings.tcp_connect());
    sr.trace_tls_ms = positive_millis(get.timings.tls_handshake());
    sr.trace_time_to_conn_ms = positive_millis(get.timings.pretransfer);
    sr.trace_ttfb_ms = positive_millis(get.timings.starttransfer)
        .or_else(|| get.first_byte.and_then(positive_millis));

    if !get.responded() {
        let err = get
            .error
            .clone()
            .unwrap_or_else(|| PhaseError::new(ProbeErrorKind::Http, "no response"));
        if sr.http_error.is_empty() {
            sr.http_error = err.message.clone();
        }
        if err.kind == ProbeErrorKind::Deadline || err.message.contains(DEADLINE_EXCEEDED) {
            warn!(probe = %label, "GET timeout (context deadline exceeded)");
        } else {
            warn!(probe = %label, error = %err, "GET failed");
        }
        return sr;
    }

    fill_protocol_and_encoding(&mut sr, &get);
    let via = get.headers.get("Via").to_string();
    let x_cache = get.headers.get("X-Cache").to_string();
    sr.header_via = via.clone();
    sr.header_x_cache = x_cache.clone();
    sr.header_age = get.headers.get("Age").to_string();
    sr.header_server = get.headers.get("Server").to_string();
    sr.cache_present = cache_present(&sr.header_age, &x_cache);
    sr.remote_ip = remote_ip.clone();
    sr.ip_mismatch = !dns.ips.iter().any(|candidate| *candidate == remote_ip);

    let connect_ms = sr.http_connect_time_ms.unwrap_or(0);
    let head_ms = millis(head.elapsed);
    sr.prefetch_suspected = head.responded()
        && head_ms > 0
        && connect_ms > 0
        && Duration::from_millis(connect_ms.unsigned_abs()) < head.elapsed / 2;

    let proxy = classify_proxy(&get.headers, &sr.tls_cert_subject, &sr.tls_cert_issuer);
    let mut proxy_suspected = sr.ip_mismatch || !via.is_empty() || !x_cache.is_empty();
    if !proxy.name.is_empty() {
        proxy_suspected = true;
        sr.proxy_name = proxy.name;
        sr.proxy_source = proxy.source;
    }
    if !proxy.indicators.is_empty() {
        sr.proxy_indicators = proxy.indicators;
    }
    sr.proxy_suspected = proxy_suspected;
    sr.probe_header_value = token;
    sr.probe_echoed = !get.headers.get("X-Probe").is_empty();
    if head_ms > 0 && connect_ms > 0 {
        sr.head_get_time_ratio = Some(connect_ms as f64 / head_ms as f64);
    }

    record_transfer(&mut sr, &get, rtt, &label);

    debug!(probe = %label, "range GET");
    let range_spec = endpoint.spec(
        Method::Get,
        &range_headers,
        RecorderLimits {
            stall_timeout: stall,
            stall_before_headers: !stall.is_zero(),
            ..RecorderLimits::default()
        },
    );
    let (range, retried_range) = with_retry(&label, "Range GET", || {
        let exchange = client.execute(&range_spec, &deadline);
        dials += exchange.connects;
        exchange
    });
    if retried_range {
        sr.retried_once = true;
        sr.retried_range = true;
    }
    if range.responded() {
        fill_protocol_and_encoding(&mut sr, &range);
        sr.second_get_status = range.status;
        sr.second_get_time_ms = range.headers_elapsed.and_then(positive_millis);
        sr.second_get_header_age = range.headers.get("Age").to_string();
        sr.second_get_x_cache = range.headers.get("X-Cache").to_string();
        sr.second_get_content_range = range.headers.get("Content-Range").to_string();
        let expected = content_range_len(&sr.second_get_content_range).or_else(|| {
            range
                .headers
                .get("Content-Length")
                .parse::<i64>()
                .ok()
                .filter(|len| *len > 0)
        });
        let read = i64::try_from(range.body_bytes).unwrap_or(i64::MAX);
        if range.stalled {
            warn!(
                probe = %label,
                "range transfer stalled, aborting ({read} bytes{})",
                percent_of(read, expected)
            );
            sr.second_get_error = STALL_ABORT.to_string();
        } else {
            debug!(probe = %label, "range read {read} bytes{}", percent_of(read, expected));
        }
    } else if let Some(err) = &range.error {
        sr.second_get_error = err.message.clone();
    }
    sr.second_get_cache_present = cache_present(&sr.second_get_header_age, &sr.second_get_x_cache);

    let warm = client.execute(
        &endpoint.spec(Method::Head, &probe_headers, RecorderLimits::default()),
        &deadline,
    );
    dials += warm.connects;
    sr.warm_head_time_ms = positive_millis(warm.elapsed);
    sr.warm_head_speedup = !head.elapsed.is_zero() && warm.elapsed < head.elapsed / 2;
    sr.warm_cache_suspected = sr.warm_head_speedup && sr.cache_present;
    sr.dial_count = Some(dials);
    sr.connection_reused_second_get = dials == 1;

    sr.speed_analysis = Some(analyze_speed_samples(&sr.transfer_speed_samples));
    log_completion(&sr, &label);
    sr
}

fn connect(target: SocketAddr, deadline: &Deadline) -> (Result<TcpStream, PhaseError>, Duration) {
    if deadline.expired() {
        return (Err(PhaseError::deadline()), Duration::ZERO);
    }
    let started = Instant::now();
    let timeout = deadline.cap(TCP_CONNECT_TIMEOUT).max(Duration::from_millis(1));
    let result = TcpStream::connect_timeout(&target, timeout).map_err(|err| {
        let mut phase = PhaseError::from_io(&err);
        phase.message = format!("dial tcp {target}: {}", phase.message);
        phase
    });
    (result, started.elapsed())
}

fn pin_address(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Runs `attempt` and, when it failed before any response with a transient
/// error, once more after a short backoff.
fn with_retry(label: &str, phase: &str, mut attempt: impl FnMut() -> Exchange) -> (Exchange, bool) {
    let first = attempt();
    if first.responded() || !is_transient(first.error.as_ref()) {
        return (first, false);
    }
    if let Some(err) = &first.error {
        warn!(probe = %label, phase, error = %err, "transient error, retrying once");
    }
    thread::sleep(RETRY_BACKOFF);
    (attempt(), true)
}

fn note_remote(sr: &mut SiteResult, remote_ip: &mut String, exchange: &Exchange) {
    if !remote_ip.is_empty() || exchange.remote_ip.is_empty() {
        return;
    }
    remote_ip.clone_from(&exchange.remote_ip);
    if sr.using_env_proxy {
        sr.proxy_remote_ip = remote_ip.clone();
        sr.proxy_remote_is_proxy = true;
        if sr.origin_ip_candidate.is_empty()
            && let Some(first) = sr.dns_ips.first()
        {
            sr.origin_ip_candidate = first.clone();
        }
    } else if sr.origin_ip_candidate.is_empty() {
        sr.origin_ip_candidate = remote_ip.clone();
    }
    let (hop, source) = detect_next_hop(remote_ip);
    if !hop.is_empty() {
        sr.next_hop = hop;
        sr.next_hop_source = source;
    }
}

fn fill_protocol_and_encoding(sr: &mut SiteResult, exchange: &Exchange) {
    if !exchange.protocol.is_empty() {
        sr.http_protocol = exchange.protocol.clone();
    }
    let codings = transfer_codings(exchange.headers.get("Transfer-Encoding"));
    if !codings.is_empty() {
        sr.chunked = codings
            .split(',')
            .any(|coding| coding.eq_ignore_ascii_case("chunked"));
        sr.transfer_encoding = codings;
    }
}

fn record_transfer(sr: &mut SiteResult, get: &Exchange, rtt: Duration, label: &str) {
    let read = i64::try_from(get.body_bytes).unwrap_or(i64::MAX);
    let content_length = get.headers.get("Content-Length").parse::<i64>().ok();

    sr.transfer_time_ms = Some(millis(get.body_elapsed));
    sr.transfer_size_bytes = Some(read);
    sr.transfer_speed_kbps = Some(kib_per_sec(get.body_bytes, get.body_elapsed));
    sr.transfer_speed_samples = get.samples.clone();

    let first_rtt = get.first_rtt_bytes.unwrap_or(0);
    if first_rtt > 0 {
        sr.first_rtt_bytes = Some(i64::try_from(first_rtt).unwrap_or(i64::MAX));
        let rtt_ms = millis(rtt).max(1) as f64;
        sr.first_rtt_goodput_kbps = Some(first_rtt as f64 / (rtt_ms / 1000.0) / 1024.0);
    }

    if get.stalled {
        let elapsed = get.stall_elapsed.unwrap_or(get.body_elapsed);
        warn!(
            probe = %label,
            "transfer stalled, aborting ({read} bytes{})",
            percent_of(read, content_length)
        );
        sr.transfer_stalled = true;
        sr.stall_elapsed_ms = Some(millis(elapsed));
        if sr.http_error.is_empty() {
            sr.http_error = STALL_ABORT.to_string();
        }
    }

    if let Some(expected) = content_length {
        sr.content_length_header = Some(expected);
        sr.content_length_mismatch = expected != read;
        if sr.content_length_mismatch && sr.http_error.is_empty() {
            sr.http_error = format!("partial_body: expected={expected} read={read}");
            warn!(probe = %label, expected, read, "content-length mismatch");
        }
    }
}

fn log_completion(sr: &SiteResult, label: &str) {
    let status = if sr.transfer_stalled {
        "aborted"
    } else if sr.content_length_mismatch {
        "incomplete"
    } else {
        "done"
    };
    let or_unknown = |value: &str| {
        if value.is_empty() {
            "(unknown)".to_string()
        } else {
            value.to_string()
        }
    };
    let bytes = sr.transfer_size_bytes.unwrap_or(0);
    let line = format!(
        "{status} head={} sec_get={} bytes={bytes}{} time={}ms speed={:.1}kbps dns={}ms tcp={}ms tls={}ms ttfb={}ms proto={} alpn={} tls_ver={}",
        sr.head_status.unwrap_or(0),
        sr.second_get_status.unwrap_or(0),
        percent_of(bytes, sr.content_length_header),
        sr.transfer_time_ms.unwrap_or(0),
        sr.transfer_speed_kbps.unwrap_or(0.0),
        sr.dns_time_ms.unwrap_or(0),
        sr.tcp_time_ms.unwrap_or(0),
        sr.ssl_handshake_time_ms.unwrap_or(0),
        sr.trace_ttfb_ms.unwrap_or(0),
        or_unknown(&sr.http_protocol),
        or_unknown(&sr.alpn),
        or_unknown(&sr.tls_version),
    );
    if status == "done" {
        info!(probe = %label, "{line}");
    } else {
        warn!(probe = %label, "{line}");
    }
}

#[cfg(test)]
mod tests;
