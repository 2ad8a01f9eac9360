use crate::common::time::Deadline;
use crate::probe::{PhaseError, ProbeErrorKind};
use curl::Error as CurlError;
use std::time::Duration;

// CURLINFO constants not exposed by curl-sys
// See: https://curl.se/libcurl/c/CURLINFO_HTTP_VERSION.html
// Use curl_sys::CURLINFO type for cross-platform compatibility (i32 on Windows, u32 on Unix)
const CURLINFO_LONG: curl_sys::CURLINFO = 0x200000;
const CURLINFO_NUM_CONNECTS: curl_sys::CURLINFO = CURLINFO_LONG + 26;
const CURLINFO_HTTP_VERSION: curl_sys::CURLINFO = CURLINFO_LONG + 46;

// HTTP version codes returned by CURLINFO_HTTP_VERSION
const CURL_HTTP_VERSION_1_0: i64 = 1;
const CURL_HTTP_VERSION_1_1: i64 = 2;
const CURL_HTTP_VERSION_2_0: i64 = 3;
const CURL_HTTP_VERSION_3: i64 = 30;

/// Classifies a transfer failure. Timeouts that coincide with the site
/// deadline running out become `Deadline` so they are never retried.
pub(super) fn map_curl_error(err: &CurlError, deadline: &Deadline) -> PhaseError {
    if err.is_operation_timedout() && deadline.expired() {
        return PhaseError::deadline();
    }
    let kind = if err.is_couldnt_resolve_host() || err.is_couldnt_resolve_proxy() {
        ProbeErrorKind::Dns
    } else if err.is_operation_timedout() {
        ProbeErrorKind::Timeout
    } else if err.is_couldnt_connect() {
        ProbeErrorKind::Connect
    } else if err.is_ssl_connect_error()
        || err.is_peer_failed_verification()
        || err.is_ssl_cacert()
        || err.is_ssl_certproblem()
        || err.is_ssl_cipher()
    {
        ProbeErrorKind::Tls
    } else if err.is_recv_error() || err.is_send_error() || err.is_http2_stream_error() {
        ProbeErrorKind::Reset
    } else if err.is_got_nothing() || err.is_partial_file() {
        ProbeErrorKind::Eof
    } else if err.is_aborted_by_callback() || err.is_write_error() {
        ProbeErrorKind::Aborted
    } else if err.is_http2_error() {
        ProbeErrorKind::Http
    } else {
        ProbeErrorKind::Io
    };
    PhaseError::new(kind, err.to_string())
}

pub(super) fn saturating_sub(left: Duration, right: Duration) -> Duration {
    left.checked_sub(right).unwrap_or(Duration::from_millis(0))
}

/// Connections curl had to open for the last transfer (0 when reused).
pub(super) fn fetch_num_connects(handle: *mut curl_sys::CURL) -> u32 {
    if handle.is_null() {
        return 0;
    }

    unsafe {
        let mut count: std::os::raw::c_long = 0;
        let rc = curl_sys::curl_easy_getinfo(
            handle,
            CURLINFO_NUM_CONNECTS,
            &mut count as *mut std::os::raw::c_long,
        );
        if rc != curl_sys::CURLE_OK {
            return 0;
        }
        u32::try_from(count).unwrap_or(0)
    }
}

/// Negotiated HTTP version as a wire protocol label (`HTTP/1.1`, `HTTP/2.0`).
pub(super) fn fetch_http_protocol(handle: *mut curl_sys::CURL) -> Option<String> {
    if handle.is_null() {
        return None;
    }

    unsafe {
        let mut version: std::os::raw::c_long = 0;
        let rc = curl_sys::curl_easy_getinfo(
            handle,
            CURLINFO_HTTP_VERSION,
            &mut version as *mut std::os::raw::c_long,
        );

        if rc != curl_sys::CURLE_OK {
            return None;
        }

        match version as i64 {
            CURL_HTTP_VERSION_1_0 => Some("HTTP/1.0".to_string()),
            CURL_HTTP_VERSION_1_1 => Some("HTTP/1.1".to_string()),
            CURL_HTTP_VERSION_2_0 => Some("HTTP/2.0".to_string()),
            CURL_HTTP_VERSION_3 => Some("HTTP/3.0".to_string()),
            _ => None,
        }
    }
}

/// `Transfer-Encoding` codings joined with commas, `identity` dropped.
pub(super) fn transfer_codings(header: &str) -> String {
    header
        .split(',')
        .map(str::trim)
        .filter(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case("identity"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Byte count announced by `Content-Range: bytes start-end/total`.
pub(super) fn content_range_len(header: &str) -> Option<i64> {
    let (unit, range) = header.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let span = range.split('/').next()?;
    let (start, end) = span.split_once('-')?;
    let start: i64 = start.trim().parse().ok()?;
    let end: i64 = end.trim().parse().ok()?;
    (end >= start).then_some(end - start + 1)
}

/// Average throughput in KiB/s; sub-millisecond transfers are treated as 0.5 ms.
pub(super) fn kib_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    if bytes == 0 {
        return 0.0;
    }
    let ms = elapsed.as_millis();
    let secs = if ms > 0 {
        ms as f64 / 1000.0
    } else {
        elapsed.as_secs_f64().max(0.0005)
    };
    bytes as f64 / secs / 1024.0
}

pub(super) fn percent_of(read: i64, expected: Option<i64>) -> String {
    match expected {
        Some(total) if total > 0 => format!(" ({:.1}%)", read as f64 * 100.0 / total as f64),
        _ => String::new(),
    }
}
