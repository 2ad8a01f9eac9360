//! Error message bucketing for per-batch reason counts.

const MARKERS: &[&str] = &["stall_pre_ttfb", "stall_pre_body", "stall_abort"];

fn marker(lower: &str) -> Option<&'static str> {
    if let Some(found) = MARKERS.iter().copied().find(|m| lower.contains(m)) {
        return Some(found);
    }
    lower.starts_with("partial_body").then_some("partial_body")
}

fn any(lower: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| lower.contains(needle))
}

fn is_timeout(lower: &str) -> bool {
    any(lower, &["timeout", "timed out", "deadline exceeded"])
}

/// Coarse bucket for an error message.
pub fn normalize_error_reason(message: &str) -> String {
    let lower = message.trim().to_lowercase();
    if lower.is_empty() {
        return String::new();
    }
    if let Some(found) = marker(&lower) {
        return found.to_string();
    }
    let bucket = if lower.contains("proxy") {
        "proxy"
    } else if is_timeout(&lower) {
        "timeout"
    } else if any(&lower, &["connection refused", "econnrefused"]) {
        "conn_refused"
    } else if any(&lower, &["connection reset", "reset by peer", "rst_stream"]) {
        "conn_reset"
    } else if any(
        &lower,
        &[
            "no such host",
            "server misbehaving",
            "name or service not known",
            "could not resolve",
            "no record found",
        ],
    ) {
        "dns_failure"
    } else if any(&lower, &["x509", "certificate"]) {
        "tls_cert"
    } else if any(&lower, &["tls", "ssl", "handshake"]) {
        "tls_handshake"
    } else if any(&lower, &["network is unreachable", "no route to host"]) {
        "unreachable"
    } else if lower.contains("eof") {
        "eof"
    } else {
        "other"
    };
    bucket.to_string()
}

/// Like [`normalize_error_reason`], but a HEAD status of 4xx/5xx wins over
/// the message text unless the message is one of the probe's own markers.
pub fn normalize_http_reason(message: &str, status: u16) -> String {
    let lower = message.trim().to_lowercase();
    if let Some(found) = marker(&lower) {
        return found.to_string();
    }
    match status {
        500..=599 => "http_5xx".to_string(),
        400..=499 => "http_4xx".to_string(),
        _ => normalize_error_reason(message),
    }
}

/// A standalone three digit token in the HTTP status range.
fn status_token(lower: &str) -> Option<u16> {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|code| (100..=599).contains(code))
}

/// Fine-grained bucket. `phase` names where the error was recorded
/// (`tcp`, `tls` or `http`) and decides how bare timeouts are split.
pub fn normalize_error_reason_detailed(message: &str, head_status: u16, phase: &str) -> String {
    let lower = message.trim().to_lowercase();
    if lower.is_empty() {
        return String::new();
    }
    if let Some(found) = marker(&lower) {
        return found.to_string();
    }

    if lower.contains("proxyconnect") {
        let bucket = if is_timeout(&lower) {
            "proxy_connect_timeout"
        } else if lower.contains("refused") {
            "proxy_connect_refused"
        } else {
            "proxy_connect_error"
        };
        return bucket.to_string();
    }
    if lower.contains("proxy") {
        return "proxy_error".to_string();
    }

    if any(&lower, &["status", "http"])
        && let Some(code) = status_token(&lower)
    {
        return format!("http_{code}");
    }
    if head_status >= 400 {
        return format!("http_{head_status}");
    }

    if any(&lower, &["x509", "certificate", "tls", "ssl", "handshake"]) {
        let bucket = if any(&lower, &["expired", "not yet valid"]) {
            "tls_cert_expired"
        } else if any(
            &lower,
            &[
                "unknown authority",
                "self signed",
                "self-signed",
                "unable to get local issuer",
            ],
        ) {
            "tls_cert_untrusted"
        } else if any(
            &lower,
            &["not valid for", "hostname", "doesn't match", "does not match"],
        ) {
            "tls_cert_hostname"
        } else if lower.contains("handshake failure") {
            "tls_alert_handshake_failure"
        } else if lower.contains("no application protocol") {
            "tls_alert_no_application_protocol"
        } else if lower.contains("protocol version") {
            "tls_alert_protocol_version"
        } else if is_timeout(&lower) {
            "timeout_tls"
        } else if any(&lower, &["x509", "certificate"]) {
            "tls_cert_other"
        } else {
            "tls_handshake"
        };
        return bucket.to_string();
    }

    if any(
        &lower,
        &[
            "no such host",
            "name or service not known",
            "no address associated",
            "host not found",
            "could not resolve",
            "nxdomain",
            "no record found",
        ],
    ) {
        return "dns_no_such_host".to_string();
    }
    if any(
        &lower,
        &[
            "temporary failure in name resolution",
            "try again",
            "server misbehaving",
        ],
    ) {
        return "dns_temp_failure".to_string();
    }
    if lower.starts_with("lookup ") || lower.contains("dns") {
        let bucket = if is_timeout(&lower) {
            "dns_timeout"
        } else {
            "dns_failure"
        };
        return bucket.to_string();
    }

    if lower.contains("administratively prohibited") {
        return "net_admin_prohibited".to_string();
    }
    if lower.contains("connection abort") {
        return "conn_abort".to_string();
    }
    if any(
        &lower,
        &["closed by peer", "connection reset", "reset by peer", "rst_stream"],
    ) {
        return "conn_reset".to_string();
    }
    if any(&lower, &["connection refused", "econnrefused"]) {
        return "conn_refused".to_string();
    }
    if any(&lower, &["network is unreachable", "no route to host"]) {
        return "unreachable".to_string();
    }

    if is_timeout(&lower) {
        let bucket = if phase == "tcp" {
            "timeout_connect"
        } else if any(&lower, &["awaiting headers", "ttfb"]) {
            "timeout_ttfb"
        } else if lower.contains("read") {
            "timeout_read"
        } else {
            "timeout"
        };
        return bucket.to_string();
    }

    normalize_error_reason(message)
}
