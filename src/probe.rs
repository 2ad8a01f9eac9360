use crate::model::SiteResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

pub use crate::features::probe::classify::{
    ENTERPRISE_PROXIES, ProxyClassification, ResponseHeaders, cache_present, classify_cert_proxy,
    classify_proxy, normalize_http_protocol, tls_version_label,
};
pub use crate::features::probe::engine::{monitor_site, monitor_site_ip};

/// One configured endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Site {
    pub name: String,
    pub url: String,
    pub country: String,
}

/// Digest of one emitted line, handed back to the caller of a probe.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeOutcome {
    pub site: String,
    pub ip: String,
    pub ttfb_ms: Option<i64>,
    pub speed_kbps: Option<f64>,
    pub failed: bool,
}

impl From<&SiteResult> for ProbeOutcome {
    fn from(result: &SiteResult) -> Self {
        Self {
            site: result.name.clone(),
            ip: result.ip.clone(),
            ttfb_ms: result.trace_ttfb_ms,
            speed_kbps: result.transfer_speed_kbps,
            failed: !result.tcp_error.is_empty()
                || !result.ssl_error.is_empty()
                || !result.http_error.is_empty(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ProbeErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    /// The whole-site deadline ran out; never retried.
    Deadline,
    Eof,
    Reset,
    Aborted,
    Http,
    Io,
}

impl ProbeErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeErrorKind::Dns => "dns",
            ProbeErrorKind::Connect => "connect",
            ProbeErrorKind::Tls => "tls",
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::Deadline => "deadline",
            ProbeErrorKind::Eof => "eof",
            ProbeErrorKind::Reset => "reset",
            ProbeErrorKind::Aborted => "aborted",
            ProbeErrorKind::Http => "http",
            ProbeErrorKind::Io => "io",
        }
    }
}

/// Failure of one probe phase. The message is what lands in the telemetry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseError {
    pub kind: ProbeErrorKind,
    pub message: String,
}

pub const DEADLINE_EXCEEDED: &str = "context deadline exceeded";

impl PhaseError {
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn deadline() -> Self {
        Self::new(ProbeErrorKind::Deadline, DEADLINE_EXCEEDED)
    }

    pub fn from_io(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused => ProbeErrorKind::Connect,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProbeErrorKind::Reset,
            io::ErrorKind::UnexpectedEof => ProbeErrorKind::Eof,
            _ => ProbeErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PhaseError {}

/// Errors worth exactly one more attempt: connection drops, EOFs and
/// timeouts that are not the site deadline running out.
pub fn is_transient(err: Option<&PhaseError>) -> bool {
    let Some(err) = err else {
        return false;
    };
    match err.kind {
        ProbeErrorKind::Deadline => return false,
        ProbeErrorKind::Eof | ProbeErrorKind::Reset => return true,
        _ => {}
    }

    let lower = err.message.to_ascii_lowercase();
    if lower.contains(DEADLINE_EXCEEDED) {
        return false;
    }
    lower == "eof"
        || lower.contains("unexpected eof")
        || lower.contains("use of closed network connection")
        || lower.contains("connection reset by peer")
        || lower.contains("broken pipe")
        || (lower.contains("http2") && lower.contains("stream closed"))
        || lower.contains("temporary")
        || lower.contains("timeout")
        || lower.contains("timed out")
}
