use super::helpers::{fetch_http_protocol, fetch_num_connects, map_curl_error, saturating_sub};
use crate::common::time::{Deadline, millis};
use crate::config::SPEED_SAMPLE_INTERVAL;
use crate::model::SpeedSample;
use crate::probe::{PhaseError, ProbeErrorKind, ResponseHeaders, normalize_http_protocol};
use curl::easy::{Easy2, Handler, HttpVersion, List, WriteError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub(super) const STALL_ABORT: &str = "stall_abort";
pub(super) const STALL_PRE_TTFB: &str = "stall_pre_ttfb";
pub(super) const STALL_PRE_BODY: &str = "stall_pre_body";

/// Counters shared with helper threads. Readers tolerate stale values, so
/// relaxed ordering is enough.
#[derive(Debug, Default)]
pub(super) struct TransferSignals {
    pub bytes: AtomicU64,
    pub first_byte: AtomicBool,
    pub cancel: AtomicBool,
    pub pre_ttfb_stall: AtomicBool,
}

impl TransferSignals {
    fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.first_byte.store(false, Ordering::Relaxed);
        self.cancel.store(false, Ordering::Relaxed);
        self.pre_ttfb_stall.store(false, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(super) struct RecorderLimits {
    /// Abort once the body makes no progress for this long. Zero disables.
    pub stall_timeout: Duration,
    /// Also abort when no response headers arrive within `stall_timeout`.
    pub stall_before_headers: bool,
    /// Record periodic speed samples and the first-RTT byte count.
    pub sample: bool,
    pub rtt: Duration,
}

/// Curl callback state for one request: headers of the final response,
/// body byte count, speed samples and stall bookkeeping.
pub(super) struct TransferRecorder {
    signals: Arc<TransferSignals>,
    limits: RecorderLimits,
    started: Instant,
    headers: ResponseHeaders,
    status_line: String,
    first_byte: Option<Instant>,
    headers_done: Option<Instant>,
    last_progress: Instant,
    next_sample: Option<Instant>,
    samples: Vec<SpeedSample>,
    body_bytes: u64,
    first_rtt_bytes: Option<u64>,
    stalled: bool,
    stalled_before_headers: bool,
    stall_elapsed: Option<Duration>,
}

impl TransferRecorder {
    fn new(signals: Arc<TransferSignals>) -> Self {
        let now = Instant::now();
        Self {
            signals,
            limits: RecorderLimits::default(),
            started: now,
            headers: ResponseHeaders::default(),
            status_line: String::new(),
            first_byte: None,
            headers_done: None,
            last_progress: now,
            next_sample: None,
            samples: Vec::new(),
            body_bytes: 0,
            first_rtt_bytes: None,
            stalled: false,
            stalled_before_headers: false,
            stall_elapsed: None,
        }
    }

    fn reset(&mut self, limits: RecorderLimits) {
        let now = Instant::now();
        self.limits = limits;
        self.started = now;
        self.headers.clear();
        self.status_line.clear();
        self.first_byte = None;
        self.headers_done = None;
        self.last_progress = now;
        self.next_sample = None;
        self.samples.clear();
        self.body_bytes = 0;
        self.first_rtt_bytes = None;
        self.stalled = false;
        self.stalled_before_headers = false;
        self.stall_elapsed = None;
    }

    fn observe(&mut self, now: Instant) {
        let Some(body_start) = self.headers_done else {
            return;
        };
        if !self.limits.sample {
            return;
        }
        if let Some(next) = self.next_sample
            && now > next
        {
            let elapsed_ms = millis(now.duration_since(body_start));
            let speed_kbps = if elapsed_ms > 0 {
                self.body_bytes as f64 / (elapsed_ms as f64 / 1000.0) / 1024.0
            } else {
                0.0
            };
            self.samples.push(SpeedSample {
                time_ms: elapsed_ms,
                bytes: i64::try_from(self.body_bytes).unwrap_or(i64::MAX),
                speed_kbps,
            });
            self.next_sample = Some(next + SPEED_SAMPLE_INTERVAL);
        }
        if self.first_rtt_bytes.is_none()
            && self.body_bytes > 0
            && now.duration_since(body_start) >= self.limits.rtt
        {
            self.first_rtt_bytes = Some(self.body_bytes);
        }
    }

    fn stall_check(&mut self, now: Instant) -> bool {
        let limit = self.limits.stall_timeout;
        if limit.is_zero() {
            return true;
        }
        match self.headers_done {
            Some(body_start) => {
                if now.duration_since(self.last_progress) > limit {
                    self.stalled = true;
                    self.stall_elapsed = Some(now.duration_since(body_start));
                    return false;
                }
            }
            None => {
                if self.limits.stall_before_headers && now.duration_since(self.started) > limit {
                    self.stalled_before_headers = true;
                    return false;
                }
            }
        }
        true
    }
}

impl Handler for TransferRecorder {
    fn header(&mut self, data: &[u8]) -> bool {
        let now = Instant::now();
        if self.first_byte.is_none() {
            self.first_byte = Some(now);
            self.signals.first_byte.store(true, Ordering::Relaxed);
        }
        let line = String::from_utf8_lossy(data);
        let line = line.trim();
        if line.starts_with("HTTP/") {
            // Each response in a redirect chain (or a 1xx) starts over.
            self.headers.clear();
            self.headers_done = None;
            self.status_line = line.to_string();
        } else if line.is_empty() {
            self.headers_done = Some(now);
            self.last_progress = now;
            self.next_sample = Some(now + SPEED_SAMPLE_INTERVAL);
        } else if let Some((name, value)) = line.split_once(':') {
            self.headers.push(name, value);
        }
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let now = Instant::now();
        let len = data.len() as u64;
        self.body_bytes = self.body_bytes.saturating_add(len);
        self.signals.bytes.fetch_add(len, Ordering::Relaxed);
        if len > 0 {
            self.last_progress = now;
        }
        self.observe(now);
        Ok(data.len())
    }

    fn progress(&mut self, _dltotal: f64, _dlnow: f64, _ultotal: f64, _ulnow: f64) -> bool {
        if self.signals.cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        self.observe(now);
        self.stall_check(now)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Method {
    Head,
    Get,
}

pub(super) struct RequestSpec<'a> {
    pub method: Method,
    pub url: &'a str,
    /// `host:port:address` pin so curl connects to the probed IP.
    pub resolve: &'a str,
    /// Empty means a direct connection, ignoring proxy environment variables.
    pub proxy: &'a str,
    pub headers: &'a [String],
    pub timeout: Duration,
    pub limits: RecorderLimits,
}

/// Curl phase timings, each measured from the start of the request.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct PhaseTimings {
    pub namelookup: Duration,
    pub connect: Duration,
    pub appconnect: Duration,
    pub pretransfer: Duration,
    pub starttransfer: Duration,
}

impl PhaseTimings {
    pub fn tcp_connect(&self) -> Duration {
        saturating_sub(self.connect, self.namelookup)
    }

    pub fn tls_handshake(&self) -> Duration {
        if self.appconnect.is_zero() {
            return Duration::ZERO;
        }
        saturating_sub(self.appconnect, self.connect)
    }
}

/// Everything observed for one request.
#[derive(Debug, Default)]
pub(super) struct Exchange {
    pub status: Option<u16>,
    pub protocol: String,
    pub headers: ResponseHeaders,
    pub error: Option<PhaseError>,
    pub elapsed: Duration,
    /// Request start to the end of the final response headers.
    pub headers_elapsed: Option<Duration>,
    pub first_byte: Option<Duration>,
    pub body_bytes: u64,
    pub body_elapsed: Duration,
    pub samples: Vec<SpeedSample>,
    pub first_rtt_bytes: Option<u64>,
    pub stalled: bool,
    pub stall_elapsed: Option<Duration>,
    pub timings: PhaseTimings,
    pub connects: u32,
    pub remote_ip: String,
}

impl Exchange {
    /// Headers arrived; body trouble does not turn this into a failure.
    pub fn responded(&self) -> bool {
        self.headers_elapsed.is_some()
    }
}

pub(super) struct HttpClient {
    easy: Easy2<TransferRecorder>,
    signals: Arc<TransferSignals>,
}

impl HttpClient {
    pub fn new() -> Self {
        let signals = Arc::new(TransferSignals::default());
        let easy = Easy2::new(TransferRecorder::new(Arc::clone(&signals)));
        Self { easy, signals }
    }

    pub fn signals(&self) -> Arc<TransferSignals> {
        Arc::clone(&self.signals)
    }

    pub fn execute(&mut self, spec: &RequestSpec<'_>, deadline: &Deadline) -> Exchange {
        if deadline.expired() {
            return Exchange {
                error: Some(PhaseError::deadline()),
                ..Exchange::default()
            };
        }

        self.signals.reset();
        self.easy.reset();
        self.easy.get_mut().reset(spec.limits);
        let _ = self.easy.url(spec.url);
        let _ = self.easy.follow_location(true);
        let _ = self.easy.max_redirections(10);
        let _ = self.easy.progress(true);
        let _ = self.easy.http_version(HttpVersion::V2TLS);
        let _ = self
            .easy
            .timeout(deadline.cap(spec.timeout).max(Duration::from_millis(1)));
        let _ = self.easy.proxy(spec.proxy);
        let _ = self.easy.nobody(spec.method == Method::Head);
        if !spec.resolve.is_empty() {
            let mut list = List::new();
            let _ = list.append(spec.resolve);
            let _ = self.easy.resolve(list);
        }
        if !spec.headers.is_empty() {
            let mut list = List::new();
            for header in spec.headers {
                let _ = list.append(header);
            }
            let _ = self.easy.http_headers(list);
        }

        let started = Instant::now();
        let result = self.easy.perform();
        let finished = Instant::now();

        let recorder = self.easy.get_mut();
        let stalled_before_headers = recorder.stalled_before_headers;
        let mut exchange = Exchange {
            headers: std::mem::take(&mut recorder.headers),
            elapsed: finished.duration_since(started),
            headers_elapsed: recorder.headers_done.map(|at| at.duration_since(started)),
            first_byte: recorder.first_byte.map(|at| at.duration_since(started)),
            body_bytes: recorder.body_bytes,
            body_elapsed: recorder
                .headers_done
                .map(|at| finished.duration_since(at))
                .unwrap_or_default(),
            samples: std::mem::take(&mut recorder.samples),
            first_rtt_bytes: recorder.first_rtt_bytes,
            stalled: recorder.stalled,
            stall_elapsed: recorder.stall_elapsed,
            ..Exchange::default()
        };
        let status_line = std::mem::take(&mut recorder.status_line);

        exchange.status = self
            .easy
            .response_code()
            .ok()
            .filter(|code| *code > 0)
            .and_then(|code| u16::try_from(code).ok());
        exchange.protocol = fetch_http_protocol(self.easy.raw()).unwrap_or_else(|| {
            normalize_http_protocol(status_line.split_whitespace().next().unwrap_or_default())
        });
        exchange.connects = fetch_num_connects(self.easy.raw());
        exchange.remote_ip = self
            .easy
            .primary_ip()
            .ok()
            .flatten()
            .unwrap_or_default()
            .to_string();
        exchange.timings = PhaseTimings {
            namelookup: self.easy.namelookup_time().unwrap_or_default(),
            connect: self.easy.connect_time().unwrap_or_default(),
            appconnect: self.easy.appconnect_time().unwrap_or_default(),
            pretransfer: self.easy.pretransfer_time().unwrap_or_default(),
            starttransfer: self.easy.starttransfer_time().unwrap_or_default(),
        };

        if let Err(err) = result {
            exchange.error = Some(if self.signals.pre_ttfb_stall.load(Ordering::Relaxed) {
                PhaseError::new(ProbeErrorKind::Aborted, STALL_PRE_TTFB)
            } else if stalled_before_headers {
                PhaseError::new(ProbeErrorKind::Aborted, STALL_PRE_BODY)
            } else if exchange.stalled {
                PhaseError::new(ProbeErrorKind::Aborted, STALL_ABORT)
            } else {
                map_curl_error(&err, deadline)
            });
        }
        exchange
    }
}
