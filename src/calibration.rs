//! Loopback throughput calibration: a local HTTP server streams bytes,
//! either flat out or through a rate controller, and a curl client measures
//! what it actually receives.

use crate::common::time::{millis, now_rfc3339_nanos};
use crate::meta;
use crate::model::{Calibration, CalibrationPoint};
use curl::easy::{Easy2, Handler, WriteError};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_DURATION: Duration = Duration::from_millis(500);
const MAX_PROBE_CHUNK: usize = 64 * 1024;
const MIN_CHUNK: usize = 256;
const MAX_CHUNK: usize = 8 * 1024;
const MAX_BURST_CHUNKS: u64 = 8;
const ACCEPT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("bind loopback listener: {0}")]
    Bind(#[source] io::Error),
    #[error("loopback request failed: {0}")]
    Request(String),
    #[error("no time elapsed during loopback transfer")]
    NoElapsed,
}

#[derive(Clone, Copy, Debug)]
enum Pace {
    Unlimited,
    Kbps(f64),
}

/// Streams bytes as fast as the local stack allows for `duration` and
/// returns the observed rate in kbps.
pub fn local_max_speed_probe(duration: Duration) -> Result<f64, CalibrationError> {
    let duration = non_zero(duration);
    let addr = spawn_server(Pace::Unlimited, duration)?;
    let outcome = fetch(addr, duration);
    if !outcome.responded {
        return Err(CalibrationError::Request(outcome.error));
    }
    if outcome.elapsed.is_zero() {
        return Err(CalibrationError::NoElapsed);
    }
    Ok(kbps(outcome.bytes, outcome.elapsed))
}

/// Measures the unthrottled maximum, then each positive target rate, and
/// installs the result as the process calibration snapshot.
pub fn run_local_speed_calibration(
    targets: &[f64],
    duration: Duration,
) -> Result<Calibration, CalibrationError> {
    let duration = non_zero(duration);
    let mut calibration = Calibration {
        calibrated_utc: now_rfc3339_nanos(),
        probe_duration_ms: millis(duration),
        ..Calibration::default()
    };
    match local_max_speed_probe(duration) {
        Ok(max) => calibration.max_kbps = max,
        Err(err) => warn!(error = %err, "max speed probe failed"),
    }

    for &target in targets.iter().filter(|target| **target > 0.0) {
        let addr = spawn_server(Pace::Kbps(target), duration)?;
        let outcome = fetch(addr, duration);
        let point = if outcome.responded {
            let observed = if outcome.elapsed.is_zero() {
                0.0
            } else {
                kbps(outcome.bytes, outcome.elapsed)
            };
            CalibrationPoint {
                target_kbps: target,
                observed_kbps: observed,
                error_pct: (observed - target).abs() / target * 100.0,
                samples: outcome.reads,
            }
        } else {
            warn!(target_kbps = target, error = %outcome.error, "calibration request failed");
            CalibrationPoint {
                target_kbps: target,
                observed_kbps: 0.0,
                error_pct: 100.0,
                samples: 0,
            }
        };
        debug!(
            target_kbps = point.target_kbps,
            observed_kbps = point.observed_kbps,
            error_pct = point.error_pct,
            "calibration point"
        );
        calibration.ranges.push(point);
    }

    info!(
        max_kbps = calibration.max_kbps,
        points = calibration.ranges.len(),
        "local calibration complete"
    );
    meta::set_calibration(calibration.clone());
    Ok(calibration)
}

fn non_zero(duration: Duration) -> Duration {
    if duration.is_zero() {
        DEFAULT_DURATION
    } else {
        duration
    }
}

fn kbps(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 * 8.0 / 1000.0 / elapsed.as_secs_f64()
}

fn spawn_server(pace: Pace, duration: Duration) -> Result<SocketAddr, CalibrationError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(CalibrationError::Bind)?;
    let addr = listener.local_addr().map_err(CalibrationError::Bind)?;
    listener
        .set_nonblocking(true)
        .map_err(CalibrationError::Bind)?;
    thread::spawn(move || {
        let Some(stream) = accept_one(&listener, duration + ACCEPT_GRACE) else {
            return;
        };
        if let Err(err) = serve(stream, pace, duration) {
            debug!(error = %err, "calibration server stopped");
        }
    });
    Ok(addr)
}

fn accept_one(listener: &TcpListener, wait: Duration) -> Option<TcpStream> {
    let started = Instant::now();
    while started.elapsed() < wait {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).ok()?;
                return Some(stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(_) => return None,
        }
    }
    None
}

fn read_request(stream: &mut TcpStream) -> io::Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        request.extend_from_slice(&buf[..n]);
    }
    Ok(())
}

fn serve(mut stream: TcpStream, pace: Pace, duration: Duration) -> io::Result<()> {
    read_request(&mut stream)?;
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
    )?;
    match pace {
        Pace::Unlimited => {
            let chunk = vec![0xAA; MAX_PROBE_CHUNK];
            loop {
                stream.write_all(&chunk)?;
            }
        }
        Pace::Kbps(target) => stream_paced(&mut stream, target, duration),
    }
}

/// Feedback rate controller: tracks the bytes that should have been sent
/// by now and writes whole chunks to close the deficit, at most a burst at
/// a time, sleeping roughly one chunk interval when ahead.
fn stream_paced(stream: &mut TcpStream, target_kbps: f64, duration: Duration) -> io::Result<()> {
    let bytes_per_sec = (target_kbps * 1000.0 / 8.0).max(1.0);
    let chunk_len = ((bytes_per_sec * 0.02) as usize).clamp(MIN_CHUNK, MAX_CHUNK);
    let chunk = vec![0x5A; chunk_len];
    let sleep = Duration::from_secs_f64(chunk_len as f64 / bytes_per_sec).clamp(
        Duration::from_micros(200),
        Duration::from_millis(5),
    );

    let started = Instant::now();
    let stop = duration + Duration::from_millis(50);
    let mut sent = 0u64;
    while started.elapsed() < stop {
        let desired = (bytes_per_sec * started.elapsed().as_secs_f64()) as u64;
        let deficit = desired.saturating_sub(sent);
        let chunks = deficit / chunk_len as u64;
        if chunks == 0 {
            thread::sleep(sleep);
            continue;
        }
        for _ in 0..chunks.min(MAX_BURST_CHUNKS) {
            stream.write_all(&chunk)?;
            sent += chunk_len as u64;
        }
        stream.flush()?;
    }
    Ok(())
}

#[derive(Default)]
struct Counter {
    bytes: u64,
    reads: usize,
}

impl Handler for Counter {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.bytes += data.len() as u64;
        self.reads += 1;
        Ok(data.len())
    }
}

#[derive(Default)]
struct FetchOutcome {
    responded: bool,
    bytes: u64,
    reads: usize,
    elapsed: Duration,
    error: String,
}

/// Reads from the loopback server until `duration` has passed. Ending on
/// the timeout is the normal case, not a failure.
fn fetch(addr: SocketAddr, duration: Duration) -> FetchOutcome {
    let mut easy = Easy2::new(Counter::default());
    let _ = easy.url(&format!("http://{addr}/"));
    let _ = easy.proxy("");
    let _ = easy.timeout(duration);

    let started = Instant::now();
    let result = easy.perform();
    let elapsed = started.elapsed();

    let status = easy.response_code().unwrap_or(0);
    let counter = easy.get_ref();
    FetchOutcome {
        responded: status != 0,
        bytes: counter.bytes,
        reads: counter.reads,
        elapsed,
        error: result.err().map(|err| err.to_string()).unwrap_or_default(),
    }
}
