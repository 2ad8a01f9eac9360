use super::client::Exchange;
use super::{DnsContext, probe_ip, with_retry};
use crate::common::time::Deadline;
use crate::config::ProbeTunables;
use crate::probe::{PhaseError, ProbeErrorKind, Site};
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

const BODY_LEN: usize = 200_000;
const STALLED_AFTER: usize = 4096;
const HOLD: Duration = Duration::from_secs(8);

#[derive(Clone, Copy, Debug, PartialEq)]
enum Request {
    Head,
    Get,
    Range,
}

#[derive(Clone, Copy)]
enum Behaviour {
    Complete,
    /// GET advertises the full length but closes after a few bytes.
    TruncatedGet,
    /// Every response carries `Connection: close`.
    CloseEach,
    /// Closes without answering the first two requests of this kind.
    DropFirstTwo(Request),
    /// Never answers the full GET.
    SilentGet,
    /// Sends part of the body of this kind of request, then goes quiet.
    StallBody(Request),
}

/// Minimal keep-alive HTTP/1.1 origin answering HEAD, GET and ranged GET.
fn spawn_origin(behaviour: Behaviour) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let dropped = Arc::new(AtomicUsize::new(0));
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(conn) = conn else { return };
            let dropped = Arc::clone(&dropped);
            thread::spawn(move || serve_connection(conn, behaviour, &dropped));
        }
    });
    port
}

fn serve_connection(conn: TcpStream, behaviour: Behaviour, dropped: &AtomicUsize) {
    let mut reader = BufReader::new(conn.try_clone().expect("clone"));
    let mut writer = conn;
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
            return;
        }
        let mut ranged = false;
        let mut probe = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("range:") {
                ranged = true;
            }
            if let Some(value) = lower.strip_prefix("x-probe:") {
                probe = value.trim().to_string();
            }
        }

        let kind = if request_line.starts_with("HEAD") {
            Request::Head
        } else if ranged {
            Request::Range
        } else {
            Request::Get
        };
        match behaviour {
            Behaviour::DropFirstTwo(target)
                if target == kind && dropped.fetch_add(1, Ordering::SeqCst) < 2 =>
            {
                return;
            }
            Behaviour::SilentGet if kind == Request::Get => {
                thread::sleep(HOLD);
                return;
            }
            _ => {}
        }

        let close = matches!(behaviour, Behaviour::CloseEach);
        let (status, len, mut extra) = if ranged {
            (
                "206 Partial Content",
                65_536,
                format!("Content-Range: bytes 0-65535/{BODY_LEN}\r\n"),
            )
        } else {
            ("200 OK", BODY_LEN, String::new())
        };
        if close {
            extra.push_str("Connection: close\r\n");
        }
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {len}\r\nX-Probe: {probe}\r\nAge: 7\r\n{extra}\r\n"
        );
        if writer.write_all(response.as_bytes()).is_err() {
            return;
        }
        if kind == Request::Head {
            if close {
                return;
            }
            continue;
        }
        if kind == Request::Get && matches!(behaviour, Behaviour::TruncatedGet) {
            let _ = writer.write_all(&[b'x'; 10]);
            return;
        }
        if matches!(behaviour, Behaviour::StallBody(target) if target == kind) {
            let _ = writer.write_all(&[b'x'; STALLED_AFTER]);
            let _ = writer.flush();
            thread::sleep(HOLD);
            return;
        }
        if writer.write_all(&vec![b'x'; len]).is_err() || close {
            return;
        }
    }
}

fn tunables() -> ProbeTunables {
    ProbeTunables {
        http_timeout: Duration::from_secs(10),
        stall_timeout: Duration::from_secs(3),
        public_ip_lookup: false,
        ..ProbeTunables::default()
    }
}

fn run(url: &str) -> crate::model::SiteResult {
    run_with(url, &tunables())
}

fn run_with(url: &str, tunables: &ProbeTunables) -> crate::model::SiteResult {
    let site = Site {
        name: "local".to_string(),
        url: url.to_string(),
        country: "ZZ".to_string(),
    };
    let parsed = Url::parse(url).expect("url");
    let dns = DnsContext {
        ips: vec!["127.0.0.1".to_string()],
        ..DnsContext::default()
    };
    probe_ip(
        &site,
        &parsed,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        0,
        &dns,
        Deadline::none(),
        tunables,
    )
}

fn origin_url(behaviour: Behaviour) -> String {
    let port = spawn_origin(behaviour);
    format!("http://127.0.0.1:{port}/blob.bin")
}

fn short_stall() -> ProbeTunables {
    ProbeTunables {
        stall_timeout: Duration::from_secs(1),
        ..tunables()
    }
}

#[test]
fn full_sequence_against_loopback_origin() {
    let port = spawn_origin(Behaviour::Complete);
    let sr = run(&format!("http://127.0.0.1:{port}/blob.bin"));

    assert!(sr.tcp_error.is_empty());
    assert!(sr.http_error.is_empty(), "{}", sr.http_error);
    assert_eq!(sr.head_status, Some(200));
    assert_eq!(sr.transfer_size_bytes, Some(BODY_LEN as i64));
    assert_eq!(sr.content_length_header, Some(BODY_LEN as i64));
    assert!(!sr.content_length_mismatch);
    assert!(!sr.transfer_stalled);
    assert_eq!(sr.http_protocol, "HTTP/1.1");
    assert_eq!(sr.ip_family, "ipv4");
    assert_eq!(sr.remote_ip, "127.0.0.1");
    assert!(!sr.ip_mismatch);
    assert!(sr.cache_present);
    assert_eq!(sr.header_age, "7");
    assert_eq!(sr.probe_header_value.len(), 32);
    assert!(sr.probe_echoed);
    assert_eq!(sr.second_get_status, Some(206));
    assert_eq!(sr.second_get_content_range, format!("bytes 0-65535/{BODY_LEN}"));
    assert!(sr.second_get_cache_present);
    assert!(sr.second_get_error.is_empty());
    assert_eq!(sr.dial_count, Some(1));
    assert!(sr.connection_reused_second_get);
    assert!(!sr.retried_once);
    assert_eq!(sr.country_configured, "ZZ");
    assert!(sr.speed_analysis.is_some());
}

#[test]
fn short_body_is_flagged_as_partial() {
    let port = spawn_origin(Behaviour::TruncatedGet);
    let sr = run(&format!("http://127.0.0.1:{port}/blob.bin"));

    assert_eq!(sr.transfer_size_bytes, Some(10));
    assert!(sr.content_length_mismatch);
    assert_eq!(
        sr.http_error,
        format!("partial_body: expected={BODY_LEN} read=10")
    );
    assert!(sr.speed_analysis.is_some());
}

#[test]
fn refused_connection_stops_after_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let sr = run(&format!("http://127.0.0.1:{port}/"));

    assert!(!sr.tcp_error.is_empty());
    assert!(sr.tcp_error.starts_with("dial tcp 127.0.0.1:"));
    assert_eq!(sr.head_status, None);
    assert!(sr.speed_analysis.is_none());
    assert_eq!(sr.ip_index, Some(0));
}

#[test]
fn plaintext_origin_fails_tls_for_https_urls() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    thread::spawn(move || {
        if let Ok((mut conn, _)) = listener.accept() {
            let _ = conn.write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n");
        }
    });
    let sr = run(&format!("https://127.0.0.1:{port}/"));

    assert!(sr.tcp_error.is_empty());
    assert!(!sr.ssl_error.is_empty());
    assert_eq!(sr.head_status, None);
    assert!(sr.transfer_size_bytes.is_none());
}

#[test]
fn expired_deadline_is_reported_without_network_work() {
    let port = spawn_origin(Behaviour::Complete);
    let site = Site {
        name: "late".to_string(),
        url: format!("http://127.0.0.1:{port}/"),
        country: String::new(),
    };
    let parsed = Url::parse(&site.url).expect("url");
    let deadline = Deadline::after(Duration::from_nanos(1));
    thread::sleep(Duration::from_millis(5));
    let sr = probe_ip(
        &site,
        &parsed,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        0,
        &DnsContext::default(),
        deadline,
        &tunables(),
    );
    assert_eq!(sr.tcp_error, crate::probe::DEADLINE_EXCEEDED);
}

#[test]
fn closing_origin_needs_a_dial_per_request() {
    let sr = run(&origin_url(Behaviour::CloseEach));

    assert!(sr.http_error.is_empty(), "{}", sr.http_error);
    assert_eq!(sr.transfer_size_bytes, Some(BODY_LEN as i64));
    assert!(sr.dial_count.unwrap_or(0) > 1);
    assert!(!sr.connection_reused_second_get);
}

#[test]
fn dropped_get_is_retried_once() {
    let sr = run(&origin_url(Behaviour::DropFirstTwo(Request::Get)));

    assert!(sr.http_error.is_empty(), "{}", sr.http_error);
    assert!(sr.retried_get);
    assert!(sr.retried_once);
    assert!(!sr.retried_head);
    assert!(!sr.retried_range);
    assert_eq!(sr.transfer_size_bytes, Some(BODY_LEN as i64));
}

#[test]
fn dropped_head_is_retried_once() {
    let sr = run(&origin_url(Behaviour::DropFirstTwo(Request::Head)));

    assert!(sr.retried_head);
    assert!(sr.retried_once);
    assert!(!sr.retried_get);
    assert!(sr.http_error.is_empty(), "{}", sr.http_error);
    assert_eq!(sr.transfer_size_bytes, Some(BODY_LEN as i64));
}

#[test]
fn dropped_range_is_retried_once() {
    let sr = run(&origin_url(Behaviour::DropFirstTwo(Request::Range)));

    assert!(sr.http_error.is_empty(), "{}", sr.http_error);
    assert!(sr.retried_range);
    assert!(sr.retried_once);
    assert!(!sr.retried_get);
    assert_eq!(sr.second_get_status, Some(206));
    assert!(sr.second_get_error.is_empty(), "{}", sr.second_get_error);
}

#[test]
fn transient_failure_gets_exactly_one_more_attempt() {
    let mut calls = 0;
    let (exchange, retried) = with_retry("local", "GET", || {
        calls += 1;
        Exchange {
            error: Some(PhaseError::new(ProbeErrorKind::Eof, "Empty reply from server")),
            ..Exchange::default()
        }
    });
    assert!(retried);
    assert_eq!(calls, 2);
    assert_eq!(exchange.error.map(|err| err.kind), Some(ProbeErrorKind::Eof));
}

#[test]
fn deadline_failure_is_not_retried() {
    let mut calls = 0;
    let (exchange, retried) = with_retry("local", "GET", || {
        calls += 1;
        Exchange {
            error: Some(PhaseError::deadline()),
            ..Exchange::default()
        }
    });
    assert!(!retried);
    assert_eq!(calls, 1);
    assert_eq!(exchange.error, Some(PhaseError::deadline()));
}

#[test]
fn response_after_body_error_is_not_retried() {
    let mut calls = 0;
    let (_, retried) = with_retry("local", "GET", || {
        calls += 1;
        Exchange {
            headers_elapsed: Some(Duration::from_millis(3)),
            error: Some(PhaseError::new(ProbeErrorKind::Reset, "Recv failure")),
            ..Exchange::default()
        }
    });
    assert!(!retried);
    assert_eq!(calls, 1);
}

#[test]
fn silent_origin_trips_pre_ttfb_stall() {
    let url = origin_url(Behaviour::SilentGet);
    let tunables = ProbeTunables {
        pre_ttfb_stall: true,
        ..short_stall()
    };
    let started = Instant::now();
    let sr = run_with(&url, &tunables);

    assert_eq!(sr.http_error, "stall_pre_ttfb");
    assert!(!sr.retried_get);
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(sr.speed_analysis.is_none());
}

#[test]
fn body_stall_aborts_the_transfer() {
    let sr = run_with(&origin_url(Behaviour::StallBody(Request::Get)), &short_stall());

    assert!(sr.transfer_stalled);
    assert!(sr.stall_elapsed_ms.unwrap_or(0) >= 1000);
    assert_eq!(sr.http_error, "stall_abort");
    assert_eq!(sr.transfer_size_bytes, Some(STALLED_AFTER as i64));
    assert!(sr.content_length_mismatch);
    assert!(!sr.retried_get);
    assert!(sr.second_get_error.is_empty(), "{}", sr.second_get_error);
}

#[test]
fn range_stall_is_reported_on_the_second_get() {
    let sr = run_with(&origin_url(Behaviour::StallBody(Request::Range)), &short_stall());

    assert!(sr.http_error.is_empty(), "{}", sr.http_error);
    assert!(!sr.transfer_stalled);
    assert_eq!(sr.second_get_status, Some(206));
    assert_eq!(sr.second_get_error, "stall_abort");
}
