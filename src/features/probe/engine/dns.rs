use crate::probe::{PhaseError, ProbeErrorKind};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use trust_dns_resolver::Resolver;
use trust_dns_resolver::config::{NameServerConfig, Protocol};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::system_conf::read_system_conf;

#[derive(Clone, Debug, Default)]
pub(super) struct DnsAnswer {
    pub ips: Vec<IpAddr>,
    pub elapsed: Duration,
    /// Name server the system resolver configuration points at (`ip:port`).
    pub server: String,
    pub server_network: String,
}

/// Resolves `host` through the system resolver configuration. IP literals
/// short-circuit without a query.
pub(super) fn resolve(host: &str, timeout: Duration) -> Result<DnsAnswer, (PhaseError, Duration)> {
    let start = Instant::now();
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(DnsAnswer {
            ips: vec![ip],
            elapsed: start.elapsed(),
            ..DnsAnswer::default()
        });
    }

    let (config, mut opts) = read_system_conf().map_err(|err| {
        (
            PhaseError::new(ProbeErrorKind::Dns, format!("read resolver config: {err}")),
            start.elapsed(),
        )
    })?;
    opts.timeout = timeout;
    opts.attempts = 1;
    let (server, server_network) = config
        .name_servers()
        .first()
        .map(describe_server)
        .unwrap_or_default();

    let resolver = Resolver::new(config, opts).map_err(|err| {
        (
            PhaseError::new(ProbeErrorKind::Dns, format!("start resolver: {err}")),
            start.elapsed(),
        )
    })?;
    let lookup = resolver.lookup_ip(host);
    let elapsed = start.elapsed();
    let lookup = lookup.map_err(|err| {
        let kind = match err.kind() {
            ResolveErrorKind::Timeout => ProbeErrorKind::Timeout,
            _ => ProbeErrorKind::Dns,
        };
        (PhaseError::new(kind, format!("lookup {host}: {err}")), elapsed)
    })?;

    let ips: Vec<IpAddr> = lookup.iter().collect();
    if ips.is_empty() {
        return Err((
            PhaseError::new(ProbeErrorKind::Dns, format!("lookup {host}: no such host")),
            elapsed,
        ));
    }
    Ok(DnsAnswer {
        ips,
        elapsed,
        server,
        server_network,
    })
}

fn describe_server(ns: &NameServerConfig) -> (String, String) {
    let network = match ns.protocol {
        Protocol::Udp => "udp".to_string(),
        Protocol::Tcp => "tcp".to_string(),
        other => format!("{other:?}").to_ascii_lowercase(),
    };
    (ns.socket_addr.to_string(), network)
}

/// Applies the per-site address cap: the first IPv4, plus the first IPv6
/// when the cap allows two or no IPv4 exists. Zero keeps every address.
pub(super) fn select_ips(ips: &[IpAddr], max: usize) -> Vec<IpAddr> {
    if max == 0 || ips.len() <= max {
        return ips.to_vec();
    }
    let v4 = ips.iter().find(|ip| ip.is_ipv4()).copied();
    let v6 = ips.iter().find(|ip| ip.is_ipv6()).copied();
    let mut selected = Vec::with_capacity(2);
    if let Some(ip) = v4 {
        selected.push(ip);
    }
    if let Some(ip) = v6
        && (max > 1 || v4.is_none())
    {
        selected.push(ip);
    }
    if selected.is_empty() {
        selected = ips[..max].to_vec();
    }
    selected
}
