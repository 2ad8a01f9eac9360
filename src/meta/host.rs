use crate::model::Meta;
use curl::easy::Easy;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fs;
use std::net::{IpAddr, UdpSocket};
use std::process::Command;
use std::time::Duration;
use tracing::debug;

const PUBLIC_IP_ENDPOINTS: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://ipinfo.io/ip",
];
const WIFI_PREFIXES: &[&str] = &["wl", "wlan", "wifi", "air", "ath"];
const HOME_ASN_HINTS: &[&str] = &[
    "comcast", "telecom", "cable", "verizon", "vodafone", "t-mobile", "orange", "at&t", "charter",
];
const OFFICE_ASN_HINTS: &[&str] = &["cloud", "corp", "enterprise", "datacenter", "hosting", "colo"];

pub(super) fn gather(lookup_public: bool, public_timeout: Duration) -> Meta {
    let mut meta = Meta {
        hostname: hostname().unwrap_or_default(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        user: current_user(),
        kernel_version: kernel_version(),
        uptime_seconds: read_uptime(),
        local_ip: outbound_ip().map(|ip| ip.to_string()).unwrap_or_default(),
        default_iface: default_interface().unwrap_or_default(),
        connection_type: detect_connection_type(),
        containerized: detect_container(),
        ..Meta::default()
    };
    let cpus = std::thread::available_parallelism().map(|n| n.get()).ok();
    meta.num_cpu = cpus;
    meta.gomaxprocs = cpus;
    if let Some((one, five, fifteen)) = read_loadavg() {
        meta.load_avg_1 = Some(one);
        meta.load_avg_5 = Some(five);
        meta.load_avg_15 = Some(fifteen);
    }
    if let Some((total, available)) = read_meminfo() {
        meta.mem_total_bytes = Some(total);
        meta.mem_free_or_available_bytes = Some(available);
    }
    if let Some((total, free)) = read_disk("/") {
        meta.disk_root_total_bytes = Some(total);
        meta.disk_root_free_bytes = Some(free);
    }

    if lookup_public {
        let public = fetch_public_ips(public_timeout);
        let (v4, v6): (Vec<String>, Vec<String>) = public
            .into_iter()
            .filter(|ip| ip.parse::<IpAddr>().is_ok())
            .partition(|ip| ip.parse::<IpAddr>().map(|a| a.is_ipv4()).unwrap_or(false));
        meta.public_ipv4_consensus = consensus_ip(&v4);
        meta.public_ipv6_consensus = consensus_ip(&v6);
        meta.public_ipv4_candidates = v4;
        meta.public_ipv6_candidates = v6;
    }
    meta
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let name = CStr::from_bytes_until_nul(&buf).ok()?;
    Some(name.to_string_lossy().into_owned())
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
        .or_else(|| {
            dirs::home_dir()
                .and_then(|home| home.file_name().map(|n| n.to_string_lossy().into_owned()))
        })
        .unwrap_or_default()
}

fn kernel_version() -> String {
    fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|_| format!("{}-unknown", std::env::consts::OS))
}

fn read_loadavg() -> Option<(f64, f64, f64)> {
    let raw = fs::read_to_string("/proc/loadavg").ok()?;
    parse_loadavg(&raw)
}

fn parse_loadavg(raw: &str) -> Option<(f64, f64, f64)> {
    let mut parts = raw.split_whitespace().map(|p| p.parse::<f64>());
    let one = parts.next()?.ok()?;
    let five = parts.next()?.ok()?;
    let fifteen = parts.next()?.ok()?;
    Some((one, five, fifteen))
}

fn read_uptime() -> Option<f64> {
    let raw = fs::read_to_string("/proc/uptime").ok()?;
    raw.split_whitespace().next()?.parse().ok()
}

fn read_meminfo() -> Option<(u64, u64)> {
    let raw = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&raw)
}

fn parse_meminfo(raw: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total_kb = field("MemTotal:").filter(|kb| *kb > 0)?;
    let available_kb = field("MemAvailable:").unwrap_or(0);
    Some((total_kb * 1024, available_kb * 1024))
}

fn read_disk(path: &str) -> Option<(u64, u64)> {
    let c_path = CString::new(path).ok()?;
    unsafe {
        let mut stat: libc::statfs = std::mem::zeroed();
        if libc::statfs(c_path.as_ptr(), &mut stat) != 0 {
            return None;
        }
        let block = stat.f_bsize as u64;
        Some((stat.f_blocks as u64 * block, stat.f_bavail as u64 * block))
    }
}

/// Local address the kernel would use for outbound traffic. No packet is sent.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn default_interface() -> Option<String> {
    let local = outbound_ip()?;
    interface_for(local)
}

fn interface_for(target: IpAddr) -> Option<String> {
    let mut found = None;
    unsafe {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut head) != 0 {
            return None;
        }
        let mut cursor = head;
        while !cursor.is_null() {
            let entry = &*cursor;
            if !entry.ifa_addr.is_null() && sockaddr_ip(entry.ifa_addr) == Some(target) {
                found = Some(CStr::from_ptr(entry.ifa_name).to_string_lossy().into_owned());
                break;
            }
            cursor = entry.ifa_next;
        }
        libc::freeifaddrs(head);
    }
    found
}

unsafe fn sockaddr_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    unsafe {
        match (*addr).sa_family as libc::c_int {
            libc::AF_INET => {
                let v4 = &*(addr as *const libc::sockaddr_in);
                Some(IpAddr::from(u32::from_be(v4.sin_addr.s_addr).to_be_bytes()))
            }
            libc::AF_INET6 => {
                let v6 = &*(addr as *const libc::sockaddr_in6);
                Some(IpAddr::from(v6.sin6_addr.s6_addr))
            }
            _ => None,
        }
    }
}

pub(super) fn detect_connection_type() -> String {
    match default_interface() {
        Some(iface) if !iface.is_empty() => connection_type_for(&iface).to_string(),
        _ => "unknown".to_string(),
    }
}

fn connection_type_for(iface: &str) -> &'static str {
    let name = iface.to_ascii_lowercase();
    if WIFI_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
        "wifi"
    } else if cfg!(target_os = "macos") && name == "en0" {
        "wifi/unknown"
    } else {
        "ethernet"
    }
}

fn detect_container() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }
    fs::read_to_string("/proc/1/cgroup")
        .map(|cgroup| {
            cgroup.contains("docker") || cgroup.contains("kubepods") || cgroup.contains("containerd")
        })
        .unwrap_or(false)
}

fn fetch_public_ips(timeout: Duration) -> Vec<String> {
    let mut ips: Vec<String> = Vec::new();
    for endpoint in PUBLIC_IP_ENDPOINTS {
        match fetch_text(endpoint, timeout) {
            Ok(body) => {
                let ip = body.trim().to_string();
                if !ip.is_empty() && !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
            Err(err) => debug!(endpoint, error = %err, "public ip lookup failed"),
        }
    }
    ips
}

fn fetch_text(url: &str, timeout: Duration) -> Result<String, curl::Error> {
    let mut body = Vec::new();
    let mut easy = Easy::new();
    easy.url(url)?;
    easy.timeout(timeout)?;
    easy.follow_location(true)?;
    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| {
            let room = 64usize.saturating_sub(body.len());
            body.extend_from_slice(&data[..data.len().min(room)]);
            Ok(data.len())
        })?;
        transfer.perform()?;
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Most frequent address, earliest seen on ties.
pub fn consensus_ip(ips: &[String]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for ip in ips {
        *counts.entry(ip.as_str()).or_default() += 1;
    }
    let mut best = "";
    let mut best_count = 0;
    for ip in ips {
        let count = counts[ip.as_str()];
        if count > best_count {
            best = ip;
            best_count = count;
        }
    }
    best.to_string()
}

pub fn classify_home_office(asn_org: &str) -> &'static str {
    let lower = asn_org.to_ascii_lowercase();
    if HOME_ASN_HINTS.iter().any(|hint| lower.contains(hint)) {
        "home"
    } else if OFFICE_ASN_HINTS.iter().any(|hint| lower.contains(hint)) {
        "office"
    } else {
        "unknown"
    }
}

/// Gateway the kernel routes `dest` through, with the tool that reported it.
pub fn detect_next_hop(dest: &str) -> (String, String) {
    if cfg!(target_os = "linux") {
        match Command::new("ip").args(["route", "get", dest]).output() {
            Ok(out) => (
                parse_ip_route_via(&String::from_utf8_lossy(&out.stdout)),
                "iproute2".to_string(),
            ),
            Err(_) => (String::new(), String::new()),
        }
    } else if cfg!(target_os = "macos") {
        match Command::new("route").args(["-n", "get", dest]).output() {
            Ok(out) => (
                parse_route_gateway(&String::from_utf8_lossy(&out.stdout)),
                "route".to_string(),
            ),
            Err(_) => (String::new(), String::new()),
        }
    } else {
        (String::new(), String::new())
    }
}

fn parse_ip_route_via(output: &str) -> String {
    let fields: Vec<&str> = output.split_whitespace().collect();
    fields
        .windows(2)
        .find(|pair| pair[0] == "via")
        .map(|pair| pair[1].to_string())
        .unwrap_or_default()
}

fn parse_route_gateway(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("gateway:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .unwrap_or_default()
}
