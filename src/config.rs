use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Wire compatibility gate carried in every emitted `Meta`.
pub const SCHEMA_VERSION: u32 = 3;
pub const DEFAULT_RESULTS_FILE: &str = "monitor_results.jsonl";
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
pub const RETRY_BACKOFF: Duration = Duration::from_millis(300);
pub const RANGE_HEADER: &str = "Range: bytes=0-65535";

/// Process-wide probe tunables. A snapshot is taken at the start of every
/// site probe so later setter calls never affect a probe already in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeTunables {
    pub http_timeout: Duration,
    pub stall_timeout: Duration,
    pub dns_timeout: Duration,
    /// Zero disables the whole-site deadline.
    pub site_timeout: Duration,
    /// Zero probes every resolved address.
    pub max_ips_per_site: usize,
    pub pre_ttfb_stall: bool,
    pub public_ip_lookup: bool,
}

impl Default for ProbeTunables {
    fn default() -> Self {
        Self {
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            site_timeout: Duration::ZERO,
            max_ips_per_site: 0,
            pre_ttfb_stall: false,
            public_ip_lookup: true,
        }
    }
}

static TUNABLES: RwLock<Option<ProbeTunables>> = RwLock::new(None);

pub fn tunables() -> ProbeTunables {
    TUNABLES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_default()
}

fn update(apply: impl FnOnce(&mut ProbeTunables)) {
    let mut guard = TUNABLES.write().unwrap_or_else(PoisonError::into_inner);
    apply(guard.get_or_insert_with(ProbeTunables::default));
}

pub fn set_http_timeout(timeout: Duration) {
    if !timeout.is_zero() {
        update(|t| t.http_timeout = timeout);
    }
}

pub fn set_stall_timeout(timeout: Duration) {
    if !timeout.is_zero() {
        update(|t| t.stall_timeout = timeout);
    }
}

pub fn set_site_timeout(timeout: Duration) {
    if !timeout.is_zero() {
        update(|t| t.site_timeout = timeout);
    }
}

pub fn set_dns_timeout(timeout: Duration) {
    if !timeout.is_zero() {
        update(|t| t.dns_timeout = timeout);
    }
}

pub fn set_max_ips_per_site(max: usize) {
    if max > 0 {
        update(|t| t.max_ips_per_site = max);
    }
}

pub fn set_pre_ttfb_stall(enabled: bool) {
    update(|t| t.pre_ttfb_stall = enabled);
}

/// Public IP echo services are contacted on first metadata capture unless
/// this is switched off.
pub fn set_public_ip_lookup(enabled: bool) {
    update(|t| t.public_ip_lookup = enabled);
}

#[cfg(test)]
mod tests {
    use super::{ProbeTunables, DEFAULT_HTTP_TIMEOUT, DEFAULT_STALL_TIMEOUT};
    use std::time::Duration;

    #[test]
    fn defaults_match_documented_values() {
        let tunables = ProbeTunables::default();
        assert_eq!(tunables.http_timeout, DEFAULT_HTTP_TIMEOUT);
        assert_eq!(tunables.stall_timeout, DEFAULT_STALL_TIMEOUT);
        assert_eq!(tunables.dns_timeout, Duration::from_secs(5));
        assert_eq!(tunables.site_timeout, Duration::ZERO);
        assert_eq!(tunables.max_ips_per_site, 0);
        assert!(!tunables.pre_ttfb_stall);
    }

    #[test]
    fn setters_ignore_non_positive_values() {
        let before = super::tunables();
        super::set_http_timeout(Duration::ZERO);
        super::set_stall_timeout(Duration::ZERO);
        super::set_site_timeout(Duration::ZERO);
        super::set_max_ips_per_site(0);
        let after = super::tunables();
        assert_eq!(before.http_timeout, after.http_timeout);
        assert_eq!(before.stall_timeout, after.stall_timeout);
        assert_eq!(before.site_timeout, after.site_timeout);
        assert_eq!(before.max_ips_per_site, after.max_ips_per_site);
    }
}
