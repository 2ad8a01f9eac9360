//! Per-process metadata attached to every emitted line.
//!
//! Host facts are gathered once, on first use, and cached. Every call hands
//! out a fresh copy with a new timestamp and the current overlay values.

mod host;

use crate::common::time::now_rfc3339_nanos;
use crate::config::{self, SCHEMA_VERSION};
use crate::model::{Calibration, Meta, ResultEnvelope, SiteResult};
use std::sync::{OnceLock, PoisonError, RwLock};
use std::time::Duration;

pub use host::{classify_home_office, consensus_ip, detect_next_hop};

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(2);

static BASE_META: OnceLock<Meta> = OnceLock::new();

#[derive(Clone, Debug, Default)]
struct Overlay {
    situation: String,
    run_tag: String,
    local_selftest_kbps: Option<f64>,
    calibration: Option<Calibration>,
}

static OVERLAY: RwLock<Option<Overlay>> = RwLock::new(None);

fn with_overlay(apply: impl FnOnce(&mut Overlay)) {
    let mut guard = OVERLAY.write().unwrap_or_else(PoisonError::into_inner);
    apply(guard.get_or_insert_with(Overlay::default));
}

fn overlay() -> Overlay {
    OVERLAY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_default()
}

/// Situation label (e.g. Home, Office, VPN) stamped on every line.
pub fn set_situation(situation: &str) {
    let situation = situation.trim().to_string();
    with_overlay(|o| o.situation = situation);
}

pub fn set_run_tag(tag: &str) {
    let tag = tag.trim().to_string();
    with_overlay(|o| o.run_tag = tag);
}

pub fn set_local_selftest_kbps(kbps: f64) {
    if kbps > 0.0 {
        with_overlay(|o| o.local_selftest_kbps = Some(kbps));
    }
}

pub fn set_calibration(calibration: Calibration) {
    with_overlay(|o| o.calibration = Some(calibration));
}

pub fn calibration() -> Option<Calibration> {
    overlay().calibration
}

fn base_meta() -> &'static Meta {
    BASE_META.get_or_init(|| {
        let lookup_public = config::tunables().public_ip_lookup;
        host::gather(lookup_public, PUBLIC_IP_TIMEOUT)
    })
}

/// Copy of the cached metadata with a fresh timestamp and overlays applied.
pub fn current_meta() -> Meta {
    let mut meta = base_meta().clone();
    let overlay = overlay();
    meta.timestamp_utc = now_rfc3339_nanos();
    meta.schema_version = SCHEMA_VERSION;
    meta.situation = overlay.situation;
    meta.run_tag = overlay.run_tag;
    if overlay.local_selftest_kbps.is_some() {
        meta.local_selftest_kbps = overlay.local_selftest_kbps;
    }
    if overlay.calibration.is_some() {
        meta.calibration = overlay.calibration;
    }
    if meta.connection_type.is_empty() {
        meta.connection_type = host::detect_connection_type();
    }
    meta.home_office_estimate = classify_client_environment(&meta).to_string();
    meta
}

pub fn wrap_result(site: SiteResult) -> ResultEnvelope {
    ResultEnvelope {
        meta: Some(current_meta()),
        site_result: Some(site),
    }
}

/// ASN organisation when known, otherwise the link type, decides home vs office.
pub fn classify_client_environment(meta: &Meta) -> &'static str {
    if !meta.public_ipv4_asn_org.is_empty() {
        return classify_home_office(&meta.public_ipv4_asn_org);
    }
    if !meta.public_ipv6_asn_org.is_empty() {
        return classify_home_office(&meta.public_ipv6_asn_org);
    }
    if meta.connection_type.starts_with("wifi") {
        "home"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_client_environment, current_meta, set_calibration, set_run_tag, wrap_result};
    use crate::config::{self, SCHEMA_VERSION};
    use crate::model::{Calibration, Meta, SiteResult};

    #[test]
    fn client_environment_prefers_asn_then_link_type() {
        let mut meta = Meta {
            connection_type: "wifi".to_string(),
            ..Meta::default()
        };
        assert_eq!(classify_client_environment(&meta), "home");
        meta.public_ipv4_asn_org = "Example Hosting Datacenter".to_string();
        assert_eq!(classify_client_environment(&meta), "office");
        meta.public_ipv4_asn_org = "Comcast Cable".to_string();
        assert_eq!(classify_client_environment(&meta), "home");
        let wired = Meta {
            connection_type: "ethernet".to_string(),
            ..Meta::default()
        };
        assert_eq!(classify_client_environment(&wired), "unknown");
    }

    #[test]
    fn copies_carry_overlays_and_fresh_timestamps() {
        config::set_public_ip_lookup(false);
        set_run_tag("20250101_000000");
        set_calibration(Calibration {
            max_kbps: 9000.0,
            ..Calibration::default()
        });

        let envelope = wrap_result(SiteResult {
            name: "site".to_string(),
            ..SiteResult::default()
        });
        let meta = envelope.meta.expect("meta");
        assert_eq!(meta.schema_version, SCHEMA_VERSION);
        assert!(!meta.timestamp_utc.is_empty());
        assert_eq!(meta.run_tag, "20250101_000000");
        assert_eq!(meta.calibration.map(|c| c.max_kbps), Some(9000.0));
        assert!(!current_meta().home_office_estimate.is_empty());
    }
}
