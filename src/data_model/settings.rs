use crate::analysis::AnalyzeOptions;
use crate::probe::Site;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub results_file: PathBuf,
    pub situation: String,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Probe(ProbeSettings),
    Analyze(AnalyzeSettings),
    Calibrate(CalibrateSettings),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    pub sites: Vec<Site>,
    pub workers: usize,
    /// Empty selects a UTC timestamp tag.
    pub run_tag: String,
    pub http_timeout: Duration,
    pub stall_timeout: Duration,
    /// Zero disables the whole-site deadline.
    pub site_timeout: Duration,
    pub max_ips_per_site: usize,
    pub pre_ttfb_stall: bool,
    pub public_ip_lookup: bool,
    /// Measure loopback throughput first and stamp it on every line.
    pub selftest: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeSettings {
    pub max_batches: usize,
    pub options: AnalyzeOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrateSettings {
    pub targets_kbps: Vec<f64>,
    pub duration: Duration,
}
