use crate::analysis::{
    AnalyzeOptions, DEFAULT_LOW_SPEED_THRESHOLD_KBPS, DEFAULT_MAX_BATCHES,
    DEFAULT_MICRO_STALL_MIN_GAP_MS,
};
use crate::common::net::{parse_target_url, url_host};
use crate::common::time::default_run_tag;
use crate::config::{self, DEFAULT_RESULTS_FILE};
use crate::data_model::settings::{
    AnalyzeSettings, AppSettings, CalibrateSettings, Command, ProbeSettings,
};
use crate::meta;
use crate::probe::Site;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CALIBRATION_TARGETS: [f64; 4] = [500.0, 1000.0, 5000.0, 20000.0];

#[derive(Parser, Debug)]
#[command(name = "netquality")]
#[command(about = "Internet quality probe and results analyzer", long_about = None)]
pub struct CliArgs {
    /// JSON Lines results file
    #[arg(
        long,
        global = true,
        env = "NETQUALITY_RESULTS_FILE",
        default_value = DEFAULT_RESULTS_FILE
    )]
    file: PathBuf,

    /// Situation label, e.g. Home, Office, VPN
    #[arg(long, global = true, env = "NETQUALITY_SITUATION", default_value = "")]
    situation: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Probe every site once and append one line per address
    Probe(ProbeArgs),
    /// Summarize the most recent batches of the results file
    Analyze(AnalyzeArgs),
    /// Measure loopback throughput against target rates
    Calibrate(CalibrateArgs),
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Site as NAME=URL, or a bare URL named after its host (repeatable)
    #[arg(short, long = "url", value_name = "NAME=URL", required = true)]
    urls: Vec<String>,

    /// Country code recorded with every site
    #[arg(long, default_value = "")]
    country: String,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Batch tag; defaults to the current UTC time
    #[arg(long, default_value = "")]
    run_tag: String,

    #[arg(long, default_value_t = 120)]
    http_timeout_secs: u64,

    #[arg(long, default_value_t = 20)]
    stall_timeout_secs: u64,

    /// Whole-site budget; 0 disables it
    #[arg(long, default_value_t = 0)]
    site_timeout_secs: u64,

    /// Addresses probed per site; 0 probes all
    #[arg(long, default_value_t = 0)]
    max_ips: usize,

    /// Apply the stall watchdog before the first response byte
    #[arg(long)]
    pre_ttfb_stall: bool,

    /// Skip the public IP echo lookups
    #[arg(long)]
    no_public_ip: bool,

    /// Run a loopback throughput self-test before probing
    #[arg(long)]
    selftest: bool,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    #[arg(long, default_value_t = DEFAULT_MAX_BATCHES)]
    max_batches: usize,

    #[arg(long, default_value_t = DEFAULT_LOW_SPEED_THRESHOLD_KBPS)]
    low_speed_threshold_kbps: f64,

    #[arg(long, default_value_t = DEFAULT_MICRO_STALL_MIN_GAP_MS)]
    micro_stall_min_gap_ms: i64,

    /// Log discovered batches and a one-line summary per batch
    #[arg(long)]
    debug: bool,
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    /// Target rate (repeatable)
    #[arg(long = "target-kbps", value_name = "KBPS")]
    targets: Vec<f64>,

    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid site {value:?}: expected NAME=URL or an http(s) URL")]
    InvalidSite { value: String },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("calibration target must be a positive rate (got {value})")]
    InvalidTarget { value: f64 },
}

pub fn load_from_cli() -> Result<AppSettings, SettingsError> {
    let args = CliArgs::parse();
    from_args(args)
}

pub fn from_args(args: CliArgs) -> Result<AppSettings, SettingsError> {
    let command = match args.command {
        CliCommand::Probe(probe) => Command::Probe(probe_settings(probe)?),
        CliCommand::Analyze(analyze) => Command::Analyze(AnalyzeSettings {
            max_batches: analyze.max_batches,
            options: AnalyzeOptions {
                situation_filter: args.situation.trim().to_string(),
                low_speed_threshold_kbps: analyze.low_speed_threshold_kbps,
                micro_stall_min_gap_ms: analyze.micro_stall_min_gap_ms,
                debug: analyze.debug,
            },
        }),
        CliCommand::Calibrate(calibrate) => Command::Calibrate(calibrate_settings(calibrate)?),
    };
    Ok(AppSettings {
        results_file: args.file,
        situation: args.situation.trim().to_string(),
        command,
    })
}

fn probe_settings(args: ProbeArgs) -> Result<ProbeSettings, SettingsError> {
    if args.workers == 0 {
        return Err(SettingsError::Zero { name: "workers" });
    }
    if args.http_timeout_secs == 0 {
        return Err(SettingsError::Zero {
            name: "http timeout",
        });
    }
    if args.stall_timeout_secs == 0 {
        return Err(SettingsError::Zero {
            name: "stall timeout",
        });
    }
    let sites = args
        .urls
        .iter()
        .map(|value| parse_site(value, &args.country))
        .collect::<Result<Vec<_>, _>>()?;
    let run_tag = if args.run_tag.trim().is_empty() {
        default_run_tag()
    } else {
        args.run_tag.trim().to_string()
    };

    Ok(ProbeSettings {
        sites,
        workers: args.workers,
        run_tag,
        http_timeout: Duration::from_secs(args.http_timeout_secs),
        stall_timeout: Duration::from_secs(args.stall_timeout_secs),
        site_timeout: Duration::from_secs(args.site_timeout_secs),
        max_ips_per_site: args.max_ips,
        pre_ttfb_stall: args.pre_ttfb_stall,
        public_ip_lookup: !args.no_public_ip,
        selftest: args.selftest,
    })
}

fn calibrate_settings(args: CalibrateArgs) -> Result<CalibrateSettings, SettingsError> {
    if args.duration_ms == 0 {
        return Err(SettingsError::Zero { name: "duration" });
    }
    if let Some(bad) = args.targets.iter().find(|t| !(**t > 0.0 && t.is_finite())) {
        return Err(SettingsError::InvalidTarget { value: *bad });
    }
    let targets_kbps = if args.targets.is_empty() {
        DEFAULT_CALIBRATION_TARGETS.to_vec()
    } else {
        args.targets
    };
    Ok(CalibrateSettings {
        targets_kbps,
        duration: Duration::from_millis(args.duration_ms),
    })
}

/// `NAME=URL` or a bare URL. Bare URLs take their host as the name.
fn parse_site(value: &str, country: &str) -> Result<Site, SettingsError> {
    let invalid = || SettingsError::InvalidSite {
        value: value.to_string(),
    };
    let (name, raw_url) = match value.split_once('=') {
        Some((name, url)) if !name.contains("://") => (name.trim(), url.trim()),
        _ => ("", value.trim()),
    };
    let url = parse_target_url(raw_url).ok_or_else(invalid)?;
    let host = url_host(&url);
    if host.is_empty() || !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    let name = if name.is_empty() { host } else { name.to_string() };
    Ok(Site {
        name,
        url: url.to_string(),
        country: country.trim().to_string(),
    })
}

/// Installs the probe tunables and meta overlays for this process.
pub fn apply_probe_settings(situation: &str, settings: &ProbeSettings) {
    config::set_http_timeout(settings.http_timeout);
    config::set_stall_timeout(settings.stall_timeout);
    config::set_site_timeout(settings.site_timeout);
    config::set_max_ips_per_site(settings.max_ips_per_site);
    config::set_pre_ttfb_stall(settings.pre_ttfb_stall);
    config::set_public_ip_lookup(settings.public_ip_lookup);
    meta::set_situation(situation);
    meta::set_run_tag(&settings.run_tag);
}
