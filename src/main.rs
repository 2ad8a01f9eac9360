use netquality::analysis::{analyze_recent_results_full_with_options, compare_last_vs_previous};
use netquality::calibration::{local_max_speed_probe, run_local_speed_calibration};
use netquality::config::SCHEMA_VERSION;
use netquality::data_model::settings::{AnalyzeSettings, Command};
use netquality::meta;
use netquality::runtime::run_sites;
use netquality::settings::{apply_probe_settings, load_from_cli};
use netquality::writer::{close_result_writer, init_result_writer};
use serde_json::json;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const SELFTEST_DURATION: Duration = Duration::from_millis(500);

fn main() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "netquality=info".into()))
        .with(fmt::layer().with_writer(io::stderr))
        .init();

    let settings = load_from_cli()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

    match settings.command {
        Command::Probe(probe) => {
            apply_probe_settings(&settings.situation, &probe);
            if probe.selftest {
                match local_max_speed_probe(SELFTEST_DURATION) {
                    Ok(kbps) => meta::set_local_selftest_kbps(kbps),
                    Err(err) => warn!(error = %err, "local self-test failed"),
                }
            }
            info!(
                run_tag = %probe.run_tag,
                sites = probe.sites.len(),
                workers = probe.workers,
                "probe run"
            );
            init_result_writer(&settings.results_file);
            run_sites(probe.sites, probe.workers);
            close_result_writer();
        }
        Command::Analyze(analyze) => print_analysis(&settings.results_file, &analyze)?,
        Command::Calibrate(calibrate) => {
            let calibration =
                run_local_speed_calibration(&calibrate.targets_kbps, calibrate.duration)
                    .map_err(io::Error::other)?;
            print_json(&calibration)?;
        }
    }
    Ok(())
}

fn print_analysis(path: &Path, analyze: &AnalyzeSettings) -> io::Result<()> {
    let summaries = analyze_recent_results_full_with_options(
        path,
        SCHEMA_VERSION,
        analyze.max_batches,
        &analyze.options,
    )
    .map_err(io::Error::other)?;
    let comparison = compare_last_vs_previous(&summaries);
    print_json(&json!({
        "batches": summaries,
        "comparison": comparison,
    }))
}

fn print_json(value: &impl serde::Serialize) -> io::Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{text}")
}
