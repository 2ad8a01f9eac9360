//! Fixed-size worker pool that probes every configured site once.

use crate::probe::{ProbeOutcome, Site, monitor_site};
use crossbeam_channel::{Receiver, Sender};
use hdrhistogram::Histogram;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

const TTFB_HIGH_MS: u64 = 10 * 60 * 1000;

/// End-of-run digest of every emitted line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub sites: usize,
    pub lines: usize,
    pub failed_lines: usize,
    pub ttfb_samples: u64,
    pub ttfb_p50_ms: u64,
    pub ttfb_p90_ms: u64,
    pub ttfb_p99_ms: u64,
    pub ttfb_max_ms: u64,
}

/// Probes each site once on `workers` threads and logs a TTFB summary.
pub fn run_sites(sites: Vec<Site>, workers: usize) -> RunSummary {
    run_pool(sites, workers, monitor_site)
}

pub(crate) fn run_pool<F>(sites: Vec<Site>, workers: usize, probe: F) -> RunSummary
where
    F: Fn(&Site) -> Vec<ProbeOutcome> + Send + Clone + 'static,
{
    let site_count = sites.len();
    let workers = workers.clamp(1, site_count.max(1));
    let (job_tx, job_rx) = crossbeam_channel::bounded::<Site>(site_count.max(1));
    let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<ProbeOutcome>();

    let handles: Vec<JoinHandle<()>> = (0..workers)
        .map(|id| {
            let jobs = job_rx.clone();
            let outcomes = outcome_tx.clone();
            let probe = probe.clone();
            thread::spawn(move || run_worker(id, jobs, outcomes, probe))
        })
        .collect();
    drop(job_rx);
    drop(outcome_tx);

    for site in sites {
        if job_tx.send(site).is_err() {
            warn!("all workers exited early");
            break;
        }
    }
    drop(job_tx);

    let mut summary = RunSummary {
        sites: site_count,
        ..RunSummary::default()
    };
    let mut histogram = Histogram::<u64>::new_with_bounds(1, TTFB_HIGH_MS, 3).ok();
    for outcome in outcome_rx.iter() {
        summary.lines += 1;
        summary.failed_lines += usize::from(outcome.failed);
        if let (Some(hist), Some(ttfb)) = (histogram.as_mut(), outcome.ttfb_ms)
            && ttfb > 0
        {
            let _ = hist.record(ttfb.unsigned_abs().min(TTFB_HIGH_MS));
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            warn!("probe worker panicked");
        }
    }

    if let Some(hist) = histogram.filter(|hist| hist.len() > 0) {
        summary.ttfb_samples = hist.len();
        summary.ttfb_p50_ms = hist.value_at_quantile(0.50);
        summary.ttfb_p90_ms = hist.value_at_quantile(0.90);
        summary.ttfb_p99_ms = hist.value_at_quantile(0.99);
        summary.ttfb_max_ms = hist.max();
    }
    info!(
        sites = summary.sites,
        lines = summary.lines,
        failed = summary.failed_lines,
        ttfb_p50_ms = summary.ttfb_p50_ms,
        ttfb_p90_ms = summary.ttfb_p90_ms,
        ttfb_p99_ms = summary.ttfb_p99_ms,
        ttfb_max_ms = summary.ttfb_max_ms,
        "run complete"
    );
    summary
}

fn run_worker<F>(id: usize, jobs: Receiver<Site>, outcomes: Sender<ProbeOutcome>, probe: F)
where
    F: Fn(&Site) -> Vec<ProbeOutcome>,
{
    for site in jobs.iter() {
        debug!(worker = id, site = %site.name, "probing");
        for outcome in probe(&site) {
            if outcomes.send(outcome).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::run_pool;
    use crate::probe::{ProbeOutcome, Site};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn site(name: &str) -> Site {
        Site {
            name: name.to_string(),
            url: format!("https://{name}.example/"),
            country: String::new(),
        }
    }

    #[test]
    fn every_site_is_probed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sites: Vec<Site> = (0..7).map(|i| site(&format!("s{i}"))).collect();
        let summary = run_pool(sites, 3, move |site: &Site| {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![ProbeOutcome {
                site: site.name.clone(),
                ttfb_ms: Some(100),
                ..ProbeOutcome::default()
            }]
        });

        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert_eq!(summary.sites, 7);
        assert_eq!(summary.lines, 7);
        assert_eq!(summary.ttfb_samples, 7);
        assert_eq!(summary.ttfb_p50_ms, 100);
    }

    #[test]
    fn failures_and_missing_ttfb_are_counted() {
        let summary = run_pool(vec![site("a"), site("b")], 8, |site: &Site| {
            let failed = site.name == "a";
            vec![
                ProbeOutcome {
                    failed,
                    ttfb_ms: (!failed).then_some(40),
                    ..ProbeOutcome::default()
                },
                ProbeOutcome {
                    ttfb_ms: Some(200),
                    ..ProbeOutcome::default()
                },
            ]
        });

        assert_eq!(summary.lines, 4);
        assert_eq!(summary.failed_lines, 1);
        assert_eq!(summary.ttfb_samples, 3);
        assert_eq!(summary.ttfb_max_ms, 200);
    }

    #[test]
    fn empty_site_list_finishes() {
        let summary = run_pool(Vec::new(), 4, |_: &Site| Vec::new());
        assert_eq!(summary, Default::default());
    }
}
