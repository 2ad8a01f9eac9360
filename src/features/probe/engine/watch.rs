//! Helper threads that run next to a blocking transfer and talk to it only
//! through the shared `TransferSignals`.

use super::client::TransferSignals;
use crossbeam_channel::{RecvTimeoutError, Sender, select, tick};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PRE_TTFB_TICK: Duration = Duration::from_millis(200);
const MIN_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Stops its thread when dropped.
pub(super) struct Helper {
    quit: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Helper {
    fn spawn(body: impl FnOnce(crossbeam_channel::Receiver<()>) + Send + 'static) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let join = thread::spawn(move || body(rx));
        Self {
            quit: Some(tx),
            join: Some(join),
        }
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        self.quit.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Cancels the request when no response byte has arrived within
/// `stall_timeout` of `started`.
pub(super) fn pre_ttfb_guard(
    label: String,
    signals: Arc<TransferSignals>,
    stall_timeout: Duration,
) -> Helper {
    let started = Instant::now();
    Helper::spawn(move |quit| {
        let ticker = tick(PRE_TTFB_TICK);
        loop {
            select! {
                recv(quit) -> _ => return,
                recv(ticker) -> _ => {
                    if signals.first_byte.load(Ordering::Relaxed) {
                        return;
                    }
                    let waited = started.elapsed();
                    if waited > stall_timeout {
                        warn!(probe = %label, waited_ms = waited.as_millis() as u64, "pre-TTFB stall, aborting");
                        signals.pre_ttfb_stall.store(true, Ordering::Relaxed);
                        signals.cancel.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    })
}

/// Logs (never aborts) when the byte counter has not moved for
/// `max(stall_timeout / 2, 5s)`.
pub(super) fn progress_watchdog(
    label: String,
    signals: Arc<TransferSignals>,
    stall_timeout: Duration,
) -> Helper {
    let interval = (stall_timeout / 2).max(MIN_WATCHDOG_INTERVAL);
    Helper::spawn(move |quit| {
        let mut last_seen = 0u64;
        loop {
            match quit.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            let bytes = signals.bytes.load(Ordering::Relaxed);
            if bytes == last_seen {
                warn!(
                    probe = %label,
                    idle_ms = interval.as_millis() as u64,
                    "watchdog: no progress ({bytes} bytes so far)"
                );
            } else {
                debug!(probe = %label, "watchdog: progress {bytes}(+{}) bytes", bytes - last_seen);
            }
            last_seen = bytes;
        }
    })
}
