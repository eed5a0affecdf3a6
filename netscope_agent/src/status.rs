//! Periodic one-line status on stdout. Reads the store, never writes it.

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::state::SharedStore;
use crate::types::{format_speed, Snapshot};

pub fn status_line(s: &Snapshot) -> String {
    format!(
        "down {} | up {} | latency {:.1} ms, jitter {:.1} ms, loss {:.0}% | cpu {:.0}% mem {:.0}% | link {} ({})",
        format_speed(s.download_bps),
        format_speed(s.upload_bps),
        s.latency.latency_ms,
        s.latency.jitter_ms,
        s.latency.loss_pct,
        s.cpu_pct,
        s.memory_pct,
        s.link.name,
        s.link.signal,
    )
}

/// True once a rate has been measured and it is under the threshold.
pub fn below_threshold(s: &Snapshot, has_samples: bool, threshold_mbps: f64) -> bool {
    has_samples && s.download_bps / 1e6 < threshold_mbps
}

pub fn spawn_status_reporter(
    store: SharedStore,
    threshold_mbps: f64,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let snap = store.read_current();
            println!("{}", status_line(&snap));
            if below_threshold(&snap, store.history_len() > 0, threshold_mbps) {
                warn!(
                    download = %format_speed(snap.download_bps),
                    threshold_mbps,
                    "download below alert threshold"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_needs_a_sample() {
        let s = Snapshot {
            download_bps: 500_000.0,
            ..Snapshot::default()
        };
        assert!(!below_threshold(&s, false, 1.0));
        assert!(below_threshold(&s, true, 1.0));
        assert!(!below_threshold(&s, true, 0.5));
    }

    #[test]
    fn line_shows_rates_and_link() {
        let s = Snapshot {
            download_bps: 12_340_000.0,
            ..Snapshot::default()
        };
        let line = status_line(&s);
        assert!(line.starts_with("down 12.34 Mbps | up 0.00 bps"), "{line}");
        assert!(line.ends_with("link Unknown (Unknown)"));
    }
}
