//! Latency, jitter and loss from short probe bursts.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::types::LatencyStats;

pub const DEFAULT_PROBE_TARGET: &str = "8.8.8.8:53";
pub const PROBES_PER_BURST: usize = 10;
pub const PROBE_SPACING: Duration = Duration::from_millis(200);

/// One round-trip measurement; `None` means the probe was lost.
pub trait Prober: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, Option<Duration>>;
}

/// Times a TCP handshake. ICMP echo needs raw sockets (root or
/// CAP_NET_RAW); the handshake costs one RTT and works unprivileged.
pub struct TcpConnectProber {
    target: String,
    timeout: Duration,
}

impl TcpConnectProber {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

impl Prober for TcpConnectProber {
    fn probe(&self) -> BoxFuture<'_, Option<Duration>> {
        async move {
            let start = Instant::now();
            match timeout(self.timeout, TcpStream::connect(self.target.as_str())).await {
                Ok(Ok(_stream)) => Some(start.elapsed()),
                _ => None,
            }
        }
        .boxed()
    }
}

/// Send `count` probes, `spacing` apart. Returns RTTs in milliseconds.
pub async fn probe_burst(prober: &dyn Prober, count: usize, spacing: Duration) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(prober.probe().await.map(|d| d.as_micros() as f64 / 1000.0));
        sleep(spacing).await;
    }
    out
}

/// Mean and spread of the successful probes. An all-lost (or empty) burst
/// reports 0 latency, 0 jitter and 100% loss.
pub fn summarize(rtts_ms: &[Option<f64>]) -> LatencyStats {
    if rtts_ms.is_empty() {
        return LatencyStats {
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss_pct: 100.0,
        };
    }
    let ok: Vec<f64> = rtts_ms.iter().flatten().copied().collect();
    let lost = rtts_ms.len() - ok.len();
    let loss_pct = lost as f64 / rtts_ms.len() as f64 * 100.0;
    if ok.is_empty() {
        return LatencyStats {
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss_pct,
        };
    }
    let mean = ok.iter().sum::<f64>() / ok.len() as f64;
    let max = ok.iter().copied().fold(f64::MIN, f64::max);
    let min = ok.iter().copied().fold(f64::MAX, f64::min);
    LatencyStats {
        latency_ms: mean,
        jitter_ms: max - min,
        loss_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn burst_with_losses() {
        let mut rtts: Vec<Option<f64>> = [10.0, 12.0, 14.0, 11.0, 15.0, 13.0, 15.0]
            .into_iter()
            .map(Some)
            .collect();
        rtts.extend([None, None, None]);
        let s = summarize(&rtts);
        assert!((s.latency_ms - 12.857).abs() < 0.01, "{}", s.latency_ms);
        assert_eq!(s.jitter_ms, 5.0);
        assert_eq!(s.loss_pct, 30.0);
    }

    #[test]
    fn all_lost_is_sentinel_not_nan() {
        let s = summarize(&[None; PROBES_PER_BURST]);
        assert_eq!(s.latency_ms, 0.0);
        assert_eq!(s.jitter_ms, 0.0);
        assert_eq!(s.loss_pct, 100.0);
    }

    struct EveryOther(AtomicUsize);

    impl Prober for EveryOther {
        fn probe(&self) -> BoxFuture<'_, Option<Duration>> {
            let n = self.0.fetch_add(1, Ordering::Relaxed);
            async move { (n % 2 == 0).then_some(Duration::from_millis(20)) }.boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_records_each_probe() {
        let p = EveryOther(AtomicUsize::new(0));
        let rtts = probe_burst(&p, 4, PROBE_SPACING).await;
        assert_eq!(rtts, vec![Some(20.0), None, Some(20.0), None]);
        assert_eq!(summarize(&rtts).loss_pct, 50.0);
    }
}
