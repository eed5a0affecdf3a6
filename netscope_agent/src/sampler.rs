//! Background samplers: one task per concern, each writing its own field
//! family into the snapshot store. Every task stops when its cancellation
//! token fires; none holds the store lock across an await.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bench::{run_upload_benchmark, SpeedTest, UploadTarget, UPLOAD_PAYLOAD_BYTES};
use crate::config::SpeedtestMode;
use crate::error::CollaboratorError;
use crate::geo::GeoResolver;
use crate::latency::{probe_burst, summarize, Prober, PROBES_PER_BURST, PROBE_SPACING};
use crate::link::LinkResolver;
use crate::metrics::{top_processes, CounterSource, ProcessEnumerator, RateTracker, SystemGauges};
use crate::state::{Mutation, SharedStore};
use crate::types::{PublicGeo, Throughput, PROCESS_NOISE_FLOOR_MBPS, TOP_PROCESSES};

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// 1s: rates + history, totals, gauges, connections, top processes
pub fn spawn_rate_sampler<H>(
    store: SharedStore,
    mut host: H,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    H: CounterSource + ProcessEnumerator + SystemGauges + 'static,
{
    tokio::spawn(async move {
        let mut tracker = host.counters().map(RateTracker::new);
        let mut last_read = Instant::now();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            match host.counters() {
                Some(c) => {
                    match tracker.as_mut() {
                        Some(t) => {
                            let s = t.observe(c.bytes_sent, c.bytes_recv, now - last_read);
                            if s.reset {
                                debug!(
                                    sent = c.bytes_sent,
                                    recv = c.bytes_recv,
                                    "interface counters went backwards; baseline resynced"
                                );
                            }
                            store.apply(Mutation::RateTick {
                                download_bps: s.download_bps,
                                upload_bps: s.upload_bps,
                                elapsed_seconds: store.elapsed().as_secs_f64(),
                            });
                            let (sent_bytes, recv_bytes) = t.totals();
                            store.apply(Mutation::Totals {
                                sent_bytes,
                                recv_bytes,
                            });
                        }
                        // First successful read becomes the baseline.
                        None => tracker = Some(RateTracker::new(c)),
                    }
                    store.apply(Mutation::InterfaceErrors {
                        errors_in: c.errors_in,
                        errors_out: c.errors_out,
                        drops_in: c.drops_in,
                        drops_out: c.drops_out,
                    });
                    last_read = now;
                }
                None => debug!("interface counters unavailable this tick"),
            }

            // Gauges and the process scan walk /proc; run them on the
            // blocking pool and take the host back afterwards.
            let scan = tokio::task::spawn_blocking(move || {
                let gauges = host.cpu_memory();
                let sockets = host.connections();
                let top = top_processes(&mut host, unix_now(), PROCESS_NOISE_FLOOR_MBPS, TOP_PROCESSES);
                (host, gauges, sockets, top)
            })
            .await;
            let (returned, (cpu_pct, memory_pct), (tcp, udp), top) = match scan {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "host scan panicked; rate sampler stopping");
                    break;
                }
            };
            host = returned;
            store.apply(Mutation::Resources { cpu_pct, memory_pct });
            store.apply(Mutation::Connections { tcp, udp });
            store.apply(Mutation::Processes(top));
        }
        debug!("rate sampler stopped");
    })
}

// ~2s: probe burst, then pause
pub fn spawn_latency_sampler(
    store: SharedStore,
    prober: Arc<dyn Prober>,
    pause: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let burst = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = probe_burst(prober.as_ref(), PROBES_PER_BURST, PROBE_SPACING) => r,
            };
            let stats = summarize(&burst);
            debug!(
                latency_ms = stats.latency_ms,
                jitter_ms = stats.jitter_ms,
                loss_pct = stats.loss_pct,
                "probe burst"
            );
            store.apply(Mutation::Latency(stats));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }
        debug!("latency sampler stopped");
    })
}

// 5s: link identity
pub fn spawn_link_sampler(
    store: SharedStore,
    resolver: Arc<dyn LinkResolver>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let link = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                l = resolver.resolve() => l,
            };
            store.apply(Mutation::Link(link));
        }
        debug!("link sampler stopped");
    })
}

// 600s: public address + geo
pub fn spawn_geo_sampler(
    store: SharedStore,
    resolver: Arc<dyn GeoResolver>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = resolver.resolve() => r,
            };
            let geo = match res {
                Ok(g) => {
                    info!(address = %g.public_address, country = %g.country, city = %g.city, "public address resolved");
                    g
                }
                Err(e) => {
                    warn!(error = %e, "public address lookup failed");
                    PublicGeo::default()
                }
            };
            store.apply(Mutation::Geo(geo));
        }
        debug!("geo sampler stopped");
    })
}

// one-shot: upload benchmark
pub fn spawn_upload_test(
    store: SharedStore,
    target: Arc<dyn UploadTarget>,
    duration: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_upload_benchmark(&store, target.as_ref(), duration, UPLOAD_PAYLOAD_BYTES, &cancel).await;
    })
}

// 600s (or once): full speed test
pub fn spawn_speedtest_sampler(
    store: SharedStore,
    client: Arc<dyn SpeedTest>,
    mode: SpeedtestMode,
    period: Duration,
    limit: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            info!("speed test started");
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = timeout(limit, client.run()) => r.unwrap_or(Err(CollaboratorError::Timeout)),
            };
            let result = match res {
                Ok(t) => {
                    info!(download_bps = t.download_bps, upload_bps = t.upload_bps, "speed test finished");
                    t
                }
                Err(e) => {
                    warn!(error = %e, "speed test failed");
                    Throughput::default()
                }
            };
            store.apply(Mutation::Benchmark(result));
            if mode == SpeedtestMode::Once {
                break;
            }
        }
        debug!("speed test sampler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessIoError;
    use crate::state::SnapshotStore;
    use crate::types::{NetCounters, ProcessIo};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::collections::VecDeque;

    struct ScriptedHost {
        reads: VecDeque<Option<NetCounters>>,
    }

    impl CounterSource for ScriptedHost {
        fn counters(&mut self) -> Option<NetCounters> {
            self.reads.pop_front().flatten()
        }
    }

    impl ProcessEnumerator for ScriptedHost {
        fn processes(&mut self) -> Box<dyn Iterator<Item = Result<ProcessIo, ProcessIoError>> + '_> {
            Box::new(std::iter::empty())
        }
    }

    impl SystemGauges for ScriptedHost {
        fn cpu_memory(&mut self) -> (f32, f32) {
            (12.5, 40.0)
        }

        fn connections(&mut self) -> (usize, usize) {
            (3, 1)
        }
    }

    fn counters(sent: u64, recv: u64) -> Option<NetCounters> {
        Some(NetCounters {
            bytes_sent: sent,
            bytes_recv: recv,
            ..NetCounters::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn rate_sampler_fills_history_and_totals() {
        let store = SnapshotStore::shared(16);
        let host = ScriptedHost {
            reads: VecDeque::from(vec![
                counters(0, 0),
                counters(1_000, 125_000),
                None,
                counters(3_000, 250_000),
            ]),
        };
        let cancel = CancellationToken::new();
        let handle = spawn_rate_sampler(store.clone(), host, Duration::from_secs(1), cancel.clone());
        sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let s = store.read();
        // the tick with no counters adds no point
        assert_eq!(s.history.len(), 2);
        assert_eq!((s.sent_bytes, s.recv_bytes), (3_000, 250_000));
        assert!((s.history[0].download_mbps - 1.0).abs() < 1e-6);
        assert_eq!((s.active_tcp, s.active_udp), (3, 1));
        assert_eq!(s.cpu_pct, 12.5);
    }

    struct FailingGeo;

    impl GeoResolver for FailingGeo {
        fn resolve(&self) -> BoxFuture<'_, Result<PublicGeo, CollaboratorError>> {
            async { Err(CollaboratorError::Malformed("down".into())) }.boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn geo_failure_resets_to_unknown() {
        let store = SnapshotStore::shared(4);
        store.apply(Mutation::Geo(PublicGeo {
            public_address: "203.0.113.9".into(),
            country: "NZ".into(),
            city: "Wellington".into(),
        }));
        let cancel = CancellationToken::new();
        let handle = spawn_geo_sampler(store.clone(), Arc::new(FailingGeo), Duration::from_secs(600), cancel.clone());
        sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.read().geo, PublicGeo::default());
    }

    struct StuckSpeedTest;

    impl SpeedTest for StuckSpeedTest {
        fn run(&self) -> BoxFuture<'_, Result<Throughput, CollaboratorError>> {
            async {
                sleep(Duration::from_secs(3600)).await;
                Ok(Throughput {
                    download_bps: 1.0,
                    upload_bps: 1.0,
                })
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn speedtest_timeout_records_zero_and_once_mode_exits() {
        let store = SnapshotStore::shared(4);
        store.apply(Mutation::Benchmark(Throughput {
            download_bps: 5e7,
            upload_bps: 1e7,
        }));
        let handle = spawn_speedtest_sampler(
            store.clone(),
            Arc::new(StuckSpeedTest),
            SpeedtestMode::Once,
            Duration::from_secs(600),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        handle.await.unwrap();
        assert_eq!(store.read().speedtest, Throughput::default());
    }
}
