//! Shared agent state: the snapshot store every sampler writes and every
//! reader copies from.
//!
//! One lock guards the whole record. A [`Mutation`] is applied inside a single
//! critical section, so readers never see half of an update, and the history
//! append/evict pair happens in the same step. Nothing here does I/O.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::types::{
    HistoryPoint, HostAddressing, LatencyStats, LinkIdentity, ProcessBandwidth, PublicGeo,
    Snapshot, Throughput,
};

pub const DEFAULT_HISTORY_CAPACITY: usize = 3600;

pub type SharedStore = Arc<SnapshotStore>;

/// A named update to one field family of the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// One bandwidth tick: instantaneous rates, running maxima and the
    /// matching history point, applied together.
    RateTick {
        download_bps: f64,
        upload_bps: f64,
        elapsed_seconds: f64,
    },
    Totals {
        sent_bytes: u64,
        recv_bytes: u64,
    },
    InterfaceErrors {
        errors_in: u64,
        errors_out: u64,
        drops_in: u64,
        drops_out: u64,
    },
    Resources {
        cpu_pct: f32,
        memory_pct: f32,
    },
    Connections {
        tcp: usize,
        udp: usize,
    },
    Processes(Vec<ProcessBandwidth>),
    Latency(LatencyStats),
    Link(LinkIdentity),
    Geo(PublicGeo),
    Addressing(HostAddressing),
    UploadTest {
        speed_bps: f64,
        running: bool,
    },
    Benchmark(Throughput),
}

/// Points appended after a cursor, see [`SnapshotStore::history_since`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryDelta {
    pub points: Vec<HistoryPoint>,
    pub cursor: u64,
    /// Points that were evicted before the caller got to them.
    pub missed: u64,
}

struct Inner {
    // `snap.history` stays empty; the ring lives in `history`.
    snap: Snapshot,
    history: VecDeque<HistoryPoint>,
    appended: u64,
    version: u64,
}

pub struct SnapshotStore {
    inner: RwLock<Inner>,
    capacity: usize,
    started: Instant,
}

impl SnapshotStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(Inner {
                snap: Snapshot::default(),
                history: VecDeque::with_capacity(capacity),
                appended: 0,
                version: 0,
            }),
            capacity,
            started: Instant::now(),
        }
    }

    pub fn shared(capacity: usize) -> SharedStore {
        Arc::new(Self::new(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Monotonic time since the store (and the agent) started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    // A panicking writer can only poison the lock between whole mutations,
    // so the data behind a poisoned lock is still consistent.
    fn read_lock(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Point-in-time copy of the whole snapshot, history included.
    pub fn read(&self) -> Snapshot {
        let inner = self.read_lock();
        let mut snap = inner.snap.clone();
        snap.history = inner.history.iter().copied().collect();
        snap
    }

    /// Copy without the history buffer, for hot readers that only show
    /// current values.
    pub fn read_current(&self) -> Snapshot {
        self.read_lock().snap.clone()
    }

    /// Number of mutations applied so far.
    pub fn version(&self) -> u64 {
        self.read_lock().version
    }

    pub fn history_len(&self) -> usize {
        self.read_lock().history.len()
    }

    /// Points appended after `cursor` (a value previously returned in
    /// [`HistoryDelta::cursor`], or 0 to start from the beginning).
    pub fn history_since(&self, cursor: u64) -> HistoryDelta {
        let inner = self.read_lock();
        let fresh = inner.appended.saturating_sub(cursor);
        let available = fresh.min(inner.history.len() as u64);
        let skip = inner.history.len() - available as usize;
        HistoryDelta {
            points: inner.history.iter().skip(skip).copied().collect(),
            cursor: inner.appended,
            missed: fresh - available,
        }
    }

    pub fn apply(&self, mutation: Mutation) {
        let mut guard = self.write_lock();
        let inner = &mut *guard;
        let snap = &mut inner.snap;
        match mutation {
            Mutation::RateTick {
                download_bps,
                upload_bps,
                elapsed_seconds,
            } => {
                let download_bps = non_negative(download_bps);
                let upload_bps = non_negative(upload_bps);
                snap.download_bps = download_bps;
                snap.upload_bps = upload_bps;
                snap.top_download_bps = snap.top_download_bps.max(download_bps);
                snap.top_upload_bps = snap.top_upload_bps.max(upload_bps);

                // Never step backwards in time, even if a caller's clock does.
                let floor = inner
                    .history
                    .back()
                    .map(|p| p.elapsed_seconds)
                    .unwrap_or(0.0);
                inner.history.push_back(HistoryPoint {
                    elapsed_seconds: elapsed_seconds.max(floor),
                    download_mbps: download_bps / 1e6,
                    upload_mbps: upload_bps / 1e6,
                });
                while inner.history.len() > self.capacity {
                    inner.history.pop_front();
                }
                inner.appended += 1;
            }
            Mutation::Totals {
                sent_bytes,
                recv_bytes,
            } => {
                snap.sent_bytes = sent_bytes;
                snap.recv_bytes = recv_bytes;
            }
            Mutation::InterfaceErrors {
                errors_in,
                errors_out,
                drops_in,
                drops_out,
            } => {
                snap.errors_in = errors_in;
                snap.errors_out = errors_out;
                snap.drops_in = drops_in;
                snap.drops_out = drops_out;
            }
            Mutation::Resources {
                cpu_pct,
                memory_pct,
            } => {
                snap.cpu_pct = cpu_pct;
                snap.memory_pct = memory_pct;
            }
            Mutation::Connections { tcp, udp } => {
                snap.active_tcp = tcp;
                snap.active_udp = udp;
            }
            Mutation::Processes(list) => snap.top_processes = list,
            Mutation::Latency(stats) => snap.latency = stats,
            Mutation::Link(link) => snap.link = link,
            Mutation::Geo(geo) => snap.geo = geo,
            Mutation::Addressing(addr) => snap.addressing = addr,
            Mutation::UploadTest { speed_bps, running } => {
                snap.upload_test_bps = non_negative(speed_bps);
                snap.upload_test_running = running;
            }
            Mutation::Benchmark(t) => {
                snap.speedtest = Throughput {
                    download_bps: non_negative(t.download_bps),
                    upload_bps: non_negative(t.upload_bps),
                };
            }
        }
        inner.version += 1;
    }
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(store: &SnapshotStore, t: f64, down: f64, up: f64) {
        store.apply(Mutation::RateTick {
            download_bps: down,
            upload_bps: up,
            elapsed_seconds: t,
        });
    }

    #[test]
    fn history_keeps_last_capacity_points_in_order() {
        let store = SnapshotStore::new(4);
        for i in 0..7 {
            tick(&store, i as f64, (i as f64) * 1e6, 0.0);
        }
        let snap = store.read();
        let times: Vec<f64> = snap.history.iter().map(|p| p.elapsed_seconds).collect();
        assert_eq!(times, vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(snap.history[0].download_mbps, 3.0);
    }

    #[test]
    fn running_maxima_never_decrease() {
        let store = SnapshotStore::new(10);
        tick(&store, 1.0, 5e6, 1e6);
        tick(&store, 2.0, 2e6, 3e6);
        let s = store.read();
        assert_eq!(s.download_bps, 2e6);
        assert_eq!(s.top_download_bps, 5e6);
        assert_eq!(s.top_upload_bps, 3e6);
    }

    #[test]
    fn negative_rates_are_clamped() {
        let store = SnapshotStore::new(10);
        tick(&store, 1.0, -8000.0, f64::NAN);
        let s = store.read();
        assert_eq!(s.download_bps, 0.0);
        assert_eq!(s.upload_bps, 0.0);
        assert_eq!(s.history[0].download_mbps, 0.0);
    }

    #[test]
    fn elapsed_never_goes_backwards() {
        let store = SnapshotStore::new(10);
        tick(&store, 5.0, 0.0, 0.0);
        tick(&store, 4.0, 0.0, 0.0);
        let s = store.read();
        assert_eq!(s.history[1].elapsed_seconds, 5.0);
    }

    #[test]
    fn history_since_tracks_cursor_and_misses() {
        let store = SnapshotStore::new(3);
        tick(&store, 1.0, 0.0, 0.0);
        tick(&store, 2.0, 0.0, 0.0);
        let d = store.history_since(0);
        assert_eq!(d.points.len(), 2);
        assert_eq!(d.cursor, 2);
        assert_eq!(d.missed, 0);

        for t in 3..8 {
            tick(&store, t as f64, 0.0, 0.0);
        }
        let d = store.history_since(d.cursor);
        // 5 new points, only the last 3 survive eviction
        assert_eq!(d.missed, 2);
        let times: Vec<f64> = d.points.iter().map(|p| p.elapsed_seconds).collect();
        assert_eq!(times, vec![5.0, 6.0, 7.0]);
        assert!(store.history_since(d.cursor).points.is_empty());
    }

    #[test]
    fn version_counts_mutations() {
        let store = SnapshotStore::new(3);
        assert_eq!(store.version(), 0);
        store.apply(Mutation::Connections { tcp: 3, udp: 1 });
        store.apply(Mutation::Latency(LatencyStats::default()));
        assert_eq!(store.version(), 2);
        assert!(store.read_current().history.is_empty());
    }
}
