//! Host metrics using sysinfo: interface counters, CPU/memory, connection
//! counts and per-process I/O. Also the pure calculations the bandwidth
//! sampler runs on top of them (rates, counter resets, top-K ranking).

#[cfg(target_os = "linux")]
use std::fs;
use std::net::IpAddr;
use std::time::Duration;

use sysinfo::{Networks, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use crate::error::{EngineError, ProcessIoError};
use crate::types::{NetCounters, ProcessBandwidth, ProcessIo, UNKNOWN};

/// Cumulative network counters for one interface, or the aggregate of all
/// non-loopback interfaces when none was selected.
pub trait CounterSource: Send {
    /// `None` when the interface is currently gone.
    fn counters(&mut self) -> Option<NetCounters>;
}

/// Live processes with their cumulative I/O. The sequence is finite and
/// produced fresh on every call.
pub trait ProcessEnumerator: Send {
    fn processes(&mut self) -> Box<dyn Iterator<Item = Result<ProcessIo, ProcessIoError>> + '_>;
}

/// Cheap non-blocking host gauges.
pub trait SystemGauges: Send {
    /// (cpu %, memory %)
    fn cpu_memory(&mut self) -> (f32, f32);
    /// (tcp, udp) socket counts
    fn connections(&mut self) -> (usize, usize);
}

pub fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.to_ascii_lowercase().contains("loopback")
}

/// sysinfo-backed implementation of every host collaborator.
pub struct SysinfoHost {
    sys: System,
    networks: Networks,
    interface: Option<String>,
}

impl SysinfoHost {
    /// Fails when the requested interface does not exist, or when no
    /// non-loopback interface exists at all.
    pub fn new(interface: Option<String>) -> Result<Self, EngineError> {
        let networks = Networks::new_with_refreshed_list();
        match interface.as_deref() {
            Some(name) if !networks.list().contains_key(name) => {
                return Err(EngineError::InterfaceNotFound(name.to_string()));
            }
            None if !networks.list().keys().any(|n| !is_loopback(n)) => {
                return Err(EngineError::NoInterface);
            }
            _ => {}
        }
        let mut sys = System::new();
        // Prime CPU usage so the first real read has a baseline.
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Ok(Self {
            sys,
            networks,
            interface,
        })
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    fn selected(&self, name: &str) -> bool {
        match self.interface.as_deref() {
            Some(i) => i == name,
            None => !is_loopback(name),
        }
    }

    /// First IPv4 address (and its netmask) of the monitored interface.
    /// Without a selected interface, the first non-loopback one that has an
    /// IPv4 address is used. Returns (interface, address, netmask).
    pub fn local_address(&self) -> (String, String, String) {
        let mut names: Vec<&String> = self
            .networks
            .list()
            .keys()
            .filter(|n| self.selected(n))
            .collect();
        names.sort();
        for name in names {
            let Some(data) = self.networks.list().get(name) else {
                continue;
            };
            for net in data.ip_networks() {
                if let IpAddr::V4(v4) = net.addr {
                    if v4.is_loopback() {
                        continue;
                    }
                    return (name.clone(), v4.to_string(), prefix_to_netmask(net.prefix));
                }
            }
        }
        (
            self.interface
                .clone()
                .unwrap_or_else(|| UNKNOWN.to_string()),
            UNKNOWN.to_string(),
            UNKNOWN.to_string(),
        )
    }
}

impl CounterSource for SysinfoHost {
    fn counters(&mut self) -> Option<NetCounters> {
        self.networks.refresh(true);
        let mut out = NetCounters::default();
        let mut found = false;
        for (name, data) in self.networks.list() {
            if !self.selected(name) {
                continue;
            }
            found = true;
            out.bytes_sent = out.bytes_sent.saturating_add(data.total_transmitted());
            out.bytes_recv = out.bytes_recv.saturating_add(data.total_received());
            out.errors_in = out
                .errors_in
                .saturating_add(data.total_errors_on_received());
            out.errors_out = out
                .errors_out
                .saturating_add(data.total_errors_on_transmitted());
            let (din, dout) = read_drops(name);
            out.drops_in = out.drops_in.saturating_add(din);
            out.drops_out = out.drops_out.saturating_add(dout);
        }
        found.then_some(out)
    }
}

impl ProcessEnumerator for SysinfoHost {
    fn processes(&mut self) -> Box<dyn Iterator<Item = Result<ProcessIo, ProcessIoError>> + '_> {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_disk_usage(),
        );
        Box::new(self.sys.processes().values().map(|p| {
            let pid = p.pid().as_u32();
            let io = p.disk_usage();
            // sysinfo reports zeros when /proc/<pid>/io is unreadable.
            if io.total_read_bytes == 0 && io.total_written_bytes == 0 {
                return Err(ProcessIoError { pid });
            }
            Ok(ProcessIo {
                pid,
                name: p.name().to_string_lossy().into_owned(),
                io_bytes_sent: io.total_written_bytes,
                io_bytes_recv: io.total_read_bytes,
                start_time: p.start_time(),
            })
        }))
    }
}

impl SystemGauges for SysinfoHost {
    fn cpu_memory(&mut self) -> (f32, f32) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let used = total.saturating_sub(self.sys.available_memory());
        let mem_pct = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0) as f32
        };
        (self.sys.global_cpu_usage(), mem_pct)
    }

    fn connections(&mut self) -> (usize, usize) {
        count_sockets()
    }
}

fn prefix_to_netmask(prefix: u8) -> String {
    let bits: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };
    std::net::Ipv4Addr::from(bits).to_string()
}

#[cfg(target_os = "linux")]
fn read_stat(iface: &str, stat: &str) -> u64 {
    fs::read_to_string(format!("/sys/class/net/{iface}/statistics/{stat}"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn read_drops(iface: &str) -> (u64, u64) {
    (read_stat(iface, "rx_dropped"), read_stat(iface, "tx_dropped"))
}

#[cfg(not(target_os = "linux"))]
fn read_drops(_iface: &str) -> (u64, u64) {
    (0, 0)
}

/// Count socket table rows in /proc/net (one header line per file).
#[cfg(target_os = "linux")]
fn count_sockets() -> (usize, usize) {
    fn rows(path: &str) -> usize {
        fs::read_to_string(path)
            .map(|s| s.lines().skip(1).filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }
    (
        rows("/proc/net/tcp") + rows("/proc/net/tcp6"),
        rows("/proc/net/udp") + rows("/proc/net/udp6"),
    )
}

#[cfg(not(target_os = "linux"))]
fn count_sockets() -> (usize, usize) {
    (0, 0)
}

// ---------- Rate calculation ----------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    pub download_bps: f64,
    pub upload_bps: f64,
    /// A counter went backwards this tick and the baseline was resynced.
    pub reset: bool,
}

/// Turns cumulative counters into per-tick rates and totals since start.
#[derive(Debug, Clone)]
pub struct RateTracker {
    last_sent: u64,
    last_recv: u64,
    sent_total: u64,
    recv_total: u64,
}

impl RateTracker {
    pub fn new(baseline: NetCounters) -> Self {
        Self {
            last_sent: baseline.bytes_sent,
            last_recv: baseline.bytes_recv,
            sent_total: 0,
            recv_total: 0,
        }
    }

    /// Current (sent, recv) baseline.
    pub fn baseline(&self) -> (u64, u64) {
        (self.last_sent, self.last_recv)
    }

    /// Bytes (sent, recv) since the tracker was created, resets excluded.
    pub fn totals(&self) -> (u64, u64) {
        (self.sent_total, self.recv_total)
    }

    pub fn observe(&mut self, sent: u64, recv: u64, dt: Duration) -> RateSample {
        let up = sent.checked_sub(self.last_sent);
        let down = recv.checked_sub(self.last_recv);
        let reset = up.is_none() || down.is_none();
        self.last_sent = sent;
        self.last_recv = recv;

        let up = up.unwrap_or(0);
        let down = down.unwrap_or(0);
        self.sent_total = self.sent_total.saturating_add(up);
        self.recv_total = self.recv_total.saturating_add(down);

        let secs = dt.as_secs_f64();
        let rate = |bytes: u64| {
            if secs > 0.0 {
                bytes as f64 * 8.0 / secs
            } else {
                0.0
            }
        };
        RateSample {
            download_bps: rate(down),
            upload_bps: rate(up),
            reset,
        }
    }
}

// ---------- Per-process bandwidth ----------

/// Long-run average rate: cumulative I/O divided by process uptime.
pub fn estimate_bandwidth(p: &ProcessIo, now_unix: f64) -> Option<ProcessBandwidth> {
    let uptime = now_unix - p.start_time as f64;
    if uptime <= 0.0 {
        return None;
    }
    Some(ProcessBandwidth {
        pid: p.pid,
        name: p.name.clone(),
        up_mbps: p.io_bytes_sent as f64 * 8.0 / uptime / 1e6,
        down_mbps: p.io_bytes_recv as f64 * 8.0 / uptime / 1e6,
    })
}

/// Keep processes strictly above `floor_mbps`, highest combined rate first,
/// at most `k` of them.
pub fn rank_processes<I>(candidates: I, floor_mbps: f64, k: usize) -> Vec<ProcessBandwidth>
where
    I: IntoIterator<Item = ProcessBandwidth>,
{
    let mut list: Vec<ProcessBandwidth> = candidates
        .into_iter()
        .filter(|p| p.combined_mbps() > floor_mbps)
        .collect();
    list.sort_by(|a, b| b.combined_mbps().total_cmp(&a.combined_mbps()));
    list.truncate(k);
    list
}

/// Enumerate, estimate and rank in one pass. Processes that cannot report
/// I/O are skipped.
pub fn top_processes<E>(source: &mut E, now_unix: f64, floor_mbps: f64, k: usize) -> Vec<ProcessBandwidth>
where
    E: ProcessEnumerator + ?Sized,
{
    let mut skipped = 0usize;
    let estimates: Vec<ProcessBandwidth> = source
        .processes()
        .filter_map(|r| match r {
            Ok(p) => estimate_bandwidth(&p, now_unix),
            Err(_) => {
                skipped += 1;
                None
            }
        })
        .collect();
    if skipped > 0 {
        debug!(skipped, "processes without I/O counters");
    }
    rank_processes(estimates, floor_mbps, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pb(pid: u32, name: &str, up: f64, down: f64) -> ProcessBandwidth {
        ProcessBandwidth {
            pid,
            name: name.into(),
            up_mbps: up,
            down_mbps: down,
        }
    }

    #[test]
    fn counter_reset_yields_zero_and_rebases() {
        let mut t = RateTracker::new(NetCounters {
            bytes_sent: 1000,
            bytes_recv: 1000,
            ..Default::default()
        });
        let s = t.observe(900, 900, Duration::from_secs(1));
        assert_eq!(s.download_bps, 0.0);
        assert_eq!(s.upload_bps, 0.0);
        assert!(s.reset);
        assert_eq!(t.baseline(), (900, 900));

        // next tick measures from the new baseline
        let s = t.observe(1000, 1900, Duration::from_secs(1));
        assert_eq!(s.upload_bps, 800.0);
        assert_eq!(s.download_bps, 8000.0);
        assert!(!s.reset);
        assert_eq!(t.totals(), (100, 1000));
    }

    #[test]
    fn rate_scales_by_tick_duration() {
        let mut t = RateTracker::new(NetCounters::default());
        let s = t.observe(0, 1_000, Duration::from_millis(500));
        assert_eq!(s.download_bps, 16_000.0);
        let s = t.observe(0, 1_000, Duration::ZERO);
        assert_eq!(s.download_bps, 0.0);
    }

    #[test]
    fn ranking_applies_exclusive_floor_and_order() {
        let ranked = rank_processes(
            vec![pb(1, "a", 0.05, 0.05), pb(2, "b", 2.0, 1.0), pb(3, "c", 0.5, 0.7)],
            0.1,
            5,
        );
        let pids: Vec<u32> = ranked.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![2, 3]);
    }

    #[test]
    fn ranking_truncates_to_k() {
        let many: Vec<_> = (0..9).map(|i| pb(i, "p", i as f64, 0.0)).collect();
        let ranked = rank_processes(many, 0.1, 5);
        assert_eq!(ranked.len(), 5);
        assert_eq!(ranked[0].pid, 8);
        assert_eq!(ranked[4].pid, 4);
    }

    #[test]
    fn estimate_uses_uptime() {
        let p = ProcessIo {
            pid: 7,
            name: "curl".into(),
            io_bytes_sent: 1_000_000,
            io_bytes_recv: 2_000_000,
            start_time: 100,
        };
        let est = estimate_bandwidth(&p, 108.0).unwrap();
        assert_eq!(est.up_mbps, 1.0);
        assert_eq!(est.down_mbps, 2.0);
        assert!(estimate_bandwidth(&p, 100.0).is_none());
    }

    struct Procs(Vec<Result<ProcessIo, ProcessIoError>>);

    impl ProcessEnumerator for Procs {
        fn processes(
            &mut self,
        ) -> Box<dyn Iterator<Item = Result<ProcessIo, ProcessIoError>> + '_> {
            Box::new(self.0.iter().cloned())
        }
    }

    #[test]
    fn unreadable_processes_are_skipped() {
        let mut src = Procs(vec![
            Err(ProcessIoError { pid: 1 }),
            Ok(ProcessIo {
                pid: 2,
                name: "sync".into(),
                io_bytes_sent: 10_000_000,
                io_bytes_recv: 0,
                start_time: 0,
            }),
        ]);
        let top = top_processes(&mut src, 10.0, 0.1, 5);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].pid, 2);
        assert_eq!(top[0].up_mbps, 8.0);
    }

    #[test]
    fn netmask_from_prefix() {
        assert_eq!(prefix_to_netmask(24), "255.255.255.0");
        assert_eq!(prefix_to_netmask(0), "0.0.0.0");
        assert_eq!(prefix_to_netmask(32), "255.255.255.255");
    }
}
