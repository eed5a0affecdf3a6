//! Data types held by the snapshot store and written to `snapshot.json`.
//! Keep this module minimal and stable: it defines the on-disk format.

use serde::{Deserialize, Serialize};

/// Sentinel for identity fields that could not be measured.
pub const UNKNOWN: &str = "Unknown";

/// Number of entries kept in the per-process bandwidth list.
pub const TOP_PROCESSES: usize = 5;

/// Combined up+down rate (Mbps) a process must exceed to be listed.
pub const PROCESS_NOISE_FLOOR_MBPS: f64 = 0.1;

fn unknown() -> String {
    UNKNOWN.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub elapsed_seconds: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessBandwidth {
    pub pid: u32,
    pub name: String,
    pub up_mbps: f64,
    pub down_mbps: f64,
}

impl ProcessBandwidth {
    pub fn combined_mbps(&self) -> f64 {
        self.up_mbps + self.down_mbps
    }
}

/// Best-effort identity of the active link (Wi-Fi SSID, signal, ...).
/// Every field is an opaque display string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkIdentity {
    pub name: String,
    pub signal: String,
    pub channel: String,
    pub frequency: String,
    pub vendor: String,
}

impl Default for LinkIdentity {
    fn default() -> Self {
        Self {
            name: unknown(),
            signal: unknown(),
            channel: unknown(),
            frequency: unknown(),
            vendor: unknown(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicGeo {
    pub public_address: String,
    pub country: String,
    pub city: String,
}

impl Default for PublicGeo {
    fn default() -> Self {
        Self {
            public_address: unknown(),
            country: unknown(),
            city: unknown(),
        }
    }
}

/// Addressing of the monitored interface, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAddressing {
    pub interface: String,
    pub local_address: String,
    pub subnet: String,
    pub gateway: String,
    pub dns1: String,
    pub dns2: String,
}

impl Default for HostAddressing {
    fn default() -> Self {
        Self {
            interface: unknown(),
            local_address: unknown(),
            subnet: unknown(),
            gateway: unknown(),
            dns1: unknown(),
            dns2: unknown(),
        }
    }
}

/// Cumulative interface counters since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,
}

/// One process as reported by the process enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIo {
    pub pid: u32,
    pub name: String,
    pub io_bytes_sent: u64,
    pub io_bytes_recv: u64,
    /// Unix seconds.
    pub start_time: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub download_bps: f64,
    pub upload_bps: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    // identity
    pub addressing: HostAddressing,
    pub link: LinkIdentity,
    pub geo: PublicGeo,

    // rates (bits per second)
    pub download_bps: f64,
    pub upload_bps: f64,
    pub top_download_bps: f64,
    pub top_upload_bps: f64,

    pub latency: LatencyStats,

    // resources (percent)
    pub cpu_pct: f32,
    pub memory_pct: f32,
    pub active_tcp: usize,
    pub active_udp: usize,

    // cumulative since the agent started
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,

    // benchmarks
    pub upload_test_bps: f64,
    pub upload_test_running: bool,
    pub speedtest: Throughput,

    pub history: Vec<HistoryPoint>,
    pub top_processes: Vec<ProcessBandwidth>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            addressing: HostAddressing::default(),
            link: LinkIdentity::default(),
            geo: PublicGeo::default(),
            download_bps: 0.0,
            upload_bps: 0.0,
            top_download_bps: 0.0,
            top_upload_bps: 0.0,
            latency: LatencyStats::default(),
            cpu_pct: 0.0,
            memory_pct: 0.0,
            active_tcp: 0,
            active_udp: 0,
            sent_bytes: 0,
            recv_bytes: 0,
            errors_in: 0,
            errors_out: 0,
            drops_in: 0,
            drops_out: 0,
            upload_test_bps: 0.0,
            upload_test_running: false,
            speedtest: Throughput::default(),
            history: Vec::new(),
            top_processes: Vec::new(),
        }
    }
}

/// Human-readable speed: bps, Kbps, Mbps or Gbps with two decimals.
pub fn format_speed(bps: f64) -> String {
    if bps >= 1_000_000_000.0 {
        format!("{:.2} Gbps", bps / 1_000_000_000.0)
    } else if bps >= 1_000_000.0 {
        format!("{:.2} Mbps", bps / 1_000_000.0)
    } else if bps >= 1_000.0 {
        format!("{:.2} Kbps", bps / 1_000.0)
    } else {
        format!("{bps:.2} bps")
    }
}
