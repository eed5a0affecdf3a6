//! Engine configuration. The binary fills this from the command line; tests
//! build it directly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

use crate::latency::DEFAULT_PROBE_TARGET;
use crate::state::DEFAULT_HISTORY_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SpeedtestMode {
    /// Every `speedtest_interval`.
    #[default]
    Periodic,
    /// Once at startup.
    Once,
}

/// Sleep between ticks of each sampler.
#[derive(Debug, Clone, Copy)]
pub struct Cadences {
    pub rate: Duration,
    pub latency_pause: Duration,
    pub link: Duration,
    pub geo: Duration,
    pub speedtest: Duration,
}

impl Default for Cadences {
    fn default() -> Self {
        Self {
            rate: Duration::from_secs(1),
            latency_pause: Duration::from_secs(2),
            link: Duration::from_secs(5),
            geo: Duration::from_secs(600),
            speedtest: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Monitor only this interface; `None` aggregates every non-loopback one.
    pub interface: Option<String>,
    pub history_dir: PathBuf,
    /// Download rate (Mbps) under which the status line warns.
    pub threshold_mbps: f64,
    pub save_interval: Duration,
    pub history_capacity: usize,
    pub speedtest_mode: SpeedtestMode,
    /// Zero disables the startup upload test.
    pub upload_test: Duration,
    pub probe_target: String,
    /// Skip geo lookup, upload test and speed test.
    pub offline: bool,
    pub listen: Option<SocketAddr>,
    pub token: Option<String>,
    pub status_interval: Duration,
    /// How long shutdown waits for samplers before aborting them.
    pub shutdown_grace: Duration,
    pub http_timeout: Duration,
    pub speedtest_timeout: Duration,
    pub cadences: Cadences,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interface: None,
            history_dir: PathBuf::from("History"),
            threshold_mbps: 1.0,
            save_interval: Duration::from_secs(300),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            speedtest_mode: SpeedtestMode::Periodic,
            upload_test: Duration::from_secs(10),
            probe_target: DEFAULT_PROBE_TARGET.to_string(),
            offline: false,
            listen: None,
            token: None,
            status_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            http_timeout: Duration::from_secs(5),
            speedtest_timeout: Duration::from_secs(120),
            cadences: Cadences::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp values that would otherwise stall a loop or an interval.
    pub fn normalized(mut self) -> Self {
        self.history_capacity = self.history_capacity.max(1);
        self.save_interval = self.save_interval.max(Duration::from_secs(1));
        self.status_interval = self.status_interval.max(Duration::from_secs(1));
        // tokio intervals reject a zero period
        let floor = Duration::from_millis(1);
        let c = &mut self.cadences;
        for period in [&mut c.rate, &mut c.link, &mut c.geo, &mut c.speedtest] {
            *period = (*period).max(floor);
        }
        if !self.threshold_mbps.is_finite() || self.threshold_mbps < 0.0 {
            self.threshold_mbps = 0.0;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_table() {
        let c = EngineConfig::default();
        assert_eq!(c.history_dir, PathBuf::from("History"));
        assert_eq!(c.threshold_mbps, 1.0);
        assert_eq!(c.save_interval, Duration::from_secs(300));
        assert_eq!(c.history_capacity, 3600);
        assert_eq!(c.speedtest_mode, SpeedtestMode::Periodic);
        assert_eq!(c.probe_target, "8.8.8.8:53");
    }

    #[test]
    fn normalized_clamps_degenerate_values() {
        let c = EngineConfig {
            history_capacity: 0,
            save_interval: Duration::ZERO,
            threshold_mbps: f64::NAN,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(c.history_capacity, 1);
        assert_eq!(c.save_interval, Duration::from_secs(1));
        assert_eq!(c.threshold_mbps, 0.0);
    }

    #[test]
    fn zero_cadences_become_one_millisecond() {
        let c = EngineConfig {
            cadences: Cadences {
                rate: Duration::ZERO,
                latency_pause: Duration::ZERO,
                link: Duration::ZERO,
                geo: Duration::ZERO,
                speedtest: Duration::ZERO,
            },
            ..EngineConfig::default()
        }
        .normalized();
        let floor = Duration::from_millis(1);
        assert_eq!(
            [c.cadences.rate, c.cadences.link, c.cadences.geo, c.cadences.speedtest],
            [floor; 4]
        );
        // a zero pause only means back-to-back bursts
        assert_eq!(c.cadences.latency_pause, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_cadence_starts_an_interval() {
        let c = EngineConfig {
            cadences: Cadences {
                rate: Duration::ZERO,
                ..Cadences::default()
            },
            ..EngineConfig::default()
        }
        .normalized();
        let mut ticker = tokio::time::interval(c.cadences.rate);
        ticker.tick().await;
        ticker.tick().await;
    }
}
