//! Link identity (Wi-Fi name, signal, channel) and interface addressing.
//! Everything here is best-effort platform scraping; any failure yields the
//! "Unknown" sentinel instead of an error.

use std::net::Ipv4Addr;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::types::{HostAddressing, LinkIdentity, UNKNOWN};

pub trait LinkResolver: Send + Sync {
    /// Never fails; unknown fields carry the sentinel.
    fn resolve(&self) -> BoxFuture<'_, LinkIdentity>;
}

/// Shells out to the platform's wireless tools.
pub struct SystemLinkResolver {
    timeout: Duration,
}

impl SystemLinkResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemLinkResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl LinkResolver for SystemLinkResolver {
    fn resolve(&self) -> BoxFuture<'_, LinkIdentity> {
        async move {
            #[cfg(windows)]
            {
                match run(self.timeout, "netsh", &["wlan", "show", "interfaces"]).await {
                    Some(out) => parse_netsh(&out),
                    None => LinkIdentity::default(),
                }
            }
            #[cfg(not(windows))]
            {
                let mut link = match run(self.timeout, "iwconfig", &[]).await {
                    Some(out) => parse_iwconfig(&out),
                    None => LinkIdentity::default(),
                };
                if let Some(name) = run(self.timeout, "iwgetid", &["-r"]).await {
                    let name = name.trim();
                    if !name.is_empty() {
                        link.name = name.to_string();
                    }
                }
                link
            }
        }
        .boxed()
    }
}

async fn run(limit: Duration, program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match timeout(limit, output).await {
        Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(Ok(out)) => {
            debug!(program, status = %out.status, "link tool exited with failure");
            None
        }
        Ok(Err(e)) => {
            debug!(program, error = %e, "link tool unavailable");
            None
        }
        Err(_) => {
            debug!(program, "link tool timed out");
            None
        }
    }
}

fn value_after<'a>(token: &'a str, key: &str) -> Option<&'a str> {
    token
        .strip_prefix(key)
        .map(|rest| rest.trim_start_matches([':', '=']))
        .filter(|v| !v.is_empty())
}

/// Parse `iwconfig` output (Linux wireless-tools).
pub fn parse_iwconfig(out: &str) -> LinkIdentity {
    let mut link = LinkIdentity::default();
    for line in out.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        for (i, tok) in tokens.iter().enumerate() {
            if *tok == "IEEE" {
                if let Some(std) = tokens.get(i + 1) {
                    link.vendor = format!("IEEE {std}");
                }
            } else if let Some(essid) = value_after(tok, "ESSID") {
                let essid = essid.trim_matches('"');
                if !essid.is_empty() && essid != "off/any" {
                    link.name = essid.to_string();
                }
            } else if let Some(f) = value_after(tok, "Frequency") {
                let unit = tokens.get(i + 1).filter(|u| u.ends_with("Hz"));
                link.frequency = match unit {
                    Some(u) => format!("{f} {u}"),
                    None => f.to_string(),
                };
            } else if let Some(c) = value_after(tok, "Channel") {
                link.channel = c.to_string();
            }
        }
        if let Some((_, rest)) = line.split_once("Signal level=") {
            if let Some(level) = rest.split_whitespace().next() {
                link.signal = match rest.split_whitespace().nth(1) {
                    Some("dBm") => format!("{level} dBm"),
                    _ => level.to_string(),
                };
            }
        }
    }
    link
}

/// Parse `netsh wlan show interfaces` output (Windows).
pub fn parse_netsh(out: &str) -> LinkIdentity {
    let mut link = LinkIdentity::default();
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if value.is_empty() {
            continue;
        }
        match key {
            "SSID" => link.name = value.to_string(),
            "Signal" => link.signal = value.to_string(),
            "Radio type" => link.vendor = value.to_string(),
            "Channel" => link.channel = value.to_string(),
            "Band" => link.frequency = value.to_string(),
            _ => {}
        }
    }
    link
}

// ---------- Addressing ----------

/// Default gateway from `/proc/net/route` text: the row whose destination
/// is 0.0.0.0. Addresses there are little-endian hex.
pub fn parse_proc_route(table: &str, interface: Option<&str>) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let (iface, dest, gw) = (cols.first()?, cols.get(1)?, cols.get(2)?);
        if *dest != "00000000" || interface.is_some_and(|i| i != *iface) {
            return None;
        }
        let raw = u32::from_str_radix(gw, 16).ok()?;
        Some(Ipv4Addr::from(raw.to_le_bytes()).to_string())
    })
}

/// First two nameservers from resolv.conf text, IPv4 before IPv6.
pub fn parse_resolv_conf(text: &str) -> (String, String) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("nameserver") {
            continue;
        }
        if let Some(ip) = parts.next() {
            if ip.contains(':') {
                v6.push(ip.to_string());
            } else {
                v4.push(ip.to_string());
            }
        }
    }
    let mut all = v4.into_iter().chain(v6);
    let first = all.next().unwrap_or_else(|| UNKNOWN.to_string());
    let second = all.next().unwrap_or_else(|| UNKNOWN.to_string());
    (first, second)
}

fn default_gateway(interface: Option<&str>) -> String {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/net/route")
            .ok()
            .and_then(|t| parse_proc_route(&t, interface))
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = interface;
        UNKNOWN.to_string()
    }
}

fn dns_servers() -> (String, String) {
    #[cfg(unix)]
    {
        match std::fs::read_to_string("/etc/resolv.conf") {
            Ok(t) => parse_resolv_conf(&t),
            Err(_) => (UNKNOWN.to_string(), UNKNOWN.to_string()),
        }
    }
    #[cfg(not(unix))]
    {
        (UNKNOWN.to_string(), UNKNOWN.to_string())
    }
}

/// Fill in gateway and DNS around an already known interface address.
pub fn resolve_addressing(interface: String, local_address: String, subnet: String) -> HostAddressing {
    let known_iface = (interface != UNKNOWN).then_some(interface.as_str());
    let gateway = default_gateway(known_iface);
    let (dns1, dns2) = dns_servers();
    HostAddressing {
        interface,
        local_address,
        subnet,
        gateway,
        dns1,
        dns2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IWCONFIG: &str = r#"wlp2s0    IEEE 802.11  ESSID:"HomeNet"
          Mode:Managed  Frequency:5.18 GHz  Access Point: AA:BB:CC:DD:EE:FF
          Bit Rate=866.7 Mb/s   Tx-Power=22 dBm
          Link Quality=58/70  Signal level=-52 dBm
"#;

    #[test]
    fn iwconfig_fields() {
        let l = parse_iwconfig(IWCONFIG);
        assert_eq!(l.name, "HomeNet");
        assert_eq!(l.vendor, "IEEE 802.11");
        assert_eq!(l.frequency, "5.18 GHz");
        assert_eq!(l.signal, "-52 dBm");
        assert_eq!(l.channel, UNKNOWN);
    }

    #[test]
    fn iwconfig_garbage_is_unknown() {
        assert_eq!(parse_iwconfig("eth0 no wireless extensions."), LinkIdentity::default());
    }

    #[test]
    fn netsh_fields() {
        let out = "    Name                   : Wi-Fi\n    SSID                   : Office\n    BSSID                  : 11:22:33:44:55:66\n    Radio type             : 802.11ax\n    Band                   : 5 GHz\n    Channel                : 44\n    Signal                 : 91%\n";
        let l = parse_netsh(out);
        assert_eq!(l.name, "Office");
        assert_eq!(l.vendor, "802.11ax");
        assert_eq!(l.channel, "44");
        assert_eq!(l.signal, "91%");
        assert_eq!(l.frequency, "5 GHz");
    }

    #[test]
    fn proc_route_gateway() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     wlan0\t0000A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\n\
                     wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\n";
        assert_eq!(parse_proc_route(table, None).as_deref(), Some("192.168.1.1"));
        assert_eq!(parse_proc_route(table, Some("eth0")), None);
    }

    #[test]
    fn resolv_conf_prefers_ipv4() {
        let text = "# generated\nnameserver fe80::1\nnameserver 1.1.1.1\nsearch lan\nnameserver 9.9.9.9\n";
        assert_eq!(
            parse_resolv_conf(text),
            ("1.1.1.1".to_string(), "9.9.9.9".to_string())
        );
        assert_eq!(
            parse_resolv_conf(""),
            (UNKNOWN.to_string(), UNKNOWN.to_string())
        );
    }
}
