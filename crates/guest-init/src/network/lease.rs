//! Address leases and how they are applied to a link.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::config::NetworkConfig;

use super::error::{NetworkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    V4,
    V6,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::V4 => f.write_str("dhcpv4"),
            Protocol::V6 => f.write_str("dhcpv6"),
        }
    }
}

/// Addressing obtained for one link: from DHCP, netboot, or static config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub protocol: Protocol,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub router: Option<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub lease_secs: Option<u32>,
    /// Boot file name announced by the server (netboot).
    pub boot_file: Option<String>,
    /// Next server address announced by the server (netboot).
    pub server: Option<IpAddr>,
}

impl Lease {
    /// Build a lease from a `static` network configuration.
    pub fn from_static(config: &NetworkConfig) -> Result<Self> {
        let cidr = config
            .address
            .as_deref()
            .ok_or_else(|| NetworkError::InvalidLease("static mode needs an address".into()))?;
        let (address, prefix_len) = parse_cidr(cidr)?;
        let router = config.gateway.as_deref().map(parse_ip).transpose()?;
        let dns = config
            .dns
            .iter()
            .map(|s| parse_ip(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            protocol: if address.is_ipv4() {
                Protocol::V4
            } else {
                Protocol::V6
            },
            address,
            prefix_len,
            router,
            dns,
            lease_secs: None,
            boot_file: None,
            server: None,
        })
    }

    /// Parse the `key=value` lines printed by the DHCP client hook.
    ///
    /// Lines that are not `key=value` pairs for a known key are ignored, so
    /// client chatter on stdout does not matter.
    pub fn parse_report(protocol: Protocol, report: &str) -> Result<Self> {
        let mut address = None;
        let mut prefix_len = None;
        let mut router = None;
        let mut dns = Vec::new();
        let mut lease_secs = None;
        let mut boot_file = None;
        let mut server = None;

        for (key, value) in report.lines().filter_map(|l| l.trim().split_once('=')) {
            let value = value.trim();
            match (protocol, key) {
                (Protocol::V4, "ip") | (Protocol::V6, "ipv6") => address = Some(parse_ip(value)?),
                (Protocol::V4, "mask") => {
                    prefix_len = Some(value.parse::<u8>().map_err(|e| {
                        NetworkError::InvalidLease(format!("mask {value:?}: {e}"))
                    })?);
                }
                (Protocol::V4, "subnet") if prefix_len.is_none() => {
                    let mask: Ipv4Addr = value.parse().map_err(|e| {
                        NetworkError::InvalidLease(format!("subnet {value:?}: {e}"))
                    })?;
                    // Leading ones of a contiguous netmask; at most 32.
                    prefix_len = u8::try_from(u32::from(mask).leading_ones()).ok();
                }
                (_, "router") => {
                    router = value.split_whitespace().next().map(parse_ip).transpose()?;
                }
                (_, "dns") => {
                    dns = value
                        .split_whitespace()
                        .map(parse_ip)
                        .collect::<Result<Vec<_>>>()?;
                }
                (_, "lease") => lease_secs = value.parse().ok(),
                (_, "boot_file") if !value.is_empty() => boot_file = Some(value.to_string()),
                (_, "siaddr") => server = parse_ip(value).ok().filter(|ip| !ip.is_unspecified()),
                _ => {}
            }
        }

        let address = address
            .ok_or_else(|| NetworkError::InvalidLease(format!("{protocol} report has no address")))?;
        let prefix_len = prefix_len.unwrap_or(host_prefix_len(address));
        if prefix_len > host_prefix_len(address) {
            return Err(NetworkError::InvalidLease(format!(
                "prefix /{prefix_len} too long for {address}"
            )));
        }
        Ok(Self {
            protocol,
            address,
            prefix_len,
            router,
            dns,
            lease_secs,
            boot_file,
            server,
        })
    }

    /// `ip` invocations that configure this lease on `link`.
    pub fn ip_commands(&self, link: &str) -> Vec<Vec<String>> {
        let family = match self.address {
            IpAddr::V4(_) => "-4",
            IpAddr::V6(_) => "-6",
        };
        let mut commands = vec![vec![
            family.to_string(),
            "addr".into(),
            "replace".into(),
            format!("{}/{}", self.address, self.prefix_len),
            "dev".into(),
            link.to_string(),
        ]];
        if let Some(router) = self.router {
            commands.push(vec![
                family.to_string(),
                "route".into(),
                "replace".into(),
                "default".into(),
                "via".into(),
                router.to_string(),
                "dev".into(),
                link.to_string(),
            ]);
        }
        commands
    }

    /// Merge this lease's name servers into an existing `resolv.conf`.
    ///
    /// Returns `None` when every server is already listed.
    pub fn merge_resolv_conf(&self, existing: &str) -> Option<String> {
        let missing: Vec<_> = self
            .dns
            .iter()
            .map(|ip| format!("nameserver {ip}"))
            .filter(|line| !existing.lines().any(|l| l.trim() == line))
            .collect();
        if missing.is_empty() {
            return None;
        }
        let mut merged = existing.to_string();
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        for line in missing {
            merged.push_str(&line);
            merged.push('\n');
        }
        Some(merged)
    }
}

fn host_prefix_len(address: IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn parse_ip(value: &str) -> Result<IpAddr> {
    value
        .parse()
        .map_err(|e| NetworkError::InvalidLease(format!("address {value:?}: {e}")))
}

/// Parse `addr/len`; a bare address is a host route.
fn parse_cidr(value: &str) -> Result<(IpAddr, u8)> {
    let Some((addr, len)) = value.split_once('/') else {
        let address = parse_ip(value)?;
        return Ok((address, host_prefix_len(address)));
    };
    let address = parse_ip(addr)?;
    let prefix_len: u8 = len
        .parse()
        .map_err(|e| NetworkError::InvalidLease(format!("prefix {len:?}: {e}")))?;
    if prefix_len > host_prefix_len(address) {
        return Err(NetworkError::InvalidLease(format!(
            "prefix /{prefix_len} too long for {address}"
        )));
    }
    Ok((address, prefix_len))
}
