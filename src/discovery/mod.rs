//! Device discovery: probe methods and per-address fusion
//!
//! Four detection methods feed one device record per address: SNMP
//! (credential trial), NetBIOS node status, ICMP ping and the system ARP
//! table. Which methods run is decided once at engine construction by a
//! capability set, not rediscovered per address.

pub mod engine;
pub mod methods;
pub mod snmp;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use serde::Serialize;

pub use engine::ProbeEngine;
pub use methods::ArpCommand;

use crate::job::Credential;

/// Immutable description of one address to probe, handed to a worker
#[derive(Debug, Clone)]
pub struct AddressTask {
    pub pid: u32,
    pub ip: Ipv4Addr,
    /// Per-address timeout in seconds (job-declared)
    pub timeout: u64,
    pub credentials: Arc<Vec<Credential>>,
    pub ports: Arc<Vec<u16>>,
    pub domains: Arc<Vec<String>>,
    pub entity: Option<String>,
    pub walk: Option<PathBuf>,
}

/// Partial or complete device record assembled from probe results
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub ip: Option<String>,
    /// Canonical lowercase colon-hex when present
    pub mac: Option<String>,
    pub dns_hostname: Option<String>,
    pub snmp_hostname: Option<String>,
    pub netbios_name: Option<String>,
    pub workgroup: Option<String>,
    pub user_session: Option<String>,
    pub auth_snmp: Option<String>,
    pub auth_port: Option<u16>,
    pub auth_protocol: Option<String>,
    pub entity: Option<String>,
    /// SNMP-derived hardware fields (DESCRIPTION, LOCATION, UPTIME, ...)
    pub extra: BTreeMap<String, String>,
}

impl DeviceRecord {
    /// Overlay `other` on top of this record: populated fields of `other`
    /// win on conflict.
    pub fn merge(&mut self, other: DeviceRecord) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(ip);
        take!(mac);
        take!(dns_hostname);
        take!(snmp_hostname);
        take!(netbios_name);
        take!(workgroup);
        take!(user_session);
        take!(auth_snmp);
        take!(auth_port);
        take!(auth_protocol);
        take!(entity);
        self.extra.extend(other.extra);
    }

    /// Minimum-information acceptance rule: a record is only reported when
    /// it identifies the device by at least one of these fields.
    pub fn has_identity(&self) -> bool {
        self.mac.is_some()
            || self.snmp_hostname.is_some()
            || self.dns_hostname.is_some()
            || self.netbios_name.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == DeviceRecord::default()
    }
}

/// Normalize a MAC address to lowercase colon-separated hex pairs.
/// Accepts `:` or `-` separators and single-digit groups.
pub fn canonical_mac(raw: &str) -> Option<String> {
    let groups: Vec<&str> = raw.trim().split([':', '-']).collect();
    if groups.len() != 6 {
        return None;
    }
    let mut bytes = Vec::with_capacity(6);
    for group in groups {
        if group.is_empty() || group.len() > 2 {
            return None;
        }
        bytes.push(u8::from_str_radix(group, 16).ok()?);
    }
    Some(
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Which probe methods the engine may run, decided at initialization
#[derive(Debug, Clone, Default)]
pub struct ProbeCapabilities {
    pub snmp: bool,
    pub netbios: bool,
    pub ping: bool,
    /// Retry a failed echo with an ICMP timestamp request
    pub ping_timestamp: bool,
    /// ARP table listing command found on this host, if any
    pub arp: Option<ArpCommand>,
}

impl ProbeCapabilities {
    /// Detect what this host can do: SNMP and NetBIOS ride plain UDP and
    /// always work, ICMP needs a raw socket, ARP needs a listing command.
    pub fn detect() -> Self {
        let ping = raw_icmp_available();
        let arp = ArpCommand::detect();
        let caps = Self {
            snmp: true,
            netbios: true,
            ping,
            ping_timestamp: ping,
            arp,
        };
        debug!(
            "probe capabilities: snmp={} netbios={} ping={} arp={:?}",
            caps.snmp, caps.netbios, caps.ping, caps.arp
        );
        caps
    }

    /// Everything disabled; useful for liveness-only runs and tests
    pub fn none() -> Self {
        Self::default()
    }
}

fn raw_icmp_available() -> bool {
    use socket2::{Domain, Protocol, Socket, Type};
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_lowercased_and_padded() {
        assert_eq!(
            canonical_mac("aa:BB:cc:dd:ee:ff").as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );
        assert_eq!(
            canonical_mac("AA-BB-CC-DD-EE-FF").as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );
        assert_eq!(
            canonical_mac("0:d:93:8e:b8:e0").as_deref(),
            Some("00:0d:93:8e:b8:e0")
        );
    }

    #[test]
    fn bad_macs_are_rejected() {
        assert!(canonical_mac("aa:bb:cc:dd:ee").is_none());
        assert!(canonical_mac("aa:bb:cc:dd:ee:ff:00").is_none());
        assert!(canonical_mac("zz:bb:cc:dd:ee:ff").is_none());
        assert!(canonical_mac("").is_none());
    }

    #[test]
    fn canonical_macs_match_wire_format() {
        let mac = canonical_mac("A4-5E-60-01-02-03").unwrap();
        assert!(mac
            .split(':')
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit())));
        assert_eq!(mac.split(':').count(), 6);
        assert_eq!(mac, mac.to_lowercase());
    }

    #[test]
    fn merge_overwrites_on_conflict() {
        let mut base = DeviceRecord {
            dns_hostname: Some("10.0.0.1".to_string()),
            mac: Some("aa:aa:aa:aa:aa:aa".to_string()),
            ..Default::default()
        };
        base.merge(DeviceRecord {
            dns_hostname: Some("printer.lan".to_string()),
            ..Default::default()
        });
        assert_eq!(base.dns_hostname.as_deref(), Some("printer.lan"));
        assert_eq!(base.mac.as_deref(), Some("aa:aa:aa:aa:aa:aa"));
    }

    #[test]
    fn identity_rule() {
        assert!(!DeviceRecord::default().has_identity());
        let record = DeviceRecord {
            workgroup: Some("WORKGROUP".to_string()),
            user_session: Some("ADMIN".to_string()),
            ..Default::default()
        };
        assert!(!record.has_identity());
        let record = DeviceRecord {
            netbios_name: Some("HOST".to_string()),
            ..Default::default()
        };
        assert!(record.has_identity());
    }
}
