//! IP range parsing and enumeration
//!
//! Scan jobs address targets as inclusive start–end IPv4 intervals rather
//! than CIDR blocks. A range optionally carries SNMP ports, transport
//! domains, an entity tag and a replay file.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{DiscoveryError, Result};

/// One IP range entry of a scan job, as delivered by the server
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RangeSpec {
    /// First address of the range, dotted form
    #[serde(rename = "IPSTART")]
    pub ip_start: Option<String>,

    /// Last address of the range, dotted form (inclusive)
    #[serde(rename = "IPEND")]
    pub ip_end: Option<String>,

    /// SNMP ports to try on each address; empty means the default port
    #[serde(rename = "PORT", default)]
    pub ports: Vec<u16>,

    /// SNMP transport domains to try (e.g. "udp/ipv4")
    #[serde(rename = "PROTOCOL", default)]
    pub domains: Vec<String>,

    /// Entity tag stamped on every device found in this range
    #[serde(rename = "ENTITY")]
    pub entity: Option<String>,

    /// Replay file: when set, only SNMP runs and reads from this dump
    #[serde(rename = "FILE")]
    pub walk: Option<PathBuf>,
}

impl RangeSpec {
    /// Short label for log lines
    pub fn label(&self) -> String {
        format!(
            "{}-{}",
            self.ip_start.as_deref().unwrap_or("?"),
            self.ip_end.as_deref().unwrap_or("?")
        )
    }

    /// Build the address iterator for this range.
    ///
    /// Fails when either bound is missing or unparseable, when the range is
    /// inverted, or when the start address has no set bits (the all-zero
    /// block, which only ever describes an unconfigured entry).
    pub fn iter(&self) -> Result<IpRange> {
        let start = self
            .ip_start
            .as_deref()
            .ok_or_else(|| DiscoveryError::InvalidRange("missing IPSTART".to_string()))?;
        let end = self
            .ip_end
            .as_deref()
            .ok_or_else(|| DiscoveryError::InvalidRange("missing IPEND".to_string()))?;
        IpRange::new(start, end)
    }
}

/// Inclusive iterator over an IPv4 interval
#[derive(Debug, Clone)]
pub struct IpRange {
    next: Option<u32>,
    end: u32,
}

impl IpRange {
    pub fn new(start: &str, end: &str) -> Result<Self> {
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|_| DiscoveryError::InvalidRange(format!("unparseable address {start:?}")))?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|_| DiscoveryError::InvalidRange(format!("unparseable address {end:?}")))?;

        let first = u32::from(start);
        let last = u32::from(end);
        if first == 0 {
            return Err(DiscoveryError::InvalidRange(format!(
                "{start} has no set bits"
            )));
        }
        if first > last {
            return Err(DiscoveryError::InvalidRange(format!("{start} > {end}")));
        }

        Ok(Self {
            next: Some(first),
            end: last,
        })
    }

    /// Number of addresses left to produce
    pub fn len(&self) -> u64 {
        match self.next {
            Some(next) => u64::from(self.end - next) + 1,
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_none()
    }
}

impl Iterator for IpRange {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        let current = self.next?;
        self.next = if current == self.end {
            None
        } else {
            Some(current + 1)
        };
        Some(Ipv4Addr::from(current))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len() as usize;
        (len, Some(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_address_range_has_size_one() {
        let range = IpRange::new("192.168.1.1", "192.168.1.1").unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(
            range.collect::<Vec<_>>(),
            vec!["192.168.1.1".parse::<Ipv4Addr>().unwrap()]
        );
    }

    #[test]
    fn range_is_inclusive_of_both_endpoints() {
        let range = IpRange::new("10.0.0.254", "10.0.1.1").unwrap();
        assert_eq!(range.len(), 4);
        let addrs: Vec<String> = range.map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(IpRange::new("192.168.1.10", "192.168.1.1").is_err());
    }

    #[test]
    fn unparseable_range_is_rejected() {
        assert!(IpRange::new("not-an-ip", "192.168.1.1").is_err());
        assert!(IpRange::new("192.168.1.1", "300.0.0.1").is_err());
    }

    #[test]
    fn all_zero_start_is_rejected() {
        assert!(IpRange::new("0.0.0.0", "0.0.0.10").is_err());
    }

    #[test]
    fn len_tracks_consumption() {
        let mut range = IpRange::new("10.0.0.1", "10.0.0.3").unwrap();
        assert_eq!(range.len(), 3);
        range.next();
        assert_eq!(range.len(), 2);
        range.next();
        range.next();
        assert_eq!(range.len(), 0);
        assert!(range.is_empty());
        assert_eq!(range.next(), None);
    }

    #[test]
    fn spec_without_bounds_does_not_iterate() {
        let spec = RangeSpec {
            ip_start: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        assert!(spec.iter().is_err());
    }
}
