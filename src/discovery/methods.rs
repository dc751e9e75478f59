//! Probe method implementations: ARP table, ICMP ping, NetBIOS node status
//!
//! Every probe is a pure function of (address, parameters) returning a
//! partial [`DeviceRecord`]. Transport failures never surface to callers;
//! they yield an empty partial and the fusion moves on.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use log::debug;
use once_cell::sync::Lazy;
use pnet::packet::icmp::{checksum, IcmpCode, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::{MutablePacket, Packet};
use rand::Rng;
use regex::Regex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::{canonical_mac, DeviceRecord};

/// ARP table listing command available on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpCommand {
    /// `arp -a <ip>`
    Arp,
    /// `ip neighbor show <ip>`
    IpNeighbor,
}

impl ArpCommand {
    /// Probe for a working listing command; `arp -a` is preferred.
    pub fn detect() -> Option<ArpCommand> {
        let works = |program: &str, args: &[&str]| {
            std::process::Command::new(program)
                .args(args)
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false)
        };
        if works("arp", &["-a"]) {
            Some(ArpCommand::Arp)
        } else if works("ip", &["neighbor", "show"]) {
            Some(ArpCommand::IpNeighbor)
        } else {
            None
        }
    }

    async fn list(&self, ip: Ipv4Addr) -> std::io::Result<String> {
        let output = match self {
            ArpCommand::Arp => {
                tokio::process::Command::new("arp")
                    .arg("-a")
                    .arg(ip.to_string())
                    .output()
                    .await?
            }
            ArpCommand::IpNeighbor => {
                tokio::process::Command::new("ip")
                    .arg("neighbor")
                    .arg("show")
                    .arg(ip.to_string())
                    .output()
                    .await?
            }
        };
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// ARP table lookup probe
pub struct ArpProbe {
    command: ArpCommand,
}

// `hostname (ip) at xx:xx:xx:xx:xx:xx`, BSD/libc arp output
static ARP_HOST_AT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\S+)\s+\(([\d.]+)\)\s+at\s+([0-9A-Fa-f]{1,2}(?::[0-9A-Fa-f]{1,2}){5})")
        .unwrap()
});

// `  192.0.2.5   aa-bb-cc-dd-ee-ff   dynamic`, Windows arp output
static ARP_WINDOWS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s+([\d.]+)\s+([0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5})").unwrap()
});

// `ip dev eth0 lladdr xx:xx:xx:xx:xx:xx`, ip neighbor output
static ARP_LLADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\blladdr\s+([0-9A-Fa-f]{1,2}(?::[0-9A-Fa-f]{1,2}){5})").unwrap()
});

impl ArpProbe {
    pub fn new(command: ArpCommand) -> Self {
        Self { command }
    }

    pub async fn probe(&self, ip: Ipv4Addr) -> DeviceRecord {
        match self.command.list(ip).await {
            Ok(output) => parse_arp_output(&output, ip),
            Err(e) => {
                debug!("arp listing for {ip} failed: {e}");
                DeviceRecord::default()
            }
        }
    }
}

/// Extract hostname and MAC from ARP listing output for one address.
/// Only lines containing the address as a full word are considered.
pub(crate) fn parse_arp_output(output: &str, ip: Ipv4Addr) -> DeviceRecord {
    let mut record = DeviceRecord::default();
    let ip_text = ip.to_string();
    // word-boundary match: the address must stand alone, so 192.0.2.5
    // does not match inside 192.0.2.50
    let contains_ip = |line: &str| {
        line.split(|c: char| !c.is_ascii_digit() && c != '.')
            .any(|token| token == ip_text)
    };

    for line in output.lines() {
        if !contains_ip(line) {
            continue;
        }
        if let Some(caps) = ARP_HOST_AT.captures(line) {
            if &caps[2] == ip_text {
                let hostname = &caps[1];
                if hostname != "?" {
                    record.dns_hostname = Some(hostname.to_string());
                }
                record.mac = canonical_mac(&caps[3]);
            }
        } else if let Some(caps) = ARP_WINDOWS.captures(line) {
            if &caps[1] == ip_text {
                record.mac = canonical_mac(&caps[2]);
            }
        } else if let Some(caps) = ARP_LLADDR.captures(line) {
            record.mac = canonical_mac(&caps[1]);
        }
        if record.mac.is_some() {
            break;
        }
    }
    record
}

/// ICMP liveness probe: echo request with a hard 1-second timeout, with an
/// optional one-shot timestamp-request retry. A response marks the address
/// alive by setting `DNSHOSTNAME` to the address itself.
pub struct PingProbe {
    timeout: Duration,
    timestamp_retry: bool,
}

enum IcmpKind {
    Echo,
    Timestamp,
}

impl PingProbe {
    pub fn new(timestamp_retry: bool) -> Self {
        Self {
            timeout: Duration::from_secs(1),
            timestamp_retry,
        }
    }

    pub async fn probe(&self, ip: Ipv4Addr) -> DeviceRecord {
        let mut alive = self.request(ip, IcmpKind::Echo).await;
        if !alive && self.timestamp_retry {
            alive = self.request(ip, IcmpKind::Timestamp).await;
        }

        let mut record = DeviceRecord::default();
        if alive {
            record.dns_hostname = Some(ip.to_string());
        }
        record
    }

    async fn request(&self, ip: Ipv4Addr, kind: IcmpKind) -> bool {
        let socket = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
            Ok(socket) => socket,
            Err(e) => {
                debug!("icmp socket for {ip} failed: {e}");
                return false;
            }
        };
        if socket.set_nonblocking(true).is_err() {
            return false;
        }

        let identifier = rand::thread_rng().gen::<u16>();
        let sequence = rand::thread_rng().gen::<u16>();
        let mut buffer = [0u8; 64];
        let Some(mut packet) = MutableIcmpPacket::new(&mut buffer) else {
            return false;
        };
        let reply_type = match kind {
            IcmpKind::Echo => {
                packet.set_icmp_type(IcmpTypes::EchoRequest);
                IcmpTypes::EchoReply
            }
            IcmpKind::Timestamp => {
                packet.set_icmp_type(IcmpTypes::Timestamp);
                IcmpTypes::TimestampReply
            }
        };
        packet.set_icmp_code(IcmpCode(0));
        packet.set_checksum(0);

        // identifier and sequence live in the first payload bytes for both
        // echo and timestamp messages
        let payload = packet.payload_mut();
        payload[0..2].copy_from_slice(&identifier.to_be_bytes());
        payload[2..4].copy_from_slice(&sequence.to_be_bytes());

        let sum = checksum(&packet.to_immutable());
        packet.set_checksum(sum);

        let dest = SockAddr::from(std::net::SocketAddr::new(IpAddr::V4(ip), 0));
        if let Err(e) = socket.send_to(&buffer, &dest) {
            debug!("icmp send to {ip} failed: {e}");
            return false;
        }

        timeout(self.timeout, wait_for_reply(&socket, reply_type, identifier))
            .await
            .unwrap_or(false)
    }
}

async fn wait_for_reply(
    socket: &Socket,
    reply_type: pnet::packet::icmp::IcmpType,
    identifier: u16,
) -> bool {
    let start = Instant::now();
    let mut buffer = vec![std::mem::MaybeUninit::new(0u8); 1024];

    loop {
        match socket.recv_from(&mut buffer) {
            Ok((received, _)) => {
                // IP header (20) + ICMP header (4) + identifier/sequence (4)
                if received < 28 {
                    continue;
                }
                let bytes: Vec<u8> = buffer[..received]
                    .iter()
                    .map(|b| unsafe { b.assume_init() })
                    .collect();
                let Some(ip_packet) = Ipv4Packet::new(&bytes) else {
                    continue;
                };
                if ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
                    continue;
                }
                let offset = (ip_packet.get_header_length() as usize) * 4;
                let Some(icmp) = IcmpPacket::new(&bytes[offset..received]) else {
                    continue;
                };
                if icmp.get_icmp_type() != reply_type {
                    continue;
                }
                let payload = icmp.payload();
                if payload.len() >= 2 && payload[0..2] == identifier.to_be_bytes() {
                    return true;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(_) => return false,
        }
        if start.elapsed() > Duration::from_secs(2) {
            return false;
        }
    }
}

/// NetBIOS node status probe over UDP/137
pub struct NetbiosProbe {
    timeout: Duration,
}

const NETBIOS_PORT: u16 = 137;
const NODE_STATUS_GROUP: u16 = 0x8000;

impl NetbiosProbe {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub async fn probe(&self, ip: Ipv4Addr) -> DeviceRecord {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("netbios socket for {ip} failed: {e}");
                return DeviceRecord::default();
            }
        };

        let txid = rand::thread_rng().gen::<u16>();
        let query = build_node_status_query(txid);
        if let Err(e) = socket.send_to(&query, (IpAddr::V4(ip), NETBIOS_PORT)).await {
            debug!("netbios query to {ip} failed: {e}");
            return DeviceRecord::default();
        }

        let mut buffer = [0u8; 512];
        match timeout(self.timeout, socket.recv_from(&mut buffer)).await {
            Ok(Ok((received, _))) => parse_node_status(&buffer[..received], txid),
            Ok(Err(e)) => {
                debug!("netbios receive from {ip} failed: {e}");
                DeviceRecord::default()
            }
            Err(_) => DeviceRecord::default(),
        }
    }
}

/// NBSTAT query for the wildcard name `*`
pub(crate) fn build_node_status_query(txid: u16) -> [u8; 50] {
    let mut packet = [0u8; 50];
    packet[0..2].copy_from_slice(&txid.to_be_bytes());
    // flags 0, one question, no answer/authority/additional records
    packet[5] = 1;
    // first-level encoded wildcard name: '*' then 15 NUL bytes, each byte
    // split into two nibbles offset from 'A'
    packet[12] = 0x20;
    packet[13] = b'C';
    packet[14] = b'K';
    for i in 15..45 {
        packet[i] = b'A';
    }
    packet[45] = 0x00;
    // qtype NBSTAT, qclass IN
    packet[47] = 0x21;
    packet[49] = 0x01;
    packet
}

/// Decode a node status response into workgroup, session, host name and
/// the adapter MAC. Malformed packets yield an empty record.
pub(crate) fn parse_node_status(buffer: &[u8], txid: u16) -> DeviceRecord {
    let mut record = DeviceRecord::default();
    if buffer.len() < 12 || buffer[0..2] != txid.to_be_bytes() {
        return record;
    }
    let answers = u16::from_be_bytes([buffer[6], buffer[7]]);
    if answers == 0 {
        return record;
    }

    // answer name: either a pointer or a full first-level encoded name
    let mut pos = 12;
    if buffer.len() > pos && buffer[pos] & 0xC0 == 0xC0 {
        pos += 2;
    } else {
        while pos < buffer.len() && buffer[pos] != 0 {
            pos += 1 + buffer[pos] as usize;
        }
        pos += 1;
    }
    // type, class, ttl, rdlength
    pos += 10;
    if pos > buffer.len() {
        return record;
    }

    let Some(&name_count) = buffer.get(pos) else {
        return record;
    };
    pos += 1;

    for _ in 0..name_count {
        let Some(entry) = buffer.get(pos..pos + 18) else {
            return record;
        };
        let name = String::from_utf8_lossy(&entry[0..15])
            .trim_end_matches([' ', '\0'])
            .to_string();
        let suffix = entry[15];
        let flags = u16::from_be_bytes([entry[16], entry[17]]);
        let group = flags & NODE_STATUS_GROUP != 0;

        match (suffix, group) {
            (0x00, true) => record.workgroup = Some(name),
            (0x03, false) => record.user_session = Some(name),
            (0x00, false) => {
                if !name.starts_with("IS~") {
                    record.netbios_name = Some(name);
                }
            }
            _ => {}
        }
        pos += 18;
    }

    // statistics block starts with the six-byte unit ID
    if let Some(unit_id) = buffer.get(pos..pos + 6) {
        record.mac = canonical_mac(
            &unit_id
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
        );
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arp_host_at_shape_sets_hostname_and_mac() {
        let ip: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let output = "host (192.0.2.5) at aa:BB:cc:dd:ee:ff on en0 ifscope [ethernet]\n";
        let record = parse_arp_output(output, ip);
        assert_eq!(record.dns_hostname.as_deref(), Some("host"));
        assert_eq!(record.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn arp_unknown_hostname_is_dropped() {
        let ip: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let output = "? (192.0.2.5) at 0:d:93:8e:b8:e0 on en0\n";
        let record = parse_arp_output(output, ip);
        assert_eq!(record.dns_hostname, None);
        assert_eq!(record.mac.as_deref(), Some("00:0d:93:8e:b8:e0"));
    }

    #[test]
    fn arp_windows_shape_converts_dashes() {
        let ip: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let output = "\nInterface: 192.0.2.1 --- 0x4\n  192.0.2.5   AA-BB-CC-DD-EE-FF  dynamic\n";
        let record = parse_arp_output(output, ip);
        assert_eq!(record.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(record.dns_hostname, None);
    }

    #[test]
    fn arp_lladdr_shape() {
        let ip: Ipv4Addr = "10.1.2.3".parse().unwrap();
        let output = "10.1.2.3 dev eth0 lladdr 52:54:00:12:34:56 REACHABLE\n";
        let record = parse_arp_output(output, ip);
        assert_eq!(record.mac.as_deref(), Some("52:54:00:12:34:56"));
    }

    #[test]
    fn arp_ignores_other_addresses() {
        let ip: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let output = "other (192.0.2.50) at 11:22:33:44:55:66 on en0\n";
        let record = parse_arp_output(output, ip);
        assert!(record.is_empty());
    }

    fn sample_node_status(txid: u16) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&txid.to_be_bytes());
        packet.extend_from_slice(&[0x84, 0x00]); // response flags
        packet.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]); // counts
        // answer name, full encoded form
        packet.push(0x20);
        packet.push(b'C');
        packet.push(b'K');
        packet.extend(std::iter::repeat(b'A').take(30));
        packet.push(0x00);
        packet.extend_from_slice(&[0x00, 0x21, 0x00, 0x01]); // type, class
        packet.extend_from_slice(&[0, 0, 0, 0]); // ttl
        packet.extend_from_slice(&[0, 61]); // rdlength
        packet.push(3); // three names
        packet.extend_from_slice(b"FILESRV        ");
        packet.extend_from_slice(&[0x00, 0x04, 0x00]); // unique
        packet.extend_from_slice(b"WORKGROUP      ");
        packet.extend_from_slice(&[0x00, 0x84, 0x00]); // group
        packet.extend_from_slice(b"ADMIN          ");
        packet.extend_from_slice(&[0x03, 0x04, 0x00]); // unique, session
        packet.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22]); // unit ID
        packet
    }

    #[test]
    fn node_status_names_are_classified() {
        let response = sample_node_status(0x1234);
        let record = parse_node_status(&response, 0x1234);
        assert_eq!(record.netbios_name.as_deref(), Some("FILESRV"));
        assert_eq!(record.workgroup.as_deref(), Some("WORKGROUP"));
        assert_eq!(record.user_session.as_deref(), Some("ADMIN"));
        assert_eq!(record.mac.as_deref(), Some("aa:bb:cc:00:11:22"));
    }

    #[test]
    fn node_status_skips_is_prefixed_names() {
        let mut response = sample_node_status(0x0042);
        // rewrite the unique host name to the ISA-proxy marker
        let name_start = 2 + 2 + 8 + 34 + 4 + 4 + 2 + 1;
        response[name_start..name_start + 15].copy_from_slice(b"IS~PROXY       ");
        let record = parse_node_status(&response, 0x0042);
        assert_eq!(record.netbios_name, None);
        assert_eq!(record.workgroup.as_deref(), Some("WORKGROUP"));
    }

    #[test]
    fn node_status_rejects_wrong_transaction() {
        let response = sample_node_status(0x1234);
        let record = parse_node_status(&response, 0x9999);
        assert!(record.is_empty());
    }

    #[test]
    fn node_status_query_shape() {
        let query = build_node_status_query(0xBEEF);
        assert_eq!(query.len(), 50);
        assert_eq!(&query[0..2], &[0xBE, 0xEF]);
        assert_eq!(query[12], 0x20);
        assert_eq!(&query[13..15], b"CK");
        assert_eq!(query[47], 0x21);
    }

    #[test]
    fn truncated_node_status_is_safe() {
        let response = sample_node_status(0x1234);
        for cut in [0, 5, 13, 40, 57] {
            let record = parse_node_status(&response[..cut.min(response.len())], 0x1234);
            assert!(record.netbios_name.is_none());
        }
    }
}
