//! SNMP probe: transport abstraction and credential trial
//!
//! The probe walks the cross-product of (port × credential × domain) until
//! one trial returns structured device information. Transports implement
//! [`SnmpTransport`]: the live UDP transport speaks v1/v2c, the walk-file
//! transport replays a recorded dump so scans can run against captures.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::{AddressTask, DeviceRecord};
use crate::error::{DiscoveryError, Result};
use crate::job::Credential;

pub const SNMP_DEFAULT_PORT: u16 = 161;

const OID_SYS_DESCR: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];
const OID_SYS_UPTIME: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 3, 0];
const OID_SYS_NAME: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 5, 0];
const OID_SYS_LOCATION: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 6, 0];

/// Structured device information returned by a successful trial
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnmpDeviceInfo {
    pub hostname: Option<String>,
    /// Additional record fields keyed by their wire names
    pub fields: BTreeMap<String, String>,
}

impl SnmpDeviceInfo {
    pub fn is_empty(&self) -> bool {
        self.hostname.is_none() && self.fields.is_empty()
    }

    fn assign(&mut self, oid: &[u32], value: String) {
        if value.is_empty() {
            return;
        }
        if oid == OID_SYS_NAME {
            self.hostname = Some(value);
        } else if oid == OID_SYS_DESCR {
            self.fields.insert("DESCRIPTION".to_string(), value);
        } else if oid == OID_SYS_LOCATION {
            self.fields.insert("LOCATION".to_string(), value);
        } else if oid == OID_SYS_UPTIME {
            self.fields.insert("UPTIME".to_string(), value);
        }
    }
}

/// One trial against one address
#[derive(Debug, Clone)]
pub struct SnmpQuery<'a> {
    pub ip: Ipv4Addr,
    pub port: Option<u16>,
    pub domain: Option<&'a str>,
    pub timeout: Duration,
    pub credential: &'a Credential,
}

/// SNMP transport seam: live network, file replay, or a test double
#[async_trait]
pub trait SnmpTransport: Send + Sync {
    async fn device_info(&self, query: &SnmpQuery<'_>) -> Result<SnmpDeviceInfo>;
}

/// Live v1/v2c transport over UDP
pub struct UdpSnmpTransport;

#[async_trait]
impl SnmpTransport for UdpSnmpTransport {
    async fn device_info(&self, query: &SnmpQuery<'_>) -> Result<SnmpDeviceInfo> {
        let version = match query.credential.version.as_str() {
            "1" | "" => 0,
            "2c" | "2" => 1,
            other => {
                return Err(DiscoveryError::SnmpError(format!(
                    "version {other} not supported by the UDP transport"
                )))
            }
        };
        if let Some(domain) = query.domain {
            if !domain.starts_with("udp") {
                return Err(DiscoveryError::SnmpError(format!(
                    "transport domain {domain} not supported"
                )));
            }
        }
        let community = query.credential.community.as_deref().unwrap_or("public");
        let port = query.port.unwrap_or(SNMP_DEFAULT_PORT);
        let request_id = rand::thread_rng().gen_range(1..i32::MAX);

        let request = build_get_request(
            version,
            community,
            request_id,
            &[OID_SYS_DESCR, OID_SYS_UPTIME, OID_SYS_NAME, OID_SYS_LOCATION],
        );

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .send_to(&request, (IpAddr::V4(query.ip), port))
            .await?;

        let mut buffer = [0u8; 4096];
        let (received, _) = timeout(query.timeout, socket.recv_from(&mut buffer))
            .await
            .map_err(|_| DiscoveryError::SnmpError("timeout".to_string()))??;
        parse_get_response(&buffer[..received], request_id)
    }
}

/// Replay transport backed by a recorded walk dump. Credential and port
/// are accepted as-is; the dump answers every trial.
pub struct WalkFileTransport {
    path: PathBuf,
}

impl WalkFileTransport {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SnmpTransport for WalkFileTransport {
    async fn device_info(&self, _query: &SnmpQuery<'_>) -> Result<SnmpDeviceInfo> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let info = parse_walk_dump(&content);
        if info.is_empty() {
            Err(DiscoveryError::SnmpError(format!(
                "no usable system entries in {}",
                self.path.display()
            )))
        } else {
            Ok(info)
        }
    }
}

/// Walk the trial list for one address. The first trial returning
/// non-empty device information wins and is annotated with the credential
/// id, port and transport domain that produced it. Failures are logged at
/// debug level and never stop the iteration.
pub async fn credential_trial(
    transport: &dyn SnmpTransport,
    task: &AddressTask,
) -> Option<DeviceRecord> {
    if task.credentials.is_empty() {
        return None;
    }

    let ports: Vec<Option<u16>> = if task.ports.is_empty() {
        vec![None]
    } else {
        task.ports.iter().copied().map(Some).collect()
    };
    let domains: Vec<Option<&str>> = if task.domains.is_empty() {
        vec![None]
    } else {
        task.domains.iter().map(|d| Some(d.as_str())).collect()
    };
    let trial_timeout = Duration::from_secs(task.timeout.max(1));

    for port in &ports {
        for credential in task.credentials.iter() {
            for domain in &domains {
                let query = SnmpQuery {
                    ip: task.ip,
                    port: *port,
                    domain: *domain,
                    timeout: trial_timeout,
                    credential,
                };
                match transport.device_info(&query).await {
                    Ok(info) if !info.is_empty() => {
                        let mut record = DeviceRecord {
                            snmp_hostname: info.hostname,
                            extra: info.fields,
                            ..Default::default()
                        };
                        record.auth_snmp = Some(credential.id.clone());
                        record.auth_port = *port;
                        record.auth_protocol = domain.map(str::to_string);
                        return Some(record);
                    }
                    Ok(_) => {
                        debug!(
                            "snmp trial {}:{:?} credential {} answered empty",
                            task.ip, port, credential.id
                        );
                    }
                    Err(e) => {
                        debug!(
                            "snmp trial {}:{:?} credential {} failed: {e}",
                            task.ip, port, credential.id
                        );
                    }
                }
            }
        }
    }
    None
}

// --- minimal BER encoding for the system-group get-request -------------

fn ber_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else if len <= 0xFF {
        vec![0x81, len as u8]
    } else {
        vec![0x82, (len >> 8) as u8, len as u8]
    }
}

fn ber_tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(ber_len(body.len()));
    out.extend_from_slice(body);
    out
}

fn ber_int(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 && bytes[start] == 0 && bytes[start + 1] & 0x80 == 0 {
        start += 1;
    }
    ber_tlv(0x02, &bytes[start..])
}

fn ber_oid(oid: &[u32]) -> Vec<u8> {
    let mut body = Vec::new();
    if oid.len() >= 2 {
        body.push((oid[0] * 40 + oid[1]) as u8);
        for &arc in &oid[2..] {
            let mut stack = [0u8; 5];
            let mut n = 0;
            let mut value = arc;
            loop {
                stack[n] = (value & 0x7F) as u8;
                value >>= 7;
                n += 1;
                if value == 0 {
                    break;
                }
            }
            for i in (0..n).rev() {
                let mut byte = stack[i];
                if i != 0 {
                    byte |= 0x80;
                }
                body.push(byte);
            }
        }
    }
    ber_tlv(0x06, &body)
}

pub(crate) fn build_get_request(
    version: i64,
    community: &str,
    request_id: i32,
    oids: &[&[u32]],
) -> Vec<u8> {
    let mut varbinds = Vec::new();
    for oid in oids {
        let mut varbind = ber_oid(oid);
        varbind.extend_from_slice(&[0x05, 0x00]); // NULL value
        varbinds.extend(ber_tlv(0x30, &varbind));
    }

    let mut pdu = ber_int(i64::from(request_id));
    pdu.extend(ber_int(0)); // error-status
    pdu.extend(ber_int(0)); // error-index
    pdu.extend(ber_tlv(0x30, &varbinds));

    let mut message = ber_int(version);
    message.extend(ber_tlv(0x04, community.as_bytes()));
    message.extend(ber_tlv(0xA0, &pdu)); // GetRequest
    ber_tlv(0x30, &message)
}

struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_tlv(&mut self) -> Option<(u8, &'a [u8])> {
        let tag = *self.data.get(self.pos)?;
        self.pos += 1;
        let first = *self.data.get(self.pos)?;
        self.pos += 1;
        let len = if first < 0x80 {
            first as usize
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 || count > 2 {
                return None;
            }
            let mut len = 0usize;
            for _ in 0..count {
                len = (len << 8) | *self.data.get(self.pos)? as usize;
                self.pos += 1;
            }
            len
        };
        let body = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some((tag, body))
    }
}

fn ber_read_uint(body: &[u8]) -> u64 {
    body.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn ber_read_oid(body: &[u8]) -> Vec<u32> {
    let mut oid = Vec::new();
    let mut bytes = body.iter();
    if let Some(&first) = bytes.next() {
        oid.push(u32::from(first / 40));
        oid.push(u32::from(first % 40));
    }
    let mut arc = 0u32;
    for &byte in bytes {
        arc = (arc << 7) | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            oid.push(arc);
            arc = 0;
        }
    }
    oid
}

pub(crate) fn parse_get_response(buffer: &[u8], expected_request_id: i32) -> Result<SnmpDeviceInfo> {
    let malformed = || DiscoveryError::SnmpError("malformed response".to_string());

    let mut outer = BerReader::new(buffer);
    let (tag, message) = outer.read_tlv().ok_or_else(malformed)?;
    if tag != 0x30 {
        return Err(malformed());
    }

    let mut message = BerReader::new(message);
    message.read_tlv().ok_or_else(malformed)?; // version
    message.read_tlv().ok_or_else(malformed)?; // community
    let (tag, pdu) = message.read_tlv().ok_or_else(malformed)?;
    if tag != 0xA2 {
        return Err(DiscoveryError::SnmpError(format!(
            "unexpected pdu tag {tag:#04x}"
        )));
    }

    let mut pdu = BerReader::new(pdu);
    let (_, request_id) = pdu.read_tlv().ok_or_else(malformed)?;
    if ber_read_uint(request_id) != expected_request_id as u64 {
        return Err(DiscoveryError::SnmpError("request id mismatch".to_string()));
    }
    let (_, error_status) = pdu.read_tlv().ok_or_else(malformed)?;
    let error_status = ber_read_uint(error_status);
    if error_status != 0 {
        return Err(DiscoveryError::SnmpError(format!(
            "error-status {error_status}"
        )));
    }
    pdu.read_tlv().ok_or_else(malformed)?; // error-index

    let (tag, varbinds) = pdu.read_tlv().ok_or_else(malformed)?;
    if tag != 0x30 {
        return Err(malformed());
    }

    let mut info = SnmpDeviceInfo::default();
    let mut varbinds = BerReader::new(varbinds);
    while let Some((tag, varbind)) = varbinds.read_tlv() {
        if tag != 0x30 {
            break;
        }
        let mut varbind = BerReader::new(varbind);
        let Some((0x06, oid)) = varbind.read_tlv() else {
            continue;
        };
        let Some((tag, value)) = varbind.read_tlv() else {
            continue;
        };
        let oid = ber_read_oid(oid);
        match tag {
            0x04 => {
                let text = String::from_utf8_lossy(value).trim().to_string();
                info.assign(&oid, text);
            }
            // INTEGER, Counter32, Gauge32, TimeTicks, Counter64
            0x02 | 0x41 | 0x42 | 0x43 | 0x46 => {
                info.assign(&oid, ber_read_uint(value).to_string());
            }
            _ => {}
        }
    }

    if info.is_empty() {
        Err(DiscoveryError::SnmpError("empty response".to_string()))
    } else {
        Ok(info)
    }
}

/// Parse a recorded walk dump. Accepts numeric OIDs (with or without the
/// leading dot, `iso.` prefix allowed) and the symbolic SNMPv2-MIB system
/// names, with `OID = TYPE: value` or bare `OID = value` lines.
pub(crate) fn parse_walk_dump(content: &str) -> SnmpDeviceInfo {
    let mut info = SnmpDeviceInfo::default();
    for line in content.lines() {
        let Some((oid_part, value_part)) = line.split_once('=') else {
            continue;
        };
        let oid = normalize_dump_oid(oid_part.trim());
        let Some(oid) = oid else {
            continue;
        };

        let value = value_part.trim();
        let value = match value.split_once(':') {
            Some((type_name, rest)) if type_name.chars().all(|c| c.is_ascii_alphanumeric()) => {
                rest.trim()
            }
            _ => value,
        };
        let value = value.trim_matches('"').trim().to_string();
        info.assign(&oid, value);
    }
    info
}

fn normalize_dump_oid(raw: &str) -> Option<Vec<u32>> {
    for (name, oid) in [
        ("sysDescr.0", OID_SYS_DESCR),
        ("sysUpTime.0", OID_SYS_UPTIME),
        ("sysName.0", OID_SYS_NAME),
        ("sysLocation.0", OID_SYS_LOCATION),
    ] {
        if raw.ends_with(name) {
            return Some(oid.to_vec());
        }
    }

    let numeric = raw.strip_prefix('.').unwrap_or(raw);
    let numeric = numeric.strip_prefix("iso.").map_or_else(
        || numeric.to_string(),
        |rest| format!("1.{rest}"),
    );
    let mut oid = Vec::new();
    for part in numeric.split('.') {
        oid.push(part.parse().ok()?);
    }
    Some(oid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(
        request_id: i32,
        error_status: i64,
        values: &[(&[u32], u8, Vec<u8>)],
    ) -> Vec<u8> {
        let mut varbinds = Vec::new();
        for (oid, tag, body) in values {
            let mut varbind = ber_oid(oid);
            varbind.extend(ber_tlv(*tag, body));
            varbinds.extend(ber_tlv(0x30, &varbind));
        }
        let mut pdu = ber_int(i64::from(request_id));
        pdu.extend(ber_int(error_status));
        pdu.extend(ber_int(0));
        pdu.extend(ber_tlv(0x30, &varbinds));

        let mut message = ber_int(1);
        message.extend(ber_tlv(0x04, b"public"));
        message.extend(ber_tlv(0xA2, &pdu)); // GetResponse
        ber_tlv(0x30, &message)
    }

    #[test]
    fn response_yields_hostname_and_fields() {
        let response = response_with(
            77,
            0,
            &[
                (OID_SYS_DESCR, 0x04, b"Linux core-sw 5.10".to_vec()),
                (OID_SYS_UPTIME, 0x43, vec![0x01, 0x00]),
                (OID_SYS_NAME, 0x04, b"core-sw".to_vec()),
            ],
        );
        let info = parse_get_response(&response, 77).unwrap();
        assert_eq!(info.hostname.as_deref(), Some("core-sw"));
        assert_eq!(
            info.fields.get("DESCRIPTION").map(String::as_str),
            Some("Linux core-sw 5.10")
        );
        assert_eq!(info.fields.get("UPTIME").map(String::as_str), Some("256"));
    }

    #[test]
    fn error_status_is_a_miss() {
        let response = response_with(5, 2, &[(OID_SYS_NAME, 0x04, b"x".to_vec())]);
        assert!(parse_get_response(&response, 5).is_err());
    }

    #[test]
    fn request_id_mismatch_is_a_miss() {
        let response = response_with(5, 0, &[(OID_SYS_NAME, 0x04, b"x".to_vec())]);
        assert!(parse_get_response(&response, 6).is_err());
    }

    #[test]
    fn get_request_is_well_formed() {
        let request = build_get_request(1, "public", 42, &[OID_SYS_NAME]);
        // outer SEQUENCE wrapping version, community and the GetRequest pdu
        let mut reader = BerReader::new(&request);
        let (tag, message) = reader.read_tlv().unwrap();
        assert_eq!(tag, 0x30);
        let mut message = BerReader::new(message);
        let (tag, version) = message.read_tlv().unwrap();
        assert_eq!(tag, 0x02);
        assert_eq!(ber_read_uint(version), 1);
        let (tag, community) = message.read_tlv().unwrap();
        assert_eq!(tag, 0x04);
        assert_eq!(community, b"public");
        let (tag, _) = message.read_tlv().unwrap();
        assert_eq!(tag, 0xA0);
    }

    #[test]
    fn oid_encoding_handles_multibyte_arcs() {
        let encoded = ber_oid(&[1, 3, 6, 1, 4, 1, 311, 1]);
        let mut reader = BerReader::new(&encoded);
        let (tag, body) = reader.read_tlv().unwrap();
        assert_eq!(tag, 0x06);
        assert_eq!(ber_read_oid(body), vec![1, 3, 6, 1, 4, 1, 311, 1]);
    }

    #[test]
    fn walk_dump_numeric_and_symbolic_lines() {
        let dump = "\
.1.3.6.1.2.1.1.1.0 = STRING: \"HP LaserJet\"
iso.3.6.1.2.1.1.3.0 = Timeticks: (1234) 0:00:12.34
SNMPv2-MIB::sysName.0 = STRING: printer-3
.1.3.6.1.2.1.1.6.0 = STRING: basement
garbage line without equals
";
        let info = parse_walk_dump(dump);
        assert_eq!(info.hostname.as_deref(), Some("printer-3"));
        assert_eq!(
            info.fields.get("DESCRIPTION").map(String::as_str),
            Some("HP LaserJet")
        );
        assert_eq!(
            info.fields.get("LOCATION").map(String::as_str),
            Some("basement")
        );
    }

    #[test]
    fn empty_walk_dump_is_empty() {
        assert!(parse_walk_dump("").is_empty());
        assert!(parse_walk_dump("not an oid = STRING: x").is_empty());
    }
}
