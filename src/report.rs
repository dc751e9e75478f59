//! Reporting protocol: per-job lifecycle messages for the server
//!
//! Every job emits START, the address count (NBIP), zero or more DEVICE
//! records, and a final END (twice, a server-compat quirk of the
//! protocol) or a single EXIT when the run is aborted. Messages travel as
//! NETDISCOVERY XML requests tagged with the agent deviceid and the job
//! process number. Delivery is best effort: a failed send is logged and
//! the job carries on.

use std::io::{Cursor, Write};

use async_trait::async_trait;
use log::info;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tokio::sync::Mutex;

use crate::discovery::DeviceRecord;
use crate::error::{DiscoveryError, Result};

/// Version tag stamped on outbound messages
pub const MODULE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One outbound lifecycle message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Start { pid: u32 },
    /// Address count announcement (`NBIP` on the wire)
    BlockSize { pid: u32, count: u64 },
    Device { pid: u32, device: DeviceRecord },
    End { pid: u32 },
    Exit { pid: u32 },
}

impl Message {
    pub fn pid(&self) -> u32 {
        match self {
            Message::Start { pid }
            | Message::BlockSize { pid, .. }
            | Message::Device { pid, .. }
            | Message::End { pid }
            | Message::Exit { pid } => *pid,
        }
    }

    /// Wire name, for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Start { .. } => "START",
            Message::BlockSize { .. } => "NBIP",
            Message::Device { .. } => "DEVICE",
            Message::End { .. } => "END",
            Message::Exit { .. } => "EXIT",
        }
    }

    /// Render the full NETDISCOVERY request envelope
    pub fn to_xml(&self, deviceid: &str) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        write(&mut writer, Event::Start(BytesStart::new("REQUEST")))?;
        text_element(&mut writer, "DEVICEID", deviceid)?;
        text_element(&mut writer, "QUERY", "NETDISCOVERY")?;
        write(&mut writer, Event::Start(BytesStart::new("CONTENT")))?;

        match self {
            Message::Start { pid } => {
                write(&mut writer, Event::Start(BytesStart::new("AGENT")))?;
                text_element(&mut writer, "START", "1")?;
                text_element(&mut writer, "AGENTVERSION", MODULE_VERSION)?;
                write(&mut writer, Event::End(BytesEnd::new("AGENT")))?;
                text_element(&mut writer, "MODULEVERSION", MODULE_VERSION)?;
                text_element(&mut writer, "PROCESSNUMBER", &pid.to_string())?;
            }
            Message::BlockSize { pid, count } => {
                write(&mut writer, Event::Start(BytesStart::new("AGENT")))?;
                text_element(&mut writer, "NBIP", &count.to_string())?;
                write(&mut writer, Event::End(BytesEnd::new("AGENT")))?;
                text_element(&mut writer, "PROCESSNUMBER", &pid.to_string())?;
            }
            Message::Device { pid, device } => {
                write_device(&mut writer, device)?;
                text_element(&mut writer, "MODULEVERSION", MODULE_VERSION)?;
                text_element(&mut writer, "PROCESSNUMBER", &pid.to_string())?;
            }
            Message::End { pid } => {
                write(&mut writer, Event::Start(BytesStart::new("AGENT")))?;
                text_element(&mut writer, "END", "1")?;
                write(&mut writer, Event::End(BytesEnd::new("AGENT")))?;
                text_element(&mut writer, "MODULEVERSION", MODULE_VERSION)?;
                text_element(&mut writer, "PROCESSNUMBER", &pid.to_string())?;
            }
            Message::Exit { pid } => {
                write(&mut writer, Event::Start(BytesStart::new("AGENT")))?;
                text_element(&mut writer, "EXIT", "1")?;
                write(&mut writer, Event::End(BytesEnd::new("AGENT")))?;
                text_element(&mut writer, "MODULEVERSION", MODULE_VERSION)?;
                text_element(&mut writer, "PROCESSNUMBER", &pid.to_string())?;
            }
        }

        write(&mut writer, Event::End(BytesEnd::new("CONTENT")))?;
        write(&mut writer, Event::End(BytesEnd::new("REQUEST")))?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| DiscoveryError::XmlError(e.to_string()))
    }
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn write(writer: &mut XmlWriter, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| DiscoveryError::XmlError(e.to_string()))
}

fn text_element(writer: &mut XmlWriter, name: &str, value: &str) -> Result<()> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    write(writer, Event::Text(BytesText::new(value)))?;
    write(writer, Event::End(BytesEnd::new(name)))
}

fn write_device(writer: &mut XmlWriter, device: &DeviceRecord) -> Result<()> {
    write(writer, Event::Start(BytesStart::new("DEVICE")))?;
    let auth_port = device.auth_port.map(|p| p.to_string());
    let fields: [(&str, Option<&str>); 11] = [
        ("IP", device.ip.as_deref()),
        ("MAC", device.mac.as_deref()),
        ("DNSHOSTNAME", device.dns_hostname.as_deref()),
        ("SNMPHOSTNAME", device.snmp_hostname.as_deref()),
        ("NETBIOSNAME", device.netbios_name.as_deref()),
        ("WORKGROUP", device.workgroup.as_deref()),
        ("USERSESSION", device.user_session.as_deref()),
        ("AUTHSNMP", device.auth_snmp.as_deref()),
        ("AUTHPORT", auth_port.as_deref()),
        ("AUTHPROTOCOL", device.auth_protocol.as_deref()),
        ("ENTITY", device.entity.as_deref()),
    ];
    for (name, value) in fields {
        if let Some(value) = value {
            text_element(writer, name, value)?;
        }
    }
    for (name, value) in &device.extra {
        text_element(writer, name, value)?;
    }
    write(writer, Event::End(BytesEnd::new("DEVICE")))
}

/// Outbound message transport seam. The scheduler serializes sends, so
/// implementations need no internal ordering of their own.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Collects messages in memory; the test harness sink
#[derive(Default)]
pub struct MemorySink {
    messages: Mutex<Vec<Message>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn send(&self, message: &Message) -> Result<()> {
        self.messages.lock().await.push(message.clone());
        Ok(())
    }
}

/// Writes each message envelope to standard output
pub struct StdoutSink {
    deviceid: String,
}

impl StdoutSink {
    pub fn new(deviceid: impl Into<String>) -> Self {
        Self {
            deviceid: deviceid.into(),
        }
    }
}

#[async_trait]
impl ReportSink for StdoutSink {
    async fn send(&self, message: &Message) -> Result<()> {
        let xml = message.to_xml(&self.deviceid)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{xml}")
            .and_then(|_| stdout.flush())
            .map_err(|e| DiscoveryError::ReportError(e.to_string()))?;
        info!("sent {} for job {}", message.kind(), message.pid());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_envelope_fields() {
        let xml = Message::Start { pid: 42 }.to_xml("agent-1").unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<DEVICEID>agent-1</DEVICEID>"));
        assert!(xml.contains("<QUERY>NETDISCOVERY</QUERY>"));
        assert!(xml.contains("<START>1</START>"));
        assert!(xml.contains(&format!("<AGENTVERSION>{MODULE_VERSION}</AGENTVERSION>")));
        assert!(xml.contains("<PROCESSNUMBER>42</PROCESSNUMBER>"));
    }

    #[test]
    fn block_size_envelope() {
        let xml = Message::BlockSize { pid: 7, count: 254 }
            .to_xml("agent-1")
            .unwrap();
        assert!(xml.contains("<NBIP>254</NBIP>"));
        assert!(xml.contains("<PROCESSNUMBER>7</PROCESSNUMBER>"));
        assert!(!xml.contains("MODULEVERSION"));
    }

    #[test]
    fn device_envelope_lists_populated_fields_only() {
        let device = DeviceRecord {
            ip: Some("192.0.2.5".to_string()),
            mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
            dns_hostname: Some("host".to_string()),
            auth_port: Some(1161),
            ..Default::default()
        };
        let xml = Message::Device { pid: 3, device }.to_xml("agent-1").unwrap();
        assert!(xml.contains("<DEVICE>"));
        assert!(xml.contains("<IP>192.0.2.5</IP>"));
        assert!(xml.contains("<MAC>aa:bb:cc:dd:ee:ff</MAC>"));
        assert!(xml.contains("<DNSHOSTNAME>host</DNSHOSTNAME>"));
        assert!(xml.contains("<AUTHPORT>1161</AUTHPORT>"));
        assert!(!xml.contains("<NETBIOSNAME>"));
        assert!(!xml.contains("<WORKGROUP>"));
    }

    #[test]
    fn end_and_exit_envelopes() {
        let end = Message::End { pid: 9 }.to_xml("agent-1").unwrap();
        assert!(end.contains("<END>1</END>"));
        let exit = Message::Exit { pid: 9 }.to_xml("agent-1").unwrap();
        assert!(exit.contains("<EXIT>1</EXIT>"));
    }

    #[test]
    fn xml_escapes_text() {
        let device = DeviceRecord {
            ip: Some("192.0.2.5".to_string()),
            dns_hostname: Some("a<b&c".to_string()),
            ..Default::default()
        };
        let xml = Message::Device { pid: 1, device }.to_xml("agent-1").unwrap();
        assert!(xml.contains("a&lt;b&amp;c"));
    }
}
