//! Probe fusion: one address in, at most one device record out

use std::sync::Arc;

use log::debug;

use super::methods::{ArpProbe, NetbiosProbe, PingProbe};
use super::snmp::{credential_trial, SnmpTransport, UdpSnmpTransport, WalkFileTransport};
use super::{AddressTask, DeviceRecord, ProbeCapabilities};

/// Runs the enabled probes for one address and merges their partial
/// records. Merge order is SNMP, NetBIOS, ping, ARP; a later probe wins
/// conflicting fields. The merged record is only reported when it carries
/// at least one identifying field.
pub struct ProbeEngine {
    capabilities: ProbeCapabilities,
    snmp: Arc<dyn SnmpTransport>,
}

impl ProbeEngine {
    pub fn new(capabilities: ProbeCapabilities, snmp: Arc<dyn SnmpTransport>) -> Self {
        Self { capabilities, snmp }
    }

    /// Engine with detected capabilities and the live UDP transport
    pub fn detect() -> Self {
        Self::new(ProbeCapabilities::detect(), Arc::new(UdpSnmpTransport))
    }

    pub fn capabilities(&self) -> &ProbeCapabilities {
        &self.capabilities
    }

    pub async fn probe(&self, task: &AddressTask) -> Option<DeviceRecord> {
        let mut record = DeviceRecord::default();

        if let Some(walk) = &task.walk {
            // replay mode: only SNMP runs, against the recorded dump
            let transport = WalkFileTransport::new(walk.clone());
            if let Some(partial) = credential_trial(&transport, task).await {
                record.merge(partial);
            }
        } else {
            if self.capabilities.snmp {
                if let Some(partial) = credential_trial(self.snmp.as_ref(), task).await {
                    record.merge(partial);
                }
            }
            if self.capabilities.netbios {
                record.merge(NetbiosProbe::new(task.timeout).probe(task.ip).await);
            }
            if self.capabilities.ping {
                record.merge(
                    PingProbe::new(self.capabilities.ping_timestamp)
                        .probe(task.ip)
                        .await,
                );
            }
            if let Some(command) = self.capabilities.arp {
                record.merge(ArpProbe::new(command).probe(task.ip).await);
            }
        }

        if !record.has_identity() {
            debug!("job {}: nothing found at {}", task.pid, task.ip);
            return None;
        }

        record.ip = Some(task.ip.to_string());
        if let Some(mac) = record.mac.take() {
            record.mac = super::canonical_mac(&mac);
        }
        if record.entity.is_none() {
            record.entity = task.entity.clone();
        }
        Some(record)
    }
}
