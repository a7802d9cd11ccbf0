//! Service entries
//!
//! A `DnsEntry` is the unit the registrar works in: one registered
//! service instance, projected into the DNS records that advertise it
//! (DNS-SD shape: `instance._service._proto.domain` SRV/TXT plus
//! plain A/AAAA/CNAME/PTR projections). The projections are the unit
//! of cache insertion.

use crate::dns::record::{Record, RecordData, RecordType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainProtocol {
    Tcp,
    Udp,
}

impl DomainProtocol {
    fn label(self) -> &'static str {
        match self {
            DomainProtocol::Tcp => "_tcp",
            DomainProtocol::Udp => "_udp",
        }
    }
}

/// One advertised service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsEntry {
    pub instance_name: String,
    pub service_name: String,
    pub domain_protocol: DomainProtocol,
    pub domain_name: String,
    pub priority: u16,
    pub weight: u16,
    pub service_port: u16,
    /// Free-form key=value attributes, projected into TXT data.
    pub values: BTreeMap<String, String>,
    /// IPs or hostnames the entry points at.
    pub domain_targets: Vec<String>,
    pub record_types: Vec<RecordType>,
    pub ttl: i64,
}

impl DnsEntry {
    /// The `_service._proto.domain` name SRV records live under.
    pub fn service_domain(&self) -> String {
        format!(
            "_{}.{}.{}",
            self.service_name.trim_start_matches('_'),
            self.domain_protocol.label(),
            self.domain_name
        )
    }

    /// `instance._service._proto.domain`.
    pub fn instance_domain(&self) -> String {
        format!("{}.{}", self.instance_name, self.service_domain())
    }

    /// The `instance.domain` name the entry's address records live at.
    pub fn host_domain(&self) -> String {
        format!("{}.{}", self.instance_name, self.domain_name)
    }

    /// TXT body: sorted `key=value` pairs.
    pub fn txt_data(&self) -> String {
        self.values
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Project the entry into `(domain, record_data)` pairs for each
    /// requested record type.
    pub fn to_record_data(&self) -> Vec<(String, RecordData)> {
        let mut projections = Vec::new();

        for rtype in &self.record_types {
            match rtype {
                RecordType::A => {
                    for target in &self.domain_targets {
                        if let Ok(IpAddr::V4(addr)) = target.parse::<IpAddr>() {
                            projections.push((self.host_domain(), RecordData::A(addr)));
                        }
                    }
                }

                RecordType::Aaaa => {
                    for target in &self.domain_targets {
                        if let Ok(IpAddr::V6(addr)) = target.parse::<IpAddr>() {
                            projections.push((self.host_domain(), RecordData::Aaaa(addr)));
                        }
                    }
                }

                RecordType::Cname => {
                    for target in &self.domain_targets {
                        if target.parse::<IpAddr>().is_err() {
                            projections.push((
                                self.host_domain(),
                                RecordData::Cname(target.clone()),
                            ));
                        }
                    }
                }

                RecordType::Ptr => {
                    // Service enumeration: the service domain points at
                    // each registered instance.
                    projections.push((
                        self.service_domain(),
                        RecordData::Ptr(self.instance_domain()),
                    ));
                }

                RecordType::Srv => {
                    projections.push((
                        self.service_domain(),
                        RecordData::Srv {
                            priority: self.priority,
                            weight: self.weight,
                            port: self.service_port,
                            target: self.host_domain(),
                        },
                    ));
                }

                RecordType::Txt => {
                    projections.push((
                        self.instance_domain(),
                        RecordData::Txt(self.txt_data()),
                    ));
                }

                _ => {}
            }
        }

        projections
    }

    /// Full records ready for cache insertion.
    pub fn to_records(&self) -> Vec<Record> {
        self.to_record_data()
            .into_iter()
            .map(|(domain, data)| Record::new(&domain, data, self.ttl))
            .collect()
    }

    /// Rebuild a minimal entry from a cached record, for discovery
    /// results.
    pub fn from_record(record: &Record, service_name: &str) -> Option<Self> {
        let (domain_name, port, target) = match &record.data {
            RecordData::A(addr) => (record.name.clone(), 0, addr.to_string()),
            RecordData::Aaaa(addr) => (record.name.clone(), 0, addr.to_string()),
            RecordData::Srv { port, target, .. } => {
                (target.clone(), *port, target.clone())
            }
            _ => return None,
        };

        Some(Self {
            instance_name: record.name.clone(),
            service_name: service_name.to_string(),
            domain_protocol: DomainProtocol::Udp,
            domain_name,
            priority: 0,
            weight: 0,
            service_port: port,
            values: BTreeMap::new(),
            domain_targets: vec![target],
            record_types: vec![record.rtype],
            ttl: record.ttl,
        })
    }
}
