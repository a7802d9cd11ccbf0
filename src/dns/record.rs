//! DNS records and RFC 1035 wire primitives
//!
//! Domain names are packed with compression against a shared name
//! table and loaded with pointer following (bounded, so crafted
//! pointer loops cannot spin forever). Record data is a sum type keyed
//! on the record type; unknown types round-trip as raw bytes.

use crate::dns::DnsError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

/// TTL written for records configured to never expire (`ttl < 0`).
const PINNED_TTL: u32 = 3600;

/// Longest pointer chain tolerated while loading a name.
const MAX_POINTER_JUMPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Srv,
    Naptr,
    Any,
    Unsupported(u16),
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Naptr => 35,
            RecordType::Any => 255,
            RecordType::Unsupported(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            33 => RecordType::Srv,
            35 => RecordType::Naptr,
            255 => RecordType::Any,
            other => RecordType::Unsupported(other),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "A" => Some(RecordType::A),
            "NS" => Some(RecordType::Ns),
            "CNAME" => Some(RecordType::Cname),
            "SOA" => Some(RecordType::Soa),
            "PTR" => Some(RecordType::Ptr),
            "MX" => Some(RecordType::Mx),
            "TXT" => Some(RecordType::Txt),
            "AAAA" => Some(RecordType::Aaaa),
            "SRV" => Some(RecordType::Srv),
            "NAPTR" => Some(RecordType::Naptr),
            "ANY" => Some(RecordType::Any),
            _ => None,
        }
    }

    pub fn name(self) -> String {
        match self {
            RecordType::A => "A".to_string(),
            RecordType::Ns => "NS".to_string(),
            RecordType::Cname => "CNAME".to_string(),
            RecordType::Soa => "SOA".to_string(),
            RecordType::Ptr => "PTR".to_string(),
            RecordType::Mx => "MX".to_string(),
            RecordType::Txt => "TXT".to_string(),
            RecordType::Aaaa => "AAAA".to_string(),
            RecordType::Srv => "SRV".to_string(),
            RecordType::Naptr => "NAPTR".to_string(),
            RecordType::Any => "ANY".to_string(),
            RecordType::Unsupported(code) => format!("TYPE{code}"),
        }
    }
}

/// Record data, keyed on the record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ns(String),
    Ptr(String),
    Txt(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Naptr {
        order: u16,
        preference: u16,
        flags: String,
        service: String,
        regexp: String,
        replacement: String,
    },
    Unsupported {
        rtype: u16,
        raw: Vec<u8>,
    },
}

impl RecordData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Aaaa(_) => RecordType::Aaaa,
            RecordData::Cname(_) => RecordType::Cname,
            RecordData::Ns(_) => RecordType::Ns,
            RecordData::Ptr(_) => RecordType::Ptr,
            RecordData::Txt(_) => RecordType::Txt,
            RecordData::Mx { .. } => RecordType::Mx,
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Soa { .. } => RecordType::Soa,
            RecordData::Naptr { .. } => RecordType::Naptr,
            RecordData::Unsupported { rtype, .. } => RecordType::Unsupported(*rtype),
        }
    }

    /// The domain name this data points at, when it points at one.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            RecordData::Cname(name)
            | RecordData::Ns(name)
            | RecordData::Ptr(name) => Some(name),
            RecordData::Mx { exchange, .. } => Some(exchange),
            RecordData::Srv { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Load record data from the packet. `start` is the absolute rdata
    /// offset, `size` the rdlength.
    pub fn load(
        rtype: RecordType,
        packet: &[u8],
        start: usize,
        size: usize,
    ) -> Result<Self, DnsError> {
        let end = start + size;
        if end > packet.len() {
            return Err(DnsError::Malformed("rdata exceeds packet".to_string()));
        }

        match rtype {
            RecordType::A => {
                if size != 4 {
                    return Err(DnsError::Malformed("bad A rdata length".to_string()));
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&packet[start..end]);
                Ok(RecordData::A(Ipv4Addr::from(octets)))
            }

            RecordType::Aaaa => {
                if size != 16 {
                    return Err(DnsError::Malformed("bad AAAA rdata length".to_string()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&packet[start..end]);
                Ok(RecordData::Aaaa(Ipv6Addr::from(octets)))
            }

            RecordType::Cname => {
                let (_, name) = load_domain_name(packet, start)?;
                Ok(RecordData::Cname(name))
            }

            RecordType::Ns => {
                let (_, name) = load_domain_name(packet, start)?;
                Ok(RecordData::Ns(name))
            }

            RecordType::Ptr => {
                let (_, name) = load_domain_name(packet, start)?;
                Ok(RecordData::Ptr(name))
            }

            RecordType::Txt => {
                let mut text = String::new();
                let mut cursor = start;
                while cursor < end {
                    let len = packet[cursor] as usize;
                    cursor += 1;
                    if cursor + len > end {
                        return Err(DnsError::Malformed("bad TXT rdata".to_string()));
                    }
                    text.push_str(&String::from_utf8_lossy(&packet[cursor..cursor + len]));
                    cursor += len;
                }
                Ok(RecordData::Txt(text))
            }

            RecordType::Mx => {
                if size < 3 {
                    return Err(DnsError::Malformed("bad MX rdata".to_string()));
                }
                let preference = u16::from_be_bytes([packet[start], packet[start + 1]]);
                let (_, exchange) = load_domain_name(packet, start + 2)?;
                Ok(RecordData::Mx {
                    preference,
                    exchange,
                })
            }

            RecordType::Srv => {
                if size < 7 {
                    return Err(DnsError::Malformed("bad SRV rdata".to_string()));
                }
                let priority = u16::from_be_bytes([packet[start], packet[start + 1]]);
                let weight = u16::from_be_bytes([packet[start + 2], packet[start + 3]]);
                let port = u16::from_be_bytes([packet[start + 4], packet[start + 5]]);
                let (_, target) = load_domain_name(packet, start + 6)?;
                Ok(RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                })
            }

            RecordType::Soa => {
                let (cursor, mname) = load_domain_name(packet, start)?;
                let (cursor, rname) = load_domain_name(packet, cursor)?;
                if cursor + 20 > packet.len() {
                    return Err(DnsError::Malformed("bad SOA rdata".to_string()));
                }
                let read_u32 = |at: usize| {
                    u32::from_be_bytes([
                        packet[at],
                        packet[at + 1],
                        packet[at + 2],
                        packet[at + 3],
                    ])
                };
                Ok(RecordData::Soa {
                    mname,
                    rname,
                    serial: read_u32(cursor),
                    refresh: read_u32(cursor + 4),
                    retry: read_u32(cursor + 8),
                    expire: read_u32(cursor + 12),
                    minimum: read_u32(cursor + 16),
                })
            }

            RecordType::Naptr => {
                if size < 4 {
                    return Err(DnsError::Malformed("bad NAPTR rdata".to_string()));
                }
                let order = u16::from_be_bytes([packet[start], packet[start + 1]]);
                let preference = u16::from_be_bytes([packet[start + 2], packet[start + 3]]);

                let mut cursor = start + 4;
                let mut read_char_string = || -> Result<String, DnsError> {
                    if cursor >= end {
                        return Err(DnsError::Malformed("bad NAPTR rdata".to_string()));
                    }
                    let len = packet[cursor] as usize;
                    cursor += 1;
                    if cursor + len > end {
                        return Err(DnsError::Malformed("bad NAPTR rdata".to_string()));
                    }
                    let text = String::from_utf8_lossy(&packet[cursor..cursor + len]).into_owned();
                    cursor += len;
                    Ok(text)
                };

                let flags = read_char_string()?;
                let service = read_char_string()?;
                let regexp = read_char_string()?;
                let (_, replacement) = load_domain_name(packet, cursor)?;

                Ok(RecordData::Naptr {
                    order,
                    preference,
                    flags,
                    service,
                    regexp,
                    replacement,
                })
            }

            RecordType::Any => Err(DnsError::Malformed(
                "ANY is a question type, not record data".to_string(),
            )),

            RecordType::Unsupported(code) => Ok(RecordData::Unsupported {
                rtype: code,
                raw: packet[start..end].to_vec(),
            }),
        }
    }

    /// Dump record data. `offset` is the absolute position the rdata
    /// will land at, so embedded names can register for compression.
    pub fn dump(
        &self,
        names: &mut HashMap<String, usize>,
        offset: usize,
    ) -> Result<Vec<u8>, DnsError> {
        match self {
            RecordData::A(addr) => Ok(addr.octets().to_vec()),
            RecordData::Aaaa(addr) => Ok(addr.octets().to_vec()),

            RecordData::Cname(name) | RecordData::Ns(name) | RecordData::Ptr(name) => {
                pack_domain_name(name, names, offset)
            }

            RecordData::Txt(text) => {
                let mut out = Vec::new();
                let bytes = text.as_bytes();
                if bytes.is_empty() {
                    out.push(0);
                }
                for chunk in bytes.chunks(255) {
                    out.push(chunk.len() as u8);
                    out.extend_from_slice(chunk);
                }
                Ok(out)
            }

            RecordData::Mx {
                preference,
                exchange,
            } => {
                let mut out = preference.to_be_bytes().to_vec();
                out.extend(pack_domain_name(exchange, names, offset + 2)?);
                Ok(out)
            }

            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                let mut out = Vec::new();
                out.extend(priority.to_be_bytes());
                out.extend(weight.to_be_bytes());
                out.extend(port.to_be_bytes());
                out.extend(pack_domain_name(target, names, offset + 6)?);
                Ok(out)
            }

            RecordData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                let mut out = pack_domain_name(mname, names, offset)?;
                let rname_offset = offset + out.len();
                out.extend(pack_domain_name(rname, names, rname_offset)?);
                out.extend(serial.to_be_bytes());
                out.extend(refresh.to_be_bytes());
                out.extend(retry.to_be_bytes());
                out.extend(expire.to_be_bytes());
                out.extend(minimum.to_be_bytes());
                Ok(out)
            }

            RecordData::Naptr {
                order,
                preference,
                flags,
                service,
                regexp,
                replacement,
            } => {
                let mut out = Vec::new();
                out.extend(order.to_be_bytes());
                out.extend(preference.to_be_bytes());
                for text in [flags, service, regexp] {
                    let bytes = text.as_bytes();
                    out.push(bytes.len().min(255) as u8);
                    out.extend_from_slice(&bytes[..bytes.len().min(255)]);
                }
                // NAPTR replacement is never compressed (RFC 3403).
                let mut plain = HashMap::new();
                out.extend(pack_domain_name(replacement, &mut plain, 0)?);
                Ok(out)
            }

            RecordData::Unsupported { raw, .. } => Ok(raw.clone()),
        }
    }
}

/// One question-section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        Self {
            name: name.trim_end_matches('.').to_string(),
            qtype,
            qclass: 1,
        }
    }

    pub fn parse(packet: &[u8], cursor: usize) -> Result<(usize, Self), DnsError> {
        let (cursor, name) = load_domain_name(packet, cursor)?;
        if cursor + 4 > packet.len() {
            return Err(DnsError::Malformed("truncated question".to_string()));
        }

        let qtype = u16::from_be_bytes([packet[cursor], packet[cursor + 1]]);
        let qclass = u16::from_be_bytes([packet[cursor + 2], packet[cursor + 3]]);

        Ok((
            cursor + 4,
            Self {
                name,
                qtype: RecordType::from_code(qtype),
                qclass,
            },
        ))
    }

    pub fn pack(
        &self,
        names: &mut HashMap<String, usize>,
        offset: usize,
    ) -> Result<Vec<u8>, DnsError> {
        let mut out = pack_domain_name(&self.name, names, offset)?;
        out.extend(self.qtype.code().to_be_bytes());
        out.extend(self.qclass.to_be_bytes());
        Ok(out)
    }
}

/// One resource record with its cache bookkeeping.
///
/// A record is live iff `ttl < 0` (pinned) or `now ≤ timestamp + ttl`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: i64,
    pub timestamp: u64,
    pub data: RecordData,
}

impl Record {
    pub fn new(name: &str, data: RecordData, ttl: i64) -> Self {
        Self {
            name: name.trim_end_matches('.').to_string(),
            rtype: data.rtype(),
            class: 1,
            ttl,
            timestamp: unix_now(),
            data,
        }
    }

    pub fn with_name(&self, name: &str) -> Self {
        let mut copy = self.clone();
        copy.name = name.trim_end_matches('.').to_string();
        copy
    }

    pub fn is_live(&self, now: u64) -> bool {
        self.ttl < 0 || now <= self.timestamp.saturating_add(self.ttl as u64)
    }

    pub fn parse(packet: &[u8], cursor: usize) -> Result<(usize, Self), DnsError> {
        let (cursor, name) = load_domain_name(packet, cursor)?;
        if cursor + 10 > packet.len() {
            return Err(DnsError::Malformed("truncated record header".to_string()));
        }

        let rtype = RecordType::from_code(u16::from_be_bytes([packet[cursor], packet[cursor + 1]]));
        let class = u16::from_be_bytes([packet[cursor + 2], packet[cursor + 3]]);
        let ttl = u32::from_be_bytes([
            packet[cursor + 4],
            packet[cursor + 5],
            packet[cursor + 6],
            packet[cursor + 7],
        ]);
        let rdlength = u16::from_be_bytes([packet[cursor + 8], packet[cursor + 9]]) as usize;

        let rdata_start = cursor + 10;
        let data = RecordData::load(rtype, packet, rdata_start, rdlength)?;

        Ok((
            rdata_start + rdlength,
            Self {
                name,
                rtype,
                class,
                ttl: i64::from(ttl),
                timestamp: unix_now(),
                data,
            },
        ))
    }

    pub fn pack(
        &self,
        names: &mut HashMap<String, usize>,
        offset: usize,
    ) -> Result<Vec<u8>, DnsError> {
        let mut out = pack_domain_name(&self.name, names, offset)?;
        out.extend(self.rtype.code().to_be_bytes());
        out.extend(self.class.to_be_bytes());

        let effective_ttl = if self.ttl < 0 {
            PINNED_TTL
        } else {
            let age = unix_now().saturating_sub(self.timestamp);
            (self.ttl as u64).saturating_sub(age).min(u64::from(u32::MAX)) as u32
        };
        out.extend(effective_ttl.to_be_bytes());

        // The rdata lands after the 2-byte length field.
        let rdata_offset = offset + out.len() + 2;
        let rdata = self.data.dump(names, rdata_offset)?;
        out.extend((rdata.len() as u16).to_be_bytes());
        out.extend(rdata);

        Ok(out)
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Pack a domain name with compression against `names`, which maps
/// already-written suffixes to their absolute offsets.
pub fn pack_domain_name(
    name: &str,
    names: &mut HashMap<String, usize>,
    offset: usize,
) -> Result<Vec<u8>, DnsError> {
    let mut out = Vec::new();
    let mut remaining = name.trim_end_matches('.');

    loop {
        if remaining.is_empty() {
            out.push(0);
            break;
        }

        if let Some(&pointer) = names.get(remaining) {
            if pointer <= 0x3fff {
                out.extend((0xc000u16 | pointer as u16).to_be_bytes());
                break;
            }
        }

        let (label, rest) = match remaining.split_once('.') {
            Some((label, rest)) => (label, rest),
            None => (remaining, ""),
        };

        if label.is_empty() || label.len() > 63 {
            return Err(DnsError::Malformed(format!("bad label in {name}")));
        }

        if offset + out.len() <= 0x3fff {
            names.insert(remaining.to_string(), offset + out.len());
        }

        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
        remaining = rest;
    }

    Ok(out)
}

/// Load a domain name, following compression pointers. Returns the
/// cursor just past the name as it appears at `start`.
pub fn load_domain_name(packet: &[u8], start: usize) -> Result<(usize, String), DnsError> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = start;
    let mut end = start;
    let mut jumped = false;
    let mut jumps = 0;

    loop {
        let byte = *packet
            .get(cursor)
            .ok_or_else(|| DnsError::Malformed("name runs past packet".to_string()))?;

        if byte & 0xc0 == 0xc0 {
            let low = *packet
                .get(cursor + 1)
                .ok_or_else(|| DnsError::Malformed("truncated pointer".to_string()))?;

            if !jumped {
                end = cursor + 2;
                jumped = true;
            }

            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(DnsError::Malformed("pointer loop".to_string()));
            }

            cursor = (usize::from(byte & 0x3f) << 8) | usize::from(low);
        } else if byte == 0 {
            if !jumped {
                end = cursor + 1;
            }
            break;
        } else {
            let len = byte as usize;
            cursor += 1;
            let label = packet
                .get(cursor..cursor + len)
                .ok_or_else(|| DnsError::Malformed("label runs past packet".to_string()))?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            cursor += len;
        }
    }

    Ok((end, labels.join(".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_name_round_trip() {
        let mut names = HashMap::new();
        let packed = pack_domain_name("node-1.cluster.local", &mut names, 0).unwrap();

        let (end, name) = load_domain_name(&packed, 0).unwrap();
        assert_eq!(name, "node-1.cluster.local");
        assert_eq!(end, packed.len());
    }

    #[test]
    fn test_name_compression_emits_pointer() {
        let mut names = HashMap::new();
        let first = pack_domain_name("a.cluster.local", &mut names, 0).unwrap();
        let second = pack_domain_name("b.cluster.local", &mut names, first.len()).unwrap();

        // "cluster.local" is shared, so the second name ends with a
        // two-byte pointer instead of repeating the labels.
        assert!(second.len() < first.len());
        assert_eq!(second[second.len() - 2] & 0xc0, 0xc0);

        let mut packet = first.clone();
        packet.extend(&second);
        let (_, name) = load_domain_name(&packet, first.len()).unwrap();
        assert_eq!(name, "b.cluster.local");
    }

    #[test]
    fn test_pointer_loop_is_rejected() {
        // A pointer that points at itself.
        let packet = vec![0xc0, 0x00];
        assert!(load_domain_name(&packet, 0).is_err());
    }

    #[test]
    fn test_record_pack_parse_round_trip() {
        let record = Record::new(
            "svc.cluster.local",
            RecordData::Srv {
                priority: 10,
                weight: 5,
                port: 7000,
                target: "node-1.cluster.local".to_string(),
            },
            300,
        );

        let mut names = HashMap::new();
        let packed = record.pack(&mut names, 0).unwrap();

        let (_, parsed) = Record::parse(&packed, 0).unwrap();
        assert_eq!(parsed.name, record.name);
        assert_eq!(parsed.rtype, RecordType::Srv);
        assert_eq!(parsed.data, record.data);
    }

    #[test]
    fn test_ttl_liveness() {
        let mut record = Record::new("a.local", RecordData::A(Ipv4Addr::new(10, 0, 0, 1)), 10);

        let now = unix_now();
        assert!(record.is_live(now));
        assert!(!record.is_live(now + 11));

        record.ttl = -1;
        assert!(record.is_live(now + 1_000_000));
    }

    #[test]
    fn test_txt_round_trip() {
        let text = "service=gateway weight=10";
        let record = Record::new("svc.local", RecordData::Txt(text.to_string()), 60);

        let mut names = HashMap::new();
        let packed = record.pack(&mut names, 0).unwrap();

        let (_, parsed) = Record::parse(&packed, 0).unwrap();
        assert_eq!(parsed.data, RecordData::Txt(text.to_string()));
    }

    #[test]
    fn test_unsupported_type_round_trips_raw() {
        let data = RecordData::load(RecordType::from_code(99), &[1, 2, 3, 4], 0, 4).unwrap();
        assert_eq!(
            data,
            RecordData::Unsupported {
                rtype: 99,
                raw: vec![1, 2, 3, 4]
            }
        );

        let mut names = HashMap::new();
        assert_eq!(data.dump(&mut names, 0).unwrap(), vec![1, 2, 3, 4]);
    }
}
