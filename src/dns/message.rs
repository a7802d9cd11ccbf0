//! DNS messages (RFC 1035 §4)
//!
//! Header bit packing, the four sections, and size-limited packing
//! with the truncation flag for 512-byte UDP answers.

use crate::dns::record::{Question, Record};
use crate::dns::DnsError;
use std::collections::HashMap;

pub const QR_REQUEST: u8 = 0;
pub const QR_RESPONSE: u8 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

/// UDP payload ceiling before truncation applies.
pub const UDP_SIZE_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct DnsMessage {
    /// 0 request, 1 response.
    pub qr: u8,
    /// Transaction id.
    pub qid: u16,
    /// Opcode, 0 for a standard query.
    pub opcode: u8,
    /// Authoritative answer.
    pub aa: u8,
    /// Truncation, updated by `pack`.
    pub tc: u8,
    /// Recursion desired.
    pub rd: u8,
    /// Recursion available.
    pub ra: u8,
    /// Response code.
    pub rcode: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Default for DnsMessage {
    fn default() -> Self {
        Self::response()
    }
}

impl DnsMessage {
    pub fn response() -> Self {
        Self {
            qr: QR_RESPONSE,
            qid: 0,
            opcode: 0,
            aa: 0,
            tc: 0,
            rd: 1,
            ra: 1,
            rcode: RCODE_NOERROR,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn request(qid: u16, question: Question) -> Self {
        Self {
            qr: QR_REQUEST,
            qid,
            opcode: 0,
            aa: 0,
            tc: 0,
            rd: 1,
            ra: 0,
            rcode: RCODE_NOERROR,
            questions: vec![question],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn has_result(&self) -> bool {
        !self.answers.is_empty() || !self.authorities.is_empty()
    }

    /// Pack to wire format. With a size limit, sections are cut at the
    /// first record that does not fit and the TC bit is set.
    pub fn pack(&mut self, size_limit: Option<usize>) -> Result<Vec<u8>, DnsError> {
        let mut names: HashMap<String, usize> = HashMap::new();
        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;

        let mut counts = [0u16; 4];

        'sections: for (section_idx, section) in [
            SectionRef::Questions(&self.questions),
            SectionRef::Records(&self.answers),
            SectionRef::Records(&self.authorities),
            SectionRef::Records(&self.additionals),
        ]
        .into_iter()
        .enumerate()
        {
            match section {
                SectionRef::Questions(questions) => {
                    for question in questions {
                        let offset = 12 + body.len();
                        let packed = question.pack(&mut names, offset)?;
                        if let Some(limit) = size_limit {
                            if 12 + body.len() + packed.len() > limit {
                                truncated = true;
                                break 'sections;
                            }
                        }
                        body.extend(packed);
                        counts[section_idx] += 1;
                    }
                }
                SectionRef::Records(records) => {
                    for record in records {
                        let offset = 12 + body.len();
                        let packed = record.pack(&mut names, offset)?;
                        if let Some(limit) = size_limit {
                            if 12 + body.len() + packed.len() > limit {
                                truncated = true;
                                break 'sections;
                            }
                        }
                        body.extend(packed);
                        counts[section_idx] += 1;
                    }
                }
            }
        }

        self.tc = u8::from(truncated);

        let flags: u16 = (u16::from(self.qr) << 15)
            | (u16::from(self.opcode & 0x0f) << 11)
            | (u16::from(self.aa & 1) << 10)
            | (u16::from(self.tc & 1) << 9)
            | (u16::from(self.rd & 1) << 8)
            | (u16::from(self.ra & 1) << 7)
            | u16::from(self.rcode & 0x0f);

        let mut packet = Vec::with_capacity(12 + body.len());
        packet.extend(self.qid.to_be_bytes());
        packet.extend(flags.to_be_bytes());
        for count in counts {
            packet.extend(count.to_be_bytes());
        }
        packet.extend(body);

        Ok(packet)
    }

    pub fn parse(packet: &[u8]) -> Result<Self, DnsError> {
        if packet.len() < 12 {
            return Err(DnsError::Malformed("packet shorter than header".to_string()));
        }

        let qid = u16::from_be_bytes([packet[0], packet[1]]);
        let flags = u16::from_be_bytes([packet[2], packet[3]]);

        let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
        let an_count = u16::from_be_bytes([packet[6], packet[7]]);
        let ns_count = u16::from_be_bytes([packet[8], packet[9]]);
        let ar_count = u16::from_be_bytes([packet[10], packet[11]]);

        let mut message = Self {
            qr: ((flags >> 15) & 1) as u8,
            qid,
            opcode: ((flags >> 11) & 0x0f) as u8,
            aa: ((flags >> 10) & 1) as u8,
            tc: ((flags >> 9) & 1) as u8,
            rd: ((flags >> 8) & 1) as u8,
            ra: ((flags >> 7) & 1) as u8,
            rcode: (flags & 0x0f) as u8,
            questions: Vec::with_capacity(qd_count as usize),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        };

        let mut cursor = 12;

        for _ in 0..qd_count {
            let (next, question) = Question::parse(packet, cursor)?;
            message.questions.push(question);
            cursor = next;
        }

        for _ in 0..an_count {
            let (next, record) = Record::parse(packet, cursor)?;
            message.answers.push(record);
            cursor = next;
        }

        for _ in 0..ns_count {
            let (next, record) = Record::parse(packet, cursor)?;
            message.authorities.push(record);
            cursor = next;
        }

        for _ in 0..ar_count {
            let (next, record) = Record::parse(packet, cursor)?;
            message.additionals.push(record);
            cursor = next;
        }

        Ok(message)
    }
}

enum SectionRef<'a> {
    Questions(&'a [Question]),
    Records(&'a [Record]),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::record::{RecordData, RecordType};
    use std::net::Ipv4Addr;

    #[test]
    fn test_request_round_trip() {
        let mut request = DnsMessage::request(0x1234, Question::new("svc.cluster.local", RecordType::Srv));

        let packed = request.pack(None).unwrap();
        let parsed = DnsMessage::parse(&packed).unwrap();

        assert_eq!(parsed.qid, 0x1234);
        assert_eq!(parsed.qr, QR_REQUEST);
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.questions[0].name, "svc.cluster.local");
        assert_eq!(parsed.questions[0].qtype, RecordType::Srv);
    }

    #[test]
    fn test_response_round_trip() {
        let mut response = DnsMessage::response();
        response.qid = 7;
        response
            .questions
            .push(Question::new("node.cluster.local", RecordType::A));
        response.answers.push(Record::new(
            "node.cluster.local",
            RecordData::A(Ipv4Addr::new(10, 0, 0, 7)),
            120,
        ));

        let packed = response.pack(None).unwrap();
        let parsed = DnsMessage::parse(&packed).unwrap();

        assert_eq!(parsed.qr, QR_RESPONSE);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(
            parsed.answers[0].data,
            RecordData::A(Ipv4Addr::new(10, 0, 0, 7))
        );
    }

    #[test]
    fn test_udp_truncation_sets_tc() {
        let mut response = DnsMessage::response();
        response
            .questions
            .push(Question::new("big.cluster.local", RecordType::Txt));

        for idx in 0..32 {
            response.answers.push(Record::new(
                "big.cluster.local",
                RecordData::Txt(format!("entry-{idx}-{}", "x".repeat(40))),
                60,
            ));
        }

        let packed = response.pack(Some(UDP_SIZE_LIMIT)).unwrap();
        assert!(packed.len() <= UDP_SIZE_LIMIT);
        assert_eq!(response.tc, 1);

        let parsed = DnsMessage::parse(&packed).unwrap();
        assert_eq!(parsed.tc, 1);
        assert!(parsed.answers.len() < 32);
    }

    #[test]
    fn test_nxdomain_rcode_round_trips() {
        let mut response = DnsMessage::response();
        response.rcode = RCODE_NXDOMAIN;
        response.aa = 1;

        let packed = response.pack(None).unwrap();
        let parsed = DnsMessage::parse(&packed).unwrap();
        assert_eq!(parsed.rcode, RCODE_NXDOMAIN);
        assert_eq!(parsed.aa, 1);
    }
}
