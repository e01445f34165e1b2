//! Protocol independent representation of membership queries and reports. IPv4 groups use
//!  IGMPv3 on the wire, IPv6 groups use MLDv2.

use crate::error::MalformedPacketError;
use crate::packet::ip::{parse_ip_packet, PROTOCOL_ICMPV6, PROTOCOL_IGMP};
use crate::packet::{igmp, mld};
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum GroupRecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToIncludeMode = 3,
    ChangeToExcludeMode = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}

impl GroupRecordType {
    /// current state records answer queries, the others announce state changes
    pub fn is_current_state(&self) -> bool {
        matches!(self, GroupRecordType::ModeIsInclude | GroupRecordType::ModeIsExclude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub record_type: GroupRecordType,
    pub group: IpAddr,
    pub sources: Vec<IpAddr>,
}

impl GroupRecord {
    pub fn new(record_type: GroupRecordType, group: IpAddr, sources: impl IntoIterator<Item = IpAddr>) -> GroupRecord {
        GroupRecord {
            record_type,
            group,
            sources: sources.into_iter().collect(),
        }
    }

    fn addr_len(&self) -> usize {
        if self.group.is_ipv4() { 4 } else { 16 }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.addr_len() * (1 + self.sources.len())
    }

    /// Splits the record into records of at most `max_len` encoded bytes, see
    ///  [MembershipReport::split_to_fit]
    fn split_to_fit(self, max_len: usize) -> Vec<GroupRecord> {
        if self.encoded_len() <= max_len {
            return vec![self];
        }

        let addr_len = self.addr_len();
        let max_sources = (max_len.saturating_sub(4 + addr_len) / addr_len).max(1);
        let record_type = self.record_type;
        match record_type {
            GroupRecordType::ModeIsExclude | GroupRecordType::ChangeToExcludeMode => {
                let mut record = self;
                record.sources.truncate(max_sources);
                vec![record]
            }
            _ => self.sources
                .chunks(max_sources)
                .map(|sources| GroupRecord::new(record_type, self.group, sources.iter().cloned()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipReport {
    pub records: Vec<GroupRecord>,
}

/// IGMPv3 and MLDv2 reports share the length of their fixed header
pub const REPORT_HEADER_LEN: usize = 8;

/// The largest IGMP / MLD part of a report that still fits into an IP packet together with the
///  IP header and router alert option
pub const MAX_REPORT_PAYLOAD: usize = u16::MAX as usize - 64;

impl MembershipReport {
    pub fn new(records: Vec<GroupRecord>) -> MembershipReport {
        MembershipReport { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Splits a report so that each part's encoded IGMP / MLD message fits into `max_payload`
    ///  bytes, but never more than [MAX_REPORT_PAYLOAD].
    ///
    /// A record with more sources than fit into a report on its own is split into records of the
    ///  same type with disjoint subsets of the sources. MODE_IS_EXCLUDE and CHANGE_TO_EXCLUDE_MODE
    ///  records can not be split like that: they keep as many sources as fit, and the remaining
    ///  sources are not reported (RFC 3376 4.2.16, RFC 3810 5.2.15).
    pub fn split_to_fit(self, max_payload: usize) -> Vec<MembershipReport> {
        let max_payload = max_payload.min(MAX_REPORT_PAYLOAD);
        let max_record_len = max_payload.saturating_sub(REPORT_HEADER_LEN);

        let mut result = Vec::new();
        let mut current = MembershipReport::default();
        let mut current_len = REPORT_HEADER_LEN;

        for record in self.records.into_iter().flat_map(|r| r.split_to_fit(max_record_len)) {
            let len = record.encoded_len();
            if !current.is_empty() && current_len + len > max_payload {
                result.push(std::mem::take(&mut current));
                current_len = REPORT_HEADER_LEN;
            }
            current_len += len;
            current.records.push(record);
        }
        if !current.is_empty() {
            result.push(current);
        }
        result
    }

    /// Encodes the report as an IP packet (IGMPv3 for an IPv4 source address, MLDv2 for IPv6).
    ///  All groups and sources must be of the source address' family.
    pub fn encode(&self, source: IpAddr) -> Result<BytesMut, MalformedPacketError> {
        for record in &self.records {
            if record.group.is_ipv4() != source.is_ipv4() {
                return Err(MalformedPacketError::AddressFamilyMismatch(source, record.group));
            }
            if let Some(s) = record.sources.iter().find(|s| s.is_ipv4() != source.is_ipv4()) {
                return Err(MalformedPacketError::AddressFamilyMismatch(record.group, *s));
            }
        }
        let len = REPORT_HEADER_LEN + self.records.iter().map(GroupRecord::encoded_len).sum::<usize>();
        if len > MAX_REPORT_PAYLOAD {
            return Err(MalformedPacketError::LengthOutOfBounds { what: "membership report", declared: len, available: MAX_REPORT_PAYLOAD });
        }

        match source {
            IpAddr::V4(source) => Ok(igmp::encode_report(&self.records, source)),
            IpAddr::V6(source) => Ok(mld::encode_report(&self.records, source)),
        }
    }

    pub fn decode(packet: &[u8]) -> Result<MembershipReport, MalformedPacketError> {
        let ip = parse_ip_packet(packet)?;
        match (ip.protocol, ip.source, ip.destination) {
            (PROTOCOL_IGMP, IpAddr::V4(_), _) => igmp::decode_report(ip.payload),
            (PROTOCOL_ICMPV6, IpAddr::V6(s), IpAddr::V6(d)) => mld::decode_report(ip.payload, &s, &d),
            (p, _, _) => Err(MalformedPacketError::UnsupportedProtocol(p, "IGMP / ICMPv6")),
        }
    }
}

/// A general, group specific or group-and-source specific query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipQuery {
    /// `None` for a general query
    pub group: Option<IpAddr>,
    /// non-empty for group-and-source specific queries
    pub sources: Vec<IpAddr>,
    /// zero if the query does not specify a maximum response delay
    pub max_response_delay: Duration,
    pub suppress_router_processing: bool,
    /// querier's robustness variable, `None` for old protocol versions or if not specified
    pub robustness: Option<u8>,
    /// querier's query interval, `None` for old protocol versions or if not specified
    pub query_interval: Option<Duration>,
}

impl MembershipQuery {
    pub fn general(max_response_delay: Duration) -> MembershipQuery {
        MembershipQuery {
            group: None,
            sources: vec![],
            max_response_delay,
            suppress_router_processing: false,
            robustness: None,
            query_interval: None,
        }
    }

    pub fn group_specific(group: IpAddr, sources: Vec<IpAddr>, max_response_delay: Duration) -> MembershipQuery {
        MembershipQuery {
            group: Some(group),
            sources,
            ..Self::general(max_response_delay)
        }
    }

    pub fn is_general(&self) -> bool {
        self.group.is_none()
    }

    pub fn decode(packet: &[u8]) -> Result<MembershipQuery, MalformedPacketError> {
        let ip = parse_ip_packet(packet)?;
        match (ip.protocol, ip.source, ip.destination) {
            (PROTOCOL_IGMP, IpAddr::V4(_), _) => igmp::decode_query(ip.payload),
            (PROTOCOL_ICMPV6, IpAddr::V6(s), IpAddr::V6(d)) => mld::decode_query(ip.payload, &s, &d),
            (p, _, _) => Err(MalformedPacketError::UnsupportedProtocol(p, "IGMP / ICMPv6")),
        }
    }

    /// Encodes the query as an IGMPv3 or MLDv2 query packet from `source`
    pub fn encode(&self, source: IpAddr) -> Result<BytesMut, MalformedPacketError> {
        match source {
            IpAddr::V4(source) => igmp::encode_query(self, source),
            IpAddr::V6(source) => mld::encode_query(self, source),
        }
    }
}

/// Decodes the 8 bit floating point format used for IGMPv3 max response codes and for QQIC
pub fn decode_code_u8(code: u8) -> u32 {
    if code < 0x80 {
        return code as u32;
    }
    let exp = (code >> 4) & 0x07;
    let mant = (code & 0x0f) as u32;
    (mant | 0x10) << (exp + 3)
}

/// Inverse of [decode_code_u8], rounding down to the nearest representable value
pub fn encode_code_u8(value: u32) -> u8 {
    if value < 0x80 {
        return value as u8;
    }
    for exp in 0..8u8 {
        let mant = value >> (exp + 3);
        if mant < 0x20 {
            return 0x80 | (exp << 4) | (mant as u8 & 0x0f);
        }
    }
    0xff
}

/// Decodes the 16 bit floating point format of MLDv2 maximum response codes
pub fn decode_code_u16(code: u16) -> u32 {
    if code < 0x8000 {
        return code as u32;
    }
    let exp = (code >> 12) & 0x07;
    let mant = (code & 0x0fff) as u32;
    (mant | 0x1000) << (exp + 3)
}

pub fn encode_code_u16(value: u32) -> u16 {
    if value < 0x8000 {
        return value as u16;
    }
    for exp in 0..8u16 {
        let mant = value >> (exp + 3);
        if mant < 0x2000 {
            return 0x8000 | (exp << 12) | (mant as u16 & 0x0fff);
        }
    }
    0xffff
}

/// whether the group is in the source specific multicast range (232/8 or ff3x::/32)
pub fn is_ssm_group(group: &IpAddr) -> bool {
    match group {
        IpAddr::V4(g) => g.octets()[0] == 232,
        IpAddr::V6(g) => {
            let segments = g.segments();
            (segments[0] & 0xfff0) == 0xff30 && segments[1] == 0
        }
    }
}
