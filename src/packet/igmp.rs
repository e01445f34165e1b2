use crate::error::MalformedPacketError;
use crate::packet::checksum::internet_checksum;
use crate::packet::ip::{put_ipv4_header, IPV4_ROUTER_ALERT, PROTOCOL_IGMP};
use crate::packet::membership::{decode_code_u8, encode_code_u8, GroupRecord, GroupRecordType, MembershipQuery, MembershipReport, REPORT_HEADER_LEN};
use crate::util::buf::{put_ip, BufExt};
use crate::util::safe_converter::PrecheckedCast;
use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMPV3_MEMBERSHIP_REPORT: u8 = 0x22;

pub const ALL_SYSTEMS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const IGMPV3_REPORT_DESTINATION: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

const IGMPV2_QUERY_LEN: usize = 8;
const IGMPV3_QUERY_MIN_LEN: usize = 12;
const TOS_INTERNETWORK_CONTROL: u8 = 0xc0;

/// Decodes an IGMPv2 or IGMPv3 membership query from an IGMP message
pub fn decode_query(igmp: &[u8]) -> Result<MembershipQuery, MalformedPacketError> {
    let mut buf = igmp;
    buf.ensure_remaining("IGMP query", IGMPV2_QUERY_LEN)?;
    if internet_checksum(&[igmp]) != 0 {
        return Err(MalformedPacketError::ChecksumMismatch("IGMP"));
    }

    let message_type = buf.get_u8();
    if message_type != IGMP_MEMBERSHIP_QUERY {
        return Err(MalformedPacketError::UnexpectedType { what: "IGMP query", value: message_type });
    }
    let max_resp_code = buf.get_u8();
    buf.advance(2); // checksum
    let group = buf.checked_get_ipv4("IGMP query")?;
    let group = if group.is_unspecified() { None } else { Some(IpAddr::V4(group)) };

    if igmp.len() == IGMPV2_QUERY_LEN {
        return Ok(MembershipQuery {
            group,
            sources: vec![],
            max_response_delay: Duration::from_millis(100 * max_resp_code as u64),
            suppress_router_processing: false,
            robustness: None,
            query_interval: None,
        });
    }

    buf.ensure_remaining("IGMPv3 query", IGMPV3_QUERY_MIN_LEN - IGMPV2_QUERY_LEN)?;
    let flags = buf.get_u8();
    let qqic = buf.get_u8();
    let num_sources = buf.get_u16() as usize;
    buf.ensure_remaining("IGMPv3 query sources", 4 * num_sources)?;
    let sources = (0..num_sources)
        .map(|_| IpAddr::V4(Ipv4Addr::from(buf.get_u32())))
        .collect();

    let qrv = flags & 0x07;
    let query_interval = decode_code_u8(qqic);
    Ok(MembershipQuery {
        group,
        sources,
        max_response_delay: Duration::from_millis(100 * decode_code_u8(max_resp_code) as u64),
        suppress_router_processing: flags & 0x08 != 0,
        robustness: if qrv == 0 { None } else { Some(qrv) },
        query_interval: if query_interval == 0 { None } else { Some(Duration::from_secs(query_interval as u64)) },
    })
}

/// Builds the IPv4 packet of an IGMPv3 query
pub fn encode_query(query: &MembershipQuery, source: Ipv4Addr) -> Result<BytesMut, MalformedPacketError> {
    let group = match query.group {
        None => Ipv4Addr::UNSPECIFIED,
        Some(IpAddr::V4(g)) => g,
        Some(g) => return Err(MalformedPacketError::AddressFamilyMismatch(IpAddr::V4(source), g)),
    };
    let destination = if query.group.is_some() { group } else { ALL_SYSTEMS };

    let mut igmp = BytesMut::new();
    igmp.put_u8(IGMP_MEMBERSHIP_QUERY);
    igmp.put_u8(encode_code_u8((query.max_response_delay.as_millis() / 100) as u32));
    igmp.put_u16(0);
    igmp.put_slice(&group.octets());
    let s_flag = if query.suppress_router_processing { 0x08 } else { 0 };
    igmp.put_u8(s_flag | (query.robustness.unwrap_or(0) & 0x07));
    igmp.put_u8(encode_code_u8(query.query_interval.map(|d| d.as_secs() as u32).unwrap_or(0)));
    igmp.put_u16(query.sources.len().prechecked_cast());
    for s in &query.sources {
        match s {
            IpAddr::V4(s) => igmp.put_slice(&s.octets()),
            IpAddr::V6(_) => return Err(MalformedPacketError::AddressFamilyMismatch(IpAddr::V4(source), *s)),
        }
    }
    let checksum = internet_checksum(&[&igmp]);
    igmp[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut buf = BytesMut::with_capacity(24 + igmp.len());
    put_ipv4_header(&mut buf, source, destination, PROTOCOL_IGMP, 1, TOS_INTERNETWORK_CONTROL, &IPV4_ROUTER_ALERT, igmp.len());
    buf.put_slice(&igmp);
    Ok(buf)
}

/// Builds the IPv4 packet of an IGMPv3 report. Family consistency of the records is checked by
///  the caller.
pub fn encode_report(records: &[GroupRecord], source: Ipv4Addr) -> BytesMut {
    let mut igmp = BytesMut::with_capacity(REPORT_HEADER_LEN + records.iter().map(|r| r.encoded_len()).sum::<usize>());
    igmp.put_u8(IGMPV3_MEMBERSHIP_REPORT);
    igmp.put_u8(0);
    igmp.put_u16(0);
    igmp.put_u16(0);
    igmp.put_u16(records.len().prechecked_cast());
    for record in records {
        igmp.put_u8(record.record_type.into());
        igmp.put_u8(0);
        igmp.put_u16(record.sources.len().prechecked_cast());
        put_ip(&mut igmp, &record.group);
        for s in &record.sources {
            put_ip(&mut igmp, s);
        }
    }
    let checksum = internet_checksum(&[&igmp]);
    igmp[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut buf = BytesMut::with_capacity(24 + igmp.len());
    put_ipv4_header(&mut buf, source, IGMPV3_REPORT_DESTINATION, PROTOCOL_IGMP, 1, TOS_INTERNETWORK_CONTROL, &IPV4_ROUTER_ALERT, igmp.len());
    buf.put_slice(&igmp);
    buf
}

pub fn decode_report(igmp: &[u8]) -> Result<MembershipReport, MalformedPacketError> {
    let mut buf = igmp;
    buf.ensure_remaining("IGMPv3 report", REPORT_HEADER_LEN)?;
    if internet_checksum(&[igmp]) != 0 {
        return Err(MalformedPacketError::ChecksumMismatch("IGMP"));
    }

    let message_type = buf.get_u8();
    if message_type != IGMPV3_MEMBERSHIP_REPORT {
        return Err(MalformedPacketError::UnexpectedType { what: "IGMP report", value: message_type });
    }
    buf.advance(5);
    let num_records = buf.get_u16();

    let mut records = Vec::new();
    for _ in 0..num_records {
        let record_type = buf.checked_get_u8("IGMPv3 group record")?;
        let record_type = GroupRecordType::try_from(record_type)
            .map_err(|_| MalformedPacketError::UnexpectedType { what: "group record", value: record_type })?;
        let aux_len = buf.checked_get_u8("IGMPv3 group record")? as usize * 4;
        let num_sources = buf.checked_get_u16("IGMPv3 group record")? as usize;
        let group = IpAddr::V4(buf.checked_get_ipv4("IGMPv3 group record")?);
        let mut sources = Vec::with_capacity(num_sources);
        for _ in 0..num_sources {
            sources.push(IpAddr::V4(buf.checked_get_ipv4("IGMPv3 group record sources")?));
        }
        buf.checked_skip("IGMPv3 auxiliary data", aux_len)?;
        records.push(GroupRecord { record_type, group, sources });
    }
    Ok(MembershipReport { records })
}
