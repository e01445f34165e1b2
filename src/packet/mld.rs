use crate::error::MalformedPacketError;
use crate::packet::checksum::{internet_checksum, ipv6_pseudo_header};
use crate::packet::ip::{put_ipv6_header, IPV6_HOP_BY_HOP_ROUTER_ALERT, PROTOCOL_HOP_BY_HOP, PROTOCOL_ICMPV6};
use crate::packet::membership::{decode_code_u16, decode_code_u8, encode_code_u16, encode_code_u8, GroupRecord, GroupRecordType, MembershipQuery, MembershipReport, REPORT_HEADER_LEN};
use crate::util::buf::{put_ip, BufExt};
use crate::util::safe_converter::PrecheckedCast;
use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

pub const MLD_LISTENER_QUERY: u8 = 130;
pub const MLDV2_LISTENER_REPORT: u8 = 143;

pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
pub const MLDV2_REPORT_DESTINATION: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x16);

const MLDV1_QUERY_LEN: usize = 24;
const MLDV2_QUERY_MIN_LEN: usize = 28;

fn verify_checksum(icmp: &[u8], source: &Ipv6Addr, destination: &Ipv6Addr) -> Result<(), MalformedPacketError> {
    let pseudo_header = ipv6_pseudo_header(source, destination, icmp.len() as u32, PROTOCOL_ICMPV6);
    if internet_checksum(&[&pseudo_header, icmp]) != 0 {
        return Err(MalformedPacketError::ChecksumMismatch("ICMPv6"));
    }
    Ok(())
}

/// Decodes an MLDv1 or MLDv2 listener query from an ICMPv6 message
pub fn decode_query(icmp: &[u8], source: &Ipv6Addr, destination: &Ipv6Addr) -> Result<MembershipQuery, MalformedPacketError> {
    let mut buf = icmp;
    buf.ensure_remaining("MLD query", MLDV1_QUERY_LEN)?;
    verify_checksum(icmp, source, destination)?;

    let message_type = buf.get_u8();
    if message_type != MLD_LISTENER_QUERY {
        return Err(MalformedPacketError::UnexpectedType { what: "MLD query", value: message_type });
    }
    buf.advance(3); // code, checksum
    let max_resp_code = buf.get_u16();
    buf.advance(2);
    let group = buf.checked_get_ipv6("MLD query")?;
    let group = if group.is_unspecified() { None } else { Some(IpAddr::V6(group)) };

    if icmp.len() == MLDV1_QUERY_LEN {
        return Ok(MembershipQuery {
            group,
            sources: vec![],
            max_response_delay: Duration::from_millis(max_resp_code as u64),
            suppress_router_processing: false,
            robustness: None,
            query_interval: None,
        });
    }

    buf.ensure_remaining("MLDv2 query", MLDV2_QUERY_MIN_LEN - MLDV1_QUERY_LEN)?;
    let flags = buf.get_u8();
    let qqic = buf.get_u8();
    let num_sources = buf.get_u16() as usize;
    buf.ensure_remaining("MLDv2 query sources", 16 * num_sources)?;
    let sources = (0..num_sources)
        .map(|_| IpAddr::V6(Ipv6Addr::from(buf.get_u128())))
        .collect();

    let qrv = flags & 0x07;
    let query_interval = decode_code_u8(qqic);
    Ok(MembershipQuery {
        group,
        sources,
        max_response_delay: Duration::from_millis(decode_code_u16(max_resp_code) as u64),
        suppress_router_processing: flags & 0x08 != 0,
        robustness: if qrv == 0 { None } else { Some(qrv) },
        query_interval: if query_interval == 0 { None } else { Some(Duration::from_secs(query_interval as u64)) },
    })
}

fn put_ipv6_packet(icmp: &mut BytesMut, source: Ipv6Addr, destination: Ipv6Addr) -> BytesMut {
    let pseudo_header = ipv6_pseudo_header(&source, &destination, icmp.len() as u32, PROTOCOL_ICMPV6);
    let checksum = internet_checksum(&[&pseudo_header, icmp]);
    icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

    let payload_len = IPV6_HOP_BY_HOP_ROUTER_ALERT.len() + icmp.len();
    let mut buf = BytesMut::with_capacity(40 + payload_len);
    put_ipv6_header(&mut buf, source, destination, PROTOCOL_HOP_BY_HOP, 1, payload_len);
    buf.put_slice(&IPV6_HOP_BY_HOP_ROUTER_ALERT);
    buf.put_slice(icmp);
    buf
}

/// Builds the IPv6 packet of an MLDv2 query
pub fn encode_query(query: &MembershipQuery, source: Ipv6Addr) -> Result<BytesMut, MalformedPacketError> {
    let group = match query.group {
        None => Ipv6Addr::UNSPECIFIED,
        Some(IpAddr::V6(g)) => g,
        Some(g) => return Err(MalformedPacketError::AddressFamilyMismatch(IpAddr::V6(source), g)),
    };
    let destination = if query.group.is_some() { group } else { ALL_NODES };

    let mut icmp = BytesMut::new();
    icmp.put_u8(MLD_LISTENER_QUERY);
    icmp.put_u8(0);
    icmp.put_u16(0);
    icmp.put_u16(encode_code_u16(query.max_response_delay.as_millis() as u32));
    icmp.put_u16(0);
    icmp.put_slice(&group.octets());
    let s_flag = if query.suppress_router_processing { 0x08 } else { 0 };
    icmp.put_u8(s_flag | (query.robustness.unwrap_or(0) & 0x07));
    icmp.put_u8(encode_code_u8(query.query_interval.map(|d| d.as_secs() as u32).unwrap_or(0)));
    icmp.put_u16(query.sources.len().prechecked_cast());
    for s in &query.sources {
        match s {
            IpAddr::V6(s) => icmp.put_slice(&s.octets()),
            IpAddr::V4(_) => return Err(MalformedPacketError::AddressFamilyMismatch(IpAddr::V6(source), *s)),
        }
    }

    Ok(put_ipv6_packet(&mut icmp, source, destination))
}

/// Builds the IPv6 packet of an MLDv2 report. Family consistency of the records is checked by
///  the caller.
pub fn encode_report(records: &[GroupRecord], source: Ipv6Addr) -> BytesMut {
    let mut icmp = BytesMut::with_capacity(REPORT_HEADER_LEN + records.iter().map(|r| r.encoded_len()).sum::<usize>());
    icmp.put_u8(MLDV2_LISTENER_REPORT);
    icmp.put_u8(0);
    icmp.put_u16(0);
    icmp.put_u16(0);
    icmp.put_u16(records.len().prechecked_cast());
    for record in records {
        icmp.put_u8(record.record_type.into());
        icmp.put_u8(0);
        icmp.put_u16(record.sources.len().prechecked_cast());
        put_ip(&mut icmp, &record.group);
        for s in &record.sources {
            put_ip(&mut icmp, s);
        }
    }

    put_ipv6_packet(&mut icmp, source, MLDV2_REPORT_DESTINATION)
}

pub fn decode_report(icmp: &[u8], source: &Ipv6Addr, destination: &Ipv6Addr) -> Result<MembershipReport, MalformedPacketError> {
    let mut buf = icmp;
    buf.ensure_remaining("MLDv2 report", REPORT_HEADER_LEN)?;
    verify_checksum(icmp, source, destination)?;

    let message_type = buf.get_u8();
    if message_type != MLDV2_LISTENER_REPORT {
        return Err(MalformedPacketError::UnexpectedType { what: "MLD report", value: message_type });
    }
    buf.advance(5);
    let num_records = buf.get_u16();

    let mut records = Vec::new();
    for _ in 0..num_records {
        let record_type = buf.checked_get_u8("MLDv2 address record")?;
        let record_type = GroupRecordType::try_from(record_type)
            .map_err(|_| MalformedPacketError::UnexpectedType { what: "group record", value: record_type })?;
        let aux_len = buf.checked_get_u8("MLDv2 address record")? as usize * 4;
        let num_sources = buf.checked_get_u16("MLDv2 address record")? as usize;
        let group = IpAddr::V6(buf.checked_get_ipv6("MLDv2 address record")?);
        let mut sources = Vec::with_capacity(num_sources);
        for _ in 0..num_sources {
            sources.push(IpAddr::V6(buf.checked_get_ipv6("MLDv2 address record sources")?));
        }
        buf.checked_skip("MLDv2 auxiliary data", aux_len)?;
        records.push(GroupRecord { record_type, group, sources });
    }
    Ok(MembershipReport { records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ip::parse_ip_packet;

    fn source() -> Ipv6Addr {
        "fe80::1".parse().unwrap()
    }

    fn with_checksum(mut icmp: Vec<u8>, destination: &Ipv6Addr) -> Vec<u8> {
        icmp[2] = 0;
        icmp[3] = 0;
        let pseudo_header = ipv6_pseudo_header(&source(), destination, icmp.len() as u32, PROTOCOL_ICMPV6);
        let checksum = internet_checksum(&[&pseudo_header, &icmp]);
        icmp[2..4].copy_from_slice(&checksum.to_be_bytes());
        icmp
    }

    #[test]
    fn test_decode_v1_general_query() {
        let mut icmp = vec![MLD_LISTENER_QUERY, 0, 0, 0, 0x27, 0x10, 0, 0];
        icmp.extend_from_slice(&[0u8; 16]);
        let icmp = with_checksum(icmp, &ALL_NODES);

        let query = decode_query(&icmp, &source(), &ALL_NODES).unwrap();
        assert_eq!(query, MembershipQuery::general(Duration::from_secs(10)));
    }

    #[test]
    fn test_decode_v2_query_float_max_response_code() {
        let group: Ipv6Addr = "ff3e::1".parse().unwrap();
        let mut icmp = vec![MLD_LISTENER_QUERY, 0, 0, 0, 0x80, 0x00, 0, 0];
        icmp.extend_from_slice(&group.octets());
        icmp.extend_from_slice(&[0x02, 125, 0, 0]);
        let icmp = with_checksum(icmp, &group);

        let query = decode_query(&icmp, &source(), &group).unwrap();
        assert_eq!(query.group, Some(IpAddr::V6(group)));
        assert!(query.sources.is_empty());
        assert_eq!(query.max_response_delay, Duration::from_millis(32768));
        assert_eq!(query.robustness, Some(2));
        assert_eq!(query.query_interval, Some(Duration::from_secs(125)));
    }

    #[test]
    fn test_decode_query_checksum_covers_pseudo_header() {
        let mut icmp = vec![MLD_LISTENER_QUERY, 0, 0, 0, 0x27, 0x10, 0, 0];
        icmp.extend_from_slice(&[0u8; 16]);
        let icmp = with_checksum(icmp, &ALL_NODES);

        assert_eq!(
            decode_query(&icmp, &source(), &MLDV2_REPORT_DESTINATION),
            Err(MalformedPacketError::ChecksumMismatch("ICMPv6"))
        );
    }

    #[test]
    fn test_decode_query_too_short() {
        let icmp = vec![MLD_LISTENER_QUERY, 0, 0, 0, 0x27, 0x10];
        assert_eq!(
            decode_query(&icmp, &source(), &ALL_NODES),
            Err(MalformedPacketError::TooShort { what: "MLD query", expected: 24, actual: 6 })
        );
    }

    #[test]
    fn test_encode_report_headers() {
        let records = vec![GroupRecord::new(GroupRecordType::ModeIsExclude, "ff3e::8000:1".parse().unwrap(), [])];
        let packet = encode_report(&records, source());

        assert_eq!(packet[6], PROTOCOL_HOP_BY_HOP);
        assert_eq!(packet[7], 1, "hop limit");
        assert_eq!(&packet[40..48], &IPV6_HOP_BY_HOP_ROUTER_ALERT);

        let ip = parse_ip_packet(&packet).unwrap();
        assert_eq!(ip.protocol, PROTOCOL_ICMPV6);
        assert_eq!(ip.destination, IpAddr::V6(MLDV2_REPORT_DESTINATION));
        assert_eq!(ip.payload.len(), 8 + 20);
        assert_eq!(decode_report(ip.payload, &source(), &MLDV2_REPORT_DESTINATION).unwrap().records, records);
    }
}
