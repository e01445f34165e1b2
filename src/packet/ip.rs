use crate::error::MalformedPacketError;
use crate::packet::checksum::internet_checksum;
use crate::util::buf::BufExt;
use crate::util::safe_converter::PrecheckedCast;
use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const PROTOCOL_HOP_BY_HOP: u8 = 0;
pub const PROTOCOL_IGMP: u8 = 2;
pub const PROTOCOL_UDP: u8 = 17;
pub const PROTOCOL_ROUTING: u8 = 43;
pub const PROTOCOL_FRAGMENT: u8 = 44;
pub const PROTOCOL_ICMPV6: u8 = 58;
pub const PROTOCOL_DESTINATION_OPTIONS: u8 = 60;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

/// The parts of an IPv4 or IPv6 header that the gateway needs, plus the upper layer payload.
///  For IPv6, extension headers are skipped and `protocol` is the upper layer protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacket<'a> {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: u8,
    pub payload: &'a [u8],
}

/// Total length of the IP packet at the start of `buf` as declared in its header. The buffer may
///  contain more data after the packet.
pub fn declared_packet_len(buf: &[u8]) -> Result<usize, MalformedPacketError> {
    let mut header = buf;
    let first = header.checked_get_u8("IP header")?;
    let len = match first >> 4 {
        4 => {
            buf.ensure_remaining("IPv4 header", IPV4_HEADER_LEN)?;
            header.advance(1); // type of service
            header.checked_get_u16("IPv4 header")? as usize
        }
        6 => {
            buf.ensure_remaining("IPv6 header", IPV6_HEADER_LEN)?;
            header.advance(3); // traffic class, flow label
            IPV6_HEADER_LEN + header.checked_get_u16("IPv6 header")? as usize
        }
        v => return Err(MalformedPacketError::UnsupportedIpVersion(v)),
    };
    if len > buf.len() {
        return Err(MalformedPacketError::LengthOutOfBounds { what: "IP packet", declared: len, available: buf.len() });
    }
    Ok(len)
}

pub fn parse_ip_packet(buf: &[u8]) -> Result<IpPacket<'_>, MalformedPacketError> {
    match buf.first().map(|b| b >> 4) {
        Some(4) => parse_ipv4(buf),
        Some(6) => parse_ipv6(buf),
        Some(v) => Err(MalformedPacketError::UnsupportedIpVersion(v)),
        None => Err(MalformedPacketError::TooShort { what: "IP header", expected: IPV4_HEADER_LEN, actual: 0 }),
    }
}

fn parse_ipv4(buf: &[u8]) -> Result<IpPacket<'_>, MalformedPacketError> {
    buf.ensure_remaining("IPv4 header", IPV4_HEADER_LEN)?;

    let mut header = buf;
    let header_len = ((header.checked_get_u8("IPv4 header")? & 0x0f) as usize) * 4;
    if header_len < IPV4_HEADER_LEN {
        return Err(MalformedPacketError::LengthOutOfBounds { what: "IPv4 header length", declared: header_len, available: IPV4_HEADER_LEN });
    }
    header.checked_skip("IPv4 header", 1)?; // type of service
    let total_len = header.checked_get_u16("IPv4 header")? as usize;
    if total_len > buf.len() || total_len < header_len {
        return Err(MalformedPacketError::LengthOutOfBounds { what: "IPv4 total length", declared: total_len, available: buf.len() });
    }

    header.checked_skip("IPv4 header", 2)?; // identification
    let flags_and_offset = header.checked_get_u16("IPv4 header")?;
    let more_fragments = flags_and_offset & 0x2000 != 0;
    let fragment_offset = flags_and_offset & 0x1fff;
    if more_fragments || fragment_offset != 0 {
        return Err(MalformedPacketError::Fragmented);
    }

    if internet_checksum(&[&buf[..header_len]]) != 0 {
        return Err(MalformedPacketError::ChecksumMismatch("IPv4 header"));
    }

    header.checked_skip("IPv4 header", 1)?; // ttl
    let protocol = header.checked_get_u8("IPv4 header")?;
    header.checked_skip("IPv4 header", 2)?; // checksum
    let source = header.checked_get_ipv4("IPv4 header")?;
    let destination = header.checked_get_ipv4("IPv4 header")?;

    Ok(IpPacket {
        source: IpAddr::V4(source),
        destination: IpAddr::V4(destination),
        protocol,
        payload: &buf[header_len..total_len],
    })
}

fn parse_ipv6(buf: &[u8]) -> Result<IpPacket<'_>, MalformedPacketError> {
    buf.ensure_remaining("IPv6 header", IPV6_HEADER_LEN)?;

    let mut header = buf;
    header.checked_skip("IPv6 header", 4)?; // version, traffic class, flow label
    let payload_len = header.checked_get_u16("IPv6 header")? as usize;
    if payload_len == 0 {
        // jumbograms are not supported
        return Err(MalformedPacketError::LengthOutOfBounds { what: "IPv6 payload length", declared: 0, available: buf.len() - IPV6_HEADER_LEN });
    }
    if IPV6_HEADER_LEN + payload_len > buf.len() {
        return Err(MalformedPacketError::LengthOutOfBounds { what: "IPv6 payload length", declared: payload_len, available: buf.len() - IPV6_HEADER_LEN });
    }
    let mut next_header = header.checked_get_u8("IPv6 header")?;
    header.checked_skip("IPv6 header", 1)?; // hop limit
    let source = header.checked_get_ipv6("IPv6 header")?;
    let destination = header.checked_get_ipv6("IPv6 header")?;

    let mut payload = &buf[IPV6_HEADER_LEN..IPV6_HEADER_LEN + payload_len];
    loop {
        match next_header {
            PROTOCOL_HOP_BY_HOP | PROTOCOL_ROUTING | PROTOCOL_DESTINATION_OPTIONS => {
                payload.ensure_remaining("IPv6 extension header", 8)?;
                let mut ext = payload;
                let following = ext.checked_get_u8("IPv6 extension header")?;
                let ext_len = (ext.checked_get_u8("IPv6 extension header")? as usize + 1) * 8;
                if ext_len > payload.len() {
                    return Err(MalformedPacketError::LengthOutOfBounds { what: "IPv6 extension header", declared: ext_len, available: payload.len() });
                }
                next_header = following;
                payload = &payload[ext_len..];
            }
            PROTOCOL_FRAGMENT => return Err(MalformedPacketError::Fragmented),
            _ => break,
        }
    }

    Ok(IpPacket {
        source: IpAddr::V6(source),
        destination: IpAddr::V6(destination),
        protocol: next_header,
        payload,
    })
}

/// Options added to the IPv4 header of membership reports
pub const IPV4_ROUTER_ALERT: [u8; 4] = [0x94, 0x04, 0x00, 0x00];

/// Writes an IPv4 header with the given options (which must be padded to a multiple of 4 bytes)
///  for a payload of `payload_len` bytes. `tos` is written verbatim.
pub fn put_ipv4_header(buf: &mut BytesMut, source: Ipv4Addr, destination: Ipv4Addr, protocol: u8, ttl: u8, tos: u8, options: &[u8], payload_len: usize) {
    debug_assert!(options.len() % 4 == 0);

    let header_len = IPV4_HEADER_LEN + options.len();
    let start = buf.len();
    buf.put_u8(0x40 | PrecheckedCast::<u8>::prechecked_cast(header_len / 4));
    buf.put_u8(tos);
    buf.put_u16((header_len + payload_len).prechecked_cast());
    buf.put_u16(0); // identification
    buf.put_u16(0); // flags, fragment offset
    buf.put_u8(ttl);
    buf.put_u8(protocol);
    buf.put_u16(0); // checksum placeholder
    buf.put_slice(&source.octets());
    buf.put_slice(&destination.octets());
    buf.put_slice(options);

    let checksum = internet_checksum(&[&buf[start..]]);
    buf[start + 10..start + 12].copy_from_slice(&checksum.to_be_bytes());
}

/// Hop-by-hop extension header containing a router alert option for MLD (RFC 2711), followed by
///  ICMPv6
pub const IPV6_HOP_BY_HOP_ROUTER_ALERT: [u8; 8] = [PROTOCOL_ICMPV6, 0, 0x05, 0x02, 0x00, 0x00, 0x01, 0x00];

/// Writes an IPv6 header. `payload_len` includes the length of all extension headers.
pub fn put_ipv6_header(buf: &mut BytesMut, source: Ipv6Addr, destination: Ipv6Addr, next_header: u8, hop_limit: u8, payload_len: usize) {
    buf.put_u32(0x6000_0000);
    buf.put_u16(payload_len.prechecked_cast());
    buf.put_u8(next_header);
    buf.put_u8(hop_limit);
    buf.put_slice(&source.octets());
    buf.put_slice(&destination.octets());
}
