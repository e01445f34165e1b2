use crate::error::MalformedPacketError;
use crate::packet::checksum::{internet_checksum, ipv4_pseudo_header, ipv6_pseudo_header};
use crate::packet::ip::{parse_ip_packet, put_ipv4_header, put_ipv6_header, PROTOCOL_UDP};
use crate::util::buf::BufExt;
use crate::util::safe_converter::PrecheckedCast;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};

pub const UDP_HEADER_LEN: usize = 8;

/// A UDP datagram decapsulated from a relay's multicast data message. The payload is opaque.
#[derive(Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub payload: Bytes,
}

impl Debug for UdpDatagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UDP{{{:?}->{:?}:{} bytes}}", self.source, self.destination, self.payload.len())
    }
}

impl UdpDatagram {
    pub fn source_address(&self) -> IpAddr {
        self.source.ip()
    }
    pub fn source_port(&self) -> u16 {
        self.source.port()
    }
    pub fn destination_address(&self) -> IpAddr {
        self.destination.ip()
    }
    pub fn destination_port(&self) -> u16 {
        self.destination.port()
    }
}

/// Parses an encapsulated IPv4 or IPv6 packet carrying UDP into a flat [UdpDatagram].
///
/// Fails if the buffer is shorter than the IP or UDP header, if a length field does not fit the
///  buffer, or if the packet is not UDP. Checksums are only verified if `verify_checksum` is set,
///  and a zero IPv4 UDP checksum means "no checksum".
pub fn decapsulate(packet: &[u8], verify_checksum: bool) -> Result<UdpDatagram, MalformedPacketError> {
    let ip = parse_ip_packet(packet)?;
    if ip.protocol != PROTOCOL_UDP {
        return Err(MalformedPacketError::UnsupportedProtocol(ip.protocol, "UDP"));
    }

    let udp = ip.payload;
    let mut header = udp;
    header.ensure_remaining("UDP header", UDP_HEADER_LEN)?;
    let source_port = header.checked_get_u16("UDP header")?;
    let destination_port = header.checked_get_u16("UDP header")?;
    let udp_len = header.checked_get_u16("UDP header")? as usize;
    let checksum = header.checked_get_u16("UDP header")?;

    if udp_len < UDP_HEADER_LEN || udp_len > udp.len() {
        return Err(MalformedPacketError::LengthOutOfBounds { what: "UDP length", declared: udp_len, available: udp.len() });
    }

    if verify_checksum && !(checksum == 0 && ip.source.is_ipv4()) {
        let udp = &udp[..udp_len];
        let sum = match (ip.source, ip.destination) {
            (IpAddr::V4(s), IpAddr::V4(d)) => internet_checksum(&[&ipv4_pseudo_header(&s, &d, PROTOCOL_UDP, udp_len.prechecked_cast()), udp]),
            (IpAddr::V6(s), IpAddr::V6(d)) => internet_checksum(&[&ipv6_pseudo_header(&s, &d, udp_len as u32, PROTOCOL_UDP), udp]),
            (s, d) => return Err(MalformedPacketError::AddressFamilyMismatch(s, d)),
        };
        if sum != 0 {
            return Err(MalformedPacketError::ChecksumMismatch("UDP"));
        }
    }

    Ok(UdpDatagram {
        source: SocketAddr::new(ip.source, source_port),
        destination: SocketAddr::new(ip.destination, destination_port),
        payload: Bytes::copy_from_slice(&udp[UDP_HEADER_LEN..udp_len]),
    })
}

/// Builds the IP packet carrying a UDP datagram, with a valid UDP checksum. This is the inverse
///  of [decapsulate], used for relay side encapsulation.
pub fn encapsulate(datagram: &UdpDatagram) -> Result<BytesMut, MalformedPacketError> {
    let udp_len = UDP_HEADER_LEN + datagram.payload.len();
    if udp_len > u16::MAX as usize - 40 {
        return Err(MalformedPacketError::LengthOutOfBounds { what: "UDP payload", declared: datagram.payload.len(), available: u16::MAX as usize - 48 });
    }

    let mut udp = BytesMut::with_capacity(udp_len);
    udp.put_u16(datagram.source_port());
    udp.put_u16(datagram.destination_port());
    udp.put_u16(udp_len.prechecked_cast());
    udp.put_u16(0);
    udp.put_slice(&datagram.payload);

    let mut buf = BytesMut::with_capacity(udp_len + 40);
    let checksum = match (datagram.source_address(), datagram.destination_address()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            put_ipv4_header(&mut buf, s, d, PROTOCOL_UDP, 64, 0, &[], udp_len);
            internet_checksum(&[&ipv4_pseudo_header(&s, &d, PROTOCOL_UDP, udp_len.prechecked_cast()), &udp])
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            put_ipv6_header(&mut buf, s, d, PROTOCOL_UDP, 64, udp_len);
            internet_checksum(&[&ipv6_pseudo_header(&s, &d, udp_len as u32, PROTOCOL_UDP), &udp])
        }
        (s, d) => return Err(MalformedPacketError::AddressFamilyMismatch(s, d)),
    };
    // a computed checksum of zero is transmitted as all ones
    let checksum = if checksum == 0 { 0xffff } else { checksum };
    udp[6..8].copy_from_slice(&checksum.to_be_bytes());

    buf.put_slice(&udp);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ip::IPV4_HEADER_LEN;
    use rstest::rstest;

    fn datagram(source: &str, destination: &str, payload: &'static [u8]) -> UdpDatagram {
        UdpDatagram {
            source: source.parse().unwrap(),
            destination: destination.parse().unwrap(),
            payload: Bytes::from_static(payload),
        }
    }

    #[rstest]
    #[case::v4(datagram("10.1.2.3:5000", "232.1.1.1:6000", b"hello multicast"))]
    #[case::v4_empty_payload(datagram("10.1.2.3:5000", "232.1.1.1:6000", b""))]
    #[case::v6(datagram("[2001:db8::1]:5000", "[ff3e::8000:1]:6000", b"hello v6"))]
    fn test_decapsulate_encapsulated(#[case] original: UdpDatagram, #[values(false, true)] verify: bool) {
        let packet = encapsulate(&original).unwrap();
        assert_eq!(decapsulate(&packet, verify).unwrap(), original);
    }

    #[test]
    fn test_decapsulate_fixture() {
        // IPv4 10.0.0.1 -> 232.0.0.1, UDP 1234 -> 5678, payload "abc", no UDP checksum
        let packet: Vec<u8> = vec![
            0x45, 0x00, 0x00, 0x1f, 0x00, 0x00, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00,
            10, 0, 0, 1,
            232, 0, 0, 1,
            0x04, 0xd2, 0x16, 0x2e, 0x00, 0x0b, 0x00, 0x00,
            b'a', b'b', b'c',
        ];
        let mut packet = packet;
        let checksum = internet_checksum(&[&packet[..IPV4_HEADER_LEN]]);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());

        let datagram = decapsulate(&packet, true).unwrap();
        assert_eq!(datagram.source_address(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(datagram.source_port(), 1234);
        assert_eq!(datagram.destination_address(), "232.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(datagram.destination_port(), 5678);
        assert_eq!(datagram.payload.as_ref(), b"abc");
    }

    #[rstest]
    #[case::empty(0)]
    #[case::ip_header_only(IPV4_HEADER_LEN)]
    #[case::partial_udp_header(IPV4_HEADER_LEN + 7)]
    fn test_decapsulate_truncated(#[case] len: usize) {
        let packet = encapsulate(&datagram("10.1.2.3:5000", "232.1.1.1:6000", b"payload")).unwrap();
        let mut truncated = packet[..len].to_vec();
        if len >= 4 {
            // keep the IP length consistent so that the UDP header check is reached
            truncated[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            truncated[10..12].copy_from_slice(&[0, 0]);
            let checksum = internet_checksum(&[&truncated[..IPV4_HEADER_LEN]]);
            truncated[10..12].copy_from_slice(&checksum.to_be_bytes());
        }
        assert!(matches!(decapsulate(&truncated, false), Err(MalformedPacketError::TooShort { .. })));
    }

    #[test]
    fn test_decapsulate_partial_udp_header() {
        let mut buf = BytesMut::new();
        put_ipv4_header(&mut buf, "10.0.0.1".parse().unwrap(), "232.0.0.1".parse().unwrap(), PROTOCOL_UDP, 64, 0, &[], 5);
        buf.put_slice(&[0x13, 0x88, 0x17, 0x70, 0]);
        assert_eq!(
            decapsulate(&buf, false),
            Err(MalformedPacketError::TooShort { what: "UDP header", expected: 8, actual: 5 })
        );
    }

    #[test]
    fn test_decapsulate_udp_length_out_of_bounds() {
        let mut packet = encapsulate(&datagram("10.1.2.3:5000", "232.1.1.1:6000", b"payload")).unwrap();
        packet[IPV4_HEADER_LEN + 4..IPV4_HEADER_LEN + 6].copy_from_slice(&100u16.to_be_bytes());
        assert_eq!(
            decapsulate(&packet, false),
            Err(MalformedPacketError::LengthOutOfBounds { what: "UDP length", declared: 100, available: 15 })
        );
    }

    #[test]
    fn test_decapsulate_bad_udp_checksum() {
        let mut packet = encapsulate(&datagram("10.1.2.3:5000", "232.1.1.1:6000", b"payload")).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        assert_eq!(decapsulate(&packet, true), Err(MalformedPacketError::ChecksumMismatch("UDP")));
        assert!(decapsulate(&packet, false).is_ok());
    }

    #[test]
    fn test_decapsulate_not_udp() {
        let mut buf = BytesMut::new();
        put_ipv4_header(&mut buf, "10.0.0.1".parse().unwrap(), "232.0.0.1".parse().unwrap(), 6, 64, 0, &[], 20);
        buf.put_slice(&[0u8; 20]);
        assert_eq!(decapsulate(&buf, false), Err(MalformedPacketError::UnsupportedProtocol(6, "UDP")));
    }

    #[test]
    fn test_encapsulate_family_mismatch() {
        let d = datagram("10.1.2.3:5000", "[ff3e::1]:6000", b"x");
        assert!(matches!(encapsulate(&d), Err(MalformedPacketError::AddressFamilyMismatch(..))));
    }
}
