use crate::error::MalformedPacketError;
use crate::packet::ip::declared_packet_len;
use crate::util::buf::{put_ip, BufExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AmtMessageType {
    RelayDiscovery = 1,
    RelayAdvertisement = 2,
    Request = 3,
    MembershipQuery = 4,
    MembershipUpdate = 5,
    MulticastData = 6,
    Teardown = 7,
}

/// The relay's 48 bit message authentication code, echoed by the gateway in updates and teardowns
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResponseMac(pub [u8; 6]);

impl Debug for ResponseMac {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// The gateway's address and port as seen by the relay, reported in membership queries with the
///  G flag set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayAddress {
    pub port: u16,
    pub address: IpAddr,
}

impl GatewayAddress {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.port);
        buf.put_slice(&to_wire_ipv6(self.address).octets());
    }

    fn try_deser(buf: &mut impl Buf) -> Result<GatewayAddress, MalformedPacketError> {
        let port = buf.checked_get_u16("gateway address")?;
        let raw = buf.checked_get_ipv6("gateway address")?;

        let address = if let Some(v4) = raw.to_ipv4_mapped() {
            IpAddr::V4(v4)
        }
        else if raw.segments()[..6] == [0; 6] && !raw.is_unspecified() && !raw.is_loopback() {
            // IPv4 compatible
            IpAddr::V4(std::net::Ipv4Addr::from(u128::from(raw) as u32))
        }
        else {
            IpAddr::V6(raw)
        };
        Ok(GatewayAddress { port, address })
    }
}

/// The messages exchanged between gateway and relay. All messages start with a byte containing
///  the protocol version (always 0) in the upper and the message type in the lower four bits.
///
/// ```ascii
/// 0: version (4 bits) | type (4 bits)
/// 1..: type specific, see below
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmtMessage {
    /// ```ascii
    /// 1..4: reserved
    /// 4..8: discovery nonce
    /// ```
    RelayDiscovery { nonce: u32 },
    /// ```ascii
    /// 1..4: reserved
    /// 4..8: discovery nonce
    /// 8..:  relay address (4 or 16 bytes)
    /// ```
    RelayAdvertisement { nonce: u32, relay_address: IpAddr },
    /// ```ascii
    /// 1:    reserved (7 bits) | P flag (1 bit, set to request MLD instead of IGMP queries)
    /// 2..4: reserved
    /// 4..8: request nonce
    /// ```
    Request { nonce: u32, prefer_mld: bool },
    /// ```ascii
    /// 1:      reserved (6 bits) | L flag | G flag
    /// 2..8:   response MAC
    /// 8..12:  request nonce
    /// 12..:   encapsulated IGMP / MLD query packet
    /// (if G): gateway port (2 bytes), gateway address (16 bytes)
    /// ```
    MembershipQuery {
        limited_membership: bool,
        response_mac: ResponseMac,
        nonce: u32,
        packet: Bytes,
        gateway: Option<GatewayAddress>,
    },
    /// ```ascii
    /// 1:      reserved
    /// 2..8:   response MAC
    /// 8..12:  request nonce
    /// 12..:   encapsulated IGMP / MLD report packet
    /// ```
    MembershipUpdate {
        response_mac: ResponseMac,
        nonce: u32,
        packet: Bytes,
    },
    /// ```ascii
    /// 1:      reserved
    /// 2..:    encapsulated IP packet
    /// ```
    MulticastData { packet: Bytes },
    /// ```ascii
    /// 1:      reserved
    /// 2..8:   response MAC
    /// 8..12:  request nonce
    /// 12..14: gateway port
    /// 14..30: gateway address
    /// ```
    Teardown {
        response_mac: ResponseMac,
        nonce: u32,
        gateway: GatewayAddress,
    },
}

const FLAG_PREFER_MLD: u8 = 0x01;
const FLAG_GATEWAY_ADDRESS: u8 = 0x01;
const FLAG_LIMITED_MEMBERSHIP: u8 = 0x02;

impl AmtMessage {
    pub fn message_type(&self) -> AmtMessageType {
        match self {
            AmtMessage::RelayDiscovery { .. } => AmtMessageType::RelayDiscovery,
            AmtMessage::RelayAdvertisement { .. } => AmtMessageType::RelayAdvertisement,
            AmtMessage::Request { .. } => AmtMessageType::Request,
            AmtMessage::MembershipQuery { .. } => AmtMessageType::MembershipQuery,
            AmtMessage::MembershipUpdate { .. } => AmtMessageType::MembershipUpdate,
            AmtMessage::MulticastData { .. } => AmtMessageType::MulticastData,
            AmtMessage::Teardown { .. } => AmtMessageType::Teardown,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type().into());

        match self {
            AmtMessage::RelayDiscovery { nonce } => {
                buf.put_slice(&[0; 3]);
                buf.put_u32(*nonce);
            }
            AmtMessage::RelayAdvertisement { nonce, relay_address } => {
                buf.put_slice(&[0; 3]);
                buf.put_u32(*nonce);
                put_ip(buf, relay_address);
            }
            AmtMessage::Request { nonce, prefer_mld } => {
                buf.put_u8(if *prefer_mld { FLAG_PREFER_MLD } else { 0 });
                buf.put_u16(0);
                buf.put_u32(*nonce);
            }
            AmtMessage::MembershipQuery { limited_membership, response_mac, nonce, packet, gateway } => {
                let mut flags = 0;
                if *limited_membership {
                    flags |= FLAG_LIMITED_MEMBERSHIP;
                }
                if gateway.is_some() {
                    flags |= FLAG_GATEWAY_ADDRESS;
                }
                buf.put_u8(flags);
                buf.put_slice(&response_mac.0);
                buf.put_u32(*nonce);
                buf.put_slice(packet);
                if let Some(gateway) = gateway {
                    gateway.ser(buf);
                }
            }
            AmtMessage::MembershipUpdate { response_mac, nonce, packet } => {
                buf.put_u8(0);
                buf.put_slice(&response_mac.0);
                buf.put_u32(*nonce);
                buf.put_slice(packet);
            }
            AmtMessage::MulticastData { packet } => {
                buf.put_u8(0);
                buf.put_slice(packet);
            }
            AmtMessage::Teardown { response_mac, nonce, gateway } => {
                buf.put_u8(0);
                buf.put_slice(&response_mac.0);
                buf.put_u32(*nonce);
                gateway.ser(buf);
            }
        }
    }

    pub fn try_deser(datagram: &[u8]) -> Result<AmtMessage, MalformedPacketError> {
        let mut buf = datagram;
        let first = buf.checked_get_u8("AMT message")?;
        let version = first >> 4;
        if version != 0 {
            return Err(MalformedPacketError::UnsupportedAmtVersion(version));
        }
        let message_type = AmtMessageType::try_from(first & 0x0f)
            .map_err(|_| MalformedPacketError::UnknownMessageType(first & 0x0f))?;

        match message_type {
            AmtMessageType::RelayDiscovery => {
                buf.checked_skip("relay discovery", 3)?;
                let nonce = buf.checked_get_u32("relay discovery")?;
                Ok(AmtMessage::RelayDiscovery { nonce })
            }
            AmtMessageType::RelayAdvertisement => {
                buf.checked_skip("relay advertisement", 3)?;
                let nonce = buf.checked_get_u32("relay advertisement")?;
                let relay_address = match buf.remaining() {
                    4 => IpAddr::V4(buf.checked_get_ipv4("relay advertisement")?),
                    16 => IpAddr::V6(buf.checked_get_ipv6("relay advertisement")?),
                    n => return Err(MalformedPacketError::InvalidAddressLength(n)),
                };
                Ok(AmtMessage::RelayAdvertisement { nonce, relay_address })
            }
            AmtMessageType::Request => {
                let flags = buf.checked_get_u8("request")?;
                buf.checked_skip("request", 2)?;
                let nonce = buf.checked_get_u32("request")?;
                Ok(AmtMessage::Request { nonce, prefer_mld: flags & FLAG_PREFER_MLD != 0 })
            }
            AmtMessageType::MembershipQuery => {
                let flags = buf.checked_get_u8("membership query")?;
                let response_mac = Self::try_deser_mac(&mut buf, "membership query")?;
                let nonce = buf.checked_get_u32("membership query")?;
                let packet_len = declared_packet_len(buf)?;
                let packet = Bytes::copy_from_slice(&buf[..packet_len]);
                buf.advance(packet_len);

                let gateway = if flags & FLAG_GATEWAY_ADDRESS != 0 {
                    Some(GatewayAddress::try_deser(&mut buf)?)
                }
                else {
                    None
                };
                Ok(AmtMessage::MembershipQuery {
                    limited_membership: flags & FLAG_LIMITED_MEMBERSHIP != 0,
                    response_mac,
                    nonce,
                    packet,
                    gateway,
                })
            }
            AmtMessageType::MembershipUpdate => {
                buf.checked_skip("membership update", 1)?;
                let response_mac = Self::try_deser_mac(&mut buf, "membership update")?;
                let nonce = buf.checked_get_u32("membership update")?;
                Ok(AmtMessage::MembershipUpdate { response_mac, nonce, packet: Bytes::copy_from_slice(buf) })
            }
            AmtMessageType::MulticastData => {
                buf.checked_skip("multicast data", 1)?;
                Ok(AmtMessage::MulticastData { packet: Bytes::copy_from_slice(buf) })
            }
            AmtMessageType::Teardown => {
                buf.checked_skip("teardown", 1)?;
                let response_mac = Self::try_deser_mac(&mut buf, "teardown")?;
                let nonce = buf.checked_get_u32("teardown")?;
                let gateway = GatewayAddress::try_deser(&mut buf)?;
                Ok(AmtMessage::Teardown { response_mac, nonce, gateway })
            }
        }
    }

    fn try_deser_mac(buf: &mut &[u8], what: &'static str) -> Result<ResponseMac, MalformedPacketError> {
        buf.ensure_remaining(what, 6)?;
        let mut mac = [0u8; 6];
        buf.copy_to_slice(&mut mac);
        Ok(ResponseMac(mac))
    }
}

/// Converts an IPv4 address to the IPv6 form used on the wire for gateway addresses
pub fn to_wire_ipv6(address: IpAddr) -> Ipv6Addr {
    match address {
        IpAddr::V4(a) => a.to_ipv6_mapped(),
        IpAddr::V6(a) => a,
    }
}
