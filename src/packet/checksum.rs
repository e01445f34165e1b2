use std::net::Ipv6Addr;

/// RFC 1071 one's complement sum over a sequence of byte slices, treated as one contiguous
///  buffer. An odd trailing byte is padded with zero.
pub fn internet_checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut pending: Option<u8> = None;

    for part in parts {
        for &b in part.iter() {
            match pending.take() {
                Some(hi) => sum += u16::from_be_bytes([hi, b]) as u32,
                None => pending = Some(b),
            }
        }
    }
    if let Some(hi) = pending {
        sum += u16::from_be_bytes([hi, 0]) as u32;
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// IPv6 pseudo header for upper layer checksums (RFC 8200 section 8.1)
pub fn ipv6_pseudo_header(src: &Ipv6Addr, dst: &Ipv6Addr, upper_layer_len: u32, next_header: u8) -> [u8; 40] {
    let mut result = [0u8; 40];
    result[..16].copy_from_slice(&src.octets());
    result[16..32].copy_from_slice(&dst.octets());
    result[32..36].copy_from_slice(&upper_layer_len.to_be_bytes());
    result[39] = next_header;
    result
}

/// IPv4 pseudo header for UDP checksums
pub fn ipv4_pseudo_header(src: &std::net::Ipv4Addr, dst: &std::net::Ipv4Addr, protocol: u8, len: u16) -> [u8; 12] {
    let mut result = [0u8; 12];
    result[..4].copy_from_slice(&src.octets());
    result[4..8].copy_from_slice(&dst.octets());
    result[9] = protocol;
    result[10..12].copy_from_slice(&len.to_be_bytes());
    result
}
