use crate::error::MalformedPacketError;
use bytes::Buf;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

macro_rules! checked_get_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self, what: &'static str) -> Result<$ty, MalformedPacketError> {
            self.ensure_remaining(what, size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reading for packet parsing: every getter reports which structure was being
///  parsed when the buffer ran out.
pub trait BufExt: Buf {
    fn ensure_remaining(&self, what: &'static str, expected: usize) -> Result<(), MalformedPacketError> {
        if self.remaining() < expected {
            return Err(MalformedPacketError::TooShort { what, expected, actual: self.remaining() });
        }
        Ok(())
    }

    checked_get_impl!(checked_get_u8, u8, get_u8);
    checked_get_impl!(checked_get_u16, u16, get_u16);
    checked_get_impl!(checked_get_u32, u32, get_u32);

    fn checked_skip(&mut self, what: &'static str, len: usize) -> Result<(), MalformedPacketError> {
        self.ensure_remaining(what, len)?;
        self.advance(len);
        Ok(())
    }

    fn checked_get_ipv4(&mut self, what: &'static str) -> Result<Ipv4Addr, MalformedPacketError> {
        Ok(Ipv4Addr::from(self.checked_get_u32(what)?))
    }

    fn checked_get_ipv6(&mut self, what: &'static str) -> Result<Ipv6Addr, MalformedPacketError> {
        self.ensure_remaining(what, 16)?;
        Ok(Ipv6Addr::from(self.get_u128()))
    }

    /// reads an address of the same family as `family`
    fn checked_get_ip_like(&mut self, what: &'static str, family: &IpAddr) -> Result<IpAddr, MalformedPacketError> {
        match family {
            IpAddr::V4(_) => Ok(IpAddr::V4(self.checked_get_ipv4(what)?)),
            IpAddr::V6(_) => Ok(IpAddr::V6(self.checked_get_ipv6(what)?)),
        }
    }
}

impl <T: Buf> BufExt for T {
}

pub fn put_ip(buf: &mut impl bytes::BufMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(a) => buf.put_slice(&a.octets()),
        IpAddr::V6(a) => buf.put_slice(&a.octets()),
    }
}
