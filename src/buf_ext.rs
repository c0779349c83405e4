use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut, Bytes};

use crate::error::DecodeError;

/// Marker bytes that every offline (i.e. pre-session) message carries to identify it as RakNet
pub const OFFLINE_MESSAGE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

pub const MAX_TRIAD: u32 = 0x00ff_ffff;

/// Counters sent as triads (sequence numbers, message indices, order indices) wrap around at
///  [MAX_TRIAD]. Of two values less than half the range apart, the one that is reached by counting
///  up from the other is the newer one.
pub const TRIAD_HALF_RANGE: u32 = (MAX_TRIAD + 1) / 2;

pub fn triad_next(value: u32) -> u32 {
    value.wrapping_add(1) & MAX_TRIAD
}

/// How far `to` is ahead of `from`, counting up with wraparound
pub fn triad_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from) & MAX_TRIAD
}

pub fn triad_before(a: u32, b: u32) -> bool {
    let distance = triad_distance(a, b);
    distance != 0 && distance < TRIAD_HALF_RANGE
}

const ADDRESS_VERSION_V4: u8 = 4;
const ADDRESS_VERSION_V6: u8 = 6;
/// AF_INET6 as numbered on Windows; ignored when decoding
const ADDRESS_FAMILY_INET6: u16 = 23;

pub const ENCODED_ADDRESS_LEN_V4: usize = 1 + 4 + 2;
pub const ENCODED_ADDRESS_LEN_V6: usize = 1 + 2 + 2 + 4 + 16 + 4;

/// Checked reads of RakNet specific types. Plain integers use the `try_get_*` methods of [Buf].
pub trait BufExt: Buf {
    fn ensure_remaining(&self, needed: usize) -> Result<(), DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::Truncated { needed, remaining: self.remaining() });
        }
        Ok(())
    }

    /// 24 bit little endian unsigned integer, used for sequence numbers and indices
    fn try_get_triad(&mut self) -> Result<u32, DecodeError> {
        self.ensure_remaining(3)?;
        let b0 = u32::from(self.get_u8());
        let b1 = u32::from(self.get_u8());
        let b2 = u32::from(self.get_u8());
        Ok(b0 | (b1 << 8) | (b2 << 16))
    }

    fn try_get_bool(&mut self) -> Result<bool, DecodeError> {
        match self.try_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::InvalidBool(b)),
        }
    }

    fn try_get_magic(&mut self) -> Result<(), DecodeError> {
        self.ensure_remaining(OFFLINE_MESSAGE_MAGIC.len())?;
        let mut magic = [0u8; 16];
        self.copy_to_slice(&mut magic);
        if magic != OFFLINE_MESSAGE_MAGIC {
            return Err(DecodeError::MagicMismatch);
        }
        Ok(())
    }

    fn try_get_bytes(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        self.ensure_remaining(len)?;
        Ok(self.copy_to_bytes(len))
    }

    fn try_get_string(&mut self) -> Result<String, DecodeError> {
        let len = self.try_get_u16()?;
        let raw = self.try_get_bytes(len.into())?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    fn try_get_address(&mut self) -> Result<SocketAddr, DecodeError> {
        match self.try_get_u8()? {
            ADDRESS_VERSION_V4 => {
                self.ensure_remaining(4 + 2)?;
                let mut octets = [0u8; 4];
                for o in octets.iter_mut() {
                    *o = !self.get_u8();
                }
                let port = self.get_u16();
                Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
            }
            ADDRESS_VERSION_V6 => {
                self.ensure_remaining(ENCODED_ADDRESS_LEN_V6 - 1)?;
                let _family = self.get_u16_le();
                let port = self.get_u16();
                let flow_info = self.get_u32();
                let mut octets = [0u8; 16];
                self.copy_to_slice(&mut octets);
                let scope_id = self.get_u32();
                Ok(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, flow_info, scope_id)))
            }
            n => Err(DecodeError::InvalidAddressVersion(n)),
        }
    }
}

pub trait BufMutExt: BufMut {
    fn put_triad(&mut self, v: u32) {
        debug_assert!(v <= MAX_TRIAD);
        self.put_u8(v as u8);
        self.put_u8((v >> 8) as u8);
        self.put_u8((v >> 16) as u8);
    }

    fn put_bool(&mut self, v: bool) {
        self.put_u8(if v { 1 } else { 0 });
    }

    fn put_magic(&mut self) {
        self.put_slice(&OFFLINE_MESSAGE_MAGIC);
    }

    /// Strings longer than the u16 length prefix allows are truncated
    fn put_string(&mut self, s: &str) {
        let raw = s.as_bytes();
        let len = raw.len().min(u16::MAX as usize);
        self.put_u16(len as u16);
        self.put_slice(&raw[..len]);
    }

    fn put_address(&mut self, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(addr) => {
                self.put_u8(ADDRESS_VERSION_V4);
                for o in addr.ip().octets() {
                    self.put_u8(!o);
                }
                self.put_u16(addr.port());
            }
            SocketAddr::V6(addr) => {
                self.put_u8(ADDRESS_VERSION_V6);
                self.put_u16_le(ADDRESS_FAMILY_INET6);
                self.put_u16(addr.port());
                self.put_u32(addr.flowinfo());
                self.put_slice(&addr.ip().octets());
                self.put_u32(addr.scope_id());
            }
        }
    }
}

impl <T: Buf + ?Sized> BufExt for T {
}

impl <T: BufMut + ?Sized> BufMutExt for T {
}

pub fn encoded_address_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => ENCODED_ADDRESS_LEN_V4,
        SocketAddr::V6(_) => ENCODED_ADDRESS_LEN_V6,
    }
}
