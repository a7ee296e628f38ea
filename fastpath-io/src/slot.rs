//! Slot layouts shared with every other reader and writer of a packet buffer.
//!
//! # Layout
//! ```text
//! IPv4  [0,4) reserved | [4,8) peer address | [8,12) payload length | [12,16) reserved | [16,N) payload
//! IPv6  [0,8) reserved | [8,24) peer address | [24,28) reserved | [28,32) payload length
//!       [32,72) reserved (IPv6 header sized) | [72,N) payload
//! ```
//! Addresses are stored in network byte order, the length field in native byte order.
//! Reserved ranges are never written here.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{NetError, Result};

pub const IPV4_ADDR_OFFSET: usize = 4;
pub const IPV4_LEN_OFFSET: usize = 8;
pub const IPV4_HEADER_LEN: usize = 16;
/// Smallest IPv4 packet header (IHL = 5).
const IPV4_MIN_IP_HEADER: usize = 20;

pub const IPV6_ADDR_OFFSET: usize = 8;
pub const IPV6_LEN_OFFSET: usize = 28;
/// Slot header (32) plus the reserved region sized like an IPv6 header (40).
pub const IPV6_HEADER_LEN: usize = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Offset of the payload from the slot base.
    #[inline]
    pub const fn header_len(self) -> usize {
        match self {
            AddressFamily::Ipv4 => IPV4_HEADER_LEN,
            AddressFamily::Ipv6 => IPV6_HEADER_LEN,
        }
    }

    #[inline]
    pub const fn addr_offset(self) -> usize {
        match self {
            AddressFamily::Ipv4 => IPV4_ADDR_OFFSET,
            AddressFamily::Ipv6 => IPV6_ADDR_OFFSET,
        }
    }

    #[inline]
    pub const fn addr_len(self) -> usize {
        match self {
            AddressFamily::Ipv4 => 4,
            AddressFamily::Ipv6 => 16,
        }
    }

    #[inline]
    pub const fn len_offset(self) -> usize {
        match self {
            AddressFamily::Ipv4 => IPV4_LEN_OFFSET,
            AddressFamily::Ipv6 => IPV6_LEN_OFFSET,
        }
    }

    /// `AF_INET` / `AF_INET6`.
    pub const fn raw(self) -> libc::c_int {
        match self {
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
        }
    }

    pub fn from_raw(family: libc::c_int) -> Option<Self> {
        match family {
            libc::AF_INET => Some(AddressFamily::Ipv4),
            libc::AF_INET6 => Some(AddressFamily::Ipv6),
            _ => None,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// Typed view over one slot. The only place slot offsets are interpreted.
#[derive(Debug)]
pub struct Slot<B> {
    bytes: B,
    family: AddressFamily,
}

impl<B: AsRef<[u8]>> Slot<B> {
    /// Wraps `bytes` as a slot of `family`.
    ///
    /// # Errors
    /// `SlotTooSmall` if `bytes` cannot hold the family's header.
    pub fn new(bytes: B, family: AddressFamily) -> Result<Self> {
        let slot_size = bytes.as_ref().len();
        if slot_size < family.header_len() {
            return Err(NetError::SlotTooSmall { family, slot_size, header: family.header_len() });
        }
        Ok(Self { bytes, family })
    }

    #[inline]
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Size of the payload area.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.as_ref().len() - self.family.header_len()
    }

    pub fn peer(&self) -> IpAddr {
        let bytes = self.bytes.as_ref();
        let at = self.family.addr_offset();
        match self.family {
            AddressFamily::Ipv4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&bytes[at..at + 4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AddressFamily::Ipv6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[at..at + 16]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }

    #[inline]
    pub fn payload_len(&self) -> u32 {
        let at = self.family.len_offset();
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes.as_ref()[at..at + 4]);
        u32::from_ne_bytes(raw)
    }

    /// The whole payload area, regardless of the length field.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.bytes.as_ref()[self.family.header_len()..]
    }

    /// Payload truncated to the length field (clamped to capacity).
    pub fn data(&self) -> &[u8] {
        let len = (self.payload_len() as usize).min(self.capacity());
        &self.payload()[..len]
    }

    /// Received payload with the IPv4 header removed.
    ///
    /// # Logic
    /// The receive paths store a datagram exactly as the kernel delivers it. IPv4 raw
    /// sockets deliver the IP header ahead of the payload; IPv6 raw sockets do not.
    /// For IPv4 slots this skips `IHL * 4` bytes of [`Slot::data`] when it starts with
    /// a well-formed version-4 header. Otherwise, and for IPv6 slots, it returns
    /// [`Slot::data`] unchanged. Only meaningful on slots filled by a receive.
    pub fn ip_payload(&self) -> &[u8] {
        let data = self.data();
        if self.family == AddressFamily::Ipv6 {
            return data;
        }
        match data.first() {
            Some(&first) if first >> 4 == 4 => {
                let ihl = usize::from(first & 0x0f) * 4;
                if (IPV4_MIN_IP_HEADER..=data.len()).contains(&ihl) {
                    &data[ihl..]
                } else {
                    data
                }
            }
            _ => data,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    pub fn into_inner(self) -> B {
        self.bytes
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Slot<B> {
    /// # Errors
    /// `FamilyMismatch` if `addr` is not of the slot's family.
    pub fn set_peer(&mut self, addr: IpAddr) -> Result<()> {
        let at = self.family.addr_offset();
        let bytes = self.bytes.as_mut();
        match (self.family, addr) {
            (AddressFamily::Ipv4, IpAddr::V4(v4)) => bytes[at..at + 4].copy_from_slice(&v4.octets()),
            (AddressFamily::Ipv6, IpAddr::V6(v6)) => bytes[at..at + 16].copy_from_slice(&v6.octets()),
            (expected, other) => {
                return Err(NetError::FamilyMismatch { expected, actual: AddressFamily::of(&other) })
            }
        }
        Ok(())
    }

    #[inline]
    pub fn set_payload_len(&mut self, len: u32) {
        let at = self.family.len_offset();
        self.bytes.as_mut()[at..at + 4].copy_from_slice(&len.to_ne_bytes());
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let at = self.family.header_len();
        &mut self.bytes.as_mut()[at..]
    }

    /// Copies `data` into the payload area and records its length.
    pub fn write_payload(&mut self, data: &[u8]) -> Result<()> {
        let capacity = self.capacity();
        if data.len() > capacity {
            return Err(NetError::PayloadOverflow { len: data.len(), capacity });
        }
        self.payload_mut()[..data.len()].copy_from_slice(data);
        self.set_payload_len(data.len() as u32);
        Ok(())
    }
}

/// A caller buffer split into equally sized slots.
#[derive(Debug)]
pub struct SlotRegion<B> {
    buffer: B,
    family: AddressFamily,
    slot_size: usize,
}

impl<B: AsRef<[u8]>> SlotRegion<B> {
    pub fn new(buffer: B, family: AddressFamily, slot_size: usize) -> Result<Self> {
        if slot_size < family.header_len() {
            return Err(NetError::SlotTooSmall { family, slot_size, header: family.header_len() });
        }
        Ok(Self { buffer, family, slot_size })
    }

    #[inline]
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of whole slots the buffer holds.
    pub fn slot_count(&self) -> usize {
        self.buffer.as_ref().len() / self.slot_size
    }

    /// Checks that the first `count` slots lie inside the buffer.
    pub fn require(&self, count: usize) -> Result<()> {
        let len = self.buffer.as_ref().len();
        match count.checked_mul(self.slot_size) {
            Some(required) if required <= len => Ok(()),
            Some(required) => Err(NetError::BufferTooSmall { len, required }),
            None => Err(NetError::BufferTooSmall { len, required: usize::MAX }),
        }
    }

    pub fn slot(&self, index: usize) -> Option<Slot<&[u8]>> {
        let start = index.checked_mul(self.slot_size)?;
        let bytes = self.buffer.as_ref().get(start..start.checked_add(self.slot_size)?)?;
        Some(Slot { bytes, family: self.family })
    }

    pub fn into_inner(self) -> B {
        self.buffer
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlotRegion<B> {
    pub fn slot_mut(&mut self, index: usize) -> Option<Slot<&mut [u8]>> {
        let start = index.checked_mul(self.slot_size)?;
        let end = start.checked_add(self.slot_size)?;
        let bytes = self.buffer.as_mut().get_mut(start..end)?;
        Some(Slot { bytes, family: self.family })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = Slot<&mut [u8]>> {
        let family = self.family;
        let slot_size = self.slot_size;
        self.buffer
            .as_mut()
            .chunks_exact_mut(slot_size)
            .map(move |bytes| Slot { bytes, family })
    }
}
