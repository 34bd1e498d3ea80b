//! Memory registration and descriptor exchange.
//!
//! A [`LocalMemoryRegion`] registers a local byte range for a declared set of
//! [`Usage`]s. Its [`Descriptor`] is a fixed 21-byte little-endian record
//! that can travel to the peer (usually inside the handshake private data),
//! where it becomes a [`RemoteMemoryRegion`]: an opaque capability that is
//! only ever used to address remote memory through the fabric.

use bitflags::bitflags;
use fabric::{AccessFlags, MemoryRegion, Sge};

use crate::error::{Error, Result};

bitflags! {
    /// Intended uses of a registered region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Usage: u8 {
        /// Source of remote reads.
        const READ_SRC = 1 << 0;
        /// Destination of local reads from a remote region.
        const READ_DST = 1 << 1;
        /// Source of local writes to a remote region.
        const WRITE_SRC = 1 << 2;
        /// Destination of remote writes.
        const WRITE_DST = 1 << 3;
        /// Source of sends.
        const SEND = 1 << 4;
        /// Destination of receives.
        const RECV = 1 << 5;
        /// Remote flushes make data globally visible.
        const FLUSH_TYPE_VISIBILITY = 1 << 6;
        /// Remote flushes make data persistent.
        const FLUSH_TYPE_PERSISTENT = 1 << 7;
    }
}

impl Usage {
    pub(crate) fn access_flags(self) -> AccessFlags {
        let mut access = AccessFlags::empty();
        if self.contains(Usage::READ_SRC) {
            access |= AccessFlags::REMOTE_READ;
        }
        if self.intersects(Usage::READ_DST | Usage::RECV) {
            access |= AccessFlags::LOCAL_WRITE;
        }
        if self.contains(Usage::WRITE_DST) {
            access |= AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        }
        // Flushes are carried out through remote reads.
        if self.contains(Usage::FLUSH_TYPE_VISIBILITY) {
            access |= AccessFlags::REMOTE_READ | AccessFlags::FLUSH_GLOBAL;
        }
        if self.contains(Usage::FLUSH_TYPE_PERSISTENT) {
            access |= AccessFlags::REMOTE_READ | AccessFlags::FLUSH_PERSISTENT;
        }
        access
    }
}

/// Durability a remote flush provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Data is visible to the remote CPU but may be lost on power failure.
    Visibility,
    /// Data reached the persistence domain.
    Persistent,
}

impl FlushType {
    fn of(usage: Usage) -> Option<FlushType> {
        if usage.contains(Usage::FLUSH_TYPE_PERSISTENT) {
            Some(FlushType::Persistent)
        } else if usage.contains(Usage::FLUSH_TYPE_VISIBILITY) {
            Some(FlushType::Visibility)
        } else {
            None
        }
    }
}

/// Size of a serialized [`Descriptor`].
pub const DESCRIPTOR_SIZE: usize = 21;

/// Wire projection of a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u64,
    pub rkey: u32,
    pub usage: Usage,
}

impl Descriptor {
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..16].copy_from_slice(&self.len.to_le_bytes());
        out[16..20].copy_from_slice(&self.rkey.to_le_bytes());
        out[20] = self.usage.bits();
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DESCRIPTOR_SIZE {
            return Err(Error::Protocol(format!(
                "descriptor must be {} bytes, got {}",
                DESCRIPTOR_SIZE,
                bytes.len()
            )));
        }
        let usage = Usage::from_bits(bytes[20])
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Protocol(format!("invalid usage bits {:#x}", bytes[20])))?;
        let mut addr = [0u8; 8];
        let mut len = [0u8; 8];
        let mut rkey = [0u8; 4];
        addr.copy_from_slice(&bytes[0..8]);
        len.copy_from_slice(&bytes[8..16]);
        rkey.copy_from_slice(&bytes[16..20]);
        let desc = Descriptor {
            addr: u64::from_le_bytes(addr),
            len: u64::from_le_bytes(len),
            rkey: u32::from_le_bytes(rkey),
            usage,
        };
        if desc.addr.checked_add(desc.len).is_none() {
            return Err(Error::Protocol(format!(
                "descriptor range {:#x}+{:#x} wraps the address space",
                desc.addr, desc.len
            )));
        }
        Ok(desc)
    }
}

/// A local byte range registered with the fabric.
pub struct LocalMemoryRegion {
    mr: MemoryRegion,
    usage: Usage,
}

impl LocalMemoryRegion {
    pub(crate) fn new(mr: MemoryRegion, usage: Usage) -> Self {
        Self { mr, usage }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mr.addr()
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.mr.len()
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// The descriptor a peer needs to address this region.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            addr: self.mr.addr() as u64,
            len: self.mr.len() as u64,
            rkey: self.mr.rkey(),
            usage: self.usage,
        }
    }

    /// Scatter/gather entry for `[offset, offset + len)`; `None` when empty.
    pub(crate) fn sge(&self, offset: usize, len: usize) -> Result<Option<Sge>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => {}
            _ => return Err(Error::InvalidArgument("range outside local region")),
        }
        if len == 0 {
            return Ok(None);
        }
        let length =
            u32::try_from(len).map_err(|_| Error::ResourceExhausted("work request too large"))?;
        Ok(Some(Sge {
            addr: self.mr.addr() as u64 + offset as u64,
            length,
            lkey: self.mr.lkey(),
        }))
    }
}

/// A peer's region, usable only as the target of fabric operations.
#[derive(Debug, Clone)]
pub struct RemoteMemoryRegion {
    desc: Descriptor,
}

impl RemoteMemoryRegion {
    pub fn from_descriptor(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            desc: Descriptor::from_bytes(bytes)?,
        })
    }

    pub fn len(&self) -> u64 {
        self.desc.len
    }

    pub fn is_empty(&self) -> bool {
        self.desc.len == 0
    }

    pub fn usage(&self) -> Usage {
        self.desc.usage
    }

    /// The flush guarantee the owner declared, if any.
    pub fn flush_type(&self) -> Option<FlushType> {
        FlushType::of(self.desc.usage)
    }

    /// Remote address and key of `[offset, offset + len)`.
    pub(crate) fn target(&self, offset: u64, len: u64) -> Result<(u64, u32)> {
        let addr = offset
            .checked_add(len)
            .filter(|&end| end <= self.desc.len)
            .and_then(|_| self.desc.addr.checked_add(offset))
            .ok_or(Error::InvalidArgument("range outside remote region"))?;
        Ok((addr, self.desc.rkey))
    }
}
