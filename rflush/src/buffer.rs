//! Registered message buffers.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::mr::{LocalMemoryRegion, Usage};
use crate::peer::Peer;
use crate::protocol::{MSG_SIZE_MAX, RECV_OFFSET, SEND_OFFSET};

const PAGE_SIZE: usize = 4096;

/// Zeroed, page-aligned heap memory.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain owned memory.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("buffer size must be non-zero"));
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| Error::ResourceExhausted("buffer size too large"))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::ResourceExhausted("out of memory"))?;
        Ok(Self { ptr, layout })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Tag marking work requests posted through a [`MessageBuffer`].
const WR_TAG: u64 = 0xF1 << 56;
const SLOT_MASK: u64 = (1 << 48) - 1;

/// Direction of a slot's work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Send,
    Recv,
}

/// Work request id of `slot`'s send or receive.
pub fn wr_id(slot: usize, kind: SlotKind) -> u64 {
    WR_TAG | ((slot as u64) << 1) | (kind == SlotKind::Recv) as u64
}

/// Inverse of [`wr_id`]; `None` for foreign work requests.
pub fn parse_wr_id(wr_id: u64) -> Option<(usize, SlotKind)> {
    if wr_id & !SLOT_MASK != WR_TAG {
        return None;
    }
    let kind = if wr_id & 1 == 1 {
        SlotKind::Recv
    } else {
        SlotKind::Send
    };
    Some((((wr_id & SLOT_MASK) >> 1) as usize, kind))
}

/// A registered buffer of `slots` message slots, each with a send and a
/// receive area of [`MSG_SIZE_MAX`] bytes.
pub struct MessageBuffer {
    // Deregistered before the memory is released.
    mr: LocalMemoryRegion,
    buf: AlignedBuffer,
    slots: usize,
}

impl MessageBuffer {
    pub fn new(peer: &Peer, slots: usize) -> Result<Self> {
        if slots == 0 {
            return Err(Error::InvalidArgument("slots must be non-zero"));
        }
        let size = slots
            .checked_mul(2 * MSG_SIZE_MAX)
            .ok_or(Error::ResourceExhausted("too many slots"))?;
        let buf = AlignedBuffer::new(size)?;
        // SAFETY: buf outlives mr (field order) and is only touched through
        // slot accessors.
        let mr = unsafe { peer.register(buf.as_ptr(), buf.len(), Usage::SEND | Usage::RECV)? };
        Ok(Self { mr, buf, slots })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn mr(&self) -> &LocalMemoryRegion {
        &self.mr
    }

    pub fn send_offset(&self, slot: usize) -> usize {
        slot * 2 * MSG_SIZE_MAX + SEND_OFFSET
    }

    pub fn recv_offset(&self, slot: usize) -> usize {
        slot * 2 * MSG_SIZE_MAX + RECV_OFFSET
    }

    /// Send area of `slot`.
    ///
    /// Must not be written while a send from this slot is outstanding.
    pub(crate) fn send_area(&mut self, slot: usize) -> &mut [u8] {
        let offset = self.send_offset(slot);
        // SAFETY: the area lies inside buf; &mut self keeps it exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.buf.as_ptr().add(offset), MSG_SIZE_MAX) }
    }

    /// First `len` bytes of the receive area of `slot`.
    pub(crate) fn recv_area(&self, slot: usize, len: usize) -> &[u8] {
        let offset = self.recv_offset(slot);
        let len = len.min(MSG_SIZE_MAX);
        // SAFETY: the area lies inside buf and its receive has completed.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr().add(offset), len) }
    }
}
