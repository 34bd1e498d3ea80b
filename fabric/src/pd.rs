//! Protection Domain and Memory Region management.
//!
//! A Protection Domain (PD) defines a protection scope for fabric resources.
//! Memory Regions (MRs) must be registered within a PD before they can be
//! used in work requests or addressed by a remote peer.

use std::io;
use std::sync::Arc;

use bitflags::bitflags;

use crate::device::Context;
use crate::Fault;

bitflags! {
    /// Memory access flags for Memory Region registration.
    ///
    /// Local read access is always enabled for the MR.
    ///
    /// # Important
    /// If `REMOTE_WRITE` is set, then `LOCAL_WRITE` must also be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Enable local write access.
        const LOCAL_WRITE = 1 << 0;
        /// Enable remote write access.
        /// Requires `LOCAL_WRITE` to be set.
        const REMOTE_WRITE = 1 << 1;
        /// Enable remote read access.
        const REMOTE_READ = 1 << 2;
        /// Enable remote flush operation with global visibility placement type.
        const FLUSH_GLOBAL = 1 << 3;
        /// Enable remote flush operation with persistence placement type.
        const FLUSH_PERSISTENT = 1 << 4;
    }
}

pub(crate) struct PdInner {
    ctx: Context,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        log::trace!("deallocated protection domain on {}", self.ctx.addr());
    }
}

/// Protection Domain for fabric resources.
///
/// All resources that need to work together (QPs, MRs, SRQs) must be created
/// within the same PD. Every resource keeps its PD alive, so the PD is
/// deallocated only after the last resource created in it is gone.
///
/// This type uses `Arc` internally and can be cheaply cloned.
#[derive(Clone)]
pub struct ProtectionDomain(Arc<PdInner>);

impl Context {
    /// Allocate a Protection Domain for this device context.
    pub fn alloc_pd(&self) -> io::Result<ProtectionDomain> {
        self.fabric().record_call();
        Ok(ProtectionDomain(Arc::new(PdInner { ctx: self.clone() })))
    }
}

impl ProtectionDomain {
    /// The device context this PD belongs to.
    pub fn context(&self) -> &Context {
        &self.0.ctx
    }

    /// Register a memory region.
    ///
    /// Registers a memory buffer starting at `addr` with size `len` bytes.
    ///
    /// # Safety
    /// The caller must ensure that:
    /// - The memory pointed to by `addr` with `len` bytes is valid
    /// - The memory remains valid for the lifetime of the returned `MemoryRegion`
    /// - Nothing else accesses the memory while the fabric writes into it
    ///
    /// # Errors
    /// `EINVAL` for a null address, a zero length or `REMOTE_WRITE` without
    /// `LOCAL_WRITE`; any injected registration fault.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        let fabric = self.0.ctx.fabric();
        fabric.record_call();
        if addr.is_null()
            || len == 0
            || (access.contains(AccessFlags::REMOTE_WRITE)
                && !access.contains(AccessFlags::LOCAL_WRITE))
        {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        fabric.take_errno_fault(Fault::RegMr(0))?;

        let key = fabric.insert_region(addr as u64, len as u64, access);
        Ok(MemoryRegion {
            key,
            addr,
            len,
            access,
            pd: self.clone(),
        })
    }

    pub(crate) fn ptr_eq(&self, other: &ProtectionDomain) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Memory Region registered with the fabric.
///
/// An MR provides:
/// - `lkey`: local key used in [`Sge`](crate::Sge) when posting work requests
/// - `rkey`: remote key used by remote peers for RDMA read/write
///
/// The MR is deregistered when dropped.
pub struct MemoryRegion {
    key: u32,
    addr: *mut u8,
    len: usize,
    access: AccessFlags,
    pd: ProtectionDomain,
}

// The region only carries the address; every access goes through the fabric
// key table.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.pd.context().fabric().remove_region(self.key);
    }
}

impl MemoryRegion {
    /// Returns the local key (L_Key) for this memory region.
    pub fn lkey(&self) -> u32 {
        self.key
    }

    /// Returns the remote key (R_Key) for this memory region.
    pub fn rkey(&self) -> u32 {
        self.key
    }

    /// Returns the starting address of the registered memory region.
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Returns the length of the registered memory region in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the access flags the region was registered with.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Returns the protection domain the region was registered in.
    pub fn pd(&self) -> &ProtectionDomain {
        &self.pd
    }
}
