//! # fabric - in-process software RDMA provider
//!
//! This crate provides a verbs-like provider API backed by an in-process
//! software fabric. Every device opened on the same [`Fabric`] can reach every
//! other one; data movement is a memory copy between registered regions and
//! outcomes are delivered through completion queues, exactly as a hardware
//! provider would deliver them.
//!
//! ## Design Philosophy
//!
//! ### Queue-Centric Model
//!
//! - **Send Queue (SQ)**: outbound requests (SEND, RDMA WRITE/READ)
//! - **Receive Queue (RQ)**: inbound receives for a single QP
//! - **Shared Receive Queue (SRQ)**: receive pool shared by multiple QPs
//! - **Completion Queue (CQ)**: completion notifications
//!
//! Posting never blocks. A send whose target has no receive posted is held
//! by the target (receive-not-ready retry) and only completes once the data
//! has landed, so send completions on one QP are always observed in post
//! order.
//!
//! ### Connection Manager
//!
//! [`cm`] mirrors the RDMA connection manager: a passive side listens on an
//! `(address, port)` pair, an active side resolves that pair and connects with
//! up to [`MAX_PRIVATE_DATA`] bytes of private data, and both sides observe
//! `Established`/`Disconnected` events.
//!
//! ### Fault Injection
//!
//! [`Fabric::inject`] queues a [`Fault`] consumed by the next matching
//! operation, so provider failures and failed completions can be exercised
//! without hardware.
//!
//! ## Module Overview
//!
//! - [`device`]: fabric devices and contexts
//! - [`pd`]: protection domains and memory regions
//! - [`cq`]: completion queues
//! - [`qp`]: reliable connected queue pairs
//! - [`srq`]: shared receive queues
//! - [`cm`]: connection manager
//! - [`types`]: work completions, scatter/gather entries, device limits

#![allow(unsafe_op_in_unsafe_fn)]

pub mod cm;
pub mod cq;
pub mod device;
pub mod pd;
pub mod qp;
pub mod srq;
pub mod types;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

pub use cm::{CmEvent, CmId, ConnectRequest, Listener};
pub use cq::CompletionQueue;
pub use device::Context;
pub use pd::{AccessFlags, MemoryRegion, ProtectionDomain};
pub use qp::{QpInitAttr, QpState, QueuePair};
pub use srq::{SharedReceiveQueue, SrqInitAttr};
pub use types::{DeviceAttr, SendFlags, Sge, WcOpcode, WcStatus, WorkCompletion};

/// Maximum private data carried by a connect or accept call.
pub const MAX_PRIVATE_DATA: usize = 56;

/// A failure injected into the next matching fabric operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next queue pair creation fails with the given errno.
    CreateQp(i32),
    /// The next completion queue creation fails with the given errno.
    CreateCq(i32),
    /// The next memory registration fails with the given errno.
    RegMr(i32),
    /// The next connect call fails with the given errno.
    Connect(i32),
    /// The next send-queue operation completes with the given status.
    SendStatus(WcStatus),
    /// The next landed receive completes with the given status.
    RecvStatus(WcStatus),
}

impl Fault {
    fn same_kind(&self, other: &Fault) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Registered memory, looked up by key on every access.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionEntry {
    pub(crate) addr: u64,
    pub(crate) len: u64,
    pub(crate) access: AccessFlags,
}

impl RegionEntry {
    fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.addr && end <= self.addr + self.len,
            None => false,
        }
    }
}

pub(crate) struct FabricInner {
    calls: AtomicU64,
    next_qpn: AtomicU32,
    next_key: AtomicU32,
    regions: Mutex<HashMap<u32, RegionEntry>>,
    faults: Mutex<VecDeque<Fault>>,
    listeners: Mutex<HashMap<(String, u16), Weak<cm::ListenerInner>>>,
    listeners_changed: Condvar,
}

/// An in-process fabric connecting every device opened on it.
///
/// This type uses `Arc` internally and can be cheaply cloned.
#[derive(Clone)]
pub struct Fabric(Arc<FabricInner>);

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric {
    /// Create an empty fabric.
    pub fn new() -> Self {
        Fabric(Arc::new(FabricInner {
            calls: AtomicU64::new(0),
            next_qpn: AtomicU32::new(0x100),
            next_key: AtomicU32::new(0x1000),
            regions: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(HashMap::new()),
            listeners_changed: Condvar::new(),
        }))
    }

    /// Number of provider calls performed so far.
    ///
    /// Every verb that touches fabric state (resource creation, posting,
    /// connection management) counts as one call.
    pub fn calls(&self) -> u64 {
        self.0.calls.load(Ordering::Relaxed)
    }

    /// Queue a fault for the next matching operation.
    pub fn inject(&self, fault: Fault) {
        self.0.faults.lock().push_back(fault);
    }

    /// Drop all pending faults.
    pub fn clear_faults(&self) {
        self.0.faults.lock().clear();
    }

    pub(crate) fn record_call(&self) {
        self.0.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the first pending fault of the same kind as `probe`.
    pub(crate) fn take_fault(&self, probe: Fault) -> Option<Fault> {
        let mut faults = self.0.faults.lock();
        let idx = faults.iter().position(|f| f.same_kind(&probe))?;
        faults.remove(idx)
    }

    pub(crate) fn take_errno_fault(&self, probe: Fault) -> io::Result<()> {
        match self.take_fault(probe) {
            Some(Fault::CreateQp(errno))
            | Some(Fault::CreateCq(errno))
            | Some(Fault::RegMr(errno))
            | Some(Fault::Connect(errno)) => Err(io::Error::from_raw_os_error(errno)),
            _ => Ok(()),
        }
    }

    pub(crate) fn take_status_fault(&self, probe: Fault) -> Option<WcStatus> {
        match self.take_fault(probe) {
            Some(Fault::SendStatus(status)) | Some(Fault::RecvStatus(status)) => Some(status),
            _ => None,
        }
    }

    pub(crate) fn next_qpn(&self) -> u32 {
        self.0.next_qpn.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF
    }

    pub(crate) fn insert_region(&self, addr: u64, len: u64, access: AccessFlags) -> u32 {
        let key = self.0.next_key.fetch_add(1, Ordering::Relaxed);
        self.0
            .regions
            .lock()
            .insert(key, RegionEntry { addr, len, access });
        key
    }

    pub(crate) fn remove_region(&self, key: u32) {
        self.0.regions.lock().remove(&key);
    }

    /// Check that `[addr, addr + len)` lies in the region `key` with `access`.
    pub(crate) fn check_region(
        &self,
        key: u32,
        addr: u64,
        len: u64,
        access: AccessFlags,
    ) -> Result<(), WcStatus> {
        let regions = self.0.regions.lock();
        let entry = regions.get(&key).ok_or(WcStatus::LocProtErr)?;
        if !entry.contains(addr, len) || !entry.access.contains(access) {
            return Err(WcStatus::LocProtErr);
        }
        Ok(())
    }
}
