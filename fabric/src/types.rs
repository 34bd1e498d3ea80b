//! Work completions, scatter/gather entries and device limits.

use std::fmt;

use bitflags::bitflags;

/// Maximum outstanding work requests per queue.
pub const MAX_QP_WR: u32 = 16384;
/// Maximum entries in one completion queue.
pub const MAX_CQE: u32 = 65536;
/// Maximum scatter/gather entries per work request.
pub const MAX_SGE: u32 = 4;
/// Maximum inline payload of a send.
pub const MAX_INLINE_DATA: u32 = 256;

/// Device attributes reported by [`Context::query_device`](crate::Context::query_device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAttr {
    /// Maximum outstanding work requests per queue.
    pub max_qp_wr: u32,
    /// Maximum entries in one completion queue.
    pub max_cqe: u32,
    /// Maximum scatter/gather entries per work request.
    pub max_sge: u32,
    /// Maximum inline payload of a send.
    pub max_inline_data: u32,
    /// Maximum outstanding receives on a shared receive queue.
    pub max_srq_wr: u32,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            max_qp_wr: MAX_QP_WR,
            max_cqe: MAX_CQE,
            max_sge: MAX_SGE,
            max_inline_data: MAX_INLINE_DATA,
            max_srq_wr: MAX_QP_WR,
        }
    }
}

/// Completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    /// Operation completed successfully.
    Success,
    /// Local length error (receive buffer too small).
    LocLenErr,
    /// Local protection error (key, range or access mismatch).
    LocProtErr,
    /// Work request flushed because the queue pair entered the error state.
    WrFlushErr,
    /// Remote access error (remote key, range or access mismatch).
    RemAccessErr,
    /// Remote operation error (remote queue pair unable to complete).
    RemOpErr,
    /// Transport retry counter exceeded (remote unreachable).
    RetryExcErr,
    /// Receiver-not-ready retry counter exceeded.
    RnrRetryExcErr,
    /// Unspecified error.
    GeneralErr,
}

impl WcStatus {
    /// Returns true for [`WcStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }

    /// Human-readable status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            WcStatus::Success => "success",
            WcStatus::LocLenErr => "local length error",
            WcStatus::LocProtErr => "local protection error",
            WcStatus::WrFlushErr => "Work Request Flushed Error",
            WcStatus::RemAccessErr => "remote access error",
            WcStatus::RemOpErr => "remote operation error",
            WcStatus::RetryExcErr => "transport retry counter exceeded",
            WcStatus::RnrRetryExcErr => "RNR retry counter exceeded",
            WcStatus::GeneralErr => "general error",
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation kind of a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcOpcode {
    /// Two-sided send (requester side).
    Send,
    /// One-sided RDMA write.
    RdmaWrite,
    /// One-sided RDMA read.
    RdmaRead,
    /// Two-sided receive (responder side).
    Recv,
}

/// Work completion delivered exactly once per completed work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// User-defined context supplied when the request was posted.
    pub wr_id: u64,
    /// Completion status.
    pub status: WcStatus,
    /// Operation kind.
    pub opcode: WcOpcode,
    /// Bytes landed (receives and reads).
    pub byte_len: u32,
    /// Number of the local queue pair the request belongs to.
    pub qp_num: u32,
}

/// Scatter/gather entry referencing registered local memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Start address.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key of the memory region containing the range.
    pub lkey: u32,
}

bitflags! {
    /// Send work request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        /// Generate a completion on success (errors always complete).
        const SIGNALED = 1 << 0;
        /// Copy the payload into the work request at post time.
        const INLINE = 1 << 1;
    }
}
