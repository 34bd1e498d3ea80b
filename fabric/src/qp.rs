//! Reliable connected Queue Pair (QP) management.
//!
//! A QP is created through a [`CmId`](crate::CmId) and becomes ready to send
//! once the connection is accepted. Send-queue work requests complete in post
//! order: a send whose target has no receive posted stays outstanding (and
//! holds back every later completion on the same QP) until a receive is
//! posted, the target fails, or the QP is flushed.
//!
//! Any failed completion moves the QP to [`QpState::Error`]. Outstanding
//! receives are then flushed with [`WcStatus::WrFlushErr`] and later posts are
//! refused.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ptr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cq::CompletionQueue;
use crate::pd::{AccessFlags, ProtectionDomain};
use crate::srq::SharedReceiveQueue;
use crate::types::{MAX_INLINE_DATA, MAX_QP_WR, MAX_SGE, SendFlags, Sge, WcOpcode, WcStatus, WorkCompletion};
use crate::Fault;

/// QP capacities requested at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    /// Maximum outstanding send-queue work requests.
    pub max_send_wr: u32,
    /// Maximum outstanding receives (ignored when an SRQ is attached).
    pub max_recv_wr: u32,
    /// Maximum scatter/gather entries per send work request.
    pub max_send_sge: u32,
    /// Maximum scatter/gather entries per receive work request.
    pub max_recv_sge: u32,
    /// Maximum inline payload.
    pub max_inline_data: u32,
}

impl Default for QpInitAttr {
    fn default() -> Self {
        Self {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

/// QP state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Created, receives may be posted.
    Init,
    /// Connected and ready to send.
    Rts,
    /// Failed or disconnected; every post is refused.
    Error,
}

/// A two-sided send in flight towards a receive queue.
pub(crate) struct Inbound {
    pub(crate) data: Vec<u8>,
    pub(crate) sender: Weak<QpInner>,
    pub(crate) seq: u64,
}

struct SqEntry {
    seq: u64,
    wr_id: u64,
    opcode: WcOpcode,
    signaled: bool,
    byte_len: u32,
    done: Option<WcStatus>,
}

struct QpShared {
    state: QpState,
    remote: Weak<QpInner>,
    next_seq: u64,
    sq: VecDeque<SqEntry>,
    rq: VecDeque<(u64, Option<Sge>)>,
    backlog: VecDeque<Inbound>,
}

pub(crate) struct QpInner {
    qpn: u32,
    pd: ProtectionDomain,
    send_cq: CompletionQueue,
    recv_cq: CompletionQueue,
    srq: Option<SharedReceiveQueue>,
    cap: QpInitAttr,
    shared: Mutex<QpShared>,
}

/// Reliable connected Queue Pair.
///
/// This type uses `Arc` internally and can be cheaply cloned.
#[derive(Clone)]
pub struct QueuePair(Arc<QpInner>);

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("qpn", &self.0.qpn)
            .field("state", &self.0.shared.lock().state)
            .field("srq", &self.0.srq.is_some())
            .finish()
    }
}

/// Outcome of a receive landing, applied after the receiving lock is released.
pub(crate) struct Landed {
    pub(crate) sender: Weak<QpInner>,
    pub(crate) seq: u64,
    pub(crate) sender_status: WcStatus,
    pub(crate) recv_failed: bool,
}

impl Landed {
    pub(crate) fn finish(self, receiver: &QpInner) {
        if self.recv_failed {
            receiver.set_error();
        }
        if let Some(sender) = self.sender.upgrade() {
            sender.complete_send(self.seq, self.sender_status);
        }
    }
}

fn os_err(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

impl QueuePair {
    pub(crate) fn create(
        pd: &ProtectionDomain,
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
        srq: Option<&SharedReceiveQueue>,
        attr: &QpInitAttr,
    ) -> io::Result<QueuePair> {
        let fabric = pd.context().fabric();
        fabric.record_call();
        if attr.max_send_wr == 0
            || attr.max_send_wr > MAX_QP_WR
            || attr.max_recv_wr > MAX_QP_WR
            || (srq.is_none() && attr.max_recv_wr == 0)
            || attr.max_send_sge > MAX_SGE
            || attr.max_recv_sge > MAX_SGE
            || attr.max_inline_data > MAX_INLINE_DATA
        {
            return Err(os_err(libc::EINVAL));
        }
        if !send_cq.context().ptr_eq(pd.context()) || !recv_cq.context().ptr_eq(pd.context()) {
            return Err(os_err(libc::EINVAL));
        }
        if let Some(srq) = srq
            && !srq.pd().ptr_eq(pd)
        {
            return Err(os_err(libc::EINVAL));
        }
        fabric.take_errno_fault(Fault::CreateQp(0))?;

        let qpn = fabric.next_qpn();
        log::trace!("created QP 0x{:x} on {}", qpn, pd.context().addr());
        Ok(QueuePair(Arc::new(QpInner {
            qpn,
            pd: pd.clone(),
            send_cq: send_cq.clone(),
            recv_cq: recv_cq.clone(),
            srq: srq.cloned(),
            cap: *attr,
            shared: Mutex::new(QpShared {
                state: QpState::Init,
                remote: Weak::new(),
                next_seq: 0,
                sq: VecDeque::new(),
                rq: VecDeque::new(),
                backlog: VecDeque::new(),
            }),
        })))
    }

    /// Returns the QP number.
    pub fn qpn(&self) -> u32 {
        self.0.qpn
    }

    /// Returns the current QP state.
    pub fn state(&self) -> QpState {
        self.0.shared.lock().state
    }

    /// Returns the capacities the QP was created with.
    pub fn cap(&self) -> QpInitAttr {
        self.0.cap
    }

    /// Returns the send completion queue.
    pub fn send_cq(&self) -> &CompletionQueue {
        &self.0.send_cq
    }

    /// Returns the receive completion queue.
    pub fn recv_cq(&self) -> &CompletionQueue {
        &self.0.recv_cq
    }

    /// Returns the attached shared receive queue, if any.
    pub fn srq(&self) -> Option<&SharedReceiveQueue> {
        self.0.srq.as_ref()
    }

    /// Post a receive.
    ///
    /// `sge` may be `None` for zero-length messages.
    ///
    /// # Errors
    /// `EINVAL` if an SRQ is attached or the QP is in the error state,
    /// `ENOMEM` if the receive queue is full.
    pub fn post_recv(&self, wr_id: u64, sge: Option<Sge>) -> io::Result<()> {
        self.0.pd.context().fabric().record_call();
        if self.0.srq.is_some() {
            return Err(os_err(libc::EINVAL));
        }
        let landed = {
            let mut shared = self.0.shared.lock();
            if shared.state == QpState::Error {
                return Err(os_err(libc::EINVAL));
            }
            match shared.backlog.pop_front() {
                Some(inbound) => Some(land(&self.0, wr_id, sge, inbound)),
                None => {
                    if shared.rq.len() >= self.0.cap.max_recv_wr as usize {
                        return Err(os_err(libc::ENOMEM));
                    }
                    shared.rq.push_back((wr_id, sge));
                    None
                }
            }
        };
        if let Some(landed) = landed {
            landed.finish(&self.0);
        }
        Ok(())
    }

    /// Post a two-sided send.
    ///
    /// The payload is captured at post time.
    ///
    /// # Errors
    /// `EINVAL` if the QP is not ready to send or the inline payload is too
    /// large, `ENOMEM` if the send queue is full.
    pub fn post_send(&self, wr_id: u64, sge: Option<Sge>, flags: SendFlags) -> io::Result<()> {
        let len = sge.map_or(0, |s| s.length);
        if flags.contains(SendFlags::INLINE) && len > self.0.cap.max_inline_data {
            return Err(os_err(libc::EINVAL));
        }
        let seq = self.0.begin(wr_id, WcOpcode::Send, flags, 0)?;
        let fabric = self.0.pd.context().fabric();

        if let Some(status) = fabric.take_status_fault(Fault::SendStatus(WcStatus::Success)) {
            self.0.complete_send(seq, status);
            return Ok(());
        }
        let data = match sge {
            Some(sge) => {
                if !flags.contains(SendFlags::INLINE)
                    && let Err(status) = fabric.check_region(
                        sge.lkey,
                        sge.addr,
                        sge.length as u64,
                        AccessFlags::empty(),
                    )
                {
                    self.0.complete_send(seq, status);
                    return Ok(());
                }
                let mut data = vec![0u8; sge.length as usize];
                // SAFETY: the range was registered, or supplied inline by the caller.
                unsafe {
                    ptr::copy_nonoverlapping(
                        sge.addr as *const u8,
                        data.as_mut_ptr(),
                        data.len(),
                    );
                }
                data
            }
            None => Vec::new(),
        };

        let Some(target) = self.0.remote() else {
            self.0.complete_send(seq, WcStatus::RetryExcErr);
            return Ok(());
        };
        target.deliver(Inbound {
            data,
            sender: Arc::downgrade(&self.0),
            seq,
        });
        Ok(())
    }

    /// Post an RDMA write of `local` to `remote_addr` in the region `rkey`.
    pub fn post_write(
        &self,
        wr_id: u64,
        local: Sge,
        remote_addr: u64,
        rkey: u32,
        flags: SendFlags,
    ) -> io::Result<()> {
        let seq = self.0.begin(wr_id, WcOpcode::RdmaWrite, flags, 0)?;
        let status = self.one_sided(local, remote_addr, rkey, true);
        self.0.complete_send(seq, status);
        Ok(())
    }

    /// Post an RDMA read of `remote_addr` in the region `rkey` into `local`.
    pub fn post_read(
        &self,
        wr_id: u64,
        local: Sge,
        remote_addr: u64,
        rkey: u32,
        flags: SendFlags,
    ) -> io::Result<()> {
        let seq = self.0.begin(wr_id, WcOpcode::RdmaRead, flags, local.length)?;
        let status = self.one_sided(local, remote_addr, rkey, false);
        self.0.complete_send(seq, status);
        Ok(())
    }

    fn one_sided(&self, local: Sge, remote_addr: u64, rkey: u32, write: bool) -> WcStatus {
        let fabric = self.0.pd.context().fabric();
        if let Some(status) = fabric.take_status_fault(Fault::SendStatus(WcStatus::Success)) {
            return status;
        }
        let len = local.length as u64;
        let (local_access, remote_access) = if write {
            (AccessFlags::empty(), AccessFlags::REMOTE_WRITE)
        } else {
            (AccessFlags::LOCAL_WRITE, AccessFlags::REMOTE_READ)
        };
        if let Err(status) = fabric.check_region(local.lkey, local.addr, len, local_access) {
            return status;
        }
        if self.0.remote().is_none() {
            return WcStatus::RetryExcErr;
        }
        if fabric
            .check_region(rkey, remote_addr, len, remote_access)
            .is_err()
        {
            return WcStatus::RemAccessErr;
        }
        let (src, dst) = if write {
            (local.addr, remote_addr)
        } else {
            (remote_addr, local.addr)
        };
        // SAFETY: both ranges lie in live registered regions.
        unsafe {
            ptr::copy(src as *const u8, dst as *mut u8, len as usize);
        }
        WcStatus::Success
    }

    /// Move the QP to the error state, flushing outstanding work.
    pub fn set_error(&self) {
        self.0.set_error();
    }

    pub(crate) fn establish(&self, remote: &QueuePair) {
        let mut shared = self.0.shared.lock();
        if shared.state == QpState::Init {
            shared.remote = Arc::downgrade(&remote.0);
            shared.state = QpState::Rts;
        }
    }
}

impl QpInner {
    pub(crate) fn qpn(&self) -> u32 {
        self.qpn
    }

    pub(crate) fn fabric(&self) -> &crate::Fabric {
        self.pd.context().fabric()
    }

    fn remote(&self) -> Option<Arc<QpInner>> {
        self.shared.lock().remote.upgrade()
    }

    /// Reserve a send-queue slot for a new work request.
    fn begin(&self, wr_id: u64, opcode: WcOpcode, flags: SendFlags, byte_len: u32) -> io::Result<u64> {
        self.fabric().record_call();
        let mut shared = self.shared.lock();
        if shared.state != QpState::Rts {
            return Err(os_err(libc::EINVAL));
        }
        if shared.sq.len() >= self.cap.max_send_wr as usize {
            return Err(os_err(libc::ENOMEM));
        }
        let seq = shared.next_seq;
        shared.next_seq += 1;
        shared.sq.push_back(SqEntry {
            seq,
            wr_id,
            opcode,
            signaled: flags.contains(SendFlags::SIGNALED),
            byte_len,
            done: None,
        });
        Ok(seq)
    }

    /// Record the outcome of send-queue entry `seq` and publish the completed
    /// prefix of the send queue.
    pub(crate) fn complete_send(&self, seq: u64, status: WcStatus) {
        let failed = {
            let mut shared = self.shared.lock();
            let Some(entry) = shared.sq.iter_mut().find(|e| e.seq == seq) else {
                return;
            };
            entry.done = Some(status);
            while let Some(status) = shared.sq.front().and_then(|e| e.done) {
                let Some(entry) = shared.sq.pop_front() else {
                    break;
                };
                if entry.signaled || !status.is_success() {
                    self.send_cq.push(WorkCompletion {
                        wr_id: entry.wr_id,
                        status,
                        opcode: entry.opcode,
                        byte_len: entry.byte_len,
                        qp_num: self.qpn,
                    });
                }
            }
            !status.is_success()
        };
        if failed {
            log::debug!("QP 0x{:x}: send queue entry failed: {}", self.qpn, status);
            self.set_error();
        }
    }

    /// Deliver a send to this QP's receive queue.
    fn deliver(self: &Arc<Self>, inbound: Inbound) {
        if let Some(srq) = &self.srq {
            srq.deliver(self, inbound);
            return;
        }
        let landed = {
            let mut shared = self.shared.lock();
            if shared.state == QpState::Error {
                Some(Landed {
                    sender: inbound.sender,
                    seq: inbound.seq,
                    sender_status: WcStatus::RemOpErr,
                    recv_failed: false,
                })
            } else {
                match shared.rq.pop_front() {
                    Some((wr_id, sge)) => Some(land(self, wr_id, sge, inbound)),
                    None => {
                        shared.backlog.push_back(inbound);
                        None
                    }
                }
            }
        };
        if let Some(landed) = landed {
            landed.finish(self);
        }
    }

    pub(crate) fn set_error(&self) {
        let stranded = {
            let mut shared = self.shared.lock();
            if shared.state == QpState::Error {
                return;
            }
            shared.state = QpState::Error;
            for (wr_id, _) in shared.rq.drain(..) {
                self.recv_cq.push(WorkCompletion {
                    wr_id,
                    status: WcStatus::WrFlushErr,
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                    qp_num: self.qpn,
                });
            }
            for entry in shared.sq.drain(..) {
                let status = entry.done.unwrap_or(WcStatus::WrFlushErr);
                if entry.signaled || !status.is_success() {
                    self.send_cq.push(WorkCompletion {
                        wr_id: entry.wr_id,
                        status,
                        opcode: entry.opcode,
                        byte_len: entry.byte_len,
                        qp_num: self.qpn,
                    });
                }
            }
            shared.backlog.drain(..).collect::<Vec<_>>()
        };
        log::debug!("QP 0x{:x} moved to error state", self.qpn);
        for inbound in stranded {
            if let Some(sender) = inbound.sender.upgrade() {
                sender.complete_send(inbound.seq, WcStatus::RemOpErr);
            }
        }
    }
}

impl Drop for QpInner {
    fn drop(&mut self) {
        let stranded: Vec<_> = self.shared.get_mut().backlog.drain(..).collect();
        for inbound in stranded {
            if let Some(sender) = inbound.sender.upgrade() {
                sender.complete_send(inbound.seq, WcStatus::RemOpErr);
            }
        }
        log::trace!("destroyed QP 0x{:x}", self.qpn);
    }
}

/// Copy `inbound` into the receive `(wr_id, sge)` of `receiver` and publish
/// the receive completion.
pub(crate) fn land(receiver: &QpInner, wr_id: u64, sge: Option<Sge>, inbound: Inbound) -> Landed {
    let fabric = receiver.fabric();
    let len = inbound.data.len();
    let mut status = match sge {
        _ if len == 0 => WcStatus::Success,
        None => WcStatus::LocLenErr,
        Some(sge) if (sge.length as usize) < len => WcStatus::LocLenErr,
        Some(sge) => match fabric.check_region(sge.lkey, sge.addr, len as u64, AccessFlags::LOCAL_WRITE) {
            Ok(()) => {
                // SAFETY: the destination lies in a live region registered for local write.
                unsafe {
                    ptr::copy_nonoverlapping(inbound.data.as_ptr(), sge.addr as *mut u8, len);
                }
                WcStatus::Success
            }
            Err(status) => status,
        },
    };
    if status.is_success()
        && let Some(injected) = fabric.take_status_fault(Fault::RecvStatus(WcStatus::Success))
    {
        status = injected;
    }
    receiver.recv_cq.push(WorkCompletion {
        wr_id,
        status,
        opcode: WcOpcode::Recv,
        byte_len: len as u32,
        qp_num: receiver.qpn,
    });
    Landed {
        sender: inbound.sender,
        seq: inbound.seq,
        sender_status: if status.is_success() {
            WcStatus::Success
        } else {
            WcStatus::RemOpErr
        },
        recv_failed: !status.is_success(),
    }
}
