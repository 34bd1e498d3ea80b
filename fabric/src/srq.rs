//! Shared Receive Queue (SRQ) management.
//!
//! An SRQ holds one pool of receives consumed by every QP attached to it.
//! A receive completion is reported on the receive CQ of the QP the message
//! was addressed to, and its `qp_num` names that QP.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::pd::ProtectionDomain;
use crate::qp::{Inbound, Landed, QpInner, land};
use crate::types::{Sge, WcStatus};

/// SRQ creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrqInitAttr {
    /// Maximum outstanding receives.
    pub max_wr: u32,
    /// Maximum scatter/gather entries per receive.
    pub max_sge: u32,
}

impl Default for SrqInitAttr {
    fn default() -> Self {
        Self {
            max_wr: 1024,
            max_sge: 1,
        }
    }
}

struct SrqShared {
    posted: VecDeque<(u64, Option<Sge>)>,
    backlog: VecDeque<(Weak<QpInner>, Inbound)>,
}

pub(crate) struct SrqInner {
    pd: ProtectionDomain,
    attr: SrqInitAttr,
    shared: Mutex<SrqShared>,
}

/// Shared Receive Queue.
///
/// This type uses `Arc` internally and can be cheaply cloned.
#[derive(Clone)]
pub struct SharedReceiveQueue(Arc<SrqInner>);

impl ProtectionDomain {
    /// Create a Shared Receive Queue.
    ///
    /// # Errors
    /// `EINVAL` if `max_wr` is zero or above the device limit.
    pub fn create_srq(&self, attr: &SrqInitAttr) -> io::Result<SharedReceiveQueue> {
        self.context().fabric().record_call();
        let limits = self.context().query_device();
        if attr.max_wr == 0 || attr.max_wr > limits.max_srq_wr || attr.max_sge > limits.max_sge {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(SharedReceiveQueue(Arc::new(SrqInner {
            pd: self.clone(),
            attr: *attr,
            shared: Mutex::new(SrqShared {
                posted: VecDeque::new(),
                backlog: VecDeque::new(),
            }),
        })))
    }
}

impl SharedReceiveQueue {
    /// The protection domain this SRQ was created in.
    pub fn pd(&self) -> &ProtectionDomain {
        &self.0.pd
    }

    /// Maximum outstanding receives.
    pub fn max_wr(&self) -> u32 {
        self.0.attr.max_wr
    }

    /// Number of receives currently posted.
    pub fn posted(&self) -> usize {
        self.0.shared.lock().posted.len()
    }

    /// Post a receive to the shared pool.
    ///
    /// # Errors
    /// `ENOMEM` if the pool is full.
    pub fn post_recv(&self, wr_id: u64, sge: Option<Sge>) -> io::Result<()> {
        self.0.pd.context().fabric().record_call();
        let mut dropped = Vec::new();
        let landed = {
            let mut shared = self.0.shared.lock();
            let mut landed = None;
            while let Some((target, inbound)) = shared.backlog.pop_front() {
                match target.upgrade() {
                    Some(target) => {
                        landed = Some((land(&target, wr_id, sge, inbound), target));
                        break;
                    }
                    None => dropped.push(inbound),
                }
            }
            if landed.is_none() {
                if shared.posted.len() >= self.0.attr.max_wr as usize {
                    return Err(io::Error::from_raw_os_error(libc::ENOMEM));
                }
                shared.posted.push_back((wr_id, sge));
            }
            landed
        };
        for inbound in dropped {
            if let Some(sender) = inbound.sender.upgrade() {
                sender.complete_send(inbound.seq, WcStatus::RemOpErr);
            }
        }
        if let Some((landed, target)) = landed {
            landed.finish(&target);
        }
        Ok(())
    }

    pub(crate) fn deliver(&self, target: &Arc<QpInner>, inbound: Inbound) {
        let landed: Option<Landed> = {
            let mut shared = self.0.shared.lock();
            match shared.posted.pop_front() {
                Some((wr_id, sge)) => Some(land(target, wr_id, sge, inbound)),
                None => {
                    log::trace!(
                        "SRQ empty, holding message for QP 0x{:x}",
                        target.qpn()
                    );
                    shared.backlog.push_back((Arc::downgrade(target), inbound));
                    None
                }
            }
        };
        if let Some(landed) = landed {
            landed.finish(target);
        }
    }
}
