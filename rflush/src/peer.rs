//! Peer: the factory wiring queue pairs and memory registrations to one
//! fabric device.

use fabric::{CmId, CompletionQueue, Context, ProtectionDomain, QpInitAttr, QueuePair, SharedReceiveQueue};

use crate::config::{ConnectionConfig, MAX_SGE};
use crate::error::{Error, Result};
use crate::mr::{LocalMemoryRegion, Usage};

/// A fabric device context plus the protection domain every resource of
/// this peer is created in.
#[derive(Clone)]
pub struct Peer {
    pd: ProtectionDomain,
    ctx: Context,
}

impl Peer {
    pub fn new(ctx: &Context) -> Result<Self> {
        let pd = ctx.alloc_pd().map_err(Error::provider("alloc_pd"))?;
        log::debug!("peer created on {}", ctx.addr());
        Ok(Self {
            pd,
            ctx: ctx.clone(),
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn pd(&self) -> &ProtectionDomain {
        &self.pd
    }

    /// Register `[ptr, ptr + len)` for `usage`.
    ///
    /// # Safety
    /// The range must stay valid, and must not be accessed in ways that race
    /// with the fabric, until the returned region is dropped.
    pub unsafe fn register(&self, ptr: *mut u8, len: usize, usage: Usage) -> Result<LocalMemoryRegion> {
        if ptr.is_null() || len == 0 || usage.is_empty() {
            return Err(Error::InvalidArgument("null pointer, zero length or empty usage"));
        }
        let mr = unsafe { self.pd.register(ptr, len, usage.access_flags()) }
            .map_err(Error::provider("reg_mr"))?;
        Ok(LocalMemoryRegion::new(mr, usage))
    }

    /// Start wiring a queue pair under `cfg`.
    pub fn qp_builder<'a>(&'a self, cfg: &'a ConnectionConfig) -> QpBuilder<'a> {
        QpBuilder {
            peer: self,
            cfg,
            cm_id: None,
            send_cq: None,
            recv_cq: None,
            srq: None,
        }
    }
}

/// Builder for a queue pair wired to caller-supplied completion queues.
#[must_use = "QpBuilder does nothing until build() is called"]
pub struct QpBuilder<'a> {
    peer: &'a Peer,
    cfg: &'a ConnectionConfig,
    cm_id: Option<&'a CmId>,
    send_cq: Option<&'a CompletionQueue>,
    recv_cq: Option<&'a CompletionQueue>,
    srq: Option<&'a SharedReceiveQueue>,
}

impl<'a> QpBuilder<'a> {
    /// Connection id owning the queue pair (required).
    pub fn cm_id(mut self, id: &'a CmId) -> Self {
        self.cm_id = Some(id);
        self
    }

    /// Send completion queue (required).
    pub fn send_cq(mut self, cq: &'a CompletionQueue) -> Self {
        self.send_cq = Some(cq);
        self
    }

    /// Receive completion queue; defaults to the send CQ.
    pub fn recv_cq(mut self, cq: &'a CompletionQueue) -> Self {
        self.recv_cq = Some(cq);
        self
    }

    /// Shared receive queue; the queue pair then has no receive queue of its own.
    pub fn srq(mut self, srq: &'a SharedReceiveQueue) -> Self {
        self.srq = Some(srq);
        self
    }

    pub fn build(self) -> Result<QueuePair> {
        let id = self
            .cm_id
            .ok_or(Error::InvalidArgument("connection id is required"))?;
        let send_cq = self
            .send_cq
            .ok_or(Error::InvalidArgument("send completion queue is required"))?;
        self.cfg.validate()?;

        let attr = QpInitAttr {
            max_send_wr: self.cfg.sq_size,
            max_recv_wr: if self.srq.is_some() { 0 } else { self.cfg.rq_size },
            max_send_sge: MAX_SGE,
            max_recv_sge: MAX_SGE,
            max_inline_data: self.cfg.max_inline_data,
        };
        let recv_cq = self.recv_cq.unwrap_or(send_cq);
        let qp = id
            .create_qp(self.peer.pd(), send_cq, recv_cq, self.srq, &attr)
            .map_err(Error::provider("create_qp"))?;
        log::debug!(
            "QP 0x{:x} created (sq {}, rq {}, srq {})",
            qp.qpn(),
            attr.max_send_wr,
            attr.max_recv_wr,
            self.srq.is_some()
        );
        Ok(qp)
    }
}
