//! Shared receive queue.

use std::fmt;

use fabric::{SharedReceiveQueue, SrqInitAttr};

use crate::cq::Cq;
use crate::error::{Error, Result};
use crate::mr::LocalMemoryRegion;
use crate::peer::Peer;

/// Default SRQ and SRQ receive CQ depth.
pub const DEFAULT_SRQ_SIZE: u32 = 100;

/// Shared receive queue configuration.
#[derive(Debug, Clone)]
pub struct SrqConfig {
    /// Receive queue depth.
    pub rq_size: u32,
    /// Receive CQ depth; 0 creates no dedicated CQ.
    pub rcq_size: u32,
}

impl Default for SrqConfig {
    fn default() -> Self {
        Self {
            rq_size: DEFAULT_SRQ_SIZE,
            rcq_size: DEFAULT_SRQ_SIZE,
        }
    }
}

/// A receive pool shared by several connections.
///
/// Connections whose [`ConnectionConfig`](crate::ConnectionConfig) names the
/// queue take their receives from it and report them on its CQ, if it has
/// one. The connection a receive completion belongs to is identified by the
/// completion's `qp_num`.
#[derive(Clone)]
pub struct SharedRxQueue {
    srq: SharedReceiveQueue,
    rcq: Option<Cq>,
}

impl fmt::Debug for SharedRxQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRxQueue")
            .field("max_wr", &self.srq.max_wr())
            .field("rcq", &self.rcq.is_some())
            .finish()
    }
}

impl SharedRxQueue {
    pub fn new(peer: &Peer, cfg: &SrqConfig) -> Result<Self> {
        if cfg.rq_size == 0 {
            return Err(Error::InvalidArgument("rq_size must be non-zero"));
        }
        let srq = peer
            .pd()
            .create_srq(&SrqInitAttr {
                max_wr: cfg.rq_size,
                max_sge: crate::config::MAX_SGE,
            })
            .map_err(Error::provider("create_srq"))?;
        let rcq = match cfg.rcq_size {
            0 => None,
            depth => Some(Cq::new(peer.context(), depth)?),
        };
        Ok(Self { srq, rcq })
    }

    /// Post a receive of up to `len` bytes at `offset` in `mr`.
    pub fn recv(&self, mr: &LocalMemoryRegion, offset: usize, len: usize, ctx: u64) -> Result<()> {
        let sge = mr.sge(offset, len)?;
        self.srq
            .post_recv(ctx, sge)
            .map_err(Error::provider("srq_post_recv"))
    }

    /// The dedicated receive CQ, if created.
    pub fn rcq(&self) -> Option<&Cq> {
        self.rcq.as_ref()
    }

    /// The underlying fabric queue, for wiring with [`QpBuilder::srq`](crate::QpBuilder::srq).
    pub fn raw(&self) -> &SharedReceiveQueue {
        &self.srq
    }
}
