//! Flush server.
//!
//! The server answers each [`FlushRequest`] by persisting exactly the
//! requested range of its target and only then sending a [`FlushResponse`]
//! carrying the request's token. A target without a durable medium still
//! answers, with [`FlushType::Visibility`] reported to the local caller.

use std::collections::VecDeque;
use std::io;

use fabric::{WcStatus, WorkCompletion};

use crate::buffer::{MessageBuffer, SlotKind, parse_wr_id, wr_id};
use crate::connection::{Completion, ConnEvent, ConnState, Connection};
use crate::error::{Error, Result};
use crate::mr::FlushType;
use crate::peer::Peer;
use crate::protocol::{self, FlushRequest, FlushResponse, MSG_SIZE_MAX};

/// Memory the server makes durable on request.
pub trait PersistTarget {
    /// Size of the target in bytes; requests must stay inside it.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if [`persist`](Self::persist) reaches a durable medium.
    fn is_persistent(&self) -> bool;

    /// Make `[offset, offset + len)` durable.
    fn persist(&self, offset: usize, len: usize) -> io::Result<()>;
}

impl PersistTarget for pmem::Mapping {
    fn len(&self) -> usize {
        pmem::Mapping::len(self)
    }

    fn is_persistent(&self) -> bool {
        pmem::Mapping::is_persistent(self)
    }

    fn persist(&self, offset: usize, len: usize) -> io::Result<()> {
        pmem::Mapping::persist(self, offset, len)
    }
}

impl<T: PersistTarget + ?Sized> PersistTarget for &T {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn is_persistent(&self) -> bool {
        (**self).is_persistent()
    }

    fn persist(&self, offset: usize, len: usize) -> io::Result<()> {
        (**self).persist(offset, len)
    }
}

/// Outcome of one [`FlushServer::serve_one`] round.
#[derive(Debug)]
pub enum Served {
    /// The range was made durable and the response sent.
    Flushed {
        request: FlushRequest,
        durability: FlushType,
    },
    /// The request could not be decoded or addressed outside the target; no
    /// response was sent.
    Rejected(Error),
    /// The remote side closed the connection.
    Closed,
}

/// Counters returned by [`FlushServer::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub flushed: u64,
    pub rejected: u64,
}

pub struct FlushServer<'c, T> {
    conn: &'c Connection,
    target: T,
    buf: MessageBuffer,
    // Receive completions drained while waiting for a response send.
    stash: VecDeque<WorkCompletion>,
}

impl<'c, T: PersistTarget> FlushServer<'c, T> {
    /// Serve `conn` with a single message slot.
    pub fn new(peer: &Peer, conn: &'c Connection, target: T) -> Result<Self> {
        Self::with_slots(peer, conn, target, 1)
    }

    /// Serve `conn` with `slots` message slots, arming every receive.
    pub fn with_slots(peer: &Peer, conn: &'c Connection, target: T, slots: usize) -> Result<Self> {
        let buf = MessageBuffer::new(peer, slots)?;
        for slot in 0..slots {
            conn.recv(
                buf.mr(),
                buf.recv_offset(slot),
                MSG_SIZE_MAX,
                wr_id(slot, SlotKind::Recv),
            )?;
        }
        Self::with_armed_buffer(conn, buf, target)
    }

    /// Serve `conn` with a buffer whose receives were armed by the caller,
    /// typically on the [`ConnectionRequest`](crate::ConnectionRequest)
    /// before accepting.
    pub fn with_armed_buffer(conn: &'c Connection, buf: MessageBuffer, target: T) -> Result<Self> {
        if conn.srq().is_some() {
            return Err(Error::InvalidArgument(
                "flush server needs a connection without a shared receive queue",
            ));
        }
        Ok(Self {
            conn,
            target,
            buf,
            stash: VecDeque::new(),
        })
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    fn next_recv(&mut self) -> Result<WorkCompletion> {
        if let Some(wc) = self.stash.pop_front() {
            return Ok(wc);
        }
        self.conn.rcq().next_completion()
    }

    fn peer_closed(&self) -> Result<bool> {
        if matches!(self.conn.state(), ConnState::Closing | ConnState::Closed) {
            return Ok(true);
        }
        Ok(self.conn.try_next_event()? == Some(ConnEvent::Closed))
    }

    fn rearm(&self, slot: usize) -> Result<()> {
        self.conn.recv(
            self.buf.mr(),
            self.buf.recv_offset(slot),
            MSG_SIZE_MAX,
            wr_id(slot, SlotKind::Recv),
        )
    }

    fn parse(&self, slot: usize, len: usize) -> Result<FlushRequest> {
        let request = protocol::decode::<FlushRequest>(self.buf.recv_area(slot, len))?;
        match request.offset.checked_add(request.length) {
            Some(end) if end <= self.target.len() as u64 => Ok(request),
            _ => Err(Error::Protocol(format!(
                "flush range {:#x}+{:#x} outside target of {:#x} bytes",
                request.offset,
                request.length,
                self.target.len()
            ))),
        }
    }

    /// Handle the next request.
    ///
    /// # Errors
    /// A failed completion (other than receives flushed by a remote close)
    /// or a failed persist is fatal.
    pub fn serve_one(&mut self) -> Result<Served> {
        let (wc, slot) = loop {
            let wc = self.next_recv()?;
            match parse_wr_id(wc.wr_id) {
                Some((slot, SlotKind::Recv)) if slot < self.buf.slots() => break (wc, slot),
                _ => log::warn!("ignoring completion with wr_id {:#x}", wc.wr_id),
            }
        };
        if wc.status == WcStatus::WrFlushErr && self.peer_closed()? {
            log::debug!("QP 0x{:x}: remote closed", self.conn.qp_num());
            return Ok(Served::Closed);
        }
        self.conn.check_completion(&wc)?;

        let request = match self.parse(slot, wc.byte_len as usize) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("rejecting request on slot {}: {}", slot, e);
                self.rearm(slot)?;
                return Ok(Served::Rejected(e));
            }
        };

        self.target
            .persist(request.offset as usize, request.length as usize)
            .map_err(Error::provider("persist"))?;
        let durability = if self.target.is_persistent() {
            FlushType::Persistent
        } else {
            FlushType::Visibility
        };

        self.rearm(slot)?;
        let resp = FlushResponse {
            op_context: request.op_context,
        };
        let n = protocol::encode(&resp, self.buf.send_area(slot))?;
        self.conn.send(
            self.buf.mr(),
            self.buf.send_offset(slot),
            n,
            Completion::Always,
            wr_id(slot, SlotKind::Send),
        )?;
        self.wait_send(slot)?;
        log::debug!("flushed {:?} ({:?})", request, durability);
        Ok(Served::Flushed {
            request,
            durability,
        })
    }

    /// Wait for the send of `slot`, keeping receive completions for later.
    fn wait_send(&mut self, slot: usize) -> Result<()> {
        loop {
            let wc = self.conn.cq().next_completion()?;
            match parse_wr_id(wc.wr_id) {
                Some((s, SlotKind::Send)) if s == slot => return self.conn.check_completion(&wc),
                Some((_, SlotKind::Recv)) => self.stash.push_back(wc),
                _ => {
                    self.conn.check_completion(&wc)?;
                    log::warn!("ignoring completion with wr_id {:#x}", wc.wr_id);
                }
            }
        }
    }

    /// Serve requests until the remote side closes.
    pub fn run(&mut self) -> Result<ServerStats> {
        let mut stats = ServerStats::default();
        loop {
            match self.serve_one()? {
                Served::Flushed { .. } => stats.flushed += 1,
                Served::Rejected(_) => stats.rejected += 1,
                Served::Closed => return Ok(stats),
            }
        }
    }
}
