//! Flush client.
//!
//! The client sends [`FlushRequest`]s over an established connection and
//! resolves each [`PendingFlush`] once both the local send completion and
//! the server's [`FlushResponse`] have been observed. Each message slot has
//! at most one request in flight.
//!
//! Responses land in whichever receive was armed first, so they are matched
//! to requests by token, never by receive slot. Every receive is re-armed as
//! soon as its response has been decoded.

use fabric::WorkCompletion;

use crate::buffer::{MessageBuffer, SlotKind, parse_wr_id, wr_id};
use crate::connection::{Completion, Connection};
use crate::cq::Cq;
use crate::error::{Error, Result};
use crate::mr::{FlushType, RemoteMemoryRegion};
use crate::peer::Peer;
use crate::protocol::{self, FlushRequest, FlushResponse, MSG_SIZE_MAX};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Free,
    /// Given up while its send was still outstanding.
    Abandoned,
    InFlight {
        token: u64,
        seq: u64,
        sent: bool,
        answered: bool,
    },
}

/// A request in flight; resolve it with [`FlushClient::wait`].
#[derive(Debug)]
#[must_use = "a pending flush must be waited on"]
pub struct PendingFlush {
    slot: usize,
    token: u64,
}

impl PendingFlush {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Outcome of a completed flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushCompletion {
    pub token: u64,
    pub durability: FlushType,
}

pub struct FlushClient<'c> {
    conn: &'c Connection,
    remote: RemoteMemoryRegion,
    durability: FlushType,
    buf: MessageBuffer,
    slots: Vec<Slot>,
    next_seq: u64,
}

impl<'c> FlushClient<'c> {
    /// Register `slots` message slots and arm their receives.
    ///
    /// The remote region is taken from the connection's handshake data.
    pub fn new(peer: &Peer, conn: &'c Connection, slots: usize) -> Result<Self> {
        if conn.srq().is_some() {
            return Err(Error::InvalidArgument(
                "flush client needs a connection without a shared receive queue",
            ));
        }
        let remote = conn.remote_region()?;
        let durability = remote
            .flush_type()
            .ok_or(Error::InvalidArgument("remote region does not accept flushes"))?;
        let buf = MessageBuffer::new(peer, slots)?;
        for slot in 0..slots {
            conn.recv(
                buf.mr(),
                buf.recv_offset(slot),
                MSG_SIZE_MAX,
                wr_id(slot, SlotKind::Recv),
            )?;
        }
        Ok(Self {
            conn,
            remote,
            durability,
            buf,
            slots: vec![Slot::Free; slots],
            next_seq: 0,
        })
    }

    pub fn remote(&self) -> &RemoteMemoryRegion {
        &self.remote
    }

    /// Number of requests not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s, Slot::Free))
            .count()
    }

    /// Send a request to flush `[offset, offset + len)` of the remote region.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if the range is outside the remote region,
    /// [`Error::ResourceExhausted`] if every slot has a request in flight.
    pub fn flush(&mut self, offset: u64, len: u64, token: u64) -> Result<PendingFlush> {
        self.remote.target(offset, len)?;
        let slot = self
            .slots
            .iter()
            .position(|s| matches!(s, Slot::Free))
            .ok_or(Error::ResourceExhausted("no free flush slot"))?;

        let req = FlushRequest {
            offset,
            length: len,
            op_context: token,
        };
        let n = protocol::encode(&req, self.buf.send_area(slot))?;
        self.conn.send(
            self.buf.mr(),
            self.buf.send_offset(slot),
            n,
            Completion::Always,
            wr_id(slot, SlotKind::Send),
        )?;
        self.slots[slot] = Slot::InFlight {
            token,
            seq: self.next_seq,
            sent: false,
            answered: false,
        };
        self.next_seq += 1;
        log::trace!("flush {:?} sent on slot {}", req, slot);
        Ok(PendingFlush { slot, token })
    }

    /// Block until `pending` is resolved.
    ///
    /// # Errors
    /// A failed completion is fatal for the connection. A malformed response,
    /// or one whose token matches no request in flight, is
    /// [`Error::Protocol`]; the receive it landed in is re-armed and the
    /// slot of `pending` is given up, so the client stays usable. A late
    /// response to the abandoned request is reported the same way.
    pub fn wait(&mut self, pending: PendingFlush) -> Result<FlushCompletion> {
        let slot = pending.slot;
        match self.resolve(slot) {
            Ok(token) => {
                self.slots[slot] = Slot::Free;
                Ok(FlushCompletion {
                    token,
                    durability: self.durability,
                })
            }
            Err(e @ Error::Protocol(_)) => {
                log::warn!("abandoning flush slot {}: {}", slot, e);
                self.abandon(slot);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn resolve(&mut self, slot: usize) -> Result<u64> {
        loop {
            match self.slots.get(slot).copied() {
                Some(Slot::InFlight {
                    token,
                    sent: true,
                    answered: true,
                    ..
                }) => return Ok(token),
                Some(Slot::InFlight { sent: false, .. }) => {
                    let cq = self.conn.cq().clone();
                    self.pump(&cq)?;
                }
                Some(Slot::InFlight { .. }) => {
                    let rcq = self.conn.rcq().clone();
                    self.pump(&rcq)?;
                }
                _ => return Err(Error::InvalidArgument("no request in flight on slot")),
            }
        }
    }

    // The send area stays reserved until its send has completed.
    fn abandon(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = match *s {
                Slot::InFlight { sent: true, .. } => Slot::Free,
                Slot::InFlight { .. } => Slot::Abandoned,
                other => other,
            };
        }
    }

    /// [`flush`](Self::flush) and [`wait`](Self::wait).
    pub fn flush_sync(&mut self, offset: u64, len: u64, token: u64) -> Result<FlushCompletion> {
        let pending = self.flush(offset, len, token)?;
        self.wait(pending)
    }

    fn pump(&mut self, cq: &Cq) -> Result<()> {
        let wc = cq.next_completion()?;
        self.record(wc)
    }

    fn record(&mut self, wc: WorkCompletion) -> Result<()> {
        self.conn.check_completion(&wc)?;
        match parse_wr_id(wc.wr_id) {
            Some((slot, SlotKind::Send)) => match self.slots.get_mut(slot) {
                Some(Slot::InFlight { sent, .. }) => *sent = true,
                Some(s) if matches!(s, Slot::Abandoned) => *s = Slot::Free,
                _ => {
                    return Err(Error::Protocol(format!(
                        "unsolicited send completion on slot {}",
                        slot
                    )));
                }
            },
            Some((slot, SlotKind::Recv)) if slot < self.buf.slots() => {
                self.on_response(slot, wc.byte_len as usize)?;
            }
            _ => log::warn!("ignoring completion with foreign wr_id {:#x}", wc.wr_id),
        }
        Ok(())
    }

    fn on_response(&mut self, recv_slot: usize, len: usize) -> Result<()> {
        let decoded = protocol::decode::<FlushResponse>(self.buf.recv_area(recv_slot, len));
        self.conn.recv(
            self.buf.mr(),
            self.buf.recv_offset(recv_slot),
            MSG_SIZE_MAX,
            wr_id(recv_slot, SlotKind::Recv),
        )?;
        let resp = decoded?;
        // Tokens are not required to be unique; the oldest match wins.
        let waiting = self
            .slots
            .iter_mut()
            .filter_map(|s| match s {
                Slot::InFlight {
                    token,
                    seq,
                    answered,
                    ..
                } if *token == resp.op_context && !*answered => Some((*seq, answered)),
                _ => None,
            })
            .min_by_key(|(seq, _)| *seq);
        match waiting {
            Some((_, answered)) => {
                *answered = true;
                Ok(())
            }
            _ => Err(Error::Protocol(format!(
                "response token {:#x} matches no request in flight",
                resp.op_context
            ))),
        }
    }
}
