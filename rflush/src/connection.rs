//! Connection lifecycle.
//!
//! A [`ConnectionRequest`] owns the resources of one connection attempt: the
//! connection manager id, its completion queues and its queue pair. It is
//! created either by an [`Endpoint`](crate::Endpoint) for an inbound request
//! or by [`ConnectionRequest::new`] to connect out. Receives may be armed on
//! a request before it is accepted or sent. [`ConnectionRequest::connect`]
//! turns it into a [`Connection`].
//!
//! ```text
//! Unconnected --listen--> Listening --inbound request--> RequestReceived
//! RequestReceived --accept--> Connecting
//! Unconnected --connect--> Connecting
//! Connecting --established--> Established
//! Established --disconnect--> Closing --close event--> Closed
//! Established --close event--> Closed
//! any but Closed --failure--> ErrorClosed
//! ```
//!
//! Resources are released in reverse creation order when the owning value
//! drops: queue pair, connection id, receive CQ, send CQ.

use std::fmt;
use std::time::Duration;

use fabric::{CmEvent, CmId, ConnectRequest, MAX_PRIVATE_DATA, QpState, QueuePair, SendFlags, WorkCompletion};
use parking_lot::Mutex;

use crate::config::ConnectionConfig;
use crate::cq::{CheckCompletion, Cq};
use crate::error::{Error, Result};
use crate::mr::{LocalMemoryRegion, RemoteMemoryRegion};
use crate::peer::Peer;
use crate::protocol::PrivateData;
use crate::srq::SharedRxQueue;

// =============================================================================
// State machine
// =============================================================================

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconnected,
    /// Passive endpoint accepting requests.
    Listening,
    /// Inbound request not yet accepted or rejected.
    RequestReceived,
    /// Request accepted or sent; waiting for the established event.
    Connecting,
    Established,
    /// Local disconnect issued; waiting for the close event.
    Closing,
    Closed,
    /// Terminal failure; only teardown is permitted.
    ErrorClosed,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Unconnected => "UNCONNECTED",
            ConnState::Listening => "LISTENING",
            ConnState::RequestReceived => "REQUEST_RECEIVED",
            ConnState::Connecting => "CONNECTING",
            ConnState::Established => "ESTABLISHED",
            ConnState::Closing => "CLOSING",
            ConnState::Closed => "CLOSED",
            ConnState::ErrorClosed => "ERROR_CLOSED",
        }
    }

    /// No further transitions except teardown.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closed | ConnState::ErrorClosed)
    }

    /// Transition taken on `input`.
    ///
    /// # Errors
    /// [`Error::UnexpectedEvent`] if `input` is not accepted in this state.
    pub fn next(self, input: Input) -> Result<ConnState> {
        use ConnState::*;
        let next = match (self, input) {
            (Closed, Input::Failure) => Closed,
            (_, Input::Failure) => ErrorClosed,
            (Unconnected, Input::Listen) => Listening,
            (Listening, Input::InboundRequest) => RequestReceived,
            (RequestReceived, Input::Accept) => Connecting,
            (RequestReceived, Input::Reject) => Closed,
            (Unconnected, Input::Connect) => Connecting,
            (Connecting, Input::Established) => Established,
            (Connecting, Input::Rejected | Input::Unreachable) => ErrorClosed,
            (Established, Input::Disconnect) => Closing,
            (Established | Closing, Input::CloseEvent) => Closed,
            (ErrorClosed, Input::CloseEvent) => ErrorClosed,
            (state, input) => {
                return Err(Error::UnexpectedEvent {
                    state,
                    event: format!("{:?}", input),
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Listen,
    InboundRequest,
    Connect,
    Accept,
    Reject,
    Established,
    Rejected,
    Unreachable,
    Disconnect,
    CloseEvent,
    Failure,
}

/// Connection event observed by [`Connection::next_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Established,
    Closed,
    Rejected,
    Unreachable,
}

/// Completion policy of a send-side work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Always produce a completion.
    Always,
    /// Only a failure produces a completion.
    OnError,
}

impl Completion {
    fn flags(self) -> SendFlags {
        match self {
            Completion::Always => SendFlags::SIGNALED,
            Completion::OnError => SendFlags::empty(),
        }
    }
}

// =============================================================================
// Resources
// =============================================================================

struct Resources {
    qp: QueuePair,
    id: CmId,
    rcq: Option<Cq>,
    cq: Cq,
}

impl Resources {
    fn new(peer: &Peer, id: CmId, cfg: &ConnectionConfig) -> Result<Self> {
        let cq = Cq::new(peer.context(), cfg.cq_size)?;
        let rcq = match (&cfg.srq, cfg.rcq_size) {
            (Some(srq), _) => srq.rcq().cloned(),
            (None, 0) => None,
            (None, depth) => Some(Cq::new(peer.context(), depth)?),
        };
        let mut builder = peer.qp_builder(cfg).cm_id(&id).send_cq(cq.raw());
        if let Some(rcq) = &rcq {
            builder = builder.recv_cq(rcq.raw());
        }
        if let Some(srq) = &cfg.srq {
            builder = builder.srq(srq.raw());
        }
        let qp = builder.build()?;
        Ok(Self { qp, id, rcq, cq })
    }

    fn recv(
        &self,
        srq: Option<&SharedRxQueue>,
        mr: &LocalMemoryRegion,
        offset: usize,
        len: usize,
        ctx: u64,
    ) -> Result<()> {
        if let Some(srq) = srq {
            return srq.recv(mr, offset, len, ctx);
        }
        let sge = mr.sge(offset, len)?;
        self.qp
            .post_recv(ctx, sge)
            .map_err(Error::provider("post_recv"))
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        self.id.destroy_qp();
    }
}

// =============================================================================
// ConnectionRequest
// =============================================================================

/// A connection attempt whose resources exist but which is not connected yet.
pub struct ConnectionRequest {
    res: Resources,
    srq: Option<SharedRxQueue>,
    max_inline: u32,
    remote_pdata: Vec<u8>,
    state: ConnState,
}

impl ConnectionRequest {
    /// Prepare an outbound connection to `(addr, port)`.
    ///
    /// Route resolution waits up to `cfg.timeout` for a listener.
    pub fn new(peer: &Peer, addr: &str, port: u16, cfg: &ConnectionConfig) -> Result<Self> {
        cfg.validate()?;
        let id = peer
            .context()
            .create_id()
            .map_err(Error::provider("create_id"))?;
        id.resolve(addr, port, cfg.timeout)
            .map_err(Error::provider("resolve"))?;
        let res = Resources::new(peer, id, cfg)?;
        log::debug!("connection request to {}:{} prepared", addr, port);
        Ok(Self::with_resources(res, cfg, Vec::new(), ConnState::Unconnected))
    }

    pub(crate) fn inbound(peer: &Peer, req: ConnectRequest, cfg: &ConnectionConfig) -> Result<Self> {
        let state = ConnState::Listening.next(Input::InboundRequest)?;
        let remote_pdata = req.private_data().to_vec();
        // Dropping the id on failure rejects the request.
        let res = Resources::new(peer, req.into_id(), cfg)?;
        Ok(Self::with_resources(res, cfg, remote_pdata, state))
    }

    fn with_resources(res: Resources, cfg: &ConnectionConfig, remote_pdata: Vec<u8>, state: ConnState) -> Self {
        Self {
            res,
            srq: cfg.srq.clone(),
            max_inline: cfg.max_inline_data,
            remote_pdata,
            state,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Private data sent with an inbound request.
    pub fn private_data(&self) -> &[u8] {
        &self.remote_pdata
    }

    /// Arm a receive before the connection is established.
    pub fn recv(&self, mr: &LocalMemoryRegion, offset: usize, len: usize, ctx: u64) -> Result<()> {
        self.res.recv(self.srq.as_ref(), mr, offset, len, ctx)
    }

    /// Accept (inbound) or send (outbound) the request with `private_data`.
    ///
    /// The returned connection is `Connecting`; call
    /// [`Connection::wait_established`] before posting.
    pub fn connect(self, private_data: Option<&[u8]>) -> Result<Connection> {
        let pdata = private_data.unwrap_or(&[]);
        if pdata.len() > MAX_PRIVATE_DATA {
            return Err(Error::InvalidArgument("private data too long"));
        }
        let passive = self.state == ConnState::RequestReceived;
        let input = if passive { Input::Accept } else { Input::Connect };
        let state = self.state.next(input)?;
        if passive {
            self.res
                .id
                .accept(pdata)
                .map_err(Error::provider("accept"))?;
        } else {
            self.res
                .id
                .connect(pdata)
                .map_err(Error::provider("connect"))?;
        }
        log::debug!(
            "QP 0x{:x}: {} -> {}",
            self.res.qp.qpn(),
            self.state,
            state
        );
        Ok(Connection {
            res: self.res,
            srq: self.srq,
            max_inline: self.max_inline,
            inner: Mutex::new(ConnInner {
                state,
                remote_pdata: self.remote_pdata,
            }),
        })
    }

    /// Refuse an inbound request.
    pub fn reject(self) -> Result<()> {
        let state = self.state.next(Input::Reject)?;
        self.res
            .id
            .reject()
            .map_err(Error::provider("reject"))?;
        log::debug!("request rejected: {} -> {}", self.state, state);
        Ok(())
    }
}

// =============================================================================
// Connection
// =============================================================================

struct ConnInner {
    state: ConnState,
    remote_pdata: Vec<u8>,
}

/// A connected session with one peer.
pub struct Connection {
    res: Resources,
    srq: Option<SharedRxQueue>,
    max_inline: u32,
    inner: Mutex<ConnInner>,
}

impl Connection {
    fn apply(&self, event: CmEvent) -> Result<ConnEvent> {
        let (input, conn_event) = match &event {
            CmEvent::Established { .. } => (Input::Established, ConnEvent::Established),
            CmEvent::Rejected => (Input::Rejected, ConnEvent::Rejected),
            CmEvent::Unreachable => (Input::Unreachable, ConnEvent::Unreachable),
            CmEvent::Disconnected => (Input::CloseEvent, ConnEvent::Closed),
        };
        let mut inner = self.inner.lock();
        match inner.state.next(input) {
            Ok(next) => {
                log::debug!(
                    "QP 0x{:x}: {} on {} -> {}",
                    self.res.qp.qpn(),
                    event,
                    inner.state,
                    next
                );
                if let CmEvent::Established { private_data } = event {
                    inner.remote_pdata = private_data;
                }
                inner.state = next;
                Ok(conn_event)
            }
            Err(e) => {
                log::warn!("QP 0x{:x}: {}", self.res.qp.qpn(), e);
                inner.state = ConnState::ErrorClosed;
                self.res.qp.set_error();
                Err(e)
            }
        }
    }

    /// Block until the next connection event.
    pub fn next_event(&self) -> Result<ConnEvent> {
        let event = self.res.id.get_event();
        self.apply(event)
    }

    /// Take the next connection event without blocking.
    pub fn try_next_event(&self) -> Result<Option<ConnEvent>> {
        self.res
            .id
            .try_get_event()
            .map(|event| self.apply(event))
            .transpose()
    }

    /// Wait up to `timeout` for the next connection event.
    pub fn next_event_timeout(&self, timeout: Duration) -> Result<Option<ConnEvent>> {
        self.res
            .id
            .get_event_timeout(timeout)
            .map(|event| self.apply(event))
            .transpose()
    }

    /// Block until the connection is established.
    ///
    /// # Errors
    /// [`Error::ConnectionClosed`] if the request was rejected, nobody
    /// listened, or the connection closed first.
    pub fn wait_established(&self) -> Result<()> {
        loop {
            match self.state() {
                ConnState::Established => return Ok(()),
                state if state.is_terminal() || state == ConnState::Closing => {
                    return Err(Error::ConnectionClosed);
                }
                _ => {}
            }
            match self.next_event()? {
                ConnEvent::Established => return Ok(()),
                event => log::debug!("connection not established: {:?}", event),
            }
        }
    }

    /// Start closing the connection; the remote observes a close event.
    pub fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            ConnState::Closing | ConnState::Closed | ConnState::ErrorClosed
        ) {
            return Err(Error::ConnectionClosed);
        }
        let next = inner.state.next(Input::Disconnect)?;
        match self.res.id.disconnect() {
            Ok(()) => {}
            // The remote closed first; its close event is already queued.
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => {
                inner.state = ConnState::ErrorClosed;
                return Err(Error::provider("disconnect")(e));
            }
        }
        log::debug!("QP 0x{:x}: {} -> {}", self.res.qp.qpn(), inner.state, next);
        inner.state = next;
        Ok(())
    }

    /// Block until the close event has been observed.
    pub fn wait_closed(&self) -> Result<()> {
        while !self.state().is_terminal() {
            if let Err(e) = self.next_event() {
                log::debug!("event while closing: {}", e);
            }
        }
        Ok(())
    }

    /// Disconnect if needed, wait for the close event and release the
    /// connection.
    pub fn close(self) -> Result<()> {
        match self.state() {
            ConnState::Established => self.disconnect()?,
            ConnState::Closing => {}
            ConnState::Closed | ConnState::ErrorClosed => return Ok(()),
            _ => {
                self.mark_failed();
                return Ok(());
            }
        }
        self.wait_closed()
    }

    /// Move to `ErrorClosed` and invalidate the queue pair.
    pub fn mark_failed(&self) {
        let mut inner = self.inner.lock();
        if inner.state.next(Input::Failure).ok() != Some(ConnState::ErrorClosed) {
            return;
        }
        if inner.state != ConnState::ErrorClosed {
            log::warn!(
                "QP 0x{:x}: {} -> {}",
                self.res.qp.qpn(),
                inner.state,
                ConnState::ErrorClosed
            );
        }
        inner.state = ConnState::ErrorClosed;
        self.res.qp.set_error();
    }

    fn ensure_established(&self) -> Result<()> {
        match self.inner.lock().state {
            ConnState::Established => Ok(()),
            ConnState::Closing | ConnState::Closed | ConnState::ErrorClosed => {
                Err(Error::ConnectionClosed)
            }
            state => Err(Error::UnexpectedEvent {
                state,
                event: "post".to_owned(),
            }),
        }
    }

    /// Check the status of a completion drained for this connection; a
    /// failure is fatal.
    pub fn check_completion(&self, wc: &WorkCompletion) -> Result<()> {
        wc.check().inspect_err(|e| {
            log::warn!("QP 0x{:x}: {}", self.res.qp.qpn(), e);
            self.mark_failed();
        })
    }

    /// Post a send of `len` bytes at `offset` in `mr`.
    ///
    /// Payloads of at most `max_inline_data` bytes are sent inline.
    pub fn send(
        &self,
        mr: &LocalMemoryRegion,
        offset: usize,
        len: usize,
        completion: Completion,
        ctx: u64,
    ) -> Result<()> {
        self.ensure_established()?;
        let sge = mr.sge(offset, len)?;
        let mut flags = completion.flags();
        if len > 0 && len <= self.max_inline as usize {
            flags |= SendFlags::INLINE;
        }
        self.res
            .qp
            .post_send(ctx, sge, flags)
            .map_err(Error::provider("post_send"))
    }

    /// Post a receive; routed to the shared receive queue if configured.
    pub fn recv(&self, mr: &LocalMemoryRegion, offset: usize, len: usize, ctx: u64) -> Result<()> {
        self.ensure_established()?;
        self.res.recv(self.srq.as_ref(), mr, offset, len, ctx)
    }

    /// One-sided write of `len` bytes from `src` into `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        dst: &RemoteMemoryRegion,
        dst_offset: u64,
        src: &LocalMemoryRegion,
        src_offset: usize,
        len: usize,
        completion: Completion,
        ctx: u64,
    ) -> Result<()> {
        self.ensure_established()?;
        let local = src
            .sge(src_offset, len)?
            .ok_or(Error::InvalidArgument("zero-length write"))?;
        let (addr, rkey) = dst.target(dst_offset, len as u64)?;
        self.res
            .qp
            .post_write(ctx, local, addr, rkey, completion.flags())
            .map_err(Error::provider("post_write"))
    }

    /// One-sided read of `len` bytes from `src` into `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &self,
        dst: &LocalMemoryRegion,
        dst_offset: usize,
        src: &RemoteMemoryRegion,
        src_offset: u64,
        len: usize,
        completion: Completion,
        ctx: u64,
    ) -> Result<()> {
        self.ensure_established()?;
        let local = dst
            .sge(dst_offset, len)?
            .ok_or(Error::InvalidArgument("zero-length read"))?;
        let (addr, rkey) = src.target(src_offset, len as u64)?;
        self.res
            .qp
            .post_read(ctx, local, addr, rkey, completion.flags())
            .map_err(Error::provider("post_read"))
    }

    /// Private data the remote side sent at handshake.
    pub fn remote_private_data(&self) -> Vec<u8> {
        self.inner.lock().remote_pdata.clone()
    }

    /// The region described by the remote handshake record.
    pub fn remote_region(&self) -> Result<RemoteMemoryRegion> {
        PrivateData::from_bytes(&self.remote_private_data())?.region()
    }

    /// Send completion queue.
    pub fn cq(&self) -> &Cq {
        &self.res.cq
    }

    /// Receive completion queue; the send CQ when receives are not separated.
    pub fn rcq(&self) -> &Cq {
        self.res.rcq.as_ref().unwrap_or(&self.res.cq)
    }

    pub fn srq(&self) -> Option<&SharedRxQueue> {
        self.srq.as_ref()
    }

    pub fn qp_num(&self) -> u32 {
        self.res.qp.qpn()
    }

    pub fn qp_state(&self) -> QpState {
        self.res.qp.state()
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.res.id.is_connected() {
            let _ = self.res.id.disconnect();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("qp_num", &self.qp_num())
            .field("state", &self.state())
            .finish()
    }
}
