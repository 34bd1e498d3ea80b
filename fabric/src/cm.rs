//! Connection manager.
//!
//! The passive side creates a [`Listener`] on an `(address, port)` pair and
//! takes [`ConnectRequest`]s from it. The active side creates a [`CmId`],
//! resolves the pair, creates its QP and connects. Accepting a request links
//! both QPs, moves them to RTS and delivers [`CmEvent::Established`] to both
//! sides, each carrying the other side's private data.
//!
//! Disconnecting (explicitly or by dropping a connected id) delivers
//! [`CmEvent::Disconnected`] to both sides before their QPs enter the error
//! state, so a peer observing flushed completions can always find the close
//! event.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cq::CompletionQueue;
use crate::device::Context;
use crate::pd::ProtectionDomain;
use crate::qp::{QpInitAttr, QueuePair};
use crate::srq::SharedReceiveQueue;
use crate::{Fault, MAX_PRIVATE_DATA};

/// Connection manager event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEvent {
    /// The connection is up; carries the remote side's private data.
    Established { private_data: Vec<u8> },
    /// The passive side rejected the request (or went away before answering).
    Rejected,
    /// No listener accepted the request.
    Unreachable,
    /// The connection was closed by either side.
    Disconnected,
}

impl CmEvent {
    /// Short event name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            CmEvent::Established { .. } => "ESTABLISHED",
            CmEvent::Rejected => "REJECTED",
            CmEvent::Unreachable => "UNREACHABLE",
            CmEvent::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn os_err(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

// =============================================================================
// Listener
// =============================================================================

pub(crate) struct ListenerInner {
    ctx: Context,
    key: (String, u16),
    requests: Mutex<VecDeque<ConnectRequest>>,
    ready: Condvar,
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        let fabric = self.ctx.fabric();
        let mut listeners = fabric.0.listeners.lock();
        if listeners
            .get(&self.key)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            listeners.remove(&self.key);
        }
        log::trace!("stopped listening on {}:{}", self.key.0, self.key.1);
    }
}

/// A passive endpoint accepting connection requests.
pub struct Listener(Arc<ListenerInner>);

impl Context {
    /// Start listening on `(addr, port)`.
    ///
    /// # Errors
    /// `EADDRINUSE` if another live listener owns the pair.
    pub fn listen(&self, addr: &str, port: u16) -> io::Result<Listener> {
        let fabric = self.fabric();
        fabric.record_call();
        let key = (addr.to_owned(), port);
        let mut listeners = fabric.0.listeners.lock();
        if listeners
            .get(&key)
            .is_some_and(|weak| weak.strong_count() > 0)
        {
            return Err(os_err(libc::EADDRINUSE));
        }
        let inner = Arc::new(ListenerInner {
            ctx: self.clone(),
            key: key.clone(),
            requests: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        });
        listeners.insert(key, Arc::downgrade(&inner));
        fabric.0.listeners_changed.notify_all();
        log::trace!("listening on {}:{}", addr, port);
        Ok(Listener(inner))
    }

    /// Create an unbound connection manager id.
    pub fn create_id(&self) -> io::Result<CmId> {
        self.fabric().record_call();
        Ok(CmId::new(self.clone(), Weak::new(), Vec::new(), false))
    }
}

impl Listener {
    /// The listening address.
    pub fn addr(&self) -> &str {
        &self.0.key.0
    }

    /// The listening port.
    pub fn port(&self) -> u16 {
        self.0.key.1
    }

    /// Block until a connection request arrives.
    pub fn get_request(&self) -> ConnectRequest {
        let mut requests = self.0.requests.lock();
        loop {
            if let Some(req) = requests.pop_front() {
                return req;
            }
            self.0.ready.wait(&mut requests);
        }
    }

    /// Wait up to `timeout` for a connection request.
    pub fn get_request_timeout(&self, timeout: Duration) -> Option<ConnectRequest> {
        let deadline = Instant::now() + timeout;
        let mut requests = self.0.requests.lock();
        loop {
            if let Some(req) = requests.pop_front() {
                return Some(req);
            }
            if self.0.ready.wait_until(&mut requests, deadline).timed_out() {
                return requests.pop_front();
            }
        }
    }

    /// Take a pending connection request without blocking.
    pub fn try_get_request(&self) -> Option<ConnectRequest> {
        self.0.requests.lock().pop_front()
    }
}

/// An inbound connection request.
pub struct ConnectRequest {
    id: CmId,
    private_data: Vec<u8>,
}

impl ConnectRequest {
    /// The passive-side id for this request.
    pub fn id(&self) -> &CmId {
        &self.id
    }

    /// Private data supplied by the active side.
    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    /// Consume the request, keeping the passive-side id.
    pub fn into_id(self) -> CmId {
        self.id
    }
}

// =============================================================================
// CmId
// =============================================================================

struct CmShared {
    qp: Option<QueuePair>,
    peer: Weak<CmIdInner>,
    /// Private data received from the peer with its request.
    remote_pdata: Vec<u8>,
    target: Option<Weak<ListenerInner>>,
    /// A request is outstanding between this id and `peer`.
    pending: bool,
    /// `true` only on the passive side of a pending request.
    passive: bool,
    connected: bool,
    events: VecDeque<CmEvent>,
}

pub(crate) struct CmIdInner {
    ctx: Context,
    shared: Mutex<CmShared>,
    event_ready: Condvar,
}

impl CmIdInner {
    fn push_event(&self, event: CmEvent) {
        let mut shared = self.shared.lock();
        shared.events.push_back(event);
        self.event_ready.notify_all();
    }
}

impl Drop for CmIdInner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        let Some(peer) = shared.peer.upgrade() else {
            return;
        };
        if shared.connected {
            let peer_qp = {
                let mut ps = peer.shared.lock();
                ps.connected = false;
                ps.peer = Weak::new();
                ps.events.push_back(CmEvent::Disconnected);
                peer.event_ready.notify_all();
                ps.qp.clone()
            };
            if let Some(qp) = shared.qp.take() {
                qp.set_error();
            }
            if let Some(qp) = peer_qp {
                qp.set_error();
            }
        } else if shared.pending && shared.passive {
            {
                let mut ps = peer.shared.lock();
                ps.pending = false;
                ps.peer = Weak::new();
            }
            peer.push_event(CmEvent::Rejected);
        }
    }
}

/// Connection manager id, the handle of one side of a connection.
pub struct CmId(Arc<CmIdInner>);

impl CmId {
    fn new(ctx: Context, peer: Weak<CmIdInner>, remote_pdata: Vec<u8>, passive: bool) -> Self {
        CmId(Arc::new(CmIdInner {
            ctx,
            shared: Mutex::new(CmShared {
                qp: None,
                peer,
                remote_pdata,
                target: None,
                pending: passive,
                passive,
                connected: false,
                events: VecDeque::new(),
            }),
            event_ready: Condvar::new(),
        }))
    }

    /// The device context this id belongs to.
    pub fn context(&self) -> &Context {
        &self.0.ctx
    }

    /// Resolve `(addr, port)` to a live listener, waiting up to `timeout`.
    ///
    /// # Errors
    /// `ETIMEDOUT` if nothing listens on the pair before the deadline.
    pub fn resolve(&self, addr: &str, port: u16, timeout: Duration) -> io::Result<()> {
        let fabric = self.0.ctx.fabric();
        fabric.record_call();
        let key = (addr.to_owned(), port);
        let deadline = Instant::now() + timeout;
        let mut listeners = fabric.0.listeners.lock();
        let target = loop {
            if let Some(weak) = listeners.get(&key)
                && weak.strong_count() > 0
            {
                break weak.clone();
            }
            if fabric
                .0
                .listeners_changed
                .wait_until(&mut listeners, deadline)
                .timed_out()
            {
                match listeners.get(&key) {
                    Some(weak) if weak.strong_count() > 0 => break weak.clone(),
                    _ => return Err(os_err(libc::ETIMEDOUT)),
                }
            }
        };
        drop(listeners);
        self.0.shared.lock().target = Some(target);
        log::trace!("resolved {}:{}", addr, port);
        Ok(())
    }

    /// Create the QP of this id.
    ///
    /// # Errors
    /// `EEXIST` if the id already owns a QP; any QP creation error.
    pub fn create_qp(
        &self,
        pd: &ProtectionDomain,
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
        srq: Option<&SharedReceiveQueue>,
        attr: &QpInitAttr,
    ) -> io::Result<QueuePair> {
        if self.0.shared.lock().qp.is_some() {
            return Err(os_err(libc::EEXIST));
        }
        let qp = QueuePair::create(pd, send_cq, recv_cq, srq, attr)?;
        self.0.shared.lock().qp = Some(qp.clone());
        Ok(qp)
    }

    /// Destroy the QP of this id, if any.
    pub fn destroy_qp(&self) {
        let qp = self.0.shared.lock().qp.take();
        drop(qp);
    }

    /// The QP of this id, if created.
    pub fn qp(&self) -> Option<QueuePair> {
        self.0.shared.lock().qp.clone()
    }

    /// Private data received with the inbound request (passive side).
    pub fn remote_private_data(&self) -> Vec<u8> {
        self.0.shared.lock().remote_pdata.clone()
    }

    /// Returns true while the connection is up.
    pub fn is_connected(&self) -> bool {
        self.0.shared.lock().connected
    }

    /// Send a connection request carrying `private_data`.
    ///
    /// The outcome is delivered as an event on this id.
    ///
    /// # Errors
    /// `EINVAL` if the id is unresolved, has no QP or the private data is too
    /// long; any injected connect fault.
    pub fn connect(&self, private_data: &[u8]) -> io::Result<()> {
        let fabric = self.0.ctx.fabric();
        fabric.record_call();
        if private_data.len() > MAX_PRIVATE_DATA {
            return Err(os_err(libc::EINVAL));
        }
        let target = {
            let shared = self.0.shared.lock();
            if shared.qp.is_none() || shared.pending || shared.connected {
                return Err(os_err(libc::EINVAL));
            }
            shared.target.clone().ok_or_else(|| os_err(libc::EINVAL))?
        };
        fabric.take_errno_fault(Fault::Connect(0))?;

        let Some(listener) = target.upgrade() else {
            self.0.push_event(CmEvent::Unreachable);
            return Ok(());
        };
        let passive = CmId::new(
            listener.ctx.clone(),
            Arc::downgrade(&self.0),
            private_data.to_vec(),
            true,
        );
        {
            let mut shared = self.0.shared.lock();
            shared.peer = Arc::downgrade(&passive.0);
            shared.pending = true;
        }
        let mut requests = listener.requests.lock();
        requests.push_back(ConnectRequest {
            id: passive,
            private_data: private_data.to_vec(),
        });
        listener.ready.notify_all();
        Ok(())
    }

    /// Accept the pending request on this passive id.
    ///
    /// # Errors
    /// `EINVAL` without a pending request or QP, `ECONNABORTED` if the active
    /// side went away.
    pub fn accept(&self, private_data: &[u8]) -> io::Result<()> {
        self.0.ctx.fabric().record_call();
        if private_data.len() > MAX_PRIVATE_DATA {
            return Err(os_err(libc::EINVAL));
        }
        let (local_qp, peer, remote_pdata) = {
            let shared = self.0.shared.lock();
            if !shared.pending || !shared.passive {
                return Err(os_err(libc::EINVAL));
            }
            let qp = shared.qp.clone().ok_or_else(|| os_err(libc::EINVAL))?;
            let peer = shared
                .peer
                .upgrade()
                .ok_or_else(|| os_err(libc::ECONNABORTED))?;
            (qp, peer, shared.remote_pdata.clone())
        };
        let remote_qp = peer
            .shared
            .lock()
            .qp
            .clone()
            .ok_or_else(|| os_err(libc::ECONNABORTED))?;

        local_qp.establish(&remote_qp);
        remote_qp.establish(&local_qp);
        {
            let mut shared = self.0.shared.lock();
            shared.pending = false;
            shared.connected = true;
            shared.events.push_back(CmEvent::Established {
                private_data: remote_pdata,
            });
            self.0.event_ready.notify_all();
        }
        {
            let mut ps = peer.shared.lock();
            ps.pending = false;
            ps.connected = true;
            ps.events.push_back(CmEvent::Established {
                private_data: private_data.to_vec(),
            });
            peer.event_ready.notify_all();
        }
        log::trace!(
            "connection established: QP 0x{:x} <-> QP 0x{:x}",
            local_qp.qpn(),
            remote_qp.qpn()
        );
        Ok(())
    }

    /// Reject the pending request on this passive id.
    pub fn reject(&self) -> io::Result<()> {
        self.0.ctx.fabric().record_call();
        let peer = {
            let mut shared = self.0.shared.lock();
            if !shared.pending || !shared.passive {
                return Err(os_err(libc::EINVAL));
            }
            shared.pending = false;
            std::mem::take(&mut shared.peer)
        };
        if let Some(peer) = peer.upgrade() {
            {
                let mut ps = peer.shared.lock();
                ps.pending = false;
                ps.peer = Weak::new();
            }
            peer.push_event(CmEvent::Rejected);
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// Both sides observe [`CmEvent::Disconnected`]; both QPs then enter the
    /// error state.
    ///
    /// # Errors
    /// `EINVAL` if the id is not connected.
    pub fn disconnect(&self) -> io::Result<()> {
        self.0.ctx.fabric().record_call();
        let (local_qp, peer) = {
            let mut shared = self.0.shared.lock();
            if !shared.connected {
                return Err(os_err(libc::EINVAL));
            }
            shared.connected = false;
            shared.events.push_back(CmEvent::Disconnected);
            self.0.event_ready.notify_all();
            (shared.qp.clone(), std::mem::take(&mut shared.peer))
        };
        let peer_qp = peer.upgrade().and_then(|peer| {
            let mut ps = peer.shared.lock();
            ps.connected = false;
            ps.peer = Weak::new();
            ps.events.push_back(CmEvent::Disconnected);
            peer.event_ready.notify_all();
            ps.qp.clone()
        });
        if let Some(qp) = local_qp {
            qp.set_error();
        }
        if let Some(qp) = peer_qp {
            qp.set_error();
        }
        Ok(())
    }

    /// Block until the next event.
    pub fn get_event(&self) -> CmEvent {
        let mut shared = self.0.shared.lock();
        loop {
            if let Some(event) = shared.events.pop_front() {
                return event;
            }
            self.0.event_ready.wait(&mut shared);
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn get_event_timeout(&self, timeout: Duration) -> Option<CmEvent> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.0.shared.lock();
        loop {
            if let Some(event) = shared.events.pop_front() {
                return Some(event);
            }
            if self
                .0
                .event_ready
                .wait_until(&mut shared, deadline)
                .timed_out()
            {
                return shared.events.pop_front();
            }
        }
    }

    /// Take the next event without blocking.
    pub fn try_get_event(&self) -> Option<CmEvent> {
        self.0.shared.lock().events.pop_front()
    }
}

impl fmt::Debug for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.0.shared.lock();
        f.debug_struct("CmId")
            .field("addr", &self.0.ctx.addr())
            .field("connected", &shared.connected)
            .field("pending", &shared.pending)
            .finish()
    }
}
