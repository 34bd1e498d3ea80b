//! Passive endpoint.

use std::time::Duration;

use fabric::Listener;

use crate::config::ConnectionConfig;
use crate::connection::{ConnState, ConnectionRequest, Input};
use crate::error::{Error, Result};
use crate::peer::Peer;

/// Listens on an `(address, port)` pair and hands out inbound requests.
pub struct Endpoint {
    listener: Listener,
    peer: Peer,
    state: ConnState,
}

impl Endpoint {
    pub fn listen(peer: &Peer, addr: &str, port: u16) -> Result<Self> {
        let state = ConnState::Unconnected.next(Input::Listen)?;
        let listener = peer
            .context()
            .listen(addr, port)
            .map_err(Error::provider("listen"))?;
        log::info!("listening on {}:{}", addr, port);
        Ok(Self {
            listener,
            peer: peer.clone(),
            state,
        })
    }

    pub fn addr(&self) -> &str {
        self.listener.addr()
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Block until a connection request arrives, then create its resources
    /// under `cfg`.
    ///
    /// If the resources cannot be created the request is rejected.
    pub fn next_conn_req(&self, cfg: &ConnectionConfig) -> Result<ConnectionRequest> {
        let req = self.listener.get_request();
        ConnectionRequest::inbound(&self.peer, req, cfg)
    }

    /// Like [`next_conn_req`](Self::next_conn_req), giving up after `timeout`.
    pub fn next_conn_req_timeout(
        &self,
        cfg: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<ConnectionRequest> {
        let req = self
            .listener
            .get_request_timeout(timeout)
            .ok_or(Error::Timeout)?;
        ConnectionRequest::inbound(&self.peer, req, cfg)
    }

    /// Stop listening. Requests not yet taken are rejected.
    pub fn shutdown(self) {
        log::info!(
            "endpoint {}:{} shut down",
            self.listener.addr(),
            self.listener.port()
        );
    }
}
