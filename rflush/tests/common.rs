//! Common test utilities for rflush integration tests.
//!
//! Wires a server and a client peer on one in-process fabric and provides
//! an instrumented persist target.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use fabric::Fabric;
use rflush::{
    AlignedBuffer, Connection, ConnectionConfig, ConnectionRequest, Endpoint, LocalMemoryRegion,
    Peer, PersistTarget, PrivateData, Usage,
};

pub const SERVER_ADDR: &str = "10.0.0.1";
pub const CLIENT_ADDR: &str = "10.0.0.2";
pub const REGION_SIZE: usize = 4096;

pub fn peer(fabric: &Fabric, addr: &str) -> Peer {
    let ctx = fabric.open_device(addr).expect("open_device");
    Peer::new(&ctx).expect("Peer::new")
}

pub fn fill(buf: &AlignedBuffer, offset: usize, data: &[u8]) {
    assert!(offset + data.len() <= buf.len());
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), buf.as_ptr().add(offset), data.len());
    }
}

pub fn read(buf: &AlignedBuffer, offset: usize, len: usize) -> Vec<u8> {
    assert!(offset + len <= buf.len());
    let mut out = vec![0u8; len];
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr().add(offset), out.as_mut_ptr(), len);
    }
    out
}

/// A registered buffer.
pub struct Region {
    // Deregistered before the buffer is freed.
    pub mr: LocalMemoryRegion,
    pub buf: AlignedBuffer,
}

impl Region {
    pub fn new(peer: &Peer, size: usize, usage: Usage) -> Self {
        let buf = AlignedBuffer::new(size).expect("AlignedBuffer::new");
        let mr = unsafe { peer.register(buf.as_ptr(), size, usage) }.expect("register");
        Self { mr, buf }
    }
}

/// Two established connections over one fabric.
pub struct Pair {
    pub fabric: Fabric,
    pub server_peer: Peer,
    pub client_peer: Peer,
    pub server: Connection,
    pub client: Connection,
    /// The server region advertised in the handshake.
    pub region: Region,
}

impl Pair {
    pub fn connect(port: u16) -> Self {
        Self::connect_with(port, ConnectionConfig::default(), Usage::FLUSH_TYPE_PERSISTENT)
    }

    pub fn connect_with(port: u16, server_cfg: ConnectionConfig, flush_usage: Usage) -> Self {
        Self::handshake(port, server_cfg, flush_usage, |region| {
            PrivateData::from_region(&region.mr, 0).to_bytes().to_vec()
        })
    }

    /// Connect with the server accepting with `advertise(region)` as its
    /// private data instead of the region's own descriptor.
    pub fn connect_advertising(port: u16, advertise: impl FnOnce(&Region) -> Vec<u8>) -> Self {
        Self::handshake(
            port,
            ConnectionConfig::default(),
            Usage::FLUSH_TYPE_PERSISTENT,
            advertise,
        )
    }

    fn handshake(
        port: u16,
        server_cfg: ConnectionConfig,
        flush_usage: Usage,
        advertise: impl FnOnce(&Region) -> Vec<u8>,
    ) -> Self {
        let fabric = Fabric::new();
        let server_peer = peer(&fabric, SERVER_ADDR);
        let client_peer = peer(&fabric, CLIENT_ADDR);
        let region = Region::new(
            &server_peer,
            REGION_SIZE,
            Usage::WRITE_DST | Usage::READ_SRC | flush_usage,
        );

        let endpoint = Endpoint::listen(&server_peer, SERVER_ADDR, port).expect("listen");
        let client = ConnectionRequest::new(
            &client_peer,
            SERVER_ADDR,
            port,
            &ConnectionConfig::default(),
        )
        .expect("ConnectionRequest::new")
        .connect(None)
        .expect("connect");

        let req = endpoint
            .next_conn_req_timeout(&server_cfg, Duration::from_secs(5))
            .expect("next_conn_req");
        let pdata = advertise(&region);
        let server = req.connect(Some(pdata.as_slice())).expect("accept");

        server.wait_established().expect("server established");
        client.wait_established().expect("client established");
        Self {
            fabric,
            server_peer,
            client_peer,
            server,
            client,
            region,
        }
    }
}

/// Persist target recording every persist call with a sequence number.
pub struct CountingTarget {
    len: usize,
    persistent: bool,
    seq: AtomicU64,
    calls: Mutex<Vec<(usize, usize, u64)>>,
}

impl CountingTarget {
    pub fn new(len: usize, persistent: bool) -> Self {
        Self {
            len,
            persistent,
            seq: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(offset, len, seq)` of every persist so far.
    pub fn calls(&self) -> Vec<(usize, usize, u64)> {
        self.calls.lock().clone()
    }
}

impl PersistTarget for CountingTarget {
    fn len(&self) -> usize {
        self.len
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn persist(&self, offset: usize, len: usize) -> io::Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push((offset, len, seq));
        Ok(())
    }
}
