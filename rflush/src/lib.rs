//! # rflush - remote flush over a completion-queue fabric
//!
//! A client writes into a server's registered memory with one-sided writes
//! and then asks the server to make a byte range durable. The server persists
//! exactly that range before acknowledging, so a completed flush means the
//! data survived on the server side.
//!
//! ## Architecture
//!
//! ```text
//! Client                                   Server
//!   |                                        |  Endpoint::listen
//!   |-- ConnectionRequest::new ------------->|  next_conn_req, arm receive
//!   |<---------- accept(PrivateData{descriptor}) --|
//!   |-- Connection::write (one-sided) ------>|  (region)
//!   |-- FlushRequest{offset,len,token} ----->|  persist(offset, len)
//!   |<----------------- FlushResponse{token} |
//! ```
//!
//! ## Key Components
//!
//! - [`Peer`]: device context plus protection domain; builds queue pairs
//! - [`ConnectionConfig`]: queue depths, inline limit, optional shared receive queue
//! - [`Endpoint`], [`ConnectionRequest`], [`Connection`]: connection lifecycle
//! - [`LocalMemoryRegion`], [`RemoteMemoryRegion`]: registration and descriptors
//! - [`Cq`]: completion queue wait/poll
//! - [`FlushClient`], [`FlushServer`]: the flush protocol
//!
//! ## Usage
//!
//! ```ignore
//! let peer = Peer::new(&ctx)?;
//! let req = ConnectionRequest::new(&peer, "10.0.0.1", 7204, &ConnectionConfig::default())?;
//! let conn = req.connect(None)?;
//! conn.wait_established()?;
//! let mut client = FlushClient::new(&peer, &conn, 1)?;
//! let done = client.flush_sync(0, 16, 7)?;
//! conn.close()?;
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod cq;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod mr;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod srq;

pub use buffer::{AlignedBuffer, MessageBuffer};
pub use client::{FlushClient, FlushCompletion, PendingFlush};
pub use config::ConnectionConfig;
pub use connection::{Completion, ConnEvent, ConnState, Connection, ConnectionRequest, Input};
pub use cq::{CheckCompletion, Cq};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use mr::{Descriptor, FlushType, LocalMemoryRegion, RemoteMemoryRegion, Usage};
pub use peer::{Peer, QpBuilder};
pub use protocol::{FlushRequest, FlushResponse, PrivateData};
pub use server::{FlushServer, PersistTarget, ServerStats, Served};
pub use srq::{SharedRxQueue, SrqConfig};
