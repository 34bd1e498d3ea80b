//! Connection lifecycle tests.
//!
//! Run with:
//! ```bash
//! cargo test -p rflush --test connection_tests
//! ```

mod common;

use std::thread;
use std::time::Duration;

use common::{CLIENT_ADDR, Pair, REGION_SIZE, Region, SERVER_ADDR};
use fabric::{Fabric, Fault, QpState, WcOpcode, WcStatus};
use rflush::{
    CheckCompletion, Completion, ConnEvent, ConnState, ConnectionConfig, ConnectionRequest,
    Endpoint, Error, FlushClient, FlushServer, SharedRxQueue, SrqConfig, Usage,
};

#[test]
fn test_close_from_client() {
    let pair = Pair::connect(7300);
    pair.client.disconnect().expect("disconnect");
    assert_eq!(pair.client.state(), ConnState::Closing);
    assert!(matches!(
        pair.client.disconnect(),
        Err(Error::ConnectionClosed)
    ));

    pair.client.wait_closed().expect("client wait_closed");
    pair.server.wait_closed().expect("server wait_closed");
    assert_eq!(pair.client.state(), ConnState::Closed);
    assert_eq!(pair.server.state(), ConnState::Closed);
    assert_eq!(pair.client.qp_state(), QpState::Error);

    assert!(matches!(
        pair.server.disconnect(),
        Err(Error::ConnectionClosed)
    ));
    let buf = Region::new(&pair.client_peer, 64, Usage::SEND);
    assert!(matches!(
        pair.client.send(&buf.mr, 0, 8, Completion::Always, 1),
        Err(Error::ConnectionClosed)
    ));
}

#[test]
fn test_close_from_server() {
    let Pair {
        server, client, ..
    } = Pair::connect(7301);
    thread::scope(|s| {
        s.spawn(|| client.wait_closed().expect("client wait_closed"));
        server.close().expect("server close");
    });
    assert_eq!(client.state(), ConnState::Closed);
    // Both sides already observed the close event.
    client.close().expect("client close");
}

#[test]
fn test_disconnect_after_remote_close() {
    let pair = Pair::connect(7302);
    pair.server.disconnect().expect("server disconnect");
    // The client has not consumed the close event yet.
    assert_eq!(pair.client.state(), ConnState::Established);
    pair.client.disconnect().expect("client disconnect");
    pair.client.wait_closed().expect("client wait_closed");
    assert_eq!(pair.client.state(), ConnState::Closed);
}

#[test]
fn test_rejected_request() {
    let fabric = Fabric::new();
    let server_peer = common::peer(&fabric, SERVER_ADDR);
    let client_peer = common::peer(&fabric, CLIENT_ADDR);
    let endpoint = Endpoint::listen(&server_peer, SERVER_ADDR, 7303).expect("listen");
    assert_eq!(endpoint.state(), ConnState::Listening);

    let client = ConnectionRequest::new(
        &client_peer,
        SERVER_ADDR,
        7303,
        &ConnectionConfig::default(),
    )
    .expect("ConnectionRequest::new")
    .connect(None)
    .expect("connect");

    let req = endpoint
        .next_conn_req(&ConnectionConfig::default())
        .expect("next_conn_req");
    assert_eq!(req.state(), ConnState::RequestReceived);
    req.reject().expect("reject");

    assert_eq!(client.next_event().expect("event"), ConnEvent::Rejected);
    assert_eq!(client.state(), ConnState::ErrorClosed);
    assert!(matches!(
        client.wait_established(),
        Err(Error::ConnectionClosed)
    ));
}

#[test]
fn test_resolve_without_listener_times_out() {
    let fabric = Fabric::new();
    let client_peer = common::peer(&fabric, CLIENT_ADDR);
    let cfg = ConnectionConfig::default().with_timeout(Duration::from_millis(20));
    let err = ConnectionRequest::new(&client_peer, SERVER_ADDR, 7304, &cfg)
        .err()
        .expect("resolve must fail");
    assert_eq!(err.errno(), Some(libc::ETIMEDOUT));
    assert!(!err.is_fatal());
}

#[test]
fn test_endpoint_shutdown_rejects_queued_requests() {
    let fabric = Fabric::new();
    let server_peer = common::peer(&fabric, SERVER_ADDR);
    let client_peer = common::peer(&fabric, CLIENT_ADDR);
    let endpoint = Endpoint::listen(&server_peer, SERVER_ADDR, 7305).expect("listen");
    let client = ConnectionRequest::new(
        &client_peer,
        SERVER_ADDR,
        7305,
        &ConnectionConfig::default(),
    )
    .expect("ConnectionRequest::new")
    .connect(None)
    .expect("connect");

    endpoint.shutdown();
    assert_eq!(client.next_event().expect("event"), ConnEvent::Rejected);
    assert!(
        relisten_without_requests(&server_peer, 7305).is_ok(),
        "port is free again after shutdown"
    );
}

fn relisten_without_requests(peer: &rflush::Peer, port: u16) -> rflush::Result<()> {
    let endpoint = Endpoint::listen(peer, SERVER_ADDR, port)?;
    match endpoint.next_conn_req_timeout(&ConnectionConfig::default(), Duration::from_millis(5)) {
        Err(Error::Timeout) => Ok(()),
        Err(e) => Err(e),
        Ok(_) => Err(Error::Protocol("unexpected request".into())),
    }
}

#[test]
fn test_posting_before_established_is_unexpected() {
    let fabric = Fabric::new();
    let server_peer = common::peer(&fabric, SERVER_ADDR);
    let client_peer = common::peer(&fabric, CLIENT_ADDR);
    let _endpoint = Endpoint::listen(&server_peer, SERVER_ADDR, 7306).expect("listen");
    let client = ConnectionRequest::new(
        &client_peer,
        SERVER_ADDR,
        7306,
        &ConnectionConfig::default(),
    )
    .expect("ConnectionRequest::new")
    .connect(None)
    .expect("connect");
    assert_eq!(client.state(), ConnState::Connecting);

    let buf = Region::new(&client_peer, 64, Usage::SEND);
    assert!(matches!(
        client.send(&buf.mr, 0, 8, Completion::Always, 1),
        Err(Error::UnexpectedEvent {
            state: ConnState::Connecting,
            ..
        })
    ));
}

#[test]
fn test_send_failure_is_fatal() {
    let pair = Pair::connect(7307);
    let target = common::CountingTarget::new(REGION_SIZE, true);
    let _server = FlushServer::new(&pair.server_peer, &pair.server, &target)
        .expect("FlushServer::new");
    let mut client =
        FlushClient::new(&pair.client_peer, &pair.client, 1).expect("FlushClient::new");

    pair.fabric
        .inject(Fault::SendStatus(WcStatus::RemAccessErr));
    let pending = client.flush(0, 16, 7).expect("flush is posted");
    let err = client.wait(pending).expect_err("send must fail");
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        Error::CompletionFailed {
            status: WcStatus::RemAccessErr,
            opcode: WcOpcode::Send,
        }
    ));

    assert_eq!(pair.client.state(), ConnState::ErrorClosed);
    assert_eq!(pair.client.qp_state(), QpState::Error);
    let buf = Region::new(&pair.client_peer, 64, Usage::SEND);
    assert!(matches!(
        pair.client.send(&buf.mr, 0, 8, Completion::Always, 9),
        Err(Error::ConnectionClosed)
    ));
    assert!(target.calls().is_empty());
}

#[test]
fn test_one_sided_write_and_read() {
    let pair = Pair::connect(7308);
    let remote = pair.client.remote_region().expect("remote_region");
    assert_eq!(remote.len(), REGION_SIZE as u64);

    let src = Region::new(&pair.client_peer, 64, Usage::WRITE_SRC);
    common::fill(&src.buf, 0, b"persistent bytes");
    pair.client
        .write(&remote, 100, &src.mr, 0, 16, Completion::Always, 1)
        .expect("write");
    let wc = pair.client.cq().next_completion().expect("write completion");
    wc.check().expect("write status");
    assert_eq!(wc.opcode, WcOpcode::RdmaWrite);
    assert_eq!(common::read(&pair.region.buf, 100, 16), b"persistent bytes");

    let dst = Region::new(&pair.client_peer, 64, Usage::READ_DST);
    pair.client
        .read(&dst.mr, 8, &remote, 100, 16, Completion::Always, 2)
        .expect("read");
    let wc = pair.client.cq().next_completion().expect("read completion");
    wc.check().expect("read status");
    assert_eq!(common::read(&dst.buf, 8, 16), b"persistent bytes");

    assert!(matches!(
        pair.client
            .write(&remote, REGION_SIZE as u64 - 4, &src.mr, 0, 16, Completion::Always, 3),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_unsignaled_write_is_silent() {
    let pair = Pair::connect(7309);
    let remote = pair.client.remote_region().expect("remote_region");
    let src = Region::new(&pair.client_peer, 64, Usage::WRITE_SRC);
    pair.client
        .write(&remote, 0, &src.mr, 0, 8, Completion::OnError, 1)
        .expect("write");
    assert!(pair.client.cq().get_completion().expect("poll").is_none());
}

#[test]
fn test_srq_demultiplexes_by_queue_pair() {
    let fabric = Fabric::new();
    let server_peer = common::peer(&fabric, SERVER_ADDR);
    let client_a = common::peer(&fabric, CLIENT_ADDR);
    let client_b = common::peer(&fabric, "10.0.0.3");

    let srq = SharedRxQueue::new(&server_peer, &SrqConfig::default()).expect("SharedRxQueue::new");
    let server_cfg = ConnectionConfig::default().with_srq(srq.clone());
    let endpoint = Endpoint::listen(&server_peer, SERVER_ADDR, 7310).expect("listen");

    let mut clients = Vec::new();
    let mut servers = Vec::new();
    for peer in [&client_a, &client_b] {
        let client = ConnectionRequest::new(peer, SERVER_ADDR, 7310, &ConnectionConfig::default())
            .expect("ConnectionRequest::new")
            .connect(None)
            .expect("connect");
        let server = endpoint
            .next_conn_req(&server_cfg)
            .expect("next_conn_req")
            .connect(None)
            .expect("accept");
        server.wait_established().expect("server established");
        client.wait_established().expect("client established");
        clients.push(client);
        servers.push(server);
    }
    let rcq = srq.rcq().expect("srq receive cq");
    assert!(servers[0].rcq().same_queue(rcq));
    assert!(servers[1].rcq().same_queue(rcq));

    let inbox = Region::new(&server_peer, 256, Usage::RECV);
    srq.recv(&inbox.mr, 0, 64, 100).expect("srq recv");
    srq.recv(&inbox.mr, 64, 64, 101).expect("srq recv");

    let msg_a = Region::new(&client_a, 64, Usage::SEND);
    let msg_b = Region::new(&client_b, 64, Usage::SEND);
    common::fill(&msg_a.buf, 0, b"client a says hi");
    common::fill(&msg_b.buf, 0, b"from client b");
    clients[1]
        .send(&msg_b.mr, 0, 13, Completion::Always, 1)
        .expect("send b");
    clients[0]
        .send(&msg_a.mr, 0, 16, Completion::Always, 1)
        .expect("send a");

    let first = rcq.next_completion().expect("first recv");
    let second = rcq.next_completion().expect("second recv");
    servers[1].check_completion(&first).expect("first status");
    servers[0].check_completion(&second).expect("second status");

    assert_eq!(first.qp_num, servers[1].qp_num());
    assert_eq!(first.wr_id, 100);
    assert_eq!(first.byte_len, 13);
    assert_eq!(common::read(&inbox.buf, 0, 13), b"from client b");

    assert_eq!(second.qp_num, servers[0].qp_num());
    assert_eq!(second.wr_id, 101);
    assert_eq!(second.byte_len, 16);
    assert_eq!(common::read(&inbox.buf, 64, 16), b"client a says hi");
}

#[test]
fn test_mark_failed_blocks_posts() {
    let pair = Pair::connect(7311);
    let buf = Region::new(&pair.server_peer, 64, Usage::RECV);
    pair.server
        .recv(&buf.mr, 0, 64, 5)
        .expect("recv");
    let empty = Region::new(&pair.client_peer, 64, Usage::SEND);
    pair.client
        .send(&empty.mr, 0, 0, Completion::Always, 6)
        .expect("zero-length send");
    let wc = pair.server.rcq().next_completion().expect("recv completion");
    pair.server.check_completion(&wc).expect("recv status");
    assert_eq!(wc.byte_len, 0);
    assert_eq!(wc.opcode, WcOpcode::Recv);

    pair.server.mark_failed();
    assert_eq!(pair.server.state(), ConnState::ErrorClosed);
    assert!(matches!(
        pair.server.recv(&buf.mr, 0, 64, 7),
        Err(Error::ConnectionClosed)
    ));
}

#[test]
fn test_mark_failed_after_close_keeps_closed() {
    let pair = Pair::connect(7312);
    pair.client.disconnect().expect("disconnect");
    pair.client.wait_closed().expect("client wait_closed");
    pair.server.wait_closed().expect("server wait_closed");

    pair.client.mark_failed();
    pair.server.mark_failed();
    assert_eq!(pair.client.state(), ConnState::Closed);
    assert_eq!(pair.server.state(), ConnState::Closed);
}
