//! Peer and queue pair setup tests.
//!
//! Run with:
//! ```bash
//! cargo test -p rflush --test peer_tests
//! ```

mod common;

use fabric::{Fabric, Fault};
use rflush::config::{MAX_INLINE_DATA, MAX_QUEUE_SIZE};
use rflush::{
    ConnectionConfig, ConnectionRequest, Endpoint, Error, Peer, SharedRxQueue, SrqConfig, Usage,
};

use common::{CLIENT_ADDR, SERVER_ADDR};

#[test]
fn test_builder_requires_cm_id() {
    let fabric = Fabric::new();
    let peer = common::peer(&fabric, SERVER_ADDR);
    let cq = peer.context().create_cq(8).expect("create_cq");
    let cfg = ConnectionConfig::default();

    let before = fabric.calls();
    let err = peer
        .qp_builder(&cfg)
        .send_cq(&cq)
        .build()
        .expect_err("missing cm id");
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(fabric.calls(), before);
}

#[test]
fn test_builder_requires_send_cq() {
    let fabric = Fabric::new();
    let peer = common::peer(&fabric, SERVER_ADDR);
    let id = peer.context().create_id().expect("create_id");
    let cfg = ConnectionConfig::default();

    let before = fabric.calls();
    let err = peer
        .qp_builder(&cfg)
        .cm_id(&id)
        .build()
        .expect_err("missing send cq");
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(fabric.calls(), before);
    assert!(id.qp().is_none());
}

#[test]
fn test_builder_rejects_limits_before_fabric() {
    let fabric = Fabric::new();
    let peer = common::peer(&fabric, SERVER_ADDR);
    let id = peer.context().create_id().expect("create_id");
    let cq = peer.context().create_cq(8).expect("create_cq");

    let before = fabric.calls();
    let inline = ConnectionConfig::default().with_max_inline_data(MAX_INLINE_DATA + 1);
    assert!(matches!(
        peer.qp_builder(&inline).cm_id(&id).send_cq(&cq).build(),
        Err(Error::ResourceExhausted(_))
    ));
    let deep = ConnectionConfig::default().with_sq_size(MAX_QUEUE_SIZE + 1);
    assert!(matches!(
        peer.qp_builder(&deep).cm_id(&id).send_cq(&cq).build(),
        Err(Error::ResourceExhausted(_))
    ));
    let empty = ConnectionConfig::default().with_rq_size(0);
    assert!(matches!(
        peer.qp_builder(&empty).cm_id(&id).send_cq(&cq).build(),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(fabric.calls(), before);
}

#[test]
fn test_builder_wires_queues() {
    let fabric = Fabric::new();
    let peer = common::peer(&fabric, SERVER_ADDR);
    let id = peer.context().create_id().expect("create_id");
    let send_cq = peer.context().create_cq(8).expect("create_cq");
    let recv_cq = peer.context().create_cq(8).expect("create_cq");
    let cfg = ConnectionConfig::default().with_sq_size(4).with_rq_size(6);

    let qp = peer
        .qp_builder(&cfg)
        .cm_id(&id)
        .send_cq(&send_cq)
        .recv_cq(&recv_cq)
        .build()
        .expect("build");
    assert!(qp.send_cq().ptr_eq(&send_cq));
    assert!(qp.recv_cq().ptr_eq(&recv_cq));
    let cap = qp.cap();
    assert_eq!(cap.max_send_wr, 4);
    assert_eq!(cap.max_recv_wr, 6);
    assert_eq!(cap.max_send_sge, 1);
    assert_eq!(cap.max_inline_data, MAX_INLINE_DATA);
    assert_eq!(id.qp().map(|q| q.qpn()), Some(qp.qpn()));
}

#[test]
fn test_builder_with_srq_has_no_receive_queue() {
    let fabric = Fabric::new();
    let peer = common::peer(&fabric, SERVER_ADDR);
    let srq = SharedRxQueue::new(&peer, &SrqConfig::default()).expect("SharedRxQueue::new");
    let id = peer.context().create_id().expect("create_id");
    let cq = peer.context().create_cq(8).expect("create_cq");
    // The receive depth is ignored.
    let cfg = ConnectionConfig::default().with_rq_size(0).with_srq(srq.clone());

    let qp = peer
        .qp_builder(&cfg)
        .cm_id(&id)
        .send_cq(&cq)
        .srq(srq.raw())
        .build()
        .expect("build");
    assert_eq!(qp.cap().max_recv_wr, 0);
    assert!(qp.srq().is_some());
    // Same CQ for both directions when none is given.
    assert!(qp.recv_cq().ptr_eq(&cq));
}

#[test]
fn test_create_qp_failure_leaves_nothing_behind() {
    let fabric = Fabric::new();
    let peer = common::peer(&fabric, SERVER_ADDR);
    let id = peer.context().create_id().expect("create_id");
    let cq = peer.context().create_cq(8).expect("create_cq");
    let cfg = ConnectionConfig::default();

    fabric.inject(Fault::CreateQp(libc::ENOMEM));
    let err = peer
        .qp_builder(&cfg)
        .cm_id(&id)
        .send_cq(&cq)
        .build()
        .expect_err("injected failure");
    assert!(matches!(err, Error::Provider { op: "create_qp", .. }));
    assert_eq!(err.errno(), Some(libc::ENOMEM));
    assert!(id.qp().is_none());

    // Nothing was left half-built: the same id takes a queue pair now.
    peer.qp_builder(&cfg)
        .cm_id(&id)
        .send_cq(&cq)
        .build()
        .expect("build after failure");
    assert!(id.qp().is_some());
}

#[test]
fn test_failed_inbound_setup_rejects_request() {
    let fabric = Fabric::new();
    let server_peer = common::peer(&fabric, SERVER_ADDR);
    let client_peer = common::peer(&fabric, CLIENT_ADDR);
    let endpoint = Endpoint::listen(&server_peer, SERVER_ADDR, 7400).expect("listen");
    let client = ConnectionRequest::new(
        &client_peer,
        SERVER_ADDR,
        7400,
        &ConnectionConfig::default(),
    )
    .expect("ConnectionRequest::new")
    .connect(None)
    .expect("connect");

    fabric.inject(Fault::CreateCq(libc::ENOMEM));
    let err = endpoint
        .next_conn_req(&ConnectionConfig::default())
        .err()
        .expect("inbound setup must fail");
    assert!(matches!(err, Error::Provider { op: "create_cq", .. }));
    assert_eq!(
        client.next_event().expect("event"),
        rflush::ConnEvent::Rejected
    );
}

#[test]
fn test_register_validates_arguments() {
    let fabric = Fabric::new();
    let peer = common::peer(&fabric, SERVER_ADDR);
    let buf = rflush::AlignedBuffer::new(64).expect("AlignedBuffer::new");

    let before = fabric.calls();
    assert!(matches!(
        unsafe { peer.register(buf.as_ptr(), 64, Usage::empty()) },
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        unsafe { peer.register(buf.as_ptr(), 0, Usage::SEND) },
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(fabric.calls(), before);

    fabric.inject(Fault::RegMr(libc::EFAULT));
    let err = unsafe { peer.register(buf.as_ptr(), 64, Usage::RECV) }
        .err()
        .expect("injected failure");
    assert_eq!(err.errno(), Some(libc::EFAULT));

    let mr = unsafe { peer.register(buf.as_ptr(), 64, Usage::RECV | Usage::SEND) }
        .expect("register");
    let desc = mr.descriptor();
    assert_eq!(desc.addr, buf.as_ptr() as u64);
    assert_eq!(desc.len, 64);
    assert_eq!(desc.usage, Usage::RECV | Usage::SEND);
}

#[test]
fn test_peer_on_shared_context() {
    let fabric = Fabric::new();
    let ctx = fabric.open_device(SERVER_ADDR).expect("open_device");
    let a = Peer::new(&ctx).expect("Peer::new");
    let b = Peer::new(&ctx).expect("Peer::new");
    assert_eq!(a.context().addr(), b.context().addr());
}
