//! Common test utilities for fabric integration tests.
//!
//! This module provides helper functions and types for wiring two connected
//! queue pairs on one in-process fabric.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use fabric::{
    AccessFlags, CmEvent, CmId, CompletionQueue, Context, Fabric, MemoryRegion, ProtectionDomain,
    QpInitAttr, QueuePair, SharedReceiveQueue, Sge, WorkCompletion,
};

/// Page size for aligned allocations.
pub const PAGE_SIZE: usize = 4096;

/// Aligned buffer with automatic cleanup.
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
}

impl AlignedBuffer {
    /// Allocate page-aligned, zeroed memory.
    pub fn new(size: usize) -> Self {
        let aligned_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let ptr = unsafe {
            let mut ptr: *mut std::ffi::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, PAGE_SIZE, aligned_size);
            if ret != 0 {
                panic!("posix_memalign failed: {}", ret);
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, aligned_size);
            ptr as *mut u8
        };
        Self {
            ptr,
            size: aligned_size,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fill_bytes(&mut self, data: &[u8]) {
        let len = data.len().min(self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, len);
        }
    }

    pub fn read_bytes(&self, len: usize) -> Vec<u8> {
        let len = len.min(self.size);
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr, buf.as_mut_ptr(), len);
        }
        buf
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::free(self.ptr as *mut std::ffi::c_void);
        }
    }
}

pub fn full_access() -> AccessFlags {
    AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ
}

/// One side of a test connection.
pub struct Side {
    pub ctx: Context,
    pub pd: ProtectionDomain,
    pub cq: CompletionQueue,
    pub id: CmId,
    pub qp: QueuePair,
    pub buf: AlignedBuffer,
    pub mr: MemoryRegion,
}

impl Side {
    pub fn sge(&self, offset: usize, len: u32) -> Sge {
        Sge {
            addr: self.buf.addr() + offset as u64,
            length: len,
            lkey: self.mr.lkey(),
        }
    }
}

/// A connected client/server pair sharing one fabric.
pub struct TestPair {
    pub fabric: Fabric,
    pub client: Side,
    pub server: Side,
}

fn attr() -> QpInitAttr {
    QpInitAttr {
        max_send_wr: 16,
        max_recv_wr: 16,
        max_send_sge: 1,
        max_recv_sge: 1,
        max_inline_data: 8,
    }
}

fn side_resources(fabric: &Fabric, addr: &str) -> (Context, ProtectionDomain, CompletionQueue, AlignedBuffer, MemoryRegion) {
    let ctx = fabric.open_device(addr).expect("open device");
    let pd = ctx.alloc_pd().expect("alloc pd");
    let cq = ctx.create_cq(64).expect("create cq");
    let buf = AlignedBuffer::new(PAGE_SIZE);
    let mr = unsafe { pd.register(buf.as_ptr(), buf.size(), full_access()) }.expect("register");
    (ctx, pd, cq, buf, mr)
}

impl TestPair {
    /// Connect a client and a server, optionally routing server receives
    /// through `server_srq`.
    pub fn connect(port: u16) -> Self {
        Self::connect_with(port, |_| None)
    }

    pub fn connect_with(
        port: u16,
        make_srq: impl FnOnce(&ProtectionDomain) -> Option<SharedReceiveQueue>,
    ) -> Self {
        let fabric = Fabric::new();

        let (sctx, spd, scq, sbuf, smr) = side_resources(&fabric, "10.0.0.1");
        let listener = sctx.listen("10.0.0.1", port).expect("listen");

        let (cctx, cpd, ccq, cbuf, cmr) = side_resources(&fabric, "10.0.0.2");
        let cid = cctx.create_id().expect("create id");
        cid.resolve("10.0.0.1", port, Duration::from_secs(1))
            .expect("resolve");
        let cqp = cid
            .create_qp(&cpd, &ccq, &ccq, None, &attr())
            .expect("client qp");
        cid.connect(b"hello").expect("connect");

        let req = listener.get_request();
        assert_eq!(req.private_data(), b"hello");
        let sid = req.into_id();
        let srq = make_srq(&spd);
        let sqp = sid
            .create_qp(&spd, &scq, &scq, srq.as_ref(), &attr())
            .expect("server qp");
        sid.accept(b"world").expect("accept");

        assert_eq!(
            sid.get_event(),
            CmEvent::Established {
                private_data: b"hello".to_vec()
            }
        );
        assert_eq!(
            cid.get_event(),
            CmEvent::Established {
                private_data: b"world".to_vec()
            }
        );

        TestPair {
            fabric,
            client: Side {
                ctx: cctx,
                pd: cpd,
                cq: ccq,
                id: cid,
                qp: cqp,
                buf: cbuf,
                mr: cmr,
            },
            server: Side {
                ctx: sctx,
                pd: spd,
                cq: scq,
                id: sid,
                qp: sqp,
                buf: sbuf,
                mr: smr,
            },
        }
    }
}

/// Poll CQ with timeout.
pub fn poll_cq_timeout(cq: &CompletionQueue, timeout_ms: u64) -> Option<WorkCompletion> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut out = Vec::with_capacity(1);
    loop {
        if cq.poll(1, &mut out).expect("poll") == 1 {
            return out.pop();
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let _ = cq.wait_timeout(deadline - now);
    }
}
