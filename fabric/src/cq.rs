//! Completion Queue (CQ) management.
//!
//! A Completion Queue is used to notify the application when work requests
//! have completed. CQs can be shared across multiple Queue Pairs.
//!
//! The fabric pushes completions from whichever thread drives the operation;
//! consumers either poll without blocking or block in [`CompletionQueue::wait`]
//! until a completion is available.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::Context;
use crate::types::WorkCompletion;
use crate::Fault;

struct CqEntries {
    queue: VecDeque<WorkCompletion>,
    /// Set once a completion had to be dropped; the CQ is unusable afterwards.
    overrun: bool,
}

pub(crate) struct CqInner {
    ctx: Context,
    depth: usize,
    entries: Mutex<CqEntries>,
    ready: Condvar,
}

/// Completion Queue.
///
/// This type uses `Arc` internally and can be cheaply cloned; clones refer to
/// the same queue.
#[derive(Clone)]
pub struct CompletionQueue(Arc<CqInner>);

impl Context {
    /// Create a Completion Queue with room for `depth` completions.
    ///
    /// # Errors
    /// `EINVAL` if `depth` is zero or above the device limit; any injected
    /// creation fault.
    pub fn create_cq(&self, depth: u32) -> io::Result<CompletionQueue> {
        let fabric = self.fabric();
        fabric.record_call();
        if depth == 0 || depth > self.query_device().max_cqe {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        fabric.take_errno_fault(Fault::CreateCq(0))?;
        Ok(CompletionQueue(Arc::new(CqInner {
            ctx: self.clone(),
            depth: depth as usize,
            entries: Mutex::new(CqEntries {
                queue: VecDeque::with_capacity(depth as usize),
                overrun: false,
            }),
            ready: Condvar::new(),
        })))
    }
}

impl CompletionQueue {
    /// Number of completions the queue can hold.
    pub fn depth(&self) -> u32 {
        self.0.depth as u32
    }

    /// The device context this CQ belongs to.
    pub fn context(&self) -> &Context {
        &self.0.ctx
    }

    /// Returns true if both handles refer to the same queue.
    pub fn ptr_eq(&self, other: &CompletionQueue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Move up to `max` ready completions into `out` without blocking.
    ///
    /// Returns the number of completions moved; zero is not an error.
    ///
    /// # Errors
    /// `EOVERFLOW` once the queue has overrun.
    pub fn poll(&self, max: usize, out: &mut Vec<WorkCompletion>) -> io::Result<usize> {
        let mut entries = self.0.entries.lock();
        if entries.overrun {
            return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
        }
        let n = max.min(entries.queue.len());
        out.extend(entries.queue.drain(..n));
        Ok(n)
    }

    /// Block until at least one completion is available.
    ///
    /// # Errors
    /// `EOVERFLOW` once the queue has overrun.
    pub fn wait(&self) -> io::Result<()> {
        let mut entries = self.0.entries.lock();
        loop {
            if entries.overrun {
                return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
            }
            if !entries.queue.is_empty() {
                return Ok(());
            }
            self.0.ready.wait(&mut entries);
        }
    }

    /// Block until a completion is available or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.0.entries.lock();
        loop {
            if entries.overrun {
                return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
            }
            if !entries.queue.is_empty() {
                return Ok(true);
            }
            if self.0.ready.wait_until(&mut entries, deadline).timed_out() {
                return Ok(!entries.queue.is_empty());
            }
        }
    }

    /// Number of completions ready to be polled.
    pub fn pending(&self) -> usize {
        self.0.entries.lock().queue.len()
    }

    pub(crate) fn push(&self, wc: WorkCompletion) {
        let mut entries = self.0.entries.lock();
        if entries.queue.len() >= self.0.depth {
            log::warn!(
                "completion queue overrun (depth {}), dropping {:?}",
                self.0.depth,
                wc
            );
            entries.overrun = true;
        } else {
            entries.queue.push_back(wc);
        }
        self.0.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WcOpcode, WcStatus};
    use crate::Fabric;

    fn wc(wr_id: u64) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
            qp_num: 1,
        }
    }

    #[test]
    fn test_poll_empty_is_not_an_error() {
        let ctx = Fabric::new().open_device("10.0.0.1").unwrap();
        let cq = ctx.create_cq(4).unwrap();
        let mut out = Vec::new();
        assert_eq!(cq.poll(4, &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_poll_respects_max_and_order() {
        let ctx = Fabric::new().open_device("10.0.0.1").unwrap();
        let cq = ctx.create_cq(4).unwrap();
        for i in 0..3 {
            cq.push(wc(i));
        }
        let mut out = Vec::new();
        assert_eq!(cq.poll(2, &mut out).unwrap(), 2);
        assert_eq!(cq.poll(2, &mut out).unwrap(), 1);
        let ids: Vec<u64> = out.iter().map(|w| w.wr_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_overrun_invalidates_queue() {
        let ctx = Fabric::new().open_device("10.0.0.1").unwrap();
        let cq = ctx.create_cq(1).unwrap();
        cq.push(wc(0));
        cq.push(wc(1));
        let mut out = Vec::new();
        let err = cq.poll(1, &mut out).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EOVERFLOW));
        assert!(cq.wait().is_err());
    }

    #[test]
    fn test_wait_wakes_on_push() {
        let ctx = Fabric::new().open_device("10.0.0.1").unwrap();
        let cq = ctx.create_cq(4).unwrap();
        let pusher = cq.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            pusher.push(wc(9));
        });
        cq.wait().unwrap();
        assert_eq!(cq.pending(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let ctx = Fabric::new().open_device("10.0.0.1").unwrap();
        let cq = ctx.create_cq(4).unwrap();
        assert!(!cq.wait_timeout(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_create_rejects_bad_depth_and_faults() {
        let fabric = Fabric::new();
        let ctx = fabric.open_device("10.0.0.1").unwrap();
        assert!(ctx.create_cq(0).is_err());
        fabric.inject(Fault::CreateCq(libc::ENOMEM));
        let err = ctx.create_cq(4).err().unwrap();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
        assert!(ctx.create_cq(4).is_ok());
    }
}
