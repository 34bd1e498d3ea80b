//! Completion queue wait/poll.
//!
//! [`Cq`] wraps a fabric completion queue and admits one waiter at a time.
//! Every drained completion must pass [`CheckCompletion::check`] before its
//! payload is trusted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fabric::{CompletionQueue, Context, WorkCompletion};

use crate::error::{Error, Result};

/// Completion queue handle.
///
/// Clones share the queue and its single-waiter guard.
#[derive(Clone)]
pub struct Cq {
    cq: CompletionQueue,
    waiting: Arc<AtomicBool>,
}

struct WaitGuard<'a>(&'a AtomicBool);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Cq {
    pub(crate) fn new(ctx: &Context, depth: u32) -> Result<Self> {
        let cq = ctx.create_cq(depth).map_err(Error::provider("create_cq"))?;
        Ok(Self {
            cq,
            waiting: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn raw(&self) -> &CompletionQueue {
        &self.cq
    }

    /// Returns true if both handles drain the same queue.
    pub fn same_queue(&self, other: &Cq) -> bool {
        self.cq.ptr_eq(&other.cq)
    }

    fn enter(&self) -> Result<WaitGuard<'_>> {
        if self
            .waiting
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::Busy);
        }
        Ok(WaitGuard(&self.waiting))
    }

    /// Block until at least one completion is ready.
    ///
    /// # Errors
    /// [`Error::Busy`] if another thread is waiting on this queue.
    pub fn wait(&self) -> Result<()> {
        let _guard = self.enter()?;
        self.cq.wait().map_err(Error::provider("cq_wait"))
    }

    /// Block until a completion is ready or `timeout` elapses; returns
    /// whether a completion is ready.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let _guard = self.enter()?;
        self.cq
            .wait_timeout(timeout)
            .map_err(Error::provider("cq_wait"))
    }

    /// Move up to `max` ready completions into `out`; zero is not an error.
    pub fn get_completions(&self, max: usize, out: &mut Vec<WorkCompletion>) -> Result<usize> {
        if max == 0 {
            return Err(Error::InvalidArgument("max must be non-zero"));
        }
        self.cq.poll(max, out).map_err(Error::provider("cq_poll"))
    }

    /// Take one ready completion, if any.
    pub fn get_completion(&self) -> Result<Option<WorkCompletion>> {
        let mut out = Vec::with_capacity(1);
        self.get_completions(1, &mut out)?;
        Ok(out.pop())
    }

    /// Wait for and take one completion.
    pub fn next_completion(&self) -> Result<WorkCompletion> {
        loop {
            if let Some(wc) = self.get_completion()? {
                return Ok(wc);
            }
            self.wait()?;
        }
    }
}

/// Status check for work completions.
pub trait CheckCompletion {
    /// Converts a failure status into [`Error::CompletionFailed`].
    fn check(&self) -> Result<()>;
}

impl CheckCompletion for WorkCompletion {
    fn check(&self) -> Result<()> {
        if self.status.is_success() {
            Ok(())
        } else {
            Err(Error::CompletionFailed {
                status: self.status,
                opcode: self.opcode,
            })
        }
    }
}
