//! Connection configuration.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::srq::SharedRxQueue;

/// Scatter/gather entries per work request.
pub const MAX_SGE: u32 = 1;
/// Largest payload sent inline.
pub const MAX_INLINE_DATA: u32 = 8;
/// Default depth of every queue.
pub const DEFAULT_QUEUE_SIZE: u32 = 10;
/// Default route resolution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Largest queue depth accepted.
pub const MAX_QUEUE_SIZE: u32 = fabric::types::MAX_QP_WR;

/// Parameters negotiated for one connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Route resolution timeout (active side).
    pub timeout: Duration,
    /// Send completion queue depth.
    pub cq_size: u32,
    /// Receive completion queue depth; 0 shares the send CQ.
    pub rcq_size: u32,
    /// Send queue depth.
    pub sq_size: u32,
    /// Receive queue depth; ignored with a shared receive queue.
    pub rq_size: u32,
    /// Payloads up to this size are sent inline.
    pub max_inline_data: u32,
    /// Shared receive queue serving this connection's receives.
    pub srq: Option<SharedRxQueue>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            cq_size: DEFAULT_QUEUE_SIZE,
            rcq_size: DEFAULT_QUEUE_SIZE,
            sq_size: DEFAULT_QUEUE_SIZE,
            rq_size: DEFAULT_QUEUE_SIZE,
            max_inline_data: MAX_INLINE_DATA,
            srq: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("timeout", &self.timeout)
            .field("cq_size", &self.cq_size)
            .field("rcq_size", &self.rcq_size)
            .field("sq_size", &self.sq_size)
            .field("rq_size", &self.rq_size)
            .field("max_inline_data", &self.max_inline_data)
            .field("srq", &self.srq.is_some())
            .finish()
    }
}

impl ConnectionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cq_size(mut self, size: u32) -> Self {
        self.cq_size = size;
        self
    }

    pub fn with_rcq_size(mut self, size: u32) -> Self {
        self.rcq_size = size;
        self
    }

    pub fn with_sq_size(mut self, size: u32) -> Self {
        self.sq_size = size;
        self
    }

    pub fn with_rq_size(mut self, size: u32) -> Self {
        self.rq_size = size;
        self
    }

    pub fn with_max_inline_data(mut self, size: u32) -> Self {
        self.max_inline_data = size;
        self
    }

    pub fn with_srq(mut self, srq: SharedRxQueue) -> Self {
        self.srq = Some(srq);
        self
    }

    /// Check every limit without touching the fabric.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidArgument("timeout must be non-zero"));
        }
        if self.cq_size == 0 || self.sq_size == 0 {
            return Err(Error::InvalidArgument("queue sizes must be non-zero"));
        }
        if self.srq.is_none() && self.rq_size == 0 {
            return Err(Error::InvalidArgument("receive queue size must be non-zero"));
        }
        if self.max_inline_data > MAX_INLINE_DATA {
            return Err(Error::ResourceExhausted("inline data size above limit"));
        }
        if [self.cq_size, self.rcq_size, self.sq_size, self.rq_size]
            .iter()
            .any(|&size| size > MAX_QUEUE_SIZE)
        {
            return Err(Error::ResourceExhausted("queue size above limit"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.timeout, Duration::from_millis(1000));
        assert_eq!(cfg.sq_size, 10);
        assert_eq!(cfg.rq_size, 10);
        assert_eq!(cfg.cq_size, 10);
        assert_eq!(cfg.rcq_size, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_limits() {
        let err = ConnectionConfig::default()
            .with_max_inline_data(MAX_INLINE_DATA + 1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));

        let err = ConnectionConfig::default()
            .with_sq_size(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = ConnectionConfig::default()
            .with_cq_size(MAX_QUEUE_SIZE + 1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));

        assert!(
            ConnectionConfig::default()
                .with_rcq_size(0)
                .validate()
                .is_ok()
        );
    }
}
