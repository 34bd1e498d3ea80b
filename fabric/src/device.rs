//! Devices and context management.
//!
//! A device is a port on a [`Fabric`] identified by an address string. Opening
//! it yields a [`Context`], the root from which every other resource is
//! created.

use std::io;
use std::sync::Arc;

use crate::types::DeviceAttr;
use crate::Fabric;

pub(crate) struct ContextInner {
    fabric: Fabric,
    addr: String,
    attr: DeviceAttr,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        log::trace!("closing fabric device {}", self.addr);
    }
}

/// An opened fabric device context.
///
/// This type uses `Arc` internally and can be cheaply cloned.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

impl Fabric {
    /// Open the device reachable at `addr`.
    ///
    /// # Errors
    /// Returns `EINVAL` for an empty address.
    pub fn open_device(&self, addr: &str) -> io::Result<Context> {
        self.record_call();
        if addr.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        log::trace!("opened fabric device {}", addr);
        Ok(Context(Arc::new(ContextInner {
            fabric: self.clone(),
            addr: addr.to_owned(),
            attr: DeviceAttr::default(),
        })))
    }
}

impl Context {
    /// The fabric this device is attached to.
    pub fn fabric(&self) -> &Fabric {
        &self.0.fabric
    }

    /// The device address.
    pub fn addr(&self) -> &str {
        &self.0.addr
    }

    /// Query device limits.
    pub fn query_device(&self) -> DeviceAttr {
        self.0.attr
    }

    pub(crate) fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("addr", &self.0.addr).finish()
    }
}
