use std::sync::OnceLock;
use std::sync::atomic::{Ordering, fence};

/// Cache line size assumed by [`flush`].
pub const CACHE_LINE: usize = 64;

/// How cache lines are written back to the persistence domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMethod {
    /// CLWB - Cache Line Write Back (preferred, non-evicting)
    Clwb,
    /// CLFLUSHOPT - Optimized Cache Line Flush (evicting, weakly ordered)
    ClflushOpt,
    /// CLFLUSH - Cache Line Flush (evicting, strongly ordered)
    Clflush,
    /// No cache-line instruction available; only a store fence is issued.
    FenceOnly,
}

static FLUSH_METHOD: OnceLock<FlushMethod> = OnceLock::new();

/// Detect the best available cache flush method.
pub fn detect_flush_method() -> FlushMethod {
    #[cfg(target_arch = "x86_64")]
    #[allow(unused_unsafe)]
    unsafe {
        use std::arch::x86_64::__cpuid;

        // CPUID.07H:EBX.CLWB[bit 24], CPUID.07H:EBX.CLFLUSHOPT[bit 23]
        let leaf7 = __cpuid(7);
        if leaf7.ebx & (1 << 24) != 0 {
            return FlushMethod::Clwb;
        }
        if leaf7.ebx & (1 << 23) != 0 {
            return FlushMethod::ClflushOpt;
        }
        // CPUID.01H:EDX.CLFSH[bit 19]
        if __cpuid(1).edx & (1 << 19) != 0 {
            return FlushMethod::Clflush;
        }
        FlushMethod::FenceOnly
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        FlushMethod::FenceOnly
    }
}

/// The cached flush method, detected on first call.
pub fn flush_method() -> FlushMethod {
    *FLUSH_METHOD.get_or_init(|| {
        let method = detect_flush_method();
        log::debug!("pmem flush method: {:?}", method);
        method
    })
}

/// Write back the cache lines covering `[addr, addr + len)`.
///
/// # Safety
///
/// `addr` must point to a mapped range of at least `len` bytes.
#[inline]
pub unsafe fn flush(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let method = flush_method();
    if method == FlushMethod::FenceOnly {
        return;
    }

    let start = (addr as usize) & !(CACHE_LINE - 1);
    let end = (addr as usize) + len;
    let mut line = start;
    while line < end {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            let p = line as *const u8;
            match method {
                FlushMethod::Clwb => {
                    std::arch::asm!("clwb [{addr}]", addr = in(reg) p, options(nostack))
                }
                FlushMethod::ClflushOpt => {
                    std::arch::asm!("clflushopt [{addr}]", addr = in(reg) p, options(nostack))
                }
                FlushMethod::Clflush => {
                    std::arch::asm!("clflush [{addr}]", addr = in(reg) p, options(nostack))
                }
                FlushMethod::FenceOnly => {}
            }
        }
        line += CACHE_LINE;
    }
}

/// Order all previous flushes and stores before any later store.
#[inline]
pub fn drain() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("sfence", options(nostack));
    }
    fence(Ordering::SeqCst);
}

/// [`flush`] followed by [`drain`].
///
/// # Safety
///
/// `addr` must point to a mapped range of at least `len` bytes.
#[inline]
pub unsafe fn persist(addr: *const u8, len: usize) {
    unsafe {
        flush(addr, len);
    }
    drain();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_zero_length() {
        unsafe {
            flush(std::ptr::null(), 0);
        }
    }

    #[test]
    fn test_persist_keeps_data() {
        let data = vec![0u8; 256];
        unsafe {
            std::ptr::write_volatile(data.as_ptr() as *mut u8, 42);
            persist(data.as_ptr(), data.len());
        }
        let value = unsafe { std::ptr::read_volatile(data.as_ptr()) };
        assert_eq!(value, 42);
    }

    #[test]
    fn test_flush_unaligned() {
        let data = vec![0u8; 256];
        unsafe {
            flush(data.as_ptr().add(7), 100);
        }
        drain();
    }

    #[test]
    fn test_method_is_cached() {
        assert_eq!(flush_method(), flush_method());
        assert_eq!(flush_method(), detect_flush_method());
    }
}
