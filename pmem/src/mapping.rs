use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::path::Path;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, MsFlags, ProtFlags, mmap_anonymous, msync, munmap};

use crate::flush::{self, CACHE_LINE};
use crate::{devdax, file};

/// Bytes cleared after a fresh signature is written.
const CLEAR_ON_INIT: usize = 4096;

/// Backing store of a [`Mapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// Device-DAX, mapped with `MAP_SYNC`; persisted by cache flush.
    DevDax,
    /// Regular file; persisted by `msync`.
    File,
    /// Anonymous memory; never persistent.
    Anonymous,
}

/// A memory mapping that can be registered with the fabric and persisted.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    kind: MappingKind,
    _file: Option<File>,
}

// The mapping is a plain memory range; synchronisation is the user's job.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Map `size` bytes.
///
/// - `Some("/dev/dax*")` maps the whole device-DAX device.
/// - `Some(other)` maps a regular file, created or extended to `size`.
/// - `None` maps anonymous, volatile memory.
///
/// # Safety
///
/// No other process may access the backing file or device in an incompatible
/// way while the mapping is alive.
pub unsafe fn map(path: Option<&Path>, size: usize) -> io::Result<Mapping> {
    let (file, ptr, len, kind) = match path {
        Some(path) if devdax::is_devdax(path) => {
            let (file, ptr, len) = unsafe { devdax::map(path)? };
            (Some(file), ptr, len, MappingKind::DevDax)
        }
        Some(path) => {
            let (file, ptr, len) = unsafe { file::map(path, size)? };
            (Some(file), ptr, len, MappingKind::File)
        }
        None => {
            let nz = NonZeroUsize::new(size).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "length must be non-zero")
            })?;
            let ptr = unsafe {
                mmap_anonymous(
                    None,
                    nz,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_PRIVATE,
                )
            }
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            (None, ptr.cast::<u8>(), size, MappingKind::Anonymous)
        }
    };
    Ok(Mapping {
        ptr,
        len,
        kind,
        _file: file,
    })
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

impl Mapping {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn kind(&self) -> MappingKind {
        self.kind
    }

    /// Returns true if [`Mapping::persist`] makes data durable.
    pub fn is_persistent(&self) -> bool {
        self.kind != MappingKind::Anonymous
    }

    /// Make `[offset, offset + len)` durable (or, for anonymous memory,
    /// ordered before later stores).
    ///
    /// # Errors
    /// `InvalidInput` if the range leaves the mapping.
    pub fn persist(&self, offset: usize, len: usize) -> io::Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.len)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "persist range {:#x}+{:#x} exceeds mapping of {:#x} bytes",
                        offset, len, self.len
                    ),
                )
            })?;
        if len == 0 {
            return Ok(());
        }
        match self.kind {
            MappingKind::DevDax => unsafe {
                flush::persist(self.ptr.as_ptr().add(offset), len);
            },
            MappingKind::File => {
                let page = page_size();
                let start = offset & !(page - 1);
                // SAFETY: start lies within the mapping, which starts page aligned.
                let addr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(start)) };
                unsafe { msync(addr.cast::<c_void>(), end - start, MsFlags::MS_SYNC) }
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            }
            MappingKind::Anonymous => flush::drain(),
        }
        Ok(())
    }

    /// Validate or stamp `sig` at the start of the mapping.
    ///
    /// Returns the offset at which application data starts (the signature
    /// length rounded up to a cache line). A mapping without the signature is
    /// treated as fresh: its first data bytes are cleared, the signature is
    /// written and both are persisted.
    pub fn ensure_signature(&mut self, sig: &[u8]) -> io::Result<usize> {
        let data_offset = sig.len().div_ceil(CACHE_LINE) * CACHE_LINE;
        if data_offset > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping too small for signature",
            ));
        }
        // SAFETY: the header lies within the mapping.
        let header = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), sig.len()) };
        if header == sig {
            return Ok(data_offset);
        }

        let clear = CLEAR_ON_INIT.min(self.len - data_offset);
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(data_offset), 0, clear);
        }
        self.persist(data_offset, clear)?;
        unsafe {
            std::ptr::copy_nonoverlapping(sig.as_ptr(), self.ptr.as_ptr(), sig.len());
        }
        self.persist(0, sig.len())?;
        log::info!("initialised mapping signature ({} bytes)", sig.len());
        Ok(data_offset)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast::<c_void>(), self.len);
        }
    }
}
