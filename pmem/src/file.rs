use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap};

/// Map a regular file shared, creating it or extending it to `size` bytes.
///
/// An existing file longer than `size` is mapped whole.
///
/// # Safety
///
/// No other process may access the file in an incompatible way while the
/// mapping is alive.
pub(crate) unsafe fn map(path: &Path, size: usize) -> io::Result<(File, NonNull<u8>, usize)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    let current = file.metadata()?.len() as usize;
    if current < size {
        file.set_len(size as u64)?;
    }
    let len = current.max(size);
    let nz = NonZeroUsize::new(len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length must be non-zero"))?;

    let ptr = unsafe {
        mmap(
            None,
            nz,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            &file,
            0,
        )
    }
    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    log::debug!("mapped file {} ({} bytes)", path.display(), len);
    Ok((file, ptr.cast::<u8>(), len))
}
