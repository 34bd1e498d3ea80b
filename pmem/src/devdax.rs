use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap};

/// `MAP_SYNC`: page faults synchronously persist the file metadata.
const MAP_SYNC: i32 = 0x80000;

/// Returns true if `path` names a device-DAX character device.
pub fn is_devdax(path: &Path) -> bool {
    path.to_str().is_some_and(|p| p.starts_with("/dev/dax"))
}

fn device_size(path: &Path, file: &File) -> io::Result<usize> {
    let meta = file.metadata()?;
    if !meta.file_type().is_char_device() {
        return Ok(meta.len() as usize);
    }
    // Character devices report zero length; sysfs carries the real size.
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad device path"))?;
    let sysfs = format!("/sys/bus/dax/devices/{}/size", name);
    std::fs::read_to_string(&sysfs)?
        .trim()
        .parse::<usize>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Map a whole device-DAX device with `MAP_SHARED_VALIDATE | MAP_SYNC`.
///
/// # Safety
///
/// No other process may access the device in an incompatible way while the
/// mapping is alive.
pub(crate) unsafe fn map(path: &Path) -> io::Result<(File, NonNull<u8>, usize)> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = device_size(path, &file)?;
    let nz = NonZeroUsize::new(len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "device size is zero"))?;

    let flags = MapFlags::from_bits_truncate(libc::MAP_SHARED_VALIDATE)
        | MapFlags::from_bits_truncate(MAP_SYNC);
    let ptr = unsafe {
        mmap(
            None,
            nz,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            flags,
            &file,
            0,
        )
    }
    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    log::debug!("mapped device-DAX {} ({} bytes)", path.display(), len);
    Ok((file, ptr.cast::<u8>(), len))
}
