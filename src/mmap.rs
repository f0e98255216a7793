use crate::error::StoreError;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr::NonNull;

/// Prefix selecting a POSIX shared-memory object instead of a file.
pub(crate) const SHM_PREFIX: &str = "shm:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    ReadOnly,
    ReadWrite,
}

/// Opens an existing store location and returns it with its current size.
///
/// `shm:NAME` opens the POSIX shared-memory object `NAME` (which must start
/// with `'/'`); anything else is a filesystem path.
pub(crate) fn open_existing(location: &str, access: Access) -> Result<(File, usize), StoreError> {
    let file = match location.strip_prefix(SHM_PREFIX) {
        Some(name) => {
            let flags = match access {
                Access::ReadOnly => libc::O_RDONLY,
                Access::ReadWrite => libc::O_RDWR,
            };
            shm_open(location, name, flags)?
        }
        None => OpenOptions::new()
            .read(true)
            .write(access == Access::ReadWrite)
            .open(location)
            .map_err(|e| StoreError::open_failure("open", location, e))?,
    };
    let len = file
        .metadata()
        .map_err(|e| StoreError::open_failure("stat", location, e))?
        .len();
    let len = usize::try_from(len).map_err(|_| StoreError::corrupt("store larger than address space"))?;
    Ok((file, len))
}

/// Creates (or truncates) a store location and sizes it to `size` bytes.
pub(crate) fn create(location: &str, size: usize) -> Result<File, StoreError> {
    let file = match location.strip_prefix(SHM_PREFIX) {
        Some(name) => shm_open(location, name, libc::O_CREAT | libc::O_RDWR)?,
        None => OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(location)
            .map_err(|e| StoreError::open_failure("create", location, e))?,
    };
    // A fresh length zero-fills, so every record sequence starts at 0.
    file.set_len(0)
        .and_then(|()| file.set_len(size as u64))
        .map_err(|e| StoreError::open_failure("resize", location, e))?;
    Ok(file)
}

fn shm_open(location: &str, name: &str, flags: libc::c_int) -> Result<File, StoreError> {
    let c_name = std::ffi::CString::new(name).map_err(|_| {
        StoreError::open_failure(
            "shm_open",
            location,
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600) };
    if fd == -1 {
        return Err(StoreError::open_failure(
            "shm_open",
            location,
            std::io::Error::last_os_error(),
        ));
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Maps `size` bytes of `file` shared between processes.
///
/// The descriptor may be closed once this returns; the mapping stays valid.
pub(crate) fn map_shared(
    location: &str,
    file: &File,
    size: usize,
    access: Access,
) -> Result<NonNull<u8>, StoreError> {
    let prot = match access {
        Access::ReadOnly => libc::PROT_READ,
        Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(StoreError::open_failure(
            "mmap",
            location,
            std::io::Error::last_os_error(),
        ));
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
        StoreError::open_failure("mmap", location, std::io::Error::other("null mapping"))
    })
}

pub(crate) unsafe fn unmap_shared(ptr: NonNull<u8>, size: usize) -> Result<(), std::io::Error> {
    unsafe {
        if libc::munmap(ptr.as_ptr().cast(), size) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Removes a store location.
pub(crate) fn unlink(location: &str) -> Result<(), StoreError> {
    match location.strip_prefix(SHM_PREFIX) {
        Some(name) => {
            let c_name = std::ffi::CString::new(name).map_err(|_| {
                StoreError::open_failure(
                    "unlink",
                    location,
                    std::io::Error::from(std::io::ErrorKind::InvalidInput),
                )
            })?;
            if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
                return Err(StoreError::open_failure(
                    "unlink",
                    location,
                    std::io::Error::last_os_error(),
                ));
            }
            Ok(())
        }
        None => std::fs::remove_file(location)
            .map_err(|e| StoreError::open_failure("unlink", location, e)),
    }
}
