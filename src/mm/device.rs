//! Physical Memory Devices
//!
//! The only OS-level dependency of the crate. A [`MemoryDevice`] is opened
//! once by the arena and yields a shared [`PhysMemory`] descriptor from
//! which every memory map requests its window.
//!
//! # Backends
//! - [`DevMem`]: a character device (normally `/dev/mem`) mapped with
//!   `mmap(MAP_SHARED)`
//! - `SimDevice` (see `sim`): in-process memory for tests

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::rc::Rc;

use super::address::{PhysAddr, PAGE_SIZE};
use super::table::Protection;
use crate::error::{Error, Result};

/// Default physical-memory device path.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/mem";

/// An opened physical-memory descriptor.
///
/// Implementations hand out raw windows; they never interpret the memory.
pub trait PhysMemory {
    /// Granularity of mapping requests. Must be a power of two.
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Map `len` bytes starting at the page-aligned physical address `base`.
    fn map(&self, base: PhysAddr, len: usize, protection: Protection) -> io::Result<NonNull<u8>>;

    /// Release a window previously returned by [`PhysMemory::map`].
    ///
    /// # Safety
    /// `addr` and `len` must come from one successful `map` call on this
    /// descriptor, and no access through the window may follow.
    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()>;
}

/// Something that can be opened into a [`PhysMemory`] descriptor.
pub trait MemoryDevice {
    /// Acquire the descriptor.
    fn open(&self) -> Result<Rc<dyn PhysMemory>>;

    /// Identity of the device, for diagnostics.
    fn path(&self) -> &Path;
}

/// Physical memory exposed through a character device such as `/dev/mem`.
#[derive(Debug, Clone)]
pub struct DevMem {
    path: PathBuf,
}

impl DevMem {
    /// Use the device at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DevMem {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_PATH)
    }
}

impl MemoryDevice for DevMem {
    fn open(&self) -> Result<Rc<dyn PhysMemory>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&self.path)
            .map_err(|source| Error::DeviceUnavailable {
                path: self.path.clone(),
                source,
            })?;

        Ok(Rc::new(DevMemFile {
            file,
            page_size: system_page_size(),
        }))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// The opened device file. Closed when the last map and the arena drop it.
#[derive(Debug)]
pub struct DevMemFile {
    file: File,
    page_size: usize,
}

impl PhysMemory for DevMemFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&self, base: PhysAddr, len: usize, protection: Protection) -> io::Result<NonNull<u8>> {
        let offset = libc::off_t::try_from(base.as_usize())
            .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;

        // SAFETY: A fresh mapping is requested (no fixed address), so no
        // existing memory is replaced. The fd stays open for the call.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                protection.to_prot(),
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                offset,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: Caller guarantees the window came from `map` and is unused.
        let ret = unsafe { libc::munmap(addr.as_ptr().cast(), len) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Page size reported by the OS, falling back to 4 KiB.
fn system_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    match usize::try_from(size) {
        Ok(size) if size.is_power_of_two() => size,
        _ => PAGE_SIZE,
    }
}
