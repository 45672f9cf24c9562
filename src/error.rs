//! Error Types
//!
//! Recoverable failures of the device memory arena. Programming errors
//! (unknown handles, out-of-bounds offsets, bad address-table ids) are not
//! represented here: they panic at the call site.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::arena::MapHandle;

/// Errors returned by arena and backend operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The physical-memory device could not be opened.
    #[error("cannot open physical memory device {}: {source}", path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A mapping was requested before `open()` or after `close()`.
    #[error("physical memory device is not open")]
    NotOpen,

    /// The requested region intersects the arena's forbidden range.
    #[error("region [{addr:#x}, +{size:#x}) intersects the forbidden address range")]
    ForbiddenAddress { addr: usize, size: usize },

    /// The requested region runs past the end of the address space.
    #[error("region at {addr:#x} does not fit in the address space")]
    AddressOverflow { addr: usize },

    /// The backend refused to map or unmap a window.
    #[error("memory mapping failed: {0}")]
    MapFailed(#[source] io::Error),

    /// No live map is registered under this handle.
    #[error("unknown memory map handle {0}")]
    UnknownHandle(MapHandle),

    /// A batch of handles contained rejected entries.
    #[error("{count} memory map request(s) were rejected")]
    InvalidHandles { count: usize },

    /// A bounded register poll ran out of attempts.
    #[error("timed out polling map {handle} offset {offset:#x} after {attempts} reads")]
    Timeout {
        handle: MapHandle,
        offset: usize,
        attempts: u32,
    },
}

/// Result alias for arena operations.
pub type Result<T> = core::result::Result<T, Error>;
