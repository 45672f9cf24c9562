//! Map Handles
//!
//! A [`MapHandle`] is an opaque key into the arena registry. It is never a
//! pointer: a stale handle fails lookup instead of touching freed memory.
//!
//! # Allocation
//! - Released handles are reused first, most recently released first
//! - Otherwise the next never-used value is minted
//! - Both paths are O(1)

use core::fmt;

use log::debug;

/// Opaque identifier of a live memory map.
///
/// This is a newtype to prevent using arbitrary integers as handles.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MapHandle(u32);

impl MapHandle {
    /// Returned in place of a handle when a mapping request is rejected.
    pub const INVALID: Self = Self(u32::MAX);

    /// Create a handle from a raw value.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this is the rejection sentinel.
    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Check if this is a real handle.
    #[inline]
    pub const fn is_valid(self) -> bool {
        !self.is_invalid()
    }
}

impl fmt::Debug for MapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "MapHandle(invalid)")
        } else {
            write!(f, "MapHandle({})", self.0)
        }
    }
}

impl fmt::Display for MapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "<invalid>")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Issues and recycles map handles.
#[derive(Debug, Default)]
pub struct HandlePool {
    /// Released handles, most recent last.
    reusable: Vec<MapHandle>,
    /// Next never-used value.
    next: u32,
}

impl HandlePool {
    /// Create an empty pool.
    pub const fn new() -> Self {
        Self {
            reusable: Vec::new(),
            next: 0,
        }
    }

    /// Get a handle.
    ///
    /// # Panics
    /// Panics if every value below the sentinel has been minted and none
    /// was released.
    pub fn allocate(&mut self) -> MapHandle {
        if let Some(handle) = self.reusable.pop() {
            debug!("reusing map handle {}", handle);
            return handle;
        }
        let handle = MapHandle(self.next);
        assert!(handle.is_valid(), "map handle space exhausted");
        self.next += 1;
        handle
    }

    /// Return a handle to the pool.
    ///
    /// The handle is not validated; callers release each handle at most once.
    pub fn release(&mut self, handle: MapHandle) {
        self.reusable.push(handle);
    }

    /// Number of handles waiting for reuse.
    pub fn reusable(&self) -> usize {
        self.reusable.len()
    }
}
