//! Volatile Register Window
//!
//! [`MmioRegion`] wraps the virtual window of one mapping. It never hands
//! out pointers or references into device memory: every access is a
//! bounds-checked `read_volatile`/`write_volatile` at the computed address,
//! so the compiler cannot cache, merge, reorder or elide it.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

mod sealed {
    pub trait Sealed {}
}

/// A plain value that can be loaded from or stored to a register.
///
/// Implemented for the fixed-width integers and floats.
pub trait Register: sealed::Sealed + Copy {}

macro_rules! impl_register {
    ($($t:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $t {}
            impl Register for $t {}
        )*
    };
}

impl_register!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// The mapped window of a memory map.
#[derive(Debug)]
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
}

impl MmioRegion {
    /// Wrap a mapped window.
    ///
    /// # Safety
    /// `base` must be valid for volatile reads (and writes, if the mapping
    /// is writable) of `len` bytes for the lifetime of the region.
    pub(crate) unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Window length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the window is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Virtual address of the window, for diagnostics only.
    #[inline]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Validated pointer to `count` consecutive `T` at `offset`.
    ///
    /// # Panics
    /// Panics if the run leaves the window or the address is misaligned
    /// for `T`.
    fn ptr<T>(&self, offset: usize, count: usize) -> *mut T {
        let end = size_of::<T>()
            .checked_mul(count)
            .and_then(|bytes| offset.checked_add(bytes));
        match end {
            Some(end) if end <= self.len => {}
            _ => panic!(
                "register access at offset {:#x} ({} x {} bytes) exceeds window of {:#x} bytes",
                offset,
                count,
                size_of::<T>(),
                self.len
            ),
        }

        // SAFETY: offset + size_of::<T>() * count <= len, so the pointer
        // stays inside the window.
        let p = unsafe { self.base.as_ptr().add(offset) };
        assert!(
            (p as usize) % align_of::<T>() == 0,
            "register access at offset {:#x} is not aligned to {} bytes",
            offset,
            align_of::<T>()
        );
        p.cast::<T>()
    }

    /// Load one value.
    #[inline]
    pub fn read<T: Register>(&self, offset: usize) -> T {
        let p = self.ptr::<T>(offset, 1);
        // SAFETY: In bounds and aligned (checked by `ptr`); the window is
        // readable per the constructor contract.
        unsafe { ptr::read_volatile(p) }
    }

    /// Store one value.
    ///
    /// The caller (the owning map) is responsible for the write permission.
    #[inline]
    pub(crate) fn write<T: Register>(&self, offset: usize, value: T) {
        let p = self.ptr::<T>(offset, 1);
        // SAFETY: In bounds and aligned; the owning map only calls this on
        // writable windows.
        unsafe { ptr::write_volatile(p, value) }
    }

    /// Read-modify-write of one 32-bit word: one load, one store.
    #[inline]
    pub(crate) fn modify(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let p = self.ptr::<u32>(offset, 1);
        // SAFETY: Same as `read` and `write`.
        unsafe {
            let old = ptr::read_volatile(p);
            ptr::write_volatile(p, f(old));
        }
    }

    /// Load `dst.len()` consecutive values starting at `offset`.
    pub fn read_into<T: Register>(&self, offset: usize, dst: &mut [T]) {
        let p = self.ptr::<T>(offset, dst.len());
        for (i, slot) in dst.iter_mut().enumerate() {
            // SAFETY: The whole run was bounds-checked by `ptr`.
            *slot = unsafe { ptr::read_volatile(p.add(i)) };
        }
    }

    /// Store `src` as consecutive values starting at `offset`.
    pub(crate) fn write_from<T: Register>(&self, offset: usize, src: &[T]) {
        let p = self.ptr::<T>(offset, src.len());
        for (i, value) in src.iter().enumerate() {
            // SAFETY: The whole run was bounds-checked by `ptr`.
            unsafe { ptr::write_volatile(p.add(i), *value) };
        }
    }
}
