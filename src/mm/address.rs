//! Physical Addresses and Mapping Windows
//!
//! Pure arithmetic used before any syscall is issued: page alignment of
//! physical ranges and the forbidden-range policy.
//!
//! # Properties
//! - Physical addresses are never dereferenced; they only select a device
//!   offset for the mapping backend
//! - Every computation here is free of side effects and can be unit tested
//!   without a physical-memory device

use core::fmt;
use core::ops::Range;

/// Default page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// A physical memory address.
///
/// A newtype so that physical addresses cannot be confused with virtual
/// ones. There is no way to turn a `PhysAddr` into a pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is aligned to `page_size`.
    #[inline]
    pub const fn is_aligned(self, page_size: usize) -> bool {
        self.0 & page_mask(page_size) == 0
    }

    /// Align the address down to the enclosing page boundary.
    #[inline]
    pub const fn align_down(self, page_size: usize) -> Self {
        Self(self.0 & !page_mask(page_size))
    }

    /// Offset of the address inside its page.
    #[inline]
    pub const fn page_offset(self, page_size: usize) -> usize {
        self.0 & page_mask(page_size)
    }

    /// Add a byte offset, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for PhysAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

/// Mask selecting the in-page bits. `page_size` must be a power of two.
#[inline]
pub const fn page_mask(page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two());
    page_size - 1
}

/// Round `len` up to a multiple of `page_size`, `None` on overflow.
#[inline]
pub const fn align_up(len: usize, page_size: usize) -> Option<usize> {
    match len.checked_add(page_mask(page_size)) {
        Some(end) => Some(end & !page_mask(page_size)),
        None => None,
    }
}

/// The page-aligned window the backend must map so that
/// `[phys, phys + size)` is fully covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapWindow {
    /// Page-aligned physical base handed to the backend.
    pub base: PhysAddr,
    /// Offset of the requested address inside the first page.
    pub offset: usize,
    /// Length of the mapping request, a whole number of pages.
    pub len: usize,
}

impl MapWindow {
    /// Compute the window for `size` bytes starting at `phys`.
    ///
    /// Returns `None` if the page-rounded length does not fit in a `usize`.
    pub const fn covering(phys: PhysAddr, size: usize, page_size: usize) -> Option<Self> {
        let offset = phys.page_offset(page_size);
        let len = match offset.checked_add(size) {
            Some(end) => align_up(end, page_size),
            None => None,
        };
        match len {
            Some(len) => Some(Self {
                base: phys.align_down(page_size),
                offset,
                len,
            }),
            None => None,
        }
    }
}

/// Half-open physical interval `[low, high)` that must never be mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForbiddenRange {
    low: usize,
    high: usize,
}

impl ForbiddenRange {
    /// An empty range: nothing is forbidden.
    pub const NONE: Self = Self { low: 0, high: 0 };

    /// Create a forbidden range. `high <= low` yields an empty range.
    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Lower bound (inclusive).
    #[inline]
    pub const fn low(&self) -> usize {
        self.low
    }

    /// Upper bound (exclusive).
    #[inline]
    pub const fn high(&self) -> usize {
        self.high
    }

    /// Check if nothing is forbidden.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.high <= self.low
    }

    /// Check if `[addr, addr + size)` intersects the forbidden range.
    ///
    /// A zero-sized request is treated as the single byte at `addr`. Ranges
    /// running past the end of the address space saturate.
    pub const fn intersects(&self, addr: usize, size: usize) -> bool {
        if self.is_empty() {
            return false;
        }
        let end = if size == 0 {
            addr.saturating_add(1)
        } else {
            addr.saturating_add(size)
        };
        addr < self.high && self.low < end
    }

    /// The forbidden interval as a `Range`.
    pub const fn as_range(&self) -> Range<usize> {
        self.low..self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        let addr = PhysAddr::new(0x4008_1234);
        assert!(!addr.is_aligned(PAGE_SIZE));
        assert_eq!(addr.align_down(PAGE_SIZE).as_usize(), 0x4008_1000);
        assert_eq!(addr.page_offset(PAGE_SIZE), 0x234);
        assert_eq!(align_up(0x1001, PAGE_SIZE), Some(0x2000));
        assert_eq!(align_up(0x1000, PAGE_SIZE), Some(0x1000));
        assert_eq!(align_up(usize::MAX - 10, PAGE_SIZE), None);
    }

    #[test]
    fn test_window_aligned_base() {
        let w = MapWindow::covering(PhysAddr::new(0x4000_0000), 4096, PAGE_SIZE).unwrap();
        assert_eq!(w.base.as_usize(), 0x4000_0000);
        assert_eq!(w.offset, 0);
        assert_eq!(w.len, 4096);
    }

    #[test]
    fn test_window_covers_in_page_offset() {
        // 16 bytes straddling a page boundary need two pages
        let w = MapWindow::covering(PhysAddr::new(0x4000_0ff8), 16, PAGE_SIZE).unwrap();
        assert_eq!(w.base.as_usize(), 0x4000_0000);
        assert_eq!(w.offset, 0xff8);
        assert_eq!(w.len, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_window_large_pages() {
        let w = MapWindow::covering(PhysAddr::new(0x8001_2345), 8, 0x1_0000).unwrap();
        assert_eq!(w.base.as_usize(), 0x8001_0000);
        assert_eq!(w.offset, 0x2345);
        assert_eq!(w.len, 0x1_0000);
    }

    #[test]
    fn test_window_overflow() {
        // The in-page offset pushes the length past usize::MAX
        assert_eq!(
            MapWindow::covering(PhysAddr::new(0x4000_0010), usize::MAX - 4, PAGE_SIZE),
            None
        );
        // Rounding up to a whole page overflows
        assert_eq!(
            MapWindow::covering(PhysAddr::new(0x4000_0000), usize::MAX - 100, PAGE_SIZE),
            None
        );
        let w = MapWindow::covering(PhysAddr::new(0), usize::MAX & !0xfff, PAGE_SIZE).unwrap();
        assert_eq!(w.len, usize::MAX & !0xfff);
    }

    #[test]
    fn test_forbidden_inside() {
        let f = ForbiddenRange::new(0x1000_0000, 0x2000_0000);
        assert!(f.intersects(0x1000_0000, 16));
        assert!(f.intersects(0x1800_0000, 4096));
    }

    #[test]
    fn test_forbidden_edges() {
        let f = ForbiddenRange::new(0x1000_0000, 0x2000_0000);
        // Ends exactly at low: no overlap
        assert!(!f.intersects(0x0fff_fff0, 16));
        // Straddles low
        assert!(f.intersects(0x0fff_fff0, 17));
        // Starts exactly at high: no overlap
        assert!(!f.intersects(0x2000_0000, 16));
        // Covers the whole range
        assert!(f.intersects(0, usize::MAX));
    }

    #[test]
    fn test_forbidden_empty() {
        assert!(!ForbiddenRange::NONE.intersects(0, 4096));
        assert!(!ForbiddenRange::new(0x2000, 0x1000).intersects(0x1800, 4));
    }
}
