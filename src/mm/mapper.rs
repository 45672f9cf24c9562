//! Memory Maps
//!
//! A [`MemoryMap`] owns one virtual window onto a physical address range.
//! It holds only the physical-memory descriptor it was built with and never
//! refers back to the arena that owns it.
//!
//! # Lifecycle
//! ```text
//! Closed ──open()──> Opened ──close()/drop──> Closed
//!                       │
//!                       └──mmap/munmap error──> Failed (terminal)
//! ```
//! A failed `open()` also lands in `Failed`. Failures are logged and never
//! returned as errors: callers poll [`MemoryMap::status`].
//!
//! # Write protection
//! Write-class accessors on a `READ_ONLY` map log a warning and leave the
//! memory untouched.

use core::fmt;
use core::ptr::NonNull;
use std::io;
use std::rc::Rc;

use log::{debug, error, warn};

use super::address::{MapWindow, PhysAddr};
use super::device::PhysMemory;
use super::mmio::{MmioRegion, Register};
use super::table::{AddressTableEntry, Protection};
use crate::arena::MapHandle;
use crate::error::{Error, Result};

/// State of a memory map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapStatus {
    /// Not mapped.
    Closed,
    /// Mapped; the virtual base is valid.
    Opened,
    /// A mapping syscall failed. Terminal for this instance.
    Failed,
}

impl fmt::Display for MapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opened => write!(f, "opened"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a map's parameters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MapParams {
    /// Virtual base of the usable window, `None` unless opened.
    pub virt_addr: Option<usize>,
    pub status: MapStatus,
    pub phys_addr: usize,
    pub mapped_size: usize,
    pub protection: Protection,
}

/// The live OS mapping behind an opened map.
#[derive(Debug)]
struct Mapping {
    /// Page-aligned address returned by the backend.
    raw: NonNull<u8>,
    /// Length passed to the backend.
    raw_len: usize,
    /// Usable window starting at the requested physical address.
    region: MmioRegion,
}

/// One mapping of a physical range into the process address space.
pub struct MemoryMap {
    handle: MapHandle,
    phys_addr: PhysAddr,
    block_size: usize,
    block_count: usize,
    mapped_size: usize,
    protection: Protection,
    status: MapStatus,
    mapping: Option<Mapping>,
    memory: Rc<dyn PhysMemory>,
}

impl MemoryMap {
    /// Create a closed map for an address-table entry.
    ///
    /// An entry whose total size overflows starts out `Failed`.
    pub fn new(handle: MapHandle, entry: &AddressTableEntry, memory: Rc<dyn PhysMemory>) -> Self {
        let (mapped_size, status) = match entry.total_size() {
            Some(size) => (size, MapStatus::Closed),
            None => {
                error!(
                    "map {}: {} blocks of {:#x} bytes at {:#x} overflow the address space",
                    handle, entry.block_count, entry.range, entry.phys_addr
                );
                (0, MapStatus::Failed)
            }
        };
        Self {
            handle,
            phys_addr: PhysAddr::new(entry.phys_addr),
            block_size: entry.range,
            block_count: entry.block_count,
            mapped_size,
            protection: entry.protection,
            status,
            mapping: None,
            memory,
        }
    }

    /// Map the window.
    ///
    /// On failure the status becomes `Failed` and the error is logged.
    /// Calling `open` on an opened or failed map does nothing.
    pub fn open(&mut self) -> MapStatus {
        if self.status != MapStatus::Closed {
            return self.status;
        }

        match self.map_window() {
            Ok(mapping) => {
                debug!(
                    "map {}: {} +{:#x} ({}) at {:#x}",
                    self.handle,
                    self.phys_addr,
                    self.mapped_size,
                    self.protection,
                    mapping.region.addr()
                );
                self.mapping = Some(mapping);
                self.status = MapStatus::Opened;
            }
            Err(e) => {
                error!(
                    "map {}: cannot map {} +{:#x} to user space: {}",
                    self.handle, self.phys_addr, self.mapped_size, e
                );
                self.status = MapStatus::Failed;
            }
        }
        self.status
    }

    /// Ask the backend for the page-aligned window covering this map.
    fn map_window(&self) -> Result<Mapping> {
        let page_size = self.memory.page_size();
        let window = MapWindow::covering(self.phys_addr, self.mapped_size, page_size)
            .ok_or_else(|| Error::MapFailed(io::Error::from_raw_os_error(libc::EOVERFLOW)))?;
        let raw = self
            .memory
            .map(window.base, window.len, self.protection)
            .map_err(Error::MapFailed)?;

        // SAFETY: window.offset < page size <= window.len, so the usable
        // base stays inside the mapping returned above.
        let base = unsafe { NonNull::new_unchecked(raw.as_ptr().add(window.offset)) };
        // SAFETY: The backend mapped window.len bytes at `raw`; the region
        // covers [offset, offset + mapped_size) of it and is dropped before
        // the mapping is released.
        let region = unsafe { MmioRegion::new(base, self.mapped_size) };
        Ok(Mapping {
            raw,
            raw_len: window.len,
            region,
        })
    }

    /// Unmap the window. An unmap failure is logged and marks the map
    /// `Failed`.
    pub fn close(&mut self) -> MapStatus {
        let Some(mapping) = self.mapping.take() else {
            return self.status;
        };
        let Mapping { raw, raw_len, region } = mapping;
        drop(region);

        // SAFETY: raw/raw_len come from a successful map call on the same
        // descriptor and the only view into the window was dropped above.
        match unsafe { self.memory.unmap(raw, raw_len) } {
            Ok(()) => self.status = MapStatus::Closed,
            Err(e) => {
                error!("map {}: cannot unmap {}: {}", self.handle, self.phys_addr, e);
                self.status = MapStatus::Failed;
            }
        }
        self.status
    }

    /// Remap the same physical base with a new length.
    ///
    /// The device content is not touched: only the virtual window changes.
    /// Whether the old content is visible through the new window depends on
    /// the hardware behind the physical range. A `Failed` map stays failed.
    pub fn resize(&mut self, new_len: usize) -> MapStatus {
        if self.status == MapStatus::Failed {
            return self.status;
        }
        let was_open = self.status == MapStatus::Opened;
        if self.close() == MapStatus::Failed {
            return self.status;
        }

        debug!(
            "map {}: resize {:#x} -> {:#x} bytes",
            self.handle, self.mapped_size, new_len
        );
        self.mapped_size = new_len;
        if self.block_count <= 1 {
            self.block_size = new_len;
        }
        if was_open {
            self.open();
        }
        self.status
    }

    #[inline]
    pub fn handle(&self) -> MapHandle {
        self.handle
    }

    #[inline]
    pub fn status(&self) -> MapStatus {
        self.status
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.status == MapStatus::Failed
    }

    #[inline]
    pub fn phys_addr(&self) -> usize {
        self.phys_addr.as_usize()
    }

    /// Size of the usable window in bytes.
    #[inline]
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    #[inline]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Virtual base address of the usable window, `None` unless opened.
    ///
    /// This is a number for diagnostics; it cannot be dereferenced.
    pub fn base_addr(&self) -> Option<usize> {
        self.mapping.as_ref().map(|m| m.region.addr())
    }

    pub fn params(&self) -> MapParams {
        MapParams {
            virt_addr: self.base_addr(),
            status: self.status,
            phys_addr: self.phys_addr(),
            mapped_size: self.mapped_size,
            protection: self.protection,
        }
    }

    /// The volatile window.
    ///
    /// # Panics
    /// Panics if the map is not opened.
    pub fn region(&self) -> &MmioRegion {
        match &self.mapping {
            Some(mapping) => &mapping.region,
            None => panic!(
                "map {} ({}) is {}; register access needs an opened map",
                self.handle, self.phys_addr, self.status
            ),
        }
    }

    /// The window if write access is allowed, logging a rejection otherwise.
    fn writable_region(&self) -> Option<&MmioRegion> {
        let region = self.region();
        if !self.protection.is_writable() {
            warn!(
                "can't write to register: map {} ({}) is read only",
                self.handle, self.phys_addr
            );
            return None;
        }
        Some(region)
    }

    /// Byte offset of `offset` inside block `block`.
    fn block_offset(&self, block: usize, offset: usize) -> usize {
        assert!(
            block < self.block_count.max(1),
            "block {} out of range for map {} ({} blocks)",
            block,
            self.handle,
            self.block_count
        );
        block * self.block_size + offset
    }

    // Single registers

    pub fn read<T: Register>(&self, offset: usize) -> T {
        self.region().read(offset)
    }

    pub fn write<T: Register>(&self, offset: usize, value: T) {
        if let Some(region) = self.writable_region() {
            region.write(offset, value);
        }
    }

    pub fn read_word(&self, offset: usize) -> u32 {
        self.read::<u32>(offset)
    }

    pub fn write_word(&self, offset: usize, value: u32) {
        self.write::<u32>(offset, value);
    }

    /// Store `value` into the bits selected by `mask`, keeping the others.
    pub fn write_mask(&self, offset: usize, mask: u32, value: u32) {
        if let Some(region) = self.writable_region() {
            region.modify(offset, |old| (old & !mask) | (value & mask));
        }
    }

    pub fn mask_and(&self, offset: usize, mask: u32) {
        if let Some(region) = self.writable_region() {
            region.modify(offset, |old| old & mask);
        }
    }

    pub fn mask_or(&self, offset: usize, mask: u32) {
        if let Some(region) = self.writable_region() {
            region.modify(offset, |old| old | mask);
        }
    }

    // Bits

    pub fn set_bit(&self, offset: usize, index: u32) {
        let bit = bit(index);
        if let Some(region) = self.writable_region() {
            region.modify(offset, |old| old | bit);
        }
    }

    pub fn clear_bit(&self, offset: usize, index: u32) {
        let bit = bit(index);
        if let Some(region) = self.writable_region() {
            region.modify(offset, |old| old & !bit);
        }
    }

    pub fn toggle_bit(&self, offset: usize, index: u32) {
        let bit = bit(index);
        if let Some(region) = self.writable_region() {
            region.modify(offset, |old| old ^ bit);
        }
    }

    pub fn read_bit(&self, offset: usize, index: u32) -> bool {
        let bit = bit(index);
        self.read_word(offset) & bit != 0
    }

    // Arrays

    pub fn read_array<T: Register>(&self, offset: usize, dst: &mut [T]) {
        self.region().read_into(offset, dst);
    }

    pub fn read_vec<T: Register + Default>(&self, offset: usize, len: usize) -> Vec<T> {
        let mut out = vec![T::default(); len];
        self.read_array(offset, &mut out);
        out
    }

    pub fn write_array<T: Register>(&self, offset: usize, src: &[T]) {
        if let Some(region) = self.writable_region() {
            region.write_from(offset, src);
        }
    }

    /// Read from block `block` of a repeated-block region.
    pub fn read_block<T: Register>(&self, block: usize, offset: usize, dst: &mut [T]) {
        let offset = self.block_offset(block, offset);
        self.read_array(offset, dst);
    }

    /// Write into block `block` of a repeated-block region.
    pub fn write_block<T: Register>(&self, block: usize, offset: usize, src: &[T]) {
        let offset = self.block_offset(block, offset);
        self.write_array(offset, src);
    }
}

impl Drop for MemoryMap {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMap")
            .field("handle", &self.handle)
            .field("phys_addr", &self.phys_addr)
            .field("mapped_size", &self.mapped_size)
            .field("protection", &self.protection)
            .field("status", &self.status)
            .field("virt_addr", &self.base_addr())
            .finish()
    }
}

/// Mask for bit `index` of a 32-bit register.
#[inline]
fn bit(index: u32) -> u32 {
    assert!(index < u32::BITS, "bit index {} out of range for a 32-bit register", index);
    1 << index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::device::MemoryDevice;
    use crate::mm::sim::SimDevice;

    fn open_map(dev: &SimDevice, entry: AddressTableEntry) -> MemoryMap {
        let mut map = MemoryMap::new(MapHandle::new(0), &entry, dev.open().unwrap());
        assert_eq!(map.open(), MapStatus::Opened);
        map
    }

    #[test]
    fn test_lifecycle() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_WRITE);
        let mut map = MemoryMap::new(MapHandle::new(3), &entry, dev.open().unwrap());
        assert_eq!(map.status(), MapStatus::Closed);
        assert_eq!(map.base_addr(), None);

        assert_eq!(map.open(), MapStatus::Opened);
        assert!(map.base_addr().is_some());
        assert_eq!(dev.memory().live_windows(), 1);

        assert_eq!(map.close(), MapStatus::Closed);
        assert_eq!(map.base_addr(), None);
        assert_eq!(dev.memory().live_windows(), 0);
    }

    #[test]
    fn test_open_failure_is_terminal() {
        let dev = SimDevice::new();
        dev.memory().inject_fault(0x4000_0000..0x4000_1000);
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_WRITE);
        let mut map = MemoryMap::new(MapHandle::new(0), &entry, dev.open().unwrap());
        assert_eq!(map.open(), MapStatus::Failed);
        assert!(map.is_failed());
        assert_eq!(map.base_addr(), None);

        dev.memory().clear_faults();
        assert_eq!(map.open(), MapStatus::Failed);
        assert_eq!(dev.memory().map_calls(), 0);
    }

    #[test]
    fn test_unaligned_base() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0ff8, 16, Protection::READ_WRITE);
        let map = open_map(&dev, entry);
        map.write_word(12, 0x1234_5678);
        assert_eq!(dev.memory().read_phys_u32(0x4000_1004), 0x1234_5678);
        assert_eq!(map.read_word(12), 0x1234_5678);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dev = SimDevice::new();
        dev.memory().write_phys_u32(0x5000_0000, 0x1111_2222);
        let entry = AddressTableEntry::single(0x5000_0000, 4096, Protection::READ_ONLY);
        let map = open_map(&dev, entry);

        map.write_word(0, 0xAAAA_AAAA);
        map.set_bit(0, 31);
        map.clear_bit(0, 1);
        map.toggle_bit(0, 0);
        map.mask_and(0, 0);
        map.mask_or(0, u32::MAX);
        map.write_mask(0, u32::MAX, 0);
        map.write_array::<u32>(0, &[1, 2, 3]);
        assert_eq!(map.read_word(0), 0x1111_2222);
        assert_eq!(map.read_word(4), 0);
    }

    #[test]
    fn test_bit_operations() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_WRITE);
        let map = open_map(&dev, entry);

        map.write_word(8, 0b1010);
        map.set_bit(8, 0);
        assert_eq!(map.read_word(8), 0b1011);
        map.clear_bit(8, 3);
        assert_eq!(map.read_word(8), 0b0011);
        assert!(map.read_bit(8, 1));
        assert!(!map.read_bit(8, 2));

        map.toggle_bit(8, 31);
        map.toggle_bit(8, 31);
        assert_eq!(map.read_word(8), 0b0011);

        map.write_mask(8, 0xFF00, 0xABCD);
        assert_eq!(map.read_word(8), 0xAB03);
        map.mask_and(8, 0x0F0F);
        assert_eq!(map.read_word(8), 0x0B03);
        map.mask_or(8, 0xF000_0000);
        assert_eq!(map.read_word(8), 0xF000_0B03);
    }

    #[test]
    #[should_panic(expected = "bit index 32")]
    fn test_bit_index_out_of_range() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_WRITE);
        open_map(&dev, entry).set_bit(0, 32);
    }

    #[test]
    fn test_blocks() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::new(0x4000_0000, 0x100, Protection::READ_WRITE, 2);
        let map = open_map(&dev, entry);
        assert_eq!(map.mapped_size(), 0x200);

        map.write_block::<u32>(1, 0, &[7, 8, 9]);
        assert_eq!(dev.memory().read_phys_u32(0x4000_0100), 7);
        assert_eq!(dev.memory().read_phys_u32(0x4000_0108), 9);

        let mut out = [0u32; 3];
        map.read_block(1, 0, &mut out);
        assert_eq!(out, [7, 8, 9]);
        assert_eq!(map.read_vec::<u32>(0x100, 2), vec![7, 8]);
    }

    #[test]
    #[should_panic(expected = "block 2 out of range")]
    fn test_block_out_of_range() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::new(0x4000_0000, 0x100, Protection::READ_WRITE, 2);
        open_map(&dev, entry).write_block::<u32>(2, 0, &[1]);
    }

    #[test]
    fn test_resize_keeps_physical_base() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_WRITE);
        let mut map = open_map(&dev, entry);
        map.write_word(0, 0xDEAD_BEEF);

        assert_eq!(map.resize(3 * 4096), MapStatus::Opened);
        assert_eq!(map.mapped_size(), 3 * 4096);
        assert_eq!(map.phys_addr(), 0x4000_0000);
        map.write_word(2 * 4096, 5);
        // The simulated device keeps its content across the remap
        assert_eq!(map.read_word(0), 0xDEAD_BEEF);
        assert_eq!(dev.memory().live_windows(), 1);
        assert_eq!(dev.memory().unmap_calls(), 1);
    }

    #[test]
    fn test_resize_into_fault_fails() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_WRITE);
        let mut map = open_map(&dev, entry);
        dev.memory().inject_fault(0x4000_1000..0x4000_2000);
        assert_eq!(map.resize(2 * 4096), MapStatus::Failed);
        assert_eq!(map.base_addr(), None);
        assert_eq!(dev.memory().live_windows(), 0);
    }

    #[test]
    fn test_window_overflow_fails() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0010, usize::MAX - 4, Protection::READ_WRITE);
        let mut map = MemoryMap::new(MapHandle::new(0), &entry, dev.open().unwrap());
        assert_eq!(map.open(), MapStatus::Failed);
        assert_eq!(map.base_addr(), None);
        assert_eq!(dev.memory().map_calls(), 0);
    }

    #[test]
    fn test_block_count_overflow_fails() {
        let dev = SimDevice::new();
        let entry =
            AddressTableEntry::new(0x4000_0000, usize::MAX / 2 + 1, Protection::READ_WRITE, 4);
        let mut map = MemoryMap::new(MapHandle::new(0), &entry, dev.open().unwrap());
        assert!(map.is_failed());
        assert_eq!(map.open(), MapStatus::Failed);
        assert_eq!(dev.memory().map_calls(), 0);
    }

    #[test]
    fn test_resize_overflow_fails() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0010, 16, Protection::READ_WRITE);
        let mut map = open_map(&dev, entry);
        assert_eq!(map.resize(usize::MAX - 4), MapStatus::Failed);
        assert_eq!(map.base_addr(), None);
        assert_eq!(dev.memory().live_windows(), 0);
    }

    #[test]
    fn test_drop_unmaps() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_WRITE);
        let map = open_map(&dev, entry);
        assert_eq!(dev.memory().live_windows(), 1);
        drop(map);
        assert_eq!(dev.memory().live_windows(), 0);
    }

    #[test]
    #[should_panic(expected = "needs an opened map")]
    fn test_access_on_failed_map_panics() {
        let dev = SimDevice::new();
        dev.memory().inject_fault(0..usize::MAX);
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_WRITE);
        let mut map = MemoryMap::new(MapHandle::new(0), &entry, dev.open().unwrap());
        map.open();
        map.read_word(0);
    }

    #[test]
    fn test_params() {
        let dev = SimDevice::new();
        let entry = AddressTableEntry::single(0x4000_0000, 4096, Protection::READ_ONLY);
        let map = open_map(&dev, entry);
        let params = map.params();
        assert_eq!(params.status, MapStatus::Opened);
        assert_eq!(params.phys_addr, 0x4000_0000);
        assert_eq!(params.mapped_size, 4096);
        assert_eq!(params.protection, Protection::READ_ONLY);
        assert_eq!(params.virt_addr, map.base_addr());
    }
}
