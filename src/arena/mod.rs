//! Device Memory Arena
//!
//! [`DeviceMemory`] opens the physical-memory device, creates and owns every
//! [`MemoryMap`], and hands out [`MapHandle`]s to them.
//!
//! # Design
//! - Maps are stored by handle; handles are plain keys, never pointers
//! - Requests intersecting the forbidden range are rejected before any
//!   handle is allocated
//! - A failed `mmap` still registers the map (status `Failed`) so callers
//!   can inspect it; only forbidden or closed-arena requests yield
//!   [`MapHandle::INVALID`]
//! - Lookups of unknown handles panic: a stale handle is a program bug
//!
//! The arena is single-threaded. Callers sharing it between threads must
//! serialize access themselves.

mod accessors;
pub mod handle;

use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mm::{
    AddressTable, AddressTableEntry, DevMem, ForbiddenRange, MapParams, MapStatus, MemoryDevice,
    MemoryMap, MemoryRegion, PhysMemory, Protection, RegionId,
};

pub use handle::{HandlePool, MapHandle};

/// Factory and registry of memory maps over one physical-memory device.
pub struct DeviceMemory<D: MemoryDevice = DevMem> {
    device: D,
    table: AddressTable,
    forbidden: ForbiddenRange,
    memory: Option<Rc<dyn PhysMemory>>,
    maps: BTreeMap<MapHandle, MemoryMap>,
    handles: HandlePool,
}

impl<D: MemoryDevice> DeviceMemory<D> {
    /// Create a closed arena.
    pub fn new(device: D, table: AddressTable, forbidden: ForbiddenRange) -> Self {
        Self {
            device,
            table,
            forbidden,
            memory: None,
            maps: BTreeMap::new(),
            handles: HandlePool::new(),
        }
    }

    /// Acquire the physical-memory descriptor. Only the first call does work.
    pub fn open(&mut self) -> Result<()> {
        if self.memory.is_some() {
            return Ok(());
        }
        let memory = self.device.open()?;
        info!("opened physical memory device {}", self.device.path().display());
        self.memory = Some(memory);
        Ok(())
    }

    /// Remove every map, then release the descriptor.
    pub fn close(&mut self) {
        self.remove_all();
        if self.memory.take().is_some() {
            info!("closed physical memory device {}", self.device.path().display());
        }
    }

    /// Check if the device is open.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.memory.is_some()
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    #[inline]
    pub fn forbidden_range(&self) -> ForbiddenRange {
        self.forbidden
    }

    /// Map a region and register it, reporting why a request was rejected.
    ///
    /// A map whose `mmap` fails is still registered and its handle returned;
    /// check [`DeviceMemory::status`].
    pub fn try_add_memory_map(
        &mut self,
        phys_addr: usize,
        size: usize,
        protection: Protection,
    ) -> Result<MapHandle> {
        let entry = AddressTableEntry::single(phys_addr, size, protection);
        self.insert(&entry)
    }

    /// Map a region and register it.
    ///
    /// Returns [`MapHandle::INVALID`] without touching the registry if the
    /// region intersects the forbidden range or the device is not open.
    pub fn add_memory_map(
        &mut self,
        phys_addr: usize,
        size: usize,
        protection: Protection,
    ) -> MapHandle {
        self.try_add_memory_map(phys_addr, size, protection)
            .unwrap_or(MapHandle::INVALID)
    }

    /// Map an address-table region with its protection and block layout.
    ///
    /// # Panics
    /// Panics if `id` is not in the address table.
    pub fn try_map_region(&mut self, id: RegionId) -> Result<MapHandle> {
        let entry = *self.table.entry(id);
        self.insert(&entry)
    }

    /// Sentinel-returning form of [`DeviceMemory::try_map_region`].
    pub fn map_region(&mut self, id: RegionId) -> MapHandle {
        self.try_map_region(id).unwrap_or(MapHandle::INVALID)
    }

    fn insert(&mut self, entry: &AddressTableEntry) -> Result<MapHandle> {
        let Some(size) = entry.total_size() else {
            warn!(
                "rejected mapping of {:#x}: {} blocks of {:#x} bytes overflow the address space",
                entry.phys_addr, entry.block_count, entry.range
            );
            return Err(Error::AddressOverflow {
                addr: entry.phys_addr,
            });
        };
        self.admit(entry.phys_addr, size)?;
        let Some(memory) = &self.memory else {
            warn!("rejected mapping of {:#x}: device not open", entry.phys_addr);
            return Err(Error::NotOpen);
        };

        let handle = self.handles.allocate();
        let mut map = MemoryMap::new(handle, entry, Rc::clone(memory));
        map.open();
        self.maps.insert(handle, map);
        Ok(handle)
    }

    /// Check that `[addr, addr + size)` may be mapped at all.
    fn admit(&self, addr: usize, size: usize) -> Result<()> {
        if addr.checked_add(size).is_none() {
            warn!(
                "rejected mapping of {:#x} +{:#x}: past the end of the address space",
                addr, size
            );
            return Err(Error::AddressOverflow { addr });
        }
        if self.forbidden.intersects(addr, size) {
            warn!(
                "rejected mapping of {:#x} +{:#x}: forbidden range [{:#x}, {:#x})",
                addr,
                size,
                self.forbidden.low(),
                self.forbidden.high()
            );
            return Err(Error::ForbiddenAddress { addr, size });
        }
        Ok(())
    }

    /// Destroy a map (unmapping it if open) and recycle its handle.
    ///
    /// # Panics
    /// Panics if `handle` is not registered.
    pub fn remove_memory_map(&mut self, handle: MapHandle) {
        match self.maps.remove(&handle) {
            Some(map) => {
                drop(map);
                self.handles.release(handle);
                debug!("removed map {}", handle);
            }
            None => panic!("remove of unknown memory map {}", handle),
        }
    }

    /// Remove every registered map.
    pub fn remove_all(&mut self) {
        let handles: Vec<MapHandle> = self.maps.keys().copied().collect();
        for handle in handles {
            self.remove_memory_map(handle);
        }
    }

    /// Map each region in order as read-write; rejected regions yield
    /// [`MapHandle::INVALID`] at their position.
    pub fn request_memory_maps<const N: usize>(
        &mut self,
        regions: [MemoryRegion; N],
    ) -> [MapHandle; N] {
        regions.map(|region| {
            self.add_memory_map(region.phys_addr, region.range, Protection::READ_WRITE)
        })
    }

    /// Fail if any handle is the rejection sentinel.
    pub fn check_map_ids(&self, handles: &[MapHandle]) -> Result<()> {
        let count = handles.iter().filter(|h| h.is_invalid()).count();
        if count > 0 {
            return Err(Error::InvalidHandles { count });
        }
        Ok(())
    }

    /// Remap a map with a new length and return its status.
    ///
    /// A new length that would reach into the forbidden range or past the
    /// end of the address space is rejected and the map is left as it was.
    pub fn resize(&mut self, handle: MapHandle, new_len: usize) -> Result<MapStatus> {
        let addr = match self.maps.get(&handle) {
            Some(map) => map.phys_addr(),
            None => return Err(Error::UnknownHandle(handle)),
        };
        self.admit(addr, new_len)?;
        let map = self
            .maps
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        Ok(map.resize(new_len))
    }

    /// Look up a map.
    pub fn get(&self, handle: MapHandle) -> Option<&MemoryMap> {
        self.maps.get(&handle)
    }

    /// Look up a map that must exist.
    ///
    /// # Panics
    /// Panics if `handle` is not registered.
    pub fn map(&self, handle: MapHandle) -> &MemoryMap {
        match self.maps.get(&handle) {
            Some(map) => map,
            None => panic!("unknown memory map handle {}", handle),
        }
    }

    #[inline]
    pub fn contains(&self, handle: MapHandle) -> bool {
        self.maps.contains_key(&handle)
    }

    /// Number of registered maps.
    #[inline]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Registered handles in ascending order.
    pub fn handles(&self) -> impl Iterator<Item = MapHandle> + '_ {
        self.maps.keys().copied()
    }

    /// Virtual base address of a map, `None` unless opened.
    pub fn base_addr(&self, handle: MapHandle) -> Option<usize> {
        self.map(handle).base_addr()
    }

    pub fn status(&self, handle: MapHandle) -> MapStatus {
        self.map(handle).status()
    }

    pub fn params(&self, handle: MapHandle) -> MapParams {
        self.map(handle).params()
    }

    /// Check if one map failed.
    pub fn is_map_failed(&self, handle: MapHandle) -> bool {
        self.map(handle).is_failed()
    }

    /// Check if any registered map failed.
    pub fn is_failed(&self) -> bool {
        self.maps.values().any(MemoryMap::is_failed)
    }
}

impl<D: MemoryDevice> Drop for DeviceMemory<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: MemoryDevice> core::fmt::Debug for DeviceMemory<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("device", &self.device.path())
            .field("open", &self.is_open())
            .field("forbidden", &self.forbidden)
            .field("maps", &self.maps.values().collect::<Vec<_>>())
            .finish()
    }
}
