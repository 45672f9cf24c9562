//! devmem-arena - Device Memory Arena for FPGA instruments
//!
//! Exposes the physical registers of an FPGA-based instrument to
//! application code as typed, bounds-checked, permission-aware memory
//! operations.
//!
//! # Architecture
//! - Address Table: per-board register regions, injected as configuration
//! - Handle Pool: opaque, recycled map identifiers
//! - Memory Map: one `mmap` window with its own open/close lifecycle
//! - Device Memory Arena: owns every map, enforces the forbidden range
//! - Register Accessors: word, bit, mask and bulk operations by
//!   (handle, offset)
//!
//! # Safety Features
//! - Device memory never escapes as a pointer or reference; every access
//!   is one volatile load or store
//! - Writes to read-only maps are logged and dropped
//! - Unknown handles, out-of-bounds offsets and bad table ids panic
//!
//! # Example
//! ```
//! use devmem_arena::{AddressTable, DeviceMemory, ForbiddenRange, Protection, SimDevice};
//!
//! let mut arena = DeviceMemory::new(
//!     SimDevice::new(),
//!     AddressTable::default(),
//!     ForbiddenRange::new(0x1000_0000, 0x2000_0000),
//! );
//! arena.open()?;
//! let h = arena.add_memory_map(0x4000_0000, 4096, Protection::READ_WRITE);
//! arena.write_word(h, 0, 0xDEAD_BEEF);
//! assert_eq!(arena.read_word(h, 0), 0xDEAD_BEEF);
//! arena.close();
//! # Ok::<(), devmem_arena::Error>(())
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod error;
pub mod mm;
pub mod poll;

pub use arena::{DeviceMemory, HandlePool, MapHandle};
pub use error::{Error, Result};
pub use mm::{
    AddressTable, AddressTableEntry, DevMem, ForbiddenRange, MapParams, MapStatus, MemoryDevice,
    MemoryMap, MemoryRegion, MmioRegion, PhysAddr, PhysMemory, Protection, Register, RegionId,
    SimDevice, SimMemory, DEFAULT_DEVICE_PATH, PAGE_SIZE,
};
pub use poll::PollConfig;
