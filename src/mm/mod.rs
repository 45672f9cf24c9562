//! Memory management for device registers
//!
//! Provides:
//! - Physical address arithmetic and the forbidden-range policy
//! - The board address table
//! - Physical-memory backends (`/dev/mem` and a simulated one)
//! - Memory maps and their volatile register windows
//!
//! # Principles
//! - Unsafe code is confined to the backends and the volatile window
//! - Device memory is never exposed as a Rust reference or raw pointer

pub mod address;
pub mod device;
pub mod mapper;
pub mod mmio;
pub mod sim;
pub mod table;

pub use address::{ForbiddenRange, MapWindow, PhysAddr, PAGE_SIZE};
pub use device::{DevMem, MemoryDevice, PhysMemory, DEFAULT_DEVICE_PATH};
pub use mapper::{MapParams, MapStatus, MemoryMap};
pub use mmio::{MmioRegion, Register};
pub use sim::{SimDevice, SimMemory};
pub use table::{AddressTable, AddressTableEntry, MemoryRegion, Protection, RegionId};
