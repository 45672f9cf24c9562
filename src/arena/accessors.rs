//! Register accessors addressed by (handle, byte offset).
//!
//! Every method resolves the handle first and panics on an unknown one.
//! Write-class methods on read-only maps log and do nothing.

use log::warn;

use super::{DeviceMemory, MapHandle};
use crate::error::{Error, Result};
use crate::mm::{MemoryDevice, Register};
use crate::poll::{poll_until, PollConfig};

impl<D: MemoryDevice> DeviceMemory<D> {
    pub fn read_word(&self, handle: MapHandle, offset: usize) -> u32 {
        self.map(handle).read_word(offset)
    }

    pub fn write_word(&self, handle: MapHandle, offset: usize, value: u32) {
        self.map(handle).write_word(offset, value);
    }

    pub fn read<T: Register>(&self, handle: MapHandle, offset: usize) -> T {
        self.map(handle).read(offset)
    }

    pub fn write<T: Register>(&self, handle: MapHandle, offset: usize, value: T) {
        self.map(handle).write(offset, value);
    }

    pub fn set_bit(&self, handle: MapHandle, offset: usize, index: u32) {
        self.map(handle).set_bit(offset, index);
    }

    pub fn clear_bit(&self, handle: MapHandle, offset: usize, index: u32) {
        self.map(handle).clear_bit(offset, index);
    }

    pub fn toggle_bit(&self, handle: MapHandle, offset: usize, index: u32) {
        self.map(handle).toggle_bit(offset, index);
    }

    pub fn read_bit(&self, handle: MapHandle, offset: usize, index: u32) -> bool {
        self.map(handle).read_bit(offset, index)
    }

    pub fn mask_and(&self, handle: MapHandle, offset: usize, mask: u32) {
        self.map(handle).mask_and(offset, mask);
    }

    pub fn mask_or(&self, handle: MapHandle, offset: usize, mask: u32) {
        self.map(handle).mask_or(offset, mask);
    }

    /// Replace the bits selected by `mask` with those of `value`.
    pub fn write_mask(&self, handle: MapHandle, offset: usize, mask: u32, value: u32) {
        self.map(handle).write_mask(offset, mask, value);
    }

    pub fn read_array<T: Register>(&self, handle: MapHandle, offset: usize, dst: &mut [T]) {
        self.map(handle).read_array(offset, dst);
    }

    pub fn read_vec<T: Register + Default>(
        &self,
        handle: MapHandle,
        offset: usize,
        len: usize,
    ) -> Vec<T> {
        self.map(handle).read_vec(offset, len)
    }

    pub fn write_array<T: Register>(&self, handle: MapHandle, offset: usize, src: &[T]) {
        self.map(handle).write_array(offset, src);
    }

    pub fn read_block<T: Register>(
        &self,
        handle: MapHandle,
        block: usize,
        offset: usize,
        dst: &mut [T],
    ) {
        self.map(handle).read_block(block, offset, dst);
    }

    pub fn write_block<T: Register>(
        &self,
        handle: MapHandle,
        block: usize,
        offset: usize,
        src: &[T],
    ) {
        self.map(handle).write_block(block, offset, src);
    }

    /// Wait until `(word & mask) == expected`, returning the matching word.
    pub fn wait_for_word(
        &self,
        handle: MapHandle,
        offset: usize,
        mask: u32,
        expected: u32,
        config: &PollConfig,
    ) -> Result<u32> {
        let map = self.map(handle);
        match poll_until(config, || {
            let word = map.read_word(offset);
            (word & mask == expected).then_some(word)
        }) {
            Some((word, _)) => Ok(word),
            None => {
                let attempts = config.max_attempts.max(1);
                warn!(
                    "map {} offset {:#x}: mask {:#010x} never read {:#010x} in {} attempts",
                    handle, offset, mask, expected, attempts
                );
                Err(Error::Timeout {
                    handle,
                    offset,
                    attempts,
                })
            }
        }
    }

    /// Wait until bit `index` of the word at `offset` reads `expected`.
    pub fn wait_for_bit(
        &self,
        handle: MapHandle,
        offset: usize,
        index: u32,
        expected: bool,
        config: &PollConfig,
    ) -> Result<()> {
        assert!(index < u32::BITS, "bit index {} out of range for a 32-bit register", index);
        let mask = 1u32 << index;
        let expected = if expected { mask } else { 0 };
        self.wait_for_word(handle, offset, mask, expected, config)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mm::{
        AddressTable, AddressTableEntry, ForbiddenRange, Protection, RegionId, SimDevice,
    };

    fn arena() -> (DeviceMemory<SimDevice>, SimDevice) {
        let dev = SimDevice::new();
        let mut arena =
            DeviceMemory::new(dev.clone(), AddressTable::default(), ForbiddenRange::NONE);
        arena.open().unwrap();
        (arena, dev)
    }

    #[test]
    fn test_round_trip_boundary_values() {
        let (mut arena, _) = arena();
        let h = arena.add_memory_map(0x4000_0000, 4096, Protection::READ_WRITE);
        for offset in [0, 4, 4092] {
            for value in [0, u32::MAX, 1] {
                arena.write_word(h, offset, value);
                assert_eq!(arena.read_word(h, offset), value);
            }
        }
    }

    #[test]
    fn test_read_only_write_is_noop() {
        let (mut arena, dev) = arena();
        dev.memory().write_phys_u32(0x5000_0000, 0x0123_4567);
        let h = arena.add_memory_map(0x5000_0000, 4096, Protection::READ_ONLY);
        let before = arena.read_word(h, 0);
        arena.write_word(h, 0, 0xAAAA_AAAA);
        assert_eq!(arena.read_word(h, 0), before);
        assert_eq!(before, 0x0123_4567);
    }

    #[test]
    fn test_toggle_twice_restores() {
        let (mut arena, _) = arena();
        let h = arena.add_memory_map(0x4000_0000, 4096, Protection::READ_WRITE);
        arena.write_word(h, 16, 0x8000_0001);
        for index in [0, 5, 31] {
            arena.toggle_bit(h, 16, index);
            arena.toggle_bit(h, 16, index);
            assert_eq!(arena.read_word(h, 16), 0x8000_0001);
        }
    }

    #[test]
    fn test_bit_and_mask_ops() {
        let (mut arena, _) = arena();
        let h = arena.add_memory_map(0x4000_0000, 4096, Protection::READ_WRITE);
        arena.set_bit(h, 0, 4);
        assert!(arena.read_bit(h, 0, 4));
        arena.clear_bit(h, 0, 4);
        assert!(!arena.read_bit(h, 0, 4));
        arena.mask_or(h, 0, 0xFF);
        arena.mask_and(h, 0, 0x0F);
        assert_eq!(arena.read_word(h, 0), 0x0F);
        arena.write_mask(h, 0, 0xF0, 0xAB);
        assert_eq!(arena.read_word(h, 0), 0xAF);
    }

    #[test]
    fn test_typed_and_arrays() {
        let (mut arena, _) = arena();
        let h = arena.add_memory_map(0x4000_0000, 0x4000, Protection::READ_WRITE);
        arena.write::<i16>(h, 2, -32767);
        assert_eq!(arena.read::<i16>(h, 2), -32767);
        arena.write::<f32>(h, 8, 0.25);
        assert_eq!(arena.read::<f32>(h, 8), 0.25);

        let data: Vec<u32> = (0..2048).map(|i| i * i).collect();
        arena.write_array(h, 0x2000, &data);
        assert_eq!(arena.read_vec::<u32>(h, 0x2000, 2048), data);

        let floats: Vec<f32> = (1..=16).map(|i| (i as f32).ln()).collect();
        arena.write_array(h, 0x100, &floats);
        let mut back = [0f32; 16];
        arena.read_array(h, 0x100, &mut back);
        assert_eq!(back.to_vec(), floats);
    }

    #[test]
    fn test_blocks_by_handle() {
        let dev = SimDevice::new();
        let table = AddressTable::from_vec(vec![AddressTableEntry::new(
            0x4000_0000,
            0x100,
            Protection::READ_WRITE,
            2,
        )]);
        let mut arena = DeviceMemory::new(dev, table, ForbiddenRange::NONE);
        arena.open().unwrap();
        let h = arena.map_region(RegionId(0));

        arena.write_block::<u32>(h, 1, 4, &[10, 11]);
        let mut out = [0u32; 2];
        arena.read_block(h, 1, 4, &mut out);
        assert_eq!(out, [10, 11]);
        assert_eq!(arena.read_word(h, 0x104), 10);
        arena.read_block(h, 0, 4, &mut out);
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn test_wait_for_bit() {
        let (mut arena, dev) = arena();
        let h = arena.add_memory_map(0x5000_0000, 4096, Protection::READ_ONLY);
        let fast = PollConfig::new(3, Duration::ZERO);

        assert!(matches!(
            arena.wait_for_bit(h, 8, 0, true, &fast),
            Err(Error::Timeout { attempts: 3, offset: 8, .. })
        ));

        dev.memory().write_phys_u32(0x5000_0008, 1);
        arena.wait_for_bit(h, 8, 0, true, &fast).unwrap();
        arena.wait_for_bit(h, 8, 1, false, &fast).unwrap();
        assert_eq!(arena.wait_for_word(h, 8, 0xF, 1, &fast).unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "unknown memory map handle")]
    fn test_unknown_handle_panics() {
        let (arena, _) = arena();
        arena.write_word(MapHandle::new(3), 0, 1);
    }
}
