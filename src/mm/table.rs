//! Address Table
//!
//! Immutable description of every register region of a board: physical
//! base, byte range, access protection and repeat-block count.
//!
//! The table is injected into the arena as configuration, so boards (and
//! tests) supply their own data:
//!
//! ```text
//! id  base         range    protection  blocks
//! ──  ───────────  ───────  ──────────  ──────
//!  0  0x6000_0000  0x1000   READ_WRITE  1       config registers
//!  1  0x5000_0000  0x1000   READ_ONLY   1       status registers
//!  2  0x4000_0000  0x2000   READ_WRITE  2       double-buffered DAC banks
//! ```

use std::borrow::Cow;

use bitflags::bitflags;

bitflags! {
    /// Access protection of a mapped region.
    ///
    /// Only `READ_ONLY` and `READ_WRITE` are meaningful for register maps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;

        const READ_ONLY = Self::READ.bits();
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Protection {
    /// Check if register writes are permitted.
    #[inline]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// The `mmap` protection bits for this access mode.
    pub fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        prot
    }
}

impl core::fmt::Display for Protection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        write!(f, "{r}{w}")
    }
}

/// Index of an entry in an [`AddressTable`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct RegionId(pub usize);

impl RegionId {
    /// Get the index value.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// One register region of the board.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AddressTableEntry {
    /// Physical base address.
    pub phys_addr: usize,
    /// Size of one block in bytes.
    pub range: usize,
    /// Access protection.
    pub protection: Protection,
    /// Number of identical consecutive blocks.
    pub block_count: usize,
}

impl AddressTableEntry {
    /// Create an entry.
    pub const fn new(
        phys_addr: usize,
        range: usize,
        protection: Protection,
        block_count: usize,
    ) -> Self {
        Self {
            phys_addr,
            range,
            protection,
            block_count,
        }
    }

    /// Create a single-block entry.
    pub const fn single(phys_addr: usize, range: usize, protection: Protection) -> Self {
        Self::new(phys_addr, range, protection, 1)
    }

    /// Total mapped size: `range * block_count`, `None` on overflow.
    #[inline]
    pub const fn total_size(&self) -> Option<usize> {
        self.range.checked_mul(self.block_count)
    }
}

/// Registry of the board's register regions.
#[derive(Clone, Debug, Default)]
pub struct AddressTable {
    entries: Cow<'static, [AddressTableEntry]>,
}

impl AddressTable {
    /// Wrap a compile-time table.
    pub const fn from_static(entries: &'static [AddressTableEntry]) -> Self {
        Self {
            entries: Cow::Borrowed(entries),
        }
    }

    /// Build a table from owned entries.
    pub fn from_vec(entries: Vec<AddressTableEntry>) -> Self {
        Self {
            entries: Cow::Owned(entries),
        }
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry.
    ///
    /// # Panics
    /// Panics if `id` is not in the table: ids are fixed when the board is
    /// built, so a miss is a configuration bug.
    pub fn entry(&self, id: RegionId) -> &AddressTableEntry {
        match self.entries.get(id.index()) {
            Some(entry) => entry,
            None => panic!(
                "address table has no region {} ({} entries)",
                id.index(),
                self.entries.len()
            ),
        }
    }

    pub fn base_address(&self, id: RegionId) -> usize {
        self.entry(id).phys_addr
    }

    pub fn range(&self, id: RegionId) -> usize {
        self.entry(id).range
    }

    pub fn protection(&self, id: RegionId) -> Protection {
        self.entry(id).protection
    }

    pub fn block_count(&self, id: RegionId) -> usize {
        self.entry(id).block_count
    }

    pub fn total_size(&self, id: RegionId) -> Option<usize> {
        self.entry(id).total_size()
    }

    /// Iterate over all entries with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &AddressTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (RegionId(i), entry))
    }
}

/// A bulk mapping request: physical address and byte range.
///
/// Carries no ownership; see `DeviceMemory::request_memory_maps`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryRegion {
    pub phys_addr: usize,
    pub range: usize,
}

impl MemoryRegion {
    pub const fn new(phys_addr: usize, range: usize) -> Self {
        Self { phys_addr, range }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD: &[AddressTableEntry] = &[
        AddressTableEntry::single(0x6000_0000, 0x1000, Protection::READ_WRITE),
        AddressTableEntry::single(0x5000_0000, 0x1000, Protection::READ_ONLY),
        AddressTableEntry::new(0x4000_0000, 0x2000, Protection::READ_WRITE, 2),
    ];

    static TABLE: AddressTable = AddressTable::from_static(BOARD);

    #[test]
    fn test_lookups() {
        assert_eq!(TABLE.len(), 3);
        assert_eq!(TABLE.base_address(RegionId(1)), 0x5000_0000);
        assert_eq!(TABLE.range(RegionId(2)), 0x2000);
        assert_eq!(TABLE.protection(RegionId(1)), Protection::READ_ONLY);
        assert_eq!(TABLE.block_count(RegionId(2)), 2);
        assert_eq!(TABLE.total_size(RegionId(2)), Some(0x4000));
        assert_eq!(TABLE.total_size(RegionId(0)), Some(0x1000));
    }

    #[test]
    fn test_iter_ids() {
        let ids: Vec<_> = TABLE.iter().map(|(id, _)| id.index()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_total_size_overflow() {
        let entry =
            AddressTableEntry::new(0x4000_0000, usize::MAX / 2 + 1, Protection::READ_WRITE, 4);
        assert_eq!(entry.total_size(), None);
        let entry =
            AddressTableEntry::new(0x4000_0000, usize::MAX / 2, Protection::READ_WRITE, 2);
        assert_eq!(entry.total_size(), Some(usize::MAX - 1));
    }

    #[test]
    #[should_panic(expected = "no region 3")]
    fn test_out_of_range_id_panics() {
        TABLE.entry(RegionId(3));
    }

    #[test]
    fn test_protection_bits() {
        assert!(Protection::READ_WRITE.is_writable());
        assert!(!Protection::READ_ONLY.is_writable());
        assert_eq!(Protection::READ_ONLY.to_prot(), libc::PROT_READ);
        assert_eq!(
            Protection::READ_WRITE.to_prot(),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(Protection::READ_ONLY.to_string(), "R-");
    }
}
