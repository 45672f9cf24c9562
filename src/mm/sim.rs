//! Simulated Physical Memory
//!
//! An in-process stand-in for `/dev/mem`, used to exercise map lifecycle,
//! resizing and failure handling without hardware.
//!
//! # Model
//! - Physical memory is a sparse set of zero-initialized pages
//! - Mapping a window copies the covered pages into a private buffer
//! - Unmapping a writable window writes back the bytes changed through
//!   it, so content survives a remap; read-only windows write nothing
//! - Two live windows over the same pages do not alias each other, but
//!   `write_phys_u32` reaches all of them
//! - Any physical range can be marked faulty to make `map` fail

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::rc::Rc;

use super::address::{PhysAddr, PAGE_SIZE};
use super::device::{MemoryDevice, PhysMemory};
use super::table::Protection;
use crate::error::{Error, Result};

const WORD: usize = core::mem::size_of::<u64>();
const REG: usize = core::mem::size_of::<u32>();

/// A [`MemoryDevice`] backed by [`SimMemory`].
#[derive(Debug, Clone)]
pub struct SimDevice {
    memory: Rc<SimMemory>,
    path: PathBuf,
    available: bool,
}

impl SimDevice {
    /// Simulated device with 4 KiB pages.
    pub fn new() -> Self {
        Self::with_page_size(PAGE_SIZE)
    }

    /// Simulated device with a custom page size (power of two, at least
    /// one 32-bit word).
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= REG,
            "page size must be a power of two of at least {} bytes",
            REG
        );
        Self {
            memory: Rc::new(SimMemory::new(page_size)),
            path: PathBuf::from("sim:mem"),
            available: true,
        }
    }

    /// A device whose `open` always fails, as if permission were denied.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// The simulated memory, for inspection and fault injection.
    pub fn memory(&self) -> Rc<SimMemory> {
        Rc::clone(&self.memory)
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice for SimDevice {
    fn open(&self) -> Result<Rc<dyn PhysMemory>> {
        if !self.available {
            return Err(Error::DeviceUnavailable {
                path: self.path.clone(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        let memory: Rc<dyn PhysMemory> = self.memory.clone();
        Ok(memory)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// A live window: a heap buffer handed out as the mapped address.
#[derive(Debug)]
struct Window {
    base: usize,
    len: usize,
    words: NonNull<u64>,
    word_count: usize,
    writable: bool,
    /// Device content as of the map call, kept in step with
    /// `write_phys_u32`. Unmap writes back only the bytes that differ.
    snapshot: Box<[u8]>,
}

impl Window {
    fn alloc(base: usize, len: usize, protection: Protection) -> Self {
        let word_count = len.div_ceil(WORD);
        let buf: Box<[u64]> = vec![0u64; word_count].into_boxed_slice();
        let raw = Box::into_raw(buf);
        // SAFETY: Box::into_raw never returns null.
        let words = unsafe { NonNull::new_unchecked(raw.cast::<u64>()) };
        Self {
            base,
            len,
            words,
            word_count,
            writable: protection.is_writable(),
            snapshot: vec![0u8; len].into_boxed_slice(),
        }
    }

    fn addr(&self) -> NonNull<u8> {
        self.words.cast()
    }

    fn contains(&self, phys: usize, size: usize) -> bool {
        phys >= self.base && phys - self.base <= self.len.saturating_sub(size)
    }

    /// Byte view of the buffer.
    ///
    /// # Safety
    /// No volatile access through the window may be in progress.
    unsafe fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: The buffer holds word_count * WORD initialized bytes.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_ptr().cast(), self.len) }
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.words.as_ptr(), self.word_count);
        // SAFETY: Allocated by Box::into_raw in `alloc` with this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

#[derive(Debug, Default)]
struct SimState {
    pages: BTreeMap<usize, Box<[u8]>>,
    windows: HashMap<usize, Window>,
    faults: Vec<Range<usize>>,
    map_calls: usize,
    unmap_calls: usize,
}

/// Sparse simulated physical memory.
#[derive(Debug)]
pub struct SimMemory {
    page_size: usize,
    state: RefCell<SimState>,
}

impl SimMemory {
    fn new(page_size: usize) -> Self {
        Self {
            page_size,
            state: RefCell::new(SimState::default()),
        }
    }

    /// Make every `map` overlapping `range` fail with `EPERM`.
    pub fn inject_fault(&self, range: Range<usize>) {
        self.state.borrow_mut().faults.push(range);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.state.borrow_mut().faults.clear();
    }

    /// Number of windows currently mapped.
    pub fn live_windows(&self) -> usize {
        self.state.borrow().windows.len()
    }

    /// Number of successful `map` calls.
    pub fn map_calls(&self) -> usize {
        self.state.borrow().map_calls
    }

    /// Number of successful `unmap` calls.
    pub fn unmap_calls(&self) -> usize {
        self.state.borrow().unmap_calls
    }

    /// Read a word as the hardware sees it, live windows first.
    ///
    /// # Panics
    /// Panics if `phys` is not 4-byte aligned.
    pub fn read_phys_u32(&self, phys: usize) -> u32 {
        assert_reg_aligned(phys);
        let state = self.state.borrow();
        if let Some(window) = state.windows.values().find(|w| w.contains(phys, REG)) {
            // SAFETY: The word lies inside the live buffer.
            return unsafe {
                window
                    .addr()
                    .as_ptr()
                    .add(phys - window.base)
                    .cast::<u32>()
                    .read_unaligned()
            };
        }
        let page = phys & !(self.page_size - 1);
        let offset = phys - page;
        match state.pages.get(&page) {
            Some(bytes) => {
                let mut word = [0u8; REG];
                word.copy_from_slice(&bytes[offset..offset + REG]);
                u32::from_ne_bytes(word)
            }
            None => 0,
        }
    }

    /// Write a word as the hardware would, into every live window covering
    /// it and into the backing pages.
    ///
    /// # Panics
    /// Panics if `phys` is not 4-byte aligned.
    pub fn write_phys_u32(&self, phys: usize, value: u32) {
        assert_reg_aligned(phys);
        let mut state = self.state.borrow_mut();
        for window in state.windows.values_mut().filter(|w| w.contains(phys, REG)) {
            let offset = phys - window.base;
            // SAFETY: The word lies inside the live buffer.
            unsafe {
                window
                    .addr()
                    .as_ptr()
                    .add(offset)
                    .cast::<u32>()
                    .write_unaligned(value);
            }
            window.snapshot[offset..offset + REG].copy_from_slice(&value.to_ne_bytes());
        }
        let page_size = self.page_size;
        let page = phys & !(page_size - 1);
        let offset = phys - page;
        let bytes = state
            .pages
            .entry(page)
            .or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
        bytes[offset..offset + REG].copy_from_slice(&value.to_ne_bytes());
    }
}

fn assert_reg_aligned(phys: usize) {
    assert!(
        phys % REG == 0,
        "simulated register access at {:#x} is not {}-byte aligned",
        phys,
        REG
    );
}

impl PhysMemory for SimMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&self, base: PhysAddr, len: usize, protection: Protection) -> io::Result<NonNull<u8>> {
        let base = base.as_usize();
        if len == 0 || base & (self.page_size - 1) != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let end = base
            .checked_add(len)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EOVERFLOW))?;

        let mut state = self.state.borrow_mut();
        if state.faults.iter().any(|f| f.start < end && base < f.end) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }

        let mut window = Window::alloc(base, len, protection);
        let page_size = self.page_size;
        {
            // SAFETY: The window has not been handed out yet.
            let bytes = unsafe { window.bytes_mut() };
            for (page, content) in state.pages.range(base..end) {
                let offset = page - base;
                let n = page_size.min(len - offset);
                bytes[offset..offset + n].copy_from_slice(&content[..n]);
            }
        }
        // SAFETY: As above.
        let current = unsafe { window.bytes_mut() }.to_vec();
        window.snapshot = current.into_boxed_slice();

        let addr = window.addr();
        state.windows.insert(addr.as_ptr() as usize, window);
        state.map_calls += 1;
        Ok(addr)
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let key = addr.as_ptr() as usize;
        match state.windows.get(&key) {
            Some(window) if window.len == len => {}
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
        let Some(mut window) = state.windows.remove(&key) else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };

        if window.writable {
            let page_size = self.page_size;
            let base = window.base;
            let snapshot = std::mem::take(&mut window.snapshot);
            // SAFETY: Caller guarantees no access through the window follows.
            let bytes = unsafe { window.bytes_mut() };
            for (offset, (&now, &then)) in bytes.iter().zip(snapshot.iter()).enumerate() {
                if now == then {
                    continue;
                }
                let phys = base + offset;
                let page = phys & !(page_size - 1);
                let content = state
                    .pages
                    .entry(page)
                    .or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
                content[phys - page] = now;
            }
        }
        state.unmap_calls += 1;
        Ok(())
    }
}
