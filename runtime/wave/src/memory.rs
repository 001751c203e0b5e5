//! # Linear Memory
//!
//! Every linear memory owns the same fixed reservation, large enough for any
//! `base + i32 index + static offset` native code can form. Pages are
//! committed as the memory grows; everything past the committed size stays
//! `PROT_NONE`, so a stray access faults instead of reaching a neighbouring
//! mapping. The base address never moves and native code keeps it in a
//! register for the whole run.

use crate::config::PAGE_SIZE;
use crate::error::{Result, WaveError};
use crate::jit::memory::{Protection, Region};

/// Address space behind each linear memory: the 4 GiB index space, the
/// largest static offset (`i32::MAX`) and a trailing guard.
pub const RESERVATION_BYTES: u64 = 8 << 30;

/// A module's linear memory.
#[derive(Debug)]
pub struct LinearMemory {
    region: Region,
    /// Committed pages.
    pages: u32,
    /// Growth limit.
    max_pages: u32,
}

impl LinearMemory {
    /// Reserve the guarded span and commit `initial_pages`. The memory can
    /// later grow up to `max_pages`.
    pub fn new(initial_pages: u32, max_pages: u32) -> Result<Self> {
        let max_pages = max_pages.max(initial_pages);
        let reservation = usize::try_from(RESERVATION_BYTES).map_err(|_| {
            WaveError::UnsupportedFeature("linear memory needs a 64-bit address space".into())
        })?;
        let region = Region::map(reservation, Protection::empty())?;
        region.protect(0, initial_pages as usize * PAGE_SIZE, Protection::RW)?;
        Ok(Self {
            region,
            pages: initial_pages,
            max_pages,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.region.base()
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    pub fn size(&self) -> usize {
        self.pages as usize * PAGE_SIZE
    }

    /// Grow by `delta` pages. Returns the previous page count, or `None`
    /// when the new size would exceed the limit.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let old = self.pages;
        let new = old.checked_add(delta).filter(|&new| new <= self.max_pages)?;
        if let Err(err) = self.region.protect(
            old as usize * PAGE_SIZE,
            delta as usize * PAGE_SIZE,
            Protection::RW,
        ) {
            log::warn!("memory.grow by {delta} pages failed: {err}");
            return None;
        }
        self.pages = new;
        Some(old)
    }

    /// Bounds-checked view of the committed bytes.
    pub fn view(&mut self) -> MemoryView<'_> {
        MemoryView::new(unsafe { core::slice::from_raw_parts_mut(self.base(), self.size()) })
    }

    /// Copy `bytes` into memory at `offset`.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        let target = self
            .view()
            .into_slice_mut(offset, len as u32)
            .ok_or_else(|| {
                WaveError::OutOfBounds(format!("write of {len} bytes at {offset:#x}"))
            })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `len` bytes out of memory at `offset`.
    pub fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        self.view()
            .slice(offset, len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| WaveError::OutOfBounds(format!("read of {len} bytes at {offset:#x}")))
    }
}

/// Linear memory as seen by a host function: WASM addresses in, host slices
/// out.
#[derive(Debug)]
pub struct MemoryView<'a> {
    bytes: &'a mut [u8],
}

impl<'a> MemoryView<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `[ptr, ptr + len)` if it lies inside memory.
    pub fn slice(&self, ptr: u32, len: u32) -> Option<&[u8]> {
        let start = ptr as usize;
        self.bytes.get(start..start.checked_add(len as usize)?)
    }

    pub fn slice_mut(&mut self, ptr: u32, len: u32) -> Option<&mut [u8]> {
        let start = ptr as usize;
        self.bytes.get_mut(start..start.checked_add(len as usize)?)
    }

    fn into_slice_mut(self, ptr: u32, len: u32) -> Option<&'a mut [u8]> {
        let start = ptr as usize;
        self.bytes.get_mut(start..start.checked_add(len as usize)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_returns_old_pages() {
        let mut memory = LinearMemory::new(1, 3).unwrap();
        assert_eq!(memory.size(), PAGE_SIZE);
        assert_eq!(memory.grow(1), Some(1));
        assert_eq!(memory.grow(0), Some(2));
        assert_eq!(memory.grow(2), None);
        assert_eq!(memory.pages(), 2);
        // Newly committed pages are zeroed and writable.
        memory.write((PAGE_SIZE + 8) as u32, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read((PAGE_SIZE + 8) as u32, 4).unwrap(), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_base_is_stable_across_growth() {
        let mut memory = LinearMemory::new(0, 4).unwrap();
        let base = memory.base();
        assert!(memory.read(0, 1).is_err());
        memory.grow(4).unwrap();
        assert_eq!(memory.base(), base);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_uncommitted_span_is_inaccessible() {
        let memory = LinearMemory::new(1, 1).unwrap();
        let base = memory.base() as usize;
        // Past the committed page, and the furthest byte an 8-byte access with
        // the largest index and offset can touch.
        let addresses = [
            base + PAGE_SIZE,
            base + u32::MAX as usize + i32::MAX as usize + 7,
        ];
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        for address in addresses {
            let perms = maps.lines().find_map(|line| {
                let (range, rest) = line.split_once(' ')?;
                let (start, end) = range.split_once('-')?;
                let start = usize::from_str_radix(start, 16).ok()?;
                let end = usize::from_str_radix(end, 16).ok()?;
                (start..end).contains(&address).then(|| rest[..4].to_string())
            });
            assert_eq!(perms.as_deref(), Some("---p"), "address {address:#x}");
        }
        let committed = maps.lines().any(|line| {
            line.split_once('-')
                .and_then(|(start, _)| usize::from_str_radix(start, 16).ok())
                == Some(base)
                && line.contains(" rw-p ")
        });
        assert!(committed);
    }

    #[test]
    fn test_view_bounds() {
        let mut bytes = [0u8; 8];
        let mut view = MemoryView::new(&mut bytes);
        assert_eq!(view.slice(4, 4).map(<[u8]>::len), Some(4));
        assert!(view.slice(5, 4).is_none());
        assert!(view.slice(u32::MAX, 2).is_none());
        view.slice_mut(0, 1).unwrap()[0] = 9;
        assert_eq!(bytes[0], 9);
    }
}
