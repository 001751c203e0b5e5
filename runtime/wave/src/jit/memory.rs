//! # Executable and Data Planes
//!
//! Thin layer over the OS memory service (`mmap`/`mprotect`/`munmap`).
//!
//! - [`Region`]: one anonymous mapping, released on drop.
//! - [`ExecutablePlane`]: the code region. Writable only while the compiler
//!   is emitting into it, read+execute otherwise.
//! - [`StackPlane`]: evaluation stack and locals buffer, each followed by a
//!   guard page. Read-write only while native code runs.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::error::{Result, WaveError};

// =============================================================================
// Memory Protection
// =============================================================================

bitflags! {
    /// Memory protection flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Read permission.
        const READ = 1 << 0;
        /// Write permission.
        const WRITE = 1 << 1;
        /// Execute permission.
        const EXEC = 1 << 2;
        /// Read + Write.
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// Read + Execute.
        const RX = Self::READ.bits() | Self::EXEC.bits();
    }
}

impl Protection {
    fn to_native(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Size of an OS page.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Round `len` up to a whole number of OS pages.
pub fn page_align(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

// =============================================================================
// Region
// =============================================================================

/// An anonymous private mapping.
#[derive(Debug)]
pub struct Region {
    base: NonNull<u8>,
    size: usize,
}

impl Region {
    /// Reserve and commit `size` bytes (rounded up to pages) with `protection`.
    ///
    /// An empty protection only reserves address space.
    pub fn map(size: usize, protection: Protection) -> Result<Self> {
        let size = page_align(size.max(1));
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if protection.is_empty() {
            flags |= libc::MAP_NORESERVE;
        }
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                protection.to_native(),
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(WaveError::last_os_error("mmap"));
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(WaveError::Os {
            op: "mmap",
            errno: 0,
        })?;
        Ok(Self { base, size })
    }

    /// Change the protection of `[offset, offset + len)`; both page aligned.
    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> Result<()> {
        debug_assert!(offset + len <= self.size);
        if len == 0 {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                self.base.as_ptr().add(offset).cast(),
                len,
                protection.to_native(),
            )
        };
        if rc != 0 {
            return Err(WaveError::last_os_error("mprotect"));
        }
        Ok(())
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.size);
        }
    }
}

// =============================================================================
// Executable Plane
// =============================================================================

/// The code region every compiled function, stub and slot lives in.
///
/// Offsets into the plane are stable for its whole lifetime; absolute
/// addresses are only derived when native code needs them.
#[derive(Debug)]
pub struct ExecutablePlane {
    region: Region,
    /// Bytes handed out so far.
    used: usize,
    protection: Protection,
}

impl ExecutablePlane {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            region: Region::map(capacity, Protection::RW)?,
            used: 0,
            protection: Protection::RW,
        })
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Switch to RW for emission.
    pub fn make_writable(&mut self) -> Result<()> {
        if self.protection != Protection::RW {
            self.region.protect(0, self.region.size(), Protection::RW)?;
            self.protection = Protection::RW;
        }
        Ok(())
    }

    /// Switch to RX, enforcing W^X.
    pub fn make_executable(&mut self) -> Result<()> {
        if self.protection != Protection::RX {
            // x86_64 keeps the I-cache coherent; order the writes anyway.
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            self.region.protect(0, self.region.size(), Protection::RX)?;
            self.protection = Protection::RX;
        }
        Ok(())
    }

    /// Whole plane as a mutable slice. Only valid while writable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.protection, Protection::RW);
        unsafe { core::slice::from_raw_parts_mut(self.region.base(), self.region.size()) }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.region.base(), self.used) }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn set_used(&mut self, used: usize) {
        debug_assert!(used <= self.region.size());
        self.used = used;
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    /// Absolute address of `offset`.
    pub fn address(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.region.size());
        unsafe { self.region.base().add(offset) }
    }

    /// Read a little-endian word previously emitted at `offset`.
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes()[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }
}

// =============================================================================
// Stack Plane
// =============================================================================

/// Evaluation stack and locals buffer for native execution.
///
/// ```text
/// | operand stack | guard | locals | guard |
/// ```
#[derive(Debug)]
pub struct StackPlane {
    region: Region,
    operand_len: usize,
    locals_offset: usize,
    locals_len: usize,
}

impl StackPlane {
    pub fn new(operand_slots: usize, locals_slots: usize) -> Result<Self> {
        let page = page_size();
        let operand_len = page_align(operand_slots.max(1) * 8);
        let locals_len = page_align(locals_slots.max(1) * 8);
        let locals_offset = operand_len + page;
        let region = Region::map(locals_offset + locals_len + page, Protection::empty())?;
        Ok(Self {
            region,
            operand_len,
            locals_offset,
            locals_len,
        })
    }

    /// Open both stacks for native code.
    pub fn make_writable(&self) -> Result<()> {
        self.region.protect(0, self.operand_len, Protection::RW)?;
        self.region
            .protect(self.locals_offset, self.locals_len, Protection::RW)
    }

    /// Close both stacks once native code has returned.
    pub fn make_readonly(&self) -> Result<()> {
        self.region.protect(0, self.operand_len, Protection::READ)?;
        self.region
            .protect(self.locals_offset, self.locals_len, Protection::READ)
    }

    pub fn operand_base(&self) -> *mut u64 {
        self.region.base().cast()
    }

    pub fn locals_base(&self) -> *mut u64 {
        unsafe { self.region.base().add(self.locals_offset).cast() }
    }

    /// One past the last usable locals slot.
    pub fn locals_end(&self) -> *mut u64 {
        unsafe {
            self.region
                .base()
                .add(self.locals_offset + self.locals_len)
                .cast()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_flags() {
        assert!(Protection::RW.contains(Protection::WRITE));
        assert!(!Protection::RX.contains(Protection::WRITE));
        assert!(Protection::RX.contains(Protection::EXEC));
        assert_eq!(Protection::empty().to_native(), libc::PROT_NONE);
        assert_eq!(
            Protection::RX.to_native(),
            libc::PROT_READ | libc::PROT_EXEC
        );
    }

    #[test]
    fn test_plane_toggles_protection() {
        let mut plane = ExecutablePlane::new(1).unwrap();
        assert_eq!(plane.capacity(), page_size());
        plane.bytes_mut()[..8].copy_from_slice(&42u64.to_le_bytes());
        plane.set_used(8);
        plane.make_executable().unwrap();
        assert_eq!(plane.protection(), Protection::RX);
        assert_eq!(plane.read_u64(0), 42);
        plane.make_writable().unwrap();
        assert_eq!(plane.protection(), Protection::RW);
    }

    #[test]
    fn test_stack_plane_layout() {
        let stacks = StackPlane::new(16, 16).unwrap();
        stacks.make_writable().unwrap();
        unsafe {
            stacks.operand_base().write(7);
            stacks.locals_base().write(9);
            assert_eq!(stacks.operand_base().read(), 7);
        }
        stacks.make_readonly().unwrap();
        let gap = stacks.locals_base() as usize - stacks.operand_base() as usize;
        assert_eq!(gap, 2 * page_size());
        assert_eq!(stacks.locals_end() as usize - stacks.locals_base() as usize, page_size());
    }
}
