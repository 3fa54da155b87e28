//! Executable memory for placed blocks.
//!
//! W^X discipline: a region is mapped read-write, filled and patched, then
//! flipped to read-execute before any entry pointer is handed out. Entry
//! pointers are only produced after the flip, so the type state makes it
//! impossible to execute a still-writable page through this interface.

use std::io;
use std::ptr;

use crate::dispatch::BlockFn;

/// A writable anonymous mapping being filled with code.
#[derive(Debug)]
pub struct ExecMemory {
    base: *mut u8,
    len: usize,
    used: usize,
}

// The mapping is exclusively owned; raw pointers are only handed out as
// offsets resolved by the owner.
unsafe impl Send for ExecMemory {}
unsafe impl Sync for ExecMemory {}

/// The same mapping after the flip to read-execute.
#[derive(Debug)]
pub struct SealedMemory {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for SealedMemory {}
unsafe impl Sync for SealedMemory {}

impl ExecMemory {
    /// Map `len` bytes (rounded up to the page size) of zeroed RW memory.
    pub fn map(len: usize) -> io::Result<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = len.div_ceil(page).max(1) * page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: base.cast(),
            len,
            used: 0,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.len - self.used
    }

    /// Copy `code` into the region, returning its byte offset. Fails with
    /// `None` when the region is full; the caller maps a fresh region.
    #[must_use]
    pub fn place(&mut self, code: &[u8]) -> Option<usize> {
        if code.len() > self.remaining() {
            return None;
        }
        let offset = self.used;
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), self.base.add(offset), code.len());
        }
        // Keep block starts 16-byte aligned.
        self.used = (offset + code.len() + 15) & !15;
        Some(offset)
    }

    /// Mutable view of already-placed bytes, for relocation patching.
    #[must_use]
    pub fn placed_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) }
    }

    /// Flip the mapping to read-execute.
    pub fn seal(self) -> io::Result<SealedMemory> {
        let rc = unsafe { libc::mprotect(self.base.cast(), self.len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let sealed = SealedMemory {
            base: self.base,
            len: self.len,
        };
        std::mem::forget(self);
        Ok(sealed)
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

impl SealedMemory {
    /// Host address of the code at `offset`.
    #[must_use]
    pub fn address_of(&self, offset: usize) -> u64 {
        assert!(offset < self.len);
        self.base as u64 + offset as u64
    }

    /// Entry pointer for the block at `offset`.
    ///
    /// # Safety
    /// `offset` must be the start of a block placed before sealing, compiled
    /// for this host with all relocations applied.
    #[must_use]
    pub unsafe fn entry_at(&self, offset: usize) -> BlockFn {
        assert!(offset < self.len);
        std::mem::transmute::<*const u8, BlockFn>(self.base.add(offset).cast_const())
    }
}

impl Drop for SealedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}
