//! Fault classification for the signal delegator.
//!
//! Guest memory is identity mapped, so runtime code copies guest bytes with
//! plain loads and stores that can fault on unmapped guest addresses. Every
//! such copy routine registers its host code range here; when a memory
//! fault arrives, the delegator asks whether the faulting host pc falls in
//! a fault-safe copy range and classifies accordingly instead of treating
//! the fault as a runtime bug.

use std::ops::Range;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// The pc sits inside a registered fault-safe copy routine; the copy
    /// reports failure and execution continues.
    FaultSafeCopy,
    /// Anything else; the fault is delivered to the guest or is fatal.
    Unknown,
}

#[derive(Default)]
pub struct CopyRangeRegistry {
    ranges: RwLock<Vec<Range<u64>>>,
}

impl CopyRangeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the host code range of a fault-safe copy routine.
    pub fn register(&self, range: Range<u64>) {
        assert!(range.start < range.end, "empty copy range");
        self.ranges
            .write()
            .expect("copy range lock poisoned")
            .push(range);
    }

    #[must_use]
    pub fn contains(&self, host_pc: u64) -> bool {
        self.ranges
            .read()
            .expect("copy range lock poisoned")
            .iter()
            .any(|range| range.contains(&host_pc))
    }

    #[must_use]
    pub fn classify(&self, host_pc: u64) -> FaultOrigin {
        if self.contains(host_pc) {
            FaultOrigin::FaultSafeCopy
        } else {
            FaultOrigin::Unknown
        }
    }
}

/// Copy guest bytes into `dst` through the identity mapping.
///
/// # Safety
/// `guest_addr..guest_addr + dst.len()` must be mapped readable host
/// memory for the duration of the call; faults inside the copy are only
/// recoverable when the caller has wired the signal delegator to a
/// registered copy range.
pub unsafe fn copy_from_guest(dst: &mut [u8], guest_addr: u64) {
    std::ptr::copy_nonoverlapping(guest_addr as usize as *const u8, dst.as_mut_ptr(), dst.len());
}

/// Copy `src` to guest memory through the identity mapping.
///
/// # Safety
/// The destination range must be mapped writable host memory; see
/// [`copy_from_guest`].
pub unsafe fn copy_to_guest(guest_addr: u64, src: &[u8]) {
    std::ptr::copy_nonoverlapping(src.as_ptr(), guest_addr as usize as *mut u8, src.len());
}
