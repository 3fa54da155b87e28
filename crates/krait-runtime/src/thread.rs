//! Per-guest-thread state.
//!
//! Each guest thread owns its architectural state, its own backend instance
//! and the executable memory holding the code it compiled. Compilation for
//! a thread is serialized by the core mutex; the lookup cache is shared
//! across threads by the owning [`crate::Context`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use krait_jit::exec_mem::SealedMemory;
use krait_jit::{backend_for, GuestState, HostArch, HostBackend};

pub struct ThreadState {
    pub id: u64,
    /// Architectural guest state, taken by the dispatcher while running.
    pub cpu: Mutex<GuestState>,
    decode_calls: AtomicU64,
    pub(crate) core: Mutex<CompileCore>,
}

/// Compile-side resources; one lock covers a whole region compile.
pub(crate) struct CompileCore {
    pub backend: Box<dyn HostBackend + Send>,
    /// Sealed regions, kept alive for as long as the thread may run them.
    /// Cache erasure makes blocks unreachable; the bytes only go away here.
    pub code: Vec<SealedMemory>,
}

impl ThreadState {
    #[must_use]
    pub fn new(id: u64, arch: HostArch) -> Self {
        Self {
            id,
            cpu: Mutex::new(GuestState::new()),
            decode_calls: AtomicU64::new(0),
            core: Mutex::new(CompileCore {
                backend: backend_for(arch),
                code: Vec::new(),
            }),
        }
    }

    /// Number of decode passes this thread has performed. A cache-served
    /// compile does not move this.
    #[must_use]
    pub fn decode_calls(&self) -> u64 {
        self.decode_calls.load(Ordering::Relaxed)
    }

    pub(crate) fn note_decode(&self) {
        self.decode_calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_counter_starts_at_zero() {
        let thread = ThreadState::new(1, HostArch::X86_64);
        assert_eq!(thread.decode_calls(), 0);
        thread.note_decode();
        thread.note_decode();
        assert_eq!(thread.decode_calls(), 2);
    }
}
