//! Host code generators.
//!
//! One splatter backend per host architecture: ops are compiled
//! independently through an exhaustive match over the closed op set, values
//! live in the registers the allocator picked, and a reserved scratch set
//! covers the sequences that need temporaries. Helper calls spill and
//! refill the entire allocatable set, so the allocator never has to know
//! about call clobbers.

use krait_ir::passes::regalloc::{AllocationResult, ClassConfig};
use krait_ir::IrFunction;
use thiserror::Error;

use crate::buffer::FixupError;
use crate::reloc::Relocation;

pub mod a64;
pub mod x64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostArch {
    X86_64,
    Aarch64,
}

impl HostArch {
    /// The architecture this binary runs on.
    #[must_use]
    pub fn native() -> Option<HostArch> {
        if cfg!(target_arch = "x86_64") {
            Some(HostArch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(HostArch::Aarch64)
        } else {
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    /// The allocator ran out of registers; the caller retries the region
    /// with a smaller block ceiling.
    #[error("register pressure: {spills} values spilled")]
    RegisterPressure { spills: usize },
    #[error(transparent)]
    Fixup(#[from] FixupError),
}

/// A compiled region, not yet placed in executable memory.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    /// Guest address of the region entry.
    pub entry_rip: u64,
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    /// Guest block entry → host code offset, in emission order. Used for
    /// fault attribution and block-entry lookup.
    pub rip_to_offset: Vec<(u64, u32)>,
}

impl CompiledBlock {
    #[must_use]
    pub fn host_offset_of(&self, rip: u64) -> Option<u32> {
        self.rip_to_offset
            .iter()
            .find(|(guest, _)| *guest == rip)
            .map(|(_, offset)| *offset)
    }

    /// Guest entry of the block containing `host_offset` (the greatest
    /// recorded entry at or below it).
    #[must_use]
    pub fn guest_rip_at(&self, host_offset: u32) -> Option<u64> {
        self.rip_to_offset
            .iter()
            .filter(|(_, offset)| *offset <= host_offset)
            .max_by_key(|(_, offset)| *offset)
            .map(|(guest, _)| *guest)
    }
}

pub trait HostBackend {
    fn arch(&self) -> HostArch;

    /// Allocatable register budgets this backend exposes to the allocator,
    /// `(integer, vector)`.
    fn class_budget(&self) -> (ClassConfig, ClassConfig);

    /// Compile a compacted, register-allocated function.
    fn compile(
        &mut self,
        func: &IrFunction,
        regs: &AllocationResult,
    ) -> Result<CompiledBlock, CompileError>;
}

#[must_use]
pub fn backend_for(arch: HostArch) -> Box<dyn HostBackend + Send> {
    match arch {
        HostArch::X86_64 => Box::new(x64::X64Backend::new()),
        HostArch::Aarch64 => Box::new(a64::A64Backend::new()),
    }
}
