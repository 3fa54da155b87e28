//! Relocation records for compiled blocks.
//!
//! Blocks are emitted position independent; every reference to a runtime
//! helper or an absolute guest address is recorded against its byte offset
//! and patched when the block is placed. A block reloaded from a cache file
//! goes through exactly the same path, which is why an unresolvable symbol
//! is a recoverable error (the block is dropped and recompiled) rather than
//! a panic.

use thiserror::Error;

use crate::backend::HostArch;

/// Runtime entry points generated code may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// `extern "C" fn(*mut GuestState) -> u64`, args in `helper_args`.
    SyscallHandler,
    /// `extern "C" fn(*mut GuestState) -> u64`, leaf/half in `helper_args`.
    CpuIdHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// 8-byte absolute literal holding a symbol address.
    SymbolLiteral { symbol: Symbol },
    /// Move-immediate of a symbol address into a host register.
    ThunkMove { symbol: Symbol },
    /// 8-byte absolute literal holding a guest address.
    GuestRipLiteral { rip: u64 },
    /// Move-immediate of a guest address into a host register.
    GuestRipMove { rip: u64 },
}

/// One patch site: `offset` is where the immediate/literal field begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub kind: RelocationKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelocationError {
    #[error("unresolved symbol {symbol:?} at offset {offset:#x}")]
    UnresolvedSymbol { symbol: Symbol, offset: usize },
    #[error("relocation field at {offset:#x} outside code (len {len:#x})")]
    OutOfBounds { offset: usize, len: usize },
}

/// Maps symbols to host addresses at placement time.
pub trait SymbolResolver {
    fn resolve(&self, symbol: Symbol) -> Option<u64>;

    /// Translate a guest address for rip relocations. The JIT uses the
    /// identity mapping; cache reload may rebase.
    fn guest_rip(&self, rip: u64) -> u64 {
        rip
    }
}

/// Patch every relocation in `code` in place.
pub fn apply_relocations(
    code: &mut [u8],
    relocations: &[Relocation],
    resolver: &dyn SymbolResolver,
    arch: HostArch,
) -> Result<(), RelocationError> {
    for reloc in relocations {
        let value = match reloc.kind {
            RelocationKind::SymbolLiteral { symbol } | RelocationKind::ThunkMove { symbol } => {
                resolver
                    .resolve(symbol)
                    .ok_or(RelocationError::UnresolvedSymbol {
                        symbol,
                        offset: reloc.offset,
                    })?
            }
            RelocationKind::GuestRipLiteral { rip } | RelocationKind::GuestRipMove { rip } => {
                resolver.guest_rip(rip)
            }
        };
        match reloc.kind {
            RelocationKind::SymbolLiteral { .. } | RelocationKind::GuestRipLiteral { .. } => {
                patch_literal(code, reloc.offset, value)?;
            }
            RelocationKind::ThunkMove { .. } | RelocationKind::GuestRipMove { .. } => match arch {
                // mov r64, imm64: the field is the raw 8-byte immediate.
                HostArch::X86_64 => patch_literal(code, reloc.offset, value)?,
                // movz/movk x4 sequence: one 16-bit chunk per instruction.
                HostArch::Aarch64 => patch_aarch64_move(code, reloc.offset, value)?,
            },
        }
    }
    Ok(())
}

fn patch_literal(code: &mut [u8], offset: usize, value: u64) -> Result<(), RelocationError> {
    let end = offset.checked_add(8).filter(|&end| end <= code.len());
    let Some(end) = end else {
        return Err(RelocationError::OutOfBounds {
            offset,
            len: code.len(),
        });
    };
    code[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Rewrite the 16-bit immediates of a 4-instruction movz/movk group,
/// preserving register and shift fields.
fn patch_aarch64_move(code: &mut [u8], offset: usize, value: u64) -> Result<(), RelocationError> {
    let end = offset.checked_add(16).filter(|&end| end <= code.len());
    let Some(end) = end else {
        return Err(RelocationError::OutOfBounds {
            offset,
            len: code.len(),
        });
    };
    for (i, chunk) in code[offset..end].chunks_exact_mut(4).enumerate() {
        let imm16 = ((value >> (16 * i)) & 0xffff) as u32;
        let inst = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
        let inst = (inst & !(0xffff << 5)) | (imm16 << 5);
        chunk.copy_from_slice(&inst.to_le_bytes());
    }
    Ok(())
}
