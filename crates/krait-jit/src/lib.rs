//! Host code generation for translated guest regions.
//!
//! Takes a compacted, register-allocated [`krait_ir::IrFunction`] and
//! splatters it into native machine code, one op at a time, for either host
//! architecture. Produced blocks are position independent: external
//! addresses (runtime helpers, guest rips) are carried as relocation records
//! and patched in by [`reloc::apply_relocations`] when the block is placed.
//!
//! The [`dispatch`] module holds the host-call boundary between native
//! blocks and the runtime: blocks are plain `extern "C"` functions over a
//! [`state::GuestState`], returning the next guest address.

pub mod backend;
pub mod buffer;
pub mod dispatch;
pub mod exec_mem;
pub mod reloc;
pub mod state;

pub use backend::{backend_for, CompileError, CompiledBlock, HostArch, HostBackend};
pub use buffer::{CodeBuffer, Label};
pub use dispatch::{BlockFn, BlockSource, DispatchExit, Dispatcher};
pub use exec_mem::{ExecMemory, SealedMemory};
pub use reloc::{apply_relocations, Relocation, RelocationError, RelocationKind, Symbol, SymbolResolver};
pub use state::GuestState;
