//! Arena-backed IR for the krait translation core.
//!
//! Nodes live in a linear arena and are referenced by positional
//! [`NodeId`]s; identity and ordering are derived from the slot index, so
//! dominance inside a block is an integer comparison and there are no
//! pointer cycles between blocks and ops. Per-block op order is an intrusive
//! doubly linked list threaded through the nodes.
//!
//! The [`emit`] module translates decoded guest instructions into IR; the
//! [`passes`] module hosts the optimization pipeline (dead store
//! elimination, inline-call optimization, compaction, validation) and the
//! graph-coloring register allocator.

mod arena;
mod ops;
mod view;

pub mod emit;
pub mod passes;

pub use arena::{IrArena, IrFunction, NodeId, OrderedNode};
pub use emit::translate_region;
pub use ops::{eval_binop, BinOp, Block, BlockId, CpuIdHalf, FaultKind, IrOp, MAX_SYSCALL_ARGS};
pub use view::IrListView;
