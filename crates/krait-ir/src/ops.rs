//! IR op payloads.
//!
//! The op set is closed; backends dispatch with an exhaustive `match`. Every
//! op declares its value arguments through [`IrOp::for_each_arg`] /
//! [`IrOp::for_each_arg_mut`] so passes can walk and rewrite references
//! without knowing individual layouts.

use krait_types::{Cond, Flag, FlagSet, Fpr, Gpr, Width};

use crate::arena::NodeId;

/// Index of a code block within an [`crate::IrFunction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A code block: Begin/End delimited op range within the node arena.
///
/// `begin` is the `BlockBegin` marker node, `end` the terminator. Ops between
/// them are reached through the intrusive `next` links.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub entry_rip: u64,
    pub begin: NodeId,
    pub end: NodeId,
    /// Successor blocks in terminator order (then, else).
    pub succs: Vec<BlockId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Mul,
    Eq,
}

/// Which halves of the CPUID result an op produces (packed low|high<<32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuIdHalf {
    EaxEbx,
    EcxEdx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    InvalidOpcode,
    Breakpoint,
    NonExecutable,
}

/// Upper bound on guest syscall value arguments (selector excluded).
pub const MAX_SYSCALL_ARGS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrOp {
    /// Block start marker; the only op with no payload semantics.
    BlockBegin { block: BlockId },
    Const { value: u64 },
    LoadGpr { reg: Gpr },
    StoreGpr { reg: Gpr, src: NodeId },
    /// Dynamic context access; conservatively reads the whole register file.
    LoadGprIndexed { index: NodeId },
    StoreGprIndexed { index: NodeId, src: NodeId },
    LoadFlag { flag: Flag },
    StoreFlag { flag: Flag, src: NodeId },
    LoadFpr { reg: Fpr },
    StoreFpr { reg: Fpr, src: NodeId },
    LoadMem { addr: NodeId, width: Width },
    StoreMem { addr: NodeId, src: NodeId, width: Width },
    BinOp {
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
        width: Width,
        /// Flags this op updates in the guest flag state.
        flags: FlagSet,
    },
    /// Flag-only subtract (`CMP`).
    CmpFlags { lhs: NodeId, rhs: NodeId, width: Width, flags: FlagSet },
    /// Flag-only and (`TEST`).
    TestFlags { lhs: NodeId, rhs: NodeId, width: Width, flags: FlagSet },
    SignExtend { src: NodeId, from: Width },
    EvalCond { cond: Cond },
    Select { cond: NodeId, if_true: NodeId, if_false: NodeId, width: Width },
    Syscall {
        selector: NodeId,
        args: [NodeId; MAX_SYSCALL_ARGS],
        arg_count: u8,
        /// Set by the inline-call pass when the host can issue the syscall
        /// directly instead of round-tripping through the runtime helper.
        passthrough: bool,
    },
    CpuId { leaf: NodeId, half: CpuIdHalf },

    // Terminators.
    Jump { target: BlockId },
    CondJump { cond: NodeId, if_true: BlockId, if_false: BlockId },
    /// Leave translated code; `next_rip` is the continuation guest address.
    ExitFunction { next_rip: NodeId },
    /// Deliver a guest-visible fault at runtime.
    GuestFault { rip: u64, kind: FaultKind },

    /// Removed node awaiting compaction. Never linked into a block.
    Tombstone,
}

impl IrOp {
    /// Whether this op defines an SSA value.
    #[must_use]
    pub fn has_dest(&self) -> bool {
        matches!(
            self,
            IrOp::Const { .. }
                | IrOp::LoadGpr { .. }
                | IrOp::LoadGprIndexed { .. }
                | IrOp::LoadFlag { .. }
                | IrOp::LoadFpr { .. }
                | IrOp::LoadMem { .. }
                | IrOp::BinOp { .. }
                | IrOp::SignExtend { .. }
                | IrOp::EvalCond { .. }
                | IrOp::Select { .. }
                | IrOp::Syscall { .. }
                | IrOp::CpuId { .. }
        )
    }

    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            IrOp::Jump { .. }
                | IrOp::CondJump { .. }
                | IrOp::ExitFunction { .. }
                | IrOp::GuestFault { .. }
        )
    }

    /// Ops that must stay even when their result is unused.
    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            IrOp::BlockBegin { .. }
                | IrOp::StoreGpr { .. }
                | IrOp::StoreGprIndexed { .. }
                | IrOp::StoreFlag { .. }
                | IrOp::StoreFpr { .. }
                | IrOp::StoreMem { .. }
                | IrOp::Syscall { .. }
                | IrOp::CpuId { .. }
        ) || self.is_terminator()
            // Flag-producing ALU ops write guest state.
            || matches!(
                self,
                IrOp::BinOp { flags, .. }
                    | IrOp::CmpFlags { flags, .. }
                    | IrOp::TestFlags { flags, .. }
                    if !flags.is_empty()
            )
    }

    /// Whether this op's result lives in the vector register class.
    #[must_use]
    pub fn is_vector_value(&self) -> bool {
        matches!(self, IrOp::LoadFpr { .. })
            || matches!(self, IrOp::LoadMem { width: Width::W128, .. })
    }

    pub fn for_each_arg(&self, mut f: impl FnMut(NodeId)) {
        match *self {
            IrOp::BlockBegin { .. }
            | IrOp::Const { .. }
            | IrOp::LoadGpr { .. }
            | IrOp::LoadFlag { .. }
            | IrOp::LoadFpr { .. }
            | IrOp::EvalCond { .. }
            | IrOp::Jump { .. }
            | IrOp::GuestFault { .. }
            | IrOp::Tombstone => {}
            IrOp::LoadGprIndexed { index } => f(index),
            IrOp::StoreGprIndexed { index, src } => {
                f(index);
                f(src);
            }
            IrOp::StoreGpr { src, .. }
            | IrOp::StoreFlag { src, .. }
            | IrOp::StoreFpr { src, .. }
            | IrOp::SignExtend { src, .. } => f(src),
            IrOp::LoadMem { addr, .. } => f(addr),
            IrOp::StoreMem { addr, src, .. } => {
                f(addr);
                f(src);
            }
            IrOp::BinOp { lhs, rhs, .. }
            | IrOp::CmpFlags { lhs, rhs, .. }
            | IrOp::TestFlags { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            IrOp::Select { cond, if_true, if_false, .. } => {
                f(cond);
                f(if_true);
                f(if_false);
            }
            IrOp::Syscall { selector, args, arg_count, .. } => {
                f(selector);
                for arg in args.iter().take(arg_count as usize) {
                    f(*arg);
                }
            }
            IrOp::CpuId { leaf, .. } => f(leaf),
            IrOp::CondJump { cond, .. } => f(cond),
            IrOp::ExitFunction { next_rip } => f(next_rip),
        }
    }

    pub fn for_each_arg_mut(&mut self, mut f: impl FnMut(&mut NodeId)) {
        match self {
            IrOp::BlockBegin { .. }
            | IrOp::Const { .. }
            | IrOp::LoadGpr { .. }
            | IrOp::LoadFlag { .. }
            | IrOp::LoadFpr { .. }
            | IrOp::EvalCond { .. }
            | IrOp::Jump { .. }
            | IrOp::GuestFault { .. }
            | IrOp::Tombstone => {}
            IrOp::LoadGprIndexed { index } => f(index),
            IrOp::StoreGprIndexed { index, src } => {
                f(index);
                f(src);
            }
            IrOp::StoreGpr { src, .. }
            | IrOp::StoreFlag { src, .. }
            | IrOp::StoreFpr { src, .. }
            | IrOp::SignExtend { src, .. } => f(src),
            IrOp::LoadMem { addr, .. } => f(addr),
            IrOp::StoreMem { addr, src, .. } => {
                f(addr);
                f(src);
            }
            IrOp::BinOp { lhs, rhs, .. }
            | IrOp::CmpFlags { lhs, rhs, .. }
            | IrOp::TestFlags { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            IrOp::Select { cond, if_true, if_false, .. } => {
                f(cond);
                f(if_true);
                f(if_false);
            }
            IrOp::Syscall { selector, args, arg_count, .. } => {
                f(selector);
                for arg in args.iter_mut().take(*arg_count as usize) {
                    f(arg);
                }
            }
            IrOp::CpuId { leaf, .. } => f(leaf),
            IrOp::CondJump { cond, .. } => f(cond),
            IrOp::ExitFunction { next_rip } => f(next_rip),
        }
    }
}

/// Evaluate a flagless binary op on 64-bit values (used by constant folding).
#[must_use]
pub fn eval_binop(op: BinOp, lhs: u64, rhs: u64) -> u64 {
    match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Shl => lhs.wrapping_shl(rhs as u32 & 63),
        BinOp::Shr => lhs.wrapping_shr(rhs as u32 & 63),
        BinOp::Sar => ((lhs as i64).wrapping_shr(rhs as u32 & 63)) as u64,
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::Eq => (lhs == rhs) as u64,
    }
}
