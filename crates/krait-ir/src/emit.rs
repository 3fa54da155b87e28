//! Decoded-instruction to IR translation.
//!
//! One IR block per decoded block, ops appended in guest order. Guest
//! register accesses are widened to full 64-bit context loads/stores with
//! explicit mask/merge sequences, so later passes see every partial-width
//! write as a plain read-modify-write. Constants are pooled per block; the
//! pool resets at each `BlockBegin` so a reused constant always dominates
//! its uses.
//!
//! Direct branches whose targets were discovered as sibling blocks become
//! `Jump`/`CondJump`; everything else (calls, returns, indirect jumps,
//! undiscovered targets) leaves the function through `ExitFunction` with the
//! continuation address as a value.

use std::collections::HashMap;

use krait_types::{FlagSet, Gpr, Width};
use krait_x86::{
    Address, AluOp, BlockStatus, DecodedBlock, DecodedRegion, InstKind, Operand, Reg, ShiftOp,
    VecOperand,
};

use crate::arena::{IrFunction, NodeId};
use crate::ops::{BinOp, Block, BlockId, CpuIdHalf, FaultKind, IrOp, MAX_SYSCALL_ARGS};

/// Linux x86-64 syscall argument registers, in ABI order.
const SYSCALL_ARG_REGS: [Gpr; MAX_SYSCALL_ARGS] =
    [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::R10, Gpr::R8, Gpr::R9];

/// Translate a decoded region into an [`IrFunction`].
#[must_use]
pub fn translate_region(region: &DecodedRegion) -> IrFunction {
    let mut emitter = IrEmitter::new(region);
    for (index, block) in region.blocks.iter().enumerate() {
        emitter.lower_block(BlockId(index as u32), block);
    }
    tracing::trace!(
        entry = format_args!("{:#x}", region.entry),
        blocks = region.blocks.len(),
        nodes = emitter.func.arena.len(),
        "translated region"
    );
    emitter.func
}

struct IrEmitter {
    func: IrFunction,
    /// Guest entry address to block index, for direct-branch targets.
    rip_to_block: HashMap<u64, BlockId>,
    /// Last linked node of the block under construction.
    cursor: NodeId,
    /// Per-block constant pool; cleared at every block start.
    consts: HashMap<u64, NodeId>,
    /// Successors recorded by the current block's terminator.
    succs: Vec<BlockId>,
}

impl IrEmitter {
    fn new(region: &DecodedRegion) -> Self {
        let rip_to_block = region
            .blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.entry, BlockId(index as u32)))
            .collect();
        let mut func = IrFunction::default();
        func.entry_rip = region.entry;
        Self {
            func,
            rip_to_block,
            cursor: NodeId::INVALID,
            consts: HashMap::new(),
            succs: Vec::new(),
        }
    }

    fn lower_block(&mut self, id: BlockId, decoded: &DecodedBlock) {
        self.consts.clear();
        self.succs.clear();

        let begin = self.func.arena.push(IrOp::BlockBegin { block: id });
        self.cursor = begin;

        let mut fell_to = decoded.entry;
        for inst in &decoded.insts {
            self.lower_inst(inst);
            fell_to = inst.next_rip();
        }

        // Blocks that did not end at a control transfer still need an IR
        // terminator so the dispatcher regains control.
        if !self.func.arena.op(self.cursor).is_terminator() {
            match decoded.status {
                BlockStatus::NonExecutable => {
                    self.emit(IrOp::GuestFault {
                        rip: fell_to,
                        kind: FaultKind::NonExecutable,
                    });
                }
                _ => {
                    let next = self.constant(fell_to);
                    self.emit(IrOp::ExitFunction { next_rip: next });
                }
            }
        }

        let end = self.cursor;
        let succs = std::mem::take(&mut self.succs);
        self.func.blocks.push(Block {
            id,
            entry_rip: decoded.entry,
            begin,
            end,
            succs,
        });
    }

    fn lower_inst(&mut self, inst: &krait_x86::DecodedInst) {
        let next_rip = inst.next_rip();
        match &inst.kind {
            InstKind::Nop => {}

            InstKind::Mov { dst, src, width } => {
                let value = self.read_operand(src, *width, next_rip);
                self.write_operand(dst, *width, value, next_rip);
            }

            InstKind::MovVec { dst, src } => self.lower_mov_vec(dst, src, next_rip),

            InstKind::Movzx {
                dst,
                src,
                src_width,
            } => {
                // Reads come back masked to the source width, so the
                // zero-extension is already done.
                let value = self.read_operand(src, *src_width, next_rip);
                self.write_reg(*dst, value);
            }

            InstKind::Movsx {
                dst,
                src,
                src_width,
            } => {
                let value = self.read_operand(src, *src_width, next_rip);
                let extended = self.emit(IrOp::SignExtend {
                    src: value,
                    from: *src_width,
                });
                self.write_reg(*dst, extended);
            }

            InstKind::Lea { dst, addr, .. } => {
                let value = self.addr_value(addr, next_rip);
                self.write_reg(*dst, value);
            }

            InstKind::Alu {
                op,
                dst,
                src,
                width,
            } => {
                let lhs = self.read_operand(dst, *width, next_rip);
                let rhs = self.read_operand(src, *width, next_rip);
                let (op, flags) = match op {
                    AluOp::Add => (BinOp::Add, FlagSet::ARITH),
                    AluOp::Sub => (BinOp::Sub, FlagSet::ARITH),
                    AluOp::And => (BinOp::And, FlagSet::LOGIC),
                    AluOp::Or => (BinOp::Or, FlagSet::LOGIC),
                    AluOp::Xor => (BinOp::Xor, FlagSet::LOGIC),
                };
                let result = self.emit(IrOp::BinOp {
                    op,
                    lhs,
                    rhs,
                    width: *width,
                    flags,
                });
                self.write_operand(dst, *width, result, next_rip);
            }

            InstKind::Shift {
                op,
                dst,
                count,
                width,
            } => {
                // A masked-to-zero count leaves both destination and flags
                // untouched.
                let count = count & if *width == Width::W64 { 63 } else { 31 };
                if count != 0 {
                    let value = self.read_operand(dst, *width, next_rip);
                    let amount = self.constant(count as u64);
                    let op = match op {
                        ShiftOp::Shl => BinOp::Shl,
                        ShiftOp::Shr => BinOp::Shr,
                        ShiftOp::Sar => BinOp::Sar,
                    };
                    let result = self.emit(IrOp::BinOp {
                        op,
                        lhs: value,
                        rhs: amount,
                        width: *width,
                        flags: FlagSet::LOGIC,
                    });
                    self.write_operand(dst, *width, result, next_rip);
                }
            }

            InstKind::Cmp { lhs, rhs, width } => {
                let lhs = self.read_operand(lhs, *width, next_rip);
                let rhs = self.read_operand(rhs, *width, next_rip);
                self.emit(IrOp::CmpFlags {
                    lhs,
                    rhs,
                    width: *width,
                    flags: FlagSet::ARITH,
                });
            }

            InstKind::Test { lhs, rhs, width } => {
                let lhs = self.read_operand(lhs, *width, next_rip);
                let rhs = self.read_operand(rhs, *width, next_rip);
                self.emit(IrOp::TestFlags {
                    lhs,
                    rhs,
                    width: *width,
                    flags: FlagSet::LOGIC,
                });
            }

            InstKind::Inc { dst, width } => self.lower_inc_dec(dst, *width, BinOp::Add, next_rip),
            InstKind::Dec { dst, width } => self.lower_inc_dec(dst, *width, BinOp::Sub, next_rip),

            InstKind::Push { src } => {
                let value = self.read_operand(src, Width::W64, next_rip);
                self.push_value(value);
            }

            InstKind::Pop { dst } => {
                let value = self.pop_value();
                self.write_operand(dst, Width::W64, value, next_rip);
            }

            InstKind::JmpRel { target } => match self.rip_to_block.get(target).copied() {
                Some(block) => {
                    self.emit(IrOp::Jump { target: block });
                    self.succs.push(block);
                }
                None => {
                    let target = self.constant(*target);
                    self.emit(IrOp::ExitFunction { next_rip: target });
                }
            },

            InstKind::JccRel { cond, target } => {
                let cond_value = self.emit(IrOp::EvalCond { cond: *cond });
                let taken = self.rip_to_block.get(target).copied();
                let fallthrough = self.rip_to_block.get(&next_rip).copied();
                match (taken, fallthrough) {
                    (Some(if_true), Some(if_false)) => {
                        self.emit(IrOp::CondJump {
                            cond: cond_value,
                            if_true,
                            if_false,
                        });
                        self.succs.push(if_true);
                        self.succs.push(if_false);
                    }
                    _ => {
                        // Single-block translation: pick the continuation
                        // address as a value and hand it to the dispatcher.
                        let if_true = self.constant(*target);
                        let if_false = self.constant(next_rip);
                        let next = self.emit(IrOp::Select {
                            cond: cond_value,
                            if_true,
                            if_false,
                            width: Width::W64,
                        });
                        self.emit(IrOp::ExitFunction { next_rip: next });
                    }
                }
            }

            InstKind::CallRel { target } => {
                let ret = self.constant(next_rip);
                self.push_value(ret);
                let target = self.constant(*target);
                self.emit(IrOp::ExitFunction { next_rip: target });
            }

            InstKind::CallInd { target } => {
                // Read the target before the push; it may be rsp-relative.
                let target = self.read_operand(target, Width::W64, next_rip);
                let ret = self.constant(next_rip);
                self.push_value(ret);
                self.emit(IrOp::ExitFunction { next_rip: target });
            }

            InstKind::JmpInd { target } => {
                let target = self.read_operand(target, Width::W64, next_rip);
                self.emit(IrOp::ExitFunction { next_rip: target });
            }

            InstKind::Ret => {
                let ret = self.pop_value();
                self.emit(IrOp::ExitFunction { next_rip: ret });
            }

            InstKind::Setcc { cond, dst } => {
                let value = self.emit(IrOp::EvalCond { cond: *cond });
                self.write_operand(dst, Width::W8, value, next_rip);
            }

            InstKind::Cmovcc {
                cond,
                dst,
                src,
                width,
            } => {
                let cond_value = self.emit(IrOp::EvalCond { cond: *cond });
                let if_true = self.read_operand(src, *width, next_rip);
                let if_false = self.read_reg(*dst);
                let value = self.emit(IrOp::Select {
                    cond: cond_value,
                    if_true,
                    if_false,
                    width: *width,
                });
                // 32-bit CMOV zero-extends the destination even when the move
                // is not taken; the masked write gives exactly that.
                self.write_reg(*dst, value);
            }

            InstKind::Syscall => {
                let selector = self.emit(IrOp::LoadGpr { reg: Gpr::Rax });
                let mut args = [NodeId::INVALID; MAX_SYSCALL_ARGS];
                for (slot, reg) in args.iter_mut().zip(SYSCALL_ARG_REGS) {
                    *slot = self.emit(IrOp::LoadGpr { reg });
                }
                let result = self.emit(IrOp::Syscall {
                    selector,
                    args,
                    arg_count: MAX_SYSCALL_ARGS as u8,
                    passthrough: false,
                });
                self.emit(IrOp::StoreGpr {
                    reg: Gpr::Rax,
                    src: result,
                });
                // SYSCALL stashes the return address in rcx.
                let ret = self.constant(next_rip);
                self.emit(IrOp::StoreGpr {
                    reg: Gpr::Rcx,
                    src: ret,
                });
                self.emit(IrOp::ExitFunction { next_rip: ret });
            }

            InstKind::Cpuid => {
                let rax = self.emit(IrOp::LoadGpr { reg: Gpr::Rax });
                let mask = self.constant(u32::MAX as u64);
                let leaf = self.emit(IrOp::BinOp {
                    op: BinOp::And,
                    lhs: rax,
                    rhs: mask,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                });
                let lo = self.emit(IrOp::CpuId {
                    leaf,
                    half: CpuIdHalf::EaxEbx,
                });
                let hi = self.emit(IrOp::CpuId {
                    leaf,
                    half: CpuIdHalf::EcxEdx,
                });
                let shift = self.constant(32);
                let ebx = self.emit(IrOp::BinOp {
                    op: BinOp::Shr,
                    lhs: lo,
                    rhs: shift,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                });
                let edx = self.emit(IrOp::BinOp {
                    op: BinOp::Shr,
                    lhs: hi,
                    rhs: shift,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                });
                for (gpr, value) in [
                    (Gpr::Rax, lo),
                    (Gpr::Rbx, ebx),
                    (Gpr::Rcx, hi),
                    (Gpr::Rdx, edx),
                ] {
                    self.write_reg(
                        Reg {
                            gpr,
                            width: Width::W32,
                            high8: false,
                        },
                        value,
                    );
                }
            }

            InstKind::Int3 => {
                self.emit(IrOp::GuestFault {
                    rip: inst.rip,
                    kind: FaultKind::Breakpoint,
                });
            }

            InstKind::Invalid => {
                self.emit(IrOp::GuestFault {
                    rip: inst.rip,
                    kind: FaultKind::InvalidOpcode,
                });
            }
        }
    }

    fn lower_inc_dec(&mut self, dst: &Operand, width: Width, op: BinOp, next_rip: u64) {
        let value = self.read_operand(dst, width, next_rip);
        let one = self.constant(1);
        // INC/DEC update every arithmetic flag except CF.
        let result = self.emit(IrOp::BinOp {
            op,
            lhs: value,
            rhs: one,
            width,
            flags: FlagSet::ARITH.difference(FlagSet::CF),
        });
        self.write_operand(dst, width, result, next_rip);
    }

    fn lower_mov_vec(&mut self, dst: &VecOperand, src: &VecOperand, next_rip: u64) {
        let value = match src {
            VecOperand::Xmm(reg) => self.emit(IrOp::LoadFpr { reg: *reg }),
            VecOperand::Mem(addr) => {
                let addr = self.addr_value(addr, next_rip);
                self.emit(IrOp::LoadMem {
                    addr,
                    width: Width::W128,
                })
            }
        };
        match dst {
            VecOperand::Xmm(reg) => {
                self.emit(IrOp::StoreFpr {
                    reg: *reg,
                    src: value,
                });
            }
            VecOperand::Mem(addr) => {
                let addr = self.addr_value(addr, next_rip);
                self.emit(IrOp::StoreMem {
                    addr,
                    src: value,
                    width: Width::W128,
                });
            }
        }
    }

    // Value plumbing.

    fn emit(&mut self, op: IrOp) -> NodeId {
        let id = self.func.arena.push(op);
        self.func.arena.link_after(self.cursor, id);
        self.cursor = id;
        id
    }

    fn constant(&mut self, value: u64) -> NodeId {
        if let Some(&id) = self.consts.get(&value) {
            return id;
        }
        let id = self.emit(IrOp::Const { value });
        self.consts.insert(value, id);
        id
    }

    /// Read a register operand, masked down to its operand width.
    fn read_reg(&mut self, reg: Reg) -> NodeId {
        let full = self.emit(IrOp::LoadGpr { reg: reg.gpr });
        if reg.width == Width::W64 {
            return full;
        }
        let value = if reg.high8 {
            let eight = self.constant(8);
            self.emit(IrOp::BinOp {
                op: BinOp::Shr,
                lhs: full,
                rhs: eight,
                width: Width::W64,
                flags: FlagSet::EMPTY,
            })
        } else {
            full
        };
        let mask = self.constant(reg.width.mask());
        self.emit(IrOp::BinOp {
            op: BinOp::And,
            lhs: value,
            rhs: mask,
            width: Width::W64,
            flags: FlagSet::EMPTY,
        })
    }

    /// Write a register operand with x86 partial-width semantics: 32-bit
    /// writes zero-extend, 8/16-bit writes merge into the old value.
    fn write_reg(&mut self, reg: Reg, src: NodeId) {
        match reg.width {
            Width::W64 => {
                self.emit(IrOp::StoreGpr { reg: reg.gpr, src });
            }
            Width::W32 => {
                let mask = self.constant(Width::W32.mask());
                let value = self.emit(IrOp::BinOp {
                    op: BinOp::And,
                    lhs: src,
                    rhs: mask,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                });
                self.emit(IrOp::StoreGpr {
                    reg: reg.gpr,
                    src: value,
                });
            }
            width => {
                let shift = if reg.high8 { 8 } else { 0 };
                let field_mask = width.mask() << shift;
                let old = self.emit(IrOp::LoadGpr { reg: reg.gpr });
                let keep_mask = self.constant(!field_mask);
                let kept = self.emit(IrOp::BinOp {
                    op: BinOp::And,
                    lhs: old,
                    rhs: keep_mask,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                });
                let low_mask = self.constant(width.mask());
                let mut field = self.emit(IrOp::BinOp {
                    op: BinOp::And,
                    lhs: src,
                    rhs: low_mask,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                });
                if shift != 0 {
                    let amount = self.constant(shift);
                    field = self.emit(IrOp::BinOp {
                        op: BinOp::Shl,
                        lhs: field,
                        rhs: amount,
                        width: Width::W64,
                        flags: FlagSet::EMPTY,
                    });
                }
                let merged = self.emit(IrOp::BinOp {
                    op: BinOp::Or,
                    lhs: kept,
                    rhs: field,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                });
                self.emit(IrOp::StoreGpr {
                    reg: reg.gpr,
                    src: merged,
                });
            }
        }
    }

    /// Materialize an effective address as a 64-bit value.
    fn addr_value(&mut self, addr: &Address, next_rip: u64) -> NodeId {
        let disp = addr.disp as i64 as u64;
        if addr.rip_relative {
            return self.constant(next_rip.wrapping_add(disp));
        }

        let mut acc = addr.base.map(|base| self.emit(IrOp::LoadGpr { reg: base }));

        if let Some(index) = addr.index {
            let mut scaled = self.emit(IrOp::LoadGpr { reg: index });
            if addr.scale > 1 {
                let amount = self.constant(addr.scale.trailing_zeros() as u64);
                scaled = self.emit(IrOp::BinOp {
                    op: BinOp::Shl,
                    lhs: scaled,
                    rhs: amount,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                });
            }
            acc = Some(match acc {
                Some(base) => self.emit(IrOp::BinOp {
                    op: BinOp::Add,
                    lhs: base,
                    rhs: scaled,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                }),
                None => scaled,
            });
        }

        match acc {
            None => self.constant(disp),
            Some(value) if disp != 0 => {
                let disp = self.constant(disp);
                self.emit(IrOp::BinOp {
                    op: BinOp::Add,
                    lhs: value,
                    rhs: disp,
                    width: Width::W64,
                    flags: FlagSet::EMPTY,
                })
            }
            Some(value) => value,
        }
    }

    fn read_operand(&mut self, operand: &Operand, width: Width, next_rip: u64) -> NodeId {
        match operand {
            Operand::Reg(reg) => self.read_reg(*reg),
            Operand::Imm(value) => self.constant(width.truncate(*value)),
            Operand::Mem(addr) => {
                let addr = self.addr_value(addr, next_rip);
                self.emit(IrOp::LoadMem { addr, width })
            }
        }
    }

    fn write_operand(&mut self, operand: &Operand, width: Width, src: NodeId, next_rip: u64) {
        match operand {
            Operand::Reg(reg) => self.write_reg(*reg, src),
            Operand::Mem(addr) => {
                let addr = self.addr_value(addr, next_rip);
                self.emit(IrOp::StoreMem { addr, src, width });
            }
            Operand::Imm(_) => unreachable!("immediate destination operand"),
        }
    }

    fn push_value(&mut self, value: NodeId) {
        let rsp = self.emit(IrOp::LoadGpr { reg: Gpr::Rsp });
        let eight = self.constant(8);
        let new_rsp = self.emit(IrOp::BinOp {
            op: BinOp::Sub,
            lhs: rsp,
            rhs: eight,
            width: Width::W64,
            flags: FlagSet::EMPTY,
        });
        self.emit(IrOp::StoreMem {
            addr: new_rsp,
            src: value,
            width: Width::W64,
        });
        self.emit(IrOp::StoreGpr {
            reg: Gpr::Rsp,
            src: new_rsp,
        });
    }

    fn pop_value(&mut self) -> NodeId {
        let rsp = self.emit(IrOp::LoadGpr { reg: Gpr::Rsp });
        let value = self.emit(IrOp::LoadMem {
            addr: rsp,
            width: Width::W64,
        });
        let eight = self.constant(8);
        let new_rsp = self.emit(IrOp::BinOp {
            op: BinOp::Add,
            lhs: rsp,
            rhs: eight,
            width: Width::W64,
            flags: FlagSet::EMPTY,
        });
        self.emit(IrOp::StoreGpr {
            reg: Gpr::Rsp,
            src: new_rsp,
        });
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krait_x86::{discover_region, GuestBus, RegionConfig};

    struct FlatBus {
        base: u64,
        bytes: Vec<u8>,
    }

    impl GuestBus for FlatBus {
        fn read_u8(&self, addr: u64) -> u8 {
            let off = addr.wrapping_sub(self.base) as usize;
            self.bytes.get(off).copied().unwrap_or(0xcc)
        }

        fn is_executable(&self, addr: u64) -> bool {
            addr.wrapping_sub(self.base) < self.bytes.len() as u64
        }
    }

    fn translate(bytes: &[u8]) -> IrFunction {
        let bus = FlatBus {
            base: 0x1000,
            bytes: bytes.to_vec(),
        };
        let region = discover_region(&bus, 0x1000, RegionConfig::default());
        translate_region(&region)
    }

    fn ops_of(func: &IrFunction, block: BlockId) -> Vec<IrOp> {
        func.block_ops(block)
            .map(|id| func.arena.op(id).clone())
            .collect()
    }

    #[test]
    fn mov_imm_then_ret() {
        // mov eax, 1; ret
        let func = translate(&[0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3]);
        assert_eq!(func.blocks.len(), 1);
        let ops = ops_of(&func, BlockId(0));
        assert!(ops
            .iter()
            .any(|op| matches!(op, IrOp::StoreGpr { reg: Gpr::Rax, .. })));
        // The return address comes off the stack.
        assert!(matches!(ops.last(), Some(IrOp::ExitFunction { .. })));
        assert!(ops
            .iter()
            .any(|op| matches!(op, IrOp::LoadMem { width: Width::W64, .. })));
    }

    #[test]
    fn constants_are_pooled_within_a_block() {
        // add eax, 5; add ecx, 5; ret
        let func = translate(&[0x83, 0xc0, 0x05, 0x83, 0xc1, 0x05, 0xc3]);
        let fives = ops_of(&func, BlockId(0))
            .iter()
            .filter(|op| matches!(op, IrOp::Const { value: 5 }))
            .count();
        assert_eq!(fives, 1);
    }

    #[test]
    fn conditional_branch_becomes_cond_jump() {
        // cmp eax, 0; jnz +1; ret; ret
        let func = translate(&[0x83, 0xf8, 0x00, 0x75, 0x01, 0xc3, 0xc3]);
        assert_eq!(func.blocks.len(), 3);
        let entry_ops = ops_of(&func, BlockId(0));
        assert!(matches!(entry_ops.last(), Some(IrOp::CondJump { .. })));
        assert_eq!(func.blocks[0].succs.len(), 2);
        assert!(entry_ops
            .iter()
            .any(|op| matches!(op, IrOp::CmpFlags { .. })));
    }

    #[test]
    fn syscall_loads_abi_registers_and_exits() {
        // syscall
        let func = translate(&[0x0f, 0x05]);
        let ops = ops_of(&func, BlockId(0));
        let syscall = ops
            .iter()
            .find_map(|op| match op {
                IrOp::Syscall { arg_count, .. } => Some(*arg_count),
                _ => None,
            })
            .expect("syscall op emitted");
        assert_eq!(syscall, 6);
        assert!(ops
            .iter()
            .any(|op| matches!(op, IrOp::StoreGpr { reg: Gpr::Rax, .. })));
        assert!(matches!(ops.last(), Some(IrOp::ExitFunction { .. })));
    }

    #[test]
    fn high_byte_write_merges_old_value() {
        // mov ah, 1; ret
        let func = translate(&[0xb4, 0x01, 0xc3]);
        let ops = ops_of(&func, BlockId(0));
        // The merge sequence reads rax before storing it back.
        let load_before_store = ops.iter().position(|op| {
            matches!(op, IrOp::LoadGpr { reg: Gpr::Rax })
        });
        let store = ops
            .iter()
            .position(|op| matches!(op, IrOp::StoreGpr { reg: Gpr::Rax, .. }));
        assert!(load_before_store.unwrap() < store.unwrap());
        assert!(ops
            .iter()
            .any(|op| matches!(op, IrOp::BinOp { op: BinOp::Shl, .. })));
    }

    #[test]
    fn push_pop_update_stack_pointer() {
        // push rax; pop rcx; ret
        let func = translate(&[0x50, 0x59, 0xc3]);
        let ops = ops_of(&func, BlockId(0));
        let rsp_stores = ops
            .iter()
            .filter(|op| matches!(op, IrOp::StoreGpr { reg: Gpr::Rsp, .. }))
            .count();
        // push, pop, and the return-address pop of `ret` each move rsp.
        assert_eq!(rsp_stores, 3);
        assert!(ops
            .iter()
            .any(|op| matches!(op, IrOp::StoreMem { width: Width::W64, .. })));
        assert!(ops
            .iter()
            .any(|op| matches!(op, IrOp::StoreGpr { reg: Gpr::Rcx, .. })));
    }

    #[test]
    fn vector_move_round_trips_through_fpr() {
        // movdqa xmm1, [rax]; ret
        let func = translate(&[0x66, 0x0f, 0x6f, 0x08, 0xc3]);
        let ops = ops_of(&func, BlockId(0));
        assert!(ops
            .iter()
            .any(|op| matches!(op, IrOp::LoadMem { width: Width::W128, .. })));
        assert!(ops
            .iter()
            .any(|op| matches!(op, IrOp::StoreFpr { .. })));
    }

    #[test]
    fn non_executable_entry_faults() {
        let bus = FlatBus {
            base: 0x1000,
            bytes: vec![0xeb, 0x10], // jmp outside the mapping
        };
        let region = discover_region(&bus, 0x1000, RegionConfig::default());
        let func = translate_region(&region);
        // The jump target was never discovered, so the block exits with the
        // target address as a value.
        let ops = ops_of(&func, BlockId(0));
        assert!(matches!(ops.last(), Some(IrOp::ExitFunction { .. })));
    }
}
