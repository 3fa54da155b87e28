//! aarch64 splatter backend.
//!
//! The guest state pointer arrives in `x0` and is parked in `x27` for the
//! block's lifetime (callee-saved, so helper calls leave it alone). `x16`,
//! `x17` and `x0` are scratch; the allocator works with `x8`-`x15` and
//! `v16`-`v23`. Guest memory is identity mapped.
//!
//! Guest status flags have no host-register home: flag-producing ops run an
//! NZCV-setting twin of the value computation and latch each requested flag
//! as a byte store into the state. Sub-32-bit operands are shifted to the
//! top of a 32-bit register first so carry, overflow and sign fall out of
//! the host condition codes at the right bit. AF and PF have no NZCV
//! equivalent and are computed arithmetically.

use krait_ir::passes::regalloc::{AllocationResult, ClassConfig, RegClass};
use krait_ir::{BinOp, IrFunction, IrOp, NodeId};
use krait_types::{Cond, Flag, FlagSet, Width};

use crate::backend::{CompileError, CompiledBlock, HostArch, HostBackend};
use crate::buffer::{CodeBuffer, FixupKind, Label};
use crate::dispatch::fault_code;
use crate::reloc::{Relocation, RelocationKind, Symbol};
use crate::state::{
    flag_offset, fpr_offset, gpr_offset, helper_arg_offset, OFF_FAULT_KIND, OFF_FAULT_RIP,
};

/// Host registers handed to the allocator, indexed by `PhysReg::index`.
const GPR_MAP: [u8; 8] = [8, 9, 10, 11, 12, 13, 14, 15];
/// Vector registers, `v16` up.
const VEC_BASE: u8 = 16;
const VEC_COUNT: usize = 8;

const X0: u8 = 0;
const TMP: u8 = 16;
const TMP2: u8 = 17;
const STATE: u8 = 27; // x27
const LR: u8 = 30;
const SP: u8 = 31;
const ZR: u8 = 31;

// aarch64 condition codes.
const EQ: u8 = 0x0;
const NE: u8 = 0x1;
const CS: u8 = 0x2;
const LO: u8 = 0x3;
const MI: u8 = 0x4;
const VS: u8 = 0x6;

pub struct A64Backend;

impl A64Backend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for A64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend for A64Backend {
    fn arch(&self) -> HostArch {
        HostArch::Aarch64
    }

    fn class_budget(&self) -> (ClassConfig, ClassConfig) {
        (
            ClassConfig {
                count: GPR_MAP.len(),
            },
            ClassConfig { count: VEC_COUNT },
        )
    }

    fn compile(
        &mut self,
        func: &IrFunction,
        regs: &AllocationResult,
    ) -> Result<CompiledBlock, CompileError> {
        if regs.has_spills() {
            return Err(CompileError::RegisterPressure {
                spills: regs.spills.len(),
            });
        }

        let mut asm = Asm::new();
        let labels: Vec<Label> = func.blocks.iter().map(|_| asm.buf.new_label()).collect();
        let mut rip_to_offset = Vec::with_capacity(func.blocks.len());

        // Every recorded entry is a callable address, so each block opens
        // with the frame prologue. Intra-region branches bind past it;
        // blocks always end in an explicit branch or epilogue, so control
        // never falls through into a sibling's prologue.
        for block in &func.blocks {
            rip_to_offset.push((block.entry_rip, asm.buf.len() as u32));
            // stp x27, x30, [sp, #-16]!; mov x27, x0
            asm.inst(0xa9bf_0000 | (LR as u32) << 10 | (SP as u32) << 5 | STATE as u32);
            asm.mov_rr(STATE, X0);
            asm.buf.bind(labels[block.id.index()]);
            for id in func.block_ops(block.id) {
                asm.emit_op(func, regs, id, &labels);
            }
        }

        let relocations = std::mem::take(&mut asm.relocs);
        let code = asm.buf.finalize()?;
        tracing::trace!(
            entry = format_args!("{:#x}", func.entry_rip),
            bytes = code.len(),
            "compiled region for aarch64"
        );
        Ok(CompiledBlock {
            entry_rip: func.entry_rip,
            code,
            relocations,
            rip_to_offset,
        })
    }
}

struct Asm {
    buf: CodeBuffer,
    relocs: Vec<Relocation>,
}

fn gpr(regs: &AllocationResult, id: NodeId) -> u8 {
    let reg = regs.reg_of(id).expect("value was register allocated");
    debug_assert_eq!(reg.class, RegClass::Gpr);
    GPR_MAP[reg.index as usize]
}

fn vec(regs: &AllocationResult, id: NodeId) -> u8 {
    let reg = regs.reg_of(id).expect("value was register allocated");
    debug_assert_eq!(reg.class, RegClass::Vector);
    VEC_BASE + reg.index
}

/// CF/OF source of a flag-producing op family.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CarrySource {
    AddCarry,
    SubBorrow,
    /// Logical ops: CF and OF are architecturally cleared.
    Cleared,
}

impl Asm {
    fn new() -> Self {
        Self {
            buf: CodeBuffer::new(),
            relocs: Vec::new(),
        }
    }

    fn inst(&mut self, word: u32) {
        self.buf.emit_u32(word);
    }

    // Encoding primitives.

    fn mov_rr(&mut self, dst: u8, src: u8) {
        if dst == src {
            return;
        }
        // orr xd, xzr, xm
        self.inst(0xaa00_03e0 | (src as u32) << 16 | dst as u32);
    }

    /// movz + 3x movk; always the full group so relocations can patch it.
    /// Returns the offset of the first instruction.
    fn mov_ri(&mut self, dst: u8, imm: u64) -> usize {
        let offset = self.buf.len();
        for hw in 0..4u32 {
            let chunk = ((imm >> (16 * hw)) & 0xffff) as u32;
            let base = if hw == 0 { 0xd280_0000 } else { 0xf280_0000 };
            self.inst(base | hw << 21 | chunk << 5 | dst as u32);
        }
        offset
    }

    fn mov_ri_reloc(&mut self, dst: u8, imm: u64, kind: RelocationKind) {
        let offset = self.mov_ri(dst, imm);
        self.relocs.push(Relocation { offset, kind });
    }

    // State accesses; every offset fits the unsigned scaled-immediate forms.

    fn ldr_state(&mut self, dst: u8, off: usize) {
        self.inst(0xf940_0000 | (off as u32 / 8) << 10 | (STATE as u32) << 5 | dst as u32);
    }

    fn str_state(&mut self, off: usize, src: u8) {
        self.inst(0xf900_0000 | (off as u32 / 8) << 10 | (STATE as u32) << 5 | src as u32);
    }

    fn str_state_w(&mut self, off: usize, src: u8) {
        self.inst(0xb900_0000 | (off as u32 / 4) << 10 | (STATE as u32) << 5 | src as u32);
    }

    fn ldrb_state(&mut self, dst: u8, off: usize) {
        self.inst(0x3940_0000 | (off as u32) << 10 | (STATE as u32) << 5 | dst as u32);
    }

    fn strb_state(&mut self, off: usize, src: u8) {
        self.inst(0x3900_0000 | (off as u32) << 10 | (STATE as u32) << 5 | src as u32);
    }

    fn ldr_q_state(&mut self, dst: u8, off: usize) {
        self.inst(0x3dc0_0000 | (off as u32 / 16) << 10 | (STATE as u32) << 5 | dst as u32);
    }

    fn str_q_state(&mut self, off: usize, src: u8) {
        self.inst(0x3d80_0000 | (off as u32 / 16) << 10 | (STATE as u32) << 5 | src as u32);
    }

    fn store_flag(&mut self, flag: Flag, src: u8) {
        self.strb_state(flag_offset(flag), src);
    }

    fn clear_flag(&mut self, flag: Flag) {
        self.strb_state(flag_offset(flag), ZR);
    }

    // Guest memory, zero-displacement forms off the address register.

    fn load_guest(&mut self, dst: u8, base: u8, width: Width) {
        let opcode = match width {
            Width::W8 => 0x3940_0000,
            Width::W16 => 0x7940_0000,
            Width::W32 => 0xb940_0000,
            Width::W64 => 0xf940_0000,
            Width::W128 => unreachable!("vector load handled separately"),
        };
        self.inst(opcode | (base as u32) << 5 | dst as u32);
    }

    fn store_guest(&mut self, base: u8, src: u8, width: Width) {
        let opcode = match width {
            Width::W8 => 0x3900_0000,
            Width::W16 => 0x7900_0000,
            Width::W32 => 0xb900_0000,
            Width::W64 => 0xf900_0000,
            Width::W128 => unreachable!("vector store handled separately"),
        };
        self.inst(opcode | (base as u32) << 5 | src as u32);
    }

    fn ldr_q_guest(&mut self, dst: u8, base: u8) {
        self.inst(0x3dc0_0000 | (base as u32) << 5 | dst as u32);
    }

    fn str_q_guest(&mut self, base: u8, src: u8) {
        self.inst(0x3d80_0000 | (base as u32) << 5 | src as u32);
    }

    // Data processing.

    /// Plain 64-bit three-operand form of an integer op.
    fn op_rrr(&mut self, op: BinOp, dst: u8, lhs: u8, rhs: u8) {
        let base = match op {
            BinOp::Add => 0x8b00_0000,
            BinOp::Sub => 0xcb00_0000,
            BinOp::And => 0x8a00_0000,
            BinOp::Or => 0xaa00_0000,
            BinOp::Xor => 0xca00_0000,
            BinOp::Mul => 0x9b00_7c00, // madd xd, xn, xm, xzr
            BinOp::Shl | BinOp::Shr | BinOp::Sar | BinOp::Eq => {
                unreachable!("handled by dedicated sequences")
            }
        };
        self.inst(base | (rhs as u32) << 16 | (lhs as u32) << 5 | dst as u32);
    }

    /// Flag-setting form at 32 or 64 bits (`adds`/`subs`/`ands`).
    fn op_s(&mut self, op: BinOp, wide: bool, dst: u8, lhs: u8, rhs: u8) {
        let base = match op {
            BinOp::Add => 0x2b00_0000u32,
            BinOp::Sub => 0x6b00_0000,
            BinOp::And => 0x6a00_0000,
            _ => unreachable!("no flag-setting form"),
        };
        let base = if wide { base | 0x8000_0000 } else { base };
        self.inst(base | (rhs as u32) << 16 | (lhs as u32) << 5 | dst as u32);
    }

    /// `tst` of a register against itself, at 32 or 64 bits.
    fn tst_self(&mut self, wide: bool, reg: u8) {
        let base = if wide { 0xea00_0000 } else { 0x6a00_0000 };
        self.inst(base | (reg as u32) << 16 | (reg as u32) << 5 | ZR as u32);
    }

    fn lsl_imm(&mut self, wide: bool, dst: u8, src: u8, shift: u32) {
        // ubfm alias
        if wide {
            let immr = (64 - shift) & 63;
            self.inst(0xd340_0000 | immr << 16 | (63 - shift) << 10 | (src as u32) << 5 | dst as u32);
        } else {
            let immr = (32 - shift) & 31;
            self.inst(0x5300_0000 | immr << 16 | (31 - shift) << 10 | (src as u32) << 5 | dst as u32);
        }
    }

    fn lsr_imm(&mut self, wide: bool, dst: u8, src: u8, shift: u32) {
        if wide {
            self.inst(0xd340_fc00 | shift << 16 | (src as u32) << 5 | dst as u32);
        } else {
            self.inst(0x5300_7c00 | shift << 16 | (src as u32) << 5 | dst as u32);
        }
    }

    fn asr_imm(&mut self, wide: bool, dst: u8, src: u8, shift: u32) {
        if wide {
            self.inst(0x9340_fc00 | shift << 16 | (src as u32) << 5 | dst as u32);
        } else {
            self.inst(0x1300_7c00 | shift << 16 | (src as u32) << 5 | dst as u32);
        }
    }

    /// Variable-count shift (`lslv`/`lsrv`/`asrv`), 64-bit.
    fn shift_var(&mut self, op: BinOp, dst: u8, lhs: u8, count: u8) {
        let base = match op {
            BinOp::Shl => 0x9ac0_2000,
            BinOp::Shr => 0x9ac0_2400,
            BinOp::Sar => 0x9ac0_2800,
            _ => unreachable!(),
        };
        self.inst(base | (count as u32) << 16 | (lhs as u32) << 5 | dst as u32);
    }

    /// `and xd, xn, #mask` for the masks this backend needs.
    fn and_mask(&mut self, dst: u8, src: u8, mask: u64) {
        let imms = match mask {
            0x1 => 0,
            0xff => 7,
            0xffff => 15,
            0xffff_ffff => 31,
            _ => unreachable!("unencodable mask"),
        };
        self.inst(0x9240_0000 | imms << 10 | (src as u32) << 5 | dst as u32);
    }

    /// `eor xd, xn, #1`
    fn eor_one(&mut self, dst: u8, src: u8) {
        self.inst(0xd240_0000 | (src as u32) << 5 | dst as u32);
    }

    fn orr_rr(&mut self, dst: u8, a: u8, b: u8) {
        self.inst(0xaa00_0000 | (b as u32) << 16 | (a as u32) << 5 | dst as u32);
    }

    fn eor_rr(&mut self, dst: u8, a: u8, b: u8) {
        self.inst(0xca00_0000 | (b as u32) << 16 | (a as u32) << 5 | dst as u32);
    }

    fn mvn(&mut self, dst: u8, src: u8) {
        // orn xd, xzr, xm
        self.inst(0xaa20_03e0 | (src as u32) << 16 | dst as u32);
    }

    /// Sign-extend from `from` into a full 64-bit register.
    fn sext(&mut self, dst: u8, src: u8, from: Width) {
        let imms = match from {
            Width::W8 => 7u32,
            Width::W16 => 15,
            Width::W32 => 31,
            Width::W64 | Width::W128 => {
                self.mov_rr(dst, src);
                return;
            }
        };
        // sbfm xd, xn, #0, #imms (sxtb/sxth/sxtw)
        self.inst(0x9340_0000 | imms << 10 | (src as u32) << 5 | dst as u32);
    }

    fn cset(&mut self, dst: u8, cond: u8) {
        // csinc xd, xzr, xzr, !cond
        self.inst(0x9a9f_07e0 | ((cond ^ 1) as u32) << 12 | dst as u32);
    }

    fn csel(&mut self, dst: u8, if_true: u8, if_false: u8, cond: u8) {
        self.inst(
            0x9a80_0000
                | (if_false as u32) << 16
                | (cond as u32) << 12
                | (if_true as u32) << 5
                | dst as u32,
        );
    }

    /// `cmp xn, #0`
    fn cmp_zero(&mut self, reg: u8) {
        self.inst(0xf100_001f | (reg as u32) << 5);
    }

    fn b(&mut self, label: Label) {
        self.buf.record_fixup(label, FixupKind::AArch64Branch26);
        self.inst(0x1400_0000);
    }

    fn cbnz(&mut self, reg: u8, label: Label) {
        self.buf.record_fixup(label, FixupKind::AArch64Branch19);
        self.inst(0xb500_0000 | reg as u32);
    }

    fn epilogue(&mut self) {
        // ldp x27, x30, [sp], #16; ret
        self.inst(0xa8c1_0000 | (LR as u32) << 10 | (SP as u32) << 5 | STATE as u32);
        self.inst(0xd65f_03c0);
    }

    // Flag latching. Callers run the NZCV-setting twin first, then these.

    fn capture_nzcv(&mut self, flags: FlagSet, carry: CarrySource) {
        if flags.contains(FlagSet::CF) {
            match carry {
                CarrySource::AddCarry => {
                    self.cset(TMP2, CS);
                    self.store_flag(Flag::Cf, TMP2);
                }
                // x86 CF after SUB is the borrow, the inverse of the host
                // carry.
                CarrySource::SubBorrow => {
                    self.cset(TMP2, LO);
                    self.store_flag(Flag::Cf, TMP2);
                }
                CarrySource::Cleared => self.clear_flag(Flag::Cf),
            }
        }
        if flags.contains(FlagSet::ZF) {
            self.cset(TMP2, EQ);
            self.store_flag(Flag::Zf, TMP2);
        }
        if flags.contains(FlagSet::SF) {
            self.cset(TMP2, MI);
            self.store_flag(Flag::Sf, TMP2);
        }
        if flags.contains(FlagSet::OF) {
            if carry == CarrySource::Cleared {
                self.clear_flag(Flag::Of);
            } else {
                self.cset(TMP2, VS);
                self.store_flag(Flag::Of, TMP2);
            }
        }
    }

    /// PF is set when the low byte of `res` has even parity. Only bits 0-7
    /// of `res` participate, so garbage above them is harmless.
    fn capture_pf(&mut self, res: u8) {
        self.lsr_imm(true, TMP2, res, 4);
        self.eor_rr(TMP2, TMP2, res);
        self.lsr_imm(true, X0, TMP2, 2);
        self.eor_rr(TMP2, TMP2, X0);
        self.lsr_imm(true, X0, TMP2, 1);
        self.eor_rr(TMP2, TMP2, X0);
        self.mvn(TMP2, TMP2);
        self.and_mask(TMP2, TMP2, 0x1);
        self.store_flag(Flag::Pf, TMP2);
    }

    /// AF is the carry out of bit 3: `((lhs ^ rhs ^ res) >> 4) & 1`.
    fn capture_af(&mut self, lhs: u8, rhs: u8, res: u8) {
        self.eor_rr(TMP2, lhs, rhs);
        self.eor_rr(TMP2, TMP2, res);
        self.lsr_imm(true, TMP2, TMP2, 4);
        self.and_mask(TMP2, TMP2, 0x1);
        self.store_flag(Flag::Af, TMP2);
    }

    // Helper call frame.

    fn helper_spill(&mut self) {
        // sub sp, sp, #192
        self.inst(0xd100_0000 | 192 << 10 | (SP as u32) << 5 | SP as u32);
        for (i, pair) in GPR_MAP.chunks_exact(2).enumerate() {
            let imm7 = (i * 16 / 8) as u32;
            self.inst(
                0xa900_0000
                    | imm7 << 15
                    | (pair[1] as u32) << 10
                    | (SP as u32) << 5
                    | pair[0] as u32,
            );
        }
        for i in 0..(VEC_COUNT as u32 / 2) {
            let imm7 = (64 + i as usize * 32) as u32 / 16;
            let rt = VEC_BASE as u32 + i * 2;
            self.inst(0xad00_0000 | imm7 << 15 | (rt + 1) << 10 | (SP as u32) << 5 | rt);
        }
    }

    fn helper_fill(&mut self) {
        for i in 0..(VEC_COUNT as u32 / 2) {
            let imm7 = (64 + i as usize * 32) as u32 / 16;
            let rt = VEC_BASE as u32 + i * 2;
            self.inst(0xad40_0000 | imm7 << 15 | (rt + 1) << 10 | (SP as u32) << 5 | rt);
        }
        for (i, pair) in GPR_MAP.chunks_exact(2).enumerate() {
            let imm7 = (i * 16 / 8) as u32;
            self.inst(
                0xa940_0000
                    | imm7 << 15
                    | (pair[1] as u32) << 10
                    | (SP as u32) << 5
                    | pair[0] as u32,
            );
        }
        // add sp, sp, #192
        self.inst(0x9100_0000 | 192 << 10 | (SP as u32) << 5 | SP as u32);
    }

    fn emit_helper_call(&mut self, symbol: Symbol) {
        self.mov_rr(X0, STATE);
        self.mov_ri_reloc(TMP, 0, RelocationKind::ThunkMove { symbol });
        // blr x16
        self.inst(0xd63f_0000 | (TMP as u32) << 5);
    }

    fn eval_cond(&mut self, dst: u8, cond: Cond) {
        let (first, second, with_zf, invert): (Flag, Option<(bool, Flag)>, bool, bool) = match cond
        {
            Cond::O => (Flag::Of, None, false, false),
            Cond::No => (Flag::Of, None, false, true),
            Cond::B => (Flag::Cf, None, false, false),
            Cond::Ae => (Flag::Cf, None, false, true),
            Cond::E => (Flag::Zf, None, false, false),
            Cond::Ne => (Flag::Zf, None, false, true),
            Cond::Be => (Flag::Cf, Some((false, Flag::Zf)), false, false),
            Cond::A => (Flag::Cf, Some((false, Flag::Zf)), false, true),
            Cond::S => (Flag::Sf, None, false, false),
            Cond::Ns => (Flag::Sf, None, false, true),
            Cond::P => (Flag::Pf, None, false, false),
            Cond::Np => (Flag::Pf, None, false, true),
            Cond::L => (Flag::Sf, Some((true, Flag::Of)), false, false),
            Cond::Ge => (Flag::Sf, Some((true, Flag::Of)), false, true),
            Cond::Le => (Flag::Sf, Some((true, Flag::Of)), true, false),
            Cond::G => (Flag::Sf, Some((true, Flag::Of)), true, true),
        };
        self.ldrb_state(dst, flag_offset(first));
        if let Some((is_xor, flag)) = second {
            self.ldrb_state(TMP2, flag_offset(flag));
            if is_xor {
                self.eor_rr(dst, dst, TMP2);
            } else {
                self.orr_rr(dst, dst, TMP2);
            }
        }
        if with_zf {
            self.ldrb_state(TMP2, flag_offset(Flag::Zf));
            self.orr_rr(dst, dst, TMP2);
        }
        if invert {
            self.eor_one(dst, dst);
        }
    }

    // Op dispatch.

    fn emit_op(
        &mut self,
        func: &IrFunction,
        regs: &AllocationResult,
        id: NodeId,
        labels: &[Label],
    ) {
        match *func.arena.op(id) {
            IrOp::BlockBegin { .. } => {}
            IrOp::Tombstone => debug_assert!(false, "tombstone survived compaction"),

            IrOp::Const { value } => {
                let _ = self.mov_ri(gpr(regs, id), value);
            }
            IrOp::LoadGpr { reg } => self.ldr_state(gpr(regs, id), gpr_offset(reg)),
            IrOp::StoreGpr { reg, src } => self.str_state(gpr_offset(reg), gpr(regs, src)),
            IrOp::LoadGprIndexed { index } => {
                // ldr xd, [x27, xi, lsl #3]; the register file starts at
                // state offset zero.
                self.inst(
                    0xf860_7800
                        | (gpr(regs, index) as u32) << 16
                        | (STATE as u32) << 5
                        | gpr(regs, id) as u32,
                );
            }
            IrOp::StoreGprIndexed { index, src } => {
                self.inst(
                    0xf820_7800
                        | (gpr(regs, index) as u32) << 16
                        | (STATE as u32) << 5
                        | gpr(regs, src) as u32,
                );
            }
            IrOp::LoadFlag { flag } => self.ldrb_state(gpr(regs, id), flag_offset(flag)),
            IrOp::StoreFlag { flag, src } => self.store_flag(flag, gpr(regs, src)),
            IrOp::LoadFpr { reg } => self.ldr_q_state(vec(regs, id), fpr_offset(reg.0)),
            IrOp::StoreFpr { reg, src } => self.str_q_state(fpr_offset(reg.0), vec(regs, src)),
            IrOp::LoadMem { addr, width } => {
                if width == Width::W128 {
                    self.ldr_q_guest(vec(regs, id), gpr(regs, addr));
                } else {
                    self.load_guest(gpr(regs, id), gpr(regs, addr), width);
                }
            }
            IrOp::StoreMem { addr, src, width } => {
                if width == Width::W128 {
                    self.str_q_guest(gpr(regs, addr), vec(regs, src));
                } else {
                    self.store_guest(gpr(regs, addr), gpr(regs, src), width);
                }
            }

            IrOp::BinOp {
                op,
                lhs,
                rhs,
                width,
                flags,
            } => self.binop(func, regs, id, op, lhs, rhs, width, flags),
            IrOp::CmpFlags {
                lhs,
                rhs,
                width,
                flags,
            } => self.flag_only(regs, BinOp::Sub, lhs, rhs, width, flags),
            IrOp::TestFlags {
                lhs,
                rhs,
                width,
                flags,
            } => self.flag_only(regs, BinOp::And, lhs, rhs, width, flags),
            IrOp::SignExtend { src, from } => self.sext(gpr(regs, id), gpr(regs, src), from),
            IrOp::EvalCond { cond } => self.eval_cond(gpr(regs, id), cond),
            IrOp::Select {
                cond,
                if_true,
                if_false,
                ..
            } => {
                self.cmp_zero(gpr(regs, cond));
                self.csel(gpr(regs, id), gpr(regs, if_true), gpr(regs, if_false), NE);
            }

            IrOp::Syscall {
                selector,
                args,
                arg_count,
                ..
            } => {
                // Guest syscall numbers are x86-64 numbers, so even
                // passthrough-safe calls go through the runtime helper on
                // this host.
                self.str_state(helper_arg_offset(0), gpr(regs, selector));
                for (i, arg) in args.iter().take(arg_count as usize).enumerate() {
                    self.str_state(helper_arg_offset(1 + i), gpr(regs, *arg));
                }
                self.helper_spill();
                self.emit_helper_call(Symbol::SyscallHandler);
                self.helper_fill();
                self.mov_rr(gpr(regs, id), X0);
            }
            IrOp::CpuId { leaf, half } => {
                self.str_state(helper_arg_offset(0), gpr(regs, leaf));
                let _ = self.mov_ri(TMP, half as u64);
                self.str_state(helper_arg_offset(1), TMP);
                self.helper_spill();
                self.emit_helper_call(Symbol::CpuIdHandler);
                self.helper_fill();
                self.mov_rr(gpr(regs, id), X0);
            }

            IrOp::Jump { target } => self.b(labels[target.index()]),
            IrOp::CondJump {
                cond,
                if_true,
                if_false,
            } => {
                self.cbnz(gpr(regs, cond), labels[if_true.index()]);
                self.b(labels[if_false.index()]);
            }
            IrOp::ExitFunction { next_rip } => {
                self.mov_rr(X0, gpr(regs, next_rip));
                self.epilogue();
            }
            IrOp::GuestFault { rip, kind } => {
                // movz w16, #code
                self.inst(0x5280_0000 | (fault_code(kind) + 1) << 5 | TMP as u32);
                self.str_state_w(OFF_FAULT_KIND, TMP);
                self.mov_ri_reloc(X0, rip, RelocationKind::GuestRipMove { rip });
                self.str_state(OFF_FAULT_RIP, X0);
                self.epilogue();
            }
        }
    }

    /// Run the NZCV-setting twin of `op` at `width` into `TMP` and latch
    /// `flags`. `TMP` holds the natural-position result afterwards.
    fn flags_of(&mut self, regs: &AllocationResult, op: BinOp, lhs: NodeId, rhs: NodeId, width: Width, flags: FlagSet) {
        let l = gpr(regs, lhs);
        let r = gpr(regs, rhs);
        let carry = match op {
            BinOp::Add => CarrySource::AddCarry,
            BinOp::Sub => CarrySource::SubBorrow,
            _ => CarrySource::Cleared,
        };
        let arith = matches!(op, BinOp::Add | BinOp::Sub);
        match width {
            Width::W64 | Width::W128 => {
                if arith || op == BinOp::And {
                    self.op_s(op, true, TMP, l, r);
                } else {
                    self.op_rrr(op, TMP, l, r);
                    self.tst_self(true, TMP);
                }
                self.capture_nzcv(flags, carry);
            }
            Width::W32 => {
                if arith || op == BinOp::And {
                    self.op_s(op, false, TMP, l, r);
                } else {
                    self.op_rrr(op, TMP, l, r);
                    self.tst_self(false, TMP);
                }
                self.capture_nzcv(flags, carry);
            }
            Width::W8 | Width::W16 => {
                // Shift both operands to the top of a 32-bit register so
                // carry, overflow and sign come out of the host NZCV at the
                // width's own bit positions.
                let shift = 32 - width.bits();
                if arith {
                    self.lsl_imm(false, TMP, l, shift);
                    self.lsl_imm(false, TMP2, r, shift);
                    self.op_s(op, false, TMP, TMP, TMP2);
                } else {
                    self.op_rrr(op, TMP, l, r);
                    self.lsl_imm(false, TMP, TMP, shift);
                    self.tst_self(false, TMP);
                }
                self.capture_nzcv(flags, carry);
                // Bring the result back down for PF/AF.
                self.lsr_imm(false, TMP, TMP, shift);
            }
        }
        if flags.contains(FlagSet::PF) {
            self.capture_pf(TMP);
        }
        if flags.contains(FlagSet::AF) {
            self.capture_af(l, r, TMP);
        }
    }

    fn flag_only(
        &mut self,
        regs: &AllocationResult,
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
        width: Width,
        flags: FlagSet,
    ) {
        self.flags_of(regs, op, lhs, rhs, width, flags);
    }

    #[allow(clippy::too_many_arguments)]
    fn binop(
        &mut self,
        func: &IrFunction,
        regs: &AllocationResult,
        id: NodeId,
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
        width: Width,
        flags: FlagSet,
    ) {
        let dst = gpr(regs, id);
        let l = gpr(regs, lhs);
        let r = gpr(regs, rhs);

        match op {
            BinOp::Shl | BinOp::Shr | BinOp::Sar => {
                self.shift(func, regs, dst, op, lhs, rhs, width, flags);
            }
            BinOp::Eq => {
                match width {
                    Width::W64 | Width::W128 => {
                        // cmp xl, xr
                        self.inst(0xeb00_0000 | (r as u32) << 16 | (l as u32) << 5 | ZR as u32);
                    }
                    Width::W32 => {
                        self.inst(0x6b00_0000 | (r as u32) << 16 | (l as u32) << 5 | ZR as u32);
                    }
                    Width::W8 | Width::W16 => {
                        let shift = 32 - width.bits();
                        self.lsl_imm(false, TMP, l, shift);
                        self.lsl_imm(false, TMP2, r, shift);
                        self.inst(
                            0x6b00_0000 | (TMP2 as u32) << 16 | (TMP as u32) << 5 | ZR as u32,
                        );
                    }
                }
                self.cset(dst, EQ);
            }
            _ => {
                if !flags.is_empty() {
                    self.flags_of(regs, op, lhs, rhs, width, flags);
                }
                // Three-operand form, so destination aliasing needs no care.
                self.op_rrr(op, dst, l, r);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn shift(
        &mut self,
        func: &IrFunction,
        regs: &AllocationResult,
        dst: u8,
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
        width: Width,
        flags: FlagSet,
    ) {
        let l = gpr(regs, lhs);

        let const_count = match func.arena.op(rhs) {
            IrOp::Const { value } => Some((*value as u32) & 63),
            _ => None,
        };

        // CF is the last bit shifted out; it must come from the unshifted
        // source, so latch it before the destination write can clobber it.
        if flags.contains(FlagSet::CF) {
            let bits = width.bits();
            let cf_bit = const_count.and_then(|n| match op {
                _ if n == 0 => None,
                BinOp::Shl if n <= bits => Some(bits - n),
                BinOp::Shl => None,
                BinOp::Shr if n <= bits => Some(n - 1),
                BinOp::Shr => None,
                // Arithmetic shifts replicate the sign bit past the width.
                _ => Some((n - 1).min(bits - 1)),
            });
            match cf_bit {
                Some(bit) => {
                    self.lsr_imm(true, TMP2, l, bit);
                    self.and_mask(TMP2, TMP2, 0x1);
                    self.store_flag(Flag::Cf, TMP2);
                }
                None => self.clear_flag(Flag::Cf),
            }
        }

        match const_count {
            Some(n) => match (op, width) {
                (BinOp::Shl, Width::W32) => self.lsl_imm(false, dst, l, n),
                (BinOp::Shl, _) => self.lsl_imm(true, dst, l, n),
                (BinOp::Shr, Width::W64 | Width::W128) => self.lsr_imm(true, dst, l, n),
                (BinOp::Shr, Width::W32) => self.lsr_imm(false, dst, l, n),
                (BinOp::Shr, _) => {
                    self.and_mask(TMP, l, width.mask());
                    self.lsr_imm(true, dst, TMP, n);
                }
                (_, Width::W64 | Width::W128) => self.asr_imm(true, dst, l, n),
                (_, Width::W32) => self.asr_imm(false, dst, l, n),
                (_, _) => {
                    self.sext(TMP, l, width);
                    self.asr_imm(true, dst, TMP, n);
                }
            },
            None => {
                // The decoder only produces immediate counts today; keep a
                // correct value path for dynamically built IR anyway.
                let count = gpr(regs, rhs);
                match width {
                    Width::W64 | Width::W128 | Width::W32 => {
                        if op == BinOp::Sar && width == Width::W32 {
                            self.sext(TMP, l, Width::W32);
                            self.shift_var(op, dst, TMP, count);
                        } else if width == Width::W32 && op == BinOp::Shr {
                            self.and_mask(TMP, l, Width::W32.mask());
                            self.shift_var(op, dst, TMP, count);
                        } else {
                            self.shift_var(op, dst, l, count);
                        }
                    }
                    _ => {
                        if op == BinOp::Sar {
                            self.sext(TMP, l, width);
                        } else {
                            self.and_mask(TMP, l, width.mask());
                        }
                        self.shift_var(op, dst, TMP, count);
                    }
                }
            }
        }

        if flags.intersects(FlagSet::ZF | FlagSet::SF) {
            // Z and N over the width's window.
            match width {
                Width::W64 | Width::W128 => self.tst_self(true, dst),
                Width::W32 => self.tst_self(false, dst),
                _ => {
                    self.lsl_imm(false, TMP2, dst, 32 - width.bits());
                    self.tst_self(false, TMP2);
                }
            }
            self.capture_nzcv(flags.intersection(FlagSet::ZF | FlagSet::SF), CarrySource::Cleared);
        }
        if flags.contains(FlagSet::OF) {
            self.clear_flag(Flag::Of);
        }
        if flags.contains(FlagSet::PF) {
            self.capture_pf(dst);
        }
        if flags.contains(FlagSet::AF) {
            self.strb_state(flag_offset(Flag::Af), ZR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reloc::{apply_relocations, SymbolResolver};
    use krait_ir::passes::regalloc::RegisterAllocation;
    use krait_ir::passes::PassManager;
    use krait_ir::translate_region;
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

    fn compile(bytes: &[u8]) -> CompiledBlock {
        let bus = FlatBus {
            base: 0x1000,
            bytes: bytes.to_vec(),
        };
        let region = discover_region(&bus, 0x1000, RegionConfig::default());
        let mut func = translate_region(&region);
        PassManager::default_pipeline().run(&mut func);

        let mut backend = A64Backend::new();
        let (gprs, vecs) = backend.class_budget();
        let regs = RegisterAllocation::new(gprs, vecs).allocate(&func);
        backend.compile(&func, &regs).expect("compiles")
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn prologue_saves_state_and_link_registers() {
        let block = compile(&[0xb8, 0x05, 0x00, 0x00, 0x00, 0xc3]); // mov eax,5; ret
        let words = words(&block.code);
        assert_eq!(words[0], 0xa9bf_7bfb); // stp x27, x30, [sp, #-16]!
        assert_eq!(words[1], 0xaa00_03fb); // mov x27, x0
        assert_eq!(*words.last().expect("nonempty"), 0xd65f_03c0); // ret
        assert!(words.contains(&(0xa8c1_7bfb))); // ldp x27, x30, [sp], #16
    }

    #[test]
    fn all_instructions_are_word_sized() {
        let block = compile(&[0x83, 0xf8, 0x00, 0x75, 0x01, 0xc3, 0xc3]);
        assert_eq!(block.code.len() % 4, 0);
        assert_eq!(block.rip_to_offset.len(), 3);
        assert!(block.rip_to_offset.iter().all(|(_, off)| off % 4 == 0));
    }

    /// One block reading and writing the register file through a runtime
    /// index: `gpr[3] = gpr[3]`.
    fn indexed_access_func() -> krait_ir::IrFunction {
        use krait_ir::{Block, BlockId};

        let mut func = krait_ir::IrFunction::default();
        func.entry_rip = 0x1000;
        let begin = func.arena.push(IrOp::BlockBegin { block: BlockId(0) });
        let idx = func.arena.push(IrOp::Const { value: 3 });
        func.arena.link_after(begin, idx);
        let val = func.arena.push(IrOp::LoadGprIndexed { index: idx });
        func.arena.link_after(idx, val);
        let store = func.arena.push(IrOp::StoreGprIndexed { index: idx, src: val });
        func.arena.link_after(val, store);
        let exit = func.arena.push(IrOp::ExitFunction { next_rip: val });
        func.arena.link_after(store, exit);
        func.blocks.push(Block {
            id: BlockId(0),
            entry_rip: 0x1000,
            begin,
            end: exit,
            succs: Vec::new(),
        });
        func
    }

    /// Register-offset form against the state register: `ldr`/`str`
    /// `xd, [x27, xi, lsl #3]` with the register fields masked off.
    fn contains_indexed(words: &[u32], pattern: u32) -> bool {
        words
            .iter()
            .any(|w| w & 0xffe0_fc00 == pattern && (w >> 5) & 0x1f == u32::from(STATE))
    }

    #[test]
    fn indexed_register_file_access_uses_register_offset_forms() {
        let func = indexed_access_func();
        let mut backend = A64Backend::new();
        let (gprs, vecs) = backend.class_budget();
        let regs = RegisterAllocation::new(gprs, vecs).allocate(&func);
        assert!(!regs.has_spills());

        let block = backend.compile(&func, &regs).expect("compiles");
        let words = words(&block.code);
        assert!(contains_indexed(&words, 0xf860_7800)); // ldr
        assert!(contains_indexed(&words, 0xf820_7800)); // str
    }

    #[test]
    fn every_recorded_entry_opens_with_the_prologue() {
        let block = compile(&[0x83, 0xf8, 0x00, 0x75, 0x01, 0xc3, 0xc3]);
        let words = words(&block.code);
        assert_eq!(block.rip_to_offset.len(), 3);
        // The cache hands these offsets out as direct entry points, so each
        // one must open with the frame prologue.
        for (_, off) in &block.rip_to_offset {
            let idx = *off as usize / 4;
            assert_eq!(words[idx], 0xa9bf_7bfb); // stp x27, x30, [sp, #-16]!
            assert_eq!(words[idx + 1], 0xaa00_03fb); // mov x27, x0
        }
    }

    #[test]
    fn branches_resolve_to_nonzero_displacements() {
        // cmp eax, 0; jnz +1; ret; ret
        let block = compile(&[0x83, 0xf8, 0x00, 0x75, 0x01, 0xc3, 0xc3]);
        let words = words(&block.code);
        // Unconditional branch to the fallthrough block.
        assert!(words
            .iter()
            .any(|w| w & 0xfc00_0000 == 0x1400_0000 && w & 0x03ff_ffff != 0));
        // cbnz to the taken block.
        assert!(words
            .iter()
            .any(|w| w & 0xff00_0000 == 0xb500_0000 && (w >> 5) & 0x7ffff != 0));
    }

    #[test]
    fn guest_rip_move_relocation_round_trips() {
        struct Identity;
        impl SymbolResolver for Identity {
            fn resolve(&self, _symbol: Symbol) -> Option<u64> {
                Some(0x7f00_dead_0000)
            }
        }

        let mut block = compile(&[0xcc]); // int3
        let reloc = block
            .relocations
            .iter()
            .find(|r| matches!(r.kind, RelocationKind::GuestRipMove { rip: 0x1000 }))
            .copied()
            .expect("fault rip relocation");
        apply_relocations(&mut block.code, &[reloc], &Identity, HostArch::Aarch64).expect("ok");

        // Reassemble the 64-bit immediate from the movz/movk group.
        let mut value = 0u64;
        for i in 0..4 {
            let word = u32::from_le_bytes(
                block.code[reloc.offset + i * 4..reloc.offset + i * 4 + 4]
                    .try_into()
                    .unwrap(),
            );
            value |= u64::from((word >> 5) & 0xffff) << (16 * i);
        }
        assert_eq!(value, 0x1000);
    }

    #[test]
    fn syscall_calls_the_runtime_helper() {
        let block = compile(&[0x0f, 0x05]);
        assert!(block.relocations.iter().any(|r| matches!(
            r.kind,
            RelocationKind::ThunkMove {
                symbol: Symbol::SyscallHandler
            }
        )));
        // blr x16 present.
        assert!(words(&block.code).contains(&0xd63f_0200));
    }
}
