//! x86-64 splatter backend.
//!
//! Calling convention of generated blocks: `rdi` carries the guest state
//! pointer (moved to `r15` in the prologue), the return value is the next
//! guest address in `rax`. `rax` and `r11` are scratch; everything the
//! allocator hands out comes from the eight-register table below. Guest
//! memory is identity mapped, so guest addresses are dereferenced directly.
//!
//! Guest status flags live as bytes in the state block, not in host RFLAGS:
//! flag-producing ops run the matching host instruction at the guest width
//! and immediately latch the requested flags with `setcc` stores (plus a
//! `lahf` dance for AF, which has no `setcc`).

use krait_ir::passes::regalloc::{AllocationResult, ClassConfig, RegClass};
use krait_ir::{BinOp, IrFunction, IrOp, NodeId};
use krait_types::{Cond, Flag, FlagSet, Width};

use crate::backend::{CompileError, CompiledBlock, HostArch, HostBackend};
use crate::buffer::{CodeBuffer, FixupKind, Label};
use crate::reloc::{Relocation, RelocationKind, Symbol};
use crate::state::{
    fpr_offset, gpr_offset, helper_arg_offset, OFF_FAULT_KIND, OFF_FAULT_RIP, OFF_GPRS,
};
use crate::dispatch::fault_code;

/// Host registers handed to the allocator, indexed by `PhysReg::index`.
const GPR_MAP: [u8; 8] = [1, 2, 3, 6, 7, 8, 9, 10]; // rcx rdx rbx rsi rdi r8 r9 r10
const VEC_COUNT: usize = 8; // xmm0..xmm7

const RAX: u8 = 0;
const RCX: u8 = 1;
const RSP: u8 = 4;
const R11: u8 = 11;
const STATE: u8 = 15; // r15

pub struct X64Backend;

impl X64Backend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for X64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend for X64Backend {
    fn arch(&self) -> HostArch {
        HostArch::X86_64
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
            // push r15; mov r15, rdi
            asm.buf.emit(&[0x41, 0x57]);
            asm.buf.emit(&[0x49, 0x89, 0xff]);
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
            "compiled region for x86-64"
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

fn xmm(regs: &AllocationResult, id: NodeId) -> u8 {
    let reg = regs.reg_of(id).expect("value was register allocated");
    debug_assert_eq!(reg.class, RegClass::Vector);
    reg.index
}

fn rex(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | (w as u8) << 3 | ((r >> 3) & 1) << 2 | ((x >> 3) & 1) << 1 | ((b >> 3) & 1)
}

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    md << 6 | (reg & 7) << 3 | (rm & 7)
}

impl Asm {
    fn new() -> Self {
        Self {
            buf: CodeBuffer::new(),
            relocs: Vec::new(),
        }
    }

    // Encoding primitives.

    fn mov_rr(&mut self, dst: u8, src: u8) {
        if dst == src {
            return;
        }
        self.buf.emit(&[rex(true, src, 0, dst), 0x89, modrm(3, src, dst)]);
    }

    /// `mov r64, imm64`; returns the offset of the immediate field.
    fn mov_ri(&mut self, dst: u8, imm: u64) -> usize {
        self.buf.emit(&[rex(true, 0, 0, dst), 0xb8 | (dst & 7)]);
        let offset = self.buf.len();
        self.buf.emit_u64(imm);
        offset
    }

    fn mov_ri_reloc(&mut self, dst: u8, imm: u64, kind: RelocationKind) {
        let offset = self.mov_ri(dst, imm);
        self.relocs.push(Relocation { offset, kind });
    }

    fn state_disp(&mut self, opcodes: &[u8], reg: u8, disp: u32) {
        self.buf.emit(opcodes);
        self.buf.emit_u8(modrm(2, reg, 7));
        self.buf.emit_u32(disp);
    }

    fn load_state(&mut self, dst: u8, off: usize) {
        self.state_disp(&[rex(true, dst, 0, STATE), 0x8b], dst, off as u32);
    }

    fn store_state(&mut self, off: usize, src: u8) {
        self.state_disp(&[rex(true, src, 0, STATE), 0x89], src, off as u32);
    }

    fn store_state_u8(&mut self, off: usize, src: u8) {
        self.state_disp(&[rex(false, src, 0, STATE), 0x88], src, off as u32);
    }

    /// `mov dword [state+off], imm32`
    fn store_state_imm32(&mut self, off: usize, imm: u32) {
        self.state_disp(&[rex(false, 0, 0, STATE), 0xc7], 0, off as u32);
        self.buf.emit_u32(imm);
    }

    /// `movzx r32, byte [state+off]`
    fn load_state_u8(&mut self, dst: u8, off: usize) {
        self.state_disp(&[rex(false, dst, 0, STATE), 0x0f, 0xb6], dst, off as u32);
    }

    fn movdqu_load_state(&mut self, x: u8, off: usize) {
        self.buf.emit_u8(0xf3);
        self.state_disp(&[rex(false, x, 0, STATE), 0x0f, 0x6f], x, off as u32);
    }

    fn movdqu_store_state(&mut self, off: usize, x: u8) {
        self.buf.emit_u8(0xf3);
        self.state_disp(&[rex(false, x, 0, STATE), 0x0f, 0x7f], x, off as u32);
    }

    fn setcc_state(&mut self, cc: u8, off: usize) {
        self.state_disp(&[rex(false, 0, 0, STATE), 0x0f, 0x90 | cc], 0, off as u32);
    }

    fn push(&mut self, reg: u8) {
        if reg >= 8 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 | (reg & 7));
    }

    fn pop(&mut self, reg: u8) {
        if reg >= 8 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 | (reg & 7));
    }

    fn epilogue(&mut self) {
        // pop r15; ret
        self.buf.emit(&[0x41, 0x5f, 0xc3]);
    }

    /// Width-sized ALU `op rm, reg` using the 8-bit opcode base.
    fn alu_rr(&mut self, base: u8, dst: u8, src: u8, width: Width) {
        match width {
            Width::W8 => self.buf.emit(&[rex(false, src, 0, dst), base, modrm(3, src, dst)]),
            Width::W16 => {
                self.buf.emit_u8(0x66);
                self.buf.emit(&[rex(false, src, 0, dst), base + 1, modrm(3, src, dst)]);
            }
            Width::W32 => self.buf.emit(&[rex(false, src, 0, dst), base + 1, modrm(3, src, dst)]),
            Width::W64 | Width::W128 => {
                self.buf.emit(&[rex(true, src, 0, dst), base + 1, modrm(3, src, dst)]);
            }
        }
    }

    fn or_rr32(&mut self, dst: u8, src: u8) {
        self.buf.emit(&[rex(false, src, 0, dst), 0x09, modrm(3, src, dst)]);
    }

    fn xor_rr32(&mut self, dst: u8, src: u8) {
        self.buf.emit(&[rex(false, src, 0, dst), 0x31, modrm(3, src, dst)]);
    }

    /// `xor r32, imm8`
    fn xor_imm8(&mut self, dst: u8, imm: u8) {
        self.buf.emit(&[rex(false, 0, 0, dst), 0x83, modrm(3, 6, dst), imm]);
    }

    fn shift_imm(&mut self, dst: u8, sub: u8, imm: u8, width: Width) {
        match width {
            Width::W8 => self.buf.emit(&[rex(false, 0, 0, dst), 0xc0, modrm(3, sub, dst), imm]),
            Width::W16 => {
                self.buf.emit_u8(0x66);
                self.buf.emit(&[rex(false, 0, 0, dst), 0xc1, modrm(3, sub, dst), imm]);
            }
            Width::W32 => self.buf.emit(&[rex(false, 0, 0, dst), 0xc1, modrm(3, sub, dst), imm]),
            Width::W64 | Width::W128 => {
                self.buf.emit(&[rex(true, 0, 0, dst), 0xc1, modrm(3, sub, dst), imm]);
            }
        }
    }

    fn shift_cl(&mut self, dst: u8, sub: u8, width: Width) {
        let w = matches!(width, Width::W64 | Width::W128);
        if width == Width::W16 {
            self.buf.emit_u8(0x66);
        }
        let opcode = if width == Width::W8 { 0xd2 } else { 0xd3 };
        self.buf.emit(&[rex(w, 0, 0, dst), opcode, modrm(3, sub, dst)]);
    }

    fn test_rr64(&mut self, a: u8, b: u8) {
        self.buf.emit(&[rex(true, b, 0, a), 0x85, modrm(3, b, a)]);
    }

    fn cmov_rr(&mut self, cc: u8, dst: u8, src: u8) {
        self.buf.emit(&[rex(true, dst, 0, src), 0x0f, 0x40 | cc, modrm(3, dst, src)]);
    }

    fn jcc(&mut self, cc: u8, label: Label) {
        self.buf.emit(&[0x0f, 0x80 | cc]);
        self.buf.record_fixup(label, FixupKind::Rel32);
        self.buf.emit_u32(0);
    }

    fn jmp(&mut self, label: Label) {
        self.buf.emit_u8(0xe9);
        self.buf.record_fixup(label, FixupKind::Rel32);
        self.buf.emit_u32(0);
    }

    // Guest memory access through the identity mapping.

    fn load_guest(&mut self, dst: u8, base: u8, width: Width) {
        match width {
            Width::W8 => self.buf.emit(&[rex(true, dst, 0, base), 0x0f, 0xb6, modrm(0, dst, base)]),
            Width::W16 => self.buf.emit(&[rex(true, dst, 0, base), 0x0f, 0xb7, modrm(0, dst, base)]),
            Width::W32 => self.buf.emit(&[rex(false, dst, 0, base), 0x8b, modrm(0, dst, base)]),
            Width::W64 => self.buf.emit(&[rex(true, dst, 0, base), 0x8b, modrm(0, dst, base)]),
            Width::W128 => unreachable!("vector load handled separately"),
        }
    }

    fn store_guest(&mut self, base: u8, src: u8, width: Width) {
        match width {
            Width::W8 => self.buf.emit(&[rex(false, src, 0, base), 0x88, modrm(0, src, base)]),
            Width::W16 => {
                self.buf.emit_u8(0x66);
                self.buf.emit(&[rex(false, src, 0, base), 0x89, modrm(0, src, base)]);
            }
            Width::W32 => self.buf.emit(&[rex(false, src, 0, base), 0x89, modrm(0, src, base)]),
            Width::W64 => self.buf.emit(&[rex(true, src, 0, base), 0x89, modrm(0, src, base)]),
            Width::W128 => unreachable!("vector store handled separately"),
        }
    }

    fn movdqu_load_guest(&mut self, x: u8, base: u8) {
        self.buf.emit_u8(0xf3);
        self.buf.emit(&[rex(false, x, 0, base), 0x0f, 0x6f, modrm(0, x, base)]);
    }

    fn movdqu_store_guest(&mut self, base: u8, x: u8) {
        self.buf.emit_u8(0xf3);
        self.buf.emit(&[rex(false, x, 0, base), 0x0f, 0x7f, modrm(0, x, base)]);
    }

    // Flag latching.

    fn capture_flags(&mut self, flags: FlagSet) {
        use crate::state::flag_offset;
        for (flag, cc) in [
            (Flag::Cf, 0x2u8), // setb
            (Flag::Pf, 0xa),   // setp
            (Flag::Zf, 0x4),   // sete
            (Flag::Sf, 0x8),   // sets
            (Flag::Of, 0x0),   // seto
        ] {
            if flags.contains(FlagSet::from_flag(flag)) {
                self.setcc_state(cc, flag_offset(flag));
            }
        }
        if flags.contains(FlagSet::AF) {
            // lahf; shr eax, 12; and eax, 1; store AF byte
            self.buf.emit_u8(0x9f);
            self.buf.emit(&[rex(false, 0, 0, RAX), 0xc1, modrm(3, 5, RAX), 12]);
            self.buf.emit(&[rex(false, 0, 0, RAX), 0x83, modrm(3, 4, RAX), 1]);
            self.store_state_u8(flag_offset(Flag::Af), RAX);
        }
    }

    // Helper call frame: spill every allocatable register (integer and
    // vector) so the callee can clobber freely.

    fn helper_spill(&mut self) {
        for reg in GPR_MAP {
            self.push(reg);
        }
        // sub rsp, 128
        self.buf.emit(&[0x48, 0x81, 0xec]);
        self.buf.emit_u32(128);
        for x in 0..VEC_COUNT as u8 {
            // movdqu [rsp + x*16], xmm
            self.buf.emit_u8(0xf3);
            self.buf.emit(&[rex(false, x, 0, RSP), 0x0f, 0x7f, modrm(1, x, 4), 0x24, x * 16]);
        }
    }

    fn helper_fill(&mut self) {
        for x in 0..VEC_COUNT as u8 {
            self.buf.emit_u8(0xf3);
            self.buf.emit(&[rex(false, x, 0, RSP), 0x0f, 0x6f, modrm(1, x, 4), 0x24, x * 16]);
        }
        self.buf.emit(&[0x48, 0x81, 0xc4]);
        self.buf.emit_u32(128);
        for reg in GPR_MAP.iter().rev() {
            self.pop(*reg);
        }
    }

    fn eval_cond(&mut self, dst: u8, cond: Cond) {
        use crate::state::flag_offset;
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
        self.load_state_u8(dst, flag_offset(first));
        if let Some((is_xor, flag)) = second {
            self.load_state_u8(R11, flag_offset(flag));
            if is_xor {
                self.xor_rr32(dst, R11);
            } else {
                self.or_rr32(dst, R11);
            }
        }
        if with_zf {
            self.load_state_u8(R11, flag_offset(Flag::Zf));
            self.or_rr32(dst, R11);
        }
        if invert {
            self.xor_imm8(dst, 1);
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
            IrOp::LoadGpr { reg } => self.load_state(gpr(regs, id), gpr_offset(reg)),
            IrOp::StoreGpr { reg, src } => self.store_state(gpr_offset(reg), gpr(regs, src)),
            IrOp::LoadGprIndexed { index } => {
                self.indexed_gpr(0x8b, gpr(regs, id), gpr(regs, index));
            }
            IrOp::StoreGprIndexed { index, src } => {
                self.indexed_gpr(0x89, gpr(regs, src), gpr(regs, index));
            }
            IrOp::LoadFlag { flag } => {
                self.load_state_u8(gpr(regs, id), crate::state::flag_offset(flag));
            }
            IrOp::StoreFlag { flag, src } => {
                self.store_state_u8(crate::state::flag_offset(flag), gpr(regs, src));
            }
            IrOp::LoadFpr { reg } => self.movdqu_load_state(xmm(regs, id), fpr_offset(reg.0)),
            IrOp::StoreFpr { reg, src } => {
                self.movdqu_store_state(fpr_offset(reg.0), xmm(regs, src));
            }
            IrOp::LoadMem { addr, width } => {
                if width == Width::W128 {
                    self.movdqu_load_guest(xmm(regs, id), gpr(regs, addr));
                } else {
                    self.load_guest(gpr(regs, id), gpr(regs, addr), width);
                }
            }
            IrOp::StoreMem { addr, src, width } => {
                if width == Width::W128 {
                    self.movdqu_store_guest(gpr(regs, addr), xmm(regs, src));
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
            } => {
                self.binop(func, regs, id, op, lhs, rhs, width, flags);
            }
            IrOp::CmpFlags {
                lhs,
                rhs,
                width,
                flags,
            } => {
                self.mov_rr(RAX, gpr(regs, lhs));
                self.alu_rr(0x38, RAX, gpr(regs, rhs), width);
                self.capture_flags(flags);
            }
            IrOp::TestFlags {
                lhs,
                rhs,
                width,
                flags,
            } => {
                self.mov_rr(RAX, gpr(regs, lhs));
                self.alu_rr(0x84, RAX, gpr(regs, rhs), width);
                self.capture_flags(flags);
            }
            IrOp::SignExtend { src, from } => {
                let dst = gpr(regs, id);
                let src = gpr(regs, src);
                match from {
                    Width::W8 => {
                        self.buf.emit(&[rex(true, dst, 0, src), 0x0f, 0xbe, modrm(3, dst, src)]);
                    }
                    Width::W16 => {
                        self.buf.emit(&[rex(true, dst, 0, src), 0x0f, 0xbf, modrm(3, dst, src)]);
                    }
                    Width::W32 => {
                        self.buf.emit(&[rex(true, dst, 0, src), 0x63, modrm(3, dst, src)]);
                    }
                    Width::W64 | Width::W128 => self.mov_rr(dst, src),
                }
            }
            IrOp::EvalCond { cond } => self.eval_cond(gpr(regs, id), cond),
            IrOp::Select {
                cond,
                if_true,
                if_false,
                ..
            } => {
                let dst = gpr(regs, id);
                let cond = gpr(regs, cond);
                let t = gpr(regs, if_true);
                let f = gpr(regs, if_false);
                self.test_rr64(cond, cond);
                if dst == t {
                    // Destination already holds the taken value.
                    self.cmov_rr(0x4, dst, f); // cmove
                } else {
                    self.mov_rr(dst, f);
                    self.cmov_rr(0x5, dst, t); // cmovne
                }
            }

            IrOp::Syscall {
                selector,
                args,
                arg_count,
                passthrough,
            } => {
                self.store_state(helper_arg_offset(0), gpr(regs, selector));
                for (i, arg) in args.iter().take(arg_count as usize).enumerate() {
                    self.store_state(helper_arg_offset(1 + i), gpr(regs, *arg));
                }
                self.helper_spill();
                if passthrough {
                    // Load the kernel ABI registers from the scratch area
                    // and issue the host syscall directly.
                    for (reg, slot) in [(RAX, 0), (7, 1), (6, 2), (2, 3), (10, 4), (8, 5), (9, 6)] {
                        self.load_state(reg, helper_arg_offset(slot));
                    }
                    self.buf.emit(&[0x0f, 0x05]);
                } else {
                    self.emit_helper_call(Symbol::SyscallHandler);
                }
                self.helper_fill();
                self.mov_rr(gpr(regs, id), RAX);
            }
            IrOp::CpuId { leaf, half } => {
                self.store_state(helper_arg_offset(0), gpr(regs, leaf));
                let _ = self.mov_ri(RAX, half as u64);
                self.store_state(helper_arg_offset(1), RAX);
                self.helper_spill();
                self.emit_helper_call(Symbol::CpuIdHandler);
                self.helper_fill();
                self.mov_rr(gpr(regs, id), RAX);
            }

            IrOp::Jump { target } => self.jmp(labels[target.index()]),
            IrOp::CondJump {
                cond,
                if_true,
                if_false,
            } => {
                let cond = gpr(regs, cond);
                self.test_rr64(cond, cond);
                self.jcc(0x5, labels[if_true.index()]); // jne
                self.jmp(labels[if_false.index()]);
            }
            IrOp::ExitFunction { next_rip } => {
                self.mov_rr(RAX, gpr(regs, next_rip));
                self.epilogue();
            }
            IrOp::GuestFault { rip, kind } => {
                self.store_state_imm32(OFF_FAULT_KIND, fault_code(kind) + 1);
                self.mov_ri_reloc(RAX, rip, RelocationKind::GuestRipMove { rip });
                self.store_state(OFF_FAULT_RIP, RAX);
                self.epilogue();
            }
        }
    }

    /// `op [state + index*8 + GPRS]` with opcode `0x8b` (load) or `0x89`
    /// (store); `reg` is the value register.
    fn indexed_gpr(&mut self, opcode: u8, reg: u8, index: u8) {
        self.buf.emit(&[
            rex(true, reg, index, STATE),
            opcode,
            modrm(2, reg, 4),
            // SIB: scale 8, index, base r15
            (3 << 6) | (index & 7) << 3 | 7,
        ]);
        self.buf.emit_u32(OFF_GPRS as u32);
    }

    fn emit_helper_call(&mut self, symbol: Symbol) {
        // mov rdi, r15; mov rax, <thunk>; call rax
        self.buf.emit(&[0x4c, 0x89, 0xff]);
        self.mov_ri_reloc(RAX, 0, RelocationKind::ThunkMove { symbol });
        self.buf.emit(&[0xff, 0xd0]);
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
                let sub = match op {
                    BinOp::Shl => 4,
                    BinOp::Shr => 5,
                    _ => 7,
                };
                if let IrOp::Const { value } = func.arena.op(rhs) {
                    self.mov_rr(dst, l);
                    self.shift_imm(dst, sub, *value as u8, width);
                } else {
                    // Variable counts go through cl with rcx preserved.
                    self.push(RCX);
                    self.mov_rr(RAX, l);
                    self.mov_rr(RCX, r);
                    self.shift_cl(RAX, sub, width);
                    self.pop(RCX);
                    self.mov_rr(dst, RAX);
                }
                self.capture_flags(flags);
            }
            BinOp::Mul => {
                let w = matches!(width, Width::W64 | Width::W128);
                if dst == r && dst != l {
                    self.buf.emit(&[rex(w, dst, 0, l), 0x0f, 0xaf, modrm(3, dst, l)]);
                } else {
                    self.mov_rr(dst, l);
                    self.buf.emit(&[rex(w, dst, 0, r), 0x0f, 0xaf, modrm(3, dst, r)]);
                }
                self.capture_flags(flags);
            }
            BinOp::Eq => {
                self.mov_rr(RAX, l);
                self.alu_rr(0x38, RAX, r, width); // cmp
                // sete al; movzx dst, al
                self.buf.emit(&[rex(false, 0, 0, RAX), 0x0f, 0x94, modrm(3, 0, RAX)]);
                self.buf.emit(&[rex(false, dst, 0, RAX), 0x0f, 0xb6, modrm(3, dst, RAX)]);
            }
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let base = match op {
                    BinOp::Add => 0x00,
                    BinOp::Sub => 0x28,
                    BinOp::And => 0x20,
                    BinOp::Or => 0x08,
                    _ => 0x30,
                };
                let commutes = !matches!(op, BinOp::Sub);
                if dst == r && dst != l {
                    if commutes {
                        self.alu_rr(base, dst, l, width);
                    } else {
                        self.mov_rr(RAX, l);
                        self.alu_rr(base, RAX, r, width);
                        self.mov_rr(dst, RAX);
                    }
                } else {
                    self.mov_rr(dst, l);
                    self.alu_rr(base, dst, r, width);
                }
                self.capture_flags(flags);
            }
        }
    }
}
