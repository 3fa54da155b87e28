//! Hand-rolled x86-64 subset decoder.
//!
//! One instruction per call, prefix scan + REX + ModRM/SIB, no VEX. The
//! subset covers the integer ALU/move/control-flow instructions the IR
//! emitter knows how to translate, plus `SYSCALL`/`CPUID` and the 128-bit
//! `MOVDQA`/`MOVDQU` forms needed for vector context tracking.

use krait_types::{Cond, Fpr, Gpr, Width};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("instruction bytes exhausted")]
    Truncated,
    #[error("unsupported or invalid opcode {opcode:#04x}")]
    UnsupportedOpcode { opcode: u8 },
    #[error("invalid register encoding")]
    BadRegister,
}

/// An integer register operand, down to 8-bit high/low halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    pub gpr: Gpr,
    pub width: Width,
    /// AH/CH/DH/BH when `width == W8` and no REX prefix selected the low byte.
    pub high8: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub disp: i32,
    pub rip_relative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(u64),
    Mem(Address),
}

/// Operand of a 128-bit vector move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecOperand {
    Xmm(Fpr),
    Mem(Address),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    Mov { dst: Operand, src: Operand, width: Width },
    MovVec { dst: VecOperand, src: VecOperand },
    Movzx { dst: Reg, src: Operand, src_width: Width },
    Movsx { dst: Reg, src: Operand, src_width: Width },
    Lea { dst: Reg, addr: Address, width: Width },
    Alu { op: AluOp, dst: Operand, src: Operand, width: Width },
    Shift { op: ShiftOp, dst: Operand, count: u8, width: Width },
    Cmp { lhs: Operand, rhs: Operand, width: Width },
    Test { lhs: Operand, rhs: Operand, width: Width },
    Inc { dst: Operand, width: Width },
    Dec { dst: Operand, width: Width },
    Push { src: Operand },
    Pop { dst: Operand },
    JmpRel { target: u64 },
    JccRel { cond: Cond, target: u64 },
    CallRel { target: u64 },
    JmpInd { target: Operand },
    CallInd { target: Operand },
    Ret,
    Setcc { cond: Cond, dst: Operand },
    Cmovcc { cond: Cond, dst: Reg, src: Operand, width: Width },
    Nop,
    Int3,
    Syscall,
    Cpuid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInst {
    pub rip: u64,
    pub len: u8,
    pub kind: InstKind,
}

impl DecodedInst {
    #[must_use]
    pub fn next_rip(&self) -> u64 {
        self.rip.wrapping_add(self.len as u64)
    }

    /// Whether this instruction ends a basic block.
    #[must_use]
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::JmpRel { .. }
                | InstKind::JccRel { .. }
                | InstKind::CallRel { .. }
                | InstKind::JmpInd { .. }
                | InstKind::CallInd { .. }
                | InstKind::Ret
                | InstKind::Syscall
                | InstKind::Int3
                | InstKind::Invalid
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    present: bool,
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

impl Rex {
    fn from_byte(b: u8) -> Self {
        debug_assert!((0x40..=0x4f).contains(&b));
        Self {
            present: true,
            w: b & 0x08 != 0,
            r: b & 0x04 != 0,
            x: b & 0x02 != 0,
            b: b & 0x01 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Prefixes {
    rex: Rex,
    operand_override: bool,
    repne: bool,
    rep: bool,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.offset).ok_or(DecodeError::Truncated)?;
        self.offset += 1;
        Ok(b)
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.bytes
            .get(self.offset)
            .copied()
            .ok_or(DecodeError::Truncated)
    }

    fn le(&mut self, len: usize) -> Result<u64, DecodeError> {
        if self.bytes.len() < self.offset + len {
            return Err(DecodeError::Truncated);
        }
        let mut out = 0u64;
        for i in 0..len {
            out |= (self.bytes[self.offset + i] as u64) << (i * 8);
        }
        self.offset += len;
        Ok(out)
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.le(4)? as u32 as i32)
    }
}

#[derive(Debug, Clone, Copy)]
struct ModRm {
    mod_bits: u8,
    reg: u8,
    rm: u8,
}

fn parse_modrm(byte: u8, rex: Rex) -> ModRm {
    ModRm {
        mod_bits: (byte >> 6) & 0x3,
        reg: ((byte >> 3) & 0x7) | if rex.r { 8 } else { 0 },
        rm: (byte & 0x7) | if rex.b { 8 } else { 0 },
    }
}

fn gpr(code: u8) -> Result<Gpr, DecodeError> {
    Gpr::from_u4(code & 0x0f).ok_or(DecodeError::BadRegister)
}

/// 8-bit register decoding: without REX, encodings 4..=7 select AH..BH.
fn reg8(code: u8, rex_present: bool) -> Result<Reg, DecodeError> {
    let code = code & 0x0f;
    let (gpr_code, high8) = if code < 8 && !rex_present && code >= 4 {
        (code - 4, true)
    } else {
        (code, false)
    };
    Ok(Reg {
        gpr: gpr(gpr_code)?,
        width: Width::W8,
        high8,
    })
}

fn reg(code: u8, width: Width, rex_present: bool) -> Result<Reg, DecodeError> {
    if width == Width::W8 {
        return reg8(code, rex_present);
    }
    Ok(Reg {
        gpr: gpr(code)?,
        width,
        high8: false,
    })
}

fn op_width(prefixes: Prefixes) -> Width {
    if prefixes.rex.w {
        Width::W64
    } else if prefixes.operand_override {
        Width::W16
    } else {
        Width::W32
    }
}

/// Decode a ModRM byte plus any SIB/displacement into an operand.
fn modrm_operand(
    cur: &mut Cursor<'_>,
    prefixes: Prefixes,
    width: Width,
) -> Result<(Operand, ModRm), DecodeError> {
    let (mem, modrm) = modrm_mem(cur, prefixes)?;
    match mem {
        Some(addr) => Ok((Operand::Mem(addr), modrm)),
        None => Ok((
            Operand::Reg(reg(modrm.rm, width, prefixes.rex.present)?),
            modrm,
        )),
    }
}

/// Raw ModRM parse: `Some(addr)` for memory forms, `None` for register forms.
fn modrm_mem(
    cur: &mut Cursor<'_>,
    prefixes: Prefixes,
) -> Result<(Option<Address>, ModRm), DecodeError> {
    let rex = prefixes.rex;
    let modrm = parse_modrm(cur.u8()?, rex);
    if modrm.mod_bits == 3 {
        return Ok((None, modrm));
    }

    let mut base = None;
    let mut index = None;
    let mut scale = 1u8;
    let mut disp = 0i32;
    let mut rip_relative = false;

    let rm_low3 = modrm.rm & 0x7;
    if rm_low3 == 4 {
        let sib = cur.u8()?;
        let scale_bits = (sib >> 6) & 0x3;
        let index_code = ((sib >> 3) & 0x7) | if rex.x { 8 } else { 0 };
        let base_code = (sib & 0x7) | if rex.b { 8 } else { 0 };
        scale = 1u8 << scale_bits;
        if index_code & 0x7 != 4 {
            index = Some(gpr(index_code)?);
        }
        if base_code & 0x7 == 5 && modrm.mod_bits == 0 {
            disp = cur.i32()?;
        } else {
            base = Some(gpr(base_code)?);
        }
    } else if rm_low3 == 5 && modrm.mod_bits == 0 {
        rip_relative = true;
        disp = cur.i32()?;
    } else {
        base = Some(gpr(modrm.rm)?);
    }

    match modrm.mod_bits {
        0 => {}
        1 => disp = disp.wrapping_add(cur.i8()? as i32),
        2 => disp = disp.wrapping_add(cur.i32()?),
        _ => unreachable!(),
    }

    Ok((
        Some(Address {
            base,
            index,
            scale,
            disp,
            rip_relative,
        }),
        modrm,
    ))
}

fn modrm_reg(modrm: ModRm, width: Width, rex_present: bool) -> Result<Reg, DecodeError> {
    reg(modrm.reg, width, rex_present)
}

/// Decode a single instruction at `rip` from `bytes` (up to 15 bytes).
///
/// Decoding failures yield [`InstKind::Invalid`] with a 1-byte length so
/// callers can always make forward progress; the runtime converts that into a
/// guest fault.
#[must_use]
pub fn decode_one(rip: u64, bytes: &[u8]) -> DecodedInst {
    match try_decode_one(rip, bytes) {
        Ok(inst) => inst,
        Err(_) => DecodedInst {
            rip,
            len: 1,
            kind: InstKind::Invalid,
        },
    }
}

pub fn try_decode_one(rip: u64, bytes: &[u8]) -> Result<DecodedInst, DecodeError> {
    let mut cur = Cursor::new(bytes);
    let mut prefixes = Prefixes::default();

    loop {
        match cur.peek()? {
            0x66 => {
                prefixes.operand_override = true;
                cur.offset += 1;
            }
            0xf2 => {
                prefixes.repne = true;
                cur.offset += 1;
            }
            0xf3 => {
                prefixes.rep = true;
                cur.offset += 1;
            }
            // Address-size override: unsupported addressing modes decode as
            // invalid rather than mis-decoding.
            0x67 => return Err(DecodeError::UnsupportedOpcode { opcode: 0x67 }),
            b @ 0x40..=0x4f => {
                prefixes.rex = Rex::from_byte(b);
                cur.offset += 1;
            }
            _ => break,
        }
    }

    let opcode = cur.u8()?;
    let width = op_width(prefixes);
    let rexp = prefixes.rex.present;

    let kind = match opcode {
        // ALU: op r/m, r (00/01/...) and op r, r/m (02/03/...).
        0x00 | 0x01 | 0x02 | 0x03 | 0x08 | 0x09 | 0x0a | 0x0b | 0x20 | 0x21 | 0x22 | 0x23
        | 0x28 | 0x29 | 0x2a | 0x2b | 0x30 | 0x31 | 0x32 | 0x33 => {
            let op = match opcode & 0xf8 {
                0x00 => AluOp::Add,
                0x08 => AluOp::Or,
                0x20 => AluOp::And,
                0x28 => AluOp::Sub,
                0x30 => AluOp::Xor,
                _ => unreachable!(),
            };
            let w = if opcode & 1 == 0 { Width::W8 } else { width };
            let (rm, modrm) = modrm_operand(&mut cur, prefixes, w)?;
            let r = Operand::Reg(modrm_reg(modrm, w, rexp)?);
            let (dst, src) = if opcode & 2 == 0 { (rm, r) } else { (r, rm) };
            InstKind::Alu { op, dst, src, width: w }
        }
        0x38 | 0x39 | 0x3a | 0x3b => {
            let w = if opcode & 1 == 0 { Width::W8 } else { width };
            let (rm, modrm) = modrm_operand(&mut cur, prefixes, w)?;
            let r = Operand::Reg(modrm_reg(modrm, w, rexp)?);
            let (lhs, rhs) = if opcode & 2 == 0 { (rm, r) } else { (r, rm) };
            InstKind::Cmp { lhs, rhs, width: w }
        }
        0x50..=0x57 => InstKind::Push {
            src: Operand::Reg(reg(
                (opcode - 0x50) | if prefixes.rex.b { 8 } else { 0 },
                Width::W64,
                rexp,
            )?),
        },
        0x58..=0x5f => InstKind::Pop {
            dst: Operand::Reg(reg(
                (opcode - 0x58) | if prefixes.rex.b { 8 } else { 0 },
                Width::W64,
                rexp,
            )?),
        },
        0x70..=0x7f => {
            let cond = Cond::from_nibble(opcode & 0x0f).expect("nibble is in range");
            let rel = cur.i8()? as i64;
            InstKind::JccRel {
                cond,
                target: rip
                    .wrapping_add(cur.offset as u64)
                    .wrapping_add(rel as u64),
            }
        }
        // Group 1: ALU/CMP with immediate.
        0x80 | 0x81 | 0x83 => {
            let w = if opcode == 0x80 { Width::W8 } else { width };
            let (dst, modrm) = modrm_operand(&mut cur, prefixes, w)?;
            let imm = match opcode {
                0x80 => cur.u8()? as u64,
                0x81 => {
                    let len = if w == Width::W16 { 2 } else { 4 };
                    let raw = cur.le(len)?;
                    if w == Width::W64 {
                        Width::W32.sign_extend(raw)
                    } else {
                        raw
                    }
                }
                0x83 => w.truncate(Width::W8.sign_extend(cur.u8()? as u64)),
                _ => unreachable!(),
            };
            let src = Operand::Imm(imm);
            match modrm.reg & 0x7 {
                0 => InstKind::Alu { op: AluOp::Add, dst, src, width: w },
                1 => InstKind::Alu { op: AluOp::Or, dst, src, width: w },
                4 => InstKind::Alu { op: AluOp::And, dst, src, width: w },
                5 => InstKind::Alu { op: AluOp::Sub, dst, src, width: w },
                6 => InstKind::Alu { op: AluOp::Xor, dst, src, width: w },
                7 => InstKind::Cmp { lhs: dst, rhs: src, width: w },
                _ => return Err(DecodeError::UnsupportedOpcode { opcode }),
            }
        }
        0x84 | 0x85 => {
            let w = if opcode == 0x84 { Width::W8 } else { width };
            let (rm, modrm) = modrm_operand(&mut cur, prefixes, w)?;
            InstKind::Test {
                lhs: rm,
                rhs: Operand::Reg(modrm_reg(modrm, w, rexp)?),
                width: w,
            }
        }
        0x88 | 0x89 | 0x8a | 0x8b => {
            let w = if opcode & 1 == 0 { Width::W8 } else { width };
            let (rm, modrm) = modrm_operand(&mut cur, prefixes, w)?;
            let r = Operand::Reg(modrm_reg(modrm, w, rexp)?);
            let (dst, src) = if opcode & 2 == 0 { (rm, r) } else { (r, rm) };
            InstKind::Mov { dst, src, width: w }
        }
        0x8d => {
            let (mem, modrm) = modrm_mem(&mut cur, prefixes)?;
            let addr = mem.ok_or(DecodeError::UnsupportedOpcode { opcode })?;
            InstKind::Lea {
                dst: modrm_reg(modrm, width, rexp)?,
                addr,
                width,
            }
        }
        0x90 => InstKind::Nop,
        0xa8 => InstKind::Test {
            lhs: Operand::Reg(Reg { gpr: Gpr::Rax, width: Width::W8, high8: false }),
            rhs: Operand::Imm(cur.u8()? as u64),
            width: Width::W8,
        },
        0xa9 => {
            let len = if width == Width::W16 { 2 } else { 4 };
            let raw = cur.le(len)?;
            let imm = if width == Width::W64 { Width::W32.sign_extend(raw) } else { raw };
            InstKind::Test {
                lhs: Operand::Reg(Reg { gpr: Gpr::Rax, width, high8: false }),
                rhs: Operand::Imm(imm),
                width,
            }
        }
        0xb0..=0xb7 => {
            let dst = reg8((opcode - 0xb0) | if prefixes.rex.b { 8 } else { 0 }, rexp)?;
            InstKind::Mov {
                dst: Operand::Reg(dst),
                src: Operand::Imm(cur.u8()? as u64),
                width: Width::W8,
            }
        }
        0xb8..=0xbf => {
            let dst = reg(
                (opcode - 0xb8) | if prefixes.rex.b { 8 } else { 0 },
                width,
                rexp,
            )?;
            let imm = cur.le(width.bytes())?;
            InstKind::Mov {
                dst: Operand::Reg(dst),
                src: Operand::Imm(imm),
                width,
            }
        }
        0xc0 | 0xc1 | 0xd1 => {
            let w = if opcode == 0xc0 { Width::W8 } else { width };
            let (dst, modrm) = modrm_operand(&mut cur, prefixes, w)?;
            let op = match modrm.reg & 0x7 {
                4 => ShiftOp::Shl,
                5 => ShiftOp::Shr,
                7 => ShiftOp::Sar,
                _ => return Err(DecodeError::UnsupportedOpcode { opcode }),
            };
            let count = if opcode == 0xd1 { 1 } else { cur.u8()? };
            let count = count & if w == Width::W64 { 0x3f } else { 0x1f };
            InstKind::Shift { op, dst, count, width: w }
        }
        0xc3 => InstKind::Ret,
        0xc6 | 0xc7 => {
            let w = if opcode == 0xc6 { Width::W8 } else { width };
            let (dst, _) = modrm_operand(&mut cur, prefixes, w)?;
            let imm = match w {
                Width::W8 => cur.u8()? as u64,
                Width::W16 => cur.le(2)?,
                Width::W32 => cur.le(4)?,
                Width::W64 => Width::W32.sign_extend(cur.le(4)?),
                Width::W128 => unreachable!(),
            };
            InstKind::Mov { dst, src: Operand::Imm(imm), width: w }
        }
        0xcc => InstKind::Int3,
        0xe8 => {
            let rel = cur.i32()? as i64;
            InstKind::CallRel {
                target: rip
                    .wrapping_add(cur.offset as u64)
                    .wrapping_add(rel as u64),
            }
        }
        0xe9 => {
            let rel = cur.i32()? as i64;
            InstKind::JmpRel {
                target: rip
                    .wrapping_add(cur.offset as u64)
                    .wrapping_add(rel as u64),
            }
        }
        0xeb => {
            let rel = cur.i8()? as i64;
            InstKind::JmpRel {
                target: rip
                    .wrapping_add(cur.offset as u64)
                    .wrapping_add(rel as u64),
            }
        }
        0xfe | 0xff => {
            let w = if opcode == 0xfe { Width::W8 } else { width };
            let (rm, modrm) = modrm_operand(&mut cur, prefixes, w)?;
            match (opcode, modrm.reg & 0x7) {
                (_, 0) => InstKind::Inc { dst: rm, width: w },
                (_, 1) => InstKind::Dec { dst: rm, width: w },
                (0xff, 2) => InstKind::CallInd { target: rm },
                (0xff, 4) => InstKind::JmpInd { target: rm },
                (0xff, 6) => InstKind::Push { src: rm },
                _ => return Err(DecodeError::UnsupportedOpcode { opcode }),
            }
        }
        0x0f => decode_0f(&mut cur, rip, prefixes)?,
        _ => return Err(DecodeError::UnsupportedOpcode { opcode }),
    };

    debug_assert!(cur.offset <= crate::MAX_INST_LEN);
    Ok(DecodedInst {
        rip,
        len: cur.offset as u8,
        kind,
    })
}

fn decode_0f(
    cur: &mut Cursor<'_>,
    rip: u64,
    prefixes: Prefixes,
) -> Result<InstKind, DecodeError> {
    let opcode = cur.u8()?;
    let width = op_width(prefixes);
    let rexp = prefixes.rex.present;

    Ok(match opcode {
        0x05 => InstKind::Syscall,
        // Multi-byte NOP (0F 1F /0).
        0x1f => {
            let (_, _) = modrm_operand(cur, prefixes, width)?;
            InstKind::Nop
        }
        0x40..=0x4f => {
            let cond = Cond::from_nibble(opcode & 0x0f).expect("nibble is in range");
            let (src, modrm) = modrm_operand(cur, prefixes, width)?;
            InstKind::Cmovcc {
                cond,
                dst: modrm_reg(modrm, width, rexp)?,
                src,
                width,
            }
        }
        // MOVDQA/MOVDQU xmm, xmm/m128 (6F) and xmm/m128, xmm (7F).
        0x6f | 0x7f if prefixes.operand_override || prefixes.rep => {
            let (mem, modrm) = modrm_mem(cur, prefixes)?;
            let reg_op = VecOperand::Xmm(Fpr(modrm.reg));
            let rm_op = match mem {
                Some(addr) => VecOperand::Mem(addr),
                None => VecOperand::Xmm(Fpr(modrm.rm)),
            };
            let (dst, src) = if opcode == 0x6f {
                (reg_op, rm_op)
            } else {
                (rm_op, reg_op)
            };
            InstKind::MovVec { dst, src }
        }
        0x80..=0x8f => {
            let cond = Cond::from_nibble(opcode & 0x0f).expect("nibble is in range");
            let rel = cur.i32()? as i64;
            InstKind::JccRel {
                cond,
                target: rip
                    .wrapping_add(cur.offset as u64)
                    .wrapping_add(rel as u64),
            }
        }
        0x90..=0x9f => {
            let cond = Cond::from_nibble(opcode & 0x0f).expect("nibble is in range");
            let (dst, _) = modrm_operand(cur, prefixes, Width::W8)?;
            InstKind::Setcc { cond, dst }
        }
        0xa2 => InstKind::Cpuid,
        0xb6 | 0xb7 => {
            let src_width = if opcode == 0xb6 { Width::W8 } else { Width::W16 };
            let (src, modrm) = modrm_operand(cur, prefixes, src_width)?;
            InstKind::Movzx {
                dst: modrm_reg(modrm, width, rexp)?,
                src,
                src_width,
            }
        }
        0xbe | 0xbf => {
            let src_width = if opcode == 0xbe { Width::W8 } else { Width::W16 };
            let (src, modrm) = modrm_operand(cur, prefixes, src_width)?;
            InstKind::Movsx {
                dst: modrm_reg(modrm, width, rexp)?,
                src,
                src_width,
            }
        }
        _ => return Err(DecodeError::UnsupportedOpcode { opcode }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> DecodedInst {
        decode_one(0x1000, bytes)
    }

    #[test]
    fn mov_imm64() {
        // movabs rax, 0x123456789abcdef0
        let inst = decode(&[0x48, 0xb8, 0xf0, 0xde, 0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(inst.len, 10);
        assert_eq!(
            inst.kind,
            InstKind::Mov {
                dst: Operand::Reg(Reg { gpr: Gpr::Rax, width: Width::W64, high8: false }),
                src: Operand::Imm(0x1234_5678_9abc_def0),
                width: Width::W64,
            }
        );
    }

    #[test]
    fn add_reg_reg() {
        // add rbx, rcx
        let inst = decode(&[0x48, 0x01, 0xcb]);
        assert_eq!(
            inst.kind,
            InstKind::Alu {
                op: AluOp::Add,
                dst: Operand::Reg(Reg { gpr: Gpr::Rbx, width: Width::W64, high8: false }),
                src: Operand::Reg(Reg { gpr: Gpr::Rcx, width: Width::W64, high8: false }),
                width: Width::W64,
            }
        );
    }

    #[test]
    fn sib_addressing() {
        // mov rax, [rbx + rsi*4 + 0x10]
        let inst = decode(&[0x48, 0x8b, 0x44, 0xb3, 0x10]);
        assert_eq!(
            inst.kind,
            InstKind::Mov {
                dst: Operand::Reg(Reg { gpr: Gpr::Rax, width: Width::W64, high8: false }),
                src: Operand::Mem(Address {
                    base: Some(Gpr::Rbx),
                    index: Some(Gpr::Rsi),
                    scale: 4,
                    disp: 0x10,
                    rip_relative: false,
                }),
                width: Width::W64,
            }
        );
    }

    #[test]
    fn rip_relative() {
        // mov rax, [rip + 0x100]
        let inst = decode(&[0x48, 0x8b, 0x05, 0x00, 0x01, 0x00, 0x00]);
        match inst.kind {
            InstKind::Mov { src: Operand::Mem(addr), .. } => {
                assert!(addr.rip_relative);
                assert_eq!(addr.disp, 0x100);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn jcc_rel8_target() {
        // jnz +0x10 (from end of the 2-byte instruction)
        let inst = decode(&[0x75, 0x10]);
        assert_eq!(
            inst.kind,
            InstKind::JccRel { cond: Cond::Ne, target: 0x1000 + 2 + 0x10 }
        );
        assert!(inst.is_block_terminator());
    }

    #[test]
    fn jcc_backward_target() {
        let inst = decode(&[0x75, 0xfe]); // jnz -2 => self
        assert_eq!(inst.kind, InstKind::JccRel { cond: Cond::Ne, target: 0x1000 });
    }

    #[test]
    fn group1_imm8_sign_extends() {
        // add rax, -1 (83 /0 ib)
        let inst = decode(&[0x48, 0x83, 0xc0, 0xff]);
        assert_eq!(
            inst.kind,
            InstKind::Alu {
                op: AluOp::Add,
                dst: Operand::Reg(Reg { gpr: Gpr::Rax, width: Width::W64, high8: false }),
                src: Operand::Imm(u64::MAX),
                width: Width::W64,
            }
        );
    }

    #[test]
    fn high8_without_rex() {
        // mov ah, 1
        let inst = decode(&[0xb4, 0x01]);
        assert_eq!(
            inst.kind,
            InstKind::Mov {
                dst: Operand::Reg(Reg { gpr: Gpr::Rax, width: Width::W8, high8: true }),
                src: Operand::Imm(1),
                width: Width::W8,
            }
        );
    }

    #[test]
    fn spl_with_rex() {
        // mov spl, 1 (REX selects low byte of rsp)
        let inst = decode(&[0x40, 0xb4, 0x01]);
        assert_eq!(
            inst.kind,
            InstKind::Mov {
                dst: Operand::Reg(Reg { gpr: Gpr::Rsp, width: Width::W8, high8: false }),
                src: Operand::Imm(1),
                width: Width::W8,
            }
        );
    }

    #[test]
    fn movdqa_load() {
        // movdqa xmm1, [rax]
        let inst = decode(&[0x66, 0x0f, 0x6f, 0x08]);
        assert_eq!(
            inst.kind,
            InstKind::MovVec {
                dst: VecOperand::Xmm(Fpr(1)),
                src: VecOperand::Mem(Address {
                    base: Some(Gpr::Rax),
                    index: None,
                    scale: 1,
                    disp: 0,
                    rip_relative: false,
                }),
            }
        );
    }

    #[test]
    fn syscall_and_cpuid() {
        assert_eq!(decode(&[0x0f, 0x05]).kind, InstKind::Syscall);
        assert_eq!(decode(&[0x0f, 0xa2]).kind, InstKind::Cpuid);
        assert!(decode(&[0x0f, 0x05]).is_block_terminator());
    }

    #[test]
    fn invalid_falls_back_to_one_byte() {
        let inst = decode(&[0x0e]);
        assert_eq!(inst.kind, InstKind::Invalid);
        assert_eq!(inst.len, 1);
        assert!(inst.is_block_terminator());
    }

    #[test]
    fn truncated_is_invalid() {
        let inst = decode(&[0x48]); // lone REX prefix
        assert_eq!(inst.kind, InstKind::Invalid);
    }
}
