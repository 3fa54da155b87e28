//! Shared leaf types for the krait translation core.
//!
//! These are deliberately small and dependency-free so every layer (decoder,
//! IR, backends, runtime) can share them without coupling.

use core::fmt;

/// Operand width in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
    /// 128-bit vector width. Only valid for FPR context accesses and vector
    /// memory ops; integer helpers panic on it.
    W128,
}

impl Width {
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
            Width::W128 => 128,
        }
    }

    #[must_use]
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Mask covering the low `bits()` bits of a 64-bit value.
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xff,
            Width::W16 => 0xffff,
            Width::W32 => 0xffff_ffff,
            Width::W64 => u64::MAX,
            Width::W128 => panic!("Width::W128 has no 64-bit mask"),
        }
    }

    #[must_use]
    pub const fn truncate(self, value: u64) -> u64 {
        value & self.mask()
    }

    #[must_use]
    pub const fn sign_extend(self, value: u64) -> u64 {
        match self {
            Width::W8 => value as u8 as i8 as i64 as u64,
            Width::W16 => value as u16 as i16 as i64 as u64,
            Width::W32 => value as u32 as i32 as i64 as u64,
            Width::W64 => value,
            Width::W128 => panic!("Width::W128 cannot be sign extended"),
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.bits())
    }
}

/// Guest general-purpose registers (64-bit x86 numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const COUNT: usize = 16;

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn from_u4(code: u8) -> Option<Gpr> {
        Some(match code {
            0 => Gpr::Rax,
            1 => Gpr::Rcx,
            2 => Gpr::Rdx,
            3 => Gpr::Rbx,
            4 => Gpr::Rsp,
            5 => Gpr::Rbp,
            6 => Gpr::Rsi,
            7 => Gpr::Rdi,
            8 => Gpr::R8,
            9 => Gpr::R9,
            10 => Gpr::R10,
            11 => Gpr::R11,
            12 => Gpr::R12,
            13 => Gpr::R13,
            14 => Gpr::R14,
            15 => Gpr::R15,
            _ => return None,
        })
    }

    /// Bit for this register within a [`GprMask`].
    #[must_use]
    pub const fn mask_bit(self) -> u16 {
        1u16 << (self as u8)
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(s)
    }
}

/// Guest vector (XMM) registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fpr(pub u8);

impl Fpr {
    pub const COUNT: usize = 16;

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn mask_bit(self) -> u16 {
        1u16 << self.0
    }
}

impl fmt::Display for Fpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

/// Bitmask over the 16 guest GPRs. Used by the dead-store passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GprMask(pub u16);

impl GprMask {
    pub const EMPTY: GprMask = GprMask(0);
    pub const ALL: GprMask = GprMask(u16::MAX);

    #[must_use]
    pub const fn contains(self, reg: Gpr) -> bool {
        self.0 & reg.mask_bit() != 0
    }

    #[must_use]
    pub const fn insert(self, reg: Gpr) -> GprMask {
        GprMask(self.0 | reg.mask_bit())
    }

    #[must_use]
    pub const fn union(self, other: GprMask) -> GprMask {
        GprMask(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: GprMask) -> GprMask {
        GprMask(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: GprMask) -> GprMask {
        GprMask(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Bitmask over the 16 guest FPRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FprMask(pub u16);

impl FprMask {
    pub const EMPTY: FprMask = FprMask(0);
    pub const ALL: FprMask = FprMask(u16::MAX);

    #[must_use]
    pub const fn contains(self, reg: Fpr) -> bool {
        self.0 & reg.mask_bit() != 0
    }

    #[must_use]
    pub const fn insert(self, reg: Fpr) -> FprMask {
        FprMask(self.0 | reg.mask_bit())
    }

    #[must_use]
    pub const fn union(self, other: FprMask) -> FprMask {
        FprMask(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: FprMask) -> FprMask {
        FprMask(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: FprMask) -> FprMask {
        FprMask(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// x86 status flags tracked by the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    Of,
}

impl Flag {
    pub const ALL: [Flag; 6] = [Flag::Cf, Flag::Pf, Flag::Af, Flag::Zf, Flag::Sf, Flag::Of];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Flag::Cf => 0,
            Flag::Pf => 1,
            Flag::Af => 2,
            Flag::Zf => 3,
            Flag::Sf => 4,
            Flag::Of => 5,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Flag::Cf => "cf",
            Flag::Pf => "pf",
            Flag::Af => "af",
            Flag::Zf => "zf",
            Flag::Sf => "sf",
            Flag::Of => "of",
        };
        f.write_str(s)
    }
}

bitflags::bitflags! {
    /// Set of status flags written (or killed) by an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlagSet: u8 {
        const CF = 1 << 0;
        const PF = 1 << 1;
        const AF = 1 << 2;
        const ZF = 1 << 3;
        const SF = 1 << 4;
        const OF = 1 << 5;
    }
}

impl FlagSet {
    pub const EMPTY: FlagSet = FlagSet::empty();
    pub const ARITH: FlagSet = FlagSet::all();
    /// Flags produced by logical ops (CF/OF forced clear, AF undefined-as-clear).
    pub const LOGIC: FlagSet = FlagSet::CF
        .union(FlagSet::PF)
        .union(FlagSet::ZF)
        .union(FlagSet::SF)
        .union(FlagSet::OF);

    #[must_use]
    pub const fn from_flag(flag: Flag) -> FlagSet {
        match flag {
            Flag::Cf => FlagSet::CF,
            Flag::Pf => FlagSet::PF,
            Flag::Af => FlagSet::AF,
            Flag::Zf => FlagSet::ZF,
            Flag::Sf => FlagSet::SF,
            Flag::Of => FlagSet::OF,
        }
    }
}

/// x86 condition codes, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cond {
    #[must_use]
    pub const fn from_nibble(code: u8) -> Option<Cond> {
        Some(match code {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xa => Cond::P,
            0xb => Cond::Np,
            0xc => Cond::L,
            0xd => Cond::Ge,
            0xe => Cond::Le,
            0xf => Cond::G,
            _ => return None,
        })
    }

    /// The flags this condition reads.
    #[must_use]
    pub const fn flags_read(self) -> FlagSet {
        match self {
            Cond::O | Cond::No => FlagSet::OF,
            Cond::B | Cond::Ae => FlagSet::CF,
            Cond::E | Cond::Ne => FlagSet::ZF,
            Cond::Be | Cond::A => FlagSet::CF.union(FlagSet::ZF),
            Cond::S | Cond::Ns => FlagSet::SF,
            Cond::P | Cond::Np => FlagSet::PF,
            Cond::L | Cond::Ge => FlagSet::SF.union(FlagSet::OF),
            Cond::Le | Cond::G => FlagSet::ZF.union(FlagSet::SF).union(FlagSet::OF),
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        };
        f.write_str(s)
    }
}

/// 4KiB guest page helpers shared by the decoder and the lookup cache.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

#[must_use]
pub const fn page_of(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_masks() {
        assert_eq!(Width::W8.mask(), 0xff);
        assert_eq!(Width::W32.truncate(0x1_2345_6789), 0x2345_6789);
        assert_eq!(Width::W16.sign_extend(0x8000), 0xffff_ffff_ffff_8000);
    }

    #[test]
    fn gpr_roundtrip() {
        for code in 0..16u8 {
            let gpr = Gpr::from_u4(code).unwrap();
            assert_eq!(gpr.index(), code as usize);
        }
        assert!(Gpr::from_u4(16).is_none());
    }

    #[test]
    fn gpr_mask_ops() {
        let m = GprMask::EMPTY.insert(Gpr::Rax).insert(Gpr::R15);
        assert!(m.contains(Gpr::Rax));
        assert!(!m.contains(Gpr::Rcx));
        assert!(m.difference(GprMask::EMPTY.insert(Gpr::Rax)).contains(Gpr::R15));
    }

    #[test]
    fn cond_flags_read() {
        assert_eq!(Cond::A.flags_read(), FlagSet::CF | FlagSet::ZF);
        assert_eq!(Cond::from_nibble(0x4), Some(Cond::E));
        assert!(Cond::from_nibble(0x10).is_none());
    }
}
