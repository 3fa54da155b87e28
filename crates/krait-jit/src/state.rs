//! The guest CPU state block shared between generated code and the runtime.
//!
//! Layout is `repr(C)` and addressed by constant offsets from the state
//! pointer the backends keep pinned in a reserved host register. Field order
//! is part of the generated-code ABI; the layout tests below keep the
//! offsets and the struct honest with each other.

use krait_types::{Flag, Fpr, Gpr};

pub const HELPER_ARG_SLOTS: usize = 8;

/// Guest-visible CPU state plus the runtime's per-exit scratch fields.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct GuestState {
    /// Guest general-purpose registers, indexed by [`Gpr`].
    pub gprs: [u64; 16],
    /// Guest instruction pointer; maintained by the dispatcher between
    /// blocks, not by generated code.
    pub rip: u64,
    /// One byte per status flag, 0 or 1, indexed by [`Flag::index`].
    pub flags: [u8; 8],
    /// Nonzero when the last block raised a guest fault (kind + 1).
    pub fault_kind: u32,
    _pad: u32,
    /// Guest address of the faulting instruction when `fault_kind != 0`.
    pub fault_rip: u64,
    /// Argument scratch for runtime helper calls (selector + values).
    pub helper_args: [u64; HELPER_ARG_SLOTS],
    /// Guest vector registers, 128 bits each.
    pub fprs: [[u64; 2]; 16],
}

impl GuestState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            gprs: [0; 16],
            rip: 0,
            flags: [0; 8],
            fault_kind: 0,
            _pad: 0,
            fault_rip: 0,
            helper_args: [0; HELPER_ARG_SLOTS],
            fprs: [[0; 2]; 16],
        }
    }

    #[must_use]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gprs[reg.index()]
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.gprs[reg.index()] = value;
    }

    #[must_use]
    pub fn flag(&self, flag: Flag) -> bool {
        self.flags[flag.index()] != 0
    }

    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        self.flags[flag.index()] = value as u8;
    }

    #[must_use]
    pub fn fpr(&self, reg: Fpr) -> [u64; 2] {
        self.fprs[reg.index()]
    }

    pub fn take_fault(&mut self) -> Option<(u64, u32)> {
        if self.fault_kind == 0 {
            return None;
        }
        let fault = (self.fault_rip, self.fault_kind - 1);
        self.fault_kind = 0;
        Some(fault)
    }
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}

// Offsets baked into generated code.
pub const OFF_GPRS: usize = 0;
pub const OFF_RIP: usize = 128;
pub const OFF_FLAGS: usize = 136;
pub const OFF_FAULT_KIND: usize = 144;
pub const OFF_FAULT_RIP: usize = 152;
pub const OFF_HELPER_ARGS: usize = 160;
pub const OFF_FPRS: usize = 224;

#[must_use]
pub const fn gpr_offset(reg: Gpr) -> usize {
    OFF_GPRS + (reg as usize) * 8
}

#[must_use]
pub const fn flag_offset(flag: Flag) -> usize {
    OFF_FLAGS + flag.index()
}

#[must_use]
pub const fn fpr_offset(reg: u8) -> usize {
    OFF_FPRS + (reg as usize) * 16
}

#[must_use]
pub const fn helper_arg_offset(slot: usize) -> usize {
    OFF_HELPER_ARGS + slot * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn baked_offsets_match_struct_layout() {
        assert_eq!(offset_of!(GuestState, gprs), OFF_GPRS);
        assert_eq!(offset_of!(GuestState, rip), OFF_RIP);
        assert_eq!(offset_of!(GuestState, flags), OFF_FLAGS);
        assert_eq!(offset_of!(GuestState, fault_kind), OFF_FAULT_KIND);
        assert_eq!(offset_of!(GuestState, fault_rip), OFF_FAULT_RIP);
        assert_eq!(offset_of!(GuestState, helper_args), OFF_HELPER_ARGS);
        assert_eq!(offset_of!(GuestState, fprs), OFF_FPRS);
    }

    #[test]
    fn gpr_and_flag_offsets_are_dense() {
        assert_eq!(gpr_offset(Gpr::Rax), 0);
        assert_eq!(gpr_offset(Gpr::R15), 120);
        assert_eq!(flag_offset(Flag::Cf), OFF_FLAGS);
        assert_eq!(flag_offset(Flag::Of), OFF_FLAGS + 5);
        assert_eq!(fpr_offset(15), OFF_FPRS + 240);
    }

    #[test]
    fn take_fault_clears_the_latch() {
        let mut state = GuestState::new();
        state.fault_kind = 2;
        state.fault_rip = 0x1234;
        assert_eq!(state.take_fault(), Some((0x1234, 1)));
        assert_eq!(state.take_fault(), None);
    }
}
