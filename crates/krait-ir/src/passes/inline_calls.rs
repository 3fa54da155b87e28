//! Inline-call optimization for runtime helper calls.
//!
//! Syscalls with a constant selector get their argument list trimmed to
//! what the Linux x86-64 ABI actually passes for that number, and safe
//! numbers are flagged for passthrough so the backend can issue the host
//! `syscall` instruction directly instead of calling into the runtime.
//!
//! CPUID reads with a constant leaf fold to constants from the host id
//! table; the id table is deterministic, so the fold is exact.

use crate::arena::{IrFunction, NodeId};
use crate::ops::{CpuIdHalf, IrOp};
use crate::passes::Pass;

/// Per-syscall inlining facts: value argument count and whether the call
/// can bypass the runtime helper entirely.
#[derive(Debug, Clone, Copy)]
struct SyscallInfo {
    args: u8,
    passthrough: bool,
}

/// Linux x86-64 syscall numbers the optimizer knows about. Numbers that
/// touch the address space, signals, or threads must keep going through the
/// runtime so its bookkeeping stays coherent.
fn syscall_info(nr: u64) -> Option<SyscallInfo> {
    let (args, passthrough) = match nr {
        0 => (3, true),    // read
        1 => (3, true),    // write
        2 => (3, true),    // open
        3 => (1, true),    // close
        4 => (2, true),    // stat
        5 => (2, true),    // fstat
        8 => (3, true),    // lseek
        9 => (6, false),   // mmap
        10 => (3, false),  // mprotect
        11 => (2, false),  // munmap
        12 => (1, false),  // brk
        13 => (4, false),  // rt_sigaction
        14 => (4, false),  // rt_sigprocmask
        16 => (3, true),   // ioctl
        20 => (3, true),   // writev
        39 => (0, true),   // getpid
        56 => (5, false),  // clone
        60 => (1, false),  // exit
        96 => (2, true),   // gettimeofday
        102 => (0, true),  // getuid
        186 => (0, true),  // gettid
        201 => (1, true),  // time
        228 => (2, true),  // clock_gettime
        231 => (1, false), // exit_group
        318 => (3, true),  // getrandom
        _ => return None,
    };
    Some(SyscallInfo { args, passthrough })
}

/// Deterministic CPUID answers, packed `(low_reg, high_reg)` per half.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuIdTable;

impl CpuIdTable {
    /// `(eax, ebx, ecx, edx)` for `leaf`. Unknown leaves read as zero.
    #[must_use]
    pub fn query(self, leaf: u32) -> (u32, u32, u32, u32) {
        match leaf {
            // Highest basic leaf plus the vendor string.
            0x0 => (0x1, 0x756e_6547, 0x6c65_746e, 0x4965_6e69),
            // Family/model/stepping and baseline feature bits: FPU, TSC,
            // CMOV, CLFLUSH, MMX, FXSR, SSE, SSE2 in edx; SSE3/SSSE3/
            // SSE4.1/SSE4.2/POPCNT/XSAVE in ecx.
            0x1 => (0x0006_06a0, 0x0000_0800, 0x0098_0201, 0x0787_8010),
            _ => (0, 0, 0, 0),
        }
    }

    /// The packed form the `CpuId` op produces.
    #[must_use]
    pub fn packed(self, leaf: u32, half: CpuIdHalf) -> u64 {
        let (eax, ebx, ecx, edx) = self.query(leaf);
        match half {
            CpuIdHalf::EaxEbx => (eax as u64) | ((ebx as u64) << 32),
            CpuIdHalf::EcxEdx => (ecx as u64) | ((edx as u64) << 32),
        }
    }
}

pub struct InlineCallOptimization {
    cpuid: CpuIdTable,
}

impl InlineCallOptimization {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cpuid: CpuIdTable,
        }
    }

    fn const_value(func: &IrFunction, id: NodeId) -> Option<u64> {
        match func.arena.op(id) {
            IrOp::Const { value } => Some(*value),
            _ => None,
        }
    }
}

impl Default for InlineCallOptimization {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for InlineCallOptimization {
    fn name(&self) -> &'static str {
        "inline-call-optimization"
    }

    fn run(&mut self, func: &mut IrFunction) -> bool {
        let mut changed = false;
        for index in 0..func.arena.len() {
            let id = NodeId(index as u32);
            match func.arena.op(id).clone() {
                IrOp::Syscall {
                    selector,
                    args,
                    arg_count,
                    passthrough,
                } => {
                    let Some(nr) = Self::const_value(func, selector) else {
                        continue;
                    };
                    let Some(info) = syscall_info(nr) else {
                        continue;
                    };
                    if info.args < arg_count || (info.passthrough && !passthrough) {
                        let mut new_args = [NodeId::INVALID; crate::ops::MAX_SYSCALL_ARGS];
                        new_args[..info.args as usize]
                            .copy_from_slice(&args[..info.args as usize]);
                        func.arena.rewrite(
                            id,
                            IrOp::Syscall {
                                selector,
                                args: new_args,
                                arg_count: info.args.min(arg_count),
                                passthrough: info.passthrough,
                            },
                        );
                        changed = true;
                        tracing::trace!(nr, args = info.args, passthrough = info.passthrough,
                            "trimmed syscall");
                    }
                }
                IrOp::CpuId { leaf, half } => {
                    let Some(leaf) = Self::const_value(func, leaf) else {
                        continue;
                    };
                    let value = self.cpuid.packed(leaf as u32, half);
                    func.arena.rewrite(id, IrOp::Const { value });
                    changed = true;
                }
                _ => {}
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::MAX_SYSCALL_ARGS;

    #[test]
    fn write_syscall_is_trimmed_and_marked_passthrough() {
        let mut func = IrFunction::default();
        let selector = func.arena.push(IrOp::Const { value: 1 });
        let mut args = [NodeId::INVALID; MAX_SYSCALL_ARGS];
        for slot in &mut args {
            *slot = func.arena.push(IrOp::Const { value: 0 });
        }
        let call = func.arena.push(IrOp::Syscall {
            selector,
            args,
            arg_count: 6,
            passthrough: false,
        });

        assert!(InlineCallOptimization::new().run(&mut func));
        match func.arena.op(call) {
            IrOp::Syscall {
                arg_count,
                passthrough,
                ..
            } => {
                assert_eq!(*arg_count, 3);
                assert!(passthrough);
            }
            other => panic!("unexpected op {other:?}"),
        }
        // The dropped argument loads are no longer referenced.
        assert_eq!(func.arena.node(args[5]).uses, 0);
        assert_eq!(func.arena.node(args[0]).uses, 1);
    }

    #[test]
    fn mmap_is_never_passthrough() {
        let mut func = IrFunction::default();
        let selector = func.arena.push(IrOp::Const { value: 9 });
        let args = [func.arena.push(IrOp::Const { value: 0 }); MAX_SYSCALL_ARGS];
        let call = func.arena.push(IrOp::Syscall {
            selector,
            args,
            arg_count: 6,
            passthrough: false,
        });

        InlineCallOptimization::new().run(&mut func);
        assert!(matches!(
            func.arena.op(call),
            IrOp::Syscall {
                passthrough: false,
                ..
            }
        ));
    }

    #[test]
    fn unknown_selector_is_untouched() {
        let mut func = IrFunction::default();
        let selector = func.arena.push(IrOp::Const { value: 9999 });
        let args = [selector; MAX_SYSCALL_ARGS];
        let call = func.arena.push(IrOp::Syscall {
            selector,
            args,
            arg_count: 6,
            passthrough: false,
        });

        assert!(!InlineCallOptimization::new().run(&mut func));
        assert!(matches!(
            func.arena.op(call),
            IrOp::Syscall { arg_count: 6, .. }
        ));
    }

    #[test]
    fn constant_leaf_cpuid_folds_to_vendor_string() {
        let mut func = IrFunction::default();
        let leaf = func.arena.push(IrOp::Const { value: 0 });
        let lo = func.arena.push(IrOp::CpuId {
            leaf,
            half: CpuIdHalf::EaxEbx,
        });

        assert!(InlineCallOptimization::new().run(&mut func));
        match func.arena.op(lo) {
            IrOp::Const { value } => {
                // ebx half spells "Genu".
                assert_eq!((value >> 32) as u32, 0x756e_6547);
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(func.arena.node(leaf).uses, 0);
    }

    #[test]
    fn dynamic_leaf_cpuid_is_kept() {
        let mut func = IrFunction::default();
        let leaf = func.arena.push(IrOp::LoadGpr {
            reg: krait_types::Gpr::Rax,
        });
        let call = func.arena.push(IrOp::CpuId {
            leaf,
            half: CpuIdHalf::EcxEdx,
        });

        assert!(!InlineCallOptimization::new().run(&mut func));
        assert!(matches!(func.arena.op(call), IrOp::CpuId { .. }));
    }
}
