//! Cross-block dead store elimination for guest context writes.
//!
//! Three phases:
//!  1. summarize each block: which registers/flags it reads before writing
//!     and which it fully overwrites;
//!  2. a bounded backward dataflow over the block graph computes the kill
//!     set of each block: state that every successor path overwrites before
//!     reading;
//!  3. a backward walk through each block deletes stores that are dead
//!     locally or via the kill set, and strips dead flag production from ALU
//!     ops.
//!
//! The emitter widens every partial-width register write to a full 64-bit
//! store, so whole-register tracking here is exact. Dynamic context accesses
//! and syscalls are barriers: they conservatively read the whole register
//! file.

use krait_types::{FlagSet, FprMask, GprMask};

use crate::arena::IrFunction;
use crate::ops::IrOp;
use crate::passes::Pass;

/// Rounds of the inter-block kill dataflow. Regions are bounded (a few dozen
/// blocks), so a small constant converges in practice; leftover imprecision
/// only costs optimization, never correctness.
const DATAFLOW_ROUNDS: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
struct BlockSummary {
    /// Read before any write in this block (live-in).
    gpr_read: GprMask,
    fpr_read: FprMask,
    flag_read: FlagSet,
    /// Fully overwritten somewhere in this block.
    gpr_write: GprMask,
    fpr_write: FprMask,
    flag_write: FlagSet,
}

#[derive(Debug, Clone, Copy, Default)]
struct KillSet {
    gpr: GprMask,
    fpr: FprMask,
    flags: FlagSet,
}

pub struct DeadStoreElimination {
    summaries: Vec<BlockSummary>,
    kills: Vec<KillSet>,
}

impl DeadStoreElimination {
    #[must_use]
    pub fn new() -> Self {
        Self {
            summaries: Vec::new(),
            kills: Vec::new(),
        }
    }

    fn summarize(&mut self, func: &IrFunction) {
        self.summaries.clear();
        for block in &func.blocks {
            let mut summary = BlockSummary::default();
            let mut written = GprMask::EMPTY;
            let mut fpr_written = FprMask::EMPTY;
            let mut flags_written = FlagSet::EMPTY;

            for id in func.block_ops(block.id) {
                match func.arena.op(id) {
                    IrOp::LoadGpr { reg } => {
                        if !written.contains(*reg) {
                            summary.gpr_read = summary.gpr_read.insert(*reg);
                        }
                    }
                    IrOp::StoreGpr { reg, .. } => {
                        written = written.insert(*reg);
                        summary.gpr_write = summary.gpr_write.insert(*reg);
                    }
                    IrOp::LoadFpr { reg } => {
                        if !fpr_written.contains(*reg) {
                            summary.fpr_read = summary.fpr_read.insert(*reg);
                        }
                    }
                    IrOp::StoreFpr { reg, .. } => {
                        fpr_written = fpr_written.insert(*reg);
                        summary.fpr_write = summary.fpr_write.insert(*reg);
                    }
                    IrOp::LoadFlag { flag } => {
                        let read = FlagSet::from_flag(*flag);
                        summary.flag_read |= read.difference(flags_written);
                    }
                    IrOp::EvalCond { cond } => {
                        summary.flag_read |= cond.flags_read().difference(flags_written);
                    }
                    IrOp::StoreFlag { flag, .. } => {
                        flags_written |= FlagSet::from_flag(*flag);
                        summary.flag_write |= FlagSet::from_flag(*flag);
                    }
                    IrOp::BinOp { flags, .. }
                    | IrOp::CmpFlags { flags, .. }
                    | IrOp::TestFlags { flags, .. } => {
                        flags_written |= *flags;
                        summary.flag_write |= *flags;
                    }
                    op if is_barrier(op) => {
                        // Everything not yet overwritten is observed.
                        summary.gpr_read = summary.gpr_read.union(GprMask::ALL.difference(written));
                        summary.fpr_read = summary
                            .fpr_read
                            .union(FprMask::ALL.difference(fpr_written));
                        summary.flag_read |= FlagSet::ARITH.difference(flags_written);
                    }
                    _ => {}
                }
            }
            self.summaries.push(summary);
        }
    }

    /// kill(b) = ∩ over successors s of (write(s) ∪ kill(s)) \ read(s).
    /// Blocks that leave translated code keep everything live.
    fn compute_kills(&mut self, func: &IrFunction) {
        self.kills.clear();
        self.kills.resize(func.blocks.len(), KillSet::default());

        for _ in 0..DATAFLOW_ROUNDS {
            let mut changed = false;
            // Reverse order converges faster: successors have higher indices
            // for forward branches.
            for index in (0..func.blocks.len()).rev() {
                let block = &func.blocks[index];
                if block.succs.is_empty() {
                    continue;
                }
                let mut gpr = GprMask::ALL;
                let mut fpr = FprMask::ALL;
                let mut flags = FlagSet::ARITH;
                for succ in &block.succs {
                    let s = succ.index();
                    let summary = &self.summaries[s];
                    let kill = &self.kills[s];
                    gpr = gpr.intersect(
                        summary
                            .gpr_write
                            .union(kill.gpr)
                            .difference(summary.gpr_read),
                    );
                    fpr = fpr.intersect(
                        summary
                            .fpr_write
                            .union(kill.fpr)
                            .difference(summary.fpr_read),
                    );
                    flags &= (summary.flag_write | kill.flags).difference(summary.flag_read);
                }
                let entry = &mut self.kills[index];
                if entry.gpr != gpr || entry.fpr != fpr || entry.flags != flags {
                    *entry = KillSet { gpr, fpr, flags };
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn sweep(&self, func: &mut IrFunction) -> bool {
        let mut changed = false;
        for index in 0..func.blocks.len() {
            let block = &func.blocks[index];
            let kill = self.kills[index];
            let mut dead_gpr = kill.gpr;
            let mut dead_fpr = kill.fpr;
            let mut dead_flags = kill.flags;

            // Walk backwards so a store's deadness is decided by what comes
            // after it.
            let ids: Vec<_> = func.block_ops(block.id).collect();
            for &id in ids.iter().rev() {
                match func.arena.op(id).clone() {
                    IrOp::StoreGpr { reg, .. } => {
                        if dead_gpr.contains(reg) {
                            func.arena.remove(id);
                            changed = true;
                        } else {
                            dead_gpr = dead_gpr.insert(reg);
                        }
                    }
                    IrOp::LoadGpr { reg } => {
                        dead_gpr = dead_gpr.difference(GprMask::EMPTY.insert(reg));
                    }
                    IrOp::StoreFpr { reg, .. } => {
                        if dead_fpr.contains(reg) {
                            func.arena.remove(id);
                            changed = true;
                        } else {
                            dead_fpr = dead_fpr.insert(reg);
                        }
                    }
                    IrOp::LoadFpr { reg } => {
                        dead_fpr = dead_fpr.difference(FprMask::EMPTY.insert(reg));
                    }
                    IrOp::StoreFlag { flag, .. } => {
                        let written = FlagSet::from_flag(flag);
                        if dead_flags.contains(written) {
                            func.arena.remove(id);
                            changed = true;
                        } else {
                            dead_flags |= written;
                        }
                    }
                    IrOp::LoadFlag { flag } => {
                        dead_flags.remove(FlagSet::from_flag(flag));
                    }
                    IrOp::EvalCond { cond } => {
                        dead_flags.remove(cond.flags_read());
                    }
                    IrOp::BinOp { flags, .. } if !flags.is_empty() => {
                        let live = flags.difference(dead_flags);
                        if live != flags {
                            if let IrOp::BinOp { flags, .. } = func.arena.op_mut(id) {
                                *flags = live;
                            }
                            changed = true;
                        }
                        dead_flags |= flags;
                    }
                    IrOp::CmpFlags { flags, .. } | IrOp::TestFlags { flags, .. } => {
                        let live = flags.difference(dead_flags);
                        if live.is_empty() {
                            func.arena.remove(id);
                            changed = true;
                        } else {
                            if live != flags {
                                match func.arena.op_mut(id) {
                                    IrOp::CmpFlags { flags, .. }
                                    | IrOp::TestFlags { flags, .. } => *flags = live,
                                    _ => {}
                                }
                                changed = true;
                            }
                            dead_flags |= flags;
                        }
                    }
                    op if is_barrier(&op) => {
                        dead_gpr = GprMask::EMPTY;
                        dead_fpr = FprMask::EMPTY;
                        dead_flags = FlagSet::EMPTY;
                    }
                    _ => {}
                }
            }
        }
        changed
    }
}

impl Default for DeadStoreElimination {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for DeadStoreElimination {
    fn name(&self) -> &'static str {
        "dead-store-elimination"
    }

    fn run(&mut self, func: &mut IrFunction) -> bool {
        self.summarize(func);
        self.compute_kills(func);
        self.sweep(func)
    }
}

/// Ops whose runtime helper may observe arbitrary guest state.
fn is_barrier(op: &IrOp) -> bool {
    matches!(
        op,
        IrOp::Syscall { .. } | IrOp::LoadGprIndexed { .. } | IrOp::StoreGprIndexed { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{BinOp, Block, BlockId, FaultKind};
    use krait_types::{Cond, Fpr, Gpr, Width};

    /// Append a block of `ops` to `func`, wiring the intrusive list.
    fn push_block(func: &mut IrFunction, ops: Vec<IrOp>) -> BlockId {
        let id = BlockId(func.blocks.len() as u32);
        let begin = func.arena.push(IrOp::BlockBegin { block: id });
        let mut cursor = begin;
        for op in ops {
            let node = func.arena.push(op);
            func.arena.link_after(cursor, node);
            cursor = node;
        }
        func.blocks.push(Block {
            id,
            entry_rip: 0x1000 + id.0 as u64 * 0x10,
            begin,
            end: cursor,
            succs: Vec::new(),
        });
        id
    }

    fn count_stores(func: &IrFunction, block: BlockId, reg: Gpr) -> usize {
        func.block_ops(block)
            .filter(|&id| matches!(func.arena.op(id), IrOp::StoreGpr { reg: r, .. } if *r == reg))
            .count()
    }

    #[test]
    fn overwritten_store_in_same_block_is_removed() {
        let mut func = IrFunction::default();
        let a = func.arena.push(IrOp::Const { value: 1 });
        let b = func.arena.push(IrOp::Const { value: 2 });
        let block = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rax, src: a },
                IrOp::StoreGpr { reg: Gpr::Rax, src: b },
                IrOp::ExitFunction { next_rip: b },
            ],
        );

        assert!(DeadStoreElimination::new().run(&mut func));
        assert_eq!(count_stores(&func, block, Gpr::Rax), 1);
    }

    #[test]
    fn final_store_survives_function_exit() {
        let mut func = IrFunction::default();
        let a = func.arena.push(IrOp::Const { value: 1 });
        let block = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rax, src: a },
                IrOp::ExitFunction { next_rip: a },
            ],
        );

        DeadStoreElimination::new().run(&mut func);
        assert_eq!(count_stores(&func, block, Gpr::Rax), 1);
    }

    #[test]
    fn store_dead_across_all_successors_is_removed() {
        let mut func = IrFunction::default();
        let v = func.arena.push(IrOp::Const { value: 7 });

        // Successor blocks both overwrite rcx before reading it.
        let left = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rcx, src: v },
                IrOp::ExitFunction { next_rip: v },
            ],
        );
        let right = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rcx, src: v },
                IrOp::ExitFunction { next_rip: v },
            ],
        );
        let cond = func.arena.push(IrOp::EvalCond { cond: Cond::E });
        let entry = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rcx, src: v },
                IrOp::CondJump {
                    cond,
                    if_true: left,
                    if_false: right,
                },
            ],
        );
        func.blocks[entry.index()].succs = vec![left, right];

        assert!(DeadStoreElimination::new().run(&mut func));
        assert_eq!(count_stores(&func, entry, Gpr::Rcx), 0);
        assert_eq!(count_stores(&func, left, Gpr::Rcx), 1);
    }

    #[test]
    fn store_read_by_one_successor_survives() {
        let mut func = IrFunction::default();
        let v = func.arena.push(IrOp::Const { value: 7 });

        let reads = push_block(
            &mut func,
            vec![
                IrOp::LoadGpr { reg: Gpr::Rcx },
                IrOp::ExitFunction { next_rip: v },
            ],
        );
        let writes = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rcx, src: v },
                IrOp::ExitFunction { next_rip: v },
            ],
        );
        let cond = func.arena.push(IrOp::EvalCond { cond: Cond::E });
        let entry = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rcx, src: v },
                IrOp::CondJump {
                    cond,
                    if_true: reads,
                    if_false: writes,
                },
            ],
        );
        func.blocks[entry.index()].succs = vec![reads, writes];

        DeadStoreElimination::new().run(&mut func);
        assert_eq!(count_stores(&func, entry, Gpr::Rcx), 1);
    }

    #[test]
    fn overwritten_vector_store_is_removed() {
        let mut func = IrFunction::default();
        let addr = func.arena.push(IrOp::Const { value: 0x2000 });
        let block = push_block(
            &mut func,
            vec![
                IrOp::LoadMem {
                    addr,
                    width: Width::W128,
                },
                IrOp::ExitFunction { next_rip: addr },
            ],
        );
        // Insert two back-to-back xmm0 stores of the loaded value.
        let loaded = func.block_ops(block).nth(1).expect("load node");
        let first = func.arena.push(IrOp::StoreFpr {
            reg: Fpr(0),
            src: loaded,
        });
        let second = func.arena.push(IrOp::StoreFpr {
            reg: Fpr(0),
            src: loaded,
        });
        func.arena.link_after(loaded, first);
        func.arena.link_after(first, second);

        assert!(DeadStoreElimination::new().run(&mut func));
        let fpr_stores = func
            .block_ops(block)
            .filter(|&id| matches!(func.arena.op(id), IrOp::StoreFpr { .. }))
            .count();
        assert_eq!(fpr_stores, 1);
    }

    #[test]
    fn cmp_with_fully_overwritten_flags_is_removed() {
        let mut func = IrFunction::default();
        let a = func.arena.push(IrOp::Const { value: 1 });
        let b = func.arena.push(IrOp::Const { value: 2 });
        let block = push_block(
            &mut func,
            vec![
                IrOp::CmpFlags {
                    lhs: a,
                    rhs: b,
                    width: Width::W64,
                    flags: FlagSet::ARITH,
                },
                // A later add rewrites every arithmetic flag before any read.
                IrOp::BinOp {
                    op: BinOp::Add,
                    lhs: a,
                    rhs: b,
                    width: Width::W64,
                    flags: FlagSet::ARITH,
                },
                IrOp::ExitFunction { next_rip: a },
            ],
        );

        assert!(DeadStoreElimination::new().run(&mut func));
        assert!(!func
            .block_ops(block)
            .any(|id| matches!(func.arena.op(id), IrOp::CmpFlags { .. })));
    }

    #[test]
    fn syscall_keeps_earlier_stores_alive() {
        let mut func = IrFunction::default();
        let v = func.arena.push(IrOp::Const { value: 60 });
        let block = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rdi, src: v },
                IrOp::Syscall {
                    selector: v,
                    args: [v; 6],
                    arg_count: 0,
                    passthrough: false,
                },
                IrOp::StoreGpr { reg: Gpr::Rdi, src: v },
                IrOp::ExitFunction { next_rip: v },
            ],
        );

        DeadStoreElimination::new().run(&mut func);
        assert_eq!(count_stores(&func, block, Gpr::Rdi), 2);
    }

    #[test]
    fn indexed_access_keeps_earlier_stores_alive() {
        let mut func = IrFunction::default();
        let v = func.arena.push(IrOp::Const { value: 9 });
        // The runtime index may name any register, so the otherwise
        // overwritten store must survive the indexed read.
        let block = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rbx, src: v },
                IrOp::LoadGprIndexed { index: v },
                IrOp::StoreGpr { reg: Gpr::Rbx, src: v },
                IrOp::ExitFunction { next_rip: v },
            ],
        );

        DeadStoreElimination::new().run(&mut func);
        assert_eq!(count_stores(&func, block, Gpr::Rbx), 2);
    }

    #[test]
    fn fault_terminator_keeps_state_live() {
        let mut func = IrFunction::default();
        let v = func.arena.push(IrOp::Const { value: 1 });
        let block = push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rax, src: v },
                IrOp::GuestFault {
                    rip: 0x1000,
                    kind: FaultKind::Breakpoint,
                },
            ],
        );

        DeadStoreElimination::new().run(&mut func);
        assert_eq!(count_stores(&func, block, Gpr::Rax), 1);
    }
}
