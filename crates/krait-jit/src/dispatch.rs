//! The host-call boundary between native blocks and the runtime.
//!
//! Every compiled block is an `extern "C"` function over the guest state
//! that returns the next guest address; faults come back through the
//! `fault_kind` latch in the state rather than a non-local jump. The
//! dispatcher is a plain loop: probe the fast path, fall back to the full
//! lookup-and-compile path, call the block, repeat until something needs
//! the runtime's attention.

use krait_ir::FaultKind;

use crate::state::GuestState;

/// Entry point of a placed block.
pub type BlockFn = unsafe extern "C" fn(*mut GuestState) -> u64;

/// Where the dispatcher gets blocks from.
///
/// `probe` is the inline fast path (the L1 analogue): cheap, never
/// compiles, may miss spuriously. `lookup_or_compile` is authoritative.
pub trait BlockSource {
    fn probe(&self, rip: u64) -> Option<BlockFn>;

    fn lookup_or_compile(&mut self, rip: u64) -> Option<BlockFn>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// No block could be produced for `rip`; translation failed.
    NoBlock { rip: u64 },
    /// Guest code raised a fault.
    Fault { rip: u64, kind: FaultKind },
    /// The per-run block budget ran out; guest state is consistent and the
    /// caller may re-enter.
    BudgetExhausted { rip: u64 },
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    /// Blocks executed over the dispatcher's lifetime.
    pub executed: u64,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run up to `max_blocks` blocks starting from `state.rip`.
    pub fn run<S: BlockSource>(
        &mut self,
        state: &mut GuestState,
        source: &mut S,
        max_blocks: u64,
    ) -> DispatchExit {
        for _ in 0..max_blocks {
            let rip = state.rip;
            let block = match source.probe(rip) {
                Some(block) => block,
                None => match source.lookup_or_compile(rip) {
                    Some(block) => block,
                    None => return DispatchExit::NoBlock { rip },
                },
            };
            // The contract on `BlockSource`: returned pointers are sealed,
            // relocated code compiled for this host.
            state.rip = unsafe { block(state) };
            self.executed += 1;

            if let Some((fault_rip, code)) = state.take_fault() {
                return DispatchExit::Fault {
                    rip: fault_rip,
                    kind: fault_from_code(code),
                };
            }
        }
        DispatchExit::BudgetExhausted { rip: state.rip }
    }
}

/// Wire encoding of [`FaultKind`] in `GuestState::fault_kind` (minus the
/// +1 nonzero bias).
#[must_use]
pub const fn fault_code(kind: FaultKind) -> u32 {
    match kind {
        FaultKind::InvalidOpcode => 0,
        FaultKind::Breakpoint => 1,
        FaultKind::NonExecutable => 2,
    }
}

#[must_use]
pub fn fault_from_code(code: u32) -> FaultKind {
    match code {
        0 => FaultKind::InvalidOpcode,
        1 => FaultKind::Breakpoint,
        2 => FaultKind::NonExecutable,
        other => panic!("unknown fault code {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krait_types::Gpr;
    use std::collections::HashMap;

    unsafe extern "C" fn count_and_advance(state: *mut GuestState) -> u64 {
        let state = &mut *state;
        state.gprs[Gpr::Rax.index()] += 1;
        state.rip + 0x10
    }

    unsafe extern "C" fn raise_breakpoint(state: *mut GuestState) -> u64 {
        let state = &mut *state;
        state.fault_kind = fault_code(FaultKind::Breakpoint) + 1;
        state.fault_rip = state.rip;
        state.rip
    }

    #[derive(Default)]
    struct MapSource {
        blocks: HashMap<u64, BlockFn>,
        probe_hits: u64,
        slow_lookups: u64,
    }

    impl BlockSource for MapSource {
        fn probe(&self, rip: u64) -> Option<BlockFn> {
            self.blocks.get(&rip).copied()
        }

        fn lookup_or_compile(&mut self, rip: u64) -> Option<BlockFn> {
            self.slow_lookups += 1;
            self.blocks.get(&rip).copied()
        }
    }

    #[test]
    fn runs_blocks_until_budget() {
        let mut source = MapSource::default();
        for i in 0..8u64 {
            source
                .blocks
                .insert(0x1000 + i * 0x10, count_and_advance as BlockFn);
        }
        let mut state = GuestState::new();
        state.rip = 0x1000;

        let mut dispatcher = Dispatcher::new();
        let exit = dispatcher.run(&mut state, &mut source, 4);
        assert_eq!(exit, DispatchExit::BudgetExhausted { rip: 0x1040 });
        assert_eq!(state.gpr(Gpr::Rax), 4);
        assert_eq!(dispatcher.executed, 4);
    }

    #[test]
    fn missing_block_stops_the_loop() {
        let mut source = MapSource::default();
        source.blocks.insert(0x1000, count_and_advance as BlockFn);
        let mut state = GuestState::new();
        state.rip = 0x1000;

        let exit = Dispatcher::new().run(&mut state, &mut source, 16);
        assert_eq!(exit, DispatchExit::NoBlock { rip: 0x1010 });
        assert_eq!(source.slow_lookups, 1);
    }

    #[test]
    fn fault_latch_surfaces_as_exit() {
        let mut source = MapSource::default();
        source.blocks.insert(0x2000, raise_breakpoint as BlockFn);
        let mut state = GuestState::new();
        state.rip = 0x2000;

        let exit = Dispatcher::new().run(&mut state, &mut source, 16);
        assert_eq!(
            exit,
            DispatchExit::Fault {
                rip: 0x2000,
                kind: FaultKind::Breakpoint,
            }
        );
        // The latch is consumed.
        assert_eq!(state.fault_kind, 0);
    }
}
