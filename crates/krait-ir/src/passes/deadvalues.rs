//! Unused value elimination.
//!
//! Defs always have lower ids than their users, so one sweep from the
//! highest id down catches whole dead chains: removing a user drops its
//! arguments' use counts before the sweep reaches them.

use crate::arena::{IrFunction, NodeId};
use crate::ops::IrOp;
use crate::passes::Pass;

pub struct DeadValueElimination;

impl DeadValueElimination {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for DeadValueElimination {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for DeadValueElimination {
    fn name(&self) -> &'static str {
        "dead-value-elimination"
    }

    fn run(&mut self, func: &mut IrFunction) -> bool {
        let mut removed = 0usize;
        for index in (0..func.arena.len()).rev() {
            let id = NodeId(index as u32);
            let op = func.arena.op(id);
            if matches!(op, IrOp::Tombstone) {
                continue;
            }
            if op.has_dest() && !op.has_side_effects() && func.arena.node(id).uses == 0 {
                func.arena.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::trace!(removed, "removed dead values");
        }
        removed > 0
    }
}
