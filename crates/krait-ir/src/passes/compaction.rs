//! Arena compaction.
//!
//! Earlier passes tombstone slots instead of shifting ids around; this pass
//! rebuilds the function into a fresh arena in block layout order, dropping
//! every tombstone and renumbering nodes densely. Register allocation runs
//! right after and depends on the dense, layout-ordered ids for its live
//! intervals.

use crate::arena::{IrArena, IrFunction, NodeId};
use crate::ops::Block;
use crate::passes::Pass;

pub struct IrCompaction;

impl IrCompaction {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for IrCompaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for IrCompaction {
    fn name(&self) -> &'static str {
        "ir-compaction"
    }

    fn run(&mut self, func: &mut IrFunction) -> bool {
        let old_len = func.arena.len();
        let live = func.live_nodes();
        let mut arena = IrArena::with_capacity(live);
        let mut remap: Vec<NodeId> = vec![NodeId::INVALID; old_len];
        let mut blocks: Vec<Block> = Vec::with_capacity(func.blocks.len());

        for block in &func.blocks {
            let mut begin = NodeId::INVALID;
            let mut cursor = NodeId::INVALID;
            for old_id in func.block_ops(block.id) {
                let mut op = func.arena.op(old_id).clone();
                op.for_each_arg_mut(|arg| {
                    let new = remap[arg.index()];
                    debug_assert!(new.is_valid(), "arg defined after use during compaction");
                    *arg = new;
                });
                let new_id = arena.push(op);
                remap[old_id.index()] = new_id;
                if cursor.is_valid() {
                    arena.link_after(cursor, new_id);
                } else {
                    begin = new_id;
                }
                cursor = new_id;
            }
            blocks.push(Block {
                id: block.id,
                entry_rip: block.entry_rip,
                begin,
                end: cursor,
                succs: block.succs.clone(),
            });
        }

        debug_assert!(arena.len() <= old_len, "compaction grew the arena");
        debug_assert_eq!(arena.len(), live, "compaction dropped a live node");

        let shrunk = arena.len() < old_len;
        func.arena = arena;
        func.blocks = blocks;
        shrunk
    }
}
