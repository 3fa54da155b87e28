//! Linear node arena with positional identity.
//!
//! A [`NodeId`] is the node's slot index in the arena; converting between id
//! and node always goes through the arena (`wrap`/`unwrap` style), never
//! through stored pointers. Ids are strictly increasing in emission order,
//! so "does def precede use within a block" is `def.0 < use.0`.
//!
//! Node order within a block is an intrusive doubly linked list; removal
//! unlinks the node and tombstones its op, leaving the slot to be reclaimed
//! by the compaction pass. The op payloads live in a parallel arena
//! (`ops`), one record per node slot, mirroring the node/data split of the
//! serialized form.

use crate::ops::{Block, BlockId, IrOp};

/// Positional node reference. `NodeId::INVALID` is the list end sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const INVALID: NodeId = NodeId(u32::MAX);

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

/// Arena-resident node header: intrusive block-local order plus a use count.
#[derive(Debug, Clone)]
pub struct OrderedNode {
    pub prev: NodeId,
    pub next: NodeId,
    pub uses: u32,
}

#[derive(Debug, Clone, Default)]
pub struct IrArena {
    nodes: Vec<OrderedNode>,
    ops: Vec<IrOp>,
}

impl IrArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(cap),
            ops: Vec::with_capacity(cap),
        }
    }

    /// Number of node slots, live or tombstoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node, bumping the use count of every argument it references.
    pub fn push(&mut self, op: IrOp) -> NodeId {
        debug_assert!(self.nodes.len() < u32::MAX as usize);
        let id = NodeId(self.nodes.len() as u32);
        op.for_each_arg(|arg| {
            self.nodes[arg.index()].uses += 1;
        });
        self.nodes.push(OrderedNode {
            prev: NodeId::INVALID,
            next: NodeId::INVALID,
            uses: 0,
        });
        self.ops.push(op);
        id
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &OrderedNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut OrderedNode {
        &mut self.nodes[id.index()]
    }

    #[must_use]
    pub fn op(&self, id: NodeId) -> &IrOp {
        &self.ops[id.index()]
    }

    pub fn op_mut(&mut self, id: NodeId) -> &mut IrOp {
        &mut self.ops[id.index()]
    }

    /// Link `node` after `after` in a block's intrusive list.
    pub fn link_after(&mut self, after: NodeId, node: NodeId) {
        let next = self.nodes[after.index()].next;
        self.nodes[node.index()].prev = after;
        self.nodes[node.index()].next = next;
        self.nodes[after.index()].next = node;
        if next.is_valid() {
            self.nodes[next.index()].prev = node;
        }
    }

    /// Unlink `node` from its block and tombstone its op, releasing argument
    /// use counts. The slot itself is reclaimed by compaction.
    pub fn remove(&mut self, node: NodeId) {
        let OrderedNode { prev, next, .. } = self.nodes[node.index()].clone();
        if prev.is_valid() {
            self.nodes[prev.index()].next = next;
        }
        if next.is_valid() {
            self.nodes[next.index()].prev = prev;
        }
        self.nodes[node.index()].prev = NodeId::INVALID;
        self.nodes[node.index()].next = NodeId::INVALID;

        let op = std::mem::replace(&mut self.ops[node.index()], IrOp::Tombstone);
        op.for_each_arg(|arg| {
            let uses = &mut self.nodes[arg.index()].uses;
            debug_assert!(*uses > 0, "use count underflow removing {node:?}");
            *uses -= 1;
        });
    }

    /// Replace the op payload of `node` in place, rebalancing argument use
    /// counts. The node keeps its id and list position.
    pub fn rewrite(&mut self, node: NodeId, new_op: IrOp) {
        let old = std::mem::replace(&mut self.ops[node.index()], new_op);
        old.for_each_arg(|arg| {
            debug_assert!(self.nodes[arg.index()].uses > 0);
            self.nodes[arg.index()].uses -= 1;
        });
        let op = std::mem::replace(&mut self.ops[node.index()], IrOp::Tombstone);
        op.for_each_arg(|arg| {
            self.nodes[arg.index()].uses += 1;
        });
        self.ops[node.index()] = op;
    }

    /// Swap one argument reference on `node` (use counts stay balanced).
    pub fn replace_arg(&mut self, node: NodeId, old: NodeId, new: NodeId) {
        let mut replaced = false;
        let mut op = std::mem::replace(&mut self.ops[node.index()], IrOp::Tombstone);
        op.for_each_arg_mut(|arg| {
            if *arg == old && !replaced {
                *arg = new;
                replaced = true;
            }
        });
        self.ops[node.index()] = op;
        if replaced {
            debug_assert!(self.nodes[old.index()].uses > 0);
            self.nodes[old.index()].uses -= 1;
            self.nodes[new.index()].uses += 1;
        }
    }
}

/// A translation unit: one arena plus its block list.
///
/// Blocks form a list rooted at `entry`; block order in `blocks` is
/// emission order, which compaction also uses as layout order.
#[derive(Debug, Clone, Default)]
pub struct IrFunction {
    pub arena: IrArena,
    pub blocks: Vec<Block>,
    pub entry_rip: u64,
}

impl IrFunction {
    /// Iterate a block's ops front to back (including Begin and terminator).
    pub fn block_ops(&self, block: BlockId) -> BlockOpIter<'_> {
        BlockOpIter {
            arena: &self.arena,
            cursor: self.blocks[block.index()].begin,
        }
    }

    /// Total live (non-tombstoned) nodes.
    #[must_use]
    pub fn live_nodes(&self) -> usize {
        self.arena
            .ops
            .iter()
            .filter(|op| !matches!(op, IrOp::Tombstone))
            .count()
    }

    #[must_use]
    pub fn block_of_rip(&self, rip: u64) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|b| b.entry_rip == rip)
            .map(|b| b.id)
    }
}

pub struct BlockOpIter<'a> {
    arena: &'a IrArena,
    cursor: NodeId,
}

impl Iterator for BlockOpIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if !self.cursor.is_valid() {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.arena.node(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::BinOp;
    use krait_types::{FlagSet, Width};

    #[test]
    fn push_tracks_use_counts() {
        let mut arena = IrArena::new();
        let a = arena.push(IrOp::Const { value: 1 });
        let b = arena.push(IrOp::Const { value: 2 });
        let sum = arena.push(IrOp::BinOp {
            op: BinOp::Add,
            lhs: a,
            rhs: b,
            width: Width::W64,
            flags: FlagSet::EMPTY,
        });
        assert_eq!(arena.node(a).uses, 1);
        assert_eq!(arena.node(b).uses, 1);
        assert_eq!(arena.node(sum).uses, 0);

        arena.remove(sum);
        assert_eq!(arena.node(a).uses, 0);
        assert!(matches!(arena.op(sum), IrOp::Tombstone));
    }

    #[test]
    fn link_and_remove_preserve_list() {
        let mut arena = IrArena::new();
        let a = arena.push(IrOp::Const { value: 1 });
        let b = arena.push(IrOp::Const { value: 2 });
        let c = arena.push(IrOp::Const { value: 3 });
        arena.link_after(a, b);
        arena.link_after(b, c);

        arena.remove(b);
        assert_eq!(arena.node(a).next, c);
        assert_eq!(arena.node(c).prev, a);
    }

    #[test]
    fn node_ids_are_ordered() {
        let mut arena = IrArena::new();
        let a = arena.push(IrOp::Const { value: 1 });
        let b = arena.push(IrOp::Const { value: 2 });
        assert!(a < b);
    }
}
