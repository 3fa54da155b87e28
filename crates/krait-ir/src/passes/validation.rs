//! IR structural validation.
//!
//! Checks that every value use is dominated by its definition and that every
//! block is properly terminated. Violations are collected and reported, not
//! fatal: the pass manager logs them and debug builds assert, but a release
//! runtime keeps going with the unoptimized-but-correct IR it has.

use std::collections::HashMap;

use crate::arena::{IrFunction, NodeId};
use crate::ops::BlockId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `user` consumed `def` without the definition dominating it.
    UseBeforeDef {
        block: BlockId,
        user: NodeId,
        def: NodeId,
    },
    /// The block's last op is not a terminator.
    MissingTerminator { block: BlockId },
    /// A terminator appeared before the end of the block.
    EarlyTerminator { block: BlockId, node: NodeId },
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Validate `func`, returning every violation found.
#[must_use]
pub fn validate(func: &IrFunction) -> ValidationReport {
    let mut report = ValidationReport::default();
    if func.blocks.is_empty() {
        return report;
    }

    let doms = dominators(func);

    // Map every linked node to its block.
    let mut home: HashMap<NodeId, BlockId> = HashMap::new();
    for block in &func.blocks {
        for id in func.block_ops(block.id) {
            home.insert(id, block.id);
        }
    }

    for block in &func.blocks {
        let mut seen: Vec<NodeId> = Vec::new();
        let mut terminated = false;
        for id in func.block_ops(block.id) {
            let op = func.arena.op(id);
            if terminated {
                report.violations.push(Violation::EarlyTerminator {
                    block: block.id,
                    node: seen.last().copied().unwrap_or(id),
                });
                terminated = false;
            }
            op.for_each_arg(|def| {
                let dominated = if seen.contains(&def) {
                    true
                } else {
                    match home.get(&def) {
                        Some(&def_block) if def_block != block.id => {
                            doms[block.id.index()].contains(&def_block)
                        }
                        _ => false,
                    }
                };
                if !dominated {
                    report.violations.push(Violation::UseBeforeDef {
                        block: block.id,
                        user: id,
                        def,
                    });
                }
            });
            if op.is_terminator() {
                terminated = true;
            }
            seen.push(id);
        }
        if !terminated {
            report
                .violations
                .push(Violation::MissingTerminator { block: block.id });
        }
    }

    report
}

/// Iterative dominator sets over the block graph. Region graphs are small
/// (bounded by discovery ceilings), so plain sets are fine.
fn dominators(func: &IrFunction) -> Vec<Vec<BlockId>> {
    let n = func.blocks.len();
    let all: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();

    let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); n];
    for block in &func.blocks {
        for succ in &block.succs {
            preds[succ.index()].push(block.id);
        }
    }

    let entry = func.blocks[0].id;
    let mut doms: Vec<Vec<BlockId>> = vec![all.clone(); n];
    doms[entry.index()] = vec![entry];

    let mut changed = true;
    while changed {
        changed = false;
        for block in &func.blocks {
            if block.id == entry {
                continue;
            }
            let mut new: Option<Vec<BlockId>> = None;
            for pred in &preds[block.id.index()] {
                let pred_doms = &doms[pred.index()];
                new = Some(match new {
                    None => pred_doms.clone(),
                    Some(cur) => cur
                        .into_iter()
                        .filter(|d| pred_doms.contains(d))
                        .collect(),
                });
            }
            let mut new = new.unwrap_or_else(|| all.clone());
            if !new.contains(&block.id) {
                new.push(block.id);
            }
            new.sort_unstable();
            if new != doms[block.id.index()] {
                doms[block.id.index()] = new;
                changed = true;
            }
        }
    }
    doms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Block, IrOp};
    use krait_types::{Cond, Gpr};

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
            entry_rip: 0x1000,
            begin,
            end: cursor,
            succs: Vec::new(),
        });
        id
    }

    #[test]
    fn well_formed_function_is_clean() {
        let mut func = IrFunction::default();
        let v = func.arena.push(IrOp::Const { value: 1 });
        push_block(
            &mut func,
            vec![
                IrOp::StoreGpr { reg: Gpr::Rax, src: v },
                IrOp::ExitFunction { next_rip: v },
            ],
        );
        // The const needs to live inside the block for dominance.
        let begin = func.blocks[0].begin;
        func.arena.link_after(begin, v);

        assert!(validate(&func).is_clean());
    }

    #[test]
    fn missing_terminator_is_reported() {
        let mut func = IrFunction::default();
        push_block(&mut func, vec![IrOp::Const { value: 1 }]);
        let report = validate(&func);
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, Violation::MissingTerminator { .. })));
    }

    #[test]
    fn cross_block_use_without_dominance_is_reported() {
        let mut func = IrFunction::default();
        // One branch target defines a value the sibling target uses; neither
        // dominates the other.
        let cond = func.arena.push(IrOp::EvalCond { cond: Cond::E });
        let def = func.arena.push(IrOp::Const { value: 42 });

        let left = BlockId(1);
        let right = BlockId(2);
        let entry = push_block(
            &mut func,
            vec![IrOp::CondJump {
                cond,
                if_true: left,
                if_false: right,
            }],
        );
        let entry_begin = func.blocks[entry.index()].begin;
        func.arena.link_after(entry_begin, cond);
        func.blocks[entry.index()].succs = vec![left, right];

        let left = push_block(&mut func, vec![IrOp::ExitFunction { next_rip: def }]);
        // Place the def inside `left`.
        let left_begin = func.blocks[left.index()].begin;
        func.arena.link_after(left_begin, def);

        let right = push_block(&mut func, vec![IrOp::ExitFunction { next_rip: def }]);

        let report = validate(&func);
        assert!(report.violations.iter().any(|v| matches!(
            v,
            Violation::UseBeforeDef { block, .. } if *block == right
        )));
    }
}
