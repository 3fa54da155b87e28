//! Interference-graph register allocation.
//!
//! Runs after compaction, which guarantees dense node ids in layout order.
//! Values never cross block boundaries, so a value's live interval is simply
//! `[def, last_use)` in id order; the interference graph is built with one
//! active-set sweep over those intervals and colored greedily in id order
//! (definition order is dominance order inside a block, so every neighbor
//! that matters is already colored).
//!
//! Values that cannot be colored are reported as spills rather than being
//! rewritten; the compiler treats spills as a signal to retry the region
//! with a smaller block ceiling.

use crate::arena::{IrFunction, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gpr,
    Vector,
}

/// A host register in one of the two allocatable classes. The index is
/// abstract; each backend maps it onto its own machine registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg {
    pub class: RegClass,
    pub index: u8,
}

/// Allocatable register budget for one class.
#[derive(Debug, Clone, Copy)]
pub struct ClassConfig {
    pub count: usize,
}

#[derive(Debug)]
pub struct AllocationResult {
    assignments: Vec<Option<PhysReg>>,
    pub spills: Vec<NodeId>,
}

impl AllocationResult {
    #[must_use]
    pub fn reg_of(&self, id: NodeId) -> Option<PhysReg> {
        self.assignments.get(id.index()).copied().flatten()
    }

    #[must_use]
    pub fn has_spills(&self) -> bool {
        !self.spills.is_empty()
    }
}

/// Undirected interference graph over node ids.
///
/// Adjacency is kept twice: a bitmatrix for O(1) edge tests during
/// construction and per-node lists for iteration while coloring. `reset`
/// keeps all allocations so one graph can be reused across compilations.
#[derive(Debug, Default)]
pub struct RegisterGraph {
    nodes: usize,
    words_per_row: usize,
    bits: Vec<u64>,
    adjacency: Vec<Vec<u32>>,
}

impl RegisterGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the graph and size it for `nodes` nodes, growing storage
    /// geometrically so repeated resets settle into a stable footprint.
    pub fn reset(&mut self, nodes: usize) {
        self.nodes = nodes;
        self.words_per_row = nodes.div_ceil(64);
        let want = nodes * self.words_per_row;
        if self.bits.len() < want {
            self.bits.reserve(want.next_power_of_two() - self.bits.len());
        }
        self.bits.clear();
        self.bits.resize(want, 0);

        if self.adjacency.len() < nodes {
            self.adjacency.resize_with(nodes, Vec::new);
        }
        for list in &mut self.adjacency[..nodes] {
            list.clear();
        }
    }

    pub fn add_edge(&mut self, a: u32, b: u32) {
        debug_assert_ne!(a, b);
        if self.interferes(a, b) {
            return;
        }
        self.set_bit(a, b);
        self.set_bit(b, a);
        self.adjacency[a as usize].push(b);
        self.adjacency[b as usize].push(a);
    }

    #[must_use]
    pub fn interferes(&self, a: u32, b: u32) -> bool {
        let word = a as usize * self.words_per_row + b as usize / 64;
        self.bits[word] & (1u64 << (b % 64)) != 0
    }

    #[must_use]
    pub fn neighbors(&self, a: u32) -> &[u32] {
        &self.adjacency[a as usize]
    }

    #[must_use]
    pub fn degree(&self, a: u32) -> usize {
        self.adjacency[a as usize].len()
    }

    fn set_bit(&mut self, a: u32, b: u32) {
        let word = a as usize * self.words_per_row + b as usize / 64;
        self.bits[word] |= 1u64 << (b % 64);
    }
}

pub struct RegisterAllocation {
    gpr: ClassConfig,
    vector: ClassConfig,
    graph: RegisterGraph,
    last_use: Vec<u32>,
}

impl RegisterAllocation {
    #[must_use]
    pub fn new(gpr: ClassConfig, vector: ClassConfig) -> Self {
        debug_assert!(gpr.count <= 32 && vector.count <= 32);
        Self {
            gpr,
            vector,
            graph: RegisterGraph::new(),
            last_use: Vec::new(),
        }
    }

    /// Allocate registers for every value-producing node in `func`.
    ///
    /// `func` must be compacted: ids dense and in layout order.
    pub fn allocate(&mut self, func: &IrFunction) -> AllocationResult {
        let n = func.arena.len();
        self.graph.reset(n);
        self.last_use.clear();
        self.last_use.resize(n, 0);

        // A value with no uses still occupies its destination register at
        // the defining instruction itself.
        for index in 0..n {
            let id = NodeId(index as u32);
            self.last_use[index] = index as u32;
            func.arena.op(id).for_each_arg(|arg| {
                self.last_use[arg.index()] = index as u32;
            });
        }

        // Active-set sweep in def order.
        let mut active: Vec<u32> = Vec::new();
        for index in 0..n {
            let id = NodeId(index as u32);
            let op = func.arena.op(id);
            if !op.has_dest() {
                continue;
            }
            let class = class_of(func, id);
            active.retain(|&a| self.last_use[a as usize] > index as u32);
            for &a in &active {
                if class_of(func, NodeId(a)) == class {
                    self.graph.add_edge(a, index as u32);
                }
            }
            active.push(index as u32);
        }

        // Greedy coloring in definition order.
        let mut assignments: Vec<Option<PhysReg>> = vec![None; n];
        let mut spills: Vec<NodeId> = Vec::new();
        for index in 0..n {
            let id = NodeId(index as u32);
            if !func.arena.op(id).has_dest() {
                continue;
            }
            let class = class_of(func, id);
            let budget = match class {
                RegClass::Gpr => self.gpr.count,
                RegClass::Vector => self.vector.count,
            };
            let mut taken = 0u32;
            for &neighbor in self.graph.neighbors(index as u32) {
                if let Some(reg) = assignments[neighbor as usize] {
                    if reg.class == class {
                        taken |= 1 << reg.index;
                    }
                }
            }
            match (0..budget).find(|i| taken & (1 << i) == 0) {
                Some(free) => {
                    assignments[index] = Some(PhysReg {
                        class,
                        index: free as u8,
                    });
                }
                None => spills.push(id),
            }
        }

        if !spills.is_empty() {
            tracing::debug!(
                spills = spills.len(),
                entry = format_args!("{:#x}", func.entry_rip),
                "register allocation spilled"
            );
        }

        AllocationResult {
            assignments,
            spills,
        }
    }
}

fn class_of(func: &IrFunction, id: NodeId) -> RegClass {
    if func.arena.op(id).is_vector_value() {
        RegClass::Vector
    } else {
        RegClass::Gpr
    }
}
