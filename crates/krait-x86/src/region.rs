//! Multiblock region discovery.
//!
//! Starting from a guest entry point, decode straight-line blocks and follow
//! direct branch targets that stay inside the executable region, converging
//! to a fixed point over a to-visit/visited set pair. Discovery is bounded by
//! [`RegionConfig`] ceilings; hitting a ceiling ends the affected block with
//! [`BlockStatus::Partial`] rather than failing the region.
//!
//! A decode failure terminates only its own block; sibling blocks that were
//! already discovered stay valid (the runtime raises a guest fault if
//! execution actually reaches the bad instruction).

use std::collections::{BTreeSet, VecDeque};

use krait_types::page_of;

use crate::decoder::{decode_one, DecodedInst, InstKind};
use crate::MAX_INST_LEN;

/// Read-only view of guest memory used while decoding.
pub trait GuestBus {
    fn read_u8(&self, addr: u64) -> u8;

    /// Whether `addr` lies in an executable mapping.
    fn is_executable(&self, addr: u64) -> bool;

    /// Fetch a decode window (up to 15 bytes) starting at `addr`.
    #[must_use]
    fn fetch_window(&self, addr: u64) -> [u8; MAX_INST_LEN] {
        let mut buf = [0u8; MAX_INST_LEN];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_u8(addr.wrapping_add(i as u64));
        }
        buf
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegionConfig {
    /// Follow direct branches into sibling blocks.
    pub multiblock: bool,
    /// Maximum instructions decoded into a single block.
    pub max_insts_per_block: usize,
    /// Maximum number of blocks discovered per region.
    pub max_blocks: usize,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            multiblock: true,
            max_insts_per_block: 255,
            max_blocks: 64,
        }
    }
}

/// Terminal status of one decoded block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Ended at a control-transfer instruction.
    Complete,
    /// Hit an undecodable or unimplemented instruction.
    InvalidInstruction,
    /// The block's entry is not in an executable mapping.
    NonExecutable,
    /// Hit a region/block ceiling before a terminator.
    Partial,
    /// Reserved for cached-object reloads whose relocations failed to
    /// resolve; never produced by decoding itself.
    BadRelocation,
}

#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub entry: u64,
    pub insts: Vec<DecodedInst>,
    pub status: BlockStatus,
}

impl DecodedBlock {
    /// Guest byte length of the decoded instructions.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.insts.iter().map(|i| i.len as u64).sum()
    }
}

#[derive(Debug, Clone)]
pub struct DecodedRegion {
    pub entry: u64,
    /// Blocks in discovery order; `blocks[0].entry == entry`.
    pub blocks: Vec<DecodedBlock>,
    /// Entry addresses of every discovered block (the multiblock visited set).
    pub visited: BTreeSet<u64>,
    /// Guest pages touched by any decoded instruction byte.
    pub pages: BTreeSet<u64>,
}

impl DecodedRegion {
    #[must_use]
    pub fn total_insts(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    #[must_use]
    pub fn block_at(&self, entry: u64) -> Option<&DecodedBlock> {
        self.blocks.iter().find(|b| b.entry == entry)
    }
}

/// Decode the region reachable from `entry` through direct branches.
#[must_use]
pub fn discover_region<B: GuestBus + ?Sized>(
    bus: &B,
    entry: u64,
    config: RegionConfig,
) -> DecodedRegion {
    let mut visited: BTreeSet<u64> = BTreeSet::new();
    let mut pages: BTreeSet<u64> = BTreeSet::new();
    let mut to_visit: VecDeque<u64> = VecDeque::new();
    let mut blocks: Vec<DecodedBlock> = Vec::new();

    visited.insert(entry);
    to_visit.push_back(entry);

    while let Some(block_entry) = to_visit.pop_front() {
        let block = decode_block(bus, block_entry, &config, &mut pages);

        if config.multiblock && blocks.len() < config.max_blocks {
            for target in direct_successors(&block) {
                if visited.contains(&target) {
                    continue;
                }
                if !bus.is_executable(target) {
                    continue;
                }
                if visited.len() >= config.max_blocks {
                    break;
                }
                visited.insert(target);
                to_visit.push_back(target);
            }
        }

        blocks.push(block);
    }

    DecodedRegion {
        entry,
        blocks,
        visited,
        pages,
    }
}

/// Direct branch targets that become block-start candidates.
fn direct_successors(block: &DecodedBlock) -> Vec<u64> {
    let Some(last) = block.insts.last() else {
        return Vec::new();
    };
    match last.kind {
        InstKind::JmpRel { target } => vec![target],
        InstKind::JccRel { target, .. } => vec![target, last.next_rip()],
        _ => Vec::new(),
    }
}

fn decode_block<B: GuestBus + ?Sized>(
    bus: &B,
    entry: u64,
    config: &RegionConfig,
    pages: &mut BTreeSet<u64>,
) -> DecodedBlock {
    if !bus.is_executable(entry) {
        return DecodedBlock {
            entry,
            insts: Vec::new(),
            status: BlockStatus::NonExecutable,
        };
    }

    let mut insts = Vec::new();
    let mut rip = entry;
    let mut status = BlockStatus::Partial;

    while insts.len() < config.max_insts_per_block {
        if !bus.is_executable(rip) {
            status = BlockStatus::NonExecutable;
            break;
        }

        let window = bus.fetch_window(rip);
        let inst = decode_one(rip, &window);

        pages.insert(page_of(rip));
        pages.insert(page_of(rip + inst.len as u64 - 1));

        let invalid = inst.kind == InstKind::Invalid;
        let terminator = inst.is_block_terminator();
        let next = inst.next_rip();
        insts.push(inst);

        if invalid {
            status = BlockStatus::InvalidInstruction;
            break;
        }
        if terminator {
            status = BlockStatus::Complete;
            break;
        }
        rip = next;
    }

    DecodedBlock {
        entry,
        insts,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat little test memory; everything below `exec_end` is executable.
    struct FlatBus {
        base: u64,
        bytes: Vec<u8>,
    }

    impl FlatBus {
        fn new(base: u64, bytes: &[u8]) -> Self {
            Self {
                base,
                bytes: bytes.to_vec(),
            }
        }
    }

    impl GuestBus for FlatBus {
        fn read_u8(&self, addr: u64) -> u8 {
            let off = addr.wrapping_sub(self.base) as usize;
            self.bytes.get(off).copied().unwrap_or(0xcc)
        }

        fn is_executable(&self, addr: u64) -> bool {
            let off = addr.wrapping_sub(self.base);
            off < self.bytes.len() as u64
        }
    }

    #[test]
    fn discovery_accepts_a_trait_object_bus() {
        // Runtime callers hold the bus as `Arc<dyn GuestBus + ...>` and pass
        // the unsized reference straight through.
        let bus = FlatBus::new(0x1000, &[0xc3]);
        let dyn_bus: &dyn GuestBus = &bus;
        let region = discover_region(dyn_bus, 0x1000, RegionConfig::default());
        assert_eq!(region.blocks.len(), 1);
        assert_eq!(region.blocks[0].status, BlockStatus::Complete);
    }

    #[test]
    fn straight_line_block_ends_at_ret() {
        // mov eax, 1; add eax, 2; ret
        let bus = FlatBus::new(
            0x1000,
            &[0xb8, 0x01, 0x00, 0x00, 0x00, 0x83, 0xc0, 0x02, 0xc3],
        );
        let region = discover_region(&bus, 0x1000, RegionConfig::default());
        assert_eq!(region.blocks.len(), 1);
        let block = &region.blocks[0];
        assert_eq!(block.status, BlockStatus::Complete);
        assert_eq!(block.insts.len(), 3);
    }

    #[test]
    fn conditional_branch_discovers_two_successors() {
        // 0x1000: xor eax, eax        (2 bytes)
        // 0x1002: add eax, 1          (3 bytes)
        // 0x1005: jnz 0x100a          (2 bytes)  -> taken target 0x100a
        // 0x1007: ret                             -> fallthrough block
        // 0x100a: ret                             -> taken block
        let bus = FlatBus::new(
            0x1000,
            &[
                0x31, 0xc0, // xor eax, eax
                0x83, 0xc0, 0x01, // add eax, 1
                0x75, 0x03, // jnz +3
                0xc3, // ret (fallthrough)
                0x90, 0x90, // padding
                0xc3, // ret (taken)
            ],
        );
        let region = discover_region(&bus, 0x1000, RegionConfig::default());

        // Exactly two successor blocks beyond the entry block.
        assert_eq!(region.blocks.len(), 3);
        assert!(region.visited.contains(&0x1007));
        assert!(region.visited.contains(&0x100a));
        assert_eq!(region.blocks[0].insts.len(), 3);
        assert_eq!(region.blocks[0].status, BlockStatus::Complete);
    }

    #[test]
    fn invalid_instruction_terminates_only_its_block() {
        // 0x1000: jmp 0x1005
        // 0x1002: (unreached)
        // 0x1005: 0x0e = invalid in 64-bit mode
        let bus = FlatBus::new(
            0x1000,
            &[0xeb, 0x03, 0x90, 0x90, 0x90, 0x0e, 0x90, 0x90],
        );
        let region = discover_region(&bus, 0x1000, RegionConfig::default());
        assert_eq!(region.blocks.len(), 2);
        assert_eq!(region.blocks[0].status, BlockStatus::Complete);
        assert_eq!(region.blocks[1].status, BlockStatus::InvalidInstruction);
    }

    #[test]
    fn branch_outside_executable_region_is_not_followed() {
        // jmp far outside the mapping
        let bus = FlatBus::new(0x1000, &[0xe9, 0x00, 0x10, 0x00, 0x00]);
        let region = discover_region(&bus, 0x1000, RegionConfig::default());
        assert_eq!(region.blocks.len(), 1);
        assert_eq!(region.visited.len(), 1);
    }

    #[test]
    fn multiblock_disabled_stops_at_first_block() {
        let bus = FlatBus::new(
            0x1000,
            &[0x75, 0x02, 0xc3, 0x90, 0xc3],
        );
        let config = RegionConfig {
            multiblock: false,
            ..RegionConfig::default()
        };
        let region = discover_region(&bus, 0x1000, config);
        assert_eq!(region.blocks.len(), 1);
    }

    #[test]
    fn block_ceiling_yields_partial() {
        let bytes = vec![0x90u8; 32]; // nop sled, no terminator
        let bus = FlatBus::new(0x1000, &bytes);
        let config = RegionConfig {
            max_insts_per_block: 8,
            ..RegionConfig::default()
        };
        let region = discover_region(&bus, 0x1000, config);
        assert_eq!(region.blocks[0].status, BlockStatus::Partial);
        assert_eq!(region.blocks[0].insts.len(), 8);
    }

    #[test]
    fn pages_track_instruction_spans() {
        // An instruction straddling a page boundary records both pages.
        let mut bytes = vec![0x90u8; 0xffe];
        // 10-byte movabs at 0xffe of the first page
        bytes.extend_from_slice(&[0x48, 0xb8, 1, 0, 0, 0, 0, 0, 0, 0, 0xc3]);
        let bus = FlatBus::new(0x1000, &bytes);
        let config = RegionConfig {
            max_insts_per_block: 10_000,
            ..RegionConfig::default()
        };
        let region = discover_region(&bus, 0x1000, config);
        assert!(region.pages.contains(&page_of(0x1000)));
        assert!(region.pages.contains(&page_of(0x2000)));
    }
}
