//! Three-tier block lookup cache.
//!
//! Tier 1 is a direct-mapped array of (guest, host) atomic pairs read
//! without any lock; a hit is a pair whose guest tag matches exactly. Tier 2
//! is a lazily populated per-page table (4096 entries, one per guest byte)
//! drawn from a bounded backing arena; when the arena runs dry it is cleared
//! wholesale and the allocation retried, since every entry can be rebuilt
//! from tier 3. Tier 3 is the authoritative ordered map, which also carries
//! the block-link and code-page bookkeeping, all under one mutex.
//!
//! L1 reads are relaxed and may race with `erase` on another thread: a stale
//! hit can briefly return a host pointer for a block that tier 3 no longer
//! knows. Erased code stays mapped until `clear_cache`, so the stale pointer
//! is executable, merely outdated. See DESIGN.md for why this contract is
//! kept as-is.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use krait_types::{page_of, PAGE_SIZE};

/// Direct-mapped L1 size; must stay a power of two.
pub const L1_SIZE: usize = 1 << 12;
/// Entries per L2 page table: one per guest byte of the page.
pub const L2_PAGE_ENTRIES: usize = PAGE_SIZE as usize;
/// Backing-arena budget, in L2 page tables.
pub const L2_PAGE_BUDGET: usize = 64;

/// Guest tag for an empty slot. Guest code never lives at the top of the
/// canonical hole, so the tag cannot collide with a real rip.
const NO_GUEST: u64 = u64::MAX;

/// Callback severing one incoming link when its target block is erased.
pub type Delinker = Box<dyn FnOnce() + Send>;

struct L1Entry {
    guest: AtomicU64,
    host: AtomicU64,
}

#[derive(Clone, Copy)]
struct L2Entry {
    guest: u64,
    host: u64,
}

const EMPTY_L2: L2Entry = L2Entry {
    guest: NO_GUEST,
    host: 0,
};

#[derive(Default)]
struct Tiers {
    /// Page index -> per-byte entry table.
    l2: HashMap<u64, Box<[L2Entry]>>,
    l2_pages_allocated: usize,
    /// Authoritative guest rip -> host entry address.
    l3: BTreeMap<u64, u64>,
    /// Incoming links per target rip, severed exactly once on erase.
    links: BTreeMap<u64, Vec<Delinker>>,
    /// Guest page -> entry rips of blocks decoded from it.
    code_pages: BTreeMap<u64, BTreeSet<u64>>,
}

pub struct LookupCache {
    l1: Box<[L1Entry]>,
    tiers: Mutex<Tiers>,
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LookupCache {
    #[must_use]
    pub fn new() -> Self {
        let l1 = (0..L1_SIZE)
            .map(|_| L1Entry {
                guest: AtomicU64::new(NO_GUEST),
                host: AtomicU64::new(0),
            })
            .collect();
        Self {
            l1,
            tiers: Mutex::new(Tiers::default()),
        }
    }

    fn l1_slot(&self, rip: u64) -> &L1Entry {
        &self.l1[(rip as usize) & (L1_SIZE - 1)]
    }

    fn l1_fill(&self, rip: u64, host: u64) {
        let slot = self.l1_slot(rip);
        slot.host.store(host, Ordering::Relaxed);
        slot.guest.store(rip, Ordering::Relaxed);
    }

    /// Host entry address for `rip`, or `None` if the block is unknown.
    ///
    /// The L1 probe is lock-free; misses fall through to the locked tiers
    /// and refill L2/L1 on the way out.
    #[must_use]
    pub fn find_block(&self, rip: u64) -> Option<u64> {
        let slot = self.l1_slot(rip);
        if slot.guest.load(Ordering::Relaxed) == rip {
            return Some(slot.host.load(Ordering::Relaxed));
        }

        let mut tiers = self.tiers.lock().expect("cache lock poisoned");
        let page = page_of(rip);
        let slot_idx = (rip & (PAGE_SIZE - 1)) as usize;
        if let Some(entries) = tiers.l2.get(&page) {
            let entry = entries[slot_idx];
            if entry.guest == rip {
                self.l1_fill(rip, entry.host);
                return Some(entry.host);
            }
        }

        let host = *tiers.l3.get(&rip)?;
        Self::l2_fill(&mut tiers, rip, host);
        self.l1_fill(rip, host);
        Some(host)
    }

    fn l2_fill(tiers: &mut Tiers, rip: u64, host: u64) {
        let page = page_of(rip);
        if !tiers.l2.contains_key(&page) {
            if tiers.l2_pages_allocated == L2_PAGE_BUDGET {
                // Arena exhausted: everything here is rebuildable from L3,
                // so clear and retry.
                tracing::debug!(pages = tiers.l2_pages_allocated, "l2 arena exhausted, clearing");
                tiers.l2.clear();
                tiers.l2_pages_allocated = 0;
            }
            tiers
                .l2
                .insert(page, vec![EMPTY_L2; L2_PAGE_ENTRIES].into_boxed_slice());
            tiers.l2_pages_allocated += 1;
        }
        let entries = tiers.l2.get_mut(&page).expect("page just ensured");
        entries[(rip & (PAGE_SIZE - 1)) as usize] = L2Entry { guest: rip, host };
    }

    /// Publish a block mapping. Returns whether the guest page previously
    /// held no known code (a newly-code page needs write protection for SMC
    /// detection).
    pub fn add_block_mapping(&self, rip: u64, host: u64) -> bool {
        let mut tiers = self.tiers.lock().expect("cache lock poisoned");
        tiers.l3.insert(rip, host);
        Self::l2_fill(&mut tiers, rip, host);
        self.l1_fill(rip, host);

        let page = page_of(rip);
        let blocks = tiers.code_pages.entry(page).or_default();
        let newly_code = blocks.is_empty();
        blocks.insert(rip);
        newly_code
    }

    /// Record an incoming link to `target`; the delinker runs exactly once,
    /// when `target` is erased or the cache is cleared.
    pub fn add_block_link(&self, target: u64, delinker: Delinker) {
        let mut tiers = self.tiers.lock().expect("cache lock poisoned");
        tiers.links.entry(target).or_default().push(delinker);
    }

    /// Entry rips of every known block decoded from `page`.
    #[must_use]
    pub fn blocks_on_page(&self, page: u64) -> Vec<u64> {
        let tiers = self.tiers.lock().expect("cache lock poisoned");
        tiers
            .code_pages
            .get(&page)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Erase the block at `rip`. Severs its incoming links, drops it from
    /// L3 and the page bookkeeping, and clears the guest half of its L1/L2
    /// slots; the host halves go stale harmlessly. Returns whether the
    /// block existed.
    pub fn erase(&self, rip: u64) -> bool {
        let delinkers;
        let existed;
        {
            let mut tiers = self.tiers.lock().expect("cache lock poisoned");
            existed = tiers.l3.remove(&rip).is_some();
            delinkers = tiers.links.remove(&rip).unwrap_or_default();

            let page = page_of(rip);
            if let Some(entries) = tiers.l2.get_mut(&page) {
                let entry = &mut entries[(rip & (PAGE_SIZE - 1)) as usize];
                if entry.guest == rip {
                    entry.guest = NO_GUEST;
                }
            }
            if let Some(blocks) = tiers.code_pages.get_mut(&page) {
                blocks.remove(&rip);
                if blocks.is_empty() {
                    tiers.code_pages.remove(&page);
                }
            }
        }

        let slot = self.l1_slot(rip);
        if slot.guest.load(Ordering::Relaxed) == rip {
            slot.guest.store(NO_GUEST, Ordering::Relaxed);
        }

        // Run delinkers outside the lock so they may touch the cache.
        let link_count = delinkers.len();
        for delink in delinkers {
            delink();
        }
        if existed || link_count > 0 {
            tracing::debug!(
                rip = format_args!("{rip:#x}"),
                links = link_count,
                "erased block"
            );
        }
        existed
    }

    /// Drop everything: all tiers, all links (severed), all page records.
    pub fn clear_cache(&self) {
        let delinkers: Vec<Delinker>;
        {
            let mut tiers = self.tiers.lock().expect("cache lock poisoned");
            tiers.l3.clear();
            tiers.l2.clear();
            tiers.l2_pages_allocated = 0;
            tiers.code_pages.clear();
            delinkers = std::mem::take(&mut tiers.links)
                .into_values()
                .flatten()
                .collect();
        }
        for slot in self.l1.iter() {
            slot.guest.store(NO_GUEST, Ordering::Relaxed);
        }
        for delink in delinkers {
            delink();
        }
        tracing::debug!("cleared lookup cache");
    }

    /// Number of blocks tier 3 currently knows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiers.lock().expect("cache lock poisoned").l3.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn miss_then_hit_round_trip() {
        let cache = LookupCache::new();
        assert_eq!(cache.find_block(0x1000), None);
        cache.add_block_mapping(0x1000, 0xdead_0000);
        assert_eq!(cache.find_block(0x1000), Some(0xdead_0000));
    }

    #[test]
    fn l1_collision_falls_through_to_l3() {
        let cache = LookupCache::new();
        // Two rips sharing an L1 slot (same low bits).
        let a = 0x1_0010;
        let b = a + L1_SIZE as u64;
        cache.add_block_mapping(a, 1);
        cache.add_block_mapping(b, 2);
        assert_eq!(cache.find_block(a), Some(1));
        assert_eq!(cache.find_block(b), Some(2));
        assert_eq!(cache.find_block(a), Some(1));
    }

    #[test]
    fn page_newly_gains_code_only_once() {
        let cache = LookupCache::new();
        assert!(cache.add_block_mapping(0x5000, 1));
        assert!(!cache.add_block_mapping(0x5010, 2));
        // A different page reports fresh again.
        assert!(cache.add_block_mapping(0x6000, 3));
        // Erasing every block on the page resets the page.
        cache.erase(0x5000);
        cache.erase(0x5010);
        assert!(cache.add_block_mapping(0x5020, 4));
    }

    #[test]
    fn erase_severs_each_link_exactly_once() {
        let cache = LookupCache::new();
        cache.add_block_mapping(0x2000, 10);
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            cache.add_block_link(
                0x2000,
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert!(cache.erase(0x2000));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        // Second erase finds nothing and fires nothing.
        assert!(!cache.erase(0x2000));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn erase_leaves_other_blocks_visible() {
        let cache = LookupCache::new();
        cache.add_block_mapping(0x3000, 1);
        cache.add_block_mapping(0x3008, 2);
        cache.erase(0x3000);
        assert_eq!(cache.find_block(0x3000), None);
        assert_eq!(cache.find_block(0x3008), Some(2));
    }

    #[test]
    fn l2_arena_clears_and_retries_on_exhaustion() {
        let cache = LookupCache::new();
        // Touch one rip on more pages than the arena holds.
        for i in 0..(L2_PAGE_BUDGET as u64 + 8) {
            cache.add_block_mapping(i * PAGE_SIZE, i);
        }
        // Every mapping still resolves through L3, including ones whose L2
        // page was a clear casualty.
        for i in 0..(L2_PAGE_BUDGET as u64 + 8) {
            assert_eq!(cache.find_block(i * PAGE_SIZE), Some(i));
        }
    }

    #[test]
    fn clear_cache_severs_outstanding_links() {
        let cache = LookupCache::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        cache.add_block_link(
            0x9000,
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.add_block_mapping(0x9000, 5);
        cache.clear_cache();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cache.find_block(0x9000), None);
        assert!(cache.is_empty());
    }
}
