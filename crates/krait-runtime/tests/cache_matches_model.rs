//! Random single-threaded operation sequences against a plain map model.
//! The rip domain is kept narrow so L1 slot collisions and page-level
//! bookkeeping actually get exercised.

use std::collections::BTreeMap;

use krait_runtime::LookupCache;
use krait_types::page_of;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Map { rip: u64, host: u64 },
    Erase { rip: u64 },
    Find { rip: u64 },
    ClearPage { rip: u64 },
    ClearAll,
}

fn rip_strategy() -> impl Strategy<Value = u64> {
    // 8 pages, 16 slots per page, stride 16 so distinct rips can share an
    // L1 slot.
    (0u64..8, 0u64..16).prop_map(|(page, slot)| 0x1000 + page * 0x1000 + slot * 16)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (rip_strategy(), any::<u64>()).prop_map(|(rip, host)| Op::Map { rip, host }),
        2 => rip_strategy().prop_map(|rip| Op::Erase { rip }),
        4 => rip_strategy().prop_map(|rip| Op::Find { rip }),
        1 => rip_strategy().prop_map(|rip| Op::ClearPage { rip }),
        1 => Just(Op::ClearAll),
    ]
}

proptest! {
    #[test]
    fn lookups_agree_with_a_map_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let cache = LookupCache::new();
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Map { rip, host } => {
                    cache.add_block_mapping(rip, host);
                    model.insert(rip, host);
                }
                Op::Erase { rip } => {
                    prop_assert_eq!(cache.erase(rip), model.remove(&rip).is_some());
                }
                Op::Find { rip } => {
                    prop_assert_eq!(cache.find_block(rip), model.get(&rip).copied());
                }
                Op::ClearPage { rip } => {
                    let page = page_of(rip);
                    for block in cache.blocks_on_page(page) {
                        cache.erase(block);
                    }
                    model.retain(|rip, _| page_of(*rip) != page);
                }
                Op::ClearAll => {
                    cache.clear_cache();
                    model.clear();
                }
            }
        }

        prop_assert_eq!(cache.len(), model.len());
        for (rip, host) in &model {
            prop_assert_eq!(cache.find_block(*rip), Some(*host));
        }
    }
}
