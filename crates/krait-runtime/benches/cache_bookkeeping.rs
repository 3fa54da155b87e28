use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use krait_runtime::LookupCache;

fn criterion_config() -> Criterion {
    match std::env::var("KRAIT_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

/// Deterministic RNG suitable for microbench input generation without pulling in `rand`.
#[derive(Clone)]
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // https://en.wikipedia.org/wiki/Splitmix64
        let mut z = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        debug_assert!(upper_exclusive != 0);
        (self.next_u64() as usize) % upper_exclusive
    }
}

const CACHE_BLOCKS: usize = 10_000;
const QUERY_COUNT: usize = 8_192; // power-of-two for cheap wrapping
const RNG_SEED: u64 = 0x6E5F_02C1_9A44_D3B7;

fn rip_for_index(idx: usize) -> u64 {
    // Small stride so guest addresses look like real instruction pointers.
    0x40_0000 + ((idx as u64) << 4)
}

fn host_for_rip(rip: u64) -> u64 {
    0x7f00_0000_0000 | (rip << 2)
}

fn build_cache_near_capacity() -> LookupCache {
    let cache = LookupCache::new();
    for i in 0..CACHE_BLOCKS {
        let rip = rip_for_index(i);
        cache.add_block_mapping(rip, host_for_rip(rip));
    }
    cache
}

fn bench_lookup_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function("find_block_hit_100pct", |b| {
        let cache = build_cache_near_capacity();

        let mut rng = SplitMix64::new(RNG_SEED);
        let queries: Vec<u64> = (0..QUERY_COUNT)
            .map(|_| rip_for_index(rng.next_usize(CACHE_BLOCKS)))
            .collect();

        let mut idx = 0usize;
        b.iter(|| {
            let rip = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            black_box(cache.find_block(black_box(rip)));
        });
    });

    group.bench_function("find_block_hit_50pct", |b| {
        let cache = build_cache_near_capacity();

        let mut rng = SplitMix64::new(RNG_SEED ^ 0xA5A5_A5A5_A5A5_A5A5);
        let queries: Vec<u64> = (0..QUERY_COUNT)
            .map(|i| {
                if (i & 1) == 0 {
                    rip_for_index(rng.next_usize(CACHE_BLOCKS))
                } else {
                    // Guaranteed miss: outside the pre-filled range.
                    rip_for_index(CACHE_BLOCKS + rng.next_usize(CACHE_BLOCKS))
                }
            })
            .collect();

        let mut idx = 0usize;
        b.iter(|| {
            let rip = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            black_box(cache.find_block(black_box(rip)));
        });
    });

    group.bench_function("map_then_erase_churn", |b| {
        let cache = build_cache_near_capacity();

        // Churn addresses sit outside the pre-filled range so the steady
        // population stays constant across iterations.
        let mut rng = SplitMix64::new(RNG_SEED ^ 0x0F0F_0F0F_0F0F_0F0F);
        let churn: Vec<u64> = (0..QUERY_COUNT)
            .map(|_| rip_for_index(CACHE_BLOCKS + rng.next_usize(CACHE_BLOCKS)))
            .collect();

        let mut idx = 0usize;
        b.iter(|| {
            let rip = churn[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            cache.add_block_mapping(black_box(rip), host_for_rip(rip));
            black_box(cache.erase(black_box(rip)));
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_lookup_cache
}
criterion_main!(benches);
