//! Multiblock discovery publishes every block entry of the region from a
//! single decode-and-compile round.

use std::sync::Arc;

use krait_runtime::{Config, Context};
use krait_x86::GuestBus;

struct FlatBus {
    base: u64,
    bytes: Vec<u8>,
}

impl GuestBus for FlatBus {
    fn read_u8(&self, addr: u64) -> u8 {
        addr.checked_sub(self.base)
            .and_then(|off| self.bytes.get(off as usize))
            .copied()
            .unwrap_or(0xcc)
    }

    fn is_executable(&self, addr: u64) -> bool {
        (self.base..self.base + self.bytes.len() as u64).contains(&addr)
    }
}

#[test]
fn every_block_entry_lands_in_the_cache() {
    // 0x1000: cmp eax, 0
    // 0x1003: jne 0x1006
    // 0x1005: ret
    // 0x1006: ret
    let bus = FlatBus {
        base: 0x1000,
        bytes: vec![0x83, 0xf8, 0x00, 0x75, 0x01, 0xc3, 0xc3],
    };
    let ctx = Context::new(Config::default(), Arc::new(bus));
    let thread = ctx.create_thread();

    ctx.compile_code(&thread, 0x1000).expect("region compiles");
    assert_eq!(thread.decode_calls(), 1);

    // Entry, fallthrough and branch target all resolve without another
    // compile round.
    assert!(ctx.lookup(0x1000).is_some());
    assert!(ctx.lookup(0x1005).is_some());
    assert!(ctx.lookup(0x1006).is_some());
    assert_eq!(thread.decode_calls(), 1);
}
