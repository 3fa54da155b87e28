//! The background compile service drains its queue, publishes results for
//! collection, and finishes in-flight work across shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use krait_runtime::{CompileService, Config, Context};
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

fn wait_for_completed(service: &CompileService, want: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while service.completed() < want {
        assert!(Instant::now() < deadline, "compile worker stalled");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn requests_compile_in_the_background() {
    // Three separate one-instruction regions, each `ret`.
    let bus = FlatBus {
        base: 0x1000,
        bytes: vec![0xc3; 0x30],
    };
    let ctx = Arc::new(Context::new(Config::default(), Arc::new(bus)));
    let thread = ctx.create_thread();
    let service = CompileService::spawn(Arc::clone(&ctx), Arc::clone(&thread));

    assert!(service.request(0x1000));
    assert!(service.request(0x1010));
    assert!(service.request(0x1020));
    wait_for_completed(&service, 3);

    let mut results = service.collect_results();
    results.sort_by_key(|handle| handle.entry_rip);
    let rips: Vec<u64> = results.iter().map(|handle| handle.entry_rip).collect();
    assert_eq!(rips, vec![0x1000, 0x1010, 0x1020]);

    // The worker published through the shared cache as well.
    for rip in rips {
        assert!(ctx.lookup(rip).is_some());
    }

    service.shutdown();
}

#[test]
fn shutdown_finishes_queued_requests() {
    let bus = FlatBus {
        base: 0x1000,
        bytes: vec![0xc3; 0x30],
    };
    let ctx = Arc::new(Context::new(Config::default(), Arc::new(bus)));
    let thread = ctx.create_thread();
    let service = CompileService::spawn(Arc::clone(&ctx), thread);

    assert!(service.request(0x1000));
    assert!(service.request(0x1010));
    assert!(service.request(0x1020));

    // Shutdown joins the worker; whatever was queued before the flag went
    // up still compiles.
    service.shutdown();
    for rip in [0x1000, 0x1010, 0x1020] {
        assert!(ctx.lookup(rip).is_some());
    }
}
