//! The top-level translation context.
//!
//! A [`Context`] owns the shared lookup cache, the guest memory bus, the
//! thread roster, and the compile pipeline: discover a region, translate it
//! to IR, run the pass pipeline, allocate registers, splatter host code,
//! patch relocations, place the result in executable memory and publish it.
//! Register pressure is not an error, it is a signal: the region is
//! re-discovered with a smaller instruction ceiling until it colors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use krait_ir::passes::inline_calls::CpuIdTable;
use krait_ir::passes::regalloc::RegisterAllocation;
use krait_ir::passes::PassManager;
use krait_ir::{translate_region, CpuIdHalf};
use krait_jit::exec_mem::ExecMemory;
use krait_jit::{
    apply_relocations, BlockFn, BlockSource, DispatchExit, Dispatcher, GuestState, HostArch,
    Symbol, SymbolResolver,
};
use krait_types::page_of;
use krait_x86::{discover_region, GuestBus, RegionConfig};

use crate::cache::LookupCache;
use crate::thread::ThreadState;

#[derive(Debug, Clone)]
pub struct Config {
    /// Follow direct branches into sibling blocks during discovery.
    pub multiblock: bool,
    pub max_insts_per_block: usize,
    pub max_blocks: usize,
    /// Guest virtual address width; addresses outside it never compile.
    pub virtual_address_bits: u32,
}

impl Default for Config {
    fn default() -> Self {
        let region = RegionConfig::default();
        Self {
            multiblock: region.multiblock,
            max_insts_per_block: region.max_insts_per_block,
            max_blocks: region.max_blocks,
            virtual_address_bits: 48,
        }
    }
}

/// A published compile result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledHandle {
    pub entry_rip: u64,
    pub host_entry: u64,
}

pub struct Context {
    config: Config,
    cache: LookupCache,
    memory: Arc<dyn GuestBus + Send + Sync>,
    threads: Mutex<Vec<Arc<ThreadState>>>,
    next_thread_id: AtomicU64,
}

impl Context {
    #[must_use]
    pub fn new(config: Config, memory: Arc<dyn GuestBus + Send + Sync>) -> Self {
        Self {
            config,
            cache: LookupCache::new(),
            memory,
            threads: Mutex::new(Vec::new()),
            next_thread_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    pub fn create_thread(&self) -> Arc<ThreadState> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let arch = HostArch::native().unwrap_or(HostArch::X86_64);
        let thread = Arc::new(ThreadState::new(id, arch));
        self.threads
            .lock()
            .expect("thread roster lock poisoned")
            .push(Arc::clone(&thread));
        thread
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads
            .lock()
            .expect("thread roster lock poisoned")
            .len()
    }

    /// Compile (or look up) the region at `guest_addr` for `thread`.
    ///
    /// A second call for the same address is served from the cache without
    /// decoding again. `None` means the address can never produce a block
    /// (outside the address space, or translation failed unrecoverably).
    pub fn compile_code(&self, thread: &ThreadState, guest_addr: u64) -> Option<CompiledHandle> {
        if self.config.virtual_address_bits < 64
            && guest_addr >> self.config.virtual_address_bits != 0
        {
            return None;
        }
        if let Some(host) = self.cache.find_block(guest_addr) {
            return Some(CompiledHandle {
                entry_rip: guest_addr,
                host_entry: host,
            });
        }

        thread.note_decode();
        let mut max_insts = self.config.max_insts_per_block;
        loop {
            let region_config = RegionConfig {
                multiblock: self.config.multiblock,
                max_insts_per_block: max_insts,
                max_blocks: if self.config.multiblock {
                    self.config.max_blocks
                } else {
                    1
                },
            };
            let region = discover_region(self.memory.as_ref(), guest_addr, region_config);
            let mut func = translate_region(&region);
            PassManager::default_pipeline().run(&mut func);

            let mut core = thread.core.lock().expect("compile core lock poisoned");
            let (gprs, vectors) = core.backend.class_budget();
            let regs = RegisterAllocation::new(gprs, vectors).allocate(&func);
            if regs.has_spills() {
                // Shrink the region until it colors; a single instruction
                // that still spills is a translator bug, not an input.
                if max_insts == 1 {
                    tracing::warn!(
                        addr = format_args!("{guest_addr:#x}"),
                        spills = regs.spills.len(),
                        "single-instruction block spills, giving up"
                    );
                    return None;
                }
                tracing::debug!(
                    addr = format_args!("{guest_addr:#x}"),
                    spills = regs.spills.len(),
                    max_insts,
                    "register pressure, retrying with smaller region"
                );
                max_insts = (max_insts / 2).max(1);
                continue;
            }

            let mut block = match core.backend.compile(&func, &regs) {
                Ok(block) => block,
                Err(err) => {
                    tracing::warn!(
                        addr = format_args!("{guest_addr:#x}"),
                        error = %err,
                        "backend failed to compile region"
                    );
                    return None;
                }
            };

            let arch = core.backend.arch();
            if let Err(err) =
                apply_relocations(&mut block.code, &block.relocations, &HelperResolver, arch)
            {
                tracing::warn!(
                    addr = format_args!("{guest_addr:#x}"),
                    error = %err,
                    "dropping block with unresolved relocations"
                );
                return None;
            }

            let mut mem = ExecMemory::map(block.code.len()).ok()?;
            let offset = mem.place(&block.code).expect("fresh mapping fits its block");
            let sealed = mem.seal().ok()?;
            let base = sealed.address_of(offset);
            core.code.push(sealed);
            drop(core);

            let mut new_pages = 0usize;
            for (rip, host_offset) in &block.rip_to_offset {
                if self.cache.add_block_mapping(*rip, base + u64::from(*host_offset)) {
                    new_pages += 1;
                }
            }
            if new_pages > 0 {
                tracing::debug!(
                    addr = format_args!("{guest_addr:#x}"),
                    new_pages,
                    "pages newly contain code, write-protect for smc detection"
                );
            }
            tracing::trace!(
                addr = format_args!("{guest_addr:#x}"),
                blocks = block.rip_to_offset.len(),
                bytes = block.code.len(),
                "published region"
            );
            return Some(CompiledHandle {
                entry_rip: guest_addr,
                host_entry: base,
            });
        }
    }

    /// Look up without compiling.
    #[must_use]
    pub fn lookup(&self, guest_addr: u64) -> Option<u64> {
        self.cache.find_block(guest_addr)
    }

    /// Invalidate the page containing `addr`, or everything when `addr` is
    /// zero. Safe to call while another thread compiles; the new block is
    /// published after this clear and sees current guest bytes.
    pub fn clear_cache(&self, addr: u64) {
        if addr == 0 {
            self.cache.clear_cache();
            return;
        }
        let page = page_of(addr);
        for rip in self.cache.blocks_on_page(page) {
            self.cache.erase(rip);
        }
    }

    /// Run up to `max_blocks` translated blocks on `thread`, compiling on
    /// demand.
    pub fn run(&self, thread: &ThreadState, max_blocks: u64) -> DispatchExit {
        let mut cpu = thread.cpu.lock().expect("cpu state lock poisoned");
        let mut source = CacheSource { ctx: self, thread };
        Dispatcher::new().run(&mut cpu, &mut source, max_blocks)
    }
}

struct CacheSource<'a> {
    ctx: &'a Context,
    thread: &'a ThreadState,
}

// Host addresses coming out of the cache were produced by `compile_code`:
// sealed, relocated code for this host.
fn entry_fn(host: u64) -> BlockFn {
    unsafe { std::mem::transmute::<usize, BlockFn>(host as usize) }
}

impl BlockSource for CacheSource<'_> {
    fn probe(&self, rip: u64) -> Option<BlockFn> {
        self.ctx.cache.find_block(rip).map(entry_fn)
    }

    fn lookup_or_compile(&mut self, rip: u64) -> Option<BlockFn> {
        self.ctx
            .compile_code(self.thread, rip)
            .map(|handle| entry_fn(handle.host_entry))
    }
}

struct HelperResolver;

impl SymbolResolver for HelperResolver {
    fn resolve(&self, symbol: Symbol) -> Option<u64> {
        let f: unsafe extern "C" fn(*mut GuestState) -> u64 = match symbol {
            Symbol::SyscallHandler => syscall_handler,
            Symbol::CpuIdHandler => cpuid_handler,
        };
        Some(f as usize as u64)
    }
}

/// Runtime syscall helper. Guest OS emulation is out of scope here, so
/// every selector answers `-ENOSYS`; the passthrough path in the backends
/// never reaches this.
unsafe extern "C" fn syscall_handler(state: *mut GuestState) -> u64 {
    let state = &mut *state;
    let selector = state.helper_args[0];
    tracing::trace!(selector, "unhandled guest syscall");
    (-libc::ENOSYS as i64) as u64
}

/// Runtime cpuid helper; answers from the same deterministic table the
/// inline-call pass folds constants with.
unsafe extern "C" fn cpuid_handler(state: *mut GuestState) -> u64 {
    let state = &mut *state;
    let leaf = state.helper_args[0] as u32;
    let half = if state.helper_args[1] == 0 {
        CpuIdHalf::EaxEbx
    } else {
        CpuIdHalf::EcxEdx
    };
    CpuIdTable.packed(leaf, half)
}
