//! Background compile service.
//!
//! One worker thread per parent guest thread, fed through a bounded queue.
//! The queue mutex and the compile mutex are distinct on purpose: enqueuing
//! a request never waits on an in-flight compile, and invalidation can
//! try-lock the compile side without stalling requesters.
//!
//! Results land in a holding array the requester drains; the requester
//! flips `safe_to_clear` when it has consumed what it needs, and the worker
//! empties the array before its next publish. Shutdown raises a flag and
//! wakes the worker, which finishes the batch it already dequeued before
//! exiting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::context::{CompiledHandle, Context};
use crate::thread::ThreadState;

/// Requests the queue holds before `request` starts refusing.
pub const QUEUE_LIMIT: usize = 256;

struct Shared {
    queue: Mutex<VecDeque<u64>>,
    wake: Condvar,
    shutdown: AtomicBool,
    /// Serializes compilation against invalidation.
    compile_lock: Mutex<()>,
    /// Published results awaiting collection.
    results: Mutex<Vec<CompiledHandle>>,
    safe_to_clear: AtomicBool,
    completed: AtomicU64,
}

pub struct CompileService {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl CompileService {
    pub fn spawn(ctx: Arc<Context>, thread: Arc<ThreadState>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            compile_lock: Mutex::new(()),
            results: Mutex::new(Vec::new()),
            safe_to_clear: AtomicBool::new(false),
            completed: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("krait-compile-{}", thread.id))
            .spawn(move || worker_loop(&worker_shared, &ctx, &thread))
            .expect("spawn compile worker");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Enqueue a compile request. Returns `false` when the queue is full or
    /// the service is shutting down; the caller compiles synchronously then.
    pub fn request(&self, guest_addr: u64) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            if queue.len() >= QUEUE_LIMIT {
                return false;
            }
            queue.push_back(guest_addr);
        }
        self.shared.wake.notify_one();
        true
    }

    /// Drain published results and tell the worker the array may be
    /// emptied before its next publish.
    #[must_use]
    pub fn collect_results(&self) -> Vec<CompiledHandle> {
        let drained = std::mem::take(&mut *self.shared.results.lock().expect("results lock poisoned"));
        self.shared.safe_to_clear.store(true, Ordering::Release);
        drained
    }

    /// Requests finished over the service lifetime (hits and misses both).
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Invalidate `addr`'s page (zero clears everything), unless a compile
    /// batch holds the compile lock right now. Skipping is allowed: the
    /// caller observes `false` and retries after the batch. An in-flight
    /// block may still publish against the pre-clear guest bytes; callers
    /// that cannot tolerate that retry until `true`.
    pub fn try_invalidate(&self, ctx: &Context, addr: u64) -> bool {
        match self.shared.compile_lock.try_lock() {
            Ok(_guard) => {
                ctx.clear_cache(addr);
                true
            }
            Err(_) => {
                tracing::debug!(
                    addr = format_args!("{addr:#x}"),
                    "invalidation skipped, compile in flight"
                );
                false
            }
        }
    }

    /// Stop the worker; the batch it already dequeued still finishes.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CompileService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared, ctx: &Context, thread: &ThreadState) {
    loop {
        let batch: Vec<u64> = {
            let mut queue = shared.queue.lock().expect("queue lock poisoned");
            while queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                queue = shared
                    .wake
                    .wait(queue)
                    .expect("queue lock poisoned");
            }
            if queue.is_empty() {
                // Shutdown with nothing left to do.
                return;
            }
            queue.drain(..).collect()
        };

        let _compiling = shared.compile_lock.lock().expect("compile lock poisoned");
        for addr in batch {
            let handle = ctx.compile_code(thread, addr);
            if let Some(handle) = handle {
                let mut results = shared.results.lock().expect("results lock poisoned");
                if shared.safe_to_clear.swap(false, Ordering::AcqRel) {
                    results.clear();
                }
                results.push(handle);
            }
            // Bumped after publication so pollers keyed on the count see
            // the handle.
            shared.completed.fetch_add(1, Ordering::Release);
        }

        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
    }
}
