//! Signal deferral and delivery.
//!
//! Delivery is modeled as an explicit per-thread state machine rather than
//! non-local jumps out of a handler: {Normal, Deferring, HandlingDeferred}.
//! While translated code manipulates shared runtime structures it holds a
//! defer guard; a signal arriving then is parked (at most one) and replayed
//! through the stored trampoline when the last guard drops.
//!
//! Host handler chains run before the single frontend handler, and
//! immediate delivery itself runs under a defer guard so a handler that
//! raises again cannot re-enter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Mutex;

/// A delivered signal, host-independent form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub number: i32,
    /// Faulting address for memory faults, zero otherwise.
    pub fault_addr: u64,
}

/// Host-side handler; returns `true` when it consumed the signal.
pub type HostHandler = fn(&Signal) -> bool;
/// The single frontend (guest-facing) handler.
pub type FrontendHandler = fn(&Signal);
/// Resumption point for a deferred signal.
pub type Trampoline = fn(&Signal);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Deferring,
    HandlingDeferred,
}

struct ThreadSignalState {
    mode: Mode,
    defer_depth: u32,
    pending: Option<Signal>,
}

thread_local! {
    static TLS: RefCell<ThreadSignalState> = const {
        RefCell::new(ThreadSignalState {
            mode: Mode::Normal,
            defer_depth: 0,
            pending: None,
        })
    };
}

#[derive(Default)]
pub struct SignalDelegator {
    host_chains: Mutex<HashMap<i32, Vec<HostHandler>>>,
    frontend: Mutex<Option<FrontendHandler>>,
    trampoline: Mutex<Option<Trampoline>>,
}

impl SignalDelegator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a host handler to `number`'s chain. Chains run in
    /// registration order, before the frontend handler.
    pub fn register_host_handler(&self, number: i32, handler: HostHandler) {
        self.host_chains
            .lock()
            .expect("host chain lock poisoned")
            .entry(number)
            .or_default()
            .push(handler);
    }

    /// Install the frontend handler; there is exactly one.
    pub fn install_frontend(&self, handler: FrontendHandler) {
        *self.frontend.lock().expect("frontend lock poisoned") = Some(handler);
    }

    /// Install the trampoline deferred signals resume through.
    pub fn set_trampoline(&self, trampoline: Trampoline) {
        *self.trampoline.lock().expect("trampoline lock poisoned") = Some(trampoline);
    }

    /// Begin deferring on this thread. Pairs with [`release`]; prefer
    /// [`defer_guard`].
    ///
    /// [`release`]: Self::release
    /// [`defer_guard`]: Self::defer_guard
    pub fn defer(&self) {
        TLS.with(|tls| {
            let mut state = tls.borrow_mut();
            state.defer_depth += 1;
            if state.mode == Mode::Normal {
                state.mode = Mode::Deferring;
            }
        });
    }

    /// Drop one defer level; at zero, a parked signal replays through the
    /// trampoline (or directly when none is installed).
    pub fn release(&self) {
        let replay = TLS.with(|tls| {
            let mut state = tls.borrow_mut();
            assert!(state.defer_depth > 0, "release without defer");
            state.defer_depth -= 1;
            if state.defer_depth > 0 {
                return None;
            }
            let pending = state.pending.take();
            state.mode = if pending.is_some() {
                Mode::HandlingDeferred
            } else {
                Mode::Normal
            };
            pending
        });

        if let Some(signal) = replay {
            tracing::debug!(number = signal.number, "replaying deferred signal");
            let trampoline = *self.trampoline.lock().expect("trampoline lock poisoned");
            match trampoline {
                Some(trampoline) => trampoline(&signal),
                None => self.dispatch(&signal),
            }
            TLS.with(|tls| tls.borrow_mut().mode = Mode::Normal);
        }
    }

    #[must_use]
    pub fn defer_guard(&self) -> DeferGuard<'_> {
        self.defer();
        DeferGuard { delegator: self }
    }

    /// Deliver `signal` on the current thread. Under an active defer guard
    /// the signal is parked instead (one deep; later arrivals of an
    /// already-parked signal are dropped with a warning, matching the
    /// at-most-one contract).
    pub fn raise(&self, signal: Signal) {
        let deliver_now = TLS.with(|tls| {
            let mut state = tls.borrow_mut();
            match state.mode {
                Mode::Normal | Mode::HandlingDeferred => true,
                Mode::Deferring => {
                    if state.pending.is_none() {
                        state.pending = Some(signal);
                    } else {
                        tracing::warn!(
                            number = signal.number,
                            "dropping signal, one already deferred"
                        );
                    }
                    false
                }
            }
        });
        if deliver_now {
            // Handlers run under their own defer scope, so a handler that
            // raises parks instead of recursing.
            let _guard = self.defer_guard();
            self.dispatch(&signal);
        }
    }

    fn dispatch(&self, signal: &Signal) {
        let chain = self
            .host_chains
            .lock()
            .expect("host chain lock poisoned")
            .get(&signal.number)
            .cloned()
            .unwrap_or_default();
        for handler in chain {
            if handler(signal) {
                return;
            }
        }
        let frontend = *self.frontend.lock().expect("frontend lock poisoned");
        if let Some(frontend) = frontend {
            frontend(signal);
        } else {
            tracing::warn!(number = signal.number, "signal with no frontend handler");
        }
    }

    /// Whether this thread currently has a parked signal.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        TLS.with(|tls| tls.borrow().pending.is_some())
    }
}

pub struct DeferGuard<'a> {
    delegator: &'a SignalDelegator,
}

impl Drop for DeferGuard<'_> {
    fn drop(&mut self) {
        self.delegator.release();
    }
}
