//! Runtime layer of the krait translation core.
//!
//! Ties the front end, IR and host backends together behind a small public
//! surface: a [`Context`] that compiles and caches guest regions, a
//! three-tier [`cache::LookupCache`], per-thread state, an asynchronous
//! compile service, and the signal delegator with its fault-classification
//! support.

pub mod cache;
pub mod context;
pub mod fault;
pub mod service;
pub mod signals;
pub mod thread;

pub use cache::LookupCache;
pub use context::{CompiledHandle, Config, Context};
pub use fault::{CopyRangeRegistry, FaultOrigin};
pub use service::CompileService;
pub use signals::{DeferGuard, Signal, SignalDelegator};
pub use thread::ThreadState;
