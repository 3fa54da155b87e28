//! The optimization pipeline.
//!
//! Passes run in a fixed order over an [`IrFunction`]; each reports whether
//! it changed anything so the manager can log useful per-region stats.
//! Validation is wired in automatically for debug builds and runs after
//! every mutating pass, so a pass that breaks dominance is caught right
//! where it happened.

use crate::arena::IrFunction;

pub mod compaction;
pub mod deadstore;
pub mod deadvalues;
pub mod inline_calls;
pub mod regalloc;
pub mod validation;

pub trait Pass {
    fn name(&self) -> &'static str;

    /// Run over `func`; returns whether the IR was modified.
    fn run(&mut self, func: &mut IrFunction) -> bool;
}

pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    validate: bool,
}

impl PassManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            validate: cfg!(debug_assertions),
        }
    }

    /// The standard pipeline run on every translated region.
    #[must_use]
    pub fn default_pipeline() -> Self {
        let mut manager = Self::new();
        manager.add(inline_calls::InlineCallOptimization::new());
        manager.add(deadstore::DeadStoreElimination::new());
        manager.add(deadvalues::DeadValueElimination::new());
        manager.add(compaction::IrCompaction::new());
        manager
    }

    pub fn add(&mut self, pass: impl Pass + 'static) {
        self.passes.push(Box::new(pass));
    }

    pub fn set_validate(&mut self, validate: bool) {
        self.validate = validate;
    }

    pub fn run(&mut self, func: &mut IrFunction) {
        for pass in &mut self.passes {
            let changed = pass.run(func);
            tracing::debug!(pass = pass.name(), changed, "pass complete");
            if self.validate && changed {
                let report = validation::validate(func);
                if !report.is_clean() {
                    tracing::error!(
                        pass = pass.name(),
                        violations = report.violations.len(),
                        "IR validation failed after pass"
                    );
                    debug_assert!(
                        report.is_clean(),
                        "IR validation failed after {}: {:?}",
                        pass.name(),
                        report.violations
                    );
                }
            }
        }
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}
