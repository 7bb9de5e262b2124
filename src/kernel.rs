//! Kernels and kernel library
//!
//! A kernel implements one operation type for a class of tensor shapes and
//! placements. The library maps operation types to ordered candidate lists;
//! selection picks the first registered kernel that supports a step. Code
//! generation is a two-phase contract: `plan` reports resource requirements
//! and `generate` emits the instructions.

use crate::compiler::CompileError;
use crate::compute::{CompileOptions, Network, Placement, StepId};
use crate::express::CostModel;
use crate::flow::Transformer;
use crate::code::Emitter;
use std::collections::HashMap;
use std::sync::Arc;

/// Resource requirements reported by a kernel before code generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelPlan {
    /// Expression registers needed to generate the step.
    pub registers: usize,
}

/// Kernel implementing an operation for some class of steps.
pub trait Kernel: Send + Sync {
    /// Kernel name used in dumps and singleton lookup.
    fn name(&self) -> &str;

    /// Operation type implemented by the kernel.
    fn operation(&self) -> &str;

    /// Where the kernel computes.
    fn location(&self) -> Placement {
        Placement::HOST
    }

    /// Check if the kernel can compute the step.
    fn supports(&self, step: StepId, net: &Network) -> bool;

    /// Add layout requirements (alignment, order, in-place sharing) to the
    /// step's tensors. Called once after selection.
    fn adjust(&self, _step: StepId, _net: &mut Network) -> Result<(), CompileError> {
        Ok(())
    }

    /// Report resource requirements for generating the step. Pure in
    /// (step, options).
    fn plan(
        &self,
        _step: StepId,
        _net: &Network,
        _options: &CompileOptions,
    ) -> Result<KernelPlan, CompileError> {
        Ok(KernelPlan::default())
    }

    /// Generate code for the step.
    fn generate(
        &self,
        step: StepId,
        net: &Network,
        options: &CompileOptions,
        emit: &mut Emitter,
    ) -> Result<(), CompileError>;

    /// Number of numeric operations needed to compute the step.
    fn complexity(&self, _step: StepId, _net: &Network, _cost: &CostModel) -> u64 {
        0
    }
}

/// Registry of kernels and flow transformers. A library handed to a
/// compile call is taken by shared reference, so it cannot change during
/// compilation.
#[derive(Default)]
pub struct Library {
    kernels: HashMap<String, Vec<Arc<dyn Kernel>>>,
    transformers: Vec<Box<dyn Transformer>>,
}

impl Library {
    pub fn new() -> Library {
        Library::default()
    }

    /// Register a kernel. Candidates are tried in registration order
    /// during selection.
    pub fn register(&mut self, kernel: Arc<dyn Kernel>) {
        self.kernels
            .entry(kernel.operation().to_string())
            .or_default()
            .push(kernel);
    }

    /// Register a flow transformer.
    pub fn register_transformer(&mut self, transformer: Box<dyn Transformer>) {
        self.transformers.push(transformer);
    }

    /// Kernel candidates for an operation type, in registration order.
    pub fn lookup(&self, operation: &str) -> &[Arc<dyn Kernel>] {
        self.kernels
            .get(operation)
            .map(|k| k.as_slice())
            .unwrap_or(&[])
    }

    pub fn transformers(&self) -> &[Box<dyn Transformer>] {
        &self.transformers
    }

    /// Build a library holding only the named kernel for an operation.
    pub fn singleton(&self, operation: &str, name: &str) -> Option<Library> {
        let kernel = self
            .lookup(operation)
            .iter()
            .find(|k| k.name() == name)?
            .clone();
        let mut library = Library::new();
        library.register(kernel);
        Some(library)
    }

    /// All registered operation types.
    pub fn operations(&self) -> Vec<&str> {
        self.kernels.keys().map(|k| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyKernel {
        name: &'static str,
    }

    impl Kernel for DummyKernel {
        fn name(&self) -> &str {
            self.name
        }

        fn operation(&self) -> &str {
            "Dummy"
        }

        fn supports(&self, _step: StepId, _net: &Network) -> bool {
            true
        }

        fn generate(
            &self,
            _step: StepId,
            _net: &Network,
            _options: &CompileOptions,
            _emit: &mut Emitter,
        ) -> Result<(), CompileError> {
            Ok(())
        }
    }

    #[test]
    fn test_registration_order() {
        let mut library = Library::new();
        library.register(Arc::new(DummyKernel { name: "first" }));
        library.register(Arc::new(DummyKernel { name: "second" }));
        let kernels = library.lookup("Dummy");
        assert_eq!(kernels.len(), 2);
        assert_eq!(kernels[0].name(), "first");
        assert_eq!(kernels[1].name(), "second");
        assert!(library.lookup("Missing").is_empty());
    }

    #[test]
    fn test_singleton() {
        let mut library = Library::new();
        library.register(Arc::new(DummyKernel { name: "first" }));
        library.register(Arc::new(DummyKernel { name: "second" }));
        let single = library.singleton("Dummy", "second").unwrap();
        assert_eq!(single.lookup("Dummy").len(), 1);
        assert!(library.singleton("Dummy", "missing").is_none());
    }
}
