//! Cellflow - JIT compiler and runtime for tensor dataflow cells
//!
//! Cellflow compiles dataflow graphs of tensor operations into compact
//! programs with fixed memory layouts, and executes them on pluggable
//! runtimes with optional task parallelism and emulated device memory.
//!
//! A computation is authored as a [`Flow`](flow::Flow): typed variables
//! connected by operations, grouped into functions. The
//! [`compile`](compiler::compile) call rewrites the flow (algebraic
//! simplification, constant folding, fusion of element-wise operations
//! into expression recipes), selects a kernel for every step, lays out
//! per-invocation instance memory, and generates an instruction program
//! per cell. At run time an [`Instance`](compute::Instance) holds the
//! parameter data for one invocation, and [`Channel`](compute::Channel)s
//! carry connector elements between cells.
//!
//! # Example
//!
//! ```rust
//! use cellflow::compiler::compile;
//! use cellflow::compute::{CompileOptions, Instance};
//! use cellflow::flow::{DataType, Flow, Shape};
//! use cellflow::kernels::standard_library;
//! use cellflow::runtime::HostRuntime;
//! use std::sync::Arc;
//!
//! let mut flow = Flow::new();
//! let f = flow.add_func("scale");
//! let x = flow.add_var("x", DataType::Float32, Shape::of(&[4]));
//! let c = flow.add_const_f32("c", Shape::scalar(), &[2.0]);
//! let y = flow.add_var("y", DataType::Float32, Shape::of(&[4]));
//! flow.add_op(f, "mul", "Mul", &[x, c], &[y]);
//!
//! let library = standard_library();
//! let net = compile(flow, &library, Arc::new(HostRuntime::new()),
//!                   CompileOptions::default()).unwrap();
//!
//! let cell = net.find_cell("scale").unwrap();
//! let x = net.get_parameter("x").unwrap();
//! let y = net.get_parameter("y").unwrap();
//! let mut instance = Instance::new(&net, cell).unwrap();
//! instance.set_f32(x, &[1.0, 2.0, 3.0, 4.0]);
//! instance.compute().unwrap();
//! assert_eq!(instance.to_vec_f32(y), vec![2.0, 4.0, 6.0, 8.0]);
//! ```

#![warn(clippy::all)]

pub mod code;
pub mod compiler;
pub mod compute;
pub mod express;
pub mod flow;
pub mod kernel;
pub mod kernels;
pub mod runtime;
pub mod transform;

pub use compiler::{compile, compile_file, CompileError};
pub use compute::{
    Channel, CompileOptions, Instance, Network, Order, Placement, Tensor,
};
pub use express::{CostModel, Express, ExprError, OpKind, VarKind};
pub use flow::{DataType, Flow, FlowError, Shape, Transformer};
pub use kernel::{Kernel, KernelPlan, Library};
pub use kernels::standard_library;
pub use runtime::{HostRuntime, Runtime, RuntimeError, StreamRuntime};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
