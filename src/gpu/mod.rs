//! Kernel-dispatch back end (wgpu compute shaders)
//!
//! Every stage of a step is one compute pass over either one invocation per
//! atom or one per box:
//!
//! - **gravity**, **force**, **border**, **integrate**: one invocation per own atom
//! - **clear_boxes**: one per box
//! - **count_boxes** / **scatter_boxes**: atomics on the per-box counters and cursor
//! - **scan_boxes**: a single workgroup computing the exclusive prefix sum
//! - **collision**: reads one velocity side and writes the other
//!
//! Passes that both read and write a quantity go through the alternate
//! buffer and the host flips the binding, so no pass races with itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use sotl::engine::{StepEngine, StepFlags};
//! use sotl::gpu::KernelEngine;
//!
//! let mut engine = KernelEngine::new(0)?;
//! engine.allocate(&atoms, &domain, law)?;
//! engine.write(&atoms)?;
//! engine.step(&mut atoms, &domain, &StepFlags::default())?;
//! engine.read_back(&mut atoms)?;
//! ```

mod kernel;
mod shaders;
mod types;

pub use kernel::{AdapterSummary, KernelEngine, gpu_available, list_adapters};
pub use shaders::{ENTRY_POINTS, step_shader};
pub use types::{StepUniforms, WORKGROUP_SIZE};
