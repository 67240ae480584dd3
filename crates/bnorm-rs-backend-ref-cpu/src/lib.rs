//! Reference CPU device for `bnorm-rs` kernels.
//!
//! Graphs are validated and planned at compile time; execution evaluates the plan over host
//! buffers in `f64` and rounds results into the output dtype.

pub mod cpu;
mod kernels;
pub mod tensor;

pub use cpu::{CompiledGraph, CpuDevice, CpuKernel};
pub use tensor::{CpuTensor, TensorData};
