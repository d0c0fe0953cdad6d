//! OpenCL source kernels for vxgraph.
//!
//! Tables here register under [`vxgraph::kernel::KernelBackend::GpuSource`] and are only
//! selected on drivers that report shader support.

pub mod kernels;

pub use kernels::{builtin_kernel_sources, builtin_kernel_specs, register_gpu_kernels, KernelSpec};
