//! Interface to the device layer that owns buffers and executes kernel nodes.
//!
//! The graph never touches memory directly. Every buffer, view and kernel node goes through a
//! [`Driver`], which lets the same graph run on the host reference driver or a recording stub.

pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kernel::BoundKernel;
use crate::tensor::{DType, Dims, Quantization, Shape};

pub use registry::{create_driver, has_driver, list_drivers, register_driver, DRIVER_REGISTRARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelNodeHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

impl fmt::Display for KernelNodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "knode#{}", self.0)
    }
}

/// Which kernel backends a driver can execute besides plain CPU kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// GPU-source (shader) kernels.
    pub shader: bool,
    /// Vendor primitive kernels.
    pub primitive: bool,
}

/// Half-open box `[start, end)` inside a parent buffer, in row-major element coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewRegion {
    pub start: Dims,
    pub end: Dims,
}

impl ViewRegion {
    pub fn new(start: impl AsRef<[usize]>, end: impl AsRef<[usize]>) -> Self {
        ViewRegion {
            start: Dims::from_slice(start.as_ref()),
            end: Dims::from_slice(end.as_ref()),
        }
    }

    pub fn extent(&self) -> Dims {
        self.start
            .iter()
            .zip(&self.end)
            .map(|(start, end)| end.saturating_sub(*start))
            .collect()
    }
}

/// Layout of a buffer the driver is asked to create or reinterpret.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSpec {
    pub shape: Shape,
    pub dtype: DType,
    pub quant: Quantization,
}

impl BufferSpec {
    pub fn byte_size(&self) -> usize {
        self.shape.num_elements() * self.dtype.size_in_bytes()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BufferInit<'a> {
    Uninit,
    Zeroed,
    Bytes(&'a [u8]),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferHandle),
    #[error("unknown kernel node {0}")]
    UnknownKernelNode(KernelNodeHandle),
    #[error("invalid view: {0}")]
    InvalidView(String),
    #[error("unsupported by driver: {0}")]
    Unsupported(String),
    #[error("driver execution failed: {0}")]
    Execution(String),
}

impl DriverError {
    pub fn execution(message: impl Into<String>) -> Self {
        DriverError::Execution(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        DriverError::Unsupported(message.into())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Device layer consumed by the graph runtime.
pub trait Driver: Send + Sync {
    /// Human-readable driver identifier (e.g. "host", "recording").
    fn name(&self) -> &str;

    fn capabilities(&self) -> DriverCapabilities;

    fn create_buffer(&self, spec: &BufferSpec, init: BufferInit<'_>) -> DriverResult<BufferHandle>;

    /// Creates a buffer aliasing `region` of `parent`. Writes through either handle are visible
    /// through the other.
    fn create_view(
        &self,
        parent: BufferHandle,
        region: &ViewRegion,
        spec: &BufferSpec,
    ) -> DriverResult<BufferHandle>;

    /// Reinterprets `parent` under a new shape with the same element count.
    fn create_reshape_view(
        &self,
        parent: BufferHandle,
        spec: &BufferSpec,
    ) -> DriverResult<BufferHandle>;

    fn write(&self, buffer: BufferHandle, bytes: &[u8]) -> DriverResult<()>;

    fn read(&self, buffer: BufferHandle) -> DriverResult<Vec<u8>>;

    /// Releases a buffer or view. Storage shared with live views outlives the handle.
    fn release_buffer(&self, buffer: BufferHandle) -> DriverResult<()>;

    fn create_kernel_node(&self, kernel: &BoundKernel) -> DriverResult<KernelNodeHandle>;

    fn release_kernel_node(&self, node: KernelNodeHandle) -> DriverResult<()>;

    /// Runs kernel nodes in the given order.
    fn execute(&self, nodes: &[KernelNodeHandle]) -> DriverResult<()>;

    /// Creates a kernel node from a precompiled binary.
    fn load_precompiled(&self, name: &str, _binary: &[u8]) -> DriverResult<KernelNodeHandle> {
        Err(DriverError::unsupported(format!(
            "driver {} cannot load precompiled kernel {name}",
            self.name()
        )))
    }
}
