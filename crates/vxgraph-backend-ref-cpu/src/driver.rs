use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use vxgraph::driver::{
    BufferHandle, BufferInit, BufferSpec, Driver, DriverCapabilities, DriverError, DriverResult,
    KernelNodeHandle, ViewRegion,
};
use vxgraph::kernel::{BoundKernel, BoundOperand, KernelBackend};
use vxgraph::tensor::convert;

use crate::kernels;

type Storage = Arc<RwLock<Vec<u8>>>;

struct HostBuffer {
    storage: Storage,
    /// Element offsets into `storage` in the buffer's row-major order; `None` covers it whole.
    elements: Option<Arc<[usize]>>,
    spec: BufferSpec,
}

impl HostBuffer {
    fn len(&self) -> usize {
        self.spec.shape.num_elements()
    }

    fn width(&self) -> usize {
        self.spec.dtype.size_in_bytes()
    }

    /// Storage offset of the `index`-th logical element.
    fn element(&self, index: usize) -> usize {
        match &self.elements {
            Some(elements) => elements[index],
            None => index,
        }
    }
}

/// Reference driver that keeps every buffer in host memory and runs CPU kernels.
///
/// Views share storage with their parent, so a write through a view is visible through the
/// parent and every sibling view over the same elements.
#[derive(Default)]
pub struct HostDriver {
    next: AtomicU64,
    buffers: Mutex<HashMap<BufferHandle, HostBuffer>>,
    kernels: Mutex<HashMap<KernelNodeHandle, BoundKernel>>,
    executed: AtomicU64,
}

impl HostDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn live_kernel_nodes(&self) -> usize {
        self.kernels.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Kernel nodes run since creation.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, buffer: HostBuffer) -> BufferHandle {
        let handle = BufferHandle(self.next_id());
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, buffer);
        handle
    }

    /// Reads a kernel operand as real values.
    pub(crate) fn load(&self, operand: &BoundOperand) -> DriverResult<Vec<f32>> {
        let buffer = operand_buffer(operand)?;
        let bytes = self.read(buffer)?;
        convert::decode(operand.dtype, &operand.quant, &bytes)
            .map_err(|err| DriverError::execution(format!("{buffer}: {err}")))
    }

    /// Quantizes `values` to the operand's type and writes them.
    pub(crate) fn store(&self, operand: &BoundOperand, values: &[f32]) -> DriverResult<()> {
        let buffer = operand_buffer(operand)?;
        self.write(buffer, &convert::encode(operand.dtype, &operand.quant, values))
    }
}

fn operand_buffer(operand: &BoundOperand) -> DriverResult<BufferHandle> {
    operand.buffer.ok_or_else(|| {
        DriverError::execution(format!("tensor {} has no buffer bound", operand.tensor))
    })
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    fn create_buffer(&self, spec: &BufferSpec, init: BufferInit<'_>) -> DriverResult<BufferHandle> {
        let size = spec.byte_size();
        let bytes = match init {
            BufferInit::Bytes(bytes) if bytes.len() != size => {
                return Err(DriverError::execution(format!(
                    "buffer of {size} bytes initialized with {} bytes",
                    bytes.len()
                )))
            }
            BufferInit::Bytes(bytes) => bytes.to_vec(),
            BufferInit::Zeroed | BufferInit::Uninit => vec![0; size],
        };
        Ok(self.insert(HostBuffer {
            storage: Arc::new(RwLock::new(bytes)),
            elements: None,
            spec: spec.clone(),
        }))
    }

    fn create_view(
        &self,
        parent: BufferHandle,
        region: &ViewRegion,
        spec: &BufferSpec,
    ) -> DriverResult<BufferHandle> {
        let view = {
            let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            let parent_buf = buffers
                .get(&parent)
                .ok_or(DriverError::UnknownBuffer(parent))?;
            let dims = parent_buf.spec.shape.dims();
            if region.start.len() != dims.len() || region.end.len() != dims.len() {
                return Err(DriverError::InvalidView(format!(
                    "region rank {} on parent of rank {}",
                    region.start.len(),
                    dims.len()
                )));
            }
            if region
                .start
                .iter()
                .zip(&region.end)
                .zip(dims)
                .any(|((start, end), dim)| start > end || end > dim)
            {
                return Err(DriverError::InvalidView(format!(
                    "region {:?}..{:?} outside {:?}",
                    region.start.as_slice(),
                    region.end.as_slice(),
                    dims
                )));
            }
            let extent = region.extent();
            let count: usize = extent.iter().product();
            if count != spec.shape.num_elements() {
                return Err(DriverError::InvalidView(format!(
                    "region holds {count} elements, view shape {} holds {}",
                    spec.shape,
                    spec.shape.num_elements()
                )));
            }
            if spec.dtype.size_in_bytes() != parent_buf.width() {
                return Err(DriverError::InvalidView(format!(
                    "{} view over {} buffer",
                    spec.dtype, parent_buf.spec.dtype
                )));
            }
            let strides = parent_buf.spec.shape.strides();
            let elements: Arc<[usize]> = (0..count)
                .map(|flat| {
                    let coords = kernels::unravel_index(flat, &extent);
                    let index: usize = coords
                        .iter()
                        .zip(&region.start)
                        .zip(&strides)
                        .map(|((coord, start), stride)| (coord + start) * stride)
                        .sum();
                    parent_buf.element(index)
                })
                .collect();
            HostBuffer {
                storage: Arc::clone(&parent_buf.storage),
                elements: Some(elements),
                spec: spec.clone(),
            }
        };
        Ok(self.insert(view))
    }

    fn create_reshape_view(
        &self,
        parent: BufferHandle,
        spec: &BufferSpec,
    ) -> DriverResult<BufferHandle> {
        let view = {
            let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            let parent_buf = buffers
                .get(&parent)
                .ok_or(DriverError::UnknownBuffer(parent))?;
            if parent_buf.len() != spec.shape.num_elements()
                || parent_buf.width() != spec.dtype.size_in_bytes()
            {
                return Err(DriverError::InvalidView(format!(
                    "cannot reshape {} {} as {} {}",
                    parent_buf.spec.dtype, parent_buf.spec.shape, spec.dtype, spec.shape
                )));
            }
            HostBuffer {
                storage: Arc::clone(&parent_buf.storage),
                elements: parent_buf.elements.clone(),
                spec: spec.clone(),
            }
        };
        Ok(self.insert(view))
    }

    fn write(&self, buffer: BufferHandle, bytes: &[u8]) -> DriverResult<()> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buf = buffers
            .get(&buffer)
            .ok_or(DriverError::UnknownBuffer(buffer))?;
        let width = buf.width();
        if bytes.len() != buf.len() * width {
            return Err(DriverError::execution(format!(
                "{buffer} holds {} bytes, got {}",
                buf.len() * width,
                bytes.len()
            )));
        }
        let mut storage = buf.storage.write().unwrap_or_else(PoisonError::into_inner);
        match &buf.elements {
            None => storage[..bytes.len()].copy_from_slice(bytes),
            Some(elements) => {
                for (chunk, &element) in bytes.chunks_exact(width).zip(elements.iter()) {
                    let offset = element * width;
                    storage[offset..offset + width].copy_from_slice(chunk);
                }
            }
        }
        Ok(())
    }

    fn read(&self, buffer: BufferHandle) -> DriverResult<Vec<u8>> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buf = buffers
            .get(&buffer)
            .ok_or(DriverError::UnknownBuffer(buffer))?;
        let width = buf.width();
        let storage = buf.storage.read().unwrap_or_else(PoisonError::into_inner);
        let bytes = match &buf.elements {
            None => storage[..buf.len() * width].to_vec(),
            Some(elements) => {
                let mut bytes = Vec::with_capacity(elements.len() * width);
                for &element in elements.iter() {
                    let offset = element * width;
                    bytes.extend_from_slice(&storage[offset..offset + width]);
                }
                bytes
            }
        };
        Ok(bytes)
    }

    fn release_buffer(&self, buffer: BufferHandle) -> DriverResult<()> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&buffer)
            .map(drop)
            .ok_or(DriverError::UnknownBuffer(buffer))
    }

    fn create_kernel_node(&self, kernel: &BoundKernel) -> DriverResult<KernelNodeHandle> {
        if kernel.backend != KernelBackend::Cpu {
            return Err(DriverError::unsupported(format!(
                "{} kernel {} on the host driver",
                kernel.backend, kernel.function
            )));
        }
        if !kernels::is_supported(&kernel.name) {
            return Err(DriverError::unsupported(format!(
                "no host implementation of kernel \"{}\"",
                kernel.name
            )));
        }
        let handle = KernelNodeHandle(self.next_id());
        tracing::debug!(
            %handle,
            kernel = %kernel.name,
            function = kernel.function,
            "kernel node created"
        );
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, kernel.clone());
        Ok(handle)
    }

    fn release_kernel_node(&self, node: KernelNodeHandle) -> DriverResult<()> {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node)
            .map(drop)
            .ok_or(DriverError::UnknownKernelNode(node))
    }

    fn execute(&self, nodes: &[KernelNodeHandle]) -> DriverResult<()> {
        for &node in nodes {
            let kernel = self
                .kernels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&node)
                .cloned()
                .ok_or(DriverError::UnknownKernelNode(node))?;
            tracing::trace!(%node, kernel = %kernel.name, "executing");
            kernels::execute(self, &kernel)?;
            self.executed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
