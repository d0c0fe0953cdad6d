use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use vxgraph::driver::{
    BufferHandle, BufferInit, BufferSpec, Driver, DriverCapabilities, DriverError, DriverResult,
    KernelNodeHandle, ViewRegion,
};
use vxgraph::kernel::BoundKernel;

/// Test-only driver that stores buffer bytes and records every bound kernel without running it.
///
/// Views get their own zeroed storage; only the recorded kernels are meaningful.
#[derive(Default)]
pub struct RecordingDriver {
    capabilities: DriverCapabilities,
    next: AtomicU64,
    buffers: Mutex<HashMap<BufferHandle, Vec<u8>>>,
    kernels: Mutex<Vec<(KernelNodeHandle, BoundKernel)>>,
    executed: Mutex<Vec<KernelNodeHandle>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: DriverCapabilities) -> Self {
        RecordingDriver {
            capabilities,
            ..Self::default()
        }
    }

    /// A driver that accepts GPU source kernels.
    pub fn shader() -> Self {
        Self::with_capabilities(DriverCapabilities {
            shader: true,
            primitive: false,
        })
    }

    /// Live kernel nodes in creation order.
    pub fn recorded_kernels(&self) -> Vec<BoundKernel> {
        self.kernels
            .lock()
            .expect("driver mutex poisoned")
            .iter()
            .map(|(_, kernel)| kernel.clone())
            .collect()
    }

    pub fn recorded_kernel_or_panic(&self, name: &str) -> BoundKernel {
        self.recorded_kernels()
            .into_iter()
            .find(|kernel| kernel.name == name)
            .unwrap_or_else(|| panic!("no kernel {name} recorded"))
    }

    pub fn executed(&self) -> Vec<KernelNodeHandle> {
        self.executed.lock().expect("driver mutex poisoned").clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().expect("driver mutex poisoned").len()
    }

    fn insert(&self, bytes: Vec<u8>) -> BufferHandle {
        let handle = BufferHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.buffers
            .lock()
            .expect("driver mutex poisoned")
            .insert(handle, bytes);
        handle
    }

    fn require(&self, buffer: BufferHandle) -> DriverResult<()> {
        if self
            .buffers
            .lock()
            .expect("driver mutex poisoned")
            .contains_key(&buffer)
        {
            Ok(())
        } else {
            Err(DriverError::UnknownBuffer(buffer))
        }
    }
}

impl Driver for RecordingDriver {
    fn name(&self) -> &str {
        "recording"
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn create_buffer(&self, spec: &BufferSpec, init: BufferInit<'_>) -> DriverResult<BufferHandle> {
        let bytes = match init {
            BufferInit::Bytes(bytes) => bytes.to_vec(),
            BufferInit::Zeroed | BufferInit::Uninit => vec![0; spec.byte_size()],
        };
        Ok(self.insert(bytes))
    }

    fn create_view(
        &self,
        parent: BufferHandle,
        _region: &ViewRegion,
        spec: &BufferSpec,
    ) -> DriverResult<BufferHandle> {
        self.require(parent)?;
        Ok(self.insert(vec![0; spec.byte_size()]))
    }

    fn create_reshape_view(
        &self,
        parent: BufferHandle,
        spec: &BufferSpec,
    ) -> DriverResult<BufferHandle> {
        self.require(parent)?;
        Ok(self.insert(vec![0; spec.byte_size()]))
    }

    fn write(&self, buffer: BufferHandle, bytes: &[u8]) -> DriverResult<()> {
        let mut buffers = self.buffers.lock().expect("driver mutex poisoned");
        let slot = buffers
            .get_mut(&buffer)
            .ok_or(DriverError::UnknownBuffer(buffer))?;
        *slot = bytes.to_vec();
        Ok(())
    }

    fn read(&self, buffer: BufferHandle) -> DriverResult<Vec<u8>> {
        self.buffers
            .lock()
            .expect("driver mutex poisoned")
            .get(&buffer)
            .cloned()
            .ok_or(DriverError::UnknownBuffer(buffer))
    }

    fn release_buffer(&self, buffer: BufferHandle) -> DriverResult<()> {
        self.buffers
            .lock()
            .expect("driver mutex poisoned")
            .remove(&buffer)
            .map(drop)
            .ok_or(DriverError::UnknownBuffer(buffer))
    }

    fn create_kernel_node(&self, kernel: &BoundKernel) -> DriverResult<KernelNodeHandle> {
        let handle = KernelNodeHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.kernels
            .lock()
            .expect("driver mutex poisoned")
            .push((handle, kernel.clone()));
        Ok(handle)
    }

    fn release_kernel_node(&self, node: KernelNodeHandle) -> DriverResult<()> {
        let mut kernels = self.kernels.lock().expect("driver mutex poisoned");
        let index = kernels
            .iter()
            .position(|(handle, _)| *handle == node)
            .ok_or(DriverError::UnknownKernelNode(node))?;
        kernels.remove(index);
        Ok(())
    }

    fn execute(&self, nodes: &[KernelNodeHandle]) -> DriverResult<()> {
        let kernels = self.kernels.lock().expect("driver mutex poisoned");
        if let Some(missing) = nodes
            .iter()
            .find(|node| !kernels.iter().any(|(handle, _)| handle == *node))
        {
            return Err(DriverError::UnknownKernelNode(*missing));
        }
        self.executed
            .lock()
            .expect("driver mutex poisoned")
            .extend_from_slice(nodes);
        Ok(())
    }
}
