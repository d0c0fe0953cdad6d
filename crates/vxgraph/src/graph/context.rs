use std::sync::Arc;

use crate::diagnostics::Diagnostics;
use crate::driver::{BufferHandle, BufferInit, BufferSpec, Driver, DriverError, ViewRegion};
use crate::error::{OpError, OpResult};
use crate::kernel::{
    BindRequest, BoundKernel, BoundOperand, KernelRegistry, KernelResult, KernelSelector,
};
use crate::node::{KernelNode, Node};
use crate::ops::OpRegistry;
use crate::tensor::{
    Shape, TensorAttr, TensorDescriptor, TensorError, TensorId, TensorResult, TensorStore, ViewLink,
};

use super::GraphConfig;

/// Graph state shared by every node callback: tensors, registries, selector and driver.
///
/// Kept apart from the node list so a node can be borrowed mutably alongside it.
pub struct GraphContext {
    tensors: TensorStore,
    ops: Arc<OpRegistry>,
    kernels: Arc<KernelRegistry>,
    selector: KernelSelector,
    driver: Arc<dyn Driver>,
    config: GraphConfig,
    diagnostics: Diagnostics,
}

impl GraphContext {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        config: GraphConfig,
        ops: Arc<OpRegistry>,
        kernels: Arc<KernelRegistry>,
    ) -> Self {
        let selector = KernelSelector::new(config.kernel_cache_size)
            .with_shader_disabled(config.disable_shader);
        GraphContext {
            tensors: TensorStore::new(),
            ops,
            kernels,
            selector,
            driver,
            config,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn tensors(&self) -> &TensorStore {
        &self.tensors
    }

    pub(crate) fn tensors_mut(&mut self) -> &mut TensorStore {
        &mut self.tensors
    }

    pub fn tensor(&self, id: TensorId) -> TensorResult<&TensorDescriptor> {
        self.tensors.get(id)
    }

    pub fn ops(&self) -> &Arc<OpRegistry> {
        &self.ops
    }

    pub fn kernels(&self) -> &Arc<KernelRegistry> {
        &self.kernels
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub(crate) fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub(crate) fn insert_tensor(&mut self, attr: TensorAttr) -> TensorId {
        self.tensors.insert(attr)
    }

    /// Resolved shape of `id`.
    pub fn shape_of(&self, id: TensorId) -> TensorResult<Shape> {
        self.tensors
            .get(id)?
            .shape()
            .cloned()
            .ok_or(TensorError::Unresolved(id))
    }

    pub fn set_shape(&mut self, id: TensorId, shape: Shape) -> TensorResult<()> {
        self.tensors.get_mut(id)?.attr.shape = Some(shape);
        Ok(())
    }

    /// The tensor as a kernel operand, under its own shape.
    pub fn operand(&self, id: TensorId) -> TensorResult<BoundOperand> {
        let desc = self.tensors.get(id)?;
        Ok(BoundOperand {
            tensor: id,
            buffer: desc.buffer(),
            shape: desc.shape().cloned().ok_or(TensorError::Unresolved(id))?,
            dtype: desc.dtype(),
            quant: desc.quant().clone(),
        })
    }

    pub fn select_kernel(&mut self, request: &BindRequest<'_>) -> KernelResult<BoundKernel> {
        let policy = self.config.kernel_overrides.policy(request.name);
        let capabilities = self.driver.capabilities();
        self.selector
            .select(&self.kernels, capabilities, policy, request)
    }

    /// Selects a kernel for `request` and attaches a driver kernel node to `node`.
    pub fn bind_kernel(&mut self, node: &mut Node, request: &BindRequest<'_>) -> OpResult<()> {
        let kernel = self.select_kernel(request)?;
        self.attach_kernel(node, kernel)
    }

    pub fn attach_kernel(&mut self, node: &mut Node, kernel: BoundKernel) -> OpResult<()> {
        let handle = self.driver.create_kernel_node(&kernel)?;
        tracing::debug!(
            node = node.uid().0,
            kernel = %kernel.name,
            function = kernel.function,
            "kernel node created"
        );
        node.kernels.push(KernelNode { kernel, handle });
        Ok(())
    }

    /// Releases every kernel node of `node`, newest first. Returns how many were released.
    pub(crate) fn release_kernels(&mut self, node: &mut Node) -> Result<usize, DriverError> {
        let mut released = 0;
        let mut first_error = None;
        while let Some(kernel) = node.kernels.pop() {
            if let Err(err) = self.driver.release_kernel_node(kernel.handle) {
                first_error.get_or_insert(err);
            }
            released += 1;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }

    fn buffer_spec(&self, id: TensorId) -> TensorResult<BufferSpec> {
        let desc = self.tensors.get(id)?;
        Ok(BufferSpec {
            shape: desc.shape().cloned().ok_or(TensorError::Unresolved(id))?,
            dtype: desc.dtype(),
            quant: desc.quant().clone(),
        })
    }

    /// Buffer of `id`, creating it (filled with const data when present) if missing.
    pub fn ensure_buffer(&mut self, id: TensorId) -> OpResult<BufferHandle> {
        if let Some(buffer) = self.tensors.get(id)?.buffer() {
            return Ok(buffer);
        }
        let spec = self.buffer_spec(id)?;
        let desc = self.tensors.get(id)?;
        let init = match desc.const_data() {
            Some(bytes) => BufferInit::Bytes(bytes),
            None => BufferInit::Zeroed,
        };
        let buffer = self.driver.create_buffer(&spec, init)?;
        self.tensors.get_mut(id)?.buffer = Some(buffer);
        tracing::trace!(tensor = %id, %buffer, "buffer created");
        Ok(buffer)
    }

    fn ensure_unbacked(&self, id: TensorId) -> OpResult<()> {
        if self.tensors.get(id)?.buffer().is_some() {
            return Err(OpError::invalid(format!(
                "tensor {id} already has a buffer and cannot become a view"
            )));
        }
        Ok(())
    }

    /// Backs `child` with `region` of `parent`'s buffer.
    pub fn create_view(
        &mut self,
        parent: TensorId,
        child: TensorId,
        region: ViewRegion,
    ) -> OpResult<BufferHandle> {
        self.ensure_unbacked(child)?;
        let parent_buffer = self.ensure_buffer(parent)?;
        let spec = self.buffer_spec(child)?;
        let buffer = self.driver.create_view(parent_buffer, &region, &spec)?;
        let desc = self.tensors.get_mut(child)?;
        desc.buffer = Some(buffer);
        desc.view_of = Some(ViewLink::Region { parent, region });
        Ok(buffer)
    }

    /// Backs `child` with `parent`'s buffer under `child`'s own shape.
    pub fn create_reshape_view(
        &mut self,
        parent: TensorId,
        child: TensorId,
    ) -> OpResult<BufferHandle> {
        self.ensure_unbacked(child)?;
        let parent_buffer = self.ensure_buffer(parent)?;
        let spec = self.buffer_spec(child)?;
        let buffer = self.driver.create_reshape_view(parent_buffer, &spec)?;
        let desc = self.tensors.get_mut(child)?;
        desc.buffer = Some(buffer);
        desc.view_of = Some(ViewLink::Reshape { parent });
        Ok(buffer)
    }

    /// Removes a tensor from the store, releasing its buffer or view.
    pub(crate) fn release_tensor(&mut self, id: TensorId) -> Result<(), DriverError> {
        match self.tensors.remove(id) {
            Ok(desc) => match desc.buffer() {
                Some(buffer) => self.driver.release_buffer(buffer),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }

    /// Releases the buffer of every remaining tensor, views first.
    pub(crate) fn release_buffers(&mut self) -> Result<(), DriverError> {
        let mut handles: Vec<(bool, BufferHandle)> = self
            .tensors
            .iter_mut()
            .filter_map(|desc| {
                let is_view = desc.view_of.is_some();
                desc.view_of = None;
                desc.buffer.take().map(|buffer| (is_view, buffer))
            })
            .collect();
        handles.sort_by_key(|(is_view, _)| !*is_view);
        let mut first_error = None;
        for (_, buffer) in handles {
            if let Err(err) = self.driver.release_buffer(buffer) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
