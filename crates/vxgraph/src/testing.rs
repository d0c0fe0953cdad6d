//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::driver::{
    BufferHandle, BufferInit, BufferSpec, Driver, DriverCapabilities, DriverError, DriverResult,
    KernelNodeHandle, ViewRegion,
};
use crate::graph::{Graph, GraphConfig, GraphContext};
use crate::kernel::{
    BoundKernel, KernelBackend, KernelEntry, KernelKey, KernelRegistry, KernelTable,
    OperandTypes, ParamDesc, ScalarType,
};
use crate::ops::OpRegistry;
use crate::tensor::DType;

/// Driver that keeps buffer bytes in memory and only records kernel nodes.
#[derive(Default)]
pub(crate) struct CountingDriver {
    next: AtomicU64,
    pub buffers: Mutex<HashMap<BufferHandle, Vec<u8>>>,
    pub kernels: Mutex<HashMap<KernelNodeHandle, String>>,
    pub released_kernels: Mutex<Vec<KernelNodeHandle>>,
    pub capabilities: DriverCapabilities,
}

impl CountingDriver {
    fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn live_kernels(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn add_buffer(&self, bytes: Vec<u8>) -> BufferHandle {
        let handle = BufferHandle(self.next());
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, bytes);
        handle
    }

    fn require(&self, buffer: BufferHandle) -> DriverResult<()> {
        if self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&buffer)
        {
            Ok(())
        } else {
            Err(DriverError::UnknownBuffer(buffer))
        }
    }
}

impl Driver for CountingDriver {
    fn name(&self) -> &str {
        "counting"
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn create_buffer(&self, spec: &BufferSpec, init: BufferInit<'_>) -> DriverResult<BufferHandle> {
        let bytes = match init {
            BufferInit::Bytes(bytes) => bytes.to_vec(),
            BufferInit::Zeroed | BufferInit::Uninit => vec![0; spec.byte_size()],
        };
        Ok(self.add_buffer(bytes))
    }

    fn create_view(
        &self,
        parent: BufferHandle,
        _region: &ViewRegion,
        spec: &BufferSpec,
    ) -> DriverResult<BufferHandle> {
        self.require(parent)?;
        Ok(self.add_buffer(vec![0; spec.byte_size()]))
    }

    fn create_reshape_view(
        &self,
        parent: BufferHandle,
        spec: &BufferSpec,
    ) -> DriverResult<BufferHandle> {
        self.require(parent)?;
        Ok(self.add_buffer(vec![0; spec.byte_size()]))
    }

    fn write(&self, buffer: BufferHandle, bytes: &[u8]) -> DriverResult<()> {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = buffers
            .get_mut(&buffer)
            .ok_or(DriverError::UnknownBuffer(buffer))?;
        *slot = bytes.to_vec();
        Ok(())
    }

    fn read(&self, buffer: BufferHandle) -> DriverResult<Vec<u8>> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&buffer)
            .cloned()
            .ok_or(DriverError::UnknownBuffer(buffer))
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
        let handle = KernelNodeHandle(self.next());
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, kernel.function.to_string());
        Ok(handle)
    }

    fn release_kernel_node(&self, node: KernelNodeHandle) -> DriverResult<()> {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node)
            .ok_or(DriverError::UnknownKernelNode(node))?;
        self.released_kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node);
        Ok(())
    }

    fn execute(&self, nodes: &[KernelNodeHandle]) -> DriverResult<()> {
        let kernels = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
        match nodes.iter().find(|node| !kernels.contains_key(node)) {
            Some(missing) => Err(DriverError::UnknownKernelNode(*missing)),
            None => Ok(()),
        }
    }
}

const UNARY: &[ParamDesc] = &[ParamDesc::input("input"), ParamDesc::output("output")];
const BINARY: &[ParamDesc] = &[
    ParamDesc::input("lhs"),
    ParamDesc::input("rhs"),
    ParamDesc::output("output"),
];
const CONCAT: &[ParamDesc] = &[
    ParamDesc::inputs("inputs"),
    ParamDesc::output("output"),
    ParamDesc::scalar("axis", ScalarType::I32),
];
const SLICE: &[ParamDesc] = &[
    ParamDesc::input("input"),
    ParamDesc::output("output"),
    ParamDesc::scalar("begin", ScalarType::I32Array),
    ParamDesc::scalar("stride", ScalarType::I32Array),
    ParamDesc::scalar("count", ScalarType::I32Array),
];
const BOX_DECODE: &[ParamDesc] = &[
    ParamDesc::input("input"),
    ParamDesc::output("output"),
    ParamDesc::scalar("scale", ScalarType::F32),
    ParamDesc::scalar("shift", ScalarType::F32),
];

static F32_UNARY: [KernelEntry; 1] = [KernelEntry::new(
    KernelKey::of2(DType::F32, DType::F32),
    "unary_f32",
    "test",
)];
static F32_BINARY: [KernelEntry; 1] = [KernelEntry::new(
    KernelKey::of3(DType::F32, DType::F32, DType::F32),
    "binary_f32",
    "test",
)];

fn first_and_output(types: &OperandTypes) -> OperandTypes {
    OperandTypes::new(&types.inputs[..1.min(types.inputs.len())], &types.outputs)
}

/// Registry with F32-only host tables for every built-in kernel name.
pub(crate) fn kernels() -> Arc<KernelRegistry> {
    let mut builder = KernelRegistry::builder();
    builder
        .register(KernelTable::new("add", KernelBackend::Cpu, &F32_BINARY, BINARY))
        .register(KernelTable::new("sigmoid", KernelBackend::Cpu, &F32_UNARY, UNARY))
        .register(KernelTable::new("tensor_copy", KernelBackend::Cpu, &F32_UNARY, UNARY))
        .register(KernelTable::new("strided_slice", KernelBackend::Cpu, &F32_UNARY, SLICE))
        .register(KernelTable::new("box_decode", KernelBackend::Cpu, &F32_UNARY, BOX_DECODE))
        .register(
            KernelTable::new("concat", KernelBackend::Cpu, &F32_UNARY, CONCAT)
                .with_fold(first_and_output),
        );
    Arc::new(builder.build())
}

pub(crate) fn graph_with(config: GraphConfig) -> (Graph, Arc<CountingDriver>) {
    let driver = Arc::new(CountingDriver::default());
    let graph = Graph::with_registries(
        config,
        driver.clone(),
        Arc::new(OpRegistry::with_registered()),
        kernels(),
    );
    (graph, driver)
}

pub(crate) fn graph() -> (Graph, Arc<CountingDriver>) {
    graph_with(GraphConfig::default())
}

pub(crate) fn context() -> (GraphContext, Arc<CountingDriver>) {
    let driver = Arc::new(CountingDriver::default());
    let cx = GraphContext::new(
        driver.clone(),
        GraphConfig::default(),
        Arc::new(OpRegistry::with_registered()),
        kernels(),
    );
    (cx, driver)
}
