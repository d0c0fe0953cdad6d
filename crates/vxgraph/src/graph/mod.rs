//! Graph construction and the build/run lifecycle.

mod config;
mod context;
mod optimize;
mod topology;

use std::sync::Arc;

use crate::diagnostics::Diagnostics;
use crate::driver::{BufferHandle, Driver, KernelNodeHandle};
use crate::error::{GraphError, GraphResult, IoSide};
use crate::internal;
use crate::kernel::KernelRegistry;
use crate::node::{Node, NodeAttr, NodeState, NodeUid, Released};
use crate::ops::{dispatch, OpKind, OpRegistry};
use crate::tensor::{convert, TensorAttr, TensorDescriptor, TensorError, TensorId};

pub use config::GraphConfig;
pub use context::GraphContext;
pub use optimize::{
    OptimizeContext, OptimizeDecision, OptimizeDirection, OptimizeReport, OptimizeVisit,
    PassResult, ViewPredicate,
};
pub use topology::{sort_nodes, validate_topology, TopologyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Building,
    Ready,
    /// A build or run failed and every node was torn down.
    Failed,
    Released,
}

/// A graph of operator nodes bound to one driver.
pub struct Graph {
    cx: GraphContext,
    nodes: Vec<Node>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    order: Vec<usize>,
    state: GraphState,
    report: Option<OptimizeReport>,
}

impl Graph {
    /// Graph using the process-wide operator and kernel registries.
    pub fn new(config: GraphConfig, driver: Arc<dyn Driver>) -> Self {
        Self::with_registries(config, driver, OpRegistry::global(), KernelRegistry::global())
    }

    pub fn with_registries(
        config: GraphConfig,
        driver: Arc<dyn Driver>,
        ops: Arc<OpRegistry>,
        kernels: Arc<KernelRegistry>,
    ) -> Self {
        tracing::debug!(driver = driver.name(), "graph created");
        let config = config.with_env_overrides();
        Graph {
            cx: GraphContext::new(driver, config, ops, kernels),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            order: Vec::new(),
            state: GraphState::Building,
            report: None,
        }
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn context(&self) -> &GraphContext {
        &self.cx
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        self.cx.diagnostics()
    }

    /// Pass statistics and visit order of the last successful build.
    pub fn optimize_report(&self) -> Option<&OptimizeReport> {
        self.report.as_ref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, uid: NodeUid) -> Option<&Node> {
        self.nodes.get(uid.0 as usize)
    }

    fn node_mut(&mut self, uid: NodeUid) -> GraphResult<&mut Node> {
        self.nodes
            .get_mut(uid.0 as usize)
            .ok_or(GraphError::UnknownNode(uid))
    }

    pub fn tensor(&self, id: TensorId) -> GraphResult<&TensorDescriptor> {
        Ok(self.cx.tensor(id)?)
    }

    fn require_building(&self) -> GraphResult<()> {
        match self.state {
            GraphState::Building => Ok(()),
            GraphState::Ready => Err(GraphError::NotReady("already built")),
            GraphState::Failed => Err(GraphError::NotReady("failed")),
            GraphState::Released => Err(GraphError::NotReady("released")),
        }
    }

    fn require_ready(&self) -> GraphResult<()> {
        match self.state {
            GraphState::Ready => Ok(()),
            GraphState::Building => Err(GraphError::NotReady("not built")),
            GraphState::Failed => Err(GraphError::NotReady("failed")),
            GraphState::Released => Err(GraphError::NotReady("released")),
        }
    }

    pub fn add_tensor(&mut self, attr: TensorAttr) -> GraphResult<TensorId> {
        self.require_building()?;
        if attr.is_const {
            return Err(TensorError::InvalidAttr(
                "const tensors need data, use add_const_tensor".into(),
            )
            .into());
        }
        Ok(self.cx.insert_tensor(attr))
    }

    /// Adds a const tensor. `data` must hold exactly the tensor's bytes.
    pub fn add_const_tensor(&mut self, attr: TensorAttr, data: Vec<u8>) -> GraphResult<TensorId> {
        self.require_building()?;
        let shape = attr.shape.as_ref().ok_or_else(|| {
            TensorError::InvalidAttr("const tensors need a shape".into())
        })?;
        let expected = shape.num_elements() * attr.dtype.size_in_bytes();
        if expected != data.len() {
            return Err(TensorError::ConstSize {
                expected,
                actual: data.len(),
            }
            .into());
        }
        let id = self.cx.insert_tensor(attr.constant());
        self.cx.tensors_mut().get_mut(id)?.data = Some(data);
        Ok(id)
    }

    /// Creates and initializes a node. A count of 0 takes the operator's default.
    pub fn new_node(
        &mut self,
        kind: OpKind,
        input_count: usize,
        output_count: usize,
    ) -> GraphResult<NodeUid> {
        self.require_building()?;
        let op = self
            .cx
            .ops()
            .get_proc(kind)
            .ok_or_else(|| GraphError::UnregisteredOp {
                op: kind.to_string(),
            })?;
        let uid = NodeUid(self.nodes.len() as u32);
        let arity = op.arity();
        let inputs =
            internal::resolve_count(arity.inputs, input_count, uid, op.name(), IoSide::Inputs)?;
        let outputs =
            internal::resolve_count(arity.outputs, output_count, uid, op.name(), IoSide::Outputs)?;
        let attr = NodeAttr {
            preload: self.cx.config().preload,
            enable_op_constraint_check: self.cx.config().enable_op_constraint_check,
        };
        let mut node = Node::new(uid, kind, inputs, outputs, attr);
        dispatch::init(&mut self.cx, &mut node)?;
        self.nodes.push(node);
        Ok(uid)
    }

    /// Wires every input and output slot of `uid`.
    pub fn set_node_io(
        &mut self,
        uid: NodeUid,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> GraphResult<()> {
        self.require_building()?;
        for &id in inputs.iter().chain(outputs) {
            self.cx.tensor(id)?;
        }
        let node = self.node_mut(uid)?;
        for (side, expected, actual) in [
            (IoSide::Inputs, node.inputs().len(), inputs.len()),
            (IoSide::Outputs, node.outputs().len(), outputs.len()),
        ] {
            if expected != actual {
                return Err(GraphError::ArityMismatch {
                    node: uid,
                    op: node.kind().name(),
                    side,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        for (index, &id) in inputs.iter().enumerate() {
            node.set_input(index, Some(id));
        }
        for (index, &id) in outputs.iter().enumerate() {
            node.set_output(index, Some(id));
        }
        Ok(())
    }

    /// Wires one input slot; `None` leaves an optional input empty.
    pub fn set_node_input(
        &mut self,
        uid: NodeUid,
        index: usize,
        tensor: Option<TensorId>,
    ) -> GraphResult<()> {
        self.require_building()?;
        if let Some(id) = tensor {
            self.cx.tensor(id)?;
        }
        let node = self.node_mut(uid)?;
        if !node.set_input(index, tensor) {
            return Err(GraphError::ArityMismatch {
                node: uid,
                op: node.kind().name(),
                side: IoSide::Inputs,
                expected: node.inputs().len().to_string(),
                actual: index + 1,
            });
        }
        Ok(())
    }

    pub fn set_params<T: std::any::Any + Send + Sync>(
        &mut self,
        uid: NodeUid,
        params: T,
    ) -> GraphResult<()> {
        self.require_building()?;
        self.node_mut(uid)?.set_params(params);
        Ok(())
    }

    /// Overrides the node's constraint-check toggle.
    pub fn set_node_attr(&mut self, uid: NodeUid, attr: NodeAttr) -> GraphResult<()> {
        self.require_building()?;
        self.node_mut(uid)?.attr = attr;
        Ok(())
    }

    pub fn set_inputs(&mut self, inputs: &[TensorId]) -> GraphResult<()> {
        for &id in inputs {
            self.cx.tensor(id)?;
        }
        self.inputs = inputs.to_vec();
        Ok(())
    }

    pub fn set_outputs(&mut self, outputs: &[TensorId]) -> GraphResult<()> {
        for &id in outputs {
            self.cx.tensor(id)?;
        }
        self.outputs = outputs.to_vec();
        Ok(())
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Runs only the check phase of one node.
    pub fn check_node(&mut self, uid: NodeUid) -> GraphResult<()> {
        let node = self
            .nodes
            .get_mut(uid.0 as usize)
            .ok_or(GraphError::UnknownNode(uid))?;
        dispatch::check(&mut self.cx, node)
    }

    /// Runs only the setup phase of one node.
    pub fn setup_node(&mut self, uid: NodeUid) -> GraphResult<()> {
        let node = self
            .nodes
            .get_mut(uid.0 as usize)
            .ok_or(GraphError::UnknownNode(uid))?;
        dispatch::setup(&mut self.cx, node)
    }

    /// Deinitializes one node and reports what it released.
    pub fn deinit_node(&mut self, uid: NodeUid) -> GraphResult<Released> {
        let node = self
            .nodes
            .get_mut(uid.0 as usize)
            .ok_or(GraphError::UnknownNode(uid))?;
        dispatch::deinit(&mut self.cx, node)
    }

    /// Orders, checks, sets up, optimizes and computes every node.
    ///
    /// On failure every node is deinitialized and the graph becomes [`GraphState::Failed`].
    #[tracing::instrument(skip(self), fields(nodes = self.nodes.len()))]
    pub fn setup(&mut self) -> GraphResult<()> {
        self.require_building()?;
        match self.build() {
            Ok(()) => {
                self.state = GraphState::Ready;
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "graph setup failed");
                self.fail();
                Err(err)
            }
        }
    }

    fn build(&mut self) -> GraphResult<()> {
        self.order = if self.cx.config().sort_nodes {
            sort_nodes(&self.nodes)?
        } else {
            let order: Vec<usize> = (0..self.nodes.len()).collect();
            validate_topology(&self.nodes, &order)?;
            order
        };
        tracing::info!(order = ?self.order, "nodes sorted");

        for &index in &self.order {
            let node = &mut self.nodes[index];
            if node.state() == NodeState::Initialized {
                dispatch::check(&mut self.cx, node)?;
            }
            if node.state() == NodeState::Checked {
                dispatch::setup(&mut self.cx, node)?;
            }
        }

        let (forward, mut visits) = self.optimize_pass(OptimizeDirection::Forward)?;
        let (backward, backward_visits) = self.optimize_pass(OptimizeDirection::Backward)?;
        visits.extend(backward_visits);
        tracing::info!(?forward, ?backward, "graph optimized");
        self.report = Some(OptimizeReport {
            forward,
            backward,
            visits,
        });

        for &index in &self.order {
            let node = &mut self.nodes[index];
            let operands: Vec<TensorId> = node
                .inputs()
                .iter()
                .chain(node.outputs())
                .flatten()
                .copied()
                .collect();
            for id in operands {
                self.cx.ensure_buffer(id).map_err(|err| GraphError::ComputeFailed {
                    node: node.uid(),
                    op: node.kind().name(),
                    reason: err.to_string(),
                })?;
            }
            dispatch::compute(&mut self.cx, node)?;
        }
        tracing::info!(kernels = self.kernel_handles().len(), "graph computed");
        Ok(())
    }

    fn optimize_pass(
        &mut self,
        direction: OptimizeDirection,
    ) -> GraphResult<(PassResult, Vec<OptimizeVisit>)> {
        let mut ocx = OptimizeContext::new(&mut self.cx, direction);
        let mut pass = PassResult::default();
        let mut visit = |index: usize| -> GraphResult<()> {
            pass.record(dispatch::optimize(&mut ocx, &mut self.nodes[index])?);
            Ok(())
        };
        match direction {
            OptimizeDirection::Forward => self.order.iter().try_for_each(|&i| visit(i))?,
            OptimizeDirection::Backward => self.order.iter().rev().try_for_each(|&i| visit(i))?,
        }
        Ok((pass, ocx.into_visits()))
    }

    /// Kernel nodes in execution order, children in creation order within their parent.
    pub fn kernel_handles(&self) -> Vec<KernelNodeHandle> {
        fn collect(node: &Node, handles: &mut Vec<KernelNodeHandle>) {
            if let Some(ws) = node.workspace() {
                for child in ws.nodes() {
                    collect(child, handles);
                }
            }
            handles.extend(node.kernel_nodes().iter().map(|kernel| kernel.handle));
        }
        let mut handles = Vec::new();
        for &index in &self.order {
            collect(&self.nodes[index], &mut handles);
        }
        handles
    }

    /// Executes every kernel node once.
    #[tracing::instrument(skip(self))]
    pub fn run(&mut self) -> GraphResult<()> {
        self.require_ready()?;
        let handles = self.kernel_handles();
        if let Err(source) = self.cx.driver().execute(&handles) {
            let err = GraphError::Device(source);
            tracing::error!(error = %err, "graph run failed");
            self.fail();
            return Err(err);
        }
        tracing::debug!(kernels = handles.len(), "graph executed");
        Ok(())
    }

    fn buffer_of(&self, id: TensorId) -> GraphResult<BufferHandle> {
        self.require_ready()?;
        self.cx
            .tensor(id)?
            .buffer()
            .ok_or(GraphError::Tensor(TensorError::Unresolved(id)))
    }

    pub fn write_tensor(&mut self, id: TensorId, bytes: &[u8]) -> GraphResult<()> {
        let buffer = self.buffer_of(id)?;
        Ok(self.cx.driver().write(buffer, bytes)?)
    }

    pub fn read_tensor(&self, id: TensorId) -> GraphResult<Vec<u8>> {
        let buffer = self.buffer_of(id)?;
        Ok(self.cx.driver().read(buffer)?)
    }

    /// Writes `values`, quantized to the tensor's type.
    pub fn write_f32(&mut self, id: TensorId, values: &[f32]) -> GraphResult<()> {
        let desc = self.cx.tensor(id)?;
        let bytes = convert::encode(desc.dtype(), desc.quant(), values);
        self.write_tensor(id, &bytes)
    }

    /// Reads the tensor back as dequantized `f32` values.
    pub fn read_f32(&self, id: TensorId) -> GraphResult<Vec<f32>> {
        let bytes = self.read_tensor(id)?;
        let desc = self.cx.tensor(id)?;
        Ok(convert::decode(desc.dtype(), desc.quant(), &bytes)?)
    }

    /// Rebinds the kernels of one node, e.g. after its parameters changed.
    ///
    /// The node's old kernels are released first, so a failure tears the whole graph down
    /// and leaves it [`GraphState::Failed`].
    pub fn recompute(&mut self, uid: NodeUid) -> GraphResult<()> {
        self.require_ready()?;
        let node = self
            .nodes
            .get_mut(uid.0 as usize)
            .ok_or(GraphError::UnknownNode(uid))?;
        if let Err(err) = dispatch::compute(&mut self.cx, node) {
            tracing::error!(node = uid.0, error = %err, "recompute failed");
            self.fail();
            return Err(err);
        }
        Ok(())
    }

    /// Mutable parameters of a built node, for use with [`Graph::recompute`].
    pub fn params_mut<T: std::any::Any>(&mut self, uid: NodeUid) -> GraphResult<Option<&mut T>> {
        Ok(self.node_mut(uid)?.params.get_mut::<T>())
    }

    fn fail(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::warn!(error = %err, "teardown after failure was incomplete");
        }
        self.state = GraphState::Failed;
    }

    /// Deinitializes every live node, newest first, then releases the remaining buffers.
    fn teardown(&mut self) -> GraphResult<Vec<Released>> {
        let mut released = Vec::new();
        let mut first_error = None;
        for node in self.nodes.iter_mut().rev() {
            if matches!(node.state(), NodeState::Created | NodeState::Deinitialized) {
                continue;
            }
            match dispatch::deinit(&mut self.cx, node) {
                Ok(r) => released.push(r),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Err(source) = self.cx.release_buffers() {
            first_error.get_or_insert(GraphError::Device(source));
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }

    /// Releases every node and buffer. Dropping the graph does the same.
    pub fn release(&mut self) -> GraphResult<Vec<Released>> {
        if self.state == GraphState::Released {
            return Ok(Vec::new());
        }
        let result = self.teardown();
        self.state = GraphState::Released;
        result
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "graph release failed");
        }
    }
}
