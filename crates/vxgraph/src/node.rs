//! Graph nodes and their lifecycle state.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::driver::KernelNodeHandle;
use crate::internal::InternalWorkspace;
use crate::kernel::BoundKernel;
use crate::ops::OpKind;
use crate::tensor::TensorId;

/// Node identifier. Graph nodes count from 0; children count from 1 inside their workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeUid(pub u32);

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Created,
    Initialized,
    Checked,
    ShapeResolved,
    Optimized,
    Computed,
    Deinitialized,
}

/// Where constant operands are staged before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadPolicy {
    /// Driver decides.
    #[default]
    Auto,
    None,
    VipSram,
    AxiSram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub preload: PreloadPolicy,
    pub enable_op_constraint_check: bool,
}

impl Default for NodeAttr {
    fn default() -> Self {
        NodeAttr {
            preload: PreloadPolicy::Auto,
            enable_op_constraint_check: true,
        }
    }
}

/// Operator-specific parameters, stored type-erased.
#[derive(Default)]
pub struct NodeParams(Option<Box<dyn Any + Send + Sync>>);

impl NodeParams {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        NodeParams(Some(Box::new(value)))
    }

    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        self.0 = Some(Box::new(value));
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.as_mut().and_then(|value| value.downcast_mut())
    }

    /// Typed copy of the parameters, or `T::default()` when unset or of another type.
    pub fn get_or_default<T: Any + Clone + Default>(&self) -> T {
        self.get::<T>().cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for NodeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_empty() {
            "NodeParams(empty)"
        } else {
            "NodeParams(..)"
        })
    }
}

/// A kernel bound during compute together with its driver node.
#[derive(Debug, Clone)]
pub struct KernelNode {
    pub kernel: BoundKernel,
    pub handle: KernelNodeHandle,
}

/// Resources released by one node's deinit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Released {
    pub local: bool,
    pub kernel_nodes: usize,
    pub children: Vec<NodeUid>,
    pub tensors: Vec<TensorId>,
}

impl Released {
    pub fn total(&self) -> usize {
        usize::from(self.local) + self.kernel_nodes + self.children.len() + self.tensors.len()
    }
}

pub struct Node {
    uid: NodeUid,
    parent: Option<NodeUid>,
    kind: OpKind,
    inputs: SmallVec<[Option<TensorId>; 4]>,
    outputs: SmallVec<[Option<TensorId>; 2]>,
    pub params: NodeParams,
    pub attr: NodeAttr,
    pub(crate) state: NodeState,
    local: Option<Box<dyn Any + Send>>,
    pub(crate) workspace: Option<InternalWorkspace>,
    pub(crate) kernels: Vec<KernelNode>,
}

impl Node {
    pub(crate) fn new(
        uid: NodeUid,
        kind: OpKind,
        input_count: usize,
        output_count: usize,
        attr: NodeAttr,
    ) -> Self {
        Node {
            uid,
            parent: None,
            kind,
            inputs: SmallVec::from_elem(None, input_count),
            outputs: SmallVec::from_elem(None, output_count),
            params: NodeParams::default(),
            attr,
            state: NodeState::Created,
            local: None,
            workspace: None,
            kernels: Vec::new(),
        }
    }

    pub(crate) fn with_parent(mut self, parent: NodeUid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    /// Owning node when this node was created by an internal workspace.
    pub fn parent(&self) -> Option<NodeUid> {
        self.parent
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn inputs(&self) -> &[Option<TensorId>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Option<TensorId>] {
        &self.outputs
    }

    pub fn input(&self, index: usize) -> Option<TensorId> {
        self.inputs.get(index).copied().flatten()
    }

    pub fn output(&self, index: usize) -> Option<TensorId> {
        self.outputs.get(index).copied().flatten()
    }

    pub fn set_input(&mut self, index: usize, tensor: Option<TensorId>) -> bool {
        match self.inputs.get_mut(index) {
            Some(slot) => {
                *slot = tensor;
                true
            }
            None => false,
        }
    }

    pub fn set_output(&mut self, index: usize, tensor: Option<TensorId>) -> bool {
        match self.outputs.get_mut(index) {
            Some(slot) => {
                *slot = tensor;
                true
            }
            None => false,
        }
    }

    pub fn set_params<T: Any + Send + Sync>(&mut self, params: T) {
        self.params.set(params);
    }

    pub fn local<T: Any>(&self) -> Option<&T> {
        self.local.as_ref().and_then(|value| value.downcast_ref())
    }

    pub fn local_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.local.as_mut().and_then(|value| value.downcast_mut())
    }

    pub fn set_local<T: Any + Send>(&mut self, value: T) {
        self.local = Some(Box::new(value));
    }

    pub(crate) fn take_local(&mut self) -> Option<Box<dyn Any + Send>> {
        self.local.take()
    }

    pub fn workspace(&self) -> Option<&InternalWorkspace> {
        self.workspace.as_ref()
    }

    pub fn kernel_nodes(&self) -> &[KernelNode] {
        &self.kernels
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("uid", &self.uid)
            .field("parent", &self.parent)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("children", &self.workspace.as_ref().map(|w| w.node_count()))
            .finish()
    }
}
