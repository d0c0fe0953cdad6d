use std::fmt;

use serde::{Deserialize, Serialize};

use crate::driver::{BufferHandle, ViewRegion};
use crate::node::NodeUid;

use super::{DType, Quantization, Shape};

/// Index of a tensor descriptor in its graph's tensor store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u32);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Declared properties of a tensor. A missing shape is resolved by the producing node's setup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TensorAttr {
    pub shape: Option<Shape>,
    pub dtype: DType,
    #[serde(default)]
    pub quant: Quantization,
    /// Intermediate tensor whose storage the runtime may place freely.
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub is_const: bool,
}

impl TensorAttr {
    pub fn new(dtype: DType) -> Self {
        TensorAttr {
            dtype,
            ..TensorAttr::default()
        }
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_quant(mut self, quant: Quantization) -> Self {
        self.quant = quant;
        self
    }

    pub fn virtual_tensor(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn constant(mut self) -> Self {
        self.is_const = true;
        self
    }
}

/// Records that a tensor's buffer is a window into another tensor's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewLink {
    Region { parent: TensorId, region: ViewRegion },
    Reshape { parent: TensorId },
}

impl ViewLink {
    pub fn parent(&self) -> TensorId {
        match self {
            ViewLink::Region { parent, .. } | ViewLink::Reshape { parent } => *parent,
        }
    }
}

/// A tensor in the graph: its attributes plus the runtime state attached to it.
#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    pub(crate) id: TensorId,
    pub(crate) attr: TensorAttr,
    pub(crate) buffer: Option<BufferHandle>,
    pub(crate) view_of: Option<ViewLink>,
    /// Node whose internal workspace created this tensor.
    pub(crate) owner: Option<NodeUid>,
    pub(crate) data: Option<Vec<u8>>,
}

impl TensorDescriptor {
    pub(crate) fn new(id: TensorId, attr: TensorAttr) -> Self {
        TensorDescriptor {
            id,
            attr,
            buffer: None,
            view_of: None,
            owner: None,
            data: None,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn attr(&self) -> &TensorAttr {
        &self.attr
    }

    pub fn shape(&self) -> Option<&Shape> {
        self.attr.shape.as_ref()
    }

    pub fn dtype(&self) -> DType {
        self.attr.dtype
    }

    pub fn quant(&self) -> &Quantization {
        &self.attr.quant
    }

    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    pub fn view_of(&self) -> Option<&ViewLink> {
        self.view_of.as_ref()
    }

    pub fn owner(&self) -> Option<NodeUid> {
        self.owner
    }

    pub fn const_data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn is_virtual(&self) -> bool {
        self.attr.is_virtual
    }

    pub fn is_const(&self) -> bool {
        self.attr.is_const
    }

    /// Byte size of the tensor once its shape is known.
    pub fn byte_size(&self) -> Option<usize> {
        self.shape()
            .map(|shape| shape.num_elements() * self.attr.dtype.size_in_bytes())
    }
}
