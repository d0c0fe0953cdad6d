//! Kernel variants, their registration tables and the selector that binds them to nodes.
//!
//! A kernel *name* (e.g. `"one_hot"`) may be implemented by several backends. Each backend
//! contributes a [`KernelTable`] of variants keyed by the packed dtype tags of the operands.
//! The selector picks a backend the driver can run, folds the operand types, looks the key up
//! and packs the node's tensors and scalars into a [`BoundKernel`].

mod overrides;
mod registry;
mod selector;
mod table;

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::driver::BufferHandle;
use crate::tensor::{DType, Quantization, Shape, TensorId};

pub use overrides::{BackendPolicy, KernelOverrides};
pub use registry::{KernelRegistry, KernelRegistryBuilder, KERNEL_REGISTRARS};
pub use selector::{gpu_check_shape, KernelSelector, GPU_TENSOR_MAX_WIDTH};
pub use table::{
    fold_identity, fold_one_hot, FoldFn, InitializerFn, KernelEntry, KernelTable, ParamDesc,
    ParamDirection, ParamKind, ShapeGateFn,
};

/// Implementation family of a kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelBackend {
    /// Compiled GPU source kernels.
    GpuSource,
    /// Vendor primitives executed by the driver.
    Primitive,
    /// Host reference kernels.
    Cpu,
}

impl KernelBackend {
    /// Default selection priority; higher is tried first.
    pub fn priority(self) -> u8 {
        match self {
            KernelBackend::GpuSource => 3,
            KernelBackend::Primitive => 2,
            KernelBackend::Cpu => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KernelBackend::GpuSource => "gpu_source",
            KernelBackend::Primitive => "primitive",
            KernelBackend::Cpu => "cpu",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gpu" | "gpu_source" | "cl" | "shader" => Some(KernelBackend::GpuSource),
            "primitive" | "vx" | "openvx" => Some(KernelBackend::Primitive),
            "cpu" | "host" => Some(KernelBackend::Cpu),
            _ => None,
        }
    }
}

impl fmt::Display for KernelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Packed dtype tags of a kernel's operands, first input in the most significant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelKey(pub u64);

impl KernelKey {
    pub const fn of1(a: DType) -> Self {
        KernelKey(a.tag() as u64)
    }

    pub const fn of2(input: DType, output: DType) -> Self {
        KernelKey(((input.tag() as u64) << 8) | output.tag() as u64)
    }

    pub const fn of3(a: DType, b: DType, output: DType) -> Self {
        KernelKey(((a.tag() as u64) << 16) | ((b.tag() as u64) << 8) | output.tag() as u64)
    }

    /// Packs any number of operands. Past eight operands the oldest bytes rotate back in.
    pub fn pack(types: impl IntoIterator<Item = DType>) -> Self {
        let key = types
            .into_iter()
            .fold(0u64, |key, dtype| key.rotate_left(8) ^ u64::from(dtype.tag()));
        KernelKey(key)
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Operand dtypes of one kernel invocation, inputs then outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperandTypes {
    pub inputs: SmallVec<[DType; 4]>,
    pub outputs: SmallVec<[DType; 2]>,
}

impl OperandTypes {
    pub fn new(inputs: &[DType], outputs: &[DType]) -> Self {
        OperandTypes {
            inputs: SmallVec::from_slice(inputs),
            outputs: SmallVec::from_slice(outputs),
        }
    }

    pub fn key(&self) -> KernelKey {
        KernelKey::pack(self.iter())
    }

    pub fn iter(&self) -> impl Iterator<Item = DType> + '_ {
        self.inputs.iter().chain(self.outputs.iter()).copied()
    }
}

impl fmt::Display for OperandTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[DType]| {
            types
                .iter()
                .map(|dtype| dtype.name())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({}) -> ({})", join(&self.inputs), join(&self.outputs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    I32,
    U32,
    F32,
    Bool,
    I32Array,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    I32(i32),
    U32(u32),
    F32(f32),
    Bool(bool),
    I32Array(SmallVec<[i32; 8]>),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::I32(_) => ScalarType::I32,
            ScalarValue::U32(_) => ScalarType::U32,
            ScalarValue::F32(_) => ScalarType::F32,
            ScalarValue::Bool(_) => ScalarType::Bool,
            ScalarValue::I32Array(_) => ScalarType::I32Array,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ScalarValue::I32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ScalarValue::U32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ScalarValue::F32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i32_array(&self) -> Option<&[i32]> {
        match self {
            ScalarValue::I32Array(values) => Some(values),
            _ => None,
        }
    }
}

/// Named scalar arguments an operator hands to the selector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelParams {
    values: SmallVec<[(&'static str, ScalarValue); 8]>,
}

impl KernelParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: ScalarValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &'static str, value: ScalarValue) {
        match self.values.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ScalarValue> {
        self.values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

/// A tensor as presented to the selector. The shape may differ from the descriptor's when the
/// operator collapses axes to satisfy a shape gate.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundOperand {
    pub tensor: TensorId,
    pub buffer: Option<BufferHandle>,
    pub shape: Shape,
    pub dtype: DType,
    pub quant: Quantization,
}

/// Everything the selector needs to resolve and bind one kernel.
#[derive(Debug, Clone)]
pub struct BindRequest<'a> {
    pub name: &'a str,
    pub inputs: &'a [BoundOperand],
    pub outputs: &'a [BoundOperand],
    pub params: &'a KernelParams,
}

impl BindRequest<'_> {
    pub fn operand_types(&self) -> OperandTypes {
        OperandTypes {
            inputs: self.inputs.iter().map(|operand| operand.dtype).collect(),
            outputs: self.outputs.iter().map(|operand| operand.dtype).collect(),
        }
    }
}

/// Global and local work sizes computed by a table's initializer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSize {
    pub global: SmallVec<[usize; 3]>,
    pub local: SmallVec<[usize; 3]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Tensor(BoundOperand),
    Scalar(ScalarValue),
}

/// A resolved kernel variant with its arguments packed in declared parameter order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundKernel {
    pub name: String,
    pub backend: KernelBackend,
    pub key: KernelKey,
    pub function: &'static str,
    pub source: &'static str,
    pub params: &'static [ParamDesc],
    pub args: Vec<KernelArg>,
    pub work_size: Option<WorkSize>,
}

impl BoundKernel {
    pub fn tensor_args(&self) -> impl Iterator<Item = &BoundOperand> {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Tensor(operand) => Some(operand),
            KernelArg::Scalar(_) => None,
        })
    }

    /// Tensor arguments bound to parameters of one direction, in declared order.
    pub fn tensors(&self, direction: ParamDirection) -> Vec<&BoundOperand> {
        let fixed = self
            .params
            .iter()
            .filter(|desc| desc.kind == ParamKind::Tensor)
            .count();
        let list_len = self.tensor_args().count().saturating_sub(fixed);
        let mut tensors = self.tensor_args();
        let mut picked = Vec::new();
        for desc in self.params {
            let take = match desc.kind {
                ParamKind::Tensor => 1,
                ParamKind::TensorList => list_len,
                ParamKind::Scalar(_) => 0,
            };
            for operand in tensors.by_ref().take(take) {
                if desc.direction == direction {
                    picked.push(operand);
                }
            }
        }
        picked
    }

    pub fn scalar(&self, name: &str) -> Option<&ScalarValue> {
        self.params
            .iter()
            .filter(|desc| matches!(desc.kind, ParamKind::Scalar(_)))
            .zip(self.args.iter().filter_map(|arg| match arg {
                KernelArg::Scalar(value) => Some(value),
                KernelArg::Tensor(_) => None,
            }))
            .find(|(desc, _)| desc.name == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KernelError {
    #[error("kernel \"{0}\" is not registered")]
    NotFound(String),
    #[error("no registered backend of kernel \"{name}\" can run on this driver")]
    NoEligibleBackend { name: String },
    #[error("{backend} kernel \"{name}\" has no variant for {types}")]
    NoMatchingVariant {
        name: String,
        backend: KernelBackend,
        types: String,
    },
    #[error("{backend} kernel \"{name}\" rejects operand shape {dims:?}")]
    ShapeRejected {
        name: String,
        backend: KernelBackend,
        dims: Vec<usize>,
    },
    #[error("kernel \"{name}\" requires scalar parameter \"{param}\"")]
    MissingParam { name: String, param: &'static str },
    #[error("scalar parameter \"{param}\" of kernel \"{name}\" expects {expected:?}, got {actual:?}")]
    ParamType {
        name: String,
        param: &'static str,
        expected: ScalarType,
        actual: ScalarType,
    },
    #[error("kernel \"{name}\" declares {expected} {direction:?} tensors, got {actual}")]
    OperandCount {
        name: String,
        direction: ParamDirection,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate key {key} in {backend} table \"{name}\"")]
    DuplicateKey {
        name: String,
        backend: KernelBackend,
        key: KernelKey,
    },
    #[error("{backend} table \"{name}\" is already registered")]
    DuplicateTable {
        name: String,
        backend: KernelBackend,
    },
}

pub type KernelResult<T> = Result<T, KernelError>;
