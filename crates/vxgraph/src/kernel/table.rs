use super::{BindRequest, KernelBackend, KernelKey, OperandTypes, ScalarType, WorkSize};
use crate::tensor::DType;

/// Maps raw operand types onto the types a table actually keys on.
pub type FoldFn = fn(&OperandTypes) -> OperandTypes;

/// Rejects operand shapes a backend cannot address.
pub type ShapeGateFn = fn(&BindRequest<'_>) -> bool;

/// Computes launch dimensions once a variant is bound.
pub type InitializerFn = fn(&BindRequest<'_>) -> WorkSize;

pub fn fold_identity(types: &OperandTypes) -> OperandTypes {
    types.clone()
}

/// One-hot tables key half precision as float32 on both sides and narrow integer outputs
/// as int32.
pub fn fold_one_hot(types: &OperandTypes) -> OperandTypes {
    let half = |dtype: &DType| match dtype {
        DType::F16 => DType::F32,
        other => *other,
    };
    OperandTypes {
        inputs: types.inputs.iter().map(half).collect(),
        outputs: types
            .outputs
            .iter()
            .map(|dtype| match dtype {
                DType::I8 | DType::I16 => DType::I32,
                other => half(other),
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Tensor,
    /// Consumes every remaining tensor of its direction.
    TensorList,
    Scalar(ScalarType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDesc {
    pub direction: ParamDirection,
    pub kind: ParamKind,
    pub name: &'static str,
}

impl ParamDesc {
    pub const fn input(name: &'static str) -> Self {
        ParamDesc {
            direction: ParamDirection::In,
            kind: ParamKind::Tensor,
            name,
        }
    }

    pub const fn inputs(name: &'static str) -> Self {
        ParamDesc {
            direction: ParamDirection::In,
            kind: ParamKind::TensorList,
            name,
        }
    }

    pub const fn output(name: &'static str) -> Self {
        ParamDesc {
            direction: ParamDirection::Out,
            kind: ParamKind::Tensor,
            name,
        }
    }

    pub const fn scalar(name: &'static str, ty: ScalarType) -> Self {
        ParamDesc {
            direction: ParamDirection::In,
            kind: ParamKind::Scalar(ty),
            name,
        }
    }
}

/// One implementation of a kernel for a specific folded type key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEntry {
    pub key: KernelKey,
    pub function: &'static str,
    /// Identifier of the program source the function lives in.
    pub source: &'static str,
}

impl KernelEntry {
    pub const fn new(key: KernelKey, function: &'static str, source: &'static str) -> Self {
        KernelEntry {
            key,
            function,
            source,
        }
    }
}

/// All variants one backend provides for one kernel name.
#[derive(Debug, Clone, Copy)]
pub struct KernelTable {
    pub name: &'static str,
    pub backend: KernelBackend,
    pub entries: &'static [KernelEntry],
    pub params: &'static [ParamDesc],
    pub fold: FoldFn,
    pub gate: Option<ShapeGateFn>,
    pub initializer: Option<InitializerFn>,
}

impl KernelTable {
    pub const fn new(
        name: &'static str,
        backend: KernelBackend,
        entries: &'static [KernelEntry],
        params: &'static [ParamDesc],
    ) -> Self {
        KernelTable {
            name,
            backend,
            entries,
            params,
            fold: fold_identity,
            gate: None,
            initializer: None,
        }
    }

    pub const fn with_fold(mut self, fold: FoldFn) -> Self {
        self.fold = fold;
        self
    }

    pub const fn with_gate(mut self, gate: ShapeGateFn) -> Self {
        self.gate = Some(gate);
        self
    }

    pub const fn with_initializer(mut self, initializer: InitializerFn) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// First entry whose key matches the folded operand types.
    pub fn query(&self, types: &OperandTypes) -> Option<(usize, &'static KernelEntry)> {
        let key = (self.fold)(types).key();
        self.entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.key == key)
    }

    pub(crate) fn first_duplicate(&self) -> Option<KernelKey> {
        self.entries.iter().enumerate().find_map(|(idx, entry)| {
            self.entries[..idx]
                .iter()
                .any(|earlier| earlier.key == entry.key)
                .then_some(entry.key)
        })
    }
}
