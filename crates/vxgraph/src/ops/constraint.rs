//! Declarative operand type tables used by operator `check` callbacks.

use crate::graph::GraphContext;
use crate::node::Node;
use crate::tensor::{DType, QuantKind, TensorId};

/// Data type and quantization family of one operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoType {
    pub dtype: DType,
    pub quant: QuantKind,
}

/// Unquantized slot type.
pub const fn io(dtype: DType) -> IoType {
    IoType {
        dtype,
        quant: QuantKind::None,
    }
}

/// Quantized slot type.
pub const fn qio(dtype: DType, quant: QuantKind) -> IoType {
    IoType { dtype, quant }
}

/// Slot type of an absent optional operand.
pub const OPTIONAL: IoType = io(DType::None);

impl IoType {
    /// A tensor matches a row slot when the dtypes are equal and, for quantized tensors,
    /// the quantization families are equal too. Unquantized tensors match any row quant.
    pub fn accepts(self, actual: IoType) -> bool {
        actual.dtype == self.dtype
            && (actual.quant == QuantKind::None || actual.quant == self.quant)
    }
}

/// Legal operand type combinations of an operator, one row per combination.
#[derive(Debug, Clone, Copy)]
pub struct OpConstraint {
    inputs: usize,
    outputs: usize,
    rows: &'static [&'static [IoType]],
}

impl OpConstraint {
    pub const fn new(inputs: usize, outputs: usize, rows: &'static [&'static [IoType]]) -> Self {
        OpConstraint {
            inputs,
            outputs,
            rows,
        }
    }

    pub fn rows(&self) -> &'static [&'static [IoType]] {
        self.rows
    }

    /// Slot types of the node's registered operands. Absent operands read as [`OPTIONAL`].
    pub fn signature(&self, cx: &GraphContext, node: &Node) -> Vec<IoType> {
        let slot = |tensor: Option<TensorId>| {
            tensor
                .and_then(|id| cx.tensors().get(id).ok())
                .map(|desc| qio(desc.dtype(), desc.quant().kind()))
                .unwrap_or(OPTIONAL)
        };
        (0..self.inputs)
            .map(|idx| slot(node.input(idx)))
            .chain((0..self.outputs).map(|idx| slot(node.output(idx))))
            .collect()
    }

    pub fn matches(&self, signature: &[IoType]) -> bool {
        self.rows.iter().any(|row| {
            row.len() == signature.len()
                && row
                    .iter()
                    .zip(signature)
                    .all(|(expected, actual)| expected.accepts(*actual))
        })
    }

    /// Checks the node against the table unless its constraint check is disabled.
    pub fn validate(&self, cx: &GraphContext, node: &Node) -> bool {
        if !node.attr.enable_op_constraint_check {
            return true;
        }
        self.matches(&self.signature(cx, node))
    }
}

/// `"<QUANT> <DTYPE>"` of every present operand, inputs first, comma separated.
pub fn describe_io(cx: &GraphContext, node: &Node) -> String {
    node.inputs()
        .iter()
        .chain(node.outputs())
        .flatten()
        .filter_map(|id| cx.tensors().get(*id).ok())
        .map(|desc| {
            let quant = desc.quant().kind().name();
            if quant.is_empty() {
                desc.dtype().name().to_string()
            } else {
                format!("{quant} {}", desc.dtype().name())
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    static ROWS: &[&[IoType]] = &[
        &[io(DType::F32), io(DType::F32)],
        &[qio(DType::U8, QuantKind::Affine), qio(DType::U8, QuantKind::Affine)],
        &[io(DType::I32), OPTIONAL],
    ];

    #[test]
    fn unquantized_tensor_matches_quantized_row() {
        let table = OpConstraint::new(1, 1, ROWS);
        assert!(table.matches(&[io(DType::U8), io(DType::U8)]));
        assert!(table.matches(&[
            qio(DType::U8, QuantKind::Affine),
            qio(DType::U8, QuantKind::Affine)
        ]));
        assert!(!table.matches(&[
            qio(DType::U8, QuantKind::Dfp),
            qio(DType::U8, QuantKind::Affine)
        ]));
    }

    #[test]
    fn dtype_must_match_exactly() {
        let table = OpConstraint::new(1, 1, ROWS);
        assert!(table.matches(&[io(DType::F32), io(DType::F32)]));
        assert!(!table.matches(&[io(DType::F32), io(DType::F16)]));
        assert!(table.matches(&[io(DType::I32), OPTIONAL]));
        assert!(!table.matches(&[io(DType::I32), io(DType::I32)]));
    }
}
