use crate::error::OpResult;
use crate::graph::GraphContext;
use crate::kernel::KernelParams;
use crate::node::Node;
use crate::ops::constraint::{io, qio, IoType, OpConstraint};
use crate::ops::{Arity, Operator};
use crate::tensor::{DType, QuantKind};

use super::{bind_io, input_ids, output_ids, resolve_output};

static ADD_IO: &[&[IoType]] = &[
    &[io(DType::F32), io(DType::F32), io(DType::F32)],
    &[io(DType::F16), io(DType::F16), io(DType::F16)],
    &[io(DType::BF16), io(DType::BF16), io(DType::BF16)],
    &[io(DType::I32), io(DType::I32), io(DType::I32)],
    &[
        qio(DType::U8, QuantKind::Affine),
        qio(DType::U8, QuantKind::Affine),
        qio(DType::U8, QuantKind::Affine),
    ],
    &[
        qio(DType::I8, QuantKind::Dfp),
        qio(DType::I8, QuantKind::Dfp),
        qio(DType::I8, QuantKind::Dfp),
    ],
    &[
        qio(DType::I8, QuantKind::AffineSymmetric),
        qio(DType::I8, QuantKind::AffineSymmetric),
        qio(DType::I8, QuantKind::AffineSymmetric),
    ],
    &[
        qio(DType::I16, QuantKind::Dfp),
        qio(DType::I16, QuantKind::Dfp),
        qio(DType::I16, QuantKind::Dfp),
    ],
];

const CONSTRAINT: OpConstraint = OpConstraint::new(2, 1, ADD_IO);

/// Element-wise sum with broadcasting.
pub struct Add;

impl Operator for Add {
    fn name(&self) -> &'static str {
        "ADD"
    }

    fn arity(&self) -> Arity {
        Arity::fixed(2, 1)
    }

    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        CONSTRAINT.validate(cx, node)
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let inputs = input_ids(node)?;
        let output = output_ids(node)?[0];
        let shape = cx.shape_of(inputs[0])?.broadcast(&cx.shape_of(inputs[1])?)?;
        resolve_output(cx, output, shape)
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        bind_io(cx, node, "add", &KernelParams::new())
    }
}
