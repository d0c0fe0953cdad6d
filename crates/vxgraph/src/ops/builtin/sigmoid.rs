use crate::error::OpResult;
use crate::graph::GraphContext;
use crate::kernel::KernelParams;
use crate::node::Node;
use crate::ops::constraint::{io, qio, IoType, OpConstraint};
use crate::ops::{Arity, Operator};
use crate::tensor::{DType, QuantKind};

use super::{bind_io, input_ids, output_ids, resolve_output};

static SIGMOID_IO: &[&[IoType]] = &[
    &[io(DType::F32), io(DType::F32)],
    &[io(DType::F16), io(DType::F16)],
    &[io(DType::BF16), io(DType::BF16)],
    &[qio(DType::U8, QuantKind::Affine), qio(DType::U8, QuantKind::Affine)],
    &[qio(DType::U8, QuantKind::Affine), io(DType::F16)],
    &[qio(DType::I8, QuantKind::Dfp), qio(DType::I8, QuantKind::Dfp)],
    &[qio(DType::I16, QuantKind::Dfp), qio(DType::I16, QuantKind::Dfp)],
];

const CONSTRAINT: OpConstraint = OpConstraint::new(1, 1, SIGMOID_IO);

pub struct Sigmoid;

impl Operator for Sigmoid {
    fn name(&self) -> &'static str {
        "SIGMOID"
    }

    fn arity(&self) -> Arity {
        Arity::fixed(1, 1)
    }

    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        CONSTRAINT.validate(cx, node)
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let shape = cx.shape_of(input_ids(node)?[0])?;
        resolve_output(cx, output_ids(node)?[0], shape)
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        bind_io(cx, node, "sigmoid", &KernelParams::new())
    }
}
