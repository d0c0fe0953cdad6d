use crate::error::OpResult;
use crate::graph::GraphContext;
use crate::kernel::{KernelParams, ScalarValue};
use crate::node::Node;
use crate::ops::constraint::{io, IoType, OpConstraint};
use crate::ops::{Arity, Operator};
use crate::tensor::DType;

use super::{bind_io, input_ids, output_ids, resolve_output};

static BOX_DECODE_IO: &[&[IoType]] = &[
    &[io(DType::F32), io(DType::F32)],
    &[io(DType::F16), io(DType::F16)],
];

const CONSTRAINT: OpConstraint = OpConstraint::new(1, 1, BOX_DECODE_IO);

/// `output = input * scale + shift` over box coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxDecodeParams {
    pub scale: f32,
    pub shift: f32,
}

impl Default for BoxDecodeParams {
    fn default() -> Self {
        BoxDecodeParams {
            scale: 1.0,
            shift: 0.0,
        }
    }
}

/// Internal operator used by composite detection post-processing.
pub struct BoxDecode;

impl Operator for BoxDecode {
    fn name(&self) -> &'static str {
        "BOX_DECODE"
    }

    fn arity(&self) -> Arity {
        Arity::fixed(1, 1)
    }

    fn init(&self, node: &mut Node) -> OpResult<()> {
        node.set_params(BoxDecodeParams::default());
        Ok(())
    }

    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        CONSTRAINT.validate(cx, node)
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let shape = cx.shape_of(input_ids(node)?[0])?;
        resolve_output(cx, output_ids(node)?[0], shape)
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let p: BoxDecodeParams = node.params.get_or_default();
        let params = KernelParams::new()
            .with("scale", ScalarValue::F32(p.scale))
            .with("shift", ScalarValue::F32(p.shift));
        bind_io(cx, node, "box_decode", &params)
    }
}
