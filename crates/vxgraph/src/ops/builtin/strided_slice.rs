use smallvec::SmallVec;

use crate::error::{OpError, OpResult};
use crate::graph::GraphContext;
use crate::kernel::{KernelParams, ScalarValue};
use crate::node::Node;
use crate::ops::{Arity, Operator};
use crate::tensor::Shape;

use super::{bind_io, input_ids, output_ids, resolve_output};

/// Per-axis `begin`, `end` and `stride`, TensorFlow style.
///
/// Bit `i` of `begin_mask`/`end_mask` ignores `begin[i]`/`end[i]` and takes the widest
/// range. Bit `i` of `shrink_axis_mask` keeps only the element at `begin[i]` and drops the
/// axis from the output. Axes past the end of the vectors are taken whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StridedSliceParams {
    pub begin: Vec<i32>,
    pub end: Vec<i32>,
    pub stride: Vec<i32>,
    pub begin_mask: u32,
    pub end_mask: u32,
    pub shrink_axis_mask: u32,
}

/// Slice resolved against a concrete input shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlicePlan {
    pub start: Vec<i32>,
    pub stride: Vec<i32>,
    /// Elements taken per input axis, shrunk axes included as 1.
    pub count: Vec<usize>,
    /// `count` without the shrunk axes.
    pub output: Vec<usize>,
}

impl StridedSliceParams {
    pub(crate) fn plan(&self, input: &[usize]) -> OpResult<SlicePlan> {
        let rank = input.len();
        let mut plan = SlicePlan {
            start: Vec::with_capacity(rank),
            stride: Vec::with_capacity(rank),
            count: Vec::with_capacity(rank),
            output: Vec::with_capacity(rank),
        };
        for (axis, &dim) in input.iter().enumerate() {
            let bit = 1u32.checked_shl(axis as u32).unwrap_or(0);
            let dim = dim as i64;
            let stride = i64::from(self.stride.get(axis).copied().unwrap_or(1));
            if stride == 0 {
                return Err(OpError::invalid(format!("stride of axis {axis} is 0")));
            }
            let clamp = |value: i64, lo: i64, hi: i64| value.max(lo).min(hi);
            let normalize = |value: i32| {
                let value = i64::from(value);
                if value < 0 {
                    value + dim
                } else {
                    value
                }
            };
            let (lo, hi) = if stride > 0 { (0, dim) } else { (-1, dim - 1) };
            let begin = match self.begin.get(axis) {
                Some(&begin) if self.begin_mask & bit == 0 => clamp(normalize(begin), lo, hi),
                _ if stride > 0 => 0,
                _ => dim - 1,
            };
            if self.shrink_axis_mask & bit != 0 {
                if !(0..dim).contains(&begin) {
                    return Err(OpError::invalid(format!(
                        "shrunk axis {axis} starts at {begin}, outside 0..{dim}"
                    )));
                }
                plan.start.push(begin as i32);
                plan.stride.push(1);
                plan.count.push(1);
                continue;
            }
            let end = match self.end.get(axis) {
                Some(&end) if self.end_mask & bit == 0 => clamp(normalize(end), lo, hi),
                _ if stride > 0 => dim,
                _ => -1,
            };
            let span = if stride > 0 { end - begin } else { begin - end };
            let step = stride.abs();
            let count = if span > 0 { (span + step - 1) / step } else { 0 };
            plan.start.push(begin as i32);
            plan.stride.push(stride as i32);
            plan.count.push(count as usize);
            plan.output.push(count as usize);
        }
        if plan.output.is_empty() {
            plan.output.push(1);
        }
        if plan.count.iter().any(|&count| count == 0) {
            return Err(OpError::invalid(format!(
                "slice of {input:?} is empty: {:?}",
                plan.count
            )));
        }
        Ok(plan)
    }
}

pub struct StridedSlice;

impl Operator for StridedSlice {
    fn name(&self) -> &'static str {
        "STRIDED_SLICE"
    }

    fn arity(&self) -> Arity {
        Arity::fixed(1, 1)
    }

    fn init(&self, node: &mut Node) -> OpResult<()> {
        node.set_params(StridedSliceParams::default());
        Ok(())
    }

    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        let (Some(input), Some(output)) = (node.input(0), node.output(0)) else {
            return false;
        };
        match (cx.tensor(input), cx.tensor(output)) {
            (Ok(input), Ok(output)) => {
                !node.attr.enable_op_constraint_check
                    || (input.dtype() == output.dtype()
                        && input.quant().kind() == output.quant().kind())
            }
            _ => false,
        }
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let input = cx.shape_of(input_ids(node)?[0])?;
        let params: StridedSliceParams = node.params.get_or_default();
        let plan = params.plan(input.dims())?;
        resolve_output(cx, output_ids(node)?[0], Shape::new(&plan.output)?)
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let input = cx.shape_of(input_ids(node)?[0])?;
        let params: StridedSliceParams = node.params.get_or_default();
        let plan = params.plan(input.dims())?;
        let count: SmallVec<[i32; 8]> = plan.count.iter().map(|&c| c as i32).collect();
        let kernel_params = KernelParams::new()
            .with("begin", ScalarValue::I32Array(plan.start.iter().copied().collect()))
            .with("stride", ScalarValue::I32Array(plan.stride.iter().copied().collect()))
            .with("count", ScalarValue::I32Array(count));
        bind_io(cx, node, "strided_slice", &kernel_params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(begin: &[i32], end: &[i32], stride: &[i32]) -> StridedSliceParams {
        StridedSliceParams {
            begin: begin.to_vec(),
            end: end.to_vec(),
            stride: stride.to_vec(),
            ..StridedSliceParams::default()
        }
    }

    #[test]
    fn slices_last_axis() {
        let plan = params(&[0, 0, 4], &[1, 3, 6], &[1, 1, 1]).plan(&[1, 3, 6]).unwrap();
        assert_eq!(plan.start, vec![0, 0, 4]);
        assert_eq!(plan.output, vec![1, 3, 2]);
    }

    #[test]
    fn negative_bounds_and_masks() {
        let mut p = params(&[0, -2], &[0, 0], &[1, 1]);
        p.end_mask = 0b11;
        let plan = p.plan(&[2, 5]).unwrap();
        assert_eq!(plan.start, vec![0, 3]);
        assert_eq!(plan.output, vec![2, 2]);
    }

    #[test]
    fn reversed_stride() {
        let mut p = params(&[0], &[0], &[-2]);
        p.begin_mask = 1;
        p.end_mask = 1;
        let plan = p.plan(&[5]).unwrap();
        assert_eq!(plan.start, vec![4]);
        assert_eq!(plan.output, vec![3]);
    }

    #[test]
    fn shrink_drops_axis() {
        let mut p = params(&[1, 0], &[2, 4], &[1, 1]);
        p.shrink_axis_mask = 0b01;
        let plan = p.plan(&[3, 4]).unwrap();
        assert_eq!(plan.count, vec![1, 4]);
        assert_eq!(plan.output, vec![4]);
    }

    #[test]
    fn empty_or_zero_stride_is_rejected() {
        assert!(params(&[3], &[1], &[1]).plan(&[4]).is_err());
        assert!(params(&[0], &[4], &[0]).plan(&[4]).is_err());
    }
}
