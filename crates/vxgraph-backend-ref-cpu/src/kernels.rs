//! CPU reference kernels and the tables that register them.
//!
//! Every kernel decodes its operands to `f32`, computes in real values and re-encodes the
//! result in the output's type and quantization.

use vxgraph::driver::{DriverError, DriverResult};
use vxgraph::kernel::{
    fold_one_hot, BoundKernel, BoundOperand, KernelBackend, KernelEntry, KernelKey,
    KernelRegistryBuilder, KernelTable, OperandTypes, ParamDesc, ParamDirection, ScalarType,
    ScalarValue,
};
use vxgraph::tensor::DType;

use crate::driver::HostDriver;

const SOURCE: &str = "host";

const UNARY: &[ParamDesc] = &[ParamDesc::input("input"), ParamDesc::output("output")];
const BINARY: &[ParamDesc] = &[
    ParamDesc::input("lhs"),
    ParamDesc::input("rhs"),
    ParamDesc::output("output"),
];
const BOX_DECODE: &[ParamDesc] = &[
    ParamDesc::input("input"),
    ParamDesc::output("output"),
    ParamDesc::scalar("scale", ScalarType::F32),
    ParamDesc::scalar("shift", ScalarType::F32),
];
const STRIDED_SLICE: &[ParamDesc] = &[
    ParamDesc::input("input"),
    ParamDesc::output("output"),
    ParamDesc::scalar("begin", ScalarType::I32Array),
    ParamDesc::scalar("stride", ScalarType::I32Array),
    ParamDesc::scalar("count", ScalarType::I32Array),
];
const CONCAT: &[ParamDesc] = &[
    ParamDesc::inputs("inputs"),
    ParamDesc::output("output"),
    ParamDesc::scalar("axis", ScalarType::I32),
];
const ONE_HOT: &[ParamDesc] = &[
    ParamDesc::input("indices"),
    ParamDesc::output("output"),
    ParamDesc::scalar("depth", ScalarType::I32),
    ParamDesc::scalar("on_value", ScalarType::F32),
    ParamDesc::scalar("off_value", ScalarType::F32),
    ParamDesc::scalar("axis", ScalarType::I32),
];

macro_rules! same_type {
    ($kernel:literal; $($dtype:ident => $suffix:literal),+ $(,)?) => {
        [$(KernelEntry::new(
            KernelKey::of2(DType::$dtype, DType::$dtype),
            concat!($kernel, "_", $suffix),
            SOURCE,
        )),+]
    };
}

static ADD_ENTRIES: [KernelEntry; 7] = [
    KernelEntry::new(KernelKey::of3(DType::F32, DType::F32, DType::F32), "add_f32", SOURCE),
    KernelEntry::new(KernelKey::of3(DType::F16, DType::F16, DType::F16), "add_f16", SOURCE),
    KernelEntry::new(KernelKey::of3(DType::BF16, DType::BF16, DType::BF16), "add_bf16", SOURCE),
    KernelEntry::new(KernelKey::of3(DType::I32, DType::I32, DType::I32), "add_i32", SOURCE),
    KernelEntry::new(KernelKey::of3(DType::U8, DType::U8, DType::U8), "add_u8", SOURCE),
    KernelEntry::new(KernelKey::of3(DType::I8, DType::I8, DType::I8), "add_i8", SOURCE),
    KernelEntry::new(KernelKey::of3(DType::I16, DType::I16, DType::I16), "add_i16", SOURCE),
];

static SIGMOID_ENTRIES: [KernelEntry; 7] = [
    KernelEntry::new(KernelKey::of2(DType::F32, DType::F32), "sigmoid_f32", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::F16, DType::F16), "sigmoid_f16", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::BF16, DType::BF16), "sigmoid_bf16", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::U8, DType::U8), "sigmoid_u8", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::U8, DType::F16), "sigmoid_u8_f16", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::I8, DType::I8), "sigmoid_i8", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::I16, DType::I16), "sigmoid_i16", SOURCE),
];

static COPY_ENTRIES: [KernelEntry; 9] = same_type!("tensor_copy";
    F32 => "f32", F16 => "f16", BF16 => "bf16", I32 => "i32", U32 => "u32",
    U8 => "u8", I8 => "i8", I16 => "i16", Bool8 => "bool8");

static BOX_DECODE_ENTRIES: [KernelEntry; 2] = same_type!("box_decode"; F32 => "f32", F16 => "f16");

static SLICE_ENTRIES: [KernelEntry; 7] = same_type!("strided_slice";
    F32 => "f32", F16 => "f16", BF16 => "bf16", I32 => "i32", U8 => "u8", I8 => "i8", I16 => "i16");

static CONCAT_ENTRIES: [KernelEntry; 7] = same_type!("concat";
    F32 => "f32", F16 => "f16", BF16 => "bf16", I32 => "i32", U8 => "u8", I8 => "i8", I16 => "i16");

static ONE_HOT_ENTRIES: [KernelEntry; 4] = [
    KernelEntry::new(KernelKey::of2(DType::F32, DType::F32), "one_hot_f32", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::I32, DType::I32), "one_hot_i32", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::I32, DType::F32), "one_hot_i32_f32", SOURCE),
    KernelEntry::new(KernelKey::of2(DType::U8, DType::U8), "one_hot_u8", SOURCE),
];

/// Concat is keyed on its first input and its output; every input shares one type.
fn fold_first_input(types: &OperandTypes) -> OperandTypes {
    OperandTypes::new(&types.inputs[..types.inputs.len().min(1)], &types.outputs)
}

/// Adds the host tables for every kernel this crate can execute.
pub fn register_cpu_kernels(builder: &mut KernelRegistryBuilder) {
    builder
        .register(KernelTable::new("add", KernelBackend::Cpu, &ADD_ENTRIES, BINARY))
        .register(KernelTable::new("sigmoid", KernelBackend::Cpu, &SIGMOID_ENTRIES, UNARY))
        .register(KernelTable::new("tensor_copy", KernelBackend::Cpu, &COPY_ENTRIES, UNARY))
        .register(KernelTable::new(
            "box_decode",
            KernelBackend::Cpu,
            &BOX_DECODE_ENTRIES,
            BOX_DECODE,
        ))
        .register(KernelTable::new(
            "strided_slice",
            KernelBackend::Cpu,
            &SLICE_ENTRIES,
            STRIDED_SLICE,
        ))
        .register(
            KernelTable::new("concat", KernelBackend::Cpu, &CONCAT_ENTRIES, CONCAT)
                .with_fold(fold_first_input),
        )
        .register(
            KernelTable::new("one_hot", KernelBackend::Cpu, &ONE_HOT_ENTRIES, ONE_HOT)
                .with_fold(fold_one_hot),
        );
}

#[vxgraph::linkme::distributed_slice(vxgraph::kernel::KERNEL_REGISTRARS)]
#[linkme(crate = vxgraph::linkme)]
static REGISTER_CPU_KERNELS: fn(&mut KernelRegistryBuilder) = register_cpu_kernels;

const SUPPORTED: &[&str] = &[
    "add",
    "sigmoid",
    "tensor_copy",
    "box_decode",
    "strided_slice",
    "concat",
    "one_hot",
];

pub(crate) fn is_supported(name: &str) -> bool {
    SUPPORTED.contains(&name)
}

pub(crate) fn execute(driver: &HostDriver, kernel: &BoundKernel) -> DriverResult<()> {
    let inputs = kernel.tensors(ParamDirection::In);
    let outputs = kernel.tensors(ParamDirection::Out);
    let output = *outputs
        .first()
        .ok_or_else(|| DriverError::execution(format!("{} has no output", kernel.function)))?;
    let values = match kernel.name.as_str() {
        "add" => {
            let (lhs, rhs) = expect_pair(&inputs)?;
            op_add(
                &driver.load(lhs)?,
                lhs.shape.dims(),
                &driver.load(rhs)?,
                rhs.shape.dims(),
                output.shape.dims(),
            )
        }
        "sigmoid" => {
            let input = driver.load(expect_single(&inputs)?)?;
            input.iter().map(|x| 1.0 / (1.0 + (-x).exp())).collect()
        }
        "tensor_copy" => driver.load(expect_single(&inputs)?)?,
        "box_decode" => {
            let scale = scalar_f32(kernel, "scale")?;
            let shift = scalar_f32(kernel, "shift")?;
            let input = driver.load(expect_single(&inputs)?)?;
            input.iter().map(|x| x * scale + shift).collect()
        }
        "strided_slice" => {
            let input = expect_single(&inputs)?;
            op_strided_slice(
                &driver.load(input)?,
                input.shape.dims(),
                scalar_array(kernel, "begin")?,
                scalar_array(kernel, "stride")?,
                scalar_array(kernel, "count")?,
            )?
        }
        "concat" => {
            let mut parts = Vec::with_capacity(inputs.len());
            for input in &inputs {
                parts.push((input.shape.dims().to_vec(), driver.load(input)?));
            }
            op_concat(&parts, output.shape.dims(), scalar_i32(kernel, "axis")?)?
        }
        "one_hot" => {
            let input = expect_single(&inputs)?;
            op_one_hot(
                &driver.load(input)?,
                output.shape.dims(),
                scalar_i32(kernel, "axis")?,
                scalar_f32(kernel, "on_value")?,
                scalar_f32(kernel, "off_value")?,
            )?
        }
        other => {
            return Err(DriverError::unsupported(format!(
                "no host implementation of kernel \"{other}\""
            )))
        }
    };
    if values.len() != output.shape.num_elements() {
        return Err(DriverError::execution(format!(
            "{} produced {} values for output shape {}",
            kernel.function,
            values.len(),
            output.shape
        )));
    }
    driver.store(output, &values)
}

fn expect_single<'a>(inputs: &[&'a BoundOperand]) -> DriverResult<&'a BoundOperand> {
    match inputs {
        [input] => Ok(*input),
        _ => Err(DriverError::execution("operation expects single input")),
    }
}

fn expect_pair<'a>(
    inputs: &[&'a BoundOperand],
) -> DriverResult<(&'a BoundOperand, &'a BoundOperand)> {
    match inputs {
        [lhs, rhs] => Ok((*lhs, *rhs)),
        _ => Err(DriverError::execution("operation expects two inputs")),
    }
}

fn scalar<'a>(kernel: &'a BoundKernel, name: &str) -> DriverResult<&'a ScalarValue> {
    kernel.scalar(name).ok_or_else(|| {
        DriverError::execution(format!("{} is missing scalar {name}", kernel.function))
    })
}

fn scalar_i32(kernel: &BoundKernel, name: &str) -> DriverResult<i32> {
    scalar(kernel, name)?
        .as_i32()
        .ok_or_else(|| DriverError::execution(format!("scalar {name} is not i32")))
}

fn scalar_f32(kernel: &BoundKernel, name: &str) -> DriverResult<f32> {
    scalar(kernel, name)?
        .as_f32()
        .ok_or_else(|| DriverError::execution(format!("scalar {name} is not f32")))
}

fn scalar_array<'a>(kernel: &'a BoundKernel, name: &str) -> DriverResult<&'a [i32]> {
    scalar(kernel, name)?
        .as_i32_array()
        .ok_or_else(|| DriverError::execution(format!("scalar {name} is not an i32 array")))
}

fn op_add(
    lhs: &[f32],
    lhs_dims: &[usize],
    rhs: &[f32],
    rhs_dims: &[usize],
    out_dims: &[usize],
) -> Vec<f32> {
    let count: usize = out_dims.iter().product();
    let lhs_strides = broadcast_strides(lhs_dims, out_dims);
    let rhs_strides = broadcast_strides(rhs_dims, out_dims);
    (0..count)
        .map(|flat| {
            let coords = unravel_index(flat, out_dims);
            lhs[dot(&coords, &lhs_strides)] + rhs[dot(&coords, &rhs_strides)]
        })
        .collect()
}

/// Strides of `dims` aligned to the innermost axes of `out_dims`, zero on broadcast axes.
fn broadcast_strides(dims: &[usize], out_dims: &[usize]) -> Vec<usize> {
    let strides = compute_strides(dims);
    let offset = out_dims.len().saturating_sub(dims.len());
    (0..out_dims.len())
        .map(|axis| {
            if axis < offset || dims[axis - offset] == 1 {
                0
            } else {
                strides[axis - offset]
            }
        })
        .collect()
}

fn dot(coords: &[usize], strides: &[usize]) -> usize {
    coords.iter().zip(strides).map(|(c, s)| c * s).sum()
}

fn op_strided_slice(
    input: &[f32],
    dims: &[usize],
    begin: &[i32],
    stride: &[i32],
    count: &[i32],
) -> DriverResult<Vec<f32>> {
    let rank = dims.len();
    if begin.len() != rank || stride.len() != rank || count.len() != rank {
        return Err(DriverError::execution("strided slice plan rank mismatch"));
    }
    let count: Vec<usize> = count.iter().map(|&c| c.max(0) as usize).collect();
    let strides = compute_strides(dims);
    let total: usize = count.iter().product();
    let mut out = Vec::with_capacity(total);
    for flat in 0..total {
        let coords = unravel_index(flat, &count);
        let mut index = 0usize;
        for axis in 0..rank {
            let pos = i64::from(begin[axis]) + coords[axis] as i64 * i64::from(stride[axis]);
            if pos < 0 || pos >= dims[axis] as i64 {
                return Err(DriverError::execution(format!(
                    "strided slice reads index {pos} of axis {axis} with extent {}",
                    dims[axis]
                )));
            }
            index += pos as usize * strides[axis];
        }
        out.push(input[index]);
    }
    Ok(out)
}

fn op_concat(
    parts: &[(Vec<usize>, Vec<f32>)],
    out_dims: &[usize],
    axis: i32,
) -> DriverResult<Vec<f32>> {
    if parts.is_empty() {
        return Err(DriverError::execution("concat expects at least one input"));
    }
    let rank = out_dims.len();
    let axis = usize::try_from(axis)
        .ok()
        .filter(|axis| *axis < rank)
        .ok_or_else(|| DriverError::execution("concat axis out of range"))?;

    let axis_inner: usize = out_dims.iter().skip(axis + 1).product();
    let outer: usize = out_dims.iter().take(axis).product();
    let mut axis_total = 0usize;
    for (dims, _) in parts {
        if dims.len() != rank {
            return Err(DriverError::execution("concat rank mismatch"));
        }
        for (idx, (&dim, &out_dim)) in dims.iter().zip(out_dims).enumerate() {
            if idx != axis && dim != out_dim {
                return Err(DriverError::execution("concat dimension mismatch"));
            }
        }
        axis_total += dims[axis];
    }
    if axis_total != out_dims[axis] {
        return Err(DriverError::execution(
            "concat inputs do not match output axis length",
        ));
    }

    let mut result = vec![0.0f32; out_dims.iter().product()];
    let stride_outer = out_dims[axis] * axis_inner;
    for outer_idx in 0..outer {
        let mut dst_offset = outer_idx * stride_outer;
        for (dims, data) in parts {
            let chunk = dims[axis] * axis_inner;
            let src_start = outer_idx * chunk;
            result[dst_offset..dst_offset + chunk]
                .copy_from_slice(&data[src_start..src_start + chunk]);
            dst_offset += chunk;
        }
    }
    Ok(result)
}

/// `out_dims` is the index shape with the depth axis inserted at `axis`.
fn op_one_hot(
    indices: &[f32],
    out_dims: &[usize],
    axis: i32,
    on_value: f32,
    off_value: f32,
) -> DriverResult<Vec<f32>> {
    let axis = usize::try_from(axis)
        .ok()
        .filter(|axis| *axis < out_dims.len())
        .ok_or_else(|| DriverError::execution("one_hot axis out of range"))?;
    let in_dims: Vec<usize> = out_dims
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != axis)
        .map(|(_, dim)| *dim)
        .collect();
    if in_dims.iter().product::<usize>() != indices.len() {
        return Err(DriverError::execution("one_hot indices do not match output shape"));
    }
    let in_strides = compute_strides(&in_dims);
    let count: usize = out_dims.iter().product();
    Ok((0..count)
        .map(|flat| {
            let mut coords = unravel_index(flat, out_dims);
            let depth = coords.remove(axis);
            let index = indices[dot(&coords, &in_strides)].round();
            if index == depth as f32 {
                on_value
            } else {
                off_value
            }
        })
        .collect())
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

pub(crate) fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}
