use serde::{Deserialize, Serialize};
use vxgraph::kernel::{
    fold_one_hot, gpu_check_shape, BindRequest, KernelBackend, KernelEntry, KernelKey,
    KernelRegistryBuilder, KernelTable, ParamDesc, ScalarType, WorkSize,
};
use vxgraph::tensor::DType;

pub const ONE_HOT_SOURCE_ID: &str = "one_hot";
pub const ADD_SOURCE_ID: &str = "eltwise_add";
pub const SIGMOID_SOURCE_ID: &str = "sigmoid";

pub const ONE_HOT_SOURCE: &str = include_str!("kernels/one_hot.cl");
pub const ADD_SOURCE: &str = include_str!("kernels/eltwise_add.cl");
pub const SIGMOID_SOURCE: &str = include_str!("kernels/sigmoid.cl");

const UNARY: &[ParamDesc] = &[ParamDesc::input("input"), ParamDesc::output("output")];
const BINARY: &[ParamDesc] = &[
    ParamDesc::input("lhs"),
    ParamDesc::input("rhs"),
    ParamDesc::output("output"),
];
const ONE_HOT: &[ParamDesc] = &[
    ParamDesc::input("indices"),
    ParamDesc::output("output"),
    ParamDesc::scalar("depth", ScalarType::I32),
    ParamDesc::scalar("on_value", ScalarType::F32),
    ParamDesc::scalar("off_value", ScalarType::F32),
    ParamDesc::scalar("axis", ScalarType::I32),
];

static ONE_HOT_ENTRIES: [KernelEntry; 4] = [
    KernelEntry::new(
        KernelKey::of2(DType::I32, DType::I32),
        "one_hot_I32toI32",
        ONE_HOT_SOURCE_ID,
    ),
    KernelEntry::new(
        KernelKey::of2(DType::I32, DType::F32),
        "one_hot_I32toF32",
        ONE_HOT_SOURCE_ID,
    ),
    KernelEntry::new(
        KernelKey::of2(DType::F32, DType::F32),
        "one_hot_F32toF32",
        ONE_HOT_SOURCE_ID,
    ),
    KernelEntry::new(
        KernelKey::of2(DType::U8, DType::U8),
        "one_hot_U8toU8",
        ONE_HOT_SOURCE_ID,
    ),
];

static ADD_ENTRIES: [KernelEntry; 3] = [
    KernelEntry::new(
        KernelKey::of3(DType::F32, DType::F32, DType::F32),
        "add_F32F32toF32",
        ADD_SOURCE_ID,
    ),
    KernelEntry::new(
        KernelKey::of3(DType::F16, DType::F16, DType::F16),
        "add_F16F16toF16",
        ADD_SOURCE_ID,
    ),
    KernelEntry::new(
        KernelKey::of3(DType::U8, DType::U8, DType::U8),
        "add_U8U8toU8",
        ADD_SOURCE_ID,
    ),
];

static SIGMOID_ENTRIES: [KernelEntry; 4] = [
    KernelEntry::new(
        KernelKey::of2(DType::F32, DType::F32),
        "sigmoid_F32toF32",
        SIGMOID_SOURCE_ID,
    ),
    KernelEntry::new(
        KernelKey::of2(DType::F16, DType::F16),
        "sigmoid_F16toF16",
        SIGMOID_SOURCE_ID,
    ),
    KernelEntry::new(
        KernelKey::of2(DType::U8, DType::U8),
        "sigmoid_U8toU8",
        SIGMOID_SOURCE_ID,
    ),
    KernelEntry::new(
        KernelKey::of2(DType::U8, DType::F16),
        "sigmoid_U8toF16",
        SIGMOID_SOURCE_ID,
    ),
];

/// Every GPU source table this crate provides.
pub static GPU_TABLES: [KernelTable; 3] = [
    KernelTable::new("one_hot", KernelBackend::GpuSource, &ONE_HOT_ENTRIES, ONE_HOT)
        .with_fold(fold_one_hot)
        .with_gate(operands_fit_image)
        .with_initializer(one_hot_work_size),
    KernelTable::new("add", KernelBackend::GpuSource, &ADD_ENTRIES, BINARY)
        .with_gate(operands_fit_image)
        .with_initializer(elementwise_work_size),
    KernelTable::new("sigmoid", KernelBackend::GpuSource, &SIGMOID_ENTRIES, UNARY)
        .with_gate(operands_fit_image)
        .with_initializer(elementwise_work_size),
];

fn operands_fit_image(request: &BindRequest<'_>) -> bool {
    request
        .inputs
        .iter()
        .chain(request.outputs)
        .all(|operand| gpu_check_shape(operand.shape.dims()))
}

fn output_dims<'a>(request: &'a BindRequest<'_>) -> &'a [usize] {
    request
        .outputs
        .first()
        .map(|operand| operand.shape.dims())
        .unwrap_or(&[])
}

/// Innermost axis first; everything past the second axis folds into the third.
fn elementwise_work_size(request: &BindRequest<'_>) -> WorkSize {
    let dims = output_dims(request);
    let mut rev = dims.iter().rev();
    let width = rev.next().copied().unwrap_or(1);
    let height = rev.next().copied().unwrap_or(1);
    let depth = rev.product::<usize>();
    WorkSize {
        global: [width, height, depth].into_iter().collect(),
        local: Default::default(),
    }
}

/// `[inner, depth, outer]` around the one-hot axis of the output.
fn one_hot_work_size(request: &BindRequest<'_>) -> WorkSize {
    let dims = output_dims(request);
    let axis = request
        .params
        .get("axis")
        .and_then(|value| value.as_i32())
        .and_then(|axis| usize::try_from(axis).ok())
        .filter(|axis| *axis < dims.len())
        .unwrap_or(dims.len().saturating_sub(1));
    let outer = dims[..axis].iter().product::<usize>();
    let depth = dims.get(axis).copied().unwrap_or(1);
    let inner = dims.iter().skip(axis + 1).product::<usize>();
    WorkSize {
        global: [inner, depth, outer].into_iter().collect(),
        local: Default::default(),
    }
}

/// Adds every GPU source table to `builder`.
pub fn register_gpu_kernels(builder: &mut KernelRegistryBuilder) {
    for table in &GPU_TABLES {
        builder.register(*table);
    }
}

#[vxgraph::linkme::distributed_slice(vxgraph::kernel::KERNEL_REGISTRARS)]
#[linkme(crate = vxgraph::linkme)]
static REGISTER_GPU_KERNELS: fn(&mut KernelRegistryBuilder) = register_gpu_kernels;

/// Program source text for a kernel entry's source id.
pub fn source_text(source_id: &str) -> Option<&'static str> {
    match source_id {
        ONE_HOT_SOURCE_ID => Some(ONE_HOT_SOURCE),
        ADD_SOURCE_ID => Some(ADD_SOURCE),
        SIGMOID_SOURCE_ID => Some(SIGMOID_SOURCE),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
    pub id: String,
    pub kernel: String,
    pub symbol: String,
    pub source_id: String,
    pub key: u64,
}

/// One spec per table entry, in table order.
pub fn builtin_kernel_specs() -> Vec<KernelSpec> {
    GPU_TABLES
        .iter()
        .flat_map(|table| {
            table.entries.iter().map(move |entry| KernelSpec {
                id: format!("vxgraph.cl.{}.{}.v1", table.name, entry.function),
                kernel: table.name.to_string(),
                symbol: entry.function.to_string(),
                source_id: entry.source.to_string(),
                key: entry.key.0,
            })
        })
        .collect()
}

pub fn builtin_kernel_sources() -> Vec<&'static str> {
    vec![ONE_HOT_SOURCE, ADD_SOURCE, SIGMOID_SOURCE]
}

#[cfg(test)]
mod tests {
    use vxgraph::kernel::{BoundOperand, KernelParams, OperandTypes, ScalarValue};
    use vxgraph::tensor::{Quantization, Shape, TensorId};

    use super::*;

    fn operand(dims: &[usize], dtype: DType) -> BoundOperand {
        BoundOperand {
            tensor: TensorId(0),
            buffer: None,
            shape: Shape::new(dims).unwrap(),
            dtype,
            quant: Quantization::None,
        }
    }

    #[test]
    fn half_precision_shares_the_float32_variant() {
        let table = &GPU_TABLES[0];
        let (_, entry) = table
            .query(&OperandTypes::new(&[DType::F16], &[DType::F16]))
            .unwrap();
        assert_eq!(entry.function, "one_hot_F32toF32");
        let (_, entry) = table
            .query(&OperandTypes::new(&[DType::I32], &[DType::F16]))
            .unwrap();
        assert_eq!(entry.function, "one_hot_I32toF32");

        let (_, entry) = GPU_TABLES[2]
            .query(&OperandTypes::new(&[DType::U8], &[DType::F16]))
            .unwrap();
        assert_eq!(entry.function, "sigmoid_U8toF16");
    }

    #[test]
    fn narrow_outputs_fold_to_int32() {
        let table = &GPU_TABLES[0];
        let (_, entry) = table
            .query(&OperandTypes::new(&[DType::I32], &[DType::I16]))
            .unwrap();
        assert_eq!(entry.function, "one_hot_I32toI32");
        assert!(table
            .query(&OperandTypes::new(&[DType::I32], &[DType::U8]))
            .is_none());
    }

    #[test]
    fn one_hot_work_size_splits_around_axis() {
        let inputs = [operand(&[2, 5], DType::I32)];
        let outputs = [operand(&[2, 3, 5], DType::I32)];
        let params = KernelParams::new().with("axis", ScalarValue::I32(1));
        let request = BindRequest {
            name: "one_hot",
            inputs: &inputs,
            outputs: &outputs,
            params: &params,
        };
        assert_eq!(one_hot_work_size(&request).global.as_slice(), &[5, 3, 2]);
        assert_eq!(elementwise_work_size(&request).global.as_slice(), &[5, 3, 2]);
        assert!(operands_fit_image(&request));

        let wide = [operand(&[1, 70000], DType::I32)];
        let request = BindRequest {
            inputs: &wide,
            ..request
        };
        assert!(!operands_fit_image(&request));
    }
}
