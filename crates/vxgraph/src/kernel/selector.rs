use std::num::NonZeroUsize;

use lru::LruCache;

use super::{
    BackendPolicy, BindRequest, BoundKernel, KernelArg, KernelBackend, KernelError, KernelRegistry,
    KernelResult, KernelTable, OperandTypes, ParamDirection, ParamKind,
};
use crate::driver::DriverCapabilities;

/// Largest extent a GPU image axis can address.
pub const GPU_TENSOR_MAX_WIDTH: usize = 65536;

/// True when the two innermost axes are non-empty and narrower than [`GPU_TENSOR_MAX_WIDTH`].
pub fn gpu_check_shape(dims: &[usize]) -> bool {
    dims.iter()
        .rev()
        .take(2)
        .all(|&dim| dim > 0 && dim < GPU_TENSOR_MAX_WIDTH)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    types: OperandTypes,
    capabilities: DriverCapabilities,
    shader_disabled: bool,
    policy: BackendPolicy,
}

#[derive(Debug, Clone, Copy)]
struct Resolved {
    table: usize,
    entry: usize,
}

/// Resolves kernel names to bound variants for one registry.
///
/// Resolutions are cached per (name, operand types, capabilities, policy); the shape gate and
/// argument packing still run on every call.
pub struct KernelSelector {
    cache: LruCache<CacheKey, Resolved>,
    shader_disabled: bool,
}

impl KernelSelector {
    pub fn new(cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        KernelSelector {
            cache: LruCache::new(capacity),
            shader_disabled: false,
        }
    }

    /// Treat the driver as shader-less regardless of its capabilities.
    pub fn with_shader_disabled(mut self, disabled: bool) -> Self {
        self.shader_disabled = disabled;
        self
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn select(
        &mut self,
        registry: &KernelRegistry,
        capabilities: DriverCapabilities,
        policy: BackendPolicy,
        request: &BindRequest<'_>,
    ) -> KernelResult<BoundKernel> {
        let tables = registry.tables(request.name);
        if tables.is_empty() {
            return Err(KernelError::NotFound(request.name.to_string()));
        }
        let mut capabilities = capabilities;
        if self.shader_disabled {
            capabilities.shader = false;
        }
        let types = request.operand_types();
        let cache_key = CacheKey {
            name: request.name.to_string(),
            types,
            capabilities,
            shader_disabled: self.shader_disabled,
            policy,
        };
        let resolved = match self.cache.get(&cache_key) {
            Some(resolved) => *resolved,
            None => {
                let resolved =
                    resolve(tables, capabilities, policy, &cache_key.types, request.name)?;
                self.cache.put(cache_key, resolved);
                resolved
            }
        };

        let table = &tables[resolved.table];
        let entry = &table.entries[resolved.entry];
        if let Some(gate) = table.gate {
            if !gate(request) {
                let dims = request
                    .outputs
                    .first()
                    .or_else(|| request.inputs.first())
                    .map(|operand| operand.shape.dims().to_vec())
                    .unwrap_or_default();
                return Err(KernelError::ShapeRejected {
                    name: request.name.to_string(),
                    backend: table.backend,
                    dims,
                });
            }
        }
        let args = pack_args(table, request)?;
        let work_size = table.initializer.map(|initializer| initializer(request));
        tracing::debug!(
            kernel = request.name,
            backend = %table.backend,
            function = entry.function,
            key = %entry.key,
            "kernel variant bound"
        );
        Ok(BoundKernel {
            name: request.name.to_string(),
            backend: table.backend,
            key: entry.key,
            function: entry.function,
            source: entry.source,
            params: table.params,
            args,
            work_size,
        })
    }
}

fn eligible(
    backend: KernelBackend,
    capabilities: DriverCapabilities,
    shader_types: bool,
    policy: BackendPolicy,
) -> bool {
    if let BackendPolicy::Force(forced) = policy {
        if forced != backend {
            return false;
        }
    }
    match backend {
        KernelBackend::GpuSource => capabilities.shader && shader_types,
        KernelBackend::Primitive => capabilities.primitive,
        KernelBackend::Cpu => true,
    }
}

// The first eligible backend decides; a key miss there is not retried on lower priorities.
fn resolve(
    tables: &[KernelTable],
    capabilities: DriverCapabilities,
    policy: BackendPolicy,
    types: &OperandTypes,
    name: &str,
) -> KernelResult<Resolved> {
    let shader_types = types.iter().all(|dtype| dtype.is_shader_supported());
    let (table_idx, table) = tables
        .iter()
        .enumerate()
        .find(|(_, table)| eligible(table.backend, capabilities, shader_types, policy))
        .ok_or_else(|| KernelError::NoEligibleBackend {
            name: name.to_string(),
        })?;
    let (entry_idx, _) = table
        .query(types)
        .ok_or_else(|| KernelError::NoMatchingVariant {
            name: name.to_string(),
            backend: table.backend,
            types: types.to_string(),
        })?;
    Ok(Resolved {
        table: table_idx,
        entry: entry_idx,
    })
}

fn declared_tensors(table: &KernelTable, direction: ParamDirection) -> usize {
    table
        .params
        .iter()
        .filter(|desc| desc.direction == direction && desc.kind == ParamKind::Tensor)
        .count()
}

fn pack_args(table: &KernelTable, request: &BindRequest<'_>) -> KernelResult<Vec<KernelArg>> {
    let count_error = |direction: ParamDirection| {
        let actual = match direction {
            ParamDirection::In => request.inputs.len(),
            ParamDirection::Out => request.outputs.len(),
        };
        KernelError::OperandCount {
            name: request.name.to_string(),
            direction,
            expected: declared_tensors(table, direction),
            actual,
        }
    };

    let mut inputs = request.inputs.iter();
    let mut outputs = request.outputs.iter();
    let mut args = Vec::with_capacity(table.params.len() + request.inputs.len());
    for desc in table.params {
        let operands = match desc.direction {
            ParamDirection::In => &mut inputs,
            ParamDirection::Out => &mut outputs,
        };
        match desc.kind {
            ParamKind::Tensor => {
                let operand = operands.next().ok_or_else(|| count_error(desc.direction))?;
                args.push(KernelArg::Tensor(operand.clone()));
            }
            ParamKind::TensorList => {
                args.extend(operands.by_ref().cloned().map(KernelArg::Tensor));
            }
            ParamKind::Scalar(expected) => {
                let value = request
                    .params
                    .get(desc.name)
                    .ok_or_else(|| KernelError::MissingParam {
                        name: request.name.to_string(),
                        param: desc.name,
                    })?;
                if value.scalar_type() != expected {
                    return Err(KernelError::ParamType {
                        name: request.name.to_string(),
                        param: desc.name,
                        expected,
                        actual: value.scalar_type(),
                    });
                }
                args.push(KernelArg::Scalar(value.clone()));
            }
        }
    }
    if inputs.next().is_some() {
        return Err(count_error(ParamDirection::In));
    }
    if outputs.next().is_some() {
        return Err(count_error(ParamDirection::Out));
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{
        BoundOperand, KernelEntry, KernelKey, KernelParams, ParamDesc, ScalarType, ScalarValue,
    };
    use crate::tensor::{DType, Quantization, Shape, TensorId};

    static CPU_ENTRIES: [KernelEntry; 2] = [
        KernelEntry::new(KernelKey::of2(DType::F32, DType::F32), "scale_f32", "scale"),
        KernelEntry::new(KernelKey::of2(DType::I32, DType::I32), "scale_i32", "scale"),
    ];
    static GPU_ENTRIES: [KernelEntry; 1] = [KernelEntry::new(
        KernelKey::of2(DType::F32, DType::F32),
        "scale_F32toF32",
        "scale_cl",
    )];
    static PARAMS: [ParamDesc; 3] = [
        ParamDesc::input("input"),
        ParamDesc::output("output"),
        ParamDesc::scalar("factor", ScalarType::F32),
    ];

    fn narrow_gate(request: &BindRequest<'_>) -> bool {
        request
            .outputs
            .iter()
            .all(|operand| gpu_check_shape(operand.shape.dims()))
    }

    fn registry() -> KernelRegistry {
        let mut builder = KernelRegistry::builder();
        builder
            .register(KernelTable::new(
                "scale",
                KernelBackend::Cpu,
                &CPU_ENTRIES,
                &PARAMS,
            ))
            .register(
                KernelTable::new("scale", KernelBackend::GpuSource, &GPU_ENTRIES, &PARAMS)
                    .with_gate(narrow_gate),
            );
        builder.build()
    }

    fn operand(id: u32, dims: &[usize], dtype: DType) -> BoundOperand {
        BoundOperand {
            tensor: TensorId(id),
            buffer: None,
            shape: Shape::new(dims).unwrap(),
            dtype,
            quant: Quantization::None,
        }
    }

    const SHADER: DriverCapabilities = DriverCapabilities {
        shader: true,
        primitive: false,
    };

    #[test]
    fn shader_driver_prefers_gpu_table() {
        let registry = registry();
        let mut selector = KernelSelector::new(8);
        let inputs = [operand(0, &[2, 3], DType::F32)];
        let outputs = [operand(1, &[2, 3], DType::F32)];
        let params = KernelParams::new().with("factor", ScalarValue::F32(2.0));
        let request = BindRequest {
            name: "scale",
            inputs: &inputs,
            outputs: &outputs,
            params: &params,
        };

        let first = selector
            .select(&registry, SHADER, BackendPolicy::Auto, &request)
            .expect("gpu variant");
        assert_eq!(first.backend, KernelBackend::GpuSource);
        assert_eq!(first.function, "scale_F32toF32");
        assert_eq!(first.args.len(), 3);
        assert_eq!(first.scalar("factor"), Some(&ScalarValue::F32(2.0)));

        let second = selector
            .select(&registry, SHADER, BackendPolicy::Auto, &request)
            .expect("cached variant");
        assert_eq!(first, second);
        assert_eq!(selector.cached(), 1);

        let cpu = selector
            .select(
                &registry,
                DriverCapabilities::default(),
                BackendPolicy::Auto,
                &request,
            )
            .expect("cpu variant");
        assert_eq!(cpu.backend, KernelBackend::Cpu);
        assert_eq!(cpu.function, "scale_f32");
    }

    #[test]
    fn key_miss_on_chosen_backend_does_not_fall_back() {
        let registry = registry();
        let mut selector = KernelSelector::new(8);
        let inputs = [operand(0, &[4], DType::I32)];
        let outputs = [operand(1, &[4], DType::I32)];
        let params = KernelParams::new().with("factor", ScalarValue::F32(1.0));
        let request = BindRequest {
            name: "scale",
            inputs: &inputs,
            outputs: &outputs,
            params: &params,
        };
        let err = selector
            .select(&registry, SHADER, BackendPolicy::Auto, &request)
            .expect_err("gpu table has no i32 variant");
        assert!(matches!(
            err,
            KernelError::NoMatchingVariant {
                backend: KernelBackend::GpuSource,
                ..
            }
        ));

        let forced = selector
            .select(
                &registry,
                SHADER,
                BackendPolicy::Force(KernelBackend::Cpu),
                &request,
            )
            .expect("forced cpu variant");
        assert_eq!(forced.function, "scale_i32");
    }

    #[test]
    fn shape_gate_and_param_errors() {
        let registry = registry();
        let mut selector = KernelSelector::new(8);
        let inputs = [operand(0, &[2, GPU_TENSOR_MAX_WIDTH], DType::F32)];
        let outputs = [operand(1, &[2, GPU_TENSOR_MAX_WIDTH], DType::F32)];
        let params = KernelParams::new().with("factor", ScalarValue::F32(1.0));
        let request = BindRequest {
            name: "scale",
            inputs: &inputs,
            outputs: &outputs,
            params: &params,
        };
        assert!(matches!(
            selector.select(&registry, SHADER, BackendPolicy::Auto, &request),
            Err(KernelError::ShapeRejected { .. })
        ));

        let wrong = KernelParams::new().with("factor", ScalarValue::I32(1));
        let request = BindRequest {
            params: &wrong,
            ..request
        };
        assert!(matches!(
            selector.select(
                &registry,
                DriverCapabilities::default(),
                BackendPolicy::Auto,
                &request
            ),
            Err(KernelError::ParamType { param: "factor", .. })
        ));

        let empty = KernelParams::new();
        let request = BindRequest {
            params: &empty,
            ..request
        };
        assert!(matches!(
            selector.select(
                &registry,
                DriverCapabilities::default(),
                BackendPolicy::Auto,
                &request
            ),
            Err(KernelError::MissingParam { param: "factor", .. })
        ));
    }

    #[test]
    fn unknown_kernel_and_shape_helper() {
        let registry = registry();
        let mut selector = KernelSelector::new(1);
        let params = KernelParams::new();
        let request = BindRequest {
            name: "missing",
            inputs: &[],
            outputs: &[],
            params: &params,
        };
        assert_eq!(
            selector
                .select(&registry, SHADER, BackendPolicy::Auto, &request)
                .unwrap_err(),
            KernelError::NotFound("missing".into())
        );
        assert!(gpu_check_shape(&[70000, 4, 4]));
        assert!(!gpu_check_shape(&[4, 0]));
        assert!(!gpu_check_shape(&[65536, 4]));
    }
}
