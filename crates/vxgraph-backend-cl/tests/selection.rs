use std::sync::Arc;

use vxgraph::error::GraphError;
use vxgraph::kernel::{KernelBackend, KernelError, ScalarValue};
use vxgraph::ops::builtin::{OneHotParams, ADD, ONE_HOT};
use vxgraph::tensor::{DType, Shape, TensorAttr};
use vxgraph::{Graph, GraphConfig, GraphState};
use vxgraph_backend_cl::kernels::ONE_HOT_SOURCE_ID;
use vxgraph_backend_tests::{init_tracing, RecordingDriver};

fn one_hot_graph(
    config: GraphConfig,
    driver: Arc<RecordingDriver>,
    input_dims: &[usize],
    output: DType,
    depth: u32,
) -> Graph {
    let mut graph = Graph::new(config, driver);
    let indices = graph
        .add_tensor(TensorAttr::new(DType::I32).with_shape(Shape::new(input_dims).unwrap()))
        .unwrap();
    let out = graph.add_tensor(TensorAttr::new(output)).unwrap();
    let node = graph.new_node(ONE_HOT, 1, 1).unwrap();
    graph.set_node_io(node, &[indices], &[out]).unwrap();
    graph
        .set_params(
            node,
            OneHotParams {
                depth,
                ..OneHotParams::default()
            },
        )
        .unwrap();
    graph
}

#[test]
fn one_hot_binds_gpu_variant_with_work_size() {
    init_tracing();
    let driver = Arc::new(RecordingDriver::shader());
    let mut graph = one_hot_graph(GraphConfig::default(), driver.clone(), &[4], DType::I32, 3);
    graph.setup().unwrap();

    let kernel = driver.recorded_kernel_or_panic("one_hot");
    assert_eq!(kernel.backend, KernelBackend::GpuSource);
    assert_eq!(kernel.function, "one_hot_I32toI32");
    assert_eq!(kernel.source, ONE_HOT_SOURCE_ID);
    let work_size = kernel.work_size.as_ref().expect("initializer ran");
    assert_eq!(work_size.global.as_slice(), &[1, 3, 4]);
    assert_eq!(kernel.scalar("depth"), Some(&ScalarValue::I32(3)));

    graph.run().unwrap();
    assert_eq!(driver.executed().len(), 1);
}

#[test]
fn narrow_int_output_folds_onto_int32_variant() {
    init_tracing();
    let driver = Arc::new(RecordingDriver::shader());
    let mut graph = one_hot_graph(GraphConfig::default(), driver.clone(), &[4], DType::I8, 3);
    graph.setup().unwrap();
    let kernel = driver.recorded_kernel_or_panic("one_hot");
    assert_eq!(kernel.function, "one_hot_I32toI32");
    assert_eq!(kernel.tensors(vxgraph::kernel::ParamDirection::Out)[0].dtype, DType::I8);
}

#[test]
fn half_precision_folds_onto_float32_variant() {
    init_tracing();
    let driver = Arc::new(RecordingDriver::shader());
    let mut graph = one_hot_graph(GraphConfig::default(), driver.clone(), &[4], DType::F16, 3);
    graph.setup().unwrap();
    assert_eq!(
        driver.recorded_kernel_or_panic("one_hot").function,
        "one_hot_I32toF32"
    );

    let driver = Arc::new(RecordingDriver::shader());
    let mut graph = Graph::new(GraphConfig::default(), driver.clone());
    let attr = TensorAttr::new(DType::F16).with_shape(Shape::new([4]).unwrap());
    let indices = graph.add_tensor(attr).unwrap();
    let out = graph.add_tensor(TensorAttr::new(DType::F16)).unwrap();
    let node = graph.new_node(ONE_HOT, 1, 1).unwrap();
    graph.set_node_io(node, &[indices], &[out]).unwrap();
    graph.setup().unwrap();
    let kernel = driver.recorded_kernel_or_panic("one_hot");
    assert_eq!(kernel.function, "one_hot_F32toF32");
    assert_eq!(kernel.tensors(vxgraph::kernel::ParamDirection::In)[0].dtype, DType::F16);
}

#[test]
fn missing_variant_fails_compute_without_substitution() {
    init_tracing();
    let driver = Arc::new(RecordingDriver::shader());
    let mut graph = one_hot_graph(GraphConfig::default(), driver.clone(), &[4], DType::U8, 3);
    let err = graph.setup().unwrap_err();
    match err {
        GraphError::Kernel {
            op: "ONE_HOT",
            source:
                KernelError::NoMatchingVariant {
                    backend: KernelBackend::GpuSource,
                    ..
                },
            ..
        } => {}
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(graph.state(), GraphState::Failed);
    assert!(driver.recorded_kernels().is_empty());
    assert_eq!(driver.live_buffers(), 0);
}

#[test]
fn rejected_shape_is_retried_collapsed() {
    init_tracing();
    let driver = Arc::new(RecordingDriver::shader());
    let mut graph =
        one_hot_graph(GraphConfig::default(), driver.clone(), &[70000], DType::F32, 2);
    graph.setup().unwrap();

    let kernel = driver.recorded_kernel_or_panic("one_hot");
    assert_eq!(kernel.function, "one_hot_I32toF32");
    let dims: Vec<Vec<usize>> = kernel
        .tensor_args()
        .map(|operand| operand.shape.dims().to_vec())
        .collect();
    assert_eq!(dims, vec![vec![2, 35000], vec![2, 35000, 2]]);
    assert_eq!(kernel.scalar("axis"), Some(&ScalarValue::I32(2)));
}

#[test]
fn disabled_shader_leaves_no_eligible_backend() {
    init_tracing();
    let driver = Arc::new(RecordingDriver::shader());
    let config = GraphConfig {
        disable_shader: true,
        ..GraphConfig::default()
    };
    let mut graph = one_hot_graph(config, driver, &[4], DType::I32, 3);
    let err = graph.setup().unwrap_err();
    assert!(matches!(
        err,
        GraphError::Kernel {
            source: KernelError::NoEligibleBackend { .. },
            ..
        }
    ));
}

#[test]
fn add_binds_gpu_variant_on_shader_driver() {
    init_tracing();
    let driver = Arc::new(RecordingDriver::shader());
    let mut graph = Graph::new(GraphConfig::default(), driver.clone());
    let attr = TensorAttr::new(DType::F16).with_shape(Shape::new([2, 8]).unwrap());
    let lhs = graph.add_tensor(attr.clone()).unwrap();
    let rhs = graph.add_tensor(attr).unwrap();
    let out = graph.add_tensor(TensorAttr::new(DType::F16)).unwrap();
    let node = graph.new_node(ADD, 2, 1).unwrap();
    graph.set_node_io(node, &[lhs, rhs], &[out]).unwrap();
    graph.setup().unwrap();

    let kernel = driver.recorded_kernel_or_panic("add");
    assert_eq!(kernel.function, "add_F16F16toF16");
    assert_eq!(
        kernel.work_size.as_ref().expect("initializer ran").global.as_slice(),
        &[8, 2, 1]
    );
}
