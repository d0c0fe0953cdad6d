use std::sync::Arc;

use vxgraph::diagnostics::Phase;
use vxgraph::graph::GraphState;
use vxgraph::kernel::{KernelBackend, KernelError, KernelKey};
use vxgraph::node::{NodeState, NodeUid};
use vxgraph::ops::builtin::{
    OneHotParams, PostprocessParams, ADD, ONE_HOT, POSTPROCESS, SIGMOID,
};
use vxgraph::ops::builtin::BoxDecodeParams;
use vxgraph::{DType, Graph, GraphConfig, GraphError, Quantization, Shape, TensorAttr, TensorId};
use vxgraph_backend_ref_cpu::HostDriver;
use vxgraph_backend_tests::init_tracing;

fn host_graph() -> (Graph, Arc<HostDriver>) {
    init_tracing();
    let driver = Arc::new(HostDriver::new());
    (Graph::new(GraphConfig::default(), driver.clone()), driver)
}

fn tensor(g: &mut Graph, dtype: DType, dims: &[usize]) -> TensorId {
    g.add_tensor(TensorAttr::new(dtype).with_shape(Shape::new(dims).unwrap()))
        .unwrap()
}

fn unshaped(g: &mut Graph, dtype: DType) -> TensorId {
    g.add_tensor(TensorAttr::new(dtype)).unwrap()
}

#[test]
fn float_add_broadcasts_and_runs() {
    let (mut g, driver) = host_graph();
    let lhs = tensor(&mut g, DType::F32, &[2, 3]);
    let rhs = tensor(&mut g, DType::F32, &[1, 3]);
    let out = unshaped(&mut g, DType::F32);
    let add = g.new_node(ADD, 2, 1).unwrap();
    g.set_node_io(add, &[lhs, rhs], &[out]).unwrap();
    g.setup().unwrap();

    assert_eq!(g.tensor(out).unwrap().shape().unwrap().dims(), &[2, 3]);
    let node = g.node(add).unwrap();
    assert_eq!(node.state(), NodeState::Computed);
    let kernels = node.kernel_nodes();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].kernel.name, "add");
    assert_eq!(kernels[0].kernel.backend, KernelBackend::Cpu);
    assert_eq!(
        kernels[0].kernel.key,
        KernelKey::of3(DType::F32, DType::F32, DType::F32)
    );

    g.write_f32(lhs, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    g.write_f32(rhs, &[10.0, 20.0, 30.0]).unwrap();
    g.run().unwrap();
    assert_eq!(
        g.read_f32(out).unwrap(),
        vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
    );
    assert_eq!(driver.executed(), 1);
}

#[test]
fn mixed_add_types_fail_check() {
    let (mut g, driver) = host_graph();
    let lhs = tensor(&mut g, DType::I8, &[4]);
    let rhs = tensor(&mut g, DType::F16, &[4]);
    let out = unshaped(&mut g, DType::F16);
    let add = g.new_node(ADD, 2, 1).unwrap();
    g.set_node_io(add, &[lhs, rhs], &[out]).unwrap();

    match g.setup() {
        Err(GraphError::CheckFailed { node, op, desc }) => {
            assert_eq!(node, add);
            assert_eq!(op, "ADD");
            assert!(desc.contains("INT8"), "{desc}");
            assert!(desc.contains("FLOAT16"), "{desc}");
        }
        other => panic!("expected a check failure, got {other:?}"),
    }
    let diagnostic = g.diagnostics().last().unwrap();
    assert_eq!(diagnostic.phase, Phase::Check);
    assert_eq!(diagnostic.node, add);
    assert!(diagnostic.reason.contains("data type not support"));

    assert_eq!(g.state(), GraphState::Failed);
    assert!(g.tensor(out).unwrap().shape().is_none());
    assert!(g.node(add).unwrap().kernel_nodes().is_empty());
    assert_eq!(driver.live_kernel_nodes(), 0);
    assert_eq!(driver.executed(), 0);
}

#[test]
fn postprocess_composes_and_releases_children_newest_first() {
    let (mut g, driver) = host_graph();
    let input = tensor(&mut g, DType::F32, &[1, 2, 6]);
    let out = unshaped(&mut g, DType::F32);
    let post = g.new_node(POSTPROCESS, 1, 1).unwrap();
    g.set_node_io(post, &[input], &[out]).unwrap();
    g.set_params(
        post,
        PostprocessParams {
            box_decode: BoxDecodeParams {
                scale: 2.0,
                shift: 1.0,
            },
        },
    )
    .unwrap();
    g.setup().unwrap();

    let ws = g.node(post).unwrap().workspace().unwrap();
    assert_eq!(ws.node_count(), 6);
    assert_eq!(ws.tensor_count(), 5);
    let created: Vec<TensorId> = ws.tensors().to_vec();
    assert!(ws
        .nodes()
        .iter()
        .all(|child| child.state() == NodeState::Computed));
    assert_eq!(g.tensor(out).unwrap().shape().unwrap().dims(), &[1, 12]);

    g.write_f32(
        input,
        &[0.0, 1.0, 2.0, 3.0, 0.0, 0.0, 4.0, 5.0, 6.0, 7.0, 0.0, 0.0],
    )
    .unwrap();
    g.run().unwrap();
    let values = g.read_f32(out).unwrap();
    assert_eq!(&values[..4], &[1.0, 3.0, 5.0, 7.0]);
    assert_eq!(&values[4..6], &[0.5, 0.5]);
    assert_eq!(&values[6..10], &[9.0, 11.0, 13.0, 15.0]);
    assert_eq!(&values[10..], &[0.5, 0.5]);

    let released = g.release().unwrap();
    assert_eq!(released.len(), 1);
    let expected_children: Vec<NodeUid> = (1..=6).rev().map(NodeUid).collect();
    assert_eq!(released[0].children, expected_children);
    let expected_tensors: Vec<TensorId> = created.into_iter().rev().collect();
    assert_eq!(released[0].tensors, expected_tensors);
    assert_eq!(g.state(), GraphState::Released);
    assert_eq!(driver.live_kernel_nodes(), 0);
    assert_eq!(driver.live_buffers(), 0);
}

fn one_hot_graph(
    indices: DType,
    output: DType,
) -> (Graph, Arc<HostDriver>, TensorId, TensorId) {
    let (mut g, driver) = host_graph();
    let indices = tensor(&mut g, indices, &[4]);
    let out = unshaped(&mut g, output);
    let node = g.new_node(ONE_HOT, 1, 1).unwrap();
    g.set_node_io(node, &[indices], &[out]).unwrap();
    g.set_params(
        node,
        OneHotParams {
            depth: 3,
            ..OneHotParams::default()
        },
    )
    .unwrap();
    (g, driver, indices, out)
}

#[test]
fn one_hot_without_host_variant_fails_compute() {
    let (mut g, driver, _, _) = one_hot_graph(DType::I32, DType::U8);
    match g.setup() {
        Err(GraphError::Kernel {
            op,
            source: KernelError::NoMatchingVariant { name, backend, .. },
            ..
        }) => {
            assert_eq!(op, "ONE_HOT");
            assert_eq!(name, "one_hot");
            assert_eq!(backend, KernelBackend::Cpu);
        }
        other => panic!("expected a missing variant, got {other:?}"),
    }
    assert_eq!(g.state(), GraphState::Failed);
    assert_eq!(driver.live_kernel_nodes(), 0);
    assert_eq!(driver.live_buffers(), 0);
}

#[test]
fn one_hot_expands_indices_on_host() {
    let (mut g, _driver, indices, out) = one_hot_graph(DType::I32, DType::I32);
    g.setup().unwrap();
    assert_eq!(g.tensor(out).unwrap().shape().unwrap().dims(), &[4, 3]);
    g.write_f32(indices, &[0.0, 2.0, 1.0, 5.0]).unwrap();
    g.run().unwrap();
    assert_eq!(
        g.read_f32(out).unwrap(),
        vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]
    );
}

#[test]
fn half_precision_one_hot_binds_the_float32_variant() {
    let (mut g, _driver, indices, out) = one_hot_graph(DType::F16, DType::F16);
    g.setup().unwrap();
    let kernels = g.nodes()[0].kernel_nodes();
    assert_eq!(kernels[0].kernel.function, "one_hot_f32");
    assert_eq!(
        kernels[0].kernel.key,
        KernelKey::of2(DType::F32, DType::F32)
    );

    g.write_f32(indices, &[1.0, 0.0, 2.0, 2.0]).unwrap();
    g.run().unwrap();
    assert_eq!(
        g.read_f32(out).unwrap(),
        vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]
    );
}

#[test]
fn quantized_sigmoid_writes_half_precision() {
    let (mut g, _driver) = host_graph();
    let attr = TensorAttr::new(DType::U8)
        .with_shape(Shape::new([3]).unwrap())
        .with_quant(Quantization::Affine {
            scale: 0.5,
            zero_point: 128,
        });
    let input = g.add_tensor(attr).unwrap();
    let out = unshaped(&mut g, DType::F16);
    let node = g.new_node(SIGMOID, 1, 1).unwrap();
    g.set_node_io(node, &[input], &[out]).unwrap();
    g.setup().unwrap();
    assert_eq!(
        g.node(node).unwrap().kernel_nodes()[0].kernel.function,
        "sigmoid_u8_f16"
    );

    g.write_f32(input, &[-2.0, 0.0, 2.0]).unwrap();
    g.run().unwrap();
    let values = g.read_f32(out).unwrap();
    for (value, x) in values.iter().zip([-2.0f32, 0.0, 2.0]) {
        let expected = 1.0 / (1.0 + (-x).exp());
        assert!((value - expected).abs() < 1e-3, "{value} vs {expected}");
    }
}

#[test]
fn recompute_picks_up_new_parameters() {
    let (mut g, _driver, indices, out) = one_hot_graph(DType::I32, DType::F32);
    g.setup().unwrap();
    let node = g.nodes()[0].uid();
    let params = g.params_mut::<OneHotParams>(node).unwrap().unwrap();
    params.on_value = 5.0;
    params.off_value = -1.0;
    g.recompute(node).unwrap();

    g.write_f32(indices, &[2.0, 0.0, 0.0, 1.0]).unwrap();
    g.run().unwrap();
    assert_eq!(
        g.read_f32(out).unwrap(),
        vec![-1.0, -1.0, 5.0, 5.0, -1.0, -1.0, 5.0, -1.0, -1.0, -1.0, 5.0, -1.0]
    );
}
