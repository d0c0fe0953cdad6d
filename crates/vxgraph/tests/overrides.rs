//! Tests that mutate the process-wide operator registry. Each one holds `TEST_LOCK`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use vxgraph::graph::{GraphState, OptimizeContext, OptimizeDecision};
use vxgraph::internal;
use vxgraph::ops::builtin::{ADD, SIGMOID};
use vxgraph::ops::{self, Arity, ComputeFn, OpKind, OpRegistry};
use vxgraph::{
    DType, Graph, GraphConfig, GraphContext, GraphError, Node, OpError, OpResult, Operator,
    Shape, TensorAttr, TensorId,
};
use vxgraph_backend_ref_cpu::HostDriver;
use vxgraph_backend_tests::init_tracing;

fn lock() -> MutexGuard<'static, ()> {
    static TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    TEST_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn sigmoid_graph() -> (Graph, TensorId, TensorId) {
    init_tracing();
    let mut g = Graph::new(GraphConfig::default(), Arc::new(HostDriver::new()));
    let input = g
        .add_tensor(TensorAttr::new(DType::F32).with_shape(Shape::new([3]).unwrap()))
        .unwrap();
    let out = g.add_tensor(TensorAttr::new(DType::F32)).unwrap();
    let node = g.new_node(SIGMOID, 1, 1).unwrap();
    g.set_node_io(node, &[input], &[out]).unwrap();
    (g, input, out)
}

#[test]
fn compute_override_replaces_only_compute() {
    let _guard = lock();
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    let compute: ComputeFn =
        Arc::new(|_cx: &mut GraphContext, _node: &mut Node| -> OpResult<()> {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    ops::register_compute_override(SIGMOID, compute).unwrap();

    let (mut g, _, out) = sigmoid_graph();
    let result = g.setup();
    OpRegistry::global().remove_client_override(SIGMOID);
    result.unwrap();

    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    // Setup still came from the built-in operator.
    assert_eq!(g.tensor(out).unwrap().shape().unwrap().dims(), &[3]);
    assert!(g.nodes()[0].kernel_nodes().is_empty());

    let (mut g, _, _) = sigmoid_graph();
    g.setup().unwrap();
    assert_eq!(g.nodes()[0].kernel_nodes().len(), 1);
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_compute_override_fails_the_graph() {
    let _guard = lock();
    let compute: ComputeFn =
        Arc::new(|_cx: &mut GraphContext, _node: &mut Node| -> OpResult<()> {
            Err(OpError::invalid("no device"))
        });
    ops::register_compute_override(SIGMOID, compute).unwrap();

    let (mut g, _, _) = sigmoid_graph();
    let result = g.setup();
    OpRegistry::global().remove_client_override(SIGMOID);

    match result {
        Err(GraphError::ComputeFailed { op, reason, .. }) => {
            assert_eq!(op, "SIGMOID");
            assert_eq!(reason, "no device");
        }
        other => panic!("expected a compute failure, got {other:?}"),
    }
    assert_eq!(g.state(), GraphState::Failed);
}

const DOUBLE: OpKind = OpKind::client("DOUBLE");

/// `output = input + input`, composed from one internal ADD.
struct Double;

impl Operator for Double {
    fn name(&self) -> &'static str {
        "DOUBLE"
    }

    fn arity(&self) -> Arity {
        Arity::fixed(1, 1)
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let (Some(input), Some(output)) = (node.input(0), node.output(0)) else {
            return Err(OpError::invalid("DOUBLE needs one input and one output"));
        };
        internal::init_node_wksp(node);
        let add = internal::new_node(cx, node, ADD, 2, 1)?;
        let child = internal::child_mut(node, add)?;
        child.set_input(0, Some(input));
        child.set_input(1, Some(input));
        child.set_output(0, Some(output));
        internal::setup_node(cx, node, add)?;
        Ok(())
    }

    fn optimize(
        &self,
        cx: &mut OptimizeContext<'_>,
        node: &mut Node,
    ) -> OpResult<OptimizeDecision> {
        internal::optimize_node(cx, node)?;
        Ok(OptimizeDecision::Skip)
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        internal::compute_node(cx, node)?;
        Ok(())
    }
}

#[test]
fn client_operator_is_registered_and_removed() {
    let _guard = lock();
    let registry = OpRegistry::global();
    assert!(!registry.is_valid(DOUBLE));
    assert!(ops::register_client_override(DOUBLE, Arc::new(Double)).is_none());
    assert!(registry.is_valid(DOUBLE));
    assert!(registry.list_ops().contains(&DOUBLE));
    assert_eq!(registry.op_name(DOUBLE), "DOUBLE");

    init_tracing();
    let mut g = Graph::new(GraphConfig::default(), Arc::new(HostDriver::new()));
    let input = g
        .add_tensor(TensorAttr::new(DType::F32).with_shape(Shape::new([2, 2]).unwrap()))
        .unwrap();
    let out = g.add_tensor(TensorAttr::new(DType::F32)).unwrap();
    let node = g.new_node(DOUBLE, 1, 1).unwrap();
    g.set_node_io(node, &[input], &[out]).unwrap();
    let built = g.setup();
    assert!(registry.remove_client_override(DOUBLE).is_some());
    built.unwrap();

    assert_eq!(g.node(node).unwrap().workspace().unwrap().node_count(), 1);
    g.write_f32(input, &[1.0, -2.0, 0.5, 4.0]).unwrap();
    g.run().unwrap();
    assert_eq!(g.read_f32(out).unwrap(), vec![2.0, -4.0, 1.0, 8.0]);

    assert!(!registry.is_valid(DOUBLE));
    let released = g.release().unwrap();
    assert_eq!(released[0].children.len(), 1);
}
