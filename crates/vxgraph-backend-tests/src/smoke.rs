use std::sync::Arc;

use vxgraph::driver::{BufferInit, BufferSpec, Driver, DriverError, ViewRegion};
use vxgraph::kernel::{
    BoundKernel, BoundOperand, KernelArg, KernelBackend, KernelKey, ParamDesc,
};
use vxgraph::ops::builtin::{BoxDecodeParams, PostprocessParams, ADD, POSTPROCESS};
use vxgraph::tensor::{convert, DType, Quantization, Shape, TensorAttr, TensorId};
use vxgraph::{Graph, GraphConfig, GraphState};

static BINARY: [ParamDesc; 3] = [
    ParamDesc::input("lhs"),
    ParamDesc::input("rhs"),
    ParamDesc::output("output"),
];

fn f32_spec(dims: &[usize]) -> BufferSpec {
    BufferSpec {
        shape: Shape::new(dims).expect("valid shape"),
        dtype: DType::F32,
        quant: Quantization::None,
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    convert::encode(DType::F32, &Quantization::None, values)
}

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    convert::decode(DType::F32, &Quantization::None, bytes).expect("whole f32 elements")
}

pub fn buffer_roundtrip<D: Driver + 'static>(driver: &Arc<D>) {
    let spec = f32_spec(&[2, 2]);
    let buffer = driver
        .create_buffer(&spec, BufferInit::Bytes(&f32_bytes(&[1.0, 2.0, 3.0, 4.0])))
        .unwrap();
    assert_eq!(f32_values(&driver.read(buffer).unwrap()), vec![1.0, 2.0, 3.0, 4.0]);

    driver.write(buffer, &f32_bytes(&[5.0, 6.0, 7.0, 8.0])).unwrap();
    assert_eq!(f32_values(&driver.read(buffer).unwrap()), vec![5.0, 6.0, 7.0, 8.0]);

    let zeroed = driver.create_buffer(&spec, BufferInit::Zeroed).unwrap();
    assert_eq!(f32_values(&driver.read(zeroed).unwrap()), vec![0.0; 4]);

    driver.release_buffer(buffer).unwrap();
    driver.release_buffer(zeroed).unwrap();
    assert_eq!(driver.read(buffer), Err(DriverError::UnknownBuffer(buffer)));
}

pub fn views_share_parent_storage<D: Driver + 'static>(driver: &Arc<D>) {
    let parent = driver
        .create_buffer(&f32_spec(&[2, 3]), BufferInit::Zeroed)
        .unwrap();
    let column = driver
        .create_view(parent, &ViewRegion::new([0, 1], [2, 2]), &f32_spec(&[2, 1]))
        .unwrap();
    driver.write(column, &f32_bytes(&[7.0, 9.0])).unwrap();
    assert_eq!(
        f32_values(&driver.read(parent).unwrap()),
        vec![0.0, 7.0, 0.0, 0.0, 9.0, 0.0]
    );

    let flat = driver.create_reshape_view(parent, &f32_spec(&[6])).unwrap();
    assert_eq!(
        f32_values(&driver.read(flat).unwrap()),
        vec![0.0, 7.0, 0.0, 0.0, 9.0, 0.0]
    );

    driver.release_buffer(parent).unwrap();
    assert_eq!(f32_values(&driver.read(column).unwrap()), vec![7.0, 9.0]);
    driver.release_buffer(column).unwrap();
    driver.release_buffer(flat).unwrap();
}

pub fn kernel_node_lifecycle<D: Driver + 'static>(driver: &Arc<D>) {
    let spec = f32_spec(&[3]);
    let lhs = driver
        .create_buffer(&spec, BufferInit::Bytes(&f32_bytes(&[1.0, 2.0, 3.0])))
        .unwrap();
    let rhs = driver
        .create_buffer(&spec, BufferInit::Bytes(&f32_bytes(&[10.0, 20.0, 30.0])))
        .unwrap();
    let out = driver.create_buffer(&spec, BufferInit::Zeroed).unwrap();
    let operand = |id: u32, buffer| {
        KernelArg::Tensor(BoundOperand {
            tensor: TensorId(id),
            buffer: Some(buffer),
            shape: spec.shape.clone(),
            dtype: DType::F32,
            quant: Quantization::None,
        })
    };
    let kernel = BoundKernel {
        name: "add".into(),
        backend: KernelBackend::Cpu,
        key: KernelKey::of3(DType::F32, DType::F32, DType::F32),
        function: "add_f32",
        source: "host",
        params: &BINARY,
        args: vec![operand(0, lhs), operand(1, rhs), operand(2, out)],
        work_size: None,
    };

    let node = driver.create_kernel_node(&kernel).unwrap();
    driver.execute(&[node]).unwrap();
    assert_eq!(f32_values(&driver.read(out).unwrap()), vec![11.0, 22.0, 33.0]);

    driver.release_kernel_node(node).unwrap();
    assert_eq!(
        driver.execute(&[node]),
        Err(DriverError::UnknownKernelNode(node))
    );
    for buffer in [lhs, rhs, out] {
        driver.release_buffer(buffer).unwrap();
    }
}

pub fn graph_add_matches_expected(driver: Arc<dyn Driver>) {
    let mut graph = Graph::new(GraphConfig::default(), driver);
    let attr = TensorAttr::new(DType::F32).with_shape(Shape::new([2, 3]).unwrap());
    let lhs = graph.add_tensor(attr.clone()).unwrap();
    let rhs = graph
        .add_tensor(TensorAttr::new(DType::F32).with_shape(Shape::new([3]).unwrap()))
        .unwrap();
    let out = graph.add_tensor(TensorAttr::new(DType::F32)).unwrap();
    let add = graph.new_node(ADD, 2, 1).unwrap();
    graph.set_node_io(add, &[lhs, rhs], &[out]).unwrap();
    graph.setup().unwrap();
    assert_eq!(graph.state(), GraphState::Ready);
    assert_eq!(graph.tensor(out).unwrap().shape(), attr.shape.as_ref());

    graph.write_f32(lhs, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    graph.write_f32(rhs, &[0.5, 0.5, 1.0]).unwrap();
    graph.run().unwrap();
    assert_eq!(
        graph.read_f32(out).unwrap(),
        vec![1.5, 2.5, 4.0, 4.5, 5.5, 7.0]
    );
}

/// Detection post-processing composed from slice, decode, sigmoid, concat and reshape.
pub fn composite_postprocess_matches_expected(driver: Arc<dyn Driver>) {
    let mut graph = Graph::new(GraphConfig::default(), driver);
    let input = graph
        .add_tensor(TensorAttr::new(DType::F32).with_shape(Shape::new([1, 2, 6]).unwrap()))
        .unwrap();
    let output = graph.add_tensor(TensorAttr::new(DType::F32)).unwrap();
    let node = graph.new_node(POSTPROCESS, 1, 1).unwrap();
    graph.set_node_io(node, &[input], &[output]).unwrap();
    graph
        .set_params(
            node,
            PostprocessParams {
                box_decode: BoxDecodeParams {
                    scale: 2.0,
                    shift: 1.0,
                },
            },
        )
        .unwrap();
    graph.setup().unwrap();
    assert_eq!(graph.tensor(output).unwrap().shape().unwrap().dims(), &[1, 12]);

    graph
        .write_f32(
            input,
            &[1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
    graph.run().unwrap();
    assert_eq!(
        graph.read_f32(output).unwrap(),
        vec![3.0, 5.0, 7.0, 9.0, 0.5, 0.5, 1.0, 1.0, 1.0, 1.0, 0.5, 0.5]
    );
    graph.release().unwrap();
    assert_eq!(graph.state(), GraphState::Released);
}
