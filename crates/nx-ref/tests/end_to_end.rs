use nx_core::descriptors::{
    ActivationDescriptor, ActivationFunction, Convolution2dDescriptor, FullyConnectedDescriptor,
    LstmDescriptor, LstmParams, PoolingAlgorithm, Pooling2dDescriptor, SoftmaxDescriptor,
};
use nx_core::tensor::as_cpu_handle;
use nx_core::{
    ConstTensor, DataType, Graph, LayerId, LayerKind, LoadedNetwork, NxError, ShapeError,
    TensorHandle, TensorInfo, TensorShape,
};
use nx_ref::ref_registry;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn write_input(net: &LoadedNetwork, binding: u32, data: &[f32]) {
    let handle = net.input_handle(binding).expect("input binding");
    as_cpu_handle(handle.as_ref()).unwrap().copy_from(data).unwrap();
}

fn read_output(net: &LoadedNetwork, binding: u32) -> Vec<f32> {
    let handle = net.output_handle(binding).expect("output binding");
    as_cpu_handle(handle.as_ref()).unwrap().to_vec()
}

fn chain(g: &mut Graph, input: &[u32], kinds: Vec<LayerKind>) -> Vec<LayerId> {
    let first = g.add_layer(LayerKind::Input { binding_id: 0 }, "in");
    g.set_tensor_info(first.output(0), TensorInfo::new(input, DataType::Float32))
        .unwrap();
    let mut ids = vec![first];
    for (i, kind) in kinds.into_iter().enumerate() {
        let id = g.add_layer(kind, format!("l{i}"));
        g.connect(ids[ids.len() - 1].output(0), id.input(0)).unwrap();
        ids.push(id);
    }
    let out = g.add_layer(LayerKind::Output { binding_id: 0 }, "out");
    g.connect(ids[ids.len() - 1].output(0), out.input(0)).unwrap();
    ids.push(out);
    g.infer_tensor_infos().unwrap();
    ids
}

#[test]
fn max_pool_network() {
    init_tracing();
    let mut g = Graph::new();
    let ids = chain(
        &mut g,
        &[1, 3, 8, 8],
        vec![LayerKind::Pooling2d(Pooling2dDescriptor::window(
            PoolingAlgorithm::Max,
            2,
            2,
        ))],
    );
    let pool = ids[1];
    assert_eq!(
        g.tensor_info(pool.output(0)).unwrap().shape,
        TensorShape::new([1, 3, 4, 4])
    );

    let net = LoadedNetwork::load_with_cpu_handles(&mut g, &ref_registry()).unwrap();
    let data: Vec<f32> = (0..192).map(|v| v as f32).collect();
    write_input(&net, 0, &data);
    net.execute().unwrap();

    let out = read_output(&net, 0);
    assert_eq!(out.len(), 48);
    // Channel 0, first window: rows 0-1, cols 0-1 -> max is 9.
    assert_eq!(out[0], 9.0);
    // Last window of the last channel ends at the last element.
    assert_eq!(out[47], 191.0);
}

#[test]
fn execute_is_repeatable() {
    let mut g = Graph::new();
    chain(
        &mut g,
        &[2, 4],
        vec![LayerKind::Activation(ActivationDescriptor::new(ActivationFunction::ReLu))],
    );
    let net = LoadedNetwork::load_with_cpu_handles(&mut g, &ref_registry()).unwrap();
    write_input(&net, 0, &[-1.0, 2.0, -3.0, 4.0, 5.0, -6.0, 7.0, -8.0]);

    net.execute().unwrap();
    let first = read_output(&net, 0);
    net.execute().unwrap();
    assert_eq!(read_output(&net, 0), first);
    assert_eq!(first, vec![0.0, 2.0, 0.0, 4.0, 5.0, 0.0, 7.0, 0.0]);
    assert_eq!(
        net.output_handle(0).unwrap().tensor_info().shape,
        TensorShape::new([2, 4])
    );
}

#[test]
fn conv_fc_softmax_pipeline() {
    init_tracing();
    let mut g = Graph::new();
    let conv = LayerKind::Convolution2d {
        descriptor: Convolution2dDescriptor {
            stride_x: 1,
            stride_y: 1,
            bias_enabled: true,
            ..Default::default()
        },
        weights: ConstTensor::filled([2, 1, 2, 2], 0.25),
        bias: Some(ConstTensor::filled([2], 1.0)),
    };
    let fc = LayerKind::FullyConnected {
        descriptor: FullyConnectedDescriptor::default(),
        weights: ConstTensor::filled([8, 3], 0.1),
        bias: None,
    };
    let ids = chain(
        &mut g,
        &[1, 1, 3, 3],
        vec![conv, fc, LayerKind::Softmax(SoftmaxDescriptor::default())],
    );
    assert_eq!(
        g.tensor_info(ids[1].output(0)).unwrap().shape,
        TensorShape::new([1, 2, 2, 2])
    );

    let net = LoadedNetwork::load_with_cpu_handles(&mut g, &ref_registry()).unwrap();
    assert_eq!(
        net.workloads().map(|(_, _, name)| name).collect::<Vec<_>>(),
        vec![
            "RefConvolution2dWorkload",
            "RefFullyConnectedWorkload",
            "RefSoftmaxWorkload"
        ]
    );
    write_input(&net, 0, &[1.0; 9]);
    net.execute().unwrap();

    // Identical logits -> uniform distribution.
    let out = read_output(&net, 0);
    assert_eq!(out.len(), 3);
    for p in out {
        assert!((p - 1.0 / 3.0).abs() < 1e-6);
    }
}

#[test]
fn addition_with_broadcast() {
    let mut g = Graph::new();
    let a = g.add_layer(LayerKind::Input { binding_id: 0 }, "a");
    let b = g.add_layer(LayerKind::Input { binding_id: 1 }, "b");
    let add = g.add_layer(LayerKind::Addition, "add");
    let out = g.add_layer(LayerKind::Output { binding_id: 0 }, "out");
    g.set_tensor_info(a.output(0), TensorInfo::new([2, 2], DataType::Float32))
        .unwrap();
    g.set_tensor_info(b.output(0), TensorInfo::new([1, 2], DataType::Float32))
        .unwrap();
    g.connect(a.output(0), add.input(0)).unwrap();
    g.connect(b.output(0), add.input(1)).unwrap();
    g.connect(add.output(0), out.input(0)).unwrap();
    g.infer_tensor_infos().unwrap();

    let net = LoadedNetwork::load_with_cpu_handles(&mut g, &ref_registry()).unwrap();
    write_input(&net, 0, &[1.0, 2.0, 3.0, 4.0]);
    write_input(&net, 1, &[10.0, 100.0]);
    net.execute().unwrap();
    assert_eq!(read_output(&net, 0), vec![11.0, 102.0, 13.0, 104.0]);
}

#[test]
fn lstm_step_with_input_gate_and_peephole() {
    let descriptor = LstmDescriptor {
        cifg_enabled: false,
        peephole_enabled: true,
        ..LstmDescriptor::default()
    };
    let params = LstmParams::basic(2, 2, 2, 0.0)
        .with_input_gate(2, 2, 0.0)
        .with_peephole(0.0);

    let mut g = Graph::new();
    let x = g.add_layer(LayerKind::Input { binding_id: 0 }, "x");
    let h = g.add_layer(LayerKind::Input { binding_id: 1 }, "h");
    let c = g.add_layer(LayerKind::Input { binding_id: 2 }, "c");
    let lstm = g.add_layer(
        LayerKind::Lstm {
            descriptor,
            params: Box::new(params),
        },
        "lstm",
    );
    let out = g.add_layer(LayerKind::Output { binding_id: 0 }, "out");
    for (i, src) in [x, h, c].into_iter().enumerate() {
        g.set_tensor_info(src.output(0), TensorInfo::new([1, 2], DataType::Float32))
            .unwrap();
        g.connect(src.output(0), lstm.input(i)).unwrap();
    }
    g.connect(lstm.output(3), out.input(0)).unwrap();
    g.infer_tensor_infos().unwrap();
    assert_eq!(
        g.tensor_info(lstm.output(0)).unwrap().shape,
        TensorShape::new([1, 8])
    );

    let net = LoadedNetwork::load_with_cpu_handles(&mut g, &ref_registry()).unwrap();
    write_input(&net, 0, &[0.3, -0.7]);
    write_input(&net, 2, &[2.0, -4.0]);
    net.execute().unwrap();

    // All weights zero: i = f = o = 0.5, g = 0, so c = 0.5 * c_prev.
    let cell = as_cpu_handle(net.handle(lstm.output(2)).unwrap().as_ref())
        .unwrap()
        .to_vec();
    assert_eq!(cell, vec![1.0, -2.0]);
    let expected: Vec<f32> = cell.iter().map(|c| 0.5 * c.tanh()).collect();
    assert_eq!(read_output(&net, 0), expected);
}

#[test]
fn load_rejects_lstm_with_short_bias() {
    let mut params = LstmParams::basic(2, 2, 2, 0.0);
    params.cell_bias = ConstTensor::filled([1], 0.0);

    let mut g = Graph::new();
    let lstm = g.add_layer(
        LayerKind::Lstm {
            descriptor: LstmDescriptor::default(),
            params: Box::new(params),
        },
        "lstm",
    );
    for i in 0..3 {
        let src = g.add_layer(LayerKind::Input { binding_id: i }, format!("in{i}"));
        g.set_tensor_info(src.output(0), TensorInfo::new([1, 2], DataType::Float32))
            .unwrap();
        g.connect(src.output(0), lstm.input(i as usize)).unwrap();
    }
    let out = g.add_layer(LayerKind::Output { binding_id: 0 }, "out");
    g.connect(lstm.output(3), out.input(0)).unwrap();

    match LoadedNetwork::load_with_cpu_handles(&mut g, &ref_registry()) {
        Err(NxError::Shape {
            source: ShapeError::Mismatch(reason),
            ..
        }) => assert!(reason.contains("CellBias"), "{reason}"),
        Err(other) => panic!("expected a shape mismatch, got {other}"),
        Ok(_) => panic!("malformed LSTM loaded"),
    }
}
