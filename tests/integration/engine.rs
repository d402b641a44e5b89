use k1_core::graph::{ParamValue, PortType};
use k1_core::{
    apply_brightness_cap, crc32, make_put_plan, EngineConfig, Evaluator, Graph, GraphError,
    GraphExport, NodeData, Rgb8, Tlv, TlvType, Wire, PUT_DATA_MAX,
};

fn gradient(id: &str, from: &str, to: &str) -> NodeData {
    NodeData::new(id, "Gradient")
        .with_output("output", PortType::Field)
        .with_param("startColor", ParamValue::Text(from.into()))
        .with_param("endColor", ParamValue::Text(to.into()))
}

fn hue_shift(id: &str, degrees: f64) -> NodeData {
    NodeData::new(id, "Hue Shift")
        .with_input("input", PortType::Color)
        .with_output("output", PortType::Color)
        .with_param("hue", ParamValue::Number(degrees))
}

fn wire(id: &str, from: &str, to: &str, port: &str) -> Wire {
    Wire::new(id, (from, "output"), (to, port), PortType::Color)
}

/// gradient → two hue shifts → blend → output.
fn diamond() -> (Vec<NodeData>, Vec<Wire>) {
    let nodes = vec![
        gradient("g", "#ff0000", "#0000ff"),
        hue_shift("h1", 60.0),
        hue_shift("h2", -60.0),
        NodeData::new("mix", "Blend")
            .with_input("a", PortType::Color)
            .with_input("b", PortType::Color)
            .with_output("output", PortType::Color)
            .with_param("blend", ParamValue::Number(50.0)),
        NodeData::new("out", "K1 Output").with_input("color", PortType::Color),
    ];
    let wires = vec![
        wire("w1", "g", "h1", "input"),
        wire("w2", "g", "h2", "input"),
        wire("w3", "h1", "mix", "a"),
        wire("w4", "h2", "mix", "b"),
        wire("w5", "mix", "out", "color"),
    ];
    (nodes, wires)
}

#[test]
fn test_shared_generator_runs_once() {
    let (nodes, wires) = diamond();
    let graph = Graph::new(nodes, &wires);
    let (frame, stats) = Evaluator::default()
        .evaluate_with_stats(&graph, 0.0)
        .unwrap();

    assert_eq!(stats.evaluations_of("g"), 1);
    assert_eq!(stats.evaluations_of("mix"), 1);
    assert_eq!(stats.total(), 5);
    assert!(frame.peak() > 0);
}

#[test]
fn test_evaluation_is_deterministic() {
    let (nodes, wires) = diamond();
    let graph = Graph::new(nodes, &wires);
    let eval = Evaluator::default();

    let first = eval.evaluate(&graph, 1234.0).unwrap();
    let second = eval.evaluate(&graph, 1234.0).unwrap();
    assert_eq!(first.as_bytes(), second.as_bytes());
}

/// Evaluate, cap, plan: the frame goes out as a single DATA record.
#[test]
fn test_frame_to_upload_plan() {
    let (nodes, wires) = diamond();
    let graph = Graph::new(nodes, &wires);
    let mut frame = Evaluator::default().evaluate(&graph, 0.0).unwrap().into_bytes();
    assert_eq!(frame.len(), 960);

    apply_brightness_cap(&mut frame, 128);
    assert!(frame.iter().all(|&b| b <= 128));

    let plan = make_put_plan(&frame, PUT_DATA_MAX).unwrap();
    assert_eq!(plan.tlvs.len(), 3);
    assert_eq!(plan.data_frames().count(), 1);
    assert_eq!(plan.crc, crc32(&frame));
    assert_eq!(plan.tlvs[0].tlv_type().unwrap(), TlvType::PutBegin);
    assert_eq!(plan.tlvs[2].tlv_type().unwrap(), TlvType::PutEnd);

    let wire_bytes = plan.serialize().unwrap();
    assert_eq!(wire_bytes.len(), plan.total_bytes);
    let (decoded, err) = Tlv::decode_all(&wire_bytes);
    assert!(err.is_none());
    assert_eq!(decoded, plan.tlvs);
}

#[test]
fn test_export_document_uploads_as_json() {
    let (nodes, wires) = diamond();
    let config = EngineConfig::default();
    let preview = Evaluator::new(config.clone())
        .evaluate(&Graph::new(nodes.clone(), &wires), 0.0)
        .unwrap();

    let export = GraphExport::new(nodes, wires, &config, 30.0)
        .with_preview(&preview)
        .with_brightness_cap(200);
    let payload = export.to_payload().unwrap();
    let plan = make_put_plan(&payload, PUT_DATA_MAX).unwrap();
    assert_eq!(plan.crc, crc32(&payload));

    // The uploaded document evaluates to the same preview.
    let back = GraphExport::from_json(std::str::from_utf8(&payload).unwrap()).unwrap();
    let again = Evaluator::new(config).evaluate(&back.to_graph(), 0.0).unwrap();
    assert_eq!(again.as_bytes(), preview.as_bytes());
    assert_eq!(back.meta.unwrap().brightness_cap, Some(200));
}

#[test]
fn test_cycle_through_blend_is_an_error() {
    let (mut nodes, mut wires) = diamond();
    nodes.push(hue_shift("loop", 10.0));
    wires.retain(|w| w.id != "w1");
    wires.push(wire("w6", "mix", "loop", "input"));
    wires.push(wire("w7", "loop", "h1", "input"));

    let graph = Graph::new(nodes, &wires);
    let err = Evaluator::default().evaluate(&graph, 0.0).unwrap_err();
    assert!(matches!(err, GraphError::CyclicGraph(_)));
}

#[test]
fn test_solid_red_survives_the_pipeline() {
    let graph = Graph::new(
        vec![
            gradient("g", "#ff0000", "#ff0000"),
            NodeData::new("out", "K1 Output").with_input("color", PortType::Color),
        ],
        &[wire("w", "g", "out", "color")],
    );
    let mut frame = Evaluator::default().evaluate(&graph, 0.0).unwrap();
    frame.cap_brightness(100);
    assert_eq!(frame.pixel(17), Some(Rgb8::new(100, 0, 0)));
}
