//! Generate one terrain chunk from a small demo graph and print a summary.
//!
//! Mostly useful with logging turned up:
//! `RUST_LOG=debug cargo run --bin genchunk`

use std::sync::Arc;

use engine::model::{Graph, GraphNode, ParamMap, ParamValue, PortId, Vec2};
use engine::plan::Resolution;
use engine::{Engine, EngineConfig, OutputValue};

fn demo_graph() -> (Graph, uuid::Uuid) {
    let mut graph = Graph::new("demo");

    let mut noise_params = ParamMap::new();
    noise_params.insert("scale".to_string(), ParamValue::from(0.25));
    let noise = graph.add_node(GraphNode::new("terrain.noise", noise_params));
    let blur = graph.add_node(GraphNode::new("terrain.blur", ParamMap::new()));
    let norm = graph.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));

    graph
        .connect(PortId::new(noise, "height"), PortId::new(blur, "input"))
        .expect("demo graph wiring");
    graph
        .connect(PortId::new(blur, "height"), PortId::new(norm, "input"))
        .expect("demo graph wiring");
    graph.add_root(norm);
    (graph, norm)
}

fn main() {
    env_logger::init();

    let engine = Engine::new(EngineConfig::default());
    let (graph, root) = demo_graph();
    engine
        .registry()
        .validate_graph(&graph)
        .expect("demo graph matches the builtin schemas");
    let graph = Arc::new(graph);

    let mut tree = engine.create_request(&graph, Resolution(64), 42, Vec2::new(0.0, 0.0));
    let mut frames = 0u32;
    while !engine.poll_tree(&mut tree) {
        frames += 1;
    }

    match engine.read_output(&tree, root, "height") {
        OutputValue::Samples(samples) => {
            let min = samples.iter().cloned().fold(f32::INFINITY, f32::min);
            let max = samples.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mean = samples.iter().sum::<f32>() / samples.len() as f32;
            println!(
                "chunk ready after {} extra polls: {} samples, min {:.3} max {:.3} mean {:.3}",
                frames,
                samples.len(),
                min,
                max,
                mean
            );
        }
        other => println!("unexpected output: {:?}", other),
    }

    engine.close_tree(&mut tree);
}
