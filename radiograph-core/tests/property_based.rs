//! Property-based tests for the invariants named in spec.md section 8:
//! property 1 ("round-trip identity: for any fixed-type vector `v`,
//! `decode(encode(v)) == v`") and property 3 ("inference determinism:
//! `infer(graph)` is pure; repeated inference yields identical type
//! assignment").

use std::collections::HashMap;
use std::sync::Arc;

use num_complex::Complex32;
use proptest::prelude::*;
use serde_json::Value as JsonValue;

use radiograph_core::blocks::FunctionBlock;
use radiograph_core::errors::GraphError;
use radiograph_core::graph::{build_plan, BlockFactory, BlockRegistry, EdgeDesc, GraphDesc, NodeDesc};
use radiograph_core::types::{SampleType, Vector};
use radiograph_core::Block;

proptest! {
    /// `Vector::from_fixed_bytes(Vector::to_fixed_bytes(v)) == v` for
    /// `Float32` -- the wire format pipe.rs relies on is exact little-endian
    /// bytes, so this must hold bit-for-bit, not just approximately.
    #[test]
    fn float32_round_trips_through_fixed_bytes(xs in prop::collection::vec(-1.0e6_f32..1.0e6, 0..64)) {
        let v = Vector::Float32(xs.clone());
        let bytes = v.to_fixed_bytes().expect("Float32 is a fixed type");
        match Vector::from_fixed_bytes(&SampleType::Float32, &bytes) {
            Vector::Float32(out) => prop_assert_eq!(out, xs),
            other => prop_assert!(false, "wrong variant: {:?}", other.sample_type()),
        }
    }

    /// Same property for `Complex32`.
    #[test]
    fn complex32_round_trips_through_fixed_bytes(
        re in prop::collection::vec(-1.0e6_f32..1.0e6, 0..32),
        im in prop::collection::vec(-1.0e6_f32..1.0e6, 0..32),
    ) {
        let xs: Vec<Complex32> = re.into_iter().zip(im).map(|(r, i)| Complex32::new(r, i)).collect();
        let v = Vector::Complex32(xs.clone());
        let bytes = v.to_fixed_bytes().expect("Complex32 is a fixed type");
        match Vector::from_fixed_bytes(&SampleType::Complex32, &bytes) {
            Vector::Complex32(out) => prop_assert_eq!(out, xs),
            other => prop_assert!(false, "wrong variant: {:?}", other.sample_type()),
        }
    }

    /// Same property for the raw `Byte`/`Bit` encoding, which is just a copy.
    #[test]
    fn byte_round_trips_through_fixed_bytes(xs in prop::collection::vec(any::<u8>(), 0..128)) {
        let v = Vector::Byte(xs.clone());
        let bytes = v.to_fixed_bytes().expect("Byte is a fixed type");
        match Vector::from_fixed_bytes(&SampleType::Byte, &bytes) {
            Vector::Byte(out) => prop_assert_eq!(out, xs),
            other => prop_assert!(false, "wrong variant: {:?}", other.sample_type()),
        }
    }

    /// `build_plan` is pure: running it twice on the same `GraphDesc` against
    /// the same registry assigns every edge the same sample type, every node
    /// the same port counts, and the same topological order, regardless of
    /// chain length.
    #[test]
    fn inference_is_deterministic_across_repeated_runs(chain_len in 1usize..8) {
        let registry = registry_with_source_and_multiply();
        let graph = multiply_chain(chain_len);

        let first = build_plan(&graph, &registry, &HashMap::new()).expect("valid chain");
        let second = build_plan(&graph, &registry, &HashMap::new()).expect("valid chain");

        prop_assert_eq!(&first.node_order, &second.node_order);
        prop_assert_eq!(first.edges.len(), second.edges.len());
        for (a, b) in first.edges.iter().zip(second.edges.iter()) {
            prop_assert_eq!(&a.sample_type, &b.sample_type);
            prop_assert_eq!(a.from_node, b.from_node);
            prop_assert_eq!(a.to_node, b.to_node);
        }
        for (a, b) in first.nodes.iter().zip(second.nodes.iter()) {
            prop_assert_eq!(a.num_inputs, b.num_inputs);
            prop_assert_eq!(a.num_outputs, b.num_outputs);
            prop_assert_eq!(a.signature_idx, b.signature_idx);
        }
    }
}

/// A `Float32` source with no inputs, wrapping a tiny fixed `Vector` --
/// determinism is about inference, not about the data it carries.
struct ConstFloatSource;

impl Block for ConstFloatSource {
    fn class_name(&self) -> &'static str {
        "ConstFloatSource"
    }
    fn type_signatures(&self) -> Vec<radiograph_core::TypeSignature> {
        vec![radiograph_core::TypeSignature::new(
            vec![],
            vec![radiograph_core::PortOut::exact("out", SampleType::Float32)],
        )]
    }
    fn process(&mut self, _inputs: &[Vector]) -> Result<Vec<Vector>, String> {
        Ok(vec![Vector::Float32(vec![])])
    }
}

struct ConstFloatSourceFactory;
impl BlockFactory for ConstFloatSourceFactory {
    fn class_name(&self) -> &'static str {
        "ConstFloatSource"
    }
    fn instantiate(&self, _config: &JsonValue) -> Result<Box<dyn Block>, GraphError> {
        Ok(Box::new(ConstFloatSource))
    }
}

struct MultiplyFactory;
impl BlockFactory for MultiplyFactory {
    fn class_name(&self) -> &'static str {
        "Multiply"
    }
    fn instantiate(&self, _config: &JsonValue) -> Result<Box<dyn Block>, GraphError> {
        Ok(Box::new(FunctionBlock::multiply_float32(2.0)))
    }
}

fn registry_with_source_and_multiply() -> BlockRegistry {
    let registry = BlockRegistry::new();
    registry.register(Arc::new(ConstFloatSourceFactory));
    registry.register(Arc::new(MultiplyFactory));
    registry
}

/// A source feeding `chain_len` `Multiply` transforms in series.
fn multiply_chain(chain_len: usize) -> GraphDesc {
    let mut nodes = vec![NodeDesc {
        id: "src".into(),
        class_name: "ConstFloatSource".into(),
        config: JsonValue::Null,
    }];
    let mut edges = Vec::new();
    let mut prev = "src".to_string();
    for i in 0..chain_len {
        let id = format!("m{i}");
        nodes.push(NodeDesc {
            id: id.clone(),
            class_name: "Multiply".into(),
            config: JsonValue::Null,
        });
        edges.push(EdgeDesc {
            from_node: prev.clone(),
            from_port: 0,
            to_node: id.clone(),
            to_port: 0,
        });
        prev = id;
    }
    GraphDesc { nodes, edges }
}
