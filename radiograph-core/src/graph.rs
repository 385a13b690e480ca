//! Composite / graph assembly: the block registry, the serde-friendly graph
//! description consumed by `Context::load`, composite flattening, structural
//! validation, and type/rate inference (C3, section 4.2).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::block::{differentiate, Block, TypeSignature};
use crate::errors::{EngineError, GraphError};
use crate::types::SampleType;

/// Factory for creating block instances by class name (section 9: "replace
/// [global block-registration side effects] with an explicit registry
/// populated by the embedder ... contexts never touch process-global
/// state"). Mirrors the teacher's `NodeFactory`/`NodeRegistryImpl` pair.
pub trait BlockFactory: Send + Sync {
    fn class_name(&self) -> &'static str;
    /// Construct a block from its JSON configuration (the `NodeDesc.config`
    /// the graph description supplies for this node).
    fn instantiate(&self, config: &JsonValue) -> Result<Box<dyn Block>, GraphError>;
}

/// Registry of block factories, populated by the embedder before `load`.
/// Contains no process-global state; a program may hold several registries
/// (and several `Context`s) side by side.
#[derive(Clone)]
pub struct BlockRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<dyn BlockFactory>>>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            factories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register(&self, factory: Arc<dyn BlockFactory>) {
        let mut factories = self.factories.write().expect("registry lock poisoned");
        factories.insert(factory.class_name().to_string(), factory);
    }

    pub fn instantiate(&self, class_name: &str, config: &JsonValue) -> Result<Box<dyn Block>, GraphError> {
        let factories = self.factories.read().expect("registry lock poisoned");
        let factory = factories
            .get(class_name)
            .ok_or_else(|| GraphError::UnknownClass(class_name.to_string()))?;
        factory.instantiate(config)
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories
            .read()
            .expect("registry lock poisoned")
            .contains_key(class_name)
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One node in a `GraphDesc`: an instance of a registered block class, or of
/// a registered composite, configured with a JSON blob of construction
/// arguments (the `instantiate(args...)` of section 4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDesc {
    pub id: String,
    pub class_name: String,
    #[serde(default)]
    pub config: JsonValue,
}

/// One directed edge: output port `from_port` of `from_node` to input port
/// `to_port` of `to_node`. Fan-out (one output, several consumers) is
/// represented as multiple `EdgeDesc`s sharing `(from_node, from_port)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDesc {
    pub from_node: String,
    pub from_port: usize,
    pub to_node: String,
    pub to_port: usize,
}

/// The graph description format consumed by `Context::load` -- the
/// concrete grammar for spec.md's unspecified `load(ctx, script)` "script".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDesc {
    #[serde(default)]
    pub nodes: Vec<NodeDesc>,
    #[serde(default)]
    pub edges: Vec<EdgeDesc>,
}

/// A block whose implementation is another sub-graph (section 3, 4.2). Port
/// mappings bind the composite's external port to an `(inner node id, inner
/// port index)` pair inside `graph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeDesc {
    pub class_name: String,
    pub graph: GraphDesc,
    pub input_ports: Vec<(String, usize)>,
    pub output_ports: Vec<(String, usize)>,
}

/// Registry of composite definitions, checked before the block registry
/// when flattening a `NodeDesc`.
#[derive(Clone, Default)]
pub struct CompositeRegistry {
    composites: HashMap<String, CompositeDesc>,
}

impl CompositeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, composite: CompositeDesc) {
        self.composites.insert(composite.class_name.clone(), composite);
    }

    pub fn get(&self, class_name: &str) -> Option<&CompositeDesc> {
        self.composites.get(class_name)
    }
}

/// Recursively expand every composite node into its inner sub-graph,
/// renaming inner ports onto the composite's external ports (section 4.2,
/// "Composite flattening leaves no dangling ports"; section 9, "Composite
/// blocks are a graph macro, not runtime indirection: flatten at plan time;
/// no composite exists at execution time.").
pub fn flatten(graph: &GraphDesc, composites: &CompositeRegistry) -> Result<GraphDesc, GraphError> {
    let mut out = GraphDesc::default();
    // (outer composite node id, external port) -> (flattened inner node id, inner port)
    let mut input_bindings: HashMap<(String, usize), (String, usize)> = HashMap::new();
    let mut output_bindings: HashMap<(String, usize), (String, usize)> = HashMap::new();

    for node in &graph.nodes {
        if let Some(composite) = composites.get(&node.class_name) {
            flatten_composite(&node.id, composite, composites, &mut out, &mut input_bindings, &mut output_bindings)?;
        } else {
            out.nodes.push(node.clone());
        }
    }

    for edge in &graph.edges {
        let (from_node, from_port) = output_bindings
            .get(&(edge.from_node.clone(), edge.from_port))
            .cloned()
            .unwrap_or((edge.from_node.clone(), edge.from_port));
        let (to_node, to_port) = input_bindings
            .get(&(edge.to_node.clone(), edge.to_port))
            .cloned()
            .unwrap_or((edge.to_node.clone(), edge.to_port));
        out.edges.push(EdgeDesc {
            from_node,
            from_port,
            to_node,
            to_port,
        });
    }

    Ok(out)
}

fn flatten_composite(
    outer_id: &str,
    composite: &CompositeDesc,
    composites: &CompositeRegistry,
    out: &mut GraphDesc,
    input_bindings: &mut HashMap<(String, usize), (String, usize)>,
    output_bindings: &mut HashMap<(String, usize), (String, usize)>,
) -> Result<(), GraphError> {
    let inner_flat = flatten(&composite.graph, composites)?;
    let prefix = format!("{outer_id}.");

    let inner_ids: HashSet<&str> = inner_flat.nodes.iter().map(|n| n.id.as_str()).collect();

    for (external_port, (inner_id, inner_port)) in composite.input_ports.iter().enumerate() {
        if !inner_ids.contains(inner_id.as_str()) {
            return Err(GraphError::DanglingCompositePort {
                composite: composite.class_name.clone(),
                inner: inner_id.clone(),
            });
        }
        input_bindings.insert(
            (outer_id.to_string(), external_port),
            (format!("{prefix}{inner_id}"), *inner_port),
        );
    }

    for (external_port, (inner_id, inner_port)) in composite.output_ports.iter().enumerate() {
        if !inner_ids.contains(inner_id.as_str()) {
            return Err(GraphError::DanglingCompositePort {
                composite: composite.class_name.clone(),
                inner: inner_id.clone(),
            });
        }
        output_bindings.insert(
            (outer_id.to_string(), external_port),
            (format!("{prefix}{inner_id}"), *inner_port),
        );
    }

    for node in &inner_flat.nodes {
        out.nodes.push(NodeDesc {
            id: format!("{prefix}{}", node.id),
            class_name: node.class_name.clone(),
            config: node.config.clone(),
        });
    }

    for edge in &inner_flat.edges {
        out.edges.push(EdgeDesc {
            from_node: format!("{prefix}{}", edge.from_node),
            from_port: edge.from_port,
            to_node: format!("{prefix}{}", edge.to_node),
            to_port: edge.to_port,
        });
    }

    Ok(())
}

/// One frozen node in a `GraphPlan`: a constructed block together with the
/// signature inference selected for it.
pub struct PlannedNode {
    pub id: String,
    pub class_name: String,
    pub block: Box<dyn Block>,
    pub signature_idx: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
}

/// One frozen edge in a `GraphPlan`, annotated with its resolved type and
/// rate.
#[derive(Debug, Clone)]
pub struct PlannedEdge {
    pub from_node: usize,
    pub from_port: usize,
    pub to_node: usize,
    pub to_port: usize,
    pub sample_type: SampleType,
    pub rate: f64,
}

/// The frozen, immutable DAG the scheduler executes (section 3: "Graph
/// plan").
pub struct GraphPlan {
    pub nodes: Vec<PlannedNode>,
    pub edges: Vec<PlannedEdge>,
    /// Topological order, as indices into `nodes`.
    pub node_order: Vec<usize>,
}

impl GraphPlan {
    pub fn edges_from(&self, node: usize, port: usize) -> impl Iterator<Item = &PlannedEdge> {
        self.edges
            .iter()
            .filter(move |e| e.from_node == node && e.from_port == port)
    }

    pub fn edge_into(&self, node: usize, port: usize) -> Option<&PlannedEdge> {
        self.edges
            .iter()
            .find(|e| e.to_node == node && e.to_port == port)
    }
}

/// Build the frozen plan from a flattened `GraphDesc`: construct blocks,
/// validate structure, run type inference, then compute per-edge rates
/// (section 4.2, steps 1-5).
pub fn build_plan(
    graph: &GraphDesc,
    registry: &BlockRegistry,
    source_rates: &HashMap<String, f64>,
) -> Result<GraphPlan, EngineError> {
    validate_connectivity(graph)?;

    let mut index_of: HashMap<String, usize> = HashMap::new();
    let mut nodes = Vec::with_capacity(graph.nodes.len());
    for (idx, node) in graph.nodes.iter().enumerate() {
        index_of.insert(node.id.clone(), idx);
        let block = registry.instantiate(&node.class_name, &node.config)?;
        nodes.push(PlannedNode {
            id: node.id.clone(),
            class_name: node.class_name.clone(),
            block,
            signature_idx: usize::MAX,
            num_inputs: 0,
            num_outputs: 0,
        });
    }

    let node_order = topological_order(graph, &index_of)?;

    // input_types[node][port] accumulated from incoming edges.
    let mut input_types: Vec<HashMap<usize, SampleType>> = vec![HashMap::new(); nodes.len()];
    let mut edges: Vec<PlannedEdge> = graph
        .edges
        .iter()
        .map(|e| PlannedEdge {
            from_node: index_of[&e.from_node],
            from_port: e.from_port,
            to_node: index_of[&e.to_node],
            to_port: e.to_port,
            sample_type: SampleType::Byte, // placeholder, overwritten during inference
            rate: 0.0,
        })
        .collect();

    for &node_idx in &node_order {
        let sigs: Vec<TypeSignature> = nodes[node_idx].block.type_signatures();
        let max_port = input_types[node_idx].keys().copied().max();
        let expected_inputs = sigs.iter().map(|s| s.inputs.len()).max().unwrap_or(0);
        let num_inputs = max_port.map(|m| m + 1).unwrap_or(0).max(expected_inputs);
        let mut ordered_inputs = Vec::with_capacity(num_inputs);
        for port in 0..num_inputs {
            let ty = input_types[node_idx].get(&port).cloned().ok_or_else(|| {
                GraphError::Disconnected {
                    node: nodes[node_idx].id.clone(),
                    port: port.to_string(),
                }
            })?;
            ordered_inputs.push(ty);
        }

        let sig_idx = differentiate(&nodes[node_idx].id, &sigs, &ordered_inputs)?;
        let signature = &sigs[sig_idx];
        nodes[node_idx].signature_idx = sig_idx;
        nodes[node_idx].num_inputs = signature.inputs.len();
        nodes[node_idx].num_outputs = signature.outputs.len();

        for (out_port, out_spec) in signature.outputs.iter().enumerate() {
            let resolved = out_spec.producer.resolve(&ordered_inputs);
            for edge in edges.iter_mut().filter(|e| e.from_node == node_idx && e.from_port == out_port) {
                edge.sample_type = resolved.clone();
                let to_node = edge.to_node;
                let to_port = edge.to_port;
                input_types[to_node].insert(to_port, resolved.clone());
            }
        }
    }

    // Second pass: per-edge rates, in the same topological order, now that
    // every node's signature (and thus rate_fn) is known.
    let mut node_output_rate: Vec<HashMap<usize, f64>> = vec![HashMap::new(); nodes.len()];
    for &node_idx in &node_order {
        let sigs: Vec<TypeSignature> = nodes[node_idx].block.type_signatures();
        let signature = &sigs[nodes[node_idx].signature_idx];

        let in_rate = edges
            .iter()
            .filter(|e| e.to_node == node_idx)
            .map(|e| e.rate)
            .fold(0.0_f64, f64::max);
        let in_rate = if nodes[node_idx].num_inputs == 0 {
            *source_rates.get(&nodes[node_idx].id).unwrap_or(&0.0)
        } else {
            in_rate
        };

        let out_rate = signature.get_rate(in_rate);
        for out_port in 0..nodes[node_idx].num_outputs {
            node_output_rate[node_idx].insert(out_port, out_rate);
        }
        for edge in edges.iter_mut().filter(|e| e.from_node == node_idx) {
            edge.rate = out_rate;
        }
    }

    Ok(GraphPlan {
        nodes,
        edges,
        node_order,
    })
}

/// Every input port connected exactly once; no fan-in (section 3
/// invariants).
fn validate_connectivity(graph: &GraphDesc) -> Result<(), GraphError> {
    let mut seen: HashMap<(String, usize), usize> = HashMap::new();
    for edge in &graph.edges {
        *seen.entry((edge.to_node.clone(), edge.to_port)).or_insert(0) += 1;
    }

    for (key, count) in &seen {
        if *count > 1 {
            return Err(GraphError::PortMismatch(format!(
                "input port {} on node '{}' has {} incoming edges (fan-in is not allowed)",
                key.1, key.0, count
            )));
        }
    }

    // Disconnected-input detection happens during `build_plan`, where the
    // block's declared signatures reveal how many input ports it actually
    // has; a graph description alone doesn't know a node's port count.
    Ok(())
}

/// Kahn's algorithm topological sort; a sort that doesn't cover every node
/// means the flattened edge set contains a cycle (section 4.2 step 1,
/// section 8 property 7).
fn topological_order(graph: &GraphDesc, index_of: &HashMap<String, usize>) -> Result<Vec<usize>, GraphError> {
    let n = graph.nodes.len();
    let mut in_degree = vec![0usize; n];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];

    for edge in &graph.edges {
        let from = index_of[&edge.from_node];
        let to = index_of[&edge.to_node];
        adjacency[from].push(to);
        in_degree[to] += 1;
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in &adjacency[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != n {
        let stuck = (0..n).find(|&i| !order.contains(&i)).unwrap_or(0);
        return Err(GraphError::Cyclic(graph.nodes[stuck].id.clone()));
    }

    Ok(order)
}
