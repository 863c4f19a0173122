//! Operator contract and registry.
//!
//! An operator is a unit with named input and output ports, an optional
//! custom resolution contract, and a processing callback invoked once per
//! (node, context) when every input is ready. The runtime knows nothing about
//! what an operator computes; it only honors this contract.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::asyncop::AsyncOperation;
use crate::error::EngineError;
use crate::model::{Graph, GraphNode, PortDefinition, PortDirection};
use crate::plan::Resolution;
use crate::schedule::OpCtx;

/// Outcome of one processing invocation.
pub enum Progress {
    /// All outputs were written into the context during this call.
    Done,
    /// The computation spans frames; the returned operation is polled every
    /// scheduler tick until it reports completion.
    Pending(Box<dyn AsyncOperation>),
}

/// A generation operator.
///
/// Port schemas are explicit and enumerable at graph-build time; the planner
/// and scheduler never discover ports by runtime introspection.
pub trait Operator: Send + Sync {
    fn type_id(&self) -> &'static str;

    fn inputs(&self) -> Vec<PortDefinition>;

    fn outputs(&self) -> Vec<PortDefinition>;

    /// Resolution this operator needs `input` at, given the resolution
    /// requested for its own outputs.
    ///
    /// Default: same resolution. Custom planners pad (a blur needs border
    /// samples) or rescale (a warp reads full resolution while its output
    /// stays at the requested one).
    fn input_resolution(&self, _input: &str, requested: Resolution) -> Resolution {
        requested
    }

    /// Process one node in one context.
    ///
    /// Invoked exactly once per (node, context), after every input edge's
    /// source node is done. Reads inputs from the context's cache, writes
    /// outputs back into it. Returns [`Progress::Pending`] when the work
    /// depends on parallel tasks, sibling contexts, or further node
    /// resolution.
    fn process(&self, node: &GraphNode, cx: &mut OpCtx<'_>) -> Result<Progress, EngineError>;
}

/// Registry mapping `type_id` to operator implementations.
///
/// Registration is explicit and static; there is no dynamic discovery.
pub struct OperatorRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Operator>>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the builtin terrain operators.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::builtin::register_all(&registry);
        registry
    }

    pub fn register(&self, operator: Arc<dyn Operator>) {
        let mut inner = self.inner.write().unwrap();
        let previous = inner.insert(operator.type_id().to_string(), operator);
        if let Some(previous) = previous {
            log::warn!("operator {} registered twice", previous.type_id());
        }
    }

    pub fn get(&self, type_id: &str) -> Option<Arc<dyn Operator>> {
        self.inner.read().unwrap().get(type_id).cloned()
    }

    pub fn type_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Validate a graph against the registered operator schemas.
    ///
    /// Checks that every node's type is registered, every connection
    /// references a declared port with the right direction, and non-list
    /// inputs carry at most one connection. Structural checks (endpoints
    /// exist, no cycles) happen in [`Graph::connect`]; this is the
    /// schema-aware layer on top.
    pub fn validate_graph(&self, graph: &Graph) -> Result<(), EngineError> {
        for node in graph.nodes.values() {
            if self.get(&node.type_id).is_none() {
                return Err(EngineError::graph(format!(
                    "No operator registered for type {}",
                    node.type_id
                )));
            }
        }

        let port_def = |node_id: uuid::Uuid, port_name: &str, direction: PortDirection| {
            let node = graph
                .node(node_id)
                .ok_or_else(|| EngineError::graph(format!("Node {} not found", node_id)))?;
            let op = self
                .get(&node.type_id)
                .ok_or_else(|| EngineError::graph(format!("No operator for {}", node.type_id)))?;
            let ports = match direction {
                PortDirection::Input => op.inputs(),
                PortDirection::Output => op.outputs(),
            };
            ports
                .into_iter()
                .find(|p| p.name == port_name)
                .ok_or_else(|| {
                    EngineError::graph(format!(
                        "{} has no {} port named {}",
                        node.type_id,
                        match direction {
                            PortDirection::Input => "input",
                            PortDirection::Output => "output",
                        },
                        port_name
                    ))
                })
        };

        let mut input_counts: HashMap<&crate::model::PortId, usize> = HashMap::new();
        for conn in &graph.connections {
            port_def(conn.from.node_id, &conn.from.port_name, PortDirection::Output)?;
            let input = port_def(conn.to.node_id, &conn.to.port_name, PortDirection::Input)?;
            let count = input_counts.entry(&conn.to).or_insert(0);
            *count += 1;
            if *count > 1 && !input.list {
                return Err(EngineError::graph(format!(
                    "Input {}.{} accepts a single connection",
                    conn.to.node_id, conn.to.port_name
                )));
            }
        }
        Ok(())
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Graph, ParamMap, PortId};

    fn graph_with(types: &[&str]) -> (Graph, Vec<uuid::Uuid>) {
        let mut graph = Graph::new("schema");
        let ids = types
            .iter()
            .map(|t| graph.add_node(GraphNode::new(t, ParamMap::new())))
            .collect();
        (graph, ids)
    }

    #[test]
    fn test_validate_accepts_list_fanin() {
        let registry = OperatorRegistry::with_builtins();
        let (mut graph, ids) = graph_with(&["terrain.constant", "terrain.constant", "terrain.combine"]);
        graph
            .connect(PortId::new(ids[0], "height"), PortId::new(ids[2], "values"))
            .unwrap();
        graph
            .connect(PortId::new(ids[1], "height"), PortId::new(ids[2], "values"))
            .unwrap();
        assert!(registry.validate_graph(&graph).is_ok());
    }

    #[test]
    fn test_validate_rejects_double_connection_on_single_input() {
        let registry = OperatorRegistry::with_builtins();
        let (mut graph, ids) = graph_with(&["terrain.constant", "terrain.constant", "terrain.normalize"]);
        graph
            .connect(PortId::new(ids[0], "height"), PortId::new(ids[2], "input"))
            .unwrap();
        graph
            .connect(PortId::new(ids[1], "height"), PortId::new(ids[2], "input"))
            .unwrap();
        assert!(registry.validate_graph(&graph).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_type_and_port() {
        let registry = OperatorRegistry::with_builtins();
        let (graph, _) = graph_with(&["terrain.no_such_op"]);
        assert!(registry.validate_graph(&graph).is_err());

        let (mut graph, ids) = graph_with(&["terrain.constant", "terrain.normalize"]);
        graph
            .connect(PortId::new(ids[0], "glow"), PortId::new(ids[1], "input"))
            .unwrap();
        assert!(registry.validate_graph(&graph).is_err());
    }
}
