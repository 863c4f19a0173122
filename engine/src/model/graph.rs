//! The generation graph: nodes, connections, roots, and build-time analysis.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::GraphNode;
use super::param::ParamValue;
use super::port::{Connection, PortId};
use crate::error::EngineError;

/// A declarative generation graph.
///
/// Immutable during execution: the runtime only ever reads it. Connections
/// flow from an output port (`from`) to an input port (`to`). `roots` are the
/// nodes whose outputs a generation request ultimately wants.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Graph {
    pub id: Uuid,
    pub name: String,
    pub nodes: HashMap<Uuid, GraphNode>,
    pub connections: Vec<Connection>,
    pub roots: Vec<Uuid>,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            nodes: HashMap::new(),
            connections: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn load(json_str: &str) -> Result<Self, EngineError> {
        let graph: Graph = serde_json::from_str(json_str)?;
        Ok(graph)
    }

    pub fn save(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn node(&self, id: Uuid) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    pub fn add_node(&mut self, node: GraphNode) -> Uuid {
        let id = node.id;
        self.nodes.insert(id, node);
        id
    }

    pub fn add_root(&mut self, id: Uuid) {
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    /// Add a validated connection from an output port to an input port.
    pub fn connect(&mut self, from: PortId, to: PortId) -> Result<Uuid, EngineError> {
        let conn = Connection::new(from, to);
        self.validate_connection(&conn)?;
        let id = conn.id;
        self.connections.push(conn);
        Ok(id)
    }

    /// Add a connection without cycle validation.
    ///
    /// The runtime tolerates cyclic graphs (the scheduler's checkpoint guard
    /// keeps them from overflowing the stack), so tests and tools that build
    /// deliberately broken graphs use this.
    pub fn connect_unchecked(&mut self, from: PortId, to: PortId) -> Uuid {
        let conn = Connection::new(from, to);
        let id = conn.id;
        self.connections.push(conn);
        id
    }

    /// Find the upstream connection for an input port (source node and port).
    pub fn upstream(&self, to: &PortId) -> Option<(Uuid, String)> {
        self.connections
            .iter()
            .find(|c| c.to == *to)
            .map(|c| (c.from.node_id, c.from.port_name.clone()))
    }

    /// All upstream connections for an input port, in connection order.
    ///
    /// List-cardinality inputs accept several connections; their gather order
    /// is the order the connections were added in.
    pub fn upstream_all(&self, to: &PortId) -> Vec<(Uuid, String)> {
        self.connections
            .iter()
            .filter(|c| c.to == *to)
            .map(|c| (c.from.node_id, c.from.port_name.clone()))
            .collect()
    }

    /// Validate a connection before adding it.
    ///
    /// Checks:
    /// - Both nodes exist
    /// - No self-connections
    /// - No cycles
    pub fn validate_connection(&self, conn: &Connection) -> Result<(), EngineError> {
        if self.node(conn.from.node_id).is_none() {
            return Err(EngineError::graph(format!(
                "Source node {} not found",
                conn.from.node_id
            )));
        }
        if self.node(conn.to.node_id).is_none() {
            return Err(EngineError::graph(format!(
                "Destination node {} not found",
                conn.to.node_id
            )));
        }

        if conn.from.node_id == conn.to.node_id {
            return Err(EngineError::graph("Cannot connect a node to itself"));
        }

        if self.would_create_cycle(conn.from.node_id, conn.to.node_id) {
            return Err(EngineError::graph("Connection would create a cycle"));
        }

        Ok(())
    }

    /// Check if connecting from_node → to_node would create a cycle.
    /// Returns true if to_node can already reach from_node via existing connections.
    fn would_create_cycle(&self, from_node: Uuid, to_node: Uuid) -> bool {
        // BFS from to_node: if from_node is reachable, adding from→to creates a cycle.
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(to_node);

        while let Some(current) = queue.pop_front() {
            if current == from_node {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for conn in &self.connections {
                if conn.from.node_id == current {
                    queue.push_back(conn.to.node_id);
                }
            }
        }
        false
    }

    /// Instance a sub-graph template into this graph.
    ///
    /// Every template node gets a fresh id, internal edges are rewritten to
    /// the fresh ids, and `overrides` replaces parameter values by
    /// `(template node id, param name)`. Returns a map from template node id
    /// to instanced node id so the caller can wire the instance into the
    /// host graph.
    pub fn instantiate(
        &mut self,
        template: &Graph,
        overrides: &HashMap<(Uuid, String), ParamValue>,
    ) -> HashMap<Uuid, Uuid> {
        let mut remap: HashMap<Uuid, Uuid> = HashMap::new();

        for (old_id, node) in &template.nodes {
            let mut params = node.params.clone();
            for ((target, name), value) in overrides {
                if target == old_id {
                    params.insert(name.clone(), value.clone());
                }
            }
            let instanced = GraphNode::new(&node.type_id, params);
            remap.insert(*old_id, instanced.id);
            self.nodes.insert(instanced.id, instanced);
        }

        for conn in &template.connections {
            // Edges referencing nodes outside the template are dropped; the
            // caller wires boundary ports explicitly.
            let (Some(from), Some(to)) = (remap.get(&conn.from.node_id), remap.get(&conn.to.node_id))
            else {
                continue;
            };
            self.connections.push(Connection::new(
                PortId::new(*from, &conn.from.port_name),
                PortId::new(*to, &conn.to.port_name),
            ));
        }

        remap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::param::ParamMap;

    fn two_node_graph() -> (Graph, Uuid, Uuid) {
        let mut graph = Graph::new("test");
        let a = graph.add_node(GraphNode::new("terrain.constant", ParamMap::new()));
        let b = graph.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));
        (graph, a, b)
    }

    #[test]
    fn test_connect_and_upstream() {
        let (mut graph, a, b) = two_node_graph();
        graph
            .connect(PortId::new(a, "height"), PortId::new(b, "input"))
            .unwrap();

        let up = graph.upstream(&PortId::new(b, "input")).unwrap();
        assert_eq!(up, (a, "height".to_string()));
        assert!(graph.upstream(&PortId::new(a, "input")).is_none());
    }

    #[test]
    fn test_self_connection_rejected() {
        let (mut graph, a, _) = two_node_graph();
        let result = graph.connect(PortId::new(a, "height"), PortId::new(a, "input"));
        assert!(result.is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut graph, a, b) = two_node_graph();
        graph
            .connect(PortId::new(a, "height"), PortId::new(b, "input"))
            .unwrap();
        let result = graph.connect(PortId::new(b, "height"), PortId::new(a, "input"));
        assert!(result.is_err());
    }

    #[test]
    fn test_upstream_all_preserves_connection_order() {
        let mut graph = Graph::new("test");
        let sink = graph.add_node(GraphNode::new("terrain.combine", ParamMap::new()));
        let mut sources = Vec::new();
        for _ in 0..3 {
            let id = graph.add_node(GraphNode::new("terrain.constant", ParamMap::new()));
            graph
                .connect(PortId::new(id, "height"), PortId::new(sink, "values"))
                .unwrap();
            sources.push(id);
        }

        let upstream: Vec<Uuid> = graph
            .upstream_all(&PortId::new(sink, "values"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(upstream, sources);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (mut graph, a, b) = two_node_graph();
        graph
            .connect(PortId::new(a, "height"), PortId::new(b, "input"))
            .unwrap();
        graph.add_root(b);

        let json = graph.save().unwrap();
        let loaded = Graph::load(&json).unwrap();
        assert_eq!(graph, loaded);
    }

    #[test]
    fn test_instantiate_rewrites_internal_edges() {
        let mut template = Graph::new("template");
        let src = template.add_node(GraphNode::new("terrain.constant", ParamMap::new()));
        let dst = template.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));
        template
            .connect(PortId::new(src, "height"), PortId::new(dst, "input"))
            .unwrap();

        let mut host = Graph::new("host");
        let mut overrides = HashMap::new();
        overrides.insert((src, "value".to_string()), ParamValue::from(3.0));

        let remap = host.instantiate(&template, &overrides);
        let new_src = remap[&src];
        let new_dst = remap[&dst];

        assert_ne!(new_src, src);
        assert_eq!(
            host.node(new_src).unwrap().param_scalar("value", 0.0),
            3.0
        );
        assert_eq!(
            host.upstream(&PortId::new(new_dst, "input")).unwrap().0,
            new_src
        );

        // A second instance is fully independent.
        let remap2 = host.instantiate(&template, &HashMap::new());
        assert_ne!(remap2[&src], new_src);
    }
}
