//! Static buffer layout planning.
//!
//! Before a graph is executed at some resolution, one pre-pass walks it from
//! the roots and decides, for every reachable node, the resolution its
//! outputs must be produced at and the slot they occupy inside one shared
//! arena. The resulting [`PathPlan`] is memoized per (graph, resolution) pair
//! and shared by every execution context created against it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Graph, PortId};
use crate::operator::OperatorRegistry;
use crate::util::ScopedTimer;

/// Grid resolution of a square sample patch. A resolution of `r` means
/// `r + 1` samples per edge, `(r + 1)^2` samples total.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct Resolution(pub u32);

impl Resolution {
    pub fn edge(self) -> usize {
        self.0 as usize + 1
    }

    pub fn samples(self) -> usize {
        self.edge() * self.edge()
    }

    pub fn padded(self, samples: u32) -> Resolution {
        Resolution(self.0 + samples)
    }
}

/// Identifies one output field of one node.
pub type PortKey = (Uuid, String);

/// Placement of one node output inside a context's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSlot {
    pub slot_index: usize,
    pub resolution: Resolution,
    /// Samples actually used by this slot: `resolution.samples()`.
    pub len: usize,
    /// Absolute offset into the arena, finalized after all resolutions are
    /// known: `slot_index * stride`.
    pub offset: usize,
}

/// Hard cap on grow-and-rewalk passes per node. The natural bound is the
/// number of distinct resolutions requested anywhere in the graph; this cap
/// keeps pathological graphs (resolution-padding cycles) from growing without
/// limit.
const MAX_REGROWS: u32 = 32;

/// The static buffer layout plan for a (graph, resolution) pair.
pub struct PathPlan {
    graph_id: Uuid,
    base_resolution: Resolution,
    slots: HashMap<PortKey, BufferSlot>,
    /// Node discovery order, roots first.
    order: Vec<Uuid>,
    stride: usize,
    arena_len: usize,
}

impl PathPlan {
    /// Plan buffer layout for `graph.roots` at `base`.
    pub fn plan(graph: &Graph, registry: &OperatorRegistry, base: Resolution) -> PathPlan {
        Self::plan_for_roots(graph, registry, &graph.roots, base)
    }

    /// Plan buffer layout for an explicit root set at `base`.
    pub fn plan_for_roots(
        graph: &Graph,
        registry: &OperatorRegistry,
        roots: &[Uuid],
        base: Resolution,
    ) -> PathPlan {
        let _timer = ScopedTimer::debug_lazy(|| format!("plan graph {} at {:?}", graph.id, base));

        let mut planner = Planner {
            graph,
            registry,
            node_res: HashMap::new(),
            slot_indices: HashMap::new(),
            order: Vec::new(),
            requested: BTreeSet::new(),
            regrows: HashMap::new(),
            next_slot: 0,
        };

        for root in roots {
            planner.visit(*root, base);
        }

        // Offsets are only finalized now: the stride depends on the largest
        // resolution any slot ended up with.
        let stride = planner
            .node_res
            .values()
            .map(|r| r.samples())
            .max()
            .unwrap_or(base.samples());

        let mut slots = HashMap::new();
        for ((node_id, port_name), slot_index) in &planner.slot_indices {
            let resolution = planner.node_res[node_id];
            slots.insert(
                (*node_id, port_name.clone()),
                BufferSlot {
                    slot_index: *slot_index,
                    resolution,
                    len: resolution.samples(),
                    offset: slot_index * stride,
                },
            );
        }

        PathPlan {
            graph_id: graph.id,
            base_resolution: base,
            slots,
            order: planner.order,
            stride,
            arena_len: planner.next_slot * stride,
        }
    }

    /// Look up the slot planned for a (node, output field) pair.
    ///
    /// A miss means the field was never planned; that is a configuration
    /// error on the requesting node, never a reason to fabricate space.
    pub fn slot(&self, node_id: Uuid, port_name: &str) -> Option<BufferSlot> {
        let slot = self
            .slots
            .get(&(node_id, port_name.to_string()))
            .copied();
        if slot.is_none() {
            log::error!(
                "no slot planned for {}.{} in plan of graph {} at {:?}",
                node_id,
                port_name,
                self.graph_id,
                self.base_resolution
            );
        }
        slot
    }

    pub fn has_slot(&self, node_id: Uuid, port_name: &str) -> bool {
        self.slots.contains_key(&(node_id, port_name.to_string()))
    }

    pub fn graph_id(&self) -> Uuid {
        self.graph_id
    }

    pub fn base_resolution(&self) -> Resolution {
        self.base_resolution
    }

    pub fn order(&self) -> &[Uuid] {
        &self.order
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Total arena length in samples: slot count times stride.
    pub fn arena_len(&self) -> usize {
        self.arena_len
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

struct Planner<'a> {
    graph: &'a Graph,
    registry: &'a OperatorRegistry,
    /// Final resolution granted to each visited node (max over all callers).
    node_res: HashMap<Uuid, Resolution>,
    slot_indices: HashMap<PortKey, usize>,
    order: Vec<Uuid>,
    /// Every distinct resolution requested anywhere during this plan; bounds
    /// grow-and-rewalk.
    requested: BTreeSet<u32>,
    regrows: HashMap<Uuid, u32>,
    next_slot: usize,
}

impl Planner<'_> {
    fn visit(&mut self, node_id: Uuid, res: Resolution) {
        self.requested.insert(res.0);

        let Some(gnode) = self.graph.node(node_id) else {
            log::error!("planner: node {} not present in graph {}", node_id, self.graph.id);
            return;
        };
        let Some(op) = self.registry.get(&gnode.type_id) else {
            log::error!(
                "planner: no operator registered for type {} (node {})",
                gnode.type_id,
                node_id
            );
            return;
        };

        match self.node_res.get(&node_id).copied() {
            // Idempotent: an equal or smaller request changes nothing.
            Some(current) if current >= res => return,
            Some(current) => {
                let grows = self.regrows.entry(node_id).or_insert(0);
                *grows += 1;
                let bound = (self.requested.len() as u32).min(MAX_REGROWS);
                if *grows > bound {
                    log::error!(
                        "planner: resolution of node {} did not settle after {} grows; keeping {:?}",
                        node_id,
                        grows,
                        current
                    );
                    return;
                }
                // Grow and re-walk this node's subtree once.
                self.node_res.insert(node_id, res);
            }
            None => {
                self.node_res.insert(node_id, res);
                self.order.push(node_id);
                for output in op.outputs() {
                    let index = self.next_slot;
                    self.next_slot += 1;
                    self.slot_indices.insert((node_id, output.name), index);
                }
            }
        }

        for input in op.inputs() {
            let want = op.input_resolution(&input.name, res);
            for (src, _port) in self.graph.upstream_all(&PortId::new(node_id, &input.name)) {
                self.visit(src, want);
            }
        }
    }
}

/// Cache of plans keyed by (graph id, resolution); plans live for the
/// graph's lifetime.
#[derive(Default)]
pub struct PlanCache {
    plans: HashMap<(Uuid, Resolution), Arc<PathPlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_plan(
        &mut self,
        graph: &Graph,
        registry: &OperatorRegistry,
        base: Resolution,
    ) -> Arc<PathPlan> {
        self.plans
            .entry((graph.id, base))
            .or_insert_with(|| Arc::new(PathPlan::plan(graph, registry, base)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::model::{GraphNode, ParamMap};

    fn registry() -> OperatorRegistry {
        let registry = OperatorRegistry::new();
        builtin::register_all(&registry);
        registry
    }

    fn chain_graph() -> (Graph, Uuid, Uuid) {
        let mut graph = Graph::new("chain");
        let noise = graph.add_node(GraphNode::new("terrain.noise", ParamMap::new()));
        let norm = graph.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));
        graph
            .connect(PortId::new(noise, "height"), PortId::new(norm, "input"))
            .unwrap();
        graph.add_root(norm);
        (graph, noise, norm)
    }

    #[test]
    fn test_default_planning_propagates_base_resolution() {
        let (graph, noise, norm) = chain_graph();
        let plan = PathPlan::plan(&graph, &registry(), Resolution(8));

        let root_slot = plan.slot(norm, "height").unwrap();
        let src_slot = plan.slot(noise, "height").unwrap();
        assert_eq!(root_slot.resolution, Resolution(8));
        assert_eq!(src_slot.resolution, Resolution(8));
        assert_eq!(root_slot.len, 81);
        assert_eq!(plan.arena_len(), plan.slot_count() * plan.stride());
        assert_ne!(root_slot.offset, src_slot.offset);
    }

    #[test]
    fn test_custom_planner_pads_input() {
        let mut graph = Graph::new("blurred");
        let noise = graph.add_node(GraphNode::new("terrain.noise", ParamMap::new()));
        let blur = graph.add_node(GraphNode::new("terrain.blur", ParamMap::new()));
        graph
            .connect(PortId::new(noise, "height"), PortId::new(blur, "input"))
            .unwrap();
        graph.add_root(blur);

        let plan = PathPlan::plan(&graph, &registry(), Resolution(8));
        let blur_slot = plan.slot(blur, "height").unwrap();
        let noise_slot = plan.slot(noise, "height").unwrap();

        // Blur reads a border of one extra sample on each side.
        assert_eq!(blur_slot.resolution, Resolution(8));
        assert_eq!(noise_slot.resolution, Resolution(10));
        assert_eq!(plan.stride(), Resolution(10).samples());
    }

    #[test]
    fn test_monotonic_growth_takes_dependent_maximum() {
        // noise feeds both a blur (wants 8+2) and a normalize (wants 8);
        // the shared source must be planned at the maximum.
        let mut graph = Graph::new("fanout");
        let noise = graph.add_node(GraphNode::new("terrain.noise", ParamMap::new()));
        let norm = graph.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));
        let blur = graph.add_node(GraphNode::new("terrain.blur", ParamMap::new()));
        graph
            .connect(PortId::new(noise, "height"), PortId::new(norm, "input"))
            .unwrap();
        graph
            .connect(PortId::new(noise, "height"), PortId::new(blur, "input"))
            .unwrap();
        graph.add_root(norm);
        graph.add_root(blur);

        let plan = PathPlan::plan(&graph, &registry(), Resolution(8));
        assert_eq!(plan.slot(noise, "height").unwrap().resolution, Resolution(10));
        assert_eq!(plan.slot(norm, "height").unwrap().resolution, Resolution(8));
    }

    #[test]
    fn test_replanning_is_a_noop() {
        let (graph, noise, norm) = chain_graph();
        let reg = registry();
        let first = PathPlan::plan(&graph, &reg, Resolution(16));
        let second = PathPlan::plan(&graph, &reg, Resolution(16));

        for (node, port) in [(noise, "height"), (norm, "height")] {
            assert_eq!(first.slot(node, port), second.slot(node, port));
        }
        assert_eq!(first.arena_len(), second.arena_len());
        assert_eq!(first.order(), second.order());
    }

    #[test]
    fn test_unplanned_slot_returns_none() {
        let (graph, _, norm) = chain_graph();
        let plan = PathPlan::plan(&graph, &registry(), Resolution(8));
        assert!(plan.slot(norm, "no_such_port").is_none());
        assert!(plan.slot(Uuid::new_v4(), "height").is_none());
    }

    #[test]
    fn test_cyclic_graph_planning_terminates() {
        let mut graph = Graph::new("cycle");
        let a = graph.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));
        let b = graph.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));
        graph.connect_unchecked(PortId::new(a, "height"), PortId::new(b, "input"));
        graph.connect_unchecked(PortId::new(b, "height"), PortId::new(a, "input"));
        graph.add_root(a);

        let plan = PathPlan::plan(&graph, &registry(), Resolution(8));
        assert!(plan.has_slot(a, "height"));
        assert!(plan.has_slot(b, "height"));
    }

    #[test]
    fn test_plan_cache_shares_plans() {
        let (graph, _, _) = chain_graph();
        let reg = registry();
        let mut cache = PlanCache::new();
        let p1 = cache.get_or_plan(&graph, &reg, Resolution(8));
        let p2 = cache.get_or_plan(&graph, &reg, Resolution(8));
        assert!(Arc::ptr_eq(&p1, &p2));

        let p3 = cache.get_or_plan(&graph, &reg, Resolution(16));
        assert!(!Arc::ptr_eq(&p1, &p3));
        assert_eq!(cache.len(), 2);
    }
}
