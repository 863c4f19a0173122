//! Execution contexts: the working state of one concrete generation request.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::asyncop::AsyncOperation;
use crate::model::Vec2;
use crate::plan::{BufferSlot, PathPlan, PortKey, Resolution};
use crate::pool::{ArenaPool, BufRef, BufferPack, PackOwner};
use crate::task::TaskHandle;

/// Index of a context within its owning [`crate::tree::ContextTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub usize);

/// Per-(node, context) scheduling state. `Done` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Idle,
    WaitingDependencies,
    Processing,
    Done,
}

/// A cached node output inside one context.
#[derive(Clone, Debug, PartialEq)]
pub enum PortValue {
    Scalar(f64),
    Integer(i64),
    /// Samples live in the context's arena at this slot.
    Buffer(BufferSlot),
    List(Vec<PortValue>),
}

const EMPTY: &[f32] = &[];

/// One concrete generation request's working state: an arena slice sized by
/// the matching plan, per-node scheduling state and output cache, and a
/// parent pointer for derived sub-passes.
///
/// Once closed, a context is dead: reads and writes are lifecycle violations,
/// detected and logged (and asserted in debug builds), never undefined.
pub struct ExecutionContext {
    pub id: Uuid,
    pub seed: u64,
    pub origin: Vec2,
    pub resolution: Resolution,
    pub parent: Option<ContextId>,
    plan: Arc<PathPlan>,
    arena: Vec<f32>,
    states: HashMap<Uuid, NodeState>,
    launched: HashSet<Uuid>,
    values: HashMap<PortKey, PortValue>,
    pending: HashMap<Uuid, Box<dyn AsyncOperation>>,
    tasks: Vec<TaskHandle>,
    scratch: BufferPack,
    aux: HashMap<TypeId, Box<dyn Any + Send>>,
    closed: bool,
}

impl ExecutionContext {
    pub fn new(
        pool: &mut ArenaPool,
        plan: Arc<PathPlan>,
        seed: u64,
        origin: Vec2,
        parent: Option<ContextId>,
    ) -> Self {
        let id = Uuid::new_v4();
        let arena = pool.acquire_buffer(plan.arena_len());
        // Packs are keyed by the graph, not this context, so the next
        // same-shape pass reuses the buffers this one returns.
        let scratch = pool.open_pack(PackOwner(plan.graph_id()));
        Self {
            id,
            seed,
            origin,
            resolution: plan.base_resolution(),
            parent,
            plan,
            arena,
            states: HashMap::new(),
            launched: HashSet::new(),
            values: HashMap::new(),
            pending: HashMap::new(),
            tasks: Vec::new(),
            scratch,
            aux: HashMap::new(),
            closed: false,
        }
    }

    pub fn plan(&self) -> &Arc<PathPlan> {
        &self.plan
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn guard_open(&self, what: &str) -> bool {
        if self.closed {
            log::error!("context {} used after close: {}", self.id, what);
            debug_assert!(false, "context used after close: {}", what);
            return false;
        }
        true
    }

    // --- node scheduling state -------------------------------------------

    pub fn node_state(&self, node_id: Uuid) -> NodeState {
        self.states.get(&node_id).copied().unwrap_or_default()
    }

    pub fn set_node_state(&mut self, node_id: Uuid, state: NodeState) {
        if !self.guard_open("set_node_state") {
            return;
        }
        self.states.insert(node_id, state);
    }

    /// Whether the operator's processing callback has been invoked for this
    /// node. Guards the exactly-once contract.
    pub fn launched(&self, node_id: Uuid) -> bool {
        self.launched.contains(&node_id)
    }

    pub fn mark_launched(&mut self, node_id: Uuid) {
        if !self.guard_open("mark_launched") {
            return;
        }
        self.launched.insert(node_id);
    }

    // --- output cache ----------------------------------------------------

    pub fn value(&self, node_id: Uuid, port_name: &str) -> Option<&PortValue> {
        self.values.get(&(node_id, port_name.to_string()))
    }

    pub fn set_value(&mut self, node_id: Uuid, port_name: &str, value: PortValue) {
        if !self.guard_open("set_value") {
            return;
        }
        self.values.insert((node_id, port_name.to_string()), value);
    }

    // --- pending async operations ----------------------------------------

    pub fn take_pending(&mut self, node_id: Uuid) -> Option<Box<dyn AsyncOperation>> {
        self.pending.remove(&node_id)
    }

    pub fn put_pending(&mut self, node_id: Uuid, op: Box<dyn AsyncOperation>) {
        if !self.guard_open("put_pending") {
            return;
        }
        self.pending.insert(node_id, op);
    }

    // --- arena -----------------------------------------------------------

    pub fn arena_read(&self, slot: BufferSlot) -> &[f32] {
        if !self.guard_open("arena_read") {
            return EMPTY;
        }
        let end = slot.offset + slot.len;
        if end > self.arena.len() {
            log::error!(
                "slot {:?} out of arena bounds ({} samples)",
                slot,
                self.arena.len()
            );
            return EMPTY;
        }
        &self.arena[slot.offset..end]
    }

    pub fn arena_write(&mut self, slot: BufferSlot, data: &[f32]) {
        if !self.guard_open("arena_write") {
            return;
        }
        let end = slot.offset + slot.len;
        if end > self.arena.len() {
            log::error!(
                "slot {:?} out of arena bounds ({} samples)",
                slot,
                self.arena.len()
            );
            return;
        }
        let n = slot.len.min(data.len());
        self.arena[slot.offset..slot.offset + n].copy_from_slice(&data[..n]);
    }

    /// Copy one of this context's scratch buffers into an arena slot.
    pub fn arena_write_from_scratch(&mut self, slot: BufferSlot, buf: BufRef) {
        if !self.guard_open("arena_write_from_scratch") {
            return;
        }
        let end = slot.offset + slot.len;
        if end > self.arena.len() {
            log::error!(
                "slot {:?} out of arena bounds ({} samples)",
                slot,
                self.arena.len()
            );
            return;
        }
        let data = self.scratch.get(buf);
        let n = slot.len.min(data.len());
        self.arena[slot.offset..slot.offset + n].copy_from_slice(&data[..n]);
    }

    // --- parallel tasks --------------------------------------------------

    /// Record an outstanding handle owned by this context; joined before the
    /// arena is released, so an abandoned task can never write into memory
    /// that has been reassigned.
    pub fn add_task(&mut self, handle: TaskHandle) {
        if !self.guard_open("add_task") {
            return;
        }
        self.tasks.push(handle);
    }

    pub fn outstanding_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_complete()).count()
    }

    // --- scoped scratch --------------------------------------------------

    /// Check a scratch buffer out of this context's pack. It is returned to
    /// the pool, together with every other checkout, when the context closes,
    /// and reused by the next context planned against the same graph.
    pub fn scratch_acquire(&mut self, pool: &mut ArenaPool, len: usize) -> BufRef {
        self.scratch.acquire(pool, len)
    }

    pub fn scratch(&self, buf: BufRef) -> &[f32] {
        self.scratch.get(buf)
    }

    pub fn scratch_mut(&mut self, buf: BufRef) -> &mut [f32] {
        self.scratch.get_mut(buf)
    }

    // --- auxiliary collaborator state ------------------------------------

    /// Attach auxiliary per-context state. Used by tree lifecycle hooks to
    /// lazily install collaborator state the core knows nothing about.
    pub fn aux_set<T: Any + Send>(&mut self, value: T) {
        self.aux.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn aux_get<T: Any + Send>(&self) -> Option<&T> {
        self.aux
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn aux_get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.aux
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut::<T>())
    }

    pub fn aux_take<T: Any + Send>(&mut self) -> Option<T> {
        self.aux
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    // --- lifecycle -------------------------------------------------------

    /// Close this context: join outstanding task handles, recycle pending
    /// operations, return the scratch pack and arena to the pool, and mark
    /// the context dead.
    pub fn close(&mut self, pool: &mut ArenaPool) {
        if self.closed {
            log::warn!("context {} closed twice", self.id);
            return;
        }

        for task in self.tasks.drain(..) {
            task.join();
        }
        for (_, op) in self.pending.drain() {
            op.recycle(pool);
        }

        pool.close_pack(std::mem::take(&mut self.scratch));
        pool.release_buffer(std::mem::take(&mut self.arena));

        self.states.clear();
        self.launched.clear();
        self.values.clear();
        self.aux.clear();
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::model::{Graph, GraphNode, ParamMap, PortId};
    use crate::operator::OperatorRegistry;
    use crate::plan::PathPlan;

    fn test_plan() -> (Arc<PathPlan>, Uuid) {
        let registry = OperatorRegistry::new();
        builtin::register_all(&registry);

        let mut graph = Graph::new("ctx-test");
        let constant = graph.add_node(GraphNode::new("terrain.constant", ParamMap::new()));
        let norm = graph.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));
        graph
            .connect(PortId::new(constant, "height"), PortId::new(norm, "input"))
            .unwrap();
        graph.add_root(norm);

        (
            Arc::new(PathPlan::plan(&graph, &registry, Resolution(4))),
            norm,
        )
    }

    #[test]
    fn test_arena_round_trip() {
        let (plan, norm) = test_plan();
        let mut pool = ArenaPool::new();
        let mut ctx = ExecutionContext::new(&mut pool, plan.clone(), 1, Vec2::new(0.0, 0.0), None);

        let slot = plan.slot(norm, "height").unwrap();
        let data = vec![0.5; slot.len];
        ctx.arena_write(slot, &data);
        assert_eq!(ctx.arena_read(slot), &data[..]);

        ctx.close(&mut pool);
    }

    #[test]
    fn test_state_defaults_to_idle_and_done_is_sticky() {
        let (plan, norm) = test_plan();
        let mut pool = ArenaPool::new();
        let mut ctx = ExecutionContext::new(&mut pool, plan, 1, Vec2::new(0.0, 0.0), None);

        assert_eq!(ctx.node_state(norm), NodeState::Idle);
        ctx.set_node_state(norm, NodeState::Done);
        assert_eq!(ctx.node_state(norm), NodeState::Done);
        ctx.close(&mut pool);
    }

    #[test]
    fn test_aux_state_round_trip() {
        struct GridPoints(Vec<u32>);

        let (plan, _) = test_plan();
        let mut pool = ArenaPool::new();
        let mut ctx = ExecutionContext::new(&mut pool, plan, 1, Vec2::new(0.0, 0.0), None);

        ctx.aux_set(GridPoints(vec![1, 2, 3]));
        assert_eq!(ctx.aux_get::<GridPoints>().unwrap().0, vec![1, 2, 3]);
        let taken = ctx.aux_take::<GridPoints>().unwrap();
        assert_eq!(taken.0, vec![1, 2, 3]);
        assert!(ctx.aux_get::<GridPoints>().is_none());
        ctx.close(&mut pool);
    }

    #[test]
    fn test_scratch_reused_across_same_shape_contexts() {
        let (plan, _) = test_plan();
        let mut pool = ArenaPool::new();

        let mut ctx = ExecutionContext::new(&mut pool, plan.clone(), 1, Vec2::new(0.0, 0.0), None);
        let buf = ctx.scratch_acquire(&mut pool, 64);
        ctx.scratch_mut(buf)[0] = 9.0;
        let ptr = ctx.scratch(buf).as_ptr();
        ctx.close(&mut pool);

        // A second pass of the same shape checks out the same backing
        // buffer, zeroed.
        let mut ctx = ExecutionContext::new(&mut pool, plan, 2, Vec2::new(1.0, 0.0), None);
        let buf = ctx.scratch_acquire(&mut pool, 64);
        assert_eq!(ctx.scratch(buf).as_ptr(), ptr);
        assert_eq!(ctx.scratch(buf)[0], 0.0);
        ctx.close(&mut pool);
    }

    #[test]
    fn test_scratch_lands_in_arena_slot() {
        let (plan, norm) = test_plan();
        let mut pool = ArenaPool::new();
        let mut ctx = ExecutionContext::new(&mut pool, plan.clone(), 1, Vec2::new(0.0, 0.0), None);

        let slot = plan.slot(norm, "height").unwrap();
        let buf = ctx.scratch_acquire(&mut pool, slot.len);
        ctx.scratch_mut(buf).fill(0.25);
        ctx.arena_write_from_scratch(slot, buf);
        assert!(ctx.arena_read(slot).iter().all(|&v| v == 0.25));

        ctx.close(&mut pool);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "used after close")]
    fn test_read_after_close_is_detected() {
        let (plan, norm) = test_plan();
        let mut pool = ArenaPool::new();
        let mut ctx = ExecutionContext::new(&mut pool, plan.clone(), 1, Vec2::new(0.0, 0.0), None);
        ctx.close(&mut pool);

        let slot = plan.slot(norm, "height").unwrap();
        let _ = ctx.arena_read(slot);
    }
}
