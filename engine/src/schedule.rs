//! Cooperative per-node scheduling.
//!
//! Polling a node either makes progress and returns, or returns "not ready"
//! without blocking. Dependencies are walked recursively; a shared depth
//! budget per top-level poll converts deep or cyclic chains into a recorded
//! checkpoint instead of unbounded recursion. The next top-level poll resumes
//! from the checkpoint, so worst-case call-stack depth is bounded at the cost
//! of needing more frames to converge.

use std::collections::HashSet;

use uuid::Uuid;

use crate::context::{ContextId, ExecutionContext, NodeState, PortValue};
use crate::engine::EngineServices;
use crate::error::EngineError;
use crate::model::{PortId, Vec2};
use crate::operator::Progress;
use crate::plan::{BufferSlot, Resolution};
use crate::pool::{BufRef, Poolable};
use crate::task::{TaskHandle, TaskWork};
use crate::tree::{ContextTree, ROOT};

/// Per-top-level-poll walk state: recursion depth, the set of nodes on the
/// current descent path (cycle detection), and the checkpoint to resume from
/// next poll.
pub struct Walk {
    depth: usize,
    budget: usize,
    active: HashSet<(ContextId, Uuid)>,
    checkpoint: Option<(ContextId, Uuid)>,
}

impl Walk {
    pub fn new(budget: usize) -> Self {
        Self {
            depth: 0,
            budget,
            active: HashSet::new(),
            checkpoint: None,
        }
    }

    /// Try to descend into (ctx, node). Refuses re-entry into a node already
    /// on the descent path (a cycle) and refuses to exceed the depth budget,
    /// recording the deepest refused node as the resume checkpoint.
    fn enter(&mut self, ctx: ContextId, node: Uuid) -> bool {
        if self.active.contains(&(ctx, node)) {
            return false;
        }
        if self.depth >= self.budget {
            if self.checkpoint.is_none() {
                self.checkpoint = Some((ctx, node));
            }
            return false;
        }
        self.depth += 1;
        self.active.insert((ctx, node));
        true
    }

    fn leave(&mut self, ctx: ContextId, node: Uuid) {
        self.depth -= 1;
        self.active.remove(&(ctx, node));
    }

    pub fn take_checkpoint(&mut self) -> Option<(ContextId, Uuid)> {
        self.checkpoint.take()
    }
}

/// Poll every root node of the tree once. Returns true once all roots are
/// `Done` in the root context.
pub fn poll_tree(services: &EngineServices, tree: &mut ContextTree) -> bool {
    if tree.is_closed() {
        log::error!("poll of closed tree {}", tree.id);
        debug_assert!(false, "poll of closed tree");
        return true;
    }

    let mut walk = Walk::new(services.config.depth_budget);

    // Resume where the previous poll ran out of depth budget.
    if let Some((ctx, node)) = tree.take_checkpoint() {
        if let Err(e) = poll_node(services, tree, ctx, node, &mut walk) {
            log::error!("checkpoint resume of node {} failed: {}", node, e);
        }
    }

    let roots = tree.graph().roots.clone();
    let mut done = true;
    for root in roots {
        match poll_node(services, tree, ROOT, root, &mut walk) {
            Ok(root_done) => done &= root_done,
            Err(e) => {
                log::error!("poll of root node {} failed: {}", root, e);
                done = false;
            }
        }
    }

    tree.set_checkpoint(walk.take_checkpoint());
    done
}

/// Poll one node in one context, recursively resolving its dependencies.
pub fn poll_node(
    services: &EngineServices,
    tree: &mut ContextTree,
    ctx_id: ContextId,
    node_id: Uuid,
    walk: &mut Walk,
) -> Result<bool, EngineError> {
    if tree.context(ctx_id).node_state(node_id) == NodeState::Done {
        return Ok(true);
    }
    if !walk.enter(ctx_id, node_id) {
        return Ok(false);
    }
    let result = poll_node_inner(services, tree, ctx_id, node_id, walk);
    walk.leave(ctx_id, node_id);
    result
}

fn poll_node_inner(
    services: &EngineServices,
    tree: &mut ContextTree,
    ctx_id: ContextId,
    node_id: Uuid,
    walk: &mut Walk,
) -> Result<bool, EngineError> {
    let graph = tree.graph().clone();

    let Some(gnode) = graph.node(node_id).cloned() else {
        log::error!("node {} not in graph {}; output degraded", node_id, graph.id);
        tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
        return Ok(true);
    };
    let Some(op) = services.registry.get(&gnode.type_id) else {
        log::error!(
            "no operator registered for {} (node {}); output degraded",
            gnode.type_id,
            node_id
        );
        tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
        return Ok(true);
    };

    if tree.context(ctx_id).node_state(node_id) == NodeState::Idle {
        tree.context_mut(ctx_id)
            .set_node_state(node_id, NodeState::WaitingDependencies);
    }

    if tree.context(ctx_id).node_state(node_id) == NodeState::WaitingDependencies {
        let mut ready = true;
        for input in op.inputs() {
            for (src, _port) in graph.upstream_all(&PortId::new(node_id, &input.name)) {
                if !poll_node(services, tree, ctx_id, src, walk)? {
                    ready = false;
                }
            }
        }
        if !ready {
            if tree.is_forced() {
                log::error!(
                    "forced completion: node {} still waiting on dependencies",
                    node_id
                );
            }
            return Ok(false);
        }
        tree.context_mut(ctx_id)
            .set_node_state(node_id, NodeState::Processing);
    }

    // Resume a pending async operation if one exists; otherwise this is the
    // node's single processing invocation.
    if let Some(mut pending) = tree.context_mut(ctx_id).take_pending(node_id) {
        let mut cx = OpCtx {
            services,
            tree: &mut *tree,
            ctx: ctx_id,
            walk: &mut *walk,
        };
        match pending.poll(&mut cx) {
            Ok(true) => {
                let mut pool = services.pools.lock().unwrap();
                pending.recycle(&mut pool);
                drop(pool);
                tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
                Ok(true)
            }
            Ok(false) => {
                tree.context_mut(ctx_id).put_pending(node_id, pending);
                Ok(false)
            }
            Err(e) => {
                log::error!(
                    "async operation for node {} failed: {}; output degraded",
                    node_id,
                    e
                );
                let mut pool = services.pools.lock().unwrap();
                pending.recycle(&mut pool);
                drop(pool);
                tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
                Ok(true)
            }
        }
    } else if !tree.context(ctx_id).launched(node_id) {
        tree.context_mut(ctx_id).mark_launched(node_id);
        let mut cx = OpCtx {
            services,
            tree: &mut *tree,
            ctx: ctx_id,
            walk: &mut *walk,
        };
        match op.process(&gnode, &mut cx) {
            Ok(Progress::Done) => {
                tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
                Ok(true)
            }
            Ok(Progress::Pending(mut pending)) => match pending.poll(&mut cx) {
                Ok(true) => {
                    let mut pool = services.pools.lock().unwrap();
                    pending.recycle(&mut pool);
                    drop(pool);
                    tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
                    Ok(true)
                }
                Ok(false) => {
                    tree.context_mut(ctx_id).put_pending(node_id, pending);
                    Ok(false)
                }
                Err(e) => {
                    log::error!(
                        "async operation for node {} failed: {}; output degraded",
                        node_id,
                        e
                    );
                    let mut pool = services.pools.lock().unwrap();
                    pending.recycle(&mut pool);
                    drop(pool);
                    tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
                    Ok(true)
                }
            },
            Err(e) => {
                log::error!(
                    "operator {} failed on node {}: {}; output degraded",
                    gnode.type_id,
                    node_id,
                    e
                );
                tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
                Ok(true)
            }
        }
    } else {
        // Launched, no pending operation, not done: a pending operation was
        // lost. Degrade rather than wedge the tree.
        log::error!(
            "node {} launched but has no pending operation; output degraded",
            node_id
        );
        tree.context_mut(ctx_id).set_node_state(node_id, NodeState::Done);
        Ok(true)
    }
}

/// Overrides for a derived sibling context.
#[derive(Default, Clone, Copy, Debug)]
pub struct ContextOverrides {
    pub seed: Option<u64>,
    pub resolution: Option<Resolution>,
    pub origin: Option<Vec2>,
}

/// Everything an operator (or async operation) may touch while processing one
/// node in one context.
pub struct OpCtx<'a> {
    pub services: &'a EngineServices,
    pub tree: &'a mut ContextTree,
    pub ctx: ContextId,
    pub walk: &'a mut Walk,
}

impl OpCtx<'_> {
    pub fn forced(&self) -> bool {
        self.tree.is_forced()
    }

    pub fn seed(&self) -> u64 {
        self.tree.context(self.ctx).seed
    }

    pub fn origin(&self) -> Vec2 {
        self.tree.context(self.ctx).origin
    }

    pub fn resolution(&self) -> Resolution {
        self.tree.context(self.ctx).resolution
    }

    pub fn context(&self) -> &ExecutionContext {
        self.tree.context(self.ctx)
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        self.tree.context_mut(self.ctx)
    }

    /// The slot planned for a (node, output field) pair in this context.
    pub fn slot(&self, node_id: Uuid, port_name: &str) -> Option<BufferSlot> {
        self.tree.context(self.ctx).plan().slot(node_id, port_name)
    }

    pub fn upstream(&self, node_id: Uuid, input: &str) -> Option<(Uuid, String)> {
        self.tree.graph().upstream(&PortId::new(node_id, input))
    }

    pub fn upstream_all(&self, node_id: Uuid, input: &str) -> Vec<(Uuid, String)> {
        self.tree.graph().upstream_all(&PortId::new(node_id, input))
    }

    /// Snapshot an input's samples into a pooled buffer.
    ///
    /// Unconnected or unplanned inputs log and yield zeros at `fallback`
    /// resolution; the caller treats that as "node misconfigured", the
    /// runtime never fabricates arena space for it.
    pub fn input_samples(
        &mut self,
        node_id: Uuid,
        input: &str,
        fallback: Resolution,
    ) -> (Vec<f32>, Resolution) {
        let Some((src_node, src_port)) = self.upstream(node_id, input) else {
            log::warn!("input {}.{} is unconnected; zeros substituted", node_id, input);
            return (self.acquire_buffer(fallback.samples()), fallback);
        };
        match self.read_slot(self.ctx, src_node, &src_port) {
            Some(copy) => copy,
            None => (self.acquire_buffer(fallback.samples()), fallback),
        }
    }

    /// Copy a node output's samples out of any context in this tree.
    pub fn read_slot(
        &mut self,
        ctx_id: ContextId,
        node_id: Uuid,
        port_name: &str,
    ) -> Option<(Vec<f32>, Resolution)> {
        let slot = self.tree.context(ctx_id).plan().slot(node_id, port_name)?;
        let mut buf = self.acquire_buffer(slot.len);
        let src = self.tree.context(ctx_id).arena_read(slot);
        let n = slot.len.min(src.len());
        buf[..n].copy_from_slice(&src[..n]);
        Some((buf, slot.resolution))
    }

    /// Write samples into a node output's slot and cache the result.
    pub fn write_output(&mut self, node_id: Uuid, port_name: &str, data: &[f32]) {
        let Some(slot) = self.slot(node_id, port_name) else {
            return;
        };
        let ctx = self.tree.context_mut(self.ctx);
        ctx.arena_write(slot, data);
        ctx.set_value(node_id, port_name, PortValue::Buffer(slot));
    }

    /// Write one of the context's scratch buffers into a node output's slot
    /// and cache the result.
    pub fn write_scratch_output(&mut self, node_id: Uuid, port_name: &str, buf: BufRef) {
        let Some(slot) = self.slot(node_id, port_name) else {
            return;
        };
        let ctx = self.tree.context_mut(self.ctx);
        ctx.arena_write_from_scratch(slot, buf);
        ctx.set_value(node_id, port_name, PortValue::Buffer(slot));
    }

    pub fn write_scalar(&mut self, node_id: Uuid, port_name: &str, value: f64) {
        self.tree
            .context_mut(self.ctx)
            .set_value(node_id, port_name, PortValue::Scalar(value));
    }

    pub fn acquire_buffer(&mut self, len: usize) -> Vec<f32> {
        self.services.pools.lock().unwrap().acquire_buffer(len)
    }

    pub fn recycle(&mut self, buf: Vec<f32>) {
        self.services.pools.lock().unwrap().release_buffer(buf);
    }

    /// Acquire a pooled async operation (or any poolable bookkeeping object).
    pub fn acquire_op<T: Poolable>(&mut self) -> T {
        self.services.pools.lock().unwrap().acquire()
    }

    /// Check a scratch buffer out of the context's pack. Returned to the
    /// pool with the pack when the context closes, so there is no matching
    /// release call.
    pub fn scratch_acquire(&mut self, len: usize) -> BufRef {
        let mut pool = self.services.pools.lock().unwrap();
        self.tree.context_mut(self.ctx).scratch_acquire(&mut pool, len)
    }

    pub fn scratch(&self, buf: BufRef) -> &[f32] {
        self.tree.context(self.ctx).scratch(buf)
    }

    pub fn scratch_mut(&mut self, buf: BufRef) -> &mut [f32] {
        self.tree.context_mut(self.ctx).scratch_mut(buf)
    }

    /// Schedule parallel work. The handle is also recorded on the context so
    /// an early close joins it before the arena is released.
    pub fn spawn_task(&mut self, deps: Vec<TaskHandle>, work: TaskWork) -> TaskHandle {
        let handle = self.services.tasks.schedule(deps, work);
        self.tree.context_mut(self.ctx).add_task(handle.clone());
        handle
    }

    /// Create a derived sibling context on this tree.
    pub fn derive(&mut self, overrides: ContextOverrides) -> ContextId {
        let parent = self.tree.context(self.ctx);
        let seed = overrides.seed.unwrap_or(parent.seed);
        let origin = overrides.origin.unwrap_or(parent.origin);
        let resolution = overrides.resolution.unwrap_or(parent.resolution);

        let plan = {
            let mut plans = self.services.plans.lock().unwrap();
            plans.get_or_plan(self.tree.graph(), &self.services.registry, resolution)
        };
        let ctx = {
            let mut pool = self.services.pools.lock().unwrap();
            ExecutionContext::new(&mut pool, plan, seed, origin, Some(self.ctx))
        };
        self.tree.add_context(ctx, &self.services.hooks)
    }

    /// Poll another node (possibly in another context of this tree) from
    /// inside an async operation. Shares the current walk's depth budget.
    pub fn poll_dependency(&mut self, ctx_id: ContextId, node_id: Uuid) -> Result<bool, EngineError> {
        poll_node(self.services, self.tree, ctx_id, node_id, &mut *self.walk)
    }

    /// Context-independent lookup table, shared across all trees and safe
    /// under concurrent context processing.
    pub fn shared_table(
        &self,
        key: (Uuid, u64),
        build: impl FnOnce() -> Vec<f32>,
    ) -> std::sync::Arc<Vec<f32>> {
        self.services.shared.get_or_insert_with(key, build)
    }
}
